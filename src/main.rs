use std::{fs::File, io::prelude::*, net::SocketAddr, path::PathBuf, process};

use anyhow::Error;
use chrono::{DateTime, Utc};
use serde::Serialize;
use structopt::StructOpt;

use fleet_charge_planner::{
    run_plan, PlanMode, PlanOverrides, PlanWeights, SiteSnapshot, UnifiedResult,
};

const EXIT_INVALID_ARGS: i32 = 1;
const EXIT_NO_RESULT: i32 = 2;
const EXIT_DEPENDENCY: i32 = 3;

#[derive(Debug, StructOpt)]
struct Opt {
    /// Command
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Allocate routes to vehicles for the rolling window.
    Allocation {
        #[structopt(flatten)]
        common: CommonOpts,
    },
    /// Schedule charging for vehicles with committed routes.
    Scheduling {
        #[structopt(flatten)]
        common: CommonOpts,
    },
    /// Run allocation and charge scheduling together.
    Unified {
        #[structopt(flatten)]
        common: CommonOpts,
        /// allocation_only, scheduling_only or integrated
        #[structopt(long, default_value = "integrated")]
        mode: String,
        /// Weight on the allocation objective (α)
        #[structopt(long, default_value = "1.0")]
        allocation_weight: f64,
        /// Weight on the scheduling objective (β)
        #[structopt(long, default_value = "1.0")]
        scheduling_weight: f64,
    },
    /// Write a starter site snapshot to work from.
    GenerateSnapshot {
        /// Output path for the snapshot JSON
        #[structopt(short, long, parse(from_os_str))]
        output: PathBuf,
    },
}

#[derive(Debug, StructOpt)]
struct CommonOpts {
    /// Site snapshot JSON path
    #[structopt(short, long, parse(from_os_str))]
    snapshot: PathBuf,
    /// Site to plan for
    #[structopt(long)]
    site_id: u32,
    /// Window start (RFC 3339); defaults to the current time
    #[structopt(long)]
    start_time: Option<DateTime<Utc>>,
    /// Override the rolling window length
    #[structopt(long)]
    window_hours: Option<i64>,
    /// Override the target state of charge
    #[structopt(long)]
    target_soc: Option<f64>,
    /// Override the site capacity in kW
    #[structopt(long)]
    site_capacity: Option<f64>,
    #[structopt(long)]
    allocation_time_limit: Option<f64>,
    #[structopt(long)]
    scheduling_time_limit: Option<f64>,
    #[structopt(long)]
    integrated_time_limit: Option<f64>,
    /// Prefix for CSV exports of the results
    #[structopt(long)]
    csv_prefix: Option<String>,
    /// Prometheus endpoint address
    #[structopt(short, long)]
    prometheus_endpoint: Option<SocketAddr>,
}

impl CommonOpts {
    fn overrides(&self) -> PlanOverrides {
        PlanOverrides {
            window_hours: self.window_hours,
            target_soc_percent: self.target_soc,
            site_capacity_kw: self.site_capacity,
            allocation_time_limit_seconds: self.allocation_time_limit,
            scheduling_time_limit_seconds: self.scheduling_time_limit,
            integrated_time_limit_seconds: self.integrated_time_limit,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let opt = Opt::from_args();
    let code = match opt.cmd {
        Command::Allocation { common } => {
            run(common, PlanMode::AllocationOnly, PlanWeights::default())
        }
        Command::Scheduling { common } => {
            run(common, PlanMode::SchedulingOnly, PlanWeights::default())
        }
        Command::Unified {
            common,
            mode,
            allocation_weight,
            scheduling_weight,
        } => match mode.parse::<PlanMode>() {
            Ok(mode) => run(
                common,
                mode,
                PlanWeights {
                    allocation: allocation_weight,
                    scheduling: scheduling_weight,
                },
            ),
            Err(reason) => {
                eprintln!("{}", reason);
                EXIT_INVALID_ARGS
            }
        },
        Command::GenerateSnapshot { output } => match generate_snapshot(&output) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{:#}", e);
                EXIT_DEPENDENCY
            }
        },
    };
    process::exit(code);
}

fn run(common: CommonOpts, mode: PlanMode, weights: PlanWeights) -> i32 {
    if let Some(addr) = common.prometheus_endpoint {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .listen_address(addr)
            .install()
            .unwrap();
    }

    let snapshot = match SiteSnapshot::load(&common.snapshot) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("{:#}", e);
            return EXIT_DEPENDENCY;
        }
    };
    let now = common.start_time.unwrap_or_else(Utc::now);

    let result = match run_plan(&snapshot, common.site_id, now, mode, weights, &common.overrides()) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{:#}", e);
            return EXIT_DEPENDENCY;
        }
    };

    println!("{}", serde_json::to_string_pretty(&result).unwrap());

    if let Some(prefix) = &common.csv_prefix {
        if let Err(e) = write_csv(prefix, &result, now) {
            eprintln!("{:#}", e);
            return EXIT_DEPENDENCY;
        }
    }

    if result.failed_outright() {
        EXIT_NO_RESULT
    } else {
        0
    }
}

fn generate_snapshot(output: &PathBuf) -> Result<(), Error> {
    let snapshot_json = serde_json::to_string_pretty(&SiteSnapshot::demo(Utc::now()))?;
    File::create(output)?.write_all(snapshot_json.as_bytes())?;
    Ok(())
}

#[derive(Serialize)]
struct ChargeCsvRow {
    vehicle_id: u32,
    slot_index: usize,
    slot_start: DateTime<Utc>,
    power_kw: f64,
    cumulative_kwh: f64,
}

fn write_csv(prefix: &str, result: &UnifiedResult, now: DateTime<Utc>) -> Result<(), Error> {
    if let Some(allocation) = &result.allocation {
        let path = format!("{}_allocation.csv", prefix);
        tracing::info!(path = path.as_str(), "writing allocation rows");
        let mut writer = csv::Writer::from_path(&path)?;
        for row in &allocation.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }

    if let Some(plan) = &result.charge_plan {
        let path = format!("{}_charge_plan.csv", prefix);
        tracing::info!(path = path.as_str(), "writing charge plan");
        let mut writer = csv::Writer::from_path(&path)?;
        for schedule in &plan.schedules {
            for slot in schedule.slots() {
                writer.serialize(ChargeCsvRow {
                    vehicle_id: schedule.vehicle_id,
                    slot_index: slot.slot_index,
                    slot_start: now
                        + chrono::Duration::minutes(
                            fleet_charge_planner::slots::SLOT_MINUTES * slot.slot_index as i64,
                        ),
                    power_kw: slot.power_kw,
                    cumulative_kwh: schedule.cumulative_kwh[slot.slot_index],
                })?;
            }
        }
        writer.flush()?;
    }

    Ok(())
}
