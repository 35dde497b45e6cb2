//! The coordinator: drives allocation, charge scheduling, or both from one
//! immutable snapshot of a site.
//!
//! A run is a pure synchronous computation. In integrated mode the two
//! problems couple through a single weighted-sum model: a route's energy
//! checkpoint binds only when a sequence covering it is selected. When the
//! solver is unavailable the coordinator allocates greedily and then
//! schedules greedily over the chosen routes.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Instant;

use anyhow::Error;
use chrono::{DateTime, Duration, Utc};
use good_lp::solvers::clarabel::clarabel;
use good_lp::{constraint, variable, variables, Expression, Solution, SolverModel, Variable};
use serde::Serialize;

use crate::allocation::{
    greedy_allocation, selected_result, selection_order, scan, solve_allocation,
    AllocationResult, AllocationSettings, ScoredSequence, SolverStage,
};
use crate::charging::{greedy_charge, solve_charge, ChargePlan, ChargeProblem};
use crate::config::{SiteConfig, Validate};
use crate::constraints::{ConstraintSet, EvalContext};
use crate::domain::{Route, RouteId, RouteLeg, SiteId, Vehicle, VehicleId};
use crate::error::PlanError;
use crate::params::SiteParams;
use crate::prices::{PriceTable, SlotPrice};
use crate::sequence::enumerate_sequences;
use crate::source::SiteData;
use crate::window::{build_window, WindowPlan, MAX_WINDOW_HOURS, MIN_WINDOW_HOURS};

#[derive(Serialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlanMode {
    AllocationOnly,
    SchedulingOnly,
    Integrated,
}

impl FromStr for PlanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocation_only" => Ok(PlanMode::AllocationOnly),
            "scheduling_only" => Ok(PlanMode::SchedulingOnly),
            "integrated" => Ok(PlanMode::Integrated),
            other => Err(format!(
                "unknown mode {:?}; expected allocation_only, scheduling_only or integrated",
                other
            )),
        }
    }
}

#[derive(Serialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum SolverStatus {
    Optimal,
    Fallback,
}

/// α and β of the weighted-sum objective.
#[derive(Copy, Clone, Debug)]
pub struct PlanWeights {
    pub allocation: f64,
    pub scheduling: f64,
}

impl Default for PlanWeights {
    fn default() -> Self {
        Self {
            allocation: 1.0,
            scheduling: 1.0,
        }
    }
}

/// Caller-supplied overrides on top of the decoded site configuration.
#[derive(Clone, Debug, Default)]
pub struct PlanOverrides {
    pub window_hours: Option<i64>,
    pub target_soc_percent: Option<f64>,
    pub site_capacity_kw: Option<f64>,
    pub allocation_time_limit_seconds: Option<f64>,
    pub scheduling_time_limit_seconds: Option<f64>,
    pub integrated_time_limit_seconds: Option<f64>,
}

#[derive(Serialize, Debug)]
pub struct UnifiedResult {
    pub mode: PlanMode,
    pub objective_value: f64,
    pub allocation: Option<AllocationResult>,
    pub charge_plan: Option<ChargePlan>,
    pub solver_status: SolverStatus,
    pub solve_time_seconds: f64,
}

impl UnifiedResult {
    /// True when allocation was asked for and nothing could be produced,
    /// even by the fallback.
    pub fn failed_outright(&self) -> bool {
        self.allocation
            .as_ref()
            .map(|a| {
                a.status == crate::allocation::AllocationStatus::Failed && a.rows.is_empty()
            })
            .unwrap_or(false)
    }
}

#[tracing::instrument(skip(source, weights, overrides))]
pub fn run_plan<D: SiteData>(
    source: &D,
    site: SiteId,
    now: DateTime<Utc>,
    mode: PlanMode,
    weights: PlanWeights,
    overrides: &PlanOverrides,
) -> Result<UnifiedResult, Error> {
    let started = Instant::now();

    let raw = source.site_parameters(site)?;
    let params = SiteParams::decode(&raw);
    let mut cfg = SiteConfig::from_params(&params);
    if let Some(hours) = overrides.window_hours {
        cfg.allocation_window_hours = hours;
    }
    if let Some(target) = overrides.target_soc_percent {
        cfg.target_soc_percent = target;
    }
    if let Some(capacity) = overrides.site_capacity_kw {
        cfg.site_capacity_kw = capacity;
    }
    if let Some(limit) = overrides.allocation_time_limit_seconds {
        cfg.allocation_time_limit_seconds = limit;
    }
    if let Some(limit) = overrides.scheduling_time_limit_seconds {
        cfg.scheduling_time_limit_seconds = limit;
    }
    if let Some(limit) = overrides.integrated_time_limit_seconds {
        cfg.integrated_time_limit_seconds = limit;
    }
    let cfg = cfg
        .validate()
        .map_err(|e| PlanError::Config(e.to_string()))?;
    let constraints = ConstraintSet::from_params(&params);

    let hours = cfg
        .allocation_window_hours
        .clamp(MIN_WINDOW_HOURS, MAX_WINDOW_HOURS);
    let window_end = now + Duration::hours(hours);

    let vehicles = source.list_vehicles(site)?;
    let states = source.latest_vehicle_states(site)?;
    let routes = source.list_routes_in_window(site, now, window_end)?;
    let committed = source.list_committed_allocations(site, now, window_end)?;
    let plan = build_window(
        site,
        now,
        &cfg,
        constraints.turnaround(&cfg),
        &vehicles,
        &states,
        &routes,
        &committed,
    );
    let vehicles_by_id: BTreeMap<VehicleId, Vehicle> =
        vehicles.iter().map(|v| (v.id, v.clone())).collect();

    let price_table = PriceTable::new(source.prices_and_forecast(now, window_end)?);
    let slot_prices = price_table.for_grid(&plan.window.grid);
    if slot_prices.is_some() {
        gauge_price_quantiles(&price_table, &plan);
    }

    let scored = if mode == PlanMode::SchedulingOnly {
        Vec::new()
    } else {
        score_sequences(source, &plan, &vehicles_by_id, &constraints, &cfg, now)?
    };

    let settings = AllocationSettings {
        time_limit_seconds: match mode {
            PlanMode::Integrated => cfg.integrated_time_limit_seconds,
            _ => cfg.allocation_time_limit_seconds,
        },
        score_threshold: cfg.allocation_score_threshold,
        max_selected: plan
            .availability
            .len()
            .saturating_sub(cfg.reserve_vehicle_count),
    };

    let result = match mode {
        PlanMode::AllocationOnly => {
            let allocation = solve_allocation(&scored, &plan, &settings)?;
            let solver_status = if allocation.fallback {
                SolverStatus::Fallback
            } else {
                SolverStatus::Optimal
            };
            UnifiedResult {
                mode,
                objective_value: weights.allocation * allocation.total_score,
                allocation: Some(allocation),
                charge_plan: None,
                solver_status,
                solve_time_seconds: started.elapsed().as_secs_f64(),
            }
        }
        PlanMode::SchedulingOnly => {
            let slot_prices = slot_prices
                .ok_or_else(|| PlanError::Data("no price data covers the window".to_string()))?;
            let assigned = assigned_legs(&plan, &vehicles_by_id, None);
            let problem =
                ChargeProblem::build(&plan, &vehicles_by_id, &assigned, slot_prices, &cfg);
            let charge_plan = solve_charge(&problem, cfg.scheduling_time_limit_seconds);
            let solver_status = if charge_plan.fallback {
                SolverStatus::Fallback
            } else {
                SolverStatus::Optimal
            };
            UnifiedResult {
                mode,
                objective_value: -weights.scheduling * steered_cost(&charge_plan, &cfg),
                allocation: None,
                charge_plan: Some(charge_plan),
                solver_status,
                solve_time_seconds: started.elapsed().as_secs_f64(),
            }
        }
        PlanMode::Integrated => {
            let slot_prices = slot_prices
                .ok_or_else(|| PlanError::Data("no price data covers the window".to_string()))?;
            let (allocation, charge_plan, solver_status) = match integrated_select(
                &scored,
                &plan,
                &vehicles_by_id,
                &slot_prices,
                &cfg,
                weights,
                settings.max_selected,
            ) {
                SolverStage::Solved(selected) => {
                    let allocation =
                        selected_result(&scored, &selected, &plan, &settings, false, Vec::new())?;
                    let assigned = assigned_legs(&plan, &vehicles_by_id, Some(&allocation));
                    let problem = ChargeProblem::build(
                        &plan,
                        &vehicles_by_id,
                        &assigned,
                        slot_prices,
                        &cfg,
                    );
                    let charge_plan = solve_charge(&problem, cfg.integrated_time_limit_seconds);
                    let status = if charge_plan.fallback {
                        SolverStatus::Fallback
                    } else {
                        SolverStatus::Optimal
                    };
                    (allocation, charge_plan, status)
                }
                SolverStage::Timeout => {
                    integrated_fallback(&scored, &plan, &vehicles_by_id, &slot_prices, &cfg, &settings, "integrated solver timed out".to_string())?
                }
                SolverStage::Unavailable(reason) => {
                    tracing::warn!(reason = reason.as_str(), "integrated solver unavailable");
                    integrated_fallback(&scored, &plan, &vehicles_by_id, &slot_prices, &cfg, &settings, format!("integrated solver unavailable ({})", reason))?
                }
            };
            let objective_value = weights.allocation * allocation.total_score
                - weights.scheduling * steered_cost(&charge_plan, &cfg);
            UnifiedResult {
                mode,
                objective_value,
                allocation: Some(allocation),
                charge_plan: Some(charge_plan),
                solver_status,
                solve_time_seconds: started.elapsed().as_secs_f64(),
            }
        }
    };

    tracing::info!(
        ?mode,
        objective_value = result.objective_value,
        solver_status = ?result.solver_status,
        solve_time_seconds = result.solve_time_seconds,
        "plan run finished"
    );

    Ok(result)
}

/// Scheduling cost the unified objective charges for: steering cost plus
/// the penalized target-SOC shortfall.
fn steered_cost(plan: &ChargePlan, cfg: &SiteConfig) -> f64 {
    plan.objective_cost + cfg.target_soc_shortfall_penalty * plan.total_shortfall_kwh()
}

fn gauge_price_quantiles(table: &PriceTable, plan: &WindowPlan) {
    let prices = table.histogram_over(plan.window.start..plan.window.end);
    let quantile = |q: f64| prices.value_at_quantile(q) as f64 / 1000.;
    metrics::gauge!("price_min", quantile(0.00));
    metrics::gauge!("price_q10", quantile(0.10));
    metrics::gauge!("price_q50", quantile(0.50));
    metrics::gauge!("price_q90", quantile(0.90));
    metrics::gauge!("price_max", quantile(1.00));
}

fn score_sequences<D: SiteData>(
    source: &D,
    plan: &WindowPlan,
    vehicles: &BTreeMap<VehicleId, Vehicle>,
    constraints: &ConstraintSet,
    cfg: &SiteConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ScoredSequence>, Error> {
    let candidates = enumerate_sequences(plan, vehicles, &constraints.enumeration_limits(cfg));

    let mut previous: BTreeMap<RouteId, VehicleId> = BTreeMap::new();
    if let Some(lookback) = constraints.swap_lookback() {
        let since = now - lookback;
        for route in &plan.eligible {
            if let Some(vehicle_id) = source.previous_allocation(route.id, since)? {
                previous.insert(route.id, vehicle_id);
            }
        }
    }

    let ctx = EvalContext { now, previous: &previous };
    let mut scored = Vec::new();
    for candidate in candidates {
        let routes: Option<Vec<&Route>> =
            candidate.route_ids().map(|id| plan.route(id)).collect();
        let (routes, vehicle, avail) = match (
            routes,
            vehicles.get(&candidate.vehicle_id),
            plan.availability.get(&candidate.vehicle_id),
        ) {
            (Some(routes), Some(vehicle), Some(avail)) => (routes, vehicle, avail),
            _ => continue,
        };
        let eval = constraints.evaluate(&ctx, vehicle, avail, &routes);
        if eval.feasible {
            scored.push(ScoredSequence {
                candidate,
                cost: eval.score,
                tags: eval.tags,
            });
        }
    }
    tracing::debug!(feasible = scored.len(), "sequences scored");
    Ok(scored)
}

/// Committed legs per vehicle, with newly planned rows appended when an
/// allocation is supplied.
fn assigned_legs(
    plan: &WindowPlan,
    vehicles: &BTreeMap<VehicleId, Vehicle>,
    allocation: Option<&AllocationResult>,
) -> BTreeMap<VehicleId, Vec<RouteLeg>> {
    let mut assigned: BTreeMap<VehicleId, Vec<RouteLeg>> = BTreeMap::new();
    for (vehicle_id, avail) in &plan.availability {
        if !avail.committed.is_empty() {
            assigned.insert(*vehicle_id, avail.committed.clone());
        }
    }
    if let Some(allocation) = allocation {
        for row in &allocation.rows {
            let (route, vehicle) = match (plan.route(row.route_id), vehicles.get(&row.vehicle_id)) {
                (Some(route), Some(vehicle)) => (route, vehicle),
                _ => continue,
            };
            assigned.entry(row.vehicle_id).or_default().push(RouteLeg {
                route_id: route.id,
                start: route.plan_start,
                end: route.plan_end,
                energy_kwh: route.energy_required_kwh(vehicle),
            });
        }
    }
    assigned
}

fn integrated_fallback(
    scored: &[ScoredSequence],
    plan: &WindowPlan,
    vehicles: &BTreeMap<VehicleId, Vehicle>,
    slot_prices: &[SlotPrice],
    cfg: &SiteConfig,
    settings: &AllocationSettings,
    reason: String,
) -> Result<(AllocationResult, ChargePlan, SolverStatus), Error> {
    let allocation = greedy_allocation(scored, plan, settings, vec![format!("{}; greedy fallback", reason)])?;
    let assigned = assigned_legs(plan, vehicles, Some(&allocation));
    let problem = ChargeProblem::build(plan, vehicles, &assigned, slot_prices.to_vec(), cfg);
    let charge_plan = greedy_charge(&problem);
    Ok((allocation, charge_plan, SolverStatus::Fallback))
}

/// One weighted-sum model over both stages. Route energy checkpoints from
/// candidate sequences bind only in proportion to their selection
/// variable; with at most one sequence per vehicle the gating is exact.
/// Only the selection is taken from this model; the emitted schedule is
/// re-solved against the chosen routes.
#[allow(clippy::too_many_arguments)]
fn integrated_select(
    scored: &[ScoredSequence],
    plan: &WindowPlan,
    vehicles: &BTreeMap<VehicleId, Vehicle>,
    slot_prices: &[SlotPrice],
    cfg: &SiteConfig,
    weights: PlanWeights,
    max_selected: usize,
) -> SolverStage<Vec<usize>> {
    use crate::allocation::COVERAGE_WEIGHT;

    if scored.is_empty() || max_selected == 0 {
        return SolverStage::Solved(Vec::new());
    }

    let grid = &plan.window.grid;
    let horizon = grid.len();
    let slot_hours = grid.slot_hours();
    let steering = |t: usize| {
        let synthetic =
            cfg.synthetic_time_price_factor * (horizon as f64 - t as f64) / horizon as f64;
        let triad = if slot_prices[t].triad_flag {
            cfg.triad_penalty_factor
        } else {
            0.0
        };
        slot_prices[t].energy_price + synthetic + triad
    };

    let mut vars = variables!();
    let x: Vec<Variable> = scored
        .iter()
        .map(|_| vars.add(variable().min(0.0).max(1.0)))
        .collect();

    let mut covering: BTreeMap<RouteId, Vec<usize>> = BTreeMap::new();
    for (i, seq) in scored.iter().enumerate() {
        for route_id in seq.candidate.route_ids() {
            covering.entry(route_id).or_default().push(i);
        }
    }
    let y: BTreeMap<RouteId, Variable> = covering
        .keys()
        .map(|route_id| (*route_id, vars.add(variable().min(0.0).max(1.0))))
        .collect();

    // charge variables per available vehicle, gated to committed busy slots
    struct VehicleVars {
        power: Vec<Option<Variable>>,
        shortfall: Variable,
        initial_soc_kwh: f64,
        target_soc_kwh: f64,
        headroom_kwh: f64,
        committed_energy_kwh: f64,
    }
    let mut charge: BTreeMap<VehicleId, VehicleVars> = BTreeMap::new();
    for (vehicle_id, avail) in &plan.availability {
        let vehicle = match vehicles.get(vehicle_id) {
            Some(v) => v,
            None => continue,
        };
        let power = (0..horizon)
            .map(|t| {
                let slot = grid.slot_range(t);
                let free = slot.start >= avail.at_depot_from
                    && !avail
                        .committed
                        .iter()
                        .any(|l| l.start < slot.end && slot.start < l.end);
                free.then(|| vars.add(variable().min(0.0).max(vehicle.ac_charge_rate_kw)))
            })
            .collect();
        let target_soc_kwh = vehicle.soc_energy_kwh(cfg.target_soc_percent);
        let max_shortfall = (target_soc_kwh - avail.initial_soc_kwh).max(0.0);
        charge.insert(
            *vehicle_id,
            VehicleVars {
                power,
                shortfall: vars.add(variable().min(0.0).max(max_shortfall)),
                initial_soc_kwh: avail.initial_soc_kwh,
                target_soc_kwh,
                headroom_kwh: (vehicle.battery_capacity_kwh - avail.initial_soc_kwh).max(0.0),
                committed_energy_kwh: avail.committed.iter().map(|l| l.energy_kwh).sum(),
            },
        );
    }

    let mut objective = Expression::from(0.0);
    for y_var in y.values() {
        objective += weights.allocation * COVERAGE_WEIGHT * *y_var;
    }
    for (i, seq) in scored.iter().enumerate() {
        objective += weights.allocation * seq.cost * x[i];
    }
    for vv in charge.values() {
        for (t, var) in vv.power.iter().enumerate() {
            if let Some(var) = var {
                objective -= weights.scheduling * steering(t) * slot_hours * *var;
            }
        }
        objective -= weights.scheduling * cfg.target_soc_shortfall_penalty * vv.shortfall;
    }

    let mut model = vars.maximise(objective).using(clarabel);

    let mut by_vehicle: BTreeMap<VehicleId, Vec<usize>> = BTreeMap::new();
    for (i, seq) in scored.iter().enumerate() {
        by_vehicle.entry(seq.candidate.vehicle_id).or_default().push(i);
    }
    for indices in by_vehicle.values() {
        let used = indices
            .iter()
            .map(|i| Expression::from(x[*i]))
            .sum::<Expression>();
        model = model.with(constraint!(used <= 1.0));
    }
    for (route_id, indices) in &covering {
        let chosen = indices
            .iter()
            .map(|i| Expression::from(x[*i]))
            .sum::<Expression>();
        model = model.with(constraint!(chosen.clone() <= 1.0));
        let y_var = y[route_id];
        model = model.with(constraint!(y_var <= chosen.clone()));
        model = model.with(constraint!(chosen <= indices.len() as f64 * y_var));
    }
    let total = x.iter().map(|v| Expression::from(*v)).sum::<Expression>();
    model = model.with(constraint!(total <= max_selected as f64));

    for (vehicle_id, vv) in &charge {
        let mut cumulative = Expression::from(0.0);
        let mut at_slot: Vec<Expression> = Vec::with_capacity(horizon);
        for t in 0..horizon {
            if let Some(var) = vv.power[t] {
                cumulative += slot_hours * var;
            }
            at_slot.push(cumulative.clone());
        }

        // committed departures bind unconditionally
        let avail = &plan.availability[vehicle_id];
        let mut consumed = 0.0;
        for leg in &avail.committed {
            consumed += leg.energy_kwh;
            let required = (consumed - vv.initial_soc_kwh).max(0.0);
            if required <= 0.0 {
                continue;
            }
            match grid.slot_of(leg.start) {
                Some(0) | None => continue,
                Some(slot) => {
                    model = model.with(constraint!(at_slot[slot - 1].clone() >= required));
                }
            }
        }

        // planned departures bind in proportion to their sequence variable
        if let Some(indices) = by_vehicle.get(vehicle_id) {
            for i in indices {
                let seq = &scored[*i];
                let vehicle = &vehicles[vehicle_id];
                let mut running = vv.committed_energy_kwh;
                for leg in &seq.candidate.legs {
                    let route = match plan.route(leg.route_id) {
                        Some(route) => route,
                        None => continue,
                    };
                    running += route.energy_required_kwh(vehicle);
                    let required = (running - vv.initial_soc_kwh).max(0.0);
                    if required <= 0.0 {
                        continue;
                    }
                    match grid.slot_of(route.plan_start) {
                        Some(0) | None => {
                            model = model.with(constraint!(x[*i] <= 0.0));
                        }
                        Some(slot) => {
                            model = model.with(constraint!(
                                at_slot[slot - 1].clone() >= required * x[*i]
                            ));
                        }
                    }
                }
            }
        }

        model = model.with(constraint!(at_slot[horizon - 1].clone() <= vv.headroom_kwh));
        model = model.with(constraint!(
            vv.shortfall
                >= vv.target_soc_kwh - vv.initial_soc_kwh - at_slot[horizon - 1].clone()
        ));
    }

    for t in 0..horizon {
        let draw = charge
            .values()
            .filter_map(|vv| vv.power[t])
            .map(Expression::from)
            .sum::<Expression>();
        let headroom = (cfg.site_capacity_kw - slot_prices[t].load_forecast_kw).max(0.0);
        model = model.with(constraint!(draw <= headroom));
    }

    let solution = match model.solve() {
        Ok(solution) => solution,
        Err(e) => return SolverStage::Unavailable(format!("{:?}", e)),
    };

    let mut order: Vec<usize> = (0..scored.len()).collect();
    order.sort_by(|a, b| {
        solution
            .value(x[*b])
            .partial_cmp(&solution.value(x[*a]))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| selection_order(&scored[*a], &scored[*b]))
    });
    SolverStage::Solved(scan(scored, order, max_selected))
}
