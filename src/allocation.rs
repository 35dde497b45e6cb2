//! Set-covering allocation over enumerated sequences.
//!
//! The primary path builds a linear relaxation of the covering model and
//! solves it with Clarabel, then rounds deterministically. For an exact
//! MILP swap in the HiGHS backend of `good_lp`. Any solver failure
//! degrades to the greedy fallback, which is feasible but not optimal.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use good_lp::solvers::clarabel::clarabel;
use good_lp::{constraint, variable, variables, Expression, Solution, SolverModel, Variable};
use serde::Serialize;

use crate::domain::{RouteId, VehicleId};
use crate::error::{PlanError, PlanResult};
use crate::sequence::SequenceCandidate;
use crate::window::WindowPlan;

/// Covering one route outweighs any plausible sequence-cost spread.
pub const COVERAGE_WEIGHT: f64 = 100.0;

/// Outcome of one solver invocation.
#[derive(Debug)]
pub enum SolverStage<T> {
    Solved(T),
    Timeout,
    Unavailable(String),
}

/// A feasible sequence with its constraint-engine cost.
#[derive(Clone, Debug)]
pub struct ScoredSequence {
    pub candidate: SequenceCandidate,
    pub cost: f64,
    pub tags: Vec<String>,
}

#[derive(Serialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocationStatus {
    Allocated,
    Failed,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct AllocationRow {
    pub route_id: RouteId,
    pub vehicle_id: VehicleId,
    pub estimated_arrival: DateTime<Utc>,
    pub estimated_arrival_soc: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct AllocationResult {
    pub allocation_id: i64,
    pub total_score: f64,
    pub rows: Vec<AllocationRow>,
    pub routes_in_window: usize,
    pub routes_allocated: usize,
    pub routes_overlapping_count: usize,
    pub status: AllocationStatus,
    pub fallback: bool,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AllocationSettings {
    pub time_limit_seconds: f64,
    pub score_threshold: f64,
    /// Sequences selectable at once; holds back the reserve vehicles.
    pub max_selected: usize,
}

pub fn solve_allocation(
    scored: &[ScoredSequence],
    plan: &WindowPlan,
    settings: &AllocationSettings,
) -> PlanResult<AllocationResult> {
    let started = Instant::now();
    let mut tags: Vec<String> = plan.tags.clone();

    if scored.is_empty() {
        tags.push("no feasible sequences".to_string());
        return assemble(scored, &[], plan, settings, false, tags);
    }

    let (selected, fallback) = match lp_select(scored, settings) {
        SolverStage::Solved(selected) => {
            if started.elapsed().as_secs_f64() > settings.time_limit_seconds {
                tags.push("allocation solve exceeded time limit; best solution taken".to_string());
            }
            (selected, false)
        }
        SolverStage::Timeout => {
            tags.push("allocation solver timed out; greedy fallback".to_string());
            (greedy_select(scored, settings.max_selected), true)
        }
        SolverStage::Unavailable(reason) => {
            tracing::warn!(reason = reason.as_str(), "allocation solver unavailable");
            tags.push(format!("allocation solver unavailable ({}); greedy fallback", reason));
            (greedy_select(scored, settings.max_selected), true)
        }
    };

    assemble(scored, &selected, plan, settings, fallback, tags)
}

/// Linear relaxation of the covering model, rounded by descending
/// activation with the deterministic selection order breaking ties.
fn lp_select(scored: &[ScoredSequence], settings: &AllocationSettings) -> SolverStage<Vec<usize>> {
    if settings.max_selected == 0 {
        return SolverStage::Solved(Vec::new());
    }

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

    let mut objective = Expression::from(0.0);
    for y_var in y.values() {
        objective += COVERAGE_WEIGHT * *y_var;
    }
    for (i, seq) in scored.iter().enumerate() {
        objective += seq.cost * x[i];
    }

    let mut model = vars.maximise(objective).using(clarabel);

    let mut by_vehicle: BTreeMap<VehicleId, Vec<usize>> = BTreeMap::new();
    for (i, seq) in scored.iter().enumerate() {
        by_vehicle.entry(seq.candidate.vehicle_id).or_default().push(i);
    }
    for indices in by_vehicle.values() {
        let used = indices.iter().map(|i| Expression::from(x[*i])).sum::<Expression>();
        model = model.with(constraint!(used <= 1.0));
    }

    for (route_id, indices) in &covering {
        let chosen = indices.iter().map(|i| Expression::from(x[*i])).sum::<Expression>();
        model = model.with(constraint!(chosen.clone() <= 1.0));
        let y_var = y[route_id];
        model = model.with(constraint!(y_var <= chosen.clone()));
        model = model.with(constraint!(chosen <= indices.len() as f64 * y_var));
    }

    // one sequence per vehicle, so selected sequences = vehicles in use
    let total = x.iter().map(|v| Expression::from(*v)).sum::<Expression>();
    model = model.with(constraint!(total <= settings.max_selected as f64));

    let solution = match model.solve() {
        Ok(solution) => solution,
        Err(e) => return SolverStage::Unavailable(format!("{:?}", e)),
    };

    let mut order: Vec<usize> = (0..scored.len()).collect();
    order.sort_by(|a, b| {
        let activation = solution
            .value(x[*b])
            .partial_cmp(&solution.value(x[*a]))
            .unwrap_or(std::cmp::Ordering::Equal);
        activation.then_with(|| selection_order(&scored[*a], &scored[*b]))
    });

    SolverStage::Solved(scan(scored, order, settings.max_selected))
}

/// Greedy end-to-end allocation, used when no solver stage is available.
pub fn greedy_allocation(
    scored: &[ScoredSequence],
    plan: &WindowPlan,
    settings: &AllocationSettings,
    mut extra_tags: Vec<String>,
) -> PlanResult<AllocationResult> {
    let selected = greedy_select(scored, settings.max_selected);
    let mut tags = plan.tags.clone();
    tags.append(&mut extra_tags);
    assemble(scored, &selected, plan, settings, true, tags)
}

/// Builds the result record for an externally chosen selection, e.g. the
/// integrated model's.
pub fn selected_result(
    scored: &[ScoredSequence],
    selected: &[usize],
    plan: &WindowPlan,
    settings: &AllocationSettings,
    fallback: bool,
    mut extra_tags: Vec<String>,
) -> PlanResult<AllocationResult> {
    let mut tags = plan.tags.clone();
    tags.append(&mut extra_tags);
    assemble(scored, selected, plan, settings, fallback, tags)
}

/// Cost-descending scan; feasible but with no optimality guarantee.
pub fn greedy_select(scored: &[ScoredSequence], max_selected: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scored.len()).collect();
    order.sort_by(|a, b| selection_order(&scored[*a], &scored[*b]));
    scan(scored, order, max_selected)
}

/// Equal cost prefers longer sequences, then the lower vehicle id, then
/// the route ids themselves, so runs are reproducible.
pub(crate) fn selection_order(a: &ScoredSequence, b: &ScoredSequence) -> std::cmp::Ordering {
    b.cost
        .partial_cmp(&a.cost)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.candidate.len().cmp(&a.candidate.len()))
        .then_with(|| a.candidate.vehicle_id.cmp(&b.candidate.vehicle_id))
        .then_with(|| {
            a.candidate
                .route_ids()
                .collect::<Vec<_>>()
                .cmp(&b.candidate.route_ids().collect::<Vec<_>>())
        })
}

pub(crate) fn scan(scored: &[ScoredSequence], order: Vec<usize>, max_selected: usize) -> Vec<usize> {
    let mut used_vehicles = BTreeSet::new();
    let mut covered_routes = BTreeSet::new();
    let mut selected = Vec::new();
    for i in order {
        if selected.len() == max_selected {
            break;
        }
        let seq = &scored[i];
        if used_vehicles.contains(&seq.candidate.vehicle_id) {
            continue;
        }
        if seq.candidate.route_ids().any(|r| covered_routes.contains(&r)) {
            continue;
        }
        used_vehicles.insert(seq.candidate.vehicle_id);
        covered_routes.extend(seq.candidate.route_ids());
        selected.push(i);
    }
    selected.sort_unstable();
    selected
}

fn assemble(
    scored: &[ScoredSequence],
    selected: &[usize],
    plan: &WindowPlan,
    settings: &AllocationSettings,
    fallback: bool,
    mut tags: Vec<String>,
) -> PlanResult<AllocationResult> {
    let mut rows = Vec::new();
    let mut covered = BTreeSet::new();
    let mut total_score = 0.0;

    for i in selected {
        let seq = &scored[*i];
        let mut within = BTreeSet::new();
        for leg in &seq.candidate.legs {
            if !within.insert(leg.route_id) {
                return Err(PlanError::Fatal(format!(
                    "sequence for vehicle {} contains route {} twice",
                    seq.candidate.vehicle_id, leg.route_id
                )));
            }
            if !covered.insert(leg.route_id) {
                return Err(PlanError::Fatal(format!(
                    "route {} selected on two vehicles",
                    leg.route_id
                )));
            }
            rows.push(AllocationRow {
                route_id: leg.route_id,
                vehicle_id: seq.candidate.vehicle_id,
                estimated_arrival: leg.estimated_arrival,
                estimated_arrival_soc: leg.estimated_arrival_soc,
            });
        }
        total_score += seq.cost;
        tags.extend(seq.tags.iter().cloned());
    }
    total_score += COVERAGE_WEIGHT * covered.len() as f64;
    rows.sort_by_key(|r| (r.route_id, r.vehicle_id));

    let routes_in_window = plan.eligible.len();
    let routes_allocated = covered.len();
    let status = if routes_in_window > 0 && routes_allocated == 0 {
        tags.push("no routes could be allocated".to_string());
        AllocationStatus::Failed
    } else if total_score < settings.score_threshold {
        tags.push(format!(
            "score {} below threshold {}",
            total_score, settings.score_threshold
        ));
        AllocationStatus::Failed
    } else {
        AllocationStatus::Allocated
    };

    metrics::gauge!("allocation_score", total_score);
    metrics::gauge!("allocation_routes_in_window", routes_in_window as f64);
    metrics::gauge!("allocation_routes_allocated", routes_allocated as f64);

    tracing::info!(
        routes_in_window,
        routes_allocated,
        total_score,
        fallback,
        ?status,
        "allocation finished"
    );

    Ok(AllocationResult {
        allocation_id: plan.window.start.timestamp(),
        total_score,
        rows,
        routes_in_window,
        routes_allocated,
        routes_overlapping_count: plan.routes_overlapping_count(),
        status,
        fallback,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::constraints::{ConstraintSet, EvalContext};
    use crate::domain::{Route, RouteStatus, Vehicle, VehicleState, VehicleStatus};
    use crate::params::SiteParams;
    use crate::sequence::enumerate_sequences;
    use crate::window::build_window;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
    }

    fn vehicle(id: VehicleId, battery: f64, efficiency: f64) -> Vehicle {
        Vehicle {
            id,
            site: 1,
            active: true,
            out_of_service: false,
            enabled: true,
            battery_capacity_kwh: battery,
            efficiency_kwh_per_mile: efficiency,
            ac_charge_rate_kw: 22.0,
            dc_charge_rate_kw: 50.0,
            charger_id: None,
        }
    }

    fn route(id: RouteId, start_h: u32, duration_min: i64, mileage: f64) -> Route {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, start_h, 0, 0).unwrap();
        Route {
            id,
            site: 1,
            plan_start: start,
            plan_end: start + Duration::minutes(duration_min),
            mileage,
            n_orders: 10,
            status: RouteStatus::New,
            preassigned_vehicle: None,
        }
    }

    fn settings(max_selected: usize) -> AllocationSettings {
        AllocationSettings {
            time_limit_seconds: 30.0,
            score_threshold: -4.0,
            max_selected,
        }
    }

    fn score_all(vehicles: Vec<Vehicle>, routes: Vec<Route>) -> (Vec<ScoredSequence>, WindowPlan) {
        let states: Vec<VehicleState> = vehicles
            .iter()
            .map(|v| VehicleState {
                vehicle_id: v.id,
                status: VehicleStatus::AtDepot,
                estimated_soc_percent: 100.0,
                return_eta: None,
                return_soc_percent: None,
                current_route_id: None,
            })
            .collect();
        let params = SiteParams::decode(&BTreeMap::new());
        let set = ConstraintSet::from_params(&params);
        let cfg = SiteConfig::default();
        let plan = build_window(
            1,
            now(),
            &cfg,
            set.turnaround(&cfg),
            &vehicles,
            &states,
            &routes,
            &[],
        );
        let by_id: BTreeMap<VehicleId, Vehicle> =
            vehicles.into_iter().map(|v| (v.id, v)).collect();
        let candidates = enumerate_sequences(&plan, &by_id, &set.enumeration_limits(&cfg));
        let previous = BTreeMap::new();
        let ctx = EvalContext { now: now(), previous: &previous };
        let scored = candidates
            .into_iter()
            .filter_map(|candidate| {
                let routes: Vec<&Route> = candidate
                    .route_ids()
                    .map(|id| plan.route(id).unwrap())
                    .collect();
                let vehicle = &by_id[&candidate.vehicle_id];
                let avail = &plan.availability[&candidate.vehicle_id];
                let eval = set.evaluate(&ctx, vehicle, avail, &routes);
                eval.feasible.then(|| ScoredSequence {
                    candidate,
                    cost: eval.score,
                    tags: eval.tags,
                })
            })
            .collect();
        (scored, plan)
    }

    fn three_route_fleet() -> (Vec<ScoredSequence>, WindowPlan) {
        score_all(
            vec![vehicle(1, 200.0, 1.0), vehicle(2, 200.0, 1.0)],
            vec![
                route(1, 8, 60, 30.0),
                route(2, 12, 60, 30.0),
                route(3, 16, 60, 30.0),
            ],
        )
    }

    #[test]
    fn greedy_covers_all_three_routes() {
        let (scored, plan) = three_route_fleet();
        let selected = greedy_select(&scored, 2);
        let result = assemble(&scored, &selected, &plan, &settings(2), true, Vec::new()).unwrap();
        assert_eq!(result.routes_allocated, 3);
        assert_eq!(result.total_score, 300.0);
        assert_eq!(result.status, AllocationStatus::Allocated);
    }

    #[test]
    fn lp_covers_all_three_routes() {
        let (scored, plan) = three_route_fleet();
        let result = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        assert_eq!(result.routes_allocated, 3);
        assert!((result.total_score - 300.0).abs() < 1e-6);
        assert_eq!(result.status, AllocationStatus::Allocated);
        assert!(!result.fallback);
    }

    #[test]
    fn overlapping_route_moves_to_second_vehicle() {
        // route 2 departs while route 1 is still out, so one vehicle
        // cannot run both; full coverage needs the second vehicle
        let mut clash = route(2, 9, 60, 30.0);
        clash.plan_start = clash.plan_start - Duration::minutes(30);
        clash.plan_end = clash.plan_end - Duration::minutes(30);
        let (scored, plan) = score_all(
            vec![vehicle(1, 200.0, 1.0), vehicle(2, 200.0, 1.0)],
            vec![route(1, 8, 60, 30.0), clash, route(3, 16, 60, 30.0)],
        );
        let result = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        assert_eq!(result.routes_allocated, 3);
        let by_route: BTreeMap<RouteId, VehicleId> =
            result.rows.iter().map(|r| (r.route_id, r.vehicle_id)).collect();
        assert_ne!(by_route[&1], by_route[&2]);
        assert!(result.routes_overlapping_count >= 2);
    }

    #[test]
    fn infeasible_fleet_reports_failed() {
        let (scored, plan) = score_all(
            vec![vehicle(1, 100.0, 2.0)],
            vec![route(1, 8, 60, 60.0)], // needs 120 kWh
        );
        assert!(scored.is_empty());
        let result = solve_allocation(&scored, &plan, &settings(1)).unwrap();
        assert_eq!(result.routes_allocated, 0);
        assert_eq!(result.status, AllocationStatus::Failed);
    }

    #[test]
    fn vehicle_and_route_appear_at_most_once() {
        let (scored, plan) = three_route_fleet();
        let result = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        let mut routes_seen = BTreeSet::new();
        for row in &result.rows {
            assert!(routes_seen.insert(row.route_id));
        }
        let vehicles_seen: BTreeSet<VehicleId> =
            result.rows.iter().map(|r| r.vehicle_id).collect();
        assert!(vehicles_seen.len() <= 2);
    }

    #[test]
    fn reserve_limits_selected_vehicles() {
        let (scored, plan) = three_route_fleet();
        // only one vehicle may be used; a single sequence of three covers all
        let result = solve_allocation(&scored, &plan, &settings(1)).unwrap();
        let vehicles_seen: BTreeSet<VehicleId> =
            result.rows.iter().map(|r| r.vehicle_id).collect();
        assert_eq!(vehicles_seen.len(), 1);
        assert_eq!(result.routes_allocated, 3);
    }

    #[test]
    fn deterministic_across_runs() {
        let (scored, plan) = three_route_fleet();
        let a = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        let b = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.total_score, b.total_score);
    }

    #[test]
    fn quality_gate_marks_low_scores_failed() {
        let (mut scored, plan) = three_route_fleet();
        for seq in &mut scored {
            seq.cost = -350.0;
        }
        let result = solve_allocation(&scored, &plan, &settings(2)).unwrap();
        // routes still allocated and persisted, but the run is marked failed
        assert!(result.routes_allocated > 0);
        assert_eq!(result.status, AllocationStatus::Failed);
        assert!(result.tags.iter().any(|t| t.contains("below threshold")));
    }
}
