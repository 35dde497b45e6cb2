use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::SiteConfig;
use crate::domain::{Route, RouteId, RouteLeg, RouteStatus, SiteId, Vehicle, VehicleId, VehicleState, VehicleStatus};
use crate::slots::{DurationExt, SlotGrid};

pub const MIN_WINDOW_HOURS: i64 = 4;
pub const MAX_WINDOW_HOURS: i64 = 24;

#[derive(Clone, Debug)]
pub struct PlanningWindow {
    pub site: SiteId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub grid: SlotGrid,
}

impl PlanningWindow {
    pub fn new(site: SiteId, now: DateTime<Utc>, horizon_hours: i64) -> Self {
        let hours = horizon_hours.clamp(MIN_WINDOW_HOURS, MAX_WINDOW_HOURS);
        let grid = SlotGrid::new(now, hours);
        Self {
            site,
            start: now,
            end: grid.end(),
            grid,
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time < self.end
    }
}

/// When a vehicle becomes free inside the window and with how much energy,
/// after deducting its committed routes.
#[derive(Clone, Debug)]
pub struct VehicleAvailability {
    pub vehicle_id: VehicleId,
    /// Free for new routes from here on, committed routes cascaded through.
    pub available_from: DateTime<Utc>,
    pub available_energy_kwh: f64,
    /// Back at the depot and able to draw power from here on.
    pub at_depot_from: DateTime<Utc>,
    /// State of charge as energy at window start, before committed legs.
    pub initial_soc_kwh: f64,
    pub committed: Vec<RouteLeg>,
}

#[derive(Debug)]
pub struct WindowPlan {
    pub window: PlanningWindow,
    pub eligible: Vec<Route>,
    pub availability: BTreeMap<VehicleId, VehicleAvailability>,
    pub tags: Vec<String>,
}

impl WindowPlan {
    pub fn route(&self, id: RouteId) -> Option<&Route> {
        self.eligible.iter().find(|r| r.id == id)
    }

    /// Eligible routes whose time span collides with at least one other.
    pub fn routes_overlapping_count(&self) -> usize {
        self.eligible
            .iter()
            .filter(|r| self.eligible.iter().any(|o| o.id != r.id && r.overlaps(o)))
            .count()
    }
}

/// Builds the rolling window: eligible routes, per-vehicle availability
/// with committed routes cascaded through it. Bad records are dropped and
/// tagged, never fatal.
pub fn build_window(
    site: SiteId,
    now: DateTime<Utc>,
    cfg: &SiteConfig,
    turnaround: Duration,
    vehicles: &[Vehicle],
    states: &[VehicleState],
    routes: &[Route],
    committed: &[(RouteId, VehicleId)],
) -> WindowPlan {
    let window = PlanningWindow::new(site, now, cfg.allocation_window_hours);
    let mut tags = Vec::new();
    let committed_ids: std::collections::BTreeSet<RouteId> =
        committed.iter().map(|(route_id, _)| *route_id).collect();

    let mut eligible = Vec::new();
    for route in routes {
        if let Err(reason) = route.check() {
            tags.push(format!("dropped: {}", reason));
            continue;
        }
        if route.site != site || route.status != RouteStatus::New {
            continue;
        }
        if committed_ids.contains(&route.id) {
            continue; // already allocated, only deducted from availability
        }
        if !window.contains(route.plan_start) {
            continue;
        }
        if route.n_orders < cfg.minimum_stops_count {
            tags.push(format!("route {} unfeasible: below minimum stops", route.id));
            continue;
        }
        eligible.push(route.clone());
    }
    eligible.sort_by_key(|r| (r.plan_start, r.id));

    let state_by_vehicle: BTreeMap<VehicleId, &VehicleState> =
        states.iter().map(|s| (s.vehicle_id, s)).collect();

    let mut availability = BTreeMap::new();
    for vehicle in vehicles {
        if vehicle.site != site || !vehicle.is_schedulable() {
            continue;
        }
        if let Err(reason) = vehicle.check() {
            tags.push(format!("dropped: {}", reason));
            continue;
        }
        let fallback = VehicleState::unknown(vehicle.id);
        let state = match state_by_vehicle.get(&vehicle.id) {
            Some(state) => *state,
            None => {
                tags.push(format!("vehicle {} has no telemetry", vehicle.id));
                &fallback
            }
        };

        let available_from = match state.status {
            VehicleStatus::OnRoute => state.return_eta.map(|eta| eta.max(now)).unwrap_or(now),
            _ => now,
        };
        let soc_percent = state
            .return_soc_percent
            .map(|r| r.max(state.estimated_soc_percent))
            .unwrap_or(state.estimated_soc_percent);
        let initial_soc_kwh = vehicle.soc_energy_kwh(soc_percent);

        let mut legs: Vec<RouteLeg> = committed
            .iter()
            .filter(|(_, v)| *v == vehicle.id)
            .filter_map(|(route_id, _)| {
                let route = routes.iter().find(|r| r.id == *route_id);
                if route.is_none() {
                    tags.push(format!("committed route {} not found", route_id));
                }
                route.map(|r| RouteLeg {
                    route_id: r.id,
                    start: r.plan_start,
                    end: r.plan_end,
                    energy_kwh: r.energy_required_kwh(vehicle),
                })
            })
            .collect();
        legs.sort_by_key(|l| (l.start, l.route_id));

        let at_depot_from = available_from;
        let mut available_from = available_from;
        let mut energy = initial_soc_kwh;
        for leg in &legs {
            let idle = leg.start - available_from;
            if idle > Duration::zero() {
                energy = (energy + vehicle.ac_charge_rate_kw * idle.num_hours_f64())
                    .min(vehicle.battery_capacity_kwh);
            }
            energy -= leg.energy_kwh;
            available_from = leg.end + turnaround;
        }
        if energy < 0.0 {
            tags.push(format!(
                "vehicle {} committed routes exceed available energy",
                vehicle.id
            ));
        }

        availability.insert(
            vehicle.id,
            VehicleAvailability {
                vehicle_id: vehicle.id,
                available_from,
                available_energy_kwh: energy,
                at_depot_from,
                initial_soc_kwh,
                committed: legs,
            },
        );
    }

    tracing::debug!(
        routes_in_window = eligible.len(),
        vehicles_available = availability.len(),
        window_start = %window.start,
        window_end = %window.end,
        "window built"
    );

    WindowPlan {
        window,
        eligible,
        availability,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
    }

    fn vehicle(id: VehicleId) -> Vehicle {
        Vehicle {
            id,
            site: 1,
            active: true,
            out_of_service: false,
            enabled: true,
            battery_capacity_kwh: 200.0,
            efficiency_kwh_per_mile: 1.0,
            ac_charge_rate_kw: 22.0,
            dc_charge_rate_kw: 50.0,
            charger_id: None,
        }
    }

    fn state(id: VehicleId, soc: f64) -> VehicleState {
        VehicleState {
            vehicle_id: id,
            status: VehicleStatus::AtDepot,
            estimated_soc_percent: soc,
            return_eta: None,
            return_soc_percent: None,
            current_route_id: None,
        }
    }

    fn route(id: RouteId, start_h: u32, end_h: u32) -> Route {
        Route {
            id,
            site: 1,
            plan_start: Utc.with_ymd_and_hms(2026, 3, 2, start_h, 0, 0).unwrap(),
            plan_end: Utc.with_ymd_and_hms(2026, 3, 2, end_h, 0, 0).unwrap(),
            mileage: 30.0,
            n_orders: 10,
            status: RouteStatus::New,
            preassigned_vehicle: None,
        }
    }

    #[test]
    fn window_clamps_horizon() {
        let window = PlanningWindow::new(1, now(), 48);
        assert_eq!(window.end - window.start, Duration::hours(24));
        let window = PlanningWindow::new(1, now(), 1);
        assert_eq!(window.end - window.start, Duration::hours(4));
    }

    #[test]
    fn eligibility_filters() {
        let cfg = SiteConfig { minimum_stops_count: 5, ..SiteConfig::default() };
        let mut outside = route(3, 8, 10);
        outside.plan_start = now() + Duration::hours(30);
        outside.plan_end = now() + Duration::hours(32);
        let mut wrong_status = route(4, 9, 11);
        wrong_status.status = RouteStatus::Active;
        let mut too_few_stops = route(5, 10, 12);
        too_few_stops.n_orders = 3;
        let mut bad = route(6, 12, 14);
        bad.plan_end = bad.plan_start - Duration::hours(1); // ends before it starts
        let routes = vec![route(1, 8, 10), route(2, 11, 13), outside, wrong_status, too_few_stops, bad];

        let plan = build_window(
            1,
            now(),
            &cfg,
            Duration::minutes(45),
            &[vehicle(1)],
            &[state(1, 80.0)],
            &routes,
            &[],
        );
        let ids: Vec<RouteId> = plan.eligible.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(plan.tags.len(), 2); // unfeasible + dropped
    }

    #[test]
    fn committed_routes_cascade_availability() {
        let cfg = SiteConfig::default();
        let routes = vec![route(1, 8, 10), route(2, 11, 13)];
        let mut st = state(1, 50.0); // 100 kWh
        st.status = VehicleStatus::Charging;
        let plan = build_window(
            1,
            now(),
            &cfg,
            Duration::minutes(45),
            &[vehicle(1)],
            &[st],
            &routes,
            &[(1, 1), (2, 1)],
        );
        let avail = &plan.availability[&1];
        assert_eq!(avail.initial_soc_kwh, 100.0);
        assert_eq!(avail.committed.len(), 2);
        // free 45 minutes after the second committed route ends
        assert_eq!(
            avail.available_from,
            Utc.with_ymd_and_hms(2026, 3, 2, 13, 45, 0).unwrap()
        );
        // 100 + 2h idle recovery - 30 for route 1, then a 15-minute gap
        // (free from 10:45, next start 11:00) minus 30 for route 2
        let expected = (100.0 + 2.0 * 22.0 - 30.0) + 22.0 * 0.25 - 30.0;
        assert!((avail.available_energy_kwh - expected).abs() < 1e-9);
    }

    #[test]
    fn on_route_vehicle_available_at_return_eta() {
        let cfg = SiteConfig::default();
        let eta = now() + Duration::hours(2);
        let st = VehicleState {
            vehicle_id: 1,
            status: VehicleStatus::OnRoute,
            estimated_soc_percent: 40.0,
            return_eta: Some(eta),
            return_soc_percent: Some(55.0),
            current_route_id: Some(99),
        };
        let plan = build_window(1, now(), &cfg, Duration::minutes(45), &[vehicle(1)], &[st], &[], &[]);
        let avail = &plan.availability[&1];
        assert_eq!(avail.available_from, eta);
        // the larger of estimated and return soc feeds the energy figure
        assert_eq!(avail.available_energy_kwh, 110.0);
    }

    #[test]
    fn disabled_vehicles_are_skipped() {
        let cfg = SiteConfig::default();
        let mut v = vehicle(1);
        v.enabled = false;
        let plan = build_window(1, now(), &cfg, Duration::minutes(45), &[v], &[state(1, 50.0)], &[], &[]);
        assert!(plan.availability.is_empty());
    }
}
