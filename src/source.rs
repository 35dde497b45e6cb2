//! Domain inputs the planner consumes.
//!
//! Persistence lives outside this crate; the planner only sees the
//! [`SiteData`] trait. [`SiteSnapshot`] is the JSON-backed implementation
//! used by the CLI and by tests.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Error};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Route, RouteId, RouteStatus, SiteId, Vehicle, VehicleId, VehicleState, VehicleStatus,
};
use crate::prices::PricePoint;

pub trait SiteData {
    /// Raw string-valued site parameters (`sp_get_module_params` shape).
    fn site_parameters(&self, site: SiteId) -> Result<BTreeMap<String, String>, Error>;
    fn list_vehicles(&self, site: SiteId) -> Result<Vec<Vehicle>, Error>;
    fn latest_vehicle_states(&self, site: SiteId) -> Result<Vec<VehicleState>, Error>;
    fn list_routes_in_window(
        &self,
        site: SiteId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Route>, Error>;
    fn list_committed_allocations(
        &self,
        site: SiteId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<(RouteId, VehicleId)>, Error>;
    /// Vehicle a route was last allocated to at or after `since`.
    /// When several records qualify, the latest wins.
    fn previous_allocation(
        &self,
        route: RouteId,
        since: DateTime<Utc>,
    ) -> Result<Option<VehicleId>, Error>;
    fn prices_and_forecast(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, Error>;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommittedAllocation {
    pub route_id: RouteId,
    pub vehicle_id: VehicleId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PreviousAllocation {
    pub route_id: RouteId,
    pub vehicle_id: VehicleId,
    pub recorded_at: DateTime<Utc>,
}

/// A full point-in-time capture of one site's planning inputs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SiteSnapshot {
    pub site_id: SiteId,
    pub parameters: BTreeMap<String, String>,
    pub vehicles: Vec<Vehicle>,
    pub vehicle_states: Vec<VehicleState>,
    pub routes: Vec<Route>,
    pub committed_allocations: Vec<CommittedAllocation>,
    pub previous_allocations: Vec<PreviousAllocation>,
    pub prices: Vec<PricePoint>,
}

impl SiteSnapshot {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut buf = String::new();
        File::open(path)
            .with_context(|| format!("opening snapshot {}", path.display()))?
            .read_to_string(&mut buf)?;
        serde_json::from_str(&buf)
            .with_context(|| format!("parsing snapshot {}", path.display()))
    }

    /// A small self-consistent site used by `generate-snapshot` and tests:
    /// three vans, four routes across the day, flat-ish prices with one
    /// triad slot in the evening peak.
    pub fn demo(now: DateTime<Utc>) -> Self {
        let day = now.date_naive();
        let at = |h: u32, m: u32| {
            Utc.from_utc_datetime(&day.and_hms_opt(h, m, 0).unwrap())
        };
        let vehicle = |id: u32| Vehicle {
            id,
            site: 1,
            active: true,
            out_of_service: false,
            enabled: true,
            battery_capacity_kwh: 200.0,
            efficiency_kwh_per_mile: 1.0,
            ac_charge_rate_kw: 22.0,
            dc_charge_rate_kw: 50.0,
            charger_id: Some(format!("CH{}", id)),
        };
        let route = |id: u64, start_h: u32, end_h: u32, mileage: f64| Route {
            id,
            site: 1,
            plan_start: at(start_h, 0),
            plan_end: at(end_h, 0),
            mileage,
            n_orders: 20,
            status: RouteStatus::New,
            preassigned_vehicle: None,
        };

        let horizon_slots = 36;
        let prices = (0..horizon_slots)
            .map(|i| {
                let slot_start = now + Duration::minutes(30 * i);
                let evening = (24..28).contains(&i);
                PricePoint {
                    slot_start,
                    energy_price: if evening { 0.38 } else { 0.14 },
                    triad_flag: i == 25,
                    load_forecast_kw: 40.0,
                }
            })
            .collect();

        let parameters = [
            ("allocation_window_hours", "18"),
            ("max_routes_per_vehicle_in_window", "5"),
            ("route_sequence_buffer_minutes", "15"),
            ("reserve_vehicle_count", "0"),
            ("target_soc_percent", "95"),
            ("site_capacity_kw", "200"),
            ("constraint_turnaround_time_preferred_enabled", "true"),
            ("constraint_swap_minimization_enabled", "true"),
            ("constraint_swap_minimization_bonus_weight", "0.5"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            site_id: 1,
            parameters,
            vehicles: vec![vehicle(1), vehicle(2), vehicle(3)],
            vehicle_states: vec![
                VehicleState {
                    vehicle_id: 1,
                    status: VehicleStatus::AtDepot,
                    estimated_soc_percent: 80.0,
                    return_eta: None,
                    return_soc_percent: None,
                    current_route_id: None,
                },
                VehicleState {
                    vehicle_id: 2,
                    status: VehicleStatus::Charging,
                    estimated_soc_percent: 45.0,
                    return_eta: None,
                    return_soc_percent: None,
                    current_route_id: None,
                },
                VehicleState {
                    vehicle_id: 3,
                    status: VehicleStatus::OnRoute,
                    estimated_soc_percent: 60.0,
                    return_eta: Some(now + Duration::hours(2)),
                    return_soc_percent: Some(50.0),
                    current_route_id: Some(900),
                },
            ],
            routes: vec![
                route(101, 8, 10, 40.0),
                route(102, 11, 13, 35.0),
                route(103, 14, 16, 50.0),
                route(104, 9, 12, 45.0),
            ],
            committed_allocations: vec![],
            previous_allocations: vec![PreviousAllocation {
                route_id: 101,
                vehicle_id: 1,
                recorded_at: now - Duration::hours(20),
            }],
            prices,
        }
    }
}

impl SiteData for SiteSnapshot {
    fn site_parameters(&self, site: SiteId) -> Result<BTreeMap<String, String>, Error> {
        anyhow::ensure!(site == self.site_id, "snapshot holds site {}, not {}", self.site_id, site);
        Ok(self.parameters.clone())
    }

    fn list_vehicles(&self, site: SiteId) -> Result<Vec<Vehicle>, Error> {
        Ok(self.vehicles.iter().filter(|v| v.site == site).cloned().collect())
    }

    fn latest_vehicle_states(&self, _site: SiteId) -> Result<Vec<VehicleState>, Error> {
        Ok(self.vehicle_states.clone())
    }

    fn list_routes_in_window(
        &self,
        site: SiteId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Route>, Error> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.site == site && r.plan_start < window_end && r.plan_end > window_start)
            .cloned()
            .collect())
    }

    fn list_committed_allocations(
        &self,
        _site: SiteId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<(RouteId, VehicleId)>, Error> {
        let in_window = |id: RouteId| {
            self.routes
                .iter()
                .find(|r| r.id == id)
                .map(|r| r.plan_start < window_end && r.plan_end > window_start)
                .unwrap_or(false)
        };
        Ok(self
            .committed_allocations
            .iter()
            .filter(|c| in_window(c.route_id))
            .map(|c| (c.route_id, c.vehicle_id))
            .collect())
    }

    fn previous_allocation(
        &self,
        route: RouteId,
        since: DateTime<Utc>,
    ) -> Result<Option<VehicleId>, Error> {
        Ok(self
            .previous_allocations
            .iter()
            .filter(|p| p.route_id == route && p.recorded_at >= since)
            .max_by_key(|p| (p.recorded_at, p.vehicle_id))
            .map(|p| p.vehicle_id))
    }

    fn prices_and_forecast(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, Error> {
        Ok(self
            .prices
            .iter()
            .filter(|p| p.slot_start >= window_start - Duration::minutes(30) && p.slot_start < window_end)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
    }

    #[test]
    fn snapshot_json_round_trip() {
        let snapshot = SiteSnapshot::demo(now());
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        let snapshot2: SiteSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, snapshot2);
    }

    #[test]
    fn previous_allocation_latest_wins() {
        let mut snapshot = SiteSnapshot::demo(now());
        snapshot.previous_allocations = vec![
            PreviousAllocation { route_id: 101, vehicle_id: 1, recorded_at: now() - Duration::hours(10) },
            PreviousAllocation { route_id: 101, vehicle_id: 2, recorded_at: now() - Duration::hours(2) },
            PreviousAllocation { route_id: 101, vehicle_id: 3, recorded_at: now() - Duration::hours(30) },
        ];
        assert_eq!(
            snapshot.previous_allocation(101, now() - Duration::hours(24)).unwrap(),
            Some(2)
        );
        // outside the lookback nothing qualifies
        assert_eq!(
            snapshot.previous_allocation(101, now() - Duration::hours(1)).unwrap(),
            None
        );
    }

    #[test]
    fn routes_filtered_by_site_and_window() {
        let snapshot = SiteSnapshot::demo(now());
        let routes = snapshot
            .list_routes_in_window(1, now(), now() + Duration::hours(18))
            .unwrap();
        assert_eq!(routes.len(), 4);
        let none = snapshot
            .list_routes_in_window(2, now(), now() + Duration::hours(18))
            .unwrap();
        assert!(none.is_empty());
    }
}
