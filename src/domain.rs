use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type SiteId = u32;
pub type VehicleId = u32;
pub type RouteId = u64;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum VehicleStatus {
    OnRoute,
    AtDepot,
    Charging,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Vehicle {
    pub id: VehicleId,
    pub site: SiteId,
    pub active: bool,
    pub out_of_service: bool,
    /// Maintained from site configuration, not telematics.
    pub enabled: bool,
    pub battery_capacity_kwh: f64,
    pub efficiency_kwh_per_mile: f64,
    pub ac_charge_rate_kw: f64,
    pub dc_charge_rate_kw: f64,
    #[serde(default)]
    pub charger_id: Option<String>,
}

impl Vehicle {
    pub fn is_schedulable(&self) -> bool {
        self.active && !self.out_of_service && self.enabled
    }

    pub fn soc_energy_kwh(&self, soc_percent: f64) -> f64 {
        self.battery_capacity_kwh * soc_percent / 100.0
    }

    /// Rejects records the optimizer cannot work with.
    pub fn check(&self) -> Result<(), String> {
        if self.battery_capacity_kwh <= 0.0 {
            return Err(format!("vehicle {} has non-positive battery capacity", self.id));
        }
        if self.efficiency_kwh_per_mile <= 0.0 {
            return Err(format!("vehicle {} has non-positive efficiency", self.id));
        }
        if self.ac_charge_rate_kw < 0.0 || self.dc_charge_rate_kw < 0.0 {
            return Err(format!("vehicle {} has negative charge rate", self.id));
        }
        Ok(())
    }
}

/// Latest telemetry snapshot for one vehicle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VehicleState {
    pub vehicle_id: VehicleId,
    pub status: VehicleStatus,
    pub estimated_soc_percent: f64,
    #[serde(default)]
    pub return_eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub return_soc_percent: Option<f64>,
    #[serde(default)]
    pub current_route_id: Option<RouteId>,
}

impl VehicleState {
    pub fn unknown(vehicle_id: VehicleId) -> Self {
        Self {
            vehicle_id,
            status: VehicleStatus::Unknown,
            estimated_soc_percent: 0.0,
            return_eta: None,
            return_soc_percent: None,
            current_route_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub enum RouteStatus {
    New,
    Active,
    Complete,
    Cancelled,
    Error,
    Unfeasible,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Route {
    pub id: RouteId,
    pub site: SiteId,
    pub plan_start: DateTime<Utc>,
    pub plan_end: DateTime<Utc>,
    pub mileage: f64,
    pub n_orders: u32,
    pub status: RouteStatus,
    /// Upstream systems use several sentinels for "no pre-assignment"
    /// (0, -1, "X", null); they all canonicalize to `None` on ingestion.
    #[serde(default, deserialize_with = "de_preassignment")]
    pub preassigned_vehicle: Option<VehicleId>,
}

impl Route {
    pub fn energy_required_kwh(&self, vehicle: &Vehicle) -> f64 {
        self.mileage * vehicle.efficiency_kwh_per_mile
    }

    pub fn overlaps(&self, other: &Route) -> bool {
        self.plan_start < other.plan_end && other.plan_start < self.plan_end
    }

    pub fn check(&self) -> Result<(), String> {
        if self.plan_end <= self.plan_start {
            return Err(format!("route {} has plan_end <= plan_start", self.id));
        }
        if self.mileage < 0.0 {
            return Err(format!("route {} has negative mileage", self.id));
        }
        Ok(())
    }
}

/// One executed or planned route on a vehicle's timeline, with the energy
/// it consumes for that vehicle.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteLeg {
    pub route_id: RouteId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub energy_kwh: f64,
}

fn de_preassignment<'de, D>(deserializer: D) -> Result<Option<VehicleId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(canonical_preassignment(raw.as_ref()))
}

pub fn canonical_preassignment(raw: Option<&serde_json::Value>) -> Option<VehicleId> {
    use serde_json::Value;
    match raw {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(id) if id > 0 => Some(id as VehicleId),
            _ => None,
        },
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("x") {
                None
            } else {
                s.parse::<i64>()
                    .ok()
                    .filter(|id| *id > 0)
                    .map(|id| id as VehicleId)
            }
        }
        Some(_) => None,
    }
}
