//! Feasible route-sequence enumeration.
//!
//! For every available vehicle, enumerates ordered route subsequences up to
//! the configured length. Prefixes that already violate turnaround or the
//! energy cascade are pruned; both checks are monotone in the prefix, so
//! pruning loses nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{Route, RouteId, Vehicle, VehicleId};
use crate::slots::DurationExt;
use crate::window::{VehicleAvailability, WindowPlan};

#[derive(Clone, Debug)]
pub struct SequenceLeg {
    pub route_id: RouteId,
    pub estimated_arrival: DateTime<Utc>,
    pub estimated_arrival_soc: f64,
}

/// One feasible ordered run of routes for one vehicle.
#[derive(Clone, Debug)]
pub struct SequenceCandidate {
    pub vehicle_id: VehicleId,
    pub legs: Vec<SequenceLeg>,
    pub final_energy_kwh: f64,
}

impl SequenceCandidate {
    pub fn route_ids(&self) -> impl Iterator<Item = RouteId> + '_ {
        self.legs.iter().map(|l| l.route_id)
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct EnergyRule {
    pub safety_margin_kwh: f64,
    pub allow_dc_charging: bool,
}

#[derive(Clone, Debug)]
pub struct EnumerationLimits {
    pub max_len: usize,
    /// Enforced gap between consecutive routes:
    /// `max(strict_minimum, route_sequence_buffer)`.
    pub turnaround: Duration,
    /// Minimum lead time between window start and any route departure.
    pub min_start_lead: Option<Duration>,
    /// Energy pruning; `None` when the energy constraint is disabled.
    pub energy: Option<EnergyRule>,
}

/// Charging power assumed while a vehicle idles between routes.
pub fn recovery_rate_kw(vehicle: &Vehicle, allow_dc_charging: bool) -> f64 {
    if allow_dc_charging {
        vehicle.ac_charge_rate_kw.max(vehicle.dc_charge_rate_kw)
    } else {
        vehicle.ac_charge_rate_kw
    }
}

/// Runs the energy cascade over `legs`: idle-gap recovery capped at battery
/// capacity, then route consumption. Returns the energy level after each
/// leg.
pub fn energy_cascade(
    vehicle: &Vehicle,
    recovery_rate_kw: f64,
    available_from: DateTime<Utc>,
    start_energy_kwh: f64,
    legs: &[&Route],
) -> Vec<f64> {
    let mut energy = start_energy_kwh;
    let mut free_from = available_from;
    let mut out = Vec::with_capacity(legs.len());
    for route in legs {
        let idle = route.plan_start - free_from;
        if idle > Duration::zero() {
            energy = (energy + recovery_rate_kw * idle.num_hours_f64())
                .min(vehicle.battery_capacity_kwh);
        }
        energy -= route.energy_required_kwh(vehicle);
        out.push(energy);
        free_from = route.plan_end;
    }
    out
}

pub fn enumerate_sequences(
    plan: &WindowPlan,
    vehicles: &BTreeMap<VehicleId, Vehicle>,
    limits: &EnumerationLimits,
) -> Vec<SequenceCandidate> {
    let mut out = Vec::new();
    if limits.max_len == 0 {
        return out;
    }

    // routes a departure-lead rule excludes can never appear in a sequence
    let candidates: Vec<&Route> = plan
        .eligible
        .iter()
        .filter(|r| match limits.min_start_lead {
            Some(lead) => r.plan_start - plan.window.start >= lead,
            None => true,
        })
        .collect();

    for (vehicle_id, avail) in &plan.availability {
        let vehicle = match vehicles.get(vehicle_id) {
            Some(v) => v,
            None => continue,
        };
        let rate = limits
            .energy
            .as_ref()
            .map(|rule| recovery_rate_kw(vehicle, rule.allow_dc_charging))
            .unwrap_or(vehicle.ac_charge_rate_kw);
        let mut prefix = Vec::new();
        extend(
            vehicle, avail, rate, limits, &candidates, 0, &mut prefix, &mut out,
        );
    }

    tracing::debug!(candidates = out.len(), "sequence enumeration finished");
    out
}

#[allow(clippy::too_many_arguments)]
fn extend<'r>(
    vehicle: &Vehicle,
    avail: &VehicleAvailability,
    recovery_rate_kw: f64,
    limits: &EnumerationLimits,
    candidates: &[&'r Route],
    from_index: usize,
    prefix: &mut Vec<&'r Route>,
    out: &mut Vec<SequenceCandidate>,
) {
    if prefix.len() == limits.max_len {
        return;
    }
    for (offset, &route) in candidates[from_index..].iter().enumerate() {
        match prefix.last() {
            None => {
                if route.plan_start < avail.available_from {
                    continue;
                }
            }
            Some(last) => {
                if route.plan_start - last.plan_end < limits.turnaround {
                    continue;
                }
            }
        }

        prefix.push(route);
        let cascade = energy_cascade(
            vehicle,
            recovery_rate_kw,
            avail.available_from,
            avail.available_energy_kwh,
            prefix,
        );
        let feasible = match &limits.energy {
            Some(rule) => cascade
                .last()
                .map(|e| *e >= rule.safety_margin_kwh)
                .unwrap_or(true),
            None => true,
        };
        if feasible {
            out.push(SequenceCandidate {
                vehicle_id: vehicle.id,
                legs: prefix
                    .iter()
                    .zip(cascade.iter())
                    .map(|(r, energy)| SequenceLeg {
                        route_id: r.id,
                        estimated_arrival: r.plan_end,
                        estimated_arrival_soc: energy / vehicle.battery_capacity_kwh * 100.0,
                    })
                    .collect(),
                final_energy_kwh: *cascade.last().unwrap(),
            });
            extend(
                vehicle,
                avail,
                recovery_rate_kw,
                limits,
                candidates,
                from_index + offset + 1,
                prefix,
                out,
            );
        }
        prefix.pop();
    }
}
