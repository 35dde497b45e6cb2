//! Pluggable feasibility and scoring rules over a (vehicle, sequence) pair.
//!
//! Constraints are a closed set of variants configured from the site
//! parameter bag. Hard constraints are evaluated first and short-circuit:
//! a violated sequence is filtered and never reaches the optimizer. Soft
//! constraint deltas are summed into the sequence cost.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Europe::London;

use crate::config::SiteConfig;
use crate::domain::{Route, RouteId, Vehicle, VehicleId};
use crate::params::SiteParams;
use crate::sequence::{energy_cascade, recovery_rate_kw, EnergyRule, EnumerationLimits};
use crate::slots::DurationExt;
use crate::window::VehicleAvailability;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShiftCalculation {
    FirstToLast,
    Cumulative,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApplyTo {
    First,
    All,
    Longest,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChargerScore {
    Score(f64),
    Disconnected,
}

#[derive(Clone, Debug)]
pub enum Constraint {
    EnergyFeasibility {
        safety_margin_kwh: f64,
        allow_dc_charging: bool,
        penalty: f64,
    },
    TurnaroundStrict {
        minimum_minutes: i64,
        penalty: f64,
    },
    TurnaroundPreferred {
        standard_minutes: i64,
        optimal_minutes: i64,
        penalty_standard: f64,
        penalty_optimal: f64,
    },
    ShiftHours {
        max_hours: f64,
        method: ShiftCalculation,
        pre_shift_buffer_hours: f64,
        post_shift_buffer_hours: f64,
        penalty: f64,
    },
    MinimumSoonness {
        hours: f64,
        penalty: f64,
    },
    RouteOverlap {
        penalty: f64,
    },
    ChargerPreference {
        scores: BTreeMap<String, ChargerScore>,
        window_start_hour: u32,
        window_end_hour: u32,
        apply_to: ApplyTo,
    },
    SwapMinimization {
        bonus_weight: f64,
        lookback_hours: i64,
    },
    EnergyOptimization {
        margin_thresholds: Vec<f64>,
        scores: Vec<f64>,
    },
}

impl Constraint {
    pub fn name(&self) -> &'static str {
        match self {
            Constraint::EnergyFeasibility { .. } => "energy_feasibility",
            Constraint::TurnaroundStrict { .. } => "turnaround_time_strict",
            Constraint::TurnaroundPreferred { .. } => "turnaround_time_preferred",
            Constraint::ShiftHours { .. } => "shift_hours_strict",
            Constraint::MinimumSoonness { .. } => "minimum_soonness",
            Constraint::RouteOverlap { .. } => "route_overlap",
            Constraint::ChargerPreference { .. } => "charger_preference",
            Constraint::SwapMinimization { .. } => "swap_minimization",
            Constraint::EnergyOptimization { .. } => "energy_optimization",
        }
    }

    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            Constraint::EnergyFeasibility { .. }
                | Constraint::TurnaroundStrict { .. }
                | Constraint::ShiftHours { .. }
                | Constraint::MinimumSoonness { .. }
                | Constraint::RouteOverlap { .. }
        )
    }
}

pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    /// Last allocated vehicle per route inside the swap lookback.
    pub previous: &'a BTreeMap<RouteId, VehicleId>,
}

#[derive(Clone, Debug)]
pub struct SequenceEvaluation {
    pub feasible: bool,
    pub score: f64,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ConstraintSet {
    hard: Vec<Constraint>,
    soft: Vec<Constraint>,
}

impl ConstraintSet {
    /// Builds the configured set. `route_overlap` cannot be disabled; the
    /// other constraints follow their `_enabled` keys with the documented
    /// defaults.
    pub fn from_params(params: &SiteParams) -> Self {
        let mut hard = Vec::new();
        let mut soft = Vec::new();

        let cc = params.constraint_config("energy_feasibility");
        if cc.enabled.unwrap_or(true) {
            hard.push(Constraint::EnergyFeasibility {
                safety_margin_kwh: cc.f64_or("safety_margin_kwh", 5.0),
                allow_dc_charging: cc.bool_or("allow_dc_charging", true),
                penalty: cc.penalty.unwrap_or(-20.0),
            });
        }

        let cc = params.constraint_config("turnaround_time_strict");
        if cc.enabled.unwrap_or(true) {
            hard.push(Constraint::TurnaroundStrict {
                minimum_minutes: cc.i64_or("minimum_minutes", 45),
                penalty: cc.penalty.unwrap_or(-22.0),
            });
        }

        let cc = params.constraint_config("shift_hours_strict");
        if cc.enabled.unwrap_or(false) {
            let method = match cc.text("calculation_method") {
                Some("cumulative") => ShiftCalculation::Cumulative,
                _ => ShiftCalculation::FirstToLast,
            };
            hard.push(Constraint::ShiftHours {
                max_hours: cc.f64_or("max_hours", 7.5),
                method,
                pre_shift_buffer_hours: cc.f64_or("pre_shift_buffer_hours", 0.0),
                post_shift_buffer_hours: cc.f64_or("post_shift_buffer_hours", 0.0),
                penalty: cc.penalty.unwrap_or(-20.0),
            });
        }

        let cc = params.constraint_config("minimum_soonness");
        if cc.enabled.unwrap_or(true) {
            hard.push(Constraint::MinimumSoonness {
                hours: cc.f64_or("hours", 0.75),
                penalty: cc.penalty.unwrap_or(-20.0),
            });
        }

        let cc = params.constraint_config("route_overlap");
        if cc.enabled == Some(false) {
            tracing::warn!("route_overlap cannot be disabled; keeping it on");
        }
        hard.push(Constraint::RouteOverlap {
            penalty: cc.penalty.unwrap_or(-20.0),
        });

        let cc = params.constraint_config("turnaround_time_preferred");
        if cc.enabled.unwrap_or(true) {
            soft.push(Constraint::TurnaroundPreferred {
                standard_minutes: cc.i64_or("standard_minutes", 75),
                optimal_minutes: cc.i64_or("optimal_minutes", 90),
                penalty_standard: cc.f64_or("penalty_standard", -2.0),
                penalty_optimal: cc.f64_or("penalty_optimal", -1.0),
            });
        }

        let cc = params.constraint_config("charger_preference");
        if cc.enabled.unwrap_or(false) {
            let mut scores = BTreeMap::new();
            if let Some(map) = cc.object("map") {
                for (charger, value) in map {
                    match value {
                        serde_json::Value::Number(n) => {
                            if let Some(score) = n.as_f64() {
                                scores.insert(charger.clone(), ChargerScore::Score(score));
                            }
                        }
                        serde_json::Value::String(s) if s == "DISC" => {
                            scores.insert(charger.clone(), ChargerScore::Disconnected);
                        }
                        other => {
                            tracing::warn!(charger = charger.as_str(), ?other, "unusable charger preference entry");
                        }
                    }
                }
            }
            let apply_to = match cc.text("apply_to_position") {
                Some("all") => ApplyTo::All,
                Some("longest") => ApplyTo::Longest,
                _ => ApplyTo::First,
            };
            soft.push(Constraint::ChargerPreference {
                scores,
                window_start_hour: cc.i64_or("time_window_start_hours", 0).clamp(0, 24) as u32,
                window_end_hour: cc.i64_or("time_window_end_hours", 24).clamp(0, 24) as u32,
                apply_to,
            });
        }

        let cc = params.constraint_config("swap_minimization");
        if cc.enabled.unwrap_or(false) {
            soft.push(Constraint::SwapMinimization {
                bonus_weight: cc.f64_or("bonus_weight", 0.5),
                lookback_hours: cc.i64_or("lookback_hours", 24),
            });
        }

        let cc = params.constraint_config("energy_optimization");
        if cc.enabled.unwrap_or(false) {
            let margin_thresholds: Vec<f64> = cc
                .array("margin_thresholds")
                .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
                .unwrap_or_default();
            let scores: Vec<f64> = cc
                .array("scores")
                .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
                .unwrap_or_default();
            if margin_thresholds.len() == scores.len() && !margin_thresholds.is_empty() {
                soft.push(Constraint::EnergyOptimization {
                    margin_thresholds,
                    scores,
                });
            } else {
                tracing::warn!("energy_optimization thresholds and scores do not line up; skipping");
            }
        }

        Self { hard, soft }
    }

    pub fn energy_rule(&self) -> Option<EnergyRule> {
        self.hard.iter().find_map(|c| match c {
            Constraint::EnergyFeasibility {
                safety_margin_kwh,
                allow_dc_charging,
                ..
            } => Some(EnergyRule {
                safety_margin_kwh: *safety_margin_kwh,
                allow_dc_charging: *allow_dc_charging,
            }),
            _ => None,
        })
    }

    pub fn strict_turnaround(&self) -> Option<Duration> {
        self.hard.iter().find_map(|c| match c {
            Constraint::TurnaroundStrict { minimum_minutes, .. } => {
                Some(Duration::minutes(*minimum_minutes))
            }
            _ => None,
        })
    }

    pub fn min_start_lead(&self) -> Option<Duration> {
        self.hard.iter().find_map(|c| match c {
            Constraint::MinimumSoonness { hours, .. } => {
                Some(Duration::seconds((hours * 3600.0) as i64))
            }
            _ => None,
        })
    }

    pub fn swap_lookback(&self) -> Option<Duration> {
        self.soft.iter().find_map(|c| match c {
            Constraint::SwapMinimization { lookback_hours, .. } => {
                Some(Duration::hours(*lookback_hours))
            }
            _ => None,
        })
    }

    /// The gap the enumerator must leave between consecutive routes:
    /// the strict minimum or the configured buffer, whichever is larger.
    pub fn turnaround(&self, cfg: &SiteConfig) -> Duration {
        let buffer = Duration::minutes(cfg.route_sequence_buffer_minutes.max(0));
        self.strict_turnaround().map(|s| s.max(buffer)).unwrap_or(buffer)
    }

    pub fn enumeration_limits(&self, cfg: &SiteConfig) -> EnumerationLimits {
        EnumerationLimits {
            max_len: cfg.max_routes_per_vehicle_in_window,
            turnaround: self.turnaround(cfg),
            min_start_lead: self.min_start_lead(),
            energy: self.energy_rule(),
        }
    }

    pub fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        vehicle: &Vehicle,
        avail: &VehicleAvailability,
        routes: &[&Route],
    ) -> SequenceEvaluation {
        let mut tags = Vec::new();
        for constraint in &self.hard {
            let (violated, delta) = hard_outcome(constraint, ctx, vehicle, avail, routes);
            if violated {
                tags.push(format!("hard violation: {}", constraint.name()));
                return SequenceEvaluation {
                    feasible: false,
                    score: delta,
                    tags,
                };
            }
        }

        let mut score = 0.0;
        for constraint in &self.soft {
            score += soft_delta(constraint, ctx, vehicle, avail, routes, &mut tags);
        }
        SequenceEvaluation {
            feasible: true,
            score,
            tags,
        }
    }
}

fn adjacent_gaps<'a>(routes: &'a [&'a Route]) -> impl Iterator<Item = Duration> + 'a {
    routes
        .windows(2)
        .map(|pair| pair[1].plan_start - pair[0].plan_end)
}

fn hard_outcome(
    constraint: &Constraint,
    ctx: &EvalContext<'_>,
    vehicle: &Vehicle,
    avail: &VehicleAvailability,
    routes: &[&Route],
) -> (bool, f64) {
    match constraint {
        Constraint::EnergyFeasibility {
            safety_margin_kwh,
            allow_dc_charging,
            penalty,
        } => {
            let cascade = energy_cascade(
                vehicle,
                recovery_rate_kw(vehicle, *allow_dc_charging),
                avail.available_from,
                avail.available_energy_kwh,
                routes,
            );
            let violated = cascade.iter().any(|energy| *energy < *safety_margin_kwh);
            (violated, if violated { *penalty } else { 0.0 })
        }
        Constraint::TurnaroundStrict {
            minimum_minutes,
            penalty,
        } => {
            let violated = adjacent_gaps(routes)
                .any(|gap| gap < Duration::minutes(*minimum_minutes));
            (violated, if violated { *penalty } else { 0.0 })
        }
        Constraint::ShiftHours {
            max_hours,
            method,
            pre_shift_buffer_hours,
            post_shift_buffer_hours,
            penalty,
        } => {
            if routes.is_empty() {
                return (false, 0.0);
            }
            let driving = match method {
                ShiftCalculation::FirstToLast => {
                    (routes[routes.len() - 1].plan_end - routes[0].plan_start).num_hours_f64()
                }
                ShiftCalculation::Cumulative => routes
                    .iter()
                    .map(|r| (r.plan_end - r.plan_start).num_hours_f64())
                    .sum(),
            };
            let total = driving + pre_shift_buffer_hours + post_shift_buffer_hours;
            let violated = total > *max_hours;
            (violated, if violated { *penalty } else { 0.0 })
        }
        Constraint::MinimumSoonness { hours, penalty } => {
            let lead = Duration::seconds((hours * 3600.0) as i64);
            let violated = routes
                .first()
                .map(|r| r.plan_start - ctx.now < lead)
                .unwrap_or(false);
            (violated, if violated { *penalty } else { 0.0 })
        }
        Constraint::RouteOverlap { penalty } => {
            let violated = routes
                .windows(2)
                .any(|pair| pair[0].overlaps(pair[1]));
            (violated, if violated { *penalty } else { 0.0 })
        }
        _ => (false, 0.0),
    }
}

fn soft_delta(
    constraint: &Constraint,
    ctx: &EvalContext<'_>,
    vehicle: &Vehicle,
    avail: &VehicleAvailability,
    routes: &[&Route],
    tags: &mut Vec<String>,
) -> f64 {
    match constraint {
        Constraint::TurnaroundPreferred {
            standard_minutes,
            optimal_minutes,
            penalty_standard,
            penalty_optimal,
        } => adjacent_gaps(routes)
            .map(|gap| {
                if gap < Duration::minutes(*standard_minutes) {
                    *penalty_standard
                } else if gap < Duration::minutes(*optimal_minutes) {
                    *penalty_optimal
                } else {
                    0.0
                }
            })
            .sum(),
        Constraint::ChargerPreference {
            scores,
            window_start_hour,
            window_end_hour,
            apply_to,
        } => {
            let charger = match &vehicle.charger_id {
                Some(id) => id,
                None => return 0.0,
            };
            let applicable: Vec<&&Route> = match apply_to {
                ApplyTo::First => routes.first().into_iter().collect(),
                ApplyTo::All => routes.iter().collect(),
                ApplyTo::Longest => routes
                    .iter()
                    .max_by_key(|r| (r.plan_end - r.plan_start, r.id))
                    .into_iter()
                    .collect(),
            };
            let mut delta = 0.0;
            for route in applicable {
                let local_hour = route.plan_start.with_timezone(&London).hour();
                if local_hour < *window_start_hour || local_hour >= *window_end_hour {
                    continue;
                }
                match scores.get(charger) {
                    Some(ChargerScore::Score(score)) => delta += score,
                    Some(ChargerScore::Disconnected) => {
                        tags.push(format!("charger {} disconnected", charger));
                    }
                    None => {}
                }
            }
            delta
        }
        Constraint::SwapMinimization { bonus_weight, .. } => routes
            .iter()
            .filter(|r| ctx.previous.get(&r.id) == Some(&vehicle.id))
            .count() as f64
            * bonus_weight,
        Constraint::EnergyOptimization {
            margin_thresholds,
            scores,
        } => {
            let cascade = energy_cascade(
                vehicle,
                vehicle.ac_charge_rate_kw,
                avail.available_from,
                avail.available_energy_kwh,
                routes,
            );
            let fraction = cascade
                .last()
                .map(|e| e / vehicle.battery_capacity_kwh)
                .unwrap_or(0.0);
            margin_thresholds
                .iter()
                .zip(scores.iter())
                .filter(|(threshold, _)| fraction >= **threshold)
                .map(|(_, score)| *score)
                .last()
                .unwrap_or(0.0)
        }
        _ => 0.0,
    }
}
