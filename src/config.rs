use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

use crate::params::SiteParams;

pub trait Validate: Sized {
    fn validate(self) -> Result<Self, Error>;
}

/// Site-level planning configuration, decoded from the site parameter bag
/// with per-key defaults.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SiteConfig {
    /// Rolling window length H; clamped to 4..=24 when the window is built.
    pub allocation_window_hours: i64,
    pub max_routes_per_vehicle_in_window: usize,
    pub route_sequence_buffer_minutes: i64,
    pub reserve_vehicle_count: usize,
    pub enable_dynamic_reallocation: bool,
    pub reallocation_trigger_variance_minutes: i64,
    /// Routes with fewer orders than this are tagged unfeasible and dropped.
    pub minimum_stops_count: u32,
    pub target_soc_percent: f64,
    pub site_capacity_kw: f64,
    pub synthetic_time_price_factor: f64,
    pub triad_penalty_factor: f64,
    pub target_soc_shortfall_penalty: f64,
    pub allocation_time_limit_seconds: f64,
    pub scheduling_time_limit_seconds: f64,
    pub integrated_time_limit_seconds: f64,
    /// Allocations scoring below this are kept but marked failed.
    pub allocation_score_threshold: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            allocation_window_hours: 18,
            max_routes_per_vehicle_in_window: 5,
            route_sequence_buffer_minutes: 15,
            reserve_vehicle_count: 2,
            enable_dynamic_reallocation: true,
            reallocation_trigger_variance_minutes: 30,
            minimum_stops_count: 1,
            target_soc_percent: 95.0,
            site_capacity_kw: 200.0,
            synthetic_time_price_factor: 0.001,
            triad_penalty_factor: 10.0,
            target_soc_shortfall_penalty: 1000.0,
            allocation_time_limit_seconds: 30.0,
            scheduling_time_limit_seconds: 300.0,
            integrated_time_limit_seconds: 330.0,
            allocation_score_threshold: -4.0,
        }
    }
}

impl SiteConfig {
    pub fn from_params(params: &SiteParams) -> Self {
        let d = Self::default();
        Self {
            allocation_window_hours: params.i64_or("allocation_window_hours", d.allocation_window_hours),
            max_routes_per_vehicle_in_window: params
                .i64_or("max_routes_per_vehicle_in_window", d.max_routes_per_vehicle_in_window as i64)
                .max(0) as usize,
            route_sequence_buffer_minutes: params
                .i64_or("route_sequence_buffer_minutes", d.route_sequence_buffer_minutes),
            reserve_vehicle_count: params
                .i64_or("reserve_vehicle_count", d.reserve_vehicle_count as i64)
                .max(0) as usize,
            enable_dynamic_reallocation: params
                .bool_or("enable_dynamic_reallocation", d.enable_dynamic_reallocation),
            reallocation_trigger_variance_minutes: params.i64_or(
                "reallocation_trigger_variance_minutes",
                d.reallocation_trigger_variance_minutes,
            ),
            minimum_stops_count: params
                .i64_or("minimum_stops_count", d.minimum_stops_count as i64)
                .max(0) as u32,
            target_soc_percent: params.f64_or("target_soc_percent", d.target_soc_percent),
            site_capacity_kw: params.f64_or("site_capacity_kw", d.site_capacity_kw),
            synthetic_time_price_factor: params
                .f64_or("synthetic_time_price_factor", d.synthetic_time_price_factor),
            triad_penalty_factor: params.f64_or("triad_penalty_factor", d.triad_penalty_factor),
            target_soc_shortfall_penalty: params
                .f64_or("target_soc_shortfall_penalty", d.target_soc_shortfall_penalty),
            allocation_time_limit_seconds: params
                .f64_or("allocation_time_limit_seconds", d.allocation_time_limit_seconds),
            scheduling_time_limit_seconds: params
                .f64_or("scheduling_time_limit_seconds", d.scheduling_time_limit_seconds),
            integrated_time_limit_seconds: params
                .f64_or("integrated_time_limit_seconds", d.integrated_time_limit_seconds),
            allocation_score_threshold: params
                .f64_or("allocation_score_threshold", d.allocation_score_threshold),
        }
    }
}

impl Validate for SiteConfig {
    fn validate(self) -> Result<Self, Error> {
        if self.allocation_window_hours <= 0 {
            return Err(anyhow!(
                "allocation_window_hours {} must be positive",
                self.allocation_window_hours
            ));
        }
        if !(0.0..=100.0).contains(&self.target_soc_percent) {
            return Err(anyhow!(
                "target_soc_percent {} must be in range [0, 100]",
                self.target_soc_percent
            ));
        }
        if self.site_capacity_kw < 0.0 {
            return Err(anyhow!(
                "site_capacity_kw {} must be non-negative",
                self.site_capacity_kw
            ));
        }
        if self.max_routes_per_vehicle_in_window == 0 {
            return Err(anyhow!("max_routes_per_vehicle_in_window must be at least 1"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn toml_round_trip() {
        let config = SiteConfig::default();

        let tomled = toml::to_string_pretty(&config).unwrap();

        println!("{}", tomled);

        let config2: SiteConfig = toml::from_str(&tomled).unwrap();

        assert_eq!(config, config2);
    }

    #[test]
    fn from_params_overrides_defaults() {
        let raw: BTreeMap<String, String> = [
            ("allocation_window_hours", "12"),
            ("target_soc_percent", "90.0"),
            ("reserve_vehicle_count", "3"),
            ("unrelated_key", "whatever"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = SiteConfig::from_params(&SiteParams::decode(&raw));
        assert_eq!(config.allocation_window_hours, 12);
        assert_eq!(config.target_soc_percent, 90.0);
        assert_eq!(config.reserve_vehicle_count, 3);
        // untouched keys keep defaults
        assert_eq!(config.site_capacity_kw, 200.0);
    }

    #[test]
    fn validate_rejects_bad_target_soc() {
        let config = SiteConfig {
            target_soc_percent: 120.0,
            ..SiteConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
