//! Decoder for the site parameter bag.
//!
//! Site configuration arrives as a flat string→string map; the value types
//! are recoverable only from key suffixes and value shape. The decoder
//! applies a fixed rule order and never fails a whole decode: a value that
//! does not parse under its inferred type is recorded and treated as absent.

use std::collections::BTreeMap;

use chrono::NaiveTime;

const NULL_SENTINELS: &[&str] = &["", "NONE", "None", "NO_VALUE"];
const BOOL_SUFFIXES: &[&str] = &["_enabled", "_flag"];
const NUMERIC_SUFFIXES: &[&str] = &[
    "_minutes",
    "_hours",
    "_seconds",
    "_kwh",
    "_penalty",
    "_weight",
    "_bonus",
    "_threshold",
    "_count",
    "_margin",
];

#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    TimeOfDay(NaiveTime),
    Array(Vec<serde_json::Value>),
    Object(serde_json::Map<String, serde_json::Value>),
    Text(String),
}

impl ParamValue {
    /// Numeric view. Booleans coerce to 0/1 because bare `0`/`1` values
    /// decode as booleans ahead of the numeric suffix rule, and text parses
    /// as a last resort for keys whose suffix carries no type hint
    /// (`target_soc_percent`, `site_capacity_kw`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
            ParamValue::Bool(b) => Some(i64::from(*b)),
            ParamValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParseFailure {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// Decoded site parameters with the decode failures that occurred.
#[derive(Clone, Debug, Default)]
pub struct SiteParams {
    values: BTreeMap<String, ParamValue>,
    failures: Vec<ParseFailure>,
}

impl SiteParams {
    pub fn decode(raw: &BTreeMap<String, String>) -> Self {
        let mut values = BTreeMap::new();
        let mut failures = Vec::new();
        for (key, value) in raw {
            match decode_value(key, value) {
                Ok(Some(decoded)) => {
                    values.insert(key.clone(), decoded);
                }
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!(key = key.as_str(), value = value.as_str(), reason = reason.as_str(), "parameter decode failed");
                    failures.push(ParseFailure {
                        key: key.clone(),
                        value: value.clone(),
                        reason,
                    });
                }
            }
        }
        Self { values, failures }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn failures(&self) -> &[ParseFailure] {
        &self.failures
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(ParamValue::as_bool).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(ParamValue::as_i64).unwrap_or(default)
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(ParamValue::as_f64).unwrap_or(default)
    }

    /// Collects every `constraint_{name}_*` key, stripped of the prefix.
    pub fn constraint_config(&self, name: &str) -> ConstraintParams {
        let prefix = format!("constraint_{}_", name);
        let mut out = ConstraintParams::default();
        for (key, value) in self.values.range(prefix.clone()..) {
            let rest = match key.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => break,
            };
            match rest {
                "enabled" => out.enabled = value.as_bool(),
                "penalty" => out.penalty = value.as_f64(),
                _ => {
                    out.params.insert(rest.to_string(), value.clone());
                }
            }
        }
        out
    }
}

/// The `{enabled, params, penalty}` triple for one named constraint.
/// Unknown keys are preserved in `params` even if the constraint never
/// reads them.
#[derive(Clone, Debug, Default)]
pub struct ConstraintParams {
    pub enabled: Option<bool>,
    pub penalty: Option<f64>,
    pub params: BTreeMap<String, ParamValue>,
}

impl ConstraintParams {
    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).and_then(ParamValue::as_f64).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.params.get(key).and_then(ParamValue::as_i64).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.params.get(key).and_then(ParamValue::as_bool).unwrap_or(default)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_text)
    }

    pub fn array(&self, key: &str) -> Option<&[serde_json::Value]> {
        match self.params.get(key) {
            Some(ParamValue::Array(items)) => Some(items),
            _ => None,
        }
    }

    pub fn object(&self, key: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self.params.get(key) {
            Some(ParamValue::Object(map)) => Some(map),
            _ => None,
        }
    }
}

fn has_suffix(key: &str, suffixes: &[&str]) -> bool {
    suffixes.iter().any(|s| key.ends_with(s))
}

fn parse_bool_word(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Applies the decode rules in order. `Ok(None)` means a null sentinel.
fn decode_value(key: &str, value: &str) -> Result<Option<ParamValue>, String> {
    let trimmed = value.trim();
    if NULL_SENTINELS.contains(&trimmed) {
        return Ok(None);
    }

    if has_suffix(key, BOOL_SUFFIXES) {
        return match parse_bool_word(trimmed) {
            Some(b) => Ok(Some(ParamValue::Bool(b))),
            None => Err(format!("expected boolean, got {:?}", trimmed)),
        };
    }
    if let Some(b) = parse_bool_word(trimmed) {
        return Ok(Some(ParamValue::Bool(b)));
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<serde_json::Value>>(trimmed)
            .map(|items| Some(ParamValue::Array(items)))
            .map_err(|e| format!("invalid JSON array: {}", e));
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(trimmed)
            .map(|map| Some(ParamValue::Object(map)))
            .map_err(|e| format!("invalid JSON object: {}", e));
    }

    if has_suffix(key, NUMERIC_SUFFIXES) {
        return if trimmed.contains('.') {
            trimmed
                .parse::<f64>()
                .map(|v| Some(ParamValue::Float(v)))
                .map_err(|e| format!("invalid float: {}", e))
        } else {
            trimmed
                .parse::<i64>()
                .map(|v| Some(ParamValue::Int(v)))
                .map_err(|e| format!("invalid integer: {}", e))
        };
    }

    if key.ends_with("_period") && trimmed.contains(':') {
        return NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
            .map(|t| Some(ParamValue::TimeOfDay(t)))
            .map_err(|e| format!("invalid time of day: {}", e));
    }

    Ok(Some(ParamValue::Text(trimmed.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(pairs: &[(&str, &str)]) -> SiteParams {
        let raw = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SiteParams::decode(&raw)
    }

    #[test]
    fn null_sentinels_are_absent() {
        let params = decode(&[
            ("a_kwh", ""),
            ("b_kwh", "NONE"),
            ("c_kwh", "None"),
            ("d_kwh", "NO_VALUE"),
        ]);
        assert!(params.get("a_kwh").is_none());
        assert!(params.get("b_kwh").is_none());
        assert!(params.get("c_kwh").is_none());
        assert!(params.get("d_kwh").is_none());
        assert!(params.failures().is_empty());
    }

    #[test]
    fn bool_by_suffix_and_shape() {
        let params = decode(&[
            ("charging_enabled", "yes"),
            ("triad_flag", "FALSE"),
            ("some_key", "true"),
            // bare 0/1 decode as booleans ahead of the numeric rule
            ("retry_count", "1"),
        ]);
        assert_eq!(params.get("charging_enabled"), Some(&ParamValue::Bool(true)));
        assert_eq!(params.get("triad_flag"), Some(&ParamValue::Bool(false)));
        assert_eq!(params.get("some_key"), Some(&ParamValue::Bool(true)));
        assert_eq!(params.get("retry_count"), Some(&ParamValue::Bool(true)));
        // numeric accessors still see 0/1
        assert_eq!(params.i64_or("retry_count", 9), 1);
    }

    #[test]
    fn bad_bool_is_recorded_not_raised() {
        let params = decode(&[("broken_enabled", "maybe")]);
        assert!(params.get("broken_enabled").is_none());
        assert_eq!(params.failures().len(), 1);
        assert_eq!(params.failures()[0].key, "broken_enabled");
    }

    #[test]
    fn json_values() {
        let params = decode(&[
            ("margin_thresholds", "[5, 10, 20]"),
            ("map", r#"{"CH1": 3, "CH2": "DISC"}"#),
        ]);
        match params.get("margin_thresholds") {
            Some(ParamValue::Array(items)) => assert_eq!(items.len(), 3),
            other => panic!("expected array, got {:?}", other),
        }
        match params.get("map") {
            Some(ParamValue::Object(map)) => assert_eq!(map.len(), 2),
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn numeric_suffixes() {
        let params = decode(&[
            ("buffer_minutes", "15"),
            ("safety_margin_kwh", "5.5"),
            ("coverage_weight", "100"),
        ]);
        assert_eq!(params.get("buffer_minutes"), Some(&ParamValue::Int(15)));
        assert_eq!(params.get("safety_margin_kwh"), Some(&ParamValue::Float(5.5)));
        assert_eq!(params.f64_or("coverage_weight", 0.0), 100.0);
    }

    #[test]
    fn untyped_suffix_still_readable_as_number() {
        // keys like site_capacity_kw carry no recognized suffix and decode
        // as text; the typed accessors parse them on demand
        let params = decode(&[("site_capacity_kw", "250"), ("target_soc_percent", "92.5")]);
        assert_eq!(params.get("site_capacity_kw"), Some(&ParamValue::Text("250".to_string())));
        assert_eq!(params.f64_or("site_capacity_kw", 0.0), 250.0);
        assert_eq!(params.f64_or("target_soc_percent", 0.0), 92.5);
    }

    #[test]
    fn time_of_day_period() {
        let params = decode(&[
            ("quiet_period", "22:30:00"),
            ("not_a_period", "22:30:00"),
        ]);
        assert_eq!(
            params.get("quiet_period"),
            Some(&ParamValue::TimeOfDay(NaiveTime::from_hms_opt(22, 30, 0).unwrap()))
        );
        // without the suffix the value stays a string
        assert_eq!(
            params.get("not_a_period"),
            Some(&ParamValue::Text("22:30:00".to_string()))
        );
    }

    #[test]
    fn constraint_config_strips_prefix_and_keeps_unknown_keys() {
        let params = decode(&[
            ("constraint_energy_feasibility_enabled", "true"),
            ("constraint_energy_feasibility_penalty", "-20"),
            ("constraint_energy_feasibility_safety_margin_kwh", "5.0"),
            ("constraint_energy_feasibility_mystery_knob_kwh", "3"),
            ("constraint_energy_feasibility", "ignored-no-underscore"),
            ("constraint_turnaround_time_strict_minimum_minutes", "45"),
        ]);
        let cc = params.constraint_config("energy_feasibility");
        assert_eq!(cc.enabled, Some(true));
        assert_eq!(cc.penalty, Some(-20.0));
        assert_eq!(cc.f64_or("safety_margin_kwh", 0.0), 5.0);
        assert_eq!(cc.i64_or("mystery_knob_kwh", 0), 3);
        assert!(!cc.params.contains_key("minimum_minutes"));

        let other = params.constraint_config("turnaround_time_strict");
        assert_eq!(other.i64_or("minimum_minutes", 0), 45);
        assert_eq!(other.enabled, None);
    }

    #[test]
    fn decode_round_trips_typed_values() {
        // encode typed values back to the legacy string schema, decode again
        let cases: Vec<(&str, String, ParamValue)> = vec![
            ("x_enabled", "true".to_string(), ParamValue::Bool(true)),
            ("x_minutes", "45".to_string(), ParamValue::Int(45)),
            ("x_kwh", "5.5".to_string(), ParamValue::Float(5.5)),
            (
                "x_period",
                "07:15:00".to_string(),
                ParamValue::TimeOfDay(NaiveTime::from_hms_opt(7, 15, 0).unwrap()),
            ),
            ("x", "depot-a".to_string(), ParamValue::Text("depot-a".to_string())),
        ];
        for (key, encoded, expected) in cases {
            match decode_value(key, &encoded) {
                Ok(Some(decoded)) => assert_eq!(decoded, expected, "key {}", key),
                other => panic!("{}: unexpected {:?}", key, other),
            }
        }
    }
}
