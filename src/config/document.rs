//! Station document model.
//!
//! A [`ConfigDocument`] is the typed form of a station document that already
//! passed schema validation. It is immutable: the station reads from it but
//! never edits it, and instrument order is the order the document lists them
//! in, which is also the order instruments are resolved and loaded in.

use crate::config::schema::SchemaValidator;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value};
use station_core::error::{StationError, StationResult};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

// =============================================================================
// OrderedMap
// =============================================================================

/// String-keyed map that keeps document order and rejects duplicate keys.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// True when `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Index of `key` in document order.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Iterate entries in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Insert or replace. A replaced entry keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }
}

impl<V: Clone> OrderedMap<V> {
    /// Key-wise merge: entries of `overrides` replace entries with the same
    /// key, new keys are appended.
    pub fn merged_with(&self, overrides: &OrderedMap<V>) -> OrderedMap<V> {
        let mut merged = self.clone();
        for (key, value) in overrides.iter() {
            merged.insert(key, value.clone());
        }
        merged
    }
}

impl<V> FromIterator<(String, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = OrderedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if map.contains_key(&key) {
                        return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    map.entries.push((key, value));
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Soft limits attached to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "RawLimits")]
pub enum Limits {
    /// Inclusive `[min, max]` range.
    Range {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// Limit checking disabled.
    Off,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimits {
    Pair(f64, f64),
    Flag(String),
}

impl TryFrom<RawLimits> for Limits {
    type Error = String;

    fn try_from(raw: RawLimits) -> Result<Self, Self::Error> {
        match raw {
            RawLimits::Pair(min, max) if min <= max => Ok(Limits::Range { min, max }),
            RawLimits::Pair(min, max) => Err(format!(
                "lower limit {} exceeds upper limit {}",
                min, max
            )),
            RawLimits::Flag(flag) if flag == "off" => Ok(Limits::Off),
            RawLimits::Flag(flag) => Err(format!("unknown limits flag '{}'", flag)),
        }
    }
}

impl Limits {
    /// Check `value` against the limits (inclusive).
    pub fn check(&self, parameter: &str, value: f64) -> StationResult<()> {
        match *self {
            Limits::Range { min, max } if value < min || value > max || value.is_nan() => {
                Err(StationError::LimitViolation {
                    parameter: parameter.to_string(),
                    value,
                    min,
                    max,
                })
            }
            _ => Ok(()),
        }
    }

    /// Snapshot form: `[min, max]` or `"off"`.
    pub fn to_json(&self) -> Value {
        match *self {
            Limits::Range { min, max } => serde_json::json!([min, max]),
            Limits::Off => Value::String("off".into()),
        }
    }
}

// =============================================================================
// ParameterRule
// =============================================================================

/// Post-processing and renaming rule for one parameter.
///
/// Used both for `parameters` entries (reconfigure an existing parameter) and
/// `add_parameters` entries (derive a new one, `source` required).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterRule {
    /// Parameter a derived parameter delegates to (`add_parameters` only)
    pub source: Option<String>,
    /// Second name for the bound parameter
    pub alias: Option<String>,
    /// Label override
    pub label: Option<String>,
    /// Unit override
    pub unit: Option<String>,
    /// Multiplicative factor, `user = raw * scale + offset`
    pub scale: Option<f64>,
    /// Additive offset
    pub offset: Option<f64>,
    /// Seconds to wait after each completed set
    pub post_delay: Option<f64>,
    /// Minimum seconds between consecutive underlying writes
    pub inter_delay: Option<f64>,
    /// Largest change per underlying write
    pub step: Option<f64>,
    /// Soft limits checked before any write
    pub limits: Option<Limits>,
    /// Value written once at bind time
    pub initial_value: Option<Value>,
    /// Register with the station monitor list
    #[serde(default)]
    pub monitor: bool,
}

impl ParameterRule {
    /// True when the rule changes how values flow, so the parameter must be
    /// wrapped rather than used as-is.
    pub fn needs_wrapper(&self) -> bool {
        self.label.is_some()
            || self.unit.is_some()
            || self.scale.is_some()
            || self.offset.is_some()
            || self.post_delay.is_some()
            || self.inter_delay.is_some()
            || self.step.is_some()
            || self.limits.is_some()
    }

    /// `post_delay` as a duration.
    pub fn post_delay(&self) -> Option<Duration> {
        self.post_delay.map(Duration::from_secs_f64)
    }

    /// `inter_delay` as a duration.
    pub fn inter_delay(&self) -> Option<Duration> {
        self.inter_delay.map(Duration::from_secs_f64)
    }
}

// =============================================================================
// InstrumentSpec
// =============================================================================

/// One entry under `instruments`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentSpec {
    /// Dotted driver class path, or the name of an earlier instrument
    #[serde(rename = "type")]
    pub type_path: String,
    /// Deprecated module prefix joined to `type` with a `.`
    pub driver: Option<String>,
    /// Connection address
    pub address: Option<String>,
    /// Connection port
    pub port: Option<u16>,
    /// Close and replace an already registered instrument of the same name
    pub enable_forced_reconnect: Option<bool>,
    /// Driver keyword arguments
    #[serde(default)]
    pub init: Map<String, Value>,
    /// Rules for existing parameters
    #[serde(default)]
    pub parameters: OrderedMap<ParameterRule>,
    /// Rules deriving new parameters
    #[serde(default)]
    pub add_parameters: OrderedMap<ParameterRule>,
}

impl InstrumentSpec {
    /// Spec with just a type.
    pub fn new(type_path: impl Into<String>) -> Self {
        Self {
            type_path: type_path.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// ConfigDocument
// =============================================================================

/// A validated station document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    instruments: OrderedMap<InstrumentSpec>,
}

impl ConfigDocument {
    /// Validate `value` against the station schema and build the document.
    ///
    /// Every schema violation is reported at once in a `SchemaValidation`
    /// error; nothing is built from an invalid document.
    pub fn from_value(value: Value, validator: &SchemaValidator) -> StationResult<Self> {
        validator.validate(&value)?;
        serde_json::from_value(value).map_err(|e| StationError::Parse(e.to_string()))
    }

    /// Instruments in document order.
    pub fn instruments(&self) -> impl Iterator<Item = (&str, &InstrumentSpec)> {
        self.instruments.iter()
    }

    /// Look up one instrument spec.
    pub fn instrument(&self, name: &str) -> Option<&InstrumentSpec> {
        self.instruments.get(name)
    }

    /// Position of `name` in document order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.instruments.position(name)
    }

    /// Instrument names in document order.
    pub fn names(&self) -> Vec<&str> {
        self.instruments.keys().collect()
    }

    /// Number of instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True when the document lists no instruments.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordered_map_keeps_order() {
        let map: OrderedMap<i32> =
            serde_json::from_value(json!({"zeta": 1, "alpha": 2, "mid": 3})).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(map.position("alpha"), Some(1));
    }

    #[test]
    fn test_ordered_map_merge_overrides_in_place() {
        let base: OrderedMap<i32> = [("a".to_string(), 1), ("b".to_string(), 2)]
            .into_iter()
            .collect();
        let own: OrderedMap<i32> = [("b".to_string(), 20), ("c".to_string(), 30)]
            .into_iter()
            .collect();

        let merged = base.merged_with(&own);
        let entries: Vec<_> = merged.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        assert_eq!(
            entries,
            vec![("a".into(), 1), ("b".into(), 20), ("c".into(), 30)]
        );
    }

    #[test]
    fn test_limits_parse() {
        let range: Limits = serde_json::from_value(json!([0, 10])).unwrap();
        assert_eq!(range, Limits::Range { min: 0.0, max: 10.0 });

        let off: Limits = serde_json::from_value(json!("off")).unwrap();
        assert_eq!(off, Limits::Off);

        assert!(serde_json::from_value::<Limits>(json!([10, 0])).is_err());
        assert!(serde_json::from_value::<Limits>(json!("on")).is_err());
    }

    #[test]
    fn test_limits_check_inclusive() {
        let limits = Limits::Range { min: 0.0, max: 10.0 };
        assert!(limits.check("gate", 0.0).is_ok());
        assert!(limits.check("gate", 10.0).is_ok());
        assert!(matches!(
            limits.check("gate", 10.5),
            Err(StationError::LimitViolation { value, .. }) if value == 10.5
        ));
        assert!(Limits::Off.check("gate", 1e9).is_ok());
    }

    #[test]
    fn test_rule_needs_wrapper() {
        let plain = ParameterRule {
            alias: Some("gate".into()),
            monitor: true,
            ..Default::default()
        };
        assert!(!plain.needs_wrapper());

        let scaled = ParameterRule {
            scale: Some(2.0),
            ..Default::default()
        };
        assert!(scaled.needs_wrapper());
    }

    #[test]
    fn test_instrument_spec_fields() {
        let spec: InstrumentSpec = serde_json::from_value(json!({
            "type": "mock.dmm.MockDmm",
            "address": "GPIB0::22::INSTR",
            "enable_forced_reconnect": true,
            "init": {"reading": 1.0},
            "parameters": {"nplc": {"initial_value": 10, "monitor": true}},
            "add_parameters": {"gain_v": {"source": "voltage", "scale": 100}}
        }))
        .unwrap();

        assert_eq!(spec.type_path, "mock.dmm.MockDmm");
        assert_eq!(spec.enable_forced_reconnect, Some(true));
        assert_eq!(spec.init.get("reading"), Some(&json!(1.0)));
        assert!(spec.parameters.get("nplc").unwrap().monitor);
        assert_eq!(
            spec.add_parameters.get("gain_v").unwrap().source.as_deref(),
            Some("voltage")
        );
    }
}
