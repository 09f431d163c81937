//! Parameters wrapped with station post-processing rules.
//!
//! A [`ConfiguredParameter`] sits in front of a driver parameter (its
//! *source*) and applies the rule a document attached to it:
//!
//! ```text
//! set(v)                                           get()
//!   │ limits check (inclusive, before any write)     ▲ user = raw * scale + offset
//!   │ ramp in steps of at most `step`                │
//!   │ space writes by `inter_delay`                  │
//!   ▼ raw = (v - offset) / scale                     │
//! source.set_json(raw) ───────────────────────── source.get_json()
//!   │
//!   ▼ sleep `post_delay`
//! ```
//!
//! Scale and offset apply element-wise to numeric arrays. Writes through one
//! wrapper are serialised, so concurrent callers never interleave ramps.

use crate::config::document::{Limits, ParameterRule};
use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use station_core::error::{StationError, StationResult};
use station_core::parameter::{ParameterBase, ParameterMetadata};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// A source parameter with label, unit, scaling, limits, ramping and
/// settling delays applied.
pub struct ConfiguredParameter {
    name: String,
    source: Arc<dyn ParameterBase>,
    label: Option<String>,
    unit: Option<String>,
    scale: Option<f64>,
    offset: Option<f64>,
    limits: Option<Limits>,
    step: Option<f64>,
    post_delay: Option<Duration>,
    inter_delay: Option<Duration>,
    last_write: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ConfiguredParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredParameter")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("scale", &self.scale)
            .field("offset", &self.offset)
            .field("limits", &self.limits)
            .field("step", &self.step)
            .finish()
    }
}

impl ConfiguredParameter {
    /// Wrap `source` under `name` with the processing fields of `rule`.
    ///
    /// `alias`, `initial_value`, `monitor` and `source` are binder concerns
    /// and are ignored here.
    pub fn new(name: impl Into<String>, source: Arc<dyn ParameterBase>, rule: &ParameterRule) -> Self {
        Self {
            name: name.into(),
            source,
            label: rule.label.clone(),
            unit: rule.unit.clone(),
            scale: rule.scale,
            offset: rule.offset,
            limits: rule.limits,
            step: rule.step,
            post_delay: rule.post_delay(),
            inter_delay: rule.inter_delay(),
            last_write: Mutex::new(None),
        }
    }

    /// The wrapped parameter.
    pub fn source(&self) -> &Arc<dyn ParameterBase> {
        &self.source
    }

    fn transforms(&self) -> bool {
        self.scale.is_some() || self.offset.is_some()
    }

    fn to_user(&self, raw: f64) -> f64 {
        raw * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0)
    }

    fn to_raw(&self, user: f64) -> f64 {
        (user - self.offset.unwrap_or(0.0)) / self.scale.unwrap_or(1.0)
    }

    /// Apply `f` to every number in `value` (scalars and nested arrays).
    fn map_numbers(&self, value: &Value, f: &dyn Fn(f64) -> f64) -> StationResult<Value> {
        match value {
            Value::Number(n) => {
                let x = n.as_f64().ok_or_else(|| {
                    StationError::invalid_value(self.name.clone(), format!("{} is not finite", n))
                })?;
                number(&self.name, f(x))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.map_numbers(item, f))
                .collect::<StationResult<Vec<_>>>()
                .map(Value::Array),
            other => Err(StationError::invalid_value(
                self.name.clone(),
                format!("scale/offset need a numeric value, got {}", other),
            )),
        }
    }

    /// Check every number in `value` against the limits.
    fn check_limits(&self, value: &Value) -> StationResult<()> {
        let Some(limits) = self.limits else {
            return Ok(());
        };
        if limits == Limits::Off {
            return Ok(());
        }
        match value {
            Value::Number(n) => limits.check(&self.name, n.as_f64().unwrap_or(f64::NAN)),
            Value::Array(items) => items.iter().try_for_each(|item| self.check_limits(item)),
            other => Err(StationError::invalid_value(
                self.name.clone(),
                format!("limits need a numeric value, got {}", other),
            )),
        }
    }

    fn check_point(&self, x: f64) -> StationResult<()> {
        match self.limits {
            Some(limits) => limits.check(&self.name, x),
            None => Ok(()),
        }
    }

    /// The ramp from the current value to `target`, or `None` when the write
    /// is a single set (no `step`, or a non-numeric target).
    async fn ramp(&self, target: &Value) -> StationResult<Option<Ramp>> {
        let (Some(step), Some(end)) = (self.step, target.as_f64()) else {
            return Ok(None);
        };

        let current = self.get_json().await?;
        let start = current.as_f64().ok_or_else(|| {
            StationError::invalid_value(
                self.name.clone(),
                format!("cannot ramp from non-numeric value {}", current),
            )
        })?;

        Ok(Some(ramp_points(start, end, step)))
    }

    /// Write one user value, honouring `inter_delay`.
    async fn write(&self, last_write: &mut Option<Instant>, user: Value) -> StationResult<()> {
        if let (Some(delay), Some(previous)) = (self.inter_delay, *last_write) {
            tokio::time::sleep_until(previous + delay).await;
        }

        let raw = if self.transforms() {
            self.map_numbers(&user, &|v| self.to_raw(v))?
        } else {
            user
        };
        let raw = integral_numbers(raw);
        trace!(parameter = %self.name, raw = %raw, "writing source");
        let result = self.source.set_json(raw).await;
        *last_write = Some(Instant::now());
        result
    }
}

#[async_trait]
impl ParameterBase for ConfiguredParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> ParameterMetadata {
        let source = self.source.metadata();
        ParameterMetadata {
            label: self.label.clone().or(source.label),
            unit: self.unit.clone().or(source.unit),
            description: source.description,
            read_only: source.read_only,
        }
    }

    async fn get_json(&self) -> StationResult<Value> {
        let raw = self.source.get_json().await?;
        if self.transforms() {
            self.map_numbers(&raw, &|v| self.to_user(v))
        } else {
            Ok(raw)
        }
    }

    async fn set_json(&self, value: Value) -> StationResult<()> {
        let mut last_write = self.last_write.lock().await;

        self.check_limits(&value)?;
        match self.ramp(&value).await? {
            None => self.write(&mut last_write, value).await?,
            Some(ramp) => {
                // No step may leave the limits, even when the start already has.
                let mut checked = ramp;
                checked.try_for_each(|x| self.check_point(x))?;

                let mut points = ramp.peekable();
                while let Some(x) = points.next() {
                    // Land exactly on the requested value, not a float recomputation of it.
                    let point = if points.peek().is_none() {
                        value.clone()
                    } else {
                        number(&self.name, x)?
                    };
                    self.write(&mut last_write, point).await?;
                }
            }
        }

        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn describe(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("source".into(), Value::String(self.source.name().to_string()));
        if let Some(scale) = self.scale {
            fields.insert("scale".into(), serde_json::json!(scale));
        }
        if let Some(offset) = self.offset {
            fields.insert("offset".into(), serde_json::json!(offset));
        }
        if let Some(limits) = self.limits {
            fields.insert("limits".into(), limits.to_json());
        }
        if let Some(step) = self.step {
            fields.insert("step".into(), serde_json::json!(step));
        }
        if let Some(delay) = self.inter_delay {
            fields.insert("inter_delay".into(), serde_json::json!(delay.as_secs_f64()));
        }
        if let Some(delay) = self.post_delay {
            fields.insert("post_delay".into(), serde_json::json!(delay.as_secs_f64()));
        }
        fields
    }
}

/// Intermediate and final points of a ramp, produced on demand.
#[derive(Debug, Clone, Copy)]
struct Ramp {
    start: f64,
    end: f64,
    increment: f64,
    count: u64,
    emitted: u64,
}

impl Iterator for Ramp {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.emitted >= self.count {
            return None;
        }
        self.emitted += 1;
        if self.emitted == self.count {
            Some(self.end)
        } else {
            Some(self.start + self.increment * self.emitted as f64)
        }
    }
}

/// Ramp from `start` to `end` with increments of at most `step`. `start`
/// itself is not included; `end` always is.
fn ramp_points(start: f64, end: f64, step: f64) -> Ramp {
    let distance = end - start;
    let count = if distance.abs() <= step {
        1
    } else {
        (distance.abs() / step).ceil() as u64
    };
    Ramp {
        start,
        end,
        increment: step * distance.signum(),
        count,
        emitted: 0,
    }
}

fn number(parameter: &str, x: f64) -> StationResult<Value> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or_else(|| StationError::invalid_value(parameter, format!("{} is not finite", x)))
}

/// Largest magnitude below which every integer is exact in an `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Write whole-valued floats as JSON integers so integer-typed sources
/// accept computed values. Float sources read integers unchanged.
fn integral_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(x) if n.is_f64() && x.fract() == 0.0 && x.abs() <= MAX_EXACT_INTEGER => {
                Value::from(x as i64)
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(integral_numbers).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use station_core::parameter::Parameter;
    use station_driver_mock::{MockVoltageSource, MockVoltageSourceConfig};
    use station_core::driver::Instrument;

    fn source() -> MockVoltageSource {
        MockVoltageSource::new("dac", None, None, MockVoltageSourceConfig::default())
    }

    fn wrap(source: &MockVoltageSource, rule: ParameterRule) -> ConfiguredParameter {
        let raw = source.parameters().get("channels[1].voltage").unwrap();
        ConfiguredParameter::new("channels[1].voltage", raw, &rule)
    }

    #[test]
    fn test_ramp_points() {
        let points = |start, end, step| ramp_points(start, end, step).collect::<Vec<f64>>();
        assert_eq!(points(0.0, 3.0, 1.0), vec![1.0, 2.0, 3.0]);
        assert_eq!(points(3.0, 0.0, 1.0), vec![2.0, 1.0, 0.0]);
        assert_eq!(points(0.0, 0.5, 1.0), vec![0.5]);
        assert_eq!(points(0.0, 2.5, 1.0), vec![1.0, 2.0, 2.5]);
        assert_eq!(points(1.0, 1.0, 0.1), vec![1.0]);

        let mut fine = ramp_points(0.0, 1.0, 1e-9);
        assert_eq!(fine.next(), Some(1e-9));
        assert_eq!(fine.last(), Some(1.0));
    }

    /// A plain parameter that records every value written to it.
    fn recorded<T>(
        name: &str,
        initial: T,
    ) -> (Arc<dyn ParameterBase>, Arc<std::sync::Mutex<Vec<T>>>)
    where
        T: Clone
            + Send
            + Sync
            + PartialEq
            + std::fmt::Debug
            + serde::Serialize
            + serde::de::DeserializeOwned
            + 'static,
    {
        let writes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut param = Parameter::new(name, initial);
        let log = writes.clone();
        param.connect_to_hardware_write(move |value| {
            log.lock().unwrap().push(value);
            Box::pin(async { Ok(()) })
        });
        (Arc::new(param), writes)
    }

    #[tokio::test]
    async fn test_ramp_from_outside_limits_writes_nothing() {
        let (raw, writes) = recorded("bias", -5.0);
        let param = ConfiguredParameter::new(
            "bias",
            raw,
            &ParameterRule {
                step: Some(1.0),
                limits: Some(Limits::Range { min: 0.0, max: 10.0 }),
                ..Default::default()
            },
        );

        let err = param.set_json(json!(3.0)).await.unwrap_err();
        assert!(matches!(err, StationError::LimitViolation { value, .. } if value == -4.0));
        assert!(writes.lock().unwrap().is_empty());

        // A single step back inside the limits is allowed.
        let (raw, writes) = recorded("bias", -0.5);
        let param = ConfiguredParameter::new(
            "bias",
            raw,
            &ParameterRule {
                step: Some(1.0),
                limits: Some(Limits::Range { min: 0.0, max: 10.0 }),
                ..Default::default()
            },
        );
        param.set_json(json!(0.25)).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), vec![0.25]);
    }

    #[tokio::test]
    async fn test_integer_source_accepts_ramp_points() {
        let (raw, writes) = recorded("count", 0i64);
        let param = ConfiguredParameter::new(
            "count",
            raw,
            &ParameterRule {
                step: Some(1.0),
                ..Default::default()
            },
        );

        param.set_json(json!(3)).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_integer_source_accepts_scaled_values() {
        let (raw, writes) = recorded("count", 0i64);
        let param = ConfiguredParameter::new(
            "count",
            raw,
            &ParameterRule {
                scale: Some(2.0),
                offset: Some(1.0),
                ..Default::default()
            },
        );

        param.set_json(json!(5)).await.unwrap();
        assert_eq!(*writes.lock().unwrap(), vec![2]);
        assert_eq!(param.get_json().await.unwrap(), json!(5.0));

        // A fractional raw value still cannot reach an integer source.
        let err = param.set_json(json!(6)).await.unwrap_err();
        assert!(matches!(err, StationError::InvalidValue { .. }));
    }

    #[test]
    fn test_integral_numbers() {
        assert_eq!(integral_numbers(json!(2.0)), json!(2));
        assert_eq!(integral_numbers(json!(-3.0)), json!(-3));
        assert_eq!(integral_numbers(json!(2.5)), json!(2.5));
        assert_eq!(integral_numbers(json!([1.0, 1.5])), json!([1, 1.5]));
        assert_eq!(integral_numbers(json!(1e300)), json!(1e300));
    }

    #[tokio::test]
    async fn test_scale_and_offset() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                scale: Some(2.0),
                offset: Some(1.0),
                ..Default::default()
            },
        );

        param.set_json(json!(5.0)).await.unwrap();
        assert_eq!(dac.writes().values_for("channels[1].voltage"), vec![2.0]);
        assert_eq!(param.get_json().await.unwrap(), json!(5.0));
    }

    #[tokio::test]
    async fn test_limits_checked_before_write() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                limits: Some(Limits::Range { min: 0.0, max: 10.0 }),
                scale: Some(2.0),
                ..Default::default()
            },
        );

        let err = param.set_json(json!(11.0)).await.unwrap_err();
        assert!(matches!(err, StationError::LimitViolation { value, min, max, .. }
            if value == 11.0 && min == 0.0 && max == 10.0));
        assert!(dac.writes().entries().is_empty());

        param.set_json(json!(10.0)).await.unwrap();
        assert_eq!(dac.writes().values_for("channels[1].voltage"), vec![5.0]);
    }

    #[tokio::test]
    async fn test_limits_off() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                limits: Some(Limits::Off),
                ..Default::default()
            },
        );
        param.set_json(json!(9.5)).await.unwrap();
        assert_eq!(param.describe().get("limits"), Some(&json!("off")));
    }

    #[tokio::test]
    async fn test_step_ramps_in_exact_increments() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                step: Some(1.0),
                ..Default::default()
            },
        );

        param.set_json(json!(3.0)).await.unwrap();
        assert_eq!(
            dac.writes().values_for("channels[1].voltage"),
            vec![1.0, 2.0, 3.0]
        );

        dac.writes().clear();
        param.set_json(json!(2.5)).await.unwrap();
        assert_eq!(dac.writes().values_for("channels[1].voltage"), vec![2.5]);
    }

    #[tokio::test]
    async fn test_step_works_in_user_units() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                step: Some(2.0),
                scale: Some(2.0),
                ..Default::default()
            },
        );

        // user 0 -> 6 in steps of 2 user units = raw 1, 2, 3
        param.set_json(json!(6.0)).await.unwrap();
        assert_eq!(
            dac.writes().values_for("channels[1].voltage"),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[tokio::test]
    async fn test_inter_delay_spaces_writes() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                step: Some(1.0),
                inter_delay: Some(0.02),
                ..Default::default()
            },
        );

        param.set_json(json!(3.0)).await.unwrap();
        let writes = dac.writes().entries();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn test_post_delay_waits_after_set() {
        let dac = source();
        let param = wrap(
            &dac,
            ParameterRule {
                post_delay: Some(0.03),
                ..Default::default()
            },
        );

        let started = Instant::now();
        param.set_json(json!(1.0)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_arrays_scale_elementwise() {
        let mut raw = Parameter::new("trace", vec![1.0, 2.0]);
        raw.connect_to_hardware_read(|| Box::pin(async { Ok(vec![1.0, 2.0, 3.0]) }));
        let raw: Arc<dyn ParameterBase> = Arc::new(raw);

        let param = ConfiguredParameter::new(
            "trace",
            raw,
            &ParameterRule {
                scale: Some(10.0),
                offset: Some(1.0),
                ..Default::default()
            },
        );
        assert_eq!(param.get_json().await.unwrap(), json!([11.0, 21.0, 31.0]));
    }

    #[tokio::test]
    async fn test_non_numeric_with_scale_is_invalid() {
        let raw: Arc<dyn ParameterBase> = Arc::new(Parameter::new("mode", "dc".to_string()));
        let param = ConfiguredParameter::new(
            "mode",
            raw,
            &ParameterRule {
                scale: Some(2.0),
                ..Default::default()
            },
        );
        assert!(matches!(
            param.get_json().await,
            Err(StationError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_label_only_passes_values_through() {
        let raw: Arc<dyn ParameterBase> = Arc::new(Parameter::new("mode", "dc".to_string()));
        let param = ConfiguredParameter::new(
            "mode",
            raw,
            &ParameterRule {
                label: Some("Coupling".into()),
                ..Default::default()
            },
        );
        param.set_json(json!("ac")).await.unwrap();
        assert_eq!(param.get_json().await.unwrap(), json!("ac"));
        assert_eq!(param.metadata().label.as_deref(), Some("Coupling"));
    }

    #[test]
    fn test_metadata_inherits_from_source() {
        let dac = source();
        let param = wrap(&dac, ParameterRule::default());
        let meta = param.metadata();
        assert_eq!(meta.unit.as_deref(), Some("V"));
        assert_eq!(meta.label.as_deref(), Some("Channel 1 voltage"));
        assert_eq!(param.describe().get("source"), Some(&json!("channels[1].voltage")));
    }
}
