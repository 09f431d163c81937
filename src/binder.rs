//! Parameter binding.
//!
//! Applies an instrument's `parameters` and `add_parameters` rules to its
//! parameter set, in three passes:
//!
//! 1. `parameters`: wrap existing parameters and register aliases
//! 2. `add_parameters`: create derived parameters over existing sources
//! 3. `initial_value`: set once, in rule order, after every rule is installed
//!
//! The driver's own parameter objects are never modified; wrapped and derived
//! parameters live only in the instrument's bound set.

use crate::config::document::{OrderedMap, ParameterRule};
use crate::configured::ConfiguredParameter;
use crate::station::ResolvedInstrument;
use station_core::error::{StationError, StationResult};
use station_core::parameter::ParameterBase;
use station_core::path;
use std::sync::Arc;
use tracing::debug;

/// A parameter registered for monitoring by an external poller.
#[derive(Clone)]
pub struct MonitoredParameter {
    /// Owning instrument
    pub instrument: String,
    /// Canonical parameter path within the instrument
    pub path: String,
    /// The bound parameter
    pub parameter: Arc<dyn ParameterBase>,
}

impl std::fmt::Debug for MonitoredParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredParameter")
            .field("instrument", &self.instrument)
            .field("path", &self.path)
            .finish()
    }
}

/// Bind `parameters` and `add_parameters` rules onto `instrument`.
///
/// Returns the parameters whose rule sets `monitor`. On error the instrument
/// keeps the rules applied so far.
pub async fn bind(
    instrument: &mut ResolvedInstrument,
    parameters: &OrderedMap<ParameterRule>,
    add_parameters: &OrderedMap<ParameterRule>,
) -> StationResult<Vec<MonitoredParameter>> {
    let mut bound: Vec<(String, &ParameterRule, Arc<dyn ParameterBase>)> =
        Vec::with_capacity(parameters.len() + add_parameters.len());

    for (raw_path, rule) in parameters.iter() {
        let key = path::canonical(raw_path)?;
        let existing = instrument
            .parameters()
            .get(&key)
            .ok_or_else(|| StationError::unknown_parameter(instrument.name(), &key))?;

        let parameter = if rule.needs_wrapper() {
            let wrapped: Arc<dyn ParameterBase> =
                Arc::new(ConfiguredParameter::new(key.clone(), existing, rule));
            instrument.parameters_mut().insert(key.clone(), wrapped.clone());
            debug!(instrument = %instrument.name(), parameter = %key, "wrapped parameter");
            wrapped
        } else {
            existing
        };

        register_alias(instrument, &key, rule, &parameter)?;
        bound.push((key, rule, parameter));
    }

    for (raw_path, rule) in add_parameters.iter() {
        let key = path::canonical(raw_path)?;
        if instrument.parameters().contains(&key) {
            return Err(StationError::DuplicateParameter {
                instrument: instrument.name().to_string(),
                parameter: key,
            });
        }

        let source_path = path::canonical(rule.source.as_deref().unwrap_or_default())?;
        let source = instrument
            .parameters()
            .get(&source_path)
            .ok_or_else(|| StationError::unknown_parameter(instrument.name(), &source_path))?;

        let derived: Arc<dyn ParameterBase> =
            Arc::new(ConfiguredParameter::new(key.clone(), source, rule));
        instrument.parameters_mut().insert(key.clone(), derived.clone());
        debug!(
            instrument = %instrument.name(),
            parameter = %key,
            source = %source_path,
            "added derived parameter"
        );

        register_alias(instrument, &key, rule, &derived)?;
        bound.push((key, rule, derived));
    }

    let mut monitored = Vec::new();
    for (key, rule, parameter) in bound {
        if let Some(value) = &rule.initial_value {
            debug!(instrument = %instrument.name(), parameter = %key, %value, "setting initial value");
            parameter.set_json(value.clone()).await?;
        }
        if rule.monitor {
            monitored.push(MonitoredParameter {
                instrument: instrument.name().to_string(),
                path: key,
                parameter,
            });
        }
    }

    Ok(monitored)
}

fn register_alias(
    instrument: &mut ResolvedInstrument,
    key: &str,
    rule: &ParameterRule,
    parameter: &Arc<dyn ParameterBase>,
) -> StationResult<()> {
    let Some(alias) = rule.alias.as_deref() else {
        return Ok(());
    };
    if instrument.parameters().contains(alias) {
        return Err(StationError::AliasConflict {
            instrument: instrument.name().to_string(),
            alias: alias.to_string(),
        });
    }
    instrument
        .parameters_mut()
        .insert(alias.to_string(), parameter.clone());
    instrument.record_alias(alias, key);
    debug!(instrument = %instrument.name(), %alias, parameter = %key, "registered alias");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::document::Limits;
    use serde_json::json;
    use station_core::driver::Instrument;
    use station_driver_mock::{MockDmm, MockDmmConfig, MockVoltageSource, MockVoltageSourceConfig};

    fn dac() -> (Arc<MockVoltageSource>, ResolvedInstrument) {
        let driver = Arc::new(MockVoltageSource::new(
            "dac",
            None,
            None,
            MockVoltageSourceConfig::default(),
        ));
        let resolved = ResolvedInstrument::new("dac", None, driver.clone() as Arc<dyn Instrument>);
        (driver, resolved)
    }

    fn rules(value: serde_json::Value) -> OrderedMap<ParameterRule> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_plain_alias_shares_driver_parameter() {
        let (driver, mut instrument) = dac();
        bind(
            &mut instrument,
            &rules(json!({"channels[1].voltage": {"alias": "gate"}})),
            &OrderedMap::new(),
        )
        .await
        .unwrap();

        let gate = instrument.parameters().get("gate").unwrap();
        gate.set_json(json!(1.5)).await.unwrap();
        assert_eq!(driver.writes().values_for("channels[1].voltage"), vec![1.5]);
        assert_eq!(instrument.alias_target("gate"), Some("channels[1].voltage"));
    }

    #[tokio::test]
    async fn test_wrapped_parameter_replaces_entry() {
        let (driver, mut instrument) = dac();
        bind(
            &mut instrument,
            &rules(json!({"channels[1].voltage": {"scale": 2, "alias": "gate"}})),
            &OrderedMap::new(),
        )
        .await
        .unwrap();

        let by_path = instrument.parameters().get("channels[1].voltage").unwrap();
        let by_alias = instrument.parameters().get("gate").unwrap();
        assert!(Arc::ptr_eq(&by_path, &by_alias));

        by_path.set_json(json!(4.0)).await.unwrap();
        assert_eq!(driver.writes().values_for("channels[1].voltage"), vec![2.0]);

        // the driver's own set is untouched
        let raw = driver.parameters().get("channels[1].voltage").unwrap();
        assert!(!Arc::ptr_eq(&raw, &by_path));
    }

    #[tokio::test]
    async fn test_unknown_parameter() {
        let (_, mut instrument) = dac();
        let err = bind(
            &mut instrument,
            &rules(json!({"channels[9].voltage": {"label": "nope"}})),
            &OrderedMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StationError::UnknownParameter { parameter, .. }
            if parameter == "channels[9].voltage"));
    }

    #[tokio::test]
    async fn test_alias_conflict() {
        let (_, mut instrument) = dac();
        let err = bind(
            &mut instrument,
            &rules(json!({"channels[1].voltage": {"alias": "output"}})),
            &OrderedMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StationError::AliasConflict { alias, .. } if alias == "output"));
    }

    #[tokio::test]
    async fn test_add_parameter_from_source() {
        let (driver, mut instrument) = dac();
        bind(
            &mut instrument,
            &OrderedMap::new(),
            &rules(json!({
                "gate_mv": {"source": "channels[2].voltage", "scale": 1000, "unit": "mV", "limits": [-500, 500]}
            })),
        )
        .await
        .unwrap();

        let gate = instrument.parameters().get("gate_mv").unwrap();
        assert_eq!(gate.metadata().unit.as_deref(), Some("mV"));

        gate.set_json(json!(250.0)).await.unwrap();
        assert_eq!(driver.writes().values_for("channels[2].voltage"), vec![0.25]);

        assert!(matches!(
            gate.set_json(json!(600.0)).await,
            Err(StationError::LimitViolation { .. })
        ));

        // limits belong to the derived parameter only
        let source = instrument.parameters().get("channels[2].voltage").unwrap();
        assert!(source.set_json(json!(9.0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_parameter_missing_source() {
        let (_, mut instrument) = dac();
        let err = bind(
            &mut instrument,
            &OrderedMap::new(),
            &rules(json!({"gate": {"source": "channels[1].nope"}})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StationError::UnknownParameter { parameter, .. }
            if parameter == "channels[1].nope"));
    }

    #[tokio::test]
    async fn test_add_parameter_duplicate_name() {
        let (_, mut instrument) = dac();
        let err = bind(
            &mut instrument,
            &OrderedMap::new(),
            &rules(json!({"output": {"source": "channels[1].voltage"}})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StationError::DuplicateParameter { parameter, .. }
            if parameter == "output"));
    }

    #[tokio::test]
    async fn test_add_parameter_sees_wrapped_source() {
        let (driver, mut instrument) = dac();
        bind(
            &mut instrument,
            &rules(json!({"channels[1].voltage": {"scale": 2}})),
            &rules(json!({"gate": {"source": "channels[1].voltage", "offset": 1}})),
        )
        .await
        .unwrap();

        // gate 5 -> wrapped 4 -> raw 2
        instrument
            .parameters()
            .get("gate")
            .unwrap()
            .set_json(json!(5.0))
            .await
            .unwrap();
        assert_eq!(driver.writes().values_for("channels[1].voltage"), vec![2.0]);
    }

    #[tokio::test]
    async fn test_initial_values_run_after_all_rules() {
        let (driver, mut instrument) = dac();
        bind(
            &mut instrument,
            &rules(json!({
                "channels[1].voltage": {"initial_value": 1.0},
                "channels[2].voltage": {"initial_value": 2.0}
            })),
            &rules(json!({"gate": {"source": "channels[1].voltage", "scale": 2, "initial_value": 6.0}})),
        )
        .await
        .unwrap();

        let writes: Vec<_> = driver
            .writes()
            .entries()
            .into_iter()
            .map(|w| (w.parameter, w.value))
            .collect();
        assert_eq!(
            writes,
            vec![
                ("channels[1].voltage".to_string(), 1.0),
                ("channels[2].voltage".to_string(), 2.0),
                ("channels[1].voltage".to_string(), 3.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_initial_value_honours_limits() {
        let (driver, mut instrument) = dac();
        let mut parameters = OrderedMap::new();
        parameters.insert(
            "channels[1].voltage",
            ParameterRule {
                limits: Some(Limits::Range { min: 0.0, max: 1.0 }),
                initial_value: Some(json!(5.0)),
                ..Default::default()
            },
        );

        let err = bind(&mut instrument, &parameters, &OrderedMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::LimitViolation { .. }));
        assert!(driver.writes().entries().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_flags() {
        let driver = Arc::new(MockDmm::new("dmm", None, MockDmmConfig::default()));
        let mut instrument = ResolvedInstrument::new("dmm", None, driver as Arc<dyn Instrument>);

        let monitored = bind(
            &mut instrument,
            &rules(json!({"voltage": {"monitor": true}, "nplc": {"monitor": false}})),
            &rules(json!({"v_mv": {"source": "voltage", "scale": 1000, "monitor": true}})),
        )
        .await
        .unwrap();

        let paths: Vec<_> = monitored.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["voltage", "v_mv"]);
        assert!(monitored.iter().all(|m| m.instrument == "dmm"));
    }
}
