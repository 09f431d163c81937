//! Mock multi-channel voltage source (DAC rack style).
//!
//! Each channel exposes `channels[n].voltage` and `channels[n].current_limit`
//! (channels are numbered from 1), and the rack has a global `output` switch.
//! Every voltage that reaches the simulated hardware is appended to a
//! [`WriteLog`], which is what tests use to observe ramping and settling
//! delays.

use crate::common::{ConnectionState, WriteLog};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use station_core::driver::{DriverFactory, Instrument, InstrumentInit};
use station_core::parameter::{Parameter, ParameterSet};
use std::any::Any;
use std::sync::Arc;
use tracing::info;

/// Maximum number of channels a rack can have.
pub const MAX_CHANNELS: usize = 16;

// =============================================================================
// MockVoltageSourceFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockVoltageSource driver
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockVoltageSourceConfig {
    /// Number of channels (default: 2)
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Hardware output limit in volts, applied symmetrically (default: 10.0)
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
}

fn default_channels() -> usize {
    2
}

fn default_max_voltage() -> f64 {
    10.0
}

impl Default for MockVoltageSourceConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_voltage: default_max_voltage(),
        }
    }
}

/// Factory for creating MockVoltageSource instances.
pub struct MockVoltageSourceFactory;

impl DriverFactory for MockVoltageSourceFactory {
    fn class_path(&self) -> &'static str {
        "mock.source.MockVoltageSource"
    }

    fn name(&self) -> &'static str {
        "Mock Voltage Source"
    }

    fn accepts_address(&self) -> bool {
        true
    }

    fn accepts_port(&self) -> bool {
        true
    }

    fn validate(&self, init: &Map<String, Value>) -> Result<()> {
        let cfg: MockVoltageSourceConfig = serde_json::from_value(Value::Object(init.clone()))?;

        if cfg.channels == 0 || cfg.channels > MAX_CHANNELS {
            return Err(anyhow!(
                "channels must be between 1 and {}, got {}",
                MAX_CHANNELS,
                cfg.channels
            ));
        }
        if cfg.max_voltage <= 0.0 {
            return Err(anyhow!("max_voltage must be positive"));
        }

        Ok(())
    }

    fn build(&self, init: InstrumentInit) -> BoxFuture<'static, Result<Arc<dyn Instrument>>> {
        Box::pin(async move {
            let cfg: MockVoltageSourceConfig = serde_json::from_value(init.init_value())?;
            let source = MockVoltageSource::new(init.name, init.address, init.port, cfg);
            info!(
                instrument = %source.name,
                channels = source.channels,
                "mock voltage source connected"
            );
            Ok(Arc::new(source) as Arc<dyn Instrument>)
        })
    }
}

// =============================================================================
// MockVoltageSource
// =============================================================================

/// Simulated voltage source rack.
pub struct MockVoltageSource {
    name: String,
    address: Option<String>,
    port: Option<u16>,
    channels: usize,
    params: ParameterSet,
    writes: WriteLog,
    state: ConnectionState,
}

impl MockVoltageSource {
    /// Create a connected source.
    pub fn new(
        name: impl Into<String>,
        address: Option<String>,
        port: Option<u16>,
        cfg: MockVoltageSourceConfig,
    ) -> Self {
        let state = ConnectionState::default();
        let writes = WriteLog::default();
        let mut params = ParameterSet::new();

        for channel in 1..=cfg.channels {
            let path = format!("channels[{}].voltage", channel);
            let mut voltage = Parameter::new(path.clone(), 0.0)
                .with_label(format!("Channel {} voltage", channel))
                .with_unit("V")
                .with_range(-cfg.max_voltage, cfg.max_voltage);
            let (log, conn) = (writes.clone(), state.clone());
            voltage.connect_to_hardware_write(move |value| {
                let (log, conn, path) = (log.clone(), conn.clone(), path.clone());
                Box::pin(async move {
                    conn.ensure_open(&path)?;
                    log.record(&path, value);
                    Ok(())
                })
            });
            params.register(voltage);

            let path = format!("channels[{}].current_limit", channel);
            let mut limit = Parameter::new(path.clone(), 0.01)
                .with_label(format!("Channel {} current limit", channel))
                .with_unit("A")
                .with_range(0.0, 0.1);
            let conn = state.clone();
            limit.connect_to_hardware_write(move |_| {
                let (conn, path) = (conn.clone(), path.clone());
                Box::pin(async move { conn.ensure_open(&path) })
            });
            params.register(limit);
        }

        let mut output = Parameter::new("output", false).with_label("Output enabled");
        let conn = state.clone();
        output.connect_to_hardware_write(move |_| {
            let conn = conn.clone();
            Box::pin(async move { conn.ensure_open("output") })
        });
        params.register(output);

        Self {
            name: name.into(),
            address,
            port,
            channels: cfg.channels,
            params,
            writes,
            state,
        }
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Address passed at construction.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Port passed at construction.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Hardware write log.
    pub fn writes(&self) -> &WriteLog {
        &self.writes
    }

    /// True once the driver has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

#[async_trait]
impl Instrument for MockVoltageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    async fn close(&self) -> Result<()> {
        self.state.close();
        info!(instrument = %self.name, "mock voltage source closed");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_parameters() {
        let source = MockVoltageSource::new("dac", None, None, MockVoltageSourceConfig::default());
        assert_eq!(
            source.parameters().names(),
            vec![
                "channels[1].current_limit",
                "channels[1].voltage",
                "channels[2].current_limit",
                "channels[2].voltage",
                "output",
            ]
        );
    }

    #[tokio::test]
    async fn test_voltage_writes_are_logged() {
        let source = MockVoltageSource::new("dac", None, None, MockVoltageSourceConfig::default());
        let ch1 = source.parameters().get("channels[1].voltage").unwrap();

        ch1.set_json(json!(1.5)).await.unwrap();
        ch1.set_json(json!(-2.0)).await.unwrap();
        assert_eq!(source.writes().values_for("channels[1].voltage"), vec![1.5, -2.0]);
        assert_eq!(ch1.get_json().await.unwrap(), json!(-2.0));
    }

    #[tokio::test]
    async fn test_hardware_range_is_enforced() {
        let source = MockVoltageSource::new(
            "dac",
            None,
            None,
            MockVoltageSourceConfig {
                channels: 1,
                max_voltage: 5.0,
            },
        );
        let ch1 = source.parameters().get("channels[1].voltage").unwrap();

        assert!(ch1.set_json(json!(6.0)).await.is_err());
        assert!(source.writes().entries().is_empty());
    }

    #[test]
    fn test_validate_channel_count() {
        let factory = MockVoltageSourceFactory;
        assert!(factory.validate(json!({"channels": 4}).as_object().unwrap()).is_ok());
        assert!(factory.validate(json!({"channels": 0}).as_object().unwrap()).is_err());
        assert!(factory.validate(json!({"channels": 17}).as_object().unwrap()).is_err());
        assert!(factory.validate(json!({"gain": 2}).as_object().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_build_keeps_connection_arguments() {
        let instrument = MockVoltageSourceFactory
            .build(InstrumentInit {
                name: "dac".into(),
                address: Some("10.0.0.5".into()),
                port: Some(5025),
                init: json!({"channels": 3}).as_object().cloned().unwrap(),
            })
            .await
            .unwrap();

        let source = instrument.as_any().downcast_ref::<MockVoltageSource>().unwrap();
        assert_eq!(source.channel_count(), 3);
        assert_eq!(source.address(), Some("10.0.0.5"));
        assert_eq!(source.port(), Some(5025));
    }

    #[tokio::test]
    async fn test_closed_source_refuses_writes() {
        let source = MockVoltageSource::new("dac", None, None, MockVoltageSourceConfig::default());
        source.close().await.unwrap();
        assert!(source.is_closed());

        let output = source.parameters().get("output").unwrap();
        assert!(output.set_json(json!(true)).await.is_err());
    }
}
