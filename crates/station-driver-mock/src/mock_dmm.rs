//! Mock digital multimeter.
//!
//! Exposes a read-only `voltage` reading plus the usual measurement settings
//! (`range`, `nplc`, `mode`). Readings come from a value tests can change with
//! [`MockDmm::set_reading`]. Setting `fail_connect` in the init arguments makes
//! construction fail the way an unreachable instrument would.
//!
//! # Example
//!
//! ```yaml
//! instruments:
//!   dmm:
//!     type: mock.dmm.MockDmm
//!     address: "GPIB0::22::INSTR"
//!     init:
//!       reading: 1.5
//! ```

use crate::common::ConnectionState;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use station_core::driver::{DriverFactory, Instrument, InstrumentInit};
use station_core::parameter::{Parameter, ParameterSet};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// MockDmmFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockDmm driver
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDmmConfig {
    /// Voltage returned by the `voltage` parameter (default: 0.0)
    #[serde(default)]
    pub reading: f64,

    /// Initial integration time in power line cycles (default: 1.0)
    #[serde(default = "default_nplc")]
    pub nplc: f64,

    /// Refuse to connect (default: false)
    #[serde(default)]
    pub fail_connect: bool,
}

fn default_nplc() -> f64 {
    1.0
}

impl Default for MockDmmConfig {
    fn default() -> Self {
        Self {
            reading: 0.0,
            nplc: default_nplc(),
            fail_connect: false,
        }
    }
}

/// Factory for creating MockDmm instances.
pub struct MockDmmFactory;

impl DriverFactory for MockDmmFactory {
    fn class_path(&self) -> &'static str {
        "mock.dmm.MockDmm"
    }

    fn name(&self) -> &'static str {
        "Mock Digital Multimeter"
    }

    fn accepts_address(&self) -> bool {
        true
    }

    fn validate(&self, init: &Map<String, Value>) -> Result<()> {
        let cfg: MockDmmConfig = serde_json::from_value(Value::Object(init.clone()))?;
        if !(0.01..=100.0).contains(&cfg.nplc) {
            return Err(anyhow!("nplc {} outside 0.01..=100", cfg.nplc));
        }
        Ok(())
    }

    fn build(&self, init: InstrumentInit) -> BoxFuture<'static, Result<Arc<dyn Instrument>>> {
        Box::pin(async move {
            let cfg: MockDmmConfig = serde_json::from_value(init.init_value())?;

            if cfg.fail_connect {
                return Err(anyhow!(
                    "connection to {} refused",
                    init.address.as_deref().unwrap_or("<no address>")
                ));
            }

            let dmm = MockDmm::new(init.name, init.address, cfg);
            info!(instrument = %dmm.name, "mock dmm connected");
            Ok(Arc::new(dmm) as Arc<dyn Instrument>)
        })
    }
}

// =============================================================================
// MockDmm
// =============================================================================

/// Simulated digital multimeter.
pub struct MockDmm {
    name: String,
    address: Option<String>,
    reading: Arc<Mutex<f64>>,
    mode: Parameter<String>,
    params: ParameterSet,
    state: ConnectionState,
}

impl MockDmm {
    /// Create a connected multimeter.
    pub fn new(name: impl Into<String>, address: Option<String>, cfg: MockDmmConfig) -> Self {
        let state = ConnectionState::default();
        let reading = Arc::new(Mutex::new(cfg.reading));
        let mut params = ParameterSet::new();

        let mut voltage = Parameter::new("voltage", cfg.reading)
            .with_label("Voltage")
            .with_unit("V")
            .read_only();
        let (shared, conn) = (reading.clone(), state.clone());
        voltage.connect_to_hardware_read(move || {
            let (shared, conn) = (shared.clone(), conn.clone());
            Box::pin(async move {
                conn.ensure_open("voltage")?;
                Ok(*shared.lock())
            })
        });
        params.register(voltage);

        let mut range = Parameter::new("range", 10.0)
            .with_label("Range")
            .with_unit("V")
            .with_range(0.1, 1000.0);
        let conn = state.clone();
        range.connect_to_hardware_write(move |value| {
            let conn = conn.clone();
            Box::pin(async move {
                conn.ensure_open("range")?;
                debug!(value, "dmm range set");
                Ok(())
            })
        });
        params.register(range);

        let mut nplc = Parameter::new("nplc", cfg.nplc)
            .with_label("Integration time")
            .with_unit("PLC")
            .with_range(0.01, 100.0);
        let conn = state.clone();
        nplc.connect_to_hardware_write(move |_| {
            let conn = conn.clone();
            Box::pin(async move { conn.ensure_open("nplc") })
        });
        params.register(nplc);

        let mode = Parameter::new("mode", "dc".to_string())
            .with_label("Mode")
            .with_choices(vec!["dc".to_string(), "ac".to_string()]);
        params.register(mode.clone());

        Self {
            name: name.into(),
            address,
            reading,
            mode,
            params,
            state,
        }
    }

    /// Change the value the `voltage` parameter reports.
    pub fn set_reading(&self, value: f64) {
        *self.reading.lock() = value;
    }

    /// Address passed at construction.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Current measurement mode.
    pub fn mode(&self) -> String {
        self.mode.get()
    }

    /// True once the driver has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.state.close_count()
    }
}

#[async_trait]
impl Instrument for MockDmm {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    async fn close(&self) -> Result<()> {
        self.state.close();
        info!(instrument = %self.name, "mock dmm closed");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
