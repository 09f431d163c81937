//! Driver Factory and Instrument Contract
//!
//! This module provides the plugin API for driver classes the station can
//! instantiate. Drivers implement [`DriverFactory`] and are registered with the
//! station's driver catalog at startup under a dotted class path such as
//! `mock.dmm.MockDmm`. Documents refer to drivers by that path.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Composition Root (main.rs)                  │
//! │  catalog.register(Arc::new(MockDmmFactory));                    │
//! │  catalog.register(Arc::new(MockVoltageSourceFactory));          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DriverCatalog                            │
//! │  factories: class path -> Arc<dyn DriverFactory>                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Takes name/address/port/init, returns Arc<dyn Instrument>      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! use station_core::driver::{DriverFactory, Instrument, InstrumentInit};
//! use futures::future::BoxFuture;
//! use std::sync::Arc;
//!
//! pub struct Keithley2400Factory;
//!
//! impl DriverFactory for Keithley2400Factory {
//!     fn class_path(&self) -> &'static str { "keithley.k2400.Keithley2400" }
//!     fn name(&self) -> &'static str { "Keithley 2400 SourceMeter" }
//!     fn accepts_address(&self) -> bool { true }
//!
//!     fn validate(&self, init: &serde_json::Map<String, serde_json::Value>) -> anyhow::Result<()> {
//!         let _: K2400Config = serde_json::from_value(init.clone().into())?;
//!         Ok(())
//!     }
//!
//!     fn build(&self, init: InstrumentInit) -> BoxFuture<'static, anyhow::Result<Arc<dyn Instrument>>> {
//!         Box::pin(async move {
//!             let address = init.address.clone().ok_or_else(|| anyhow::anyhow!("address required"))?;
//!             let driver = Keithley2400::connect(&init.name, &address).await?;
//!             Ok(Arc::new(driver) as Arc<dyn Instrument>)
//!         })
//!     }
//! }
//! ```

use crate::parameter::ParameterSet;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;

/// Constructor arguments handed to a driver factory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentInit {
    /// Instrument name as registered in the station
    pub name: String,
    /// Connection address (only set when the factory accepts one)
    pub address: Option<String>,
    /// Connection port (only set when the factory accepts one)
    pub port: Option<u16>,
    /// Driver-specific keyword arguments
    pub init: Map<String, Value>,
}

impl InstrumentInit {
    /// Arguments with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The keyword arguments as a JSON object, for deserializing into a
    /// driver's config struct.
    pub fn init_value(&self) -> Value {
        Value::Object(self.init.clone())
    }
}

/// A live instrument driver.
///
/// Drivers own their connection and expose their settings and readings as a
/// [`ParameterSet`]. The station never talks to hardware except through those
/// parameters and [`Instrument::close`].
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Name the instrument was constructed with.
    fn name(&self) -> &str;

    /// Parameters exposed by the driver.
    fn parameters(&self) -> &ParameterSet;

    /// Release the connection. Called once, before the instrument is
    /// dropped from the station.
    async fn close(&self) -> Result<()>;

    /// Downcast support for callers that know the concrete driver type.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name())
            .field("parameters", self.parameters())
            .finish()
    }
}

/// Factory for constructing instruments from station documents.
///
/// Implementations are registered with a driver catalog and looked up by
/// [`DriverFactory::class_path`].
pub trait DriverFactory: Send + Sync + 'static {
    /// Dotted class path documents use in their `type` field
    /// (e.g. `"mock.dmm.MockDmm"`).
    fn class_path(&self) -> &'static str;

    /// Human-readable driver name
    fn name(&self) -> &'static str;

    /// Whether the constructor takes an `address` argument.
    fn accepts_address(&self) -> bool {
        false
    }

    /// Whether the constructor takes a `port` argument.
    fn accepts_port(&self) -> bool {
        false
    }

    /// Validate the `init` keyword arguments without connecting.
    fn validate(&self, init: &Map<String, Value>) -> Result<()>;

    /// Construct and connect the instrument.
    fn build(&self, init: InstrumentInit) -> BoxFuture<'static, Result<Arc<dyn Instrument>>>;
}

impl std::fmt::Debug for dyn DriverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverFactory")
            .field("class_path", &self.class_path())
            .field("name", &self.name())
            .finish()
    }
}
