//! # Rust Station
//!
//! Turns a declarative station document into live, configured instruments.
//! A station document lists instruments by name; each names a driver class
//! (or an earlier instrument to inherit from), connection details, driver
//! arguments and per-parameter rules (aliases, scaling, limits, ramping,
//! settling delays, initial values).
//!
//! ## Crate Structure
//!
//! - **`config`**: document model, schema validation and YAML/JSON loading.
//! - **`resolver`**: the `DriverCatalog` of driver factories and the
//!   `TypeResolver` that maps an instrument's `type` to a factory.
//! - **`instantiator`**: builds drivers and handles name clashes and forced
//!   reconnects.
//! - **`configured`**: `ConfiguredParameter`, the wrapper that applies
//!   scale/offset/limits/step/delay rules.
//! - **`binder`**: applies `parameters` and `add_parameters` rules to a
//!   loaded instrument.
//! - **`station`**: the `Station` registry and its snapshot.
//! - **`settings`**: station-wide settings (Figment).
//! - **`logging`**: `tracing-subscriber` setup for the binary.
//!
//! Driver-facing types (`Instrument`, `DriverFactory`, `Parameter<T>`) and
//! the error type live in the `station-core` crate and are re-exported here.
//!
//! ## Example
//! ```no_run
//! use rust_station::{config, DriverCatalog, Station};
//!
//! # async fn run() -> Result<(), rust_station::StationError> {
//! let mut catalog = DriverCatalog::new();
//! station_driver_mock::register_all(&mut catalog);
//!
//! let document = config::load_document_file("station.yaml")?;
//! let mut station = Station::from_document(catalog, document).await?;
//!
//! let gate = station.parameter("dac", "gate")?;
//! gate.set_json(serde_json::json!(0.5)).await?;
//!
//! station.close_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod config;
pub mod configured;
pub mod instantiator;
pub mod logging;
pub mod resolver;
pub mod settings;
pub mod station;

pub use binder::MonitoredParameter;
pub use config::{ConfigDocument, SchemaValidator};
pub use configured::ConfiguredParameter;
pub use instantiator::DriverInstantiator;
pub use resolver::{ClassLookupError, DriverCatalog, ResolvedSpec, TypeResolver};
pub use settings::StationSettings;
pub use station::{ResolvedInstrument, Station};
pub use station_core::{
    DriverFactory, Instrument, InstrumentInit, Parameter, ParameterBase, ParameterSet,
    StationError, StationResult,
};
