//! # station-core
//!
//! Core types shared by the station engine and driver crates:
//!
//! - [`error`]: the `StationError` taxonomy and `StationResult` alias
//! - [`path`]: parameter path parsing (`channels[1].voltage`)
//! - [`parameter`]: `Parameter<T>`, the `ParameterBase` trait and `ParameterSet`
//! - [`driver`]: the `DriverFactory` / `Instrument` capability contract

pub mod driver;
pub mod error;
pub mod parameter;
pub mod path;

pub use driver::{DriverFactory, Instrument, InstrumentInit};
pub use error::{StationError, StationResult, ValidationViolations, Violation};
pub use parameter::{Parameter, ParameterBase, ParameterMetadata, ParameterSet};
pub use path::ParameterPath;
