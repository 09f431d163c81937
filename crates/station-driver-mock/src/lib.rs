//! Mock Instrument Drivers for rust-station
//!
//! This crate provides simulated instruments for running and testing station
//! documents without physical hardware.
//!
//! # Available Mock Drivers
//!
//! | Class path | Driver | Accepts |
//! |------------|--------|---------|
//! | `mock.dmm.MockDmm` | [`MockDmm`] | `address` |
//! | `mock.source.MockVoltageSource` | [`MockVoltageSource`] | `address`, `port` |
//!
//! # Driver Factory Pattern
//!
//! Each mock driver provides a `DriverFactory` implementation:
//!
//! ```rust,ignore
//! use station_driver_mock::register_all;
//! use rust_station::DriverCatalog;
//!
//! let mut catalog = DriverCatalog::new();
//! register_all(&mut catalog);
//! ```

pub mod common;
mod mock_dmm;
mod mock_voltage_source;

pub use common::{ConnectionState, WriteLog, WriteRecord};
pub use mock_dmm::{MockDmm, MockDmmConfig, MockDmmFactory};
pub use mock_voltage_source::{
    MockVoltageSource, MockVoltageSourceConfig, MockVoltageSourceFactory, MAX_CHANNELS,
};

use station_core::driver::DriverFactory;
use std::sync::Arc;

/// Register all mock driver factories with a driver registry.
pub fn register_all(registry: &mut impl FactoryRegistry) {
    registry.register_factory(Arc::new(MockDmmFactory));
    registry.register_factory(Arc::new(MockVoltageSourceFactory));
}

/// Trait for registries that can accept driver factories.
///
/// This allows the mock driver crate to work with any registry implementation
/// without depending on the station crate directly.
pub trait FactoryRegistry {
    /// Register a driver factory.
    fn register_factory(&mut self, factory: Arc<dyn DriverFactory>);
}
