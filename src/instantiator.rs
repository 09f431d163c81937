//! Driver instantiation.
//!
//! Turns a [`ResolvedSpec`] into a live driver registered with the station.
//! Name clashes are handled here: an instrument that is already registered
//! is an error unless forced reconnect is enabled, in which case the old
//! instance is closed and removed before the new one is built.

use crate::resolver::ResolvedSpec;
use crate::station::{ResolvedInstrument, Station};
use serde_json::{Map, Value};
use station_core::driver::{Instrument, InstrumentInit};
use station_core::error::{StationError, StationResult};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Builds drivers from resolved specs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverInstantiator {
    default_forced_reconnect: bool,
}

impl DriverInstantiator {
    /// Create an instantiator. `default_forced_reconnect` applies to specs
    /// that do not set `enable_forced_reconnect` themselves.
    pub fn new(default_forced_reconnect: bool) -> Self {
        Self {
            default_forced_reconnect,
        }
    }

    /// Build the driver for `resolved` and register it with `station`.
    ///
    /// `overrides` are merged over the spec's `init` arguments. The instrument
    /// is registered as soon as it is built; parameter binding happens after.
    #[instrument(skip_all, fields(instrument = %resolved.name, class = %resolved.class.class_path))]
    pub async fn instantiate(
        &self,
        station: &mut Station,
        resolved: &ResolvedSpec,
        overrides: &Map<String, Value>,
    ) -> StationResult<Arc<dyn Instrument>> {
        let name = resolved.name.as_str();

        if station.contains(name) {
            let forced = resolved
                .enable_forced_reconnect
                .unwrap_or(self.default_forced_reconnect);
            if !forced {
                return Err(StationError::DuplicateInstrument(name.to_string()));
            }
            info!("forced reconnect: closing existing instance");
            station.remove(name).await?;
        }

        let init = self.init_for(resolved, overrides);
        let factory = &resolved.class.factory;

        factory
            .validate(&init.init)
            .map_err(|source| StationError::Instantiation {
                instrument: name.to_string(),
                source,
            })?;
        let driver = factory
            .build(init)
            .await
            .map_err(|source| StationError::Instantiation {
                instrument: name.to_string(),
                source,
            })?;

        info!(parameters = driver.parameters().len(), "instrument connected");
        station.add(ResolvedInstrument::new(
            name,
            Some(resolved.class.class_path.clone()),
            driver.clone(),
        ))?;
        Ok(driver)
    }

    fn init_for(&self, resolved: &ResolvedSpec, overrides: &Map<String, Value>) -> InstrumentInit {
        let factory = &resolved.class.factory;
        let mut init = InstrumentInit::new(resolved.name.clone());

        match &resolved.address {
            Some(address) if factory.accepts_address() => init.address = Some(address.clone()),
            Some(address) => warn!(%address, "driver takes no address; ignoring it"),
            None => {}
        }
        match resolved.port {
            Some(port) if factory.accepts_port() => init.port = Some(port),
            Some(port) => warn!(port, "driver takes no port; ignoring it"),
            None => {}
        }

        init.init = resolved.init.clone();
        for (key, value) in overrides {
            init.init.insert(key.clone(), value.clone());
        }
        init
    }
}
