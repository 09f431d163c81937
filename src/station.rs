//! Station registry.
//!
//! The [`Station`] owns every instrument loaded from a station document,
//! keyed by name in registration order. It is an ordinary value: create one,
//! pass it by reference, drop it (after [`Station::close_all`]) when done.
//!
//! Loading one instrument runs the whole pipeline:
//!
//! ```text
//! ConfigDocument ─► TypeResolver ─► DriverInstantiator ─► bind() ─► registry
//! ```
//!
//! Failures stop the pipeline for that instrument. Instruments loaded earlier
//! stay registered.

use crate::binder::{self, MonitoredParameter};
use crate::config::document::ConfigDocument;
use crate::instantiator::DriverInstantiator;
use crate::resolver::{DriverCatalog, TypeResolver};
use crate::settings::StationSettings;
use serde_json::{Map, Value};
use station_core::driver::Instrument;
use station_core::error::{StationError, StationResult};
use station_core::parameter::{ParameterBase, ParameterSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

// =============================================================================
// ResolvedInstrument
// =============================================================================

/// A live driver plus its bound parameter set.
pub struct ResolvedInstrument {
    name: String,
    class_path: Option<String>,
    driver: Arc<dyn Instrument>,
    parameters: ParameterSet,
    aliases: BTreeMap<String, String>,
}

impl std::fmt::Debug for ResolvedInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedInstrument")
            .field("name", &self.name)
            .field("class_path", &self.class_path)
            .field("parameters", &self.parameters)
            .finish()
    }
}

impl ResolvedInstrument {
    /// Wrap a driver. The bound set starts as a copy of the driver's own
    /// parameters (sharing the parameter objects).
    pub fn new(
        name: impl Into<String>,
        class_path: Option<String>,
        driver: Arc<dyn Instrument>,
    ) -> Self {
        let parameters = driver.parameters().clone();
        Self {
            name: name.into(),
            class_path,
            driver,
            parameters,
            aliases: BTreeMap::new(),
        }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver class path, when the instrument was loaded from a document.
    pub fn class_path(&self) -> Option<&str> {
        self.class_path.as_deref()
    }

    /// The driver instance.
    pub fn driver(&self) -> &Arc<dyn Instrument> {
        &self.driver
    }

    /// Bound parameters: driver parameters, wrappers, derived parameters and
    /// aliases.
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// Mutable access to the bound parameters.
    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    /// The path an alias points at.
    pub fn alias_target(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub(crate) fn record_alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    async fn snapshot(&self, update: bool) -> Value {
        let mut parameters = Map::new();
        for (path, parameter) in self.parameters.iter() {
            let entry = match self.alias_target(path) {
                Some(target) => serde_json::json!({ "alias_of": target }),
                None => parameter_snapshot(&self.name, path, parameter.as_ref(), update).await,
            };
            parameters.insert(path.to_string(), entry);
        }

        let mut fields = Map::new();
        fields.insert(
            "class".into(),
            self.class_path.clone().map(Value::String).unwrap_or(Value::Null),
        );
        fields.insert("parameters".into(), Value::Object(parameters));
        Value::Object(fields)
    }
}

async fn parameter_snapshot(
    instrument: &str,
    path: &str,
    parameter: &dyn ParameterBase,
    update: bool,
) -> Value {
    let metadata = parameter.metadata();
    let mut fields = Map::new();
    if let Some(label) = metadata.label {
        fields.insert("label".into(), Value::String(label));
    }
    if let Some(unit) = metadata.unit {
        fields.insert("unit".into(), Value::String(unit));
    }
    if metadata.read_only {
        fields.insert("read_only".into(), Value::Bool(true));
    }
    fields.extend(parameter.describe());

    if update {
        let value = match parameter.get_json().await {
            Ok(value) => value,
            Err(e) => {
                warn!(%instrument, parameter = %path, error = %e, "snapshot read failed");
                Value::Null
            }
        };
        fields.insert("value".into(), value);
    }
    Value::Object(fields)
}

// =============================================================================
// Station
// =============================================================================

/// The set of loaded instruments for one measurement setup.
#[derive(Debug, Default)]
pub struct Station {
    catalog: DriverCatalog,
    settings: StationSettings,
    document: Option<ConfigDocument>,
    instruments: Vec<ResolvedInstrument>,
    monitors: Vec<MonitoredParameter>,
}

impl Station {
    /// Empty station using `catalog` and default settings.
    pub fn new(catalog: DriverCatalog) -> Self {
        Self::with_settings(catalog, StationSettings::default())
    }

    /// Empty station using `catalog` and `settings`.
    pub fn with_settings(catalog: DriverCatalog, settings: StationSettings) -> Self {
        Self {
            catalog,
            settings,
            document: None,
            instruments: Vec::new(),
            monitors: Vec::new(),
        }
    }

    /// Create a station and load every instrument of `document`.
    pub async fn from_document(
        catalog: DriverCatalog,
        document: ConfigDocument,
    ) -> StationResult<Self> {
        let mut station = Self::new(catalog);
        station.load_config(document);
        station.load_all().await?;
        Ok(station)
    }

    /// The driver catalog.
    pub fn catalog(&self) -> &DriverCatalog {
        &self.catalog
    }

    /// Station settings.
    pub fn settings(&self) -> &StationSettings {
        &self.settings
    }

    /// The document instruments are loaded from, if one was set.
    pub fn document(&self) -> Option<&ConfigDocument> {
        self.document.as_ref()
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Use `document` for subsequent loads. Already registered instruments
    /// are kept.
    pub fn load_config(&mut self, document: ConfigDocument) {
        info!(instruments = document.len(), "station document set");
        self.document = Some(document);
    }

    /// Resolve, build and bind the instrument `name` from the current
    /// document. `overrides` take precedence over the document's `init`.
    #[instrument(skip(self, overrides))]
    pub async fn load_instrument(
        &mut self,
        name: &str,
        overrides: Map<String, Value>,
    ) -> StationResult<&ResolvedInstrument> {
        let document = self
            .document
            .as_ref()
            .ok_or_else(|| StationError::NotFound(name.to_string()))?;
        let resolved = TypeResolver::new(&self.catalog, document).resolve(name)?;

        DriverInstantiator::new(self.settings.enable_forced_reconnect)
            .instantiate(self, &resolved, &overrides)
            .await?;

        let instrument = self.get_mut(name)?;
        let monitored =
            binder::bind(instrument, &resolved.parameters, &resolved.add_parameters).await?;
        info!(
            parameters = instrument.parameters().len(),
            monitored = monitored.len(),
            "instrument loaded"
        );
        self.monitors.extend(monitored);
        self.get(name)
    }

    /// Load every instrument of the current document in document order.
    ///
    /// Stops at the first failure; instruments loaded before it stay
    /// registered.
    pub async fn load_all(&mut self) -> StationResult<()> {
        let names: Vec<String> = match &self.document {
            Some(document) => document.names().into_iter().map(String::from).collect(),
            None => Vec::new(),
        };
        for name in names {
            self.load_instrument(&name, Map::new()).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register an instrument. Names are unique.
    pub fn add(&mut self, instrument: ResolvedInstrument) -> StationResult<()> {
        if self.contains(instrument.name()) {
            return Err(StationError::DuplicateInstrument(
                instrument.name().to_string(),
            ));
        }
        self.instruments.push(instrument);
        Ok(())
    }

    /// Close an instrument's driver and drop its entry.
    ///
    /// The entry is dropped even when closing fails; the failure is returned
    /// as `ShutdownFailed`.
    pub async fn remove(&mut self, name: &str) -> StationResult<()> {
        let index = self
            .instruments
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| StationError::NotFound(name.to_string()))?;

        let closed = self.instruments[index].driver.close().await;
        self.instruments.remove(index);
        self.monitors.retain(|m| m.instrument != name);

        match closed {
            Ok(()) => {
                info!(instrument = %name, "instrument removed");
                Ok(())
            }
            Err(e) => Err(StationError::ShutdownFailed(vec![(
                name.to_string(),
                e.to_string(),
            )])),
        }
    }

    /// Look up an instrument.
    pub fn get(&self, name: &str) -> StationResult<&ResolvedInstrument> {
        self.instruments
            .iter()
            .find(|i| i.name == name)
            .ok_or_else(|| StationError::NotFound(name.to_string()))
    }

    /// Look up an instrument mutably.
    pub fn get_mut(&mut self, name: &str) -> StationResult<&mut ResolvedInstrument> {
        self.instruments
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| StationError::NotFound(name.to_string()))
    }

    /// Instrument names in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.instruments.iter().map(|i| i.name.as_str()).collect()
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.instruments.iter().any(|i| i.name == name)
    }

    /// Number of registered instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True when no instrument is registered.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// A bound parameter of a registered instrument.
    pub fn parameter(&self, instrument: &str, path: &str) -> StationResult<Arc<dyn ParameterBase>> {
        self.get(instrument)?
            .parameters()
            .get(path)
            .ok_or_else(|| StationError::unknown_parameter(instrument, path))
    }

    /// Parameters registered for monitoring, in load order.
    pub fn monitored(&self) -> &[MonitoredParameter] {
        &self.monitors
    }

    /// Close and remove every instrument, newest first.
    ///
    /// Every driver is closed even if some fail; the failures are collected
    /// into one `ShutdownFailed` error.
    pub async fn close_all(&mut self) -> StationResult<()> {
        let mut failures = Vec::new();
        while let Some(instrument) = self.instruments.pop() {
            match instrument.driver.close().await {
                Ok(()) => info!(instrument = %instrument.name, "instrument closed"),
                Err(e) => {
                    warn!(instrument = %instrument.name, error = %e, "instrument failed to close");
                    failures.push((instrument.name.clone(), e.to_string()));
                }
            }
        }
        self.monitors.clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StationError::ShutdownFailed(failures))
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// JSON description of every instrument and bound parameter.
    ///
    /// With `update` the current value of each parameter is read and
    /// included; read failures are logged and reported as `null`.
    pub async fn snapshot(&self, update: bool) -> Value {
        let mut instruments = Map::new();
        for instrument in &self.instruments {
            instruments.insert(instrument.name.clone(), instrument.snapshot(update).await);
        }
        let mut root = Map::new();
        root.insert("instruments".into(), Value::Object(instruments));
        Value::Object(root)
    }
}
