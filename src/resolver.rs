//! Driver catalog and type resolution.
//!
//! Instruments name their driver with a dotted class path (`mock.dmm.MockDmm`)
//! or with the name of an instrument listed earlier in the same document, in
//! which case they inherit that instrument's driver and settings. The
//! [`TypeResolver`] turns either form into a [`ResolvedSpec`]: a concrete
//! driver factory plus the fully merged instrument settings.
//!
//! Driver classes come from a [`DriverCatalog`] populated at process start;
//! there is no dynamic loading.

use crate::config::document::{ConfigDocument, InstrumentSpec, OrderedMap, ParameterRule};
use serde_json::{Map, Value};
use station_core::driver::DriverFactory;
use station_core::error::{StationError, StationResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a class path did not resolve to a registered driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassLookupError {
    /// Empty segment, e.g. `mock..Dmm`.
    #[error("'{0}' is not a valid dotted class path")]
    InvalidPath(String),

    /// A bare name that is neither a class nor an earlier instrument.
    #[error("'{0}' is neither a driver class path nor the name of an earlier instrument")]
    UnknownName(String),

    /// The path names a module.
    #[error("'{0}' is a module, not a driver class")]
    NotAClass(String),

    /// A leading part of the path names no module.
    #[error("no driver module named '{0}'")]
    UnknownModule(String),

    /// The module exists but lacks the class.
    #[error("module '{module}' has no driver class '{class}'")]
    UnknownClass {
        /// Module that was found
        module: String,
        /// Class missing from it
        class: String,
    },
}

// =============================================================================
// DriverCatalog
// =============================================================================

/// Registry of driver factories keyed by dotted class path.
#[derive(Default, Clone)]
pub struct DriverCatalog {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCatalog")
            .field("classes", &self.class_paths())
            .finish()
    }
}

impl DriverCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its class path.
    ///
    /// Returns the factory previously registered under the same path, if any.
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) -> Option<Arc<dyn DriverFactory>> {
        let path = factory.class_path().to_string();
        let previous = self.factories.insert(path.clone(), factory);
        if previous.is_some() {
            warn!(class = %path, "driver class registered twice; keeping the newer factory");
        }
        previous
    }

    /// Remove a factory.
    pub fn unregister(&mut self, class_path: &str) -> bool {
        self.factories.remove(class_path).is_some()
    }

    /// Registered class paths, sorted.
    pub fn class_paths(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// All registered factories, sorted by class path.
    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn DriverFactory>> {
        self.factories.values()
    }

    /// True when `class_path` is registered.
    pub fn contains(&self, class_path: &str) -> bool {
        self.factories.contains_key(class_path)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when no class is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Look up a class path, explaining a miss.
    ///
    /// The path is walked as module descent: every segment but the last must
    /// name a module (a prefix of some registered path), the last must name a
    /// class inside that module.
    pub fn lookup(&self, class_path: &str) -> Result<Arc<dyn DriverFactory>, ClassLookupError> {
        if let Some(factory) = self.factories.get(class_path) {
            return Ok(factory.clone());
        }

        let segments: Vec<&str> = class_path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ClassLookupError::InvalidPath(class_path.to_string()));
        }
        if segments.len() == 1 {
            return Err(ClassLookupError::UnknownName(class_path.to_string()));
        }

        let modules = self.modules();
        if modules.contains(class_path) {
            return Err(ClassLookupError::NotAClass(class_path.to_string()));
        }

        for depth in 1..segments.len() {
            let prefix = segments[..depth].join(".");
            if !modules.contains(&prefix) {
                return Err(ClassLookupError::UnknownModule(prefix));
            }
        }

        Err(ClassLookupError::UnknownClass {
            module: segments[..segments.len() - 1].join("."),
            class: segments[segments.len() - 1].to_string(),
        })
    }

    /// Every proper dotted prefix of a registered class path.
    fn modules(&self) -> BTreeSet<String> {
        let mut modules = BTreeSet::new();
        for path in self.factories.keys() {
            let segments: Vec<&str> = path.split('.').collect();
            for depth in 1..segments.len() {
                modules.insert(segments[..depth].join("."));
            }
        }
        modules
    }
}

impl station_driver_mock::FactoryRegistry for DriverCatalog {
    fn register_factory(&mut self, factory: Arc<dyn DriverFactory>) {
        self.register(factory);
    }
}

// =============================================================================
// ResolvedSpec
// =============================================================================

/// A driver class reference: the class path and its factory.
#[derive(Clone)]
pub struct DriverClassRef {
    /// Dotted class path
    pub class_path: String,
    /// Factory registered under that path
    pub factory: Arc<dyn DriverFactory>,
}

impl std::fmt::Debug for DriverClassRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverClassRef")
            .field("class_path", &self.class_path)
            .finish()
    }
}

/// An instrument spec with its driver resolved and inherited settings merged.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    /// Instrument name
    pub name: String,
    /// Resolved driver class
    pub class: DriverClassRef,
    /// Connection address
    pub address: Option<String>,
    /// Connection port
    pub port: Option<u16>,
    /// Forced reconnect flag (None falls back to the station default)
    pub enable_forced_reconnect: Option<bool>,
    /// Merged driver keyword arguments
    pub init: Map<String, Value>,
    /// Merged rules for existing parameters
    pub parameters: OrderedMap<ParameterRule>,
    /// Merged rules for derived parameters
    pub add_parameters: OrderedMap<ParameterRule>,
}

impl ResolvedSpec {
    /// Apply `spec`'s own fields on top of an inherited spec.
    fn inherit(name: &str, base: &ResolvedSpec, spec: &InstrumentSpec) -> Self {
        let mut init = base.init.clone();
        for (key, value) in &spec.init {
            init.insert(key.clone(), value.clone());
        }

        Self {
            name: name.to_string(),
            class: base.class.clone(),
            address: spec.address.clone().or_else(|| base.address.clone()),
            port: spec.port.or(base.port),
            enable_forced_reconnect: spec
                .enable_forced_reconnect
                .or(base.enable_forced_reconnect),
            init,
            parameters: base.parameters.merged_with(&spec.parameters),
            add_parameters: base.add_parameters.merged_with(&spec.add_parameters),
        }
    }

    fn direct(name: &str, class: DriverClassRef, spec: &InstrumentSpec) -> Self {
        Self {
            name: name.to_string(),
            class,
            address: spec.address.clone(),
            port: spec.port,
            enable_forced_reconnect: spec.enable_forced_reconnect,
            init: spec.init.clone(),
            parameters: spec.parameters.clone(),
            add_parameters: spec.add_parameters.clone(),
        }
    }
}

// =============================================================================
// TypeResolver
// =============================================================================

/// Resolves instrument types against a catalog and a document.
///
/// Resolved instruments are memoized, so an indirection chain (C names B,
/// B names A) costs one resolution per instrument.
pub struct TypeResolver<'a> {
    catalog: &'a DriverCatalog,
    document: &'a ConfigDocument,
    resolved: HashMap<String, ResolvedSpec>,
}

impl<'a> TypeResolver<'a> {
    /// Create a resolver over one document.
    pub fn new(catalog: &'a DriverCatalog, document: &'a ConfigDocument) -> Self {
        Self {
            catalog,
            document,
            resolved: HashMap::new(),
        }
    }

    /// Resolve the document entry `name`.
    pub fn resolve(&mut self, name: &str) -> StationResult<ResolvedSpec> {
        if let Some(done) = self.resolved.get(name) {
            return Ok(done.clone());
        }

        let spec = self
            .document
            .instrument(name)
            .ok_or_else(|| StationError::NotFound(name.to_string()))?;
        let position = self.document.position(name).unwrap_or_default();

        let resolved = match spec.driver.as_deref() {
            Some(driver) => {
                let class_path = join_driver(driver, &spec.type_path);
                warn!(
                    instrument = %name,
                    driver = %driver,
                    type_path = %spec.type_path,
                    class = %class_path,
                    "'driver' is deprecated; put the full class path in 'type'"
                );
                ResolvedSpec::direct(name, self.class(name, &class_path)?, spec)
            }
            None => match self.document.position(&spec.type_path) {
                Some(target) if target < position => {
                    let base = self.resolve(&spec.type_path)?;
                    debug!(instrument = %name, base = %spec.type_path, "resolved through earlier instrument");
                    ResolvedSpec::inherit(name, &base, spec)
                }
                Some(target) if target == position => {
                    return Err(StationError::driver_resolution(
                        name,
                        "type refers to the instrument itself",
                    ));
                }
                Some(_) => {
                    return Err(StationError::driver_resolution(
                        name,
                        format!(
                            "type refers to instrument '{}', which is defined later in the document",
                            spec.type_path
                        ),
                    ));
                }
                None => ResolvedSpec::direct(name, self.class(name, &spec.type_path)?, spec),
            },
        };

        debug!(instrument = %name, class = %resolved.class.class_path, "resolved driver class");
        self.resolved.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Resolve every instrument in document order.
    pub fn resolve_all(&mut self) -> StationResult<Vec<ResolvedSpec>> {
        let names: Vec<String> = self.document.names().into_iter().map(String::from).collect();
        names.iter().map(|name| self.resolve(name)).collect()
    }

    fn class(&self, instrument: &str, class_path: &str) -> StationResult<DriverClassRef> {
        let factory = self
            .catalog
            .lookup(class_path)
            .map_err(|reason| StationError::driver_resolution(instrument, reason.to_string()))?;
        Ok(DriverClassRef {
            class_path: class_path.to_string(),
            factory,
        })
    }
}

/// Combine the deprecated `driver` module with `type`.
///
/// A `type` that already starts with the module is used as-is.
fn join_driver(driver: &str, type_path: &str) -> String {
    match type_path.strip_prefix(driver) {
        Some(rest) if rest.starts_with('.') => type_path.to_string(),
        _ => format!("{}.{}", driver, type_path),
    }
}
