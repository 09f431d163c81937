//! Parameter<T> - hardware-connected instrument parameters
//!
//! Drivers expose their settings and readings as [`Parameter<T>`] values. A
//! parameter keeps its last known value in a `tokio::sync::watch` channel,
//! validates writes against driver-side constraints, and forwards reads and
//! writes to the device through async callbacks.
//!
//! The station works with parameters through the type-erased
//! [`ParameterBase`] trait, moving values as `serde_json::Value`. This lets the
//! binder wrap, alias and derive parameters without knowing their concrete
//! value types.
//!
//! # Data Flow
//!
//! ```text
//! param.set(value)
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 1. Reject if read-only                            │
//! │ 2. Validate against driver constraints            │
//! └───────────────────────────────────────────────────┘
//!         │ (fails here if invalid)
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 3. Write to hardware (if hardware_writer set)     │
//! └───────────────────────────────────────────────────┘
//!         │ (fails here if hardware error)
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 4. Update cached value, notify subscribers        │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use station_core::parameter::Parameter;
//!
//! let mut nplc = Parameter::new("nplc", 1.0)
//!     .with_unit("PLC")
//!     .with_range(0.01, 100.0);
//!
//! nplc.connect_to_hardware_write(move |val| {
//!     let device = device.clone();
//!     Box::pin(async move { device.write_nplc(val).await })
//! });
//!
//! nplc.set(10.0).await?;
//! ```

use crate::error::{StationError, StationResult};
use crate::path::canonical;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

type Validator<T> = Arc<dyn Fn(&T) -> StationResult<()> + Send + Sync>;
type HardwareWriter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, StationResult<()>> + Send + Sync>;
type HardwareReader<T> = Arc<dyn Fn() -> BoxFuture<'static, StationResult<T>> + Send + Sync>;

// =============================================================================
// Metadata
// =============================================================================

/// Descriptive metadata carried by every parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Human-readable label
    pub label: Option<String>,
    /// Unit of measurement
    pub unit: Option<String>,
    /// Longer description
    pub description: Option<String>,
    /// Whether writes are rejected
    pub read_only: bool,
}

// =============================================================================
// ParameterBase Trait - Generic Parameter Access
// =============================================================================

/// Type-erased access to a parameter.
///
/// Implemented by driver parameters and by the wrappers the station installs
/// on top of them. Values travel as JSON so wrappers can be stacked without
/// knowing the concrete type underneath.
#[async_trait]
pub trait ParameterBase: Send + Sync {
    /// Canonical parameter name (a parameter path).
    fn name(&self) -> &str;

    /// Descriptive metadata (returns a clone).
    fn metadata(&self) -> ParameterMetadata;

    /// Read the current value.
    async fn get_json(&self) -> StationResult<Value>;

    /// Write a new value.
    async fn set_json(&self, value: Value) -> StationResult<()>;

    /// Extra snapshot fields describing how this parameter post-processes
    /// values. Plain driver parameters have none.
    fn describe(&self) -> Map<String, Value> {
        Map::new()
    }
}

// =============================================================================
// Parameter<T>
// =============================================================================

/// Typed parameter with hardware synchronization.
///
/// Cloning a parameter shares the underlying watch channel and callbacks, so
/// a clone registered in a [`ParameterSet`] stays in sync with the copy the
/// driver keeps.
#[derive(Clone)]
pub struct Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    name: String,
    metadata: ParameterMetadata,
    sender: Arc<watch::Sender<T>>,
    validator: Option<Validator<T>>,
    hardware_writer: Option<HardwareWriter<T>>,
    hardware_reader: Option<HardwareReader<T>>,
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    /// Create new parameter with initial value
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            name: name.into(),
            metadata: ParameterMetadata::default(),
            sender: Arc::new(sender),
            validator: None,
            hardware_writer: None,
            hardware_reader: None,
        }
    }

    /// Set parameter label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.metadata.label = Some(label.into());
        self
    }

    /// Set parameter description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Set parameter unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.metadata.unit = Some(unit.into());
        self
    }

    /// Set numeric range constraints (inclusive)
    pub fn with_range(self, min: T, max: T) -> Self
    where
        T: PartialOrd,
    {
        let name = self.name.clone();
        self.with_validator(move |value| {
            if *value >= min && *value <= max {
                Ok(())
            } else {
                Err(StationError::invalid_value(
                    name.clone(),
                    format!("{:?} outside driver range [{:?}, {:?}]", value, min, max),
                ))
            }
        })
    }

    /// Set discrete choice constraints
    pub fn with_choices(self, choices: Vec<T>) -> Self {
        let name = self.name.clone();
        self.with_validator(move |value| {
            if choices.iter().any(|c| c == value) {
                Ok(())
            } else {
                Err(StationError::invalid_value(
                    name.clone(),
                    format!("{:?} is not one of {:?}", value, choices),
                ))
            }
        })
    }

    /// Set custom validation function
    ///
    /// Replaces any previously installed validator.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> StationResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Make parameter read-only
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Connect hardware write function
    ///
    /// After calling this, `set()` will write to hardware before updating
    /// the cached value. If the hardware write fails, the value is not updated.
    pub fn connect_to_hardware_write(
        &mut self,
        writer: impl Fn(T) -> BoxFuture<'static, StationResult<()>> + Send + Sync + 'static,
    ) {
        self.hardware_writer = Some(Arc::new(writer));
    }

    /// Connect hardware read function
    ///
    /// After calling this, reads through [`ParameterBase::get_json`] fetch the
    /// current hardware value first.
    pub fn connect_to_hardware_read(
        &mut self,
        reader: impl Fn() -> BoxFuture<'static, StationResult<T>> + Send + Sync + 'static,
    ) {
        self.hardware_reader = Some(Arc::new(reader));
    }

    /// Get the cached value
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Set value (validates, writes to hardware if connected, notifies subscribers)
    ///
    /// Validation runs BEFORE the hardware write so an invalid value never
    /// reaches the device.
    pub async fn set(&self, value: T) -> StationResult<()> {
        if self.metadata.read_only {
            return Err(StationError::ParameterReadOnly(self.name.clone()));
        }

        if let Some(validator) = &self.validator {
            validator(&value)?;
        }

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        self.sender.send_replace(value);
        Ok(())
    }

    /// Read current value from hardware and update the cached value
    ///
    /// Without a connected reader this is a no-op returning the cached value.
    pub async fn read_from_hardware(&self) -> StationResult<T> {
        match &self.hardware_reader {
            Some(reader) => {
                let value = reader().await?;
                self.sender.send_replace(value.clone());
                Ok(value)
            }
            None => Ok(self.get()),
        }
    }

    /// Subscribe to value changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter unit of measurement
    pub fn unit(&self) -> Option<&str> {
        self.metadata.unit.as_deref()
    }

    /// Check if parameter is read-only
    pub fn is_read_only(&self) -> bool {
        self.metadata.read_only
    }
}

#[async_trait]
impl<T> ParameterBase for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> ParameterMetadata {
        self.metadata.clone()
    }

    async fn get_json(&self) -> StationResult<Value> {
        let value = self.read_from_hardware().await?;
        serde_json::to_value(value)
            .map_err(|e| StationError::invalid_value(self.name.clone(), e.to_string()))
    }

    async fn set_json(&self, value: Value) -> StationResult<()> {
        let typed: T = serde_json::from_value(value.clone()).map_err(|e| {
            StationError::invalid_value(self.name.clone(), format!("cannot use {value}: {e}"))
        })?;
        self.set(typed).await
    }
}

// =============================================================================
// ParameterSet - Collection of parameters keyed by path
// =============================================================================

/// The parameters an instrument exposes, keyed by canonical path.
///
/// Entries are shared `Arc`s: two keys may point at the same parameter (an
/// alias), and cloning the set does not clone the parameters.
#[derive(Clone, Default)]
pub struct ParameterSet {
    parameters: BTreeMap<String, Arc<dyn ParameterBase>>,
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("parameters", &format!("{} parameters", self.parameters.len()))
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create a new empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under its own name, returning the shared handle.
    pub fn register<P>(&mut self, parameter: P) -> Arc<dyn ParameterBase>
    where
        P: ParameterBase + 'static,
    {
        let shared: Arc<dyn ParameterBase> = Arc::new(parameter);
        let key = canonical(shared.name()).unwrap_or_else(|_| shared.name().to_string());
        self.parameters.insert(key, shared.clone());
        shared
    }

    /// Insert `parameter` under `name`, returning the entry it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        parameter: Arc<dyn ParameterBase>,
    ) -> Option<Arc<dyn ParameterBase>> {
        let name = name.into();
        let key = canonical(&name).unwrap_or(name);
        self.parameters.insert(key, parameter)
    }

    /// Get a parameter by path.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ParameterBase>> {
        self.parameters.get(&Self::key(name)).cloned()
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(&Self::key(name))
    }

    /// Remove a parameter by path.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn ParameterBase>> {
        self.parameters.remove(&Self::key(name))
    }

    /// Iterate all entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ParameterBase>)> {
        self.parameters.iter().map(|(name, p)| (name.as_str(), p))
    }

    /// List all parameter names in path order.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries (aliases included).
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// True when no parameter is registered.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    fn key(name: &str) -> String {
        canonical(name).unwrap_or_else(|_| name.to_string())
    }
}
