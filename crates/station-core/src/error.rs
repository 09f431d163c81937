//! Custom error types for station resolution.
//!
//! This module defines the primary error type, `StationError`, shared by every
//! stage of turning a station document into live instruments. Using the
//! `thiserror` crate, it gives each failure mode its own variant so callers
//! can match on the kind of failure instead of parsing messages.
//!
//! ## Error Hierarchy
//!
//! - **Document errors**: `Parse`, `SchemaValidation`, `InvalidPath`. Raised
//!   before any driver is touched. A document with errors is never loaded.
//! - **Resolution errors**: `DriverResolution`, `DuplicateInstrument`,
//!   `Instantiation`. Raised per instrument while loading. Instruments loaded
//!   before the failing one stay registered.
//! - **Binding errors**: `UnknownParameter`, `DuplicateParameter`,
//!   `AliasConflict`. Raised while applying the `parameters` and
//!   `add_parameters` rules of an instrument.
//! - **Runtime errors**: `LimitViolation`, `InvalidValue`, `ParameterReadOnly`,
//!   `Hardware`. Raised by individual parameter reads and writes.
//! - **Station errors**: `NotFound`, `ShutdownFailed`, `Settings`, `Io`.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

/// One schema violation found in a station document.
///
/// `instance_path` is a JSON pointer into the document (empty for the root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer to the offending value.
    pub instance_path: String,
    /// JSON pointer to the violated schema keyword.
    pub schema_path: String,
    /// Human-readable description of the violated constraint.
    pub message: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(
        instance_path: impl Into<String>,
        schema_path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_path: instance_path.into(),
            schema_path: schema_path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance_path.is_empty() {
            write!(f, "  (root): {}", self.message)
        } else {
            write!(f, "  {}: {}", self.instance_path, self.message)
        }
    }
}

/// Every violation found by a single validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationViolations {
    /// Violations in document order of discovery.
    pub violations: Vec<Violation>,
}

impl ValidationViolations {
    /// Number of violations.
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// True when no violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Iterate the violations.
    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    /// True when a violation points at exactly `instance_path`.
    pub fn contains_path(&self, instance_path: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.instance_path == instance_path)
    }
}

impl fmt::Display for ValidationViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl From<Vec<Violation>> for ValidationViolations {
    fn from(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

/// Primary error type for station resolution and parameter access.
///
/// Nothing is swallowed: every failure surfaces as one of these variants.
/// The only automatic recovery is forced reconnection of an instrument whose
/// spec enables it.
#[derive(Error, Debug)]
pub enum StationError {
    /// The document text could not be parsed as YAML or JSON.
    #[error("Failed to parse station document: {0}")]
    Parse(String),

    /// The document does not satisfy the station schema.
    ///
    /// Carries every violation found, not just the first.
    #[error("Station document failed validation with {} violation(s):\n{violations}", .violations.len())]
    SchemaValidation {
        /// All violations found in one pass.
        violations: ValidationViolations,
    },

    /// An instrument's `type` does not resolve to a registered driver class.
    #[error("Cannot resolve driver for instrument '{instrument}': {reason}")]
    DriverResolution {
        /// Instrument whose type failed to resolve.
        instrument: String,
        /// What went wrong while resolving.
        reason: String,
    },

    /// An instrument with this name is already registered and the spec does
    /// not enable forced reconnection.
    #[error("Instrument '{0}' is already registered")]
    DuplicateInstrument(String),

    /// The driver factory failed to construct the instrument.
    #[error("Failed to instantiate instrument '{instrument}': {source}")]
    Instantiation {
        /// Instrument being constructed.
        instrument: String,
        /// Underlying driver error.
        #[source]
        source: anyhow::Error,
    },

    /// A rule or source names a parameter the instrument does not expose.
    #[error("Instrument '{instrument}' has no parameter '{parameter}'")]
    UnknownParameter {
        /// Owning instrument.
        instrument: String,
        /// Missing parameter path.
        parameter: String,
    },

    /// An `add_parameters` entry names a parameter that already exists.
    #[error("Instrument '{instrument}' already has a parameter named '{parameter}'")]
    DuplicateParameter {
        /// Owning instrument.
        instrument: String,
        /// Colliding parameter name.
        parameter: String,
    },

    /// An alias collides with an existing parameter name.
    #[error("Alias '{alias}' on instrument '{instrument}' collides with an existing parameter")]
    AliasConflict {
        /// Owning instrument.
        instrument: String,
        /// Colliding alias.
        alias: String,
    },

    /// A value written to a parameter is outside its soft limits.
    #[error("Value {value} for parameter '{parameter}' is outside limits [{min}, {max}]")]
    LimitViolation {
        /// Parameter being written.
        parameter: String,
        /// Rejected value.
        value: f64,
        /// Lower limit (inclusive).
        min: f64,
        /// Upper limit (inclusive).
        max: f64,
    },

    /// A value has the wrong shape or fails a driver-side constraint.
    #[error("Invalid value for parameter '{parameter}': {reason}")]
    InvalidValue {
        /// Parameter being read or written.
        parameter: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A parameter path does not follow the `name[index].name` syntax.
    #[error("Invalid parameter path '{0}'")]
    InvalidPath(String),

    /// A write was attempted on a read-only parameter.
    #[error("Parameter '{0}' is read-only")]
    ParameterReadOnly(String),

    /// The driver reported a failure while reading or writing a parameter.
    #[error("Hardware error on parameter '{parameter}': {message}")]
    Hardware {
        /// Parameter being accessed.
        parameter: String,
        /// Driver-supplied message.
        message: String,
    },

    /// A named instrument (or document entry) does not exist.
    #[error("Instrument '{0}' not found")]
    NotFound(String),

    /// One or more instruments failed to close.
    #[error("Failed to close {} instrument(s): {}", .0.len(), .0.iter().map(|(name, err)| format!("{name}: {err}")).collect::<Vec<_>>().join("; "))]
    ShutdownFailed(Vec<(String, String)>),

    /// Station settings could not be loaded or are invalid.
    #[error("Invalid station settings: {0}")]
    Settings(String),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StationError {
    /// Build a `DriverResolution` error.
    pub fn driver_resolution(instrument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DriverResolution {
            instrument: instrument.into(),
            reason: reason.into(),
        }
    }

    /// Build an `UnknownParameter` error.
    pub fn unknown_parameter(instrument: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::UnknownParameter {
            instrument: instrument.into(),
            parameter: parameter.into(),
        }
    }

    /// Build an `InvalidValue` error.
    pub fn invalid_value(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// The schema violations carried by a `SchemaValidation` error.
    pub fn violations(&self) -> Option<&ValidationViolations> {
        match self {
            Self::SchemaValidation { violations } => Some(violations),
            _ => None,
        }
    }
}
