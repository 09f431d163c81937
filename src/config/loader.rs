//! Station document loading.
//!
//! Documents are YAML or JSON text (JSON is read with the YAML parser, which
//! accepts it). Loading is parse → schema validation → typed document; the
//! first two stages report every problem they find.

use crate::config::document::ConfigDocument;
use crate::config::schema::SchemaValidator;
use serde_json::Value;
use station_core::error::{StationError, StationResult};
use std::path::Path;
use tracing::{debug, info};

/// Parse YAML or JSON text into a JSON value without validating it.
pub fn parse_document_str(text: &str) -> StationResult<Value> {
    serde_yaml::from_str::<Value>(text).map_err(|e| StationError::Parse(e.to_string()))
}

/// Parse and validate a station document from text.
pub fn load_document_str(text: &str) -> StationResult<ConfigDocument> {
    let validator = SchemaValidator::new()?;
    load_document_str_with(text, &validator)
}

/// Parse and validate a station document from text with a prepared validator.
pub fn load_document_str_with(
    text: &str,
    validator: &SchemaValidator,
) -> StationResult<ConfigDocument> {
    let value = parse_document_str(text)?;
    let document = ConfigDocument::from_value(value, validator)?;
    debug!(instruments = document.len(), "station document validated");
    Ok(document)
}

/// Read, parse and validate a station document file.
pub fn load_document_file(path: impl AsRef<Path>) -> StationResult<ConfigDocument> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let document = load_document_str(&text)?;
    info!(path = %path.display(), instruments = document.len(), "loaded station document");
    Ok(document)
}
