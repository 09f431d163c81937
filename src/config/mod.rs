//! Station documents: model, schema validation and loading.

pub mod document;
pub mod loader;
pub mod schema;

pub use document::{ConfigDocument, InstrumentSpec, Limits, OrderedMap, ParameterRule};
pub use loader::{load_document_file, load_document_str, parse_document_str};
pub use schema::SchemaValidator;
