//! Station schema validation.
//!
//! Station documents are checked against `schemas/station.schema.json`
//! (JSON Schema draft-07, embedded at compile time) before anything is
//! instantiated. The schema is closed: every object sets
//! `additionalProperties: false`, so a misspelled field is an error rather
//! than a silently ignored key.
//!
//! Validation collects every violation in a single pass. Besides the JSON
//! Schema checks it runs a small semantic pass for constraints the schema
//! cannot express (`limits` with min greater than max, zero `scale`).

use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use station_core::error::{StationError, StationResult, ValidationViolations, Violation};
use tracing::debug;

/// The station schema source.
pub const STATION_SCHEMA: &str = include_str!("../../schemas/station.schema.json");

const RULE_SECTIONS: [&str; 2] = ["parameters", "add_parameters"];

/// Compiled station schema.
pub struct SchemaValidator {
    validator: Validator,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator").finish_non_exhaustive()
    }
}

impl SchemaValidator {
    /// Compile the embedded station schema.
    pub fn new() -> StationResult<Self> {
        let schema: Value = serde_json::from_str(STATION_SCHEMA)
            .map_err(|e| StationError::Parse(format!("station schema: {}", e)))?;
        Self::from_schema(&schema)
    }

    /// Compile an arbitrary draft-07 schema.
    pub fn from_schema(schema: &Value) -> StationResult<Self> {
        let mut opts = jsonschema::options();
        opts.with_draft(Draft::Draft7);
        let validator = opts
            .build(schema)
            .map_err(|e| StationError::Parse(format!("station schema: {}", e)))?;
        Ok(Self { validator })
    }

    /// Validate a parsed document.
    ///
    /// Returns `SchemaValidation` listing every violation when the document
    /// is invalid. Pure: the document is not modified.
    pub fn validate(&self, document: &Value) -> StationResult<()> {
        let violations = self.violations(document);
        if violations.is_empty() {
            Ok(())
        } else {
            debug!(count = violations.len(), "station document rejected");
            Err(StationError::SchemaValidation { violations })
        }
    }

    /// Collect all violations without failing.
    pub fn violations(&self, document: &Value) -> ValidationViolations {
        let mut violations = Vec::new();

        for error in self.validator.iter_errors(document) {
            let instance_path = error.instance_path.to_string();
            let schema_path = error.schema_path.to_string();

            // One violation per unexpected field, pointing at the field itself.
            if let ValidationErrorKind::AdditionalProperties { unexpected } = &error.kind {
                for field in unexpected {
                    violations.push(Violation::new(
                        format!("{}/{}", instance_path, escape_pointer(field)),
                        schema_path.clone(),
                        format!("unknown field '{}'", field),
                    ));
                }
                continue;
            }

            violations.push(Violation::new(instance_path, schema_path, error.to_string()));
        }

        semantic_violations(document, &mut violations);
        violations.into()
    }
}

/// Checks the schema language cannot express.
fn semantic_violations(document: &Value, violations: &mut Vec<Violation>) {
    let Some(instruments) = document.get("instruments").and_then(Value::as_object) else {
        return;
    };

    for (name, spec) in instruments {
        for section in RULE_SECTIONS {
            let Some(rules) = spec.get(section).and_then(Value::as_object) else {
                continue;
            };
            for (parameter, rule) in rules {
                let base = format!(
                    "/instruments/{}/{}/{}",
                    escape_pointer(name),
                    section,
                    escape_pointer(parameter)
                );

                if let Some(limits) = rule.get("limits").and_then(Value::as_array) {
                    if let [min, max] = limits.as_slice() {
                        if let (Some(min), Some(max)) = (min.as_f64(), max.as_f64()) {
                            if min > max {
                                violations.push(Violation::new(
                                    format!("{}/limits", base),
                                    "limits",
                                    format!("lower limit {} exceeds upper limit {}", min, max),
                                ));
                            }
                        }
                    }
                }

                if rule.get("scale").and_then(Value::as_f64) == Some(0.0) {
                    violations.push(Violation::new(
                        format!("{}/scale", base),
                        "scale",
                        "scale must be non-zero",
                    ));
                }
            }
        }
    }
}

/// Escape a key for use in a JSON pointer (RFC 6901).
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::new().unwrap()
    }

    #[test]
    fn test_valid_document() {
        let doc = json!({
            "instruments": {
                "dmm": {
                    "type": "mock.dmm.MockDmm",
                    "address": "GPIB0::22::INSTR",
                    "init": {"reading": 1.5},
                    "parameters": {
                        "nplc": {"initial_value": 10, "monitor": true},
                        "voltage": {"alias": "v", "scale": 2, "offset": 1, "limits": [0, 10]}
                    },
                    "add_parameters": {
                        "v_mv": {"source": "voltage", "scale": 1000, "unit": "mV", "limits": "off"}
                    }
                },
                "dac": {
                    "type": "mock.source.MockVoltageSource",
                    "port": 5025,
                    "enable_forced_reconnect": true,
                    "parameters": {
                        "channels[1].voltage": {"step": 0.5, "inter_delay": 0.01, "post_delay": 0}
                    }
                }
            }
        });
        assert!(validator().validate(&doc).is_ok());
    }

    #[test]
    fn test_unknown_fields_name_their_path() {
        let doc = json!({
            "instruments": {
                "dmm": {"type": "mock.dmm.MockDmm", "tpye": "x"}
            },
            "extra": true
        });
        let violations = validator().violations(&doc);
        assert!(violations.contains_path("/instruments/dmm/tpye"));
        assert!(violations.contains_path("/extra"));
    }

    #[test]
    fn test_unknown_rule_field() {
        let doc = json!({
            "instruments": {
                "dmm": {
                    "type": "mock.dmm.MockDmm",
                    "parameters": {"nplc": {"lable": "NPLC"}}
                }
            }
        });
        let violations = validator().violations(&doc);
        assert!(violations.contains_path("/instruments/dmm/parameters/nplc/lable"));
    }

    #[test]
    fn test_reports_all_violations_in_one_pass() {
        let doc = json!({
            "instruments": {
                "a": {"address": 5},
                "b": {"type": "mock.dmm.MockDmm", "port": "five"},
                "c": {
                    "type": "mock.dmm.MockDmm",
                    "parameters": {"nplc": {"limits": [10, 0], "scale": 0}}
                }
            }
        });
        let err = validator().validate(&doc).unwrap_err();
        let violations = err.violations().unwrap();

        // missing type, wrong address type, wrong port type, inverted limits, zero scale
        assert!(violations.len() >= 5, "{violations}");
        assert!(violations.contains_path("/instruments/a"));
        assert!(violations.contains_path("/instruments/a/address"));
        assert!(violations.contains_path("/instruments/b/port"));
        assert!(violations.contains_path("/instruments/c/parameters/nplc/limits"));
        assert!(violations.contains_path("/instruments/c/parameters/nplc/scale"));
    }

    #[test]
    fn test_add_parameters_require_source() {
        let doc = json!({
            "instruments": {
                "dmm": {
                    "type": "mock.dmm.MockDmm",
                    "add_parameters": {"v_mv": {"scale": 1000}}
                }
            }
        });
        let violations = validator().violations(&doc);
        assert!(violations.contains_path("/instruments/dmm/add_parameters/v_mv"));
    }

    #[test]
    fn test_patterns() {
        let doc = json!({
            "instruments": {
                "bad-name": {"type": "mock.dmm.MockDmm"},
                "dmm": {
                    "type": "mock..dmm",
                    "parameters": {"voltage": {"alias": "not valid"}}
                }
            }
        });
        let violations = validator().violations(&doc);
        assert!(violations.len() >= 3, "{violations}");
        assert!(violations.contains_path("/instruments/dmm/type"));
        assert!(violations.contains_path("/instruments/dmm/parameters/voltage/alias"));
    }

    #[test]
    fn test_limits_shape() {
        let doc = json!({
            "instruments": {
                "dmm": {
                    "type": "mock.dmm.MockDmm",
                    "parameters": {
                        "range": {"limits": [1, 2, 3]},
                        "nplc": {"limits": "on"}
                    }
                }
            }
        });
        let violations = validator().violations(&doc);
        assert!(violations.contains_path("/instruments/dmm/parameters/range/limits"));
        assert!(violations.contains_path("/instruments/dmm/parameters/nplc/limits"));
    }

    #[test]
    fn test_negative_delay_and_zero_step() {
        let doc = json!({
            "instruments": {
                "dac": {
                    "type": "mock.source.MockVoltageSource",
                    "parameters": {"output": {"post_delay": -1, "step": 0}}
                }
            }
        });
        let violations = validator().violations(&doc);
        assert!(violations.contains_path("/instruments/dac/parameters/output/post_delay"));
        assert!(violations.contains_path("/instruments/dac/parameters/output/step"));
    }

    #[test]
    fn test_missing_instruments() {
        let violations = validator().violations(&json!({}));
        assert!(violations.contains_path(""));
    }
}
