//! Parameter paths.
//!
//! Parameters are addressed by dotted paths whose segments may carry a single
//! channel index, e.g. `voltage`, `channels[1].voltage` or
//! `bank.channels[12].current_limit`. Paths are parsed once and rendered in a
//! canonical form (`[01]` becomes `[1]`) so lookups do not depend on how a
//! document author spelled the index.

use crate::error::{StationError, StationResult};
use regex_lite::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

// Literal pattern, compile failure is impossible.
#[allow(clippy::expect_used)]
fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\w+(\[\d+\])?(\.\w+(\[\d+\])?)*$").expect("valid path pattern")
    })
}

/// One segment of a parameter path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathSegment {
    /// Segment name (`\w+`).
    pub name: String,
    /// Optional channel index.
    pub index: Option<usize>,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.name, index),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A parsed, canonical parameter path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterPath {
    segments: Vec<PathSegment>,
}

impl ParameterPath {
    /// Parse a path such as `channels[1].voltage`.
    pub fn parse(raw: &str) -> StationResult<Self> {
        if !path_pattern().is_match(raw) {
            return Err(StationError::InvalidPath(raw.to_string()));
        }

        let segments = raw
            .split('.')
            .map(|segment| match segment.split_once('[') {
                Some((name, rest)) => {
                    let digits = rest.trim_end_matches(']');
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| StationError::InvalidPath(raw.to_string()))?;
                    Ok(PathSegment {
                        name: name.to_string(),
                        index: Some(index),
                    })
                }
                None => Ok(PathSegment {
                    name: segment.to_string(),
                    index: None,
                }),
            })
            .collect::<StationResult<Vec<_>>>()?;

        Ok(Self { segments })
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The final segment's name (the parameter's short name).
    pub fn leaf(&self) -> &str {
        self.segments
            .last()
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }

    /// True for a bare `\w+` name without dots or index.
    pub fn is_simple(&self) -> bool {
        self.segments.len() == 1 && self.segments[0].index.is_none()
    }
}

impl fmt::Display for ParameterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for ParameterPath {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Render `raw` in canonical form.
pub fn canonical(raw: &str) -> StationResult<String> {
    ParameterPath::parse(raw).map(|p| p.to_string())
}
