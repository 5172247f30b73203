//! Expansion of `{{ index . "dotted.path" }}` markers in payload values
//! against the flattened field map of the object under admission.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::fieldmap::FieldMap;

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\{\{\s*index\s+\.\s+"([^"]+)"\s*\}\}"#).unwrap());

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported template expression in {0:?}")]
    UnsupportedExpression(String),
}

/// True when the value carries a template marker and must be expanded (and
/// re-validated) at mutation time rather than at load time.
pub fn is_templated(value: &str) -> bool {
    value.contains("{{")
}

/// Replaces every `{{ index . "path" }}` marker with the field map entry for
/// `path`, or the empty string when the object has no such field. Any other
/// `{{`/`}}` content is an error.
pub fn expand(value: &str, fields: &FieldMap) -> Result<String, Error> {
    if !is_templated(value) {
        return Ok(value.to_string());
    }
    let mut out = String::new();
    let mut last = 0;
    for caps in MARKER_RE.captures_iter(value) {
        let marker = caps.get(0).unwrap();
        out.push_str(&value[last..marker.start()]);
        out.push_str(fields.get(&caps[1]).map(String::as_str).unwrap_or(""));
        last = marker.end();
    }
    out.push_str(&value[last..]);
    if out.contains("{{") || out.contains("}}") {
        return Err(Error::UnsupportedExpression(value.to_string()));
    }
    Ok(out)
}

/// Checks template syntax without an object, for load-time validation.
pub fn validate(value: &str) -> Result<(), Error> {
    expand(value, &FieldMap::new()).map(|_| ())
}
