//! Label and annotation syntax validation, matching the rules the API server
//! applies to metadata keys and values.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_NAME_LEN: usize = 63;
const MAX_LABEL_VALUE_LEN: usize = 63;
const MAX_DNS_SUBDOMAIN_LEN: usize = 253;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap());
static DNS_SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("key {0:?} may contain at most one '/'")]
    TooManySlashes(String),
    #[error("key prefix {0:?} is not a valid DNS subdomain")]
    InvalidPrefix(String),
    #[error("name part {0:?} must be 1-63 alphanumeric characters, '-', '_' or '.', starting and ending alphanumeric")]
    InvalidName(String),
    #[error("label value {0:?} must be at most 63 alphanumeric characters, '-', '_' or '.', starting and ending alphanumeric")]
    InvalidLabelValue(String),
}

/// Validates a label or annotation key: an optional DNS-subdomain prefix
/// separated by a single `/` from a short alphanumeric name.
pub fn validate_qualified_name(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    let parts: Vec<&str> = key.split('/').collect();
    let name = match parts.as_slice() {
        [name] => name,
        [prefix, name] => {
            if prefix.is_empty()
                || prefix.len() > MAX_DNS_SUBDOMAIN_LEN
                || !DNS_SUBDOMAIN_RE.is_match(prefix)
            {
                return Err(Error::InvalidPrefix(prefix.to_string()));
            }
            name
        }
        _ => return Err(Error::TooManySlashes(key.to_string())),
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Validates a label value. Empty values are permitted.
pub fn validate_label_value(value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_LABEL_VALUE_LEN || !NAME_RE.is_match(value) {
        return Err(Error::InvalidLabelValue(value.to_string()));
    }
    Ok(())
}

/// Annotation keys follow the same qualified-name grammar as label keys.
pub fn validate_annotation_key(key: &str) -> Result<(), Error> {
    validate_qualified_name(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names() {
        for key in ["app", "app.kubernetes.io/name", "iam.amazonaws.com/permitted", "a", "A_b.c-d"] {
            assert!(validate_qualified_name(key).is_ok(), "{key} should be valid");
        }
    }

    #[test]
    fn qualified_name_rejects_double_slash() {
        assert_eq!(
            validate_qualified_name("a/b/c"),
            Err(Error::TooManySlashes("a/b/c".to_string()))
        );
    }

    #[test]
    fn qualified_name_rejects_bad_prefix() {
        assert!(matches!(
            validate_qualified_name("Upper.Case/name"),
            Err(Error::InvalidPrefix(_))
        ));
        assert!(matches!(validate_qualified_name("/name"), Err(Error::InvalidPrefix(_))));
    }

    #[test]
    fn qualified_name_rejects_bad_name() {
        assert!(matches!(validate_qualified_name("-leading"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_qualified_name("trailing-"), Err(Error::InvalidName(_))));
        assert!(matches!(
            validate_qualified_name(&"x".repeat(64)),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(validate_qualified_name("pre.fix/"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn label_values() {
        assert!(validate_label_value("").is_ok());
        assert!(validate_label_value("abc123").is_ok());
        assert!(validate_label_value(&"v".repeat(63)).is_ok());
        assert!(matches!(
            validate_label_value(&"v".repeat(64)),
            Err(Error::InvalidLabelValue(_))
        ));
        assert!(matches!(
            validate_label_value("has space"),
            Err(Error::InvalidLabelValue(_))
        ));
        assert!(matches!(
            validate_label_value("prod/web"),
            Err(Error::InvalidLabelValue(_))
        ));
    }
}
