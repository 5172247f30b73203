//! Parsing and evaluation of Kubernetes selector strings.
//!
//! Label selectors use the full grammar (`=`, `==`, `!=`, `in`, `notin`,
//! existence and `!` non-existence). Field selectors are restricted to
//! `=`, `==` and `!=` with `,` as AND, matching what the API server accepts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::validation;

type Map = BTreeMap<String, String>;

static SET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+(in|notin)\s*\(([^()]*)\)$").unwrap());
static EQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^=!\s]+)\s*(==|=|!=)\s*(\S*)$").unwrap());

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("selector must not be empty")]
    Empty,
    #[error("unable to parse requirement {0:?}")]
    BadRequirement(String),
    #[error("unbalanced parentheses in {0:?}")]
    UnbalancedParentheses(String),
    #[error("set operator requires at least one value: {0:?}")]
    EmptyValueSet(String),
    #[error("field selectors support only '=', '==' and '!=': {0:?}")]
    OperatorNotPermitted(String),
    #[error("invalid key {key:?}: {source}")]
    Key {
        key: String,
        #[source]
        source: validation::Error,
    },
    #[error("invalid value {value:?}: {source}")]
    Value {
        value: String,
        #[source]
        source: validation::Error,
    },
}

/// A single selector requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Equal(String, String),
    NotEqual(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Expression {
    fn matches(&self, map: &Map) -> bool {
        match self {
            Expression::In(key, values) => match map.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match map.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Equal(key, value) => map.get(key) == Some(value),
            Expression::NotEqual(key, value) => map.get(key) != Some(value),
            Expression::Exists(key) => map.contains_key(key),
            Expression::DoesNotExist(key) => !map.contains_key(key),
        }
    }
}

/// A parsed selector: the conjunction of its requirements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    source: String,
    requirements: Vec<Expression>,
}

impl Selector {
    /// Parses a label selector string.
    pub fn parse_label(s: &str) -> Result<Self, Error> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Empty);
        }
        let requirements = split_requirements(trimmed)?
            .into_iter()
            .map(|req| parse_label_requirement(&req))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: s.to_string(),
            requirements,
        })
    }

    /// Parses a field selector string. Keys are dotted field paths and are
    /// not validated as label keys; only equality operators are accepted.
    pub fn parse_field(s: &str) -> Result<Self, Error> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Empty);
        }
        let mut requirements = Vec::new();
        for req in trimmed.split(',') {
            let req = req.trim();
            if req.is_empty() {
                return Err(Error::BadRequirement(req.to_string()));
            }
            if SET_RE.is_match(req) {
                return Err(Error::OperatorNotPermitted(req.to_string()));
            }
            let caps = EQ_RE
                .captures(req)
                .ok_or_else(|| Error::OperatorNotPermitted(req.to_string()))?;
            let key = caps[1].to_string();
            let value = caps[3].to_string();
            requirements.push(match &caps[2] {
                "!=" => Expression::NotEqual(key, value),
                _ => Expression::Equal(key, value),
            });
        }
        Ok(Self {
            source: s.to_string(),
            requirements,
        })
    }

    /// True when every requirement is satisfied by `map`.
    pub fn matches(&self, map: &Map) -> bool {
        self.requirements.iter().all(|req| req.matches(map))
    }

    pub fn requirements(&self) -> &[Expression] {
        &self.requirements
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Splits on commas, keeping commas inside `in (...)` value sets intact.
fn split_requirements(s: &str) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnbalancedParentheses(s.to_string()))?;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(Error::UnbalancedParentheses(s.to_string()));
    }
    out.push(current.trim().to_string());
    Ok(out)
}

fn check_label_key(key: &str) -> Result<(), Error> {
    validation::validate_qualified_name(key).map_err(|source| Error::Key {
        key: key.to_string(),
        source,
    })
}

fn check_label_value(value: &str) -> Result<(), Error> {
    validation::validate_label_value(value).map_err(|source| Error::Value {
        value: value.to_string(),
        source,
    })
}

fn parse_label_requirement(req: &str) -> Result<Expression, Error> {
    if req.is_empty() {
        return Err(Error::BadRequirement(req.to_string()));
    }
    if let Some(key) = req.strip_prefix('!') {
        let key = key.trim();
        check_label_key(key)?;
        return Ok(Expression::DoesNotExist(key.to_string()));
    }
    if let Some(caps) = SET_RE.captures(req) {
        let key = caps[1].to_string();
        check_label_key(&key)?;
        let mut values = BTreeSet::new();
        for value in caps[3].split(',') {
            let value = value.trim();
            if value.is_empty() {
                return Err(Error::EmptyValueSet(req.to_string()));
            }
            check_label_value(value)?;
            values.insert(value.to_string());
        }
        return Ok(match &caps[2] {
            "notin" => Expression::NotIn(key, values),
            _ => Expression::In(key, values),
        });
    }
    if let Some(caps) = EQ_RE.captures(req) {
        let key = caps[1].to_string();
        let value = caps[3].to_string();
        check_label_key(&key)?;
        check_label_value(&value)?;
        return Ok(match &caps[2] {
            "!=" => Expression::NotEqual(key, value),
            _ => Expression::Equal(key, value),
        });
    }
    check_label_key(req).map_err(|_| Error::BadRequirement(req.to_string()))?;
    Ok(Expression::Exists(req.to_string()))
}

impl From<&Selector> for LabelSelector {
    fn from(selector: &Selector) -> Self {
        let mut match_labels = BTreeMap::new();
        let mut expressions = Vec::new();
        for req in &selector.requirements {
            match req {
                Expression::Equal(key, value) => {
                    match_labels.insert(key.clone(), value.clone());
                }
                Expression::NotEqual(key, value) => expressions.push(LabelSelectorRequirement {
                    key: key.clone(),
                    operator: "NotIn".to_string(),
                    values: Some(vec![value.clone()]),
                }),
                Expression::In(key, values) => expressions.push(LabelSelectorRequirement {
                    key: key.clone(),
                    operator: "In".to_string(),
                    values: Some(values.iter().cloned().collect()),
                }),
                Expression::NotIn(key, values) => expressions.push(LabelSelectorRequirement {
                    key: key.clone(),
                    operator: "NotIn".to_string(),
                    values: Some(values.iter().cloned().collect()),
                }),
                Expression::Exists(key) => expressions.push(LabelSelectorRequirement {
                    key: key.clone(),
                    operator: "Exists".to_string(),
                    values: None,
                }),
                Expression::DoesNotExist(key) => expressions.push(LabelSelectorRequirement {
                    key: key.clone(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                }),
            }
        }
        LabelSelector {
            match_labels: (!match_labels.is_empty()).then_some(match_labels),
            match_expressions: (!expressions.is_empty()).then_some(expressions),
        }
    }
}
