//! The rule model and the evaluator that turns one rule plus one object
//! into a patch, a rejection, or nothing.

use std::collections::BTreeMap;
use std::fmt;

use json_patch::Patch;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::fieldmap;
use crate::nscache::NamespaceLookup;
use crate::patch;
use crate::selector::Selector;

/// FailurePolicy for the registered webhook configuration.
///
/// Decides how the API server treats webhook call failures - allowed values
/// are Ignore or Fail. Defaults to Ignore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Ignore,
    Fail,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ignore => write!(f, "Ignore"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

impl<'de> Deserialize<'de> for FailurePolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "fail" => Ok(Self::Fail),
            _ => Err(serde::de::Error::custom(format!(
                "unknown failure policy {s:?}, expected Ignore or Fail"
            ))),
        }
    }
}

/// How the label-selector and field-selector verdicts are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BooleanOperator {
    #[default]
    And,
    Or,
    Xor,
}

impl<'de> Deserialize<'de> for BooleanOperator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            "xor" => Ok(Self::Xor),
            _ => Err(serde::de::Error::custom(format!(
                "unknown boolean operator {s:?}, expected AND, OR or XOR"
            ))),
        }
    }
}

impl BooleanOperator {
    /// `None` means the corresponding selector list is empty.
    fn combine(self, labels: Option<bool>, fields: Option<bool>) -> bool {
        match self {
            Self::And => labels.unwrap_or(true) && fields.unwrap_or(true),
            Self::Or => labels.unwrap_or(false) || fields.unwrap_or(false),
            Self::Xor => labels.unwrap_or(false) ^ fields.unwrap_or(false),
        }
    }
}

/// One group/version/resource scope a rule registers for. `"*"` wildcards
/// any of the three lists; `"*/*"` is accepted for resources.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Target {
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Additions {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Additions {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Deletions {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl Deletions {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

/// What a matching rule does to the object. The three categories are
/// mutually exclusive, enforced when the rule is built from config.
#[derive(Clone, Debug)]
pub enum Payload {
    Mutations {
        additions: Additions,
        deletions: Deletions,
    },
    JsonPatch(Patch),
    Block,
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub targets: Vec<Target>,
    pub namespace_selector: Option<Selector>,
    pub failure_policy: FailurePolicy,
}

#[derive(Clone, Debug)]
pub struct Matchers {
    pub label_selectors: Vec<Selector>,
    pub field_selectors: Vec<Selector>,
    pub boolean_operator: BooleanOperator,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    /// The URL path this rule serves and registers, `/graffiti/<name>`.
    pub path: String,
    pub registration: Registration,
    pub matchers: Matchers,
    pub payload: Payload,
}

/// Whether the object arrived through an admission review or was listed
/// from the cluster by the existing-object check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutateMode {
    Admission,
    Backfill,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationResult {
    Patched(Patch),
    Blocked(String),
    Unchanged,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse object: {0}")]
    ParseObject(#[source] serde_json::Error),
    #[error("failed to flatten object: {0}")]
    Flatten(#[from] fieldmap::Error),
    #[error("failed to build patch: {0}")]
    Patch(#[from] patch::Error),
    #[error("failed to look up namespace {name:?}: {source}")]
    NamespaceLookup {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Builds the serving path for a rule name: `/graffiti/` plus the
/// percent-escaped name (RFC 3986 path-segment escaping).
pub fn endpoint_path(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => escaped.push(byte as char),
            b'-' | b'_' | b'.' | b'~' | b'$' | b'&' | b'+' | b':' | b'=' | b'@' => {
                escaped.push(byte as char)
            }
            _ => escaped.push_str(&format!("%{byte:02X}")),
        }
    }
    format!("/graffiti/{escaped}")
}

struct ObjectMeta {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
}

fn extract_meta(object: &Value) -> ObjectMeta {
    let string_at = |pointer: &str| {
        object
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let labels = object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    ObjectMeta {
        name: string_at("/metadata/name"),
        namespace: string_at("/metadata/namespace"),
        labels,
    }
}

impl Rule {
    /// Evaluates the rule against one object. Returns the produced patch,
    /// a block verdict, or [`MutationResult::Unchanged`] when the matchers
    /// do not select the object.
    pub async fn mutate(
        &self,
        raw: &[u8],
        kind: &str,
        namespaces: &dyn NamespaceLookup,
        mode: MutateMode,
    ) -> Result<MutationResult, Error> {
        let object: Value = serde_json::from_slice(raw).map_err(Error::ParseObject)?;
        let fields = fieldmap::flatten(&object)?;
        let meta = extract_meta(&object);

        if !self
            .namespace_gate(&meta, kind, namespaces)
            .await?
        {
            return Ok(MutationResult::Unchanged);
        }
        if !self.matchers_select(&meta, &fields) {
            return Ok(MutationResult::Unchanged);
        }

        match &self.payload {
            Payload::Block => Ok(MutationResult::Blocked(format!(
                "blocked by kube-graffiti rule: {}",
                self.name
            ))),
            Payload::JsonPatch(patch) => Ok(MutationResult::Patched(patch.clone())),
            Payload::Mutations {
                additions,
                deletions,
            } => {
                let produced = if mode == MutateMode::Backfill && kind == "Namespace" {
                    patch::whole_object_patch(&object, additions, deletions, &fields)?
                } else {
                    patch::metadata_patch(&object, additions, deletions, &fields)?
                };
                Ok(match produced {
                    Some(patch) => MutationResult::Patched(patch),
                    None => MutationResult::Unchanged,
                })
            }
        }
    }

    /// Applies the registration's namespace selector. Namespaces evaluate
    /// their own labels; a cluster-scoped non-Namespace object can never
    /// match; anything else matches through its namespace's labels.
    async fn namespace_gate(
        &self,
        meta: &ObjectMeta,
        kind: &str,
        namespaces: &dyn NamespaceLookup,
    ) -> Result<bool, Error> {
        let Some(ns_selector) = &self.registration.namespace_selector else {
            return Ok(true);
        };
        if kind == "Namespace" {
            return Ok(ns_selector.matches(&meta.labels));
        }
        if meta.namespace.is_empty() {
            return Ok(false);
        }
        let namespace = namespaces
            .lookup(&meta.namespace)
            .await
            .map_err(|source| Error::NamespaceLookup {
                name: meta.namespace.clone(),
                source,
            })?;
        let Some(namespace) = namespace else {
            return Ok(false);
        };
        let ns_labels = namespace.metadata.labels.unwrap_or_default();
        Ok(ns_selector.matches(&ns_labels))
    }

    fn matchers_select(&self, meta: &ObjectMeta, fields: &fieldmap::FieldMap) -> bool {
        // Synthetic name/namespace labels; real labels win on collision.
        let mut labels = BTreeMap::new();
        labels.insert("name".to_string(), meta.name.clone());
        labels.insert("namespace".to_string(), meta.namespace.clone());
        labels.extend(meta.labels.clone());

        let label_matches = match self.matchers.label_selectors.as_slice() {
            [] => None,
            selectors => Some(selectors.iter().any(|s| s.matches(&labels))),
        };
        let field_matches = match self.matchers.field_selectors.as_slice() {
            [] => None,
            selectors => Some(selectors.iter().any(|s| s.matches(fields))),
        };
        self.matchers
            .boolean_operator
            .combine(label_matches, field_matches)
    }
}
