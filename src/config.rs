//! Configuration file model and the startup validation that turns it into
//! the immutable rule registry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::rule::{
    endpoint_path, Additions, BooleanOperator, Deletions, FailurePolicy, Matchers, Payload,
    Registration, Rule, Target,
};
use crate::selector::{self, Selector};
use crate::{template, validation};

fn default_log_level() -> String {
    "info".to_string()
}

fn default_check_existing_workers() -> usize {
    4
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_server_port() -> u16 {
    8443
}

fn default_company_domain() -> String {
    "acme.com".to_string()
}

fn default_ca_cert_path() -> PathBuf {
    PathBuf::from("/ca-cert")
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/server-cert")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/server-key")
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub check_existing: bool,
    /// Number of resource types the existing-object check processes at once.
    #[serde(default = "default_check_existing_workers")]
    pub check_existing_workers: usize,
    #[serde(default)]
    pub health_checker: HealthChecker,
    pub server: Server,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HealthChecker {
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self {
            port: default_health_port(),
            path: default_health_path(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Server {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_company_domain")]
    pub company_domain: String,
    /// Namespace of the Service the API server calls back into.
    pub namespace: String,
    /// Name of that Service.
    pub service: String,
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuleConfig {
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub matchers: MatchersConfig,
    pub payload: PayloadConfig,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RegistrationConfig {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub namespace_selector: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MatchersConfig {
    #[serde(default)]
    pub label_selectors: Vec<String>,
    #[serde(default)]
    pub field_selectors: Vec<String>,
    #[serde(default)]
    pub boolean_operator: BooleanOperator,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PayloadConfig {
    #[serde(default)]
    pub additions: Option<Additions>,
    #[serde(default)]
    pub deletions: Option<Deletions>,
    #[serde(default)]
    pub json_patch: Option<String>,
    #[serde(default)]
    pub block: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("config must contain at least one rule")]
    NoRules,
    #[error("rule name must not be empty")]
    EmptyRuleName,
    #[error("duplicate rule name {0:?}")]
    DuplicateRuleName(String),
    #[error("rule {rule:?}: registration must name at least one target")]
    NoTargets { rule: String },
    #[error("rule {rule:?}: target {field} must not be empty")]
    EmptyTargetField { rule: String, field: &'static str },
    #[error("rule {rule:?}: invalid resource {resource:?}")]
    InvalidResource { rule: String, resource: String },
    #[error("rule {rule:?}: a wildcard resource cannot take a subresource: {resource:?}")]
    WildcardSubresource { rule: String, resource: String },
    #[error("rule {rule:?}: invalid namespace selector: {source}")]
    NamespaceSelector {
        rule: String,
        #[source]
        source: selector::Error,
    },
    #[error("rule {rule:?}: invalid label selector {selector:?}: {source}")]
    LabelSelector {
        rule: String,
        selector: String,
        #[source]
        source: selector::Error,
    },
    #[error("rule {rule:?}: invalid field selector {selector:?}: {source}")]
    FieldSelector {
        rule: String,
        selector: String,
        #[source]
        source: selector::Error,
    },
    #[error("rule {rule:?}: invalid label key {key:?}: {source}")]
    LabelKey {
        rule: String,
        key: String,
        #[source]
        source: validation::Error,
    },
    #[error("rule {rule:?}: invalid label value {value:?}: {source}")]
    LabelValue {
        rule: String,
        value: String,
        #[source]
        source: validation::Error,
    },
    #[error("rule {rule:?}: invalid annotation key {key:?}: {source}")]
    AnnotationKey {
        rule: String,
        key: String,
        #[source]
        source: validation::Error,
    },
    #[error("rule {rule:?}: invalid template in value {value:?}: {source}")]
    Template {
        rule: String,
        value: String,
        #[source]
        source: template::Error,
    },
    #[error(
        "rule {rule:?}: payload must contain exactly one of additions/deletions, json-patch, or block"
    )]
    AmbiguousPayload { rule: String },
    #[error("rule {rule:?}: payload is empty")]
    EmptyPayload { rule: String },
    #[error("rule {rule:?}: json-patch is not a valid RFC 6902 patch: {source}")]
    JsonPatch {
        rule: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(Error::Parse)
    }
}

/// The immutable rule table shared by the dispatcher and the
/// existing-object check.
pub struct Registry {
    rules: Vec<Arc<Rule>>,
    by_name: HashMap<String, Arc<Rule>>,
}

impl Registry {
    pub fn new(config: &Config) -> Result<Self, Error> {
        if config.rules.is_empty() {
            return Err(Error::NoRules);
        }
        let mut rules = Vec::with_capacity(config.rules.len());
        let mut by_name = HashMap::with_capacity(config.rules.len());
        for rule_config in &config.rules {
            let rule = Arc::new(build_rule(rule_config)?);
            if by_name.insert(rule.name.clone(), rule.clone()).is_some() {
                return Err(Error::DuplicateRuleName(rule.name.clone()));
            }
            rules.push(rule);
        }
        Ok(Self { rules, by_name })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.by_name.get(name)
    }
}

fn validate_targets(rule: &str, targets: &[Target]) -> Result<(), Error> {
    if targets.is_empty() {
        return Err(Error::NoTargets {
            rule: rule.to_string(),
        });
    }
    for target in targets {
        if target.api_groups.is_empty() {
            return Err(Error::EmptyTargetField {
                rule: rule.to_string(),
                field: "api-groups",
            });
        }
        if target.api_versions.is_empty() || target.api_versions.iter().any(String::is_empty) {
            return Err(Error::EmptyTargetField {
                rule: rule.to_string(),
                field: "api-versions",
            });
        }
        if target.resources.is_empty() {
            return Err(Error::EmptyTargetField {
                rule: rule.to_string(),
                field: "resources",
            });
        }
        for resource in &target.resources {
            if resource == "*" || resource == "*/*" {
                continue;
            }
            match resource.split('/').collect::<Vec<_>>().as_slice() {
                [base] if !base.is_empty() => {}
                [base, sub] if !base.is_empty() && !sub.is_empty() => {
                    if *base == "*" {
                        return Err(Error::WildcardSubresource {
                            rule: rule.to_string(),
                            resource: resource.clone(),
                        });
                    }
                }
                _ => {
                    return Err(Error::InvalidResource {
                        rule: rule.to_string(),
                        resource: resource.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_additions(rule: &str, additions: &Additions) -> Result<(), Error> {
    for (key, value) in &additions.labels {
        validation::validate_qualified_name(key).map_err(|source| Error::LabelKey {
            rule: rule.to_string(),
            key: key.clone(),
            source,
        })?;
        if template::is_templated(value) {
            // Length and charset are re-checked once the template has been
            // expanded against a concrete object.
            template::validate(value).map_err(|source| Error::Template {
                rule: rule.to_string(),
                value: value.clone(),
                source,
            })?;
        } else {
            validation::validate_label_value(value).map_err(|source| Error::LabelValue {
                rule: rule.to_string(),
                value: value.clone(),
                source,
            })?;
        }
    }
    for (key, value) in &additions.annotations {
        validation::validate_annotation_key(key).map_err(|source| Error::AnnotationKey {
            rule: rule.to_string(),
            key: key.clone(),
            source,
        })?;
        if template::is_templated(value) {
            template::validate(value).map_err(|source| Error::Template {
                rule: rule.to_string(),
                value: value.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

fn build_payload(rule: &str, payload: &PayloadConfig) -> Result<Payload, Error> {
    let additions = payload.additions.clone().unwrap_or_default();
    let deletions = payload.deletions.clone().unwrap_or_default();
    let has_mutations = !additions.is_empty() || !deletions.is_empty();
    let categories = usize::from(has_mutations)
        + usize::from(payload.json_patch.is_some())
        + usize::from(payload.block);
    match categories {
        0 => Err(Error::EmptyPayload {
            rule: rule.to_string(),
        }),
        1 => {
            if payload.block {
                Ok(Payload::Block)
            } else if let Some(json_patch) = &payload.json_patch {
                let parsed = serde_json::from_str(json_patch).map_err(|source| Error::JsonPatch {
                    rule: rule.to_string(),
                    source,
                })?;
                Ok(Payload::JsonPatch(parsed))
            } else {
                validate_additions(rule, &additions)?;
                Ok(Payload::Mutations {
                    additions,
                    deletions,
                })
            }
        }
        _ => Err(Error::AmbiguousPayload {
            rule: rule.to_string(),
        }),
    }
}

fn build_rule(config: &RuleConfig) -> Result<Rule, Error> {
    let name = config.registration.name.clone();
    if name.is_empty() {
        return Err(Error::EmptyRuleName);
    }
    validate_targets(&name, &config.registration.targets)?;

    let namespace_selector = config
        .registration
        .namespace_selector
        .as_deref()
        .map(Selector::parse_label)
        .transpose()
        .map_err(|source| Error::NamespaceSelector {
            rule: name.clone(),
            source,
        })?;

    let label_selectors = config
        .matchers
        .label_selectors
        .iter()
        .map(|s| {
            Selector::parse_label(s).map_err(|source| Error::LabelSelector {
                rule: name.clone(),
                selector: s.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let field_selectors = config
        .matchers
        .field_selectors
        .iter()
        .map(|s| {
            Selector::parse_field(s).map_err(|source| Error::FieldSelector {
                rule: name.clone(),
                selector: s.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let payload = build_payload(&name, &config.payload)?;

    Ok(Rule {
        path: endpoint_path(&name),
        name,
        registration: Registration {
            targets: config.registration.targets.clone(),
            namespace_selector,
            failure_policy: config.registration.failure_policy,
        },
        matchers: Matchers {
            label_selectors,
            field_selectors,
            boolean_operator: config.matchers.boolean_operator,
        },
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  namespace: graffiti
  service: kube-graffiti
rules:
- registration:
    name: paint-pods
    targets:
    - api-groups: [""]
      api-versions: ["v1"]
      resources: ["pods"]
  matchers:
    label-selectors: ["author=david"]
  payload:
    additions:
      labels:
        painted: "true"
"#;

    fn parse(yaml: &str) -> Result<Registry, Error> {
        let config: Config = serde_yaml::from_str(yaml).map_err(Error::Parse)?;
        Registry::new(&config)
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(!config.check_existing);
        assert_eq!(config.check_existing_workers, 4);
        assert_eq!(config.health_checker.port, 8080);
        assert_eq!(config.health_checker.path, "/healthz");
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.ca_cert_path, PathBuf::from("/ca-cert"));
        assert_eq!(config.server.cert_path, PathBuf::from("/server-cert"));
        assert_eq!(config.server.key_path, PathBuf::from("/server-key"));

        let registry = Registry::new(&config).unwrap();
        let rule = registry.rule("paint-pods").unwrap();
        assert_eq!(rule.path, "/graffiti/paint-pods");
        assert_eq!(rule.registration.failure_policy, FailurePolicy::Ignore);
        assert_eq!(rule.matchers.boolean_operator, BooleanOperator::And);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = MINIMAL.replace("server:", "surprise: true\nserver:");
        assert!(matches!(parse(&yaml), Err(Error::Parse(_))));
    }

    #[test]
    fn missing_server_fields_are_rejected() {
        let yaml = MINIMAL.replace("  service: kube-graffiti\n", "");
        assert!(matches!(parse(&yaml), Err(Error::Parse(_))));
    }

    #[test]
    fn empty_rule_set_is_rejected() {
        let yaml = "server:\n  namespace: g\n  service: s\nrules: []\n";
        assert!(matches!(parse(yaml), Err(Error::NoRules)));
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let rule = r#"
- registration:
    name: twin
    targets:
    - api-groups: ["*"]
      api-versions: ["*"]
      resources: ["*"]
  payload:
    block: true
"#;
        let yaml = format!("server:\n  namespace: g\n  service: s\nrules:{rule}{}", rule.trim_start_matches('\n'));
        assert!(matches!(parse(&yaml), Err(Error::DuplicateRuleName(name)) if name == "twin"));
    }

    #[test]
    fn failure_policy_and_operator_are_case_normalized() {
        let yaml = MINIMAL
            .replace(
                "    name: paint-pods\n",
                "    name: paint-pods\n    failure-policy: fail\n",
            )
            .replace(
                "    label-selectors: [\"author=david\"]\n",
                "    label-selectors: [\"author=david\"]\n    boolean-operator: or\n",
            );
        let registry = parse(&yaml).unwrap();
        let rule = registry.rule("paint-pods").unwrap();
        assert_eq!(rule.registration.failure_policy, FailurePolicy::Fail);
        assert_eq!(rule.matchers.boolean_operator, BooleanOperator::Or);

        let yaml = MINIMAL.replace(
            "    name: paint-pods\n",
            "    name: paint-pods\n    failure-policy: sometimes\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::Parse(_))));
    }

    #[test]
    fn wildcard_subresources_are_rejected() {
        let yaml = MINIMAL.replace("[\"pods\"]", "[\"*/status\"]");
        assert!(matches!(parse(&yaml), Err(Error::WildcardSubresource { .. })));
        let yaml = MINIMAL.replace("[\"pods\"]", "[\"pods/status\"]");
        assert!(parse(&yaml).is_ok());
        let yaml = MINIMAL.replace("[\"pods\"]", "[\"*/*\"]");
        assert!(parse(&yaml).is_ok());
        let yaml = MINIMAL.replace("[\"pods\"]", "[\"a/b/c\"]");
        assert!(matches!(parse(&yaml), Err(Error::InvalidResource { .. })));
    }

    #[test]
    fn selectors_must_parse() {
        let yaml = MINIMAL.replace("author=david", "author in (");
        assert!(matches!(parse(&yaml), Err(Error::LabelSelector { .. })));
        let yaml = MINIMAL.replace(
            "    label-selectors: [\"author=david\"]\n",
            "    field-selectors: [\"metadata.name\"]\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::FieldSelector { .. })));
        let yaml = MINIMAL.replace(
            "    name: paint-pods\n",
            "    name: paint-pods\n    namespace-selector: \"team in (\"\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::NamespaceSelector { .. })));
    }

    #[test]
    fn long_label_values_need_a_template() {
        let long = "v".repeat(64);
        let yaml = MINIMAL.replace("painted: \"true\"", &format!("painted: \"{long}\""));
        assert!(matches!(parse(&yaml), Err(Error::LabelValue { .. })));
        let yaml = MINIMAL.replace(
            "painted: \"true\"",
            "painted: '{{ index . \"metadata.name\" }}'",
        );
        assert!(parse(&yaml).is_ok());
    }

    #[test]
    fn annotation_keys_are_validated() {
        let yaml = MINIMAL.replace(
            "      labels:\n        painted: \"true\"\n",
            "      annotations:\n        a/b/c: \"x\"\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::AnnotationKey { .. })));
    }

    #[test]
    fn payload_must_be_exactly_one_category() {
        let yaml = MINIMAL.replace("  payload:\n", "  payload:\n    block: true\n");
        assert!(matches!(parse(&yaml), Err(Error::AmbiguousPayload { .. })));

        let yaml = MINIMAL.replace(
            "    additions:\n      labels:\n        painted: \"true\"\n",
            "    additions: {}\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::EmptyPayload { .. })));
    }

    #[test]
    fn literal_json_patches_are_parsed_at_load() {
        let yaml = MINIMAL.replace(
            "    additions:\n      labels:\n        painted: \"true\"\n",
            "    json-patch: '[{\"op\": \"add\", \"path\": \"/metadata/labels/x\", \"value\": \"y\"}]'\n",
        );
        let registry = parse(&yaml).unwrap();
        assert!(matches!(
            registry.rule("paint-pods").unwrap().payload,
            Payload::JsonPatch(_)
        ));

        let yaml = MINIMAL.replace(
            "    additions:\n      labels:\n        painted: \"true\"\n",
            "    json-patch: 'not a patch'\n",
        );
        assert!(matches!(parse(&yaml), Err(Error::JsonPatch { .. })));
    }
}
