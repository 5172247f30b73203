//! Installs one MutatingWebhookConfiguration per rule at startup. The
//! upsert is a delete-then-create: registration is a one-shot idempotent
//! effect, not a reconciled resource.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use k8s_openapi::{
    api::admissionregistration::v1::{
        MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
        WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    ByteString,
};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use thiserror::Error;

use crate::config::{Config, Registry};
use crate::rule::Rule;

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "kube-graffiti";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read CA bundle {path}: {source}")]
    ReadCaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to delete existing MutatingWebhookConfiguration {name:?}: {source}")]
    Delete {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to create MutatingWebhookConfiguration {name:?}: {source}")]
    Create {
        name: String,
        #[source]
        source: kube::Error,
    },
}

fn webhook_client_config(config: &Config, ca_bundle: ByteString, path: &str) -> WebhookClientConfig {
    WebhookClientConfig {
        ca_bundle: Some(ca_bundle),
        service: Some(ServiceReference {
            namespace: config.server.namespace.clone(),
            name: config.server.service.clone(),
            path: Some(path.to_string()),
            port: Some(i32::from(config.server.port)),
        }),
        url: None,
    }
}

/// Popluate MutatingWebhookConfiguration for one rule
fn webhook_configuration(
    config: &Config,
    rule: &Rule,
    ca_bundle: ByteString,
) -> MutatingWebhookConfiguration {
    let mut labels = BTreeMap::new();
    labels.insert(
        MANAGED_BY_LABEL_KEY.to_string(),
        MANAGED_BY_LABEL_VALUE.to_string(),
    );

    let rules = rule
        .registration
        .targets
        .iter()
        .map(|target| RuleWithOperations {
            api_groups: Some(target.api_groups.clone()),
            api_versions: Some(target.api_versions.clone()),
            resources: Some(target.resources.clone()),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            scope: None,
        })
        .collect();

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(rule.name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: format!("{}.{}", rule.name, config.server.company_domain),
            failure_policy: Some(rule.registration.failure_policy.to_string()),
            namespace_selector: rule
                .registration
                .namespace_selector
                .as_ref()
                .map(LabelSelector::from),
            rules: Some(rules),
            client_config: webhook_client_config(config, ca_bundle, &rule.path),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            ..Default::default()
        }]),
    }
}

/// Upserts the webhook configuration for every rule in the registry.
/// Failure here is fatal: a rule that cannot register must not be served.
pub async fn register_rules(
    client: kube::Client,
    config: &Config,
    registry: &Registry,
) -> Result<(), Error> {
    let ca_bundle = fs::read(&config.server.ca_cert_path).map_err(|source| Error::ReadCaBundle {
        path: config.server.ca_cert_path.clone(),
        source,
    })?;
    let ca_bundle = ByteString(ca_bundle);

    let mwc_api = Api::<MutatingWebhookConfiguration>::all(client);
    for rule in registry.rules() {
        let mwc = webhook_configuration(config, rule, ca_bundle.clone());
        match mwc_api.delete(&rule.name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::debug!(rule = %rule.name, "deleted existing webhook configuration");
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(source) => {
                return Err(Error::Delete {
                    name: rule.name.clone(),
                    source,
                });
            }
        }
        mwc_api
            .create(&PostParams::default(), &mwc)
            .await
            .map_err(|source| Error::Create {
                name: rule.name.clone(),
                source,
            })?;
        tracing::info!(rule = %rule.name, path = %rule.path, "registered mutating webhook");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_yaml::from_str(
            r#"
server:
  namespace: graffiti
  service: kube-graffiti
  company-domain: example.org
rules:
- registration:
    name: paint-pods
    namespace-selector: "team=runtime,env in (prod, staging)"
    failure-policy: Fail
    targets:
    - api-groups: [""]
      api-versions: ["v1"]
      resources: ["pods", "pods/status"]
  payload:
    block: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn builds_a_webhook_configuration_per_rule() {
        let config = config();
        let registry = Registry::new(&config).unwrap();
        let rule = registry.rule("paint-pods").unwrap();
        let mwc = webhook_configuration(&config, rule, ByteString(b"pem".to_vec()));

        assert_eq!(mwc.metadata.name.as_deref(), Some("paint-pods"));
        let webhooks = mwc.webhooks.unwrap();
        assert_eq!(webhooks.len(), 1);
        let webhook = &webhooks[0];
        assert_eq!(webhook.name, "paint-pods.example.org");
        assert_eq!(webhook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(webhook.side_effects, "None");

        let rules = webhook.rules.as_ref().unwrap();
        assert_eq!(rules[0].api_groups.as_deref(), Some(&["".to_string()][..]));
        assert_eq!(
            rules[0].operations.as_deref(),
            Some(&["CREATE".to_string(), "UPDATE".to_string()][..])
        );
        assert_eq!(
            rules[0].resources.as_deref(),
            Some(&["pods".to_string(), "pods/status".to_string()][..])
        );

        let selector = webhook.namespace_selector.as_ref().unwrap();
        assert_eq!(
            selector.match_labels.as_ref().unwrap().get("team").map(String::as_str),
            Some("runtime")
        );
        assert_eq!(selector.match_expressions.as_ref().unwrap()[0].operator, "In");

        let client_config = &webhook.client_config;
        assert_eq!(client_config.ca_bundle.as_ref().unwrap().0, b"pem".to_vec());
        let service = client_config.service.as_ref().unwrap();
        assert_eq!(service.namespace, "graffiti");
        assert_eq!(service.name, "kube-graffiti");
        assert_eq!(service.port, Some(8443));
        assert_eq!(service.path.as_deref(), Some("/graffiti/paint-pods"));
    }
}
