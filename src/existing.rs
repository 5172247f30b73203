//! The existing-object check: after the webhook is serving, every rule is
//! applied once to the objects already in the cluster, patching them
//! out-of-band through the dynamic API instead of the admission path.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::DynamicObject,
    discovery::{verbs, ApiResource, Discovery, Scope},
};
use stopper::Stopper;
use thiserror::Error;

use crate::config::Registry;
use crate::nscache::NamespaceLookup;
use crate::rule::{MutateMode, MutationResult, Rule};

const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to discover cluster resources: {0}")]
    Discovery(#[source] kube::Error),
}

/// Per-rule outcome counters, logged when the rule's sweep finishes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleStats {
    pub examined: u64,
    pub patched: u64,
    pub failed: u64,
}

impl RuleStats {
    fn absorb(&mut self, other: RuleStats) {
        self.examined += other.examined;
        self.patched += other.patched;
        self.failed += other.failed;
    }
}

struct ListTarget {
    resource: ApiResource,
    namespaced: bool,
}

/// Applies every rule to the objects already present in the cluster.
/// Distinct resource types are processed concurrently on `workers` workers;
/// pages stay sequential within one resource type. Failures on one resource
/// type are counted and logged but never abort the others.
pub async fn check_existing(
    client: kube::Client,
    registry: Arc<Registry>,
    namespaces: Arc<dyn NamespaceLookup>,
    workers: usize,
    stopper: Stopper,
) -> Result<(), Error> {
    // One discovery pass serves every rule; the result is frozen.
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .map_err(Error::Discovery)?;

    for rule in registry.rules() {
        if stopper.is_stopped() {
            tracing::info!("existing object check interrupted by shutdown");
            break;
        }
        let targets = expand_targets(&discovery, rule);
        tracing::debug!(rule = %rule.name, targets = targets.len(), "checking existing objects");
        let stats = stream::iter(targets)
            .map(|target| {
                process_target(
                    client.clone(),
                    rule.clone(),
                    namespaces.clone(),
                    stopper.clone(),
                    target,
                )
            })
            .buffer_unordered(workers.max(1))
            .fold(RuleStats::default(), |mut acc, stats| async move {
                acc.absorb(stats);
                acc
            })
            .await;
        tracing::info!(
            rule = %rule.name,
            examined = stats.examined,
            patched = stats.patched,
            failed = stats.failed,
            "existing object check complete",
        );
    }
    Ok(())
}

/// Expands a rule's targets against the discovered cluster: `"*"` groups
/// mean every group, a pinned version wins over the group's recommended
/// one, and `"*"`/`"*/*"` resources mean everything listable. Subresource
/// targets are skipped, they cannot be listed.
fn expand_targets(discovery: &Discovery, rule: &Rule) -> Vec<ListTarget> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for target in &rule.registration.targets {
        let all_groups = target.api_groups.iter().any(|group| group == "*");
        let all_versions = target.api_versions.iter().any(|version| version == "*");
        for group in discovery.groups() {
            if !all_groups && !target.api_groups.iter().any(|name| name == group.name()) {
                continue;
            }
            let versions: Vec<String> = if all_versions {
                vec![group.preferred_version_or_latest().to_string()]
            } else {
                target.api_versions.clone()
            };
            for version in versions {
                for (resource, caps) in group.versioned_resources(&version) {
                    if !caps.supports_operation(verbs::LIST) {
                        continue;
                    }
                    if !resource_selected(&target.resources, &resource.plural) {
                        continue;
                    }
                    let key = (
                        resource.group.clone(),
                        resource.version.clone(),
                        resource.plural.clone(),
                    );
                    if seen.insert(key) {
                        out.push(ListTarget {
                            namespaced: matches!(caps.scope, Scope::Namespaced),
                            resource,
                        });
                    }
                }
            }
        }
    }
    out
}

fn resource_selected(resources: &[String], plural: &str) -> bool {
    resources.iter().any(|resource| {
        if resource == "*" || resource == "*/*" {
            return true;
        }
        if resource.contains('/') {
            return false;
        }
        resource == plural
    })
}

/// Lists one resource type in pages and runs the rule over every object.
async fn process_target(
    client: kube::Client,
    rule: Arc<Rule>,
    namespaces: Arc<dyn NamespaceLookup>,
    stopper: Stopper,
    target: ListTarget,
) -> RuleStats {
    let mut stats = RuleStats::default();
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &target.resource);
    let mut params = ListParams::default().limit(PAGE_LIMIT);
    loop {
        if stopper.is_stopped() {
            break;
        }
        let page = match api.list(&params).await {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(
                    rule = %rule.name,
                    resource = %target.resource.plural,
                    %error,
                    "failed to list existing objects",
                );
                stats.failed += 1;
                break;
            }
        };
        for object in &page.items {
            stats.examined += 1;
            match mutate_existing(&client, &rule, namespaces.as_ref(), &target, object).await {
                Ok(true) => stats.patched += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(
                        rule = %rule.name,
                        resource = %target.resource.plural,
                        name = ?object.metadata.name,
                        error = %format!("{error:#}"),
                        "failed to patch existing object",
                    );
                    stats.failed += 1;
                }
            }
        }
        match page.metadata.continue_ {
            Some(token) if !token.is_empty() => {
                params = params.continue_token(&token);
            }
            _ => break,
        }
    }
    stats
}

async fn mutate_existing(
    client: &kube::Client,
    rule: &Rule,
    namespaces: &dyn NamespaceLookup,
    target: &ListTarget,
    object: &DynamicObject,
) -> Result<bool> {
    let raw = serde_json::to_vec(object).context("failed to serialize object")?;
    let outcome = rule
        .mutate(&raw, &target.resource.kind, namespaces, MutateMode::Backfill)
        .await
        .context("failed to evaluate rule")?;
    let patch = match outcome {
        MutationResult::Patched(patch) => patch,
        MutationResult::Blocked(_) => {
            // Blocking only makes sense at admission time; an object that
            // already exists is left alone.
            tracing::debug!(rule = %rule.name, name = ?object.metadata.name, "existing object matches a block rule");
            return Ok(false);
        }
        MutationResult::Unchanged => return Ok(false),
    };

    let name = object
        .metadata
        .name
        .as_deref()
        .context("object has no name")?;
    let api: Api<DynamicObject> = match (&object.metadata.namespace, target.namespaced) {
        (Some(namespace), true) => {
            Api::namespaced_with(client.clone(), namespace, &target.resource)
        }
        _ => Api::all_with(client.clone(), &target.resource),
    };
    api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
        .context("failed to submit patch")?;
    tracing::info!(
        rule = %rule.name,
        resource = %target.resource.plural,
        name = %name,
        "patched existing object",
    );
    Ok(true)
}
