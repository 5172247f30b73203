//! Namespace lookup for namespace-selector evaluation.
//!
//! The production implementation keeps a reflector-backed index of every
//! namespace, updated by a watch stream, and falls back to a direct API get
//! on a cache miss.

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{
        reflector,
        reflector::{store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
};
use stopper::Stopper;

#[async_trait]
pub trait NamespaceLookup: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<Namespace>, kube::Error>;
}

pub struct NamespaceCache {
    store: Store<Namespace>,
    client: kube::Client,
}

impl NamespaceCache {
    /// Creates the cache and spawns the task driving its watch stream. The
    /// task ends when `stopper` fires.
    pub fn start(client: kube::Client, stopper: &Stopper) -> (Self, tokio::task::JoinHandle<()>) {
        let api = Api::<Namespace>::all(client.clone());
        let writer = Writer::<Namespace>::default();
        let store = writer.as_reader();
        let stream = reflector(writer, watcher(api, watcher::Config::default()));
        let stopper = stopper.clone();
        let handle = tokio::spawn(async move {
            let mut namespaces = stream.applied_objects().boxed();
            loop {
                match stopper.stop_future(namespaces.next()).await {
                    Some(Some(Ok(namespace))) => {
                        tracing::trace!(name = ?namespace.metadata.name, "namespace cache updated");
                    }
                    Some(Some(Err(error))) => {
                        tracing::warn!(%error, "namespace watch error");
                    }
                    Some(None) | None => break,
                }
            }
            tracing::debug!("namespace cache watcher stopped");
        });
        (Self { store, client }, handle)
    }
}

#[async_trait]
impl NamespaceLookup for NamespaceCache {
    async fn lookup(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        if let Some(namespace) = self.store.get(&ObjectRef::new(name)) {
            return Ok(Some((*namespace).clone()));
        }
        Api::<Namespace>::all(self.client.clone()).get_opt(name).await
    }
}

/// Fixed in-memory lookup table standing in for the cluster in tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticNamespaces(pub std::collections::HashMap<String, Namespace>);

#[cfg(test)]
impl StaticNamespaces {
    pub fn with_labels(namespaces: &[(&str, &[(&str, &str)])]) -> Self {
        let map = namespaces
            .iter()
            .map(|(name, labels)| {
                let namespace = Namespace {
                    metadata: kube::api::ObjectMeta {
                        name: Some(name.to_string()),
                        labels: Some(
                            labels
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        ),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                (name.to_string(), namespace)
            })
            .collect();
        Self(map)
    }
}

#[cfg(test)]
#[async_trait]
impl NamespaceLookup for StaticNamespaces {
    async fn lookup(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Ok(self.0.get(name).cloned())
    }
}
