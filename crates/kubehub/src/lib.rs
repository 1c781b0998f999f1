//! Tether kubehub: client context and the cluster-backed implementations of
//! the lookup, patch and watch seams.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tether_core::{ApplyError, LookupError, ObjectLister, PatchOperation, Patcher, Vocabulary};
use tether_reconcile::{ObjectSource, WatchEvent};
use tracing::{debug, info, warn};

/// Bound shared by every namespaced built-in kind the controllers touch.
pub trait NamespacedKind:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + k8s_openapi::Resource
    + Clone
    + DeserializeOwned
    + serde::Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedKind for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + k8s_openapi::Resource
        + Clone
        + DeserializeOwned
        + serde::Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Built once at startup and passed to whatever needs cluster access.
#[derive(Clone)]
pub struct ClusterContext {
    pub client: Client,
    pub namespace: String,
    pub vocab: Vocabulary,
}

impl ClusterContext {
    /// Connect with the ambient kubeconfig or in-cluster config. Without an
    /// explicit namespace the client's default namespace is used.
    pub async fn connect(namespace: Option<&str>, vocab: Vocabulary) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let namespace = match namespace {
            Some(ns) => ns.to_string(),
            None => client.default_namespace().to_string(),
        };
        info!(ns = %namespace, domain = %vocab.domain(), "cluster context ready");
        Ok(Self { client, namespace, vocab })
    }

    pub fn api<K: NamespacedKind>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn source<K: NamespacedKind>(&self) -> KubeSource<K> {
        KubeSource::new(self.api())
    }

    pub fn lister(&self) -> KubeLister {
        KubeLister::new(self.client.clone())
    }

    pub fn patcher(&self) -> KubePatcher {
        KubePatcher::new(self.client.clone())
    }
}

/// List+watch over one namespaced kind.
pub struct KubeSource<K> {
    api: Api<K>,
}

impl<K: NamespacedKind> KubeSource<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

fn watch_event<K>(ev: Event<K>) -> WatchEvent<K> {
    match ev {
        Event::Applied(o) => WatchEvent::Applied(o),
        Event::Deleted(o) => WatchEvent::Deleted(o),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            WatchEvent::Restarted(list)
        }
    }
}

#[async_trait]
impl<K: NamespacedKind> ObjectSource<K> for KubeSource<K> {
    async fn list(&self) -> anyhow::Result<Vec<K>> {
        let list = self.api.list(&ListParams::default()).await.with_context(|| format!("listing {}", K::KIND))?;
        Ok(list.items)
    }

    fn watch(&self) -> BoxStream<'static, anyhow::Result<WatchEvent<K>>> {
        let cfg = watcher::Config::default().timeout(25);
        info!(kind = K::KIND, "watcher started");
        watcher::watcher(self.api.clone(), cfg)
            .default_backoff()
            .map_ok(watch_event)
            .map_err(anyhow::Error::from)
            .boxed()
    }
}

/// Live lookups against the API server, namespace scoped.
#[derive(Clone)]
pub struct KubeLister {
    client: Client,
}

impl KubeLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<K: NamespacedKind> ObjectLister<K> for KubeLister {
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, LookupError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        match api.list(&lp).await {
            Ok(list) => Ok(list.items),
            Err(e) => {
                counter!("lookup_errors", 1u64, "kind" => K::KIND);
                Err(LookupError::List { kind: K::KIND, namespace: namespace.to_string(), message: e.to_string() })
            }
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, LookupError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(|e| {
            counter!("lookup_errors", 1u64, "kind" => K::KIND);
            LookupError::Get {
                kind: K::KIND,
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }
        })
    }
}

/// Submits JSON-Patch documents.
#[derive(Clone)]
pub struct KubePatcher {
    client: Client,
}

impl KubePatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn to_json_patch(ops: &[PatchOperation]) -> serde_json::Result<json_patch::Patch> {
    serde_json::from_value(serde_json::to_value(ops)?)
}

fn apply_error(key: String, err: kube::Error) -> ApplyError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ApplyError::NotFound { key },
        // 409 from optimistic concurrency, 422 from a failed `test` operation
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 422 => ApplyError::Conflict { key, message: ae.message },
        other => ApplyError::Failed { key, message: other.to_string() },
    }
}

#[async_trait]
impl<K: NamespacedKind> Patcher<K> for KubePatcher {
    async fn apply(&self, namespace: &str, name: &str, ops: &[PatchOperation]) -> Result<(), ApplyError> {
        let key = format!("{}/{}/{}", K::KIND, namespace, name);
        let patch = to_json_patch(ops).map_err(|e| ApplyError::Failed { key: key.clone(), message: e.to_string() })?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.patch(name, &PatchParams::default(), &Patch::<()>::Json(patch)).await {
            Ok(_) => {
                info!(key = %key, ops = ops.len(), "patch applied");
                Ok(())
            }
            Err(e) => {
                let err = apply_error(key, e);
                warn!(error = %err, "patch rejected");
                Err(err)
            }
        }
    }
}
