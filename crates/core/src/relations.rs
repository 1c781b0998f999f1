//! Relation lookup: which objects are related to which.
//!
//! Cluster access is abstracted behind [`ObjectLister`] and [`Patcher`] so the
//! admission path, the reconciliation path and tests can plug in their own
//! backing store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use tracing::debug;

use crate::model::PatchOperation;
use crate::vocab::{RelationIntent, Role, Vocabulary};

/// The backing store could not answer. Distinct from "nothing related".
#[derive(Debug, Clone, thiserror::Error)]
pub enum LookupError {
    #[error("listing {kind} in {namespace}: {message}")]
    List { kind: &'static str, namespace: String, message: String },
    #[error("fetching {kind} {namespace}/{name}: {message}")]
    Get { kind: &'static str, namespace: String, name: String, message: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApplyError {
    /// The object changed between patch computation and apply.
    #[error("conflict applying patch to {key}: {message}")]
    Conflict { key: String, message: String },
    #[error("{key} not found")]
    NotFound { key: String },
    #[error("applying patch to {key}: {message}")]
    Failed { key: String, message: String },
}

#[async_trait]
pub trait ObjectLister<K>: Send + Sync {
    /// List a namespace, optionally filtered by a label selector.
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, LookupError>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, LookupError>;
}

#[async_trait]
impl<K, T> ObjectLister<K> for Arc<T>
where
    K: Send + 'static,
    T: ObjectLister<K> + ?Sized,
{
    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, LookupError> {
        (**self).list(namespace, label_selector).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, LookupError> {
        (**self).get(namespace, name).await
    }
}

/// Applies a JSON-Patch to one object of kind `K`.
#[async_trait]
pub trait Patcher<K>: Send + Sync {
    async fn apply(&self, namespace: &str, name: &str, ops: &[PatchOperation]) -> Result<(), ApplyError>;
}

#[async_trait]
impl<K, T> Patcher<K> for Arc<T>
where
    K: 'static,
    T: Patcher<K> + ?Sized,
{
    async fn apply(&self, namespace: &str, name: &str, ops: &[PatchOperation]) -> Result<(), ApplyError> {
        (**self).apply(namespace, name, ops).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationStrategy {
    /// Label selector `<domain>/relations=<provider>`; one provider per consumer.
    Exact,
    /// Linear scan over each object's relation names: the comma separated
    /// `<domain>/relations` annotation, or the label of the same name.
    #[default]
    Scan,
}

impl FromStr for RelationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(RelationStrategy::Exact),
            "scan" => Ok(RelationStrategy::Scan),
            other => Err(format!("unknown relation strategy: {other} (expect exact or scan)")),
        }
    }
}

impl fmt::Display for RelationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelationStrategy::Exact => "exact",
            RelationStrategy::Scan => "scan",
        })
    }
}

pub struct RelationResolver<L> {
    lister: L,
    vocab: Vocabulary,
    strategy: RelationStrategy,
}

impl<L> RelationResolver<L> {
    pub fn new(lister: L, vocab: Vocabulary, strategy: RelationStrategy) -> Self {
        Self { lister, vocab, strategy }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Objects in `namespace` that name `provider` in their relations.
    ///
    /// The scan strategy is O(N) in the namespace population; a reverse
    /// provider -> consumers index is the first thing to add if that grows.
    pub async fn consumers_of<K>(&self, namespace: &str, provider: &str) -> Result<Vec<K>, LookupError>
    where
        L: ObjectLister<K>,
        K: Resource + Send + 'static,
    {
        match self.strategy {
            RelationStrategy::Exact => {
                let selector = format!("{}={}", self.vocab.relations(), provider);
                self.lister.list(namespace, Some(&selector)).await
            }
            RelationStrategy::Scan => {
                let candidates = self.lister.list(namespace, None).await?;
                Ok(candidates.into_iter().filter(|c| self.names_provider(c.meta(), provider)).collect())
            }
        }
    }

    /// Same reading as [`Vocabulary::relation_names`], so both lookup
    /// directions agree on who is related.
    fn names_provider(&self, meta: &ObjectMeta, provider: &str) -> bool {
        let names = self.vocab.relation_names(meta);
        if names.is_empty() {
            debug!(name = ?meta.name, key = %self.vocab.relations(), "no relations; not related");
        }
        names.iter().any(|n| n == provider)
    }

    /// Provider Services a consumer intent relates to. Missing Services and
    /// Services whose `provides` interface differs from the consumer's
    /// `consumes` are skipped, not errors.
    pub async fn providers_for(
        &self,
        namespace: &str,
        consumer: &RelationIntent,
    ) -> Result<Vec<Service>, LookupError>
    where
        L: ObjectLister<Service>,
    {
        let mut out = Vec::new();
        for name in &consumer.related_names {
            let Some(svc) = self.lister.get(namespace, name).await? else {
                debug!(ns = %namespace, service = %name, "related service does not exist");
                continue;
            };
            match self.vocab.interface(&svc.metadata, Role::Provides) {
                None => debug!(ns = %namespace, service = %name, "related service provides no interface"),
                Some(iface) if iface != consumer.interface => {
                    let wanted = consumer.interface.as_str();
                    debug!(ns = %namespace, service = %name, provides = %iface, wanted, "interface mismatch")
                }
                Some(_) => out.push(svc),
            }
        }
        Ok(out)
    }
}
