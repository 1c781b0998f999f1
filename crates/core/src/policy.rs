//! Mutation policy: decides, from labels/annotations alone, whether an object
//! needs mutation and of which kind.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use smallvec::{smallvec, SmallVec};
use tracing::debug;

use crate::vocab::{RelationIntent, Role, Vocabulary};

pub const DEFAULT_RESERVED_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationState {
    Skip,
    RequiresConsumerInjection,
    /// Provider side; nothing is patched on the provider object itself.
    RequiresProviderAck,
    AlreadyInjected,
}

impl MutationState {
    pub fn requires_patch(self) -> bool {
        matches!(self, MutationState::RequiresConsumerInjection)
    }

    /// Side of a relation this outcome puts the object on.
    pub fn role(self) -> Option<Role> {
        match self {
            MutationState::RequiresConsumerInjection | MutationState::AlreadyInjected => Some(Role::Consumes),
            MutationState::RequiresProviderAck => Some(Role::Provides),
            MutationState::Skip => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationPolicy {
    vocab: Vocabulary,
    reserved: Vec<String>,
}

impl MutationPolicy {
    pub fn new(vocab: Vocabulary, reserved: Vec<String>) -> Self {
        Self { vocab, reserved }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn is_reserved(&self, namespace: &str) -> bool {
        self.reserved.iter().any(|r| r == namespace)
    }

    /// Evaluate one object. `namespace` is passed separately because objects in
    /// create requests often carry no namespace in their own metadata.
    ///
    /// Consumer-side outcome comes first; an object with both intents yields two
    /// states.
    pub fn evaluate(&self, namespace: &str, meta: &ObjectMeta) -> SmallVec<[MutationState; 2]> {
        if self.is_reserved(namespace) {
            debug!(ns = %namespace, name = ?meta.name, "reserved namespace; skipping");
            return smallvec![MutationState::Skip];
        }
        let mut out = SmallVec::new();
        if self.vocab.interface(meta, Role::Consumes).is_some() {
            if self.vocab.is_injected(meta) {
                out.push(MutationState::AlreadyInjected);
            } else {
                out.push(MutationState::RequiresConsumerInjection);
            }
        }
        if self.vocab.interface(meta, Role::Provides).is_some() {
            out.push(MutationState::RequiresProviderAck);
        }
        if out.is_empty() {
            out.push(MutationState::Skip);
        }
        debug!(ns = %namespace, name = ?meta.name, states = ?out, "mutation policy");
        out
    }

    pub fn requires_consumer_injection(&self, namespace: &str, meta: &ObjectMeta) -> bool {
        self.evaluate(namespace, meta).iter().any(|s| s.requires_patch())
    }

    /// The object's intent for `role`, when the decision table places it on
    /// that side. Already-injected consumers still count as consumers.
    pub fn intent(&self, namespace: &str, meta: &ObjectMeta, role: Role) -> Option<RelationIntent> {
        if !self.evaluate(namespace, meta).iter().any(|s| s.role() == Some(role)) {
            return None;
        }
        RelationIntent::of_role(meta, &self.vocab, role)
    }
}

impl Default for MutationPolicy {
    fn default() -> Self {
        Self::new(Vocabulary::default(), DEFAULT_RESERVED_NAMESPACES.iter().map(|s| s.to_string()).collect())
    }
}
