//! Label/annotation vocabulary and the interface -> variables table.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

pub const DEFAULT_DOMAIN: &str = "tether.io";

/// Environment variable the readiness gate reads its CSV of required names from.
pub const REQUIRED_VARS_ENV: &str = "TETHER_REQUIRED_VARS";

pub const STATUS_INJECTED: &str = "injected";

/// Domain-prefixed keys, e.g. `tether.io/provides`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    domain: String,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN)
    }
}

impl Vocabulary {
    pub fn new(domain: &str) -> Self {
        Self { domain: domain.trim_end_matches('/').to_string() }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn provides(&self) -> String {
        format!("{}/provides", self.domain)
    }

    pub fn consumes(&self) -> String {
        format!("{}/consumes", self.domain)
    }

    pub fn relations(&self) -> String {
        format!("{}/relations", self.domain)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.domain)
    }

    /// Lowercased interface named by a role label, empty values ignored.
    pub fn interface(&self, meta: &ObjectMeta, role: Role) -> Option<String> {
        let key = match role {
            Role::Provides => self.provides(),
            Role::Consumes => self.consumes(),
        };
        meta.labels
            .as_ref()
            .and_then(|l| l.get(&key))
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    /// Provider names a consumer relates to. The annotation form allows a comma
    /// separated list; the label form (used by exact-match lookups) holds one name.
    pub fn relation_names(&self, meta: &ObjectMeta) -> Vec<String> {
        let key = self.relations();
        let raw = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(&key))
            .or_else(|| meta.labels.as_ref().and_then(|l| l.get(&key)));
        match raw {
            Some(v) => split_names(v),
            None => Vec::new(),
        }
    }

    pub fn is_injected(&self, meta: &ObjectMeta) -> bool {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(&self.status()))
            .map(|s| s.trim().eq_ignore_ascii_case(STATUS_INJECTED))
            .unwrap_or(false)
    }
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Provides,
    Consumes,
}

/// Intent derived from an object's labels/annotations. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationIntent {
    pub role: Role,
    pub interface: String,
    pub related_names: Vec<String>,
}

impl RelationIntent {
    /// Consumer intent first, then provider intent.
    pub fn from_meta(meta: &ObjectMeta, vocab: &Vocabulary) -> SmallVec<[RelationIntent; 2]> {
        let mut out = SmallVec::new();
        if let Some(interface) = vocab.interface(meta, Role::Consumes) {
            out.push(RelationIntent { role: Role::Consumes, interface, related_names: vocab.relation_names(meta) });
        }
        if let Some(interface) = vocab.interface(meta, Role::Provides) {
            out.push(RelationIntent { role: Role::Provides, interface, related_names: Vec::new() });
        }
        out
    }

    pub fn of_role(meta: &ObjectMeta, vocab: &Vocabulary, role: Role) -> Option<RelationIntent> {
        Self::from_meta(meta, vocab).into_iter().find(|i| i.role == role)
    }
}

/// Where a provider-side variable value is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "camelCase")]
pub enum ValueSource {
    /// `spec.externalName` of the provider Service.
    #[default]
    ExternalName,
    Annotation { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    #[serde(default)]
    pub source: ValueSource,
}

/// Interface name -> variables a consumer of that interface requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTable {
    map: BTreeMap<String, Vec<Binding>>,
}

impl Default for InterfaceTable {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        let base_url = Binding { name: "BASE_URL".to_string(), source: ValueSource::ExternalName };
        map.insert("sse".to_string(), vec![base_url]);
        Self { map }
    }
}

impl InterfaceTable {
    /// Add or replace an interface definition.
    pub fn insert(&mut self, interface: &str, bindings: Vec<Binding>) {
        self.map.insert(interface.to_ascii_lowercase(), bindings);
    }

    pub fn bindings(&self, interface: &str) -> &[Binding] {
        self.map.get(&interface.to_ascii_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, interface: &str) -> bool {
        self.map.contains_key(&interface.to_ascii_lowercase())
    }

    pub fn required_vars(&self, interface: &str) -> Vec<&str> {
        self.bindings(interface).iter().map(|b| b.name.as_str()).collect()
    }

    /// Comma separated required names, the value of [`REQUIRED_VARS_ENV`].
    pub fn required_vars_csv(&self, interface: &str) -> String {
        self.required_vars(interface).join(",")
    }

    /// Variables a provider Service offers for `interface`. An annotation named
    /// exactly like the variable overrides the configured source; variables with
    /// no value are left out.
    pub fn resolve_env(&self, interface: &str, service: &Service) -> BTreeMap<String, String> {
        let annotations = service.metadata.annotations.as_ref();
        let mut out = BTreeMap::new();
        for b in self.bindings(interface) {
            let explicit = annotations.and_then(|a| a.get(&b.name)).cloned();
            let value = explicit.or_else(|| match &b.source {
                ValueSource::ExternalName => service.spec.as_ref().and_then(|s| s.external_name.clone()),
                ValueSource::Annotation { key } => annotations.and_then(|a| a.get(key)).cloned(),
            });
            match value.filter(|v| !v.is_empty()) {
                Some(v) => {
                    out.insert(b.name.clone(), v);
                }
                None => debug!(var = %b.name, service = ?service.metadata.name, "provider has no value for variable"),
            }
        }
        out
    }

    /// Variables from every provider in order; a later provider overrides an
    /// earlier one for the same name.
    pub fn env_from(&self, interface: &str, providers: &[Service]) -> BTreeMap<String, String> {
        providers.iter().flat_map(|s| self.resolve_env(interface, s)).collect()
    }
}
