//! Abstract workload view and the wire-level patch operation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    /// `None` when the variable is sourced through `valueFrom`.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub env: Vec<EnvVar>,
}

impl From<&Container> for ContainerSpec {
    fn from(c: &Container) -> Self {
        let env = c
            .env
            .iter()
            .flatten()
            .map(|e| EnvVar { name: e.name.clone(), value: e.value.clone() })
            .collect();
        Self { name: c.name.clone(), env }
    }
}

/// Everything the patch builder needs to know about one object: the metadata
/// maps plus the container and init-step env lists. Absent collections are
/// represented as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Pod template annotations; always empty for kinds without a template.
    pub template_annotations: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    pub init_steps: Vec<ContainerSpec>,
}

impl WorkloadSpec {
    pub fn from_parts(meta: &ObjectMeta, template: Option<&ObjectMeta>, pod: Option<&PodSpec>) -> Self {
        Self {
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            template_annotations: template.and_then(|m| m.annotations.clone()).unwrap_or_default(),
            containers: pod.map(|p| p.containers.iter().map(ContainerSpec::from).collect()).unwrap_or_default(),
            init_steps: pod
                .and_then(|p| p.init_containers.as_ref())
                .map(|v| v.iter().map(ContainerSpec::from).collect())
                .unwrap_or_default(),
        }
    }

    pub fn map(&self, field: MapField) -> &BTreeMap<String, String> {
        match field {
            MapField::Labels => &self.labels,
            MapField::Annotations => &self.annotations,
            MapField::TemplateAnnotations => &self.template_annotations,
        }
    }

    pub fn map_mut(&mut self, field: MapField) -> &mut BTreeMap<String, String> {
        match field {
            MapField::Labels => &mut self.labels,
            MapField::Annotations => &mut self.annotations,
            MapField::TemplateAnnotations => &mut self.template_annotations,
        }
    }

    pub fn section(&self, section: Section) -> &[ContainerSpec] {
        match section {
            Section::Containers => &self.containers,
            Section::InitSteps => &self.init_steps,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Vec<ContainerSpec> {
        match section {
            Section::Containers => &mut self.containers,
            Section::InitSteps => &mut self.init_steps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapField {
    Labels,
    Annotations,
    TemplateAnnotations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Containers,
    InitSteps,
}

impl Section {
    pub const ALL: [Section; 2] = [Section::Containers, Section::InitSteps];

    pub fn field(self) -> &'static str {
        match self {
            Section::Containers => "containers",
            Section::InitSteps => "initContainers",
        }
    }
}

/// Where the pieces of a [`WorkloadSpec`] live inside the wire object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub metadata: &'static str,
    pub template_metadata: Option<&'static str>,
    pub pod_spec: &'static str,
}

impl Layout {
    pub const DEPLOYMENT: Layout = Layout {
        metadata: "/metadata",
        template_metadata: Some("/spec/template/metadata"),
        pod_spec: "/spec/template/spec",
    };

    pub const POD: Layout = Layout { metadata: "/metadata", template_metadata: None, pod_spec: "/spec" };

    /// Pointer to a metadata map, `None` when the kind has no such map.
    pub fn map_path(&self, field: MapField) -> Option<String> {
        match field {
            MapField::Labels => Some(format!("{}/labels", self.metadata)),
            MapField::Annotations => Some(format!("{}/annotations", self.metadata)),
            MapField::TemplateAnnotations => self.template_metadata.map(|m| format!("{m}/annotations")),
        }
    }

    pub fn section_path(&self, section: Section) -> String {
        format!("{}/{}", self.pod_spec, section.field())
    }

    pub fn env_path(&self, section: Section, index: usize) -> String {
        format!("{}/{}/env", self.section_path(section), index)
    }
}

/// One JSON-Patch operation. Serializes to the `{op, path, value}` wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Json },
    Replace { path: String, value: Json },
    Test { path: String, value: Json },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, PatchOperation::Test { .. })
    }
}

/// The closed set of kinds the admission path knows how to mutate.
#[derive(Debug, Clone)]
pub enum Workload {
    Deployment(Box<Deployment>),
    Pod(Box<Pod>),
}

impl Workload {
    /// Decode an untyped object by kind. Unsupported kinds yield `Ok(None)`.
    pub fn decode(kind: &str, raw: Json) -> Result<Option<Self>, serde_json::Error> {
        match kind {
            "Deployment" => Ok(Some(Workload::Deployment(Box::new(serde_json::from_value(raw)?)))),
            "Pod" => Ok(Some(Workload::Pod(Box::new(serde_json::from_value(raw)?)))),
            _ => Ok(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Workload::Deployment(_) => "Deployment",
            Workload::Pod(_) => "Pod",
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::Pod(p) => &p.metadata,
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            Workload::Deployment(_) => Layout::DEPLOYMENT,
            Workload::Pod(_) => Layout::POD,
        }
    }

    pub fn spec(&self) -> WorkloadSpec {
        match self {
            Workload::Deployment(d) => deployment_spec(d),
            Workload::Pod(p) => WorkloadSpec::from_parts(&p.metadata, None, p.spec.as_ref()),
        }
    }
}

pub fn deployment_spec(d: &Deployment) -> WorkloadSpec {
    let template = d.spec.as_ref().map(|s| &s.template);
    WorkloadSpec::from_parts(
        &d.metadata,
        template.and_then(|t| t.metadata.as_ref()),
        template.and_then(|t| t.spec.as_ref()),
    )
}

/// Namespace-qualified object identity used for queueing and cache lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key for any object with a name; nameless objects cannot be keyed.
    pub fn for_resource<K: ResourceExt>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.as_deref()?;
        Some(Self::new(obj.meta().namespace.as_deref(), name))
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ReconcileKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(ns, name)),
            _ => Err(format!("invalid key: {s} (expect name or namespace/name)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_spec_treats_absent_collections_as_empty() {
        let d: Deployment = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web", "namespace": "apps" },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": [ { "name": "app" } ] } }
            }
        }))
        .unwrap();
        let spec = deployment_spec(&d);
        assert!(spec.labels.is_empty());
        assert!(spec.template_annotations.is_empty());
        assert_eq!(spec.containers.len(), 1);
        assert!(spec.containers[0].env.is_empty());
        assert!(spec.init_steps.is_empty());
    }

    #[test]
    fn decode_dispatches_on_kind() {
        let raw = serde_json::json!({ "metadata": { "name": "p" }, "spec": { "containers": [] } });
        assert!(matches!(Workload::decode("Pod", raw.clone()).unwrap(), Some(Workload::Pod(_))));
        assert!(Workload::decode("ConfigMap", raw).unwrap().is_none());
        let bad = serde_json::json!({ "metadata": { "name": 5 } });
        assert!(Workload::decode("Deployment", bad).is_err());
    }

    #[test]
    fn layout_paths() {
        assert_eq!(Layout::DEPLOYMENT.env_path(Section::InitSteps, 2), "/spec/template/spec/initContainers/2/env");
        assert_eq!(Layout::POD.section_path(Section::Containers), "/spec/containers");
        assert_eq!(Layout::POD.map_path(MapField::TemplateAnnotations), None);
        assert_eq!(
            Layout::DEPLOYMENT.map_path(MapField::TemplateAnnotations).as_deref(),
            Some("/spec/template/metadata/annotations")
        );
    }

    #[test]
    fn patch_operation_wire_shape() {
        let op = PatchOperation::Add { path: "/metadata/labels".into(), value: serde_json::json!({}) };
        let wire = serde_json::json!({"op": "add", "path": "/metadata/labels", "value": {}});
        assert_eq!(serde_json::to_value(&op).unwrap(), wire);
    }

    #[test]
    fn reconcile_key_display_and_parse() {
        let k = ReconcileKey::namespaced("apps", "web");
        assert_eq!(k.to_string(), "apps/web");
        assert_eq!("apps/web".parse::<ReconcileKey>().unwrap(), k);
        assert!("a/b/c".parse::<ReconcileKey>().is_err());
    }
}
