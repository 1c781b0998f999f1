//! Admission-time mutation of consumer workloads.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, EnvVar, Service};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use metrics::counter;
use tether_core::vocab::{REQUIRED_VARS_ENV, STATUS_INJECTED};
use tether_core::{InterfaceTable, MapField, MutationPolicy, ObjectLister, RelationResolver, Role, Workload};
use tether_patch::{apply_container_defaults, Patch, PatchBuilder, PatchError};
use tracing::{debug, info, warn};

/// What to answer when a request cannot be processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Admit unchanged, with the reason in the response message.
    #[default]
    Open,
    Closed,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailureMode::Open),
            "closed" => Ok(FailureMode::Closed),
            other => Err(format!("unknown failure mode: {other} (expect open or closed)")),
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureMode::Open => "open",
            FailureMode::Closed => "closed",
        })
    }
}

pub type ServiceResolver = RelationResolver<Arc<dyn ObjectLister<Service>>>;

pub struct AdmissionInjector {
    policy: MutationPolicy,
    table: InterfaceTable,
    init_steps: Vec<Container>,
    resolver: Option<ServiceResolver>,
    failure_mode: FailureMode,
}

impl AdmissionInjector {
    /// `init_steps` are defaulted once here, in the order given.
    pub fn new(policy: MutationPolicy, table: InterfaceTable, init_steps: Vec<Container>) -> Self {
        let init_steps = init_steps
            .into_iter()
            .map(|mut c| {
                apply_container_defaults(&mut c);
                c
            })
            .collect();
        Self { policy, table, init_steps, resolver: None, failure_mode: FailureMode::default() }
    }

    /// Look up providers that already exist when a consumer is admitted.
    pub fn with_resolver(mut self, resolver: ServiceResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub async fn review(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let Some(obj) = req.object.as_ref() else {
            debug!(uid = %req.uid, "no object in request; allowing");
            return AdmissionResponse::from(req);
        };
        let kind = req.kind.kind.as_str();
        let raw = match serde_json::to_value(obj) {
            Ok(v) => v,
            Err(e) => return self.fail(req, format!("encoding {kind}: {e}")),
        };
        let workload = match Workload::decode(kind, raw) {
            Ok(Some(w)) => w,
            Ok(None) => {
                debug!(uid = %req.uid, kind, "kind not handled; allowing");
                return AdmissionResponse::from(req);
            }
            Err(e) => return self.fail(req, format!("decoding {kind}: {e}")),
        };
        let namespace = req
            .namespace
            .as_deref()
            .or(workload.meta().namespace.as_deref())
            .unwrap_or("default")
            .to_string();

        let patch = match self.consumer_patch(&namespace, &workload).await {
            Ok(Some(p)) => p,
            Ok(None) => return AdmissionResponse::from(req),
            Err(e) => return self.fail(req, format!("building patch: {e}")),
        };
        let ops = patch.ops().len();
        let encoded = match patch.to_json_patch() {
            Ok(p) => p,
            Err(e) => return self.fail(req, format!("encoding patch: {e}")),
        };
        match AdmissionResponse::from(req).with_patch(encoded) {
            Ok(resp) => {
                counter!("admission_patched", 1u64, "kind" => workload.kind());
                let name = workload.meta().name.as_deref();
                info!(uid = %req.uid, ns = %namespace, ?name, kind = workload.kind(), ops, "consumer mutated");
                resp
            }
            Err(e) => self.fail(req, format!("serializing patch: {e}")),
        }
    }

    /// `None` when the policy asks for no mutation or nothing would change.
    async fn consumer_patch(&self, namespace: &str, w: &Workload) -> Result<Option<Patch>, PatchError> {
        if !self.policy.requires_consumer_injection(namespace, w.meta()) {
            return Ok(None);
        }
        let Some(intent) = self.policy.intent(namespace, w.meta(), Role::Consumes) else { return Ok(None) };
        let iface = intent.interface.as_str();
        let env = match &self.resolver {
            Some(r) => match r.providers_for(namespace, &intent).await {
                Ok(providers) => self.table.env_from(iface, &providers),
                Err(e) => {
                    let name = w.meta().name.as_deref();
                    warn!(ns = %namespace, ?name, error = %e, "provider lookup failed; injecting gates only");
                    BTreeMap::new()
                }
            },
            None => BTreeMap::new(),
        };
        let patch = self.build_consumer_patch(w, iface, &env)?;
        Ok((!patch.is_empty()).then_some(patch))
    }

    /// Gate steps with their required-variable list, provider values on every
    /// container, and the injected marker.
    pub fn build_consumer_patch(
        &self,
        w: &Workload,
        interface: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<Patch, PatchError> {
        let mut b = PatchBuilder::for_workload(w);
        let required = self.table.required_vars_csv(interface);
        for step in &self.init_steps {
            let mut step = step.clone();
            if !required.is_empty() {
                set_container_env(&mut step, REQUIRED_VARS_ENV, &required);
            }
            b.prepend_init_step(&step)?;
        }
        b.set_env(env);
        let status = self.policy.vocab().status();
        b.set_map_entries(MapField::Annotations, [(status.as_str(), STATUS_INJECTED)]);
        if has_template_metadata(w) {
            b.set_map_entries(MapField::TemplateAnnotations, [(status.as_str(), STATUS_INJECTED)]);
        }
        Ok(b.finish())
    }

    fn fail(&self, req: &AdmissionRequest<DynamicObject>, message: String) -> AdmissionResponse {
        counter!("admission_errors", 1u64, "mode" => self.failure_mode.to_string());
        warn!(uid = %req.uid, mode = %self.failure_mode, error = %message, "admission failed");
        let mut resp = AdmissionResponse::from(req).deny(message);
        if self.failure_mode == FailureMode::Open {
            resp.allowed = true;
        }
        resp
    }
}

/// `add` needs the parent object; template metadata itself is never created.
fn has_template_metadata(w: &Workload) -> bool {
    match w {
        Workload::Deployment(d) => d.spec.as_ref().is_some_and(|s| s.template.metadata.is_some()),
        Workload::Pod(_) => false,
    }
}

fn set_container_env(c: &mut Container, name: &str, value: &str) {
    let env = c.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(e) => {
            e.value = Some(value.to_string());
            e.value_from = None;
        }
        None => env.push(EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::PatchOperation;

    fn gate() -> Container {
        Container { name: "tether-gate".into(), image: Some("tether/gate:1.0".into()), ..Default::default() }
    }

    fn pod(annotations: serde_json::Value) -> Workload {
        Workload::decode(
            "Pod",
            json!({
                "metadata": { "name": "web", "labels": { "tether.io/consumes": "sse" }, "annotations": annotations },
                "spec": { "containers": [ { "name": "app", "image": "web:1" } ] }
            }),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn gate_carries_required_vars() {
        let inj = AdmissionInjector::new(MutationPolicy::default(), InterfaceTable::default(), vec![gate()]);
        let p = inj.build_consumer_patch(&pod(json!({})), "sse", &BTreeMap::new()).unwrap();
        let PatchOperation::Add { path, value } = &p.ops()[1] else { panic!("expected add, got {:?}", p.ops()) };
        assert_eq!(path, "/spec/initContainers/0");
        assert_eq!(value["env"], json!([{ "name": "TETHER_REQUIRED_VARS", "value": "BASE_URL" }]));
        assert_eq!(value["imagePullPolicy"], "IfNotPresent");
    }

    #[test]
    fn unknown_interface_gets_no_required_vars_entry() {
        let inj = AdmissionInjector::new(MutationPolicy::default(), InterfaceTable::default(), vec![gate()]);
        let p = inj.build_consumer_patch(&pod(json!({})), "grpc", &BTreeMap::new()).unwrap();
        let PatchOperation::Add { value, .. } = &p.ops()[1] else { panic!("expected add") };
        assert!(value.get("env").is_none());
    }

    #[test]
    fn existing_required_vars_entry_is_overwritten() {
        let mut c = gate();
        c.env = Some(vec![EnvVar { name: REQUIRED_VARS_ENV.into(), value: Some("OLD".into()), ..Default::default() }]);
        set_container_env(&mut c, REQUIRED_VARS_ENV, "BASE_URL");
        assert_eq!(c.env.as_ref().unwrap().len(), 1);
        assert_eq!(c.env.unwrap()[0].value.as_deref(), Some("BASE_URL"));
    }

    #[test]
    fn template_without_metadata_is_not_annotated() {
        let d = Workload::decode(
            "Deployment",
            json!({
                "metadata": { "name": "web", "annotations": {} },
                "spec": { "selector": {}, "template": { "spec": { "containers": [ { "name": "app" } ] } } }
            }),
        )
        .unwrap()
        .unwrap();
        let inj = AdmissionInjector::new(MutationPolicy::default(), InterfaceTable::default(), Vec::new());
        let p = inj.build_consumer_patch(&d, "sse", &BTreeMap::new()).unwrap();
        assert!(p.ops().iter().all(|op| !op.path().starts_with("/spec/template/metadata")));
        assert!(p.ops().iter().any(|op| op.path() == "/metadata/annotations/tether.io~1status"));
    }

    #[test]
    fn failure_mode_parses() {
        assert_eq!("Closed".parse::<FailureMode>().unwrap(), FailureMode::Closed);
        assert!("maybe".parse::<FailureMode>().is_err());
        assert_eq!(FailureMode::default().to_string(), "open");
    }
}
