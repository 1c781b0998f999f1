//! Patch builder.
//!
//! The builder keeps a projected copy of the workload: every emitted operation
//! is also applied to that copy, so each later request is checked against the
//! state the object will have at that point of the sequence. That gives
//! last-write-wins for repeated keys, correct indices after prepends, and an
//! empty result when nothing changes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use rustc_hash::FxHashSet;
use serde_json::{json, Value as Json};
use tracing::debug;

use tether_core::{
    ContainerSpec, EnvVar, Layout, MapField, PatchOperation, Section, Workload, WorkloadSpec,
};

use crate::pointer;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("encoding patch value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A collection that must exist before a child can be written into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    Map(MapField),
    Env(Section, usize),
    InitSteps,
}

pub struct PatchBuilder {
    layout: Layout,
    next: WorkloadSpec,
    ops: Vec<PatchOperation>,
    /// Paths known to exist in the projected state, scoped to this build.
    present: FxHashSet<String>,
    prepended: usize,
    guard: Option<String>,
}

impl PatchBuilder {
    pub fn new(current: WorkloadSpec, layout: Layout) -> Self {
        Self {
            layout,
            next: current,
            ops: Vec::new(),
            present: FxHashSet::default(),
            prepended: 0,
            guard: None,
        }
    }

    pub fn for_workload(w: &Workload) -> Self {
        Self::new(w.spec(), w.layout())
    }

    /// State the object will be in once the operations so far are applied.
    pub fn projected(&self) -> &WorkloadSpec {
        &self.next
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Init steps prepended so far. Pre-existing init step `i` now sits at
    /// projected index `i + prepended()`.
    pub fn prepended(&self) -> usize {
        self.prepended
    }

    fn parent_path(&self, parent: Parent) -> Option<String> {
        match parent {
            Parent::Map(field) => self.layout.map_path(field),
            Parent::Env(section, index) => Some(self.layout.env_path(section, index)),
            Parent::InitSteps => Some(self.layout.section_path(Section::InitSteps)),
        }
    }

    fn parent_is_empty(&self, parent: Parent) -> bool {
        match parent {
            Parent::Map(field) => self.next.map(field).is_empty(),
            Parent::Env(section, index) => self.next.section(section).get(index).map_or(true, |c| c.env.is_empty()),
            Parent::InitSteps => self.next.init_steps.is_empty(),
        }
    }

    /// Emit an `add` creating `parent` empty when it is absent or empty.
    /// Emitted at most once per path per build. Returns `false` when the
    /// layout has no such collection.
    pub fn ensure_container_exists(&mut self, parent: Parent) -> bool {
        let Some(path) = self.parent_path(parent) else { return false };
        if self.present.contains(&path) {
            return true;
        }
        if self.parent_is_empty(parent) {
            let value = match parent {
                Parent::Map(_) => json!({}),
                Parent::Env(..) | Parent::InitSteps => json!([]),
            };
            self.ops.push(PatchOperation::Add { path: path.clone(), value });
        }
        self.present.insert(path);
        true
    }

    /// Labels/annotations. Keys equal to the projected value are skipped.
    pub fn set_map_entries<I, K, V>(&mut self, field: MapField, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let Some(prefix) = self.layout.map_path(field) else {
            debug!(?field, "layout has no such map; skipping");
            return;
        };
        for (k, v) in entries {
            let (k, v) = (k.as_ref(), v.as_ref());
            if self.next.map(field).get(k).map(String::as_str) == Some(v) {
                continue;
            }
            self.ensure_container_exists(Parent::Map(field));
            self.ops.push(PatchOperation::Add { path: pointer::join(&prefix, k), value: Json::String(v.to_string()) });
            self.next.map_mut(field).insert(k.to_string(), v.to_string());
        }
    }

    /// Set one variable on the container at projected `index` of `section`.
    pub fn set_env_var(&mut self, section: Section, index: usize, key: &str, value: &str) {
        let Some(container) = self.next.section(section).get(index) else {
            debug!(?section, index, "no container at index; skipping");
            return;
        };
        let env_path = self.layout.env_path(section, index);
        let entry = json!({ "name": key, "value": value });
        match container.env.iter().position(|e| e.name == key) {
            Some(pos) if container.env[pos].value.as_deref() == Some(value) => {}
            Some(pos) => {
                self.ops.push(PatchOperation::Replace { path: format!("{env_path}/{pos}"), value: entry });
                self.next.section_mut(section)[index].env[pos].value = Some(value.to_string());
            }
            None => {
                self.ensure_container_exists(Parent::Env(section, index));
                self.ops.push(PatchOperation::Add { path: format!("{env_path}/-"), value: entry });
                self.next.section_mut(section)[index]
                    .env
                    .push(EnvVar { name: key.to_string(), value: Some(value.to_string()) });
            }
        }
    }

    /// Apply every variable to every container and init step.
    pub fn set_env(&mut self, env: &BTreeMap<String, String>) {
        for section in Section::ALL {
            for index in 0..self.next.section(section).len() {
                for (k, v) in env {
                    self.set_env_var(section, index, k, v);
                }
            }
        }
    }

    /// Insert `step` ahead of the existing init steps. Repeated calls keep
    /// request order (`0, 1, ...`). A step whose name is already present is
    /// not inserted again; returns whether it was inserted.
    pub fn prepend_init_step(&mut self, step: &Container) -> Result<bool, PatchError> {
        if self.next.init_steps.iter().any(|s| s.name == step.name) {
            debug!(step = %step.name, "init step already present");
            return Ok(false);
        }
        let value = serde_json::to_value(step)?;
        self.ensure_container_exists(Parent::InitSteps);
        let section_path = self.layout.section_path(Section::InitSteps);
        let index = self.prepended;
        self.ops.push(PatchOperation::Add { path: format!("{section_path}/{index}"), value });
        self.next.init_steps.insert(index, ContainerSpec::from(step));
        self.prepended += 1;
        // indices shifted; env presence recorded for init steps no longer holds
        let shifted = format!("{section_path}/");
        self.present.retain(|p| !p.starts_with(&shifted));
        Ok(true)
    }

    /// Lead a non-empty result with `test <metadata>/resourceVersion`, so a
    /// patch computed against a stale object fails instead of applying.
    pub fn guard_resource_version(&mut self, resource_version: Option<&str>) {
        self.guard = resource_version.filter(|rv| !rv.is_empty()).map(str::to_string);
    }

    pub fn finish(self) -> Patch {
        if self.ops.is_empty() {
            return Patch(Vec::new());
        }
        let mut out = Vec::with_capacity(self.ops.len() + 1);
        if let Some(rv) = self.guard {
            let path = format!("{}/resourceVersion", self.layout.metadata);
            out.push(PatchOperation::Test { path, value: Json::String(rv) });
        }
        out.extend(self.ops);
        Patch(out)
    }
}

/// Ordered operation sequence. Empty means "nothing to submit".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(pub Vec<PatchOperation>);

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ops(&self) -> &[PatchOperation] {
        &self.0
    }

    pub fn mutations(&self) -> impl Iterator<Item = &PatchOperation> {
        self.0.iter().filter(|op| op.is_mutation())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PatchError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn to_json_patch(&self) -> Result<json_patch::Patch, PatchError> {
        Ok(serde_json::from_value(serde_json::to_value(&self.0)?)?)
    }
}
