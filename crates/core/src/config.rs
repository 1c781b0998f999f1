//! Injector configuration file (YAML).
//!
//! ```yaml
//! initContainers:
//!   - name: tether-gate
//!     image: registry.example/tether-gate:1.0
//! interfaces:
//!   postgres:
//!     - name: DB_HOST
//!       source: { from: annotation, key: db.example/host }
//! reservedNamespaces: [kube-system, kube-public]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use k8s_openapi::api::core::v1::Container;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::policy::DEFAULT_RESERVED_NAMESPACES;
use crate::vocab::{Binding, InterfaceTable};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing injector config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid injector config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectorConfig {
    /// Readiness gate steps prepended to consumers, in order.
    #[serde(default)]
    pub init_containers: Vec<Container>,
    /// Extra or overriding interface definitions on top of the built-in table.
    #[serde(default)]
    pub interfaces: BTreeMap<String, Vec<Binding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_namespaces: Option<Vec<String>>,
}

impl InjectorConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: InjectorConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let cfg = Self::from_yaml(&data)?;
        info!(
            path = %path.display(),
            bytes = data.len(),
            init_steps = cfg.init_containers.len(),
            interfaces = cfg.interfaces.len(),
            "injector config loaded"
        );
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for c in &self.init_containers {
            if c.name.trim().is_empty() {
                return Err(ConfigError::Invalid("init container without a name".into()));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate init container name: {}", c.name)));
            }
        }
        for (iface, bindings) in &self.interfaces {
            if bindings.iter().any(|b| b.name.trim().is_empty() || b.name.contains(',')) {
                return Err(ConfigError::Invalid(format!(
                    "interface {iface}: variable names must be non-empty and comma free"
                )));
            }
        }
        Ok(())
    }

    pub fn interface_table(&self) -> InterfaceTable {
        let mut table = InterfaceTable::default();
        for (iface, bindings) in &self.interfaces {
            if table.contains(iface) {
                info!(interface = %iface, "config overrides built-in interface");
            }
            table.insert(iface, bindings.clone());
        }
        table
    }

    pub fn reserved_namespaces(&self) -> Vec<String> {
        match &self.reserved_namespaces {
            Some(v) => v.clone(),
            None => DEFAULT_RESERVED_NAMESPACES.iter().map(|s| s.to_string()).collect(),
        }
    }
}
