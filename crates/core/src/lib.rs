//! Tether core types.
//!
//! Shared by the admission path and the reconciliation path: the abstract
//! workload view, the label/annotation vocabulary, the mutation policy and
//! the relation resolver.

#![forbid(unsafe_code)]

pub mod config;
pub mod model;
pub mod policy;
pub mod relations;
pub mod vocab;

pub use config::{ConfigError, InjectorConfig};
pub use model::{
    ContainerSpec, EnvVar, Layout, MapField, PatchOperation, ReconcileKey, Section, Workload, WorkloadSpec,
};
pub use policy::{MutationPolicy, MutationState};
pub use relations::{ApplyError, LookupError, ObjectLister, Patcher, RelationResolver, RelationStrategy};
pub use vocab::{Binding, InterfaceTable, RelationIntent, Role, ValueSource, Vocabulary};
