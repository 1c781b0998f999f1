//! Tether patch builder.
//!
//! Produces the minimal JSON-Patch that moves a workload to the requested
//! state. Requests that are already satisfied emit nothing, so running the
//! same build against the patched object yields an empty patch.

#![forbid(unsafe_code)]

pub mod builder;
pub mod defaults;
pub mod pointer;

pub use builder::{Parent, Patch, PatchBuilder, PatchError};
pub use defaults::apply_container_defaults;
pub use pointer::{escape, join, unescape, PointerError};
