//! Tether admission endpoint.
//!
//! Consumers are mutated at creation time: readiness-gate init steps are
//! prepended, values from already-existing providers are injected, and the
//! object is marked so the mutation is not repeated.

#![forbid(unsafe_code)]

pub mod error;
pub mod injector;
pub mod server;

pub use error::WebhookError;
pub use injector::{AdmissionInjector, FailureMode};
pub use server::{router, serve, WebhookState};
