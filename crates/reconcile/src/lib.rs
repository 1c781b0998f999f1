//! Tether reconciliation loop.
//!
//! Watch events land in a [`Cache`], touched keys go through a deduplicating
//! [`WorkQueue`], and a fixed pool of workers hands each key to a [`Handler`].
//! A key is never processed by two workers at once.

#![forbid(unsafe_code)]

pub mod cache;
pub mod controller;
pub mod queue;

pub use cache::{Cache, WatchEvent};
pub use controller::{Controller, Handler, HandlerError, LoopConfig, ObjectSource};
pub use queue::{Backoff, WorkQueue};
