//! Offline-first durable sync engine.
//!
//! Local mutations are queued durably, applied to a local record cache and
//! replayed against a remote data service whenever connectivity allows.

pub mod cache;
pub mod config;
pub mod engine;
pub mod queue;
pub mod remote;
pub mod sync;

pub use engine::{Engine, SyncHandle};
