//! dyncluster daemon library.
//!
//! The crate ships the `dynclusterd` binary, but exposes its internals as a
//! library so integration tests can drive the service, reconciler and
//! router directly.

pub mod actor;
pub mod api;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod reconciler;
pub mod service;
pub mod shutdown;
pub mod state;

pub use actor::ActorContext;
pub use daemon::Daemon;
