//! Runtime control core for a document feed bridge.
//!
//! A [`connector::Connector`] exposes a content repository. The
//! [`orchestrator::Orchestrator`] serves its documents to the crawler, pushes
//! document ids on a cron schedule and by incremental polling, and applies
//! configuration changes while running.

pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod panic_hook;
pub mod push;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod transform;

pub use error::{Error, Result};
