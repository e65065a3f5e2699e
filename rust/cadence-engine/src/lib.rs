//! Cadence - scheduled and historical query execution engine
//!
//! This crate decides when recurring analytical queries must run, computes
//! the reporting window for each run, binds caller-supplied values into the
//! query template safely, dispatches the job to an execution platform and
//! tracks it to completion. Historical backfills are split into week units
//! executed under two nested concurrency limits.
//!
//! # Architecture
//!
//! - [`window`]: reporting-lag aware `[start, end)` windows
//! - [`params`]: placeholder detection, binding and the injection firewall
//! - [`scheduler`]: due-ness, next occurrence and the executor loop
//! - [`backfill`]: week-unit orchestration with pause/resume/cancel/retry
//! - [`poller`]: status polling for every dispatched job
//! - [`platform`]: execution platform and credential contracts
//! - [`store`]: persistence for schedules, runs, templates and collections
//! - [`api`]: JSON control API
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_engine::{config::AppConfig, server::Engine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let engine = Engine::build(config).await?;
//!     let app = engine.router();
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8090").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod backfill;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod params;
pub mod platform;
pub mod poller;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod window;

use std::sync::Arc;

use backfill::BackfillOrchestrator;
use config::AppConfig;
use store::Store;

pub use error::{Error, Result};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Record persistence.
    pub store: Arc<dyn Store>,
    /// Backfill control surface.
    pub backfill: BackfillOrchestrator,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("store", &"dyn Store")
            .field("backfill", &self.backfill)
            .finish()
    }
}
