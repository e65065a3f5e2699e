//! Engine assembly: store, executor, background loops and the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::backfill::BackfillOrchestrator;
use crate::config::{AppConfig, ExecutorSettings, StoreBackend, StoreConfig};
use crate::logging::OpTimer;
use crate::platform::{
    CachedCredentialProvider, CredentialProvider, HttpExecutorConfig, HttpQueryExecutor,
    PlatformTokenSource, QueryExecutor, ScriptedExecutor, StaticCredentials,
};
use crate::poller::ExecutionStatusPoller;
use crate::scheduler::ScheduleExecutor;
use crate::store::{InMemoryStore, Store};
use crate::{AppState, log_banner, log_init_step, log_init_warning, log_success};

/// Crate version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully wired engine whose background tasks have not started yet.
pub struct Engine {
    state: AppState,
    poller: ExecutionStatusPoller,
    schedule_loop: ScheduleExecutor,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wire every component from configuration.
    pub async fn build(config: AppConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let overall_timer = OpTimer::new("server", "build");

        log_banner!(
            format!("Cadence engine v{VERSION}"),
            format!(
                "Store: {} | Executor: {}",
                config.store.backend,
                if config.executor.dry_run { "dry run" } else { "platform" }
            )
        );

        // [1/5] Store
        let step_timer = OpTimer::new("server", "store");
        let store = open_store(&config.store).await?;
        let store_info = match config.store.backend {
            StoreBackend::Memory => "in-memory (state is lost on restart)".to_string(),
            StoreBackend::Sqlite => format!("sqlite at {}", config.store.path),
        };
        log_init_step!(1, 5, "Store", store_info);
        if config.store.backend == StoreBackend::Memory && !config.executor.dry_run {
            log_init_warning!("In-memory store with a live executor; in-flight jobs are forgotten on restart");
        }
        step_timer.finish();

        // [2/5] Executor
        let step_timer = OpTimer::new("server", "executor");
        let executor = create_executor(&config.executor)?;
        let executor_info = match &config.executor.base_url {
            Some(url) if !config.executor.dry_run => url.clone(),
            _ => "scripted (dry run)".to_string(),
        };
        log_init_step!(2, 5, "Executor", executor_info);
        step_timer.finish();

        // [3/5] Status poller
        let (poller, poller_handle) =
            ExecutionStatusPoller::new(Arc::clone(&executor), config.engine.poller_config());
        log_init_step!(
            3,
            5,
            "Status Poller",
            format!(
                "every {}s, up to {} concurrent polls",
                config.engine.poll_interval_secs, config.engine.poll_concurrency
            )
        );

        // [4/5] Schedule loop
        let schedule_loop = ScheduleExecutor::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            poller_handle.clone(),
            config.engine.executor_config(),
        );
        log_init_step!(
            4,
            5,
            "Schedule Loop",
            format!(
                "tick {}s, reporting lag {}d",
                config.engine.tick_interval_secs, config.engine.reporting_lag_days
            )
        );

        // [5/5] Backfill orchestrator
        let backfill = BackfillOrchestrator::new(
            Arc::clone(&store),
            executor,
            poller_handle,
            config.backfill.to_backfill_config(&config.engine),
            shutdown.clone(),
        );
        log_init_step!(
            5,
            5,
            "Backfill",
            format!(
                "{} collections x {} units",
                config.backfill.max_concurrent_collections, config.backfill.max_units_per_collection
            )
        );

        let state = AppState {
            config: Arc::new(config),
            store,
            backfill,
        };

        overall_timer.finish();
        log_success!("Cadence engine assembled");

        Ok(Self {
            state,
            poller,
            schedule_loop,
            shutdown,
        })
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Router with middleware, bound to this engine's state.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Start the poller and the schedule loop, and resume unfinished
    /// backfills. The tasks stop when the shutdown token is cancelled.
    pub async fn start(self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let poller = tokio::spawn(self.poller.run(self.shutdown.clone()));
        let schedule_loop = tokio::spawn(self.schedule_loop.run(self.shutdown.clone()));

        let resumed = self
            .state
            .backfill
            .recover()
            .await
            .context("failed to resume unfinished backfills")?;
        if resumed > 0 {
            tracing::info!(collections = resumed, "Resumed unfinished backfills");
        }

        Ok(vec![poller, schedule_loop])
    }
}

/// Build the API router with middleware.
pub fn create_router(state: AppState) -> Router {
    api::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => {
            let store = crate::store::SqliteStore::open(&config.path)
                .await
                .with_context(|| format!("failed to open sqlite store at {}", config.path))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => {
            anyhow::bail!("store.backend=sqlite requires building with --features sqlite")
        }
    }
}

fn create_executor(settings: &ExecutorSettings) -> anyhow::Result<Arc<dyn QueryExecutor>> {
    if settings.dry_run {
        return Ok(Arc::new(ScriptedExecutor::new()));
    }
    let base_url = settings
        .base_url
        .clone()
        .context("executor.base_url is required unless executor.dry_run is set")?;
    let timeout = Duration::from_secs(settings.timeout_secs);
    let credentials: Arc<dyn CredentialProvider> = match &settings.token_path {
        Some(path) => {
            let token_url = format!("{}{path}", base_url.trim_end_matches('/'));
            let source = PlatformTokenSource::new(token_url, settings.api_token.clone(), timeout)?;
            Arc::new(CachedCredentialProvider::new(source))
        }
        None => Arc::new(StaticCredentials::new(settings.api_token.clone())),
    };
    let executor = HttpQueryExecutor::new(
        HttpExecutorConfig {
            base_url,
            timeout,
            poll_principal: settings.poll_principal.clone(),
        },
        credentials,
    )?;
    Ok(Arc::new(executor))
}
