use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use im_core::config::Config;
use im_orchestrator::{
    Operation, OperationConfig, OperationError, OperationKind, OperationProcessor, OperationStatus,
    ProcessorConfig,
};
use im_source::rate_limiter::RateLimitConfig;
use im_source::retry::RetryPolicy;
use im_source::{HttpSourceClient, SourceClient, SourceError};
use im_sync::{GitWriter, ShellGitWriter, SyncEngine, SyncStateStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::hooks::{serve_hooks, HookState};

/// Upper bound for `--once` and for the per-operation credential watch.
const OPERATION_WATCH_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
/// How long shutdown waits for cancelled operations to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Hook triggers queued while an operation is starting; extras coalesce.
const TRIGGER_QUEUE: usize = 4;

/// Loop intervals of the scheduler.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub poll: Duration,
    pub cleanup: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll: Duration::from_secs(config.scheduler.poll_interval_secs),
            cleanup: Duration::from_secs(config.scheduler.cleanup_interval_secs),
        }
    }
}

/// The issue-mirror daemon: composition root plus the poll scheduler.
///
/// Operations are started on a timer, on hook triggers, and once at startup.
/// Shuts down when the shutdown token fires (ctrl-c in `main`).
pub struct Daemon {
    config: Config,
    source: Arc<dyn SourceClient>,
    state: Arc<SyncStateStore>,
    processor: OperationProcessor,
    intervals: DaemonIntervals,
    shutdown: CancellationToken,
    trigger_tx: flume::Sender<OperationKind>,
    trigger_rx: flume::Receiver<OperationKind>,
    /// A cleanup was turned away by an active operation; the next poll tick
    /// runs it instead of a reconcile.
    cleanup_deferred: AtomicBool,
}

impl Daemon {
    /// Wire the production stack from `config`. Missing credentials are fatal.
    pub fn new(config: Config) -> Result<Self> {
        let limits = RateLimitConfig::from(&config.rate_limit);
        let retry = RetryPolicy::new(
            config.source.max_retries,
            Duration::from_millis(config.source.retry_base_delay_ms),
        );
        let source = HttpSourceClient::new(&config.source, limits)
            .context("failed to build tracker client")?
            .with_retry(retry);
        let writer = ShellGitWriter::new(&config.git);

        std::fs::create_dir_all(&config.general.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.general.data_dir))?;
        let state = SyncStateStore::open(config.state_path()).context("failed to open sync state")?;

        Ok(Self::with_parts(
            config,
            Arc::new(source),
            Arc::new(writer),
            Arc::new(state),
        ))
    }

    /// Compose the daemon from already-built collaborators.
    pub fn with_parts(
        config: Config,
        source: Arc<dyn SourceClient>,
        writer: Arc<dyn GitWriter>,
        state: Arc<SyncStateStore>,
    ) -> Self {
        let engine = SyncEngine::new(Arc::clone(&source), writer, config.sync.clone())
            .with_branch(config.git.branch.clone());
        let processor = OperationProcessor::new(
            Arc::new(engine),
            Arc::clone(&state),
            ProcessorConfig {
                wait_poll_interval: Duration::from_millis(config.scheduler.wait_poll_interval_ms),
                ..ProcessorConfig::default()
            },
        );
        let (trigger_tx, trigger_rx) = flume::bounded(TRIGGER_QUEUE);
        Self {
            intervals: DaemonIntervals::from_config(&config),
            config,
            source,
            state,
            processor,
            shutdown: CancellationToken::new(),
            trigger_tx,
            trigger_rx,
            cleanup_deferred: AtomicBool::new(false),
        }
    }

    /// Override the loop intervals.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn processor(&self) -> &OperationProcessor {
        &self.processor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sender for out-of-schedule operation requests.
    pub fn trigger_sender(&self) -> flume::Sender<OperationKind> {
        self.trigger_tx.clone()
    }

    fn project(&self) -> &str {
        &self.config.source.project_key
    }

    /// Bootstrap a project that was never synced, reconcile otherwise.
    pub fn startup_kind(&self) -> OperationKind {
        match self.state.watermark(self.project()) {
            Some(_) => OperationKind::Reconcile,
            None => OperationKind::Bootstrap,
        }
    }

    /// Start `kind` for the configured project. A request for a project that
    /// already has an active operation is coalesced into it.
    pub fn trigger(&self, kind: OperationKind) -> Option<Operation> {
        match self
            .processor
            .start_operation(kind, OperationConfig::new(self.project()))
        {
            Ok(op) => {
                self.watch_credentials(op.id);
                Some(op)
            }
            Err(OperationError::AlreadyActive { operation_id, .. }) => {
                if kind == OperationKind::Cleanup {
                    self.cleanup_deferred.store(true, Ordering::SeqCst);
                    info!(active = %operation_id, "cleanup deferred to next poll");
                } else {
                    info!(%kind, active = %operation_id, "poll coalesced into active operation");
                }
                None
            }
            Err(e) => {
                error!(%kind, error = %e, "failed to start operation");
                None
            }
        }
    }

    /// Scheduled poll: a deferred cleanup if one is owed, a reconcile otherwise.
    pub fn poll_tick(&self) -> Option<Operation> {
        if self.cleanup_deferred.swap(false, Ordering::SeqCst) {
            return self.trigger(OperationKind::Cleanup);
        }
        self.trigger(OperationKind::Reconcile)
    }

    pub fn cleanup_deferred(&self) -> bool {
        self.cleanup_deferred.load(Ordering::SeqCst)
    }

    /// After a failed operation, probe authentication and re-read the
    /// credentials if the tracker rejects them.
    fn watch_credentials(&self, id: uuid::Uuid) {
        let processor = self.processor.clone();
        let source = Arc::clone(&self.source);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let Ok(op) = processor
                .wait_for_completion(id, OPERATION_WATCH_TIMEOUT, &shutdown)
                .await
            else {
                return;
            };
            if op.status == OperationStatus::Failed {
                refresh_rejected_credentials(source.as_ref(), &shutdown).await;
            }
        });
    }

    /// Run one operation to completion (`--once`).
    pub async fn run_once(&self, kind: OperationKind) -> Result<Operation> {
        let op = self
            .processor
            .start_operation(kind, OperationConfig::new(self.project()))
            .with_context(|| format!("failed to start {kind}"))?;
        let op = self
            .processor
            .wait_for_completion(op.id, OPERATION_WATCH_TIMEOUT, &self.shutdown)
            .await
            .with_context(|| format!("{kind} did not finish"))?;

        let summary = op.result_summary.clone().unwrap_or_default();
        info!(
            operation_id = %op.id,
            %kind,
            status = %op.status,
            processed = summary.processed_issues(),
            created = summary.counters.created_files,
            updated = summary.counters.updated_files,
            deleted = summary.counters.deleted_files,
            failed = summary.counters.failed_items,
            elapsed_ms = summary.elapsed_ms,
            "operation finished"
        );
        if op.status == OperationStatus::Failed {
            refresh_rejected_credentials(self.source.as_ref(), &self.shutdown).await;
        }
        Ok(op)
    }

    /// Scheduler loop; returns after the shutdown token fires and active
    /// operations have been cancelled.
    pub async fn run(&self) -> Result<()> {
        if let Some(bind) = &self.config.scheduler.hook_bind {
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind trigger hook on {bind}"))?;
            let secret = std::env::var(&self.config.scheduler.hook_secret_env).ok();
            if secret.as_deref().map_or(true, str::is_empty) {
                warn!("trigger hook has no secret, accepting unauthenticated requests");
            }
            let addr = listener.local_addr()?;
            tokio::spawn(serve_hooks(
                listener,
                HookState::new(self.trigger_tx.clone(), secret),
                self.shutdown.clone(),
            ));
            info!(%addr, "trigger hook listening");
        }

        info!(
            project = %self.project(),
            poll_secs = self.intervals.poll.as_secs(),
            cleanup_secs = self.intervals.cleanup.as_secs(),
            "daemon starting scheduler"
        );
        self.trigger(self.startup_kind());

        let mut poll = tokio::time::interval(self.intervals.poll);
        let mut cleanup = tokio::time::interval(self.intervals.cleanup);
        // Consume the immediate first ticks; startup already triggered.
        poll.tick().await;
        cleanup.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_tick();
                }
                _ = cleanup.tick() => {
                    self.trigger(OperationKind::Cleanup);
                    let removed = self
                        .processor
                        .cleanup_old_operations(self.config.scheduler.retention_days);
                    info!(removed, "operation history pruned");
                }
                Ok(kind) = self.trigger_rx.recv_async() => {
                    info!(%kind, "hook trigger received");
                    self.trigger(kind);
                }
                _ = self.shutdown.cancelled() => {
                    info!("shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        let cancelled = self.processor.shutdown(SHUTDOWN_GRACE).await;
        info!(cancelled, "daemon stopped");
        Ok(())
    }
}

/// On-401 credential rotation: reload only when the tracker actually rejects
/// the current pair.
async fn refresh_rejected_credentials(source: &dyn SourceClient, cancel: &CancellationToken) {
    match source.authenticate(cancel).await {
        Err(SourceError::Authentication { .. }) => match source.reload_credentials().await {
            Ok(()) => info!("tracker rejected credentials, reloaded from secret store"),
            Err(e) => error!(error = %e, "credential reload failed"),
        },
        Err(e) => warn!(error = %e, "authentication probe failed"),
        Ok(()) => {}
    }
}
