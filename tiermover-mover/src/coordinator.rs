//! Run Coordinator
//!
//! Drives one namespace through repeated scan and dispatch iterations until
//! every block satisfies its policy or the run has to give up, and runs
//! every namespace of a federation side by side.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MoverConfig;
use crate::connector::{ConnectorError, LeaseError, ListCursor, NamespaceConnector, NamespaceId};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::lease::RunLease;
use crate::ledger::MoveLedger;
use crate::paths::NamespacePaths;
use crate::scheduler::{ClusterView, ScanReport, Scheduler};
use crate::status::ExitStatus;
use tiermover_core::{BlockId, StoragePolicySuite};

/// Per-namespace run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    Dispatching,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Scanning => f.write_str("scanning"),
            RunState::Dispatching => f.write_str("dispatching"),
            RunState::Terminated => f.write_str("terminated"),
        }
    }
}

/// What one scan and dispatch iteration achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub blocks_needing_move: usize,
    pub scheduled: usize,
    pub moved: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Blocks with a move given up this iteration
    pub failed_blocks: Vec<BlockId>,
    pub duration: Duration,
}

impl IterationRecord {
    /// Something failed and nothing moved
    pub fn is_stalled(&self) -> bool {
        self.moved == 0 && self.failed > 0
    }
}

/// The run of one namespace
pub struct NamespaceRun {
    connector: Arc<dyn NamespaceConnector>,
    paths: Vec<String>,
    config: MoverConfig,
    policies: StoragePolicySuite,
    ledger: Arc<MoveLedger>,
    dispatcher: Dispatcher,
    holder: String,
    shutdown: watch::Receiver<bool>,
    state: RunState,
    history: Vec<IterationRecord>,
    unsatisfiable: BTreeSet<BlockId>,
    stall_count: u32,
}

impl NamespaceRun {
    /// `paths` of `None` (or empty) means the whole namespace
    pub fn new(
        connector: Arc<dyn NamespaceConnector>,
        paths: Option<Vec<String>>,
        config: MoverConfig,
    ) -> Self {
        let paths = match paths {
            Some(paths) if !paths.is_empty() => paths,
            _ => vec!["/".to_string()],
        };
        // Nobody ever signals this one
        let (_, shutdown) = watch::channel(false);

        Self {
            dispatcher: Dispatcher::new(config.dispatcher_config()),
            connector,
            paths,
            config,
            policies: StoragePolicySuite::default(),
            ledger: Arc::new(MoveLedger::new()),
            holder: default_holder(),
            shutdown,
            state: RunState::Idle,
            history: Vec::new(),
            unsatisfiable: BTreeSet::new(),
            stall_count: 0,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_policies(mut self, policies: StoragePolicySuite) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// Blocks for which no destination was found in any pass
    pub fn unsatisfiable(&self) -> &BTreeSet<BlockId> {
        &self.unsatisfiable
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(namespace = %self.connector.namespace(), from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    /// Run until a terminal status is reached
    #[instrument(skip(self), fields(namespace = %self.connector.namespace()))]
    pub async fn run(&mut self) -> ExitStatus {
        let status = self.run_inner().await;
        self.transition(RunState::Terminated);

        if !self.unsatisfiable.is_empty() {
            warn!(blocks = ?self.unsatisfiable, "Blocks with no suitable target storage");
        }
        info!(status = %status, iterations = self.history.len(), "Namespace run finished");
        status
    }

    async fn run_inner(&mut self) -> ExitStatus {
        match self.connector.is_policy_satisfier_active().await {
            Ok(true) => {
                info!("Storage policy satisfier is active, skipping namespace");
                return ExitStatus::SkippedDueToSps;
            }
            Ok(false) => {}
            Err(e) => {
                return ExitStatus::IoException(format!(
                    "failed to check storage policy satisfier: {}",
                    e
                ))
            }
        }

        let lease = match RunLease::acquire(
            self.connector.clone(),
            &self.holder,
            self.config.lease_renew_interval(),
        )
        .await
        {
            Ok(lease) => lease,
            Err(LeaseError::AlreadyHeld {
                holder,
                policy_satisfier: true,
            }) => {
                info!(holder = %holder, "Run lease held by storage policy satisfier");
                return ExitStatus::SkippedDueToSps;
            }
            Err(LeaseError::AlreadyHeld { holder, .. }) => {
                warn!(holder = %holder, "Another mover is running");
                return ExitStatus::AlreadyRunning { holder };
            }
            Err(e) => return ExitStatus::IoException(e.to_string()),
        };

        let status = self.iterate(&lease).await;
        lease.release().await;
        status
    }

    async fn iterate(&mut self, lease: &RunLease) -> ExitStatus {
        let mut iteration: u32 = 0;

        loop {
            iteration += 1;
            let start = Instant::now();

            if lease.is_lost() {
                return ExitStatus::IoException("run lease lost".to_string());
            }
            if *self.shutdown.borrow() {
                return ExitStatus::Interrupted;
            }

            self.transition(RunState::Scanning);
            let report = match self.scan().await {
                Ok(report) => report,
                Err(status) => return status,
            };
            self.unsatisfiable.extend(report.unsatisfiable.iter().copied());

            if !report.needs_movement() {
                info!(iteration, "All blocks satisfy their storage policy");
                return ExitStatus::Success;
            }

            if report.moves_scheduled == 0 && report.blocks_pending == 0 && self.ledger.is_empty() {
                warn!(
                    iteration,
                    unsatisfiable = report.unsatisfiable.len(),
                    "Blocks need moving but none can be scheduled"
                );
                return ExitStatus::NoMoveBlock {
                    unsatisfiable: self.unsatisfiable.len(),
                };
            }

            if self.config.max_iterations > 0 && iteration > self.config.max_iterations {
                warn!(max_iterations = self.config.max_iterations, "Iteration limit reached with work outstanding");
                return ExitStatus::NoMoveProgress {
                    iterations: self.config.max_iterations,
                };
            }

            // The lease may have gone or shutdown come while scanning
            if lease.is_lost() {
                return ExitStatus::IoException("run lease lost".to_string());
            }
            if *self.shutdown.borrow() {
                return ExitStatus::Interrupted;
            }

            self.transition(RunState::Dispatching);
            let dispatch = match self.dispatch(lease).await {
                Ok(dispatch) => dispatch,
                Err(status) => return status,
            };

            let tally = self.ledger.take_tally();
            let record = IterationRecord {
                iteration,
                blocks_needing_move: report.blocks_needing_move,
                scheduled: report.moves_scheduled,
                moved: dispatch.moved(),
                failed: dispatch.failed.len(),
                cancelled: dispatch.cancelled,
                failed_blocks: tally.failed_blocks.into_iter().collect(),
                duration: start.elapsed(),
            };

            info!(
                iteration,
                scheduled = record.scheduled,
                moved = record.moved,
                failed = record.failed,
                duration = ?record.duration,
                "Iteration complete"
            );

            if record.is_stalled() {
                self.stall_count += 1;
                warn!(
                    stalled_iterations = self.stall_count,
                    failed_blocks = ?record.failed_blocks,
                    "Iteration made no progress"
                );
            } else {
                self.stall_count = 0;
            }
            self.history.push(record);

            if self.stall_count >= self.config.max_no_progress_iterations {
                return ExitStatus::NoMoveProgress {
                    iterations: self.stall_count,
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.iteration_interval()) => {}
                reason = lease.lost() => {
                    return ExitStatus::IoException(format!("run lease lost: {}", reason));
                }
                _ = wait_for_shutdown(self.shutdown.clone()) => return ExitStatus::Interrupted,
            }
        }
    }

    /// Re-read the cluster and schedule every move the listed blocks need
    async fn scan(&self) -> Result<ScanReport, ExitStatus> {
        let reports = self
            .with_retries("storage report", || self.connector.storage_report())
            .await
            .map_err(|e| ExitStatus::IoException(format!("storage report failed: {}", e)))?;

        let cluster = ClusterView::from_reports(&reports);
        let mut scheduler = Scheduler::new(
            self.config.scheduler_config(),
            &self.ledger,
            &cluster,
            &self.policies,
        );

        for path in &self.paths {
            let mut cursor: Option<ListCursor> = None;
            loop {
                let listing = self
                    .with_retries("listing", || {
                        self.connector.list_blocks(path, cursor.as_ref())
                    })
                    .await;

                let page = match listing {
                    Ok(page) => page,
                    Err(ConnectorError::PathNotFound(_)) => {
                        warn!(path = %path, "Path not found, skipping");
                        break;
                    }
                    Err(e) => {
                        error!(path = %path, error = %e, "Listing failed");
                        return Err(ExitStatus::IoException(format!(
                            "listing {} failed: {}",
                            path, e
                        )));
                    }
                };

                for located in &page.blocks {
                    scheduler.schedule_block(located);
                }

                match page.next {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        let report = scheduler.finish();
        info!(summary = %report.summary(), "Scan complete");
        Ok(report)
    }

    /// Retry transient connector errors up to `listing_retries` times
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.listing_retries => {
                    attempt += 1;
                    warn!(operation = what, attempt, error = %e, "Transient failure, retrying");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatch claimed moves, stopping early if the lease is lost
    async fn dispatch(&self, lease: &RunLease) -> Result<DispatchReport, ExitStatus> {
        let dispatch = self
            .dispatcher
            .dispatch(self.connector.clone(), self.ledger.clone());
        tokio::pin!(dispatch);

        let status = tokio::select! {
            report = &mut dispatch => return Ok(report),
            reason = lease.lost() => {
                warn!(reason = %reason, "Run lease lost, stopping dispatch");
                ExitStatus::IoException(format!("run lease lost: {}", reason))
            }
            _ = wait_for_shutdown(self.shutdown.clone()) => {
                warn!("Interrupted, stopping dispatch");
                ExitStatus::Interrupted
            }
        };

        // Let in-flight moves finish; nothing new is started
        self.dispatcher.shutdown();
        match tokio::time::timeout(self.config.lease_grace_period(), &mut dispatch).await {
            Ok(report) => info!(summary = %report.summary(), "In-flight moves drained"),
            Err(_) => {
                warn!(
                    grace_period = ?self.config.lease_grace_period(),
                    "In-flight moves did not finish within grace period, aborting"
                );
                self.dispatcher.abort();
                let report = dispatch.await;
                info!(cancelled = report.cancelled, "In-flight moves aborted");
            }
        }
        Err(status)
    }
}

fn default_holder() -> String {
    format!("tiermover-{}-{}", std::process::id(), Uuid::new_v4().simple())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without signalling
            std::future::pending::<()>().await;
        }
    }
}

/// Move blocks of every namespace to the storage their policy requires
pub async fn run(
    namespace_paths: NamespacePaths,
    connectors: HashMap<NamespaceId, Arc<dyn NamespaceConnector>>,
    config: &MoverConfig,
) -> ExitStatus {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(namespace_paths, connectors, config, shutdown_rx).await
}

/// Like [`run`], ending every namespace with `Interrupted` once `shutdown`
/// turns true
#[instrument(skip_all, fields(namespaces = namespace_paths.len()))]
pub async fn run_with_shutdown(
    namespace_paths: NamespacePaths,
    mut connectors: HashMap<NamespaceId, Arc<dyn NamespaceConnector>>,
    config: &MoverConfig,
    shutdown: watch::Receiver<bool>,
) -> ExitStatus {
    if let Err(e) = config.validate() {
        return ExitStatus::IllegalArguments(e.to_string());
    }
    if namespace_paths.is_empty() {
        return ExitStatus::IllegalArguments("no namespace to process".to_string());
    }

    let mut runs = Vec::with_capacity(namespace_paths.len());
    for (namespace, paths) in namespace_paths {
        if namespace.is_empty() {
            return ExitStatus::IllegalArguments("empty namespace identifier".to_string());
        }
        if let Some(bad) = paths.iter().flatten().find(|p| !p.starts_with('/')) {
            return ExitStatus::IllegalArguments(format!("The path {} is not absolute", bad));
        }
        let Some(connector) = connectors.remove(&namespace) else {
            return ExitStatus::IllegalArguments(format!("no connector for namespace {}", namespace));
        };
        runs.push((
            namespace,
            NamespaceRun::new(connector, paths, config.clone()).with_shutdown(shutdown.clone()),
        ));
    }

    info!(namespaces = runs.len(), "Starting mover");

    let (namespaces, handles): (Vec<_>, Vec<_>) = runs
        .into_iter()
        .map(|(namespace, mut namespace_run)| {
            (namespace, tokio::spawn(async move { namespace_run.run().await }))
        })
        .unzip();

    let mut status = ExitStatus::Success;
    for (namespace, result) in namespaces.into_iter().zip(join_all(handles).await) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(namespace = %namespace, error = %e, "Namespace task failed");
                ExitStatus::IoException(format!("namespace {} task failed: {}", namespace, e))
            }
        };
        info!(namespace = %namespace, status = %outcome, "Namespace finished");
        status = status.worst(outcome);
    }

    info!(status = %status, "Mover finished");
    status
}
