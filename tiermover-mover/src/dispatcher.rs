//! Move Dispatcher
//!
//! Executes claimed ledger entries with:
//! - Parallel execution across nodes
//! - Concurrency limits per source and per target node
//! - Per-attempt timeout
//! - Retries with backoff, bounded by the ledger's attempt counter
//! - Shutdown that stops new attempts, and abort for the ones running

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::connector::{NamespaceConnector, RelocateError};
use crate::ledger::{MoveId, MoveIntent, MoveLedger, MoveOutcome, RetryDecision};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent moves
    pub max_concurrent: usize,
    /// Maximum concurrent moves reading from one node
    pub max_per_source: usize,
    /// Maximum concurrent moves writing to one node
    pub max_per_target: usize,
    /// Timeout per relocation attempt
    pub move_timeout: Duration,
    /// Attempts before a move is given up
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_per_source: 5,
            max_per_target: 5,
            move_timeout: Duration::from_secs(300), // 5 minutes
            max_attempts: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// How a single move ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveStatus {
    Succeeded,
    Failed(RelocateError),
    /// Not attempted again after shutdown
    Cancelled,
}

/// Result of dispatching a single move
#[derive(Debug, Clone)]
pub struct MoveResult {
    pub id: MoveId,
    pub intent: MoveIntent,
    pub status: MoveStatus,
    pub attempts: u32,
    pub duration: Duration,
}

impl MoveResult {
    pub fn is_success(&self) -> bool {
        self.status == MoveStatus::Succeeded
    }
}

/// Overall dispatch result
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub succeeded: Vec<MoveResult>,
    pub failed: Vec<MoveResult>,
    pub cancelled: usize,
    /// Bytes of successfully moved blocks
    pub total_bytes: u64,
    pub duration: Duration,
}

impl DispatchReport {
    pub fn moved(&self) -> usize {
        self.succeeded.len()
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded.len() + self.failed.len();
        if total == 0 {
            100.0
        } else {
            (self.succeeded.len() as f64 / total as f64) * 100.0
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} cancelled, {} bytes in {:?} ({:.1}% success rate)",
            self.succeeded.len(),
            self.failed.len(),
            self.cancelled,
            self.total_bytes,
            self.duration,
            self.success_rate()
        )
    }
}

/// Move dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    config: DispatcherConfig,
    global_semaphore: Arc<Semaphore>,
    source_semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    target_semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    shutdown: Arc<AtomicBool>,
    abort: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let global_semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            config,
            global_semaphore,
            source_semaphores: Arc::new(Mutex::new(HashMap::new())),
            target_semaphores: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(watch::channel(false).0),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim every pending ledger entry and run it to a terminal outcome.
    ///
    /// Dropping the returned future aborts every move it spawned.
    #[instrument(skip(self, connector, ledger), fields(namespace = %connector.namespace()))]
    pub async fn dispatch(
        &self,
        connector: Arc<dyn NamespaceConnector>,
        ledger: Arc<MoveLedger>,
    ) -> DispatchReport {
        let start = Instant::now();
        let mut report = DispatchReport::default();

        if self.is_shutdown() {
            // Nothing new starts after shutdown
            for (id, _) in ledger.claim_pending() {
                ledger.complete(id, MoveOutcome::Cancelled);
                report.cancelled += 1;
            }
            return report;
        }

        let claimed = ledger.claim_pending();
        if claimed.is_empty() {
            debug!("No moves to dispatch");
            return report;
        }

        info!(moves = claimed.len(), "Dispatching moves");

        let mut tasks = MoveTasks(Vec::with_capacity(claimed.len()));
        for (id, intent) in claimed {
            let dispatcher = self.clone();
            let connector = connector.clone();
            let ledger = ledger.clone();
            let task_intent = intent.clone();

            let handle = tokio::spawn(async move {
                dispatcher.run_move(id, task_intent, connector, ledger).await
            });
            tasks.0.push((id, intent, handle));
        }

        for (id, intent, handle) in tasks.0.iter_mut() {
            match handle.await {
                Ok(result) => match result.status {
                    MoveStatus::Succeeded => {
                        report.total_bytes += result.intent.block.len;
                        report.succeeded.push(result);
                    }
                    MoveStatus::Failed(_) => report.failed.push(result),
                    MoveStatus::Cancelled => report.cancelled += 1,
                },
                Err(e) if e.is_cancelled() => {
                    ledger.complete(*id, MoveOutcome::Cancelled);
                    report.cancelled += 1;
                }
                Err(e) => {
                    error!(move_id = *id, error = %e, "Move task panicked");
                    let error = RelocateError::Transport(format!("move task failed: {}", e));
                    ledger.complete(*id, MoveOutcome::Failed(error.to_string()));
                    report.failed.push(MoveResult {
                        id: *id,
                        intent: intent.clone(),
                        status: MoveStatus::Failed(error),
                        attempts: 0,
                        duration: start.elapsed(),
                    });
                }
            }
        }

        report.duration = start.elapsed();
        info!(summary = %report.summary(), "Dispatch complete");
        report
    }

    /// Run one move until it succeeds, exhausts its attempts or is cancelled
    async fn run_move(
        &self,
        id: MoveId,
        intent: MoveIntent,
        connector: Arc<dyn NamespaceConnector>,
        ledger: Arc<MoveLedger>,
    ) -> MoveResult {
        let start = Instant::now();
        let mut attempts = 0;

        let status = loop {
            if self.is_shutdown() {
                break MoveStatus::Cancelled;
            }

            let error = match self.attempt(&intent, connector.as_ref()).await {
                Attempt::Done(Ok(())) => {
                    ledger.complete(id, MoveOutcome::Succeeded);
                    debug!(intent = %intent, "Move succeeded");
                    break MoveStatus::Succeeded;
                }
                Attempt::Done(Err(e)) => e,
                Attempt::Cancelled => break MoveStatus::Cancelled,
            };

            match ledger.record_failure(id, self.config.max_attempts, &error.to_string()) {
                RetryDecision::Retry { attempts: n } => {
                    attempts = n;
                    warn!(intent = %intent, attempt = n, error = %error, "Move failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = aborted(self.abort.subscribe()) => {}
                    }
                    ledger.resume(id);
                }
                RetryDecision::GiveUp { attempts: n } => {
                    attempts = n;
                    warn!(intent = %intent, attempts = n, error = %error, "Giving up on move");
                    break MoveStatus::Failed(error);
                }
            }
        };

        if status == MoveStatus::Cancelled {
            debug!(intent = %intent, "Move cancelled");
            ledger.complete(id, MoveOutcome::Cancelled);
        }

        MoveResult {
            id,
            intent,
            status,
            attempts,
            duration: start.elapsed(),
        }
    }

    /// One relocation attempt under the concurrency limits, cut short by
    /// [`Dispatcher::abort`]
    async fn attempt(&self, intent: &MoveIntent, connector: &dyn NamespaceConnector) -> Attempt {
        tokio::select! {
            attempt = self.guarded_relocate(intent, connector) => attempt,
            _ = aborted(self.abort.subscribe()) => Attempt::Cancelled,
        }
    }

    async fn guarded_relocate(
        &self,
        intent: &MoveIntent,
        connector: &dyn NamespaceConnector,
    ) -> Attempt {
        // Always global, then source, then target, so waiters can't deadlock
        let _permits = match self.acquire_permits(intent).await {
            Ok(permits) => permits,
            Err(e) => return Attempt::Done(Err(e)),
        };

        // Shutdown may have come while this move waited for its permits
        if self.is_shutdown() {
            return Attempt::Cancelled;
        }

        match timeout(self.config.move_timeout, connector.relocate(intent)).await {
            Ok(result) => Attempt::Done(result),
            Err(_) => Attempt::Done(Err(RelocateError::Timeout)),
        }
    }

    async fn acquire_permits(
        &self,
        intent: &MoveIntent,
    ) -> Result<[OwnedSemaphorePermit; 3], RelocateError> {
        let closed = |_| RelocateError::Refused("dispatcher closed".to_string());

        let global = self
            .global_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(closed)?;

        let source = node_semaphore(
            &self.source_semaphores,
            intent.source.node.as_str(),
            self.config.max_per_source,
        )
        .acquire_owned()
        .await
        .map_err(closed)?;

        let target = node_semaphore(
            &self.target_semaphores,
            intent.target_node.as_str(),
            self.config.max_per_target,
        )
        .acquire_owned()
        .await
        .map_err(closed)?;

        Ok([global, source, target])
    }

    /// Stop starting new attempts; running attempts finish unless [`Dispatcher::abort`] follows
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Dispatcher shutdown signaled");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Shut down and cancel running attempts as well
    pub fn abort(&self) {
        self.shutdown();
        if !self.abort.send_replace(true) {
            warn!("Aborting in-flight moves");
        }
    }
}

/// Outcome of a single attempt
enum Attempt {
    Done(Result<(), RelocateError>),
    Cancelled,
}

/// Spawned moves of one dispatch; those still running are aborted on drop
struct MoveTasks(Vec<(MoveId, MoveIntent, JoinHandle<MoveResult>)>);

impl Drop for MoveTasks {
    fn drop(&mut self) {
        for (_, _, handle) in &self.0 {
            handle.abort();
        }
    }
}

/// Resolves once the abort flag is set
async fn aborted(mut rx: watch::Receiver<bool>) {
    let closed = rx.wait_for(|aborted| *aborted).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Get or create a node semaphore
fn node_semaphore(
    semaphores: &Mutex<HashMap<String, Arc<Semaphore>>>,
    node: &str,
    permits: usize,
) -> Arc<Semaphore> {
    semaphores
        .lock()
        .entry(node.to_string())
        .or_insert_with(|| Arc::new(Semaphore::new(permits)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedCluster;
    use std::sync::atomic::AtomicUsize;
    use tiermover_core::{Block, NodeId, ReplicaLocation, StorageType};

    fn intent(block: u64, source: &str, target: &str) -> MoveIntent {
        MoveIntent {
            path: "/cold/file".to_string(),
            block: Block::new(block, 1024, 1),
            source: ReplicaLocation::new(source, StorageType::Disk, format!("{}-s0", source)),
            target_type: StorageType::Archive,
            target_node: NodeId::new(target),
            target_storage: format!("{}-s1", target),
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            retry_delay: Duration::from_millis(1),
            move_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Connector wrapper that fails the first `failures` relocations
    struct Flaky {
        inner: SimulatedCluster,
        failures: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        /// Relocations started
        calls: AtomicUsize,
        /// Relocations that ran to the end of their delay
        finished: AtomicUsize,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: usize, delay: Duration) -> Self {
            Self {
                inner: SimulatedCluster::new("ns1"),
                failures: AtomicUsize::new(failures),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait::async_trait]
    impl NamespaceConnector for Flaky {
        fn namespace(&self) -> &crate::connector::NamespaceId {
            self.inner.namespace()
        }

        async fn is_policy_satisfier_active(&self) -> crate::connector::Result<bool> {
            Ok(false)
        }

        async fn acquire_run_lease(
            &self,
            holder: &str,
        ) -> std::result::Result<crate::connector::LeaseToken, crate::connector::LeaseError> {
            self.inner.acquire_run_lease(holder).await
        }

        async fn renew_run_lease(
            &self,
            _token: &crate::connector::LeaseToken,
        ) -> std::result::Result<(), crate::connector::LeaseError> {
            Ok(())
        }

        async fn release_run_lease(
            &self,
            _token: &crate::connector::LeaseToken,
        ) -> std::result::Result<(), crate::connector::LeaseError> {
            Ok(())
        }

        async fn storage_report(
            &self,
        ) -> crate::connector::Result<Vec<crate::connector::DatanodeStorageReport>> {
            Ok(Vec::new())
        }

        async fn list_blocks(
            &self,
            _path: &str,
            _cursor: Option<&crate::connector::ListCursor>,
        ) -> crate::connector::Result<crate::connector::ListingPage> {
            Ok(Default::default())
        }

        async fn relocate(&self, _intent: &MoveIntent) -> std::result::Result<(), RelocateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RelocateError::Transport("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_dispatcher_config_default() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrent, 64);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn test_dispatch_report_success_rate() {
        let mut report = DispatchReport::default();
        assert_eq!(report.success_rate(), 100.0);

        report.succeeded.push(MoveResult {
            id: 1,
            intent: intent(1, "dn1", "dn2"),
            status: MoveStatus::Succeeded,
            attempts: 0,
            duration: Duration::from_secs(1),
        });
        report.failed.push(MoveResult {
            id: 2,
            intent: intent(2, "dn1", "dn2"),
            status: MoveStatus::Failed(RelocateError::Timeout),
            attempts: 3,
            duration: Duration::from_secs(1),
        });
        assert_eq!(report.success_rate(), 50.0);
    }

    #[tokio::test]
    async fn test_dispatch_empty_ledger() {
        let dispatcher = Dispatcher::new(fast_config());
        let report = dispatcher
            .dispatch(
                Arc::new(Flaky::new(0, Duration::ZERO)),
                Arc::new(MoveLedger::new()),
            )
            .await;
        assert_eq!(report.moved(), 0);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_retries_until_success() {
        let dispatcher = Dispatcher::new(fast_config());
        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(1, "dn1", "dn2")).unwrap();

        let report = dispatcher
            .dispatch(Arc::new(Flaky::new(2, Duration::ZERO)), ledger.clone())
            .await;

        assert_eq!(report.moved(), 1);
        assert_eq!(report.succeeded[0].attempts, 2);
        assert_eq!(report.total_bytes, 1024);
        assert!(ledger.is_empty());
        assert_eq!(ledger.take_tally().succeeded, 1);
    }

    #[tokio::test]
    async fn test_dispatch_gives_up_after_max_attempts() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_attempts: 3,
            ..fast_config()
        });
        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(7, "dn1", "dn2")).unwrap();

        let report = dispatcher
            .dispatch(Arc::new(Flaky::new(usize::MAX, Duration::ZERO)), ledger.clone())
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 3);
        assert!(ledger.is_empty());
        let tally = ledger.take_tally();
        assert_eq!(tally.failed, 1);
        assert!(tally.failed_blocks.contains(&tiermover_core::BlockId(7)));
    }

    #[tokio::test]
    async fn test_dispatch_respects_per_source_limit() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_per_source: 2,
            ..fast_config()
        });
        let ledger = Arc::new(MoveLedger::new());
        for block in 0..6 {
            ledger
                .insert(intent(block, "dn1", &format!("dn{}", block + 2)))
                .unwrap();
        }

        let connector = Arc::new(Flaky::new(0, Duration::from_millis(20)));
        let report = dispatcher.dispatch(connector.clone(), ledger).await;

        assert_eq!(report.moved(), 6);
        assert!(connector.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_moves() {
        let dispatcher = Dispatcher::new(fast_config());
        dispatcher.shutdown();
        assert!(dispatcher.is_shutdown());

        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(1, "dn1", "dn2")).unwrap();
        let report = dispatcher
            .dispatch(Arc::new(Flaky::new(0, Duration::ZERO)), ledger.clone())
            .await;

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.moved(), 0);
        assert!(ledger.is_empty());

        let tally = ledger.take_tally();
        assert_eq!(tally.cancelled, 1);
        assert_eq!(tally.failed, 0);
        assert!(tally.failed_blocks.is_empty());
    }

    #[tokio::test]
    async fn test_no_relocation_starts_after_shutdown() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(1, "dn1", "dn2")).unwrap();
        ledger.insert(intent(2, "dn3", "dn4")).unwrap();

        let connector = Arc::new(Flaky::new(0, Duration::from_millis(200)));
        let running = {
            let dispatcher = dispatcher.clone();
            let connector = connector.clone();
            let ledger = ledger.clone();
            tokio::spawn(async move { dispatcher.dispatch(connector, ledger).await })
        };

        // The second move is parked on the global permit by now
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown();

        let report = running.await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.moved(), 1);
        assert_eq!(report.cancelled, 1);
        assert!(ledger.is_empty());
        assert_eq!(ledger.take_tally().cancelled, 1);
    }

    #[tokio::test]
    async fn test_abort_stops_running_relocations() {
        let dispatcher = Dispatcher::new(fast_config());
        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(1, "dn1", "dn2")).unwrap();

        let connector = Arc::new(Flaky::new(0, Duration::from_secs(10)));
        let running = {
            let dispatcher = dispatcher.clone();
            let connector = connector.clone();
            let ledger = ledger.clone();
            tokio::spawn(async move { dispatcher.dispatch(connector, ledger).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        dispatcher.abort();

        let report = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.moved(), 0);
        assert!(report.failed.is_empty());
        assert_eq!(connector.finished.load(Ordering::SeqCst), 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_dispatch_aborts_moves() {
        let dispatcher = Dispatcher::new(fast_config());
        let ledger = Arc::new(MoveLedger::new());
        ledger.insert(intent(1, "dn1", "dn2")).unwrap();

        let connector = Arc::new(Flaky::new(0, Duration::from_millis(100)));
        let dispatch = dispatcher.dispatch(connector.clone(), ledger.clone());
        assert!(tokio::time::timeout(Duration::from_millis(20), dispatch)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(connector.finished.load(Ordering::SeqCst), 0);
    }
}
