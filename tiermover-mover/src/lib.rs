//! TierMover
//!
//! Moves block replicas between storage types until every block matches its
//! storage policy.
//!
//! A run works each namespace independently:
//! - Scanning (list blocks, compare replicas against the policy)
//! - Scheduling (pick source replicas and target storages)
//! - Dispatching (relocate replicas with bounded concurrency)
//! - Termination with a stable exit status

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod dispatcher;
pub mod lease;
pub mod ledger;
pub mod paths;
pub mod scheduler;
pub mod simulated;
pub mod status;

// Re-export main types
pub use config::{ConfigError, MoverConfig};
pub use connector::{
    ConnectorError, DatanodeStorageReport, LeaseError, LeaseToken, ListCursor, ListingPage,
    NamespaceConnector, NamespaceId, RelocateError, StorageReport,
};
pub use coordinator::{run, run_with_shutdown, IterationRecord, NamespaceRun, RunState};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig, MoveResult, MoveStatus};
pub use lease::RunLease;
pub use ledger::{MoveId, MoveIntent, MoveKey, MoveLedger, MoveOutcome};
pub use paths::{resolve_namespace_paths, NamespacePaths, PathError};
pub use scheduler::{
    BlockVerdict, ClusterView, RelocationCandidate, ScanReport, Scheduler, SchedulerConfig,
};
pub use simulated::{ClusterSpec, SimulatedCluster, SimulationError};
pub use status::ExitStatus;
