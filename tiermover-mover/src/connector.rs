//! Namespace connector
//!
//! The mover talks to each namespace through a [`NamespaceConnector`]: block
//! listings, the cluster's storage report, the exclusive run lease and the
//! relocation primitive. Implementations wrap the metadata service RPC
//! client and the block transfer protocol; tests use
//! [`SimulatedCluster`](crate::simulated::SimulatedCluster).

use crate::ledger::MoveIntent;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tiermover_core::{LocatedBlock, NodeId, StorageType};
use uuid::Uuid;

/// Connector errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Transient metadata error: {0}")]
    Transient(String),

    #[error("Metadata service unavailable: {0}")]
    Unavailable(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),
}

impl ConnectorError {
    /// Whether the same call may succeed when retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Run lease errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Run lease already held by {holder}")]
    AlreadyHeld {
        holder: String,
        /// Held by the storage policy satisfier rather than another mover
        policy_satisfier: bool,
    },

    #[error("Run lease lost: {0}")]
    Lost(String),

    #[error("Lease service unavailable: {0}")]
    Unavailable(String),
}

/// Relocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelocateError {
    #[error("Block data missing on source: {0}")]
    SourceMissing(String),

    #[error("Transfer refused: {0}")]
    Refused(String),

    #[error("Timeout during transfer")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Namespace identity (one per federation member)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NamespaceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Token proving ownership of a namespace run lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub namespace: NamespaceId,
    pub holder: String,
    pub id: Uuid,
}

impl LeaseToken {
    pub fn new(namespace: NamespaceId, holder: impl Into<String>) -> Self {
        Self {
            namespace,
            holder: holder.into(),
            id: Uuid::new_v4(),
        }
    }
}

/// One storage on a data node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReport {
    pub storage_id: String,
    pub storage_type: StorageType,
    pub capacity: u64,
    pub remaining: u64,
}

/// A data node and its storages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatanodeStorageReport {
    pub node: NodeId,
    pub rack: String,
    pub storages: Vec<StorageReport>,
}

/// Opaque position inside a listing; passing it back resumes after it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListCursor(pub String);

/// One page of a block listing
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub blocks: Vec<LocatedBlock>,
    /// Cursor for the next page, `None` once the listing is exhausted
    pub next: Option<ListCursor>,
}

/// Access to one namespace of the cluster
#[async_trait::async_trait]
pub trait NamespaceConnector: Send + Sync {
    fn namespace(&self) -> &NamespaceId;

    /// Whether the always-on storage policy satisfier is working this namespace
    async fn is_policy_satisfier_active(&self) -> Result<bool>;

    async fn acquire_run_lease(&self, holder: &str) -> std::result::Result<LeaseToken, LeaseError>;

    async fn renew_run_lease(&self, token: &LeaseToken) -> std::result::Result<(), LeaseError>;

    async fn release_run_lease(&self, token: &LeaseToken) -> std::result::Result<(), LeaseError>;

    /// Data nodes with their storages and free space
    async fn storage_report(&self) -> Result<Vec<DatanodeStorageReport>>;

    /// List blocks under `path`, resuming after `cursor` when given
    async fn list_blocks(&self, path: &str, cursor: Option<&ListCursor>) -> Result<ListingPage>;

    /// Copy the source replica to the target storage and retire the source
    async fn relocate(&self, intent: &MoveIntent) -> std::result::Result<(), RelocateError>;
}
