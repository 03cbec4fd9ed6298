//! TierMover Core Library
//!
//! Core abstractions for the TierMover storage-tier rebalancer.
//! This crate provides:
//! - Block, layout and replica location model
//! - Storage types and storage policies
//! - Policy resolution and storage-type diffing
//! - Common error handling

pub mod block;
pub mod error;
pub mod policy;

pub use block::{Block, BlockId, BlockLayout, LocatedBlock, NodeId, ReplicaLocation, StorageType};
pub use error::{CoreError, Result};
pub use policy::{PolicyResolution, StoragePolicy, StoragePolicySuite, StorageTypeDiff};

/// Default replication for contiguous blocks
pub const DEFAULT_REPLICATION: u16 = 3;
