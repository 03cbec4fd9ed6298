//! Error types for TierMover
//!
//! Provides the error type shared by the data model and the policy resolver.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error type for the core model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    // ===== Policy Errors =====
    #[error("Unknown storage policy: {0}")]
    UnknownPolicy(String),

    #[error("Storage policy {name} declares no storage types")]
    EmptyPolicy { name: String },

    // ===== Model Errors =====
    #[error("Unknown storage type: {0}")]
    UnknownStorageType(String),

    #[error("Invalid block layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid replica location for block {block}: {reason}")]
    InvalidLocation { block: u64, reason: String },
}
