//! Block and replica location model
//!
//! Blocks are the unit the mover relocates. A block's replicas (or, for
//! striped groups, its data and parity pieces) each live on one storage of
//! one data node, and every storage has a storage type.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Class of physical medium a replica resides on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    /// Memory-backed, lost on restart
    RamDisk,
    /// Flash
    Ssd,
    /// Spinning disk
    #[default]
    Disk,
    /// Dense, slow archival disk
    Archive,
    /// Externally provided, read-only
    Provided,
}

impl StorageType {
    pub const ALL: [StorageType; 5] = [
        StorageType::RamDisk,
        StorageType::Ssd,
        StorageType::Disk,
        StorageType::Archive,
        StorageType::Provided,
    ];

    pub fn is_transient(self) -> bool {
        matches!(self, StorageType::RamDisk)
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, StorageType::Provided)
    }

    /// Whether replicas may be moved onto or off this storage type
    pub fn is_movable(self) -> bool {
        !self.is_transient() && !self.is_read_only()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::RamDisk => "RAM_DISK",
            StorageType::Ssd => "SSD",
            StorageType::Disk => "DISK",
            StorageType::Archive => "ARCHIVE",
            StorageType::Provided => "PROVIDED",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        StorageType::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| CoreError::UnknownStorageType(s.to_string()))
    }
}

/// Block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}", self.0)
    }
}

/// Data node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An immutable block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Length in bytes
    pub len: u64,
    pub generation_stamp: u64,
}

impl Block {
    pub fn new(id: u64, len: u64, generation_stamp: u64) -> Self {
        Self {
            id: BlockId(id),
            len,
            generation_stamp,
        }
    }
}

/// How a block is laid out across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockLayout {
    /// Single-piece block with full replicas
    Contiguous { replication: u16 },
    /// Multi-piece (erasure-coded) block group
    Striped { data_units: u8, parity_units: u8 },
}

impl BlockLayout {
    pub fn is_striped(&self) -> bool {
        matches!(self, BlockLayout::Striped { .. })
    }

    /// Number of placement slots the storage policy must fill
    pub fn slot_count(&self) -> usize {
        match self {
            BlockLayout::Contiguous { replication } => *replication as usize,
            BlockLayout::Striped {
                data_units,
                parity_units,
            } => *data_units as usize + *parity_units as usize,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BlockLayout::Contiguous { replication: 0 } => Err(CoreError::InvalidLayout(
                "replication must be at least 1".to_string(),
            )),
            BlockLayout::Striped { data_units: 0, .. } => Err(CoreError::InvalidLayout(
                "striped layout needs at least one data unit".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Where one replica (or striped piece) of a block currently resides
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub node: NodeId,
    pub storage_type: StorageType,
    pub storage_id: String,
    /// Piece index inside a striped block group
    #[serde(default)]
    pub piece_index: Option<u8>,
}

impl ReplicaLocation {
    pub fn new(
        node: impl Into<NodeId>,
        storage_type: StorageType,
        storage_id: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            storage_type,
            storage_id: storage_id.into(),
            piece_index: None,
        }
    }

    pub fn with_piece(mut self, index: u8) -> Self {
        self.piece_index = Some(index);
        self
    }
}

impl fmt::Display for ReplicaLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}[{}]", self.node, self.storage_id, self.storage_type)?;
        if let Some(index) = self.piece_index {
            write!(f, "#{}", index)?;
        }
        Ok(())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One listing record: a block, its replicas and the policy governing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    /// Path of the file the block belongs to
    pub path: String,
    /// Declared storage policy name
    pub policy: String,
    pub block: Block,
    pub layout: BlockLayout,
    pub locations: Vec<ReplicaLocation>,
}

impl LocatedBlock {
    /// Storage types of the current replicas, in location order
    pub fn storage_types(&self) -> Vec<StorageType> {
        self.locations.iter().map(|l| l.storage_type).collect()
    }

    /// Whether any replica or piece lives on `node`
    pub fn hosts_node(&self, node: &NodeId) -> bool {
        self.locations.iter().any(|l| &l.node == node)
    }

    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;

        let mut storages = HashSet::new();
        for location in &self.locations {
            if !storages.insert(location.storage_id.as_str()) {
                return Err(CoreError::InvalidLocation {
                    block: self.block.id.0,
                    reason: format!("storage {} listed twice", location.storage_id),
                });
            }
            match (self.layout.is_striped(), location.piece_index) {
                (true, None) => {
                    return Err(CoreError::InvalidLocation {
                        block: self.block.id.0,
                        reason: format!("striped piece on {} has no index", location.node),
                    })
                }
                (true, Some(index)) if index as usize >= self.layout.slot_count() => {
                    return Err(CoreError::InvalidLocation {
                        block: self.block.id.0,
                        reason: format!("piece index {} out of range", index),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}
