//! Simulated namespace
//!
//! In-memory cluster implementing [`NamespaceConnector`]. Used by the
//! binary's `--cluster` mode and by tests. Not persistent.
//!
//! Relocations really move replicas, so a second pass over the same
//! cluster sees the effect of the first. Faults can be injected to
//! exercise the coordinator's failure paths.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::connector::{
    ConnectorError, DatanodeStorageReport, LeaseError, LeaseToken, ListCursor, ListingPage,
    NamespaceConnector, NamespaceId, RelocateError, StorageReport,
};
use crate::ledger::MoveIntent;
use tiermover_core::{
    Block, BlockId, BlockLayout, LocatedBlock, NodeId, ReplicaLocation, StorageType,
    DEFAULT_REPLICATION,
};

/// Errors building a simulated cluster
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node {node} has no {storage_type} storage")]
    NoStorage {
        node: String,
        storage_type: StorageType,
    },

    #[error("Duplicate block: {0}")]
    DuplicateBlock(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cluster file: {0}")]
    Parse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SimulationError>;

/// Default listing page size
const DEFAULT_PAGE_SIZE: usize = 100;

/// Cluster description as loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub namespace: String,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub faults: FaultSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default = "default_rack")]
    pub rack: String,
    pub storages: Vec<StorageSpec>,
}

fn default_rack() -> String {
    "/default-rack".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub policy: String,
    /// Contiguous with default replication when omitted
    #[serde(default)]
    pub layout: Option<BlockLayout>,
    pub blocks: Vec<BlockSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub id: u64,
    pub len: u64,
    #[serde(default)]
    pub generation_stamp: u64,
    pub replicas: Vec<ReplicaSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub node: String,
    #[serde(rename = "type")]
    pub storage_type: StorageType,
}

/// Injected faults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultSpec {
    #[serde(default)]
    pub policy_satisfier_active: bool,
    /// Foreign lease holder present from the start
    #[serde(default)]
    pub lease_holder: Option<String>,
    #[serde(default)]
    pub lease_holder_is_satisfier: bool,
    #[serde(default)]
    pub fail_lease_renewal: bool,
    /// Blocks whose source data is gone; relocating them fails
    #[serde(default)]
    pub missing_source_blocks: Vec<u64>,
    /// Target storage types that refuse incoming replicas
    #[serde(default)]
    pub refused_storage_types: Vec<StorageType>,
    /// Listing calls that fail transiently before listings work
    #[serde(default)]
    pub transient_listing_failures: u32,
}

#[derive(Debug, Clone)]
struct SimStorage {
    id: String,
    storage_type: StorageType,
    capacity: u64,
    remaining: u64,
}

#[derive(Debug, Clone)]
struct SimNode {
    rack: String,
    storages: Vec<SimStorage>,
}

#[derive(Debug, Clone)]
struct SimFile {
    policy: String,
    layout: BlockLayout,
    blocks: Vec<BlockId>,
}

#[derive(Debug, Clone)]
struct SimBlock {
    block: Block,
    locations: Vec<ReplicaLocation>,
}

#[derive(Debug, Clone)]
struct SimLease {
    holder: String,
    id: Option<Uuid>,
    policy_satisfier: bool,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<NodeId, SimNode>,
    files: BTreeMap<String, SimFile>,
    blocks: HashMap<BlockId, SimBlock>,
    lease: Option<SimLease>,
    satisfier_active: bool,
    fail_renewal: bool,
    missing: HashSet<BlockId>,
    refused: HashSet<StorageType>,
    /// Listing calls that succeed before injected failures start
    listing_grace: u32,
    listing_failures: u32,
    page_size: usize,
}

impl State {
    fn storage_mut(&mut self, node: &NodeId, storage_id: &str) -> Option<&mut SimStorage> {
        self.nodes
            .get_mut(node)?
            .storages
            .iter_mut()
            .find(|s| s.id == storage_id)
    }
}

/// In-memory namespace
pub struct SimulatedCluster {
    namespace: NamespaceId,
    state: RwLock<State>,

    /// Operation counters
    list_calls: AtomicU64,
    relocate_calls: AtomicU64,
    satisfier_checks: AtomicU64,
}

impl SimulatedCluster {
    /// Create an empty namespace
    pub fn new(namespace: impl Into<NamespaceId>) -> Self {
        Self {
            namespace: namespace.into(),
            state: RwLock::new(State {
                page_size: DEFAULT_PAGE_SIZE,
                ..Default::default()
            }),
            list_calls: AtomicU64::new(0),
            relocate_calls: AtomicU64::new(0),
            satisfier_checks: AtomicU64::new(0),
        }
    }

    /// Load a cluster description from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let spec: ClusterSpec = toml::from_str(&contents)?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: ClusterSpec) -> Result<Self> {
        let cluster = Self::new(spec.namespace.as_str());
        if let Some(page_size) = spec.page_size {
            cluster.set_page_size(page_size);
        }

        for node in &spec.nodes {
            let storages: Vec<_> = node
                .storages
                .iter()
                .map(|s| (s.storage_type, s.capacity))
                .collect();
            cluster.add_node(&node.id, &node.rack, &storages);
        }

        for file in &spec.files {
            let layout = file.layout.unwrap_or(BlockLayout::Contiguous {
                replication: DEFAULT_REPLICATION,
            });
            for block in &file.blocks {
                let replicas: Vec<_> = block
                    .replicas
                    .iter()
                    .map(|r| (r.node.as_str(), r.storage_type))
                    .collect();
                cluster.add_block(
                    &file.path,
                    &file.policy,
                    layout,
                    Block::new(block.id, block.len, block.generation_stamp),
                    &replicas,
                )?;
            }
        }

        let faults = spec.faults;
        cluster.set_policy_satisfier_active(faults.policy_satisfier_active);
        if let Some(holder) = faults.lease_holder {
            cluster.hold_lease(&holder, faults.lease_holder_is_satisfier);
        }
        cluster.fail_lease_renewal(faults.fail_lease_renewal);
        for block in faults.missing_source_blocks {
            cluster.mark_source_missing(BlockId(block));
        }
        for storage_type in faults.refused_storage_types {
            cluster.refuse_storage_type(storage_type);
        }
        cluster.fail_listings(faults.transient_listing_failures);

        Ok(cluster)
    }

    /// Add a data node; storages get ids `<node>-s<index>`
    pub fn add_node(&self, id: &str, rack: &str, storages: &[(StorageType, u64)]) {
        let node = SimNode {
            rack: rack.to_string(),
            storages: storages
                .iter()
                .enumerate()
                .map(|(i, (storage_type, capacity))| SimStorage {
                    id: format!("{}-s{}", id, i),
                    storage_type: *storage_type,
                    capacity: *capacity,
                    remaining: *capacity,
                })
                .collect(),
        };
        self.state.write().nodes.insert(NodeId::new(id), node);
    }

    /// Add a block to `path`, creating the file on first use.
    ///
    /// Each replica lands on the first storage of the requested type on its
    /// node. Striped blocks get piece indexes in replica order.
    pub fn add_block(
        &self,
        path: &str,
        policy: &str,
        layout: BlockLayout,
        block: Block,
        replicas: &[(&str, StorageType)],
    ) -> Result<()> {
        let mut state = self.state.write();
        if state.blocks.contains_key(&block.id) {
            return Err(SimulationError::DuplicateBlock(block.id.0));
        }

        let mut locations = Vec::with_capacity(replicas.len());
        for (index, (node, storage_type)) in replicas.iter().enumerate() {
            let node_id = NodeId::new(*node);
            let sim_node = state
                .nodes
                .get_mut(&node_id)
                .ok_or_else(|| SimulationError::UnknownNode(node.to_string()))?;
            let storage = sim_node
                .storages
                .iter_mut()
                .find(|s| s.storage_type == *storage_type)
                .ok_or_else(|| SimulationError::NoStorage {
                    node: node.to_string(),
                    storage_type: *storage_type,
                })?;
            storage.remaining = storage.remaining.saturating_sub(block.len);

            let mut location = ReplicaLocation::new(node_id, *storage_type, storage.id.clone());
            if layout.is_striped() {
                location = location.with_piece(index as u8);
            }
            locations.push(location);
        }

        state
            .files
            .entry(path.to_string())
            .or_insert_with(|| SimFile {
                policy: policy.to_string(),
                layout,
                blocks: Vec::new(),
            })
            .blocks
            .push(block.id);
        state.blocks.insert(block.id, SimBlock { block, locations });
        Ok(())
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.state.write().page_size = page_size.max(1);
    }

    pub fn set_policy_satisfier_active(&self, active: bool) {
        self.state.write().satisfier_active = active;
    }

    /// Give the lease to someone else
    pub fn hold_lease(&self, holder: &str, policy_satisfier: bool) {
        self.state.write().lease = Some(SimLease {
            holder: holder.to_string(),
            id: None,
            policy_satisfier,
        });
    }

    pub fn fail_lease_renewal(&self, fail: bool) {
        self.state.write().fail_renewal = fail;
    }

    pub fn mark_source_missing(&self, block: BlockId) {
        self.state.write().missing.insert(block);
    }

    pub fn refuse_storage_type(&self, storage_type: StorageType) {
        self.state.write().refused.insert(storage_type);
    }

    /// Fail the next `count` listing calls transiently
    pub fn fail_listings(&self, count: u32) {
        self.fail_listings_after(0, count);
    }

    /// Let `successes` listing calls through, then fail `count` transiently
    pub fn fail_listings_after(&self, successes: u32, count: u32) {
        let mut state = self.state.write();
        state.listing_grace = successes;
        state.listing_failures = count;
    }

    /// Storage types of a block's replicas, in location order
    pub fn storage_types_of(&self, block: BlockId) -> Vec<StorageType> {
        self.locations_of(block)
            .iter()
            .map(|l| l.storage_type)
            .collect()
    }

    pub fn locations_of(&self, block: BlockId) -> Vec<ReplicaLocation> {
        self.state
            .read()
            .blocks
            .get(&block)
            .map(|b| b.locations.clone())
            .unwrap_or_default()
    }

    /// Free bytes on one storage
    pub fn remaining(&self, storage_id: &str) -> Option<u64> {
        let state = self.state.read();
        state
            .nodes
            .values()
            .flat_map(|n| n.storages.iter())
            .find(|s| s.id == storage_id)
            .map(|s| s.remaining)
    }

    pub fn lease_holder(&self) -> Option<String> {
        self.state.read().lease.as_ref().map(|l| l.holder.clone())
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn relocate_calls(&self) -> u64 {
        self.relocate_calls.load(Ordering::SeqCst)
    }

    pub fn satisfier_checks(&self) -> u64 {
        self.satisfier_checks.load(Ordering::SeqCst)
    }

    fn located(state: &State, path: &str, file: &SimFile, id: BlockId) -> Option<LocatedBlock> {
        let sim = state.blocks.get(&id)?;
        Some(LocatedBlock {
            path: path.to_string(),
            policy: file.policy.clone(),
            block: sim.block,
            layout: file.layout,
            locations: sim.locations.clone(),
        })
    }
}

/// Whether `file` lies at or below `dir`
fn is_under(file: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    dir.is_empty() || file == dir || file.strip_prefix(dir).is_some_and(|r| r.starts_with('/'))
}

fn parse_cursor(cursor: &ListCursor) -> Option<(&str, usize)> {
    let (path, index) = cursor.0.rsplit_once('#')?;
    Some((path, index.parse().ok()?))
}

#[async_trait::async_trait]
impl NamespaceConnector for SimulatedCluster {
    fn namespace(&self) -> &NamespaceId {
        &self.namespace
    }

    async fn is_policy_satisfier_active(&self) -> crate::connector::Result<bool> {
        self.satisfier_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.read().satisfier_active)
    }

    async fn acquire_run_lease(&self, holder: &str) -> std::result::Result<LeaseToken, LeaseError> {
        let mut state = self.state.write();
        if let Some(lease) = &state.lease {
            return Err(LeaseError::AlreadyHeld {
                holder: lease.holder.clone(),
                policy_satisfier: lease.policy_satisfier,
            });
        }

        let token = LeaseToken::new(self.namespace.clone(), holder);
        state.lease = Some(SimLease {
            holder: holder.to_string(),
            id: Some(token.id),
            policy_satisfier: false,
        });
        Ok(token)
    }

    async fn renew_run_lease(&self, token: &LeaseToken) -> std::result::Result<(), LeaseError> {
        let state = self.state.read();
        if state.fail_renewal {
            return Err(LeaseError::Lost(
                "renewal rejected by metadata service".to_string(),
            ));
        }
        match &state.lease {
            Some(lease) if lease.id == Some(token.id) => Ok(()),
            Some(lease) => Err(LeaseError::Lost(format!("now held by {}", lease.holder))),
            None => Err(LeaseError::Lost("lease expired".to_string())),
        }
    }

    async fn release_run_lease(&self, token: &LeaseToken) -> std::result::Result<(), LeaseError> {
        let mut state = self.state.write();
        match &state.lease {
            Some(lease) if lease.id == Some(token.id) => {
                state.lease = None;
                Ok(())
            }
            _ => Err(LeaseError::Lost("lease not held".to_string())),
        }
    }

    async fn storage_report(&self) -> crate::connector::Result<Vec<DatanodeStorageReport>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .iter()
            .map(|(id, node)| DatanodeStorageReport {
                node: id.clone(),
                rack: node.rack.clone(),
                storages: node
                    .storages
                    .iter()
                    .map(|s| StorageReport {
                        storage_id: s.id.clone(),
                        storage_type: s.storage_type,
                        capacity: s.capacity,
                        remaining: s.remaining,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn list_blocks(
        &self,
        path: &str,
        cursor: Option<&ListCursor>,
    ) -> crate::connector::Result<ListingPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write();
        if state.listing_grace > 0 {
            state.listing_grace -= 1;
        } else if state.listing_failures > 0 {
            state.listing_failures -= 1;
            return Err(ConnectorError::Transient(format!(
                "listing {} interrupted",
                path
            )));
        }

        let resume_after = match cursor {
            Some(c) => Some(parse_cursor(c).ok_or_else(|| {
                ConnectorError::Unavailable(format!("invalid listing cursor {}", c.0))
            })?),
            None => None,
        };

        let page_size = state.page_size;
        let mut matched = false;
        let mut has_more = false;
        let mut page: Vec<(usize, LocatedBlock)> = Vec::new();

        'files: for (file_path, file) in &state.files {
            if !is_under(file_path, path) {
                continue;
            }
            matched = true;

            for (index, id) in file.blocks.iter().enumerate() {
                if let Some((after_path, after_index)) = resume_after {
                    if (file_path.as_str(), index) <= (after_path, after_index) {
                        continue;
                    }
                }
                if page.len() == page_size {
                    has_more = true;
                    break 'files;
                }
                if let Some(located) = Self::located(&state, file_path, file, *id) {
                    page.push((index, located));
                }
            }
        }

        if !matched && path != "/" {
            return Err(ConnectorError::PathNotFound(path.to_string()));
        }

        // Cursor names the last block returned
        let next = if has_more {
            page.last()
                .map(|(index, last)| ListCursor(format!("{}#{}", last.path, index)))
        } else {
            None
        };
        let blocks = page.into_iter().map(|(_, located)| located).collect();

        Ok(ListingPage { blocks, next })
    }

    async fn relocate(&self, intent: &MoveIntent) -> std::result::Result<(), RelocateError> {
        self.relocate_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write();
        let block_id = intent.block.id;

        if state.missing.contains(&block_id) {
            return Err(RelocateError::SourceMissing(format!(
                "{} not found on {}",
                block_id, intent.source
            )));
        }
        if state.refused.contains(&intent.target_type) {
            return Err(RelocateError::Refused(format!(
                "{} storage does not accept replicas",
                intent.target_type
            )));
        }

        let (position, hosts_target) = {
            let sim = state
                .blocks
                .get(&block_id)
                .ok_or_else(|| RelocateError::SourceMissing(block_id.to_string()))?;
            let position = sim
                .locations
                .iter()
                .position(|l| l.storage_id == intent.source.storage_id)
                .ok_or_else(|| {
                    RelocateError::SourceMissing(format!(
                        "{} has no replica on {}",
                        block_id, intent.source
                    ))
                })?;
            let hosts_target = intent.target_node != intent.source.node
                && sim.locations.iter().any(|l| l.node == intent.target_node);
            (position, hosts_target)
        };

        if hosts_target {
            return Err(RelocateError::Refused(format!(
                "{} already holds a replica of {}",
                intent.target_node, block_id
            )));
        }

        let len = intent.block.len;
        let target = state
            .storage_mut(&intent.target_node, &intent.target_storage)
            .ok_or_else(|| {
                RelocateError::Transport(format!(
                    "unknown target storage {}",
                    intent.target_storage
                ))
            })?;
        if target.storage_type != intent.target_type {
            return Err(RelocateError::Refused(format!(
                "{} is {}, not {}",
                target.id, target.storage_type, intent.target_type
            )));
        }
        if target.remaining < len {
            return Err(RelocateError::Refused(format!("{} is full", target.id)));
        }
        target.remaining -= len;

        if let Some(source) = state.storage_mut(&intent.source.node, &intent.source.storage_id) {
            source.remaining = (source.remaining + len).min(source.capacity);
        }

        if let Some(sim) = state.blocks.get_mut(&block_id) {
            let location = &mut sim.locations[position];
            location.node = intent.target_node.clone();
            location.storage_type = intent.target_type;
            location.storage_id = intent.target_storage.clone();
        }
        Ok(())
    }
}
