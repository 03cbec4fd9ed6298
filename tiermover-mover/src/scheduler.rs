//! Move Scheduler
//!
//! Walks listed blocks and turns storage policy violations into move
//! intents in the [`MoveLedger`].
//! Optimizes for:
//! - Locality (same node, then same rack, then anywhere)
//! - Free space on the destination storage
//! - No churn (replicas that already match the policy stay put)

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

use crate::connector::DatanodeStorageReport;
use crate::ledger::{MoveIntent, MoveLedger};
use tiermover_core::{
    BlockId, LocatedBlock, NodeId, PolicyResolution, ReplicaLocation, StoragePolicySuite,
    StorageType, StorageTypeDiff,
};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum moves scheduled in one pass
    pub max_moves_per_iteration: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_moves_per_iteration: 10_000,
        }
    }
}

/// A storage that can receive replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStorage {
    pub node: NodeId,
    pub rack: String,
    pub storage_id: String,
    pub storage_type: StorageType,
    /// Free bytes at snapshot time
    pub remaining: u64,
}

/// Snapshot of the cluster's data nodes, rebuilt every pass
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    racks: HashMap<NodeId, String>,
    by_type: HashMap<StorageType, Vec<TargetStorage>>,
}

impl ClusterView {
    pub fn from_reports(reports: &[DatanodeStorageReport]) -> Self {
        let mut view = Self::default();

        for report in reports {
            view.racks.insert(report.node.clone(), report.rack.clone());
            for storage in &report.storages {
                view.by_type
                    .entry(storage.storage_type)
                    .or_default()
                    .push(TargetStorage {
                        node: report.node.clone(),
                        rack: report.rack.clone(),
                        storage_id: storage.storage_id.clone(),
                        storage_type: storage.storage_type,
                        remaining: storage.remaining,
                    });
            }
        }

        // Deterministic candidate order regardless of report order
        for storages in view.by_type.values_mut() {
            storages.sort_by(|a, b| {
                a.node
                    .cmp(&b.node)
                    .then_with(|| a.storage_id.cmp(&b.storage_id))
            });
        }
        view
    }

    pub fn rack_of(&self, node: &NodeId) -> Option<&str> {
        self.racks.get(node).map(String::as_str)
    }

    pub fn storages_of_type(&self, storage_type: StorageType) -> &[TargetStorage] {
        self.by_type
            .get(&storage_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any node offers storage of this type
    pub fn offers(&self, storage_type: StorageType) -> bool {
        !self.storages_of_type(storage_type).is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.racks.len()
    }
}

/// A block that violates its policy, with the storage types it still lacks
#[derive(Debug, Clone)]
pub struct RelocationCandidate<'a> {
    pub located: &'a LocatedBlock,
    /// Missing storage types, one entry per slot
    pub expected: Vec<StorageType>,
}

impl<'a> RelocationCandidate<'a> {
    pub fn new(located: &'a LocatedBlock, expected: Vec<StorageType>) -> Self {
        Self { located, expected }
    }

    pub fn block_id(&self) -> BlockId {
        self.located.block.id
    }
}

/// What the scheduler decided for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockVerdict {
    /// Replicas already match the policy
    Satisfied,
    /// Policy does not apply to this layout; block left as is
    Untouched(String),
    /// Block could not be evaluated (unknown policy, bad listing); counted
    /// as unsatisfiable
    Skipped(String),
    /// Same block already examined this pass
    Duplicate,
    /// Moves were scheduled; `remaining` if more are needed afterwards
    Scheduled { moves: usize, remaining: bool },
    /// Every needed move is already pending in the ledger
    AlreadyPending,
    /// No destination exists for any needed move
    Unsatisfiable,
    /// Pass limit reached before this block
    Deferred,
}

/// Counters for one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub blocks_examined: usize,
    pub blocks_satisfied: usize,
    pub blocks_untouched: usize,
    pub blocks_skipped: usize,
    /// Blocks violating their policy, whatever happened to them
    pub blocks_needing_move: usize,
    pub blocks_scheduled: usize,
    pub blocks_pending: usize,
    pub blocks_deferred: usize,
    pub unsatisfiable: Vec<BlockId>,
    pub moves_scheduled: usize,
}

impl ScanReport {
    pub fn needs_movement(&self) -> bool {
        self.blocks_needing_move > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "examined {} blocks: {} satisfied, {} need moving ({} scheduled, {} pending, {} deferred, {} unsatisfiable), {} untouched, {} skipped; {} moves scheduled",
            self.blocks_examined,
            self.blocks_satisfied,
            self.blocks_needing_move,
            self.blocks_scheduled,
            self.blocks_pending,
            self.blocks_deferred,
            self.unsatisfiable.len(),
            self.blocks_untouched,
            self.blocks_skipped,
            self.moves_scheduled
        )
    }
}

/// Result of trying to schedule one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaSchedule {
    Scheduled(StorageType),
    /// Replica already committed to a move this pass
    Committed,
    /// Same logical move already in the ledger
    AlreadyPending,
    NoTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Locality {
    SameNode,
    SameRack,
    Any,
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locality::SameNode => f.write_str("same-node"),
            Locality::SameRack => f.write_str("same-rack"),
            Locality::Any => f.write_str("any"),
        }
    }
}

/// Scheduler for one pass over one namespace
pub struct Scheduler<'a> {
    config: SchedulerConfig,
    ledger: &'a MoveLedger,
    cluster: &'a ClusterView,
    policies: &'a StoragePolicySuite,
    /// (block, storage) pairs already used as a move source this pass
    committed: HashSet<(BlockId, String)>,
    /// (block, node) pairs already chosen as a destination this pass
    claimed_targets: HashSet<(BlockId, NodeId)>,
    /// Bytes scheduled onto each storage this pass
    scheduled_bytes: HashMap<String, u64>,
    seen_blocks: HashSet<BlockId>,
    report: ScanReport,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: SchedulerConfig,
        ledger: &'a MoveLedger,
        cluster: &'a ClusterView,
        policies: &'a StoragePolicySuite,
    ) -> Self {
        Self {
            config,
            ledger,
            cluster,
            policies,
            committed: HashSet::new(),
            claimed_targets: HashSet::new(),
            scheduled_bytes: HashMap::new(),
            seen_blocks: HashSet::new(),
            report: ScanReport::default(),
        }
    }

    pub fn report(&self) -> &ScanReport {
        &self.report
    }

    pub fn finish(self) -> ScanReport {
        self.report
    }

    /// Examine one listed block and schedule the moves it needs
    pub fn schedule_block(&mut self, located: &LocatedBlock) -> BlockVerdict {
        let block_id = located.block.id;
        if !self.seen_blocks.insert(block_id) {
            return BlockVerdict::Duplicate;
        }
        self.report.blocks_examined += 1;

        if let Err(e) = located.validate() {
            warn!(block = %block_id, path = %located.path, error = %e, "Skipping block with invalid listing");
            return self.skip(block_id, e.to_string());
        }

        let required = match self.policies.resolve(&located.policy, &located.layout) {
            Ok(PolicyResolution::Required(types)) => types,
            Ok(PolicyResolution::Untouched { reason }) => {
                debug!(block = %block_id, path = %located.path, reason = %reason, "Leaving block untouched");
                self.report.blocks_untouched += 1;
                return BlockVerdict::Untouched(reason);
            }
            Err(e) => {
                warn!(block = %block_id, path = %located.path, error = %e, "Failed to resolve storage policy");
                return self.skip(block_id, e.to_string());
            }
        };

        let mut diff = StorageTypeDiff::new(required, located.storage_types());
        if diff.remove_overlap() {
            self.report.blocks_satisfied += 1;
            return BlockVerdict::Satisfied;
        }

        self.report.blocks_needing_move += 1;

        if self.report.moves_scheduled >= self.config.max_moves_per_iteration {
            self.report.blocks_deferred += 1;
            return BlockVerdict::Deferred;
        }

        let verdict = self.schedule_moves(located, diff);
        match &verdict {
            BlockVerdict::Scheduled { moves, .. } => {
                self.report.blocks_scheduled += 1;
                self.report.moves_scheduled += moves;
            }
            BlockVerdict::AlreadyPending => self.report.blocks_pending += 1,
            BlockVerdict::Unsatisfiable => {
                warn!(block = %block_id, path = %located.path, policy = %located.policy, "No target storage available for block");
                self.report.unsatisfiable.push(block_id);
            }
            _ => {}
        }
        verdict
    }

    /// A block that can't be checked against its policy is not satisfied
    /// either; it counts as needing a move that can never be scheduled.
    fn skip(&mut self, block_id: BlockId, reason: String) -> BlockVerdict {
        self.report.blocks_skipped += 1;
        self.report.blocks_needing_move += 1;
        self.report.unsatisfiable.push(block_id);
        BlockVerdict::Skipped(reason)
    }

    /// Pair surplus replicas with missing storage types.
    ///
    /// Each replica is tried at most once and consumes one unit of its
    /// type's surplus only when a move is actually scheduled, so two
    /// replicas of one type never feed more deficits than the surplus allows.
    fn schedule_moves(&mut self, located: &LocatedBlock, diff: StorageTypeDiff) -> BlockVerdict {
        let mut surplus: HashMap<StorageType, usize> = HashMap::new();
        for t in &diff.existing {
            *surplus.entry(*t).or_default() += 1;
        }

        let mut candidate = RelocationCandidate::new(located, diff.expected);
        let mut moves = 0;
        let mut pending_seen = false;

        for source in &located.locations {
            if candidate.expected.is_empty() {
                break;
            }
            let available = surplus.get(&source.storage_type).copied().unwrap_or(0);
            if available == 0 {
                continue;
            }

            let targets = candidate.expected.clone();
            match self.try_schedule(&candidate, source, &targets) {
                ReplicaSchedule::Scheduled(target_type) => {
                    moves += 1;
                    surplus.insert(source.storage_type, available - 1);
                    if let Some(pos) = candidate.expected.iter().position(|t| *t == target_type) {
                        candidate.expected.remove(pos);
                    }
                }
                ReplicaSchedule::AlreadyPending | ReplicaSchedule::Committed => {
                    pending_seen = true;
                }
                ReplicaSchedule::NoTarget => {}
            }
        }

        if moves > 0 {
            let surplus_left = surplus.values().any(|n| *n > 0);
            BlockVerdict::Scheduled {
                moves,
                remaining: surplus_left && !candidate.expected.is_empty(),
            }
        } else if pending_seen {
            BlockVerdict::AlreadyPending
        } else {
            BlockVerdict::Unsatisfiable
        }
    }

    /// Try to schedule moving `source` to one of `target_types`.
    ///
    /// Returns false when the replica is already committed this pass, when
    /// the same logical move is already in the ledger, or when no
    /// destination is available.
    pub fn schedule_move_replica(
        &mut self,
        candidate: &RelocationCandidate<'_>,
        source: &ReplicaLocation,
        target_types: &[StorageType],
    ) -> bool {
        matches!(
            self.try_schedule(candidate, source, target_types),
            ReplicaSchedule::Scheduled(_)
        )
    }

    fn try_schedule(
        &mut self,
        candidate: &RelocationCandidate<'_>,
        source: &ReplicaLocation,
        target_types: &[StorageType],
    ) -> ReplicaSchedule {
        let block = candidate.located.block;

        if self
            .committed
            .contains(&(block.id, source.storage_id.clone()))
        {
            return ReplicaSchedule::Committed;
        }

        if self
            .ledger
            .is_pending(block.id, source.storage_type, target_types)
        {
            debug!(block = %block.id, source = %source, "Move already pending");
            return ReplicaSchedule::AlreadyPending;
        }

        let Some((target, locality)) = self.choose_target(candidate, source, target_types) else {
            return ReplicaSchedule::NoTarget;
        };

        let intent = MoveIntent {
            path: candidate.located.path.clone(),
            block,
            source: source.clone(),
            target_type: target.storage_type,
            target_node: target.node.clone(),
            target_storage: target.storage_id.clone(),
        };

        if self.ledger.insert(intent).is_none() {
            return ReplicaSchedule::AlreadyPending;
        }

        debug!(
            block = %block.id,
            source = %source,
            target_node = %target.node,
            target_storage = %target.storage_id,
            target_type = %target.storage_type,
            locality = %locality,
            "Scheduled replica move"
        );

        self.committed.insert((block.id, source.storage_id.clone()));
        self.claimed_targets.insert((block.id, target.node.clone()));
        *self
            .scheduled_bytes
            .entry(target.storage_id.clone())
            .or_default() += block.len;

        ReplicaSchedule::Scheduled(target.storage_type)
    }

    /// Pick a destination, preferring the source's own node, then its rack
    fn choose_target(
        &self,
        candidate: &RelocationCandidate<'_>,
        source: &ReplicaLocation,
        target_types: &[StorageType],
    ) -> Option<(TargetStorage, Locality)> {
        let source_rack = self.cluster.rack_of(&source.node);

        for locality in [Locality::SameNode, Locality::SameRack, Locality::Any] {
            for target_type in target_types {
                let best = self
                    .cluster
                    .storages_of_type(*target_type)
                    .iter()
                    .filter(|t| self.locality_of(t, source, source_rack) == locality)
                    .filter(|t| self.is_good_target(candidate, source, t))
                    .max_by(|a, b| {
                        self.free_after_scheduling(a)
                            .cmp(&self.free_after_scheduling(b))
                            // max_by keeps the last maximum; reverse ids so the smallest wins ties
                            .then_with(|| b.node.cmp(&a.node))
                            .then_with(|| b.storage_id.cmp(&a.storage_id))
                    });

                if let Some(target) = best {
                    return Some((target.clone(), locality));
                }
            }
        }
        None
    }

    fn locality_of(
        &self,
        target: &TargetStorage,
        source: &ReplicaLocation,
        source_rack: Option<&str>,
    ) -> Locality {
        if target.node == source.node {
            Locality::SameNode
        } else if source_rack == Some(target.rack.as_str()) {
            Locality::SameRack
        } else {
            Locality::Any
        }
    }

    fn is_good_target(
        &self,
        candidate: &RelocationCandidate<'_>,
        source: &ReplicaLocation,
        target: &TargetStorage,
    ) -> bool {
        let block = &candidate.located.block;

        if !target.storage_type.is_movable() || target.storage_id == source.storage_id {
            return false;
        }
        // Another node already holding a piece of this block can't take a second one
        if target.node != source.node && candidate.located.hosts_node(&target.node) {
            return false;
        }
        if self
            .claimed_targets
            .contains(&(block.id, target.node.clone()))
        {
            return false;
        }
        self.free_after_scheduling(target) >= block.len
    }

    fn free_after_scheduling(&self, target: &TargetStorage) -> u64 {
        let scheduled = self
            .scheduled_bytes
            .get(&target.storage_id)
            .copied()
            .unwrap_or(0);
        target.remaining.saturating_sub(scheduled)
    }
}
