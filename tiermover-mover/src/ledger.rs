//! Move Ledger
//!
//! Table of relocation intents that are scheduled but not yet confirmed.
//! The scheduler consults it so the same logical move is never scheduled
//! twice, and the dispatcher reports completions back into it. Entries are
//! removed as soon as they reach a terminal outcome, which frees their key
//! for the next scan if the block still needs moving.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tiermover_core::{Block, BlockId, NodeId, ReplicaLocation, StorageType};

/// Identity of a logical move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveKey {
    pub block: BlockId,
    pub source_type: StorageType,
    pub target_type: StorageType,
}

/// A scheduled relocation of one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveIntent {
    /// File the block belongs to
    pub path: String,
    pub block: Block,
    pub source: ReplicaLocation,
    pub target_type: StorageType,
    pub target_node: NodeId,
    pub target_storage: String,
}

impl MoveIntent {
    pub fn key(&self) -> MoveKey {
        MoveKey {
            block: self.block.id,
            source_type: self.source.storage_type,
            target_type: self.target_type,
        }
    }

    /// Whether source and target are storages of the same node
    pub fn is_local(&self) -> bool {
        self.source.node == self.target_node
    }
}

impl fmt::Display for MoveIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{}[{}]",
            self.block.id, self.source, self.target_node, self.target_storage, self.target_type
        )
    }
}

pub type MoveId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    Pending,
    InFlight,
}

/// Terminal outcome of a move
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Succeeded,
    Failed(String),
    /// Stopped by shutdown or lease loss before it could finish
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: MoveId,
    pub intent: MoveIntent,
    pub state: MoveState,
    /// Failed attempts so far
    pub attempts: u32,
}

/// What happens to a move after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending; try again
    Retry { attempts: u32 },
    /// Attempts exhausted; entry removed as failed
    GiveUp { attempts: u32 },
}

/// Completion counters since the last [`MoveLedger::take_tally`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerTally {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Blocks with at least one permanently failed move
    pub failed_blocks: BTreeSet<BlockId>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: HashMap<MoveId, LedgerEntry>,
    keys: HashMap<MoveKey, MoveId>,
    next_id: MoveId,
    tally: LedgerTally,
}

impl LedgerInner {
    fn remove(&mut self, id: MoveId) -> Option<LedgerEntry> {
        let entry = self.entries.remove(&id)?;
        self.keys.remove(&entry.intent.key());
        Some(entry)
    }
}

/// Shared table of pending and in-flight moves for one namespace
#[derive(Debug, Default)]
pub struct MoveLedger {
    inner: Mutex<LedgerInner>,
}

impl MoveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a move of `block` from `source_type` to any of `target_types`
    /// is pending or in flight
    pub fn is_pending(
        &self,
        block: BlockId,
        source_type: StorageType,
        target_types: &[StorageType],
    ) -> bool {
        let inner = self.inner.lock();
        target_types.iter().any(|&target_type| {
            inner.keys.contains_key(&MoveKey {
                block,
                source_type,
                target_type,
            })
        })
    }

    /// Insert a pending entry; `None` if its key is already taken
    pub fn insert(&self, intent: MoveIntent) -> Option<MoveId> {
        let mut inner = self.inner.lock();
        let key = intent.key();
        if inner.keys.contains_key(&key) {
            return None;
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.keys.insert(key, id);
        inner.entries.insert(
            id,
            LedgerEntry {
                id,
                intent,
                state: MoveState::Pending,
                attempts: 0,
            },
        );
        Some(id)
    }

    /// Take every pending entry, marking it in flight, in scheduling order
    pub fn claim_pending(&self) -> Vec<(MoveId, MoveIntent)> {
        let mut inner = self.inner.lock();
        let mut claimed: Vec<(MoveId, MoveIntent)> = inner
            .entries
            .values_mut()
            .filter(|e| e.state == MoveState::Pending)
            .map(|e| {
                e.state = MoveState::InFlight;
                (e.id, e.intent.clone())
            })
            .collect();
        claimed.sort_by_key(|(id, _)| *id);
        claimed
    }

    /// Move a pending entry back in flight for another attempt
    pub fn resume(&self, id: MoveId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.state == MoveState::Pending => {
                entry.state = MoveState::InFlight;
                true
            }
            _ => false,
        }
    }

    /// Record a failed attempt, giving up once `max_attempts` is reached
    pub fn record_failure(&self, id: MoveId, max_attempts: u32, reason: &str) -> RetryDecision {
        let attempts = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&id) else {
                return RetryDecision::GiveUp { attempts: 0 };
            };
            entry.attempts += 1;
            if entry.attempts < max_attempts {
                entry.state = MoveState::Pending;
                return RetryDecision::Retry {
                    attempts: entry.attempts,
                };
            }
            entry.attempts
        };

        self.complete(id, MoveOutcome::Failed(reason.to_string()));
        RetryDecision::GiveUp { attempts }
    }

    /// Finish a move, removing its entry. Returns the removed entry.
    pub fn complete(&self, id: MoveId, outcome: MoveOutcome) -> Option<LedgerEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.remove(id)?;
        match outcome {
            MoveOutcome::Succeeded => inner.tally.succeeded += 1,
            MoveOutcome::Failed(_) => {
                inner.tally.failed += 1;
                inner.tally.failed_blocks.insert(entry.intent.block.id);
            }
            MoveOutcome::Cancelled => inner.tally.cancelled += 1,
        }
        Some(entry)
    }

    /// Completion counters since the previous call
    pub fn take_tally(&self) -> LedgerTally {
        std::mem::take(&mut self.inner.lock().tally)
    }

    pub fn get(&self, id: MoveId) -> Option<LedgerEntry> {
        self.inner.lock().entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_in_state(&self, state: MoveState) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.state == state)
            .count()
    }
}
