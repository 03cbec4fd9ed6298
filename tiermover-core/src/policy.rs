//! Storage policies
//!
//! A storage policy names the storage types a file's replicas should live
//! on. The suite resolves a policy for a block layout into the list of
//! storage types, one per placement slot, and [`StorageTypeDiff`] works out
//! which existing replicas are misplaced.

use crate::block::{BlockLayout, StorageType};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

pub const HOT: &str = "HOT";
pub const WARM: &str = "WARM";
pub const COLD: &str = "COLD";
pub const ONE_SSD: &str = "ONE_SSD";
pub const ALL_SSD: &str = "ALL_SSD";
pub const LAZY_PERSIST: &str = "LAZY_PERSIST";
pub const PROVIDED: &str = "PROVIDED";

/// A named storage policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub id: u8,
    pub name: String,
    /// Preferred storage type per replica slot; the last entry repeats
    pub storage_types: Vec<StorageType>,
    /// Whether striped block groups may use this policy
    #[serde(default)]
    pub supports_striped: bool,
}

impl StoragePolicy {
    pub fn new(id: u8, name: impl Into<String>, storage_types: Vec<StorageType>) -> Self {
        Self {
            id,
            name: name.into(),
            storage_types,
            supports_striped: false,
        }
    }

    pub fn striped(mut self) -> Self {
        self.supports_striped = true;
        self
    }

    /// Storage types for `replication` slots.
    ///
    /// Transient types are never chosen; usage of transient storage is not
    /// tracked accurately enough to place replicas on it.
    pub fn choose_storage_types(&self, replication: usize) -> Vec<StorageType> {
        let mut types: Vec<StorageType> = self
            .storage_types
            .iter()
            .copied()
            .filter(|t| !t.is_transient())
            .take(replication)
            .collect();

        if let Some(last) = self.storage_types.last().copied() {
            if !last.is_transient() {
                while types.len() < replication {
                    types.push(last);
                }
            }
        }
        types
    }
}

/// Outcome of resolving a policy for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyResolution {
    /// Storage types the block's slots must reach
    Required(Vec<StorageType>),
    /// The policy cannot apply to this layout; leave the block as it is
    Untouched { reason: String },
}

/// The set of storage policies known to the cluster
#[derive(Debug, Clone)]
pub struct StoragePolicySuite {
    policies: Vec<StoragePolicy>,
}

impl Default for StoragePolicySuite {
    fn default() -> Self {
        use StorageType::*;
        Self {
            policies: vec![
                StoragePolicy::new(1, PROVIDED, vec![Provided, Disk]),
                StoragePolicy::new(2, COLD, vec![Archive]).striped(),
                StoragePolicy::new(5, WARM, vec![Disk, Archive]),
                StoragePolicy::new(7, HOT, vec![Disk]).striped(),
                StoragePolicy::new(10, ONE_SSD, vec![Ssd, Disk]),
                StoragePolicy::new(12, ALL_SSD, vec![Ssd]).striped(),
                StoragePolicy::new(15, LAZY_PERSIST, vec![RamDisk, Disk]),
            ],
        }
    }
}

impl StoragePolicySuite {
    pub fn new(policies: Vec<StoragePolicy>) -> Result<Self> {
        for policy in &policies {
            if policy.storage_types.is_empty() {
                return Err(CoreError::EmptyPolicy {
                    name: policy.name.clone(),
                });
            }
        }
        Ok(Self { policies })
    }

    /// Look up a policy by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&StoragePolicy> {
        self.policies
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn policies(&self) -> &[StoragePolicy] {
        &self.policies
    }

    /// Resolve the storage types a block under `policy_name` must reach
    pub fn resolve(&self, policy_name: &str, layout: &BlockLayout) -> Result<PolicyResolution> {
        let policy = self
            .get(policy_name)
            .ok_or_else(|| CoreError::UnknownPolicy(policy_name.to_string()))?;

        if layout.is_striped() && !policy.supports_striped {
            return Ok(PolicyResolution::Untouched {
                reason: format!(
                    "policy {} is not supported for striped block groups",
                    policy.name
                ),
            });
        }

        Ok(PolicyResolution::Required(
            policy.choose_storage_types(layout.slot_count()),
        ))
    }
}

/// Difference between the storage types a block needs and the ones it has
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTypeDiff {
    /// Types still missing (move targets)
    pub expected: Vec<StorageType>,
    /// Types held in surplus (move sources)
    pub existing: Vec<StorageType>,
}

impl StorageTypeDiff {
    pub fn new(expected: Vec<StorageType>, existing: Vec<StorageType>) -> Self {
        Self { expected, existing }
    }

    /// Cancel every type present on both sides, one for one, then drop
    /// non-movable types.
    ///
    /// Returns true when there is nothing left to move.
    pub fn remove_overlap(&mut self) -> bool {
        let mut remaining = Vec::with_capacity(self.existing.len());
        for t in self.existing.drain(..) {
            match self.expected.iter().position(|e| *e == t) {
                Some(pos) => {
                    self.expected.remove(pos);
                }
                None => remaining.push(t),
            }
        }
        self.existing = remaining;

        self.existing.retain(|t| t.is_movable());
        self.expected.retain(|t| t.is_movable());

        self.expected.is_empty() || self.existing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StorageType::*;

    #[test]
    fn test_choose_storage_types_repeats_last() {
        let suite = StoragePolicySuite::default();
        let warm = suite.get("warm").unwrap();
        assert_eq!(warm.choose_storage_types(3), vec![Disk, Archive, Archive]);
        assert_eq!(warm.choose_storage_types(1), vec![Disk]);

        let one_ssd = suite.get(ONE_SSD).unwrap();
        assert_eq!(one_ssd.choose_storage_types(3), vec![Ssd, Disk, Disk]);
    }

    #[test]
    fn test_choose_storage_types_skips_transient() {
        let suite = StoragePolicySuite::default();
        let lazy = suite.get(LAZY_PERSIST).unwrap();
        assert_eq!(lazy.choose_storage_types(3), vec![Disk, Disk, Disk]);
    }

    #[test]
    fn test_resolve_contiguous() {
        let suite = StoragePolicySuite::default();
        let resolution = suite
            .resolve(COLD, &BlockLayout::Contiguous { replication: 3 })
            .unwrap();
        assert_eq!(
            resolution,
            PolicyResolution::Required(vec![Archive, Archive, Archive])
        );
    }

    #[test]
    fn test_resolve_striped_gating() {
        let suite = StoragePolicySuite::default();
        let layout = BlockLayout::Striped {
            data_units: 3,
            parity_units: 2,
        };

        match suite.resolve(COLD, &layout).unwrap() {
            PolicyResolution::Required(types) => assert_eq!(types, vec![Archive; 5]),
            other => panic!("unexpected resolution {:?}", other),
        }

        assert!(matches!(
            suite.resolve(ONE_SSD, &layout).unwrap(),
            PolicyResolution::Untouched { .. }
        ));
        assert!(matches!(
            suite.resolve(WARM, &layout).unwrap(),
            PolicyResolution::Untouched { .. }
        ));
    }

    #[test]
    fn test_resolve_unknown_policy() {
        let suite = StoragePolicySuite::default();
        let err = suite
            .resolve("FROZEN", &BlockLayout::Contiguous { replication: 1 })
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownPolicy("FROZEN".to_string()));
    }

    #[test]
    fn test_suite_rejects_empty_policy() {
        let result = StoragePolicySuite::new(vec![StoragePolicy::new(3, "NONE", vec![])]);
        assert!(matches!(result, Err(CoreError::EmptyPolicy { .. })));
    }

    #[test]
    fn test_diff_satisfied_mixed_types() {
        // Two replicas on two different types already match WARM with two slots
        let mut diff = StorageTypeDiff::new(vec![Disk, Archive], vec![Archive, Disk]);
        assert!(diff.remove_overlap());
        assert!(diff.expected.is_empty());
        assert!(diff.existing.is_empty());
    }

    #[test]
    fn test_diff_keeps_multiset_counts() {
        let mut diff = StorageTypeDiff::new(vec![Archive, Archive], vec![Disk, Disk]);
        assert!(!diff.remove_overlap());
        assert_eq!(diff.expected, vec![Archive, Archive]);
        assert_eq!(diff.existing, vec![Disk, Disk]);

        let mut diff = StorageTypeDiff::new(vec![Disk, Archive, Archive], vec![Disk, Disk, Disk]);
        assert!(!diff.remove_overlap());
        assert_eq!(diff.expected, vec![Archive, Archive]);
        assert_eq!(diff.existing, vec![Disk, Disk]);
    }

    #[test]
    fn test_diff_ignores_non_movable() {
        let mut diff = StorageTypeDiff::new(vec![Disk], vec![RamDisk]);
        assert!(diff.remove_overlap());

        let mut diff = StorageTypeDiff::new(vec![Provided, Disk], vec![Disk, Ssd]);
        assert!(diff.remove_overlap());
        assert!(diff.expected.is_empty());
        assert_eq!(diff.existing, vec![Ssd]);
    }
}
