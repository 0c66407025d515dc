//! Dedup grouping over a task's line items
//!
//! Near-identical line items are merged under a representative identity
//! before any upstream call is spent on them; the grouping is later used
//! to fan the representative's result back out to every member.

use std::collections::HashMap;

use tracing::warn;

use crate::traits::MaterialMap;
use crate::types::{DedupKey, MaterialId};

/// Dedup grouping for one task run.
///
/// First occurrence of a dedup key becomes the representative; later
/// occurrences join its member list and are excluded from dispatch. The
/// member lists partition the resolvable input identities: pairwise
/// disjoint, union equal to the input set.
#[derive(Debug, Default)]
pub struct DedupPlan {
    dispatch: Vec<MaterialId>,
    members: HashMap<MaterialId, Vec<MaterialId>>,
    rep_of: HashMap<DedupKey, MaterialId>,
}

impl DedupPlan {
    /// Build the grouping for `order` (identities in submission order)
    /// against the canonical identity map. Deterministic: the same input
    /// sequence always yields the same grouping.
    ///
    /// An identity missing from `materials` is logged and excluded
    /// entirely; the reconciliation pass is the safety net for such rows.
    pub fn build(order: &[MaterialId], materials: &MaterialMap) -> Self {
        let mut plan = Self::default();
        for id in order {
            let Some(item) = materials.get(id) else {
                warn!(material = %id, "identity not present in task material set, excluded from dedup");
                continue;
            };
            let key = DedupKey::of(item);
            match plan.rep_of.get(&key).cloned() {
                Some(rep) => {
                    if let Some(group) = plan.members.get_mut(&rep) {
                        group.push(id.clone());
                    }
                }
                None => {
                    plan.dispatch.push(id.clone());
                    plan.members.insert(id.clone(), vec![id.clone()]);
                    plan.rep_of.insert(key, id.clone());
                }
            }
        }
        plan
    }

    /// Representatives in first-seen order; this is the dispatch set
    pub fn dispatch(&self) -> &[MaterialId] {
        &self.dispatch
    }

    /// Full member list for a representative, itself included. Empty for
    /// identities that are not representatives.
    pub fn members_of(&self, rep: &MaterialId) -> &[MaterialId] {
        self.members.get(rep).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Representative identity for a dedup key
    pub fn representative_for(&self, key: &DedupKey) -> Option<&MaterialId> {
        self.rep_of.get(key)
    }

    pub fn group_count(&self) -> usize {
        self.dispatch.len()
    }

    /// Total identities covered across all member lists
    pub fn member_count(&self) -> usize {
        self.members.values().map(Vec::len).sum()
    }
}
