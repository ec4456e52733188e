//! Deterministic conflict resolution for pulled events.
//!
//! Cross-device total order is `(lamport, device_id)` with byte-wise
//! comparison of the 64-hex device id as the tie-break. The order is total,
//! so every device applies the same winner regardless of arrival order.

use crate::sync::models::{DeviceId, Op};
use crate::vault::Entry;
use std::collections::{HashMap, HashSet};

/// What a merged event did to the working entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The upsert won; the entry is installed.
    UpsertWon,
    /// The delete won; the entry is removed and tombstoned for this merge.
    DeleteWon,
    /// The event lost to a previously applied `(lamport, device_id)`.
    Ignored,
}

/// Working merge state for one pull-and-merge cycle.
///
/// Seeded from the local entry list; remote events are folded in one at a
/// time. Local entries carry no `(lamport, device_id)` record, so the first
/// remote event for an id always supersedes the local copy.
pub struct MergeState {
    entries: HashMap<String, Entry>,
    winners: HashMap<String, (u64, DeviceId)>,
    deleted: HashSet<String>,
}

impl MergeState {
    pub fn from_local(local: &[Entry]) -> Self {
        Self {
            entries: local.iter().map(|e| (e.id.clone(), e.clone())).collect(),
            winners: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    fn wins(&self, entry_id: &str, lamport: u64, device_id: &DeviceId) -> bool {
        match self.winners.get(entry_id) {
            None => true,
            Some((cur_lamport, cur_device)) => {
                lamport > *cur_lamport || (lamport == *cur_lamport && device_id > cur_device)
            }
        }
    }

    /// Fold one decrypted event into the working set.
    pub fn apply(&mut self, op: Op, entry: Entry, lamport: u64, device_id: &DeviceId) -> Applied {
        if !self.wins(&entry.id, lamport, device_id) {
            return Applied::Ignored;
        }

        match op {
            Op::Delete => {
                self.deleted.insert(entry.id.clone());
                self.winners
                    .insert(entry.id.clone(), (lamport, device_id.clone()));
                self.entries.remove(&entry.id);
                Applied::DeleteWon
            }
            Op::Upsert => {
                if self.deleted.contains(&entry.id) {
                    return Applied::Ignored;
                }
                self.winners
                    .insert(entry.id.clone(), (lamport, device_id.clone()));
                self.entries.insert(entry.id.clone(), entry);
                Applied::UpsertWon
            }
        }
    }

    /// The merged entry list.
    pub fn into_entries(self) -> Vec<Entry> {
        self.entries.into_values().collect()
    }
}
