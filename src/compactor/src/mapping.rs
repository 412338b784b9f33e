//! Old-to-new id mapping produced by one compaction.

use crate::error::{MaintenanceError, Result};

/// Ordered bijection from surviving ids onto `1..=len`.
///
/// Built once per compaction from ids in ascending order and discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    // (old, new), sorted by old; new is the 1-based position
    entries: Vec<(i64, i64)>,
}

impl IdMapping {
    /// Assign `1, 2, 3, …` to `ids`, which must be strictly ascending.
    pub fn from_sorted_ids(table: &str, column: &str, ids: &[i64]) -> Result<Self> {
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] >= pair[1]) {
            if pair[0] == pair[1] {
                return Err(MaintenanceError::DuplicateId {
                    table: table.to_string(),
                    column: column.to_string(),
                    id: pair[0],
                });
            }
            return Err(MaintenanceError::Invariant {
                table: table.to_string(),
                message: format!("ids were not returned in ascending order ({} before {})", pair[0], pair[1]),
            });
        }

        let entries = ids
            .iter()
            .zip(1_i64..)
            .map(|(&old, new)| (old, new))
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, old: i64) -> Option<i64> {
        self.entries
            .binary_search_by_key(&old, |&(old, _)| old)
            .ok()
            .map(|index| self.entries[index].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest new id, 0 for an empty mapping.
    pub fn max_new_id(&self) -> i64 {
        self.entries.len() as i64
    }

    pub fn is_identity(&self) -> bool {
        self.entries.iter().all(|(old, new)| old == new)
    }

    /// Number of rows whose id changes.
    pub fn moved(&self) -> usize {
        self.entries.iter().filter(|(old, new)| old != new).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.entries.iter().copied()
    }

    /// Moves in an order that never assigns an id still held by another row.
    ///
    /// `old - new` is non-decreasing along the mapping, so rows moving down are
    /// applied ascending and rows moving up (ids <= 0) descending.
    pub fn collision_free_moves(&self) -> Vec<(i64, i64)> {
        let down = self.entries.iter().filter(|(old, new)| old > new).copied();
        let up = self
            .entries
            .iter()
            .rev()
            .filter(|(old, new)| old < new)
            .copied();
        down.chain(up).collect()
    }
}
