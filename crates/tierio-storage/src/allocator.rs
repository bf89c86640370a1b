//! Free data slot tracking
//!
//! A backend's data slots are the physical sectors between the header region
//! and the move-help sector. A slot is free when no used index entry points
//! at it. The free sets are derived from the index and rebuilt whenever the
//! geometry changes.

use crate::backend::BackendSet;
use crate::index::IndexTable;
use std::collections::BTreeSet;
use tierio_common::BackendId;
use tracing::warn;

/// Free physical sectors per backend
#[derive(Debug, Default)]
pub struct FreeSlots {
    per_backend: Vec<BTreeSet<u64>>,
}

impl FreeSlots {
    /// Derive the free slots from the current index and geometry
    pub fn rebuild(table: &IndexTable, backends: &BackendSet) -> Self {
        let header = table.header_sector_count();
        let mut per_backend: Vec<BTreeSet<u64>> = backends
            .iter()
            .map(|b| (header..b.move_help_sector()).collect())
            .collect();

        for (logical, entry) in table.entries().iter().enumerate() {
            if !entry.is_used() {
                continue;
            }
            // members not added yet own no slots here
            let Some(free) = per_backend.get_mut(entry.backend().index()) else {
                continue;
            };
            if !free.remove(&entry.physical_sector) && entry.physical_sector >= header {
                // header band and move-help placements are expected transiently
                let move_help = backends
                    .get(entry.backend())
                    .map(|b| b.move_help_sector())
                    .ok();
                if move_help != Some(entry.physical_sector) {
                    warn!(
                        "logical sector {logical} maps to {}:{} which is not a free data slot",
                        entry.backend(),
                        entry.physical_sector
                    );
                }
            }
        }

        Self { per_backend }
    }

    /// Take the lowest free slot of a backend
    pub fn take(&mut self, backend: BackendId) -> Option<u64> {
        self.per_backend
            .get_mut(backend.index())
            .and_then(BTreeSet::pop_first)
    }

    /// Take a slot from the first backend in `order` that has one
    pub fn take_first(&mut self, order: &[BackendId]) -> Option<(BackendId, u64)> {
        order
            .iter()
            .find_map(|&id| self.take(id).map(|sector| (id, sector)))
    }

    /// Return a slot to the free set
    pub fn release(&mut self, backend: BackendId, sector: u64) {
        if let Some(free) = self.per_backend.get_mut(backend.index()) {
            free.insert(sector);
        }
    }

    pub fn free_count(&self, backend: BackendId) -> u64 {
        self.per_backend
            .get(backend.index())
            .map_or(0, |free| free.len() as u64)
    }

    pub fn has_free(&self, backend: BackendId) -> bool {
        self.free_count(backend) > 0
    }

    pub fn total_free(&self) -> u64 {
        self.per_backend.iter().map(|free| free.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendHandle, LocalBackend};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tierio_common::SectorIndexEntry;

    #[tokio::test]
    async fn test_rebuild_excludes_used_and_reserved() {
        let dir = tempdir().unwrap();
        let mut set = BackendSet::new();
        for (name, sectors) in [("a", 10), ("b", 6)] {
            let device = LocalBackend::create(dir.path().join(name), sectors * 512, false).unwrap();
            let handle = BackendHandle::new(Arc::new(device), 512, 5).await.unwrap();
            set.push(Arc::new(handle));
        }

        // header 1 sector: a has slots 1..9, b has slots 1..5
        let table = IndexTable::new(512, 0, 2);
        table.set_geometry(1, 12).unwrap();
        table
            .set(0, SectorIndexEntry::new(BackendId::new(1), 1))
            .unwrap();
        table
            .set(5, SectorIndexEntry::new(BackendId::new(2), 4))
            .unwrap();

        let mut free = FreeSlots::rebuild(&table, &set);
        assert_eq!(free.free_count(BackendId::new(1)), 7);
        assert_eq!(free.free_count(BackendId::new(2)), 3);
        assert_eq!(free.total_free(), 10);

        assert_eq!(free.take(BackendId::new(1)), Some(2));
        assert_eq!(
            free.take_first(&[BackendId::new(2), BackendId::new(1)]),
            Some((BackendId::new(2), 1))
        );
        free.release(BackendId::new(2), 1);
        assert_eq!(free.free_count(BackendId::new(2)), 3);
        assert_eq!(free.take(BackendId::new(3)), None);
    }
}
