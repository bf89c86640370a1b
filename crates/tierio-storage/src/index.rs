//! Sector indirection table
//!
//! Maps every logical sector to `(backend, physical sector, access count)`.
//! The table lives in memory and is mirrored into the header region of every
//! backend: single entries are written in place at
//! `HEADER_RECORD_SIZE + logical * 12`, the whole region is rewritten when
//! the geometry changes.
//!
//! All access goes through the table's lock; no caller ever holds a
//! reference into the entry array.

use crate::backend::{BackendHandle, BackendSet};
use crate::layout::{
    HeaderRecord, VERSION_MAJOR, VERSION_MINOR, entries_fitting, entry_offset, header_image,
};
use parking_lot::RwLock;
use tierio_common::{BackendId, Error, Result, SectorIndexEntry};
use tracing::{debug, info, warn};

struct TableState {
    /// Backing array, `len() == capacity`
    entries: Vec<SectorIndexEntry>,
    logical_sector_count: u64,
    cache_sector_count: u64,
    header_sector_count: u64,
}

/// The persistent logical → physical sector map
pub struct IndexTable {
    blocksize: u32,
    cache_percent: u8,
    rescale_floor: u16,
    state: RwLock<TableState>,
}

impl IndexTable {
    #[must_use]
    pub fn new(blocksize: u32, cache_percent: u8, rescale_floor: u16) -> Self {
        Self {
            blocksize,
            cache_percent,
            rescale_floor: rescale_floor.max(2),
            state: RwLock::new(TableState {
                entries: Vec::new(),
                logical_sector_count: 0,
                cache_sector_count: 0,
                header_sector_count: 0,
            }),
        }
    }

    pub const fn blocksize(&self) -> u32 {
        self.blocksize
    }

    pub fn logical_sector_count(&self) -> u64 {
        self.state.read().logical_sector_count
    }

    pub fn cache_sector_count(&self) -> u64 {
        self.state.read().cache_sector_count
    }

    pub fn header_sector_count(&self) -> u64 {
        self.state.read().header_sector_count
    }

    /// Size of the backing array
    pub fn capacity(&self) -> u64 {
        self.state.read().entries.len() as u64
    }

    /// Whether `logical` lies in the reserved cache tail
    pub fn is_cache_sector(&self, logical: u64) -> bool {
        let state = self.state.read();
        logical < state.logical_sector_count
            && logical >= state.logical_sector_count - state.cache_sector_count
    }

    /// Install a new header size and logical sector count
    ///
    /// Grows the backing array when needed; the array never shrinks.
    pub fn set_geometry(&self, header_sectors: u64, logical_sectors: u64) -> Result<()> {
        if entries_fitting(header_sectors, self.blocksize) < logical_sectors {
            return Err(Error::internal(format!(
                "{header_sectors} header sectors cannot index {logical_sectors} sectors"
            )));
        }
        self.grow(logical_sectors)?;

        let mut state = self.state.write();
        state.header_sector_count = header_sectors;
        state.logical_sector_count = logical_sectors;
        state.cache_sector_count = logical_sectors * u64::from(self.cache_percent) / 100;
        debug!(
            "index geometry: {header_sectors} header sectors, {logical_sectors} logical, {} cache",
            state.cache_sector_count
        );
        Ok(())
    }

    /// Replace the backing array with a larger one, keeping every entry
    pub fn grow(&self, new_capacity: u64) -> Result<()> {
        let new_len =
            usize::try_from(new_capacity).map_err(|_| Error::internal("index too large"))?;
        let mut state = self.state.write();
        let old_len = state.entries.len();
        if new_len <= old_len {
            return Ok(());
        }

        let mut grown = Vec::with_capacity(new_len);
        grown.extend_from_slice(&state.entries);
        grown.resize(new_len, SectorIndexEntry::UNUSED);
        state.entries = grown;
        info!("index grown from {old_len} to {new_len} entries");
        Ok(())
    }

    /// Entry of a logical sector
    pub fn lookup(&self, logical: u64) -> Result<SectorIndexEntry> {
        let state = self.state.read();
        if logical >= state.logical_sector_count {
            return Err(Error::OutOfRange {
                sector: logical,
                count: state.logical_sector_count,
            });
        }
        Ok(state.entries[slot(logical)])
    }

    /// Replace an entry in memory only
    pub fn set(&self, logical: u64, entry: SectorIndexEntry) -> Result<()> {
        let mut state = self.state.write();
        let count = state.logical_sector_count;
        let Some(current) = state.entries.get_mut(slot(logical)) else {
            return Err(Error::OutOfRange {
                sector: logical,
                count,
            });
        };
        *current = entry;
        Ok(())
    }

    /// Replace an entry and, with `persist_to`, write it to the header of
    /// every ready backend
    pub async fn update(
        &self,
        logical: u64,
        entry: SectorIndexEntry,
        persist_to: Option<&BackendSet>,
    ) -> Result<()> {
        self.set(logical, entry)?;
        if let Some(backends) = persist_to {
            self.persist(logical, backends).await;
        }
        Ok(())
    }

    /// Write the current entry of `logical` to every ready backend
    ///
    /// Failures on single replicas are logged; the remaining replicas and
    /// the next full header write converge them.
    pub async fn persist(&self, logical: u64, backends: &BackendSet) {
        let Some(entry) = self.state.read().entries.get(slot(logical)).copied() else {
            return;
        };
        let bytes = entry.to_bytes();
        let offset = entry_offset(logical);

        for backend in backends.iter().filter(|b| b.is_ready()) {
            if let Err(e) = backend.write_at(offset, &bytes).await {
                warn!(
                    "failed to persist index entry {logical} on backend {} ({}): {e}",
                    backend.id(),
                    backend.name()
                );
            }
        }
    }

    /// Count one access; returns `true` if all counts were rescaled
    ///
    /// When a count reaches `u16::MAX`, every count is divided by the
    /// smallest non-zero count (at least the rescale floor), keeping used
    /// entries at one or more.
    pub fn bump_access_count(&self, logical: u64) -> Result<bool> {
        let mut state = self.state.write();
        let count = state.logical_sector_count;
        let Some(entry) = state.entries.get_mut(slot(logical)) else {
            return Err(Error::OutOfRange {
                sector: logical,
                count,
            });
        };
        if !entry.is_used() {
            return Ok(false);
        }

        entry.access_count = entry.access_count.saturating_add(1);
        if entry.access_count < u16::MAX {
            return Ok(false);
        }

        let divisor = state
            .entries
            .iter()
            .filter(|e| e.is_used() && e.access_count > 0)
            .map(|e| e.access_count)
            .min()
            .unwrap_or(1)
            .max(self.rescale_floor);

        for entry in state.entries.iter_mut().filter(|e| e.is_used()) {
            entry.access_count = (entry.access_count / divisor).max(1);
        }
        debug!("access counts rescaled by {divisor}");
        Ok(true)
    }

    /// Reset every used entry to an access count of one
    pub fn clear_access_counts(&self) {
        let mut state = self.state.write();
        for entry in state.entries.iter_mut().filter(|e| e.is_used()) {
            entry.access_count = 1;
        }
    }

    /// Copy of the first `logical_sector_count` entries
    pub fn entries(&self) -> Vec<SectorIndexEntry> {
        let state = self.state.read();
        state.entries[..slot(state.logical_sector_count)].to_vec()
    }

    /// Number of used entries pointing at `backend`
    pub fn count_on(&self, backend: BackendId) -> u64 {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.is_used() && e.backend() == backend)
            .count() as u64
    }

    /// Replace the table contents with entries loaded from a header
    ///
    /// Entries past the loaded ones become unused.
    pub fn load(&self, entries: &[SectorIndexEntry]) -> Result<()> {
        self.grow(entries.len() as u64)?;
        let mut state = self.state.write();
        let (loaded, rest) = state.entries.split_at_mut(entries.len());
        loaded.copy_from_slice(entries);
        rest.fill(SectorIndexEntry::UNUSED);
        Ok(())
    }

    /// Decrement every backend id above `removed`
    ///
    /// Returns the logical sectors whose entries changed.
    pub fn close_id_gap(&self, removed: BackendId) -> Vec<u64> {
        let mut state = self.state.write();
        let mut changed = Vec::new();
        for (logical, entry) in state.entries.iter_mut().enumerate() {
            if entry.is_used() && entry.backend_id > removed.get() {
                entry.backend_id -= 1;
                changed.push(logical as u64);
            }
        }
        changed
    }

    /// Header record describing `backend` within a set of `member_count`
    pub fn record_for(&self, backend: &BackendHandle, member_count: usize) -> HeaderRecord {
        let state = self.state.read();
        HeaderRecord {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            blocksize: self.blocksize,
            logical_sector_count: state.logical_sector_count,
            max_sectors: state.entries.len() as u64,
            header_sector_count: state.header_sector_count,
            ordinal: backend.id().get(),
            member_count: u16::try_from(member_count).unwrap_or(u16::MAX),
            performance: backend.performance(),
        }
    }

    /// Write the header record only
    pub async fn write_record(&self, backend: &BackendHandle, member_count: usize) -> Result<()> {
        let record = self.record_for(backend, member_count);
        backend.write_at(0, &record.to_bytes()).await
    }

    /// Write the header record and the complete index array
    pub async fn write_header(&self, backend: &BackendHandle, member_count: usize) -> Result<()> {
        let record = self.record_for(backend, member_count);
        let image = {
            let state = self.state.read();
            let fitting = entries_fitting(state.header_sector_count, self.blocksize);
            let count = slot(fitting.min(state.entries.len() as u64));
            header_image(&record, &state.entries[..count], self.blocksize)
        };
        backend.write_at(0, &image).await
    }

    /// Write the full header to every ready backend, logging failures
    pub async fn write_all_headers(&self, backends: &BackendSet) {
        for backend in backends.iter().filter(|b| b.is_ready()) {
            if let Err(e) = self.write_header(backend, backends.len()).await {
                warn!(
                    "failed to write header to backend {} ({}): {e}",
                    backend.id(),
                    backend.name()
                );
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn slot(logical: u64) -> usize {
    logical as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::layout::{HEADER_RECORD_SIZE, HeaderProbe, parse_entries};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn table(logical: u64) -> IndexTable {
        let table = IndexTable::new(512, 10, 2);
        table.set_geometry(8, logical).unwrap();
        table
    }

    #[test]
    fn test_lookup_and_range() {
        let table = table(100);
        assert_eq!(table.lookup(5).unwrap(), SectorIndexEntry::UNUSED);
        assert!(matches!(
            table.lookup(100),
            Err(Error::OutOfRange { sector: 100, count: 100 })
        ));
        assert_eq!(table.cache_sector_count(), 10);
        assert!(table.is_cache_sector(90));
        assert!(!table.is_cache_sector(89));
        assert!(!table.is_cache_sector(100));
    }

    #[test]
    fn test_grow_keeps_entries_and_never_shrinks() {
        let table = table(10);
        table
            .set(3, SectorIndexEntry::new(BackendId::new(1), 42))
            .unwrap();
        table.grow(50).unwrap();
        assert_eq!(table.capacity(), 50);
        table.grow(20).unwrap();
        assert_eq!(table.capacity(), 50);

        table.set_geometry(8, 40).unwrap();
        assert_eq!(table.lookup(3).unwrap().physical_sector, 42);
        assert_eq!(table.lookup(39).unwrap(), SectorIndexEntry::UNUSED);
    }

    #[test]
    fn test_geometry_must_fit_header() {
        let table = IndexTable::new(512, 0, 2);
        assert!(table.set_geometry(1, 33).is_err());
        assert!(table.set_geometry(1, 32).is_ok());
    }

    #[test]
    fn test_bump_rescales_on_overflow() {
        let table = table(10);
        table
            .set(
                0,
                SectorIndexEntry {
                    backend_id: 1,
                    physical_sector: 8,
                    access_count: u16::MAX - 1,
                },
            )
            .unwrap();
        table
            .set(
                1,
                SectorIndexEntry {
                    backend_id: 1,
                    physical_sector: 9,
                    access_count: 100,
                },
            )
            .unwrap();
        table
            .set(2, SectorIndexEntry::new(BackendId::new(1), 10))
            .unwrap();

        assert!(table.bump_access_count(0).unwrap());
        // min non-zero count is 1, clamped to the floor of 2
        assert_eq!(table.lookup(0).unwrap().access_count, u16::MAX / 2);
        assert_eq!(table.lookup(1).unwrap().access_count, 50);
        assert_eq!(table.lookup(2).unwrap().access_count, 1);
        assert_eq!(table.lookup(3).unwrap().access_count, 0);
    }

    #[test]
    fn test_bump_ignores_unused() {
        let table = table(10);
        assert!(!table.bump_access_count(4).unwrap());
        assert_eq!(table.lookup(4).unwrap(), SectorIndexEntry::UNUSED);
    }

    #[test]
    fn test_clear_access_counts_keeps_invariant() {
        let table = table(10);
        table
            .set(
                1,
                SectorIndexEntry {
                    backend_id: 2,
                    physical_sector: 9,
                    access_count: 300,
                },
            )
            .unwrap();
        table.clear_access_counts();
        for entry in table.entries() {
            assert_eq!(entry.is_used(), entry.access_count != 0);
        }
        assert_eq!(table.lookup(1).unwrap().access_count, 1);
    }

    #[test]
    fn test_close_id_gap() {
        let table = table(10);
        table.set(0, SectorIndexEntry::new(BackendId::new(1), 8)).unwrap();
        table.set(1, SectorIndexEntry::new(BackendId::new(3), 8)).unwrap();
        table.set(2, SectorIndexEntry::new(BackendId::new(2), 9)).unwrap();
        let changed = table.close_id_gap(BackendId::new(2));
        assert_eq!(changed, vec![1]);
        assert_eq!(table.lookup(1).unwrap().backend_id, 2);
        assert_eq!(table.count_on(BackendId::new(3)), 0);
    }

    #[tokio::test]
    async fn test_persisted_entries_reach_every_header() {
        let dir = tempdir().unwrap();
        let mut set = BackendSet::new();
        for name in ["a", "b"] {
            let device = LocalBackend::create(dir.path().join(name), 64 * 512, false).unwrap();
            let handle = BackendHandle::new(Arc::new(device), 512, 5).await.unwrap();
            set.push(Arc::new(handle));
        }

        let table = IndexTable::new(512, 0, 2);
        table.set_geometry(2, 60).unwrap();
        for backend in set.iter() {
            table.write_header(backend, set.len()).await.unwrap();
        }

        let entry = SectorIndexEntry {
            backend_id: 2,
            physical_sector: 17,
            access_count: 9,
        };
        table.update(33, entry, Some(&set)).await.unwrap();

        for backend in set.iter() {
            let image = backend.read_at(0, 2 * 512).await.unwrap();
            let HeaderProbe::Compatible(record) = HeaderRecord::probe(&image).unwrap() else {
                panic!("header not written");
            };
            assert_eq!(record.ordinal, backend.id().get());
            assert_eq!(record.member_count, 2);
            assert_eq!(record.logical_sector_count, 60);
            let entries = parse_entries(&image[HEADER_RECORD_SIZE..], 60).unwrap();
            assert_eq!(entries[33], entry);
        }
    }
}
