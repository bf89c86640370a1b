//! Storage backends
//!
//! A [`Backend`] is one unit of storage contributing capacity to the engine:
//! a local file or block device ([`LocalBackend`]) or a remote store reached
//! through a plugin. The engine never talks to a `Backend` directly but
//! through a [`BackendHandle`], which assigns the backend its id, fixes its
//! geometry and times every call into the backend's [`PerformanceModel`].

mod local;

pub use local::LocalBackend;

use crate::performance::{PerformanceModel, PerformanceRecord};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Instant;
use tierio_common::{BackendId, BackendKind, Direction, Error, Result, SpaceOp};

/// Capability interface of a storage backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human readable name (path or plugin name)
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Usable size in bytes
    async fn size_bytes(&self) -> Result<u64>;

    /// Read `len` bytes at byte offset `pos`
    async fn read(&self, pos: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at byte offset `pos`
    async fn write(&self, pos: u64, data: &[u8]) -> Result<()>;

    /// Make previous writes durable
    async fn flush(&self) -> Result<()>;

    /// Allocate or release the storage behind a byte range
    async fn allocate_or_discard(&self, pos: u64, len: u64, op: SpaceOp) -> Result<()>;

    /// Local: the handle is open. Remote: the plugin is registered.
    fn is_ready(&self) -> bool;
}

/// Backend statistics
#[derive(Debug, Default)]
pub struct BackendStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

/// A backend registered with an engine
pub struct BackendHandle {
    id: AtomicU16,
    device: Arc<dyn Backend>,
    blocksize: u32,
    capacity_sectors: u64,
    perf: Mutex<PerformanceModel>,
    stats: BackendStats,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("capacity_sectors", &self.capacity_sectors)
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    /// Wrap a backend, querying its size
    pub async fn new(device: Arc<dyn Backend>, blocksize: u32, measure_shift: u32) -> Result<Self> {
        let size = device.size_bytes().await?;
        let capacity_sectors = size / u64::from(blocksize);
        Ok(Self {
            id: AtomicU16::new(BackendId::UNUSED.get()),
            device,
            blocksize,
            capacity_sectors,
            perf: Mutex::new(PerformanceModel::new(measure_shift)),
            stats: BackendStats::default(),
        })
    }

    pub fn id(&self) -> BackendId {
        BackendId::new(self.id.load(Ordering::Acquire))
    }

    fn set_id(&self, id: BackendId) {
        self.id.store(id.get(), Ordering::Release);
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn kind(&self) -> BackendKind {
        self.device.kind()
    }

    pub fn is_ready(&self) -> bool {
        self.device.is_ready()
    }

    pub const fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub const fn blocksize(&self) -> u32 {
        self.blocksize
    }

    /// Scratch sector reserved for swaps; never holds a logical sector
    pub const fn move_help_sector(&self) -> u64 {
        self.capacity_sectors.saturating_sub(1)
    }

    pub const fn stats(&self) -> &BackendStats {
        &self.stats
    }

    pub fn rank_score(&self) -> u64 {
        self.perf.lock().rank_score()
    }

    pub fn performance(&self) -> PerformanceRecord {
        self.perf.lock().record()
    }

    /// Replace the model state with a persisted snapshot
    pub fn restore_performance(&self, record: PerformanceRecord) {
        let mut perf = self.perf.lock();
        let shift = perf.shift();
        *perf = PerformanceModel::with_record(shift, record);
    }

    fn sector_pos(&self, sector: u64) -> u64 {
        sector * u64::from(self.blocksize)
    }

    /// Timed read of `len` bytes at byte offset `pos`
    pub async fn read_at(&self, pos: u64, len: usize) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.device.read(pos, len).await;
        match &result {
            Ok(data) => {
                self.perf.lock().update(Direction::Read, started.elapsed(), len);
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                if data.len() != len {
                    return Err(Error::storage(format!(
                        "short read from {}: {} of {len} bytes",
                        self.name(),
                        data.len()
                    )));
                }
            }
            Err(_) => {
                self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Timed write of `data` at byte offset `pos`
    pub async fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        let started = Instant::now();
        let result = self.device.write(pos, data).await;
        if result.is_ok() {
            self.perf
                .lock()
                .update(Direction::Write, started.elapsed(), data.len());
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_written
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        } else {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Read `len` bytes at `offset` within physical sector `sector`
    pub async fn read_sector(&self, sector: u64, offset: usize, len: usize) -> Result<Bytes> {
        self.check_sector(sector)?;
        self.read_at(self.sector_pos(sector) + offset as u64, len)
            .await
    }

    /// Write `data` at `offset` within physical sector `sector`
    pub async fn write_sector(&self, sector: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.check_sector(sector)?;
        self.write_at(self.sector_pos(sector) + offset as u64, data)
            .await
    }

    /// Release the storage behind a physical sector
    pub async fn discard_sector(&self, sector: u64) -> Result<()> {
        self.check_sector(sector)?;
        self.device
            .allocate_or_discard(
                self.sector_pos(sector),
                u64::from(self.blocksize),
                SpaceOp::Discard,
            )
            .await
    }

    pub async fn flush(&self) -> Result<()> {
        self.device.flush().await
    }

    fn check_sector(&self, sector: u64) -> Result<()> {
        if sector >= self.capacity_sectors {
            return Err(Error::OutOfRange {
                sector,
                count: self.capacity_sectors,
            });
        }
        Ok(())
    }
}

/// Arena of the registered backends, indexed by [`BackendId`]
///
/// Ids are dense: the backend at position `i` has id `i + 1`. Removing a
/// backend renumbers every backend behind it.
#[derive(Debug, Default)]
pub struct BackendSet {
    backends: Vec<Arc<BackendHandle>>,
}

impl BackendSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, id: BackendId) -> Result<&Arc<BackendHandle>> {
        if id.is_unused() {
            return Err(Error::BackendNotFound(id.get()));
        }
        self.backends
            .get(id.index())
            .ok_or_else(|| Error::BackendNotFound(id.get()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendHandle>> {
        self.backends.iter()
    }

    /// Register a backend under the next free id
    pub fn push(&mut self, handle: Arc<BackendHandle>) -> BackendId {
        let id = BackendId::from_index(self.backends.len());
        handle.set_id(id);
        self.backends.push(handle);
        id
    }

    /// Unregister a backend and close the gap in the id space
    pub fn remove(&mut self, id: BackendId) -> Result<Arc<BackendHandle>> {
        self.get(id)?;
        let handle = self.backends.remove(id.index());
        handle.set_id(BackendId::UNUSED);
        for (index, backend) in self.backends.iter().enumerate().skip(id.index()) {
            backend.set_id(BackendId::from_index(index));
        }
        Ok(handle)
    }

    /// Backend ids ordered fastest first; ties keep the lower id first
    #[must_use]
    pub fn ranked(&self) -> Vec<BackendId> {
        let mut ranked: Vec<(u64, BackendId)> = self
            .backends
            .iter()
            .map(|b| (b.rank_score(), b.id()))
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    /// Raw capacity of every backend in sectors, in id order
    #[must_use]
    pub fn capacities(&self) -> Vec<u64> {
        self.backends.iter().map(|b| b.capacity_sectors()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn local(dir: &std::path::Path, name: &str, sectors: u64) -> Arc<BackendHandle> {
        let device = LocalBackend::create(dir.join(name), sectors * 512, false).unwrap();
        Arc::new(BackendHandle::new(Arc::new(device), 512, 5).await.unwrap())
    }

    #[tokio::test]
    async fn test_handle_geometry() {
        let dir = tempdir().unwrap();
        let handle = local(dir.path(), "a", 64).await;
        assert_eq!(handle.capacity_sectors(), 64);
        assert_eq!(handle.move_help_sector(), 63);
        assert_eq!(handle.kind(), BackendKind::Local);
        assert!(handle.is_ready());
    }

    #[tokio::test]
    async fn test_sector_io_is_timed() {
        let dir = tempdir().unwrap();
        let handle = local(dir.path(), "a", 16).await;

        handle.write_sector(3, 10, b"payload").await.unwrap();
        let data = handle.read_sector(3, 10, 7).await.unwrap();
        assert_eq!(&data[..], b"payload");

        assert_eq!(handle.stats().writes.load(Ordering::Relaxed), 1);
        assert_eq!(handle.stats().reads.load(Ordering::Relaxed), 1);
        assert!(handle.performance().read.is_seeded());
        assert!(handle.performance().write.is_seeded());
        assert!(handle.read_sector(16, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_set_renumbers_on_remove() {
        let dir = tempdir().unwrap();
        let mut set = BackendSet::new();
        let a = local(dir.path(), "a", 16).await;
        let b = local(dir.path(), "b", 16).await;
        let c = local(dir.path(), "c", 16).await;
        assert_eq!(set.push(a.clone()), BackendId::new(1));
        assert_eq!(set.push(b.clone()), BackendId::new(2));
        assert_eq!(set.push(c.clone()), BackendId::new(3));

        let removed = set.remove(BackendId::new(2)).unwrap();
        assert!(Arc::ptr_eq(&removed, &b));
        assert_eq!(removed.id(), BackendId::UNUSED);
        assert_eq!(a.id(), BackendId::new(1));
        assert_eq!(c.id(), BackendId::new(2));
        assert_eq!(set.len(), 2);
        assert!(set.get(BackendId::new(3)).is_err());
        assert!(set.get(BackendId::UNUSED).is_err());
    }

    #[tokio::test]
    async fn test_ranked_by_score() {
        let dir = tempdir().unwrap();
        let mut set = BackendSet::new();
        let slow = local(dir.path(), "slow", 16).await;
        let fast = local(dir.path(), "fast", 16).await;
        slow.restore_performance(PerformanceRecord {
            read: crate::performance::MovingAverage {
                avg: 900,
                ..Default::default()
            },
            ..Default::default()
        });
        fast.restore_performance(PerformanceRecord {
            read: crate::performance::MovingAverage {
                avg: 100,
                ..Default::default()
            },
            ..Default::default()
        });
        set.push(slow);
        set.push(fast);
        assert_eq!(set.ranked(), vec![BackendId::new(2), BackendId::new(1)]);
    }
}
