//! Shared helpers for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tierio_common::{BackendKind, Config, Error, Result, SpaceOp};
use tierio_engine::{BackendDescriptor, Engine};
use tierio_storage::Backend;

pub const BLOCKSIZE: u32 = 512;

/// In-memory backend whose latency grows with the transfer size
pub struct MemoryBackend {
    name: String,
    data: RwLock<Vec<u8>>,
    /// Simulated latency per KiB transferred
    per_kib: Duration,
    online: AtomicBool,
    /// Failing writes: physical sector and how many more times it fails
    faults: Mutex<Vec<(u64, u32)>>,
}

impl MemoryBackend {
    pub fn new(name: &str, sectors: u64, per_kib: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            data: RwLock::new(vec![0u8; (sectors * u64::from(BLOCKSIZE)) as usize]),
            per_kib,
            online: AtomicBool::new(true),
            faults: Mutex::new(Vec::new()),
        })
    }

    /// Copy of the first `len` bytes
    pub fn head(&self, len: usize) -> Vec<u8> {
        self.data.read()[..len].to_vec()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Make the next `times` writes touching physical `sector` fail
    pub fn fail_writes(&self, sector: u64, times: u32) {
        self.faults.lock().push((sector, times));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn injected_fault(&self, pos: u64, len: usize) -> Result<()> {
        let block = u64::from(BLOCKSIZE);
        let touched = pos / block..(pos + len as u64).div_ceil(block);
        let mut faults = self.faults.lock();
        let Some(fault) = faults
            .iter_mut()
            .find(|(sector, times)| *times > 0 && touched.contains(sector))
        else {
            return Ok(());
        };
        fault.1 -= 1;
        Err(Error::storage(format!("{}: injected write failure at sector {}", self.name, fault.0)))
    }

    fn simulate(&self, bytes: usize) {
        if !self.per_kib.is_zero() {
            std::thread::sleep(self.per_kib.mul_f64(bytes as f64 / 1024.0));
        }
    }

    fn check(&self, pos: u64, len: usize) -> Result<std::ops::Range<usize>> {
        if !self.online.load(Ordering::Acquire) {
            return Err(Error::NotReady(self.name.clone()));
        }
        let start = pos as usize;
        let size = self.data.read().len();
        if start + len > size {
            return Err(Error::storage(format!("{}: {pos}+{len} beyond {size}", self.name)));
        }
        Ok(start..start + len)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn size_bytes(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    async fn read(&self, pos: u64, len: usize) -> Result<Bytes> {
        let range = self.check(pos, len)?;
        self.simulate(len);
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }

    async fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        let range = self.check(pos, data.len())?;
        self.injected_fault(pos, data.len())?;
        self.simulate(data.len());
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn allocate_or_discard(&self, _pos: u64, _len: u64, _op: SpaceOp) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Engine configuration for tests: 512 byte sectors, no cache tier, tiering
/// only on demand
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.blocksize = BLOCKSIZE;
    config.engine.cache_percent = 0;
    config.tiering.enabled = false;
    config
}

pub fn device(backend: &Arc<MemoryBackend>) -> BackendDescriptor {
    BackendDescriptor::Device(Arc::clone(backend) as Arc<dyn Backend>)
}

/// Sector contents unique to `logical`
pub fn pattern(logical: u64) -> Vec<u8> {
    (0..BLOCKSIZE as usize)
        .map(|i| (logical as usize * 31 + i) as u8)
        .collect()
}

/// Write every logical sector with its pattern, one sector per request
pub async fn fill(engine: &Engine, logical_sectors: u64) {
    for logical in 0..logical_sectors {
        engine.write_sectors(logical, pattern(logical)).await.unwrap();
    }
}

/// Check every logical sector below `logical_sectors` against its pattern
pub async fn verify(engine: &Engine, logical_sectors: u64) {
    for logical in 0..logical_sectors {
        let data = engine.read_sectors(logical, 1).await.unwrap();
        assert_eq!(&data[..], &pattern(logical)[..], "logical sector {logical}");
    }
}
