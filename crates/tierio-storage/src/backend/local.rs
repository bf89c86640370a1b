//! Local file / block device backend

use super::Backend;
use crate::raw_io::RawFile;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tierio_common::{BackendKind, Error, Result, SpaceOp};
use tracing::{debug, info};

/// Backend on a regular file or raw block device
///
/// I/O is synchronous and runs on the calling task.
pub struct LocalBackend {
    file: RawFile,
    open: AtomicBool,
}

impl LocalBackend {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let file = RawFile::open(path, false, direct_io)?;
        info!(
            "opened local backend {} ({} bytes, direct_io={direct_io})",
            file.path(),
            file.size()
        );
        Ok(Self {
            file,
            open: AtomicBool::new(true),
        })
    }

    /// Open a file, creating it with `size` bytes if needed
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let file = RawFile::create(path, size, direct_io)?;
        info!(
            "created local backend {} ({} bytes, direct_io={direct_io})",
            file.path(),
            file.size()
        );
        Ok(Self {
            file,
            open: AtomicBool::new(true),
        })
    }

    /// Stop serving requests; `is_ready` reports false afterwards
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closed local backend {}", self.file.path());
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotReady(self.file.path().to_string()))
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        self.file.path()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn size_bytes(&self) -> Result<u64> {
        Ok(self.file.size())
    }

    async fn read(&self, pos: u64, len: usize) -> Result<Bytes> {
        self.check_open()?;
        let mut buf = vec![0u8; len];
        self.file.read_at(pos, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.file.write_at(pos, data)
    }

    async fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.file.sync_data()
    }

    async fn allocate_or_discard(&self, pos: u64, len: u64, op: SpaceOp) -> Result<()> {
        self.check_open()?;
        match op {
            SpaceOp::Allocate => self.file.preallocate(pos, len),
            SpaceOp::Discard => self.file.punch_hole(pos, len),
        }
    }

    fn is_ready(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
