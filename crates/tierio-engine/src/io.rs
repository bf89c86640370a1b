//! Client reads, writes and discards
//!
//! A request is split on sector boundaries, the sector fragments are planned
//! one after another against the index, the data transfers run
//! concurrently, and the index is updated once every transfer finished.

use crate::sector::SectorRange;
use crate::state::{EngineCore, surface};
use bytes::{Bytes, BytesMut};
use futures::future::{join_all, try_join_all};
use std::borrow::Cow;
use tierio_common::{Error, Result, SectorIndexEntry};
use tracing::{debug, warn};

/// One fragment of a write, placed on its physical sector
struct StagedWrite<'a> {
    logical: u64,
    entry: SectorIndexEntry,
    /// The slot was taken from the free set for this write
    fresh: bool,
    offset_in_sector: usize,
    payload: Cow<'a, [u8]>,
}

impl EngineCore {
    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        let size = self.logical_bytes();
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(Error::OutOfRange {
                sector: offset / u64::from(self.blocksize()),
                count: self.table.logical_sector_count(),
            });
        }
        Ok(())
    }

    /// Read `length` bytes at byte `offset`; never-written sectors read as zeros
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        self.check_range(offset, length as u64)?;
        let ranges = self.mapper.byte_range_to_sectors(offset, length as u64);

        let parts = try_join_all(ranges.iter().map(|range| self.fetch(range))).await?;

        let mut buf = BytesMut::zeroed(length);
        for (range, part) in ranges.iter().zip(parts) {
            if let Some(data) = part {
                buf[range.buf_offset..range.buf_offset + range.length].copy_from_slice(&data);
            }
        }

        for range in &ranges {
            self.record_access(range.logical).await?;
        }
        Ok(buf.freeze())
    }

    async fn fetch(&self, range: &SectorRange) -> Result<Option<Bytes>> {
        let entry = self.table.lookup(range.logical)?;
        if !entry.is_used() {
            return Ok(None);
        }

        let result = match self.backend(entry.backend()) {
            Ok(backend) => {
                backend
                    .read_sector(entry.physical_sector, range.offset_in_sector, range.length)
                    .await
            }
            Err(e) => Err(e),
        };

        match result.map_err(surface) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_transient() && self.table.is_cache_sector(range.logical) => {
                warn!(
                    "cache sector {} unreachable on backend {}, returning zeros: {e}",
                    range.logical,
                    entry.backend()
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write `data` at byte `offset`
    ///
    /// Sectors written for the first time get a slot on the fastest ready
    /// backend that has one; the rest of such a sector is zero-filled.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let ranges = self.mapper.byte_range_to_sectors(offset, data.len() as u64);
        let blocksize = self.blocksize();
        let order = self.allocation_order();

        let mut staged = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let source = &data[range.buf_offset..range.buf_offset + range.length];
            let entry = match self.table.lookup(range.logical) {
                Ok(entry) => entry,
                Err(e) => {
                    self.release_fresh(&staged);
                    return Err(e);
                }
            };

            if entry.is_used() {
                staged.push(StagedWrite {
                    logical: range.logical,
                    entry,
                    fresh: false,
                    offset_in_sector: range.offset_in_sector,
                    payload: Cow::Borrowed(source),
                });
                continue;
            }

            let Some((backend, slot)) = self.free.take_first(&order) else {
                self.release_fresh(&staged);
                return Err(Error::CapacityExceeded {
                    required: 1,
                    available: 0,
                });
            };
            let payload = if range.is_full(blocksize) {
                Cow::Borrowed(source)
            } else {
                let mut sector = vec![0u8; blocksize as usize];
                sector[range.offset_in_sector..range.offset_in_sector + range.length]
                    .copy_from_slice(source);
                Cow::Owned(sector)
            };
            staged.push(StagedWrite {
                logical: range.logical,
                entry: SectorIndexEntry::new(backend, slot),
                fresh: true,
                offset_in_sector: 0,
                payload,
            });
        }

        let this = &*self;
        let results = join_all(staged.iter().map(|write| async move {
            let backend = this.backend(write.entry.backend())?;
            backend
                .write_sector(
                    write.entry.physical_sector,
                    write.offset_in_sector,
                    &write.payload,
                )
                .await
        }))
        .await;

        if let Some(error) = results.into_iter().find_map(Result::err) {
            self.release_fresh(&staged);
            return Err(surface(error));
        }

        for write in &staged {
            if write.fresh {
                self.place(write.logical, write.entry).await?;
            } else {
                self.record_access(write.logical).await?;
            }
        }
        Ok(())
    }

    fn release_fresh(&mut self, staged: &[StagedWrite<'_>]) {
        for write in staged.iter().filter(|w| w.fresh) {
            self.free
                .release(write.entry.backend(), write.entry.physical_sector);
        }
    }

    /// Release every sector completely covered by the range
    ///
    /// Partially covered sectors keep their contents.
    pub async fn discard(&mut self, offset: u64, length: u64) -> Result<()> {
        self.check_range(offset, length)?;
        let blocksize = self.blocksize();

        for range in self.mapper.byte_range_to_sectors(offset, length) {
            if !range.is_full(blocksize) {
                continue;
            }
            let entry = self.table.lookup(range.logical)?;
            if !entry.is_used() {
                continue;
            }

            self.place(range.logical, SectorIndexEntry::UNUSED).await?;
            if let Ok(backend) = self.backend(entry.backend()) {
                if let Err(e) = backend.discard_sector(entry.physical_sector).await {
                    debug!(
                        "discard of {}:{} not applied: {e}",
                        entry.backend(),
                        entry.physical_sector
                    );
                }
            }
            self.release_slot(entry);
        }
        Ok(())
    }

    /// Flush every ready backend and refresh the performance snapshots
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = None;
        for backend in self.backends.iter().filter(|b| b.is_ready()) {
            if let Err(e) = backend.flush().await {
                warn!("flush of backend {} ({}) failed: {e}", backend.id(), backend.name());
                first_error.get_or_insert(e);
                continue;
            }
            if !self.is_assembled() {
                continue;
            }
            if let Err(e) = self.table.write_record(backend, self.backends.len()).await {
                warn!("header record of backend {} not updated: {e}", backend.id());
            }
        }
        first_error.map_or(Ok(()), |e| Err(surface(e)))
    }
}
