//! Per-backend header layout
//!
//! Backend Layout (sectors of `blocksize` bytes):
//! ```text
//! +------------------+  Sector 0 (offset 0)
//! |  Header record   |  128 bytes - magic, version, geometry, performance
//! +------------------+  offset 128
//! |   Index array    |  12 bytes per logical sector, mirrored on every backend
//! +------------------+  Sector H (header_sector_count)
//! |   Data slots     |  sectors H .. capacity - 1
//! +------------------+  Sector capacity - 1
//! | Move-help sector |  scratch slot for crash-safe swaps
//! +------------------+
//! ```

use crate::performance::{MovingAverage, PerformanceRecord};
use bytes::{Buf, BufMut, BytesMut};
use tierio_common::{Error, Result, SectorIndexEntry};

/// Magic number identifying a tierio backend
pub const MAGIC: [u8; 8] = *b"TIERIO\0\0";

/// Current header format version
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Size of the header record preceding the index array
pub const HEADER_RECORD_SIZE: usize = 128;

/// Byte offset of an index entry within the header region
#[inline]
#[must_use]
pub const fn entry_offset(logical: u64) -> u64 {
    HEADER_RECORD_SIZE as u64 + logical * SectorIndexEntry::SIZE as u64
}

/// Header sectors needed to index `entries` logical sectors
#[must_use]
pub fn header_sectors_for(entries: u64, blocksize: u32) -> u64 {
    entry_offset(entries).div_ceil(u64::from(blocksize))
}

/// Number of index entries that fit into `header_sectors` sectors
#[must_use]
pub fn entries_fitting(header_sectors: u64, blocksize: u32) -> u64 {
    (header_sectors * u64::from(blocksize)).saturating_sub(HEADER_RECORD_SIZE as u64)
        / SectorIndexEntry::SIZE as u64
}

/// Sectors a header of a given table size costs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderOverhead {
    /// Header sectors on every backend
    pub header_sectors: u64,
    /// Sectors lost across all backends, including each move-help sector
    pub total_sectors: u64,
}

/// Physical sectors needed for the header and index of a table with
/// `logical_count` entries, replicated on `backend_count` backends
#[must_use]
pub fn header_overhead(logical_count: u64, backend_count: usize, blocksize: u32) -> HeaderOverhead {
    let header_sectors = header_sectors_for(logical_count, blocksize);
    HeaderOverhead {
        header_sectors,
        total_sectors: backend_count as u64 * (header_sectors + 1),
    }
}

/// Header size and logical capacity of a set of backends
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub header_sectors: u64,
    pub logical_sectors: u64,
}

impl Geometry {
    /// Data sectors a backend of `capacity` sectors contributes
    #[must_use]
    pub const fn contribution(&self, capacity: u64) -> u64 {
        capacity.saturating_sub(self.header_sectors + 1)
    }
}

/// Find the smallest header size, not below `current_header`, whose index
/// covers every data sector of the given backends.
pub fn solve_geometry(capacities: &[u64], current_header: u64, blocksize: u32) -> Result<Geometry> {
    let logical_at = |header: u64| -> u64 {
        capacities
            .iter()
            .map(|c| c.saturating_sub(header + 1))
            .sum()
    };
    let fits = |header: u64| header_sectors_for(logical_at(header), blocksize) <= header;

    // the index shrinks as the header grows, so `fits` is monotone
    let mut lo = current_header.max(1);
    if !fits(lo) {
        let mut hi = header_sectors_for(logical_at(lo), blocksize);
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if fits(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        lo = hi;
    }

    // every backend needs header + move-help + at least one data slot
    let smallest = capacities.iter().copied().min().unwrap_or(0);
    if smallest < lo + 2 {
        return Err(Error::CapacityExceeded {
            required: lo + 2,
            available: smallest,
        });
    }

    Ok(Geometry {
        header_sectors: lo,
        logical_sectors: logical_at(lo),
    })
}

/// Result of inspecting the first bytes of a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderProbe {
    /// No recognizable header
    Fresh,
    /// Header of this or an older format version
    Compatible(HeaderRecord),
    /// Header written by a newer format version
    Newer(HeaderRecord),
}

/// Fixed-size record at the start of every backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub version_major: u16,
    pub version_minor: u16,
    /// Sector size of the engine that wrote the header
    pub blocksize: u32,
    /// Logical sectors exposed by the engine
    pub logical_sector_count: u64,
    /// Capacity of the in-memory index
    pub max_sectors: u64,
    /// Size of the replicated header region in sectors
    pub header_sector_count: u64,
    /// This backend's ordinal (1-based)
    pub ordinal: u16,
    /// Number of backends in the set when the header was written
    pub member_count: u16,
    /// Performance snapshot of this backend
    pub performance: PerformanceRecord,
}

impl HeaderRecord {
    /// Bytes covered by the checksum
    const CHECKSUM_OFFSET: usize = HEADER_RECORD_SIZE - 4;

    /// Serialize to exactly [`HEADER_RECORD_SIZE`] bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_RECORD_SIZE);

        buf.put_slice(&MAGIC);
        buf.put_u16_le(self.version_major);
        buf.put_u16_le(self.version_minor);
        buf.put_u32_le(self.blocksize);
        buf.put_u64_le(self.logical_sector_count);
        buf.put_u64_le(self.max_sectors);
        buf.put_u64_le(self.header_sector_count);
        buf.put_u16_le(self.ordinal);
        buf.put_u16_le(self.member_count);
        for avg in [self.performance.read, self.performance.write] {
            buf.put_u64_le(avg.avg);
            buf.put_u64_le(avg.avg_rem);
            buf.put_u64_le(avg.stdev);
            buf.put_u64_le(avg.stdev_rem);
        }
        buf.resize(Self::CHECKSUM_OFFSET, 0);

        let checksum = crc32c::crc32c(&buf);
        buf.put_u32_le(checksum);

        let mut out = [0u8; HEADER_RECORD_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Inspect raw bytes read from sector 0 of a backend
    pub fn probe(data: &[u8]) -> Result<HeaderProbe> {
        if data.len() < HEADER_RECORD_SIZE || data[..MAGIC.len()] != MAGIC {
            return Ok(HeaderProbe::Fresh);
        }

        let stored = (&data[Self::CHECKSUM_OFFSET..HEADER_RECORD_SIZE]).get_u32_le();
        if crc32c::crc32c(&data[..Self::CHECKSUM_OFFSET]) != stored {
            return Err(Error::HeaderIncompatible("header checksum mismatch".into()));
        }

        let mut buf = &data[MAGIC.len()..Self::CHECKSUM_OFFSET];
        let version_major = buf.get_u16_le();
        let version_minor = buf.get_u16_le();
        let blocksize = buf.get_u32_le();
        let logical_sector_count = buf.get_u64_le();
        let max_sectors = buf.get_u64_le();
        let header_sector_count = buf.get_u64_le();
        let ordinal = buf.get_u16_le();
        let member_count = buf.get_u16_le();
        let mut read_avg = || MovingAverage {
            avg: buf.get_u64_le(),
            avg_rem: buf.get_u64_le(),
            stdev: buf.get_u64_le(),
            stdev_rem: buf.get_u64_le(),
        };
        let performance = PerformanceRecord {
            read: read_avg(),
            write: read_avg(),
        };

        let record = Self {
            version_major,
            version_minor,
            blocksize,
            logical_sector_count,
            max_sectors,
            header_sector_count,
            ordinal,
            member_count,
            performance,
        };

        if (version_major, version_minor) > (VERSION_MAJOR, VERSION_MINOR) {
            Ok(HeaderProbe::Newer(record))
        } else {
            Ok(HeaderProbe::Compatible(record))
        }
    }

    /// Check that the geometry in the record is usable for a backend of
    /// `capacity` sectors with the engine's blocksize
    pub fn validate(&self, blocksize: u32, capacity: u64) -> Result<()> {
        if self.blocksize != blocksize {
            return Err(Error::HeaderIncompatible(format!(
                "blocksize {} differs from engine blocksize {blocksize}",
                self.blocksize
            )));
        }
        if self.ordinal == 0 {
            return Err(Error::HeaderIncompatible("ordinal 0 is reserved".into()));
        }
        if self.header_sector_count + 1 >= capacity {
            return Err(Error::HeaderIncompatible(format!(
                "header of {} sectors does not fit a backend of {capacity} sectors",
                self.header_sector_count
            )));
        }
        if entries_fitting(self.header_sector_count, blocksize) < self.logical_sector_count {
            return Err(Error::HeaderIncompatible(format!(
                "{} header sectors cannot index {} logical sectors",
                self.header_sector_count, self.logical_sector_count
            )));
        }
        Ok(())
    }
}

/// Parse `count` index entries from the bytes following the header record
pub fn parse_entries(data: &[u8], count: u64) -> Result<Vec<SectorIndexEntry>> {
    let count = usize::try_from(count).map_err(|_| Error::internal("index too large"))?;
    let needed = count * SectorIndexEntry::SIZE;
    if data.len() < needed {
        return Err(Error::IndexCorruption(format!(
            "index region holds {} bytes, {needed} expected",
            data.len()
        )));
    }

    Ok(data[..needed]
        .chunks_exact(SectorIndexEntry::SIZE)
        .map(|chunk| {
            let mut raw = [0u8; SectorIndexEntry::SIZE];
            raw.copy_from_slice(chunk);
            SectorIndexEntry::from_bytes(&raw)
        })
        .collect())
}

/// Serialize a complete header region of `header_sectors` sectors
#[must_use]
pub fn header_image(
    record: &HeaderRecord,
    entries: &[SectorIndexEntry],
    blocksize: u32,
) -> Vec<u8> {
    let size = usize::try_from(record.header_sector_count * u64::from(blocksize)).unwrap_or(0);
    let mut image = Vec::with_capacity(size.max(HEADER_RECORD_SIZE));
    image.extend_from_slice(&record.to_bytes());
    for entry in entries {
        image.extend_from_slice(&entry.to_bytes());
    }
    image.resize(size.max(image.len()), 0);
    image
}
