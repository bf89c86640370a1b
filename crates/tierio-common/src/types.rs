//! Core type definitions for tierio
//!
//! This module defines the fundamental types used throughout the engine:
//! backend identifiers, sector index entries and I/O directions.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default sector size in bytes
pub const DEFAULT_BLOCKSIZE: u32 = 4096;

/// Every blocksize must be a multiple of this value
pub const BLOCKSIZE_MOD: u32 = 512;

/// Ordinal of a backend within an engine.
///
/// `0` is reserved as the "unused" sentinel of a [`SectorIndexEntry`];
/// registered backends are numbered densely from `1`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct BackendId(u16);

impl BackendId {
    /// The "no backend" sentinel
    pub const UNUSED: Self = Self(0);

    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    /// Zero-based position of this backend in an arena
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }

    /// Backend id for a zero-based arena position
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u16 + 1)
    }
}

impl fmt::Debug for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackendId({})", self.0)
    }
}

/// Physical location and access statistics of one logical sector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorIndexEntry {
    /// Backend holding the sector (`0` = unused)
    pub backend_id: u16,
    /// Sector on that backend
    pub physical_sector: u64,
    /// How often the sector was accessed (`0` iff unused)
    pub access_count: u16,
}

impl SectorIndexEntry {
    /// Bytes occupied by one entry on disk
    pub const SIZE: usize = 12;

    /// The unused entry
    pub const UNUSED: Self = Self {
        backend_id: 0,
        physical_sector: 0,
        access_count: 0,
    };

    /// A used entry with an access count of one
    #[must_use]
    pub const fn new(backend: BackendId, physical_sector: u64) -> Self {
        Self {
            backend_id: backend.get(),
            physical_sector,
            access_count: 1,
        }
    }

    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.backend_id != 0
    }

    #[must_use]
    pub const fn backend(&self) -> BackendId {
        BackendId::new(self.backend_id)
    }

    /// Same access count, new location
    #[must_use]
    pub const fn relocated(self, backend: BackendId, physical_sector: u64) -> Self {
        Self {
            backend_id: backend.get(),
            physical_sector,
            access_count: if self.access_count == 0 {
                1
            } else {
                self.access_count
            },
        }
    }

    /// Serialize to the packed little-endian on-disk form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.backend_id.to_le_bytes());
        buf[2..10].copy_from_slice(&self.physical_sector.to_le_bytes());
        buf[10..12].copy_from_slice(&self.access_count.to_le_bytes());
        buf
    }

    /// Parse the packed on-disk form
    #[must_use]
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let mut backend = [0u8; 2];
        let mut sector = [0u8; 8];
        let mut count = [0u8; 2];
        backend.copy_from_slice(&data[0..2]);
        sector.copy_from_slice(&data[2..10]);
        count.copy_from_slice(&data[10..12]);
        Self {
            backend_id: u16::from_le_bytes(backend),
            physical_sector: u64::from_le_bytes(sector),
            access_count: u16::from_le_bytes(count),
        }
    }
}

/// Kind of storage behind a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// File or raw block device
    #[display("local")]
    Local,
    /// Plugin reached over RPC
    #[display("remote")]
    Remote,
}

/// Direction of a data transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Space management operation on a backend range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceOp {
    /// Make sure the range is backed by storage
    Allocate,
    /// Release the storage behind the range
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_id_index() {
        assert!(BackendId::UNUSED.is_unused());
        assert_eq!(BackendId::new(1).index(), 0);
        assert_eq!(BackendId::from_index(2), BackendId::new(3));
        assert_eq!(BackendId::new(7).to_string(), "7");
    }

    #[test]
    fn test_entry_bytes() {
        let entry = SectorIndexEntry {
            backend_id: 3,
            physical_sector: 0x0102_0304_0506,
            access_count: 500,
        };
        assert_eq!(SectorIndexEntry::from_bytes(&entry.to_bytes()), entry);
        assert_eq!(
            SectorIndexEntry::from_bytes(&[0u8; SectorIndexEntry::SIZE]),
            SectorIndexEntry::UNUSED
        );
    }

    #[test]
    fn test_relocated_keeps_count() {
        let entry = SectorIndexEntry {
            backend_id: 1,
            physical_sector: 9,
            access_count: 42,
        };
        let moved = entry.relocated(BackendId::new(2), 17);
        assert_eq!(moved.backend_id, 2);
        assert_eq!(moved.physical_sector, 17);
        assert_eq!(moved.access_count, 42);
        assert_eq!(SectorIndexEntry::UNUSED.relocated(BackendId::new(1), 3).access_count, 1);
    }
}
