//! tierio storage layer
//!
//! This crate implements everything below the engine:
//! - Raw file and block device access (O_DIRECT / F_NOCACHE)
//! - The `Backend` capability interface and the local backend
//! - Per-backend performance model used for ranking
//! - The replicated on-disk header and the sector index table
//! - Free data slot tracking

pub mod allocator;
pub mod backend;
pub mod index;
pub mod layout;
pub mod performance;
pub mod raw_io;

// Re-exports
pub use allocator::FreeSlots;
pub use backend::{Backend, BackendHandle, BackendSet, BackendStats, LocalBackend};
pub use index::IndexTable;
pub use layout::{
    Geometry, HEADER_RECORD_SIZE, HeaderOverhead, HeaderProbe, HeaderRecord, MAGIC,
    header_overhead, solve_geometry,
};
pub use performance::{MovingAverage, PerformanceModel, PerformanceRecord};
pub use raw_io::{AlignedBuffer, RawFile};
