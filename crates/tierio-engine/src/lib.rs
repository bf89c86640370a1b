//! tierio Engine
//!
//! Presents a set of heterogeneous backends as one block device and keeps
//! the most accessed sectors on the fastest backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Client      │  read / write / discard by byte offset
//! └────────┬────────┘
//!          │ Engine (handle, command queue)
//! ┌────────▼────────┐
//! │  Engine worker  │
//! │  - IndexTable   │  logical sector → (backend, physical sector)
//! │  - FreeSlots    │
//! │  - Optimizer    │  sort / assign / swap while idle
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┬─────────────────┐
//! │  LocalBackend   │  RemoteBackend  │  file / device  |  plugin over TCP
//! └─────────────────┴─────────────────┘
//! ```
//!
//! Every backend carries a replicated header: a record describing the set
//! followed by the index. Any backend of a set can restore the index after
//! a restart.

pub mod engine;
pub mod io;
pub mod membership;
pub mod sector;
pub mod state;
pub mod swap;
pub mod tiering;

pub use engine::{
    BackendStatus, Command, DEFAULT_OPTIMIZE_STEPS, Engine, EngineStats, SectorInfo,
};
pub use membership::BackendDescriptor;
pub use sector::{SectorMapper, SectorRange};
pub use state::EngineCore;
pub use swap::SwapStage;
pub use tiering::{
    Assignment, Move, SortProgress, SortedView, TieringOptimizer, TieringProgress, TieringState,
    assign, plan_move,
};
