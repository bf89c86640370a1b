//! tierio Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures and the
//! core data types (sector index entries, backend identifiers) shared by
//! every tierio component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendConfig, Config, EngineConfig, LoggingConfig, RpcConfig, TieringConfig};
pub use error::{Error, Result};
pub use types::*;
