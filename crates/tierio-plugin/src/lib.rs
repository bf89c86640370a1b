//! tierio plugin RPC
//!
//! Remote backends live in separate processes ("plugins") that connect to
//! the engine over TCP. This crate contains both ends:
//! - the wire protocol (`protocol`)
//! - the engine side: request multiplexer, listener and the `RemoteBackend`
//! - the plugin side: `PluginHost` serving a `PluginStore`

pub mod client;
pub mod host;
pub mod listener;
pub mod protocol;
pub mod remote;

pub use client::{Callback, Completion, Operation, RequestKind, RpcClient};
pub use host::{FileStore, MemoryStore, PluginHandle, PluginHost, PluginStore};
pub use listener::PluginListener;
pub use protocol::Message;
pub use remote::RemoteBackend;
