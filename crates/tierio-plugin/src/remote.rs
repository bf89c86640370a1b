//! Backend served by a plugin over RPC

use crate::client::{Operation, RpcClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tierio_common::{BackendKind, Error, Result, SpaceOp};
use tierio_storage::Backend;

/// A remote store addressed by its plugin name
///
/// Ready while the plugin holds a registration. RPC timeouts reach the
/// engine as `BackendUnreachable`.
pub struct RemoteBackend {
    name: String,
    client: Arc<RpcClient>,
}

impl RemoteBackend {
    #[must_use]
    pub fn new(name: impl Into<String>, client: Arc<RpcClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    async fn call(&self, op: Operation) -> Result<crate::client::Completion> {
        self.client
            .send_sync(&self.name, op)
            .await
            .map_err(|e| match e {
                Error::Timeout => Error::unreachable(format!("{} (timeout)", self.name)),
                other => other,
            })
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn size_bytes(&self) -> Result<u64> {
        Ok(self.call(Operation::Size).await?.length)
    }

    async fn read(&self, pos: u64, len: usize) -> Result<Bytes> {
        let completion = self
            .call(Operation::Read {
                offset: pos,
                length: len as u64,
            })
            .await?;
        completion.data.ok_or_else(|| {
            Error::Protocol(format!("plugin '{}' answered a read without data", self.name))
        })
    }

    async fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        let completion = self
            .call(Operation::Write {
                offset: pos,
                data: Bytes::copy_from_slice(data),
            })
            .await?;
        if completion.length != data.len() as u64 {
            return Err(Error::storage(format!(
                "plugin '{}' wrote {} of {} bytes",
                self.name,
                completion.length,
                data.len()
            )));
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // no FLUSH message; plugins complete writes before answering
        Ok(())
    }

    async fn allocate_or_discard(&self, _pos: u64, _len: u64, _op: SpaceOp) -> Result<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.client.is_registered(&self.name)
    }
}
