//! TCP endpoint plugins connect to
//!
//! Each connection gets a reader loop (REGISTER / UNREGISTER / FINISHED) and a
//! writer task draining the connection's outbound queue. Requests reach the
//! writer through the sender stored with the plugin's registration.

use crate::client::RpcClient;
use crate::protocol::{Message, read_message, write_message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::{Error, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct PluginListener {
    client: Arc<RpcClient>,
    max_frame: usize,
    next_peer: AtomicU64,
}

impl PluginListener {
    #[must_use]
    pub fn new(client: Arc<RpcClient>, max_frame: usize) -> Self {
        Self {
            client,
            max_frame,
            next_peer: AtomicU64::new(1),
        }
    }

    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Configuration(format!("failed to bind plugin listener {addr}: {e}")))
    }

    /// Accept plugin connections until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("plugin listener on {addr}"),
            Err(e) => warn!("plugin listener address unknown: {e}"),
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer).await {
                            warn!("plugin connection {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("plugin accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        stream.set_nodelay(true)?;
        debug!("plugin connection {peer} accepted as {peer_id}");

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!("plugin connection {peer}: write failed: {e}");
                    break;
                }
            }
        });

        let result = loop {
            let message = match read_message(&mut reader, self.max_frame).await {
                Ok(Some(message)) => message,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match message {
                Message::Register { name } => self.client.register(&name, peer_id, tx.clone()),
                Message::Unregister { name } => {
                    self.client.unregister(&name, peer_id);
                }
                Message::Finished {
                    seq,
                    status,
                    length,
                    data,
                } => self.client.on_response(seq, status, length, data),
                Message::Read { seq, .. } | Message::Write { seq, .. } | Message::Size { seq } => {
                    warn!("plugin connection {peer}: unexpected request {seq} from plugin");
                }
            }
        };

        self.client.disconnect(peer_id);
        drop(tx);
        writer_task.abort();
        info!("plugin connection {peer} closed");
        result
    }
}
