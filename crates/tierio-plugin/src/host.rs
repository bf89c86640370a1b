//! Plugin side of the protocol
//!
//! A plugin connects to the engine's listener, registers a name and then
//! serves READ, WRITE and SIZE against a [`PluginStore`] until it is stopped,
//! at which point it unregisters.

use crate::protocol::{DEFAULT_MAX_FRAME, Message, read_message, write_message};
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tierio_common::{Error, Result};
use tierio_storage::RawFile;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Storage a plugin exposes
pub trait PluginStore: Send + Sync {
    /// Size in bytes
    fn size(&self) -> u64;

    fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
}

/// Store backed by a file or block device
pub struct FileStore {
    file: RawFile,
}

impl FileStore {
    /// Open `path`, creating it with `create_size` bytes if given
    pub fn open(path: impl AsRef<Path>, create_size: Option<u64>) -> Result<Self> {
        let file = match create_size {
            Some(size) => RawFile::create(path, size, false)?,
            None => RawFile::open(path, false, false)?,
        };
        Ok(Self { file })
    }
}

impl PluginStore for FileStore {
    fn size(&self) -> u64 {
        self.file.size()
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; len];
        self.file.read_at(offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_at(offset, data)
    }
}

/// Store held in memory
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size]),
        }
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let size = self.data.read().len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(Error::storage(format!(
                "range {offset}+{len} exceeds memory store of {size} bytes"
            ))),
        }
    }
}

impl PluginStore for MemoryStore {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let range = self.range(offset, len)?;
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len())?;
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }
}

/// Serves one [`PluginStore`] to an engine
pub struct PluginHost {
    name: String,
    store: Arc<dyn PluginStore>,
    max_frame: usize,
}

/// A connected plugin
pub struct PluginHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl PluginHandle {
    /// Unregister and close the connection
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| Error::internal(format!("plugin task failed: {e}")))?
    }

    /// Serve until the engine closes the connection
    pub async fn wait(self) -> Result<()> {
        let _keep = self.shutdown;
        self.task
            .await
            .map_err(|e| Error::internal(format!("plugin task failed: {e}")))?
    }
}

impl PluginHost {
    pub fn new(name: impl Into<String>, store: Arc<dyn PluginStore>) -> Self {
        Self {
            name: name.into(),
            store,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    #[must_use]
    pub const fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Connect to the engine at `addr`, register, and serve in the background
    pub async fn connect(self, addr: &str) -> Result<PluginHandle> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::unreachable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        write_message(
            &mut writer,
            &Message::Register {
                name: self.name.clone(),
            },
        )
        .await?;
        info!(
            "plugin '{}' registered with {addr} ({} bytes)",
            self.name,
            self.store.size()
        );

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        write_message(&mut writer, &Message::Unregister { name: self.name.clone() }).await?;
                        info!("plugin '{}' unregistered", self.name);
                        return Ok(());
                    }
                    message = read_message(&mut reader, self.max_frame) => {
                        match message? {
                            Some(message) => self.serve(&mut writer, message).await?,
                            None => {
                                info!("engine closed the connection of plugin '{}'", self.name);
                                return Ok(());
                            }
                        }
                    }
                }
            }
        });

        Ok(PluginHandle { shutdown, task })
    }

    async fn serve(&self, writer: &mut OwnedWriteHalf, message: Message) -> Result<()> {
        let reply = match message {
            Message::Read {
                seq,
                offset,
                length,
            } => {
                let len = usize::try_from(length).unwrap_or(usize::MAX);
                debug!("plugin '{}': READ {seq} {offset}+{length}", self.name);
                match self.store.read(offset, len) {
                    Ok(data) => finished(seq, data.len() as u64, Some(data)),
                    Err(e) => failed(seq, &e),
                }
            }
            Message::Write { seq, offset, data } => {
                debug!("plugin '{}': WRITE {seq} {offset}+{}", self.name, data.len());
                match self.store.write(offset, &data) {
                    Ok(()) => finished(seq, data.len() as u64, None),
                    Err(e) => failed(seq, &e),
                }
            }
            Message::Size { seq } => finished(seq, self.store.size(), None),
            Message::Register { .. } | Message::Unregister { .. } | Message::Finished { .. } => {
                warn!("plugin '{}': ignoring unexpected message", self.name);
                return Ok(());
            }
        };
        write_message(writer, &reply).await
    }
}

const fn finished(seq: u32, length: u64, data: Option<Bytes>) -> Message {
    Message::Finished {
        seq,
        status: 0,
        length,
        data,
    }
}

fn failed(seq: u32, error: &Error) -> Message {
    warn!("plugin request {seq} failed: {error}");
    Message::Finished {
        seq,
        status: -error.errno(),
        length: 0,
        data: None,
    }
}
