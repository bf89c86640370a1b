//! Engine handle and worker
//!
//! [`Engine`] is a cheap, cloneable handle. Every call becomes a
//! [`Command`] on a bounded queue; a single worker task owns the
//! [`EngineCore`] and executes the commands in arrival order. When the queue
//! has been empty for the configured idle delay the worker runs the tiering
//! optimizer one step at a time, checking the queue between steps.

use crate::membership::BackendDescriptor;
use crate::state::EngineCore;
use crate::swap::SwapStage;
use crate::tiering::{TieringProgress, TieringState};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tierio_common::{BackendId, BackendKind, Config, Error, Result, SectorIndexEntry};
use tierio_plugin::RpcClient;
use tierio_storage::PerformanceRecord;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Steps an `optimize` call runs at most when none is given
pub const DEFAULT_OPTIMIZE_STEPS: usize = 1_000_000;

/// Status of one backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: BackendId,
    pub name: String,
    pub kind: BackendKind,
    pub ready: bool,
    pub capacity_sectors: u64,
    pub used_sectors: u64,
    pub free_sectors: u64,
    /// Lower is faster
    pub rank_score: u64,
    pub performance: PerformanceRecord,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Index entry of one logical sector and its place in the access ranking
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SectorInfo {
    pub logical: u64,
    pub entry: SectorIndexEntry,
    /// Position in the optimizer's hottest-first view, once it built one
    pub sorted_position: Option<usize>,
}

/// Engine-wide status
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub blocksize: u32,
    pub logical_sectors: u64,
    pub cache_sectors: u64,
    pub header_sectors: u64,
    pub size_bytes: u64,
    pub assembled: bool,
    pub tiering: TieringState,
    pub backends: Vec<BackendStatus>,
}

/// Work item for the engine worker
pub enum Command {
    Read {
        offset: u64,
        length: usize,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Write {
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Discard {
        offset: u64,
        length: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    AddBackend {
        descriptor: BackendDescriptor,
        reply: oneshot::Sender<Result<BackendId>>,
    },
    RemoveBackend {
        id: BackendId,
        reply: oneshot::Sender<Result<()>>,
    },
    Swap {
        first: u64,
        second: u64,
        stop_after: SwapStage,
        reply: oneshot::Sender<Result<SwapStage>>,
    },
    Optimize {
        max_steps: usize,
        reply: oneshot::Sender<Result<u64>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    SectorInfo {
        logical: u64,
        reply: oneshot::Sender<Result<SectorInfo>>,
    },
    AllSectorInfo {
        reply: oneshot::Sender<Vec<SectorIndexEntry>>,
    },
    ClearAccessCounts {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What the worker does next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Work {
    /// Wait for a command; optimize after the idle delay
    NextPrimary,
    /// The optimizer has more to do as soon as the queue is empty
    SecondaryToDo,
    /// Nothing to optimize until the next command
    SecondaryFinished,
}

enum Wake {
    Command(Option<Command>),
    Idle,
}

/// Handle to a running engine
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::Sender<Command>,
    blocksize: u32,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Engine {
    /// Spawn the worker; `rpc` is required for remote backends
    pub fn start(config: &Config, rpc: Option<Arc<RpcClient>>) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.engine.queue_depth.max(1));
        let core = EngineCore::new(config, rpc);
        let worker = tokio::spawn(run(core, rx));
        info!(
            "engine started: blocksize {}, tiering {}",
            config.engine.blocksize,
            if config.tiering.enabled { "on" } else { "off" }
        );
        Ok(Self {
            tx,
            blocksize: config.engine.blocksize,
            worker: Arc::new(Mutex::new(Some(worker))),
        })
    }

    pub const fn blocksize(&self) -> u32 {
        self.blocksize
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Read `length` bytes at byte `offset`
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes> {
        self.call(|reply| Command::Read {
            offset,
            length,
            reply,
        })
        .await?
    }

    /// Write `data` at byte `offset`
    pub async fn write(&self, offset: u64, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.call(|reply| Command::Write {
            offset,
            data,
            reply,
        })
        .await?
    }

    /// Read `count` whole sectors starting at logical sector `first`
    pub async fn read_sectors(&self, first: u64, count: u64) -> Result<Bytes> {
        let (offset, length) = self.sector_span(first, count)?;
        self.read(offset, length).await
    }

    /// Write whole sectors starting at logical sector `first`
    pub async fn write_sectors(&self, first: u64, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if data.len() % self.blocksize as usize != 0 {
            return Err(Error::invalid_argument(format!(
                "{} bytes is not a whole number of {} byte sectors",
                data.len(),
                self.blocksize
            )));
        }
        let (offset, _) = self.sector_span(first, 0)?;
        self.write(offset, data).await
    }

    fn sector_span(&self, first: u64, count: u64) -> Result<(u64, usize)> {
        let blocksize = u64::from(self.blocksize);
        let length = count
            .checked_mul(blocksize)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| Error::invalid_argument(format!("{count} sectors is too large")))?;
        let offset = first
            .checked_mul(blocksize)
            .ok_or_else(|| Error::invalid_argument(format!("sector {first} is too large")))?;
        Ok((offset, length))
    }

    /// Release the sectors completely covered by the byte range
    pub async fn discard(&self, offset: u64, length: u64) -> Result<()> {
        self.call(|reply| Command::Discard {
            offset,
            length,
            reply,
        })
        .await?
    }

    pub async fn flush(&self) -> Result<()> {
        self.call(|reply| Command::Flush { reply }).await?
    }

    pub async fn add_backend(&self, descriptor: BackendDescriptor) -> Result<BackendId> {
        self.call(|reply| Command::AddBackend { descriptor, reply })
            .await?
    }

    pub async fn remove_backend(&self, id: BackendId) -> Result<()> {
        self.call(|reply| Command::RemoveBackend { id, reply })
            .await?
    }

    /// Exchange the physical locations of two logical sectors
    pub async fn swap(&self, first: u64, second: u64) -> Result<()> {
        self.swap_until(first, second, SwapStage::Complete)
            .await
            .map(|_| ())
    }

    /// Run a swap only up to `stop_after`, as if the process stopped there
    #[doc(hidden)]
    pub async fn swap_until(
        &self,
        first: u64,
        second: u64,
        stop_after: SwapStage,
    ) -> Result<SwapStage> {
        self.call(|reply| Command::Swap {
            first,
            second,
            stop_after,
            reply,
        })
        .await?
    }

    /// Run the tiering optimizer to completion now; returns the moves made
    pub async fn optimize(&self, max_steps: usize) -> Result<u64> {
        self.call(|reply| Command::Optimize { max_steps, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Index entry and access rank of a logical sector
    pub async fn sector_info(&self, logical: u64) -> Result<SectorInfo> {
        self.call(|reply| Command::SectorInfo { logical, reply })
            .await?
    }

    /// Index entries of every logical sector
    pub async fn all_sector_info(&self) -> Result<Vec<SectorIndexEntry>> {
        self.call(|reply| Command::AllSectorInfo { reply }).await
    }

    /// Reset every used sector's access count to one
    pub async fn clear_access_counts(&self) -> Result<()> {
        self.call(|reply| Command::ClearAccessCounts { reply })
            .await
    }

    /// Persist everything and stop the worker
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.call(|reply| Command::Shutdown { reply }).await?;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| Error::internal(format!("engine worker failed: {e}")))?;
        }
        result
    }
}

async fn run(mut core: EngineCore, mut rx: mpsc::Receiver<Command>) {
    let mut work = Work::SecondaryFinished;

    loop {
        let tiering_allowed =
            core.tiering.enabled && core.is_assembled() && !core.backends.is_empty();
        let wake = match work {
            Work::NextPrimary | Work::SecondaryToDo if tiering_allowed => {
                let delay = if work == Work::SecondaryToDo {
                    Duration::ZERO
                } else {
                    core.tiering.idle_delay()
                };
                tokio::select! {
                    biased;
                    command = rx.recv() => Wake::Command(command),
                    () = tokio::time::sleep(delay) => Wake::Idle,
                }
            }
            _ => Wake::Command(rx.recv().await),
        };

        match wake {
            Wake::Command(None) => break,
            Wake::Command(Some(Command::Shutdown { reply })) => {
                let _ = reply.send(core.shutdown().await);
                info!("engine stopped");
                return;
            }
            Wake::Command(Some(command)) => {
                core.handle(command).await;
                work = Work::NextPrimary;
            }
            Wake::Idle => {
                let pending = || !rx.is_empty();
                work = match core.tiering_step(&pending).await {
                    Ok(TieringProgress::More) => Work::SecondaryToDo,
                    Ok(TieringProgress::Finished) => Work::SecondaryFinished,
                    Err(e) => {
                        // start a fresh pass after the next idle delay
                        error!("tiering step failed: {e}");
                        core.optimizer.invalidate();
                        Work::NextPrimary
                    }
                };
            }
        }
    }

    debug!("all engine handles dropped");
    if let Err(e) = core.shutdown().await {
        warn!("engine shutdown incomplete: {e}");
    }
}

impl EngineCore {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Read {
                offset,
                length,
                reply,
            } => {
                let _ = reply.send(self.read(offset, length).await);
            }
            Command::Write {
                offset,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(offset, &data).await);
            }
            Command::Discard {
                offset,
                length,
                reply,
            } => {
                let _ = reply.send(self.discard(offset, length).await);
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            Command::AddBackend { descriptor, reply } => {
                let _ = reply.send(self.add_backend(descriptor).await);
            }
            Command::RemoveBackend { id, reply } => {
                let _ = reply.send(self.remove_backend(id).await);
            }
            Command::Swap {
                first,
                second,
                stop_after,
                reply,
            } => {
                let _ = reply.send(self.swap_until(first, second, stop_after).await);
            }
            Command::Optimize { max_steps, reply } => {
                let result = if self.is_assembled() {
                    self.optimize(max_steps).await
                } else {
                    Err(Error::NotReady(
                        "the backend set is still being reassembled".into(),
                    ))
                };
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::SectorInfo { logical, reply } => {
                let info = self.table.lookup(logical).map(|entry| SectorInfo {
                    logical,
                    entry,
                    sorted_position: self.optimizer.view().position(logical),
                });
                let _ = reply.send(info);
            }
            Command::AllSectorInfo { reply } => {
                let _ = reply.send(self.table.entries());
            }
            Command::ClearAccessCounts { reply } => {
                self.table.clear_access_counts();
                if self.config.persist_access_counts {
                    self.table.write_all_headers(&self.backends).await;
                }
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.shutdown().await);
            }
        }
    }

    fn stats(&self) -> EngineStats {
        let backends = self
            .backends
            .iter()
            .map(|backend| {
                let stats = backend.stats();
                BackendStatus {
                    id: backend.id(),
                    name: backend.name().to_string(),
                    kind: backend.kind(),
                    ready: backend.is_ready(),
                    capacity_sectors: backend.capacity_sectors(),
                    used_sectors: self.table.count_on(backend.id()),
                    free_sectors: self.free.free_count(backend.id()),
                    rank_score: backend.rank_score(),
                    performance: backend.performance(),
                    reads: stats.reads.load(Ordering::Relaxed),
                    writes: stats.writes.load(Ordering::Relaxed),
                    bytes_read: stats.bytes_read.load(Ordering::Relaxed),
                    bytes_written: stats.bytes_written.load(Ordering::Relaxed),
                }
            })
            .collect();

        EngineStats {
            blocksize: self.blocksize(),
            logical_sectors: self.table.logical_sector_count(),
            cache_sectors: self.table.cache_sector_count(),
            header_sectors: self.table.header_sector_count(),
            size_bytes: self.logical_bytes(),
            assembled: self.is_assembled(),
            tiering: self.optimizer.state(),
            backends,
        }
    }

    /// Write every header with the current index and performance snapshots
    ///
    /// A set that is not fully assembled keeps the headers it was loaded
    /// with, so the missing members are still expected next time.
    async fn shutdown(&self) -> Result<()> {
        if self.is_assembled() {
            self.table.write_all_headers(&self.backends).await;
        }
        self.flush().await
    }
}
