//! Request/response multiplexer for remote backends
//!
//! Every request gets a sequence number and a pending-table entry holding its
//! completion callback. The entry leaves the table exactly once: on the
//! matching FINISHED, on the timeout sweep, or right away when the request
//! cannot be sent. Each callback therefore fires exactly once.

use crate::protocol::Message;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tierio_common::config::RpcConfig;
use tierio_common::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Completion callback of an asynchronous request
pub type Callback = Box<dyn FnOnce(Result<Completion>) + Send>;

/// Successful answer to a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Bytes transferred (for SIZE: the store size)
    pub length: u64,
    /// Data of a READ, truncated to the requested length
    pub data: Option<Bytes>,
}

/// Kind of a pending request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Size,
}

/// A request as issued by a remote backend
#[derive(Clone, Debug)]
pub enum Operation {
    Read { offset: u64, length: u64 },
    Write { offset: u64, data: Bytes },
    Size,
}

impl Operation {
    const fn kind(&self) -> RequestKind {
        match self {
            Self::Read { .. } => RequestKind::Read,
            Self::Write { .. } => RequestKind::Write,
            Self::Size => RequestKind::Size,
        }
    }

    fn into_message(self, seq: u32) -> Message {
        match self {
            Self::Read { offset, length } => Message::Read {
                seq,
                offset,
                length,
            },
            Self::Write { offset, data } => Message::Write { seq, offset, data },
            Self::Size => Message::Size { seq },
        }
    }
}

/// In-flight request
struct PendingRequest {
    sequence_id: u32,
    kind: RequestKind,
    backend: String,
    issued_at: Instant,
    retry_count: u32,
    /// Largest amount of data the caller accepts
    capacity: u64,
    callback: Callback,
}

/// Connection of a registered plugin
struct Peer {
    peer_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Multiplexes requests of all remote backends over their plugin connections
pub struct RpcClient {
    next_sequence: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    peers: RwLock<HashMap<String, Peer>>,
    timeout: Duration,
    max_retries: u32,
}

impl RpcClient {
    #[must_use]
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            next_sequence: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            timeout,
            max_retries,
        }
    }

    #[must_use]
    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.timeout(), config.max_retries)
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    // ── Control plane ────────────────────────────────────────────────────────

    /// Bind a backend name to a plugin connection; the last registration wins
    pub fn register(&self, name: &str, peer_id: u64, tx: mpsc::UnboundedSender<Message>) {
        let previous = self
            .peers
            .write()
            .insert(name.to_string(), Peer { peer_id, tx });
        match previous {
            Some(old) if old.peer_id != peer_id => {
                info!("plugin '{name}' re-registered from connection {peer_id}");
            }
            Some(_) => debug!("plugin '{name}' registered again"),
            None => info!("plugin '{name}' registered from connection {peer_id}"),
        }
    }

    /// Drop a registration if it still belongs to `peer_id`
    pub fn unregister(&self, name: &str, peer_id: u64) -> bool {
        let mut peers = self.peers.write();
        if peers.get(name).is_some_and(|p| p.peer_id == peer_id) {
            peers.remove(name);
            drop(peers);
            info!("plugin '{name}' unregistered");
            self.fail_backend(name);
            return true;
        }
        false
    }

    /// Drop every registration of a closed connection
    pub fn disconnect(&self, peer_id: u64) {
        let names: Vec<String> = self
            .peers
            .read()
            .iter()
            .filter(|(_, p)| p.peer_id == peer_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.unregister(&name, peer_id);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.peers.read().contains_key(name)
    }

    /// Wait until `name` is registered or `deadline` has passed
    pub async fn wait_registered(&self, name: &str, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        while !self.is_registered(name) {
            if started.elapsed() >= deadline {
                return Err(Error::unreachable(format!(
                    "{name} (not registered after {deadline:?})"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Names of all registered plugins
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Data plane ───────────────────────────────────────────────────────────

    /// Issue a request; `callback` runs exactly once
    ///
    /// If the backend is not registered or its connection is gone, the
    /// callback runs with `BackendUnreachable` before this returns and no
    /// pending entry remains.
    pub fn send_async(&self, backend: &str, op: Operation, callback: Callback) {
        self.send_attempt(backend, op, 0, callback);
    }

    fn send_attempt(&self, backend: &str, op: Operation, retry_count: u32, callback: Callback) {
        let kind = op.kind();
        let capacity = match &op {
            Operation::Read { length, .. } => *length,
            Operation::Write { data, .. } => data.len() as u64,
            Operation::Size => 0,
        };

        let seq = {
            let mut pending = self.pending.lock();
            // after a wrap, skip numbers of requests still in flight
            let mut seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            while pending.contains_key(&seq) {
                seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            }
            pending.insert(
                seq,
                PendingRequest {
                    sequence_id: seq,
                    kind,
                    backend: backend.to_string(),
                    issued_at: Instant::now(),
                    retry_count,
                    capacity,
                    callback,
                },
            );
            seq
        };

        let sent = self
            .peers
            .read()
            .get(backend)
            .is_some_and(|peer| peer.tx.send(op.into_message(seq)).is_ok());

        if !sent {
            let request = self.pending.lock().remove(&seq);
            if let Some(request) = request {
                debug!("request {seq} to '{backend}' not sent: backend unreachable");
                (request.callback)(Err(Error::unreachable(backend)));
            }
        }
    }

    /// Match a FINISHED message to its pending request
    pub fn on_response(&self, seq: u32, status: i32, length: u64, data: Option<Bytes>) {
        let request = self.pending.lock().remove(&seq);
        let Some(request) = request else {
            warn!("dropping response for unknown request {seq}");
            return;
        };

        let result = if status == 0 {
            let data = match (request.kind, data) {
                (RequestKind::Read, Some(mut data)) => {
                    let keep = length.min(request.capacity).min(data.len() as u64);
                    data.truncate(usize::try_from(keep).unwrap_or(usize::MAX));
                    Some(data)
                }
                _ => None,
            };
            Ok(Completion { length, data })
        } else {
            Err(Error::storage(format!(
                "plugin '{}' failed request {} ({:?}) with status {status}",
                request.backend, request.sequence_id, request.kind
            )))
        };

        (request.callback)(result);
    }

    /// Fail every request older than the timeout; returns how many
    pub fn reap_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let stale: Vec<u32> = pending
                .values()
                .filter(|r| now.saturating_duration_since(r.issued_at) >= self.timeout)
                .map(|r| r.sequence_id)
                .collect();
            stale.iter().filter_map(|seq| pending.remove(seq)).collect()
        };

        let count = expired.len();
        for request in expired {
            warn!(
                "request {} ({:?}) to '{}' timed out (attempt {})",
                request.sequence_id,
                request.kind,
                request.backend,
                request.retry_count + 1
            );
            (request.callback)(Err(Error::Timeout));
        }
        count
    }

    /// Fail the pending requests of a backend whose plugin went away
    fn fail_backend(&self, backend: &str) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let seqs: Vec<u32> = pending
                .values()
                .filter(|r| r.backend == backend)
                .map(|r| r.sequence_id)
                .collect();
            seqs.iter().filter_map(|seq| pending.remove(seq)).collect()
        };
        for request in failed {
            (request.callback)(Err(Error::unreachable(backend)));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run [`Self::reap_expired`] every `interval` until the client is dropped
    pub fn spawn_timeout_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    debug!("rpc client dropped, stopping timeout sweeper");
                    break;
                };
                client.reap_expired(Instant::now());
            }
        })
    }

    /// Issue a request and wait for its completion
    ///
    /// Timed out requests are re-issued up to `max_retries` times. Must not
    /// be awaited on the task that delivers responses.
    pub async fn send_sync(&self, backend: &str, op: Operation) -> Result<Completion> {
        let mut retry_count = 0;
        loop {
            let (tx, rx) = oneshot::channel();
            self.send_attempt(
                backend,
                op.clone(),
                retry_count,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );

            let result = rx
                .await
                .map_err(|_| Error::internal("completion callback dropped"))?;
            match result {
                Err(Error::Timeout) if retry_count < self.max_retries => {
                    retry_count += 1;
                    warn!("retrying request to '{backend}' (retry {retry_count})");
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn capture() -> (Callback, Arc<Mutex<Vec<Result<Completion>>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (
            Box::new(move |r| sink.lock().push(r)),
            results,
        )
    }

    #[test]
    fn test_send_to_unregistered_fails_immediately() {
        let client = RpcClient::new(Duration::from_secs(30), 1);
        let (callback, results) = capture();
        client.send_async("nobody", Operation::Size, callback);

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::BackendUnreachable(_))));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_response_completes_once() {
        let client = RpcClient::new(Duration::from_secs(30), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);

        let (callback, results) = capture();
        client.send_async(
            "store",
            Operation::Read {
                offset: 0,
                length: 4,
            },
            callback,
        );
        let Some(Message::Read { seq, length, .. }) = rx.try_recv().ok() else {
            panic!("no READ sent");
        };
        assert_eq!(length, 4);
        assert_eq!(client.pending_count(), 1);

        // longer data than requested is cut to the caller's capacity
        client.on_response(seq, 0, 6, Some(Bytes::from_static(b"abcdef")));
        client.on_response(seq, 0, 6, Some(Bytes::from_static(b"abcdef")));

        let results = results.lock();
        assert_eq!(results.len(), 1);
        let completion = results[0].as_ref().unwrap();
        assert_eq!(completion.data.as_deref(), Some(&b"abcd"[..]));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_sequence_wrap_skips_requests_in_flight() {
        let client = RpcClient::new(Duration::from_secs(30), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);

        let (first, first_results) = capture();
        client.send_async("store", Operation::Size, first);
        let old = rx.try_recv().unwrap().seq().unwrap();

        // the counter comes around to the number still in flight
        client.next_sequence.store(old, Ordering::Relaxed);
        let (second, second_results) = capture();
        client.send_async("store", Operation::Size, second);
        let new = rx.try_recv().unwrap().seq().unwrap();
        assert_ne!(new, old);
        assert_eq!(client.pending_count(), 2);

        client.on_response(old, 0, 100, None);
        client.on_response(new, 0, 200, None);
        assert_eq!(first_results.lock()[0].as_ref().unwrap().length, 100);
        assert_eq!(second_results.lock()[0].as_ref().unwrap().length, 200);
    }

    #[test]
    fn test_error_status() {
        let client = RpcClient::new(Duration::from_secs(30), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);

        let (callback, results) = capture();
        client.send_async(
            "store",
            Operation::Write {
                offset: 0,
                data: Bytes::from_static(b"x"),
            },
            callback,
        );
        let seq = rx.try_recv().unwrap().seq().unwrap();
        client.on_response(seq, -5, 0, None);
        assert!(matches!(results.lock()[0], Err(Error::Storage(_))));
    }

    #[test]
    fn test_timeout_reaps_each_request_once() {
        let client = RpcClient::new(Duration::from_millis(10), 0);
        let (tx, _rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            client.send_async(
                "store",
                Operation::Size,
                Box::new(move |r| {
                    assert!(matches!(r, Err(Error::Timeout)));
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        assert_eq!(client.reap_expired(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(20);
        assert_eq!(client.reap_expired(later), 3);
        assert_eq!(client.reap_expired(later), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_last_registration_wins() {
        let client = RpcClient::new(Duration::from_secs(30), 1);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        client.register("store", 1, tx1);
        client.register("store", 2, tx2);

        // stale connection cannot remove the newer registration
        assert!(!client.unregister("store", 1));
        client.disconnect(1);
        assert!(client.is_registered("store"));

        client.send_async("store", Operation::Size, Box::new(|_| {}));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());

        // losing the connection fails what is still in flight
        let (callback, results) = capture();
        client.send_async("store", Operation::Size, callback);
        client.disconnect(2);
        assert!(!client.is_registered("store"));
        assert!(matches!(
            results.lock()[0],
            Err(Error::BackendUnreachable(_))
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_sync_retries_timeouts() {
        let client = Arc::new(RpcClient::new(Duration::from_millis(20), 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);
        let sweeper = client.spawn_timeout_sweeper(Duration::from_millis(5));

        // ignore the first attempt, answer the retry
        let responder = {
            let client = client.clone();
            tokio::spawn(async move {
                let first = rx.recv().await.unwrap().seq().unwrap();
                let second = rx.recv().await.unwrap().seq().unwrap();
                assert_ne!(first, second);
                client.on_response(second, 0, 8192, None);
            })
        };

        let completion = client.send_sync("store", Operation::Size).await.unwrap();
        assert_eq!(completion.length, 8192);
        responder.await.unwrap();
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_send_sync_gives_up_after_retries() {
        let client = Arc::new(RpcClient::new(Duration::from_millis(10), 1));
        let (tx, _rx) = mpsc::unbounded_channel();
        client.register("store", 1, tx);
        let sweeper = client.spawn_timeout_sweeper(Duration::from_millis(5));

        let result = client.send_sync("store", Operation::Size).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(client.pending_count(), 0);
        sweeper.abort();
    }
}
