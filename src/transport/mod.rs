//! Streaming transport.
//!
//! A transport is a named, multiplexed channel over which whole objects are streamed from one
//! node to another. Receivers register a `RecvHandler` under a transport name via
//! `Transport::open`, which yields a `DataMover` used for sending on the same name.
//!
//! Senders hold one persistent stream per destination node. Streams connect lazily on first
//! send, are torn down by the `Collector` once idle, and transparently reconnect on the next
//! send. The number of in-flight objects per `DataMover` is bounded by the configured burst,
//! beyond which `DataMover::send` blocks.

mod collector;
mod server;
mod stream;
pub mod wire;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};

use crate::cluster::{NodeId, NodeInfo};
use crate::config::Config;
use crate::error::AppError;
use crate::models::ObjHeader;

pub use collector::{Collector, CollectorHandle};
pub use server::TransportServer;
use stream::{StreamMsg, StreamWorker};

const METRIC_OBJS_SENT: &str = "hadron_xact_transport_objects_sent";
const METRIC_BYTES_SENT: &str = "hadron_xact_transport_bytes_sent";
const METRIC_OBJS_RECV: &str = "hadron_xact_transport_objects_received";
const METRIC_BYTES_RECV: &str = "hadron_xact_transport_bytes_received";
const METRIC_SEND_ERRORS: &str = "hadron_xact_transport_send_errors";
const METRIC_ORPHANS: &str = "hadron_xact_transport_orphaned_objects";

/// The max number of orphaned headers retained per transport name; the oldest are dropped first.
const MAX_ORPHANS_PER_NAME: usize = 1024;

/// The body of an object to be sent.
pub type SendBody = Box<dyn AsyncRead + Send + Unpin>;

/// A callback invoked exactly once when a send completes, successfully or not.
pub type SendCallback = Box<dyn FnOnce(&ObjHeader, Option<&anyhow::Error>) + Send>;

/// A type capable of handling objects received on a transport.
#[async_trait]
pub trait RecvHandler: Send + Sync + 'static {
    /// Handle an inbound object.
    ///
    /// The body yields exactly `hdr.size()` bytes; any bytes left unread are discarded once this
    /// method returns. When `err` is set, the sender's stream has failed; `hdr` then carries only
    /// the sender's ID and the body is empty.
    async fn recv(&self, hdr: ObjHeader, body: &mut (dyn AsyncRead + Send + Unpin), err: Option<anyhow::Error>) -> Result<()>;
}

/// An object to be sent over a transport.
pub struct SendObj {
    /// The object's header; `attrs.size` must match the number of bytes the body yields.
    pub hdr: ObjHeader,
    /// The object's body, `None` for header-only objects.
    pub body: Option<SendBody>,
    /// The completion callback.
    pub callback: Option<SendCallback>,
}

impl SendObj {
    pub fn new(hdr: ObjHeader, body: Option<SendBody>) -> Self {
        Self { hdr, body, callback: None }
    }

    pub fn with_callback(mut self, callback: impl FnOnce(&ObjHeader, Option<&anyhow::Error>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Complete this send, firing its callback.
    pub(crate) fn complete(mut self, err: Option<&anyhow::Error>) {
        if err.is_some() {
            metrics::increment_counter!(METRIC_SEND_ERRORS);
        }
        if let Some(callback) = self.callback.take() {
            callback(&self.hdr, err);
        }
    }
}

/// The outcome of quiescing a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuiRes {
    /// No activity was observed for the full quiesce duration.
    Done,
    /// The external stop signal fired first.
    Aborted,
    /// Activity never settled within the max wait.
    Timeout,
}

/// Activity tracking shared by the sending & receiving sides of a transport.
pub(crate) struct Activity {
    base: Instant,
    /// Millis since `base` of the last observed activity.
    last: AtomicU64,
    /// The number of objects currently being sent or received.
    inflight: AtomicUsize,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            last: AtomicU64::new(0),
            inflight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub(crate) fn begin(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn end(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn last_active(&self) -> Instant {
        self.base + Duration::from_millis(self.last.load(Ordering::Acquire))
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Check if there has been no activity & nothing is in flight for at least `dur`.
    pub(crate) fn is_quiet_for(&self, dur: Duration) -> bool {
        self.inflight() == 0 && self.last_active().elapsed() >= dur
    }
}

/// A registered transport name along with its receive handler.
pub(crate) struct Endpoint {
    pub(crate) trname: String,
    /// The receive handler of the most recent opener.
    pub(crate) handler: ArcSwap<Arc<dyn RecvHandler>>,
    pub(crate) activity: Activity,
    refs: AtomicUsize,
}

/// The streaming transport of this node.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: Arc<Config>,
    local: NodeId,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    /// Headers of inbound objects which no handler claimed, by transport name.
    ///
    /// Always acquired after `endpoints` when both are held.
    orphans: Mutex<HashMap<String, VecDeque<(Instant, ObjHeader)>>>,
    collector: CollectorHandle,
}

impl Transport {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, local: NodeId, collector: CollectorHandle) -> Self {
        metrics::register_counter!(METRIC_OBJS_SENT, metrics::Unit::Count, "objects sent over transports");
        metrics::register_counter!(METRIC_BYTES_SENT, metrics::Unit::Bytes, "object bytes sent over transports");
        metrics::register_counter!(METRIC_OBJS_RECV, metrics::Unit::Count, "objects received over transports");
        metrics::register_counter!(METRIC_BYTES_RECV, metrics::Unit::Bytes, "object bytes received over transports");
        metrics::register_counter!(METRIC_SEND_ERRORS, metrics::Unit::Count, "failed transport sends");
        metrics::register_counter!(METRIC_ORPHANS, metrics::Unit::Count, "inbound objects no handler claimed");
        Self {
            inner: Arc::new(TransportInner {
                config,
                local,
                endpoints: RwLock::new(HashMap::new()),
                orphans: Mutex::new(HashMap::new()),
                collector,
            }),
        }
    }

    /// Open the named transport, registering the given handler for inbound objects.
    ///
    /// Opening an already open name shares the existing registration, and inbound objects are
    /// routed to the handler of the most recent opener.
    #[tracing::instrument(level = "debug", skip(self, handler))]
    pub async fn open(&self, trname: &str, handler: Arc<dyn RecvHandler>) -> DataMover {
        let mut endpoints = self.inner.endpoints.write().await;
        let endpoint = match endpoints.get(trname) {
            Some(endpoint) => {
                endpoint.handler.store(Arc::new(handler));
                endpoint.clone()
            }
            None => {
                let endpoint = Arc::new(Endpoint {
                    trname: trname.to_string(),
                    handler: ArcSwap::from_pointee(handler),
                    activity: Activity::new(),
                    refs: AtomicUsize::new(0),
                });
                endpoints.insert(trname.to_string(), endpoint.clone());
                endpoint
            }
        };
        let refs = endpoint.refs.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(trname, refs, "transport opened");
        DataMover {
            transport: self.clone(),
            endpoint,
            burst: Arc::new(Semaphore::new(self.inner.config.transport_burst)),
            streams: RwLock::new(HashMap::new()),
            closed: Arc::new(OnceLock::new()),
            unregistered: AtomicBool::new(false),
        }
    }

    /// Check if the given transport name is currently registered.
    pub async fn is_registered(&self, trname: &str) -> bool {
        self.inner.endpoints.read().await.contains_key(trname)
    }

    pub(crate) async fn endpoint(&self, trname: &str) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.read().await.get(trname).cloned()
    }

    /// Get the endpoint of the given name, recording the header as an orphan if there is none.
    ///
    /// The lookup & the record happen under the same registry lock, so an orphan recorded here
    /// is always visible to whoever registers the name afterwards.
    pub(crate) async fn endpoint_or_orphan(&self, trname: &str, hdr: &ObjHeader) -> Option<Arc<Endpoint>> {
        let endpoints = self.inner.endpoints.read().await;
        match endpoints.get(trname) {
            Some(endpoint) => Some(endpoint.clone()),
            None => {
                self.record_orphan(trname, hdr).await;
                None
            }
        }
    }

    /// Record the header of an inbound object which no handler claimed.
    ///
    /// Bodies are never retained, only enough for a later registrant to learn that it missed
    /// objects addressed to it.
    pub async fn record_orphan(&self, trname: &str, hdr: &ObjHeader) {
        let mut orphans = self.inner.orphans.lock().await;
        let queue = orphans.entry(trname.to_string()).or_default();
        if queue.len() >= MAX_ORPHANS_PER_NAME {
            queue.pop_front();
        }
        queue.push_back((Instant::now(), hdr.clone()));
        metrics::increment_counter!(METRIC_ORPHANS);
    }

    /// Take all orphans of the given transport name carrying the given opaque token.
    ///
    /// Orphans older than `max_age` are stale leftovers and are discarded.
    pub async fn take_orphans(&self, trname: &str, opaque: &[u8], max_age: Duration) -> Vec<ObjHeader> {
        let mut orphans = self.inner.orphans.lock().await;
        let queue = match orphans.get_mut(trname) {
            Some(queue) => queue,
            None => return vec![],
        };
        queue.retain(|(at, _)| at.elapsed() <= max_age);
        let mut taken = vec![];
        queue.retain(|(_, hdr)| {
            if hdr.opaque == opaque {
                taken.push(hdr.clone());
                false
            } else {
                true
            }
        });
        if queue.is_empty() {
            orphans.remove(trname);
        }
        taken
    }

    /// The number of orphans currently recorded under the given transport name.
    #[cfg(test)]
    pub(crate) async fn num_orphans(&self, trname: &str) -> usize {
        self.inner.orphans.lock().await.get(trname).map(|queue| queue.len()).unwrap_or(0)
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.inner.local
    }

    async fn release(&self, endpoint: &Arc<Endpoint>) {
        let mut endpoints = self.inner.endpoints.write().await;
        if endpoint.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Only drop the registration if it is still the one this handle was opened on.
            if endpoints.get(&endpoint.trname).map(|ep| Arc::ptr_eq(ep, endpoint)).unwrap_or(false) {
                endpoints.remove(&endpoint.trname);
                tracing::debug!(trname = %endpoint.trname, "transport unregistered");
            }
        }
    }
}

/// A handle for sending objects over a named transport.
pub struct DataMover {
    transport: Transport,
    endpoint: Arc<Endpoint>,
    /// Permits bounding the number of in-flight objects.
    burst: Arc<Semaphore>,
    /// The stream to each destination node.
    streams: RwLock<HashMap<NodeId, mpsc::UnboundedSender<StreamMsg>>>,
    /// The error with which this handle was closed.
    closed: Arc<OnceLock<String>>,
    unregistered: AtomicBool,
}

impl DataMover {
    /// The name of this transport.
    pub fn trname(&self) -> &str {
        &self.endpoint.trname
    }

    /// Send an object to the given node.
    ///
    /// Blocks while the burst capacity is exhausted. The `abort` future cancels the wait for
    /// capacity. Once queued, the object's callback fires when the send completes; if this call
    /// returns an error the callback has already fired with that error.
    pub async fn send(&self, mut obj: SendObj, dest: &NodeInfo, abort: impl Future<Output = ()>) -> Result<()> {
        if let Some(reason) = self.closed.get() {
            let err = anyhow::Error::from(AppError::Transport(format!("transport {} is closed: {}", self.trname(), reason)));
            obj.complete(Some(&err));
            return Err(err);
        }
        obj.hdr.sender = self.transport.local_node_id().to_string();
        let frame = match wire::encode_header(&obj.hdr, self.transport.config().transport_max_header_size) {
            Ok(frame) => frame,
            Err(err) => {
                obj.complete(Some(&err));
                return Err(err);
            }
        };

        let permit = tokio::select! {
            permit_res = self.burst.clone().acquire_owned() => match permit_res {
                Ok(permit) => permit,
                Err(_) => {
                    let err = anyhow::Error::from(AppError::Transport(format!("transport {} is closed", self.trname())));
                    obj.complete(Some(&err));
                    return Err(err);
                }
            },
            _ = abort => {
                let err = anyhow::Error::from(AppError::Aborted(format!("send of {}", obj.hdr.full_name())));
                obj.complete(Some(&err));
                return Err(err);
            }
        };

        self.endpoint.activity.begin();
        let mut msg = StreamMsg { obj, frame, permit };
        // A stream whose worker has exited is replaced; the retry is bounded to a single attempt.
        for _ in 0..2 {
            let tx = self.get_or_create_stream(dest).await;
            match tx.send(msg) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    self.streams.write().await.remove(&dest.id);
                    msg = returned;
                }
            }
        }
        self.endpoint.activity.end();
        let err = anyhow::Error::from(AppError::Transport(format!("stream to {} is unavailable", dest.id)));
        msg.obj.complete(Some(&err));
        Err(err)
    }

    async fn get_or_create_stream(&self, dest: &NodeInfo) -> mpsc::UnboundedSender<StreamMsg> {
        if let Some(tx) = self.streams.read().await.get(&dest.id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let mut streams = self.streams.write().await;
        if let Some(tx) = streams.get(&dest.id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let tx = StreamWorker::spawn(
            self.transport.clone(),
            self.endpoint.clone(),
            dest.clone(),
            self.closed.clone(),
            self.transport.inner.collector.clone(),
        );
        streams.insert(dest.id.clone(), tx.clone());
        tx
    }

    /// Wait for this transport to go quiet.
    ///
    /// Returns `QuiRes::Done` once neither sends nor receives have been observed for `timeout`
    /// with nothing in flight, `QuiRes::Aborted` if `stop` completes first, and
    /// `QuiRes::Timeout` if activity does not settle within `max_wait`.
    #[tracing::instrument(level = "debug", skip(self, stop), fields(trname = %self.trname()))]
    pub async fn quiesce(&self, timeout: Duration, max_wait: Duration, stop: impl Future<Output = ()>) -> QuiRes {
        let start = Instant::now();
        let poll = (timeout / 4).max(Duration::from_millis(5));
        tokio::pin!(stop);
        loop {
            if self.endpoint.activity.is_quiet_for(timeout) {
                return QuiRes::Done;
            }
            if start.elapsed() >= max_wait {
                tracing::warn!(inflight = self.endpoint.activity.inflight(), "transport did not quiesce within max wait");
                return QuiRes::Timeout;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => (),
                _ = &mut stop => return QuiRes::Aborted,
            }
        }
    }

    /// Close the sending side of this handle.
    ///
    /// Objects still queued for sending fail with the given error, objects being written are
    /// allowed to complete. Calling this more than once keeps the first error.
    pub async fn close(&self, err: Option<&anyhow::Error>) {
        let reason = err.map(|err| format!("{:#}", err)).unwrap_or_else(|| "closed".into());
        let _ = self.closed.set(reason);
        self.streams.write().await.clear();
        tracing::debug!(trname = %self.trname(), "transport closed");
    }

    /// Unregister this handle's reference to the transport name; idempotent.
    pub async fn unregister(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.release(&self.endpoint).await;
    }

    /// The number of available burst permits.
    pub fn available_burst(&self) -> usize {
        self.burst.available_permits()
    }
}

/// Check that a body yielded exactly the number of bytes its header announced.
pub(crate) fn check_body_size(hdr: &ObjHeader, written: u64) -> Result<()> {
    if written != hdr.size() {
        bail!(AppError::Transport(format!(
            "object {} body yielded {} bytes, header announced {}",
            hdr.full_name(),
            written,
            hdr.size()
        )));
    }
    Ok(())
}
