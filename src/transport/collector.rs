//! The stream collector.
//!
//! A single task per node tracks every open stream and tears down the connections of streams
//! idle beyond the teardown threshold. Streams are kept in a min-heap keyed by their next check
//! time, so each tick only visits the streams which are due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::transport::stream::StreamState;

const METRIC_OPEN_STREAMS: &str = "hadron_xact_transport_open_streams";
const METRIC_TEARDOWNS: &str = "hadron_xact_transport_stream_teardowns";

/// A message bound for the collector.
pub(crate) enum CollectorMsg {
    Register { sid: u64, state: Arc<StreamState> },
    Unregister { sid: u64 },
}

/// A handle to the collector.
#[derive(Clone)]
pub struct CollectorHandle {
    tx: mpsc::UnboundedSender<CollectorMsg>,
    next_sid: Arc<AtomicU64>,
}

impl CollectorHandle {
    /// Register a stream, returning its ID.
    pub(crate) fn register(&self, state: Arc<StreamState>) -> u64 {
        let sid = self.next_sid.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send(CollectorMsg::Register { sid, state });
        sid
    }

    pub(crate) fn unregister(&self, sid: u64) {
        let _ = self.tx.send(CollectorMsg::Unregister { sid });
    }
}

/// The stream collector task.
pub struct Collector {
    config: Arc<Config>,
    rx: mpsc::UnboundedReceiver<CollectorMsg>,
    shutdown: broadcast::Receiver<()>,
    streams: HashMap<u64, Arc<StreamState>>,
    /// Stream IDs by next check time; entries of unregistered streams are skipped when popped.
    pub(super) schedule: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl Collector {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, shutdown: broadcast::Receiver<()>) -> (Self, CollectorHandle) {
        metrics::register_gauge!(METRIC_OPEN_STREAMS, metrics::Unit::Count, "the number of streams tracked by the collector");
        metrics::register_counter!(METRIC_TEARDOWNS, metrics::Unit::Count, "idle stream teardowns requested by the collector");
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CollectorHandle { tx, next_sid: Arc::new(AtomicU64::new(1)) };
        (
            Self {
                config,
                rx,
                shutdown,
                streams: HashMap::new(),
                schedule: BinaryHeap::new(),
            },
            handle,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("stream collector has started");
        let mut ticker = tokio::time::interval(self.config.transport_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg_opt = self.rx.recv() => match msg_opt {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                _ = ticker.tick() => self.sweep(Instant::now()),
                _ = self.shutdown.recv() => break,
            }
        }

        tracing::debug!(streams = self.streams.len(), "stream collector has shutdown");
        Ok(())
    }

    pub(super) fn handle_msg(&mut self, msg: CollectorMsg) {
        match msg {
            CollectorMsg::Register { sid, state } => {
                self.schedule.push(Reverse((Instant::now() + self.config.transport_idle_teardown(), sid)));
                self.streams.insert(sid, state);
            }
            CollectorMsg::Unregister { sid } => {
                self.streams.remove(&sid);
            }
        }
        metrics::gauge!(METRIC_OPEN_STREAMS, self.streams.len() as f64);
    }

    /// Visit every stream due for a check, requesting teardown of those which are idle.
    #[tracing::instrument(level = "trace", skip(self, now))]
    pub(super) fn sweep(&mut self, now: Instant) {
        let idle = self.config.transport_idle_teardown();
        while let Some(Reverse((due, sid))) = self.schedule.peek().copied() {
            if due > now {
                break;
            }
            self.schedule.pop();
            let state = match self.streams.get(&sid) {
                Some(state) => state,
                None => continue,
            };
            let next = if !state.connected.load(Ordering::Acquire) || state.activity.inflight() > 0 {
                now + idle
            } else if state.activity.last_active() + idle <= now {
                tracing::trace!(sid, "requesting teardown of idle stream");
                metrics::increment_counter!(METRIC_TEARDOWNS);
                state.teardown.notify_one();
                now + idle
            } else {
                state.activity.last_active() + idle
            };
            self.schedule.push(Reverse((next, sid)));
        }
    }
}
