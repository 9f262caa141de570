//! Job lifecycle engine.
//!
//! Jobs ("xacts") are long-lived, cancelable background tasks. Every job embeds an `XactBase`
//! tracking its identity, timing, abort state & counters. Demand-based jobs additionally embed
//! an `XactDemand`, which accounts for pending work and drives the job's idle timer: once a job
//! has had no pending work & no activity for the totally-idle window, its run loop exits.
//!
//! States:
//! - `Running`: the initial state.
//! - `Idle`: demand-based jobs only; no pending work & no activity within the likely-idle window.
//! - `Aborted`: abort was requested; the run loop tears down cooperatively.
//! - `Finished`: the run loop exited without abort.
//!
//! Once finished, a job's stats snapshot is frozen.

mod demand;
#[cfg(test)]
mod mod_test;
mod registry;
#[cfg(test)]
mod registry_test;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::archive::ArchiveMsg;
use crate::models::Bucket;
use crate::utils;

pub use demand::XactDemand;
pub use registry::{XactArgs, XactCtx, XactFactory, XactQuery, XactRegistry};

const METRIC_XACTS_STARTED: &str = "hadron_xact_jobs_started";
const METRIC_XACTS_FINISHED: &str = "hadron_xact_jobs_finished";
const METRIC_XACTS_ABORTED: &str = "hadron_xact_jobs_aborted";

/// The kind of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XactKind {
    /// Builds archives out of bucket objects.
    Archive,
    /// Loads the metadata of all objects of a bucket, then finishes.
    #[serde(rename = "load-lom-cache")]
    LoadLomCache,
}

impl XactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::LoadLomCache => "load-lom-cache",
        }
    }

    /// Check if jobs of this kind stop themselves once idle.
    pub fn is_demand_based(&self) -> bool {
        match self {
            Self::Archive => true,
            Self::LoadLomCache => false,
        }
    }
}

impl fmt::Display for XactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work routed to a job.
#[derive(Clone, Debug)]
pub enum XactRequest {
    Archive(ArchiveMsg),
}

impl XactRequest {
    /// The kind of job which handles this request.
    pub fn kind(&self) -> XactKind {
        match self {
            Self::Archive(_) => XactKind::Archive,
        }
    }

    /// The bucket this request targets, which scopes the job handling it.
    pub fn bucket(&self) -> &Bucket {
        match self {
            Self::Archive(msg) => &msg.from_bucket,
        }
    }
}

/// The lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum XactState {
    Running,
    Idle,
    Aborted,
    Finished,
}

/// A point in time snapshot of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct XactSnap {
    pub id: String,
    pub kind: XactKind,
    pub bucket: String,
    /// Unix nanos.
    pub start_time: i64,
    /// Unix nanos, `0` while the job is running.
    pub end_time: i64,
    pub state: XactState,
    pub aborted: bool,
    /// Only present for demand-based jobs.
    pub idle: Option<bool>,
    /// Only present for demand-based jobs.
    pub pending: Option<i64>,
    /// The error the job finished with, if any.
    pub error: Option<String>,
    pub stats: XactStats,
}

/// The counters of a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct XactStats {
    /// Objects & bytes processed locally.
    pub local_objs: u64,
    pub local_bytes: u64,
    /// Objects & bytes sent to other nodes.
    pub out_objs: u64,
    pub out_bytes: u64,
    /// Objects & bytes received from other nodes.
    pub in_objs: u64,
    pub in_bytes: u64,
}

#[derive(Default)]
struct XactCounters {
    local_objs: AtomicU64,
    local_bytes: AtomicU64,
    out_objs: AtomicU64,
    out_bytes: AtomicU64,
    in_objs: AtomicU64,
    in_bytes: AtomicU64,
}

/// A cooperative cancellation token.
///
/// The first abort wins; its reason is retained.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    reason: OnceLock<String>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(AbortInner { tx, rx, reason: OnceLock::new() }),
        }
    }

    /// Trigger this signal, returning `false` if it was already triggered.
    pub fn abort(&self, reason: &str) -> bool {
        if self.inner.reason.set(reason.to_string()).is_err() {
            return false;
        }
        let _ = self.inner.tx.send(true);
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Resolves once this signal is triggered.
    pub async fn aborted(&self) {
        let mut rx = self.inner.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            // The sender lives as long as this signal, so this never errs while awaited.
            if rx.changed().await.is_err() {
                return futures::future::pending().await;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The state common to all jobs.
pub struct XactBase {
    id: String,
    kind: XactKind,
    bucket: Bucket,
    start_time: i64,
    end_time: AtomicI64,
    abort: AbortSignal,
    /// Set once the run loop has decided to exit; the job accepts no new work from then on.
    stopping: AtomicBool,
    counters: XactCounters,
    error: OnceLock<String>,
    /// The final snapshot, frozen when the job finishes.
    final_snap: OnceLock<XactSnap>,
    demand: Option<Arc<XactDemand>>,
}

impl XactBase {
    /// Create a new instance.
    pub fn new(kind: XactKind, bucket: Bucket, demand: Option<Arc<XactDemand>>) -> Self {
        metrics::increment_counter!(METRIC_XACTS_STARTED, "kind" => kind.as_str());
        Self {
            id: Uuid::new_v4().to_simple().to_string(),
            kind,
            bucket,
            start_time: utils::now_unix_nanos(),
            end_time: AtomicI64::new(0),
            abort: AbortSignal::new(),
            stopping: AtomicBool::new(false),
            counters: XactCounters::default(),
            error: OnceLock::new(),
            final_snap: OnceLock::new(),
            demand,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> XactKind {
        self.kind
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn demand(&self) -> Option<&XactDemand> {
        self.demand.as_deref()
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Request cooperative abort of this job.
    ///
    /// Returns `false` if the job was already aborted or has finished.
    pub fn abort(&self, reason: &str) -> bool {
        if self.is_finished() {
            return false;
        }
        let aborted = self.abort.abort(reason);
        if aborted {
            tracing::info!(xact = %self, reason, "job aborted");
            metrics::increment_counter!(METRIC_XACTS_ABORTED, "kind" => self.kind.as_str());
        }
        aborted
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.load(Ordering::Acquire) != 0
    }

    /// Check if this job has not yet finished.
    pub fn is_running(&self) -> bool {
        !self.is_finished()
    }

    /// Mark this job as stopping; it accepts no new work from then on.
    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Check if this job may still accept new work.
    pub fn is_accepting(&self) -> bool {
        !self.stopping.load(Ordering::Acquire) && !self.is_aborted() && !self.is_finished()
    }

    pub fn state(&self) -> XactState {
        if self.is_aborted() {
            XactState::Aborted
        } else if self.is_finished() {
            XactState::Finished
        } else if self.demand.as_deref().map(XactDemand::is_idle).unwrap_or(false) {
            XactState::Idle
        } else {
            XactState::Running
        }
    }

    /// Mark this job as finished, recording the given error. Only the first call has effect.
    pub fn finish(&self, err: Option<&anyhow::Error>) {
        let now = utils::now_unix_nanos().max(self.start_time).max(1);
        if self.end_time.compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        if let Some(err) = err {
            let _ = self.error.set(format!("{:#}", err));
        }
        let _ = self.final_snap.set(self.snapshot());
        metrics::increment_counter!(METRIC_XACTS_FINISHED, "kind" => self.kind.as_str());
        match err {
            Some(err) => tracing::warn!(xact = %self, error = ?err, "job finished with error"),
            None => tracing::info!(xact = %self, "job finished"),
        }
    }

    /// A snapshot of this job; identical across calls once the job has finished.
    pub fn stats(&self) -> XactSnap {
        match self.final_snap.get() {
            Some(snap) => snap.clone(),
            None => self.snapshot(),
        }
    }

    fn snapshot(&self) -> XactSnap {
        let load = |val: &AtomicU64| val.load(Ordering::Acquire);
        let c = &self.counters;
        XactSnap {
            id: self.id.clone(),
            kind: self.kind,
            bucket: self.bucket.uname(),
            start_time: self.start_time,
            end_time: self.end_time.load(Ordering::Acquire),
            state: self.state(),
            aborted: self.is_aborted(),
            idle: self.demand.as_deref().map(XactDemand::is_idle),
            pending: self.demand.as_deref().map(XactDemand::pending),
            error: self.error.get().cloned(),
            stats: XactStats {
                local_objs: load(&c.local_objs),
                local_bytes: load(&c.local_bytes),
                out_objs: load(&c.out_objs),
                out_bytes: load(&c.out_bytes),
                in_objs: load(&c.in_objs),
                in_bytes: load(&c.in_bytes),
            },
        }
    }

    pub fn add_local(&self, bytes: u64) {
        self.counters.local_objs.fetch_add(1, Ordering::AcqRel);
        self.counters.local_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn add_out(&self, bytes: u64) {
        self.counters.out_objs.fetch_add(1, Ordering::AcqRel);
        self.counters.out_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn add_in(&self, bytes: u64) {
        self.counters.in_objs.fetch_add(1, Ordering::AcqRel);
        self.counters.in_bytes.fetch_add(bytes, Ordering::AcqRel);
    }
}

impl fmt::Display for XactBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]-{}", self.kind, self.id, self.bucket)
    }
}

/// A job.
#[async_trait]
pub trait Xact: Send + Sync + 'static {
    fn base(&self) -> &XactBase;

    /// Validate & register a unit of work ahead of its submission.
    ///
    /// Errors are returned to the caller before anything is queued.
    async fn begin(&self, req: &XactRequest) -> Result<()>;

    /// Queue a unit of work which was accepted by `begin`, incrementing the pending count.
    fn submit(&self, req: XactRequest) -> Result<()>;

    /// The job's control loop, driven until the job finishes.
    async fn run(self: Arc<Self>) -> Result<()>;

    fn abort(&self, reason: &str) -> bool {
        self.base().abort(reason)
    }

    fn is_aborted(&self) -> bool {
        self.base().is_aborted()
    }

    fn is_running(&self) -> bool {
        self.base().is_running()
    }

    fn stats(&self) -> XactSnap {
        self.base().stats()
    }
}
