use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cluster::Membership;
use crate::config::Config;
use crate::error::AppError;
use crate::models::Bucket;
use crate::objects::{Backend, ObjectStore};
use crate::transport::Transport;
use crate::xact::{AbortSignal, Xact, XactKind, XactRequest, XactSnap};

/// A constructor of jobs of one kind.
pub type XactFactory = fn(XactArgs) -> BoxFuture<'static, Result<Arc<dyn Xact>>>;

/// The node services available to jobs.
#[derive(Clone)]
pub struct XactCtx {
    pub config: Arc<Config>,
    pub store: ObjectStore,
    pub backend: Arc<dyn Backend>,
    pub membership: Membership,
    pub transport: Transport,
    /// Triggered when the node begins shutting down.
    pub node_stop: AbortSignal,
}

/// The arguments given to a job factory.
pub struct XactArgs {
    pub kind: XactKind,
    pub bucket: Bucket,
    pub ctx: XactCtx,
}

/// A filter over registered jobs.
#[derive(Clone, Debug, Default)]
pub struct XactQuery {
    pub kind: Option<XactKind>,
    pub bucket: Option<Bucket>,
    pub only_running: bool,
}

impl XactQuery {
    fn matches(&self, xact: &dyn Xact) -> bool {
        let base = xact.base();
        self.kind.map(|kind| kind == base.kind()).unwrap_or(true)
            && self.bucket.as_ref().map(|bucket| bucket == base.bucket()).unwrap_or(true)
            && (!self.only_running || base.is_running())
    }
}

struct XactEntry {
    xact: Arc<dyn Xact>,
    handle: JoinHandle<()>,
}

/// The registry of all jobs of this node.
///
/// Jobs are created through the factory registered for their kind, and at most one accepting
/// job exists per kind & bucket.
#[derive(Clone)]
pub struct XactRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    ctx: XactCtx,
    factories: HashMap<XactKind, XactFactory>,
    xacts: Mutex<Vec<XactEntry>>,
}

impl XactRegistry {
    /// Create a new instance with the given factories.
    pub fn new(ctx: XactCtx, factories: impl IntoIterator<Item = (XactKind, XactFactory)>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                factories: factories.into_iter().collect(),
                xacts: Mutex::new(vec![]),
            }),
        }
    }

    pub fn ctx(&self) -> &XactCtx {
        &self.inner.ctx
    }

    /// Get the accepting job of the given kind & bucket, creating & spawning one if needed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn renew(&self, kind: XactKind, bucket: &Bucket) -> Result<Arc<dyn Xact>> {
        let factory = match self.inner.factories.get(&kind) {
            Some(factory) => *factory,
            None => bail!(AppError::InvalidInput(format!("no job factory registered for kind {}", kind))),
        };
        let mut xacts = self.inner.xacts.lock().await;
        let existing = xacts
            .iter()
            .find(|entry| entry.xact.base().kind() == kind && entry.xact.base().bucket() == bucket && entry.xact.base().is_accepting());
        if let Some(entry) = existing {
            return Ok(entry.xact.clone());
        }

        let xact = factory(XactArgs {
            kind,
            bucket: bucket.clone(),
            ctx: self.inner.ctx.clone(),
        })
        .await?;
        tracing::info!(xact = %xact.base(), "job started");
        let runner = xact.clone();
        let handle = tokio::spawn(async move {
            let base_name = runner.base().to_string();
            if let Err(err) = runner.run().await {
                tracing::error!(error = ?err, xact = %base_name, "job run loop returned an error");
            }
        });
        xacts.push(XactEntry { xact: xact.clone(), handle });
        Ok(xact)
    }

    /// Route the given request to its job & register it with the job via `Xact::begin`.
    ///
    /// The request is not queued; see `Xact::submit`.
    pub async fn begin_request(&self, req: &XactRequest) -> Result<Arc<dyn Xact>> {
        // A job may stop between renewal & begin, in which case a fresh one is created.
        let mut attempts = 0;
        loop {
            attempts += 1;
            let xact = self.renew(req.kind(), req.bucket()).await?;
            match xact.begin(req).await {
                Ok(()) => return Ok(xact),
                Err(err) if attempts < 2 && !xact.base().is_accepting() => {
                    tracing::debug!(error = ?err, xact = %xact.base(), "job stopped during begin, renewing");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Route, begin & submit the given request.
    pub async fn do_request(&self, req: XactRequest) -> Result<Arc<dyn Xact>> {
        let xact = self.begin_request(&req).await?;
        xact.submit(req)?;
        Ok(xact)
    }

    /// Get a job by ID.
    pub async fn get(&self, id: &str) -> Option<Arc<dyn Xact>> {
        let xacts = self.inner.xacts.lock().await;
        xacts.iter().find(|entry| entry.xact.base().id() == id).map(|entry| entry.xact.clone())
    }

    /// Abort the target job.
    pub async fn abort(&self, id: &str, reason: &str) -> Result<()> {
        match self.get(id).await {
            Some(xact) => {
                xact.abort(reason);
                Ok(())
            }
            None => bail!(AppError::XactNotFound(id.into())),
        }
    }

    /// Abort all running jobs, returning the number of jobs which were aborted.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let xacts = self.inner.xacts.lock().await;
        xacts.iter().filter(|entry| entry.xact.abort(reason)).count()
    }

    /// Snapshots of all jobs matching the given query.
    pub async fn snapshots(&self, query: &XactQuery) -> Vec<XactSnap> {
        let xacts = self.inner.xacts.lock().await;
        xacts
            .iter()
            .filter(|entry| query.matches(entry.xact.as_ref()))
            .map(|entry| entry.xact.stats())
            .collect()
    }

    /// Drop all finished jobs, returning the number of jobs dropped.
    pub async fn prune_finished(&self) -> usize {
        let mut xacts = self.inner.xacts.lock().await;
        let before = xacts.len();
        xacts.retain(|entry| !(entry.xact.base().is_finished() && entry.handle.is_finished()));
        before - xacts.len()
    }

    /// Stop all jobs & wait for their run loops to exit.
    pub async fn shutdown(&self) {
        self.inner.ctx.node_stop.abort("node shutdown");
        let count = self.abort_all("node shutdown").await;
        tracing::debug!(count, "aborted running jobs for shutdown");
        let entries: Vec<_> = self.inner.xacts.lock().await.drain(..).collect();
        for entry in entries {
            if let Err(err) = entry.handle.await {
                tracing::error!(error = ?err, "error joining job task");
            }
        }
    }
}
