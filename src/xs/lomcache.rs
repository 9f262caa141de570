//! Object metadata warm-up job.
//!
//! Walks every object of a bucket once, loading its metadata so that subsequent lookups hit warm
//! pages of the metadata store, then finishes on its own. Unlike archive jobs it is not
//! demand-based: it takes no requests & has no idle timer.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::TryStreamExt;

use crate::error::{AppError, AppErrorExt};
use crate::models::Bucket;
use crate::xact::{Xact, XactArgs, XactBase, XactCtx, XactRequest};

const METRIC_OBJECTS_LOADED: &str = "hadron_xact_lom_cache_objects_loaded";

/// Create a new metadata warm-up job.
pub fn new_xact(args: XactArgs) -> BoxFuture<'static, Result<Arc<dyn Xact>>> {
    Box::pin(async move {
        let xact: Arc<dyn Xact> = XactLoadLomCache::new(args).await?;
        Ok(xact)
    })
}

/// A job loading the metadata of all objects of one bucket.
pub struct XactLoadLomCache {
    base: XactBase,
    ctx: XactCtx,
}

impl XactLoadLomCache {
    pub async fn new(args: XactArgs) -> Result<Arc<Self>> {
        metrics::register_counter!(METRIC_OBJECTS_LOADED, metrics::Unit::Count, "object metadata records loaded by warm-up jobs");
        let XactArgs { kind, bucket, ctx } = args;
        if !ctx.store.bucket_exists(&bucket).await? {
            bail!(AppError::BucketNotFound(bucket.to_string()));
        }
        Ok(Arc::new(Self {
            base: XactBase::new(kind, bucket, None),
            ctx,
        }))
    }

    async fn load_all(&self) -> Result<()> {
        let bucket = self.base.bucket();
        let names = self.ctx.store.list_prefix(bucket, "").await?;
        tracing::debug!(count = names.len(), "loading object metadata");
        futures::stream::iter(names.into_iter().map(Ok))
            .try_for_each_concurrent(self.ctx.config.xact_workers, |name| self.load_one(bucket, name))
            .await
    }

    async fn load_one(&self, bucket: &Bucket, name: String) -> Result<()> {
        if self.base.is_aborted() {
            bail!(AppError::Aborted(format!("job {}", self.base)));
        }
        let mut lom = self.ctx.store.alloc(&name);
        lom.init(bucket).await?;
        match lom.load().await {
            Ok(()) => {
                self.base.add_local(lom.size());
                metrics::increment_counter!(METRIC_OBJECTS_LOADED);
                Ok(())
            }
            // Deleted since listing.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Xact for XactLoadLomCache {
    fn base(&self) -> &XactBase {
        &self.base
    }

    async fn begin(&self, _req: &XactRequest) -> Result<()> {
        bail!(AppError::InvalidInput(format!("job {} does not accept requests", self.base)))
    }

    fn submit(&self, _req: XactRequest) -> Result<()> {
        bail!(AppError::InvalidInput(format!("job {} does not accept requests", self.base)))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(xact = %self.base))]
    async fn run(self: Arc<Self>) -> Result<()> {
        let err = tokio::select! {
            res = self.load_all() => res.err(),
            _ = self.base.abort_signal().aborted() => {
                let reason = self.base.abort_signal().reason().unwrap_or_default();
                Some(AppError::Aborted(format!("job {}: {}", self.base, reason)).into())
            }
        };
        self.base.set_stopping();
        self.base.finish(err.as_ref());
        Ok(())
    }
}
