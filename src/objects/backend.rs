use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::fs::File;

use crate::error::AppError;
use crate::objects::{LocalObject, ObjectStore};

const METRIC_COLD_GETS: &str = "hadron_xact_cold_gets";

/// A store backing the objects of remote buckets.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Fetch the given object from the backing store into the local object store.
    ///
    /// On success the handle is loaded & its content is available locally. A missing object
    /// yields `AppError::ObjectNotFound`, any other failure `AppError::Backend`.
    async fn get_object(&self, store: &ObjectStore, lom: &mut LocalObject) -> Result<()>;
}

/// A backend which serves objects out of a local directory, laid out as `{root}/{bucket}/{obj}`.
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        metrics::register_counter!(METRIC_COLD_GETS, metrics::Unit::Count, "objects fetched from the backing store");
        Self { root: root.into() }
    }
}

#[async_trait]
impl Backend for DirBackend {
    #[tracing::instrument(level = "debug", skip(self, store, lom), fields(object = %lom.full_name()))]
    async fn get_object(&self, store: &ObjectStore, lom: &mut LocalObject) -> Result<()> {
        let bucket = lom.bucket()?.clone();
        let path = self.root.join(&bucket.name).join(lom.obj_name());
        let mut src = match File::open(&path).await {
            Ok(src) => src,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => bail!(AppError::ObjectNotFound(lom.full_name())),
            Err(err) => bail!(AppError::Backend(format!("error opening {:?}: {}", path, err))),
        };

        let work_path = lom.work_path("cold");
        let mut dst = lom.create_file(&work_path).await?;
        let size = match tokio::io::copy(&mut src, &mut dst).await {
            Ok(size) => size,
            Err(err) => {
                drop(dst);
                let _ = tokio::fs::remove_file(&work_path).await;
                bail!(AppError::Backend(format!("error copying {:?}: {}", path, err)));
            }
        };
        drop(dst);

        // The backend's content has no checksum recorded by this node.
        lom.set_checksum("", "");
        store.finalize_object(lom, &work_path, size).await.context("error registering cold object")?;
        metrics::increment_counter!(METRIC_COLD_GETS);
        Ok(())
    }
}

/// A backend used when no backing store is configured; every fetch fails.
pub struct NoBackend;

#[async_trait]
impl Backend for NoBackend {
    async fn get_object(&self, _: &ObjectStore, lom: &mut LocalObject) -> Result<()> {
        bail!(AppError::Backend(format!("no backend configured to fetch {}", lom.full_name())))
    }
}
