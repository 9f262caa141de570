//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron/xact";
/// The DB tree used for bucket records.
const TREE_BUCKETS: &str = "buckets";
/// The DB tree used for object metadata.
const TREE_OBJECTS: &str = "objects";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Hadron database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join("db");
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron xact database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree of bucket records.
    pub async fn get_buckets_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_BUCKETS).await
    }

    /// Get a handle to the DB tree of object metadata records.
    pub async fn get_objects_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_OBJECTS).await
    }

    async fn open_tree(&self, name: &'static str) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", name, err))))?;
        Ok(tree)
    }
}
