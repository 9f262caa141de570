//! Local object storage.
//!
//! Object metadata is kept in the database, object content lives on the filesystem under the
//! node's data path. New content is always written to a work file first, and only becomes a
//! visible object once `ObjectStore::finalize_object` renames it into place and records its
//! metadata.

mod backend;
#[cfg(test)]
mod mod_test;

use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sled::Tree;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use crate::error::{AppError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::{Bucket, BucketRecord, ObjAttrs, CHECKSUM_SEAHASH};
use crate::utils;

pub use backend::{Backend, DirBackend, NoBackend};

/// The data dir holding finalized object content.
const DIR_OBJECTS: &str = "obj";
/// The data dir holding in-progress work files.
const DIR_WORK: &str = "work";

/// The local object store of this node.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<ObjectStoreInner>,
}

struct ObjectStoreInner {
    /// The DB tree of bucket records.
    buckets: Tree,
    /// The DB tree of object metadata.
    objects: Tree,
    /// The root dir of finalized object content.
    obj_dir: PathBuf,
    /// The root dir of work files.
    work_dir: PathBuf,
}

impl ObjectStore {
    /// Create a new instance.
    pub async fn new(config: &Config, db: &Database) -> Result<Self> {
        let root = PathBuf::from(&config.storage_data_path);
        let (obj_dir, work_dir) = (root.join(DIR_OBJECTS), root.join(DIR_WORK));
        tokio::fs::create_dir_all(&obj_dir).await.context("error creating object data dir")?;
        tokio::fs::create_dir_all(&work_dir).await.context("error creating object work dir")?;
        let buckets = db.get_buckets_tree().await?;
        let objects = db.get_objects_tree().await?;
        Ok(Self {
            inner: Arc::new(ObjectStoreInner { buckets, objects, obj_dir, work_dir }),
        })
    }

    /// Create the given bucket if it does not already exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_bucket(&self, bucket: &Bucket) -> Result<()> {
        validate_bucket_name(&bucket.name)?;
        let record = utils::encode_model(&BucketRecord {
            bucket: Some(bucket.clone()),
            created: utils::now_unix_nanos(),
        })?;
        let (tree, key) = (self.inner.buckets.clone(), bucket.uname());
        Database::spawn_blocking(move || -> Result<()> {
            let _ = tree
                .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(record))
                .context("error writing bucket record")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Check if the given bucket exists.
    pub async fn bucket_exists(&self, bucket: &Bucket) -> Result<bool> {
        let (tree, key) = (self.inner.buckets.clone(), bucket.uname());
        let exists = Database::spawn_blocking(move || tree.contains_key(key.as_bytes()))
            .await?
            .context("error reading bucket record")?;
        Ok(exists)
    }

    /// Allocate a handle to a local object, to be bound to a bucket via `LocalObject::init`.
    pub fn alloc(&self, name: &str) -> LocalObject {
        LocalObject {
            store: self.clone(),
            name: name.to_string(),
            bucket: None,
            attrs: ObjAttrs::default(),
            loaded: false,
        }
    }

    /// Write a new object from the given reader, returning its attributes.
    #[tracing::instrument(level = "debug", skip(self, reader))]
    pub async fn put_object<R: AsyncRead + Unpin + ?Sized>(&self, bucket: &Bucket, name: &str, reader: &mut R) -> Result<ObjAttrs> {
        let mut lom = self.alloc(name);
        lom.init(bucket).await?;
        let work_path = lom.work_path("put");
        let mut file = lom.create_file(&work_path).await?;

        let (mut hasher, mut buf, mut size) = (seahash::SeaHasher::default(), vec![0u8; 64 * 1024], 0u64);
        let res: Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await.context("error reading object content")?;
                if n == 0 {
                    break;
                }
                hasher.write(&buf[..n]);
                file.write_all(&buf[..n]).await.context("error writing object work file")?;
                size += n as u64;
            }
            file.flush().await.context("error flushing object work file")?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(err) = res {
            let _ = tokio::fs::remove_file(&work_path).await;
            return Err(err);
        }

        lom.set_checksum(CHECKSUM_SEAHASH, &utils::format_checksum(&hasher));
        self.finalize_object(&mut lom, &work_path, size).await?;
        Ok(lom.attrs)
    }

    /// Delete the given object.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete_object(&self, bucket: &Bucket, name: &str) -> Result<()> {
        let mut lom = self.alloc(name);
        lom.init(bucket).await?;
        lom.load().await?;
        let (tree, key) = (self.inner.objects.clone(), utils::encode_object_key(&bucket.uname(), name));
        Database::spawn_blocking(move || -> Result<()> {
            tree.remove(key).context("error removing object metadata")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await??;
        if let Err(err) = tokio::fs::remove_file(lom.fqn()).await {
            tracing::warn!(error = ?err, object = %lom.full_name(), "error removing object content");
        }
        Ok(())
    }

    /// List the names of all objects of the given bucket which start with the given prefix.
    pub async fn list_prefix(&self, bucket: &Bucket, prefix: &str) -> Result<Vec<String>> {
        let (tree, bucket_key) = (self.inner.objects.clone(), utils::encode_object_key(&bucket.uname(), ""));
        let scan_key = utils::encode_object_key(&bucket.uname(), prefix);
        let names = Database::spawn_blocking(move || -> Result<Vec<String>> {
            let mut names = vec![];
            for key_res in tree.scan_prefix(scan_key).keys() {
                let key = key_res.context(ERR_ITER_FAILURE)?;
                let name = std::str::from_utf8(&key[bucket_key.len()..]).context("error decoding object name from storage")?;
                names.push(name.to_string());
            }
            Ok(names)
        })
        .await??;
        Ok(names)
    }

    /// Open the given object for reading, returning its loaded handle along with its content.
    pub async fn open_reader(&self, bucket: &Bucket, name: &str) -> Result<(LocalObject, File)> {
        let mut lom = self.alloc(name);
        lom.init(bucket).await?;
        lom.load().await?;
        let file = lom.open().await?;
        Ok((lom, file))
    }

    /// Register the content of the given work file as a first-class object.
    ///
    /// The work file is moved into place and the object's metadata is persisted, overwriting any
    /// previous version of the object.
    #[tracing::instrument(level = "debug", skip(self, lom, work_path), fields(object = %lom.full_name()))]
    pub async fn finalize_object(&self, lom: &mut LocalObject, work_path: &Path, size: u64) -> Result<()> {
        let bucket = lom.bucket()?.clone();
        lom.set_size(size);
        if lom.attrs.atime == 0 {
            lom.attrs.atime = utils::now_unix_nanos();
        }
        let fqn = lom.fqn();
        if let Some(parent) = fqn.parent() {
            tokio::fs::create_dir_all(parent).await.context("error creating object dir")?;
        }
        tokio::fs::rename(work_path, &fqn)
            .await
            .with_context(|| format!("error moving work file {:?} into place", work_path))?;

        let (tree, key) = (self.inner.objects.clone(), utils::encode_object_key(&bucket.uname(), &lom.name));
        let meta = utils::encode_model(&lom.attrs)?;
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key, meta).context("error writing object metadata")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await??;
        lom.loaded = true;
        Ok(())
    }
}

/// A handle to a local object & its metadata.
#[derive(Clone)]
pub struct LocalObject {
    store: ObjectStore,
    name: String,
    bucket: Option<Bucket>,
    attrs: ObjAttrs,
    loaded: bool,
}

impl LocalObject {
    /// Bind this handle to the given bucket, validating the name and the bucket's existence.
    pub async fn init(&mut self, bucket: &Bucket) -> Result<()> {
        validate_bucket_name(&bucket.name)?;
        validate_object_name(&self.name)?;
        if !self.store.bucket_exists(bucket).await? {
            bail!(AppError::BucketNotFound(bucket.to_string()));
        }
        self.bucket = Some(bucket.clone());
        Ok(())
    }

    /// Load this object's metadata from storage, failing with `ObjectNotFound` if absent.
    pub async fn load(&mut self) -> Result<()> {
        let bucket = self.bucket()?;
        let (tree, key) = (self.store.inner.objects.clone(), utils::encode_object_key(&bucket.uname(), &self.name));
        let val = Database::spawn_blocking(move || tree.get(key))
            .await?
            .context("error reading object metadata")?;
        match val {
            Some(val) => {
                self.attrs = utils::decode_model(&val)?;
                self.loaded = true;
                Ok(())
            }
            None => bail!(AppError::ObjectNotFound(self.full_name())),
        }
    }

    /// Create the given file, along with any missing parent dirs.
    pub async fn create_file(&self, path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("error creating work dir")?;
        }
        File::create(path).await.with_context(|| format!("error creating file {:?}", path))
    }

    /// Open this object's content for reading.
    pub async fn open(&self) -> Result<File> {
        match File::open(self.fqn()).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => bail!(AppError::ObjectNotFound(self.full_name())),
            Err(err) => Err(err).with_context(|| format!("error opening object {}", self.full_name())),
        }
    }

    /// The bucket of this object, failing if the handle has not been initialized.
    pub fn bucket(&self) -> Result<&Bucket> {
        self.bucket
            .as_ref()
            .ok_or_else(|| AppError::Ise(anyhow::anyhow!("object handle {} used before init", self.name)).into())
    }

    pub fn obj_name(&self) -> &str {
        &self.name
    }

    /// The unique name of this object.
    pub fn full_name(&self) -> String {
        match &self.bucket {
            Some(bucket) => bucket.make_uname(&self.name),
            None => self.name.clone(),
        }
    }

    /// The path of this object's content on disk.
    pub fn fqn(&self) -> PathBuf {
        self.bucket_dir(&self.store.inner.obj_dir).join(&self.name)
    }

    /// Generate a unique work file path for this object.
    pub fn work_path(&self, tag: &str) -> PathBuf {
        let file = format!("{}.{}.{}", self.name, tag, Uuid::new_v4().to_simple());
        self.bucket_dir(&self.store.inner.work_dir).join(file)
    }

    fn bucket_dir(&self, root: &Path) -> PathBuf {
        match &self.bucket {
            Some(bucket) => root.join(bucket.provider().as_str()).join(&bucket.name),
            None => root.to_path_buf(),
        }
    }

    pub fn attrs(&self) -> &ObjAttrs {
        &self.attrs
    }

    pub fn size(&self) -> u64 {
        self.attrs.size
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_size(&mut self, size: u64) {
        self.attrs.size = size;
    }

    /// Set the checksum of this object; empty values clear it.
    pub fn set_checksum(&mut self, checksum_type: &str, value: &str) {
        self.attrs.checksum_type = checksum_type.into();
        self.attrs.checksum_value = value.into();
    }
}

/// Validate that the given bucket name is a single path segment.
///
/// Object keys & placement keys join the bucket name and the object name with `/`, which must
/// therefore never appear in a bucket name.
fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(|c| c == '/' || c == '\0') {
        bail!(AppError::InvalidInput(format!("bucket name {:?} must be a non-empty name without `/`", name)));
    }
    Ok(())
}

/// Validate that the given object name maps to a path within its bucket.
fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!(AppError::InvalidInput("object name may not be empty".into()));
    }
    if name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        bail!(AppError::InvalidInput(format!("object name {} must be a relative path without empty, `.` or `..` segments", name)));
    }
    Ok(())
}
