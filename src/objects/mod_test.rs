use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::Config;
use crate::database::Database;
use crate::error::{AppError, AppErrorExt};
use crate::models::{Bucket, Provider, CHECKSUM_SEAHASH};
use crate::objects::{Backend, DirBackend, NoBackend, ObjectStore};
use crate::utils;

async fn new_store() -> Result<(ObjectStore, Bucket, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = ObjectStore::new(&config, &db).await?;
    let bucket = Bucket::new(Provider::Hadron, "photos");
    store.create_bucket(&bucket).await?;
    Ok((store, bucket, tmpdir))
}

#[tokio::test]
async fn put_object_then_load_and_read() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let data = b"a small object body".to_vec();

    let attrs = store.put_object(&bucket, "2021/a.jpg", &mut data.as_slice()).await?;

    assert_eq!(attrs.size, data.len() as u64, "expected size {} got {}", data.len(), attrs.size);
    assert_eq!(attrs.checksum_type, CHECKSUM_SEAHASH, "unexpected checksum type");
    assert_eq!(attrs.checksum_value, utils::checksum_bytes(&data), "streamed checksum differs from whole-buffer checksum");
    let (lom, mut file) = store.open_reader(&bucket, "2021/a.jpg").await?;
    assert!(lom.is_loaded(), "expected handle to be loaded");
    assert_eq!(lom.attrs(), &attrs, "expected stored attrs to match the attrs returned from put");
    let mut content = vec![];
    file.read_to_end(&mut content).await?;
    assert_eq!(content, data, "object content mismatch");

    Ok(())
}

#[tokio::test]
async fn init_errs_with_missing_bucket() -> Result<()> {
    let (store, _bucket, _tmpdir) = new_store().await?;
    let mut lom = store.alloc("a.jpg");

    let err = lom.init(&Bucket::new(Provider::Hadron, "nope")).await.err().context("expected init to fail")?;

    assert!(err.is_not_found(), "expected a not found error, got {:?}", err);
    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::BucketNotFound(_))), "unexpected error: {:?}", err);
    Ok(())
}

#[tokio::test]
async fn init_rejects_names_escaping_the_bucket() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;

    for name in ["", "/etc/passwd", "../other/a.jpg", "a/./b", "a/../../b"] {
        let mut lom = store.alloc(name);
        let err = lom.init(&bucket).await.err().with_context(|| format!("expected init to fail for name {:?}", name))?;
        assert!(
            matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
            "expected validation error for name {:?}, got {:?}",
            name,
            err
        );
    }
    Ok(())
}

#[tokio::test]
async fn bucket_names_may_not_contain_separators() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let data = b"nested".to_vec();
    store.put_object(&bucket, "b/c.jpg", &mut data.as_slice()).await?;

    for name in ["photos/b", "..", "."] {
        let nested = Bucket::new(Provider::Hadron, name);
        let err = store.create_bucket(&nested).await.err().with_context(|| format!("expected create to fail for bucket {:?}", name))?;
        assert!(
            matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))),
            "expected validation error for bucket {:?}, got {:?}",
            name,
            err
        );
        let mut lom = store.alloc("c.jpg");
        let err = lom.init(&nested).await.err().with_context(|| format!("expected init to fail for bucket {:?}", name))?;
        assert!(!err.is_not_found(), "expected bucket {:?} to be rejected as invalid, not missing", name);
    }
    assert_eq!(store.list_prefix(&bucket, "").await?, vec!["b/c.jpg".to_string()], "expected the original bucket to be unaffected");
    Ok(())
}

#[tokio::test]
async fn load_errs_with_missing_object() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let mut lom = store.alloc("missing.jpg");
    lom.init(&bucket).await?;

    let err = lom.load().await.err().context("expected load to fail")?;

    assert!(err.is_not_found(), "expected a not found error, got {:?}", err);
    assert!(!lom.is_loaded(), "expected handle to remain unloaded");
    Ok(())
}

#[tokio::test]
async fn work_file_is_invisible_until_finalized() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let mut lom = store.alloc("big.bin");
    lom.init(&bucket).await?;
    let work_path = lom.work_path("test");
    let mut file = lom.create_file(&work_path).await?;
    file.write_all(&[7u8; 1024]).await?;
    file.flush().await?;
    drop(file);

    let mut reloaded = store.alloc("big.bin");
    reloaded.init(&bucket).await?;
    assert!(reloaded.load().await.is_err(), "expected object to be invisible before finalize");
    assert!(store.list_prefix(&bucket, "").await?.is_empty(), "expected no listed objects before finalize");

    store.finalize_object(&mut lom, &work_path, 1024).await?;

    reloaded.load().await.context("expected object to be visible after finalize")?;
    assert_eq!(reloaded.size(), 1024, "unexpected finalized size");
    assert!(!work_path.exists(), "expected work file to be moved into place");
    assert!(lom.fqn().exists(), "expected object content at its final path");
    Ok(())
}

#[tokio::test]
async fn list_prefix_is_scoped_to_bucket() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let other = Bucket::new(Provider::Hadron, "photos-old");
    store.create_bucket(&other).await?;
    for name in ["shard-1", "shard-2", "shard-3", "other-1"] {
        store.put_object(&bucket, name, &mut name.as_bytes()).await?;
    }
    store.put_object(&other, "shard-9", &mut &b"x"[..]).await?;

    let mut names = store.list_prefix(&bucket, "shard-").await?;
    names.sort();

    assert_eq!(names, vec!["shard-1", "shard-2", "shard-3"], "unexpected listing");
    Ok(())
}

#[tokio::test]
async fn delete_object_removes_content_and_metadata() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    store.put_object(&bucket, "a", &mut &b"abc"[..]).await?;
    let (lom, _file) = store.open_reader(&bucket, "a").await?;

    store.delete_object(&bucket, "a").await?;

    let err = store.open_reader(&bucket, "a").await.err().context("expected read of deleted object to fail")?;
    assert!(err.is_not_found(), "expected a not found error, got {:?}", err);
    assert!(!lom.fqn().exists(), "expected object content to be removed");
    Ok(())
}

#[tokio::test]
async fn dir_backend_fetches_cold_objects() -> Result<()> {
    let (store, _bucket, tmpdir) = new_store().await?;
    let bucket = Bucket::new(Provider::Cloud, "archive");
    store.create_bucket(&bucket).await?;
    let root = tmpdir.path().join("backend");
    tokio::fs::create_dir_all(root.join("archive")).await?;
    tokio::fs::write(root.join("archive").join("cold.bin"), vec![3u8; 300]).await?;
    let backend = DirBackend::new(&root);

    let mut lom = store.alloc("cold.bin");
    lom.init(&bucket).await?;
    backend.get_object(&store, &mut lom).await?;

    assert!(lom.is_loaded(), "expected handle to be loaded after cold get");
    let mut reloaded = store.alloc("cold.bin");
    reloaded.init(&bucket).await?;
    reloaded.load().await?;
    assert_eq!(reloaded.size(), 300, "unexpected size of fetched object");

    let mut missing = store.alloc("missing.bin");
    missing.init(&bucket).await?;
    let err = backend.get_object(&store, &mut missing).await.err().context("expected missing backend object to fail")?;
    assert!(err.is_not_found(), "expected a not found error, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn no_backend_always_errs() -> Result<()> {
    let (store, bucket, _tmpdir) = new_store().await?;
    let mut lom = store.alloc("a");
    lom.init(&bucket).await?;

    let err = NoBackend.get_object(&store, &mut lom).await.err().context("expected NoBackend to fail")?;

    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::Backend(_))), "unexpected error: {:?}", err);
    Ok(())
}
