use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use crate::error::AppError;
use crate::fixtures::TestCluster;
use crate::models::{Bucket, Provider};
use crate::xact::{XactKind, XactQuery, XactState};

#[tokio::test]
async fn renew_reuses_accepting_jobs_per_kind_and_bucket() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let registry = &cluster.nodes[0].registry;
    let (photos, videos) = (Bucket::new(Provider::Hadron, "photos"), Bucket::new(Provider::Hadron, "videos"));

    let first = registry.renew(XactKind::Archive, &photos).await?;
    let second = registry.renew(XactKind::Archive, &photos).await?;
    let other = registry.renew(XactKind::Archive, &videos).await?;

    assert_eq!(first.base().id(), second.base().id(), "expected job of the same bucket to be reused");
    assert_ne!(first.base().id(), other.base().id(), "expected a new job for a different bucket");

    first.abort("test");
    let third = registry.renew(XactKind::Archive, &photos).await?;
    assert_ne!(first.base().id(), third.base().id(), "expected aborted job to be replaced");
    Ok(())
}

#[tokio::test]
async fn abort_of_unknown_job_errs() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let err = match cluster.nodes[0].registry.abort("does-not-exist", "test").await {
        Ok(()) => bail!("expected abort of unknown job to fail"),
        Err(err) => err,
    };
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::XactNotFound(id)) if id == "does-not-exist"),
        "expected job not found error, got {:?}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn snapshots_are_filtered_by_query() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let registry = &cluster.nodes[0].registry;
    let (photos, videos) = (Bucket::new(Provider::Hadron, "photos"), Bucket::new(Provider::Hadron, "videos"));
    let photos_xact = registry.renew(XactKind::Archive, &photos).await?;
    registry.renew(XactKind::Archive, &videos).await?;

    let all = registry.snapshots(&XactQuery::default()).await;
    assert_eq!(all.len(), 2, "expected 2 jobs, got {:?}", all);

    let by_bucket = registry
        .snapshots(&XactQuery {
            bucket: Some(photos.clone()),
            ..Default::default()
        })
        .await;
    assert_eq!(by_bucket.len(), 1, "expected 1 job of bucket photos");
    assert_eq!(by_bucket[0].id, photos_xact.base().id(), "unexpected job of bucket photos");
    assert_eq!(by_bucket[0].bucket, "hdn/photos", "unexpected bucket of snapshot");
    assert_eq!(by_bucket[0].kind, XactKind::Archive, "unexpected kind of snapshot");

    registry.abort(photos_xact.base().id(), "test").await?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while photos_xact.is_running() {
        if Instant::now() >= deadline {
            bail!("timeout waiting for aborted job to finish");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let running = registry
        .snapshots(&XactQuery {
            only_running: true,
            ..Default::default()
        })
        .await;
    assert_eq!(running.len(), 1, "expected only the videos job to be running, got {:?}", running);
    assert_eq!(running[0].bucket, "hdn/videos", "unexpected running job");
    Ok(())
}

#[tokio::test]
async fn idle_jobs_finish_and_are_pruned() -> Result<()> {
    let cluster = TestCluster::new(1, |config| {
        config.xact_likely_idle_ms = 50;
        config.xact_totally_idle_ms = 200;
    })
    .await?;
    let registry = &cluster.nodes[0].registry;
    let photos = Bucket::new(Provider::Hadron, "photos");
    let xact = registry.renew(XactKind::Archive, &photos).await?;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if registry.prune_finished().await == 1 {
            break;
        }
        if Instant::now() >= deadline {
            bail!("timeout waiting for idle job to be pruned");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snap = xact.stats();
    assert_eq!(snap.state, XactState::Finished, "expected idle job to finish");
    assert!(snap.error.is_none() && !snap.aborted, "expected idle job to finish cleanly, got {:?}", snap);
    assert_eq!(snap.idle, Some(true), "expected idle flag in final snapshot");
    assert!(registry.snapshots(&XactQuery::default()).await.is_empty(), "expected no jobs after prune");
    assert!(!cluster.nodes[0].net.transport.is_registered("arch-hdn-photos").await, "expected job transport to be unregistered");

    let next = registry.renew(XactKind::Archive, &photos).await?;
    assert_ne!(next.base().id(), xact.base().id(), "expected a new job after the idle one finished");
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_running_jobs() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let registry = &cluster.nodes[0].registry;
    let xact = registry.renew(XactKind::Archive, &Bucket::new(Provider::Hadron, "photos")).await?;

    tokio::time::timeout(Duration::from_secs(10), registry.shutdown()).await?;

    assert!(!xact.is_running(), "expected job to have finished");
    assert_eq!(xact.stats().state, XactState::Aborted, "expected job to be aborted");
    assert!(registry.ctx().node_stop.is_aborted(), "expected node stop signal to be triggered");
    assert!(registry.snapshots(&XactQuery::default()).await.is_empty(), "expected registry to be empty");
    Ok(())
}
