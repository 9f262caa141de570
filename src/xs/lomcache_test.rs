use std::time::Duration;

use anyhow::{bail, Result};

use crate::error::{AppError, AppErrorExt};
use crate::fixtures::TestCluster;
use crate::models::archive::{ArchiveMsg, ListRange};
use crate::models::{Bucket, Provider};
use crate::xact::{XactKind, XactQuery, XactRequest, XactState};

const TIMEOUT: Duration = Duration::from_secs(15);

fn query(bucket: &Bucket) -> XactQuery {
    XactQuery {
        kind: Some(XactKind::LoadLomCache),
        bucket: Some(bucket.clone()),
        only_running: false,
    }
}

#[tokio::test]
async fn job_loads_all_objects_then_finishes() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let bucket = Bucket::new(Provider::Hadron, "photos");
    cluster.create_bucket(&bucket).await?;
    let mut total = 0;
    for idx in 0..12 {
        total += cluster.put_random("node-0", &bucket, &format!("img-{:02}.jpg", idx), 100 + idx).await?.len() as u64;
    }

    let xact = cluster.nodes[0].registry.renew(XactKind::LoadLomCache, &bucket).await?;
    assert!(!xact.base().kind().is_demand_based(), "expected warm-up jobs to not be demand-based");

    let snaps = cluster.wait_for_jobs(&query(&bucket), TIMEOUT, |snaps| snaps.iter().all(|snap| snap.end_time != 0)).await?;
    let snap = &snaps[0][0];
    assert_eq!(snap.state, XactState::Finished, "expected job to finish by itself, got {:?}", snap);
    assert_eq!(snap.error, None, "expected job to finish without error");
    assert_eq!(snap.stats.local_objs, 12, "expected every object to be loaded");
    assert_eq!(snap.stats.local_bytes, total, "expected loaded sizes to add up");
    assert_eq!(snap.idle, None, "expected no idle state for a job without demand");
    assert_eq!(snap.pending, None, "expected no pending count for a job without demand");
    Ok(())
}

#[tokio::test]
async fn job_of_missing_bucket_is_not_created() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let bucket = Bucket::new(Provider::Hadron, "does-not-exist");
    let err = match cluster.nodes[0].registry.renew(XactKind::LoadLomCache, &bucket).await {
        Ok(_) => bail!("expected renew of a job over a missing bucket to fail"),
        Err(err) => err,
    };
    assert!(err.is_not_found(), "expected bucket not found, got {:?}", err);
    assert!(cluster.nodes[0].registry.snapshots(&query(&bucket)).await.is_empty(), "expected no job to be registered");
    Ok(())
}

#[tokio::test]
async fn job_rejects_requests() -> Result<()> {
    let cluster = TestCluster::new(1, |_| ()).await?;
    let bucket = Bucket::new(Provider::Hadron, "photos");
    cluster.create_bucket(&bucket).await?;
    let xact = cluster.nodes[0].registry.renew(XactKind::LoadLomCache, &bucket).await?;

    let req = XactRequest::Archive(ArchiveMsg {
        from_bucket: bucket.clone(),
        to_bucket: bucket.clone(),
        arch_name: "a.tar".into(),
        list_range: ListRange::List(vec!["a".into()]),
    });
    let err = match xact.begin(&req).await {
        Ok(()) => bail!("expected begin on a warm-up job to fail"),
        Err(err) => err,
    };
    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))), "expected invalid input, got {:?}", err);
    assert!(xact.submit(req).is_err(), "expected submit on a warm-up job to fail");
    Ok(())
}
