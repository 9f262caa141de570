use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::models::{Bucket, Provider};
use crate::xact::{AbortSignal, XactBase, XactDemand, XactKind, XactState};

fn new_base(likely_idle_ms: u64) -> XactBase {
    let demand = XactDemand::new(Duration::from_secs(60), Duration::from_millis(likely_idle_ms));
    XactBase::new(XactKind::Archive, Bucket::new(Provider::Hadron, "photos"), Some(Arc::new(demand)))
}

#[tokio::test]
async fn abort_signal_keeps_first_reason_and_wakes_waiters() -> Result<()> {
    let signal = AbortSignal::new();
    let waiter = {
        let signal = signal.clone();
        tokio::spawn(async move { signal.aborted().await })
    };

    assert!(!signal.is_aborted(), "expected fresh signal to not be aborted");
    assert!(signal.abort("first"), "expected first abort to take effect");
    assert!(!signal.abort("second"), "expected second abort to be a no-op");

    assert_eq!(signal.reason(), Some("first"), "expected first reason to be retained");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .context("expected waiter to observe abort")??;
    // Waiting on an already aborted signal resolves immediately.
    tokio::time::timeout(Duration::from_millis(100), signal.aborted())
        .await
        .context("expected already aborted signal to resolve")?;
    Ok(())
}

#[tokio::test]
async fn demand_reports_idle_only_without_pending_work() -> Result<()> {
    let base = new_base(50);
    let demand = base.demand().context("expected demand accounting")?;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(demand.is_idle(), "expected job to be idle after the likely-idle window");
    assert_eq!(base.state(), XactState::Idle, "expected idle state");

    demand.inc_pending();
    assert!(!demand.is_idle(), "expected submit to clear idle immediately");
    assert_eq!(base.state(), XactState::Running, "expected running state with pending work");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!demand.is_idle(), "expected job with pending work to never be idle");

    demand.dec_pending();
    assert!(!demand.is_idle(), "expected completion to count as activity");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(demand.is_idle(), "expected job to be idle again");
    assert!(!demand.is_totally_idle(), "expected job to not yet be totally idle");
    Ok(())
}

#[tokio::test]
async fn stats_are_frozen_once_finished() -> Result<()> {
    let base = new_base(10);
    base.add_local(100);
    base.add_out(200);
    base.finish(None);

    let first = base.stats();
    base.add_in(300);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = base.stats();

    assert_eq!(first, second, "expected identical snapshots of a finished job");
    assert_eq!(first.state, XactState::Finished, "unexpected final state");
    assert!(first.end_time >= first.start_time && first.end_time != 0, "expected end time to be set");
    assert_eq!(first.stats.local_bytes, 100, "unexpected local bytes");
    assert_eq!(first.stats.out_objs, 1, "unexpected out objects");
    assert_eq!(first.stats.in_objs, 0, "expected counters updated after finish to be ignored");
    Ok(())
}

#[tokio::test]
async fn aborted_jobs_stay_aborted() -> Result<()> {
    let base = new_base(10);
    assert_eq!(base.state(), XactState::Running, "expected initial state to be running");
    assert!(base.is_accepting(), "expected new job to accept work");

    assert!(base.abort("user request"), "expected abort to take effect");
    assert_eq!(base.state(), XactState::Aborted, "expected aborted state");
    assert!(base.is_running(), "expected aborted job to run until teardown completes");
    assert!(!base.is_accepting(), "expected aborted job to reject new work");

    base.finish(Some(&anyhow::anyhow!("aborted mid-collection")));
    base.finish(None);
    let snap = base.stats();

    assert_eq!(snap.state, XactState::Aborted, "expected aborted state to be terminal");
    assert!(snap.aborted, "expected aborted flag in snapshot");
    assert_eq!(snap.error.as_deref(), Some("aborted mid-collection"), "expected first finish error to be retained");
    assert!(!base.is_running(), "expected finished job to not be running");
    assert!(!base.abort("again"), "expected abort of a finished job to be rejected");
    Ok(())
}

#[tokio::test]
async fn finished_jobs_cannot_be_aborted() -> Result<()> {
    let base = new_base(10);
    base.finish(None);

    assert!(!base.abort("late"), "expected abort after finish to be rejected");
    assert_eq!(base.stats().state, XactState::Finished, "expected finished state to be terminal");
    assert!(!base.stats().aborted, "expected aborted flag to remain unset");
    Ok(())
}
