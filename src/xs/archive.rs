//! Archive build job.
//!
//! One job exists per source bucket on every node. An archive request is begun & submitted on
//! every node of the cluster. Each node processes only the constituents it owns per HRW: the
//! archive's owner node (HRW of the archive's full name) appends its own constituents directly
//! to the archive's tar writer, all other nodes stream theirs to the owner, which appends them as
//! they arrive. Once a non-owner has handed off all of its constituents, it sends an
//! `ArchiveDone` marker on the same ordered stream. The owner finalizes the archive once its own
//! iteration is complete & every other node of the Begin-time cluster view has reported, bounded
//! by the configured settle timeout.
//!
//! Constituent errors fail an explicit list archive, while range archives skip failing
//! constituents. A list archive failure fails the whole job.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tar::{Builder, Header};

use crate::cluster::{self, ClusterView, NodeInfo};
use crate::error::{AppError, AppErrorExt};
use crate::models::archive::{ArchiveMsg, ListRange, EXT_TAR};
use crate::models::{ObjHeader, Opcode};
use crate::objects::LocalObject;
use crate::transport::{DataMover, QuiRes, RecvHandler, SendBody, SendObj};
use crate::utils::ExactReader;
use crate::xact::{AbortSignal, Xact, XactArgs, XactBase, XactCtx, XactDemand, XactRequest};
use crate::xs::lriterator::{self, RangeSpec};

const METRIC_ARCHIVES_FINALIZED: &str = "hadron_xact_archives_finalized";
const METRIC_ARCHIVES_FAILED: &str = "hadron_xact_archives_failed";
const METRIC_ARCHIVE_ENTRIES: &str = "hadron_xact_archive_entries";

/// The tag of archive work files.
const WORK_TAG: &str = "arch";
/// The mode of archive entries.
const ENTRY_MODE: u32 = 0o644;

/// Create a new archive job.
pub fn new_xact(args: XactArgs) -> BoxFuture<'static, Result<Arc<dyn Xact>>> {
    Box::pin(async move {
        let xact: Arc<dyn Xact> = XactArch::new(args).await?;
        Ok(xact)
    })
}

/// The transport name used by archive jobs of the given bucket.
fn trname(args: &XactArgs) -> String {
    format!("arch-{}-{}", args.bucket.provider().as_str(), args.bucket.name)
}

/// A job building archives out of the objects of one bucket.
pub struct XactArch {
    shared: Arc<ArchShared>,
    dm: DataMover,
    work_tx: mpsc::UnboundedSender<String>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    err_rx: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Error>>>,
}

/// The state shared by the job, its tasks & its transport receive handler.
struct ArchShared {
    base: XactBase,
    demand: Arc<XactDemand>,
    ctx: XactCtx,
    trname: String,
    /// All begun archives which have not yet completed, by full name.
    pending: RwLock<HashMap<String, Arc<ArchWork>>>,
    /// Errors which are fatal to the job.
    err_tx: mpsc::UnboundedSender<anyhow::Error>,
    /// Triggered when the job begins teardown; observed by all tasks of the job.
    stop: AbortSignal,
}

/// A single archive being built.
struct ArchWork {
    msg: ArchiveMsg,
    full_name: String,
    /// The cluster view as of Begin, used for all placement decisions of this archive.
    view: Arc<ClusterView>,
    owner: Arc<NodeInfo>,
    is_owner: bool,
    /// The archive object handle, bound to the destination bucket.
    lom: LocalObject,
    work_path: PathBuf,
    /// The tar writer, only present on the owner until finalized.
    writer: Mutex<Option<Builder<File>>>,
    /// Completion markers received from other nodes, along with their failure, if any.
    peers: Mutex<HashMap<String, Option<String>>>,
    /// The number of sends whose callbacks have not yet fired.
    sends: AtomicUsize,
    /// The first failure of a send of this node.
    send_err: OnceLock<String>,
    /// The first failure to write to the tar writer, which leaves the archive unusable.
    write_err: OnceLock<String>,
    entries: AtomicU64,
    submitted: AtomicBool,
    notify: Notify,
}

impl XactArch {
    /// Create a new instance, opening the job's transport.
    pub async fn new(args: XactArgs) -> Result<Arc<Self>> {
        metrics::register_counter!(METRIC_ARCHIVES_FINALIZED, metrics::Unit::Count, "archives finalized");
        metrics::register_counter!(METRIC_ARCHIVES_FAILED, metrics::Unit::Count, "archives failed");
        metrics::register_counter!(METRIC_ARCHIVE_ENTRIES, metrics::Unit::Count, "entries appended to archives");

        let trname = trname(&args);
        let XactArgs { kind, bucket, ctx } = args;
        let demand = Arc::new(XactDemand::new(ctx.config.xact_totally_idle(), ctx.config.xact_likely_idle()));
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ArchShared {
            base: XactBase::new(kind, bucket, Some(demand.clone())),
            demand,
            ctx,
            trname: trname.clone(),
            pending: RwLock::new(HashMap::new()),
            err_tx,
            stop: AbortSignal::new(),
        });
        let dm = shared.ctx.transport.open(&trname, shared.clone()).await;
        Ok(Arc::new(Self {
            shared,
            dm,
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            err_rx: Mutex::new(Some(err_rx)),
        }))
    }

    /// Start processing the named archive, which must have been begun.
    async fn spawn_work(self: &Arc<Self>, full_name: &str, tasks: &mut FuturesUnordered<JoinHandle<()>>) {
        let work = self.shared.pending.read().await.get(full_name).cloned();
        let work = match work {
            Some(work) if !work.submitted.swap(true, Ordering::AcqRel) => work,
            Some(_) => {
                tracing::warn!(archive = full_name, "archive submitted more than once");
                self.shared.demand.dec_pending();
                return;
            }
            None => {
                tracing::warn!(archive = full_name, "archive submitted without begin");
                self.shared.demand.dec_pending();
                return;
            }
        };
        let xact = self.clone();
        tasks.push(tokio::spawn(async move { xact.do_archive(work).await }));
    }

    #[tracing::instrument(level = "debug", skip(self, work), fields(archive = %work.full_name, owner = %work.owner.id))]
    async fn do_archive(self: Arc<Self>, work: Arc<ArchWork>) {
        let res = match self.collect(&work).await {
            Ok(()) if work.is_owner => self.finalize(&work).await,
            Ok(()) => self.send_done(&work, None).await,
            Err(err) => {
                // The owner must learn of the failure before this node's job stops.
                if !work.is_owner && !err.is_aborted() {
                    if let Err(done_err) = self.send_done(&work, Some(&err)).await {
                        tracing::warn!(error = ?done_err, "error notifying archive owner of failure");
                    }
                }
                Err(err)
            }
        };
        if let Err(err) = res {
            metrics::increment_counter!(METRIC_ARCHIVES_FAILED);
            let escalate = !err.is_aborted() && (work.msg.is_list() || !err.is_transport());
            tracing::warn!(error = ?err, escalate, "archive failed");
            if escalate {
                let _ = self.shared.err_tx.send(err.context(format!("error building archive {}", work.full_name)));
            }
        }
        self.shared.finish_work(&work).await;
    }

    /// Process all constituents of the given archive owned by this node.
    async fn collect(&self, work: &Arc<ArchWork>) -> Result<()> {
        match &work.msg.list_range {
            ListRange::List(names) => self.collect_names(work, names.iter().cloned()).await?,
            ListRange::Range(raw) => match lriterator::parse(raw)? {
                RangeSpec::Template(tmpl) => self.collect_names(work, tmpl.names()).await?,
                RangeSpec::Prefix(prefix) => {
                    let names = self.shared.ctx.store.list_prefix(&work.msg.from_bucket, &prefix).await?;
                    self.collect_names(work, names.into_iter()).await?
                }
            },
        }
        if !work.is_owner {
            self.wait_sends(work).await?;
        }
        Ok(())
    }

    /// Process the given names, skipping those owned by other nodes; names are consumed lazily.
    async fn collect_names(&self, work: &Arc<ArchWork>, names: impl Iterator<Item = String> + Send) -> Result<()> {
        let local = self.shared.ctx.membership.local_node_id().clone();
        let (bucket, view) = (&work.msg.from_bucket, &work.view);
        let owned = names.filter_map(|name| match cluster::resolve(bucket.make_uname(&name).as_bytes(), view) {
            Ok(owner) if owner.id == local => Some(Ok(name)),
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        });
        futures::stream::iter(owned)
            .try_for_each_concurrent(self.shared.ctx.config.xact_workers, |name| self.collect_one(work, name))
            .await
    }

    /// Process one constituent, applying the list-vs-range error policy.
    async fn collect_one(&self, work: &Arc<ArchWork>, name: String) -> Result<()> {
        if self.shared.stop.is_aborted() {
            bail!(AppError::Aborted(format!("archive {}", work.full_name)));
        }
        match self.process_one(work, &name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_aborted() => Err(err),
            Err(err) if work.msg.is_list() => Err(err.context(format!("error collecting {}", name))),
            Err(err) if err.is_not_found() => {
                tracing::debug!(object = %name, "skipping missing archive constituent");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = ?err, object = %name, "skipping failed archive constituent");
                Ok(())
            }
        }
    }

    async fn process_one(&self, work: &Arc<ArchWork>, name: &str) -> Result<()> {
        let (store, bucket) = (&self.shared.ctx.store, &work.msg.from_bucket);
        let mut lom = store.alloc(name);
        lom.init(bucket).await?;
        match lom.load().await {
            Ok(()) => (),
            Err(err) if err.is_not_found() && bucket.is_remote() => {
                let full_name = lom.full_name();
                tokio::select! {
                    res = self.shared.ctx.backend.get_object(store, &mut lom) => res?,
                    _ = self.shared.stop.aborted() => bail!(AppError::Aborted(format!("cold get of {}", full_name))),
                }
            }
            Err(err) => return Err(err),
        }

        let file = lom.open().await?;
        let size = lom.size();
        if work.is_owner {
            let mut reader = ExactReader::new(file, size);
            if let Err(err) = self.shared.append(work, lom.obj_name(), lom.attrs().atime, size, &mut reader).await {
                work.record_write_err(&err);
                return Err(err);
            }
            self.shared.base.add_local(size);
        } else {
            self.send(work, &lom, file).await?;
        }
        self.shared.demand.touch();
        Ok(())
    }

    /// Send a constituent to the archive's owner.
    async fn send(&self, work: &Arc<ArchWork>, lom: &LocalObject, file: File) -> Result<()> {
        let hdr = ObjHeader {
            bucket: Some(work.msg.from_bucket.clone()),
            obj_name: lom.obj_name().into(),
            attrs: Some(lom.attrs().clone()),
            opaque: work.full_name.clone().into_bytes(),
            opcode: Opcode::Data as i32,
            ..Default::default()
        };
        let body: SendBody = Box::new(file);
        let obj = SendObj::new(hdr, Some(body)).with_callback(self.send_callback(work));
        self.dm.send(obj, &work.owner, self.shared.stop.aborted()).await
    }

    /// Notify the archive's owner that this node has handed off all of its constituents.
    async fn send_done(&self, work: &Arc<ArchWork>, err: Option<&anyhow::Error>) -> Result<()> {
        let hdr = ObjHeader {
            bucket: Some(work.msg.from_bucket.clone()),
            obj_name: work.msg.arch_name.clone(),
            opaque: work.full_name.clone().into_bytes(),
            opcode: Opcode::ArchiveDone as i32,
            error: err.map(|err| format!("{:#}", err)).unwrap_or_default(),
            ..Default::default()
        };
        let obj = SendObj::new(hdr, None).with_callback(self.send_callback(work));
        self.dm.send(obj, &work.owner, self.shared.stop.aborted()).await?;
        self.wait_sends(work).await
    }

    fn send_callback(&self, work: &Arc<ArchWork>) -> impl FnOnce(&ObjHeader, Option<&anyhow::Error>) + Send + 'static {
        work.sends.fetch_add(1, Ordering::AcqRel);
        let (shared, work) = (self.shared.clone(), work.clone());
        move |hdr: &ObjHeader, err: Option<&anyhow::Error>| {
            match err {
                None if hdr.opcode() == Opcode::Data => shared.base.add_out(hdr.size()),
                None => (),
                Some(err) => {
                    let _ = work.send_err.set(format!("error sending {} to {}: {:#}", hdr.full_name(), work.owner.id, err));
                }
            }
            work.sends.fetch_sub(1, Ordering::AcqRel);
            work.notify.notify_one();
        }
    }

    /// Wait for the callbacks of all sends of the given archive to fire.
    async fn wait_sends(&self, work: &ArchWork) -> Result<()> {
        loop {
            let notified = work.notify.notified();
            if work.sends.load(Ordering::Acquire) == 0 {
                break;
            }
            tokio::select! {
                _ = notified => (),
                _ = self.shared.stop.aborted() => bail!(AppError::Aborted(format!("archive {}", work.full_name))),
            }
        }
        match work.send_err.get() {
            Some(err) => bail!(AppError::Transport(err.clone())),
            None => Ok(()),
        }
    }

    /// Wait on the completion markers of all other nodes of the archive's cluster view.
    async fn wait_peers(&self, work: &ArchWork) -> Result<()> {
        let deadline = Instant::now() + self.shared.ctx.config.archive_settle_timeout();
        let local = self.shared.ctx.membership.local_node_id();
        loop {
            let notified = work.notify.notified();
            let missing: Vec<_> = {
                let peers = work.peers.lock().await;
                if let Some((peer, Some(err))) = peers.iter().find(|(_, err)| err.is_some()) {
                    bail!(AppError::Transport(format!("node {} failed to contribute: {}", peer, err)));
                }
                work.view
                    .nodes
                    .keys()
                    .filter(|id| *id != local && !peers.contains_key(id.as_str()))
                    .cloned()
                    .collect()
            };
            if missing.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = notified => (),
                _ = tokio::time::sleep_until(deadline) => {
                    // An explicit list may not silently lose constituents.
                    if work.msg.is_list() {
                        bail!(AppError::Transport(format!(
                            "archive {} is missing completion markers of nodes {:?}",
                            work.full_name, missing
                        )));
                    }
                    tracing::warn!(?missing, "finalizing archive without completion markers of all nodes");
                    return Ok(());
                }
                _ = self.shared.stop.aborted() => bail!(AppError::Aborted(format!("archive {}", work.full_name))),
            }
        }
    }

    /// Close the archive & register it as an object.
    async fn finalize(&self, work: &ArchWork) -> Result<()> {
        self.wait_peers(work).await?;
        if let Some(err) = work.write_err.get() {
            bail!("archive {} is unusable: {}", work.full_name, err);
        }
        let builder = work
            .writer
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Ise(anyhow!("archive {} has no open writer", work.full_name)))?;
        let res: Result<u64> = async {
            let mut file = builder.into_inner().await.context("error finishing archive")?;
            file.flush().await.context("error flushing archive")?;
            let size = file.seek(SeekFrom::End(0)).await.context("error measuring archive size")?;
            drop(file);

            // The archive is a new composite object, no constituent checksum applies to it.
            let mut lom = work.lom.clone();
            lom.set_checksum("", "");
            self.shared.ctx.store.finalize_object(&mut lom, &work.work_path, size).await?;
            Ok(size)
        }
        .await;
        let size = match res {
            Ok(size) => size,
            Err(err) => {
                if let Err(rm_err) = tokio::fs::remove_file(&work.work_path).await {
                    tracing::warn!(error = ?rm_err, path = ?work.work_path, "error removing archive work file");
                }
                return Err(err);
            }
        };
        metrics::increment_counter!(METRIC_ARCHIVES_FINALIZED);
        tracing::info!(archive = %work.full_name, size, entries = work.entries.load(Ordering::Acquire), "archive finalized");
        Ok(())
    }

    /// Tear down the job once its run loop has exited.
    ///
    /// Returns the error the job finishes with.
    async fn teardown(
        &self, work_rx: &mut mpsc::UnboundedReceiver<String>, tasks: &mut FuturesUnordered<JoinHandle<()>>, mut err: Option<anyhow::Error>,
    ) -> Option<anyhow::Error> {
        let base = &self.shared.base;
        base.set_stopping();
        work_rx.close();
        self.shared.stop.abort(base.abort_signal().reason().unwrap_or("job stopping"));
        while let Some(res) = tasks.next().await {
            if let Err(err) = res {
                tracing::error!(error = ?err, "error joining archive task");
            }
        }
        // Submitted but never started.
        while let Ok(full_name) = work_rx.try_recv() {
            tracing::debug!(archive = %full_name, "dropping submitted archive of stopping job");
            self.shared.demand.dec_pending();
        }

        let quiesce = self.shared.ctx.config.xact_quiesce();
        match self.dm.quiesce(quiesce, quiesce * 10, self.shared.ctx.node_stop.aborted()).await {
            QuiRes::Done => (),
            QuiRes::Aborted => {
                tracing::warn!("archive transport quiesce interrupted by node shutdown");
                if err.is_none() {
                    err = Some(AppError::Aborted(format!("job {}", base)).into());
                }
            }
            res => tracing::warn!(?res, "archive transport did not quiesce"),
        }
        self.dm.close(err.as_ref()).await;
        self.dm.unregister().await;
        self.shared.cleanup().await;
        err
    }
}

#[async_trait]
impl Xact for XactArch {
    fn base(&self) -> &XactBase {
        &self.shared.base
    }

    async fn begin(&self, req: &XactRequest) -> Result<()> {
        match req {
            XactRequest::Archive(msg) => self.shared.begin(msg).await,
        }
    }

    fn submit(&self, req: XactRequest) -> Result<()> {
        let msg = match req {
            XactRequest::Archive(msg) => msg,
        };
        self.shared.demand.inc_pending();
        if self.work_tx.send(msg.full_name()).is_err() {
            self.shared.demand.dec_pending();
            bail!(AppError::Aborted(format!("job {}", self.shared.base)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(xact = %self.shared.base))]
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut work_rx = self.work_rx.lock().await.take().context("archive job already running")?;
        let mut err_rx = self.err_rx.lock().await.take().context("archive job already running")?;
        let mut tasks = FuturesUnordered::new();
        let (base, demand) = (&self.shared.base, &self.shared.demand);

        let err: Option<anyhow::Error> = loop {
            tokio::select! {
                Some(full_name) = work_rx.recv() => self.spawn_work(&full_name, &mut tasks).await,
                Some(res) = tasks.next(), if !tasks.is_empty() => {
                    if let Err(err) = res {
                        tracing::error!(error = ?err, "error joining archive task");
                    }
                }
                Some(err) = err_rx.recv() => break Some(err),
                _ = tokio::time::sleep_until(demand.next_idle_check()) => {
                    if demand.is_totally_idle() {
                        tracing::debug!("archive job is idle, stopping");
                        break None;
                    }
                }
                _ = base.abort_signal().aborted() => {
                    let reason = base.abort_signal().reason().unwrap_or_default();
                    break Some(AppError::Aborted(format!("job {}: {}", base, reason)).into());
                }
            }
        };

        let err = self.teardown(&mut work_rx, &mut tasks, err).await;
        let err = err.or_else(|| err_rx.try_recv().ok());
        base.finish(err.as_ref());
        Ok(())
    }
}

impl ArchShared {
    /// Validate the given request & register its archive.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(archive = %msg.full_name()))]
    async fn begin(&self, msg: &ArchiveMsg) -> Result<()> {
        if !self.base.is_accepting() {
            bail!(AppError::Aborted(format!("job {}", self.base)));
        }
        if !msg.arch_name.ends_with(EXT_TAR) {
            bail!(AppError::InvalidInput(format!(
                "archive name {} has an unsupported format, only {} is supported",
                msg.arch_name, EXT_TAR
            )));
        }
        if &msg.from_bucket != self.base.bucket() {
            bail!(AppError::InvalidInput(format!("job {} can not archive objects of bucket {}", self.base, msg.from_bucket)));
        }
        if !self.ctx.store.bucket_exists(&msg.from_bucket).await? {
            bail!(AppError::BucketNotFound(msg.from_bucket.to_string()));
        }
        match &msg.list_range {
            ListRange::List(names) if names.is_empty() => bail!(AppError::InvalidInput("archive list may not be empty".into())),
            ListRange::List(_) => (),
            ListRange::Range(raw) => {
                let max = self.ctx.config.archive_max_range_names;
                if let RangeSpec::Template(tmpl) = lriterator::parse(raw)? {
                    if tmpl.num_names() > max {
                        bail!(AppError::InvalidInput(format!(
                            "range {} expands to {} names, at most {} are allowed",
                            raw,
                            tmpl.num_names(),
                            max
                        )));
                    }
                }
            }
        }
        let mut lom = self.ctx.store.alloc(&msg.arch_name);
        lom.init(&msg.to_bucket).await?;

        let full_name = msg.full_name();
        let view = self.ctx.membership.current_view();
        let owner = cluster::resolve(full_name.as_bytes(), &view)?;
        let is_owner = owner.id == *self.ctx.membership.local_node_id();
        let work_path = lom.work_path(WORK_TAG);

        let mut pending = self.pending.write().await;
        if pending.contains_key(&full_name) {
            bail!(AppError::InvalidInput(format!("archive {} is already being built", full_name)));
        }
        let peers = if is_owner { self.take_early_arrivals(&full_name).await? } else { HashMap::new() };
        let writer = if is_owner {
            Some(Builder::new(lom.create_file(&work_path).await?))
        } else {
            None
        };
        tracing::debug!(owner = %owner.id, is_owner, "archive begun");
        pending.insert(
            full_name.clone(),
            Arc::new(ArchWork {
                msg: msg.clone(),
                full_name,
                view,
                owner,
                is_owner,
                lom,
                work_path,
                writer: Mutex::new(writer),
                peers: Mutex::new(peers),
                sends: AtomicUsize::new(0),
                send_err: OnceLock::new(),
                write_err: OnceLock::new(),
                entries: AtomicU64::new(0),
                submitted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        );
        self.demand.touch();
        Ok(())
    }

    /// Collect whatever peers sent for the named archive before it was begun here.
    ///
    /// Completion markers carry over. Any constituent which arrived early was dropped, so the
    /// archive can not be built.
    async fn take_early_arrivals(&self, full_name: &str) -> Result<HashMap<String, Option<String>>> {
        let max_age = self.ctx.config.archive_settle_timeout();
        let orphans = self.ctx.transport.take_orphans(&self.trname, full_name.as_bytes(), max_age).await;
        let dropped = orphans.iter().filter(|hdr| hdr.opcode() == Opcode::Data).count();
        if dropped > 0 {
            bail!(AppError::Transport(format!("archive {} received {} object(s) before it was begun", full_name, dropped)));
        }
        let mut peers = HashMap::new();
        for hdr in orphans {
            tracing::debug!(sender = %hdr.sender, "completion marker arrived before begin");
            let err = Some(hdr.error).filter(|err| !err.is_empty());
            peers.entry(hdr.sender).or_insert(err);
        }
        Ok(peers)
    }

    /// Append an entry to the given archive.
    async fn append<R: AsyncRead + Unpin + Send>(&self, work: &ArchWork, name: &str, atime: i64, size: u64, reader: R) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_size(size);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(u64::try_from(atime / 1_000_000_000).unwrap_or(0));

        let mut writer = work.writer.lock().await;
        let builder = match writer.as_mut() {
            Some(builder) => builder,
            None => bail!("archive {} is no longer open for writing", work.full_name),
        };
        builder
            .append_data(&mut header, name, reader)
            .await
            .with_context(|| format!("error appending {} to archive {}", name, work.full_name))?;
        work.entries.fetch_add(1, Ordering::AcqRel);
        metrics::increment_counter!(METRIC_ARCHIVE_ENTRIES);
        Ok(())
    }

    /// Remove the given archive from the pending set, releasing its pending count.
    async fn finish_work(&self, work: &Arc<ArchWork>) {
        {
            let mut pending = self.pending.write().await;
            if pending.get(&work.full_name).map(|cur| Arc::ptr_eq(cur, work)).unwrap_or(false) {
                pending.remove(&work.full_name);
            }
        }
        work.discard().await;
        self.demand.dec_pending();
    }

    /// Discard all archives which never completed.
    async fn cleanup(&self) {
        let works: Vec<_> = self.pending.write().await.drain().map(|(_, work)| work).collect();
        for work in works {
            tracing::debug!(archive = %work.full_name, "discarding incomplete archive");
            work.discard().await;
        }
    }

    /// Fail all archives still waiting on a completion marker of the given node.
    async fn fail_peer(&self, peer: &str, err: &anyhow::Error) {
        let works: Vec<_> = self.pending.read().await.values().filter(|work| work.is_owner).cloned().collect();
        for work in works {
            if work.view.get(peer).is_some() {
                work.record_peer(peer, Some(format!("stream failed: {:#}", err))).await;
            }
        }
    }
}

#[async_trait]
impl RecvHandler for ArchShared {
    async fn recv(&self, hdr: ObjHeader, body: &mut (dyn AsyncRead + Send + Unpin), err: Option<anyhow::Error>) -> Result<()> {
        if let Some(err) = err {
            tracing::warn!(error = ?err, sender = %hdr.sender, "archive stream from peer failed");
            self.fail_peer(&hdr.sender, &err).await;
            return Ok(());
        }
        self.demand.touch();
        let full_name = String::from_utf8_lossy(&hdr.opaque).to_string();
        let work = {
            let pending = self.pending.read().await;
            match pending.get(&full_name) {
                Some(work) if work.is_owner => work.clone(),
                Some(_) => {
                    tracing::warn!(archive = %full_name, sender = %hdr.sender, object = %hdr.obj_name, "dropping object of archive owned by another node");
                    return Ok(());
                }
                // Recorded under the pending lock, so a concurrent begin either sees it or precedes it.
                None => {
                    tracing::warn!(archive = %full_name, sender = %hdr.sender, object = %hdr.obj_name, "object of an archive not begun here");
                    self.ctx.transport.record_orphan(&self.trname, &hdr).await;
                    return Ok(());
                }
            }
        };

        match hdr.opcode() {
            Opcode::ArchiveDone => {
                let err = Some(hdr.error.clone()).filter(|err| !err.is_empty());
                work.record_peer(&hdr.sender, err).await;
            }
            Opcode::Data => {
                let size = hdr.size();
                let atime = hdr.attrs.as_ref().map(|attrs| attrs.atime).unwrap_or(0);
                match self.append(&work, &hdr.obj_name, atime, size, ExactReader::new(body, size)).await {
                    Ok(()) => self.base.add_in(size),
                    // A partial entry leaves the archive unusable.
                    Err(err) => work.record_peer(&hdr.sender, Some(format!("{:#}", err))).await,
                }
            }
        }
        Ok(())
    }
}

impl ArchWork {
    fn record_write_err(&self, err: &anyhow::Error) {
        let _ = self.write_err.set(format!("{:#}", err));
    }

    /// Record the completion of the given peer; a failure is never overwritten.
    async fn record_peer(&self, peer: &str, err: Option<String>) {
        let mut peers = self.peers.lock().await;
        let entry = peers.entry(peer.to_string()).or_insert(None);
        if entry.is_none() {
            *entry = err;
        }
        drop(peers);
        self.notify.notify_one();
    }

    /// Drop the writer & work file of this archive, if still present.
    async fn discard(&self) {
        if let Some(builder) = self.writer.lock().await.take() {
            drop(builder);
            if let Err(err) = tokio::fs::remove_file(&self.work_path).await {
                tracing::warn!(error = ?err, path = ?self.work_path, "error removing archive work file");
            }
        }
    }
}
