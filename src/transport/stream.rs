use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit};

use crate::cluster::NodeInfo;
use crate::error::AppError;
use crate::transport::wire::{self, Preamble};
use crate::transport::{check_body_size, Activity, CollectorHandle, Endpoint, SendObj, Transport};
use crate::transport::{METRIC_BYTES_SENT, METRIC_OBJS_SENT};
use crate::utils;

/// The max time to wait for a peer to acknowledge the end of a stream by closing it.
const EOS_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// An object queued on a stream, holding one of its transport's burst permits.
pub(crate) struct StreamMsg {
    pub obj: SendObj,
    /// The length-prefixed, encoded header of the object.
    pub frame: Vec<u8>,
    pub permit: OwnedSemaphorePermit,
}

/// Stream state shared with the collector.
pub(crate) struct StreamState {
    pub activity: Activity,
    pub connected: AtomicBool,
    pub teardown: Notify,
}

/// A task owning the connection of one transport to one destination node.
pub(crate) struct StreamWorker {
    transport: Transport,
    endpoint: Arc<Endpoint>,
    dest: NodeInfo,
    closed: Arc<OnceLock<String>>,
    collector: CollectorHandle,
    sid: u64,
    state: Arc<StreamState>,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    conn: Option<BufWriter<TcpStream>>,
}

impl StreamWorker {
    /// Spawn a new stream worker, returning its queue.
    ///
    /// The worker exits once all senders of the returned queue are dropped.
    pub fn spawn(
        transport: Transport, endpoint: Arc<Endpoint>, dest: NodeInfo, closed: Arc<OnceLock<String>>, collector: CollectorHandle,
    ) -> mpsc::UnboundedSender<StreamMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StreamState {
            activity: Activity::new(),
            connected: AtomicBool::new(false),
            teardown: Notify::new(),
        });
        let sid = collector.register(state.clone());
        let worker = Self {
            transport,
            endpoint,
            dest,
            closed,
            collector,
            sid,
            state,
            rx,
            conn: None,
        };
        tokio::spawn(worker.run());
        tx
    }

    async fn run(mut self) {
        tracing::debug!(trname = %self.endpoint.trname, dest = %self.dest.id, sid = self.sid, "stream started");
        loop {
            tokio::select! {
                biased;
                msg_opt = self.rx.recv() => match msg_opt {
                    Some(msg) => self.handle_obj(msg).await,
                    None => break,
                },
                _ = self.state.teardown.notified() => self.handle_teardown().await,
            }
        }

        self.disconnect().await;
        self.collector.unregister(self.sid);
        tracing::debug!(trname = %self.endpoint.trname, dest = %self.dest.id, sid = self.sid, "stream stopped");
    }

    /// Write the given object to the stream, connecting first if needed.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(obj = %msg.obj.hdr.full_name()))]
    async fn handle_obj(&mut self, msg: StreamMsg) {
        let StreamMsg { mut obj, frame, permit } = msg;
        let res = match self.closed.get() {
            Some(reason) => Err(AppError::Transport(format!("transport {} is closed: {}", self.endpoint.trname, reason)).into()),
            None => {
                self.state.activity.begin();
                let res = self.write_obj(&mut obj, &frame).await;
                self.state.activity.end();
                res
            }
        };
        match res {
            Ok(written) => {
                metrics::increment_counter!(METRIC_OBJS_SENT);
                metrics::counter!(METRIC_BYTES_SENT, written);
                obj.complete(None);
            }
            Err(err) => {
                tracing::debug!(error = ?err, dest = %self.dest.id, "error sending object");
                obj.complete(Some(&err));
            }
        }
        self.endpoint.activity.end();
        drop(permit);
    }

    async fn write_obj(&mut self, obj: &mut SendObj, frame: &[u8]) -> Result<u64> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.dial().await?,
        };
        conn.write_all(frame).await.map_err(|err| self.transport_err("error writing object header", err))?;
        let written = match obj.body.as_mut() {
            Some(body) => tokio::io::copy(&mut body.take(obj.hdr.size()), &mut conn)
                .await
                .map_err(|err| self.transport_err("error writing object body", err))?,
            None => 0,
        };
        // A short body leaves the peer waiting on bytes that never come, so the connection is
        // dropped along with the error.
        check_body_size(&obj.hdr, written)?;
        conn.flush().await.map_err(|err| self.transport_err("error flushing stream", err))?;
        self.conn = Some(conn);
        Ok(written)
    }

    async fn dial(&mut self) -> Result<BufWriter<TcpStream>> {
        self.state.connected.store(false, Ordering::Release);
        let stream = TcpStream::connect(self.dest.addr)
            .await
            .map_err(|err| self.transport_err("error connecting", err))?;
        stream.set_nodelay(true).context("error setting TCP_NODELAY on stream")?;
        let mut conn = BufWriter::new(stream);
        let preamble = Preamble {
            trname: self.endpoint.trname.clone(),
            sender: self.transport.local_node_id().to_string(),
        };
        wire::write_preamble(&mut conn, &preamble).await?;
        self.state.connected.store(true, Ordering::Release);
        tracing::debug!(trname = %self.endpoint.trname, dest = %self.dest.id, addr = %self.dest.addr, "stream connected");
        Ok(conn)
    }

    /// Tear down the connection if the stream is still idle.
    async fn handle_teardown(&mut self) {
        let idle = self.transport.config().transport_idle_teardown();
        if !self.state.activity.is_quiet_for(idle) {
            return;
        }
        tracing::debug!(trname = %self.endpoint.trname, dest = %self.dest.id, "tearing down idle stream");
        self.disconnect().await;
    }

    /// Gracefully end the stream, waiting for the peer to close its side.
    ///
    /// Waiting on the peer keeps objects of a later connection from overtaking those still being
    /// processed by the peer on this one.
    async fn disconnect(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        self.state.connected.store(false, Ordering::Release);
        let res: Result<()> = async {
            wire::write_eos(&mut conn).await?;
            conn.shutdown().await.context("error shutting down stream")?;
            tokio::time::timeout(EOS_ACK_TIMEOUT, utils::drain_reader(conn.get_mut()))
                .await
                .context("timeout waiting for peer to close stream")?
                .context("error waiting for peer to close stream")?;
            Ok(())
        }
        .await;
        if let Err(err) = res {
            tracing::debug!(error = ?err, dest = %self.dest.id, "error ending stream");
        }
    }

    fn transport_err(&self, msg: &str, err: std::io::Error) -> anyhow::Error {
        AppError::Transport(format!("{} to {} ({}): {}", msg, self.dest.id, self.dest.addr, err)).into()
    }
}
