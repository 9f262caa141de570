use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::AppError;
use crate::models::ObjHeader;
use crate::transport::wire::{self, Frame};
use crate::transport::{Transport, METRIC_BYTES_RECV, METRIC_OBJS_RECV};
use crate::utils;

/// The listener of inbound transport connections.
pub struct TransportServer {
    listener: TcpListener,
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl TransportServer {
    /// Create a new instance.
    pub fn new(listener: TcpListener, transport: Transport, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { listener, transport, shutdown_tx }
    }

    /// Bind a listener on the given address.
    pub async fn bind(addr: SocketAddr, transport: Transport, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.with_context(|| format!("error binding transport listener to {}", addr))?;
        Ok(Self::new(listener, transport, shutdown_tx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error reading transport listener address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "transport server is listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                conn_res = self.listener.accept() => match conn_res {
                    Ok((conn, peer)) => {
                        let (transport, shutdown_rx) = (self.transport.clone(), self.shutdown_tx.subscribe());
                        tokio::spawn(async move {
                            if let Err(err) = handle_conn(transport, conn, shutdown_rx).await {
                                tracing::debug!(error = ?err, %peer, "transport connection closed with error");
                            }
                        });
                    }
                    Err(err) => tracing::error!(error = ?err, "error accepting transport connection"),
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("transport server has shutdown");
        Ok(())
    }
}

/// Handle all objects of an inbound connection, in order.
#[tracing::instrument(level = "trace", skip(transport, conn, shutdown_rx))]
async fn handle_conn(transport: Transport, conn: TcpStream, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    conn.set_nodelay(true).context("error setting TCP_NODELAY on connection")?;
    let mut reader = BufReader::new(conn);
    let preamble = wire::read_preamble(&mut reader).await?;
    tracing::debug!(trname = %preamble.trname, sender = %preamble.sender, "inbound stream opened");
    let max_header_size = transport.config().transport_max_header_size;

    loop {
        let frame_res = tokio::select! {
            frame_res = wire::read_frame(&mut reader, max_header_size) => frame_res,
            _ = shutdown_rx.recv() => return Ok(()),
        };
        let hdr = match frame_res {
            Ok(Frame::Obj(hdr)) => hdr,
            Ok(Frame::Eos) => {
                tracing::debug!(trname = %preamble.trname, sender = %preamble.sender, "inbound stream ended");
                return Ok(());
            }
            Err(err) => {
                notify_stream_error(&transport, &preamble, &err).await;
                return Err(err);
            }
        };

        let size = hdr.size();
        let mut body = (&mut reader).take(size);
        match transport.endpoint_or_orphan(&preamble.trname, &hdr).await {
            Some(endpoint) => {
                endpoint.activity.begin();
                let handler = endpoint.handler.load_full();
                let name = hdr.full_name();
                if let Err(err) = handler.recv(hdr, &mut body, None).await {
                    tracing::error!(error = ?err, trname = %preamble.trname, obj = %name, "error handling inbound object");
                }
                endpoint.activity.end();
            }
            None => tracing::warn!(trname = %preamble.trname, obj = %hdr.full_name(), "dropping object for unregistered transport"),
        }
        let drained = utils::drain_reader(&mut body).await.context("error draining inbound object body");
        let remaining = body.limit();
        if let Err(err) = drained {
            notify_stream_error(&transport, &preamble, &err).await;
            return Err(err);
        }
        if remaining != 0 {
            let err = AppError::Transport(format!("stream from {} ended mid-object", preamble.sender)).into();
            notify_stream_error(&transport, &preamble, &err).await;
            return Err(err);
        }
        metrics::increment_counter!(METRIC_OBJS_RECV);
        metrics::counter!(METRIC_BYTES_RECV, size);
    }
}

/// Inform the handler of a transport that a stream from one of its senders has failed.
async fn notify_stream_error(transport: &Transport, preamble: &wire::Preamble, err: &anyhow::Error) {
    let endpoint = match transport.endpoint(&preamble.trname).await {
        Some(endpoint) => endpoint,
        None => return,
    };
    let hdr = ObjHeader {
        sender: preamble.sender.clone(),
        ..Default::default()
    };
    let err = anyhow::Error::from(AppError::Transport(format!("stream from {} failed: {:#}", preamble.sender, err)));
    let mut body = tokio::io::empty();
    let body: &mut (dyn AsyncRead + Send + Unpin) = &mut body;
    if let Err(err) = endpoint.handler.load_full().recv(hdr, body, Some(err)).await {
        tracing::error!(error = ?err, trname = %preamble.trname, "error handling stream failure");
    }
}
