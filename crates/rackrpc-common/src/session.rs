//! Symmetric session driver for an authenticated stream.
//!
//! A [`Session`] owns one stream after the handshake. It sends our calls and
//! matches responses to them by id, and concurrently answers the peer's calls
//! from the local [`CommandTable`]. The driver ends on local close, peer EOF,
//! a read/write failure or a malformed frame; outstanding calls then fail
//! with [`RpcError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};

use crate::dispatch::CommandTable;
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Frame, Request, RequestId, Response, RpcResult};
use crate::transport::{BoxedStream, TcpTransport};

const CHANNEL_DEPTH: usize = 64;

struct Outgoing {
    request: Request,
    reply: oneshot::Sender<Result<RpcResult>>,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    outbound: mpsc::Sender<Outgoing>,
    close: Arc<Notify>,
    closed: watch::Receiver<bool>,
}

impl Session {
    /// Starts driving `stream`; `peer` is used for log context only.
    pub fn spawn(stream: BoxedStream, table: Arc<CommandTable>, peer: impl Into<String>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let close = Arc::new(Notify::new());
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(drive(
            stream,
            table,
            outbound_rx,
            close.clone(),
            closed_tx,
            peer.into(),
        ));

        Self {
            outbound: outbound_tx,
            close,
            closed: closed_rx,
        }
    }

    /// Invokes `command` on the peer.
    pub async fn call(
        &self,
        command: &str,
        args: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<RpcResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let outgoing = Outgoing {
            request: Request::new(command, args),
            reply: reply_tx,
        };
        self.outbound
            .send(outgoing)
            .await
            .map_err(|_| RpcError::ConnectionClosed)?;

        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| RpcError::Timeout(limit.as_millis() as u64))?,
            None => reply_rx.await,
        };
        reply.map_err(|_| RpcError::ConnectionClosed)?
    }

    /// Asks the driver to stop. Returns immediately; use [`closed`](Self::closed) to wait.
    pub fn close(&self) {
        self.close.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the driver has stopped and released the stream.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // An error means the driver is gone, which is also closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

async fn drive(
    stream: BoxedStream,
    table: Arc<CommandTable>,
    mut outbound_rx: mpsc::Receiver<Outgoing>,
    close: Arc<Notify>,
    closed_tx: watch::Sender<bool>,
    peer: String,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Reads run in their own task because read_exact is not cancel-safe.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Result<Frame>>(CHANNEL_DEPTH);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = TcpTransport::receive_frame(&mut reader).await;
            let failed = frame.is_err();
            if inbound_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let (replies_tx, mut replies_rx) = mpsc::channel::<Response>(CHANNEL_DEPTH);
    let mut pending: HashMap<RequestId, oneshot::Sender<Result<RpcResult>>> = HashMap::new();

    loop {
        tokio::select! {
            _ = close.notified() => {
                debug!(peer = %peer, "session closed locally");
                break;
            }
            outgoing = outbound_rx.recv() => {
                let Some(Outgoing { request, reply }) = outgoing else {
                    debug!(peer = %peer, "all session handles dropped");
                    break;
                };
                let id = request.id;
                match TcpTransport::send_frame(&mut writer, &Frame::Request(request)).await {
                    Ok(()) => {
                        pending.insert(id, reply);
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to send request");
                        let _ = reply.send(Err(e));
                        break;
                    }
                }
            }
            Some(response) = replies_rx.recv() => {
                if let Err(e) = TcpTransport::send_frame(&mut writer, &Frame::Response(response)).await {
                    warn!(peer = %peer, error = %e, "failed to send response");
                    break;
                }
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(Frame::Response(response))) => match pending.remove(&response.id) {
                    Some(reply) => {
                        let _ = reply.send(response.into_result());
                    }
                    None => debug!(peer = %peer, id = response.id, "response for unknown request"),
                },
                Some(Ok(Frame::Request(request))) => {
                    debug!(peer = %peer, command = %request.command, "dispatching remote call");
                    let handled = table.dispatch(request);
                    let replies = replies_tx.clone();
                    tokio::spawn(async move {
                        let _ = replies.send(handled.await).await;
                    });
                }
                Some(Err(RpcError::ConnectionClosed)) | None => {
                    debug!(peer = %peer, "session closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "session read failed");
                    break;
                }
            },
        }
    }

    reader_task.abort();
    let _ = writer.shutdown().await;
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RpcError::ConnectionClosed));
    }
    let _ = closed_tx.send(true);
}
