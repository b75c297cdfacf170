use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use burrow_core::{
    ConnectionId, ErrorCode, Event, ReqId, Request, RequestEnvelope, Response, ResponseEnvelope,
    ServerFrame,
};
use serde::Deserialize;
use tokio::{
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::{Duration, timeout},
};

use crate::{
    IpcError,
    codec::{decode, encode},
    framing::{read_frame, write_frame},
};

/// Frames buffered per connection before event producers wait for the writer.
const OUTBOUND_CAPACITY: usize = 1024;

const WRITER_DRAIN: Duration = Duration::from_millis(500);

/// Handle for pushing frames to one connected client.
///
/// Clones share the same writer. Sends fail once the client disconnects.
#[derive(Debug, Clone)]
pub struct Outbound {
    conn: ConnectionId,
    tx: mpsc::Sender<ServerFrame>,
}

impl Outbound {
    /// Creates a handle around an existing frame channel.
    pub fn new(conn: ConnectionId, tx: mpsc::Sender<ServerFrame>) -> Self {
        Self { conn, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Queues an event, waiting for room. Returns false when the client is gone.
    pub async fn send(&self, event: Event) -> bool {
        self.tx.send(ServerFrame::Event(event)).await.is_ok()
    }

    /// Blocking variant for producers running on plain OS threads.
    pub fn blocking_send(&self, event: Event) -> bool {
        self.tx.blocking_send(ServerFrame::Event(event)).is_ok()
    }

    /// Queues an event without waiting. Returns false if the client is gone or far behind.
    pub fn try_send(&self, event: Event) -> bool {
        self.tx.try_send(ServerFrame::Event(event)).is_ok()
    }

    async fn respond(&self, envelope: ResponseEnvelope<Response>) -> bool {
        self.tx.send(ServerFrame::Response(envelope)).await.is_ok()
    }
}

/// Daemon-side request processing plus connection lifecycle hooks.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Called once per accepted connection before any request is read.
    async fn connected(&self, _outbound: Outbound) {}

    async fn handle(&self, conn: ConnectionId, req: Request) -> Response;

    /// Called once after the connection's read side ends, for any reason.
    async fn disconnected(&self, _conn: ConnectionId) {}
}

/// Accepts clients on `path` forever, serving each connection on its own task.
pub async fn serve_unix(path: &Path, handler: Arc<dyn RequestHandler>) -> Result<(), IpcError> {
    let listener = UnixListener::bind(path)?;
    let next_conn = AtomicU64::new(1);

    loop {
        let (stream, _) = listener.accept().await?;
        let conn = ConnectionId(next_conn.fetch_add(1, Ordering::Relaxed));
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            tracing::debug!(%conn, "client connected");
            if let Err(err) = handle_connection(conn, stream, handler).await {
                tracing::debug!(%conn, error = %err, "connection ended with error");
            }
            tracing::debug!(%conn, "client disconnected");
        });
    }
}

async fn handle_connection(
    conn: ConnectionId,
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), IpcError> {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let outbound = Outbound::new(conn, tx);
    let mut writer_task = tokio::spawn(drain_frames(conn, writer, rx));

    handler.connected(outbound.clone()).await;
    let result = read_requests(conn, &mut reader, &outbound, handler.as_ref()).await;

    handler.disconnected(conn).await;
    drop(outbound);

    // Let queued frames flush, then stop the writer even if a stray sender survives.
    if timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    result
}

async fn read_requests(
    conn: ConnectionId,
    reader: &mut OwnedReadHalf,
    outbound: &Outbound,
    handler: &dyn RequestHandler,
) -> Result<(), IpcError> {
    loop {
        let frame = match read_frame(reader).await {
            Ok(frame) => frame,
            Err(err) if err.is_disconnect() => return Ok(()),
            Err(err) => return Err(err),
        };

        match decode::<RequestEnvelope<Request>>(&frame) {
            Ok(req) => {
                let body = handler.handle(conn, req.body).await;
                let envelope = ResponseEnvelope {
                    req_id: req.req_id,
                    body,
                };
                if !outbound.respond(envelope).await {
                    return Err(IpcError::Closed);
                }
            }
            Err(err) => {
                if let Some(req_id) = extract_req_id(&frame) {
                    let envelope = ResponseEnvelope {
                        req_id,
                        body: Response::Error {
                            code: ErrorCode::InvalidRequest,
                            message: "failed to decode request envelope".to_string(),
                            detail: Some(err.to_string()),
                        },
                    };
                    let _ = outbound.respond(envelope).await;
                }
                return Err(err);
            }
        }
    }
}

async fn drain_frames(
    conn: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let written = match encode(&frame) {
            Ok(payload) => write_frame(&mut writer, &payload).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::debug!(%conn, error = %err, "dropping client writer");
            return;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReqIdOnly {
    req_id: ReqId,
}

fn extract_req_id(frame: &[u8]) -> Option<ReqId> {
    decode::<ReqIdOnly>(frame)
        .ok()
        .map(|decoded| decoded.req_id)
}
