use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use burrow_core::{Event, ReqId, Request, RequestEnvelope, Response, ServerFrame};
use tokio::{
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    IpcError,
    codec::{decode, encode},
    framing::{read_frame, write_frame},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<ReqId, oneshot::Sender<Response>>>>;

/// UNIX socket client that multiplexes request/response calls with pushed events.
///
/// A background task owns the read half. Responses are routed to the waiting
/// call by request id and events are queued for [`BurrowClient::next_event`].
pub struct BurrowClient {
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Pending,
    events: AsyncMutex<mpsc::UnboundedReceiver<Event>>,
    next_req_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl BurrowClient {
    /// Connects to the daemon socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(route_frames(read_half, Arc::clone(&pending), events_tx));

        Ok(Self {
            writer: AsyncMutex::new(write_half),
            pending,
            events: AsyncMutex::new(events_rx),
            next_req_id: AtomicU64::new(1),
            timeout: DEFAULT_TIMEOUT,
            reader,
        })
    }

    /// Overrides the per-call response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends one request and waits for its response.
    pub async fn call(&self, req: Request) -> Result<Response, IpcError> {
        let req_id = ReqId(self.next_req_id.fetch_add(1, Ordering::Relaxed));
        let payload = encode(&RequestEnvelope { req_id, body: req })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(req_id, tx);

        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &payload).await
        };
        if let Err(err) = sent {
            lock_pending(&self.pending).remove(&req_id);
            return Err(err);
        }

        match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IpcError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&req_id);
                Err(IpcError::Timeout)
            }
        }
    }

    /// Waits for the next pushed event. Returns `None` after the daemon hangs up.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other input.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }
}

impl Drop for BurrowClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_frames(
    mut reader: OwnedReadHalf,
    pending: Pending,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) => {
                if !err.is_disconnect() {
                    tracing::debug!(error = %err, "daemon stream failed");
                }
                break;
            }
        };

        match decode::<ServerFrame>(&frame) {
            Ok(ServerFrame::Response(envelope)) => {
                let waiter = lock_pending(&pending).remove(&envelope.req_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope.body);
                    }
                    None => tracing::debug!(req_id = envelope.req_id.0, "dropping unmatched response"),
                }
            }
            Ok(ServerFrame::Event(event)) => {
                let _ = events.send(event);
            }
            Err(err) => {
                tracing::debug!(error = %err, "undecodable frame from daemon");
                break;
            }
        }
    }

    // Dropping the senders wakes every in-flight call with `Closed`.
    lock_pending(&pending).clear();
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<ReqId, oneshot::Sender<Response>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
