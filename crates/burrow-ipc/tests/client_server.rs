use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use burrow_core::{
    ConnectionId, ErrorCode, Event, PROTOCOL_VERSION, Request, Response, TerminalId,
};
use burrow_ipc::{BurrowClient, IpcError, Outbound, RequestHandler, serve_unix};
use tempfile::tempdir;
use tokio::{
    sync::mpsc,
    time::{Duration, sleep, timeout},
};

struct EchoHandler {
    outbound: Mutex<HashMap<ConnectionId, Outbound>>,
    gone: mpsc::UnboundedSender<ConnectionId>,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn connected(&self, outbound: Outbound) {
        self.outbound
            .lock()
            .expect("lock")
            .insert(outbound.connection(), outbound);
    }

    async fn handle(&self, conn: ConnectionId, req: Request) -> Response {
        match req {
            Request::Version {} => Response::Version {
                daemon: "test".to_string(),
                protocol: PROTOCOL_VERSION,
            },
            Request::TerminalInput { terminal_id, data } => {
                let outbound = self.outbound.lock().expect("lock").get(&conn).cloned();
                if let Some(outbound) = outbound {
                    outbound
                        .send(Event::TerminalOutput {
                            terminal_id: terminal_id.clone(),
                            data,
                        })
                        .await;
                }
                Response::TerminalAck { terminal_id }
            }
            _ => Response::Error {
                code: ErrorCode::InvalidRequest,
                message: "unsupported in test".to_string(),
                detail: None,
            },
        }
    }

    async fn disconnected(&self, conn: ConnectionId) {
        self.outbound.lock().expect("lock").remove(&conn);
        let _ = self.gone.send(conn);
    }
}

async fn connect(socket_path: &Path) -> BurrowClient {
    for _ in 0..200 {
        match BurrowClient::connect(socket_path).await {
            Ok(client) => return client,
            Err(IpcError::Io(_)) => sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("client should connect: {err}"),
        }
    }
    panic!("daemon socket never became available");
}

#[tokio::test]
async fn responses_and_pushed_events_share_one_socket() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket_path = tmp.path().join("burrowd.sock");

    let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(EchoHandler {
        outbound: Mutex::new(HashMap::new()),
        gone: gone_tx,
    });
    let server_socket = socket_path.clone();
    let server = tokio::spawn(async move { serve_unix(&server_socket, handler).await });

    let client = connect(&socket_path).await;

    match client
        .call(Request::Version {})
        .await
        .expect("version call should succeed")
    {
        Response::Version { protocol, .. } => assert_eq!(protocol, PROTOCOL_VERSION),
        other => panic!("unexpected response: {other:?}"),
    }

    let terminal_id = TerminalId("term-demo-1".to_string());
    let ack = client
        .call(Request::TerminalInput {
            terminal_id: terminal_id.clone(),
            data: b"ls\r".to_vec(),
        })
        .await
        .expect("input call should succeed");
    assert_eq!(
        ack,
        Response::TerminalAck {
            terminal_id: terminal_id.clone()
        }
    );

    let event = timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("event should arrive")
        .expect("stream should stay open");
    assert_eq!(
        event,
        Event::TerminalOutput {
            terminal_id,
            data: b"ls\r".to_vec(),
        }
    );

    drop(client);
    let conn = timeout(Duration::from_secs(2), gone_rx.recv())
        .await
        .expect("disconnect hook should run")
        .expect("hook channel open");
    assert_eq!(conn, ConnectionId(1));

    server.abort();
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_request_id() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket_path = tmp.path().join("burrowd.sock");

    let (gone_tx, _gone_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(EchoHandler {
        outbound: Mutex::new(HashMap::new()),
        gone: gone_tx,
    });
    let server_socket = socket_path.clone();
    let server = tokio::spawn(async move { serve_unix(&server_socket, handler).await });

    let client = Arc::new(connect(&socket_path).await);
    let mut tasks = Vec::new();
    for n in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let terminal_id = TerminalId(format!("term-demo-{n}"));
            let response = client
                .call(Request::TerminalInput {
                    terminal_id: terminal_id.clone(),
                    data: Vec::new(),
                })
                .await
                .expect("call should succeed");
            assert_eq!(response, Response::TerminalAck { terminal_id });
        }));
    }
    for task in tasks {
        task.await.expect("task should join");
    }

    server.abort();
}
