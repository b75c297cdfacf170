use std::{fs, sync::Arc, time::Duration};

use async_trait::async_trait;
use burrow_core::{ErrorCode, Event, FileAction, FileMutation, ProjectId, Request, Response};
use burrow_ipc::{BurrowClient, serve_unix};
use burrowd::{
    DaemonConfig, DaemonDispatcher,
    ports::{PortProbe, Probe},
};
use tempfile::{TempDir, tempdir};
use tokio::time::{sleep, timeout};

struct AlwaysFree;

#[async_trait]
impl PortProbe for AlwaysFree {
    async fn probe(&self, _port: u16) -> Probe {
        Probe::Free
    }
}

async fn start_daemon(tmp: &TempDir) -> std::path::PathBuf {
    let socket = tmp.path().join("burrowd.sock");
    let handler = DaemonConfig {
        state_dir: tmp.path().join("state"),
        projects_dir: tmp.path().join("projects"),
        port_range: 4100..=4102,
        disable_pty: true,
        probe: Arc::new(AlwaysFree),
        ..DaemonConfig::default()
    }
    .build()
    .expect("daemon should build");
    fs::create_dir_all(tmp.path().join("projects").join("abc")).expect("project should exist");

    let dispatcher = Arc::new(DaemonDispatcher::from(handler));
    let path = socket.clone();
    tokio::spawn(async move {
        let _ = serve_unix(&path, dispatcher).await;
    });

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    socket
}

fn project() -> ProjectId {
    ProjectId("abc".to_string())
}

#[tokio::test]
async fn health_reports_capabilities() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket = start_daemon(&tmp).await;
    let client = BurrowClient::connect(&socket)
        .await
        .expect("client should connect");

    let health = client
        .call(Request::Health {})
        .await
        .expect("health should answer");
    assert_eq!(
        health,
        Response::Health {
            status: "ok".to_string(),
            pty_available: false,
        }
    );
}

#[tokio::test]
async fn ports_are_assigned_and_released_over_the_socket() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket = start_daemon(&tmp).await;
    let client = BurrowClient::connect(&socket)
        .await
        .expect("client should connect");

    let assigned = client
        .call(Request::PortAssign {
            project_id: project(),
        })
        .await
        .expect("assign should answer");
    assert_eq!(
        assigned,
        Response::Port {
            project_id: project(),
            port: Some(4100),
        }
    );

    let joined = client
        .call(Request::ProjectJoin {
            project_id: project(),
        })
        .await
        .expect("join should answer");
    match joined {
        Response::ProjectJoined { project, .. } => assert_eq!(project.assigned_port, Some(4100)),
        other => panic!("unexpected response: {other:?}"),
    }

    client
        .call(Request::PortRelease {
            project_id: project(),
        })
        .await
        .expect("release should answer");
    let after = client
        .call(Request::PortGet {
            project_id: project(),
        })
        .await
        .expect("get should answer");
    assert_eq!(
        after,
        Response::Port {
            project_id: project(),
            port: None,
        }
    );

    let unknown = client
        .call(Request::PortAssign {
            project_id: ProjectId("ghost".to_string()),
        })
        .await
        .expect("assign should answer");
    assert!(matches!(
        unknown,
        Response::Error {
            code: ErrorCode::NotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn file_updates_reach_other_subscribers_only() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket = start_daemon(&tmp).await;
    let author = BurrowClient::connect(&socket)
        .await
        .expect("author should connect");
    let viewer = BurrowClient::connect(&socket)
        .await
        .expect("viewer should connect");

    for client in [&author, &viewer] {
        let joined = client
            .call(Request::ProjectJoin {
                project_id: project(),
            })
            .await
            .expect("join should answer");
        assert!(matches!(joined, Response::ProjectJoined { .. }), "{joined:?}");
    }

    let mutation = FileMutation {
        file_path: "src/App.jsx".to_string(),
        content: Some("export default 1;".to_string()),
        is_folder: false,
        action: FileAction::Update,
    };
    let applied = author
        .call(Request::FileUpdate {
            project_id: project(),
            mutation: mutation.clone(),
        })
        .await
        .expect("update should answer");
    assert_eq!(
        applied,
        Response::FileApplied {
            project_id: project(),
            file_path: "src/App.jsx".to_string(),
        }
    );
    assert_eq!(
        fs::read_to_string(tmp.path().join("projects/abc/src/App.jsx"))
            .expect("file should be written"),
        "export default 1;"
    );

    let event = timeout(Duration::from_secs(2), viewer.next_event())
        .await
        .expect("viewer should receive a broadcast");
    assert_eq!(
        event,
        Some(Event::FileUpdated {
            project_id: project(),
            mutation,
        })
    );

    let echoed = timeout(Duration::from_millis(200), author.next_event()).await;
    assert!(echoed.is_err(), "author must not receive its own update");

    let escape = author
        .call(Request::FileUpdate {
            project_id: project(),
            mutation: FileMutation {
                file_path: "../outside.txt".to_string(),
                content: Some("nope".to_string()),
                is_folder: false,
                action: FileAction::Create,
            },
        })
        .await
        .expect("update should answer");
    assert!(matches!(
        escape,
        Response::Error {
            code: ErrorCode::PolicyDenied,
            ..
        }
    ));
    assert!(!tmp.path().join("projects/outside.txt").exists());
}

#[tokio::test]
async fn retire_releases_project_state() {
    let tmp = tempdir().expect("tempdir should be created");
    let socket = start_daemon(&tmp).await;
    let client = BurrowClient::connect(&socket)
        .await
        .expect("client should connect");

    client
        .call(Request::PortAssign {
            project_id: project(),
        })
        .await
        .expect("assign should answer");
    let retired = client
        .call(Request::ProjectRetire {
            project_id: project(),
        })
        .await
        .expect("retire should answer");
    assert_eq!(
        retired,
        Response::ProjectRetired {
            project_id: project(),
        }
    );

    let port = client
        .call(Request::PortGet {
            project_id: project(),
        })
        .await
        .expect("get should answer");
    assert_eq!(
        port,
        Response::Port {
            project_id: project(),
            port: None,
        }
    );
}
