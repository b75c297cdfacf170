use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use burrow_core::{BurrowError, ConnectionId, ErrorCode, Event, FileMutation, ProjectId};
use burrow_ipc::Outbound;
use burrow_policy::resolve_within;
use tokio::{fs, sync::Mutex as AsyncMutex};
use tracing::{debug, warn};

type Subscribers = HashMap<ProjectId, HashMap<ConnectionId, Outbound>>;

/// Which connections listen to which project, plus one write lock per project.
#[derive(Default)]
pub struct ProjectHub {
    subscribers: Mutex<Subscribers>,
    write_locks: Mutex<HashMap<ProjectId, Arc<AsyncMutex<()>>>>,
}

impl ProjectHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the connection behind `outbound` to the project's broadcasts.
    pub fn join(&self, project_id: &ProjectId, outbound: Outbound) {
        let conn = outbound.connection();
        self.lock_subscribers()
            .entry(project_id.clone())
            .or_default()
            .insert(conn, outbound);
        debug!(project_id = %project_id, %conn, "joined project");
    }

    /// Returns false when the connection was not subscribed.
    pub fn leave(&self, project_id: &ProjectId, conn: ConnectionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let Some(members) = subscribers.get_mut(project_id) else {
            return false;
        };
        let removed = members.remove(&conn).is_some();
        if members.is_empty() {
            subscribers.remove(project_id);
        }
        removed
    }

    /// Drops every subscription held by a departing connection.
    pub fn drop_connection(&self, conn: ConnectionId) {
        self.lock_subscribers().retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }

    /// Forgets a deleted project entirely.
    pub fn drop_project(&self, project_id: &ProjectId) {
        self.lock_subscribers().remove(project_id);
        self.lock_write_locks().remove(project_id);
    }

    pub fn subscriber_count(&self, project_id: &ProjectId) -> usize {
        self.lock_subscribers()
            .get(project_id)
            .map_or(0, HashMap::len)
    }

    /// Pushes a file change to every subscriber except `originator`. Returns how many were reached.
    pub fn notify(
        &self,
        project_id: &ProjectId,
        mutation: &FileMutation,
        originator: Option<ConnectionId>,
    ) -> usize {
        let targets: Vec<Outbound> = self
            .lock_subscribers()
            .get(project_id)
            .map(|members| {
                members
                    .values()
                    .filter(|outbound| Some(outbound.connection()) != originator)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for outbound in targets {
            let event = Event::FileUpdated {
                project_id: project_id.clone(),
                mutation: mutation.clone(),
            };
            if outbound.try_send(event) {
                delivered += 1;
            } else {
                warn!(
                    project_id = %project_id,
                    conn = %outbound.connection(),
                    file_path = %mutation.file_path,
                    "dropped file broadcast for unreachable subscriber"
                );
            }
        }
        delivered
    }

    fn write_lock(&self, project_id: &ProjectId) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.lock_write_locks()
                .entry(project_id.clone())
                .or_default(),
        )
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_write_locks(&self) -> MutexGuard<'_, HashMap<ProjectId, Arc<AsyncMutex<()>>>> {
        self.write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies file mutations to a sandbox and tells the other subscribers.
///
/// Writes for one project are applied in the order they acquire the project
/// lock. There is no merging: the last write to a path wins.
pub struct BroadcastSync {
    hub: Arc<ProjectHub>,
}

impl BroadcastSync {
    pub fn new(hub: Arc<ProjectHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<ProjectHub> {
        &self.hub
    }

    /// Writes the mutation below `root` and notifies everyone but `originator`.
    pub async fn apply(
        &self,
        project_id: &ProjectId,
        root: &Path,
        originator: ConnectionId,
        mutation: FileMutation,
    ) -> Result<PathBuf, BurrowError> {
        let target = mutation_target(root, &mutation.file_path)?;

        let lock = self.hub.write_lock(project_id);
        let _guard = lock.lock().await;

        if mutation.is_folder {
            fs::create_dir_all(&target)
                .await
                .map_err(|err| BurrowError::io("create folder", err))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| BurrowError::io("create parent folders", err))?;
            }
            fs::write(&target, mutation.content.as_deref().unwrap_or_default())
                .await
                .map_err(|err| BurrowError::io("write file", err))?;
        }

        let reached = self.hub.notify(project_id, &mutation, Some(originator));
        debug!(
            project_id = %project_id,
            file_path = %mutation.file_path,
            action = ?mutation.action,
            reached,
            "applied file mutation"
        );
        Ok(target)
    }
}

fn mutation_target(root: &Path, file_path: &str) -> Result<PathBuf, BurrowError> {
    let trimmed = file_path.trim();
    if trimmed.is_empty() {
        return Err(BurrowError::new(
            ErrorCode::InvalidRequest,
            "file path is required",
        ));
    }

    let target = resolve_within(root, trimmed, root).map_err(|denial| {
        BurrowError::new(ErrorCode::PolicyDenied, denial.to_string())
            .with_detail(file_path.to_string())
    })?;
    if target == root {
        return Err(BurrowError::new(
            ErrorCode::InvalidRequest,
            "file path must name an entry inside the project",
        ));
    }
    Ok(target)
}
