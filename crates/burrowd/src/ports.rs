use std::{collections::BTreeMap, io, ops::RangeInclusive, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use burrow_core::{BurrowError, ErrorCode, ProjectId};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use crate::state::{read_json, write_json_atomic};

/// Ports handed to project dev servers unless configured otherwise.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 3000..=3999;

/// What a bind attempt says about a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Free,
    InUse,
    /// The bind failed for a reason other than the address being taken.
    Inconclusive(io::ErrorKind),
}

/// Checks whether a TCP port can currently be bound.
#[async_trait]
pub trait PortProbe: Send + Sync + 'static {
    async fn probe(&self, port: u16) -> Probe;
}

/// Probes by binding and immediately dropping a listener on all interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn probe(&self, port: u16) -> Probe {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                drop(listener);
                Probe::Free
            }
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => Probe::InUse,
            Err(err) => Probe::Inconclusive(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PortTable {
    #[serde(default)]
    assigned_ports: BTreeMap<ProjectId, u16>,
    last_assigned_port: u32,
}

/// Durable project to dev-server port mapping.
///
/// Every read-modify-write of the table, probing included, happens under one
/// lock, and the table is persisted before the in-memory copy changes.
pub struct PortRegistry {
    path: PathBuf,
    range: RangeInclusive<u16>,
    probe: Arc<dyn PortProbe>,
    table: Mutex<PortTable>,
}

impl PortRegistry {
    /// Loads the table at `path`, starting empty when the file does not exist.
    pub fn open(
        path: PathBuf,
        range: RangeInclusive<u16>,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self, BurrowError> {
        if range.is_empty() || *range.start() == 0 {
            return Err(BurrowError::new(
                ErrorCode::InvalidRequest,
                "port range must be non-empty and start above 0",
            ));
        }

        let floor = u32::from(*range.start()) - 1;
        let mut table = read_json::<PortTable>(&path)?.unwrap_or(PortTable {
            assigned_ports: BTreeMap::new(),
            last_assigned_port: floor,
        });
        if table.last_assigned_port < floor || table.last_assigned_port > u32::from(*range.end()) {
            table.last_assigned_port = floor;
        }

        Ok(Self {
            path,
            range,
            probe,
            table: Mutex::new(table),
        })
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// True unless the port is observed to be in use.
    pub async fn is_available(&self, port: u16) -> bool {
        match self.probe.probe(port).await {
            Probe::Free => true,
            Probe::InUse => false,
            Probe::Inconclusive(kind) => {
                warn!(port, ?kind, "port probe inconclusive; treating port as available");
                true
            }
        }
    }

    /// Returns the project's port, keeping a recorded one if it can still be bound.
    pub async fn assign(&self, project_id: &ProjectId) -> Result<u16, BurrowError> {
        let mut table = self.table.lock().await;

        if let Some(&port) = table.assigned_ports.get(project_id) {
            if self.is_available(port).await {
                return Ok(port);
            }
            info!(project_id = %project_id, port, "recorded port is busy; reassigning");
        }

        let port = self.scan(table.last_assigned_port).await.ok_or_else(|| {
            BurrowError::new(
                ErrorCode::PortRangeExhausted,
                "no available ports in the configured range",
            )
            .with_detail(format!("{}-{}", self.range.start(), self.range.end()))
        })?;

        let mut next = table.clone();
        next.assigned_ports.insert(project_id.clone(), port);
        next.last_assigned_port = u32::from(port);
        write_json_atomic(&self.path, &next)?;
        *table = next;

        info!(project_id = %project_id, port, "assigned port");
        Ok(port)
    }

    /// Recorded port for the project, without probing.
    pub async fn port_of(&self, project_id: &ProjectId) -> Option<u16> {
        self.table.lock().await.assigned_ports.get(project_id).copied()
    }

    /// Forgets the project's assignment. Releasing an unknown project is a no-op.
    pub async fn release(&self, project_id: &ProjectId) -> Result<(), BurrowError> {
        let mut table = self.table.lock().await;
        if !table.assigned_ports.contains_key(project_id) {
            return Ok(());
        }

        let mut next = table.clone();
        next.assigned_ports.remove(project_id);
        write_json_atomic(&self.path, &next)?;
        *table = next;

        info!(project_id = %project_id, "released port");
        Ok(())
    }

    /// Walks from just past the cursor to the range end, then wraps to the start once.
    async fn scan(&self, cursor: u32) -> Option<u16> {
        let start = u32::from(*self.range.start());
        let end = u32::from(*self.range.end());
        let first = if cursor + 1 > end { start } else { cursor + 1 };

        let forward = first..=end;
        let wrapped = start..first;
        for candidate in forward.chain(wrapped) {
            let port = u16::try_from(candidate).ok()?;
            if self.is_available(port).await {
                return Some(port);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use burrow_core::{ErrorCode, ProjectId};
    use tempfile::tempdir;

    use super::{PortProbe, PortRegistry, Probe, TcpProbe};

    #[derive(Default)]
    struct FakeProbe {
        busy: Mutex<HashSet<u16>>,
        broken: Mutex<HashSet<u16>>,
    }

    impl FakeProbe {
        fn occupy(&self, port: u16) {
            self.busy.lock().expect("lock").insert(port);
        }

        fn vacate(&self, port: u16) {
            self.busy.lock().expect("lock").remove(&port);
        }
    }

    #[async_trait]
    impl PortProbe for FakeProbe {
        async fn probe(&self, port: u16) -> Probe {
            if self.busy.lock().expect("lock").contains(&port) {
                Probe::InUse
            } else if self.broken.lock().expect("lock").contains(&port) {
                Probe::Inconclusive(std::io::ErrorKind::PermissionDenied)
            } else {
                Probe::Free
            }
        }
    }

    fn project(id: &str) -> ProjectId {
        ProjectId(id.to_string())
    }

    #[tokio::test]
    async fn assign_is_idempotent_while_port_stays_free() {
        let tmp = tempdir().expect("tempdir should be created");
        let probe = Arc::new(FakeProbe::default());
        let registry = PortRegistry::open(tmp.path().join("ports.json"), 3000..=3004, probe)
            .expect("registry should open");

        let first = registry.assign(&project("a")).await.expect("assign a");
        let again = registry.assign(&project("a")).await.expect("assign a again");
        let other = registry.assign(&project("b")).await.expect("assign b");

        assert_eq!(first, 3000);
        assert_eq!(again, 3000);
        assert_eq!(other, 3001);
        assert_eq!(registry.port_of(&project("a")).await, Some(3000));
    }

    #[tokio::test]
    async fn busy_recorded_port_is_replaced() {
        let tmp = tempdir().expect("tempdir should be created");
        let probe = Arc::new(FakeProbe::default());
        let registry =
            PortRegistry::open(tmp.path().join("ports.json"), 3000..=3004, probe.clone())
                .expect("registry should open");

        assert_eq!(registry.assign(&project("a")).await.expect("assign"), 3000);
        probe.occupy(3000);
        probe.occupy(3001);
        assert_eq!(registry.assign(&project("a")).await.expect("reassign"), 3002);
    }

    #[tokio::test]
    async fn scan_wraps_around_after_range_end() {
        let tmp = tempdir().expect("tempdir should be created");
        let probe = Arc::new(FakeProbe::default());
        let registry =
            PortRegistry::open(tmp.path().join("ports.json"), 3000..=3002, probe.clone())
                .expect("registry should open");

        for (name, expected) in [("a", 3000), ("b", 3001), ("c", 3002)] {
            assert_eq!(registry.assign(&project(name)).await.expect("assign"), expected);
        }

        probe.occupy(3001);
        probe.occupy(3002);
        registry.release(&project("a")).await.expect("release");
        assert_eq!(registry.assign(&project("d")).await.expect("wrapped"), 3000);
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        let tmp = tempdir().expect("tempdir should be created");
        let probe = Arc::new(FakeProbe::default());
        for port in 3000..=3002 {
            probe.occupy(port);
        }
        let registry =
            PortRegistry::open(tmp.path().join("ports.json"), 3000..=3002, probe.clone())
                .expect("registry should open");

        let err = registry
            .assign(&project("a"))
            .await
            .expect_err("every port is busy");
        assert_eq!(err.code, ErrorCode::PortRangeExhausted);

        probe.vacate(3001);
        assert_eq!(registry.assign(&project("a")).await.expect("retry"), 3001);
    }

    #[tokio::test]
    async fn inconclusive_probe_counts_as_available() {
        let tmp = tempdir().expect("tempdir should be created");
        let probe = Arc::new(FakeProbe::default());
        probe.broken.lock().expect("lock").insert(3000);
        let registry = PortRegistry::open(tmp.path().join("ports.json"), 3000..=3001, probe)
            .expect("registry should open");

        assert!(registry.is_available(3000).await);
        assert_eq!(registry.assign(&project("a")).await.expect("assign"), 3000);
    }

    #[tokio::test]
    async fn table_survives_reopen() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("ports.json");
        let probe = Arc::new(FakeProbe::default());

        {
            let registry = PortRegistry::open(path.clone(), 3000..=3009, probe.clone())
                .expect("registry should open");
            registry.assign(&project("a")).await.expect("assign a");
            registry.assign(&project("b")).await.expect("assign b");
            registry.release(&project("a")).await.expect("release a");
            registry.release(&project("a")).await.expect("release twice");
        }

        let reopened =
            PortRegistry::open(path.clone(), 3000..=3009, probe).expect("registry should reopen");
        assert_eq!(reopened.port_of(&project("a")).await, None);
        assert_eq!(reopened.port_of(&project("b")).await, Some(3001));
        assert_eq!(reopened.assign(&project("c")).await.expect("assign c"), 3002);

        let raw = std::fs::read_to_string(&path).expect("table file should exist");
        assert!(raw.contains("\"assigned_ports\""));
        assert!(raw.contains("\"last_assigned_port\": 3002"));
    }

    #[tokio::test]
    async fn concurrent_assignments_get_distinct_ports() {
        let tmp = tempdir().expect("tempdir should be created");
        let registry = Arc::new(
            PortRegistry::open(
                tmp.path().join("ports.json"),
                3000..=3099,
                Arc::new(FakeProbe::default()),
            )
            .expect("registry should open"),
        );

        let mut tasks = Vec::new();
        for n in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry
                    .assign(&project(&format!("p{n}")))
                    .await
                    .expect("assign should succeed")
            }));
        }

        let mut ports = HashSet::new();
        for task in tasks {
            ports.insert(task.await.expect("task should join"));
        }
        assert_eq!(ports.len(), 16);
    }

    #[tokio::test]
    async fn tcp_probe_sees_bound_listener() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("bind ephemeral port");
        let port = listener.local_addr().expect("local addr").port();

        assert_eq!(TcpProbe.probe(port).await, Probe::InUse);
    }
}
