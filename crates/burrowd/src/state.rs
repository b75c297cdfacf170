use std::{
    fs, io,
    path::{Path, PathBuf},
};

use burrow_core::{BurrowError, ErrorCode, ProjectId};
use serde::{Serialize, de::DeserializeOwned};

/// On-disk layout shared by every daemon component.
///
/// `projects_dir/<project-id>/` is a project's sandbox root. `state_dir` holds
/// the persisted port table and per-terminal scratch directories.
#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    projects_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: PathBuf, projects_dir: PathBuf) -> Result<Self, BurrowError> {
        fs::create_dir_all(&state_dir)
            .map_err(|err| BurrowError::io("create state directory", err))?;
        fs::create_dir_all(&projects_dir)
            .map_err(|err| BurrowError::io("create projects directory", err))?;

        // Sandbox containment compares lexical paths, so pin both roots to their real location.
        let state_dir = fs::canonicalize(&state_dir)
            .map_err(|err| BurrowError::io("resolve state directory", err))?;
        let projects_dir = fs::canonicalize(&projects_dir)
            .map_err(|err| BurrowError::io("resolve projects directory", err))?;

        let store = Self {
            state_dir,
            projects_dir,
        };
        fs::create_dir_all(store.sessions_dir())
            .map_err(|err| BurrowError::io("create sessions directory", err))?;
        Ok(store)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn port_table_path(&self) -> PathBuf {
        self.state_dir.join("port-assignments.json")
    }

    /// Returns the sandbox root of an existing project.
    pub fn project_root(&self, project_id: &ProjectId) -> Result<PathBuf, BurrowError> {
        if !project_id.is_well_formed() {
            return Err(BurrowError::new(
                ErrorCode::InvalidRequest,
                "project id is malformed",
            ));
        }

        let root = self.projects_dir.join(&project_id.0);
        match fs::metadata(&root) {
            Ok(metadata) if metadata.is_dir() => Ok(root),
            Ok(_) => Err(project_missing(project_id)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(project_missing(project_id)),
            Err(err) => Err(BurrowError::io("inspect project directory", err)),
        }
    }
}

fn project_missing(project_id: &ProjectId) -> BurrowError {
    BurrowError::new(
        ErrorCode::NotFound,
        format!("project {project_id} does not exist"),
    )
}

/// Writes pretty JSON through a sibling temp file and a rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BurrowError> {
    let json = serde_json::to_vec_pretty(value).map_err(|err| {
        BurrowError::new(ErrorCode::Internal, "serialize json").with_detail(err.to_string())
    })?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).map_err(|err| BurrowError::io("write json file", err))?;
    fs::rename(&tmp_path, path).map_err(|err| BurrowError::io("replace json file", err))
}

/// Reads a JSON file, returning `None` when it does not exist yet.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BurrowError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BurrowError::io("read json file", err)),
    };

    serde_json::from_slice(&bytes).map(Some).map_err(|err| {
        BurrowError::new(ErrorCode::Internal, "decode json").with_detail(err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs};

    use burrow_core::{ErrorCode, ProjectId};
    use tempfile::tempdir;

    use super::{StateStore, read_json, write_json_atomic};

    #[test]
    fn project_root_requires_existing_directory() {
        let tmp = tempdir().expect("tempdir should be created");
        let store = StateStore::new(tmp.path().join("state"), tmp.path().join("projects"))
            .expect("store should initialize");

        let missing = store
            .project_root(&ProjectId("abc".to_string()))
            .expect_err("missing project must fail");
        assert_eq!(missing.code, ErrorCode::NotFound);

        fs::create_dir(store.projects_dir().join("abc")).expect("project dir should be created");
        let root = store
            .project_root(&ProjectId("abc".to_string()))
            .expect("existing project should resolve");
        assert_eq!(root, store.projects_dir().join("abc"));

        let traversal = store
            .project_root(&ProjectId("..".to_string()))
            .expect_err("traversal id must fail");
        assert_eq!(traversal.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn json_files_are_replaced_whole() {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("table.json");

        let empty: Option<BTreeMap<String, u16>> = read_json(&path).expect("missing file is fine");
        assert!(empty.is_none());

        let mut table = BTreeMap::new();
        table.insert("abc".to_string(), 3000_u16);
        write_json_atomic(&path, &table).expect("write should succeed");
        table.insert("def".to_string(), 3001_u16);
        write_json_atomic(&path, &table).expect("rewrite should succeed");

        let loaded: BTreeMap<String, u16> = read_json(&path)
            .expect("read should succeed")
            .expect("file should exist");
        assert_eq!(loaded, table);
        assert!(!tmp.path().join("table.json.tmp").exists());
    }
}
