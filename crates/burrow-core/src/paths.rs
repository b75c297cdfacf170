use std::{env, path::PathBuf};

/// Resolves the daemon state directory from environment and platform defaults.
pub fn default_state_dir() -> PathBuf {
    resolve_dir("BURROW_STATE_DIR", "state")
}

/// Resolves the directory holding one sandbox root per project.
pub fn default_projects_dir() -> PathBuf {
    resolve_dir("BURROW_PROJECTS_DIR", "projects")
}

fn resolve_dir(override_var: &str, leaf: &str) -> PathBuf {
    if let Some(override_dir) = env::var_os(override_var) {
        return PathBuf::from(override_dir);
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".burrow").join(leaf);
    }

    PathBuf::from(".burrow").join(leaf)
}
