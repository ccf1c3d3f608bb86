//! Persisted keeper state
//!
//! The keeper re-reads its state from disk at the top of every cycle rather
//! than trusting memory: if writing the state after a transition fails, we
//! must not tell the monitor the transition succeeded, or a crash would
//! leave the two views inconsistent. Writes are crash-safe via
//! write-to-temp + fsync + rename.

use crate::{CoreError, Result};
use schema::{KeeperState, KEEPER_STATE_VERSION};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Load the keeper state from file.
///
/// Returns `Err` for I/O, parse, or version errors so callers can decide
/// whether that is fatal (a transition in flight) or retryable.
pub fn load_state(path: impl AsRef<Path>) -> Result<KeeperState> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|e| {
        CoreError::StateError(format!(
            "Failed to read state file \"{}\": {}",
            path.display(),
            e
        ))
    })?;

    let state: KeeperState = serde_json::from_str(&data)?;

    if state.version != KEEPER_STATE_VERSION {
        return Err(CoreError::StateError(format!(
            "Unsupported state file version {} (expected {})",
            state.version, KEEPER_STATE_VERSION
        )));
    }

    Ok(state)
}

/// Load the keeper state, starting fresh when no state file exists yet
pub fn load_or_init_state(path: impl AsRef<Path>) -> Result<KeeperState> {
    let path = path.as_ref();
    if path.exists() {
        load_state(path)
    } else {
        Ok(KeeperState::new())
    }
}

/// Atomically write the keeper state to file
pub fn store_state(path: impl AsRef<Path>, state: &KeeperState) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            CoreError::StateError(format!(
                "Failed to create state dir \"{}\": {}",
                parent.display(),
                e
            ))
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(state)?;

    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                CoreError::StateError(format!(
                    "Failed to open temp state file \"{}\": {}",
                    tmp_path.display(),
                    e
                ))
            })?;
        f.write_all(&json).map_err(|e| {
            CoreError::StateError(format!(
                "Failed to write temp state file \"{}\": {}",
                tmp_path.display(),
                e
            ))
        })?;
        f.flush().ok();
        let _ = f.sync_all();
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        CoreError::StateError(format!(
            "Failed to replace state file \"{}\" with \"{}\": {}",
            path.display(),
            tmp_path.display(),
            e
        ))
    })?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::NodeRole;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_atomic_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = KeeperState::new();
        state.current_role = NodeRole::Primary;
        state.assigned_role = NodeRole::Primary;
        state.last_monitor_contact = 1_700_000_000;

        store_state(&path, &state).expect("write ok");
        let loaded = load_state(&path).expect("read ok");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_initializes_fresh_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = load_or_init_state(&path).expect("init ok");
        assert_eq!(state.current_role, NodeRole::Init);
        assert_eq!(state.last_monitor_contact, 0);
    }

    #[test]
    fn corrupted_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ invalid json").unwrap();

        let err = load_state(&path).unwrap_err();
        assert!(matches!(err, CoreError::SerializationError(_)));
    }

    #[test]
    fn version_mismatch_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = KeeperState::new();
        state.version = 99;
        fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

        let err = load_state(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }
}
