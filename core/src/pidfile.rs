//! The supervisor pidfile
//!
//! The pidfile plays two roles at once: it is the mutual-exclusion lock that
//! guarantees at most one supervisor per data directory (fencing), and it is
//! the service registry external tooling uses to locate a service's pid by
//! name (`mizard stop`, `mizard reload`, `mizard status`).
//!
//! On-disk format, one value per line:
//!
//! ```text
//! line 1   supervisor pid
//! line 2   data directory path
//! line 3   version string
//! line 4   keeper state file path
//! line 5+  "<pid> <serviceName>" per running service
//! ```
//!
//! The file is always replaced atomically (write-temp + rename): a reader
//! never observes a torn write. Every writer re-validates ownership before
//! trusting the file, so there is no concurrent mutation to lock against.

use crate::{CoreError, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use schema::ServicePidEntry;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Number of fixed header lines before the per-service entries
const PIDFILE_HEADER_LINES: usize = 4;

/// Fixed header lines of the pidfile
#[derive(Debug, Clone)]
pub struct PidfileHeader {
    /// Postgres data directory this supervisor is responsible for
    pub data_directory: String,
    /// Version string of the running binary
    pub version: String,
    /// Path of the keeper state file
    pub state_file: String,
}

/// Probe a pid with the null signal: true when the process exists
pub fn pid_is_live(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Render the pidfile contents
fn render(pid: i32, header: &PidfileHeader, services: &[ServicePidEntry]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", pid));
    out.push_str(&format!("{}\n", header.data_directory));
    out.push_str(&format!("{}\n", header.version));
    out.push_str(&format!("{}\n", header.state_file));
    for entry in services {
        out.push_str(&format!("{} {}\n", entry.pid, entry.name));
    }
    out
}

/// Atomically replace the pidfile with the given contents.
///
/// Write to a temp file in the same directory, flush and fsync it, rename it
/// over the destination, then best-effort fsync the directory so the rename
/// itself is persisted.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("pid.tmp");

    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                CoreError::PidfileError(format!(
                    "Failed to open temp pidfile {}: {}",
                    tmp_path.display(),
                    e
                ))
            })?;
        f.write_all(contents.as_bytes()).map_err(|e| {
            CoreError::PidfileError(format!(
                "Failed to write temp pidfile {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        f.flush().ok();
        let _ = f.sync_all();
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        CoreError::PidfileError(format!(
            "Failed to replace pidfile {} with {}: {}",
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

/// Write the pidfile for the given supervisor pid and service entries.
///
/// This does not check ownership; callers either just acquired the file via
/// [`acquire_pidfile`] or re-validated it with [`check_pidfile`].
pub fn create_pidfile(
    path: &Path,
    pid: i32,
    header: &PidfileHeader,
    services: &[ServicePidEntry],
) -> Result<()> {
    debug!("create_pidfile({}): \"{}\"", pid, path.display());
    write_atomic(path, &render(pid, header, services))
}

/// Acquire the pidfile, enforcing at-most-one supervisor per pidfile.
///
/// Fails with [`CoreError::AlreadyRunning`] when a live process owns the
/// file, leaving the existing file untouched. A stale file (dead owner) is
/// removed and the acquisition proceeds.
pub fn acquire_pidfile(path: &Path, pid: i32, header: &PidfileHeader) -> Result<()> {
    if let Some(owner) = read_pidfile(path)? {
        return Err(CoreError::AlreadyRunning {
            pid: owner,
            pidfile: path.display().to_string(),
        });
    }
    create_pidfile(path, pid, header, &[])
}

/// Read the supervisor pid from the pidfile, returning it only when it
/// belongs to a currently running process.
///
/// A missing file returns `None`. A garbled file or a stale pid (no such
/// process) is removed from disk and also returns `None`.
pub fn read_pidfile(path: &Path) -> Result<Option<i32>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            debug!("Failed to read the pidfile \"{}\": {}", path.display(), e);
            remove_pidfile(path)?;
            return Ok(None);
        }
    };

    let pid: i32 = match contents.lines().next().and_then(|l| l.trim().parse().ok()) {
        Some(pid) if pid > 0 => pid,
        _ => {
            debug!(
                "Read invalid pid in file \"{}\", removing it",
                path.display()
            );
            remove_pidfile(path)?;
            return Ok(None);
        }
    };

    if pid_is_live(pid) {
        Ok(Some(pid))
    } else {
        info!("Found a stale pidfile at \"{}\"", path.display());
        warn!("Removing the stale pidfile \"{}\"", path.display());
        remove_pidfile(path)?;
        Ok(None)
    }
}

/// Remove the pidfile
pub fn remove_pidfile(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::PidfileError(format!(
            "Failed to remove pidfile \"{}\": {}",
            path.display(),
            e
        ))),
    }
}

/// Re-validate that the pidfile still names `expected_pid` as its owner.
///
/// The pidfile may have been removed from disk, or overwritten by another
/// process; in both cases continuing to run would break the at-most-one
/// guarantee, so the caller must abort.
pub fn check_pidfile(path: &Path, expected_pid: i32) -> Result<()> {
    match read_pidfile(path)? {
        Some(pid) if pid == expected_pid => Ok(()),
        Some(pid) => {
            warn!(
                "Our pidfile \"{}\" now contains pid {}, instead of expected pid {}",
                path.display(),
                pid,
                expected_pid
            );
            Err(CoreError::FencingLost(path.display().to_string()))
        }
        None => {
            warn!("Pidfile not found at \"{}\"", path.display());
            Err(CoreError::FencingLost(path.display().to_string()))
        }
    }
}

/// Read the per-service entries from the pidfile
pub fn read_service_pids(path: &Path) -> Result<Vec<ServicePidEntry>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        CoreError::PidfileError(format!(
            "Failed to read pidfile \"{}\": {}",
            path.display(),
            e
        ))
    })?;

    let mut entries = Vec::new();
    for line in contents.lines().skip(PIDFILE_HEADER_LINES) {
        let Some((pid, name)) = line.split_once(' ') else {
            debug!("Failed to find a space separator in line: \"{}\"", line);
            continue;
        };
        let Ok(pid) = pid.trim().parse::<u32>() else {
            debug!("Failed to parse service pid in line: \"{}\"", line);
            continue;
        };
        entries.push(ServicePidEntry {
            name: name.to_string(),
            pid,
        });
    }
    Ok(entries)
}

/// Locate a service's pid by name. Used by external reload/stop tooling.
pub fn find_service_pid(path: &Path, service_name: &str) -> Result<Option<u32>> {
    Ok(read_service_pids(path)?
        .into_iter()
        .find(|e| e.name == service_name)
        .map(|e| e.pid))
}

/// Render the pidfile as JSON, optionally annotating every pid with a
/// "running"/"stale" status from a null-signal probe.
pub fn pidfile_as_json(path: &Path, include_status: bool) -> Result<serde_json::Value> {
    let contents = fs::read_to_string(path).map_err(|e| {
        CoreError::PidfileError(format!(
            "Failed to read pidfile \"{}\": {}",
            path.display(),
            e
        ))
    })?;

    let mut lines = contents.lines();
    let pid: i32 = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| {
            CoreError::PidfileError(format!("Pidfile \"{}\" has no pid line", path.display()))
        })?;

    let mut obj = serde_json::json!({
        "pid": pid,
        "pgdata": lines.next().unwrap_or_default(),
        "version": lines.next().unwrap_or_default(),
        "stateFile": lines.next().unwrap_or_default(),
    });
    if include_status {
        obj["status"] = if pid_is_live(pid) {
            "running".into()
        } else {
            "stale".into()
        };
    }

    let mut services = Vec::new();
    for entry in read_service_pids(path)? {
        let mut svc = serde_json::json!({
            "name": entry.name,
            "pid": entry.pid,
        });
        if include_status {
            svc["status"] = if pid_is_live(entry.pid as i32) {
                "running".into()
            } else {
                "stale".into()
            };
        }
        services.push(svc);
    }
    obj["services"] = services.into();

    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> PidfileHeader {
        PidfileHeader {
            data_directory: "/var/lib/postgres/data".to_string(),
            version: "0.4.1".to_string(),
            state_file: "/var/lib/mizar/state.json".to_string(),
        }
    }

    fn own_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn create_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        create_pidfile(&path, own_pid(), &header(), &[]).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), Some(own_pid()));
    }

    #[test]
    fn acquire_fails_against_live_owner_without_modifying_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        // our own pid is as live as it gets
        acquire_pidfile(&path, own_pid(), &header()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let err = acquire_pidfile(&path, own_pid() + 1, &header()).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning { .. }));

        let after = fs::read_to_string(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn stale_pidfile_is_removed_and_reacquired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        // pid from a range no live process plausibly occupies in tests
        create_pidfile(&path, 999_999_999, &header(), &[]).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), None);
        assert!(!path.exists());

        acquire_pidfile(&path, own_pid(), &header()).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), Some(own_pid()));
    }

    #[test]
    fn garbage_pidfile_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn service_entries_are_found_by_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        let services = vec![
            ServicePidEntry {
                name: "postgres".to_string(),
                pid: 4242,
            },
            ServicePidEntry {
                name: "node-active".to_string(),
                pid: 4243,
            },
        ];
        create_pidfile(&path, own_pid(), &header(), &services).unwrap();

        assert_eq!(find_service_pid(&path, "node-active").unwrap(), Some(4243));
        assert_eq!(find_service_pid(&path, "postgres").unwrap(), Some(4242));
        assert_eq!(find_service_pid(&path, "nonesuch").unwrap(), None);
    }

    #[test]
    fn check_pidfile_detects_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        create_pidfile(&path, own_pid(), &header(), &[]).unwrap();
        check_pidfile(&path, own_pid()).unwrap();

        // another live process overwrote the file: fencing lost. Pid 1 is
        // always live.
        create_pidfile(&path, 1, &header(), &[]).unwrap();
        let err = check_pidfile(&path, own_pid()).unwrap_err();
        assert!(matches!(err, CoreError::FencingLost(_)));
    }

    #[test]
    fn check_pidfile_detects_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        create_pidfile(&path, own_pid(), &header(), &[]).unwrap();
        remove_pidfile(&path).unwrap();
        let err = check_pidfile(&path, own_pid()).unwrap_err();
        assert!(matches!(err, CoreError::FencingLost(_)));
    }

    #[test]
    fn json_rendering_includes_services_and_status() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mizar.pid");

        let services = vec![ServicePidEntry {
            name: "postgres".to_string(),
            pid: own_pid() as u32,
        }];
        create_pidfile(&path, own_pid(), &header(), &services).unwrap();

        let js = pidfile_as_json(&path, true).unwrap();
        assert_eq!(js["pid"], own_pid());
        assert_eq!(js["status"], "running");
        assert_eq!(js["services"][0]["name"], "postgres");
        assert_eq!(js["services"][0]["status"], "running");
    }
}
