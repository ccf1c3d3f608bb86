//! Supervisor integration tests with scripted mock services

use super::*;
use crate::pidfile::PidfileHeader;
use crate::signals::SignalState;
use schema::RestartPolicy;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::time::timeout;

const TICK: Duration = Duration::from_millis(5);
const WAIT: Duration = Duration::from_secs(5);

fn header() -> PidfileHeader {
    PidfileHeader {
        data_directory: "/tmp/pgdata".to_string(),
        version: "test".to_string(),
        state_file: "/tmp/state.json".to_string(),
    }
}

struct Harness {
    dir: TempDir,
    signals: Arc<SignalState>,
    handles: Vec<MockHandle>,
}

impl Harness {
    fn new(specs: Vec<(&str, RestartPolicy, Vec<MockRun>)>) -> (Self, Supervisor) {
        let dir = tempdir().unwrap();
        let signals = SignalState::new();
        let mut handles = Vec::new();
        let mut services = Vec::new();

        for (name, policy, plan) in specs {
            let (command, handle) = MockCommand::new();
            handle.plan(plan);
            handles.push(handle);
            services.push(Service::new(name, policy, Box::new(command)));
        }

        let supervisor = Supervisor::new(
            services,
            dir.path().join("mizar.pid"),
            header(),
            signals.clone(),
        )
        .with_tick(TICK);

        (
            Self {
                dir,
                signals,
                handles,
            },
            supervisor,
        )
    }

    fn pidfile(&self) -> std::path::PathBuf {
        self.dir.path().join("mizar.pid")
    }
}

#[tokio::test]
async fn stop_signal_shuts_everything_down_cleanly() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        ("node-active", RestartPolicy::Permanent, vec![MockRun::Run]),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    tokio::time::sleep(TICK * 10).await;

    assert!(harness.pidfile().exists());
    harness.signals.record_stop(nix::sys::signal::Signal::SIGTERM);

    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mode, ExitMode::Clean);
    assert!(!outcome.dropped);
    assert_eq!(outcome.exit_code(), 0);

    // services were forwarded the stop signal and the pidfile was removed
    for handle in &harness.handles {
        assert!(handle
            .signals()
            .contains(&nix::sys::signal::Signal::SIGTERM));
    }
    assert!(!harness.pidfile().exists());
}

#[tokio::test]
async fn start_failure_rolls_back_started_services() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        (
            "node-active",
            RestartPolicy::Permanent,
            vec![MockRun::FailToStart],
        ),
    ]);

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, CoreError::ProcessSpawn(_)));

    // the already started service got SIGQUIT, and no pidfile is left behind
    assert!(harness.handles[0]
        .signals()
        .contains(&nix::sys::signal::Signal::SIGQUIT));
    assert!(!harness.pidfile().exists());
}

#[tokio::test]
async fn temporary_service_is_never_restarted() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        ("init", RestartPolicy::Temporary, vec![MockRun::Exit(1)]),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    tokio::time::sleep(TICK * 20).await;

    // the temporary service died but was not restarted, and its death did
    // not shut the supervisor down
    assert_eq!(harness.handles[1].starts(), 1);
    assert!(!task.is_finished());

    harness.signals.record_stop(nix::sys::signal::Signal::SIGTERM);
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mode, ExitMode::Clean);
}

#[tokio::test]
async fn transient_clean_quit_stops_the_whole_supervisor() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        ("node-init", RestartPolicy::Transient, vec![MockRun::Exit(0)]),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert_eq!(outcome.mode, ExitMode::Clean);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(harness.handles[1].starts(), 1);
}

#[tokio::test]
async fn dropped_exit_code_stops_cleanly_with_distinguished_code() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        (
            "node-active",
            RestartPolicy::Permanent,
            vec![MockRun::Exit(121)],
        ),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert!(outcome.dropped);
    assert_eq!(outcome.exit_code(), 121);
    // the dropped service must not have been restarted
    assert_eq!(harness.handles[1].starts(), 1);
}

#[tokio::test]
async fn fatal_exit_code_stops_with_fatal_mode() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        (
            "node-active",
            RestartPolicy::Permanent,
            vec![MockRun::Exit(122)],
        ),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert_eq!(outcome.mode, ExitMode::Fatal);
    assert_eq!(outcome.exit_code(), 122);
    assert_eq!(harness.handles[1].starts(), 1);
}

#[tokio::test]
async fn exhausted_restart_budget_triggers_error_shutdown() {
    let (harness, supervisor) = Harness::new(vec![(
        "node-active",
        RestartPolicy::Permanent,
        vec![MockRun::Exit(1), MockRun::Exit(1), MockRun::Exit(1)],
    )]);
    let mut supervisor = supervisor.with_restart_budget(2, 300);

    let task = tokio::spawn(async move { supervisor.start().await });
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    // initial start plus the two restarts the budget allows
    assert_eq!(harness.handles[0].starts(), 3);
    assert_eq!(outcome.mode, ExitMode::Error);
    assert_eq!(outcome.exit_code(), 12);
}

#[tokio::test]
async fn restart_rewrites_the_pidfile_with_the_new_pid() {
    let (harness, mut supervisor) = Harness::new(vec![(
        "node-active",
        RestartPolicy::Permanent,
        vec![MockRun::Exit(1), MockRun::Run],
    )]);

    let task = tokio::spawn(async move { supervisor.start().await });
    tokio::time::sleep(TICK * 20).await;

    assert_eq!(harness.handles[0].starts(), 2);
    let pid = crate::pidfile::find_service_pid(&harness.pidfile(), "node-active")
        .unwrap()
        .expect("service listed in pidfile");
    // mock pids are 1000 + start ordinal
    assert_eq!(pid, 1002);

    harness.signals.record_stop(nix::sys::signal::Signal::SIGTERM);
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn losing_the_pidfile_aborts_without_removing_it() {
    let (harness, mut supervisor) = Harness::new(vec![(
        "node-active",
        RestartPolicy::Permanent,
        vec![MockRun::Run],
    )]);

    let task = tokio::spawn(async move { supervisor.start().await });
    tokio::time::sleep(TICK * 10).await;

    // another live process (pid 1 is always live) usurps the pidfile
    crate::pidfile::create_pidfile(&harness.pidfile(), 1, &header(), &[]).unwrap();

    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mode, ExitMode::Fatal);

    // the usurper's file is not ours to remove
    let owner = std::fs::read_to_string(harness.pidfile()).unwrap();
    assert_eq!(owner.lines().next(), Some("1"));
}

#[tokio::test]
async fn reload_is_forwarded_to_every_service() {
    let (harness, mut supervisor) = Harness::new(vec![
        ("postgres", RestartPolicy::Permanent, vec![MockRun::Run]),
        ("node-active", RestartPolicy::Permanent, vec![MockRun::Run]),
    ]);

    let task = tokio::spawn(async move { supervisor.start().await });
    tokio::time::sleep(TICK * 10).await;

    harness.signals.request_reload();
    tokio::time::sleep(TICK * 10).await;

    for handle in &harness.handles {
        assert!(handle.signals().contains(&nix::sys::signal::Signal::SIGHUP));
    }

    harness.signals.record_stop(nix::sys::signal::Signal::SIGTERM);
    let outcome = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.mode, ExitMode::Clean);
}
