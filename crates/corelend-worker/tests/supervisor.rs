//! Supervisor tests against a fake control port and a `sleep` worker.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

use corelend_core::{
    ControlMode, Notification, Notifier, Severity, WorkerConfig, WorkerPhase, WorkerState,
};
use corelend_worker::{WorkerSupervisor, artifact};

/// Speaks the prompt protocol and records every command line.
struct FakeWorker {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeWorker {
    async fn start() -> Self {
        Self::listen(None).await
    }

    /// The first connection is dropped, unanswered, when `command` arrives.
    /// Later connections behave normally.
    async fn hanging_up_on(command: &'static str) -> Self {
        Self::listen(Some(command)).await
    }

    async fn listen(hang_up_on: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = commands.clone();
        let connections = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = log.clone();
                let first = connections.fetch_add(1, Ordering::SeqCst) == 0;
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    if write.write_all(b"Fake worker v1\n> ").await.is_err() {
                        return;
                    }
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log.lock().unwrap().push(line.clone());
                        if first && hang_up_on == Some(line.as_str()) {
                            break;
                        }
                        if line == "shutdown" {
                            let _ = write.write_all(b"bye\n").await;
                            break;
                        }
                        if write.write_all(b"\n> ").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { port, commands }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Notification>>);

impl Notifier for Recorder {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

impl Recorder {
    fn severities(&self) -> Vec<Severity> {
        self.0.lock().unwrap().iter().map(|n| n.severity).collect()
    }
}

fn worker_config(dir: &Path, script: &str, port: Option<u16>) -> WorkerConfig {
    WorkerConfig {
        binary: "sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        work_dir: dir.to_path_buf(),
        control_port: port,
        initial_cores: 2,
        settle_delay: "10ms".to_string(),
        connect_delay: "0s".to_string(),
        connect_timeout: "1s".to_string(),
        read_timeout: "2s".to_string(),
        shutdown_grace: "0s".to_string(),
        kill_timeout: "2s".to_string(),
        ..WorkerConfig::default()
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<WorkerState>,
    within: Duration,
    pred: impl Fn(&WorkerState) -> bool,
) -> WorkerState {
    tokio::time::timeout(within, async {
        loop {
            if pred(&*rx.borrow_and_update()) {
                return rx.borrow().clone();
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("state condition not reached in time")
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn channel_mode_command_sequence() {
    let fake = FakeWorker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", Some(fake.port));
    let supervisor = WorkerSupervisor::spawn(config.clone(), true);
    assert_eq!(supervisor.mode(), ControlMode::Channel);

    assert!(supervisor.start().await);
    assert!(supervisor.is_running());
    assert!(supervisor.is_connected());
    let xml = std::fs::read_to_string(config.config_path()).unwrap();
    assert!(xml.contains(&format!("<command-port v='{}'/>", fake.port)));

    assert!(supervisor.set_cores(4).await);
    assert_eq!(
        fake.commands(),
        vec!["unpause", "modify-slot-cpus 4", "unpause"]
    );
    assert_eq!(supervisor.state().current_cores, 4);

    // Same value again is a no-op.
    assert!(supervisor.set_cores(4).await);
    assert_eq!(fake.commands().len(), 3);

    assert!(supervisor.set_cores(0).await);
    assert_eq!(fake.commands().last().unwrap(), "pause");
    let state = supervisor.state();
    assert_eq!(state.current_cores, 0);
    assert!(state.is_running());

    assert!(supervisor.force_unpause().await);
    assert_eq!(fake.commands().last().unwrap(), "unpause");
    assert_eq!(supervisor.state().current_cores, 4);

    assert!(supervisor.request_work().await);
    assert_eq!(fake.commands().last().unwrap(), "request-work");

    supervisor.shutdown().await;
    assert_eq!(fake.commands().last().unwrap(), "shutdown");
    let state = supervisor.state();
    assert_eq!(state.phase, WorkerPhase::Stopped);
    assert!(!state.process_alive);
    assert!(supervisor.is_shutting_down());

    // Idempotent, and allocation is refused until the next start.
    supervisor.shutdown().await;
    assert!(!supervisor.set_cores(3).await);
}

#[tokio::test]
async fn password_is_sent_after_banner() {
    let fake = FakeWorker::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = worker_config(dir.path(), "exec sleep 300", Some(fake.port));
    config.control_password = Some("pw".to_string());
    let supervisor = WorkerSupervisor::spawn(config, true);

    assert!(supervisor.start().await);
    assert_eq!(fake.commands(), vec!["auth pw"]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn file_mode_rewrites_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", None);
    let path = config.config_path();
    let supervisor = WorkerSupervisor::spawn(config, true);
    assert_eq!(supervisor.mode(), ControlMode::File);

    assert!(supervisor.start().await);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(2));
    let first_pid = supervisor.state().pid;
    assert!(first_pid.is_some());

    // Within the restart threshold: rewrite only.
    assert!(supervisor.set_cores(3).await);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(3));
    assert_eq!(supervisor.state().pid, first_pid);

    // Beyond it: restart.
    assert!(supervisor.set_cores(8).await);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(8));
    let state = supervisor.state();
    assert!(state.process_alive);
    assert_ne!(state.pid, first_pid);

    // Zero stops the process; a later allocation brings it back.
    assert!(supervisor.set_cores(0).await);
    let state = supervisor.state();
    assert_eq!(state.phase, WorkerPhase::Stopped);
    assert!(!state.process_alive);

    assert!(supervisor.set_cores(2).await);
    assert!(supervisor.is_running());
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(2));

    // No file-mode equivalent, reported as success.
    assert!(supervisor.request_work().await);
    supervisor.shutdown().await;
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn control_port_not_permitted_uses_file_mode() {
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", Some(unused_port()));
    let path = config.config_path();
    let supervisor = WorkerSupervisor::spawn(config, false);
    assert_eq!(supervisor.mode(), ControlMode::File);

    assert!(supervisor.start().await);
    let xml = std::fs::read_to_string(&path).unwrap();
    assert!(!xml.contains("command-port"));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn unreachable_channel_falls_back_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", Some(unused_port()));
    let path = config.config_path();
    let supervisor = WorkerSupervisor::spawn(config, true);

    assert!(supervisor.start().await);
    assert!(!supervisor.is_connected());

    assert!(supervisor.set_cores(5).await);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(5));
    let state = supervisor.state();
    assert_eq!(state.mode, ControlMode::Channel);
    assert_eq!(state.current_cores, 5);
    assert!(!state.channel_connected);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn channel_dropped_mid_command_falls_back_then_recovers() {
    let fake = FakeWorker::hanging_up_on("unpause").await;
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", Some(fake.port));
    let path = config.config_path();
    let notes = Arc::new(Recorder::default());
    let supervisor = WorkerSupervisor::spawn_with_notifier(config, true, notes.clone());

    assert!(supervisor.start().await);
    assert!(supervisor.is_connected());
    let pid = supervisor.state().pid;

    // The worker hangs up after the first unpause: the change lands in the
    // config file instead, without a restart.
    assert!(supervisor.set_cores(4).await);
    assert_eq!(fake.commands(), vec!["unpause"]);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(4));
    let state = supervisor.state();
    assert_eq!(state.mode, ControlMode::Channel);
    assert_eq!(state.current_cores, 4);
    assert_eq!(state.pid, pid);
    assert!(!state.channel_connected);
    assert_eq!(notes.severities(), vec![Severity::Warning]);

    // Next change reconnects and goes over the channel again.
    assert!(supervisor.set_cores(3).await);
    assert_eq!(
        fake.commands(),
        vec!["unpause", "unpause", "modify-slot-cpus 3", "unpause"]
    );
    assert!(supervisor.is_connected());
    assert_eq!(supervisor.state().current_cores, 3);
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(4));
    assert_eq!(notes.severities(), vec![Severity::Warning, Severity::Info]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn set_cores_reconnects_dropped_channel() {
    let fake = FakeWorker::hanging_up_on("request-work").await;
    let dir = tempfile::tempdir().unwrap();
    let config = worker_config(dir.path(), "exec sleep 300", Some(fake.port));
    let path = config.config_path();
    let notes = Arc::new(Recorder::default());
    let supervisor = WorkerSupervisor::spawn_with_notifier(config, true, notes.clone());

    assert!(supervisor.start().await);
    assert!(!supervisor.request_work().await);
    assert!(!supervisor.is_connected());

    assert!(supervisor.set_cores(5).await);
    assert!(supervisor.is_connected());
    assert_eq!(
        fake.commands(),
        vec!["request-work", "unpause", "modify-slot-cpus 5", "unpause"]
    );
    assert_eq!(supervisor.state().current_cores, 5);
    // Applied live, the launch value is still on disk.
    assert_eq!(artifact::read_cores(&path).unwrap(), Some(2));
    assert!(notes.severities().is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn crashing_worker_is_suppressed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = worker_config(dir.path(), "exit 1", None);
    config.max_auto_restarts = 0;
    let supervisor = WorkerSupervisor::spawn(config, true);
    let mut rx = supervisor.subscribe();

    assert!(supervisor.start().await);
    let state = wait_for(&mut rx, Duration::from_secs(15), |s| s.auto_restart_suppressed).await;
    assert!(!state.process_alive);
    assert_eq!(state.phase, WorkerPhase::Running);

    // Allocation waits for an explicit restart.
    assert!(!supervisor.set_cores(4).await);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn missing_binary_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = worker_config(dir.path(), "", None);
    config.binary = "/nonexistent/worker-binary".into();
    let supervisor = WorkerSupervisor::spawn(config, true);

    assert!(!supervisor.start().await);
    let state = supervisor.state();
    assert!(!state.process_alive);
    assert!(!supervisor.force_start().await);
}
