//! Spawning, readiness, liveness, and escalating shutdown of the backend.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::reader::{
    spawn_stream_forwarder, DiagnosticReader, DiagnosticSource, LineRead, Liveness, StreamEvent,
};
use super::state::BackendState;
use crate::error::{ChatError, StartupError};
use crate::protocol::{decode, encode, Command, StatusMessage};

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorSettings {
    /// Upper bound on the wait for the ready status.
    pub startup_timeout: Duration,
    /// How long each shutdown step waits for the process to exit.
    pub shutdown_grace: Duration,
    /// Bound on a single diagnostic read.
    pub poll_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A shutdown action that was actually attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    ExitCommand,
    Terminate,
    Kill,
}

/// What `stop()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub steps: Vec<ShutdownStep>,
    pub exit_code: Option<i32>,
}

/// The running backend process and its pipes.
pub struct BackendHandle {
    executable: PathBuf,
    model_config: PathBuf,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    diagnostics: DiagnosticReader<ChildStderr>,
    stream: UnboundedReceiver<StreamEvent>,
    stream_task: JoinHandle<()>,
}

impl BackendHandle {
    fn spawn(executable: &Path, model_config: &Path) -> Result<Self, StartupError> {
        let mut child = tokio::process::Command::new(executable)
            .arg(model_config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(StartupError::Spawn)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let (stream, stream_task) = spawn_stream_forwarder(stdout);

        Ok(Self {
            executable: executable.to_path_buf(),
            model_config: model_config.to_path_buf(),
            pid: child.id(),
            child,
            stdin,
            diagnostics: DiagnosticReader::new(stderr),
            stream,
            stream_task,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn model_config(&self) -> &Path {
        &self.model_config
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one encoded command to stdin and flush it.
    pub async fn send(&mut self, command: &Command) -> Result<(), ChatError> {
        let line = encode(command)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ChatError::Send(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed")))?;
        stdin.write_all(line.as_bytes()).await.map_err(ChatError::Send)?;
        stdin.flush().await.map_err(ChatError::Send)?;
        debug!(command = command.kind(), "sent command to backend");
        Ok(())
    }

    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    async fn wait_exit(&mut self, grace: Duration) -> Option<Option<i32>> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status.code()),
            Ok(Err(e)) => {
                warn!(error = %e, "failed waiting on backend process");
                None
            }
            Err(_) => None,
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.stream_task.abort();
    }
}

#[async_trait]
impl DiagnosticSource for BackendHandle {
    async fn next_line(&mut self, wait: Duration) -> io::Result<LineRead> {
        self.diagnostics.read_line(wait).await
    }

    async fn next_stream_event(&mut self, wait: Duration) -> Option<StreamEvent> {
        tokio::time::timeout(wait, self.stream.recv()).await.ok().flatten()
    }

    fn drain_stream(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.stream.try_recv() {
            events.push(event);
        }
        events
    }

    fn liveness(&mut self) -> Liveness {
        match self.child.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => Liveness::Exited(status.code()),
            Err(e) => {
                warn!(error = %e, "failed to poll backend process");
                Liveness::Exited(None)
            }
        }
    }
}

/// Owns at most one backend process at a time.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    state: BackendState,
    handle: Option<BackendHandle>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            state: BackendState::NotStarted,
            handle: None,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: BackendState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "backend state change");
            self.state = state;
        }
    }

    pub fn handle(&self) -> Option<&BackendHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut BackendHandle> {
        self.handle.as_mut()
    }

    /// Spawn the backend and wait until it reports ready.
    pub async fn start(&mut self, executable: &Path, model_config: &Path) -> Result<(), StartupError> {
        if matches!(self.state, BackendState::Ready | BackendState::Busy) {
            info!("backend already running, start ignored");
            return Ok(());
        }

        if let Err(e) = check_paths(executable, model_config) {
            self.set_state(BackendState::Failed);
            return Err(e);
        }

        if self.handle.is_some() {
            self.stop().await;
        }

        self.set_state(BackendState::Starting);
        info!(
            executable = %executable.display(),
            model_config = %model_config.display(),
            "starting backend"
        );

        let handle = match BackendHandle::spawn(executable, model_config) {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(BackendState::Failed);
                return Err(e);
            }
        };
        debug!(pid = ?handle.pid(), "backend spawned");
        self.handle = Some(handle);

        match self.wait_for_ready().await {
            Ok(()) => {
                self.set_state(BackendState::Ready);
                info!("backend ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "backend failed to start");
                self.shutdown().await;
                self.set_state(BackendState::Failed);
                Err(e)
            }
        }
    }

    async fn wait_for_ready(&mut self) -> Result<(), StartupError> {
        let timeout = self.settings.startup_timeout;
        let poll = self.settings.poll_interval;
        let grace = self.settings.shutdown_grace;
        let deadline = Instant::now() + timeout;
        let handle = self
            .handle
            .as_mut()
            .ok_or(StartupError::ProcessExitedEarly(None))?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StartupError::Timeout(timeout));
            }

            let read = match handle.next_line(poll.min(remaining)).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, "failed reading backend diagnostics");
                    LineRead::Closed
                }
            };

            match read {
                LineRead::Line(line) => match decode(&line) {
                    Some(StatusMessage::Ready) => return Ok(()),
                    Some(StatusMessage::Error { message }) => {
                        return Err(StartupError::BackendReportedError(message));
                    }
                    Some(StatusMessage::Progress { message })
                    | Some(StatusMessage::Success { message, .. }) => {
                        info!(target: "pipechat::backend", "{message}");
                    }
                    None => debug!(target: "pipechat::backend::stderr", "{line}"),
                },
                LineRead::Idle => {
                    if let Liveness::Exited(code) = handle.liveness() {
                        return Err(StartupError::ProcessExitedEarly(code));
                    }
                }
                LineRead::Closed => {
                    // stderr closed: the process is exiting or already gone.
                    let code = match handle.liveness() {
                        Liveness::Exited(code) => code,
                        Liveness::Alive => handle.wait_exit(grace).await.flatten(),
                    };
                    return Err(StartupError::ProcessExitedEarly(code));
                }
            }
        }
    }

    /// Stop the backend: exit command, then SIGTERM, then SIGKILL.
    ///
    /// Safe to call in any state and any number of times.
    pub async fn stop(&mut self) -> ShutdownReport {
        let report = self.shutdown().await;
        self.set_state(BackendState::Terminated);
        report
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let Some(mut handle) = self.handle.take() else {
            return report;
        };
        let grace = self.settings.shutdown_grace;

        if let Liveness::Exited(code) = handle.liveness() {
            report.exit_code = code;
            debug!(?code, "backend already exited");
            return report;
        }

        report.steps.push(ShutdownStep::ExitCommand);
        if let Err(e) = handle.send(&Command::Exit).await {
            debug!(error = %e, "could not send exit command");
        }
        handle.close_stdin();
        if let Some(code) = handle.wait_exit(grace).await {
            report.exit_code = code;
            info!(?code, "backend exited");
            return report;
        }

        report.steps.push(ShutdownStep::Terminate);
        warn!("backend ignored exit command, sending SIGTERM");
        if let Some(pid) = handle.pid() {
            if let Err(e) = terminate(pid) {
                warn!(error = %e, pid, "SIGTERM to backend failed");
            }
        }
        if let Some(code) = handle.wait_exit(grace).await {
            report.exit_code = code;
            info!(?code, "backend terminated");
            return report;
        }

        report.steps.push(ShutdownStep::Kill);
        warn!("backend ignored SIGTERM, killing");
        if let Err(e) = handle.child.kill().await {
            error!(error = %e, "failed to kill backend");
        }
        report.exit_code = match handle.liveness() {
            Liveness::Exited(code) => code,
            Liveness::Alive => None,
        };
        report
    }

    /// Non-blocking liveness poll.
    pub fn is_alive(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.liveness() == Liveness::Alive,
            None => false,
        }
    }
}

fn check_paths(executable: &Path, model_config: &Path) -> Result<(), StartupError> {
    let metadata = std::fs::metadata(executable)
        .map_err(|_| StartupError::ExecutableMissing(executable.to_path_buf()))?;
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(StartupError::NotExecutable(executable.to_path_buf()));
    }
    if !model_config.exists() {
        return Err(StartupError::ModelConfigMissing(model_config.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    // SAFETY: pid belongs to a child we spawned and have not yet reaped.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals unsupported on this platform",
    ))
}

fn missing_pipe(name: &str) -> StartupError {
    StartupError::Spawn(io::Error::new(
        io::ErrorKind::Other,
        format!("backend {name} was not captured"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.startup_timeout, Duration::from_secs(30));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn missing_executable_is_reported_first() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_paths(&dir.path().join("nope"), &dir.path().join("also-nope")).unwrap_err();
        assert!(matches!(err, StartupError::ExecutableMissing(_)));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("backend");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        let err = check_paths(&exe, &exe).unwrap_err();
        assert!(matches!(err, StartupError::NotExecutable(_)));
    }

    #[test]
    fn directory_is_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_paths(dir.path(), dir.path()).unwrap_err();
        assert!(matches!(err, StartupError::NotExecutable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn missing_model_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_paths(Path::new("/bin/sh"), &dir.path().join("config.json")).unwrap_err();
        assert!(matches!(err, StartupError::ModelConfigMissing(_)));
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let mut supervisor = ProcessSupervisor::new(SupervisorSettings::default());
        let report = supervisor.stop().await;
        assert!(report.steps.is_empty());
        assert_eq!(supervisor.state(), BackendState::Terminated);
        assert!(!supervisor.is_alive());
    }

    #[tokio::test]
    async fn failed_precheck_sets_failed_state() {
        let mut supervisor = ProcessSupervisor::new(SupervisorSettings::default());
        let err = supervisor
            .start(Path::new("/definitely/not/here"), Path::new("/nor/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, StartupError::ExecutableMissing(_)));
        assert_eq!(supervisor.state(), BackendState::Failed);
        assert!(supervisor.handle().is_none());
    }
}
