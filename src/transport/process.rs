//! Spawning and owning the daemon process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ServiceError;

/// Read side of a daemon connection.
pub type DaemonReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of a daemon connection.
pub type DaemonWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long to wait for the daemon to exit on its own before killing it.
const EXIT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Command line used to start `<executable> editor-service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    pub verbose: bool,
}

impl DaemonCommand {
    pub fn new(executable: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config_path: config_path.into(),
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Arguments passed after the executable.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "editor-service".into(),
            "--config".into(),
            self.config_path.as_os_str().to_owned(),
            "--parent-pid".into(),
            std::process::id().to_string().into(),
        ];
        if self.verbose {
            args.push("--verbose".into());
        }
        args
    }

    /// The daemon runs in the config file's directory.
    pub fn working_dir(&self) -> Option<&Path> {
        self.config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// A live daemon process plus the task draining its stderr.
///
/// The child is spawned with `kill_on_drop`, so dropping the handle never
/// leaves an orphaned daemon behind.
pub struct DaemonProcess {
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

impl DaemonProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait briefly for the process to exit, kill it otherwise, then join
    /// the stderr task.
    pub async fn shutdown(mut self) {
        match tokio::time::timeout(EXIT_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => debug!("dprint daemon exited ({})", status),
            Ok(Err(e)) => warn!("Error waiting for dprint daemon: {}", e),
            Err(_) => {
                warn!("dprint daemon didn't exit gracefully, killing");
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill dprint daemon: {}", e);
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Streams and process handle of a started daemon.
///
/// `process` is `None` when the streams are not backed by an OS process
/// (in-memory pipes).
pub struct LaunchedDaemon {
    pub reader: DaemonReader,
    pub writer: DaemonWriter,
    pub process: Option<DaemonProcess>,
}

/// Starts a daemon and hands back its streams.
///
/// Implemented by [`ProcessLauncher`] for the real executable; tests supply
/// launchers backed by in-memory pipes.
pub trait DaemonLauncher: Send + Sync {
    /// # Errors
    ///
    /// Returns `Configuration` if the executable cannot be found and
    /// `ProcessUnavailable` if its standard streams cannot be captured.
    fn launch(&self) -> Result<LaunchedDaemon, ServiceError>;
}

/// Launches `<executable> editor-service` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: DaemonCommand,
}

impl ProcessLauncher {
    pub fn new(command: DaemonCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &DaemonCommand {
        &self.command
    }
}

impl DaemonLauncher for ProcessLauncher {
    fn launch(&self) -> Result<LaunchedDaemon, ServiceError> {
        let command = &self.command;
        info!(
            "Starting dprint editor service: {} (config: {})",
            command.executable.display(),
            command.config_path.display()
        );

        let mut cmd = Command::new(&command.executable);
        cmd.args(command.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = command.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::Configuration(format!(
                "dprint executable not found: {}",
                command.executable.display()
            )),
            _ => ServiceError::Io(e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ServiceError::ProcessUnavailable("Failed to get stdin handle for dprint".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ServiceError::ProcessUnavailable("Failed to get stdout handle for dprint".to_string())
        })?;
        let stderr_task = child.stderr.take().map(drain_stderr);

        debug!("dprint editor service started (pid: {:?})", child.id());

        Ok(LaunchedDaemon {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(DaemonProcess { child, stderr_task }),
        })
    }
}

/// Log every stderr line until the pipe closes.
fn drain_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "dprint", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read dprint stderr: {}", e);
                    break;
                }
            }
        }
        debug!("dprint stderr closed");
    })
}
