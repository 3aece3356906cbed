//! Launch seam: the [`Server`] and [`Launcher`] traits and the process-backed
//! implementation used outside of tests.

use std::{
    fs::File,
    future::Future,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    time::Duration,
};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::{process::Command, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::documents::Role;
use crate::error::ClusterError;

/// Future returned by [`Server::wait`].
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Future returned by [`Launcher::launch`].
pub type LaunchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Server>, ClusterError>> + Send + 'a>>;

/// A running role instance.
pub trait Server: Send + Sync {
    /// Ask the instance to stop. Idempotent and non-blocking.
    fn shutdown(&self);

    /// Resolves once the instance has stopped, for whatever reason.
    fn wait(&self) -> WaitFuture<'_>;
}

/// Everything a launcher needs to start one instance.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub identifier: String,
    pub role: Role,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Turns a written config document into a running [`Server`].
pub trait Launcher: Send + Sync {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a>;
}

// ── ProcessLauncher ──────────────────────────────────────────────────────────

/// Executable per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    pub authority: PathBuf,
    pub voting_authority: PathBuf,
    pub server: PathBuf,
    pub mail_proxy: PathBuf,
}

impl Binaries {
    pub fn for_role(&self, role: Role) -> &PathBuf {
        match role {
            Role::Authority => &self.authority,
            Role::VotingAuthority => &self.voting_authority,
            Role::Provider | Role::Mix => &self.server,
            Role::MailProxy => &self.mail_proxy,
        }
    }
}

/// Console output of a child that fails before its own logging is up.
pub const CONSOLE_FILE: &str = "console.log";

/// Runs `<binary> -f <config>` for each instance.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binaries: Binaries,
    /// A child that exits within this window counts as a failed launch.
    startup_grace: Duration,
    /// Time between SIGTERM and SIGKILL on shutdown.
    stop_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(binaries: Binaries) -> Self {
        Self {
            binaries,
            startup_grace: Duration::from_millis(250),
            stop_grace: Duration::from_secs(10),
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn Server>, ClusterError> {
        let launch_err = |reason: String| ClusterError::Launch {
            instance: spec.identifier.clone(),
            reason,
        };

        let binary = self.binaries.for_role(spec.role);
        let console = File::create(spec.data_dir.join(CONSOLE_FILE))
            .map_err(|e| launch_err(format!("console file: {e}")))?;
        let console_err = console
            .try_clone()
            .map_err(|e| launch_err(format!("console file: {e}")))?;

        let mut child = Command::new(binary)
            .arg("-f")
            .arg(&spec.config_path)
            .current_dir(&spec.data_dir)
            .stdin(Stdio::null())
            .stdout(console)
            .stderr(console_err)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_err(format!("spawn {}: {e}", binary.display())))?;

        let Some(pid) = child.id() else {
            return Err(launch_err("exited before a pid was assigned".into()));
        };

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = child
            .try_wait()
            .map_err(|e| launch_err(format!("wait: {e}")))?
        {
            return Err(launch_err(format!("exited during startup with {status}")));
        }

        info!(instance = %spec.identifier, role = %spec.role, pid, "process started");

        let stop = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let monitor_stop = stop.clone();
        let instance = spec.identifier.clone();
        let stop_grace = self.stop_grace;
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => info!(instance = %instance, "process exited: {status}"),
                    Ok(status) => error!(instance = %instance, "process exited: {status}"),
                    Err(e) => error!(instance = %instance, "failed to wait for process: {e}"),
                },
                () = monitor_stop.cancelled() => {
                    debug!(instance = %instance, pid, "sending SIGTERM");
                    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!(instance = %instance, "SIGTERM failed: {e}");
                    }
                    match tokio::time::timeout(stop_grace, child.wait()).await {
                        Ok(Ok(status)) => info!(instance = %instance, "process stopped: {status}"),
                        Ok(Err(e)) => error!(instance = %instance, "failed to wait for process: {e}"),
                        Err(_) => {
                            warn!(instance = %instance, "no exit after {stop_grace:?}, killing");
                            if let Err(e) = child.kill().await {
                                error!(instance = %instance, "kill failed: {e}");
                            }
                        }
                    }
                }
            }
            let _ = exited_tx.send(true);
        });

        Ok(Box::new(ProcessServer {
            stop,
            exited: exited_rx,
        }))
    }
}

impl Launcher for ProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a> {
        Box::pin(self.spawn(spec))
    }
}

/// Handle to a child process watched by a monitor task.
pub struct ProcessServer {
    stop: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl Server for ProcessServer {
    fn shutdown(&self) {
        self.stop.cancel();
    }

    fn wait(&self) -> WaitFuture<'_> {
        let mut exited = self.exited.clone();
        Box::pin(async move {
            // A dropped sender means the monitor is gone, which is also "stopped".
            let _ = exited.wait_for(|done| *done).await;
        })
    }
}
