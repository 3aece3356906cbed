//! Cluster orchestrator: launches role instances, binds one log tailer to
//! each, and owns ordered shutdown.
//!
//! # Lifecycle
//!
//! Each instance moves through
//! `Configured → Launching → Running → ShuttingDown → Stopped`.
//! A launch failure leaves the instance `Stopped` and aborts the caller's
//! launch sequence; nothing is retried.
//!
//! # Shutdown ordering
//!
//! [`Orchestrator::shutdown`] signals every server, waits for every server to
//! stop, and only then tells the tailers to drain to end-of-file and exit.
//! Lines a process wrote before it stopped are therefore always forwarded.
//!
//! # Fatal errors
//!
//! A tailer that cannot open its log file after the owning process is
//! running cancels the [`Orchestrator::fatal`] token. The caller is expected
//! to watch it and run shutdown. [`Orchestrator::provision_mail_accounts`]
//! watches it too and gives up early.

pub mod server;

use std::{fmt, sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::management;

use crate::documents::{Role, RoleDocument};
use crate::error::ClusterError;
use crate::synth::Cluster;
use crate::tail::{LogSink, TailSettings, tail_file};

pub use server::{
    Binaries, LaunchFuture, LaunchSpec, Launcher, ProcessLauncher, ProcessServer, Server,
    WaitFuture,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Configured,
    Launching,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceState::Configured => "configured",
            InstanceState::Launching => "launching",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopped => "stopped",
        })
    }
}

struct Instance {
    identifier: String,
    role: Role,
    state: InstanceState,
    server: Option<Box<dyn Server>>,
}

impl Instance {
    fn transition(&mut self, state: InstanceState) {
        debug!(instance = %self.identifier, role = %self.role, from = %self.state, to = %state, "state change");
        self.state = state;
    }
}

pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
    sink: LogSink,
    tail: TailSettings,
    instances: Vec<Instance>,
    tailers: JoinSet<Result<(), ClusterError>>,
    /// Tells every tailer to drain and exit.
    drain: CancellationToken,
    fatal: CancellationToken,
}

impl Orchestrator {
    pub fn new(launcher: impl Launcher + 'static, sink: LogSink, tail: TailSettings) -> Self {
        Self {
            launcher: Arc::new(launcher),
            sink,
            tail,
            instances: Vec::new(),
            tailers: JoinSet::new(),
            drain: CancellationToken::new(),
            fatal: CancellationToken::new(),
        }
    }

    /// Cancelled when a tailer fails terminally.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// `(identifier, state)` for every instance, in launch order.
    pub fn states(&self) -> Vec<(String, InstanceState)> {
        self.instances
            .iter()
            .map(|i| (i.identifier.clone(), i.state))
            .collect()
    }

    pub fn state(&self, identifier: &str) -> Option<InstanceState> {
        self.instances
            .iter()
            .find(|i| i.identifier == identifier)
            .map(|i| i.state)
    }

    // ── launch ───────────────────────────────────────────────────────────────

    /// Validate, write and launch one document, then start tailing its log.
    pub async fn launch(&mut self, mut doc: RoleDocument) -> Result<(), ClusterError> {
        doc.fixup_and_validate()?;
        let identifier = doc.identifier();
        let role = doc.role();
        if self.state(&identifier).is_some() {
            return Err(ClusterError::config(&identifier, "instance already launched"));
        }

        let index = self.instances.len();
        self.instances.push(Instance {
            identifier: identifier.clone(),
            role,
            state: InstanceState::Configured,
            server: None,
        });

        let config_path = match doc.write() {
            Ok(path) => path,
            Err(e) => {
                self.instances[index].transition(InstanceState::Stopped);
                return Err(e);
            }
        };
        let spec = LaunchSpec {
            identifier: identifier.clone(),
            role,
            config_path,
            data_dir: doc.data_dir().to_path_buf(),
            log_path: doc.log_path(),
        };

        self.instances[index].transition(InstanceState::Launching);
        let server = match self.launcher.launch(&spec).await {
            Ok(server) => server,
            Err(e) => {
                error!(instance = %identifier, role = %role, "launch failed: {e}");
                self.instances[index].transition(InstanceState::Stopped);
                return Err(e);
            }
        };
        let instance = &mut self.instances[index];
        instance.server = Some(server);
        instance.transition(InstanceState::Running);
        info!(instance = %identifier, role = %role, "running");

        self.spawn_tailer(spec);
        Ok(())
    }

    fn spawn_tailer(&mut self, spec: LaunchSpec) {
        let sink = self.sink.clone();
        let settings = self.tail;
        let drain = self.drain.clone();
        let fatal = self.fatal.clone();
        self.tailers.spawn(async move {
            let identifier = spec.identifier;
            let result = tail_file(identifier.clone(), spec.log_path, sink, settings, drain).await;
            if let Err(e) = &result {
                error!(instance = %identifier, "{e}");
                fatal.cancel();
            }
            result
        });
    }

    /// Launch every provider and mix, then the authorities.
    pub async fn launch_all(&mut self, cluster: &Cluster) -> Result<(), ClusterError> {
        let nodes = cluster.node_documents();
        let authorities = cluster.authority_documents();
        info!(
            nodes = nodes.len(),
            authorities = authorities.len(),
            "launching cluster"
        );
        for doc in nodes.into_iter().chain(authorities) {
            self.launch(doc).await?;
        }
        Ok(())
    }

    /// Launch every mail proxy. Callers provision accounts on the providers
    /// first so the proxies can authenticate on startup.
    pub async fn launch_mail_proxies(&mut self, cluster: &Cluster) -> Result<(), ClusterError> {
        for doc in cluster.mail_proxy_documents() {
            self.launch(doc).await?;
        }
        Ok(())
    }

    /// Register every mail-proxy account with its provider over the
    /// management socket. Returns early if a tailer fails meanwhile.
    pub async fn provision_mail_accounts(
        &self,
        cluster: &Cluster,
        attempts: u32,
        interval: Duration,
    ) -> Result<(), ClusterError> {
        tokio::select! {
            biased;
            () = self.fatal.cancelled() => Err(ClusterError::provisioning(
                "startup",
                "a process log became unobservable",
            )),
            result = provision_accounts(cluster, attempts, interval) => result,
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────────────

    /// Stop every server, then drain and join every tailer.
    ///
    /// Returns the first tailer error, if any. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Result<(), ClusterError> {
        for instance in &mut self.instances {
            if instance.state != InstanceState::Running {
                continue;
            }
            if let Some(server) = &instance.server {
                server.shutdown();
            }
            instance.transition(InstanceState::ShuttingDown);
        }

        for instance in &mut self.instances {
            if let Some(server) = &instance.server {
                server.wait().await;
            }
            if instance.state == InstanceState::ShuttingDown {
                info!(instance = %instance.identifier, "stopped");
            }
            if instance.state != InstanceState::Stopped {
                instance.transition(InstanceState::Stopped);
            }
        }

        self.drain.cancel();
        let mut first_err = None;
        while let Some(joined) = self.tailers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(ClusterError::Io(std::io::Error::other(format!(
                    "tailer task panicked: {e}"
                ))))
            });
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("cluster shut down");
                Ok(())
            }
        }
    }
}

async fn provision_accounts(
    cluster: &Cluster,
    attempts: u32,
    interval: Duration,
) -> Result<(), ClusterError> {
    for proxy in cluster.mail_proxies() {
        for account in &proxy.accounts {
            let address = account.address();
            let socket = cluster
                .provider(&account.provider)
                .and_then(|p| p.management_socket())
                .ok_or_else(|| ClusterError::config(&address, "provider has no management socket"))?;
            let key = proxy
                .recipients
                .get(&address)
                .ok_or_else(|| ClusterError::config(&address, "no public key recorded"))?;
            management::provision_user_when_ready(&socket, &account.user, key, attempts, interval)
                .await?;
            info!(user = %address, "user provisioned");
        }
    }
    Ok(())
}
