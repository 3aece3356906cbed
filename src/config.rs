//! Settings loading with env-var overrides.
//!
//! Reads a TOML file (default `config/default.toml` relative to the current
//! working directory), then applies `MIXCLUSTER_BASE_DIR` and
//! `MIXCLUSTER_LOG_LEVEL` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::ClusterError;
use crate::logger;
use crate::orchestrator::Binaries;
use crate::tail::TailSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Shape of the cluster to synthesize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySettings {
    pub voting: bool,
    /// Voting authority count; a single authority is used when `voting` is off.
    pub authorities: usize,
    pub providers: usize,
    pub mixes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningSettings {
    pub attempts: u32,
    pub retry_interval: Duration,
}

/// A mail-proxy user to create and provision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserSettings {
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub base_port: u16,
    /// `None` means a fresh temporary directory.
    pub base_dir: Option<PathBuf>,
    pub log_level: String,
    /// Aggregated log file name, inside the base dir.
    pub log_file: String,
    pub echo_stdout: bool,
    pub topology: TopologySettings,
    pub binaries: Binaries,
    pub tail: TailSettings,
    pub provisioning: ProvisioningSettings,
    pub users: Vec<UserSettings>,
}

/// Raw TOML shape: `serde` target before resolution.
#[derive(Deserialize)]
struct RawSettings {
    cluster: RawCluster,
    #[serde(default)]
    topology: RawTopology,
    #[serde(default)]
    binaries: RawBinaries,
    #[serde(default)]
    tail: RawTail,
    #[serde(default)]
    provisioning: RawProvisioning,
    #[serde(default)]
    users: Vec<UserSettings>,
}

#[derive(Deserialize)]
struct RawCluster {
    #[serde(default = "default_base_port")]
    base_port: u16,
    #[serde(default)]
    base_dir: String,
    log_level: String,
    #[serde(default = "default_log_file")]
    log_file: String,
    #[serde(default = "default_true")]
    echo_stdout: bool,
}

#[derive(Deserialize)]
struct RawTopology {
    #[serde(default = "default_true")]
    voting: bool,
    #[serde(default = "default_authorities")]
    authorities: usize,
    #[serde(default = "default_providers")]
    providers: usize,
    #[serde(default = "default_mixes")]
    mixes: usize,
}

impl Default for RawTopology {
    fn default() -> Self {
        Self {
            voting: true,
            authorities: default_authorities(),
            providers: default_providers(),
            mixes: default_mixes(),
        }
    }
}

#[derive(Deserialize)]
struct RawBinaries {
    #[serde(default = "default_authority_bin")]
    authority: String,
    #[serde(default = "default_voting_authority_bin")]
    voting_authority: String,
    #[serde(default = "default_server_bin")]
    server: String,
    #[serde(default = "default_mail_proxy_bin")]
    mail_proxy: String,
}

impl Default for RawBinaries {
    fn default() -> Self {
        Self {
            authority: default_authority_bin(),
            voting_authority: default_voting_authority_bin(),
            server: default_server_bin(),
            mail_proxy: default_mail_proxy_bin(),
        }
    }
}

#[derive(Deserialize)]
struct RawTail {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_open_timeout_ms")]
    open_timeout_ms: u64,
}

impl Default for RawTail {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawProvisioning {
    #[serde(default = "default_attempts")]
    attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    retry_interval_ms: u64,
}

impl Default for RawProvisioning {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

fn default_base_port() -> u16 { 30000 }
fn default_log_file() -> String { "cluster.log".to_string() }
fn default_authorities() -> usize { 3 }
fn default_providers() -> usize { 2 }
fn default_mixes() -> usize { 3 }
fn default_authority_bin() -> String { "nonvoting".to_string() }
fn default_voting_authority_bin() -> String { "voting".to_string() }
fn default_server_bin() -> String { "server".to_string() }
fn default_mail_proxy_bin() -> String { "mailproxy".to_string() }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_open_timeout_ms() -> u64 { 10_000 }
fn default_attempts() -> u32 { 10 }
fn default_retry_interval_ms() -> u64 { 500 }

fn default_true() -> bool {
    true
}

/// Load settings from `path`, then apply env-var overrides.
pub fn load(path: &Path) -> Result<Settings, ClusterError> {
    let base_dir_override = env::var("MIXCLUSTER_BASE_DIR").ok();
    let log_level_override = env::var("MIXCLUSTER_LOG_LEVEL").ok();
    load_from(
        path,
        base_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    base_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings, ClusterError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ClusterError::Settings(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawSettings = toml::from_str(&raw)
        .map_err(|e| ClusterError::Settings(format!("parse error in {}: {e}", path.display())))?;

    let c = parsed.cluster;

    let base_dir_str = base_dir_override.unwrap_or(&c.base_dir);
    let base_dir = (!base_dir_str.trim().is_empty()).then(|| expand_home(base_dir_str));
    let log_level = log_level_override.unwrap_or(&c.log_level).to_string();
    logger::parse_level(&log_level)?;

    let t = parsed.topology;
    if t.voting && t.authorities == 0 {
        return Err(ClusterError::Settings(
            "topology.authorities must be at least 1 in voting mode".into(),
        ));
    }
    if parsed.provisioning.attempts == 0 {
        return Err(ClusterError::Settings("provisioning.attempts must be at least 1".into()));
    }
    if parsed.tail.poll_interval_ms == 0 {
        return Err(ClusterError::Settings("tail.poll_interval_ms must be positive".into()));
    }
    if !parsed.users.is_empty() && t.providers == 0 {
        return Err(ClusterError::Settings("users are configured but there are no providers".into()));
    }

    Ok(Settings {
        base_port: c.base_port,
        base_dir,
        log_level,
        log_file: c.log_file,
        echo_stdout: c.echo_stdout,
        topology: TopologySettings {
            voting: t.voting,
            authorities: t.authorities,
            providers: t.providers,
            mixes: t.mixes,
        },
        binaries: Binaries {
            authority: expand_home(&parsed.binaries.authority),
            voting_authority: expand_home(&parsed.binaries.voting_authority),
            server: expand_home(&parsed.binaries.server),
            mail_proxy: expand_home(&parsed.binaries.mail_proxy),
        },
        tail: TailSettings {
            poll_interval: Duration::from_millis(parsed.tail.poll_interval_ms),
            open_timeout: Duration::from_millis(parsed.tail.open_timeout_ms),
        },
        provisioning: ProvisioningSettings {
            attempts: parsed.provisioning.attempts,
            retry_interval: Duration::from_millis(parsed.provisioning.retry_interval_ms),
        },
        users: parsed.users,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
