//! Per-role configuration documents.
//!
//! Each launched process consumes one TOML document. The shapes here are the
//! external interface to the authority, server and mail-proxy executables;
//! keys are PascalCase on the wire.
//!
//! Every document must pass `fixup_and_validate` before it is written for a
//! launch. Fixup fills derived defaults (log file, log level, management
//! socket path, derived link keys); validation rejects structurally invalid
//! combinations with [`ClusterError::ConfigInvalid`].

pub mod authority;
pub mod mailproxy;
pub mod server;

use std::{
    collections::BTreeSet,
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::identity::PublicKey;

pub use authority::{AuthorityConfig, VotingAuthorityConfig};
pub use mailproxy::MailProxyConfig;
pub use server::ServerConfig;

/// File name of a provider's management socket inside its data dir.
pub const MANAGEMENT_SOCKET: &str = "management_sock";

const LOG_LEVELS: [&str; 5] = ["ERROR", "WARNING", "NOTICE", "INFO", "DEBUG"];
const DEFAULT_LOG_LEVEL: &str = "NOTICE";

// ── shared sections ──────────────────────────────────────────────────────────

/// `[Logging]`: where and how verbosely a process logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Logging {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub level: String,
}

impl Logging {
    /// Debug-level logging into `file` (relative to the data dir).
    pub fn debug(file: &str) -> Self {
        Self {
            disable: false,
            file: file.to_string(),
            level: "DEBUG".to_string(),
        }
    }

    pub(crate) fn fixup(&mut self, instance: &str, default_file: &str) -> Result<(), ClusterError> {
        if self.disable {
            return Err(ClusterError::config(
                instance,
                "logging is disabled; the cluster requires every log to be observable",
            ));
        }
        if self.file.is_empty() {
            self.file = default_file.to_string();
        }
        if Path::new(&self.file).is_absolute() {
            return Err(ClusterError::config(
                instance,
                format!("log file '{}' must be relative to the data dir", self.file),
            ));
        }
        if self.level.is_empty() {
            self.level = DEFAULT_LOG_LEVEL.to_string();
        }
        let upper = self.level.to_ascii_uppercase();
        if !LOG_LEVELS.contains(&upper.as_str()) {
            return Err(ClusterError::config(
                instance,
                format!("unknown log level '{}'", self.level),
            ));
        }
        self.level = upper;
        Ok(())
    }
}

/// `[Management]`: local control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Management {
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Management {
    pub fn enabled() -> Self {
        Self {
            enable: true,
            path: None,
        }
    }

    pub(crate) fn fixup(&mut self, data_dir: &Path) {
        if self.enable && self.path.is_none() {
            self.path = Some(data_dir.join(MANAGEMENT_SOCKET));
        }
    }
}

/// A voting authority as seen by everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthorityPeer {
    pub identity_public_key: PublicKey,
    pub link_public_key: PublicKey,
    pub addresses: Vec<String>,
}

/// A provider or mix admitted into the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeDescriptor {
    pub identifier: String,
    pub identity_key: PublicKey,
}

// ── RoleDocument ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Authority,
    VotingAuthority,
    Provider,
    Mix,
    MailProxy,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Authority => "authority",
            Role::VotingAuthority => "voting-authority",
            Role::Provider => "provider",
            Role::Mix => "mix",
            Role::MailProxy => "mailproxy",
        })
    }
}

/// Any one of the documents a role instance consumes.
#[derive(Debug, Clone)]
pub enum RoleDocument {
    Authority(AuthorityConfig),
    VotingAuthority(VotingAuthorityConfig),
    Server(ServerConfig),
    MailProxy(MailProxyConfig),
}

impl RoleDocument {
    pub fn role(&self) -> Role {
        match self {
            RoleDocument::Authority(_) => Role::Authority,
            RoleDocument::VotingAuthority(_) => Role::VotingAuthority,
            RoleDocument::Server(cfg) if cfg.server.is_provider => Role::Provider,
            RoleDocument::Server(_) => Role::Mix,
            RoleDocument::MailProxy(_) => Role::MailProxy,
        }
    }

    pub fn identifier(&self) -> String {
        match self {
            RoleDocument::Authority(cfg) => cfg.authority.identifier.clone(),
            RoleDocument::VotingAuthority(cfg) => cfg.authority.identifier.clone(),
            RoleDocument::Server(cfg) => cfg.server.identifier.clone(),
            RoleDocument::MailProxy(cfg) => cfg.display_name(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        match self {
            RoleDocument::Authority(cfg) => &cfg.authority.data_dir,
            RoleDocument::VotingAuthority(cfg) => &cfg.authority.data_dir,
            RoleDocument::Server(cfg) => &cfg.server.data_dir,
            RoleDocument::MailProxy(cfg) => &cfg.proxy.data_dir,
        }
    }

    /// Public identity key, for the roles that have one.
    pub fn identity_key(&self) -> Option<PublicKey> {
        match self {
            RoleDocument::Authority(cfg) => Some(cfg.identity().public_key()),
            RoleDocument::VotingAuthority(cfg) => Some(cfg.identity().public_key()),
            RoleDocument::Server(cfg) => Some(cfg.identity().public_key()),
            RoleDocument::MailProxy(_) => None,
        }
    }

    fn logging(&self) -> &Logging {
        match self {
            RoleDocument::Authority(cfg) => &cfg.logging,
            RoleDocument::VotingAuthority(cfg) => &cfg.logging,
            RoleDocument::Server(cfg) => &cfg.logging,
            RoleDocument::MailProxy(cfg) => &cfg.logging,
        }
    }

    /// Every address this instance listens on.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            RoleDocument::Authority(cfg) => cfg.authority.addresses.clone(),
            RoleDocument::VotingAuthority(cfg) => cfg.authority.addresses.clone(),
            RoleDocument::Server(cfg) => cfg.server.addresses.clone(),
            RoleDocument::MailProxy(cfg) => {
                vec![cfg.proxy.pop3_address.clone(), cfg.proxy.smtp_address.clone()]
            }
        }
    }

    /// Ports of [`Self::addresses`]; unparseable addresses are skipped.
    pub fn ports(&self) -> Vec<u16> {
        self.addresses()
            .iter()
            .filter_map(|a| a.parse::<SocketAddr>().ok())
            .map(|a| a.port())
            .collect()
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join(&self.logging().file)
    }

    pub fn config_path(&self) -> PathBuf {
        let name = match self {
            RoleDocument::Authority(_) | RoleDocument::VotingAuthority(_) => "authority.toml",
            RoleDocument::Server(_) => "server.toml",
            RoleDocument::MailProxy(_) => "mailproxy.toml",
        };
        self.data_dir().join(name)
    }

    pub fn fixup_and_validate(&mut self) -> Result<(), ClusterError> {
        match self {
            RoleDocument::Authority(cfg) => cfg.fixup_and_validate(),
            RoleDocument::VotingAuthority(cfg) => cfg.fixup_and_validate(),
            RoleDocument::Server(cfg) => cfg.fixup_and_validate(),
            RoleDocument::MailProxy(cfg) => cfg.fixup_and_validate(),
        }
    }

    pub fn to_toml(&self) -> Result<String, ClusterError> {
        let rendered = match self {
            RoleDocument::Authority(cfg) => toml::to_string(cfg),
            RoleDocument::VotingAuthority(cfg) => toml::to_string(cfg),
            RoleDocument::Server(cfg) => toml::to_string(cfg),
            RoleDocument::MailProxy(cfg) => toml::to_string(cfg),
        };
        rendered.map_err(|e| ClusterError::config(self.identifier(), format!("serialize: {e}")))
    }

    /// Serialize into [`Self::config_path`] and return that path.
    pub fn write(&self) -> Result<PathBuf, ClusterError> {
        let path = self.config_path();
        let body = self.to_toml()?;
        fs::write(&path, body).map_err(|e| ClusterError::directory(&path, e))?;
        Ok(path)
    }
}

// ── validation helpers ───────────────────────────────────────────────────────

pub(crate) fn validate_identifier(instance: &str, identifier: &str) -> Result<(), ClusterError> {
    if identifier.trim().is_empty() {
        return Err(ClusterError::config(instance, "identifier is empty"));
    }
    Ok(())
}

pub(crate) fn validate_addresses(instance: &str, addresses: &[String]) -> Result<(), ClusterError> {
    if addresses.is_empty() {
        return Err(ClusterError::config(instance, "no addresses configured"));
    }
    for addr in addresses {
        addr.parse::<SocketAddr>()
            .map_err(|e| ClusterError::config(instance, format!("bad address '{addr}': {e}")))?;
    }
    Ok(())
}

pub(crate) fn validate_data_dir(instance: &str, dir: &Path) -> Result<(), ClusterError> {
    if !dir.is_absolute() {
        return Err(ClusterError::config(
            instance,
            format!("data dir '{}' is not absolute", dir.display()),
        ));
    }
    Ok(())
}

/// Reject a whitelist that names one identity key twice.
pub(crate) fn validate_whitelist(
    instance: &str,
    providers: &[NodeDescriptor],
    mixes: &[NodeDescriptor],
) -> Result<(), ClusterError> {
    let mut seen = BTreeSet::new();
    for node in providers.iter().chain(mixes) {
        validate_identifier(instance, &node.identifier)?;
        if !seen.insert(*node.identity_key.as_bytes()) {
            return Err(ClusterError::config(
                instance,
                format!("node {} is whitelisted twice", node.identifier),
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_peers(instance: &str, peers: &[AuthorityPeer]) -> Result<(), ClusterError> {
    let mut seen = BTreeSet::new();
    for peer in peers {
        validate_addresses(instance, &peer.addresses)?;
        if !seen.insert(*peer.identity_public_key.as_bytes()) {
            return Err(ClusterError::config(
                instance,
                format!("authority peer {} listed twice", peer.identity_public_key),
            ));
        }
    }
    Ok(())
}
