//! Config synthesis: identities, ports and data directories for every role
//! instance, accumulated in a [`ClusterBuilder`].
//!
//! The builder is the only place that touches the port counter and the
//! per-kind instance counters. It is an explicit value, never shared state,
//! so two clusters can be built in one process without interfering.
//!
//! Synthesis is two-phase:
//!   1. `synthesize_*` calls create directories, keys and documents. All
//!      authorities come before any node, because nodes copy the authority
//!      references into their PKI section at creation time.
//!   2. [`ClusterBuilder::finish`] wires the peer mesh and the whitelist over
//!      the complete sets and returns a frozen [`Cluster`].
//!
//! A failure aborts at the failing instance. Directories and key files created
//! before the failure are left on disk.

pub mod cluster;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::documents::authority::{
    AUTHORITY_LOG_FILE, AuthorityDebug, AuthoritySection, Parameters,
};
use crate::documents::mailproxy::{Account, MAILPROXY_LOG_FILE, ProxySection};
use crate::documents::server::{
    NonvotingPki, Pki, ProviderSection, SERVER_LOG_FILE, ServerDebug, ServerSection, VotingPki,
};
use crate::documents::{
    AuthorityConfig, Logging, MailProxyConfig, Management, ServerConfig, VotingAuthorityConfig,
};
use crate::error::ClusterError;
use crate::identity::{Identity, PublicKey, UserKey};
use crate::topology::{build_voting_mesh, build_whitelist};

pub use cluster::{AuthoritySet, Cluster};

const LOOPBACK: &str = "127.0.0.1";
const DOMAIN: &str = "example.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityMode {
    Single,
    Voting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Provider,
    Mix,
}

#[derive(Debug)]
enum Authorities {
    Unset,
    Single(AuthorityConfig),
    Voting(Vec<VotingAuthorityConfig>),
}

/// Accumulates role-instance documents for one cluster.
#[derive(Debug)]
pub struct ClusterBuilder {
    base_dir: PathBuf,
    base_port: u16,
    /// Next port to hand out; wider than `u16` so exhaustion is detectable.
    next_port: u32,
    provider_idx: usize,
    node_idx: usize,
    authorities: Authorities,
    nodes: Vec<ServerConfig>,
    proxies: Vec<MailProxyConfig>,
    recipients: BTreeMap<String, PublicKey>,
}

impl ClusterBuilder {
    /// `base_port` is reserved for a single authority; everything else is
    /// allocated upwards from `base_port + 1`.
    pub fn new(base_dir: impl AsRef<Path>, base_port: u16) -> Result<Self, ClusterError> {
        let base_dir = std::path::absolute(base_dir.as_ref())
            .map_err(|e| ClusterError::directory(base_dir.as_ref(), e))?;
        if !base_dir.is_dir() {
            return Err(ClusterError::directory(&base_dir, "base dir does not exist"));
        }
        Ok(Self {
            base_dir,
            base_port,
            next_port: u32::from(base_port) + 1,
            provider_idx: 0,
            node_idx: 0,
            authorities: Authorities::Unset,
            nodes: Vec::new(),
            proxies: Vec::new(),
            recipients: BTreeMap::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn nodes(&self) -> &[ServerConfig] {
        &self.nodes
    }

    // ── authorities ──────────────────────────────────────────────────────────

    /// Add the authority tier. `count` is ignored for [`AuthorityMode::Single`].
    pub fn synthesize_authority(
        &mut self,
        mode: AuthorityMode,
        count: usize,
    ) -> Result<(), ClusterError> {
        if !self.nodes.is_empty() {
            return Err(ClusterError::config(
                "authority",
                "authorities must be synthesized before any provider or mix",
            ));
        }
        match (mode, &self.authorities) {
            (AuthorityMode::Single, Authorities::Unset) => {
                let cfg = self.single_authority()?;
                self.authorities = Authorities::Single(cfg);
                Ok(())
            }
            (AuthorityMode::Single, _) => Err(ClusterError::config(
                "authority",
                "a single authority cannot join an existing authority tier",
            )),
            (AuthorityMode::Voting, Authorities::Single(_)) => Err(ClusterError::config(
                "authority",
                "voting authorities cannot join a single-authority cluster",
            )),
            (AuthorityMode::Voting, _) if count == 0 => Err(ClusterError::config(
                "authority",
                "voting authority count must be at least 1",
            )),
            (AuthorityMode::Voting, _) => {
                let start = match &self.authorities {
                    Authorities::Voting(existing) => existing.len(),
                    _ => 0,
                };
                let mut added = Vec::with_capacity(count);
                for i in start..start + count {
                    added.push(self.voting_authority(i)?);
                }
                match &mut self.authorities {
                    Authorities::Voting(existing) => existing.extend(added),
                    slot => *slot = Authorities::Voting(added),
                }
                Ok(())
            }
        }
    }

    fn single_authority(&mut self) -> Result<AuthorityConfig, ClusterError> {
        let identifier = format!("authority.{DOMAIN}");
        let data_dir = self.create_data_dir("authority")?;
        let identity = Identity::generate()?;
        identity.save(&data_dir)?;

        info!(
            instance = %identifier,
            port = self.base_port,
            fingerprint = %identity.fingerprint(),
            "synthesized single authority"
        );

        Ok(AuthorityConfig {
            authority: AuthoritySection {
                identifier,
                addresses: vec![format!("{LOOPBACK}:{}", self.base_port)],
                data_dir,
            },
            logging: Logging::debug(AUTHORITY_LOG_FILE),
            debug: AuthorityDebug::new(&identity),
            mixes: Vec::new(),
            providers: Vec::new(),
        })
    }

    fn voting_authority(&mut self, index: usize) -> Result<VotingAuthorityConfig, ClusterError> {
        let identifier = format!("authority-{index}.{DOMAIN}");
        let port = self.allocate_port(&identifier)?;
        let data_dir = self.create_data_dir(&format!("authority{index}"))?;
        let identity = Identity::generate()?;
        identity.save(&data_dir)?;

        let mut debug = AuthorityDebug::new(&identity);
        debug.link_key = Some(identity.link_secret_key());

        info!(
            instance = %identifier,
            port,
            fingerprint = %identity.fingerprint(),
            "synthesized voting authority"
        );

        Ok(VotingAuthorityConfig {
            authority: AuthoritySection {
                identifier,
                addresses: vec![format!("{LOOPBACK}:{port}")],
                data_dir,
            },
            logging: Logging::debug(AUTHORITY_LOG_FILE),
            parameters: Parameters::default(),
            debug,
            authorities: Vec::new(),
            mixes: Vec::new(),
            providers: Vec::new(),
        })
    }

    // ── providers and mixes ──────────────────────────────────────────────────

    /// Add one provider or mix, named `provider-N` / `node-N` from the
    /// per-kind counter.
    pub fn synthesize_node(&mut self, kind: NodeKind) -> Result<&ServerConfig, ClusterError> {
        let name = match kind {
            NodeKind::Provider => format!("provider-{}", self.provider_idx),
            NodeKind::Mix => format!("node-{}", self.node_idx),
        };
        let identifier = format!("{name}.{DOMAIN}");
        let pki = self.node_pki(&identifier)?;
        let port = self.allocate_port(&identifier)?;
        let data_dir = self.create_data_dir(&name)?;
        let identity = Identity::generate()?;
        identity.save(&data_dir)?;

        let is_provider = kind == NodeKind::Provider;
        let mut cfg = ServerConfig {
            server: ServerSection {
                identifier: identifier.clone(),
                addresses: vec![format!("{LOOPBACK}:{port}")],
                data_dir,
                is_provider,
            },
            logging: Logging::debug(SERVER_LOG_FILE),
            debug: ServerDebug {
                identity_key: identity.secret_key(),
                num_sphinx_workers: 1,
            },
            pki,
            management: is_provider.then(Management::enabled),
            provider: is_provider.then(ProviderSection::with_builtin_services),
        };
        cfg.fixup_and_validate()?;

        match kind {
            NodeKind::Provider => self.provider_idx += 1,
            NodeKind::Mix => self.node_idx += 1,
        }

        info!(
            instance = %identifier,
            port,
            provider = is_provider,
            fingerprint = %identity.fingerprint(),
            "synthesized node"
        );

        self.nodes.push(cfg);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    fn node_pki(&self, instance: &str) -> Result<Pki, ClusterError> {
        match &self.authorities {
            Authorities::Unset => Err(ClusterError::config(
                instance,
                "no authority synthesized before this node",
            )),
            Authorities::Single(auth) => Ok(Pki {
                voting: None,
                nonvoting: Some(NonvotingPki {
                    address: auth.authority.addresses[0].clone(),
                    public_key: auth.identity().public_key(),
                }),
            }),
            Authorities::Voting(auths) => Ok(Pki {
                voting: Some(VotingPki {
                    peers: auths.iter().map(VotingAuthorityConfig::peer_reference).collect(),
                }),
                nonvoting: None,
            }),
        }
    }

    // ── mail proxies ─────────────────────────────────────────────────────────

    /// Add a mail proxy for `user` on the provider named `provider`. The user
    /// also becomes a recipient known to every proxy.
    pub fn synthesize_mail_proxy(
        &mut self,
        user: &str,
        provider: &str,
        key: &UserKey,
    ) -> Result<&MailProxyConfig, ClusterError> {
        let name = format!("mailproxy-{user}@{provider}");
        if user.is_empty() || user.contains(['/', '@']) || user.chars().any(char::is_whitespace) {
            return Err(ClusterError::config(&name, format!("invalid user name '{user}'")));
        }
        if !self
            .nodes
            .iter()
            .any(|n| n.is_provider() && n.server.identifier == provider)
        {
            return Err(ClusterError::config(
                &name,
                format!("unknown provider '{provider}'"),
            ));
        }

        let pop3_port = self.allocate_port(&name)?;
        let smtp_port = self.allocate_port(&name)?;
        let data_dir = self.create_data_dir(&name)?;

        let cfg = MailProxyConfig {
            proxy: ProxySection {
                pop3_address: format!("{LOOPBACK}:{pop3_port}"),
                smtp_address: format!("{LOOPBACK}:{smtp_port}"),
                data_dir,
            },
            logging: Logging::debug(MAILPROXY_LOG_FILE),
            management: Management::enabled(),
            accounts: vec![Account {
                user: user.to_string(),
                provider: provider.to_string(),
                link_key: key.secret_key(),
                identity_key: key.secret_key(),
            }],
            recipients: BTreeMap::new(),
        };
        self.add_recipient(&format!("{user}@{provider}"), key.public_key());

        info!(instance = %name, pop3_port, smtp_port, "synthesized mail proxy");

        self.proxies.push(cfg);
        Ok(&self.proxies[self.proxies.len() - 1])
    }

    /// Make `address` (`user@provider`) resolvable by every mail proxy.
    pub fn add_recipient(&mut self, address: &str, key: PublicKey) {
        self.recipients.insert(address.to_string(), key);
    }

    // ── wiring ───────────────────────────────────────────────────────────────

    /// Wire the topology over the complete instance sets and freeze it.
    pub fn finish(self) -> Result<Cluster, ClusterError> {
        let whitelist = build_whitelist(&self.nodes);

        let authorities = match self.authorities {
            Authorities::Unset => {
                return Err(ClusterError::config("cluster", "no authority synthesized"));
            }
            Authorities::Single(mut auth) => {
                whitelist.attach_single(&mut auth);
                auth.fixup_and_validate()?;
                AuthoritySet::Single(auth)
            }
            Authorities::Voting(mut auths) => {
                build_voting_mesh(&mut auths);
                whitelist.attach_voting(&mut auths);
                for auth in &mut auths {
                    auth.fixup_and_validate()?;
                }
                AuthoritySet::Voting(auths)
            }
        };

        let mut proxies = self.proxies;
        for proxy in &mut proxies {
            proxy.recipients = self.recipients.clone();
            proxy.fixup_and_validate()?;
        }

        debug!(
            providers = whitelist.providers.len(),
            mixes = whitelist.mixes.len(),
            proxies = proxies.len(),
            "topology wired"
        );

        Ok(Cluster::new(
            self.base_dir,
            authorities,
            self.nodes,
            proxies,
            whitelist,
        ))
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn allocate_port(&mut self, instance: &str) -> Result<u16, ClusterError> {
        let port = u16::try_from(self.next_port)
            .map_err(|_| ClusterError::config(instance, "port range exhausted"))?;
        self.next_port += 1;
        Ok(port)
    }

    /// Create `<base_dir>/<name>` with mode 0700. The directory must not
    /// already exist.
    fn create_data_dir(&self, name: &str) -> Result<PathBuf, ClusterError> {
        let path = self.base_dir.join(name);
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&path)
            .map_err(|e| ClusterError::directory(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder(tmp: &TempDir) -> ClusterBuilder {
        ClusterBuilder::new(tmp.path(), 30000).unwrap()
    }

    #[test]
    fn second_provider_is_provider_1() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        let first = b.synthesize_node(NodeKind::Provider).unwrap().server.data_dir.clone();
        let second = b.synthesize_node(NodeKind::Provider).unwrap().server.data_dir.clone();
        assert!(first.ends_with("provider-0"));
        assert!(second.ends_with("provider-1"));
        assert!(second.is_dir());
    }

    #[test]
    fn mix_and_provider_counters_are_independent() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        b.synthesize_node(NodeKind::Provider).unwrap();
        let mix = b.synthesize_node(NodeKind::Mix).unwrap();
        assert_eq!(mix.server.identifier, "node-0.example.org");
        assert!(mix.management.is_none());
    }

    #[test]
    fn single_authority_uses_base_port() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        let node = b.synthesize_node(NodeKind::Mix).unwrap();
        let pki = node.pki.nonvoting.as_ref().unwrap();
        assert_eq!(pki.address, "127.0.0.1:30000");
        assert_eq!(node.server.addresses, ["127.0.0.1:30001"]);
    }

    #[test]
    fn node_before_authority_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        let err = b.synthesize_node(NodeKind::Mix).unwrap_err();
        assert!(matches!(err, ClusterError::ConfigInvalid { .. }));
    }

    #[test]
    fn authority_after_node_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Voting, 2).unwrap();
        b.synthesize_node(NodeKind::Mix).unwrap();
        assert!(b.synthesize_authority(AuthorityMode::Voting, 1).is_err());
    }

    #[test]
    fn mixing_authority_modes_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        assert!(b.synthesize_authority(AuthorityMode::Voting, 2).is_err());
        assert!(b.synthesize_authority(AuthorityMode::Single, 1).is_err());
    }

    #[test]
    fn repeated_voting_calls_append() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Voting, 2).unwrap();
        b.synthesize_authority(AuthorityMode::Voting, 1).unwrap();
        let cluster = b.finish().unwrap();
        let ids: Vec<_> = cluster
            .voting_authorities()
            .iter()
            .map(|a| a.authority.identifier.clone())
            .collect();
        assert_eq!(
            ids,
            ["authority-0.example.org", "authority-1.example.org", "authority-2.example.org"]
        );
    }

    #[test]
    fn existing_data_dir_is_a_directory_failure() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("node-0")).unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        let err = b.synthesize_node(NodeKind::Mix).unwrap_err();
        assert!(matches!(err, ClusterError::Directory { .. }));
    }

    #[test]
    fn port_exhaustion_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut b = ClusterBuilder::new(tmp.path(), u16::MAX - 1).unwrap();
        b.synthesize_authority(AuthorityMode::Voting, 1).unwrap();
        let err = b.synthesize_node(NodeKind::Mix).unwrap_err();
        assert!(err.to_string().contains("port range exhausted"));
    }

    #[test]
    fn mail_proxy_requires_known_provider() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        b.synthesize_node(NodeKind::Mix).unwrap();
        let key = UserKey::generate().unwrap();
        assert!(b.synthesize_mail_proxy("alice", "node-0.example.org", &key).is_err());
    }

    #[test]
    fn mail_proxies_learn_every_recipient() {
        let tmp = TempDir::new().unwrap();
        let mut b = builder(&tmp);
        b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
        b.synthesize_node(NodeKind::Provider).unwrap();
        let alice = UserKey::generate().unwrap();
        let bob = UserKey::generate().unwrap();
        b.synthesize_mail_proxy("alice", "provider-0.example.org", &alice).unwrap();
        b.synthesize_mail_proxy("bob", "provider-0.example.org", &bob).unwrap();
        let cluster = b.finish().unwrap();
        for proxy in cluster.mail_proxies() {
            assert_eq!(proxy.recipients.len(), 2);
            assert_eq!(
                proxy.recipients.get("bob@provider-0.example.org"),
                Some(&bob.public_key())
            );
        }
    }

    #[test]
    fn finish_without_authority_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(builder(&tmp).finish().is_err());
    }
}
