//! The frozen result of synthesis.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::documents::{
    AuthorityConfig, MailProxyConfig, Role, RoleDocument, ServerConfig, VotingAuthorityConfig,
};
use crate::error::ClusterError;
use crate::identity::PublicKey;
use crate::topology::Whitelist;

pub const MANIFEST_FILE: &str = "cluster.json";

#[derive(Debug, Clone)]
pub enum AuthoritySet {
    Single(AuthorityConfig),
    Voting(Vec<VotingAuthorityConfig>),
}

/// Every document of one cluster, fully wired. Nothing here mutates after
/// [`super::ClusterBuilder::finish`].
#[derive(Debug, Clone)]
pub struct Cluster {
    base_dir: PathBuf,
    authorities: AuthoritySet,
    nodes: Vec<ServerConfig>,
    proxies: Vec<MailProxyConfig>,
    whitelist: Whitelist,
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    identifier: String,
    role: Role,
    addresses: Vec<String>,
    data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity_key: Option<PublicKey>,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    base_dir: &'a Path,
    instances: Vec<ManifestEntry>,
}

impl Cluster {
    pub(super) fn new(
        base_dir: PathBuf,
        authorities: AuthoritySet,
        nodes: Vec<ServerConfig>,
        proxies: Vec<MailProxyConfig>,
        whitelist: Whitelist,
    ) -> Self {
        Self {
            base_dir,
            authorities,
            nodes,
            proxies,
            whitelist,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn authorities(&self) -> &AuthoritySet {
        &self.authorities
    }

    pub fn single_authority(&self) -> Option<&AuthorityConfig> {
        match &self.authorities {
            AuthoritySet::Single(auth) => Some(auth),
            AuthoritySet::Voting(_) => None,
        }
    }

    /// Empty for a single-authority cluster.
    pub fn voting_authorities(&self) -> &[VotingAuthorityConfig] {
        match &self.authorities {
            AuthoritySet::Single(_) => &[],
            AuthoritySet::Voting(auths) => auths,
        }
    }

    pub fn nodes(&self) -> &[ServerConfig] {
        &self.nodes
    }

    pub fn mail_proxies(&self) -> &[MailProxyConfig] {
        &self.proxies
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn provider(&self, identifier: &str) -> Option<&ServerConfig> {
        self.nodes
            .iter()
            .find(|n| n.is_provider() && n.server.identifier == identifier)
    }

    pub fn node_documents(&self) -> Vec<RoleDocument> {
        self.nodes.iter().cloned().map(RoleDocument::Server).collect()
    }

    pub fn authority_documents(&self) -> Vec<RoleDocument> {
        match &self.authorities {
            AuthoritySet::Single(auth) => vec![RoleDocument::Authority(auth.clone())],
            AuthoritySet::Voting(auths) => auths
                .iter()
                .cloned()
                .map(RoleDocument::VotingAuthority)
                .collect(),
        }
    }

    pub fn mail_proxy_documents(&self) -> Vec<RoleDocument> {
        self.proxies.iter().cloned().map(RoleDocument::MailProxy).collect()
    }

    /// All documents in launch order: nodes, authorities, mail proxies.
    pub fn documents(&self) -> Vec<RoleDocument> {
        let mut docs = self.node_documents();
        docs.extend(self.authority_documents());
        docs.extend(self.mail_proxy_documents());
        docs
    }

    /// Every port handed out, in launch order.
    pub fn ports(&self) -> Vec<u16> {
        self.documents().iter().flat_map(RoleDocument::ports).collect()
    }

    /// Write `cluster.json` into the base dir and return its path.
    pub fn write_manifest(&self) -> Result<PathBuf, ClusterError> {
        let manifest = Manifest {
            base_dir: &self.base_dir,
            instances: self
                .documents()
                .iter()
                .map(|doc| ManifestEntry {
                    identifier: doc.identifier(),
                    role: doc.role(),
                    addresses: doc.addresses(),
                    data_dir: doc.data_dir().to_path_buf(),
                    identity_key: doc.identity_key(),
                })
                .collect(),
        };
        let path = self.base_dir.join(MANIFEST_FILE);
        let body = serde_json::to_string_pretty(&manifest)
            .map_err(|e| ClusterError::directory(&path, e))?;
        fs::write(&path, body).map_err(|e| ClusterError::directory(&path, e))?;
        Ok(path)
    }
}
