//! Authority documents: single (non-voting) and voting variants.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{
    AuthorityPeer, Logging, NodeDescriptor, validate_addresses, validate_data_dir,
    validate_identifier, validate_peers, validate_whitelist,
};
use crate::error::ClusterError;
use crate::identity::{Identity, SecretKey};

pub const AUTHORITY_LOG_FILE: &str = "authority.log";

/// `[Authority]`: identity and reachability of one authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthoritySection {
    pub identifier: String,
    pub addresses: Vec<String>,
    pub data_dir: PathBuf,
}

/// `[Parameters]`: network-wide timing parameters published in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameters {
    pub mix_lambda: f64,
    pub mix_max_delay: u64,
    pub send_lambda: f64,
    pub send_max_interval: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            mix_lambda: 1.0,
            mix_max_delay: 10_000,
            send_lambda: 123.0,
            send_max_interval: 123_456,
        }
    }
}

/// `[Debug]`: key material and topology knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthorityDebug {
    pub identity_key: SecretKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_key: Option<SecretKey>,
    pub layers: u8,
    pub min_nodes_per_layer: u32,
    #[serde(default)]
    pub generate_only: bool,
}

impl AuthorityDebug {
    pub fn new(identity: &Identity) -> Self {
        Self {
            identity_key: identity.secret_key(),
            link_key: None,
            layers: 3,
            min_nodes_per_layer: 1,
            generate_only: false,
        }
    }

    fn fixup(&mut self, instance: &str) -> Result<(), ClusterError> {
        if self.layers == 0 {
            return Err(ClusterError::config(instance, "layers must be at least 1"));
        }
        if self.min_nodes_per_layer == 0 {
            self.min_nodes_per_layer = 1;
        }
        Ok(())
    }
}

// ── single authority ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthorityConfig {
    pub authority: AuthoritySection,
    pub logging: Logging,
    pub debug: AuthorityDebug,
    #[serde(default)]
    pub mixes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub providers: Vec<NodeDescriptor>,
}

impl AuthorityConfig {
    pub fn identity(&self) -> Identity {
        Identity::from_secret(&self.debug.identity_key)
    }

    pub fn fixup_and_validate(&mut self) -> Result<(), ClusterError> {
        let id = self.authority.identifier.clone();
        validate_identifier(&id, &self.authority.identifier)?;
        validate_addresses(&id, &self.authority.addresses)?;
        validate_data_dir(&id, &self.authority.data_dir)?;
        self.logging.fixup(&id, AUTHORITY_LOG_FILE)?;
        self.debug.fixup(&id)?;
        validate_whitelist(&id, &self.providers, &self.mixes)
    }
}

// ── voting authority ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VotingAuthorityConfig {
    pub authority: AuthoritySection,
    pub logging: Logging,
    pub parameters: Parameters,
    pub debug: AuthorityDebug,
    /// Every other voting authority; never this one.
    #[serde(default)]
    pub authorities: Vec<AuthorityPeer>,
    #[serde(default)]
    pub mixes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub providers: Vec<NodeDescriptor>,
}

impl VotingAuthorityConfig {
    pub fn identity(&self) -> Identity {
        Identity::from_secret(&self.debug.identity_key)
    }

    /// How the other authorities and every node refer to this one.
    pub fn peer_reference(&self) -> AuthorityPeer {
        let identity = self.identity();
        AuthorityPeer {
            identity_public_key: identity.public_key(),
            link_public_key: identity.link_public_key(),
            addresses: self.authority.addresses.clone(),
        }
    }

    pub fn fixup_and_validate(&mut self) -> Result<(), ClusterError> {
        let id = self.authority.identifier.clone();
        validate_identifier(&id, &self.authority.identifier)?;
        validate_addresses(&id, &self.authority.addresses)?;
        validate_data_dir(&id, &self.authority.data_dir)?;
        self.logging.fixup(&id, AUTHORITY_LOG_FILE)?;
        self.debug.fixup(&id)?;

        let identity = self.identity();
        let derived = identity.link_secret_key();
        if self.debug.link_key.as_ref().is_some_and(|k| *k != derived) {
            return Err(ClusterError::config(
                &id,
                "link key must be derived from the identity key",
            ));
        }
        self.debug.link_key = Some(derived);

        validate_peers(&id, &self.authorities)?;
        if self
            .authorities
            .iter()
            .any(|p| p.identity_public_key == identity.public_key())
        {
            return Err(ClusterError::config(&id, "peer list contains this authority"));
        }
        validate_whitelist(&id, &self.providers, &self.mixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voting(dir: &str, port: u16) -> VotingAuthorityConfig {
        let identity = Identity::generate().unwrap();
        VotingAuthorityConfig {
            authority: AuthoritySection {
                identifier: "authority-0.example.org".into(),
                addresses: vec![format!("127.0.0.1:{port}")],
                data_dir: PathBuf::from(dir),
            },
            logging: Logging::debug(AUTHORITY_LOG_FILE),
            parameters: Parameters::default(),
            debug: AuthorityDebug::new(&identity),
            authorities: vec![],
            mixes: vec![],
            providers: vec![],
        }
    }

    #[test]
    fn fixup_derives_link_key() {
        let mut cfg = voting("/tmp/authority0", 30001);
        cfg.fixup_and_validate().unwrap();
        assert_eq!(cfg.debug.link_key, Some(cfg.identity().link_secret_key()));
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut cfg = voting("/tmp/authority0", 30001);
        cfg.authorities.push(cfg.peer_reference());
        let err = cfg.fixup_and_validate().unwrap_err();
        assert!(err.to_string().contains("contains this authority"));
    }

    #[test]
    fn foreign_link_key_is_rejected() {
        let mut cfg = voting("/tmp/authority0", 30001);
        cfg.debug.link_key = Some(Identity::generate().unwrap().link_secret_key());
        assert!(cfg.fixup_and_validate().is_err());
    }

    #[test]
    fn duplicate_whitelist_entry_is_rejected() {
        let mut cfg = voting("/tmp/authority0", 30001);
        let node = NodeDescriptor {
            identifier: "node-0.example.org".into(),
            identity_key: Identity::generate().unwrap().public_key(),
        };
        cfg.mixes = vec![node.clone()];
        cfg.providers = vec![node];
        assert!(cfg.fixup_and_validate().is_err());
    }

    #[test]
    fn serializes_with_pascal_case_sections() {
        let mut cfg = voting("/tmp/authority0", 30001);
        cfg.fixup_and_validate().unwrap();
        let text = toml::to_string(&cfg).unwrap();
        assert!(text.contains("[Authority]"));
        assert!(text.contains("MixMaxDelay = 10000"));
        assert!(text.contains("LinkKey"));
    }
}
