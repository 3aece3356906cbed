//! Server documents: providers and mixes share one shape.

use std::{collections::BTreeSet, path::PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    AuthorityPeer, Logging, Management, NodeDescriptor, validate_addresses, validate_data_dir,
    validate_identifier, validate_peers,
};
use crate::error::ClusterError;
use crate::identity::{Identity, PublicKey, SecretKey};

pub const SERVER_LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerSection {
    pub identifier: String,
    pub addresses: Vec<String>,
    pub data_dir: PathBuf,
    pub is_provider: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerDebug {
    pub identity_key: SecretKey,
    #[serde(default)]
    pub num_sphinx_workers: u32,
}

/// `[PKI]`: exactly one of the two variants must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pki {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voting: Option<VotingPki>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonvoting: Option<NonvotingPki>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VotingPki {
    pub peers: Vec<AuthorityPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NonvotingPki {
    pub address: String,
    pub public_key: PublicKey,
}

/// A service plugin a provider exposes at a recipient-style endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServicePlugin {
    pub capability: String,
    pub endpoint: String,
    #[serde(default)]
    pub disable: bool,
}

impl ServicePlugin {
    pub fn new(capability: &str, endpoint: &str) -> Self {
        Self {
            capability: capability.to_string(),
            endpoint: endpoint.to_string(),
            disable: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderSection {
    #[serde(default)]
    pub service_plugins: Vec<ServicePlugin>,
}

impl ProviderSection {
    /// Loop-back echo and public-key lookup, enough to drive end-to-end tests.
    pub fn with_builtin_services() -> Self {
        Self {
            service_plugins: vec![
                ServicePlugin::new("loop", "+loop"),
                ServicePlugin::new("keyserver", "+keyserver"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    pub server: ServerSection,
    pub logging: Logging,
    pub debug: ServerDebug,
    #[serde(rename = "PKI")]
    pub pki: Pki,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<Management>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderSection>,
}

impl ServerConfig {
    pub fn identity(&self) -> Identity {
        Identity::from_secret(&self.debug.identity_key)
    }

    pub fn is_provider(&self) -> bool {
        self.server.is_provider
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            identifier: self.server.identifier.clone(),
            identity_key: self.identity().public_key(),
        }
    }

    /// Management socket path, once fixup has filled it in.
    pub fn management_socket(&self) -> Option<PathBuf> {
        self.management
            .as_ref()
            .filter(|m| m.enable)
            .and_then(|m| m.path.clone())
    }

    pub fn fixup_and_validate(&mut self) -> Result<(), ClusterError> {
        let id = self.server.identifier.clone();
        validate_identifier(&id, &self.server.identifier)?;
        validate_addresses(&id, &self.server.addresses)?;
        validate_data_dir(&id, &self.server.data_dir)?;
        self.logging.fixup(&id, SERVER_LOG_FILE)?;
        if self.debug.num_sphinx_workers == 0 {
            self.debug.num_sphinx_workers = 1;
        }

        match (&self.pki.voting, &self.pki.nonvoting) {
            (Some(voting), None) => {
                if voting.peers.is_empty() {
                    return Err(ClusterError::config(&id, "voting PKI has no peers"));
                }
                validate_peers(&id, &voting.peers)?;
            }
            (None, Some(nonvoting)) => {
                validate_addresses(&id, std::slice::from_ref(&nonvoting.address))?;
            }
            (Some(_), Some(_)) => {
                return Err(ClusterError::config(&id, "both voting and nonvoting PKI configured"));
            }
            (None, None) => return Err(ClusterError::config(&id, "no PKI configured")),
        }

        if self.server.is_provider {
            let Some(provider) = &self.provider else {
                return Err(ClusterError::config(&id, "provider has no [Provider] section"));
            };
            let mut endpoints = BTreeSet::new();
            for plugin in &provider.service_plugins {
                if plugin.capability.is_empty() || plugin.endpoint.is_empty() {
                    return Err(ClusterError::config(&id, "service plugin missing capability or endpoint"));
                }
                if !endpoints.insert(plugin.endpoint.as_str()) {
                    return Err(ClusterError::config(
                        &id,
                        format!("service endpoint '{}' used twice", plugin.endpoint),
                    ));
                }
            }
            let data_dir = self.server.data_dir.clone();
            self.management
                .get_or_insert_with(Management::enabled)
                .fixup(&data_dir);
        } else {
            if self.provider.is_some() {
                return Err(ClusterError::config(&id, "mix has a [Provider] section"));
            }
            if self.management.as_ref().is_some_and(|m| m.enable) {
                return Err(ClusterError::config(&id, "management is only available on providers"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mix() -> ServerConfig {
        let identity = Identity::generate().unwrap();
        let authority = Identity::generate().unwrap();
        ServerConfig {
            server: ServerSection {
                identifier: "node-0.example.org".into(),
                addresses: vec!["127.0.0.1:30002".into()],
                data_dir: PathBuf::from("/tmp/node-0"),
                is_provider: false,
            },
            logging: Logging::debug(SERVER_LOG_FILE),
            debug: ServerDebug {
                identity_key: identity.secret_key(),
                num_sphinx_workers: 0,
            },
            pki: Pki {
                voting: None,
                nonvoting: Some(NonvotingPki {
                    address: "127.0.0.1:30000".into(),
                    public_key: authority.public_key(),
                }),
            },
            management: None,
            provider: None,
        }
    }

    #[test]
    fn mix_fixup_fills_workers() {
        let mut cfg = mix();
        cfg.fixup_and_validate().unwrap();
        assert_eq!(cfg.debug.num_sphinx_workers, 1);
        assert!(cfg.management_socket().is_none());
    }

    #[test]
    fn provider_gets_management_socket() {
        let mut cfg = mix();
        cfg.server.is_provider = true;
        cfg.provider = Some(ProviderSection::with_builtin_services());
        cfg.fixup_and_validate().unwrap();
        assert_eq!(
            cfg.management_socket(),
            Some(PathBuf::from("/tmp/node-0/management_sock"))
        );
    }

    #[test]
    fn provider_without_section_is_invalid() {
        let mut cfg = mix();
        cfg.server.is_provider = true;
        assert!(cfg.fixup_and_validate().is_err());
    }

    #[test]
    fn mix_with_management_is_invalid() {
        let mut cfg = mix();
        cfg.management = Some(Management::enabled());
        let err = cfg.fixup_and_validate().unwrap_err();
        assert!(err.to_string().contains("only available on providers"));
    }

    #[test]
    fn pki_must_have_exactly_one_variant() {
        let mut cfg = mix();
        cfg.pki.nonvoting = None;
        assert!(cfg.fixup_and_validate().is_err());
    }

    #[test]
    fn duplicate_service_endpoint_is_invalid() {
        let mut cfg = mix();
        cfg.server.is_provider = true;
        let mut section = ProviderSection::with_builtin_services();
        section.service_plugins.push(ServicePlugin::new("echo", "+loop"));
        cfg.provider = Some(section);
        assert!(cfg.fixup_and_validate().is_err());
    }

    #[test]
    fn pki_section_is_upper_case() {
        let mut cfg = mix();
        cfg.fixup_and_validate().unwrap();
        let text = toml::to_string(&cfg).unwrap();
        assert!(text.contains("[PKI.Nonvoting]"));
        assert!(text.contains("IsProvider = false"));
    }
}
