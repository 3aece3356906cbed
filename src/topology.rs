//! Topology wiring: the voting-authority peer mesh and the node whitelist.
//!
//! Both functions need the complete set of their inputs. They are only ever
//! called from [`crate::synth::ClusterBuilder::finish`], after every
//! synthesis call has returned, so neither can observe a partial set.

use std::collections::BTreeMap;

use crate::documents::{
    AuthorityConfig, AuthorityPeer, NodeDescriptor, ServerConfig, VotingAuthorityConfig,
};
use crate::identity::KEY_SIZE;

/// Give every voting authority the peer references of all the others.
///
/// Peers are keyed by the canonical 32-byte identity public key; each
/// authority's peer set is the full set minus its own key. The resulting
/// order follows the key bytes, which callers must not rely on.
pub fn build_voting_mesh(authorities: &mut [VotingAuthorityConfig]) {
    let all: BTreeMap<[u8; KEY_SIZE], AuthorityPeer> = authorities
        .iter()
        .map(|cfg| {
            let peer = cfg.peer_reference();
            (*peer.identity_public_key.as_bytes(), peer)
        })
        .collect();

    for cfg in authorities.iter_mut() {
        let own = *cfg.identity().public_key().as_bytes();
        cfg.authorities = all
            .iter()
            .filter(|(key, _)| **key != own)
            .map(|(_, peer)| peer.clone())
            .collect();
    }
}

/// The nodes every authority admits into consensus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    pub providers: Vec<NodeDescriptor>,
    pub mixes: Vec<NodeDescriptor>,
}

impl Whitelist {
    pub fn len(&self) -> usize {
        self.providers.len() + self.mixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attach_voting(&self, authorities: &mut [VotingAuthorityConfig]) {
        for cfg in authorities {
            cfg.providers = self.providers.clone();
            cfg.mixes = self.mixes.clone();
        }
    }

    pub fn attach_single(&self, authority: &mut AuthorityConfig) {
        authority.providers = self.providers.clone();
        authority.mixes = self.mixes.clone();
    }
}

/// Partition nodes by their provider flag, keeping creation order.
pub fn build_whitelist(nodes: &[ServerConfig]) -> Whitelist {
    let (providers, mixes): (Vec<&ServerConfig>, Vec<&ServerConfig>) =
        nodes.iter().partition(|cfg| cfg.is_provider());
    Whitelist {
        providers: providers.into_iter().map(ServerConfig::descriptor).collect(),
        mixes: mixes.into_iter().map(ServerConfig::descriptor).collect(),
    }
}
