//! Tests for cluster synthesis and topology wiring.

use std::collections::BTreeSet;
use std::fs;

use mixcluster::ClusterError;
use mixcluster::documents::RoleDocument;
use mixcluster::identity::UserKey;
use mixcluster::synth::{AuthorityMode, ClusterBuilder, NodeKind};
use tempfile::TempDir;

#[test]
fn test_three_voting_one_provider_two_mixes() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Voting, 3).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.synthesize_node(NodeKind::Mix).unwrap();
    b.synthesize_node(NodeKind::Mix).unwrap();
    let cluster = b.finish().unwrap();

    let auths = cluster.voting_authorities();
    assert_eq!(auths.len(), 3);
    for auth in auths {
        let own = auth.identity().public_key();
        assert_eq!(auth.authorities.len(), 2);
        assert!(auth.authorities.iter().all(|p| p.identity_public_key != own));
        assert_eq!(auth.providers.len(), 1);
        assert_eq!(auth.mixes.len(), 2);
    }

    let docs = cluster.documents();
    assert_eq!(docs.len(), 6);
    let ports = cluster.ports();
    let distinct: BTreeSet<u16> = ports.iter().copied().collect();
    assert_eq!(distinct.len(), 6);
    assert_eq!(distinct, (30001..=30006).collect());
}

#[test]
fn test_single_authority_with_mail_proxies_has_distinct_ports() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.synthesize_node(NodeKind::Mix).unwrap();
    b.synthesize_mail_proxy("alice", "provider-0.example.org", &UserKey::generate().unwrap())
        .unwrap();
    b.synthesize_mail_proxy("bob", "provider-1.example.org", &UserKey::generate().unwrap())
        .unwrap();
    let cluster = b.finish().unwrap();

    let ports = cluster.ports();
    let distinct: BTreeSet<u16> = ports.iter().copied().collect();
    assert_eq!(ports.len(), 8);
    assert_eq!(distinct.len(), ports.len());
    assert_eq!(distinct, (30000..=30007).collect());
}

#[test]
fn test_voting_nodes_reference_every_authority() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Voting, 3).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    let cluster = b.finish().unwrap();

    let node = &cluster.nodes()[0];
    let peers = &node.pki.voting.as_ref().unwrap().peers;
    assert_eq!(peers.len(), 3);
    for auth in cluster.voting_authorities() {
        assert!(peers.contains(&auth.peer_reference()));
    }
    assert!(node.pki.nonvoting.is_none());
}

#[test]
fn test_whitelist_keys_match_node_identities() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.synthesize_node(NodeKind::Mix).unwrap();
    let cluster = b.finish().unwrap();

    let auth = cluster.single_authority().unwrap();
    let provider = &cluster.nodes()[0];
    let mix = &cluster.nodes()[1];
    assert_eq!(auth.providers, vec![provider.descriptor()]);
    assert_eq!(auth.mixes, vec![mix.descriptor()]);
    assert_eq!(
        mix.pki.nonvoting.as_ref().unwrap().public_key,
        auth.identity().public_key()
    );
}

#[test]
fn test_data_dirs_and_key_files_created() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Voting, 2).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    b.finish().unwrap();

    for dir in ["authority0", "authority1", "provider-0", "provider-1"] {
        let path = tmp.path().join(dir);
        assert!(path.join("identity.private").is_file(), "{dir} missing key");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700, "{dir} mode");
        }
    }
}

#[test]
fn test_documents_write_parseable_toml() {
    let tmp = TempDir::new().unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Voting, 2).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    let key = UserKey::generate().unwrap();
    b.synthesize_mail_proxy("alice", "provider-0.example.org", &key).unwrap();
    let cluster = b.finish().unwrap();

    for doc in cluster.documents() {
        let path = doc.write().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let value: toml::Value = toml::from_str(&text).unwrap();
        match doc {
            RoleDocument::VotingAuthority(_) => {
                assert_eq!(value["Authorities"].as_array().unwrap().len(), 1);
                assert_eq!(value["Parameters"]["SendLambda"].as_float(), Some(123.0));
            }
            RoleDocument::Server(_) => {
                assert!(value["Management"]["Enable"].as_bool().unwrap());
                assert_eq!(value["Provider"]["ServicePlugins"].as_array().unwrap().len(), 2);
            }
            RoleDocument::MailProxy(_) => {
                assert!(value["Recipients"].get("alice@provider-0.example.org").is_some());
            }
            RoleDocument::Authority(_) => unreachable!(),
        }
    }
}

#[test]
fn test_partial_failure_leaves_created_dirs() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("node-0")).unwrap();
    let mut b = ClusterBuilder::new(tmp.path(), 30000).unwrap();
    b.synthesize_authority(AuthorityMode::Single, 1).unwrap();
    b.synthesize_node(NodeKind::Provider).unwrap();
    let err = b.synthesize_node(NodeKind::Mix).unwrap_err();
    assert!(matches!(err, ClusterError::Directory { .. }));
    assert!(tmp.path().join("authority").is_dir());
    assert!(tmp.path().join("provider-0").is_dir());
}

#[test]
fn test_two_clusters_in_one_process_are_independent() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let mut first = ClusterBuilder::new(a.path(), 30000).unwrap();
    let mut second = ClusterBuilder::new(b.path(), 40000).unwrap();
    first.synthesize_authority(AuthorityMode::Single, 1).unwrap();
    second.synthesize_authority(AuthorityMode::Single, 1).unwrap();
    let p1 = first.synthesize_node(NodeKind::Provider).unwrap().server.identifier.clone();
    let p2 = second.synthesize_node(NodeKind::Provider).unwrap().server.identifier.clone();
    assert_eq!(p1, p2);
    assert_eq!(first.finish().unwrap().ports(), [30001, 30000]);
    assert_eq!(second.finish().unwrap().ports(), [40001, 40000]);
}
