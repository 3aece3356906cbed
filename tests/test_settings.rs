//! Tests for the shipped settings file.

use std::path::Path;

use mixcluster::config::{DEFAULT_CONFIG_PATH, load_from};

#[test]
fn test_default_settings_file_exists() {
    assert!(
        Path::new(DEFAULT_CONFIG_PATH).is_file(),
        "config/default.toml missing"
    );
}

#[test]
fn test_default_settings_load() {
    let s = load_from(Path::new(DEFAULT_CONFIG_PATH), None, None).unwrap();
    assert_eq!(s.base_port, 30000);
    assert!(s.base_dir.is_none(), "default base dir should be a temp dir");
    assert!(s.topology.voting);
    assert!(s.topology.providers >= 1);
}

#[test]
fn test_default_users_name_existing_providers() {
    let s = load_from(Path::new(DEFAULT_CONFIG_PATH), None, None).unwrap();
    for user in &s.users {
        let index: usize = user
            .provider
            .strip_prefix("provider-")
            .and_then(|rest| rest.strip_suffix(".example.org"))
            .and_then(|n| n.parse().ok())
            .unwrap_or_else(|| panic!("unexpected provider '{}'", user.provider));
        assert!(index < s.topology.providers, "{} has no provider", user.name);
    }
}
