//! Generated hosts are persisted on objects and published in DNS, so the
//! derivation must never change between releases.

use glbc_common::{generate, BaseDomain, GeneratedHost, ObjectIdentity};

#[test]
fn generated_host_matches_published_vector() {
    let domain = BaseDomain::new("hcpapps.net").unwrap();
    let host = generate(&ObjectIdentity::new("root:acme", "default", "echo"), &domain);

    assert_eq!(
        host.as_str(),
        "d090dc486529e2f9ba3c14141abadb544a892953.hcpapps.net"
    );
}

#[test]
fn persisted_host_round_trips_through_annotation_value() {
    let domain = BaseDomain::new("hcpapps.net").unwrap();
    let host = generate(&ObjectIdentity::new("root:acme", "default", "echo"), &domain);

    let restored = GeneratedHost::from_persisted(&host.to_string()).unwrap();
    assert_eq!(restored, host);
}
