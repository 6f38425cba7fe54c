//! Tests for fact parsing and the derived guest/host lookup.

use super::*;

fn guest(uuid: &str, virt_uuid: &str) -> Consumer {
    Consumer::new(uuid, "owner1")
        .with_fact(fact::IS_GUEST, "true")
        .with_fact(fact::VIRT_UUID, virt_uuid)
}

fn hypervisor(uuid: &str, guests: &[&str]) -> Consumer {
    Consumer::new(uuid, "owner1")
        .with_fact(fact::IS_GUEST, "false")
        .with_guest_ids(guests.iter().map(ToString::to_string).collect())
}

#[test]
fn socket_count_defaults_on_absent_or_junk() {
    let c = Consumer::new("c1", "owner1");
    assert_eq!(c.socket_count(1), 1);

    let c = c.with_fact(fact::SOCKETS, "forty");
    assert_eq!(c.socket_count(2), 2);

    let c = c.with_fact(fact::SOCKETS, "40");
    assert_eq!(c.socket_count(1), 40);
}

#[test]
fn guest_detection_reads_virt_fact() {
    assert!(guest("g1", "vg1").is_guest());
    assert!(!hypervisor("h1", &[]).is_guest());
    assert!(!Consumer::new("c1", "owner1").is_guest());
}

#[test]
fn host_lookup_follows_latest_report() {
    let registry = ConsumerRegistry::new();
    let g = guest("g1", "vg1");
    registry.upsert(g.clone());
    registry.upsert(hypervisor("h1", &["vg1"]));
    assert_eq!(registry.host_of(&g).as_deref(), Some("h1"));

    // A later report by another hypervisor moves the guest.
    registry.upsert(hypervisor("h2", &["vg1"]));
    assert_eq!(registry.host_of(&g).as_deref(), Some("h2"));
    assert!(registry.is_guest_of(&g, "h2"));
    assert!(!registry.is_guest_of(&g, "h1"));
}

#[test]
fn host_update_replaces_claims_wholesale() {
    let registry = ConsumerRegistry::new();
    let g1 = guest("g1", "vg1");
    let g2 = guest("g2", "vg2");
    registry.upsert(g1.clone());
    registry.upsert(g2.clone());
    registry.upsert(hypervisor("h1", &["vg1", "vg2"]));
    assert_eq!(registry.host_of(&g1).as_deref(), Some("h1"));
    assert_eq!(registry.host_of(&g2).as_deref(), Some("h1"));

    // Re-report without vg2: the claim disappears with the snapshot.
    registry.upsert(hypervisor("h1", &["vg1"]));
    assert_eq!(registry.host_of(&g1).as_deref(), Some("h1"));
    assert_eq!(registry.host_of(&g2), None);
}

#[test]
fn unmapped_guest_has_no_host() {
    let registry = ConsumerRegistry::new();
    let g = guest("g1", "vg1");
    registry.upsert(g.clone());
    assert_eq!(registry.host_of(&g), None);

    // A consumer without a virt uuid can never be mapped.
    let bare = Consumer::new("c1", "owner1").with_fact(fact::IS_GUEST, "true");
    registry.upsert(bare.clone());
    assert_eq!(registry.host_of(&bare), None);
}

#[test]
fn registration_payload_deserializes_with_defaults() {
    // The registration service feeds consumer records as JSON; absent
    // collections default to empty.
    let consumer: Consumer = serde_json::from_str(
        r#"{
            "uuid": "c1",
            "owner": "owner1",
            "facts": {"virt.is_guest": "true", "virt.uuid": "vg1"},
            "registered_at": "2026-08-01T00:00:00Z"
        }"#,
    )
    .unwrap();
    assert!(consumer.is_guest());
    assert_eq!(consumer.virt_uuid(), Some("vg1"));
    assert!(consumer.installed_products.is_empty());
    assert!(consumer.guest_ids.is_empty());
}

#[test]
fn remove_drops_snapshot_and_claims() {
    let registry = ConsumerRegistry::new();
    let g = guest("g1", "vg1");
    registry.upsert(g.clone());
    registry.upsert(hypervisor("h1", &["vg1"]));
    registry.remove("h1");
    assert!(registry.get("h1").is_err());
    assert_eq!(registry.host_of(&g), None);
}
