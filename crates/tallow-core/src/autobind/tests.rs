//! Tests for candidate eligibility and stack selection.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};

use super::*;
use crate::catalog::{ValidityWindow, attr};
use crate::consumer::fact;
use crate::pool::{PoolSource, Quantity};

struct Fixture {
    store: PoolStore,
    catalog: Catalog,
    consumers: ConsumerRegistry,
    bonus: BonusPoolManager,
    config: EngineConfig,
    locks: LockTable,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: PoolStore::new(),
            catalog: Catalog::new(),
            consumers: ConsumerRegistry::new(),
            bonus: BonusPoolManager::new(),
            config: EngineConfig::default(),
            locks: LockTable::new(),
        }
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator {
            store: &self.store,
            catalog: &self.catalog,
            consumers: &self.consumers,
            bonus: &self.bonus,
            calculator: CoverageCalculator::new(self.config.default_socket_count),
            config: &self.config,
            consumer_locks: &self.locks,
        }
    }

    fn add_pool(&self, id: &str, product: &Product, quantity: u64, days_left: i64) {
        let now = Utc::now();
        self.store
            .insert_pool(Pool {
                id: id.to_string(),
                owner: "owner1".to_string(),
                product_id: product.id.clone(),
                provided: product.provided.clone(),
                quantity: Quantity::Finite(quantity),
                window: ValidityWindow::new(now - Duration::days(1), now + Duration::days(days_left)),
                stack_id: product.stacking_id().map(ToString::to_string),
                source: PoolSource::Subscription { subscription_id: format!("sub-{id}") },
                restriction: PoolRestriction::None,
            })
            .unwrap();
    }
}

fn stackable(id: &str) -> Product {
    Product::new(id, id)
        .with_attribute(attr::SOCKETS, "1")
        .with_attribute(attr::STACKING_ID, "s1")
        .with_attribute(attr::MULTI_ENTITLEMENT, "yes")
}

fn physical(uuid: &str, sockets: u32) -> Consumer {
    Consumer::new(uuid, "owner1")
        .with_fact(fact::IS_GUEST, "false")
        .with_fact(fact::SOCKETS, sockets.to_string())
}

#[test]
fn heal_accumulates_across_a_stack() {
    let fx = Fixture::new();
    let product = stackable("p1");
    fx.catalog.upsert_product(product.clone());
    fx.add_pool("pool-a", &product, 20, 10);
    fx.add_pool("pool-b", &product, 20, 10);
    fx.consumers
        .upsert(physical("c1", 30).with_installed_product("p1"));

    let outcome = fx.orchestrator().heal("c1").unwrap();
    assert_eq!(outcome.entitlements.len(), 2);
    let total: u64 = outcome.entitlements.iter().map(|e| e.quantity).sum();
    assert_eq!(total, 30);
}

#[test]
fn heal_prefers_soonest_expiring_pool() {
    let fx = Fixture::new();
    let product = stackable("p1");
    fx.catalog.upsert_product(product.clone());
    fx.add_pool("pool-late", &product, 20, 300);
    fx.add_pool("pool-soon", &product, 20, 5);
    fx.consumers
        .upsert(physical("c1", 10).with_installed_product("p1"));

    let outcome = fx.orchestrator().heal("c1").unwrap();
    assert_eq!(outcome.entitlements.len(), 1);
    assert_eq!(outcome.entitlements[0].pool_id, "pool-soon");
}

#[test]
fn covered_consumer_heals_to_nothing() {
    let fx = Fixture::new();
    let product = stackable("p1");
    fx.catalog.upsert_product(product.clone());
    fx.add_pool("pool-a", &product, 20, 10);
    fx.consumers
        .upsert(physical("c1", 10).with_installed_product("p1"));

    let first = fx.orchestrator().heal("c1").unwrap();
    assert_eq!(first.entitlements.len(), 1);
    let second = fx.orchestrator().heal("c1").unwrap();
    assert!(second.entitlements.is_empty());
}

#[test]
fn non_multi_entitlement_shortfall_fails_without_partial_commit() {
    let fx = Fixture::new();
    // One socket covered per unit, but no stacking of entitlements.
    let product = Product::new("p1", "p1")
        .with_attribute(attr::SOCKETS, "1")
        .with_attribute(attr::STACKING_ID, "s1");
    fx.catalog.upsert_product(product.clone());
    fx.add_pool("pool-a", &product, 20, 10);
    fx.consumers
        .upsert(physical("c1", 8).with_installed_product("p1"));

    let err = fx.orchestrator().heal("c1").unwrap_err();
    assert!(matches!(err, BindError::AutobindFailed { ref uncovered } if uncovered == &["p1"]));
    assert_eq!(fx.store.snapshot("pool-a").unwrap().consumed, 0);
}

#[test]
fn failure_on_one_product_rolls_back_the_other() {
    let fx = Fixture::new();
    let coverable = stackable("good");
    fx.catalog.upsert_product(coverable.clone());
    fx.add_pool("pool-good", &coverable, 20, 10);
    // "bad" is installed but exists nowhere in the inventory.
    fx.catalog.upsert_product(Product::new("bad", "bad"));
    fx.consumers.upsert(
        physical("c1", 4)
            .with_installed_product("good")
            .with_installed_product("bad"),
    );

    let err = fx.orchestrator().heal("c1").unwrap_err();
    assert!(matches!(err, BindError::AutobindFailed { ref uncovered } if uncovered == &["bad"]));
    // The reservation taken for "good" was rolled back.
    assert_eq!(fx.store.snapshot("pool-good").unwrap().consumed, 0);
    assert!(fx.store.active_entitlements_for("c1").is_empty());
}

#[test]
fn unknown_consumer_is_reported() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.orchestrator().heal("ghost"),
        Err(BindError::ConsumerNotFound { .. })
    ));
}

#[test]
fn host_limited_base_pool_is_invisible_to_guests() {
    let fx = Fixture::new();
    let product = stackable("p1").with_attribute(attr::HOST_LIMITED, "true");
    fx.catalog.upsert_product(product.clone());
    fx.add_pool("pool-a", &product, 20, 10);

    let guest = Consumer::new("g1", "owner1").with_fact(fact::IS_GUEST, "true");
    let host = physical("h1", 4);
    fx.consumers.upsert(guest.clone());
    fx.consumers.upsert(host.clone());

    let snapshot = fx.store.snapshot("pool-a").unwrap();
    let orchestrator = fx.orchestrator();
    assert!(!orchestrator.pool_eligible(&guest, &snapshot.pool));
    assert!(orchestrator.pool_eligible(&host, &snapshot.pool));
}

#[test]
fn restriction_eligibility_follows_current_mapping() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    let now = Utc::now();
    let pool = Pool {
        id: "bonus-1".to_string(),
        owner: "owner1".to_string(),
        product_id: "p1".to_string(),
        provided: BTreeSet::new(),
        quantity: Quantity::Finite(4),
        window: ValidityWindow::new(now, now + Duration::days(10)),
        stack_id: None,
        source: PoolSource::HostBonus { host_uuid: "h1".to_string(), stack_key: "p1".to_string() },
        restriction: PoolRestriction::GuestsOfHost { host_uuid: "h1".to_string() },
    };

    let guest = Consumer::new("g1", "owner1")
        .with_fact(fact::IS_GUEST, "true")
        .with_fact(fact::VIRT_UUID, "vg1");
    fx.consumers.upsert(guest.clone());
    // Not mapped yet: ineligible.
    assert!(!orchestrator.pool_eligible(&guest, &pool));

    // Mapped to h1: eligible. Mapped away: ineligible again.
    fx.consumers
        .upsert(Consumer::new("h1", "owner1").with_guest_ids(vec!["vg1".to_string()]));
    assert!(orchestrator.pool_eligible(&guest, &pool));
    fx.consumers
        .upsert(Consumer::new("h2", "owner1").with_guest_ids(vec!["vg1".to_string()]));
    assert!(!orchestrator.pool_eligible(&guest, &pool));
}

#[test]
fn unmapped_guest_restriction_excludes_mapped_guests() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator();
    let now = Utc::now();
    let pool = Pool {
        id: "sub-bonus".to_string(),
        owner: "owner1".to_string(),
        product_id: "p1".to_string(),
        provided: BTreeSet::new(),
        quantity: Quantity::Finite(4),
        window: ValidityWindow::new(now, now + Duration::days(10)),
        stack_id: None,
        source: PoolSource::SubscriptionBonus { subscription_id: "sub1".to_string() },
        restriction: PoolRestriction::UnmappedGuestsOnly,
    };

    let guest = Consumer::new("g1", "owner1")
        .with_fact(fact::IS_GUEST, "true")
        .with_fact(fact::VIRT_UUID, "vg1");
    fx.consumers.upsert(guest.clone());
    assert!(orchestrator.pool_eligible(&guest, &pool));

    fx.consumers
        .upsert(Consumer::new("h1", "owner1").with_guest_ids(vec!["vg1".to_string()]));
    assert!(!orchestrator.pool_eligible(&guest, &pool));

    let physical_box = physical("c1", 2);
    assert!(!orchestrator.pool_eligible(&physical_box, &pool));
}
