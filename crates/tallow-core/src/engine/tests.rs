//! Engine facade tests: subscription lifecycle, manual bind
//! enforcement, revocation cascades, and the certificate hook.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};

use super::*;
use crate::catalog::{ValidityWindow, attr};
use crate::consumer::fact;

fn window() -> ValidityWindow {
    let now = Utc::now();
    ValidityWindow::new(now - Duration::days(1), now + Duration::days(365))
}

fn subscription(id: &str, product_id: &str, quantity: u64) -> Subscription {
    Subscription {
        id: id.to_string(),
        owner: "owner1".to_string(),
        product_id: product_id.to_string(),
        quantity,
        window: window(),
    }
}

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

fn host_limited_product(id: &str) -> Product {
    Product::new(id, id)
        .with_attribute(attr::SOCKETS, "1")
        .with_attribute(attr::STACKING_ID, "s1")
        .with_attribute(attr::VIRT_LIMIT, "1")
        .with_attribute(attr::HOST_LIMITED, "true")
        .with_attribute(attr::MULTI_ENTITLEMENT, "yes")
}

#[test]
fn subscription_with_virt_limit_creates_base_and_bonus_pool() {
    let engine = engine();
    engine.upsert_product(host_limited_product("p1"));
    let pools = engine.create_subscription(&subscription("sub1", "p1", 20)).unwrap();
    assert_eq!(pools.len(), 2);
    assert_eq!(engine.list_pools("owner1").len(), 2);

    let plain = Product::new("p2", "p2").with_attribute(attr::SOCKETS, "2");
    engine.upsert_product(plain);
    engine.create_subscription(&subscription("sub2", "p2", 10)).unwrap();
    assert_eq!(engine.list_pools("owner1").len(), 3);
}

#[test]
fn providing_pools_resolve_through_provided_sets() {
    let engine = engine();
    engine.upsert_product(host_limited_product("p1").providing("base"));
    engine.create_subscription(&subscription("sub1", "p1", 20)).unwrap();

    // Both the base pool and the subscription bonus pool provide the
    // addon's target product.
    assert_eq!(engine.resolve_providing_pools("owner1", "base").len(), 2);
    assert_eq!(engine.resolve_providing_pools("owner1", "p1").len(), 2);
    assert!(engine.resolve_providing_pools("owner1", "ghost").is_empty());
}

#[test]
fn subscription_for_unknown_product_is_rejected() {
    let engine = engine();
    assert!(matches!(
        engine.create_subscription(&subscription("sub1", "ghost", 1)),
        Err(EngineError::UnknownProduct { .. })
    ));
}

#[test]
fn delete_subscription_removes_pools_and_revokes() {
    let engine = engine();
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(
        Consumer::new("c1", "owner1")
            .with_fact(fact::SOCKETS, "2")
            .with_installed_product("p1"),
    );
    let ents = engine.bind("c1").unwrap();
    assert_eq!(ents.len(), 1);

    let revoked = engine.delete_subscription("sub1").unwrap();
    assert_eq!(revoked.len(), 1);
    assert!(engine.list_pools("owner1").is_empty());
    assert!(engine.list_entitlements("c1").is_empty());
}

#[test]
fn delete_unknown_subscription_is_rejected() {
    let engine = engine();
    assert!(matches!(
        engine.delete_subscription("ghost"),
        Err(EngineError::UnknownSubscription { .. })
    ));
}

#[test]
fn manual_bind_enforces_visibility() {
    let engine = engine();
    engine.upsert_product(host_limited_product("p1"));
    engine.create_subscription(&subscription("sub1", "p1", 20)).unwrap();
    engine.register_consumer(Consumer::new("g1", "owner1").with_fact(fact::IS_GUEST, "true"));

    let base = engine
        .list_pools("owner1")
        .into_iter()
        .find(|s| !s.pool.is_derived())
        .unwrap();
    assert!(matches!(
        engine.bind_pool("g1", &base.pool.id, 1),
        Err(BindError::VisibilityDenied { .. })
    ));
}

#[test]
fn manual_bind_enforces_multi_entitlement() {
    let engine = engine();
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1"));
    let pool_id = engine.list_pools("owner1")[0].pool.id.clone();

    assert!(matches!(
        engine.bind_pool("c1", &pool_id, 2),
        Err(BindError::NotMultiEntitlement { .. })
    ));
    engine.bind_pool("c1", &pool_id, 1).unwrap();
    assert!(matches!(
        engine.bind_pool("c1", &pool_id, 1),
        Err(BindError::NotMultiEntitlement { .. })
    ));
}

#[test]
fn manual_bind_rounds_to_instance_granularity() {
    let engine = engine();
    engine.upsert_product(
        Product::new("p1", "p1")
            .with_attribute(attr::SOCKETS, "1")
            .with_attribute(attr::INSTANCE_MULTIPLIER, "2")
            .with_attribute(attr::MULTI_ENTITLEMENT, "yes"),
    );
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1").with_fact(fact::IS_GUEST, "false"));
    let pool_id = engine.list_pools("owner1")[0].pool.id.clone();

    let ent = engine.bind_pool("c1", &pool_id, 3).unwrap();
    assert_eq!(ent.quantity, 4);
}

#[test]
fn manual_bind_surfaces_insufficient_capacity() {
    let engine = engine();
    engine.upsert_product(
        Product::new("p1", "p1")
            .with_attribute(attr::SOCKETS, "1")
            .with_attribute(attr::MULTI_ENTITLEMENT, "yes"),
    );
    engine.create_subscription(&subscription("sub1", "p1", 5)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1"));
    let pool_id = engine.list_pools("owner1")[0].pool.id.clone();

    assert!(matches!(
        engine.bind_pool("c1", &pool_id, 6),
        Err(BindError::InsufficientCapacity { .. })
    ));
}

#[test]
fn revoke_is_idempotent_and_returns_capacity_once() {
    let engine = engine();
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1"));
    let pool_id = engine.list_pools("owner1")[0].pool.id.clone();

    let ent = engine.bind_pool("c1", &pool_id, 1).unwrap();
    engine.revoke(&ent.id).unwrap();
    engine.revoke(&ent.id).unwrap();

    let snapshot = engine.list_pools("owner1").remove(0);
    assert_eq!(snapshot.consumed, 0);
}

struct CountingNotifier {
    batches: Arc<AtomicUsize>,
    fail: bool,
}

impl CertificateNotifier for CountingNotifier {
    fn entitlements_committed(
        &self,
        _entitlements: &[Entitlement],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("certificate service unavailable".into());
        }
        Ok(())
    }
}

#[test]
fn notifier_sees_committed_batches() {
    let batches = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(EngineConfig::default()).with_notifier(Box::new(CountingNotifier {
        batches: Arc::clone(&batches),
        fail: false,
    }));
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1").with_installed_product("p1"));

    engine.bind("c1").unwrap();
    assert_eq!(batches.load(Ordering::SeqCst), 1);
}

#[test]
fn notifier_failure_does_not_unwind_entitlements() {
    let batches = Arc::new(AtomicUsize::new(0));
    let engine = Engine::new(EngineConfig::default()).with_notifier(Box::new(CountingNotifier {
        batches: Arc::clone(&batches),
        fail: true,
    }));
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    engine.create_subscription(&subscription("sub1", "p1", 10)).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1").with_installed_product("p1"));

    let ents = engine.bind("c1").unwrap();
    assert_eq!(ents.len(), 1);
    assert_eq!(engine.list_entitlements("c1").len(), 1);
    assert_eq!(batches.load(Ordering::SeqCst), 1);
}

#[test]
fn expired_pool_is_not_bindable() {
    let engine = engine();
    engine.upsert_product(Product::new("p1", "p1").with_attribute(attr::SOCKETS, "2"));
    let now = Utc::now();
    let lapsed = Subscription {
        id: "sub1".to_string(),
        owner: "owner1".to_string(),
        product_id: "p1".to_string(),
        quantity: 10,
        window: ValidityWindow::new(now - Duration::days(30), now - Duration::days(1)),
    };
    engine.create_subscription(&lapsed).unwrap();
    engine.register_consumer(Consumer::new("c1", "owner1").with_installed_product("p1"));
    let pool_id = engine.list_pools("owner1")[0].pool.id.clone();

    assert!(matches!(
        engine.bind_pool("c1", &pool_id, 1),
        Err(BindError::PoolExpired { .. })
    ));
    // Heal cannot use it either.
    assert!(matches!(engine.bind("c1"), Err(BindError::AutobindFailed { .. })));
}
