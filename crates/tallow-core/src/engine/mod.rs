//! The allocation engine facade.
//!
//! [`Engine`] owns the catalog, consumer registry, pool store, and
//! bonus pool manager, and exposes the transport-agnostic API the
//! collaborators call: subscription and consumer events on the way in,
//! bind/revoke/list on the way out.
//!
//! Heal requests for one consumer are serialized through a per-consumer
//! lock; requests for different consumers proceed independently, and
//! pool-level contention is handled inside the store.

use std::sync::PoisonError;

use thiserror::Error;
use uuid::Uuid;

use crate::autobind::{BindError, Orchestrator};
use crate::bonus::BonusPoolManager;
use crate::catalog::{Catalog, Product, Subscription};
use crate::config::EngineConfig;
use crate::consumer::{Consumer, ConsumerRegistry};
use crate::coverage::CoverageCalculator;
use crate::locks::LockTable;
use crate::pool::{
    Entitlement, Pool, PoolError, PoolRestriction, PoolSnapshot, PoolSource, PoolStore, Quantity,
    RevokeReason,
};
use crate::stack::StackKey;

#[cfg(test)]
mod tests;

/// Errors from catalog-facing engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The subscription references a product the catalog has never
    /// seen.
    #[error("unknown product: {product_id}")]
    UnknownProduct {
        /// The product id that was not found.
        product_id: String,
    },

    /// No subscription generated the referenced pools.
    #[error("unknown subscription: {subscription_id}")]
    UnknownSubscription {
        /// The subscription id that was not found.
        subscription_id: String,
    },

    /// A pool store operation failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Fire-and-forget hook invoked after entitlements commit, so the
/// certificate service can issue certificates.
///
/// A notifier failure is logged and never rolls the entitlements back.
pub trait CertificateNotifier: Send + Sync {
    /// Called once per committed batch.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the engine only logs the error.
    fn entitlements_committed(
        &self,
        entitlements: &[Entitlement],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Entitlement allocation engine.
pub struct Engine {
    catalog: Catalog,
    consumers: ConsumerRegistry,
    store: PoolStore,
    bonus: BonusPoolManager,
    config: EngineConfig,
    notifier: Option<Box<dyn CertificateNotifier>>,
    consumer_locks: LockTable,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            catalog: Catalog::new(),
            consumers: ConsumerRegistry::new(),
            store: PoolStore::new(),
            bonus: BonusPoolManager::new(),
            config,
            notifier: None,
            consumer_locks: LockTable::new(),
        }
    }

    /// Attaches a certificate notifier, builder style.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Box<dyn CertificateNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// The product catalog (import service feed).
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The consumer registry (registration service feed).
    #[must_use]
    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    // -------------------------------------------------------------------------
    // Collaborator events
    // -------------------------------------------------------------------------

    /// Imports or replaces a product record.
    pub fn upsert_product(&self, product: Product) {
        self.catalog.upsert_product(product);
    }

    /// Registers a consumer snapshot.
    pub fn register_consumer(&self, consumer: Consumer) {
        self.consumers.upsert(consumer);
    }

    /// Applies an updated consumer snapshot (facts, installed products,
    /// guest list). The guest/host association is re-derived
    /// immediately.
    pub fn update_consumer(&self, consumer: Consumer) {
        self.consumers.upsert(consumer);
    }

    /// Handles a subscription-created event: generates the base pool
    /// and, for `virt_limit` products, the subscription bonus pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownProduct`] when the catalog has no
    /// record of the subscription's product.
    pub fn create_subscription(&self, subscription: &Subscription) -> Result<Vec<PoolSnapshot>, EngineError> {
        let product = self.catalog.product(&subscription.product_id).ok_or_else(|| {
            EngineError::UnknownProduct { product_id: subscription.product_id.clone() }
        })?;

        let base = Pool {
            id: Uuid::new_v4().to_string(),
            owner: subscription.owner.clone(),
            product_id: product.id.clone(),
            provided: product.provided.clone(),
            quantity: Quantity::Finite(subscription.quantity),
            window: subscription.window,
            stack_id: product.stacking_id().map(ToString::to_string),
            source: PoolSource::Subscription { subscription_id: subscription.id.clone() },
            restriction: PoolRestriction::None,
        };
        let mut created = vec![base.id.clone()];
        self.store.insert_pool(base)?;

        if let Some(bonus) = BonusPoolManager::subscription_bonus_pool(subscription, &product) {
            created.push(bonus.id.clone());
            self.store.insert_pool(bonus)?;
        }
        tracing::info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            pools = created.len(),
            "subscription pools created"
        );
        created
            .iter()
            .map(|id| self.store.snapshot(id).map_err(EngineError::from))
            .collect()
    }

    /// Handles a subscription-removed event: deletes its pools and
    /// cascade-revokes their entitlements, collapsing any host bonus
    /// pools those entitlements backed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownSubscription`] when no pools trace
    /// back to the subscription.
    pub fn delete_subscription(&self, subscription_id: &str) -> Result<Vec<Entitlement>, EngineError> {
        let pools = self.store.pools_for_subscription(subscription_id);
        if pools.is_empty() {
            return Err(EngineError::UnknownSubscription {
                subscription_id: subscription_id.to_string(),
            });
        }

        let mut revoked = Vec::new();
        for snapshot in pools {
            let stack_key = StackKey::derived_key(&snapshot.pool);
            let removed = self
                .store
                .remove_pool(&snapshot.pool.id, RevokeReason::SubscriptionRemoved)?;
            // Entitlements on the base pool may have been backing host
            // bonus pools; re-derive those now that they are gone.
            for ent in &removed {
                if let Ok(holder) = self.consumers.get(&ent.consumer_uuid) {
                    if !holder.is_guest() {
                        if let Err(err) = self.bonus.refresh_host_bonus(
                            &self.store,
                            &self.catalog,
                            &holder,
                            &stack_key,
                        ) {
                            tracing::warn!(
                                host = %holder.uuid,
                                %stack_key,
                                %err,
                                "bonus refresh failed after subscription removal"
                            );
                        }
                    }
                }
            }
            revoked.extend(removed);
        }
        tracing::info!(subscription_id, revoked = revoked.len(), "subscription removed");
        Ok(revoked)
    }

    // -------------------------------------------------------------------------
    // Bind API
    // -------------------------------------------------------------------------

    /// Heals the consumer: covers every uncovered installed product or
    /// rolls the whole request back.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::AutobindFailed`] with the products that
    /// could not be covered, or [`BindError::ConsumerNotFound`].
    pub fn bind(&self, consumer_uuid: &str) -> Result<Vec<Entitlement>, BindError> {
        let lock = self.consumer_locks.lock_for(consumer_uuid);
        let _serialized = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = self.orchestrator().heal(consumer_uuid)?;
        self.notify(&outcome.host_entitlements);
        self.notify(&outcome.entitlements);
        Ok(outcome.entitlements)
    }

    /// Manually binds a specific pool, bypassing the calculator but
    /// still enforcing visibility, validity, multi-entitlement, and
    /// instance granularity.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::InsufficientCapacity`],
    /// [`BindError::NotMultiEntitlement`],
    /// [`BindError::VisibilityDenied`], [`BindError::PoolExpired`], or
    /// the relevant not-found kind.
    pub fn bind_pool(
        &self,
        consumer_uuid: &str,
        pool_id: &str,
        quantity: u64,
    ) -> Result<Entitlement, BindError> {
        let lock = self.consumer_locks.lock_for(consumer_uuid);
        let _serialized = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let consumer = self
            .consumers
            .get(consumer_uuid)
            .map_err(|_| BindError::ConsumerNotFound { uuid: consumer_uuid.to_string() })?;
        let snapshot = self.store.snapshot(pool_id)?;
        if !snapshot.pool.window.is_active_at(chrono::Utc::now()) {
            return Err(BindError::PoolExpired { pool_id: pool_id.to_string() });
        }
        let orchestrator = self.orchestrator();
        if !orchestrator.pool_eligible(&consumer, &snapshot.pool) {
            return Err(BindError::VisibilityDenied {
                pool_id: pool_id.to_string(),
                consumer_uuid: consumer_uuid.to_string(),
            });
        }

        let mut quantity = quantity;
        if let Some(product) = self.catalog.product(&snapshot.pool.product_id) {
            if !product.multi_entitlement() {
                let already_held = self
                    .store
                    .active_entitlements_for(consumer_uuid)
                    .iter()
                    .any(|ent| {
                        self.store
                            .snapshot(&ent.pool_id)
                            .is_ok_and(|s| s.pool.product_id == product.id)
                    });
                if quantity > 1 || already_held {
                    return Err(BindError::NotMultiEntitlement { product_id: product.id });
                }
            }
            if !consumer.is_guest() {
                let granularity = u64::from(product.instance_multiplier());
                if granularity > 1 && quantity % granularity != 0 {
                    let rounded = (quantity / granularity + 1) * granularity;
                    tracing::debug!(
                        pool_id,
                        requested = quantity,
                        rounded,
                        "rounded manual bind up to the instance granularity"
                    );
                    quantity = rounded;
                }
            }
        }

        let guard = self.store.reserve(pool_id, quantity)?;
        let mut entitlements = self.store.commit(consumer_uuid, vec![guard])?;
        orchestrator.apply_bonus_side_effects(&consumer, &entitlements);
        self.notify(&entitlements);
        Ok(entitlements.remove(0))
    }

    // -------------------------------------------------------------------------
    // Revocation
    // -------------------------------------------------------------------------

    /// Revokes an entitlement, returning its quantity to the pool and
    /// collapsing any bonus pool it backed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::EntitlementNotFound`] for an unknown id.
    pub fn revoke(&self, entitlement_id: &str) -> Result<Entitlement, BindError> {
        let before = self.store.entitlement(entitlement_id)?;
        let released = self.store.release(entitlement_id, RevokeReason::Requested)?;
        if before.is_active() {
            self.cascade_after_revoke(&released);
        }
        Ok(released)
    }

    /// Revokes every active entitlement the consumer holds.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::ConsumerNotFound`] for an unknown consumer.
    pub fn revoke_all(&self, consumer_uuid: &str) -> Result<Vec<Entitlement>, BindError> {
        self.consumers
            .get(consumer_uuid)
            .map_err(|_| BindError::ConsumerNotFound { uuid: consumer_uuid.to_string() })?;
        let held = self.store.active_entitlements_for(consumer_uuid);
        let mut revoked = Vec::with_capacity(held.len());
        for ent in held {
            revoked.push(self.revoke(&ent.id)?);
        }
        tracing::info!(consumer = consumer_uuid, revoked = revoked.len(), "revoked all");
        Ok(revoked)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of every pool belonging to `owner`.
    #[must_use]
    pub fn list_pools(&self, owner: &str) -> Vec<PoolSnapshot> {
        self.store.list_pools(owner)
    }

    /// Pools whose source product is `product_id` or whose provided
    /// set contains it. An unknown product yields an empty result, not
    /// an error.
    #[must_use]
    pub fn resolve_providing_pools(&self, owner: &str, product_id: &str) -> Vec<PoolSnapshot> {
        self.store
            .list_pools(owner)
            .into_iter()
            .filter(|s| s.pool.provides(product_id))
            .collect()
    }

    /// Active entitlements held by a consumer.
    #[must_use]
    pub fn list_entitlements(&self, consumer_uuid: &str) -> Vec<Entitlement> {
        self.store.active_entitlements_for(consumer_uuid)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator {
            store: &self.store,
            catalog: &self.catalog,
            consumers: &self.consumers,
            bonus: &self.bonus,
            calculator: CoverageCalculator::new(self.config.default_socket_count),
            config: &self.config,
            consumer_locks: &self.consumer_locks,
        }
    }

    /// After a live revocation, re-derives any host bonus pool the
    /// entitlement backed. Cascaded guests surface as `SourceRevoked`
    /// revocations, not as caller-facing errors.
    fn cascade_after_revoke(&self, released: &Entitlement) {
        let Ok(holder) = self.consumers.get(&released.consumer_uuid) else {
            return;
        };
        let Ok(snapshot) = self.store.snapshot(&released.pool_id) else {
            return;
        };
        let Some(product) = self.catalog.product(&snapshot.pool.product_id) else {
            return;
        };
        if !BonusPoolManager::qualifies(&holder, &snapshot.pool, &product) {
            return;
        }
        let stack_key = StackKey::derived_key(&snapshot.pool);
        match self
            .bonus
            .refresh_host_bonus(&self.store, &self.catalog, &holder, &stack_key)
        {
            Ok(cascaded) if !cascaded.is_empty() => {
                tracing::info!(
                    host = %holder.uuid,
                    %stack_key,
                    cascaded = cascaded.len(),
                    "guest entitlements lost their backing host entitlement"
                );
            },
            Ok(_) => {},
            Err(err) => {
                tracing::warn!(host = %holder.uuid, %stack_key, %err, "bonus refresh failed");
            },
        }
    }

    fn notify(&self, entitlements: &[Entitlement]) {
        if entitlements.is_empty() {
            return;
        }
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.entitlements_committed(entitlements) {
                // Fire-and-forget: certificate trouble never unwinds an
                // entitlement.
                tracing::warn!(%err, "certificate notifier failed");
            }
        }
    }
}
