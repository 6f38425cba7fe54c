//! Bonus (derived) pool maintenance for virtualization limits.
//!
//! Two derivation layers exist:
//!
//! 1. **Subscription bonus pools** are created alongside the base pool
//!    whenever the product carries a `virt_limit`. For host-limited
//!    products they are restricted to guests with no reported host, so
//!    a mapped guest is forced through its hypervisor instead.
//! 2. **Host bonus pools** materialize guest-visible capacity from a
//!    hypervisor's entitlements: exactly one pool per
//!    `(hypervisor, stack key)`, recomputed synchronously after any
//!    qualifying entitlement change. Its total is
//!    `virt_limit × quantity` summed over the backing entitlements;
//!    losing the last backing entitlement deletes the pool and
//!    cascade-revokes whatever guests drew from it.
//!
//! Recomputation for one hypervisor is serialized through a per-host
//! lock so concurrent qualifying commits cannot race-create duplicate
//! pools.

use std::collections::BTreeSet;
use std::sync::PoisonError;

use uuid::Uuid;

use crate::catalog::{Catalog, Product, Subscription, ValidityWindow, VirtLimit};
use crate::consumer::Consumer;
use crate::locks::LockTable;
use crate::pool::{
    Entitlement, Pool, PoolError, PoolRestriction, PoolSnapshot, PoolSource, PoolStore, Quantity,
    RevokeReason,
};
use crate::stack::StackKey;


/// Maintains the derived-capacity invariant for virtualization.
#[derive(Debug, Default)]
pub struct BonusPoolManager {
    host_locks: LockTable,
}

impl BonusPoolManager {
    /// Creates a manager with no serialized hosts yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The creation-time bonus pool for a subscription, if its product
    /// carries a `virt_limit`.
    #[must_use]
    pub fn subscription_bonus_pool(subscription: &Subscription, product: &Product) -> Option<Pool> {
        let virt_limit = product.virt_limit()?;
        let quantity = match virt_limit {
            VirtLimit::Unlimited => Quantity::Unlimited,
            VirtLimit::Finite(per_unit) => {
                Quantity::Finite(u64::from(per_unit).saturating_mul(subscription.quantity))
            },
        };
        let restriction = if product.host_limited() {
            PoolRestriction::UnmappedGuestsOnly
        } else {
            PoolRestriction::VirtOnly
        };
        Some(Pool {
            id: Uuid::new_v4().to_string(),
            owner: subscription.owner.clone(),
            product_id: product.id.clone(),
            provided: product.provided.clone(),
            quantity,
            window: subscription.window,
            stack_id: product.stacking_id().map(ToString::to_string),
            source: PoolSource::SubscriptionBonus { subscription_id: subscription.id.clone() },
            restriction,
        })
    }

    /// Returns `true` if an entitlement on `pool` (of `product`) held
    /// by `consumer` backs a host bonus pool.
    #[must_use]
    pub fn qualifies(consumer: &Consumer, pool: &Pool, product: &Product) -> bool {
        !consumer.is_guest()
            && !pool.is_derived()
            && product.host_limited()
            && product.virt_limit().is_some()
    }

    /// Recomputes the host bonus pool for `(host, stack_key)` from the
    /// host's current entitlements.
    ///
    /// Creates, resizes, or deletes the pool as the backing
    /// entitlements dictate; one pool per key, never a duplicate.
    /// Returns entitlements cascade-revoked (`SourceRevoked`) by a
    /// delete or a shrink below consumption.
    ///
    /// # Errors
    ///
    /// Propagates store failures; an unknown bonus pool id mid-refresh
    /// surfaces as [`PoolError::PoolNotFound`].
    pub fn refresh_host_bonus(
        &self,
        store: &PoolStore,
        catalog: &Catalog,
        host: &Consumer,
        stack_key: &str,
    ) -> Result<Vec<Entitlement>, PoolError> {
        let lock = self.host_locks.lock_for(&host.uuid);
        let _serialized = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let sources = Self::backing_entitlements(store, catalog, host, stack_key);
        let existing = store.find_host_bonus(&host.uuid, stack_key);

        if sources.is_empty() {
            return match existing {
                Some(snapshot) => {
                    tracing::info!(
                        host = %host.uuid,
                        stack_key,
                        pool_id = %snapshot.pool.id,
                        "host lost its backing entitlements; deleting bonus pool"
                    );
                    store.remove_pool(&snapshot.pool.id, RevokeReason::SourceRevoked)
                },
                None => Ok(Vec::new()),
            };
        }

        let (quantity, provided, window, stack_id) = derive_bonus_shape(&sources);
        match existing {
            Some(snapshot) => {
                store.update_pool_meta(&snapshot.pool.id, provided, window)?;
                let revoked =
                    store.resize_pool(&snapshot.pool.id, quantity, RevokeReason::SourceRevoked)?;
                tracing::debug!(
                    host = %host.uuid,
                    stack_key,
                    pool_id = %snapshot.pool.id,
                    "host bonus pool recomputed"
                );
                Ok(revoked)
            },
            None => {
                let pool = Pool {
                    id: Uuid::new_v4().to_string(),
                    owner: host.owner.clone(),
                    product_id: sources[0].1.pool.product_id.clone(),
                    provided,
                    quantity,
                    window,
                    stack_id,
                    source: PoolSource::HostBonus {
                        host_uuid: host.uuid.clone(),
                        stack_key: stack_key.to_string(),
                    },
                    restriction: PoolRestriction::GuestsOfHost { host_uuid: host.uuid.clone() },
                };
                tracing::info!(
                    host = %host.uuid,
                    stack_key,
                    pool_id = %pool.id,
                    "host bonus pool created"
                );
                store.insert_pool(pool)?;
                Ok(Vec::new())
            },
        }
    }

    /// The host's active entitlements that back the `(host, stack_key)`
    /// bonus pool, with their pool snapshots and products, in
    /// deterministic order.
    fn backing_entitlements(
        store: &PoolStore,
        catalog: &Catalog,
        host: &Consumer,
        stack_key: &str,
    ) -> Vec<(Entitlement, PoolSnapshot, Product)> {
        let mut sources: Vec<(Entitlement, PoolSnapshot, Product)> = store
            .active_entitlements_for(&host.uuid)
            .into_iter()
            .filter_map(|ent| {
                let snapshot = store.snapshot(&ent.pool_id).ok()?;
                if StackKey::derived_key(&snapshot.pool) != stack_key {
                    return None;
                }
                let product = catalog.product(&snapshot.pool.product_id)?;
                Self::qualifies(host, &snapshot.pool, &product)
                    .then_some((ent, snapshot, product))
            })
            .collect();
        sources.sort_by(|a, b| a.1.pool.id.cmp(&b.1.pool.id).then_with(|| a.0.id.cmp(&b.0.id)));
        sources
    }
}

/// Computes the derived pool's quantity, provided set, window, and
/// stack id from its backing entitlements.
fn derive_bonus_shape(
    sources: &[(Entitlement, PoolSnapshot, Product)],
) -> (Quantity, BTreeSet<String>, ValidityWindow, Option<String>) {
    let mut total: u64 = 0;
    let mut unlimited = false;
    let mut provided = BTreeSet::new();
    let mut window: Option<ValidityWindow> = None;
    let mut stack_id = None;

    for (ent, snapshot, product) in sources {
        match product.virt_limit() {
            Some(VirtLimit::Unlimited) => unlimited = true,
            Some(VirtLimit::Finite(per_unit)) => {
                total = total.saturating_add(u64::from(per_unit).saturating_mul(ent.quantity));
            },
            // qualifies() filtered on virt_limit presence already.
            None => {},
        }
        provided.insert(snapshot.pool.product_id.clone());
        provided.extend(snapshot.pool.provided.iter().cloned());
        window = Some(match window {
            Some(w) => w.union(&snapshot.pool.window),
            None => snapshot.pool.window,
        });
        stack_id.get_or_insert_with(|| snapshot.pool.stack_id.clone());
    }

    let quantity = if unlimited { Quantity::Unlimited } else { Quantity::Finite(total) };
    // sources is non-empty, so the window is always set by now.
    let window = window.unwrap_or(ValidityWindow {
        starts_at: chrono::DateTime::<chrono::Utc>::MIN_UTC,
        ends_at: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    });
    (quantity, provided, window, stack_id.flatten())
}
