//! In-memory pool store with per-pool atomic reservation.
//!
//! The store is the single shared-mutable resource of the allocator.
//! Quantity mutation happens under a per-pool mutex held only for the
//! check-and-increment (or decrement) itself, so reservations on one
//! pool are linearizable while unrelated pools never contend. There is
//! no store-wide lock on the reserve fast path.
//!
//! Lock order, where more than one is taken: entitlement table, then
//! pool table, then a pool entry. Entries are leaf locks and are never
//! held while acquiring another lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use uuid::Uuid;

use super::error::PoolError;
use super::{
    Entitlement, EntitlementState, Pool, PoolSnapshot, PoolSource, Quantity, RevokeReason,
};

/// Mutable per-pool state guarded by the entry mutex.
#[derive(Debug)]
struct PoolState {
    pool: Pool,
    consumed: u64,
    /// Set when the pool is removed while reservations are in flight;
    /// a retired entry admits no further reservations or commits.
    retired: bool,
}

#[derive(Debug)]
struct PoolEntry {
    state: Mutex<PoolState>,
}

impl PoolEntry {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            available: state.pool.quantity.available(state.consumed),
            consumed: state.consumed,
            pool: state.pool.clone(),
        }
    }
}

/// An uncommitted reservation of quantity on one pool.
///
/// Dropping the guard without committing returns the quantity to the
/// pool; a batch of guards therefore rolls an aborted request back
/// automatically.
#[must_use = "an unused reservation releases its quantity on drop"]
#[derive(Debug)]
pub struct ReservationGuard {
    entry: Arc<PoolEntry>,
    pool_id: String,
    quantity: u64,
    armed: bool,
}

impl ReservationGuard {
    /// The pool the quantity is reserved on.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// The reserved quantity.
    #[must_use]
    pub const fn quantity(&self) -> u64 {
        self.quantity
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.entry.lock();
            state.consumed = state.consumed.saturating_sub(self.quantity);
            tracing::debug!(
                pool_id = %self.pool_id,
                quantity = self.quantity,
                "released uncommitted reservation"
            );
        }
    }
}

/// Pool inventory with entitlement accounting.
#[derive(Debug, Default)]
pub struct PoolStore {
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    entitlements: RwLock<HashMap<String, Entitlement>>,
}

impl PoolStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DuplicatePool`] if the id is taken.
    pub fn insert_pool(&self, pool: Pool) -> Result<(), PoolError> {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if pools.contains_key(&pool.id) {
            return Err(PoolError::DuplicatePool { pool_id: pool.id });
        }
        tracing::debug!(pool_id = %pool.id, owner = %pool.owner, "pool created");
        pools.insert(
            pool.id.clone(),
            Arc::new(PoolEntry {
                state: Mutex::new(PoolState { pool, consumed: 0, retired: false }),
            }),
        );
        Ok(())
    }

    /// Removes a pool, revoking its active entitlements with `reason`.
    /// Returns the revoked entitlements so derivation layers can
    /// cascade.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolNotFound`] for an unknown pool.
    pub fn remove_pool(
        &self,
        pool_id: &str,
        reason: RevokeReason,
    ) -> Result<Vec<Entitlement>, PoolError> {
        let mut entitlements = self
            .entitlements
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            pools
                .remove(pool_id)
                .ok_or_else(|| PoolError::pool_not_found(pool_id))?
        };
        entry.lock().retired = true;

        let mut revoked = Vec::new();
        for ent in entitlements.values_mut() {
            if ent.pool_id == pool_id && ent.is_active() {
                ent.state = EntitlementState::Revoked { reason };
                revoked.push(ent.clone());
            }
        }
        if !revoked.is_empty() {
            tracing::info!(
                pool_id,
                revoked = revoked.len(),
                %reason,
                "pool removed with active entitlements"
            );
        }
        Ok(revoked)
    }

    /// Changes a pool's total capacity.
    ///
    /// If the new total lands below the consumed quantity, the newest
    /// active entitlements on the pool are revoked with `reason` until
    /// the capacity invariant holds again; the revoked entitlements are
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolNotFound`] for an unknown pool.
    pub fn resize_pool(
        &self,
        pool_id: &str,
        quantity: Quantity,
        reason: RevokeReason,
    ) -> Result<Vec<Entitlement>, PoolError> {
        let mut entitlements = self
            .entitlements
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = self.entry(pool_id)?;
        let mut state = entry.lock();
        state.pool.quantity = quantity;

        let mut revoked = Vec::new();
        if let Quantity::Finite(total) = quantity {
            if state.consumed > total {
                // Shed newest-first so the longest-held entitlements
                // keep their coverage.
                let mut on_pool: Vec<&Entitlement> = entitlements
                    .values()
                    .filter(|e| e.pool_id == pool_id && e.is_active())
                    .collect();
                on_pool.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
                });
                let mut to_revoke = Vec::new();
                let mut consumed = state.consumed;
                for ent in on_pool {
                    if consumed <= total {
                        break;
                    }
                    consumed = consumed.saturating_sub(ent.quantity);
                    to_revoke.push(ent.id.clone());
                }
                for id in to_revoke {
                    if let Some(ent) = entitlements.get_mut(&id) {
                        ent.state = EntitlementState::Revoked { reason };
                        state.consumed = state.consumed.saturating_sub(ent.quantity);
                        revoked.push(ent.clone());
                    }
                }
                tracing::warn!(
                    pool_id,
                    new_total = total,
                    revoked = revoked.len(),
                    "pool resized below consumption; shed newest entitlements"
                );
            }
        }
        Ok(revoked)
    }

    /// Replaces a pool's provided set and validity window (bonus pool
    /// refresh).
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolNotFound`] for an unknown pool.
    pub fn update_pool_meta(
        &self,
        pool_id: &str,
        provided: std::collections::BTreeSet<String>,
        window: crate::catalog::ValidityWindow,
    ) -> Result<(), PoolError> {
        let entry = self.entry(pool_id)?;
        let mut state = entry.lock();
        state.pool.provided = provided;
        state.pool.window = window;
        Ok(())
    }

    /// Atomically reserves `quantity` units on a pool.
    ///
    /// The check-and-increment runs under the pool's own lock, so two
    /// concurrent reservations can never jointly exceed capacity.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InsufficientCapacity`] when the pool cannot
    /// absorb the quantity, [`PoolError::ZeroQuantity`] for an empty
    /// request, and [`PoolError::PoolNotFound`] for unknown or retired
    /// pools.
    pub fn reserve(&self, pool_id: &str, quantity: u64) -> Result<ReservationGuard, PoolError> {
        if quantity == 0 {
            return Err(PoolError::ZeroQuantity { pool_id: pool_id.to_string() });
        }
        let entry = self.entry(pool_id)?;
        {
            let mut state = entry.lock();
            if state.retired {
                return Err(PoolError::pool_not_found(pool_id));
            }
            if !state.pool.quantity.admits(state.consumed, quantity) {
                let available = state.pool.quantity.available(state.consumed).unwrap_or(u64::MAX);
                return Err(PoolError::InsufficientCapacity {
                    pool_id: pool_id.to_string(),
                    requested: quantity,
                    available,
                });
            }
            state.consumed += quantity;
        }
        tracing::debug!(pool_id, quantity, "reserved");
        Ok(ReservationGuard {
            entry,
            pool_id: pool_id.to_string(),
            quantity,
            armed: true,
        })
    }

    /// Converts a batch of reservations into entitlements atomically.
    ///
    /// Either every guard becomes an entitlement or none does: if any
    /// reserved pool was retired while the request was in flight, all
    /// guards are dropped (returning their quantities) and the commit
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolNotFound`] if a reserved pool was
    /// removed before the commit.
    pub fn commit(
        &self,
        consumer_uuid: &str,
        guards: Vec<ReservationGuard>,
    ) -> Result<Vec<Entitlement>, PoolError> {
        let mut entitlements = self
            .entitlements
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for guard in &guards {
            if guard.entry.lock().retired {
                return Err(PoolError::pool_not_found(&guard.pool_id));
            }
        }

        let created_at = Utc::now();
        let mut committed = Vec::with_capacity(guards.len());
        for mut guard in guards {
            guard.armed = false;
            let ent = Entitlement {
                id: Uuid::new_v4().to_string(),
                consumer_uuid: consumer_uuid.to_string(),
                pool_id: guard.pool_id.clone(),
                quantity: guard.quantity,
                created_at,
                state: EntitlementState::Active,
            };
            tracing::debug!(
                entitlement_id = %ent.id,
                pool_id = %ent.pool_id,
                consumer = consumer_uuid,
                quantity = ent.quantity,
                "entitlement committed"
            );
            entitlements.insert(ent.id.clone(), ent.clone());
            committed.push(ent);
        }
        Ok(committed)
    }

    /// Revokes an entitlement, returning its quantity to the pool.
    ///
    /// Idempotent: revoking an already-revoked entitlement is a no-op
    /// that returns the record unchanged, and the quantity is released
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::EntitlementNotFound`] for an unknown id.
    pub fn release(
        &self,
        entitlement_id: &str,
        reason: RevokeReason,
    ) -> Result<Entitlement, PoolError> {
        let mut entitlements = self
            .entitlements
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let ent = entitlements.get_mut(entitlement_id).ok_or_else(|| {
            PoolError::EntitlementNotFound { entitlement_id: entitlement_id.to_string() }
        })?;
        if !ent.is_active() {
            return Ok(ent.clone());
        }
        ent.state = EntitlementState::Revoked { reason };
        let released = ent.clone();
        drop(entitlements);

        if let Ok(entry) = self.entry(&released.pool_id) {
            let mut state = entry.lock();
            state.consumed = state.consumed.saturating_sub(released.quantity);
        }
        tracing::debug!(
            entitlement_id,
            pool_id = %released.pool_id,
            quantity = released.quantity,
            %reason,
            "entitlement revoked"
        );
        Ok(released)
    }

    /// Snapshot of one pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolNotFound`] for an unknown pool.
    pub fn snapshot(&self, pool_id: &str) -> Result<PoolSnapshot, PoolError> {
        Ok(self.entry(pool_id)?.snapshot())
    }

    /// Snapshot of every pool belonging to `owner`.
    #[must_use]
    pub fn list_pools(&self, owner: &str) -> Vec<PoolSnapshot> {
        let entries: Vec<Arc<PoolEntry>> = {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            pools.values().cloned().collect()
        };
        let mut snapshots: Vec<PoolSnapshot> = entries
            .iter()
            .map(|e| e.snapshot())
            .filter(|s| s.pool.owner == owner)
            .collect();
        snapshots.sort_by(|a, b| a.pool.id.cmp(&b.pool.id));
        snapshots
    }

    /// The host bonus pool for `(host_uuid, stack_key)`, if one exists.
    #[must_use]
    pub fn find_host_bonus(&self, host_uuid: &str, stack_key: &str) -> Option<PoolSnapshot> {
        let entries: Vec<Arc<PoolEntry>> = {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            pools.values().cloned().collect()
        };
        entries.iter().map(|e| e.snapshot()).find(|s| {
            matches!(
                &s.pool.source,
                PoolSource::HostBonus { host_uuid: h, stack_key: k }
                    if h == host_uuid && k == stack_key
            )
        })
    }

    /// Pools generated by a subscription (base and bonus layers).
    #[must_use]
    pub fn pools_for_subscription(&self, subscription_id: &str) -> Vec<PoolSnapshot> {
        let entries: Vec<Arc<PoolEntry>> = {
            let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
            pools.values().cloned().collect()
        };
        entries
            .iter()
            .map(|e| e.snapshot())
            .filter(|s| match &s.pool.source {
                PoolSource::Subscription { subscription_id: id }
                | PoolSource::SubscriptionBonus { subscription_id: id } => id == subscription_id,
                PoolSource::HostBonus { .. } => false,
            })
            .collect()
    }

    /// Looks up an entitlement record.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::EntitlementNotFound`] for an unknown id.
    pub fn entitlement(&self, entitlement_id: &str) -> Result<Entitlement, PoolError> {
        let entitlements = self
            .entitlements
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entitlements.get(entitlement_id).cloned().ok_or_else(|| {
            PoolError::EntitlementNotFound { entitlement_id: entitlement_id.to_string() }
        })
    }

    /// Active entitlements held by a consumer.
    #[must_use]
    pub fn active_entitlements_for(&self, consumer_uuid: &str) -> Vec<Entitlement> {
        let entitlements = self
            .entitlements
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut held: Vec<Entitlement> = entitlements
            .values()
            .filter(|e| e.consumer_uuid == consumer_uuid && e.is_active())
            .cloned()
            .collect();
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        held
    }

    /// Active entitlements drawn from a pool.
    #[must_use]
    pub fn active_entitlements_on(&self, pool_id: &str) -> Vec<Entitlement> {
        let entitlements = self
            .entitlements
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut held: Vec<Entitlement> = entitlements
            .values()
            .filter(|e| e.pool_id == pool_id && e.is_active())
            .cloned()
            .collect();
        held.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        held
    }

    fn entry(&self, pool_id: &str) -> Result<Arc<PoolEntry>, PoolError> {
        let pools = self.pools.read().unwrap_or_else(PoisonError::into_inner);
        pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| PoolError::pool_not_found(pool_id))
    }
}
