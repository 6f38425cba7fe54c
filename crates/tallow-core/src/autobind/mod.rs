//! Autobind orchestration: cover a consumer's installed products from
//! the pool inventory.
//!
//! A heal request runs one pass per uncovered installed product:
//! resolve visibility-eligible candidate pools, group them by stack,
//! size the requirement, then walk stacks in a deterministic priority
//! order, reserving quantity pool by pool until the requirement is
//! covered. Reservations lost to concurrent binds are retried once
//! against a refreshed snapshot.
//!
//! # All-or-nothing
//!
//! Reservations are held as RAII guards and committed only when every
//! product is covered. Host sub-binds are the one exception: they must
//! commit mid-request so the bonus pool side effect can materialize
//! before the guest's own selection, and are compensated by revocation
//! if the request subsequently fails. Either way, no partial outcome is
//! observable once the request returns.
//!
//! # Host routing
//!
//! A guest with a mapped host prefers the virtualization route: the
//! orchestrator first ensures the host holds sufficient host-limited
//! coverage for the product (healing the host if not, sized by the
//! host's own socket count), then covers the guest from the resulting
//! bonus pool. Physical pools are the fallback, not the first choice.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::bonus::BonusPoolManager;
use crate::catalog::{Catalog, Product};
use crate::config::EngineConfig;
use crate::consumer::{Consumer, ConsumerRegistry};
use crate::coverage::{CoverageCalculator, DERIVED_POOL_QUANTITY, Requirement};
use crate::locks::LockTable;
use crate::pool::{
    Entitlement, Pool, PoolRestriction, PoolSnapshot, PoolStore, ReservationGuard, RevokeReason,
};
use crate::stack::{StackKey, group_by_stack};

mod error;

#[cfg(test)]
mod tests;

pub use error::BindError;

/// Why one product could not be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoverFailure {
    /// A reservation was lost to a concurrent bind; worth retrying
    /// against a refreshed snapshot.
    Raced,
    /// No eligible combination of pools satisfies the requirement.
    Uncoverable,
}

/// In-flight state of one heal request.
#[derive(Default)]
struct Transaction {
    /// Uncommitted reservations; dropped guards release themselves.
    guards: Vec<ReservationGuard>,
    /// Host sub-bind entitlements committed mid-request, compensated by
    /// revocation if the request fails.
    committed: Vec<Entitlement>,
}

impl Transaction {
    fn reserved_count(&self) -> usize {
        self.guards.len() + self.committed.len()
    }
}

/// One stack with its selection-priority metrics.
struct RankedStack {
    pools: Vec<PoolSnapshot>,
    key: StackKey,
    has_derived: bool,
    satisfies: bool,
    earliest_end: DateTime<Utc>,
    capacity: u64,
}

/// What a successful heal produced.
#[derive(Debug)]
pub(crate) struct HealOutcome {
    /// Entitlements created for the healing consumer.
    pub entitlements: Vec<Entitlement>,
    /// Host sub-bind entitlements committed along the way.
    pub host_entitlements: Vec<Entitlement>,
}

/// Per-request orchestrator borrowing the engine's components.
pub(crate) struct Orchestrator<'a> {
    pub store: &'a PoolStore,
    pub catalog: &'a Catalog,
    pub consumers: &'a ConsumerRegistry,
    pub bonus: &'a BonusPoolManager,
    pub calculator: CoverageCalculator,
    pub config: &'a EngineConfig,
    /// Engine-wide per-consumer locks; host sub-binds take the host's
    /// lock so two guests of one hypervisor cannot double-entitle it.
    pub consumer_locks: &'a LockTable,
}

impl Orchestrator<'_> {
    /// Covers every uncovered installed product of the consumer, or
    /// rolls the whole request back.
    ///
    /// Returns the entitlements created for the consumer itself; host
    /// sub-bind entitlements belong to the host and are not included.
    pub(crate) fn heal(&self, consumer_uuid: &str) -> Result<HealOutcome, BindError> {
        let consumer = self
            .consumers
            .get(consumer_uuid)
            .map_err(|_| BindError::ConsumerNotFound { uuid: consumer_uuid.to_string() })?;
        let now = Utc::now();
        let uncovered = self.uncovered_products(&consumer);
        if uncovered.is_empty() {
            return Ok(HealOutcome { entitlements: Vec::new(), host_entitlements: Vec::new() });
        }
        tracing::info!(
            consumer = consumer_uuid,
            products = ?uncovered,
            "heal request started"
        );

        let mut txn = Transaction::default();
        let mut failed = Vec::new();
        for product_id in &uncovered {
            if let Err(failure) = self.cover_product(&consumer, product_id, now, &mut txn) {
                tracing::warn!(
                    consumer = consumer_uuid,
                    product_id = %product_id,
                    ?failure,
                    "product could not be covered"
                );
                failed.push(product_id.clone());
            }
        }
        if !failed.is_empty() {
            self.rollback(txn);
            return Err(BindError::AutobindFailed { uncovered: failed });
        }

        let Transaction { guards, committed } = txn;
        match self.store.commit(consumer_uuid, guards) {
            Ok(entitlements) => {
                self.apply_bonus_side_effects(&consumer, &entitlements);
                tracing::info!(
                    consumer = consumer_uuid,
                    entitlements = entitlements.len(),
                    "heal request committed"
                );
                Ok(HealOutcome { entitlements, host_entitlements: committed })
            },
            Err(err) => {
                // A reserved pool vanished between selection and commit.
                tracing::warn!(consumer = consumer_uuid, %err, "heal commit lost a pool");
                self.rollback(Transaction { guards: Vec::new(), committed });
                Err(BindError::AutobindFailed { uncovered })
            },
        }
    }

    /// Installed products with no active entitlement providing them.
    pub(crate) fn uncovered_products(&self, consumer: &Consumer) -> Vec<String> {
        let held = self.store.active_entitlements_for(&consumer.uuid);
        consumer
            .installed_products
            .iter()
            .filter(|product_id| {
                !held.iter().any(|ent| {
                    self.store
                        .snapshot(&ent.pool_id)
                        .is_ok_and(|s| s.pool.provides(product_id))
                })
            })
            .cloned()
            .collect()
    }

    /// Runs the bonus side effect for every committed entitlement that
    /// backs a host bonus pool.
    pub(crate) fn apply_bonus_side_effects(&self, consumer: &Consumer, ents: &[Entitlement]) {
        let mut stacks = BTreeSet::new();
        for ent in ents {
            if let Ok(snapshot) = self.store.snapshot(&ent.pool_id) {
                if let Some(product) = self.catalog.product(&snapshot.pool.product_id) {
                    if BonusPoolManager::qualifies(consumer, &snapshot.pool, &product) {
                        stacks.insert(StackKey::derived_key(&snapshot.pool));
                    }
                }
            }
        }
        for stack_key in stacks {
            if let Err(err) =
                self.bonus.refresh_host_bonus(self.store, self.catalog, consumer, &stack_key)
            {
                tracing::warn!(consumer = %consumer.uuid, %stack_key, %err, "bonus refresh failed");
            }
        }
    }

    /// Whether the consumer may draw from the pool at all.
    pub(crate) fn pool_eligible(&self, consumer: &Consumer, pool: &Pool) -> bool {
        match &pool.restriction {
            PoolRestriction::None => {
                // Host-limited base pools are entitlable only by
                // physical systems; guests reach them through bonus
                // pools.
                if !pool.is_derived()
                    && self
                        .catalog
                        .product(&pool.product_id)
                        .is_some_and(|p| p.host_limited())
                {
                    !consumer.is_guest()
                } else {
                    true
                }
            },
            PoolRestriction::VirtOnly => consumer.is_guest(),
            PoolRestriction::UnmappedGuestsOnly => {
                consumer.is_guest() && self.consumers.host_of(consumer).is_none()
            },
            PoolRestriction::GuestsOfHost { host_uuid } => {
                consumer.is_guest() && self.consumers.is_guest_of(consumer, host_uuid)
            },
        }
    }

    fn cover_product(
        &self,
        consumer: &Consumer,
        product_id: &str,
        now: DateTime<Utc>,
        txn: &mut Transaction,
    ) -> Result<(), CoverFailure> {
        let Some(product) = self.catalog.product(product_id) else {
            return Err(CoverFailure::Uncoverable);
        };
        let mut attempt = 0;
        loop {
            match self.try_cover(consumer, &product, now, txn) {
                Ok(guards) => {
                    if txn.reserved_count() + guards.len()
                        > self.config.max_entitlements_per_request
                    {
                        tracing::warn!(
                            consumer = %consumer.uuid,
                            product_id,
                            limit = self.config.max_entitlements_per_request,
                            "heal request exceeded its entitlement bound"
                        );
                        return Err(CoverFailure::Uncoverable);
                    }
                    txn.guards.extend(guards);
                    return Ok(());
                },
                Err(CoverFailure::Raced) if attempt < self.config.bind_retry_limit => {
                    attempt += 1;
                    tracing::debug!(
                        consumer = %consumer.uuid,
                        product_id,
                        attempt,
                        "reservation raced; retrying against a refreshed snapshot"
                    );
                },
                Err(failure) => return Err(failure),
            }
        }
    }

    fn try_cover(
        &self,
        consumer: &Consumer,
        product: &Product,
        now: DateTime<Utc>,
        txn: &mut Transaction,
    ) -> Result<Vec<ReservationGuard>, CoverFailure> {
        if consumer.is_guest() {
            if let Some(host_uuid) = self.consumers.host_of(consumer) {
                match self.host_route(consumer, &host_uuid, product, now, txn) {
                    Ok(guards) => return Ok(guards),
                    Err(CoverFailure::Raced) => return Err(CoverFailure::Raced),
                    // Fall back to ordinary pools.
                    Err(CoverFailure::Uncoverable) => {},
                }
            }
        }
        let candidates = self.eligible_candidates(consumer, product, now);
        let requirement = self.calculator.requirement(consumer, product);
        self.select_from_stacks(consumer, candidates, requirement)
    }

    /// Ensures the guest's host holds host-limited coverage for the
    /// product, then draws the guest's unit from the resulting bonus
    /// pool.
    fn host_route(
        &self,
        guest: &Consumer,
        host_uuid: &str,
        product: &Product,
        now: DateTime<Utc>,
        txn: &mut Transaction,
    ) -> Result<Vec<ReservationGuard>, CoverFailure> {
        if host_uuid == guest.uuid {
            // A consumer claiming to host itself would deadlock here.
            return Err(CoverFailure::Uncoverable);
        }
        let Ok(host) = self.consumers.get(host_uuid) else {
            return Err(CoverFailure::Uncoverable);
        };
        if host.is_guest() {
            // Only non-guest consumers can hold host-limited
            // entitlements; lock order stays guest -> hypervisor only.
            return Err(CoverFailure::Uncoverable);
        }
        let host_lock = self.consumer_locks.lock_for(host_uuid);
        let _host_serialized = host_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let host_candidates: Vec<PoolSnapshot> = self
            .store
            .list_pools(&host.owner)
            .into_iter()
            .filter(|s| s.pool.provides(&product.id) && !s.pool.is_derived())
            .filter(|s| s.pool.window.is_active_at(now))
            .filter(|s| {
                self.catalog
                    .product(&s.pool.product_id)
                    .is_some_and(|p| p.host_limited() && p.virt_limit().is_some())
            })
            .collect();
        if host_candidates.is_empty() {
            return Err(CoverFailure::Uncoverable);
        }

        // What the host still needs, net of what it already holds.
        let mut remaining = self.calculator.requirement(&host, product);
        let mut touched_stacks: BTreeSet<String> = BTreeSet::new();
        for ent in self.store.active_entitlements_for(&host.uuid) {
            if let Ok(snapshot) = self.store.snapshot(&ent.pool_id) {
                if snapshot.pool.provides(&product.id) && !snapshot.pool.is_derived() {
                    if let Some(p) = self.catalog.product(&snapshot.pool.product_id) {
                        if p.host_limited() && p.virt_limit().is_some() {
                            remaining.apply(ent.quantity, &p);
                            touched_stacks.insert(StackKey::derived_key(&snapshot.pool));
                        }
                    }
                }
            }
        }

        if !remaining.is_met() {
            let open: Vec<PoolSnapshot> = host_candidates
                .into_iter()
                .filter(|s| s.available != Some(0))
                .collect();
            let guards = self.select_from_stacks(&host, open, remaining)?;
            for guard in &guards {
                if let Ok(snapshot) = self.store.snapshot(guard.pool_id()) {
                    touched_stacks.insert(StackKey::derived_key(&snapshot.pool));
                }
            }
            let host_ents = self
                .store
                .commit(&host.uuid, guards)
                .map_err(|_| CoverFailure::Raced)?;
            tracing::info!(
                guest = %guest.uuid,
                host = host_uuid,
                entitlements = host_ents.len(),
                product = %product.id,
                "healed host to materialize guest capacity"
            );
            txn.committed.extend(host_ents);
        }

        // Synchronous derivation so the guest sees the capacity now.
        for stack_key in &touched_stacks {
            if let Err(err) =
                self.bonus.refresh_host_bonus(self.store, self.catalog, &host, stack_key)
            {
                tracing::warn!(host = host_uuid, %stack_key, %err, "bonus refresh failed");
            }
        }

        let mut bonus_pools: Vec<PoolSnapshot> = self
            .store
            .list_pools(&guest.owner)
            .into_iter()
            .filter(|s| {
                matches!(
                    &s.pool.restriction,
                    PoolRestriction::GuestsOfHost { host_uuid: h } if h == host_uuid
                )
            })
            .filter(|s| s.pool.provides(&product.id) && s.pool.window.is_active_at(now))
            .filter(|s| s.available != Some(0))
            .collect();
        crate::stack::sort_for_selection(&mut bonus_pools);

        let mut raced = false;
        for snapshot in &bonus_pools {
            match self.store.reserve(&snapshot.pool.id, DERIVED_POOL_QUANTITY) {
                Ok(guard) => return Ok(vec![guard]),
                Err(err) if err.is_capacity_race() => raced = true,
                Err(_) => {},
            }
        }
        Err(if raced { CoverFailure::Raced } else { CoverFailure::Uncoverable })
    }

    fn eligible_candidates(
        &self,
        consumer: &Consumer,
        product: &Product,
        now: DateTime<Utc>,
    ) -> Vec<PoolSnapshot> {
        self.store
            .list_pools(&consumer.owner)
            .into_iter()
            .filter(|s| s.pool.provides(&product.id))
            .filter(|s| s.pool.window.is_active_at(now))
            .filter(|s| s.available != Some(0))
            .filter(|s| self.pool_eligible(consumer, &s.pool))
            .collect()
    }

    /// Walks stacks in priority order, reserving from the first stack
    /// whose plan covers the requirement.
    fn select_from_stacks(
        &self,
        consumer: &Consumer,
        candidates: Vec<PoolSnapshot>,
        requirement: Requirement,
    ) -> Result<Vec<ReservationGuard>, CoverFailure> {
        if requirement.is_met() {
            return Ok(Vec::new());
        }
        let mut ranked: Vec<RankedStack> = group_by_stack(candidates)
            .into_iter()
            .map(|(key, pools)| self.rank_stack(consumer, key, pools, requirement))
            .collect();
        // Guests prefer stacks holding derived capacity; stacks that
        // can satisfy alone beat stacks that cannot; ties break toward
        // soonest expiry, then larger capacity, then key.
        let guest = consumer.is_guest();
        ranked.sort_by(|a, b| {
            let derived = if guest {
                b.has_derived.cmp(&a.has_derived)
            } else {
                std::cmp::Ordering::Equal
            };
            derived
                .then_with(|| b.satisfies.cmp(&a.satisfies))
                .then_with(|| a.earliest_end.cmp(&b.earliest_end))
                .then_with(|| b.capacity.cmp(&a.capacity))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut raced = false;
        for stack in &ranked {
            if !stack.satisfies {
                continue;
            }
            match self.try_stack(consumer, &stack.pools, requirement) {
                Ok(guards) => return Ok(guards),
                Err(CoverFailure::Raced) => raced = true,
                Err(CoverFailure::Uncoverable) => {},
            }
        }
        Err(if raced { CoverFailure::Raced } else { CoverFailure::Uncoverable })
    }

    fn rank_stack(
        &self,
        consumer: &Consumer,
        key: StackKey,
        pools: Vec<PoolSnapshot>,
        requirement: Requirement,
    ) -> RankedStack {
        let (_, satisfies) = self.plan_stack(consumer, &pools, requirement);
        let has_derived = pools.iter().any(|s| s.pool.is_derived());
        let earliest_end = pools
            .iter()
            .map(|s| s.pool.window.ends_at)
            .min()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let capacity = pools.iter().fold(0u64, |acc, s| {
            acc.saturating_add(s.available.unwrap_or(u64::MAX))
        });
        RankedStack { pools, key, has_derived, satisfies, earliest_end, capacity }
    }

    /// Plans the per-pool quantities that would cover `requirement`
    /// from this stack, without reserving anything.
    fn plan_stack(
        &self,
        consumer: &Consumer,
        pools: &[PoolSnapshot],
        requirement: Requirement,
    ) -> (Vec<(String, u64)>, bool) {
        let mut remaining = requirement;
        let mut plan = Vec::new();
        // Guests drain derived capacity before physical pools.
        let ordered: Vec<&PoolSnapshot> = if consumer.is_guest() {
            let (derived, physical): (Vec<_>, Vec<_>) =
                pools.iter().partition(|s| s.pool.is_derived());
            derived.into_iter().chain(physical).collect()
        } else {
            pools.iter().collect()
        };

        for snapshot in ordered {
            if remaining.is_met() {
                break;
            }
            if consumer.is_guest() && snapshot.pool.is_derived() {
                // One unit of derived capacity covers a guest outright.
                plan.push((snapshot.pool.id.clone(), DERIVED_POOL_QUANTITY));
                remaining = Requirement::Units(0);
                break;
            }
            let Some(pool_product) = self.catalog.product(&snapshot.pool.product_id) else {
                continue;
            };
            let quantity = if pool_product.multi_entitlement() {
                CoverageCalculator::quantity_toward(
                    consumer,
                    &pool_product,
                    remaining,
                    snapshot.available,
                )
            } else {
                if self.holds_entitlement_on_product(consumer, &pool_product.id) {
                    continue;
                }
                1
            };
            if quantity == 0 || snapshot.available.is_some_and(|a| a < quantity) {
                continue;
            }
            remaining.apply(quantity, &pool_product);
            plan.push((snapshot.pool.id.clone(), quantity));
        }
        (plan, remaining.is_met())
    }

    fn try_stack(
        &self,
        consumer: &Consumer,
        pools: &[PoolSnapshot],
        requirement: Requirement,
    ) -> Result<Vec<ReservationGuard>, CoverFailure> {
        let (plan, met) = self.plan_stack(consumer, pools, requirement);
        if !met {
            return Err(CoverFailure::Uncoverable);
        }
        let mut guards = Vec::with_capacity(plan.len());
        for (pool_id, quantity) in plan {
            match self.store.reserve(&pool_id, quantity) {
                Ok(guard) => guards.push(guard),
                Err(err) if err.is_capacity_race() => {
                    // Lost to a concurrent bind; guards drop and the
                    // caller retries with a fresh snapshot.
                    return Err(CoverFailure::Raced);
                },
                Err(_) => return Err(CoverFailure::Raced),
            }
        }
        Ok(guards)
    }

    fn holds_entitlement_on_product(&self, consumer: &Consumer, product_id: &str) -> bool {
        self.store
            .active_entitlements_for(&consumer.uuid)
            .iter()
            .any(|ent| {
                self.store
                    .snapshot(&ent.pool_id)
                    .is_ok_and(|s| s.pool.product_id == product_id)
            })
    }

    /// Undoes everything a failed request did: in-flight guards drop,
    /// committed host sub-binds are revoked, and affected bonus pools
    /// are re-derived.
    fn rollback(&self, txn: Transaction) {
        drop(txn.guards);
        let mut refresh: BTreeSet<(String, String)> = BTreeSet::new();
        for ent in txn.committed.iter().rev() {
            if let Ok(snapshot) = self.store.snapshot(&ent.pool_id) {
                if let Some(product) = self.catalog.product(&snapshot.pool.product_id) {
                    if product.host_limited() && product.virt_limit().is_some() {
                        refresh.insert((
                            ent.consumer_uuid.clone(),
                            StackKey::derived_key(&snapshot.pool),
                        ));
                    }
                }
            }
            if let Err(err) = self.store.release(&ent.id, RevokeReason::Aborted) {
                tracing::warn!(entitlement_id = %ent.id, %err, "rollback release failed");
            }
        }
        for (host_uuid, stack_key) in refresh {
            if let Ok(host) = self.consumers.get(&host_uuid) {
                if let Err(err) =
                    self.bonus.refresh_host_bonus(self.store, self.catalog, &host, &stack_key)
                {
                    tracing::warn!(host = %host_uuid, %stack_key, %err, "rollback bonus refresh failed");
                }
            }
        }
        tracing::info!("heal request rolled back");
    }
}
