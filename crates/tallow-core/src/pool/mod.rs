//! Pool inventory model and quantity accounting.
//!
//! A pool is a reservoir of entitlement capacity for a product. Base
//! pools are generated 1:1 from subscriptions; bonus pools are derived
//! from virtualization limits (see [`crate::bonus`]). The [`PoolStore`]
//! owns the shared-mutable part: per-pool consumed counters with
//! linearizable reserve/release, guarded so that unrelated pools never
//! contend.
//!
//! # Capacity invariant
//!
//! For every finite pool, `0 <= consumed <= total` at all times,
//! including under concurrent reservation. Reservations are taken
//! through RAII [`ReservationGuard`]s: an uncommitted guard returns its
//! quantity when dropped, which is the rollback primitive for
//! all-or-nothing autobind.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ValidityWindow;

mod error;
mod store;


pub use error::PoolError;
pub use store::{PoolStore, ReservationGuard};

/// Total capacity of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantity {
    /// Capacity is bounded by this many units.
    Finite(u64),
    /// Capacity is unbounded (bonus pools with an unlimited virt limit).
    Unlimited,
}

impl Quantity {
    /// Units still available given `consumed`; `None` means unlimited.
    #[must_use]
    pub fn available(&self, consumed: u64) -> Option<u64> {
        match self {
            Self::Finite(total) => Some(total.saturating_sub(consumed)),
            Self::Unlimited => None,
        }
    }

    /// Whether reserving `extra` on top of `consumed` stays in bounds.
    #[must_use]
    pub fn admits(&self, consumed: u64, extra: u64) -> bool {
        match self {
            Self::Finite(total) => consumed.checked_add(extra).is_some_and(|sum| sum <= *total),
            Self::Unlimited => true,
        }
    }
}

/// Where a pool's capacity comes from; determines its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolSource {
    /// Base pool generated by a subscription (1:1).
    Subscription {
        /// The generating subscription.
        subscription_id: String,
    },
    /// Creation-time bonus pool derived from a subscription whose
    /// product carries a virt limit.
    SubscriptionBonus {
        /// The generating subscription.
        subscription_id: String,
    },
    /// Bonus pool derived from a hypervisor's entitlements in one
    /// stack; exactly one exists per (hypervisor, stack key).
    HostBonus {
        /// The hypervisor whose entitlements back this pool.
        host_uuid: String,
        /// Stack key of the backing entitlements (product id for
        /// unstacked products).
        stack_key: String,
    },
}

/// Who may draw from a pool.
///
/// Guest-facing restrictions are evaluated against the *current*
/// guest/host mapping at bind time, never a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolRestriction {
    /// No restriction beyond product attributes.
    None,
    /// Virtual guests only.
    VirtOnly,
    /// Guests with no currently-reported host only.
    UnmappedGuestsOnly,
    /// Guests currently reported by this hypervisor only.
    GuestsOfHost {
        /// The hypervisor whose guests are eligible.
        host_uuid: String,
    },
}

/// A reservoir of entitlement capacity for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Pool identifier.
    pub id: String,
    /// Owning tenant.
    pub owner: String,
    /// Source product id.
    pub product_id: String,
    /// Product ids this pool satisfies in addition to its own.
    pub provided: BTreeSet<String>,
    /// Total capacity.
    pub quantity: Quantity,
    /// Validity window.
    pub window: ValidityWindow,
    /// Stack group key inherited from the product.
    pub stack_id: Option<String>,
    /// Capacity origin.
    pub source: PoolSource,
    /// Visibility restriction.
    pub restriction: PoolRestriction,
}

impl Pool {
    /// Returns `true` if this pool satisfies `product_id`.
    #[must_use]
    pub fn provides(&self, product_id: &str) -> bool {
        self.product_id == product_id || self.provided.contains(product_id)
    }

    /// Returns `true` for bonus pools of either derivation layer.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        !matches!(self.source, PoolSource::Subscription { .. })
    }
}

/// Point-in-time view of a pool with its consumption counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// The pool record.
    pub pool: Pool,
    /// Units currently reserved.
    pub consumed: u64,
    /// Units still available; `None` means unlimited.
    pub available: Option<u64>,
}

/// Why an entitlement was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevokeReason {
    /// Caller-requested revocation.
    Requested,
    /// The backing host entitlement was revoked and the bonus pool
    /// collapsed or shrank under this entitlement.
    SourceRevoked,
    /// The generating subscription was removed.
    SubscriptionRemoved,
    /// The entitlement was rolled back with its failed heal request.
    Aborted,
}

impl std::fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::SourceRevoked => "source_revoked",
            Self::SubscriptionRemoved => "subscription_removed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementState {
    /// Quantity is reserved against the pool.
    Active,
    /// Quantity has been returned to the pool.
    Revoked {
        /// Why the entitlement was revoked.
        reason: RevokeReason,
    },
}

/// A consumer's reservation of quantity from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Entitlement identifier.
    pub id: String,
    /// Holding consumer.
    pub consumer_uuid: String,
    /// Pool the quantity is drawn from.
    pub pool_id: String,
    /// Reserved units.
    pub quantity: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: EntitlementState,
}

impl Entitlement {
    /// Returns `true` while the entitlement holds its reservation.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, EntitlementState::Active)
    }
}
