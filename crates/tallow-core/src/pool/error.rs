//! Pool store error types.

use thiserror::Error;

/// Errors from pool store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No pool exists under the given id.
    #[error("pool not found: {pool_id}")]
    PoolNotFound {
        /// The pool id that was not found.
        pool_id: String,
    },

    /// A pool with this id already exists.
    #[error("pool already exists: {pool_id}")]
    DuplicatePool {
        /// The duplicate pool id.
        pool_id: String,
    },

    /// The pool cannot absorb the requested quantity.
    #[error("pool {pool_id} cannot absorb {requested} units ({available} available)")]
    InsufficientCapacity {
        /// The pool that was asked.
        pool_id: String,
        /// Units requested.
        requested: u64,
        /// Units available at the time of the check.
        available: u64,
    },

    /// Zero-quantity reservations are rejected.
    #[error("reservation on pool {pool_id} must be for a positive quantity")]
    ZeroQuantity {
        /// The pool that was asked.
        pool_id: String,
    },

    /// No entitlement exists under the given id.
    #[error("entitlement not found: {entitlement_id}")]
    EntitlementNotFound {
        /// The entitlement id that was not found.
        entitlement_id: String,
    },
}

impl PoolError {
    /// Creates a not-found error.
    #[must_use]
    pub fn pool_not_found(pool_id: impl Into<String>) -> Self {
        Self::PoolNotFound { pool_id: pool_id.into() }
    }

    /// Returns `true` for capacity losses that a caller may recover
    /// from by selecting another pool or refreshing its snapshot.
    #[must_use]
    pub const fn is_capacity_race(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }
}
