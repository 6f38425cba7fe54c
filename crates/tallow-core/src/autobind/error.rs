//! Public error taxonomy for bind operations.

use thiserror::Error;

use crate::pool::PoolError;

/// Errors surfaced by bind, autobind, and revocation operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BindError {
    /// The pool cannot absorb the requested quantity and no alternative
    /// exists.
    #[error("pool {pool_id} cannot absorb {requested} units ({available} available)")]
    InsufficientCapacity {
        /// The pool that was asked.
        pool_id: String,
        /// Units requested.
        requested: u64,
        /// Units available at the time of the check.
        available: u64,
    },

    /// The consumer already holds an entitlement from the product's
    /// stack and the product forbids a second.
    #[error("product {product_id} does not allow multiple entitlements")]
    NotMultiEntitlement {
        /// The product that forbids stacking entitlements.
        product_id: String,
    },

    /// One or more installed products could not be covered; every
    /// reservation taken by the request has been rolled back.
    #[error("autobind failed to cover {} product(s): {}", uncovered.len(), uncovered.join(", "))]
    AutobindFailed {
        /// Products that could not be covered.
        uncovered: Vec<String>,
    },

    /// The consumer is not eligible to draw from the pool.
    #[error("consumer {consumer_uuid} is not eligible for pool {pool_id}")]
    VisibilityDenied {
        /// The restricted pool.
        pool_id: String,
        /// The ineligible consumer.
        consumer_uuid: String,
    },

    /// The pool's validity window does not cover the present.
    #[error("pool {pool_id} is outside its validity window")]
    PoolExpired {
        /// The expired (or not-yet-valid) pool.
        pool_id: String,
    },

    /// No pool exists under the given id.
    #[error("pool not found: {pool_id}")]
    PoolNotFound {
        /// The pool id that was not found.
        pool_id: String,
    },

    /// No entitlement exists under the given id.
    #[error("entitlement not found: {entitlement_id}")]
    EntitlementNotFound {
        /// The entitlement id that was not found.
        entitlement_id: String,
    },

    /// No consumer is registered under the given uuid.
    #[error("consumer not found: {uuid}")]
    ConsumerNotFound {
        /// The uuid that was not found.
        uuid: String,
    },
}

impl From<PoolError> for BindError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolNotFound { pool_id } => Self::PoolNotFound { pool_id },
            PoolError::DuplicatePool { pool_id } => Self::PoolNotFound { pool_id },
            PoolError::InsufficientCapacity { pool_id, requested, available } => {
                Self::InsufficientCapacity { pool_id, requested, available }
            },
            PoolError::ZeroQuantity { pool_id } => {
                Self::InsufficientCapacity { pool_id, requested: 0, available: 0 }
            },
            PoolError::EntitlementNotFound { entitlement_id } => {
                Self::EntitlementNotFound { entitlement_id }
            },
        }
    }
}
