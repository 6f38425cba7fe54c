//! Coverage arithmetic: how many entitlement units a consumer needs.
//!
//! A requirement is expressed either in sockets (socket-limited
//! products) or as a flat unit count. Pools contribute
//! `quantity × sockets-per-unit` toward a socket requirement, so a
//! stack can mix products with different socket ratings. The
//! `instance_multiplier` attribute is a quantity granularity rule for
//! physical consumers (reserved quantities are rounded up to a
//! multiple of it), not a coverage multiplier; guests are exempt.
//!
//! Guests drawing from derived (bonus) pools need a single unit;
//! socket arithmetic does not apply to derived capacity.

use crate::catalog::Product;
use crate::consumer::Consumer;

#[cfg(test)]
mod tests;

/// Quantity a guest draws from a derived pool.
pub const DERIVED_POOL_QUANTITY: u64 = 1;

/// An outstanding coverage requirement being accumulated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// This many more units are needed.
    Units(u64),
    /// This many more sockets must be covered.
    Sockets(u64),
}

impl Requirement {
    /// Whether the requirement has been fully covered.
    #[must_use]
    pub const fn is_met(&self) -> bool {
        matches!(self, Self::Units(0) | Self::Sockets(0))
    }

    /// Reduces the requirement by `quantity` units drawn from a pool of
    /// `pool_product`.
    pub fn apply(&mut self, quantity: u64, pool_product: &Product) {
        match self {
            Self::Units(n) => *n = n.saturating_sub(quantity),
            Self::Sockets(s) => match pool_product.sockets() {
                // A pool of a product without a socket rating covers
                // the consumer outright.
                None => *s = 0,
                Some(per_unit) => {
                    *s = s.saturating_sub(quantity.saturating_mul(u64::from(per_unit)));
                },
            },
        }
    }
}

/// Computes required quantities from consumer facts and product
/// attributes.
#[derive(Debug, Clone, Copy)]
pub struct CoverageCalculator {
    default_socket_count: u32,
}

impl CoverageCalculator {
    /// Creates a calculator; `default_socket_count` applies to
    /// consumers missing the socket fact.
    #[must_use]
    pub const fn new(default_socket_count: u32) -> Self {
        Self { default_socket_count }
    }

    /// The initial requirement for covering `product` on `consumer`.
    #[must_use]
    pub fn requirement(&self, consumer: &Consumer, product: &Product) -> Requirement {
        if product.sockets().is_some() {
            Requirement::Sockets(u64::from(consumer.socket_count(self.default_socket_count)))
        } else {
            Requirement::Units(1)
        }
    }

    /// Units needed from pools of `product` alone to satisfy the
    /// consumer's requirement, granularity included.
    ///
    /// This is the single-stack estimate; accumulation across a mixed
    /// stack goes through [`Self::requirement`] and
    /// [`Self::quantity_toward`].
    #[must_use]
    pub fn required_quantity(&self, consumer: &Consumer, product: &Product) -> u64 {
        match self.requirement(consumer, product) {
            Requirement::Units(n) => n,
            Requirement::Sockets(sockets) => {
                let per_unit = u64::from(product.sockets().unwrap_or(1));
                let units = sockets.div_ceil(per_unit);
                round_to_granularity(units, product, consumer)
            },
        }
    }

    /// The quantity to reserve on a pool of `pool_product` toward
    /// `remaining`, bounded by `available` (`None` = unlimited).
    ///
    /// Returns 0 when the pool cannot usefully contribute (for
    /// instance, when rounding down to the instance granularity leaves
    /// nothing).
    #[must_use]
    pub fn quantity_toward(
        consumer: &Consumer,
        pool_product: &Product,
        remaining: Requirement,
        available: Option<u64>,
    ) -> u64 {
        let want = match remaining {
            Requirement::Units(n) => n,
            Requirement::Sockets(sockets) => match pool_product.sockets() {
                None => 1,
                Some(per_unit) => sockets.div_ceil(u64::from(per_unit)),
            },
        };
        let want = round_to_granularity(want, pool_product, consumer);
        let capped = match available {
            Some(avail) => want.min(avail),
            None => want,
        };
        if capped < want && !consumer.is_guest() {
            // Taking less than asked must still land on the granularity.
            let granularity = u64::from(pool_product.instance_multiplier());
            capped - capped % granularity
        } else {
            capped
        }
    }
}

/// Rounds `units` up to the product's instance granularity for
/// physical consumers; guests are exempt.
fn round_to_granularity(units: u64, product: &Product, consumer: &Consumer) -> u64 {
    if consumer.is_guest() {
        return units;
    }
    let granularity = u64::from(product.instance_multiplier());
    if granularity <= 1 || units % granularity == 0 {
        units
    } else {
        (units / granularity + 1).saturating_mul(granularity)
    }
}
