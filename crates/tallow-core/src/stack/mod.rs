//! Stack grouping and deterministic selection order.
//!
//! Pools sharing a `stacking_id` combine toward one coverage
//! requirement; pools without one form singleton groups that can never
//! combine. Within a stack, pools are walked soonest-expiring first so
//! short-lived inventory is used up before it lapses, with remaining
//! capacity and pool id as tie breakers for a fully deterministic
//! order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pool::{Pool, PoolSnapshot};


/// Identity of a stack group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StackKey {
    /// Pools sharing this `stacking_id`.
    Stack(String),
    /// A pool without a `stacking_id`, keyed by its own id.
    Single(String),
}

impl StackKey {
    /// The stack key for a pool.
    #[must_use]
    pub fn for_pool(pool: &Pool) -> Self {
        match &pool.stack_id {
            Some(stack_id) => Self::Stack(stack_id.clone()),
            None => Self::Single(pool.id.clone()),
        }
    }

    /// The flat string form used to key derived pools: the stacking id
    /// for real stacks, the product id for unstacked products.
    #[must_use]
    pub fn derived_key(pool: &Pool) -> String {
        pool.stack_id.clone().unwrap_or_else(|| pool.product_id.clone())
    }
}

impl std::fmt::Display for StackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stack(id) => write!(f, "stack:{id}"),
            Self::Single(id) => write!(f, "pool:{id}"),
        }
    }
}

/// Groups pool snapshots by stack identity, each group in selection
/// order.
#[must_use]
pub fn group_by_stack(pools: Vec<PoolSnapshot>) -> BTreeMap<StackKey, Vec<PoolSnapshot>> {
    let mut groups: BTreeMap<StackKey, Vec<PoolSnapshot>> = BTreeMap::new();
    for snapshot in pools {
        groups
            .entry(StackKey::for_pool(&snapshot.pool))
            .or_default()
            .push(snapshot);
    }
    for group in groups.values_mut() {
        sort_for_selection(group);
    }
    groups
}

/// Sorts pools within a stack for selection: ascending remaining
/// validity, then descending available capacity (unlimited first), then
/// pool id.
pub fn sort_for_selection(pools: &mut [PoolSnapshot]) {
    pools.sort_by(|a, b| {
        a.pool
            .window
            .ends_at
            .cmp(&b.pool.window.ends_at)
            .then_with(|| match (a.available, b.available) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => y.cmp(&x),
            })
            .then_with(|| a.pool.id.cmp(&b.pool.id))
    });
}
