//! Consumer records and the derived guest/host association.
//!
//! Consumer records arrive from the registration service; the allocator
//! reads facts and installed products but never writes them back. The
//! one piece of state owned here is the guest→host lookup, which is
//! *derived* from the latest hypervisor snapshots: every hypervisor
//! update replaces that hypervisor's claimed guests wholesale, and a
//! guest reported by two hypervisors belongs to whichever reported it
//! last. The relation is never persisted as an edge that could go
//! stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Well-known consumer fact keys read by the allocator.
pub mod fact {
    /// Physical socket count.
    pub const SOCKETS: &str = "cpu.cpu_socket(s)";
    /// Whether the consumer is a virtual guest.
    pub const IS_GUEST: &str = "virt.is_guest";
    /// The guest's virtualization identity, matched against hypervisor
    /// guest id reports.
    pub const VIRT_UUID: &str = "virt.uuid";
}

/// Errors from consumer registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConsumerError {
    /// No consumer is registered under the given uuid.
    #[error("consumer not found: {uuid}")]
    NotFound {
        /// The uuid that was not found.
        uuid: String,
    },
}

/// A registered system that can hold entitlements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumer {
    /// Registration uuid.
    pub uuid: String,
    /// Owning tenant.
    pub owner: String,
    /// Fact map as last reported.
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    /// Installed product ids needing coverage.
    #[serde(default)]
    pub installed_products: BTreeSet<String>,
    /// Guest virt uuids this consumer (a hypervisor) currently hosts.
    #[serde(default)]
    pub guest_ids: Vec<String>,
    /// When the consumer registered.
    pub registered_at: DateTime<Utc>,
}

impl Consumer {
    /// Creates a consumer with no facts or installed products.
    #[must_use]
    pub fn new(uuid: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            owner: owner.into(),
            facts: BTreeMap::new(),
            installed_products: BTreeSet::new(),
            guest_ids: Vec::new(),
            registered_at: Utc::now(),
        }
    }

    /// Sets a fact, builder style.
    #[must_use]
    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    /// Adds an installed product, builder style.
    #[must_use]
    pub fn with_installed_product(mut self, product_id: impl Into<String>) -> Self {
        self.installed_products.insert(product_id.into());
        self
    }

    /// Replaces the reported guest list, builder style.
    #[must_use]
    pub fn with_guest_ids(mut self, guest_ids: Vec<String>) -> Self {
        self.guest_ids = guest_ids;
        self
    }

    /// Whether the consumer reports itself as a virtual guest.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.facts
            .get(fact::IS_GUEST)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The guest's virtualization identity, if reported.
    #[must_use]
    pub fn virt_uuid(&self) -> Option<&str> {
        self.facts.get(fact::VIRT_UUID).map(String::as_str)
    }

    /// Socket count fact; `default` applies when absent or junk.
    #[must_use]
    pub fn socket_count(&self, default: u32) -> u32 {
        match self.facts.get(fact::SOCKETS) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    consumer = %self.uuid,
                    value = %raw,
                    "ignoring unparseable socket count fact"
                );
                default
            }),
        }
    }
}

/// Registry of consumer snapshots plus the derived guest→host lookup.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: RwLock<HashMap<String, Consumer>>,
    /// Guest virt uuid → hosting consumer uuid, rebuilt from the latest
    /// hypervisor reports.
    host_by_guest: RwLock<HashMap<String, String>>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a consumer snapshot, re-deriving the
    /// guest/host association from its reported guest list.
    pub fn upsert(&self, consumer: Consumer) {
        {
            let mut map = self
                .host_by_guest
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Drop this host's previous claims, then apply the new
            // snapshot. A guest claimed by another host later keeps the
            // later claim (many-to-one, last report wins).
            map.retain(|_, host| host != &consumer.uuid);
            for guest_id in &consumer.guest_ids {
                map.insert(guest_id.clone(), consumer.uuid.clone());
            }
        }
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        consumers.insert(consumer.uuid.clone(), consumer);
    }

    /// Looks up a consumer snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::NotFound`] for an unknown uuid.
    pub fn get(&self, uuid: &str) -> Result<Consumer, ConsumerError> {
        let consumers = self
            .consumers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        consumers
            .get(uuid)
            .cloned()
            .ok_or_else(|| ConsumerError::NotFound { uuid: uuid.to_string() })
    }

    /// Removes a consumer snapshot and any guest claims it held.
    pub fn remove(&self, uuid: &str) {
        {
            let mut map = self
                .host_by_guest
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.retain(|_, host| host != uuid);
        }
        let mut consumers = self
            .consumers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        consumers.remove(uuid);
    }

    /// The uuid of the hypervisor currently hosting `guest`, resolved
    /// through the guest's `virt.uuid` fact against the latest
    /// hypervisor reports.
    #[must_use]
    pub fn host_of(&self, guest: &Consumer) -> Option<String> {
        let virt_uuid = guest.virt_uuid()?;
        let map = self
            .host_by_guest
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.get(virt_uuid).cloned()
    }

    /// Whether `guest` is currently reported by the hypervisor with
    /// uuid `host_uuid`.
    #[must_use]
    pub fn is_guest_of(&self, guest: &Consumer, host_uuid: &str) -> bool {
        self.host_of(guest).as_deref() == Some(host_uuid)
    }
}
