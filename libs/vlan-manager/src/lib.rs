//! # vlan-manager
//!
//! `vlan-manager` defines a trait `Storage` with the row operations the
//! agent needs against the shared database: vlan reservations, host
//! mappings, attachment locks and fabric network ids.
//!
//! Callers don't allocate through `Storage` directly. It's wrapped in a
//! [`VlanManager`] which takes a generic parameter that must implement
//! `Storage` and does the job of picking a free vlan for a host while other
//! processes race on the same rows. [`lock::AttachmentLock`] serializes
//! attach/detach of one (network, host) pair on top of the same store.
//!
//! [`Storage`]: crate::Storage
//! [`VlanManager`]: crate::VlanManager
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use fabric_core::metrics;

pub mod lock;
pub mod memory;
pub mod sqlite;

use std::{
    collections::HashSet,
    fmt,
    ops::RangeInclusive,
    str::FromStr,
    sync::Arc,
};

/// lifecycle of a (network, host) attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MappingState {
    /// vlan reserved, fabric attach not confirmed yet
    Creating,
    /// attached in the fabric
    Created,
    /// detach in progress, the row goes away once it's done
    Deleting,
}

impl MappingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingState::Creating => "CREATING",
            MappingState::Created => "CREATED",
            MappingState::Deleting => "DELETING",
        }
    }
}

impl fmt::Display for MappingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(MappingState::Creating),
            "CREATED" => Ok(MappingState::Created),
            "DELETING" => Ok(MappingState::Deleting),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown mapping state {0:?}")]
pub struct UnknownState(pub String);

/// "(host, vlan) is taken" while the row exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanReservation {
    pub host: String,
    pub vlan_id: u16,
    pub network_id: String,
}

/// one row per (network, host)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VlanHostMapping {
    pub network_id: String,
    pub host: String,
    pub vlan_id: u16,
    /// handle given to port binding for this segment
    pub segment_id: String,
    /// name of the network in the fabric
    pub network_name: String,
    pub state: MappingState,
    pub updated_at: DateTime<Utc>,
}

impl VlanHostMapping {
    pub fn local_vlan(&self) -> LocalVlan {
        LocalVlan {
            vlan_id: self.vlan_id,
            segment_id: self.segment_id.clone(),
            state: self.state,
        }
    }
}

/// the network id the fabric assigned when the network was created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnidMapping {
    pub fabric_network_id: u64,
    pub network_id: String,
}

/// what a bind hands back to the port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVlan {
    pub vlan_id: u16,
    pub segment_id: String,
    pub state: MappingState,
}

/// storage errors that can tell a uniqueness violation apart from
/// everything else
pub trait IsConflict {
    fn is_conflict(&self) -> bool;
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + IsConflict + Send + Sync + 'static;

    /// every vlan held by `host`, through a reservation or a mapping
    async fn reserved_vlans(&self, host: &str) -> Result<HashSet<u16>, Self::Error>;
    /// fails with a conflict if (host, vlan) is already reserved
    async fn insert_reservation(&self, reservation: &VlanReservation) -> Result<(), Self::Error>;
    /// returns whether a row was removed
    async fn delete_reservation(&self, host: &str, vlan_id: u16) -> Result<bool, Self::Error>;

    /// fails with a conflict if the lock row exists
    async fn insert_lock(&self, network_id: &str, host: &str) -> Result<(), Self::Error>;
    async fn delete_lock(&self, network_id: &str, host: &str) -> Result<bool, Self::Error>;

    async fn get_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error>;
    /// fails with a conflict if a row for (network, host) exists
    async fn insert_mapping(&self, mapping: &VlanHostMapping) -> Result<(), Self::Error>;
    /// moves the row to `to` only if it's currently in one of `from`,
    /// refreshing `updated_at`. Returns whether the row was updated
    async fn update_mapping_state(
        &self,
        network_id: &str,
        host: &str,
        from: &[MappingState],
        to: MappingState,
    ) -> Result<bool, Self::Error>;
    /// deletes a mapping that isn't CREATED, and its vlan reservation, in
    /// one transaction. Returns the removed row
    async fn delete_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error>;
    /// CREATING rows last touched before `creating_before` and DELETING rows
    /// last touched before `deleting_before`
    async fn stale_mappings(
        &self,
        creating_before: DateTime<Utc>,
        deleting_before: DateTime<Utc>,
    ) -> Result<Vec<VlanHostMapping>, Self::Error>;
    async fn network_mappings(&self, network_id: &str)
    -> Result<Vec<VlanHostMapping>, Self::Error>;
    /// moves every mapping of the network through DELETING and removes it
    /// along with all reservations for the network. Returns the removed rows
    async fn purge_network(&self, network_id: &str) -> Result<Vec<VlanHostMapping>, Self::Error>;

    /// fails with a conflict if the network already has a mapping
    async fn insert_knid(&self, mapping: &KnidMapping) -> Result<(), Self::Error>;
    async fn get_knid(&self, network_id: &str) -> Result<Option<KnidMapping>, Self::Error>;
    async fn delete_knid(&self, network_id: &str) -> Result<bool, Self::Error>;
    async fn knid_mappings(&self) -> Result<Vec<KnidMapping>, Self::Error>;
}

#[derive(Debug, Error)]
pub enum VlanError<E> {
    #[error("database error")]
    DbError(#[from] E),
}

/// Picks free vlans per host out of a fixed range.
///
/// Nothing is cached: the taken set is read from the database on every call
/// since other processes allocate from the same rows.
pub struct VlanManager<T> {
    store: Arc<T>,
    range: RangeInclusive<u16>,
}

impl<T> Clone for VlanManager<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            range: self.range.clone(),
        }
    }
}

impl<T> fmt::Debug for VlanManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VlanManager")
            .field("range", &self.range)
            .finish()
    }
}

impl<T> VlanManager<T>
where
    T: Storage,
{
    pub fn new(store: T, range: RangeInclusive<u16>) -> Self {
        Self {
            store: Arc::new(store),
            range,
        }
    }

    pub fn store(&self) -> &Arc<T> {
        &self.store
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// reserve the lowest free vlan for `host`. A lost race against another
    /// allocator marks that value taken and the scan continues, bounded by
    /// the size of the range.
    /// Returns
    ///     `Ok(None)` every value in the range is taken
    ///     `Ok(Some(vlan))` the reservation row was inserted
    pub async fn allocate(
        &self,
        host: &str,
        network_id: &str,
    ) -> Result<Option<u16>, VlanError<T::Error>> {
        let mut taken = self.store.reserved_vlans(host).await?;
        // every conflict grows `taken`, so this ends within the range size
        loop {
            let Some(vlan_id) = self.range.clone().find(|v| !taken.contains(v)) else {
                metrics::VLAN_EXHAUSTED.inc();
                warn!(?host, %network_id, range = ?self.range, "no free vlan left for host");
                return Ok(None);
            };
            let reservation = VlanReservation {
                host: host.to_owned(),
                vlan_id,
                network_id: network_id.to_owned(),
            };
            match self.store.insert_reservation(&reservation).await {
                Ok(()) => {
                    metrics::VLAN_ALLOCATIONS.inc();
                    info!(?host, %network_id, vlan_id, "reserved vlan");
                    return Ok(Some(vlan_id));
                }
                Err(err) if err.is_conflict() => {
                    metrics::VLAN_CONFLICTS.inc();
                    debug!(?host, vlan_id, "vlan taken concurrently-- trying next");
                    taken.insert(vlan_id);
                }
                Err(err) => return Err(VlanError::DbError(err)),
            }
        }
    }

    /// drop the reservation. Releasing a vlan that isn't reserved is a no-op
    pub async fn release(&self, host: &str, vlan_id: u16) -> Result<(), VlanError<T::Error>> {
        if self.store.delete_reservation(host, vlan_id).await? {
            debug!(?host, vlan_id, "released vlan");
        } else {
            debug!(?host, vlan_id, "vlan was not reserved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{memory::MemoryStore, sqlite::SqliteDb};

    #[tokio::test]
    async fn test_lowest_free_first() -> Result<(), Box<dyn std::error::Error>> {
        let mgr = VlanManager::new(MemoryStore::new(), 2..=4094);
        assert_eq!(mgr.allocate("h1", "net-a").await?, Some(2));
        assert_eq!(mgr.allocate("h1", "net-b").await?, Some(3));
        // different host, independent pool
        assert_eq!(mgr.allocate("h2", "net-a").await?, Some(2));
        mgr.release("h1", 2).await?;
        assert_eq!(mgr.allocate("h1", "net-c").await?, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_missing_is_noop() -> Result<(), Box<dyn std::error::Error>> {
        let mgr = VlanManager::new(SqliteDb::new("sqlite::memory:").await?, 2..=10);
        mgr.release("h1", 7).await?;
        mgr.release("h1", 7).await?;
        assert_eq!(mgr.allocate("h1", "net-a").await?, Some(2));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_exhaustion() -> Result<(), Box<dyn std::error::Error>> {
        let mgr = VlanManager::new(MemoryStore::new(), 5..=7);
        for expected in 5..=7 {
            assert_eq!(mgr.allocate("h1", "net").await?, Some(expected));
        }
        assert_eq!(mgr.allocate("h1", "net").await?, None);
        assert!(logs_contain("no free vlan left for host"));
        // another host has its own range
        assert_eq!(mgr.allocate("h2", "net").await?, Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn test_mapping_vlan_counts_as_taken() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryStore::new();
        store
            .insert_mapping(&VlanHostMapping {
                network_id: "net-a".into(),
                host: "h1".into(),
                vlan_id: 2,
                segment_id: "seg".into(),
                network_name: "__OpenStack__net-a".into(),
                state: MappingState::Created,
                updated_at: Utc::now(),
            })
            .await?;
        let mgr = VlanManager::new(store, 2..=4094);
        assert_eq!(mgr.allocate("h1", "net-b").await?, Some(3));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_values() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vlans.db");
        let mgr = VlanManager::new(SqliteDb::new(path.to_string_lossy()).await?, 2..=4094);

        let tasks = ["netA", "netB", "netC"].map(|net| {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.allocate("h1", net).await })
        });
        let mut vlans = HashSet::new();
        for task in tasks {
            let vlan = task.await??.expect("range has room");
            assert!(vlans.insert(vlan), "vlan {vlan} handed out twice");
        }
        assert_eq!(vlans.len(), 3);
        assert_eq!(mgr.store().reserved_vlans("h1").await?, vlans);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exhaustion() -> Result<(), Box<dyn std::error::Error>> {
        const R: u16 = 8;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vlans.db");
        let mgr = VlanManager::new(SqliteDb::new(path.to_string_lossy()).await?, 100..=(99 + R));

        let tasks = (0..=R)
            .map(|i| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.allocate("h1", &format!("net-{i}")).await })
            })
            .collect::<Vec<_>>();
        let mut got = Vec::new();
        let mut none = 0;
        for task in tasks {
            match task.await?? {
                Some(v) => got.push(v),
                None => none += 1,
            }
        }
        got.sort_unstable();
        got.dedup();
        assert_eq!(got.len(), R as usize);
        assert_eq!(none, 1);
        Ok(())
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            MappingState::Creating,
            MappingState::Created,
            MappingState::Deleting,
        ] {
            assert_eq!(state.as_str().parse::<MappingState>().unwrap(), state);
        }
        assert!("ACTIVE".parse::<MappingState>().is_err());
    }
}
