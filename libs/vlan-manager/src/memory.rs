use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
    IsConflict, KnidMapping, MappingState, Storage, VlanHostMapping, VlanReservation,
};

/// single process store, used in tests and for running without a database
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

#[derive(Debug, Default)]
struct Tables {
    // (host, vlan) -> network
    reservations: BTreeMap<(String, u16), String>,
    // (network, host)
    mappings: BTreeMap<(String, String), VlanHostMapping>,
    locks: BTreeSet<(String, String)>,
    knids: BTreeMap<String, u64>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("vlan {vlan_id} already reserved on {host}")]
    ReservationExists { host: String, vlan_id: u16 },
    #[error("lock for ({network_id}, {host}) already held")]
    LockHeld { network_id: String, host: String },
    #[error("mapping for ({network_id}, {host}) already exists")]
    MappingExists { network_id: String, host: String },
    #[error("network {0} already has a fabric id")]
    KnidExists(String),
}

impl IsConflict for MemoryError {
    // every variant is a uniqueness violation
    fn is_conflict(&self) -> bool {
        true
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock()
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_owned(), b.to_owned())
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;

    async fn reserved_vlans(&self, host: &str) -> Result<HashSet<u16>, Self::Error> {
        let t = self.tables();
        Ok(t.reservations
            .keys()
            .filter(|(h, _)| h == host)
            .map(|(_, vlan)| *vlan)
            .chain(
                t.mappings
                    .values()
                    .filter(|m| m.host == host)
                    .map(|m| m.vlan_id),
            )
            .collect())
    }

    async fn insert_reservation(&self, r: &VlanReservation) -> Result<(), Self::Error> {
        let mut t = self.tables();
        let k = (r.host.clone(), r.vlan_id);
        if t.reservations.contains_key(&k) {
            return Err(MemoryError::ReservationExists {
                host: r.host.clone(),
                vlan_id: r.vlan_id,
            });
        }
        t.reservations.insert(k, r.network_id.clone());
        Ok(())
    }

    async fn delete_reservation(&self, host: &str, vlan_id: u16) -> Result<bool, Self::Error> {
        Ok(self
            .tables()
            .reservations
            .remove(&(host.to_owned(), vlan_id))
            .is_some())
    }

    async fn insert_lock(&self, network_id: &str, host: &str) -> Result<(), Self::Error> {
        if self.tables().locks.insert(key(network_id, host)) {
            Ok(())
        } else {
            Err(MemoryError::LockHeld {
                network_id: network_id.to_owned(),
                host: host.to_owned(),
            })
        }
    }

    async fn delete_lock(&self, network_id: &str, host: &str) -> Result<bool, Self::Error> {
        Ok(self.tables().locks.remove(&key(network_id, host)))
    }

    async fn get_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error> {
        Ok(self.tables().mappings.get(&key(network_id, host)).cloned())
    }

    async fn insert_mapping(&self, mapping: &VlanHostMapping) -> Result<(), Self::Error> {
        let mut t = self.tables();
        let k = key(&mapping.network_id, &mapping.host);
        if t.mappings.contains_key(&k) {
            return Err(MemoryError::MappingExists {
                network_id: k.0,
                host: k.1,
            });
        }
        t.mappings.insert(k, mapping.clone());
        Ok(())
    }

    async fn update_mapping_state(
        &self,
        network_id: &str,
        host: &str,
        from: &[MappingState],
        to: MappingState,
    ) -> Result<bool, Self::Error> {
        let mut t = self.tables();
        match t.mappings.get_mut(&key(network_id, host)) {
            Some(m) if from.contains(&m.state) => {
                m.state = to;
                m.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<Option<VlanHostMapping>, Self::Error> {
        let mut t = self.tables();
        let k = key(network_id, host);
        match t.mappings.get(&k) {
            Some(m) if m.state != MappingState::Created => {}
            _ => return Ok(None),
        }
        let removed = t.mappings.remove(&k);
        if let Some(m) = &removed {
            t.reservations.remove(&(m.host.clone(), m.vlan_id));
        }
        Ok(removed)
    }

    async fn stale_mappings(
        &self,
        creating_before: DateTime<Utc>,
        deleting_before: DateTime<Utc>,
    ) -> Result<Vec<VlanHostMapping>, Self::Error> {
        Ok(self
            .tables()
            .mappings
            .values()
            .filter(|m| match m.state {
                MappingState::Creating => m.updated_at < creating_before,
                MappingState::Deleting => m.updated_at < deleting_before,
                MappingState::Created => false,
            })
            .cloned()
            .collect())
    }

    async fn network_mappings(
        &self,
        network_id: &str,
    ) -> Result<Vec<VlanHostMapping>, Self::Error> {
        Ok(self
            .tables()
            .mappings
            .values()
            .filter(|m| m.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn purge_network(&self, network_id: &str) -> Result<Vec<VlanHostMapping>, Self::Error> {
        let mut t = self.tables();
        let keys = t
            .mappings
            .keys()
            .filter(|(net, _)| net == network_id)
            .cloned()
            .collect::<Vec<_>>();
        let mut removed = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(mut m) = t.mappings.remove(&k) {
                m.state = MappingState::Deleting;
                removed.push(m);
            }
        }
        t.reservations.retain(|_, net| net != network_id);
        debug!(%network_id, count = removed.len(), "purged network mappings");
        Ok(removed)
    }

    async fn insert_knid(&self, mapping: &KnidMapping) -> Result<(), Self::Error> {
        let mut t = self.tables();
        if t.knids.contains_key(&mapping.network_id) {
            return Err(MemoryError::KnidExists(mapping.network_id.clone()));
        }
        t.knids
            .insert(mapping.network_id.clone(), mapping.fabric_network_id);
        Ok(())
    }

    async fn get_knid(&self, network_id: &str) -> Result<Option<KnidMapping>, Self::Error> {
        Ok(self
            .tables()
            .knids
            .get(network_id)
            .map(|knid| KnidMapping {
                fabric_network_id: *knid,
                network_id: network_id.to_owned(),
            }))
    }

    async fn delete_knid(&self, network_id: &str) -> Result<bool, Self::Error> {
        Ok(self.tables().knids.remove(network_id).is_some())
    }

    async fn knid_mappings(&self) -> Result<Vec<KnidMapping>, Self::Error> {
        Ok(self
            .tables()
            .knids
            .iter()
            .map(|(network_id, knid)| KnidMapping {
                fabric_network_id: *knid,
                network_id: network_id.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn mapping(net: &str, host: &str, vlan_id: u16, state: MappingState) -> VlanHostMapping {
        VlanHostMapping {
            network_id: net.into(),
            host: host.into(),
            vlan_id,
            segment_id: format!("seg-{net}-{host}"),
            network_name: format!("__OpenStack__{net}"),
            state,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reservation_conflict() {
        let store = MemoryStore::new();
        let r = VlanReservation {
            host: "h1".into(),
            vlan_id: 10,
            network_id: "n1".into(),
        };
        store.insert_reservation(&r).await.unwrap();
        let err = store.insert_reservation(&r).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.delete_reservation("h1", 10).await.unwrap());
        assert!(!store.delete_reservation("h1", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_created_mapping_not_deleted() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&mapping("n1", "h1", 5, MappingState::Created))
            .await
            .unwrap();
        assert!(store.delete_mapping("n1", "h1").await.unwrap().is_none());
        assert!(
            store
                .update_mapping_state("n1", "h1", &[MappingState::Created], MappingState::Deleting)
                .await
                .unwrap()
        );
        let removed = store.delete_mapping("n1", "h1").await.unwrap().unwrap();
        assert_eq!(removed.vlan_id, 5);
        assert!(store.get_mapping("n1", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&mapping("n1", "h1", 5, MappingState::Deleting))
            .await
            .unwrap();
        assert!(
            !store
                .update_mapping_state("n1", "h1", &[MappingState::Creating], MappingState::Created)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_mapping_state("n2", "h1", &[MappingState::Creating], MappingState::Created)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_stale_and_purge() {
        let store = MemoryStore::new();
        let mut old = mapping("n1", "h1", 5, MappingState::Creating);
        old.updated_at = Utc::now() - Duration::seconds(120);
        store.insert_mapping(&old).await.unwrap();
        store
            .insert_mapping(&mapping("n1", "h2", 6, MappingState::Created))
            .await
            .unwrap();
        store
            .insert_reservation(&VlanReservation {
                host: "h2".into(),
                vlan_id: 6,
                network_id: "n1".into(),
            })
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::seconds(60);
        let stale = store.stale_mappings(cutoff, cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].host, "h1");

        let purged = store.purge_network("n1").await.unwrap();
        assert_eq!(purged.len(), 2);
        assert!(store.network_mappings("n1").await.unwrap().is_empty());
        assert!(store.reserved_vlans("h2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usable_after_panic_while_locked() {
        let store = MemoryStore::new();
        store
            .insert_mapping(&mapping("n1", "h1", 5, MappingState::Created))
            .await
            .unwrap();
        let held = store.clone();
        let res = std::thread::spawn(move || {
            let _tables = held.tables();
            panic!("panic with the tables locked");
        })
        .join();
        assert!(res.is_err());

        let m = store.get_mapping("n1", "h1").await.unwrap().unwrap();
        assert_eq!(m.vlan_id, 5);
        assert!(store.insert_lock("n1", "h1").await.is_ok());
    }
}
