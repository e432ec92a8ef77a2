//! Periodic convergence pass.
//!
//! Two steps per sweep. Fabric networks carrying our prefix that no local
//! network knows about are deleted. Mappings sitting in CREATING or
//! DELETING longer than their timeout are detached and removed, always
//! toward absent: a half-finished attach is never promoted.
use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use config::ReconcilePolicy;
use fabric_core::metrics;
use netconf::Fabric;
use vlan_manager::{MappingState, Storage, VlanHostMapping, lock::LockError};

use crate::{AttachError, AttachResult, AttachmentCoordinator};

/// what one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub orphans_deleted: usize,
    pub orphan_errors: usize,
    pub stuck_resolved: usize,
    pub stuck_errors: usize,
    /// rows whose lock was held or that changed before we got to them
    pub stuck_skipped: usize,
}

#[derive(Debug)]
pub struct Reconciler<S, F> {
    coordinator: Arc<AttachmentCoordinator<S, F>>,
    policy: ReconcilePolicy,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S, F> Reconciler<S, F>
where
    S: Storage,
    F: Fabric,
{
    pub fn new(coordinator: Arc<AttachmentCoordinator<S, F>>, policy: ReconcilePolicy) -> Self {
        Self {
            coordinator,
            policy,
        }
    }

    /// Runs a sweep every `interval`, the first one after one interval.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let period = self.policy.interval;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?period, "reconciler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("reconciler stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        let stats = self.run_once().await;
                        debug!(?stats, "reconcile sweep done");
                    }
                }
            }
        })
    }

    pub async fn run_once(&self) -> ReconcileStats {
        metrics::RECONCILE_SWEEPS.inc();
        let mut stats = ReconcileStats::default();
        self.delete_orphans(&mut stats).await;
        self.resolve_stuck(&mut stats).await;

        metrics::RECONCILE_ORPHANS.inc_by(stats.orphans_deleted as u64);
        metrics::RECONCILE_STUCK.inc_by(stats.stuck_resolved as u64);
        metrics::RECONCILE_ERRORS.inc_by((stats.orphan_errors + stats.stuck_errors) as u64);
        if stats != ReconcileStats::default() {
            info!(?stats, "reconcile sweep changed state");
        }
        stats
    }

    async fn delete_orphans(&self, stats: &mut ReconcileStats) {
        let c = &self.coordinator;
        let names = match c.fabric().list_networks(c.prefix()).await {
            Ok(names) => names,
            Err(err) => {
                error!(?err, "failed to list fabric networks");
                stats.orphan_errors += 1;
                return;
            }
        };
        // without the local view every fabric network would look orphaned
        let known = match c.store().knid_mappings().await {
            Ok(rows) => rows
                .into_iter()
                .map(|k| k.network_id)
                .collect::<HashSet<_>>(),
            Err(err) => {
                error!(?err, "failed to read known networks, skipping orphan cleanup");
                stats.orphan_errors += 1;
                return;
            }
        };

        for name in names {
            let Some(network_id) = c.network_id_of(&name) else {
                continue;
            };
            if known.contains(network_id) {
                continue;
            }
            info!(%name, %network_id, "deleting orphaned fabric network");
            // unlocked like `network_deleted`, a racing bind ends in ConcurrentDeletion
            match c.store().purge_network(network_id).await {
                Ok(purged) if !purged.is_empty() => {
                    info!(%network_id, count = purged.len(), "purged leftover mappings");
                }
                Ok(_) => {}
                Err(err) => warn!(?err, %network_id, "failed to purge leftover mappings"),
            }
            match c.fabric().delete_network(&name).await {
                Ok(()) => stats.orphans_deleted += 1,
                Err(err) if err.is_missing() => stats.orphans_deleted += 1,
                Err(err) => {
                    warn!(?err, %name, "failed to delete orphaned network");
                    stats.orphan_errors += 1;
                }
            }
        }
    }

    async fn resolve_stuck(&self, stats: &mut ReconcileStats) {
        let now = Utc::now();
        let creating_before = cutoff(now, self.policy.creating_timeout);
        let deleting_before = cutoff(now, self.policy.deleting_timeout);
        let stale = match self
            .coordinator
            .store()
            .stale_mappings(creating_before, deleting_before)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!(?err, "failed to query stale mappings");
                stats.stuck_errors += 1;
                return;
            }
        };

        for m in stale {
            match self.resolve(&m).await {
                Ok(true) => stats.stuck_resolved += 1,
                Ok(false) => stats.stuck_skipped += 1,
                Err(err) => {
                    error!(?err, network_id = %m.network_id, host = %m.host, "failed to resolve stuck mapping");
                    stats.stuck_errors += 1;
                }
            }
        }
    }

    /// Returns false if the row was skipped.
    async fn resolve(&self, stale: &VlanHostMapping) -> AttachResult<bool> {
        let c = &self.coordinator;
        let guard = match c.lock().try_acquire(&stale.network_id, &stale.host).await {
            Ok(guard) => guard,
            Err(LockError::Unavailable { .. }) => {
                debug!(network_id = %stale.network_id, host = %stale.host, "stuck mapping is locked, skipping");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        let res = self.resolve_locked(stale).await;
        if let Err(err) = guard.release().await {
            error!(?err, "failed to release attachment lock");
        }
        res
    }

    async fn resolve_locked(&self, stale: &VlanHostMapping) -> AttachResult<bool> {
        let c = &self.coordinator;
        let store = c.store();
        let current = store
            .get_mapping(&stale.network_id, &stale.host)
            .await
            .map_err(AttachError::storage)?;
        // someone finished or touched it since the query
        let Some(m) = current
            .filter(|m| m.state != MappingState::Created && m.updated_at == stale.updated_at)
        else {
            return Ok(false);
        };
        warn!(network_id = %m.network_id, host = %m.host, state = %m.state, vlan_id = m.vlan_id, "resolving stuck mapping");

        if m.state == MappingState::Creating {
            store
                .update_mapping_state(
                    &m.network_id,
                    &m.host,
                    &[MappingState::Creating],
                    MappingState::Deleting,
                )
                .await
                .map_err(AttachError::storage)?;
        }

        match c.fabric().termination_point(&m.host).await {
            Ok(Some(tp)) => match c.fabric().detach(&m.network_name, &tp.id).await {
                Ok(()) => debug!(tp_id = %tp.id, "detached stuck mapping"),
                Err(err) if err.is_missing() => {}
                Err(err) => warn!(?err, tp_id = %tp.id, "detach of stuck mapping failed"),
            },
            Ok(None) => debug!(host = %m.host, "no termination point for host"),
            Err(err) => warn!(?err, host = %m.host, "termination point lookup failed"),
        }

        store
            .delete_mapping(&m.network_id, &m.host)
            .await
            .map_err(AttachError::storage)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use config::LockPolicy;
    use tracing_test::traced_test;
    use vlan_manager::{VlanManager, VlanReservation, memory::MemoryStore};

    use super::*;
    use crate::memory::MemoryFabric;

    const PREFIX: &str = "__OpenStack__";

    fn policy() -> ReconcilePolicy {
        ReconcilePolicy {
            interval: Duration::from_millis(50),
            creating_timeout: Duration::from_secs(60),
            deleting_timeout: Duration::from_secs(10),
        }
    }

    fn setup() -> (
        Arc<AttachmentCoordinator<MemoryStore, MemoryFabric>>,
        Arc<MemoryFabric>,
        Reconciler<MemoryStore, MemoryFabric>,
    ) {
        let fabric = Arc::new(MemoryFabric::new());
        fabric.add_termination_point("h1", "tp-1");
        let c = Arc::new(AttachmentCoordinator::new(
            VlanManager::new(MemoryStore::new(), 2..=4094),
            LockPolicy {
                attempts: 1,
                retry_interval: Duration::ZERO,
            },
            Arc::clone(&fabric),
            PREFIX,
        ));
        let r = Reconciler::new(Arc::clone(&c), policy());
        (c, fabric, r)
    }

    async fn seed(
        c: &AttachmentCoordinator<MemoryStore, MemoryFabric>,
        network_id: &str,
        state: MappingState,
        age: ChronoDuration,
    ) {
        let store = c.store();
        store
            .insert_reservation(&VlanReservation {
                host: "h1".into(),
                vlan_id: 9,
                network_id: network_id.into(),
            })
            .await
            .unwrap();
        store
            .insert_mapping(&VlanHostMapping {
                network_id: network_id.into(),
                host: "h1".into(),
                vlan_id: 9,
                segment_id: "seg".into(),
                network_name: c.network_name(network_id),
                state,
                updated_at: Utc::now() - age,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphans_deleted() {
        let (c, fabric, r) = setup();
        c.network_created("n1", "").await.unwrap();
        fabric.insert_network("__OpenStack__n2");
        fabric.insert_network("__OpenStack__n3_stale");
        fabric.insert_network("manual");

        let stats = r.run_once().await;
        assert_eq!(stats.orphans_deleted, 2);
        assert_eq!(stats.orphan_errors, 0);
        assert_eq!(fabric.networks(), vec!["__OpenStack__n1", "manual"]);
        // nothing left to do
        assert_eq!(r.run_once().await, ReconcileStats::default());
    }

    #[tokio::test]
    async fn test_orphan_failure_isolated() {
        let (c, fabric, r) = setup();
        fabric.insert_network("__OpenStack__n2");
        fabric.fail("delete_network");
        seed(&c, "n1", MappingState::Creating, ChronoDuration::seconds(120)).await;

        let stats = r.run_once().await;
        assert_eq!(stats.orphans_deleted, 0);
        assert_eq!(stats.orphan_errors, 1);
        // the stuck step still ran
        assert_eq!(stats.stuck_resolved, 1);
    }

    #[tokio::test]
    async fn test_list_failure_skips_orphans() {
        let (_c, fabric, r) = setup();
        fabric.insert_network("__OpenStack__n2");
        fabric.fail("list_networks");
        let stats = r.run_once().await;
        assert_eq!(stats.orphan_errors, 1);
        assert_eq!(fabric.networks().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_stuck_creating_removed_even_if_detach_fails() {
        let (c, fabric, r) = setup();
        c.network_created("n1", "").await.unwrap();
        // 2 x creating timeout
        seed(&c, "n1", MappingState::Creating, ChronoDuration::seconds(120)).await;
        fabric.fail("detach");

        let stats = r.run_once().await;
        assert_eq!(stats.stuck_resolved, 1);
        assert_eq!(stats.stuck_errors, 0);
        assert!(c.mapping("n1", "h1").await.unwrap().is_none());
        assert!(c.store().reserved_vlans("h1").await.unwrap().is_empty());
        assert!(logs_contain("detach of stuck mapping failed"));
    }

    #[tokio::test]
    async fn test_stuck_deleting_detached() {
        let (c, fabric, r) = setup();
        c.network_created("n1", "").await.unwrap();
        c.bind("n1", "h1").await.unwrap();
        fabric.fail("detach");
        assert!(c.unbind("n1", "h1", true).await.is_err());
        fabric.recover("detach");

        // not old enough yet
        let stats = r.run_once().await;
        assert_eq!(stats.stuck_resolved, 0);
        assert_eq!(fabric.attachment_count(), 1);

        let r = Reconciler::new(
            Arc::clone(&c),
            ReconcilePolicy {
                deleting_timeout: Duration::ZERO,
                ..policy()
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stats = r.run_once().await;
        assert_eq!(stats.stuck_resolved, 1);
        assert_eq!(fabric.attachment_count(), 0);
        assert!(c.mapping("n1", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fresh_and_created_untouched() {
        let (c, _fabric, r) = setup();
        c.network_created("n1", "").await.unwrap();
        c.network_created("n2", "").await.unwrap();
        c.bind("n2", "h1").await.unwrap();
        seed(&c, "n1", MappingState::Creating, ChronoDuration::seconds(5)).await;

        let stats = r.run_once().await;
        assert_eq!(stats, ReconcileStats::default());
        assert!(c.mapping("n1", "h1").await.unwrap().is_some());
        assert!(c.is_attached("n2", "h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_row_skipped() {
        let (c, _fabric, r) = setup();
        seed(&c, "n1", MappingState::Creating, ChronoDuration::seconds(120)).await;
        let guard = c.lock().acquire("n1", "h1").await.unwrap();

        let stats = r.run_once().await;
        assert_eq!(stats.stuck_skipped, 1);
        assert!(c.mapping("n1", "h1").await.unwrap().is_some());

        guard.release().await.unwrap();
        assert_eq!(r.run_once().await.stuck_resolved, 1);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let (c, fabric, r) = setup();
        fabric.insert_network("__OpenStack__gone");
        let token = CancellationToken::new();
        let task = Arc::new(r).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fabric.networks().is_empty());
        assert!(c.store().knid_mappings().await.unwrap().is_empty());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
