//! Serializes attach/detach of the fabric termination point shared by all
//! ports of a host on a network.
//!
//! Every read-decide-act on a mapping happens with the (network, host)
//! attachment lock held. A mapping only ever leaves CREATED through
//! DELETING, and the row plus its vlan reservation are deleted together
//! once the fabric detach is confirmed.
use std::{fmt, sync::Arc};

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use config::LockPolicy;
use fabric_core::metrics;
use netconf::{Fabric, TerminationPoint};
use vlan_manager::{
    IsConflict, KnidMapping, LocalVlan, MappingState, Storage, VlanHostMapping, VlanManager,
    lock::{AttachmentLock, LockGuard},
};

use crate::{AttachError, AttachResult};

pub struct AttachmentCoordinator<S, F> {
    vlans: VlanManager<S>,
    lock: AttachmentLock<S>,
    fabric: Arc<F>,
    prefix: String,
}

impl<S, F> fmt::Debug for AttachmentCoordinator<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentCoordinator")
            .field("vlans", &self.vlans)
            .field("lock", &self.lock)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl<S, F> AttachmentCoordinator<S, F>
where
    S: Storage,
    F: Fabric,
{
    pub fn new(
        vlans: VlanManager<S>,
        lock_policy: LockPolicy,
        fabric: Arc<F>,
        prefix: impl Into<String>,
    ) -> Self {
        let lock = AttachmentLock::new(Arc::clone(vlans.store()), lock_policy);
        Self {
            vlans,
            lock,
            fabric,
            prefix: prefix.into(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.vlans.store()
    }

    pub fn vlans(&self) -> &VlanManager<S> {
        &self.vlans
    }

    pub fn lock(&self) -> &AttachmentLock<S> {
        &self.lock
    }

    pub fn fabric(&self) -> &Arc<F> {
        &self.fabric
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// name of the network in the fabric
    pub fn network_name(&self, network_id: &str) -> String {
        format!("{}{}", self.prefix, network_id)
    }

    /// Inverse of [`network_name`]: the network id is what follows the
    /// prefix, up to the first `_`.
    ///
    /// [`network_name`]: AttachmentCoordinator::network_name
    pub fn network_id_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let id = rest.split('_').next().unwrap_or(rest);
        (!id.is_empty()).then_some(id)
    }

    /// Realizes `network_id` on `host`: the first bind allocates a vlan and
    /// attaches the host's termination point, later binds return the same
    /// vlan.
    #[instrument(skip(self))]
    pub async fn bind(&self, network_id: &str, host: &str) -> AttachResult<LocalVlan> {
        let res = match self.lock.acquire(network_id, host).await {
            Ok(guard) => {
                let res = self.bind_locked(network_id, host).await;
                self.release(guard).await;
                res
            }
            Err(err) => Err(err.into()),
        };
        let outcome = match &res {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::BINDS.with_label_values(&[outcome]).inc();
        res
    }

    async fn bind_locked(&self, network_id: &str, host: &str) -> AttachResult<LocalVlan> {
        let existing = self
            .store()
            .get_mapping(network_id, host)
            .await
            .map_err(AttachError::storage)?;
        match existing {
            Some(m) if m.state == MappingState::Deleting => Err(AttachError::DeletionInProgress {
                network_id: network_id.to_owned(),
                host: host.to_owned(),
            }),
            Some(m) if m.state == MappingState::Created => {
                debug!(vlan_id = m.vlan_id, "already attached");
                Ok(m.local_vlan())
            }
            Some(m) => {
                // a previous attach didn't finish, attach is idempotent
                debug!(vlan_id = m.vlan_id, "resuming attach of CREATING mapping");
                let tp = self.termination_point(host).await?;
                self.attach_mapping(&m, &tp, false).await
            }
            None => {
                let tp = self.termination_point(host).await?;
                let vlan_id = self.vlans.allocate(host, network_id).await?.ok_or_else(|| {
                    AttachError::VlanExhausted {
                        host: host.to_owned(),
                    }
                })?;
                let mapping = VlanHostMapping {
                    network_id: network_id.to_owned(),
                    host: host.to_owned(),
                    vlan_id,
                    segment_id: Uuid::new_v4().to_string(),
                    network_name: self.network_name(network_id),
                    state: MappingState::Creating,
                    updated_at: Utc::now(),
                };
                if let Err(err) = self.store().insert_mapping(&mapping).await {
                    error!(?err, vlan_id, "failed to insert mapping, releasing vlan");
                    if let Err(err) = self.vlans.release(host, vlan_id).await {
                        error!(?err, vlan_id, "failed to release vlan");
                    }
                    return Err(AttachError::storage(err));
                }
                self.attach_mapping(&mapping, &tp, true).await
            }
        }
    }

    async fn termination_point(&self, host: &str) -> AttachResult<TerminationPoint> {
        self.fabric
            .termination_point(host)
            .await?
            .ok_or_else(|| AttachError::NoTerminationPoint(host.to_owned()))
    }

    /// attach, then CREATING -> CREATED. `fresh` mappings were inserted by
    /// this call and are rolled back if the attach fails
    async fn attach_mapping(
        &self,
        m: &VlanHostMapping,
        tp: &TerminationPoint,
        fresh: bool,
    ) -> AttachResult<LocalVlan> {
        let attach_name = format!("{}:{}", m.network_id, tp.id);
        match self
            .fabric
            .attach(&m.network_name, &attach_name, &tp.id, m.vlan_id)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {
                debug!(tp_id = %tp.id, "termination point already attached");
            }
            Err(err) => {
                if fresh {
                    warn!(?err, vlan_id = m.vlan_id, "attach failed, rolling back mapping");
                    self.remove_mapping(&m.network_id, &m.host).await;
                } else {
                    warn!(?err, vlan_id = m.vlan_id, "attach failed, mapping left for reconciliation");
                }
                return Err(err.into());
            }
        }

        let promoted = self
            .store()
            .update_mapping_state(
                &m.network_id,
                &m.host,
                &[MappingState::Creating],
                MappingState::Created,
            )
            .await
            .map_err(AttachError::storage)?;
        if !promoted {
            warn!(tp_id = %tp.id, "mapping changed under the attach, detaching");
            if let Err(err) = self.fabric.detach(&m.network_name, &tp.id).await {
                if !err.is_missing() {
                    error!(?err, tp_id = %tp.id, "failed to detach after concurrent deletion");
                }
            }
            return Err(AttachError::ConcurrentDeletion {
                network_id: m.network_id.clone(),
                host: m.host.clone(),
            });
        }
        info!(network = %m.network_name, tp_id = %tp.id, vlan_id = m.vlan_id, "attached");
        Ok(LocalVlan {
            vlan_id: m.vlan_id,
            segment_id: m.segment_id.clone(),
            state: MappingState::Created,
        })
    }

    /// deletes a non-CREATED mapping with its reservation, logging failures
    async fn remove_mapping(&self, network_id: &str, host: &str) {
        match self.store().delete_mapping(network_id, host).await {
            Ok(Some(m)) => debug!(vlan_id = m.vlan_id, "mapping removed"),
            Ok(None) => debug!("mapping already gone"),
            Err(err) => error!(?err, "failed to remove mapping"),
        }
    }

    /// Removes a port of `network_id` from `host`. Only the last port tears
    /// the attachment down; a failed detach leaves the mapping in DELETING
    /// for the reconciler.
    #[instrument(skip(self))]
    pub async fn unbind(&self, network_id: &str, host: &str, last_port: bool) -> AttachResult<()> {
        if !last_port {
            debug!("other ports still bound, keeping attachment");
            return Ok(());
        }
        let res = match self.lock.acquire(network_id, host).await {
            Ok(guard) => {
                let res = self.unbind_locked(network_id, host).await;
                self.release(guard).await;
                res
            }
            Err(err) => Err(err.into()),
        };
        let outcome = match &res {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metrics::UNBINDS.with_label_values(&[outcome]).inc();
        res
    }

    async fn unbind_locked(&self, network_id: &str, host: &str) -> AttachResult<()> {
        let Some(m) = self
            .store()
            .get_mapping(network_id, host)
            .await
            .map_err(AttachError::storage)?
        else {
            debug!("no mapping, nothing to unbind");
            return Ok(());
        };
        if m.state != MappingState::Deleting {
            let moved = self
                .store()
                .update_mapping_state(
                    network_id,
                    host,
                    &[MappingState::Creating, MappingState::Created],
                    MappingState::Deleting,
                )
                .await
                .map_err(AttachError::storage)?;
            if !moved {
                // only an unlocked network purge can get here
                warn!(state = %m.state, "mapping gone before DELETING, detaching anyway");
            }
        }

        let detached = match self.fabric.termination_point(host).await {
            Ok(Some(tp)) => self.fabric.detach(&m.network_name, &tp.id).await,
            Ok(None) => {
                warn!("host has no termination point, treating as detached");
                Ok(())
            }
            Err(err) => Err(err),
        };
        match detached {
            Ok(()) => {}
            Err(err) if err.is_missing() => debug!("termination point already detached"),
            Err(err) => {
                warn!(?err, vlan_id = m.vlan_id, "detach failed, mapping left in DELETING");
                return Err(err.into());
            }
        }
        self.store()
            .delete_mapping(network_id, host)
            .await
            .map_err(AttachError::storage)?;
        info!(network = %m.network_name, vlan_id = m.vlan_id, "detached");
        Ok(())
    }

    async fn release(&self, guard: LockGuard<S>) {
        if let Err(err) = guard.release().await {
            error!(?err, "failed to release attachment lock");
        }
    }

    /// true iff the mapping exists and is CREATED
    pub async fn is_attached(&self, network_id: &str, host: &str) -> AttachResult<bool> {
        Ok(self
            .mapping(network_id, host)
            .await?
            .is_some_and(|m| m.state == MappingState::Created))
    }

    pub async fn mapping(
        &self,
        network_id: &str,
        host: &str,
    ) -> AttachResult<Option<VlanHostMapping>> {
        self.store()
            .get_mapping(network_id, host)
            .await
            .map_err(AttachError::storage)
    }

    /// Creates the fabric network for `network_id` and records its fabric
    /// id. Calling it again for a known network returns the recorded id.
    #[instrument(skip(self))]
    pub async fn network_created(&self, network_id: &str, display_name: &str) -> AttachResult<u64> {
        if let Some(known) = self
            .store()
            .get_knid(network_id)
            .await
            .map_err(AttachError::storage)?
        {
            debug!(knid = known.fabric_network_id, "network already known");
            return Ok(known.fabric_network_id);
        }
        let name = self.network_name(network_id);
        let knid = match self.fabric.create_network(&name).await {
            Ok(knid) => knid,
            Err(err) if err.is_already_exists() => {
                info!(%name, "network already in the fabric, reusing it");
                self.fabric
                    .network_by_name(&name)
                    .await?
                    .map(|n| n.knid)
                    .ok_or(AttachError::Fabric(err))?
            }
            Err(err) => return Err(err.into()),
        };
        if !display_name.is_empty() && display_name != name {
            if let Err(err) = self.fabric.rename_network(&name, display_name).await {
                warn!(?err, %name, "failed to set network description");
            }
        }

        let mapping = KnidMapping {
            fabric_network_id: knid,
            network_id: network_id.to_owned(),
        };
        match self.store().insert_knid(&mapping).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                // created concurrently by another process
                if let Some(known) = self
                    .store()
                    .get_knid(network_id)
                    .await
                    .map_err(AttachError::storage)?
                {
                    return Ok(known.fabric_network_id);
                }
            }
            Err(err) => return Err(AttachError::storage(err)),
        }
        info!(%name, knid, "network created");
        Ok(knid)
    }

    #[instrument(skip(self))]
    pub async fn network_renamed(&self, network_id: &str, display_name: &str) -> AttachResult<()> {
        let name = self.network_name(network_id);
        self.fabric.rename_network(&name, display_name).await?;
        info!(%name, "network renamed");
        Ok(())
    }

    /// Forgets the network locally, then deletes it in the fabric. A failed
    /// fabric delete is left to the reconciler, which sees an orphan.
    ///
    /// Runs without the attachment lock. A bind in flight on the network
    /// finds its CREATING row gone when it promotes, detaches and returns
    /// [`AttachError::ConcurrentDeletion`].
    #[instrument(skip(self))]
    pub async fn network_deleted(&self, network_id: &str) -> AttachResult<()> {
        let store = self.store();
        store
            .delete_knid(network_id)
            .await
            .map_err(AttachError::storage)?;
        let purged = store
            .purge_network(network_id)
            .await
            .map_err(AttachError::storage)?;
        if !purged.is_empty() {
            info!(count = purged.len(), "removed host mappings of deleted network");
        }
        let name = self.network_name(network_id);
        match self.fabric.delete_network(&name).await {
            Ok(()) => info!(%name, "network deleted"),
            Err(err) if err.is_missing() => debug!(%name, "network already gone from the fabric"),
            Err(err) => warn!(?err, %name, "fabric delete failed, left for reconciliation"),
        }
        Ok(())
    }
}
