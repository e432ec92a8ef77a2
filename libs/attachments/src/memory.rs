//! In-process [`Fabric`], used in tests and for running without a
//! controller. Errors mimic the controller's `rpc-error` tags so the
//! idempotency rules apply the same way.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use netconf::{Fabric, FabricNetwork, NetconfError, NetconfResult, TerminationPoint};

#[derive(Debug, Default)]
struct State {
    // name -> (knid, description)
    networks: BTreeMap<String, (u64, String)>,
    // host -> tp id
    tps: HashMap<String, String>,
    // (network, tp) -> (attach name, vlan)
    attachments: BTreeMap<(String, String), (String, u16)>,
    failing: HashSet<&'static str>,
    // op -> pause after the op took effect
    delays: HashMap<&'static str, Duration>,
}

#[derive(Debug)]
pub struct MemoryFabric {
    state: Mutex<State>,
    next_knid: AtomicU64,
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            next_knid: AtomicU64::new(1000),
        }
    }
}

fn protocol(tag: &str, message: String) -> NetconfError {
    NetconfError::Protocol {
        tag: tag.to_owned(),
        message,
    }
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_termination_point(&self, host: &str, tp_id: &str) {
        self.state
            .lock()
            .tps
            .insert(host.to_owned(), tp_id.to_owned());
    }

    /// makes every call of `op` (a [`Fabric`] method name) fail until
    /// [`recover`] is called
    ///
    /// [`recover`]: MemoryFabric::recover
    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    /// holds every successful call of `op` for `dur` after its effect is
    /// applied, so tests can interleave other calls with it
    pub fn delay(&self, op: &'static str, dur: Duration) {
        self.state.lock().delays.insert(op, dur);
    }

    async fn pause(&self, op: &'static str) {
        let dur = self.state.lock().delays.get(op).copied();
        if let Some(dur) = dur {
            tokio::time::sleep(dur).await;
        }
    }

    /// creates a network directly, as if someone else had
    pub fn insert_network(&self, name: &str) -> u64 {
        let knid = self.next_knid.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .networks
            .insert(name.to_owned(), (knid, name.to_owned()));
        knid
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    pub fn description(&self, name: &str) -> Option<String> {
        self.state.lock().networks.get(name).map(|(_, d)| d.clone())
    }

    /// vlan of the attachment of `tp_id` to `network`
    pub fn attachment(&self, network: &str, tp_id: &str) -> Option<u16> {
        self.state
            .lock()
            .attachments
            .get(&(network.to_owned(), tp_id.to_owned()))
            .map(|(_, vlan)| *vlan)
    }

    pub fn attachment_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    fn check(&self, op: &'static str) -> NetconfResult<()> {
        if self.state.lock().failing.contains(op) {
            Err(protocol("operation-failed", format!("{op} failed")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn create_network(&self, name: &str) -> NetconfResult<u64> {
        self.check("create_network")?;
        let mut state = self.state.lock();
        if state.networks.contains_key(name) {
            return Err(protocol("data-exists", format!("network {name} already exists")));
        }
        let knid = self.next_knid.fetch_add(1, Ordering::Relaxed);
        state
            .networks
            .insert(name.to_owned(), (knid, name.to_owned()));
        Ok(knid)
    }

    async fn network_by_name(&self, name: &str) -> NetconfResult<Option<FabricNetwork>> {
        self.check("network_by_name")?;
        Ok(self
            .state
            .lock()
            .networks
            .get(name)
            .map(|(knid, _)| FabricNetwork {
                name: name.to_owned(),
                knid: *knid,
            }))
    }

    async fn list_networks(&self, prefix: &str) -> NetconfResult<Vec<String>> {
        self.check("list_networks")?;
        Ok(self
            .state
            .lock()
            .networks
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn rename_network(&self, name: &str, display_name: &str) -> NetconfResult<()> {
        self.check("rename_network")?;
        match self.state.lock().networks.get_mut(name) {
            Some((_, description)) => {
                *description = display_name.to_owned();
                Ok(())
            }
            None => Err(protocol("data-missing", format!("network {name} not found"))),
        }
    }

    async fn delete_network(&self, name: &str) -> NetconfResult<()> {
        self.check("delete_network")?;
        let mut state = self.state.lock();
        if state.networks.remove(name).is_none() {
            return Err(protocol("data-missing", format!("network {name} not found")));
        }
        state.attachments.retain(|(network, _), _| network != name);
        Ok(())
    }

    async fn termination_point(&self, host: &str) -> NetconfResult<Option<TerminationPoint>> {
        self.check("termination_point")?;
        Ok(self.state.lock().tps.get(host).map(|id| TerminationPoint {
            id: id.clone(),
            host: host.to_owned(),
        }))
    }

    async fn attach(
        &self,
        network: &str,
        attach_name: &str,
        tp_id: &str,
        vlan_id: u16,
    ) -> NetconfResult<()> {
        self.check("attach")?;
        {
            let mut state = self.state.lock();
            if !state.networks.contains_key(network) {
                return Err(protocol("data-missing", format!("network {network} not found")));
            }
            let key = (network.to_owned(), tp_id.to_owned());
            if state.attachments.contains_key(&key) {
                return Err(protocol("data-exists", format!("{tp_id} already attached")));
            }
            state
                .attachments
                .insert(key, (attach_name.to_owned(), vlan_id));
        }
        self.pause("attach").await;
        Ok(())
    }

    async fn detach(&self, network: &str, tp_id: &str) -> NetconfResult<()> {
        self.check("detach")?;
        match self
            .state
            .lock()
            .attachments
            .remove(&(network.to_owned(), tp_id.to_owned()))
        {
            Some(_) => Ok(()),
            None => Err(protocol("data-missing", format!("{tp_id} not attached"))),
        }
    }

    async fn version(&self) -> NetconfResult<Option<String>> {
        self.check("version")?;
        Ok(Some("memory".into()))
    }
}
