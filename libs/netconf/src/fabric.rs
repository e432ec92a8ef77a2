//! Fabric operations the coordinator needs, expressed as netconf requests
//! against the controller's topology models.
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    client::NetconfClient,
    error::{NetconfError, NetconfResult},
    messages::{
        Operation, Request, L2_TOPOLOGY_NS, NETWORK_NS, TOPOLOGY_NS, VFABRIC_L2_NS, VFABRIC_NS,
    },
    xml::{escape, Element},
};

/// topology holding the physical termination points
const PHYSICAL_TOPOLOGY: u32 = 1;
/// topology holding the l2 networks
const L2_TOPOLOGY: u32 = 2;
/// annotation key tagging a termination point with its compute host
pub const HOST_ANNOTATION: &str = "OpenStack_OVS_Host";
const MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

/// an l2 network as the fabric knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FabricNetwork {
    pub name: String,
    /// fabric assigned network id
    pub knid: u64,
}

/// the fabric port a host is wired to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationPoint {
    pub id: String,
    pub host: String,
}

#[async_trait]
pub trait Fabric: Send + Sync + 'static {
    /// creates the l2 network and returns its fabric id
    async fn create_network(&self, name: &str) -> NetconfResult<u64>;
    async fn network_by_name(&self, name: &str) -> NetconfResult<Option<FabricNetwork>>;
    /// names of every l2 network starting with `prefix`
    async fn list_networks(&self, prefix: &str) -> NetconfResult<Vec<String>>;
    /// sets the human readable description
    async fn rename_network(&self, name: &str, display_name: &str) -> NetconfResult<()>;
    async fn delete_network(&self, name: &str) -> NetconfResult<()>;
    /// termination point annotated with `host`, if any
    async fn termination_point(&self, host: &str) -> NetconfResult<Option<TerminationPoint>>;
    async fn attach(
        &self,
        network: &str,
        attach_name: &str,
        tp_id: &str,
        vlan_id: u16,
    ) -> NetconfResult<()>;
    async fn detach(&self, network: &str, tp_id: &str) -> NetconfResult<()>;
    /// virtual-fabric schema version advertised by the controller
    async fn version(&self) -> NetconfResult<Option<String>>;
}

/// [`Fabric`] over a [`NetconfClient`].
#[derive(Debug, Clone)]
pub struct NetconfFabric {
    client: NetconfClient,
}

fn topology(network_id: u32, inner: &str) -> String {
    format!(
        r#"<networks xmlns="{NETWORK_NS}"><network><network-id>{network_id}</network-id>{inner}</network></networks>"#
    )
}

fn l2_attrs_filter(name: Option<&str>) -> String {
    let name = match name {
        Some(name) => format!("<name>{}</name>", escape(name)),
        None => "<name/>".to_owned(),
    };
    topology(
        L2_TOPOLOGY,
        &format!(r#"<node><l2-node-attributes xmlns="{L2_TOPOLOGY_NS}">{name}</l2-node-attributes></node>"#),
    )
}

fn networks_in(data: &Element) -> Vec<(String, Option<&str>)> {
    data.descendants("l2-node-attributes")
        .into_iter()
        .filter_map(|attrs| {
            let name = attrs.child_text("name")?;
            Some((name.to_owned(), attrs.child_text("KNID")))
        })
        .collect()
}

impl NetconfFabric {
    pub fn new(client: NetconfClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &NetconfClient {
        &self.client
    }
}

#[async_trait]
impl Fabric for NetconfFabric {
    #[instrument(skip(self))]
    async fn create_network(&self, name: &str) -> NetconfResult<u64> {
        let name_x = escape(name);
        let node = format!(
            concat!(
                "<node {op}><node-id>{name}</node-id>",
                r#"<vl2-neighbors xmlns="{vl2}"><arp-suppression-enable>false</arp-suppression-enable><nd-suppression-enable>false</nd-suppression-enable></vl2-neighbors>"#,
                r#"<vl2-mac xmlns="{vl2}"><mac-address-table-aging-enable>false</mac-address-table-aging-enable></vl2-mac>"#,
                r#"<l2-node-attributes xmlns="{l2}"><name>{name}</name><description>{name}</description></l2-node-attributes>"#,
                "</node>"
            ),
            op = Operation::Create.attr(),
            name = name_x,
            vl2 = VFABRIC_L2_NS,
            l2 = L2_TOPOLOGY_NS,
        );
        self.client
            .exec_ok(&Request::edit_config(
                "create_network",
                topology(L2_TOPOLOGY, &node),
            ))
            .await?;
        let network = self.network_by_name(name).await?.ok_or_else(|| {
            NetconfError::UnexpectedReply(format!("network {name} missing right after create"))
        })?;
        info!(%name, knid = network.knid, "l2 network created");
        Ok(network.knid)
    }

    async fn network_by_name(&self, name: &str) -> NetconfResult<Option<FabricNetwork>> {
        let data = self
            .client
            .exec(&Request::get("network_by_name", l2_attrs_filter(Some(name))))
            .await?
            .into_data()?;
        for (found, knid) in networks_in(&data) {
            if found != name {
                continue;
            }
            let knid = knid
                .and_then(|k| k.parse().ok())
                .ok_or_else(|| NetconfError::UnexpectedReply(format!("network {name} has no usable KNID")))?;
            return Ok(Some(FabricNetwork { name: found, knid }));
        }
        Ok(None)
    }

    async fn list_networks(&self, prefix: &str) -> NetconfResult<Vec<String>> {
        let data = self
            .client
            .exec(&Request::get("list_networks", l2_attrs_filter(None)))
            .await?
            .into_data()?;
        let mut names = networks_in(&data)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name.starts_with(prefix))
            .collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        debug!(%prefix, count = names.len(), "listed l2 networks");
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn rename_network(&self, name: &str, display_name: &str) -> NetconfResult<()> {
        let node = format!(
            r#"<node><node-id>{}</node-id><l2-node-attributes xmlns="{L2_TOPOLOGY_NS}" {}><description>{}</description></l2-node-attributes></node>"#,
            escape(name),
            Operation::Merge.attr(),
            escape(display_name),
        );
        self.client
            .exec_ok(&Request::edit_config(
                "rename_network",
                topology(L2_TOPOLOGY, &node),
            ))
            .await
    }

    #[instrument(skip(self))]
    async fn delete_network(&self, name: &str) -> NetconfResult<()> {
        let node = format!(
            "<node {}><node-id>{}</node-id></node>",
            Operation::Remove.attr(),
            escape(name)
        );
        self.client
            .exec_ok(&Request::edit_config(
                "delete_network",
                topology(L2_TOPOLOGY, &node),
            ))
            .await?;
        info!(%name, "l2 network deleted");
        Ok(())
    }

    async fn termination_point(&self, host: &str) -> NetconfResult<Option<TerminationPoint>> {
        let tp = format!(
            r#"<node><termination-point xmlns="{TOPOLOGY_NS}"><annotations xmlns="{VFABRIC_NS}"><the-key>{HOST_ANNOTATION}</the-key><value>{}</value></annotations></termination-point></node>"#,
            escape(host)
        );
        let data = self
            .client
            .exec(&Request::get(
                "termination_point",
                topology(PHYSICAL_TOPOLOGY, &tp),
            ))
            .await?
            .into_data()?;
        for tp in data.descendants("termination-point") {
            let Some(id) = tp.child_text("tp-id") else {
                continue;
            };
            let tagged = tp.children_named("annotations").any(|a| {
                a.child_text("the-key") == Some(HOST_ANNOTATION) && a.child_text("value") == Some(host)
            });
            if tagged {
                return Ok(Some(TerminationPoint {
                    id: id.to_owned(),
                    host: host.to_owned(),
                }));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self))]
    async fn attach(
        &self,
        network: &str,
        attach_name: &str,
        tp_id: &str,
        vlan_id: u16,
    ) -> NetconfResult<()> {
        let attach_name = escape(attach_name);
        let node = format!(
            concat!(
                "<node><node-id>{network}</node-id>",
                r#"<termination-point xmlns="{nt}" {op}><tp-id>{tp}</tp-id>"#,
                r#"<l2-termination-point-attributes xmlns="{l2}"><description>{attach}</description>"#,
                r#"<encapsulation-type xmlns="{vl2}">VLAN</encapsulation-type><vlan-id xmlns="{vl2}">{vlan}</vlan-id>"#,
                "</l2-termination-point-attributes>",
                r#"<name xmlns="{vl2}">{attach}</name>"#,
                "</termination-point></node>"
            ),
            network = escape(network),
            nt = TOPOLOGY_NS,
            op = Operation::Create.attr(),
            tp = escape(tp_id),
            l2 = L2_TOPOLOGY_NS,
            vl2 = VFABRIC_L2_NS,
            attach = attach_name,
            vlan = vlan_id,
        );
        self.client
            .exec_ok(&Request::edit_config("attach", topology(L2_TOPOLOGY, &node)))
            .await
    }

    #[instrument(skip(self))]
    async fn detach(&self, network: &str, tp_id: &str) -> NetconfResult<()> {
        let node = format!(
            r#"<node><node-id>{}</node-id><termination-point xmlns="{TOPOLOGY_NS}" {}><tp-id>{}</tp-id></termination-point></node>"#,
            escape(network),
            Operation::Remove.attr(),
            escape(tp_id),
        );
        self.client
            .exec_ok(&Request::edit_config("detach", topology(L2_TOPOLOGY, &node)))
            .await
    }

    async fn version(&self) -> NetconfResult<Option<String>> {
        let filter = format!(r#"<netconf-state xmlns="{MONITORING_NS}"><schemas/></netconf-state>"#);
        let data = self
            .client
            .exec(&Request::get("version", filter))
            .await?
            .into_data()?;
        Ok(data
            .descendants("schema")
            .into_iter()
            .find(|s| s.child_text("identifier") == Some("virtual-fabric"))
            .and_then(|s| s.child_text("version"))
            .map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        session::SessionOptions,
        testing::{FakeServer, Responder},
    };

    fn fabric(server: &FakeServer) -> NetconfFabric {
        NetconfFabric::new(NetconfClient::new(
            server.connector(),
            SessionOptions {
                read_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Duration::from_secs(1),
        ))
    }

    fn l2_data(nodes: &[(&str, u64)]) -> String {
        let mut out = format!(r#"<data><networks xmlns="{NETWORK_NS}"><network><network-id>2</network-id>"#);
        for (name, knid) in nodes {
            out.push_str(&format!(
                r#"<node><l2-node-attributes xmlns="{L2_TOPOLOGY_NS}"><name>{name}</name><KNID xmlns="{VFABRIC_L2_NS}">{knid}</KNID></l2-node-attributes></node>"#
            ));
        }
        out.push_str("</network></networks></data>");
        out
    }

    #[tokio::test]
    async fn test_create_network_reads_back_knid() {
        let server = FakeServer::new(Responder::new(|rpc| {
            if rpc.child("edit-config").is_some() {
                Some("<ok/>".into())
            } else {
                Some(l2_data(&[("__OpenStack__n1", 4242)]))
            }
        }));
        let fabric = fabric(&server);
        assert_eq!(fabric.create_network("__OpenStack__n1").await.unwrap(), 4242);

        let reqs = server.requests();
        assert_eq!(reqs.len(), 2);
        let edit = Element::parse(&reqs[0]).unwrap();
        let node = edit.find("node").unwrap();
        assert_eq!(node.attr("operation"), Some("create"));
        assert_eq!(node.child_text("node-id"), Some("__OpenStack__n1"));
        assert_eq!(
            edit.find("arp-suppression-enable").map(Element::text),
            Some("false")
        );
        let get = Element::parse(&reqs[1]).unwrap();
        assert_eq!(
            get.find("l2-node-attributes").and_then(|a| a.child_text("name")),
            Some("__OpenStack__n1")
        );
    }

    #[tokio::test]
    async fn test_list_networks_filters_prefix() {
        let server = FakeServer::new(Responder::new(|_| {
            Some(l2_data(&[
                ("__OpenStack__b", 2),
                ("manual-net", 3),
                ("__OpenStack__a", 1),
            ]))
        }));
        let names = fabric(&server).list_networks("__OpenStack__").await.unwrap();
        assert_eq!(names, vec!["__OpenStack__a", "__OpenStack__b"]);
    }

    #[tokio::test]
    async fn test_network_by_name_absent() {
        let server = FakeServer::new(Responder::new(|_| Some("<data/>".into())));
        assert!(fabric(&server).network_by_name("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_termination_point_lookup() {
        let server = FakeServer::new(Responder::new(|_| {
            Some(format!(
                concat!(
                    r#"<data><networks xmlns="{nw}"><network><network-id>1</network-id><node><node-id>leaf1</node-id>"#,
                    r#"<termination-point xmlns="{nt}"><tp-id>tp-7</tp-id><annotations xmlns="{vf}"><the-key>OpenStack_OVS_Host</the-key><value>compute-1</value></annotations></termination-point>"#,
                    r#"<termination-point xmlns="{nt}"><tp-id>tp-8</tp-id><annotations xmlns="{vf}"><the-key>other</the-key><value>compute-1</value></annotations></termination-point>"#,
                    "</node></network></networks></data>"
                ),
                nw = NETWORK_NS,
                nt = TOPOLOGY_NS,
                vf = VFABRIC_NS,
            ))
        }));
        let fabric = fabric(&server);
        let tp = fabric.termination_point("compute-1").await.unwrap().unwrap();
        assert_eq!(tp.id, "tp-7");
        assert!(fabric.termination_point("compute-2").await.unwrap().is_none());

        let req = Element::parse(&server.requests()[0]).unwrap();
        assert_eq!(req.find("network-id").map(Element::text), Some("1"));
        assert_eq!(req.find("value").map(Element::text), Some("compute-1"));
    }

    #[tokio::test]
    async fn test_attach_detach_requests() {
        let server = FakeServer::new(Responder::ok());
        let fabric = fabric(&server);
        fabric
            .attach("__OpenStack__n1", "n1:tp-7", "tp-7", 12)
            .await
            .unwrap();
        fabric.detach("__OpenStack__n1", "tp-7").await.unwrap();

        let reqs = server.requests();
        let attach = Element::parse(&reqs[0]).unwrap();
        let tp = attach.find("termination-point").unwrap();
        assert_eq!(tp.attr("operation"), Some("create"));
        assert_eq!(tp.child_text("tp-id"), Some("tp-7"));
        assert_eq!(tp.find("vlan-id").map(Element::text), Some("12"));
        assert_eq!(tp.find("encapsulation-type").map(Element::text), Some("VLAN"));
        assert_eq!(tp.child_text("name"), Some("n1:tp-7"));

        let detach = Element::parse(&reqs[1]).unwrap();
        let tp = detach.find("termination-point").unwrap();
        assert_eq!(tp.attr("operation"), Some("remove"));
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let server = FakeServer::new(Responder::ok());
        let fabric = fabric(&server);
        fabric
            .rename_network("__OpenStack__n1", "web <tier>")
            .await
            .unwrap();
        fabric.delete_network("__OpenStack__n1").await.unwrap();

        let reqs = server.requests();
        let rename = Element::parse(&reqs[0]).unwrap();
        let attrs = rename.find("l2-node-attributes").unwrap();
        assert_eq!(attrs.attr("operation"), Some("merge"));
        assert_eq!(attrs.child_text("description"), Some("web <tier>"));
        let delete = Element::parse(&reqs[1]).unwrap();
        assert_eq!(delete.find("node").unwrap().attr("operation"), Some("remove"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_classified() {
        let server = FakeServer::new(Responder::rpc_error("data-missing", "node not found"));
        let err = fabric(&server).delete_network("gone").await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn test_version() {
        let server = FakeServer::new(Responder::new(|_| {
            Some(format!(
                r#"<data><netconf-state xmlns="{MONITORING_NS}"><schemas><schema><identifier>ietf-network</identifier><version>2018-02-26</version></schema><schema><identifier>virtual-fabric</identifier><version>2018-09-24</version></schema></schemas></netconf-state></data>"#
            ))
        }));
        assert_eq!(
            fabric(&server).version().await.unwrap().as_deref(),
            Some("2018-09-24")
        );
    }
}
