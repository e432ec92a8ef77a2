//! Requests we send and the replies we read back.
use std::fmt::Write;

use crate::{
    error::{NetconfError, NetconfResult},
    xml::{escape, Element},
};

pub const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
pub const NETWORK_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-network";
pub const TOPOLOGY_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-network-topology";
pub const L2_TOPOLOGY_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-l2-topology";
pub const VFABRIC_L2_NS: &str = "urn:kaloom:faas:vfabric-l2-topology";
pub const VFABRIC_NS: &str = "urn:kaloom:faas:virtual-fabric";

/// capabilities advertised in our hello
pub const CLIENT_CAPABILITIES: [&str; 6] = [
    "urn:ietf:params:netconf:base:1.0",
    "urn:ietf:params:netconf:capability:writable-running:1.0",
    "urn:ietf:params:netconf:capability:candidate:1.0",
    "urn:ietf:params:netconf:capability:confirmed-commit:1.0",
    "urn:ietf:params:netconf:capability:startup:1.0",
    "urn:ietf:params:netconf:capability:rollback-on-error:1.0",
];

pub fn client_hello() -> String {
    let mut out = format!(r#"<?xml version="1.0" encoding="UTF-8"?><hello xmlns="{BASE_NS}"><capabilities>"#);
    for cap in CLIENT_CAPABILITIES {
        let _ = write!(out, "<capability>{cap}</capability>");
    }
    out.push_str("</capabilities></hello>");
    out
}

/// what the server tells us in its hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub session_id: String,
    pub capabilities: Vec<String>,
}

impl ServerHello {
    pub fn parse(frame: &str) -> NetconfResult<Self> {
        let root = Element::parse(frame)?;
        if root.name != "hello" {
            return Err(NetconfError::Handshake(format!(
                "expected hello, got <{}>",
                root.name
            )));
        }
        let session_id = root
            .child_text("session-id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NetconfError::Handshake("server hello has no session-id".into()))?
            .to_owned();
        let capabilities = root
            .descendants("capability")
            .into_iter()
            .map(|c| c.text().to_owned())
            .collect();
        Ok(Self {
            session_id,
            capabilities,
        })
    }
}

/// edit-config operation attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Merge,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Merge => "merge",
            Operation::Remove => "remove",
        }
    }

    /// the attribute as written on an element, with the `a` prefix bound to
    /// the base namespace
    pub fn attr(&self) -> String {
        format!(r#"xmlns:a="{BASE_NS}" a:operation="{}""#, self.as_str())
    }
}

/// A request body. `label` names the operation in logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { label: &'static str, filter: String },
    EditConfig { label: &'static str, config: String },
}

impl Request {
    /// `<get>` with a subtree filter
    pub fn get(label: &'static str, filter: impl Into<String>) -> Self {
        Request::Get {
            label,
            filter: filter.into(),
        }
    }

    /// `<edit-config>` on the running datastore
    pub fn edit_config(label: &'static str, config: impl Into<String>) -> Self {
        Request::EditConfig {
            label,
            config: config.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Request::Get { label, .. } | Request::EditConfig { label, .. } => label,
        }
    }

    /// wraps the body in an `<rpc>` carrying `message_id`
    pub fn render(&self, message_id: u64) -> String {
        let body = match self {
            Request::Get { filter, .. } => format!(
                r#"<get><filter xmlns:ns0="{BASE_NS}" ns0:type="subtree">{filter}</filter></get>"#
            ),
            Request::EditConfig { config, .. } => format!(
                "<edit-config><target><running/></target><default-operation>none</default-operation><config>{config}</config></edit-config>"
            ),
        };
        let id = escape(&message_id.to_string()).into_owned();
        format!(r#"<?xml version="1.0" encoding="UTF-8"?><rpc message-id="{id}" xmlns="{BASE_NS}">{body}</rpc>"#)
    }
}

/// A parsed `<rpc-reply>`.
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub message_id: Option<u64>,
    pub root: Element,
}

impl RpcReply {
    pub fn parse(frame: &str) -> NetconfResult<Self> {
        let root = Element::parse(frame)?;
        if root.name != "rpc-reply" {
            return Err(NetconfError::UnexpectedReply(format!(
                "expected rpc-reply, got <{}>",
                root.name
            )));
        }
        let message_id = root.attr("message-id").and_then(|id| id.parse().ok());
        Ok(Self { message_id, root })
    }

    /// the first `rpc-error` as a [`NetconfError::Protocol`]
    pub fn error(&self) -> Option<NetconfError> {
        let err = self.root.find("rpc-error")?;
        let tag = err.child_text("error-tag").unwrap_or_default().to_owned();
        let message = err
            .child_text("error-message")
            .or_else(|| err.child_text("error-info"))
            .unwrap_or_default()
            .to_owned();
        Some(NetconfError::Protocol { tag, message })
    }

    pub fn is_ok(&self) -> bool {
        self.root.child("ok").is_some()
    }

    /// `<data>`, present on replies to `<get>`
    pub fn data(&self) -> Option<&Element> {
        self.root.child("data")
    }

    /// reply must be `<ok/>`
    pub fn expect_ok(self) -> NetconfResult<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        if self.is_ok() {
            Ok(())
        } else {
            Err(NetconfError::UnexpectedReply(
                "reply has neither ok nor rpc-error".into(),
            ))
        }
    }

    /// reply must carry `<data>`; an empty result comes back as an empty element
    pub fn into_data(self) -> NetconfResult<Element> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        let Self { root, .. } = self;
        root.children
            .into_iter()
            .find(|c| c.name == "data")
            .ok_or_else(|| NetconfError::UnexpectedReply("reply has no data".into()))
    }
}
