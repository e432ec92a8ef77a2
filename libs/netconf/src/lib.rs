//! # netconf
//!
//! Client side of the controller's netconf interface over ssh.
//!
//! [`session::Session`] keeps one transport alive and reconnects when it
//! dies, [`router::ReplyRouter`] routes replies back to the request waiting
//! on them by message-id, and [`client::NetconfClient`] puts request,
//! timeout and the one-shot write retry together. [`fabric::Fabric`] is
//! the set of l2 network operations built on top.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod codec;
pub mod error;
pub mod fabric;
pub mod messages;
pub mod router;
pub mod session;
pub mod ssh;
pub mod xml;

#[cfg(test)]
mod testing;

pub use client::NetconfClient;
pub use error::{NetconfError, NetconfResult};
pub use fabric::{Fabric, FabricNetwork, NetconfFabric, TerminationPoint};
pub use session::{Connector, SessionOptions, Transport};
pub use ssh::SshConnector;

use config::Controller;

/// client for the configured controller
pub fn connect_lazy(controller: &Controller) -> NetconfClient {
    NetconfClient::new(
        SshConnector::new(controller),
        SessionOptions {
            connect_timeout: controller.connect_timeout,
            read_timeout: controller.read_timeout,
            ..Default::default()
        },
        controller.request_timeout,
    )
}
