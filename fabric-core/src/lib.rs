//! # fabric-core
//!
//! Runtime plumbing shared by every crate of the fabric attachment agent:
//! cli/env configuration, tracing setup and prometheus metrics.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub mod config;
pub mod env;
pub mod metrics;
pub mod prelude;
