#![allow(missing_docs)] // lazy_static doesn't play nicely with docstrings

//! # metrics
//!
//! process wide prometheus statistics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounter, IntCounterVec, IntGauge, register_histogram_vec,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();
    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    // rpc metrics

    /// rpc requests sent, by operation
    pub static ref RPC_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "rpc_requests",
        "count of rpc requests written to the controller",
        &["operation"]
    )
    .unwrap();
    /// histogram of rpc round trip times
    pub static ref RPC_DURATION: HistogramVec = register_histogram_vec!(
        "rpc_duration",
        "rpc round trip time (seconds), only counts replies received",
        &["operation"]
    )
    .unwrap();
    /// rpc requests that were abandoned after the request timeout
    pub static ref RPC_TIMEOUTS: IntCounter = register_int_counter!("rpc_timeouts", "count of rpc requests that timed out").unwrap();
    /// rpc replies carrying an rpc-error
    pub static ref RPC_PROTOCOL_ERRORS: IntCounter = register_int_counter!("rpc_protocol_errors", "count of rpc-error replies").unwrap();
    /// replies that arrived for an id nobody waits on
    pub static ref RPC_LATE_REPLIES: IntCounter = register_int_counter!("rpc_late_replies", "count of replies dropped with no waiter").unwrap();
    /// transport (re)connects
    pub static ref RPC_CONNECTS: IntCounter = register_int_counter!("rpc_connects", "count of transport connects").unwrap();
    /// # of requests waiting for a reply
    pub static ref RPC_PENDING: IntGauge = register_int_gauge!("rpc_pending", "count of requests waiting for a reply").unwrap();

    // allocation metrics

    /// vlan reservations inserted
    pub static ref VLAN_ALLOCATIONS: IntCounter = register_int_counter!("vlan_allocations", "count of vlan ids reserved").unwrap();
    /// vlan insert conflicts with a concurrent allocator
    pub static ref VLAN_CONFLICTS: IntCounter = register_int_counter!("vlan_conflicts", "count of vlan reservation races lost").unwrap();
    /// allocations that found the range full
    pub static ref VLAN_EXHAUSTED: IntCounter = register_int_counter!("vlan_exhausted", "count of allocations with no free vlan").unwrap();

    // coordination metrics

    /// lock attempts that found the row held
    pub static ref LOCK_CONTENTION: IntCounter = register_int_counter!("lock_contention", "count of attachment lock attempts that found it held").unwrap();
    /// lock acquisitions that ran out of attempts
    pub static ref LOCK_UNAVAILABLE: IntCounter = register_int_counter!("lock_unavailable", "count of attachment lock acquisitions that gave up").unwrap();
    /// bind results
    pub static ref BINDS: IntCounterVec = register_int_counter_vec!(
        "binds",
        "count of bind requests by outcome",
        &["outcome"]
    )
    .unwrap();
    /// unbind results
    pub static ref UNBINDS: IntCounterVec = register_int_counter_vec!(
        "unbinds",
        "count of unbind requests by outcome",
        &["outcome"]
    )
    .unwrap();

    // reconcile metrics

    /// reconciliation sweeps
    pub static ref RECONCILE_SWEEPS: IntCounter = register_int_counter!("reconcile_sweeps", "count of reconciliation passes").unwrap();
    /// orphan fabric networks deleted
    pub static ref RECONCILE_ORPHANS: IntCounter = register_int_counter!("reconcile_orphans", "count of orphaned fabric networks deleted").unwrap();
    /// stuck mappings removed
    pub static ref RECONCILE_STUCK: IntCounter = register_int_counter!("reconcile_stuck", "count of stuck mappings resolved").unwrap();
    /// reconciliation errors
    pub static ref RECONCILE_ERRORS: IntCounter = register_int_counter!("reconcile_errors", "count of errors during reconciliation").unwrap();
}
