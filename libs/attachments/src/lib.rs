//! # attachments
//!
//! Ties vlan allocation, the attachment lock and the fabric together.
//!
//! [`AttachmentCoordinator`] drives the per (network, host) lifecycle
//! CREATING -> CREATED -> DELETING -> absent and the network lifecycle
//! (create, rename, delete). [`Reconciler`] is the periodic backstop that
//! deletes orphaned fabric networks and resolves mappings left stuck by a
//! crash or a failed fabric call.
//!
//! [`AttachmentCoordinator`]: crate::coordinator::AttachmentCoordinator
//! [`Reconciler`]: crate::reconcile::Reconciler
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use thiserror::Error;

use netconf::NetconfError;
use vlan_manager::{VlanError, lock::LockError};

pub mod coordinator;
pub mod memory;
pub mod reconcile;

pub use coordinator::AttachmentCoordinator;
pub use reconcile::{ReconcileStats, Reconciler};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("attachment lock for ({network_id}, {host}) unavailable")]
    LockUnavailable { network_id: String, host: String },
    #[error("({network_id}, {host}) is being deleted")]
    DeletionInProgress { network_id: String, host: String },
    #[error("no free vlan left on host {host}")]
    VlanExhausted { host: String },
    #[error("no termination point annotated with host {0}")]
    NoTerminationPoint(String),
    #[error("mapping ({network_id}, {host}) was removed while attaching")]
    ConcurrentDeletion { network_id: String, host: String },
    #[error("fabric error: {0}")]
    Fabric(#[from] NetconfError),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type AttachResult<T> = Result<T, AttachError>;

impl AttachError {
    pub(crate) fn storage(err: impl std::error::Error) -> Self {
        AttachError::Storage(err.to_string())
    }

    /// label for the bind/unbind outcome metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AttachError::LockUnavailable { .. } => "lock_unavailable",
            AttachError::DeletionInProgress { .. } => "deletion_in_progress",
            AttachError::VlanExhausted { .. } => "vlan_exhausted",
            AttachError::NoTerminationPoint(_) => "no_termination_point",
            AttachError::ConcurrentDeletion { .. } => "concurrent_deletion",
            AttachError::Fabric(err) if err.is_correlation() => "fabric_timeout",
            AttachError::Fabric(_) => "fabric_error",
            AttachError::Storage(_) => "storage_error",
        }
    }
}

impl<E: std::error::Error> From<LockError<E>> for AttachError {
    fn from(err: LockError<E>) -> Self {
        match err {
            LockError::Unavailable {
                network_id, host, ..
            } => AttachError::LockUnavailable { network_id, host },
            LockError::DbError(err) => AttachError::storage(err),
        }
    }
}

impl<E: std::error::Error> From<VlanError<E>> for AttachError {
    fn from(err: VlanError<E>) -> Self {
        match err {
            VlanError::DbError(err) => AttachError::storage(err),
        }
    }
}
