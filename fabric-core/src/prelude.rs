//! common imports for binaries & libs
pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    tokio::{self, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, instrument, trace, warn},
};
