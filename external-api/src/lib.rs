//! # Healthcheck & API
//!
//! This crate provides the http api of the agent: healthcheck, diagnostics
//! and metrics, plus the network and port binding events that drive the
//! [`AttachmentCoordinator`].
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /config
//! /networks
//! /bindings
//!
//! [`AttachmentCoordinator`]: attachments::AttachmentCoordinator
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

use attachments::AttachmentCoordinator;
use config::FabricConfig;
use fabric_core::tokio_util::sync::CancellationToken;
use netconf::Fabric;
use vlan_manager::Storage;

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi<S, F> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    coordinator: Arc<AttachmentCoordinator<S, F>>,
    cfg: Arc<FabricConfig>,
}

impl<S: Storage, F: Fabric> ExternalApi<S, F> {
    /// Create a new ExternalApi instance
    pub fn new(
        addr: SocketAddr,
        cfg: Arc<FabricConfig>,
        coordinator: Arc<AttachmentCoordinator<S, F>>,
    ) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            coordinator,
            cfg,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    fn router(
        state: State,
        cfg: Arc<FabricConfig>,
        coordinator: Arc<AttachmentCoordinator<S, F>>,
    ) -> Router {
        // Provides:
        // /health
        // /ping
        // /metrics
        // /metrics-text
        // /config
        // POST /networks
        // PUT|DELETE /networks/:network_id
        // POST /bindings
        // GET|DELETE /bindings/:network_id/:host
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/config", routing::get(handlers::config))
            .route("/networks", routing::post(handlers::create_network::<S, F>))
            .route(
                "/networks/:network_id",
                routing::put(handlers::rename_network::<S, F>)
                    .delete(handlers::delete_network::<S, F>),
            )
            .route("/bindings", routing::post(handlers::bind::<S, F>))
            .route(
                "/bindings/:network_id/:host",
                routing::get(handlers::binding::<S, F>).delete(handlers::unbind::<S, F>),
            )
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(Extension(coordinator))
            .layer(Extension(cfg))
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(
        addr: SocketAddr,
        state: State,
        cfg: Arc<FabricConfig>,
        coordinator: Arc<AttachmentCoordinator<S, F>>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, cfg, coordinator);

        debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let coordinator = self.coordinator.clone();
        let cfg = self.cfg.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            tokio::select! {
                res = ExternalApi::run(addr, state, cfg, coordinator, token) => match res {
                    Ok(()) => debug!("external API shut down"),
                    Err(err) => error!(?err, "external API exited with error"),
                },
                _ = self.listen_status() => {
                    error!("health task returning, this should not happen")
                }
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(CancellationToken::new()),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use anyhow::Context;
    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path, Query},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use attachments::AttachmentCoordinator;
    use config::FabricConfig;
    use fabric_core::metrics::{START_TIME, UPTIME};
    use netconf::Fabric;
    use vlan_manager::{MappingState, Storage};

    use crate::models::{
        Bind, BindingStatus, CreateNetwork, Health, NetworkCreated, RenameNetwork, ServerError,
        ServerResult, State, UnbindQuery,
    };

    type Coordinator<S, F> = Arc<AttachmentCoordinator<S, F>>;

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<FabricConfig>>,
    ) -> ServerResult<impl IntoResponse> {
        // the parsed config holds credentials and has no wire form, serve the file
        let path = cfg.path().context("no path specified for config")?;
        let cfg = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to find config at {}", path.display()))?;
        Ok(cfg)
    }

    pub(crate) async fn create_network<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Json(req): Json<CreateNetwork>,
    ) -> ServerResult<impl IntoResponse> {
        let fabric_network_id = coordinator
            .network_created(&req.network_id, &req.name)
            .await
            .map_err(ServerError::attach)?;
        Ok((
            StatusCode::CREATED,
            Json(NetworkCreated {
                network_id: req.network_id,
                fabric_network_id,
            }),
        ))
    }

    pub(crate) async fn rename_network<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Path(network_id): Path<String>,
        Json(req): Json<RenameNetwork>,
    ) -> ServerResult<impl IntoResponse> {
        coordinator
            .network_renamed(&network_id, &req.name)
            .await
            .map_err(ServerError::attach)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn delete_network<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Path(network_id): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        coordinator
            .network_deleted(&network_id)
            .await
            .map_err(ServerError::attach)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn bind<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Json(req): Json<Bind>,
    ) -> ServerResult<impl IntoResponse> {
        let vlan = coordinator
            .bind(&req.network_id, &req.host)
            .await
            .map_err(ServerError::attach)?;
        Ok(Json(vlan))
    }

    pub(crate) async fn unbind<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Path((network_id, host)): Path<(String, String)>,
        Query(query): Query<UnbindQuery>,
    ) -> ServerResult<impl IntoResponse> {
        coordinator
            .unbind(&network_id, &host, query.last_port)
            .await
            .map_err(ServerError::attach)?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn binding<S: Storage, F: Fabric>(
        Extension(coordinator): Extension<Coordinator<S, F>>,
        Path((network_id, host)): Path<(String, String)>,
    ) -> ServerResult<impl IntoResponse> {
        let mapping = coordinator
            .mapping(&network_id, &host)
            .await
            .map_err(ServerError::attach)?;
        Ok(Json(BindingStatus {
            attached: mapping
                .as_ref()
                .is_some_and(|m| m.state == MappingState::Created),
            mapping,
        }))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API requests & responses
pub mod models {
    use attachments::AttachError;
    use axum::{http::StatusCode, response::IntoResponse};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};
    use vlan_manager::VlanHostMapping;

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// a network was created
    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct CreateNetwork {
        /// id of the network
        pub network_id: String,
        /// display name, set as the fabric network's description
        #[serde(default)]
        pub name: String,
    }

    /// reply to [`CreateNetwork`]
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct NetworkCreated {
        /// id of the network
        pub network_id: String,
        /// id the fabric assigned
        pub fabric_network_id: u64,
    }

    /// a network's display name changed
    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct RenameNetwork {
        /// new display name
        pub name: String,
    }

    /// a port of `network_id` was bound on `host`
    #[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct Bind {
        /// id of the network
        pub network_id: String,
        /// host the port lives on
        pub host: String,
    }

    /// query of `DELETE /bindings/:network_id/:host`
    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnbindQuery {
        /// whether the unbound port was the last one of the network on the
        /// host, only the last port detaches
        #[serde(default = "default_last_port")]
        pub last_port: bool,
    }

    fn default_last_port() -> bool {
        true
    }

    /// state of one (network, host) attachment
    #[derive(Serialize, Debug, Clone, PartialEq, Eq)]
    pub struct BindingStatus {
        /// true iff the mapping is CREATED
        pub attached: bool,
        /// the mapping row, if any
        pub mapping: Option<VlanHostMapping>,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`, with the status to
    /// answer with.
    #[derive(Debug)]
    pub struct ServerError {
        status: StatusCode,
        err: anyhow::Error,
    }
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl ServerError {
        /// status for a failed attachment operation
        pub fn attach(err: AttachError) -> Self {
            let status = match &err {
                AttachError::LockUnavailable { .. }
                | AttachError::DeletionInProgress { .. }
                | AttachError::ConcurrentDeletion { .. } => StatusCode::CONFLICT,
                AttachError::VlanExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                AttachError::NoTerminationPoint(_) => StatusCode::NOT_FOUND,
                AttachError::Fabric(err) if err.is_correlation() || err.is_timeout() => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                AttachError::Fabric(_) => StatusCode::BAD_GATEWAY,
                AttachError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Self {
                status,
                err: err.into(),
            }
        }

        /// status this error answers with
        pub fn status(&self) -> StatusCode {
            self.status
        }
    }

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (self.status, format!("{}", self.err)).into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                err: err.into(),
            }
        }
    }
}
