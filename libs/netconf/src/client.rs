//! Request/reply on top of a [`Session`].
use std::{fmt, sync::Arc, time::Duration};

use tracing::{debug, error, trace, warn};

use fabric_core::metrics;

use crate::{
    error::{NetconfError, NetconfResult},
    messages::{Request, RpcReply},
    session::{Connector, Link, Session, SessionOptions},
};

/// Sends requests over the controller session and waits for the matching
/// reply. Cheap to clone, all clones share the session.
#[derive(Clone)]
pub struct NetconfClient {
    session: Arc<Session>,
    request_timeout: Duration,
}

impl fmt::Debug for NetconfClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetconfClient")
            .field("session", &self.session)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

enum ExecError {
    // nothing reached the wire
    Send(NetconfError),
    Other(NetconfError),
}

impl From<NetconfError> for ExecError {
    fn from(err: NetconfError) -> Self {
        ExecError::Other(err)
    }
}

impl ExecError {
    fn into_inner(self) -> NetconfError {
        match self {
            ExecError::Send(err) | ExecError::Other(err) => err,
        }
    }
}

impl NetconfClient {
    pub fn new(
        connector: impl Connector,
        opts: SessionOptions,
        request_timeout: Duration,
    ) -> Self {
        Self {
            session: Arc::new(Session::new(Arc::new(connector), opts)),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// requests waiting on a reply on the current link
    pub async fn pending_requests(&self) -> usize {
        self.session.current().await.map_or(0, |l| l.pending())
    }

    /// connects now instead of on the first request
    pub async fn connect(&self) -> NetconfResult<()> {
        self.session.ensure_connected().await.map(|_| ())
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Sends `request` and returns the parsed reply, `rpc-error` included.
    ///
    /// A write that fails on a link that already served requests is retried
    /// once on a fresh link. Nothing else is retried.
    pub async fn exec(&self, request: &Request) -> NetconfResult<RpcReply> {
        let (link, fresh) = self.session.ensure_connected().await?;
        match self.exec_on(&link, request).await {
            Ok(reply) => Ok(reply),
            Err(ExecError::Send(err)) if !fresh => {
                warn!(?err, operation = request.label(), "write failed on reused transport, reconnecting once");
                link.mark_dead();
                let (link, _) = self.session.ensure_connected().await?;
                self.exec_on(&link, request)
                    .await
                    .map_err(ExecError::into_inner)
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// `exec` for requests answered with `<ok/>`
    pub async fn exec_ok(&self, request: &Request) -> NetconfResult<()> {
        self.exec(request).await?.expect_ok()
    }

    async fn exec_on(&self, link: &Link, request: &Request) -> Result<RpcReply, ExecError> {
        let label = request.label();
        let message_id = link.next_message_id();
        let rx = link.register(message_id)?;
        metrics::RPC_PENDING.inc();
        let res = self.round_trip(link, request, message_id, rx).await;
        metrics::RPC_PENDING.dec();
        let reply = res?;
        if let Some(err) = reply.error() {
            metrics::RPC_PROTOCOL_ERRORS.inc();
            debug!(operation = label, message_id, %err, "controller returned rpc-error");
        }
        Ok(reply)
    }

    async fn round_trip(
        &self,
        link: &Link,
        request: &Request,
        message_id: u64,
        rx: tokio::sync::oneshot::Receiver<NetconfResult<String>>,
    ) -> Result<RpcReply, ExecError> {
        let label = request.label();
        if let Err(err) = link.send(request.render(message_id)).await {
            link.deregister(message_id);
            return Err(ExecError::Send(err));
        }
        metrics::RPC_REQUESTS.with_label_values(&[label]).inc();
        trace!(operation = label, message_id, session_id = %link.session_id(), "request sent");
        let timer = metrics::RPC_DURATION
            .with_label_values(&[label])
            .start_timer();

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                link.deregister(message_id);
                timer.stop_and_discard();
                metrics::RPC_TIMEOUTS.inc();
                error!(operation = label, message_id, session_id = %link.session_id(), "timeout waiting on reply");
                Err(NetconfError::Timeout {
                    session_id: link.session_id().to_owned(),
                    message_id,
                }
                .into())
            }
            Ok(Err(_)) => {
                timer.stop_and_discard();
                Err(NetconfError::ReceiverTerminated.into())
            }
            Ok(Ok(Err(err))) => {
                timer.stop_and_discard();
                Err(err.into())
            }
            Ok(Ok(Ok(frame))) => {
                timer.observe_duration();
                Ok(RpcReply::parse(&frame)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::{FakeServer, Responder};

    fn client(server: &FakeServer, timeout_ms: u64) -> NetconfClient {
        NetconfClient::new(
            server.connector(),
            SessionOptions {
                connect_timeout: Duration::from_secs(2),
                read_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_exec_ok() {
        let server = FakeServer::new(Responder::ok());
        let client = client(&server, 1000);
        client
            .exec_ok(&Request::edit_config("test", "<x/>"))
            .await
            .unwrap();
        assert_eq!(client.pending_requests().await, 0);
        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
        // the server saw our hello and then the rpc
        let seen = server.requests();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("edit-config"));
    }

    #[tokio::test]
    async fn test_concurrent_out_of_order() {
        let server = FakeServer::new(Responder::ok()).with_delay(|id| {
            // later ids answer first
            Duration::from_millis(100u64.saturating_sub(id * 10))
        });
        let client = client(&server, 2000);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.exec(&Request::get("test", "<x/>")).await
            }));
        }
        let mut ids = Vec::new();
        for t in tasks {
            let reply = t.await.unwrap().unwrap();
            ids.push(reply.message_id.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(client.pending_requests().await, 0);
        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_then_recover() {
        let server = FakeServer::new(Responder::silent());
        let client = client(&server, 200);
        let err = client
            .exec(&Request::get("test", "<x/>"))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert_eq!(client.pending_requests().await, 0);

        // fix the controller and drop the stuck connection
        server.set_responder(Responder::ok());
        server.kill_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;

        client
            .exec_ok(&Request::edit_config("test", "<x/>"))
            .await
            .unwrap();
        assert_eq!(server.connects.load(Ordering::SeqCst), 2);
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_slow_link() {
        // only the first request is answered late
        let server = FakeServer::new(Responder::ok()).with_delay(|id| {
            if id == 1 {
                Duration::from_millis(400)
            } else {
                Duration::ZERO
            }
        });
        let client = client(&server, 200);
        let late_before = metrics::RPC_LATE_REPLIES.get();
        let err = client
            .exec(&Request::get("test", "<x/>"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, NetconfError::Timeout { message_id: 1, .. }),
            "{err:?}"
        );

        // same link, next id, answered in time
        let reply = client.exec(&Request::get("test", "<x/>")).await.unwrap();
        assert_eq!(reply.message_id, Some(2));
        assert!(reply.is_ok());

        // the late reply to 1 shows up and is dropped, 3 still correlates
        tokio::time::sleep(Duration::from_millis(300)).await;
        let reply = client.exec(&Request::get("test", "<x/>")).await.unwrap();
        assert_eq!(reply.message_id, Some(3));
        assert!(metrics::RPC_LATE_REPLIES.get() > late_before);

        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_connect() {
        let server = FakeServer::new(Responder::ok());
        let client = client(&server, 1000);
        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();
        assert_eq!(server.connects.load(Ordering::SeqCst), 1);

        let req_a = Request::get("test", "<x/>");
        let req_b = Request::get("test", "<x/>");
        let (a, b) = tokio::join!(client.exec(&req_a), client.exec(&req_b));
        let mut ids = vec![a.unwrap().message_id, b.unwrap().message_id];
        ids.sort_unstable();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        let server = FakeServer::new(Responder::silent());
        let client = client(&server, 5000);
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.exec(&Request::get("test", "<x/>")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.kill_connections();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, NetconfError::ReceiverTerminated), "{err:?}");

        server.set_responder(Responder::ok());
        client
            .exec_ok(&Request::edit_config("test", "<x/>"))
            .await
            .unwrap();
        assert_eq!(server.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rpc_error_not_retried() {
        let server = FakeServer::new(Responder::rpc_error(
            "operation-failed",
            "Unique duplicate constraint on node",
        ));
        let client = client(&server, 1000);
        let err = client
            .exec_ok(&Request::edit_config("test", "<x/>"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "{err:?}");
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_message_ids_restart_on_new_link() {
        let server = FakeServer::new(Responder::ok());
        let client = client(&server, 1000);
        let first = client.exec(&Request::get("test", "<x/>")).await.unwrap();
        assert_eq!(first.message_id, Some(1));
        server.kill_connections();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let again = client.exec(&Request::get("test", "<x/>")).await.unwrap();
        assert_eq!(again.message_id, Some(1));
    }
}
