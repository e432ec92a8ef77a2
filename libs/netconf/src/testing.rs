//! In-process controller for tests: speaks the greeting, records requests and
//! answers each rpc with whatever the current [`Responder`] returns.
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{io::DuplexStream, task::JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::FrameCodec,
    error::NetconfResult,
    messages::BASE_NS,
    session::{Connector, Transport},
    xml::Element,
};

type ReplyFn = dyn Fn(&Element) -> Option<String> + Send + Sync;

/// maps a request to the inner xml of its `<rpc-reply>`, `None` to stay silent
#[derive(Clone)]
pub(crate) struct Responder(Arc<ReplyFn>);

impl Responder {
    pub(crate) fn new(f: impl Fn(&Element) -> Option<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn ok() -> Self {
        Self::new(|_| Some("<ok/>".into()))
    }

    pub(crate) fn silent() -> Self {
        Self::new(|_| None)
    }

    pub(crate) fn rpc_error(tag: &'static str, message: &'static str) -> Self {
        Self::new(move |_| {
            Some(format!(
                "<rpc-error><error-type>application</error-type><error-tag>{tag}</error-tag><error-severity>error</error-severity><error-message>{message}</error-message></rpc-error>"
            ))
        })
    }
}

type DelayFn = dyn Fn(u64) -> Duration + Send + Sync;

#[derive(Clone)]
struct Shared {
    responder: Arc<RwLock<Responder>>,
    delay: Arc<DelayFn>,
    requests: Arc<Mutex<Vec<String>>>,
}

pub(crate) struct FakeServer {
    shared: Shared,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pub(crate) connects: Arc<AtomicUsize>,
    session_ids: Arc<AtomicU64>,
}

impl FakeServer {
    pub(crate) fn new(responder: Responder) -> Self {
        Self {
            shared: Shared {
                responder: Arc::new(RwLock::new(responder)),
                delay: Arc::new(|_| Duration::ZERO),
                requests: Arc::default(),
            },
            tasks: Arc::default(),
            connects: Arc::default(),
            session_ids: Arc::new(AtomicU64::new(100)),
        }
    }

    /// per message-id delay before the reply is written
    pub(crate) fn with_delay(mut self, f: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
        self.shared.delay = Arc::new(f);
        self
    }

    pub(crate) fn set_responder(&self, responder: Responder) {
        *self.shared.responder.write() = responder;
    }

    /// rpc frames received so far, hellos excluded
    pub(crate) fn requests(&self) -> Vec<String> {
        self.shared.requests.lock().clone()
    }

    /// drops the server end of every open connection
    pub(crate) fn kill_connections(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            shared: self.shared.clone(),
            tasks: Arc::clone(&self.tasks),
            connects: Arc::clone(&self.connects),
            session_ids: Arc::clone(&self.session_ids),
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill_connections();
    }
}

pub(crate) struct FakeConnector {
    shared: Shared,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    connects: Arc<AtomicUsize>,
    session_ids: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> NetconfResult<Transport> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session_id = self.session_ids.fetch_add(1, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(serve(server, session_id, self.shared.clone()));
        self.tasks.lock().push(task);
        let (reader, writer) = tokio::io::split(client);
        Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: None,
        })
    }

    fn peer(&self) -> String {
        "fake".into()
    }
}

async fn serve(stream: DuplexStream, session_id: u64, shared: Shared) {
    let (r, w) = tokio::io::split(stream);
    let mut reader = FramedRead::new(r, FrameCodec::default());
    let writer = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        w,
        FrameCodec::default(),
    )));
    let hello = format!(
        r#"<hello xmlns="{BASE_NS}"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities><session-id>{session_id}</session-id></hello>"#
    );
    if writer.lock().await.send(hello).await.is_err() {
        return;
    }
    while let Some(Ok(frame)) = reader.next().await {
        let Ok(root) = Element::parse(&frame) else {
            continue;
        };
        if root.name == "hello" {
            continue;
        }
        shared.requests.lock().push(frame.clone());
        let id = root.attr("message-id").unwrap_or("0").to_owned();
        let body = {
            let responder = shared.responder.read().clone();
            (responder.0)(&root)
        };
        let Some(body) = body else {
            continue;
        };
        let reply = format!(r#"<rpc-reply message-id="{id}" xmlns="{BASE_NS}">{body}</rpc-reply>"#);
        let delay = (shared.delay)(id.parse().unwrap_or(0));
        if delay.is_zero() {
            let _ = writer.lock().await.send(reply).await;
        } else {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = writer.lock().await.send(reply).await;
            });
        }
    }
}
