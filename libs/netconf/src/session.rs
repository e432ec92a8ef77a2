//! One logical connection to the controller.
//!
//! A [`Session`] owns at most one live [`Link`] (an authenticated transport
//! with a netconf subsystem on it) and replaces it when it dies. Only one
//! caller reconnects at a time; everyone else waits on the connect lock and
//! picks up the new link.
use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use fabric_core::metrics;

use crate::{
    codec::FrameCodec,
    error::{NetconfError, NetconfResult},
    messages::{client_hello, ServerHello},
    router::{receive_loop, ReplyRouter},
};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, authenticated byte stream with the netconf subsystem
/// started. `guard` is whatever must stay alive for the stream to keep
/// working, the ssh connection handle for instance.
pub struct Transport {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub guard: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

/// Opens transports to the controller.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> NetconfResult<Transport>;
    /// where we connect to, for logs
    fn peer(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// connect plus greeting exchange
    pub connect_timeout: Duration,
    /// receive loop idle tick
    pub read_timeout: Duration,
    pub max_frame: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            max_frame: crate::codec::DEFAULT_MAX_FRAME,
        }
    }
}

/// An established transport plus its framing, message ids and router.
pub struct Link {
    generation: u64,
    session_id: String,
    writer: Mutex<FramedWrite<BoxWriter, FrameCodec>>,
    reader: Arc<Mutex<FramedRead<BoxReader, FrameCodec>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    router: Arc<ReplyRouter>,
    read_timeout: Duration,
    receiver: parking_lot::Mutex<Option<JoinHandle<()>>>,
    guard: parking_lot::Mutex<Option<Box<dyn Any + Send>>>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("generation", &self.generation)
            .field("session_id", &self.session_id)
            .field("alive", &self.is_alive())
            .field("pending", &self.router.pending())
            .finish()
    }
}

impl Link {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.router.pending()
    }

    /// ids start at 1 on every new link
    pub fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// registers a waiter, starting the receive loop if none is running
    pub fn register(
        &self,
        message_id: u64,
    ) -> NetconfResult<tokio::sync::oneshot::Receiver<NetconfResult<String>>> {
        let reg = self.router.register(message_id)?;
        if reg.start_loop {
            let task = tokio::spawn(receive_loop(
                Arc::clone(&self.router),
                Arc::clone(&self.reader),
                self.read_timeout,
                Arc::clone(&self.alive),
                self.session_id.clone(),
            ));
            // a finished loop's handle is simply replaced
            *self.receiver.lock() = Some(task);
        }
        Ok(reg.rx)
    }

    pub fn deregister(&self, message_id: u64) -> bool {
        self.router.deregister(message_id)
    }

    /// writes one frame. A failed write marks the link dead
    pub async fn send(&self, frame: String) -> NetconfResult<()> {
        let res = self.writer.lock().await.send(frame).await;
        if let Err(err) = &res {
            warn!(?err, session_id = %self.session_id, "write failed, marking transport dead");
            self.alive.store(false, Ordering::Release);
        }
        res
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Closes the transport, fails anything still waiting and waits for the
    /// receive loop to finish.
    pub async fn shutdown(&self) {
        self.mark_dead();
        let _ = self.writer.lock().await.close().await;
        drop(self.guard.lock().take());
        let task = self.receiver.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.router.fail_all();
        debug!(session_id = %self.session_id, generation = self.generation, "link shut down");
    }
}

/// Replaceable connection to the controller.
pub struct Session {
    connector: Arc<dyn Connector>,
    opts: SessionOptions,
    // doubles as the connect lock
    current: Mutex<Option<Arc<Link>>>,
    generation: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.connector.peer())
            .field("opts", &self.opts)
            .finish()
    }
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, opts: SessionOptions) -> Self {
        Self {
            connector,
            opts,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.opts
    }

    /// the current link, if there is one and it's alive
    pub async fn current(&self) -> Option<Arc<Link>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|l| l.is_alive())
            .cloned()
    }

    /// Returns a live link, connecting if needed. The flag is true when the
    /// link was established by this call.
    pub async fn ensure_connected(&self) -> NetconfResult<(Arc<Link>, bool)> {
        let mut current = self.current.lock().await;
        if let Some(link) = current.as_ref() {
            if link.is_alive() {
                return Ok((Arc::clone(link), false));
            }
        }
        if let Some(old) = current.take() {
            info!(session_id = %old.session_id(), "transport is down, reconnecting");
            old.shutdown().await;
        }
        let link = Arc::new(self.connect().await?);
        *current = Some(Arc::clone(&link));
        Ok((link, true))
    }

    /// drops the current link, if any
    pub async fn close(&self) {
        if let Some(old) = self.current.lock().await.take() {
            old.shutdown().await;
        }
    }

    async fn connect(&self) -> NetconfResult<Link> {
        let peer = self.connector.peer();
        let timeout = self.opts.connect_timeout;
        let (transport, hello) = tokio::time::timeout(timeout, async {
            let transport = self.connector.connect().await?;
            handshake(transport, self.opts.max_frame).await
        })
        .await
        .map_err(|_| NetconfError::ConnectTimeout(timeout))??;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::RPC_CONNECTS.inc();
        info!(%peer, session_id = %hello.session_id, generation, "netconf session established");
        let Handshaken {
            reader,
            writer,
            guard,
        } = transport;
        Ok(Link {
            generation,
            session_id: hello.session_id,
            writer: Mutex::new(writer),
            reader: Arc::new(Mutex::new(reader)),
            next_id: AtomicU64::new(1),
            alive: Arc::new(AtomicBool::new(true)),
            router: Arc::new(ReplyRouter::new()),
            read_timeout: self.opts.read_timeout,
            receiver: parking_lot::Mutex::new(None),
            guard: parking_lot::Mutex::new(guard),
        })
    }
}

struct Handshaken {
    reader: FramedRead<BoxReader, FrameCodec>,
    writer: FramedWrite<BoxWriter, FrameCodec>,
    guard: Option<Box<dyn Any + Send>>,
}

/// server hello first, then ours
async fn handshake(
    transport: Transport,
    max_frame: usize,
) -> NetconfResult<(Handshaken, ServerHello)> {
    let Transport {
        reader,
        writer,
        guard,
    } = transport;
    let mut reader = FramedRead::new(reader, FrameCodec::new(max_frame));
    let mut writer = FramedWrite::new(writer, FrameCodec::new(max_frame));

    let frame = reader
        .next()
        .await
        .ok_or_else(|| NetconfError::Handshake("connection closed before server hello".into()))??;
    let hello = ServerHello::parse(&frame)?;
    debug!(session_id = %hello.session_id, capabilities = hello.capabilities.len(), "received server hello");
    writer.send(client_hello()).await?;
    Ok((
        Handshaken {
            reader,
            writer,
            guard,
        },
        hello,
    ))
}
