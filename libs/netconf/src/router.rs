//! Matches replies to the requests waiting on them.
//!
//! Every in-flight request parks a oneshot sender here under its
//! message-id. A single receive loop per transport reads frames, pulls the
//! message-id off the root element and hands the frame to whoever waits on
//! it. The loop only runs while someone is waiting: `register` reports when
//! the caller has to start one, and the loop stops itself once the waiter
//! table drains. Both decisions are made under the same lock so a request
//! can never be left without a loop.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{io::AsyncRead, sync::oneshot};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use fabric_core::metrics;

use crate::{
    codec::FrameCodec,
    error::{NetconfError, NetconfResult},
    xml,
};

type Waiter = oneshot::Sender<NetconfResult<String>>;

#[derive(Debug, Default)]
struct Waiters {
    map: HashMap<u64, Waiter>,
    loop_running: bool,
}

#[derive(Debug, Default)]
pub struct ReplyRouter {
    inner: Mutex<Waiters>,
}

/// returned by [`ReplyRouter::register`]
#[derive(Debug)]
pub struct Registration {
    pub rx: oneshot::Receiver<NetconfResult<String>>,
    /// no loop is running, the caller must start one
    pub start_loop: bool,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: u64) -> NetconfResult<Registration> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&message_id) {
            return Err(NetconfError::DuplicateMessageId(message_id));
        }
        let (tx, rx) = oneshot::channel();
        inner.map.insert(message_id, tx);
        let start_loop = !inner.loop_running;
        inner.loop_running = true;
        Ok(Registration { rx, start_loop })
    }

    /// drops the waiter, returns whether there was one
    pub fn deregister(&self, message_id: u64) -> bool {
        self.inner.lock().map.remove(&message_id).is_some()
    }

    /// hands `frame` to its waiter. Frames with no waiter are dropped
    pub fn deliver(&self, frame: String) -> bool {
        let Some(message_id) = xml::root_attr(&frame, "message-id").and_then(|id| id.parse().ok())
        else {
            warn!(frame = %truncate(&frame), "frame without a usable message-id, dropping");
            return false;
        };
        let waiter = self.inner.lock().map.remove(&message_id);
        match waiter {
            Some(tx) => {
                trace!(message_id, "routing reply");
                // receiver gone means the caller timed out in between
                tx.send(Ok(frame)).is_ok()
            }
            None => {
                metrics::RPC_LATE_REPLIES.inc();
                warn!(message_id, "reply has no waiter, possibly timed out");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// called by the loop on every idle tick or after a delivery. Returns
    /// true if the loop must exit
    fn stop_if_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.map.is_empty() {
            inner.loop_running = false;
            true
        } else {
            false
        }
    }

    /// fails every waiter with [`NetconfError::ReceiverTerminated`]
    pub fn fail_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.loop_running = false;
            inner.map.drain().collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(NetconfError::ReceiverTerminated));
        }
    }
}

fn truncate(frame: &str) -> &str {
    match frame.char_indices().nth(200) {
        Some((idx, _)) => &frame[..idx],
        None => frame,
    }
}

/// The receive loop for one transport. Holds the read half for its whole
/// life, so a loop started while an older one is winding down waits for it.
pub async fn receive_loop<R>(
    router: Arc<ReplyRouter>,
    reader: Arc<tokio::sync::Mutex<FramedRead<R, FrameCodec>>>,
    read_timeout: Duration,
    alive: Arc<AtomicBool>,
    session_id: String,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = reader.lock().await;
    debug!(%session_id, "receive loop started");
    loop {
        match tokio::time::timeout(read_timeout, framed.next()).await {
            Err(_) => {
                if router.stop_if_idle() {
                    debug!(%session_id, "receive loop idle, stopping");
                    return;
                }
            }
            Ok(Some(Ok(frame))) => {
                router.deliver(frame);
                if router.stop_if_idle() {
                    trace!(%session_id, "no more waiters, stopping receive loop");
                    return;
                }
            }
            Ok(Some(Err(err))) => {
                error!(?err, %session_id, "read failed, closing transport");
                break;
            }
            Ok(None) => {
                info!(%session_id, "transport closed by peer");
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
    router.fail_all();
}
