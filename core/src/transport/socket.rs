//! Event socket: named events with acknowledgements over a [`Link`]
//!
//! Every connection is served by exactly one reader task which dispatches
//! frames in arrival order. Handlers run inside that task, so anything a
//! handler emits is queued before the next inbound frame is looked at. The
//! relay and the peer runtime both lean on this to keep per-pair FIFO order.

use super::abstraction::{Link, LinkKind, TransportError};
use super::frame::{Frame, MAX_FRAME_LEN};
use super::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Outcome of an acknowledged emit
pub type AckResult = Result<Vec<Value>, TransportError>;

/// Handler for one event name
pub type EventHandler = Arc<dyn Fn(Vec<Value>, Option<Ack>) + Send + Sync>;

/// Handler for events that have no dedicated listener
pub type FallbackHandler = Arc<dyn Fn(String, Vec<Value>, Option<Ack>) + Send + Sync>;

type AckCallback = Box<dyn FnOnce(AckResult) + Send>;
type DisconnectHandler = Box<dyn FnOnce(&str) + Send>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by listener registration, used to remove exactly that listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Acknowledgement responder handed to an event handler.
///
/// Answering consumes it, so an acknowledgement is sent at most once. Dropping
/// it unanswered tells the sender with a `Nack` instead of leaving it waiting.
pub struct Ack {
    id: u64,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

impl Ack {
    fn new(id: u64, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            outbound: Some(outbound),
        }
    }

    /// Correlation id of the acknowledged event
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Answer the sender. An answer too large to encode goes out as a `Nack`.
    pub fn send(mut self, args: Vec<Value>) {
        if let Some(tx) = self.outbound.take() {
            let frame = Frame::Ack { id: self.id, args };
            let frame = match check_len(&frame) {
                Ok(()) => frame,
                Err(e) => {
                    warn!("ack {} not sent: {}", self.id, e);
                    Frame::Nack { id: self.id }
                }
            };
            let _ = tx.send(frame);
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(tx) = self.outbound.take() {
            trace!("ack {} dropped unanswered", self.id);
            let _ = tx.send(Frame::Nack { id: self.id });
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("id", &self.id)
            .field("answered", &self.outbound.is_none())
            .finish()
    }
}

struct SocketInner {
    id: u64,
    peer_id: String,
    kind: LinkKind,
    outbound: mpsc::UnboundedSender<Frame>,
    handlers: Mutex<HashMap<String, Vec<(ListenerId, EventHandler)>>>,
    fallback: Mutex<Option<FallbackHandler>>,
    pending: Mutex<HashMap<u64, AckCallback>>,
    disconnect_handlers: Mutex<Vec<(ListenerId, DisconnectHandler)>>,
    next_ack: AtomicU64,
    next_listener: AtomicU64,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    closed_tx: watch::Sender<bool>,
}

/// A live connection: emits events to, and dispatches events from, the other end
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("peer_id", &self.inner.peer_id)
            .field("kind", &self.inner.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket {
    /// Wrap a link and start its reader task.
    ///
    /// `peer_id` is the identity announced in the link's `Hello`: the local id
    /// on the peer side, the remote id on the relay side.
    pub fn spawn(peer_id: impl Into<String>, link: Link) -> Socket {
        Self::spawn_with(peer_id, link, |_| ()).0
    }

    /// Like [`spawn`](Self::spawn), running `init` before the reader task
    /// starts so no inbound frame can be dispatched ahead of the handlers it
    /// installs
    pub fn spawn_with<T, F>(peer_id: impl Into<String>, link: Link, init: F) -> (Socket, T)
    where
        F: FnOnce(&Socket) -> T,
    {
        let Link {
            kind,
            outbound,
            inbound,
        } = link;
        let (closed_tx, closed_rx) = watch::channel(false);
        let socket = Socket {
            inner: Arc::new(SocketInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_id: peer_id.into(),
                kind,
                outbound,
                handlers: Mutex::new(HashMap::new()),
                fallback: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                disconnect_handlers: Mutex::new(Vec::new()),
                next_ack: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                closed_tx,
            }),
        };

        let state = init(&socket);

        let reader = socket.clone();
        tokio::spawn(async move {
            reader.read_loop(inbound, closed_rx).await;
        });

        (socket, state)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identity announced on this connection
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn kind(&self) -> LinkKind {
        self.inner.kind
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reason given when the connection closed, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// Resolve once the connection has closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to an event name
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(Vec<Value>, Option<Ack>) + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner
            .handlers
            .lock()
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one listener. Returns false if it was already gone.
    pub fn off(&self, listener: ListenerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(id, _)| *id != listener);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Number of listeners subscribed to an exact event name
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .lock()
            .get(event)
            .map_or(0, |list| list.len())
    }

    /// Install the handler for events with no dedicated listener
    pub fn set_fallback<F>(&self, handler: F)
    where
        F: Fn(String, Vec<Value>, Option<Ack>) + Send + Sync + 'static,
    {
        *self.inner.fallback.lock() = Some(Arc::new(handler));
    }

    /// Run `handler` once when the connection closes. Runs immediately if it
    /// already has.
    pub fn on_disconnect<F>(&self, handler: F) -> ListenerId
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let id = self.next_listener_id();
        if self.is_closed() {
            let reason = self.close_reason().unwrap_or_default();
            handler(&reason);
            return id;
        }
        self.inner
            .disconnect_handlers
            .lock()
            .push((id, Box::new(handler)));
        // close() may have drained the list between the check and the push
        if self.is_closed() {
            self.run_disconnect_handlers();
        }
        id
    }

    /// Remove a disconnect handler before it has fired
    pub fn off_disconnect(&self, listener: ListenerId) -> bool {
        let mut list = self.inner.disconnect_handlers.lock();
        let before = list.len();
        list.retain(|(id, _)| *id != listener);
        list.len() != before
    }

    /// Fire-and-forget emit. A frame over [`MAX_FRAME_LEN`] is refused with
    /// `TooLarge` and the connection is left alone.
    pub fn emit(&self, event: impl Into<String>, args: Vec<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let frame = Frame::Event {
            event: event.into(),
            args,
            ack: None,
        };
        check_len(&frame)?;
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Emit and run `callback` with the acknowledgement.
    ///
    /// The callback runs exactly once: inside the reader task when the answer
    /// arrives, or synchronously from this call if the connection is already
    /// gone.
    pub fn emit_with_callback<F>(&self, event: impl Into<String>, args: Vec<Value>, callback: F)
    where
        F: FnOnce(AckResult) + Send + 'static,
    {
        if self.is_closed() {
            callback(Err(TransportError::Disconnected));
            return;
        }
        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Event {
            event: event.into(),
            args,
            ack: Some(id),
        };
        if let Err(e) = check_len(&frame) {
            callback(Err(e));
            return;
        }
        self.inner.pending.lock().insert(id, Box::new(callback));

        let sent = self.inner.outbound.send(frame);
        // Closed concurrently: whoever removes the entry first answers it
        if sent.is_err() || self.is_closed() {
            let callback = self.inner.pending.lock().remove(&id);
            if let Some(callback) = callback {
                callback(Err(TransportError::Disconnected));
            }
        }
    }

    /// Emit and await the acknowledgement. The event is queued before this
    /// returns, not when the future is first polled.
    pub fn emit_with_ack(
        &self,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> impl Future<Output = AckResult> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.emit_with_callback(event, args, move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.unwrap_or(Err(TransportError::Disconnected)) }
    }

    /// Close the connection, telling the other end why
    pub fn disconnect(&self, reason: &str) {
        self.close(reason);
    }

    async fn read_loop(
        self,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Frame::Disconnect { reason }) => {
                        debug!("connection {} ({}) closed by remote: {}", self.id(), self.peer_id(), reason);
                        self.close(&reason);
                        break;
                    }
                    Some(frame) => self.dispatch(frame),
                    None => {
                        self.close("transport closed");
                        break;
                    }
                },
                changed = closed_rx.changed() => {
                    if changed.is_err() || *closed_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Event { event, args, ack } => {
                let ack = ack.map(|id| Ack::new(id, self.inner.outbound.clone()));
                let handlers: Vec<EventHandler> = self
                    .inner
                    .handlers
                    .lock()
                    .get(&event)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();

                if handlers.is_empty() {
                    let fallback = self.inner.fallback.lock().clone();
                    match fallback {
                        Some(fallback) => fallback(event, args, ack),
                        None => debug!("no listener for event {:?} on {}", event, self.peer_id()),
                    }
                    return;
                }

                // The first listener owns the acknowledgement
                let mut ack = ack;
                if let Some((last, rest)) = handlers.split_last() {
                    for handler in rest {
                        handler(args.clone(), ack.take());
                    }
                    last(args, ack.take());
                }
            }
            Frame::Ack { id, args } => {
                let callback = self.inner.pending.lock().remove(&id);
                match callback {
                    Some(callback) => callback(Ok(args)),
                    None => debug!("ack {} has no pending emit", id),
                }
            }
            Frame::Nack { id } => {
                let callback = self.inner.pending.lock().remove(&id);
                if let Some(callback) = callback {
                    callback(Err(TransportError::AckDropped));
                }
            }
            other => {
                warn!(
                    "unexpected {} frame on established connection {}",
                    other.frame_type(),
                    self.id()
                );
            }
        }
    }

    fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.close_reason.lock() = Some(reason.to_string());
        let _ = self.inner.outbound.send(Frame::Disconnect {
            reason: reason.to_string(),
        });
        let _ = self.inner.closed_tx.send(true);

        let pending: Vec<AckCallback> = self.inner.pending.lock().drain().map(|(_, cb)| cb).collect();
        for callback in pending {
            callback(Err(TransportError::Disconnected));
        }

        self.run_disconnect_handlers();

        // Handlers usually capture state that holds this socket
        self.inner.handlers.lock().clear();
        *self.inner.fallback.lock() = None;
    }

    fn run_disconnect_handlers(&self) {
        let reason = self.close_reason().unwrap_or_default();
        let handlers: Vec<DisconnectHandler> = self
            .inner
            .disconnect_handlers
            .lock()
            .drain(..)
            .map(|(_, h)| h)
            .collect();
        for handler in handlers {
            handler(&reason);
        }
    }
}

fn check_len(frame: &Frame) -> Result<(), TransportError> {
    let len = frame.encoded_len()?;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::TooLarge(len));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
