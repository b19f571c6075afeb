//! Stream multiplexer: opens and accepts stream channels over addressing
//!
//! The initiator generates both stream ids, subscribes to the chunk and
//! destroy events of its new channel, and only then sends the create request.
//! The acceptor builds its channel with the ids swapped, subscribes, hands it
//! to a [`StreamListener`] and acknowledges. Anything the acceptor writes
//! right away therefore finds a subscribed initiator, even though it may
//! arrive before the acknowledgement.

use super::channel::{DestroyCause, StreamChannel};
use crate::error::P2pError;
use crate::peer::addressing::{Addressing, Incoming};
use crate::peer::protocol::{self as p2p, STREAM_CREATE};
use crate::peer::session::Session;
use crate::transport::{TransportError, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Conventional duplex buffer size
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Per-channel options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Buffered bytes at which the reader stops acknowledging chunks
    pub high_water_mark: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl StreamOptions {
    pub fn with_high_water_mark(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

struct AcceptSlot {
    id: u64,
    from: Option<String>,
    options: StreamOptions,
    tx: mpsc::UnboundedSender<StreamChannel>,
}

struct MuxInner {
    addressing: Addressing,
    session: Session,
    default_options: StreamOptions,
    accept_slots: Mutex<Vec<AcceptSlot>>,
    channels: Mutex<HashMap<String, StreamChannel>>,
    next_slot: AtomicU64,
}

/// Opens and accepts streams for the local peer. Cheap to clone.
#[derive(Clone)]
pub struct StreamMux {
    inner: Arc<MuxInner>,
}

impl StreamMux {
    pub(crate) fn attach(
        addressing: &Addressing,
        session: &Session,
        default_options: StreamOptions,
    ) -> StreamMux {
        let mux = StreamMux {
            inner: Arc::new(MuxInner {
                addressing: addressing.clone(),
                session: session.clone(),
                default_options,
                accept_slots: Mutex::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                next_slot: AtomicU64::new(1),
            }),
        };

        let this = mux.clone();
        addressing.listen_any(
            STREAM_CREATE,
            move |incoming| this.on_create(incoming),
            false,
            true,
        );
        mux
    }

    pub fn default_options(&self) -> StreamOptions {
        self.inner.default_options
    }

    /// Open a stream to `target`
    pub async fn add_stream(
        &self,
        target: &str,
        options: StreamOptions,
    ) -> Result<StreamChannel, P2pError> {
        self.open(target, options).await
    }

    /// Open a stream to the peer of the active session
    pub async fn register_stream(&self, options: StreamOptions) -> Result<StreamChannel, P2pError> {
        let peer = self.inner.session.active_peer()?;
        self.open(&peer, options).await
    }

    /// Accept streams from any peer, with the default options
    pub fn listen(&self) -> StreamListener {
        self.listen_with(None, self.inner.default_options)
    }

    /// Accept streams from `peer` only
    pub fn listen_from(&self, peer: &str) -> StreamListener {
        self.listen_with(Some(peer.to_string()), self.inner.default_options)
    }

    /// Accept streams, optionally from one peer only, with custom options
    pub fn listen_with(&self, from: Option<String>, options: StreamOptions) -> StreamListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        self.inner.accept_slots.lock().push(AcceptSlot {
            id,
            from,
            options,
            tx,
        });
        StreamListener {
            id,
            rx,
            mux: Arc::downgrade(&self.inner),
        }
    }

    /// Channels that are negotiating or open
    pub fn channels(&self) -> Vec<StreamChannel> {
        self.inner.channels.lock().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    async fn open(&self, target: &str, options: StreamOptions) -> Result<StreamChannel, P2pError> {
        let source_id = Uuid::new_v4().to_string();
        let target_id = Uuid::new_v4().to_string();
        let channel = StreamChannel::new(
            self.inner.addressing.clone(),
            source_id.clone(),
            target_id.clone(),
            target.to_string(),
            options.high_water_mark,
        );
        channel.attach_listeners();
        self.track(&channel);

        let (tx, rx) = oneshot::channel();
        let pending = channel.clone();
        let peer = target.to_string();
        self.inner.addressing.request_with(
            target,
            STREAM_CREATE,
            vec![Value::Text(source_id), Value::Text(target_id)],
            move |result| {
                let outcome = match result {
                    Ok(args) if p2p::accepted(&args) => {
                        pending.open();
                        Ok(pending)
                    }
                    Ok(_) | Err(P2pError::Transport(TransportError::AckDropped)) => {
                        pending.destroy_with(DestroyCause::Refused, false);
                        Err(P2pError::StreamCreateRefused(format!(
                            "{} is not accepting streams",
                            peer
                        )))
                    }
                    Err(e) => {
                        pending.destroy_with(DestroyCause::Refused, false);
                        Err(P2pError::StreamCreateRefused(format!("{}: {}", peer, e)))
                    }
                };
                // Nobody is waiting any more: do not leave a half-open stream
                if let Err(Ok(orphan)) = tx.send(outcome) {
                    debug!("stream open to {} cancelled; destroying", orphan.remote());
                    orphan.destroy();
                }
            },
        );

        rx.await
            .unwrap_or(Err(P2pError::Transport(TransportError::Disconnected)))
    }

    /// Runs in the reader task for every create request
    fn on_create(&self, mut incoming: Incoming) {
        let from = incoming.from.clone();
        let mut ids = std::mem::take(&mut incoming.args)
            .into_iter()
            .map(Value::into_text);
        let (Some(Some(remote_source)), Some(Some(remote_target))) = (ids.next(), ids.next()) else {
            warn!("malformed stream create request from {}", from);
            incoming.reply(vec![Value::Bool(false)]);
            return;
        };

        let Some((tx, options)) = self.find_acceptor(&from) else {
            debug!("no stream listener; refusing stream from {}", from);
            incoming.reply(vec![Value::Bool(false)]);
            return;
        };

        let channel = StreamChannel::new(
            self.inner.addressing.clone(),
            remote_target,
            remote_source,
            from.clone(),
            options.high_water_mark,
        );
        channel.attach_listeners();
        self.track(&channel);
        channel.open();

        if tx.send(channel.clone()).is_err() {
            // The listener went away since we looked
            channel.destroy_with(DestroyCause::Refused, false);
            incoming.reply(vec![Value::Bool(false)]);
            return;
        }
        debug!("accepted stream {} from {}", channel.source_id(), from);
        incoming.reply(vec![Value::Bool(true)]);
    }

    fn find_acceptor(&self, from: &str) -> Option<(mpsc::UnboundedSender<StreamChannel>, StreamOptions)> {
        let mut slots = self.inner.accept_slots.lock();
        slots.retain(|slot| !slot.tx.is_closed());
        slots
            .iter()
            .find(|slot| slot.from.as_deref().map_or(true, |peer| peer == from))
            .map(|slot| (slot.tx.clone(), slot.options))
    }

    fn track(&self, channel: &StreamChannel) {
        self.inner
            .channels
            .lock()
            .insert(channel.source_id().to_string(), channel.clone());
        let mux = Arc::downgrade(&self.inner);
        channel.set_on_destroyed(move |source_id| {
            if let Some(mux) = mux.upgrade() {
                mux.channels.lock().remove(source_id);
            }
        });
    }
}

/// Accept side of the stream handshake. Dropping it stops accepting.
pub struct StreamListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamChannel>,
    mux: Weak<MuxInner>,
}

impl StreamListener {
    /// Wait for the next accepted stream. `None` once the client is gone.
    pub async fn accept(&mut self) -> Option<StreamChannel> {
        self.rx.recv().await
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.accept_slots.lock().retain(|slot| slot.id != self.id);
        }
        // Streams accepted but never picked up
        while let Ok(channel) = self.rx.try_recv() {
            channel.destroy();
        }
    }
}
