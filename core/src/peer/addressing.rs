//! Addressing: non-exclusive messaging between peers by id
//!
//! Every addressed event a peer receives comes through the relay with its
//! sender attached. This module decodes the sender, then dispatches to the
//! listeners registered for that `(sender, event)` pair plus any sender-agnostic
//! listeners for the event.
//!
//! Listeners registered `from(remote)` are owned by that remote's target entry.
//! When the relay reports the remote gone, the whole entry is dropped in one
//! step and the remote's disconnect hooks run, so nothing registered against a
//! departed peer outlives it. Listeners for other remotes on the same event
//! name are untouched.
//!
//! A remote that is not connected yet keeps its listeners: only its hooks run.
//! Its presence is asked again the first time it sends us anything, so the
//! relay tells us when it leaves.

use super::protocol::{self as p2p, TARGET_ADD};
use crate::error::P2pError;
use crate::relay::protocol::{
    decode_delivery, events, parse_forward_ack, ForwardRequest, RelayErrorNotice,
    RESERVED_PREFIX,
};
use crate::transport::{Ack, AddressEncoding, Socket, TransportError, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Where failures that no caller is waiting on are reported
pub type ErrorSink = mpsc::UnboundedSender<P2pError>;

/// Listener for addressed events
pub type IncomingHandler = Arc<dyn Fn(Incoming) + Send + Sync>;

type TargetAddedHandler = Arc<dyn Fn(&str) + Send + Sync>;
type Hook = Box<dyn FnOnce(&str) + Send>;

/// An addressed event as seen by a listener
pub struct Incoming {
    /// Sender's peer id, as attributed by the relay
    pub from: String,
    pub event: String,
    pub args: Vec<Value>,
    ack: Option<Ack>,
}

impl Incoming {
    /// Whether the sender is waiting for an acknowledgement
    pub fn wants_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Acknowledge the event. Returns false if there was nothing to answer.
    pub fn reply(&mut self, args: Vec<Value>) -> bool {
        match self.ack.take() {
            Some(ack) => {
                ack.send(args);
                true
            }
            None => false,
        }
    }

    /// Take the acknowledgement to answer it later
    pub fn take_ack(&mut self) -> Option<Ack> {
        self.ack.take()
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("from", &self.from)
            .field("event", &self.event)
            .field("args", &self.args)
            .field("wants_ack", &self.wants_ack())
            .finish()
    }
}

/// Identifies one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Identifies one disconnect hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HookId(u64);

struct Slot {
    id: ListenerHandle,
    handler: IncomingHandler,
    once: bool,
    /// Registered by the runtime itself rather than the application
    internal: bool,
}

/// What the relay last told us about a remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    /// A watch is in flight
    Asking,
    /// Connected; the relay will report its departure
    Present,
    /// Not connected when last asked
    Absent,
}

struct TargetEntry {
    /// Tells a stale presence answer from one meant for this entry
    epoch: u64,
    presence: Presence,
    listeners: HashMap<String, Vec<Slot>>,
    hooks: Vec<(HookId, Hook)>,
}

impl TargetEntry {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            presence: Presence::Asking,
            listeners: HashMap::new(),
            hooks: Vec::new(),
        }
    }

    fn count(&self, internal: bool) -> usize {
        self.listeners
            .values()
            .flatten()
            .filter(|slot| slot.internal == internal)
            .count()
    }
}

#[derive(Default)]
struct Table {
    targets: HashMap<String, TargetEntry>,
    any: HashMap<String, Vec<Slot>>,
    target_added: Vec<TargetAddedHandler>,
}

struct AddressingInner {
    local_id: String,
    socket: Socket,
    encoding: AddressEncoding,
    table: Mutex<Table>,
    next_id: AtomicU64,
    errors: ErrorSink,
}

/// Addressed messaging for one local peer. Cheap to clone.
#[derive(Clone)]
pub struct Addressing {
    inner: Arc<AddressingInner>,
}

impl Addressing {
    /// Take over dispatch of addressed events on `socket`
    pub(crate) fn attach(
        socket: &Socket,
        local_id: &str,
        encoding: AddressEncoding,
        errors: ErrorSink,
    ) -> Addressing {
        let addressing = Addressing {
            inner: Arc::new(AddressingInner {
                local_id: local_id.to_string(),
                socket: socket.clone(),
                encoding,
                table: Mutex::new(Table::default()),
                next_id: AtomicU64::new(1),
                errors,
            }),
        };

        let this = addressing.clone();
        socket.set_fallback(move |event, args, ack| this.dispatch(event, args, ack));

        let this = addressing.clone();
        socket.on(events::PEER_DISCONNECTED, move |args, _ack| {
            match args.into_iter().next().and_then(Value::into_text) {
                Some(peer) => this.peer_gone(&peer),
                None => warn!("peer-disconnected notice without a peer id"),
            }
        });

        let this = addressing.clone();
        socket.on(events::ERROR, move |args, _ack| match RelayErrorNotice::from_args(args) {
            Some(notice) => {
                let err = notice.into_error();
                warn!("relay could not deliver for {}: {}", this.inner.local_id, err);
                let _ = this.inner.errors.send(err);
            }
            None => warn!("malformed relay error notice"),
        });

        let this = addressing.clone();
        socket.on_disconnect(move |reason| this.local_disconnect(reason));

        let this = addressing.clone();
        addressing.listen_any(
            TARGET_ADD,
            move |mut incoming| {
                let handlers = this.inner.table.lock().target_added.clone();
                for handler in handlers {
                    handler(&incoming.from);
                }
                incoming.reply(vec![Value::Bool(true)]);
            },
            false,
            true,
        );

        addressing
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn encoding(&self) -> AddressEncoding {
        self.inner.encoding
    }

    pub(crate) fn report(&self, err: P2pError) {
        let _ = self.inner.errors.send(err);
    }

    /// Scope listener registration and emits to one remote peer
    pub fn from(&self, remote: impl Into<String>) -> TargetScope<'_> {
        TargetScope {
            addressing: self,
            remote: remote.into(),
        }
    }

    /// Listen for `event` from any peer
    pub fn on_any<F>(&self, event: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.listen_any(event, handler, false, false)
    }

    /// Listen for the next `event` from any peer
    pub fn once_any<F>(&self, event: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.listen_any(event, handler, true, false)
    }

    /// Run `handler` whenever a remote confirms us with [`add_target`](Self::add_target)
    pub fn on_target_added<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.table.lock().target_added.push(Arc::new(handler));
    }

    /// Remove one listener. Returns false if it was already gone.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut table = self.inner.table.lock();
        let Table { targets, any, .. } = &mut *table;
        let owner = targets.iter_mut().find_map(|(remote, entry)| {
            remove_slot(&mut entry.listeners, handle).then(|| remote.clone())
        });
        match owner {
            Some(remote) => {
                prune_absent(targets, &remote);
                true
            }
            None => remove_slot(any, handle),
        }
    }

    /// Drop every application listener registered from `remote`. Returns how
    /// many were removed.
    pub fn remove_target(&self, remote: &str) -> usize {
        let (removed, unwatch) = {
            let mut table = self.inner.table.lock();
            let Some(entry) = table.targets.get_mut(remote) else {
                return 0;
            };
            let before = entry.count(false);
            for slots in entry.listeners.values_mut() {
                slots.retain(|slot| slot.internal);
            }
            entry.listeners.retain(|_, slots| !slots.is_empty());
            let unwatch = entry.listeners.is_empty() && entry.hooks.is_empty();
            if unwatch {
                table.targets.remove(remote);
            }
            (before, unwatch)
        };
        if unwatch {
            let _ = self
                .inner
                .socket
                .emit(events::UNWATCH, vec![Value::from(remote)]);
        }
        debug!("removed {} listeners from {}", removed, remote);
        removed
    }

    /// Application listeners attributable to `remote`
    pub fn listener_count_from(&self, remote: &str) -> usize {
        self.inner
            .table
            .lock()
            .targets
            .get(remote)
            .map_or(0, |entry| entry.count(false))
    }

    /// Listeners the runtime holds for `remote` on its own behalf, such as
    /// stream chunk listeners
    pub fn protocol_listener_count_from(&self, remote: &str) -> usize {
        self.inner
            .table
            .lock()
            .targets
            .get(remote)
            .map_or(0, |entry| entry.count(true))
    }

    /// Application listeners with no sender filter
    pub fn any_listener_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .any
            .values()
            .flatten()
            .filter(|slot| !slot.internal)
            .count()
    }

    /// Remotes that currently own listeners or hooks
    pub fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.table.lock().targets.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Confirm `remote` is reachable and tell it we are addressing it
    pub async fn add_target(&self, remote: &str) -> Result<(), P2pError> {
        self.ensure_target(remote);
        let reply = self.request(remote, TARGET_ADD, vec![]).await?;
        if p2p::accepted(&reply) {
            Ok(())
        } else {
            Err(P2pError::Protocol(format!("{} did not confirm target-add", remote)))
        }
    }

    /// Send `event` to `remote`. Delivery failures are reported by the relay
    /// asynchronously on the client's error stream.
    pub fn emit_to(&self, remote: &str, event: &str, args: Vec<Value>) -> Result<(), P2pError> {
        check_event(event)?;
        self.send(remote, event, args)
    }

    /// Send `event` to `remote` and wait for its acknowledgement
    pub async fn emit_to_with_ack(
        &self,
        remote: &str,
        event: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, P2pError> {
        check_event(event)?;
        self.request(remote, event, args).await
    }

    /// Peers currently registered with the relay
    pub async fn list_peers(&self) -> Result<Vec<String>, P2pError> {
        let reply = self.inner.socket.emit_with_ack(events::PEERS, vec![]).await?;
        reply
            .into_iter()
            .next()
            .and_then(Value::into_list)
            .map(|ids| ids.into_iter().filter_map(Value::into_text).collect())
            .ok_or_else(|| P2pError::Protocol("malformed peer list".to_string()))
    }

    // ------------------------------------------------------------------------
    // Runtime internals
    // ------------------------------------------------------------------------

    /// Fire-and-forget send, without the reserved-name check
    pub(crate) fn send(&self, remote: &str, event: &str, args: Vec<Value>) -> Result<(), P2pError> {
        trace!("{} -> {}: {}", self.inner.local_id, remote, event);
        self.inner
            .socket
            .emit(events::FORWARD, ForwardRequest::new(remote, event, args).into_args())?;
        Ok(())
    }

    /// Send with an acknowledgement, handing the outcome to `callback` inside
    /// the connection's reader task
    pub(crate) fn request_with<F>(&self, remote: &str, event: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Vec<Value>, P2pError>) + Send + 'static,
    {
        trace!("{} -> {}: {} (ack)", self.inner.local_id, remote, event);
        self.inner.socket.emit_with_callback(
            events::FORWARD,
            ForwardRequest::new(remote, event, args).into_args(),
            move |result| callback(result.map_err(P2pError::from).and_then(parse_forward_ack)),
        );
    }

    /// Send with an acknowledgement. The event is queued before this returns.
    pub(crate) fn request(
        &self,
        remote: &str,
        event: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Vec<Value>, P2pError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.request_with(remote, event, args, move |result| {
            let _ = tx.send(result);
        });
        async move {
            rx.await
                .unwrap_or(Err(P2pError::Transport(TransportError::Disconnected)))
        }
    }

    pub(crate) fn listen_from<F>(
        &self,
        remote: &str,
        event: impl Into<String>,
        handler: F,
        once: bool,
        internal: bool,
    ) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        let slot = self.slot(handler, once, internal);
        let id = slot.id;
        let created = {
            let mut table = self.inner.table.lock();
            let (entry, created) = self.entry(&mut table, remote);
            entry.listeners.entry(event.into()).or_default().push(slot);
            created
        };
        if let Some(epoch) = created {
            self.watch(remote, epoch);
        }
        id
    }

    pub(crate) fn listen_any<F>(
        &self,
        event: impl Into<String>,
        handler: F,
        once: bool,
        internal: bool,
    ) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        let slot = self.slot(handler, once, internal);
        let id = slot.id;
        self.inner
            .table
            .lock()
            .any
            .entry(event.into())
            .or_default()
            .push(slot);
        id
    }

    /// Run `hook` once when `remote` is gone, or right away if the relay says
    /// it already is. Must not be called with a lock held that the hook takes.
    pub(crate) fn on_peer_gone<F>(&self, remote: &str, hook: F) -> HookId
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let id = HookId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let epoch = {
            let mut table = self.inner.table.lock();
            let (entry, _) = self.entry(&mut table, remote);
            entry.hooks.push((id, Box::new(hook)));
            entry.epoch
        };
        // Always ask: the peer may have left before the entry existed
        self.watch(remote, epoch);
        id
    }

    pub(crate) fn remove_hook(&self, remote: &str, hook: HookId) {
        let mut table = self.inner.table.lock();
        if let Some(entry) = table.targets.get_mut(remote) {
            entry.hooks.retain(|(id, _)| *id != hook);
        }
        prune_absent(&mut table.targets, remote);
    }

    fn slot<F>(&self, handler: F, once: bool, internal: bool) -> Slot
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        Slot {
            id: ListenerHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            handler: Arc::new(handler),
            once,
            internal,
        }
    }

    fn ensure_target(&self, remote: &str) {
        let created = {
            let mut table = self.inner.table.lock();
            self.entry(&mut table, remote).1
        };
        if let Some(epoch) = created {
            self.watch(remote, epoch);
        }
    }

    /// The entry for `remote`, and its epoch if it was just created
    fn entry<'t>(&self, table: &'t mut Table, remote: &str) -> (&'t mut TargetEntry, Option<u64>) {
        let mut created = None;
        let entry = table.targets.entry(remote.to_string()).or_insert_with(|| {
            let epoch = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            created = Some(epoch);
            TargetEntry::new(epoch)
        });
        (entry, created)
    }

    /// Join `remote`'s watch room. If the relay answers that it is not
    /// connected, the hooks registered before this watch run; listeners stay.
    fn watch(&self, remote: &str, epoch: u64) {
        let asked = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let peer = remote.to_string();
        self.inner
            .socket
            .emit_with_callback(events::WATCH, vec![Value::from(remote)], move |result| {
                let present = matches!(&result, Ok(args) if p2p::accepted(args));
                this.presence_answer(&peer, epoch, asked, present);
            });
    }

    fn presence_answer(&self, remote: &str, epoch: u64, asked: u64, present: bool) {
        let hooks = {
            let mut table = self.inner.table.lock();
            let Some(entry) = table.targets.get_mut(remote).filter(|e| e.epoch == epoch) else {
                return;
            };
            if present {
                entry.presence = Presence::Present;
                return;
            }
            entry.presence = Presence::Absent;
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.hooks)
                .into_iter()
                .partition(|(id, _)| id.0 < asked);
            entry.hooks = kept;
            if entry.listeners.is_empty() && entry.hooks.is_empty() {
                table.targets.remove(remote);
            }
            gone
        };
        debug!(
            "{}: {} is not connected; {} hooks run, listeners kept",
            self.inner.local_id,
            remote,
            hooks.len()
        );
        for (_, hook) in hooks {
            hook(remote);
        }
    }

    fn dispatch(&self, event: String, args: Vec<Value>, ack: Option<Ack>) {
        let Some((from, event, args)) = decode_delivery(self.inner.encoding, event, args) else {
            debug!("{}: dropping event without sender attribution", self.inner.local_id);
            return;
        };

        let (handlers, rewatch) = self.take_handlers(&from, &event);
        if let Some(epoch) = rewatch {
            debug!("{}: {} is back, watching again", self.inner.local_id, from);
            self.watch(&from, epoch);
        }
        if handlers.is_empty() {
            trace!("{}: no listener for {} from {}", self.inner.local_id, event, from);
            return;
        }

        // The first listener owns the acknowledgement
        let mut ack = ack;
        if let Some((last, rest)) = handlers.split_last() {
            for handler in rest {
                handler(Incoming {
                    from: from.clone(),
                    event: event.clone(),
                    args: args.clone(),
                    ack: ack.take(),
                });
            }
            last(Incoming {
                from,
                event,
                args,
                ack: ack.take(),
            });
        }
    }

    /// Collect the handlers for one delivery, retiring `once` listeners.
    /// Also returns the sender's epoch if it was last seen absent.
    fn take_handlers(&self, from: &str, event: &str) -> (Vec<IncomingHandler>, Option<u64>) {
        let mut table = self.inner.table.lock();
        let Table { targets, any, .. } = &mut *table;
        let mut handlers = Vec::new();
        let mut rewatch = None;
        if let Some(entry) = targets.get_mut(from) {
            collect(&mut entry.listeners, event, &mut handlers);
            if entry.presence == Presence::Absent {
                entry.presence = Presence::Asking;
                rewatch = Some(entry.epoch);
            }
        }
        collect(any, event, &mut handlers);
        (handlers, rewatch)
    }

    /// The relay reported `remote` disconnected: drop its entry and run its
    /// hooks
    fn peer_gone(&self, remote: &str) {
        let entry = self.inner.table.lock().targets.remove(remote);
        if let Some(entry) = entry {
            debug!(
                "{}: {} disconnected, dropping {} listeners",
                self.inner.local_id,
                remote,
                entry.count(false) + entry.count(true)
            );
            for (_, hook) in entry.hooks {
                hook(remote);
            }
        }
    }

    fn local_disconnect(&self, reason: &str) {
        // Listeners capture the session and stream layers; release them
        let targets = {
            let mut table = self.inner.table.lock();
            table.any.clear();
            table.target_added.clear();
            std::mem::take(&mut table.targets)
        };
        debug!(
            "{}: connection closed ({}), releasing {} targets",
            self.inner.local_id,
            reason,
            targets.len()
        );
        for (remote, entry) in targets {
            for (_, hook) in entry.hooks {
                hook(&remote);
            }
        }
    }
}

/// Listener registration and emits scoped to one remote peer
pub struct TargetScope<'a> {
    addressing: &'a Addressing,
    remote: String,
}

impl TargetScope<'_> {
    /// Listen for `event`, but only when `remote` sent it
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.addressing
            .listen_from(&self.remote, event, handler, false, false)
    }

    /// Listen for the next `event` from `remote`
    pub fn once<F>(&self, event: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        self.addressing
            .listen_from(&self.remote, event, handler, true, false)
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), P2pError> {
        self.addressing.emit_to(&self.remote, event, args)
    }

    pub async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<Vec<Value>, P2pError> {
        self.addressing
            .emit_to_with_ack(&self.remote, event, args)
            .await
    }
}

fn check_event(event: &str) -> Result<(), P2pError> {
    if event.starts_with(RESERVED_PREFIX) {
        return Err(P2pError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

fn collect(map: &mut HashMap<String, Vec<Slot>>, event: &str, out: &mut Vec<IncomingHandler>) {
    let Some(slots) = map.get_mut(event) else {
        return;
    };
    out.extend(slots.iter().map(|slot| Arc::clone(&slot.handler)));
    slots.retain(|slot| !slot.once);
    if slots.is_empty() {
        map.remove(event);
    }
}

/// Forget an entry for a peer that is not connected once nothing uses it
fn prune_absent(targets: &mut HashMap<String, TargetEntry>, remote: &str) {
    let unused = targets.get(remote).is_some_and(|entry| {
        entry.presence == Presence::Absent && entry.listeners.is_empty() && entry.hooks.is_empty()
    });
    if unused {
        targets.remove(remote);
    }
}

fn remove_slot(map: &mut HashMap<String, Vec<Slot>>, handle: ListenerHandle) -> bool {
    let mut removed = false;
    map.retain(|_, slots| {
        let before = slots.len();
        slots.retain(|slot| slot.id != handle);
        removed |= slots.len() != before;
        !slots.is_empty()
    });
    removed
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::encode_delivery;
    use crate::transport::{local, Frame};

    /// An addressing layer whose "relay" end is driven by the test
    fn detached(encoding: AddressEncoding) -> (Addressing, crate::transport::Link) {
        let (link, relay_end) = local::pair();
        let (errors, _) = mpsc::unbounded_channel();
        let (_socket, addressing) =
            Socket::spawn_with("me", link, |socket| Addressing::attach(socket, "me", encoding, errors));
        (addressing, relay_end)
    }

    fn deliver(relay_end: &crate::transport::Link, encoding: AddressEncoding, from: &str, event: &str) {
        let (event, args) = encode_delivery(encoding, from, event, vec![Value::Int(1)]);
        relay_end
            .send_frame(Frame::Event {
                event,
                args,
                ack: None,
            })
            .expect("Failed to deliver");
    }

    #[tokio::test]
    async fn test_sender_filter() {
        let (addressing, relay_end) = detached(AddressEncoding::LeadingArg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx_any = tx.clone();
        addressing.from("bob").on("msg", move |incoming| {
            let _ = tx.send(format!("from-bob:{}", incoming.from));
        });
        addressing.on_any("msg", move |incoming| {
            let _ = tx_any.send(format!("any:{}", incoming.from));
        });

        deliver(&relay_end, AddressEncoding::LeadingArg, "carol", "msg");
        deliver(&relay_end, AddressEncoding::LeadingArg, "bob", "msg");

        assert_eq!(rx.recv().await.unwrap(), "any:carol");
        assert_eq!(rx.recv().await.unwrap(), "from-bob:bob");
        assert_eq!(rx.recv().await.unwrap(), "any:bob");
    }

    #[tokio::test]
    async fn test_event_suffix_dispatch() {
        let (addressing, relay_end) = detached(AddressEncoding::EventSuffix);
        let (tx, mut rx) = mpsc::unbounded_channel();
        addressing.from("bob").on("msg", move |incoming| {
            let _ = tx.send(incoming.args);
        });

        deliver(&relay_end, AddressEncoding::EventSuffix, "bob", "msg");
        assert_eq!(rx.recv().await.unwrap(), vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_once_fires_once() {
        let (addressing, relay_end) = detached(AddressEncoding::LeadingArg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx2 = tx.clone();
        addressing.from("bob").once("msg", move |_| {
            let _ = tx.send("once");
        });
        addressing.from("bob").on("end", move |_| {
            let _ = tx2.send("end");
        });
        assert_eq!(addressing.listener_count_from("bob"), 2);

        deliver(&relay_end, AddressEncoding::LeadingArg, "bob", "msg");
        deliver(&relay_end, AddressEncoding::LeadingArg, "bob", "msg");
        deliver(&relay_end, AddressEncoding::LeadingArg, "bob", "end");

        assert_eq!(rx.recv().await.unwrap(), "once");
        assert_eq!(rx.recv().await.unwrap(), "end");
        assert_eq!(addressing.listener_count_from("bob"), 1);
    }

    #[tokio::test]
    async fn test_peer_gone_drops_only_that_remote() {
        let (addressing, relay_end) = detached(AddressEncoding::LeadingArg);
        for _ in 0..3 {
            addressing.from("bob").on("msg", |_| {});
        }
        addressing.from("carol").on("msg", |_| {});

        let (tx, mut rx) = mpsc::unbounded_channel();
        addressing.on_peer_gone("bob", move |peer| {
            let _ = tx.send(peer.to_string());
        });

        relay_end
            .send_frame(Frame::Event {
                event: events::PEER_DISCONNECTED.to_string(),
                args: vec![Value::from("bob")],
                ack: None,
            })
            .expect("Failed to notify");

        assert_eq!(rx.recv().await.unwrap(), "bob");
        assert_eq!(addressing.listener_count_from("bob"), 0);
        assert_eq!(addressing.listener_count_from("carol"), 1);
        assert_eq!(addressing.targets(), vec!["carol".to_string()]);
    }

    /// Answer the next watch request with `present`, skipping other frames
    async fn answer_watch(relay_end: &mut crate::transport::Link, present: bool) -> String {
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), relay_end.recv_frame())
                .await
                .expect("Timed out waiting for watch")
                .expect("Failed to receive frame");
            if let Frame::Event { event, args, ack: Some(id) } = frame {
                if event == events::WATCH {
                    relay_end
                        .send_frame(Frame::Ack { id, args: vec![Value::Bool(present)] })
                        .expect("Failed to answer watch");
                    return args[0].as_str().unwrap_or_default().to_string();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_absent_peer_keeps_listeners_but_runs_hooks() {
        let (addressing, mut relay_end) = detached(AddressEncoding::LeadingArg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hits = tx.clone();
        addressing.from("bob").on("msg", move |incoming| {
            let _ = hits.send(format!("msg:{}", incoming.from));
        });
        assert_eq!(answer_watch(&mut relay_end, false).await, "bob");

        addressing.on_peer_gone("bob", move |peer| {
            let _ = tx.send(format!("gone:{}", peer));
        });
        assert_eq!(answer_watch(&mut relay_end, false).await, "bob");
        assert_eq!(rx.recv().await.expect("Failed to receive"), "gone:bob");
        assert_eq!(addressing.listener_count_from("bob"), 1);

        // Bob shows up: his message is delivered and his presence asked again
        deliver(&relay_end, AddressEncoding::LeadingArg, "bob", "msg");
        assert_eq!(rx.recv().await.expect("Failed to receive"), "msg:bob");
        assert_eq!(answer_watch(&mut relay_end, true).await, "bob");

        relay_end
            .send_frame(Frame::Event {
                event: events::PEER_DISCONNECTED.to_string(),
                args: vec![Value::from("bob")],
                ack: None,
            })
            .expect("Failed to notify");
        let addressing_check = addressing.clone();
        tokio::time::timeout(std::time::Duration::from_secs(5), async move {
            while addressing_check.listener_count_from("bob") != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("Timed out waiting for release");
        assert!(addressing.targets().is_empty());
    }

    #[tokio::test]
    async fn test_unused_absent_entry_is_forgotten() {
        let (addressing, mut relay_end) = detached(AddressEncoding::LeadingArg);
        let handle = addressing.from("ghost").on("msg", |_| {});
        answer_watch(&mut relay_end, false).await;
        // The answer is dispatched by the reader task
        while addressing.inner.table.lock().targets.get("ghost").map(|e| e.presence)
            != Some(Presence::Absent)
        {
            tokio::task::yield_now().await;
        }
        assert_eq!(addressing.targets(), vec!["ghost".to_string()]);

        assert!(addressing.off(handle));
        assert!(addressing.targets().is_empty());
    }

    #[tokio::test]
    async fn test_off_and_remove_target() {
        let (addressing, _relay_end) = detached(AddressEncoding::LeadingArg);
        let first = addressing.from("bob").on("a", |_| {});
        addressing.from("bob").on("b", |_| {});
        let any = addressing.on_any("a", |_| {});

        assert!(addressing.off(first));
        assert!(!addressing.off(first));
        assert!(addressing.off(any));
        assert_eq!(addressing.any_listener_count(), 0);

        assert_eq!(addressing.remove_target("bob"), 1);
        assert!(addressing.targets().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_events_rejected() {
        let (addressing, _relay_end) = detached(AddressEncoding::LeadingArg);
        assert!(matches!(
            addressing.emit_to("bob", "p2p-session-register", vec![]),
            Err(P2pError::ReservedEvent(_))
        ));
        assert!(addressing.emit_to("bob", "hello", vec![]).is_ok());
    }

    #[tokio::test]
    async fn test_local_disconnect_runs_hooks() {
        let (addressing, relay_end) = detached(AddressEncoding::LeadingArg);
        let (tx, mut rx) = mpsc::unbounded_channel();
        addressing.on_peer_gone("bob", move |peer| {
            let _ = tx.send(peer.to_string());
        });
        drop(relay_end);

        assert_eq!(rx.recv().await.unwrap(), "bob");
        assert!(addressing.targets().is_empty());
    }
}
