//! Session: one exclusive, mutually negotiated relationship with a remote peer
//!
//! ```text
//! UNREGISTERED --register(target)--> PENDING --accepted--> ACTIVE
//!      ^                               |                     |
//!      +-------- refused/unreachable --+                     |
//!      +------------- unregister / either side disconnects --+
//! ```
//!
//! A peer accepts a request only while its own session is UNREGISTERED, so the
//! first request wins. Every transition bumps a generation counter; late
//! replies for an older generation are discarded, and a late acceptance is
//! handed back to the remote so it does not keep a one-sided session.

use super::addressing::{Addressing, HookId, Incoming, ListenerHandle};
use super::protocol::{self as p2p, SESSION_DISCONNECT, SESSION_REGISTER, SESSION_UNREGISTER};
use crate::error::P2pError;
use crate::transport::{TransportError, Value};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Pending,
    Active,
}

/// Published on every transition into or out of ACTIVE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered { peer: String },
    Unregistered { peer: String, reason: String },
}

type AcceptFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct Slot {
    state: SessionState,
    remote: Option<String>,
    generation: u64,
    hook: Option<HookId>,
}

struct SessionInner {
    addressing: Addressing,
    unregister_timeout: Duration,
    slot: Mutex<Slot>,
    events: broadcast::Sender<SessionEvent>,
    accept_filter: Mutex<Option<AcceptFilter>>,
}

/// The local peer's session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn attach(addressing: &Addressing, unregister_timeout: Duration) -> Session {
        let (events, _) = broadcast::channel(16);
        let session = Session {
            inner: Arc::new(SessionInner {
                addressing: addressing.clone(),
                unregister_timeout,
                slot: Mutex::new(Slot {
                    state: SessionState::Unregistered,
                    remote: None,
                    generation: 0,
                    hook: None,
                }),
                events,
                accept_filter: Mutex::new(None),
            }),
        };

        let this = session.clone();
        addressing.listen_any(
            SESSION_REGISTER,
            move |incoming| this.on_register_request(incoming),
            false,
            true,
        );
        let this = session.clone();
        addressing.listen_any(
            SESSION_UNREGISTER,
            move |mut incoming| {
                this.end_if_peer(&incoming.from, "unregistered by peer");
                incoming.reply(vec![Value::Bool(true)]);
            },
            false,
            true,
        );
        let this = session.clone();
        addressing.listen_any(
            SESSION_DISCONNECT,
            move |incoming| this.end_if_peer(&incoming.from, "peer disconnecting"),
            false,
            true,
        );

        session
    }

    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    /// Remote peer of a PENDING or ACTIVE session
    pub fn remote(&self) -> Option<String> {
        self.inner.slot.lock().remote.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Receive [`SessionEvent`]s from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Refuse incoming requests for which `filter` returns false. Requests
    /// that arrive while a session exists are refused regardless.
    pub fn set_accept_filter<F>(&self, filter: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.inner.accept_filter.lock() = Some(Arc::new(filter));
    }

    /// Open a session with `target`.
    ///
    /// Fails with `RegistrationConflict` before anything is sent if `target`
    /// is our own id or a session already exists. Dropping the returned future
    /// cancels the attempt.
    pub async fn register(&self, target: &str) -> Result<(), P2pError> {
        let generation = {
            let mut slot = self.inner.slot.lock();
            if target == self.inner.addressing.local_id() {
                return Err(P2pError::RegistrationConflict(
                    "cannot open a session with ourselves".to_string(),
                ));
            }
            if slot.state != SessionState::Unregistered {
                return Err(P2pError::RegistrationConflict(format!(
                    "session is {:?} with {}",
                    slot.state,
                    slot.remote.as_deref().unwrap_or("?")
                )));
            }
            slot.state = SessionState::Pending;
            slot.remote = Some(target.to_string());
            slot.generation += 1;
            slot.generation
        };
        debug!("requesting session with {}", target);

        let mut guard = PendingGuard {
            session: self.clone(),
            generation,
            armed: true,
        };

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let peer = target.to_string();
        self.inner
            .addressing
            .request_with(target, SESSION_REGISTER, vec![], move |result| {
                let _ = tx.send(this.complete_register(&peer, generation, result));
            });

        let outcome = rx
            .await
            .unwrap_or(Err(P2pError::Transport(TransportError::Disconnected)));
        guard.armed = false;
        outcome
    }

    /// End the session. The remote is told and given `unregister_timeout` to
    /// acknowledge; after that we proceed regardless.
    pub async fn unregister(&self) -> Result<(), P2pError> {
        let (peer, generation, state) = {
            let slot = self.inner.slot.lock();
            match (&slot.remote, slot.state) {
                (Some(peer), state) if state != SessionState::Unregistered => {
                    (peer.clone(), slot.generation, state)
                }
                _ => return Err(P2pError::NotRegistered),
            }
        };

        if state == SessionState::Pending {
            self.teardown(generation, "cancelled");
            return Ok(());
        }

        let ack = self.inner.addressing.request(&peer, SESSION_UNREGISTER, vec![]);
        match tokio::time::timeout(self.inner.unregister_timeout, ack).await {
            Ok(Ok(_)) => debug!("{} acknowledged unregister", peer),
            Ok(Err(e)) => debug!("unregister not acknowledged by {}: {}", peer, e),
            Err(_) => warn!(
                "{} did not acknowledge unregister within {:?}; proceeding",
                peer, self.inner.unregister_timeout
            ),
        }
        self.teardown(generation, "unregistered");
        Ok(())
    }

    /// Send `event` to the session peer
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), P2pError> {
        let peer = self.active_peer()?;
        self.inner.addressing.emit_to(&peer, event, args)
    }

    /// Send `event` to the session peer and wait for its acknowledgement
    pub async fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<Vec<Value>, P2pError> {
        let peer = self.active_peer()?;
        self.inner.addressing.emit_to_with_ack(&peer, event, args).await
    }

    /// Listen for `event` from whichever peer the session is active with
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(Incoming) + Send + Sync + 'static,
    {
        let this = self.clone();
        self.inner.addressing.listen_any(
            event,
            move |incoming| {
                if this.is_session_peer(&incoming.from) {
                    handler(incoming);
                }
            },
            false,
            false,
        )
    }

    pub fn off(&self, handle: ListenerHandle) -> bool {
        self.inner.addressing.off(handle)
    }

    /// Peer of the ACTIVE session
    pub(crate) fn active_peer(&self) -> Result<String, P2pError> {
        let slot = self.inner.slot.lock();
        match (&slot.remote, slot.state) {
            (Some(peer), SessionState::Active) => Ok(peer.clone()),
            _ => Err(P2pError::NotRegistered),
        }
    }

    /// Tell the session peer we are going away
    pub(crate) fn notify_disconnect(&self) {
        if let Ok(peer) = self.active_peer() {
            let _ = self.inner.addressing.send(&peer, SESSION_DISCONNECT, vec![]);
        }
    }

    fn is_session_peer(&self, peer: &str) -> bool {
        let slot = self.inner.slot.lock();
        slot.state == SessionState::Active && slot.remote.as_deref() == Some(peer)
    }

    /// Runs in the reader task when the remote answers our request
    fn complete_register(
        &self,
        peer: &str,
        generation: u64,
        result: Result<Vec<Value>, P2pError>,
    ) -> Result<(), P2pError> {
        let accepted = matches!(&result, Ok(args) if p2p::accepted(args));
        let current = {
            let mut slot = self.inner.slot.lock();
            let current = slot.generation == generation && slot.state == SessionState::Pending;
            if current {
                if accepted {
                    slot.state = SessionState::Active;
                } else {
                    reset(&mut slot);
                }
            }
            current
        };

        if !current {
            if accepted {
                debug!("late session acceptance from {}; releasing it", peer);
                let _ = self.inner.addressing.send(peer, SESSION_UNREGISTER, vec![]);
            }
            return Err(P2pError::RegistrationRefused(format!(
                "session request to {} was cancelled",
                peer
            )));
        }

        if accepted {
            self.install_hook(peer, generation);
            info!("session with {} established", peer);
            let _ = self.inner.events.send(SessionEvent::Registered {
                peer: peer.to_string(),
            });
            return Ok(());
        }

        match result {
            Ok(_) => Err(P2pError::RegistrationRefused(format!(
                "{} refused the session",
                peer
            ))),
            Err(P2pError::Transport(TransportError::AckDropped)) => Err(
                P2pError::RegistrationRefused(format!("{} is not accepting sessions", peer)),
            ),
            Err(P2pError::TargetUnavailable(reason)) => Err(P2pError::RegistrationRefused(
                format!("{} cannot be reached: {}", peer, reason),
            )),
            Err(e) => Err(e),
        }
    }

    fn on_register_request(&self, mut incoming: Incoming) {
        let from = incoming.from.clone();
        let filter = self.inner.accept_filter.lock().clone();
        let allowed = from != self.inner.addressing.local_id()
            && filter.map_or(true, |filter| filter(&from));

        let generation = if allowed {
            let mut slot = self.inner.slot.lock();
            if slot.state == SessionState::Unregistered {
                slot.state = SessionState::Active;
                slot.remote = Some(from.clone());
                slot.generation += 1;
                Some(slot.generation)
            } else {
                None
            }
        } else {
            None
        };

        match generation {
            Some(generation) => {
                self.install_hook(&from, generation);
                incoming.reply(vec![Value::Bool(true)]);
                info!("accepted session from {}", from);
                let _ = self.inner.events.send(SessionEvent::Registered { peer: from });
            }
            None => {
                debug!("refused session request from {}", from);
                incoming.reply(vec![Value::Bool(false)]);
            }
        }
    }

    /// Tear down when the session peer goes away
    fn install_hook(&self, peer: &str, generation: u64) {
        let this = self.clone();
        let hook = self.inner.addressing.on_peer_gone(peer, move |_| {
            this.teardown(generation, "peer disconnected");
        });
        let stale = {
            let mut slot = self.inner.slot.lock();
            if slot.generation == generation && slot.state == SessionState::Active {
                slot.hook = Some(hook);
                false
            } else {
                true
            }
        };
        if stale {
            self.inner.addressing.remove_hook(peer, hook);
        }
    }

    fn end_if_peer(&self, peer: &str, reason: &str) {
        let generation = {
            let slot = self.inner.slot.lock();
            (slot.state == SessionState::Active && slot.remote.as_deref() == Some(peer))
                .then_some(slot.generation)
        };
        if let Some(generation) = generation {
            self.teardown(generation, reason);
        }
    }

    /// Return to UNREGISTERED if `generation` is still current
    fn teardown(&self, generation: u64, reason: &str) -> bool {
        let (peer, hook, was_active) = {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation || slot.state == SessionState::Unregistered {
                return false;
            }
            let was_active = slot.state == SessionState::Active;
            let hook = slot.hook.take();
            let peer = slot.remote.clone();
            reset(&mut slot);
            (peer, hook, was_active)
        };

        if let (Some(peer), Some(hook)) = (&peer, hook) {
            self.inner.addressing.remove_hook(peer, hook);
        }
        let peer = peer.unwrap_or_default();
        if was_active {
            info!("session with {} ended: {}", peer, reason);
            let _ = self.inner.events.send(SessionEvent::Unregistered {
                peer,
                reason: reason.to_string(),
            });
        } else {
            debug!("session request to {} abandoned: {}", peer, reason);
        }
        true
    }
}

fn reset(slot: &mut Slot) {
    slot.state = SessionState::Unregistered;
    slot.remote = None;
    slot.hook = None;
    slot.generation += 1;
}

/// Cancels a PENDING registration whose future was dropped
struct PendingGuard {
    session: Session,
    generation: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.session.teardown(self.generation, "cancelled");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
