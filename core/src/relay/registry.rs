//! Peer Registry: which peer ids are reachable, and through which connection
//!
//! This is the only state shared between connections. Entries are written by
//! connection lifecycle handlers only. Removal always happens before the
//! peer's disconnect callbacks run, so a callback that resolves the departing
//! id sees it as unavailable.
//!
//! Disconnect callbacks belong to one registration, keyed by connection id,
//! and are detached in the same locked step that removes the entry. A
//! reconnect under the same id never inherits or fires its predecessor's
//! callbacks.

use super::protocol::FROM_SEPARATOR;
use crate::transport::Socket;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

type DisconnectCallback = Box<dyn FnOnce(&str) + Send>;

/// What to do when a second connection claims a registered peer id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// First registrant wins; the newcomer is refused
    #[default]
    RefuseNew,
    /// The newcomer replaces the incumbent, which is disconnected
    EvictIncumbent,
}

impl OverwritePolicy {
    /// Map the `client_overwrite` flag onto a policy
    pub fn from_client_overwrite(client_overwrite: bool) -> Self {
        if client_overwrite {
            OverwritePolicy::EvictIncumbent
        } else {
            OverwritePolicy::RefuseNew
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrently registered peers
    pub max_connections: usize,
    /// Conflict policy for duplicate ids
    pub overwrite: OverwritePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            overwrite: OverwritePolicy::RefuseNew,
        }
    }
}

/// A live registration
#[derive(Debug, Clone)]
pub struct PeerRegistryEntry {
    pub peer_id: String,
    pub connection: Socket,
    /// Unix timestamp of registration
    pub registered_at: u64,
}

/// Statistics about registry operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Currently registered peers
    pub connections_active: usize,
    /// Successful registrations since start
    pub registrations_total: u64,
    /// Registrations refused because the id was taken
    pub registrations_refused: u64,
    /// Incumbents replaced under `EvictIncumbent`
    pub evictions: u64,
}

/// Registry error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer id {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Invalid peer id {0:?}")]
    InvalidPeerId(String),
}

/// The peer registry
pub struct PeerRegistry {
    config: RegistryConfig,
    entries: RwLock<HashMap<String, PeerRegistryEntry>>,
    /// Keyed by connection id; always locked after `entries`
    callbacks: Mutex<HashMap<u64, Vec<DisconnectCallback>>>,
    stats: RwLock<RegistryStats>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Check that an id can be used for routing
    pub fn validate_peer_id(peer_id: &str) -> Result<(), RegistryError> {
        if peer_id.is_empty()
            || peer_id.contains(FROM_SEPARATOR)
            || peer_id.chars().any(char::is_control)
        {
            return Err(RegistryError::InvalidPeerId(peer_id.to_string()));
        }
        Ok(())
    }

    /// Register a connection under `peer_id`.
    ///
    /// Under `EvictIncumbent` the previous connection is disconnected and the
    /// previous registration's disconnect callbacks run; it is returned so the
    /// caller can log it.
    pub fn register(
        &self,
        peer_id: &str,
        connection: Socket,
    ) -> Result<Option<Socket>, RegistryError> {
        self.register_with(peer_id, connection, || {})
    }

    /// Like [`register`](Self::register), running `admitted` while the entry
    /// is being published. Nothing can resolve the new connection before
    /// `admitted` returns, so it can queue frames that must precede any
    /// forwarded traffic.
    pub fn register_with<F>(
        &self,
        peer_id: &str,
        connection: Socket,
        admitted: F,
    ) -> Result<Option<Socket>, RegistryError>
    where
        F: FnOnce(),
    {
        Self::validate_peer_id(peer_id)?;

        let (evicted, orphaned) = {
            let mut entries = self.entries.write();
            let mut stats = self.stats.write();

            let evicted = match entries.get(peer_id) {
                Some(_) if self.config.overwrite == OverwritePolicy::RefuseNew => {
                    stats.registrations_refused += 1;
                    return Err(RegistryError::AlreadyRegistered(peer_id.to_string()));
                }
                Some(_) => {
                    stats.evictions += 1;
                    entries.remove(peer_id).map(|e| e.connection)
                }
                None => {
                    if entries.len() >= self.config.max_connections {
                        return Err(RegistryError::ConnectionLimitExceeded);
                    }
                    None
                }
            };

            entries.insert(
                peer_id.to_string(),
                PeerRegistryEntry {
                    peer_id: peer_id.to_string(),
                    connection,
                    registered_at: now_secs(),
                },
            );
            stats.registrations_total += 1;
            stats.connections_active = entries.len();
            admitted();
            let orphaned = evicted
                .as_ref()
                .map(|old| self.detach_callbacks(old.id()))
                .unwrap_or_default();
            (evicted, orphaned)
        };

        if let Some(old) = &evicted {
            info!("peer {} superseded; evicting connection {}", peer_id, old.id());
            fire(peer_id, orphaned);
            old.disconnect("superseded by a newer connection");
        } else {
            debug!("peer {} registered", peer_id);
        }
        Ok(evicted)
    }

    /// Remove whatever connection is registered under `peer_id`
    pub fn unregister(&self, peer_id: &str) -> Option<Socket> {
        let (removed, callbacks) = {
            let mut entries = self.entries.write();
            let removed = entries.remove(peer_id);
            self.stats.write().connections_active = entries.len();
            let callbacks = removed
                .as_ref()
                .map(|e| self.detach_callbacks(e.connection.id()))
                .unwrap_or_default();
            (removed, callbacks)
        };
        if removed.is_some() {
            debug!("peer {} unregistered", peer_id);
            fire(peer_id, callbacks);
        }
        removed.map(|e| e.connection)
    }

    /// Remove `peer_id` only if it is still bound to `connection_id`.
    ///
    /// A superseded connection going away must not take its replacement's
    /// registration with it.
    pub fn remove_connection(&self, peer_id: &str, connection_id: u64) -> bool {
        let callbacks = {
            let mut entries = self.entries.write();
            let matches = entries
                .get(peer_id)
                .map_or(false, |e| e.connection.id() == connection_id);
            if !matches {
                return false;
            }
            entries.remove(peer_id);
            self.stats.write().connections_active = entries.len();
            self.detach_callbacks(connection_id)
        };
        debug!("peer {} disconnected (connection {})", peer_id, connection_id);
        fire(peer_id, callbacks);
        true
    }

    /// Look up the live connection for a peer
    pub fn resolve(&self, peer_id: &str) -> Option<Socket> {
        self.entries
            .read()
            .get(peer_id)
            .map(|e| e.connection.clone())
    }

    pub fn entry(&self, peer_id: &str) -> Option<PeerRegistryEntry> {
        self.entries.read().get(peer_id).cloned()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.entries.read().contains_key(peer_id)
    }

    /// Registered peer ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run `callback` once the current registration of `peer_id` ends.
    /// Runs immediately if `peer_id` is not registered.
    pub fn on_disconnect<F>(&self, peer_id: &str, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.attach(peer_id, None, Box::new(callback));
    }

    /// Run `callback` once connection `connection_id` stops being the
    /// registration of `peer_id`. Runs immediately if it already has.
    pub fn on_connection_removed<F>(&self, peer_id: &str, connection_id: u64, callback: F)
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.attach(peer_id, Some(connection_id), Box::new(callback));
    }

    /// Get current registry statistics
    pub fn get_stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    fn attach(&self, peer_id: &str, connection_id: Option<u64>, callback: DisconnectCallback) {
        {
            // Removal detaches under the write lock, so holding the read lock
            // here means the registration cannot end between check and push
            let entries = self.entries.read();
            let current = entries
                .get(peer_id)
                .map(|e| e.connection.id())
                .filter(|id| connection_id.map_or(true, |wanted| wanted == *id));
            if let Some(id) = current {
                self.callbacks.lock().entry(id).or_default().push(callback);
                return;
            }
        }
        callback(peer_id);
    }

    fn detach_callbacks(&self, connection_id: u64) -> Vec<DisconnectCallback> {
        self.callbacks.lock().remove(&connection_id).unwrap_or_default()
    }
}

fn fire(peer_id: &str, callbacks: Vec<DisconnectCallback>) {
    for callback in callbacks {
        callback(peer_id);
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// TESTS
// ============================================================================
