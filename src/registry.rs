//! Connection registry.
//!
//! Maps a configuration key to at most one live or in-flight connection.
//! Concurrent bootstraps for the same key are deduplicated: the first
//! caller performs the physical connect while every other caller waits on
//! a one-shot broadcast and receives the same resolved handle (or the same
//! error). Reusing a key with a materially different configuration is a
//! configuration conflict.
//!
//! The registry is generic over a [`Connector`] so the dedup, conflict,
//! and invalidation behavior is testable without a broker; the real
//! connector lives in [`crate::connector`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::config::BusConfig;
use crate::error::BusError;

/// Establishes a physical connection for a configuration.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The connection handle this connector produces.
    type Handle: Send + Sync + 'static;

    /// Open a connection for `config`. `generation` identifies the
    /// resulting connection for invalidation purposes.
    async fn connect(&self, config: &BusConfig, generation: u64)
        -> Result<Self::Handle, BusError>;
}

/// A registered connection: the handle, the configuration that created it,
/// and its generation.
#[derive(Debug)]
pub struct ConnectionEntry<H> {
    /// The connector-produced handle.
    pub handle: H,
    /// Configuration the connection was established with.
    pub config: BusConfig,
    /// Monotonic generation, unique per physical connection.
    pub generation: u64,
}

/// Result of a bootstrap: the shared entry, plus whether this caller is
/// the one that physically established it.
#[derive(Debug)]
pub struct Bootstrapped<H> {
    /// The shared connection entry.
    pub entry: Arc<ConnectionEntry<H>>,
    /// True only for the caller that performed the connect. Per-connection
    /// setup (event emission, cache invalidation) keys off this.
    pub fresh: bool,
}

type SharedOutcome<H> = Result<Arc<ConnectionEntry<H>>, BusError>;

enum Slot<H> {
    Ready(Arc<ConnectionEntry<H>>),
    Pending(broadcast::Sender<SharedOutcome<H>>),
}

/// Process-wide connection table, keyed by configuration key.
///
/// Constructor-injected rather than global: create one per application (or
/// per bus) and share it explicitly.
pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    slots: Mutex<HashMap<String, Slot<C::Handle>>>,
    generations: AtomicU64,
}

impl<C: Connector> ConnectionRegistry<C> {
    /// Create an empty registry around a connector.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Borrow the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Return the shared connection for `config.config_key`, establishing
    /// it if needed.
    ///
    /// Exactly one physical connect runs per key at a time, no matter how
    /// many callers race; all of them observe the same outcome.
    pub async fn bootstrap(&self, config: &BusConfig) -> Result<Bootstrapped<C::Handle>, BusError> {
        let pending = {
            let mut slots = self.slots.lock().await;
            match slots.get(&config.config_key) {
                Some(Slot::Ready(entry)) => return reuse(entry.clone(), config),
                Some(Slot::Pending(tx)) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    slots.insert(config.config_key.clone(), Slot::Pending(tx));
                    None
                }
            }
        };

        if let Some(mut outcome) = pending {
            return match outcome.recv().await {
                Ok(Ok(entry)) => reuse(entry, config),
                Ok(Err(error)) => Err(error),
                // The establishing caller went away without resolving.
                Err(_) => Err(BusError::connect("connection bootstrap was aborted")),
            };
        }

        self.establish(config).await
    }

    async fn establish(&self, config: &BusConfig) -> Result<Bootstrapped<C::Handle>, BusError> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            config_key = %config.config_key,
            generation,
            "Establishing broker connection"
        );

        let outcome = self
            .connector
            .connect(config, generation)
            .await
            .map(|handle| {
                Arc::new(ConnectionEntry {
                    handle,
                    config: config.clone(),
                    generation,
                })
            });

        let mut slots = self.slots.lock().await;
        let waiters = match slots.remove(&config.config_key) {
            Some(Slot::Pending(tx)) => Some(tx),
            // A concurrent reset/invalidate removed the pending slot; the
            // waiters it had are gone with it.
            _ => None,
        };
        if let Ok(entry) = &outcome {
            slots.insert(config.config_key.clone(), Slot::Ready(entry.clone()));
        }
        drop(slots);

        if let Some(tx) = waiters {
            let _ = tx.send(outcome.clone());
        }

        outcome.map(|entry| Bootstrapped { entry, fresh: true })
    }

    /// Drop the registered connection for `key`, but only if it still is
    /// the given generation. Returns the removed entry.
    ///
    /// The guard keeps a stale failure notification from clobbering a
    /// connection that was already re-established.
    pub async fn invalidate(
        &self,
        key: &str,
        generation: u64,
    ) -> Option<Arc<ConnectionEntry<C::Handle>>> {
        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(Slot::Ready(entry)) if entry.generation == generation => {
                let entry = entry.clone();
                slots.remove(key);
                Some(entry)
            }
            _ => None,
        }
    }

    /// Remove and return the registered connection for `key`, if any.
    pub async fn take(&self, key: &str) -> Option<Arc<ConnectionEntry<C::Handle>>> {
        let mut slots = self.slots.lock().await;
        match slots.remove(key) {
            Some(Slot::Ready(entry)) => Some(entry),
            Some(pending @ Slot::Pending(_)) => {
                // Leave an in-flight bootstrap alone.
                slots.insert(key.to_string(), pending);
                None
            }
            None => None,
        }
    }

    /// Peek at the registered connection for `key` without removing it.
    pub async fn get(&self, key: &str) -> Option<Arc<ConnectionEntry<C::Handle>>> {
        let slots = self.slots.lock().await;
        match slots.get(key) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// Number of ready connections.
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// True when no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Clear every slot. Intended for tests that need a clean slate.
    pub async fn reset(&self) {
        let mut slots = self.slots.lock().await;
        slots.clear();
    }
}

fn reuse<H>(
    entry: Arc<ConnectionEntry<H>>,
    config: &BusConfig,
) -> Result<Bootstrapped<H>, BusError> {
    if entry.config != *config {
        return Err(BusError::ConfigConflict {
            key: config.config_key.clone(),
            existing: format!("{:?}", entry.config),
            requested: format!("{config:?}"),
        });
    }
    Ok(Bootstrapped {
        entry,
        fresh: false,
    })
}
