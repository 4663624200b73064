use digitbot_core::{Contract, StreamKey, Tick};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Typed delivery channel for one push stream.
pub enum PushSender {
    Ticks(mpsc::Sender<Tick>),
    Contract(mpsc::Sender<Contract>),
}

struct SubscriptionEntry {
    sender: PushSender,
    /// The wire request to re-issue when replaying after a reconnect.
    request: Value,
    /// Broker-assigned stream id, once the subscribe is acknowledged.
    broker_id: Option<String>,
}

/// Maps each push-stream key to its delivery channel.
///
/// At most one entry per key: a second subscribe for the same key replaces
/// the channel without issuing a duplicate wire request. Entries survive
/// disconnects so the supervisor can replay them.
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<StreamKey, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<StreamKey, SubscriptionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register or replace the channel for `key`. Returns true when the key
    /// is new and a wire subscribe must be issued.
    pub fn insert(&self, key: StreamKey, sender: PushSender, request: Value) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(&key) {
            Some(entry) => {
                debug!(key = %key, "Replacing subscriber for existing stream");
                entry.sender = sender;
                false
            }
            None => {
                entries.insert(
                    key,
                    SubscriptionEntry {
                        sender,
                        request,
                        broker_id: None,
                    },
                );
                true
            }
        }
    }

    pub fn set_broker_id(&self, key: &StreamKey, id: String) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.broker_id = Some(id);
        }
    }

    /// Remove the entry, returning the broker-side id (if acknowledged) so
    /// the caller can ask the broker to cancel the stream.
    pub fn remove(&self, key: &StreamKey) -> Option<String> {
        self.entries().remove(key).and_then(|e| e.broker_id)
    }

    /// Subscribe requests for every live key, for replay after a reconnect.
    pub fn replay_requests(&self) -> Vec<(StreamKey, Value)> {
        self.entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.request.clone()))
            .collect()
    }

    /// Deliver a tick to its subscriber. Lagging subscribers lose the push
    /// rather than stalling the read loop; a closed channel prunes the entry.
    pub fn dispatch_tick(&self, key: &StreamKey, tick: Tick) {
        let mut entries = self.entries();
        let prune = match entries.get(key) {
            Some(SubscriptionEntry {
                sender: PushSender::Ticks(tx),
                ..
            }) => match tx.try_send(tick) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(key = %key, "Subscriber lagging, dropping tick");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            Some(_) => {
                warn!(key = %key, "Tick push keyed to a contract stream, dropping");
                false
            }
            None => {
                debug!(key = %key, "Dropping push with no subscriber");
                false
            }
        };
        if prune {
            debug!(key = %key, "Subscriber gone, pruning stream");
            entries.remove(key);
        }
    }

    /// Deliver a contract update to its subscriber.
    pub fn dispatch_contract(&self, key: &StreamKey, contract: Contract) {
        let mut entries = self.entries();
        let prune = match entries.get(key) {
            Some(SubscriptionEntry {
                sender: PushSender::Contract(tx),
                ..
            }) => match tx.try_send(contract) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(key = %key, "Subscriber lagging, dropping contract update");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            Some(_) => {
                warn!(key = %key, "Contract push keyed to a tick stream, dropping");
                false
            }
            None => {
                debug!(key = %key, "Dropping push with no subscriber");
                false
            }
        };
        if prune {
            debug!(key = %key, "Subscriber gone, pruning stream");
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
