//! Observer registry and publish/subscribe fan-out.
//!
//! The hub is the only owner of the observer map. Transports (the WebSocket
//! handler, tests) register an observer with [`EventHub::connect`] and get
//! back an unbounded receiver of [`Outbound`] frames; delivery order within
//! one observer is the order of sends. A failed send means the transport is
//! gone, and the observer is evicted on the spot.
//!
//! Liveness: each [`EventHub::heartbeat_tick`] first evicts observers whose
//! flag is still cleared from the previous tick, then clears every remaining
//! flag and pings. A pong (protocol-level or an inbound `pong` message) sets
//! the flag again, so a silent observer is gone within two intervals.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{Envelope, HubMessage, Inbound, InboundFrame};
use crate::errors::OrchestratorError;

pub type ObserverId = Uuid;

/// Frames handed to an observer's transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized JSON envelope.
    Text(String),
    /// Liveness probe; the transport turns it into a protocol ping.
    Ping,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct Observer {
    subscriptions: HashSet<String>,
    alive: bool,
    origin: Option<String>,
    connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Snapshot of one observer for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObserverInfo {
    pub id: ObserverId,
    pub subscriptions: Vec<String>,
    pub origin: Option<String>,
    pub connected_at: DateTime<Utc>,
}

pub struct EventHub {
    config: HubConfig,
    observers: Mutex<HashMap<ObserverId, Observer>>,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObserverId, Observer>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a new observer and send it a `welcome` envelope.
    pub fn connect(
        &self,
        origin: Option<String>,
    ) -> Result<(ObserverId, mpsc::UnboundedReceiver<Outbound>), OrchestratorError> {
        let mut observers = self.lock();
        if observers.len() >= self.config.max_connections {
            warn!(
                max = self.config.max_connections,
                ?origin,
                "Rejecting observer, connection limit reached"
            );
            return Err(OrchestratorError::ConnectionLimitExceeded {
                max: self.config.max_connections,
            });
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Observer {
            subscriptions: HashSet::new(),
            alive: true,
            origin: origin.clone(),
            connected_at: Utc::now(),
            tx,
        };
        let welcome = Envelope::new(HubMessage::Welcome {
            connection_id: id.to_string(),
            server_time: observer.connected_at,
        });
        if let Ok(json) = welcome.to_json() {
            let _ = observer.tx.send(Outbound::Text(json));
        }
        observers.insert(id, observer);
        info!(observer = %id, ?origin, total = observers.len(), "Observer connected");
        Ok((id, rx))
    }

    /// Remove an observer. Returns false if it was already gone.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!(observer = %id, "Observer disconnected");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_connected(&self, id: ObserverId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn observers(&self) -> Vec<ObserverInfo> {
        self.lock()
            .iter()
            .map(|(id, o)| ObserverInfo {
                id: *id,
                subscriptions: sorted(&o.subscriptions),
                origin: o.origin.clone(),
                connected_at: o.connected_at,
            })
            .collect()
    }

    pub fn subscriptions(&self, id: ObserverId) -> Option<Vec<String>> {
        self.lock().get(&id).map(|o| sorted(&o.subscriptions))
    }

    /// Deliver one envelope to one observer. Evicts it if the send fails.
    pub fn send(&self, id: ObserverId, envelope: &Envelope) -> bool {
        let Some(json) = serialize(envelope) else {
            return false;
        };
        let mut observers = self.lock();
        let delivered = match observers.get(&id) {
            Some(observer) => observer.tx.send(Outbound::Text(json)).is_ok(),
            None => return false,
        };
        if !delivered {
            evict(&mut observers, &[id], "send failed");
        }
        delivered
    }

    /// Deliver to every observer. Returns how many received it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.fan_out(envelope, |_| true)
    }

    /// Deliver only to observers subscribed to exactly `channel`.
    pub fn broadcast_to_channel(&self, channel: &str, envelope: &Envelope) -> usize {
        self.fan_out(envelope, |o| o.subscriptions.contains(channel))
    }

    /// Convenience wrappers taking a bare message.
    pub fn publish(&self, message: HubMessage) -> usize {
        self.broadcast(&Envelope::new(message))
    }

    pub fn publish_to(&self, channel: &str, message: HubMessage) -> usize {
        self.broadcast_to_channel(channel, &Envelope::new(message))
    }

    fn fan_out(&self, envelope: &Envelope, filter: impl Fn(&Observer) -> bool) -> usize {
        let Some(json) = serialize(envelope) else {
            return 0;
        };
        let mut observers = self.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, observer) in observers.iter().filter(|(_, o)| filter(o)) {
            if observer.tx.send(Outbound::Text(json.clone())).is_ok() {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }
        evict(&mut observers, &failed, "send failed");
        delivered
    }

    /// Record a liveness response from the observer.
    pub fn mark_alive(&self, id: ObserverId) {
        if let Some(observer) = self.lock().get_mut(&id) {
            observer.alive = true;
        }
    }

    /// Handle one inbound text frame from an observer. Anything that cannot
    /// be interpreted is answered with an `error` envelope; the observer
    /// stays connected.
    pub fn handle_text(&self, id: ObserverId, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.handle_inbound(id, frame),
            Err(err) => {
                debug!(observer = %id, code = err.code, "Rejected inbound message: {}", err.message);
                let reply = Envelope::new(HubMessage::error(err.code, err.message))
                    .with_request_id(err.request_id);
                self.send(id, &reply);
            }
        }
    }

    pub fn handle_inbound(&self, id: ObserverId, frame: InboundFrame) {
        let request_id = frame.request_id;
        let reply = {
            let mut observers = self.lock();
            let total = observers.len();
            let Some(observer) = observers.get_mut(&id) else {
                return;
            };
            // Any inbound traffic proves the observer is alive.
            observer.alive = true;
            match frame.message {
                Inbound::Subscribe(channels) => {
                    debug!(observer = %id, ?channels, "Subscribe");
                    observer.subscriptions.extend(channels);
                    None
                }
                Inbound::Unsubscribe(channels) => {
                    debug!(observer = %id, ?channels, "Unsubscribe");
                    for channel in &channels {
                        observer.subscriptions.remove(channel);
                    }
                    None
                }
                Inbound::Pong => Some(HubMessage::Pong),
                Inbound::GetInfo => Some(HubMessage::Info {
                    connection_id: id.to_string(),
                    subscriptions: sorted(&observer.subscriptions),
                    observers: total,
                    connected_at: observer.connected_at,
                }),
            }
        };
        if let Some(message) = reply {
            self.send(id, &Envelope::new(message).with_request_id(request_id));
        }
    }

    /// One liveness cycle. Returns the ids evicted by this tick.
    pub fn heartbeat_tick(&self) -> Vec<ObserverId> {
        let mut observers = self.lock();
        let mut evicted: Vec<ObserverId> = observers
            .iter()
            .filter(|(_, o)| !o.alive)
            .map(|(id, _)| *id)
            .collect();
        evict(&mut observers, &evicted, "missed heartbeat");

        let mut unreachable = Vec::new();
        for (id, observer) in observers.iter_mut() {
            observer.alive = false;
            if observer.tx.send(Outbound::Ping).is_err() {
                unreachable.push(*id);
            }
        }
        evict(&mut observers, &unreachable, "send failed");
        evicted.extend(unreachable);
        evicted
    }

    /// Run [`heartbeat_tick`](Self::heartbeat_tick) every configured interval
    /// until the task is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.heartbeat_interval);
            // Missed ticks must not fire back-to-back: the second would evict
            // observers before they could answer the first ping.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the first
            // real ping fires after one interval.
            interval.tick().await;
            loop {
                interval.tick().await;
                hub.heartbeat_tick();
            }
        })
    }
}

fn serialize(envelope: &Envelope) -> Option<String> {
    match envelope.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize envelope: {}", e);
            None
        }
    }
}

fn evict(observers: &mut HashMap<ObserverId, Observer>, ids: &[ObserverId], reason: &str) {
    for id in ids {
        if observers.remove(id).is_some() {
            info!(observer = %id, reason, "Evicted observer");
        }
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut list: Vec<_> = set.iter().cloned().collect();
    list.sort();
    list
}
