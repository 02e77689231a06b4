//! Topic-based fan-out to live clients.
//!
//! Each connection owns a small bounded channel; the receiving half is the
//! transport handle (the WebSocket writer task drains it). Sends never wait:
//! a full or closed channel counts as a failed send and the client is
//! dropped along with every subscription it held. Clients are expected to
//! reconnect and resubscribe; missed events are not replayed.
//!
//! Connections and the topic index share one `RwLock` so a removed
//! connection can never leave subscriptions behind.

pub mod envelope;
pub mod notify;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::metrics::AppMetrics;

pub use envelope::{ClientMessage, Envelope, PERSONAL_TOPIC};

/// Capacity of each client's outgoing channel.
pub const OUTGOING_BUFFER: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),
}

struct Connection {
    sender: mpsc::Sender<Envelope>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    /// topic -> subscribed client ids, in subscription order
    topics: HashMap<String, Vec<String>>,
}

impl HubState {
    fn remove_client(&mut self, client_id: &str) -> bool {
        let Some(connection) = self.connections.remove(client_id) else {
            return false;
        };
        for topic in connection.topics {
            if let Some(clients) = self.topics.get_mut(&topic) {
                clients.retain(|id| id != client_id);
                if clients.is_empty() {
                    self.topics.remove(&topic);
                }
            }
        }
        true
    }
}

pub struct BroadcastHub {
    state: RwLock<HubState>,
    buffer: usize,
    metrics: Option<Arc<AppMetrics>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_buffer(OUTGOING_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            buffer: buffer.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a client and return the receiver its transport should drain.
    ///
    /// An existing connection with the same id is replaced; its old
    /// subscriptions are dropped with it.
    pub async fn connect(&self, client_id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut state = self.state.write().await;
        if state.remove_client(client_id) {
            tracing::debug!("Client {} reconnected; old connection replaced", client_id);
        }
        state.connections.insert(
            client_id.to_string(),
            Connection {
                sender: tx,
                topics: HashSet::new(),
            },
        );
        self.record_connections(state.connections.len());

        tracing::info!("Client {} connected", client_id);
        rx
    }

    /// Remove a client and all of its subscriptions. Returns `false` when the
    /// client was not connected.
    pub async fn disconnect(&self, client_id: &str) -> bool {
        let mut state = self.state.write().await;
        let removed = state.remove_client(client_id);
        self.record_connections(state.connections.len());

        if removed {
            tracing::info!("Client {} disconnected", client_id);
        }
        removed
    }

    /// Subscribe a connected client to `topic`. Idempotent; returns `true`
    /// when the subscription is new.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> Result<bool, HubError> {
        let mut state = self.state.write().await;
        let connection = state
            .connections
            .get_mut(client_id)
            .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;

        if !connection.topics.insert(topic.to_string()) {
            return Ok(false);
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(client_id.to_string());

        tracing::debug!("Client {} subscribed to {}", client_id, topic);
        Ok(true)
    }

    /// Remove a subscription. Idempotent; returns `true` when one was removed.
    pub async fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        let mut state = self.state.write().await;
        let removed = state
            .connections
            .get_mut(client_id)
            .map(|connection| connection.topics.remove(topic))
            .unwrap_or(false);

        if removed {
            if let Some(clients) = state.topics.get_mut(topic) {
                clients.retain(|id| id != client_id);
                if clients.is_empty() {
                    state.topics.remove(topic);
                }
            }
            tracing::debug!("Client {} unsubscribed from {}", client_id, topic);
        }
        removed
    }

    /// Send `payload` to every subscriber of `topic`. Returns how many
    /// clients accepted it; failing clients are disconnected.
    pub async fn publish(&self, topic: &str, payload: impl Serialize) -> usize {
        self.publish_envelope(Envelope::new(topic, payload)).await
    }

    pub async fn publish_envelope(&self, envelope: Envelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let state = self.state.read().await;
            let Some(clients) = state.topics.get(&envelope.topic) else {
                return 0;
            };

            for client_id in clients {
                let Some(connection) = state.connections.get(client_id) else {
                    continue;
                };
                match connection.sender.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        tracing::warn!(
                            "Dropping client {} on {}: {}",
                            client_id,
                            envelope.topic,
                            err
                        );
                        failed.push((client_id.clone(), connection.sender.clone()));
                    }
                }
            }
        }

        self.record_sends(delivered, failed.len());
        self.drop_failed(failed).await;
        delivered
    }

    /// Send `payload` to one client on the `personal` topic. Returns `false`
    /// when the client is unknown or the send failed (the client is then
    /// disconnected).
    pub async fn send_direct(&self, client_id: &str, payload: impl Serialize) -> bool {
        let envelope = Envelope::personal(payload);

        let sender = {
            let state = self.state.read().await;
            match state.connections.get(client_id) {
                Some(connection) => connection.sender.clone(),
                None => return false,
            }
        };

        match sender.try_send(envelope) {
            Ok(()) => {
                self.record_sends(1, 0);
                true
            }
            Err(err) => {
                tracing::warn!("Dropping client {} on direct send: {}", client_id, err);
                self.record_sends(0, 1);
                self.drop_failed(vec![(client_id.to_string(), sender)]).await;
                false
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.state.read().await.connections.contains_key(client_id)
    }

    /// Subscribers of `topic`, in subscription order.
    pub async fn subscribers(&self, topic: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Every `(client_id, topic)` pair, sorted.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        let state = self.state.read().await;
        let mut pairs: Vec<(String, String)> = state
            .topics
            .iter()
            .flat_map(|(topic, clients)| {
                clients
                    .iter()
                    .map(move |client_id| (client_id.clone(), topic.clone()))
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Remove clients whose send failed, unless they reconnected meanwhile.
    async fn drop_failed(&self, failed: Vec<(String, mpsc::Sender<Envelope>)>) {
        if failed.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        for (client_id, sender) in failed {
            let same_connection = state
                .connections
                .get(&client_id)
                .map(|connection| connection.sender.same_channel(&sender))
                .unwrap_or(false);
            if same_connection {
                state.remove_client(&client_id);
            }
        }
        self.record_connections(state.connections.len());
    }

    fn record_connections(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.hub_connections.set(count as i64);
        }
    }

    fn record_sends(&self, delivered: usize, failed: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.hub_messages_sent_total.inc_by(delivered as f64);
            metrics.hub_send_failures_total.inc_by(failed as f64);
        }
    }
}
