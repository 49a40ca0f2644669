//! Change notifications for connected clients.
//!
//! A [`NotificationHub`] tracks which connections watch which projection
//! entities. Publishing goes through a [`Relay`] so every hub sharing the
//! relay (one per process, typically) delivers the message to its own
//! local members of the group `projection:<type>:<entity>`.
//!
//! Delivery is best-effort: a lagging relay receiver skips messages and a
//! closed connection is dropped from its groups.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::error::BackplaneError;
use crate::event::Position;

/// A projection entity reached a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChanged {
    /// Projection type name.
    pub projection_type: String,
    /// Projection entity id.
    pub entity_id: String,
    /// New version.
    pub version: Position,
}

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one subscription made through a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Group name for one projection entity.
pub fn group_name(projection_type: &str, entity_id: &str) -> String {
    format!("projection:{projection_type}:{entity_id}")
}

/// Local connection membership and delivery.
#[async_trait]
pub trait ConnectionGroups: Send + Sync + fmt::Debug {
    /// Add `connection` to `group`.
    async fn add_to_group(&self, connection: ConnectionId, group: &str);

    /// Remove `connection` from `group`.
    async fn remove_from_group(&self, connection: ConnectionId, group: &str);

    /// Deliver `message` to every member of `group`, returning how many
    /// connections accepted it.
    async fn send_to_group(&self, group: &str, message: &VersionChanged) -> usize;
}

/// Cross-process fan-out of notifications.
#[async_trait]
pub trait Relay: Send + Sync + fmt::Debug {
    /// Publish to every subscribed hub.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::RelayClosed`] if nothing is listening.
    async fn publish(&self, message: VersionChanged) -> Result<(), BackplaneError>;

    /// A receiver for messages published from now on.
    fn subscribe(&self) -> broadcast::Receiver<VersionChanged>;
}

/// In-process [`Relay`] over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastRelay {
    sender: broadcast::Sender<VersionChanged>,
}

impl BroadcastRelay {
    /// Create a relay buffering up to `capacity` messages per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Relay for BroadcastRelay {
    async fn publish(&self, message: VersionChanged) -> Result<(), BackplaneError> {
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|_| BackplaneError::RelayClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<VersionChanged> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Default)]
struct GroupTable {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<VersionChanged>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
}

/// In-process [`ConnectionGroups`] backed by unbounded channels.
#[derive(Debug, Clone, Default)]
pub struct LocalGroups {
    table: Arc<RwLock<GroupTable>>,
}

impl LocalGroups {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its id and message stream.
    pub fn connect(&self) -> (ConnectionId, UnboundedReceiverStream<VersionChanged>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.connections.insert(id, tx);
        (id, UnboundedReceiverStream::new(rx))
    }

    /// Forget a connection and all its memberships.
    pub fn remove_connection(&self, connection: ConnectionId) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.connections.remove(&connection);
        table.groups.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    /// Number of members in `group`.
    pub fn member_count(&self, group: &str) -> usize {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .get(group)
            .map_or(0, HashSet::len)
    }
}

#[async_trait]
impl ConnectionGroups for LocalGroups {
    async fn add_to_group(&self, connection: ConnectionId, group: &str) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(connection);
    }

    async fn remove_from_group(&self, connection: ConnectionId, group: &str) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = table.groups.get_mut(group) {
            members.remove(&connection);
            if members.is_empty() {
                table.groups.remove(group);
            }
        }
    }

    async fn send_to_group(&self, group: &str, message: &VersionChanged) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            let Some(members) = table.groups.get(group) else {
                return 0;
            };
            for member in members {
                match table.connections.get(member) {
                    Some(tx) if tx.send(message.clone()).is_ok() => delivered += 1,
                    _ => closed.push(*member),
                }
            }
        }
        for connection in closed {
            tracing::debug!(connection = %connection, "dropping closed connection");
            self.remove_connection(connection);
        }
        delivered
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    connection: ConnectionId,
    group: String,
}

/// Aborts the relay loop when the last hub clone is dropped.
#[derive(Debug)]
struct RelayTask(JoinHandle<()>);

impl Drop for RelayTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Subscription bookkeeping plus the relay loop for one process.
///
/// Cheap to clone; clones share subscriptions and the relay loop.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    groups: Arc<dyn ConnectionGroups>,
    relay: Arc<dyn Relay>,
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
    _relay_task: Arc<RelayTask>,
}

impl NotificationHub {
    /// Create a hub and start delivering relayed messages to `groups`.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(groups: Arc<dyn ConnectionGroups>, relay: Arc<dyn Relay>) -> Self {
        let receiver = relay.subscribe();
        let task = tokio::spawn(relay_loop(Arc::clone(&groups), receiver));
        Self {
            groups,
            relay,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            _relay_task: Arc::new(RelayTask(task)),
        }
    }

    /// Watch one projection entity on behalf of `connection`.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        projection_type: &str,
        entity_id: &str,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let group = group_name(projection_type, entity_id);
        self.groups.add_to_group(connection, &group).await;
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Subscription { connection, group });
        id
    }

    /// Cancel one subscription. Returns `false` if it was unknown.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let (removed, still_member) = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
            let Some(removed) = subs.remove(&subscription) else {
                return false;
            };
            let still_member = subs
                .values()
                .any(|s| s.connection == removed.connection && s.group == removed.group);
            (removed, still_member)
        };
        if !still_member {
            self.groups
                .remove_from_group(removed.connection, &removed.group)
                .await;
        }
        true
    }

    /// Cancel every subscription of `connection`, returning how many
    /// there were.
    pub async fn disconnect(&self, connection: ConnectionId) -> usize {
        let removed: Vec<Subscription> = {
            let mut subs = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<SubscriptionId> = subs
                .iter()
                .filter(|(_, s)| s.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| subs.remove(id)).collect()
        };
        let groups: HashSet<&str> = removed.iter().map(|s| s.group.as_str()).collect();
        for group in groups {
            self.groups.remove_from_group(connection, group).await;
        }
        tracing::debug!(connection = %connection, removed = removed.len(), "connection disconnected");
        removed.len()
    }

    /// Announce a new version of one projection entity.
    ///
    /// # Errors
    ///
    /// [`BackplaneError::RelayClosed`] if the relay has no listeners.
    pub async fn publish(
        &self,
        projection_type: &str,
        entity_id: &str,
        version: Position,
    ) -> Result<(), BackplaneError> {
        self.relay
            .publish(VersionChanged {
                projection_type: projection_type.to_string(),
                entity_id: entity_id.to_string(),
                version,
            })
            .await
    }

    /// Number of live subscriptions held by this hub.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

async fn relay_loop(
    groups: Arc<dyn ConnectionGroups>,
    mut receiver: broadcast::Receiver<VersionChanged>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let group = group_name(&message.projection_type, &message.entity_id);
                let delivered = groups.send_to_group(&group, &message).await;
                tracing::debug!(group = %group, version = %message.version, delivered, "notification relayed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification relay lagged; continuing");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
