use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infra::lock::{rw_read, rw_write};
use crate::domain::events::LivePushMessage;
use crate::domain::types::UserId;
use crate::infra::telemetry::{METRIC_CONNECTIONS, METRIC_PUSH};

const SOURCE: &str = "realtime::registry";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("connection closed")]
    Closed,
    #[error("push timed out after {0:?}")]
    Timeout(Duration),
    #[error("message could not be encoded: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Write half of one live client connection.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn send(&self, payload: String) -> Result<(), PushError>;
}

/// Identifies one registration so a late teardown cannot remove its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    NotConnected,
}

struct Registered {
    id: ConnectionId,
    channel: Arc<dyn PushChannel>,
}

/// At most one live channel per user; the latest registration wins.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, Registered>>,
    next_id: AtomicU64,
    push_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(push_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            push_timeout,
        }
    }

    pub fn register(&self, user_id: UserId, channel: Arc<dyn PushChannel>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (replaced, len) = {
            let mut connections = rw_write(&self.connections, SOURCE, "register");
            let replaced = connections.insert(user_id, Registered { id, channel });
            (replaced.map(|old| old.id), connections.len())
        };
        gauge!(METRIC_CONNECTIONS).set(len as f64);

        match replaced {
            Some(old) => info!(%user_id, connection = %id, replaced = %old, "Connection replaced"),
            None => info!(%user_id, connection = %id, "Connection registered"),
        }
        id
    }

    /// Removes whatever connection `user_id` currently has.
    pub fn unregister(&self, user_id: UserId) -> bool {
        let (removed, len) = {
            let mut connections = rw_write(&self.connections, SOURCE, "unregister");
            let removed = connections.remove(&user_id).is_some();
            (removed, connections.len())
        };
        if removed {
            gauge!(METRIC_CONNECTIONS).set(len as f64);
            info!(%user_id, "Connection unregistered");
        }
        removed
    }

    /// Removes the entry only if it still belongs to `id`.
    pub fn release(&self, user_id: UserId, id: ConnectionId) -> bool {
        let (removed, len) = {
            let mut connections = rw_write(&self.connections, SOURCE, "release");
            let owned = connections
                .get(&user_id)
                .is_some_and(|registered| registered.id == id);
            if owned {
                connections.remove(&user_id);
            }
            (owned, connections.len())
        };
        if removed {
            gauge!(METRIC_CONNECTIONS).set(len as f64);
            info!(%user_id, connection = %id, "Connection released");
        } else {
            debug!(%user_id, connection = %id, "Stale connection release ignored");
        }
        removed
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        rw_read(&self.connections, SOURCE, "is_connected").contains_key(&user_id)
    }

    pub fn connection_id(&self, user_id: UserId) -> Option<ConnectionId> {
        rw_read(&self.connections, SOURCE, "connection_id")
            .get(&user_id)
            .map(|registered| registered.id)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.connections, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort write to the user's live connection.
    ///
    /// An absent connection is `Ok(NotConnected)`. A failed or timed-out write releases that
    /// connection and is returned as an error the caller may log and ignore.
    pub async fn push(
        &self,
        user_id: UserId,
        message: &LivePushMessage,
    ) -> Result<PushOutcome, PushError> {
        let target = rw_read(&self.connections, SOURCE, "push")
            .get(&user_id)
            .map(|registered| (registered.id, registered.channel.clone()));

        let Some((id, channel)) = target else {
            counter!(METRIC_PUSH, "outcome" => "not_connected").increment(1);
            return Ok(PushOutcome::NotConnected);
        };

        let payload = serde_json::to_string(message).map_err(|err| {
            counter!(METRIC_PUSH, "outcome" => "failed").increment(1);
            PushError::Encode(err.to_string())
        })?;

        let result = match tokio::time::timeout(self.push_timeout, channel.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Timeout(self.push_timeout)),
        };

        match result {
            Ok(()) => {
                counter!(METRIC_PUSH, "outcome" => "delivered").increment(1);
                Ok(PushOutcome::Delivered)
            }
            Err(err) => {
                counter!(METRIC_PUSH, "outcome" => "failed").increment(1);
                warn!(%user_id, connection = %id, error = %err, "Live push failed; dropping connection");
                self.release(user_id, id);
                Err(err)
            }
        }
    }
}
