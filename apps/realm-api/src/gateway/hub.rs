//! The broadcast hub: one task that owns the [`Registry`] and serves commands
//! from every connection in arrival order.
//!
//! Callers hold a cloneable [`HubHandle`]. Everything but `register` and the
//! introspection queries is fire-and-forget. Publishes never wait on a
//! recipient: a full queue drops the frame for that connection and evicts it.

use chrono::Utc;
use realm_common::ConnectionId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connection::{Connection, Payload, SendOutcome};
use super::registry::{Group, Registry, RegistryError, RegistryStats, Target};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("hub has stopped")]
    Stopped,
}

enum HubCommand {
    Register {
        conn: Connection,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Join {
        id: ConnectionId,
        group: Group,
    },
    Leave {
        id: ConnectionId,
        group: Group,
    },
    Publish {
        target: Target,
        payload: Payload,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    GroupSize {
        group: Group,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register { .. } => "Register",
            Self::Unregister { .. } => "Unregister",
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::Publish { .. } => "Publish",
            Self::Stats { .. } => "Stats",
            Self::GroupSize { .. } => "GroupSize",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Hub task
// ---------------------------------------------------------------------------

pub struct Hub {
    registry: Registry,
    rx: mpsc::UnboundedReceiver<HubCommand>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            registry: Registry::new(),
            rx,
        };
        (hub, HubHandle { tx })
    }

    /// Start the hub on the current runtime. It stops on [`HubHandle::shutdown`]
    /// or once every handle is dropped.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        tracing::debug!("gateway hub started");
        while let Some(cmd) = self.rx.recv().await {
            if matches!(cmd, HubCommand::Shutdown) {
                break;
            }
            self.handle(cmd);
        }
        let remaining = self.registry.drain().len();
        tracing::info!(remaining, "gateway hub stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { conn, reply } => {
                let id = conn.id();
                let user_id = conn.user_id().to_string();
                let result = self.registry.insert(conn);
                match &result {
                    Ok(()) => tracing::debug!(conn_id = %id, %user_id, "connection registered"),
                    Err(err) => tracing::error!(%err, %user_id, "registry consistency error"),
                }
                let _ = reply.send(result);
            }
            HubCommand::Unregister { id } => {
                if let Some(conn) = self.registry.remove(&id) {
                    let connected_secs = (Utc::now() - conn.connected_at()).num_seconds();
                    tracing::debug!(conn_id = %id, connected_secs, "connection unregistered");
                }
            }
            HubCommand::Join { id, group } => {
                if !self.registry.join(&id, group.clone()) && !self.registry.contains(&id) {
                    tracing::debug!(conn_id = %id, ?group, "join for unknown connection ignored");
                }
            }
            HubCommand::Leave { id, group } => {
                self.registry.leave(&id, &group);
            }
            HubCommand::Publish { target, payload } => self.publish(&target, payload),
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
            HubCommand::GroupSize { group, reply } => {
                let _ = reply.send(self.registry.group_size(&group));
            }
            HubCommand::Shutdown => {}
        }
    }

    fn publish(&mut self, target: &Target, payload: Payload) {
        let mut evicted = Vec::new();
        for id in self.registry.recipients(target) {
            let Some(conn) = self.registry.get(&id) else {
                continue;
            };
            match conn.send(payload.clone()) {
                SendOutcome::Queued => {}
                SendOutcome::Full => {
                    tracing::debug!(conn_id = %id, "outbound queue full, evicting slow consumer");
                    evicted.push(id);
                }
                SendOutcome::Closed => evicted.push(id),
            }
        }
        for id in evicted {
            self.registry.remove(&id);
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable entry point to the hub. Store in `AppState`.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn send(&self, cmd: HubCommand) {
        if let Err(err) = self.tx.send(cmd) {
            tracing::debug!(command = ?err.0, "hub stopped, command dropped");
        }
    }

    /// Hand a connection to the hub. Fails if its id is live or retired.
    pub async fn register(&self, conn: Connection) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { conn, reply })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)??;
        Ok(())
    }

    /// Stop the hub even while other handles are alive. Every registered
    /// connection is dropped, so each writer sees its queue close.
    pub fn shutdown(&self) {
        self.send(HubCommand::Shutdown);
    }

    /// Drop the connection and all its memberships. Idempotent.
    pub fn unregister(&self, id: ConnectionId) {
        self.send(HubCommand::Unregister { id });
    }

    pub fn join_group(&self, id: ConnectionId, group: Group) {
        self.send(HubCommand::Join { id, group });
    }

    pub fn leave_group(&self, id: ConnectionId, group: Group) {
        self.send(HubCommand::Leave { id, group });
    }

    pub fn publish(&self, target: Target, payload: impl Into<Payload>) {
        self.send(HubCommand::Publish {
            target,
            payload: payload.into(),
        });
    }

    pub fn publish_to_user(&self, user_id: impl Into<String>, payload: impl Into<Payload>) {
        self.publish(Target::User(user_id.into()), payload);
    }

    pub fn publish_to_realm(&self, realm_id: impl Into<String>, payload: impl Into<Payload>) {
        self.publish(Target::Group(Group::realm(realm_id)), payload);
    }

    pub fn publish_to_channel(&self, channel_id: impl Into<String>, payload: impl Into<Payload>) {
        self.publish(Target::Group(Group::channel(channel_id)), payload);
    }

    pub fn publish_to_all(&self, payload: impl Into<Payload>) {
        self.publish(Target::All, payload);
    }

    /// Serialize once and publish the resulting frame.
    pub fn publish_json<T: Serialize>(&self, target: Target, event: &T) {
        match serde_json::to_string(event) {
            Ok(json) => self.publish(target, json),
            Err(err) => tracing::error!(%err, "failed to encode gateway event"),
        }
    }

    /// Current counts; all zero if the hub has stopped.
    pub async fn stats(&self) -> RegistryStats {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn group_size(&self, group: Group) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::GroupSize { group, reply });
        rx.await.unwrap_or(0)
    }
}
