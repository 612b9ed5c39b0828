//! The Hub: per-process connection registry.
//!
//! One task owns all registry state; every mutation arrives as a
//! [`HubCommand`] on an mpsc queue and is applied serially. The loop never
//! performs network or store I/O — presence writes happen in the
//! per-connection tasks, and broker subscription changes are fire-and-forget
//! commands to the shared subscriber task — so registry-mutation latency
//! stays bounded by local map work.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::store::keys;

use super::frames::{LifecycleEvent, LifecycleKind, MessageEnvelope, ServerFrame};

/// Capacity of the hub's command queue.
const COMMAND_QUEUE: usize = 256;

/// Everything the per-connection tasks hand over at registration time.
pub struct ConnHandle {
    pub conn_id: String,
    pub user_id: String,
    /// Bounded outbound delivery queue; the writer task drains it.
    pub outbound: mpsc::Sender<ServerFrame>,
}

/// Result of removing a connection from the registry.
#[derive(Debug)]
pub struct UnregisterOutcome {
    pub user_id: Option<String>,
    /// True when this was the user's last local connection, in which case
    /// the caller retracts presence (compare-and-delete) and the instance
    /// client set entry.
    pub last_for_user: bool,
}

/// Instructions for the shared subscriber task.
#[derive(Debug, PartialEq, Eq)]
pub enum SubscriberCommand {
    Subscribe(String),
    Unsubscribe(String),
}

pub enum HubCommand {
    Register {
        conn: ConnHandle,
        groups: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        conn_id: String,
        reply: oneshot::Sender<UnregisterOutcome>,
    },
    /// A message published on a group channel; fan out to local members.
    Deliver {
        group_id: String,
        envelope: MessageEnvelope,
    },
    /// A lifecycle event from the shared events channel; apply the
    /// membership delta locally and notify affected connections.
    Lifecycle { event: LifecycleEvent },
    /// Users with at least one local connection (for the presence heartbeat).
    LocalUsers { reply: oneshot::Sender<Vec<String>> },
    /// Record client activity on a connection.
    Touch { conn_id: String },
}

struct ConnEntry {
    user_id: String,
    outbound: mpsc::Sender<ServerFrame>,
    groups: HashSet<String>,
    last_activity: Instant,
}

pub struct Hub {
    conns: HashMap<String, ConnEntry>,
    /// user id → local connection ids.
    users: HashMap<String, HashSet<String>>,
    /// group id → local connection ids subscribed to its channel.
    channels: HashMap<String, HashSet<String>>,
    subs_tx: mpsc::UnboundedSender<SubscriberCommand>,
}

impl Hub {
    pub fn new(subs_tx: mpsc::UnboundedSender<SubscriberCommand>) -> Self {
        Self {
            conns: HashMap::new(),
            users: HashMap::new(),
            channels: HashMap::new(),
            subs_tx,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        tracing::debug!("hub command queue closed; registry loop exiting");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { conn, groups, reply } => {
                self.register(conn, groups);
                let _ = reply.send(());
            }
            HubCommand::Unregister { conn_id, reply } => {
                let outcome = self.unregister(&conn_id);
                let _ = reply.send(outcome);
            }
            HubCommand::Deliver { group_id, envelope } => self.deliver(&group_id, envelope),
            HubCommand::Lifecycle { event } => self.apply_lifecycle(event),
            HubCommand::LocalUsers { reply } => {
                let _ = reply.send(self.users.keys().cloned().collect());
            }
            HubCommand::Touch { conn_id } => {
                if let Some(entry) = self.conns.get_mut(&conn_id) {
                    entry.last_activity = Instant::now();
                }
            }
        }
    }

    fn register(&mut self, conn: ConnHandle, groups: Vec<String>) {
        tracing::info!(
            conn_id = %conn.conn_id,
            user_id = %conn.user_id,
            groups = groups.len(),
            "connection registered"
        );

        self.users
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.conn_id.clone());

        for group_id in &groups {
            self.attach_channel(group_id, &conn.conn_id);
        }

        self.conns.insert(
            conn.conn_id.clone(),
            ConnEntry {
                user_id: conn.user_id,
                outbound: conn.outbound,
                groups: groups.into_iter().collect(),
                last_activity: Instant::now(),
            },
        );
    }

    fn unregister(&mut self, conn_id: &str) -> UnregisterOutcome {
        let Some(entry) = self.conns.remove(conn_id) else {
            return UnregisterOutcome {
                user_id: None,
                last_for_user: false,
            };
        };

        let last_for_user = match self.users.get_mut(&entry.user_id) {
            Some(conn_ids) => {
                conn_ids.remove(conn_id);
                if conn_ids.is_empty() {
                    self.users.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };

        for group_id in &entry.groups {
            self.detach_channel(group_id, conn_id);
        }

        tracing::info!(
            %conn_id,
            user_id = %entry.user_id,
            last_for_user,
            idle_secs = entry.last_activity.elapsed().as_secs(),
            "connection unregistered"
        );

        UnregisterOutcome {
            user_id: Some(entry.user_id),
            last_for_user,
        }
    }

    fn deliver(&mut self, group_id: &str, envelope: MessageEnvelope) {
        let Some(conn_ids) = self.channels.get(group_id) else {
            return;
        };
        for conn_id in conn_ids {
            if let Some(entry) = self.conns.get(conn_id) {
                send_frame(
                    entry,
                    conn_id,
                    ServerFrame::Message {
                        envelope: envelope.clone(),
                    },
                );
            }
        }
    }

    fn apply_lifecycle(&mut self, event: LifecycleEvent) {
        match event.event {
            LifecycleKind::UserInvited => {
                if let Some(user_id) = event.user_id.clone() {
                    let conn_ids: Vec<String> = self
                        .users
                        .get(&user_id)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    for conn_id in conn_ids {
                        if let Some(entry) = self.conns.get_mut(&conn_id) {
                            entry.groups.insert(event.group_id.clone());
                        }
                        self.attach_channel(&event.group_id, &conn_id);
                    }
                }
                self.forward_lifecycle(&event);
            }
            LifecycleKind::UserRemoved => {
                // Notify before detaching so the removed user's connections
                // still see the event.
                self.forward_lifecycle(&event);
                if let Some(user_id) = event.user_id.clone() {
                    let conn_ids: Vec<String> = self
                        .users
                        .get(&user_id)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    for conn_id in conn_ids {
                        if let Some(entry) = self.conns.get_mut(&conn_id) {
                            entry.groups.remove(&event.group_id);
                        }
                        self.detach_channel(&event.group_id, &conn_id);
                    }
                }
            }
            LifecycleKind::GroupUpdated => self.forward_lifecycle(&event),
            LifecycleKind::GroupDeleted => {
                self.forward_lifecycle(&event);
                if let Some(conn_ids) = self.channels.remove(&event.group_id) {
                    for conn_id in conn_ids {
                        if let Some(entry) = self.conns.get_mut(&conn_id) {
                            entry.groups.remove(&event.group_id);
                        }
                    }
                    self.send_subscriber(SubscriberCommand::Unsubscribe(
                        keys::group_message_channel(&event.group_id),
                    ));
                }
            }
        }
    }

    /// Send a lifecycle frame to every local connection attached to the
    /// group, plus the affected user's connections (which may not be
    /// attached, e.g. a just-removed member).
    fn forward_lifecycle(&self, event: &LifecycleEvent) {
        let mut targets: HashSet<&String> = self
            .channels
            .get(&event.group_id)
            .map(|set| set.iter().collect())
            .unwrap_or_default();
        if let Some(user_id) = &event.user_id {
            if let Some(conn_ids) = self.users.get(user_id) {
                targets.extend(conn_ids.iter());
            }
        }
        for conn_id in targets {
            if let Some(entry) = self.conns.get(conn_id) {
                send_frame(
                    entry,
                    conn_id,
                    ServerFrame::Lifecycle {
                        event: event.clone(),
                    },
                );
            }
        }
    }

    fn attach_channel(&mut self, group_id: &str, conn_id: &str) {
        let conn_ids = self.channels.entry(group_id.to_string()).or_default();
        let first = conn_ids.is_empty();
        conn_ids.insert(conn_id.to_string());
        if first {
            self.send_subscriber(SubscriberCommand::Subscribe(keys::group_message_channel(
                group_id,
            )));
        }
    }

    fn detach_channel(&mut self, group_id: &str, conn_id: &str) {
        if let Some(conn_ids) = self.channels.get_mut(group_id) {
            conn_ids.remove(conn_id);
            if conn_ids.is_empty() {
                self.channels.remove(group_id);
                self.send_subscriber(SubscriberCommand::Unsubscribe(keys::group_message_channel(
                    group_id,
                )));
            }
        }
    }

    fn send_subscriber(&self, cmd: SubscriberCommand) {
        if self.subs_tx.send(cmd).is_err() {
            tracing::warn!("subscriber task gone; channel subscriptions not updated");
        }
    }
}

/// Non-blocking enqueue onto a connection's outbound queue. A full queue
/// means the client is not draining; dropping here is safe because delivery
/// is at-least-once and history replay recovers the message.
fn send_frame(entry: &ConnEntry, conn_id: &str, frame: ServerFrame) {
    match entry.outbound.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(%conn_id, "outbound queue full; frame dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Cloneable handle used by connection tasks, the subscriber, and the
/// heartbeat loop to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Spawn the registry loop and return a handle to it.
    pub fn spawn(subs_tx: mpsc::UnboundedSender<SubscriberCommand>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(Hub::new(subs_tx).run(rx));
        Self { tx }
    }

    pub async fn register(&self, conn: ConnHandle, groups: Vec<String>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { conn, groups, reply })
            .await
            .map_err(|_| Error::Store("hub unavailable".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("hub dropped register reply".to_string()))
    }

    pub async fn unregister(&self, conn_id: &str) -> Result<UnregisterOutcome, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Unregister {
                conn_id: conn_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Store("hub unavailable".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("hub dropped unregister reply".to_string()))
    }

    pub async fn local_users(&self) -> Result<Vec<String>, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::LocalUsers { reply })
            .await
            .map_err(|_| Error::Store("hub unavailable".to_string()))?;
        rx.await
            .map_err(|_| Error::Store("hub dropped local-users reply".to_string()))
    }

    pub async fn deliver(&self, group_id: String, envelope: MessageEnvelope) {
        let _ = self.tx.send(HubCommand::Deliver { group_id, envelope }).await;
    }

    pub async fn lifecycle(&self, event: LifecycleEvent) {
        let _ = self.tx.send(HubCommand::Lifecycle { event }).await;
    }

    pub async fn touch(&self, conn_id: &str) {
        let _ = self
            .tx
            .send(HubCommand::Touch {
                conn_id: conn_id.to_string(),
            })
            .await;
    }
}
