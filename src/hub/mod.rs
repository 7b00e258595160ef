//! Interactive session hub
//!
//! A single coordinating task owns the registry of live connections; all
//! membership changes go through its inlet channels, so the registry has
//! exactly one writer and needs no locking. The monitor subset is kept
//! behind a read lock written only by the hub loop, letting any task fan
//! out to monitors without stalling on a slow client.

mod client;
mod protocol;

pub use client::{serve_connection, SessionDeps};
pub use protocol::{
    AnalysisPayload, ControlMessage, EventFrame, Identity, MonitorEvent, MonitorFrame, Role,
};

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-client outbound channel: the only path to a connection's writer
pub type Outbound = mpsc::Sender<Message>;

/// A registered connection as the hub sees it
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: u64,
    pub identity: Identity,
    pub outbound: Outbound,
}

impl ClientHandle {
    pub fn new(identity: Identity, outbound: Outbound) -> Self {
        ClientHandle {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            identity,
            outbound,
        }
    }
}

enum HubCommand {
    Register(ClientHandle),
    Unregister(u64),
    Broadcast(Message),
}

/// Handle to the hub actor; cheap to clone
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    monitors: Arc<RwLock<HashMap<u64, Outbound>>>,
}

impl Hub {
    /// Spawn the coordinating loop and return its handle.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(64);
        let monitors = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(run_loop(rx, Arc::clone(&monitors)));
        Hub {
            commands: tx,
            monitors,
        }
    }

    /// Add a connection to the registry; role decides monitor status,
    /// once, at registration.
    pub async fn register(&self, client: ClientHandle) {
        let _ = self.commands.send(HubCommand::Register(client)).await;
    }

    /// Remove a connection from the registry and the monitor subset.
    pub async fn unregister(&self, id: u64) {
        let _ = self.commands.send(HubCommand::Unregister(id)).await;
    }

    /// Fan a message out to every connected client.
    pub async fn broadcast(&self, message: Message) {
        let _ = self.commands.send(HubCommand::Broadcast(message)).await;
    }

    /// Mirror a frame to every monitor. Safe to call from any task: sends
    /// are non-blocking, and a monitor with a full channel loses the frame
    /// rather than stalling the caller.
    pub async fn broadcast_to_monitors(&self, frame: &MonitorFrame) {
        let message = Message::Text(frame.to_json().into());
        let monitors = self.monitors.read().await;
        for (id, outbound) in monitors.iter() {
            if outbound.try_send(message.clone()).is_err() {
                debug!(client = id, "Monitor channel full, dropping frame");
            }
        }
    }

    /// Number of registered monitors (startup reporting and tests).
    pub async fn monitor_count(&self) -> usize {
        self.monitors.read().await.len()
    }
}

async fn run_loop(
    mut commands: mpsc::Receiver<HubCommand>,
    monitors: Arc<RwLock<HashMap<u64, Outbound>>>,
) {
    let mut clients: HashMap<u64, ClientHandle> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register(client) => {
                info!(
                    user_id = %client.identity.user_id,
                    role = ?client.identity.role,
                    "Client connected"
                );
                if client.identity.role.is_monitor() {
                    monitors
                        .write()
                        .await
                        .insert(client.id, client.outbound.clone());
                    info!(user_id = %client.identity.user_id, "Monitor joined");
                }
                clients.insert(client.id, client);
            }
            HubCommand::Unregister(id) => {
                if let Some(client) = clients.remove(&id) {
                    monitors.write().await.remove(&id);
                    info!(user_id = %client.identity.user_id, "Client disconnected");
                    // Dropping the stored sender lets the writer loop stop
                    // once the connection's own clones are gone.
                }
            }
            HubCommand::Broadcast(message) => {
                for (id, client) in clients.iter() {
                    if client.outbound.try_send(message.clone()).is_err() {
                        debug!(client = id, "Client channel full or closed, dropping");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: "1".to_string(),
            db_id: Some(1),
            role,
            name: "Test".to_string(),
        }
    }

    async fn settle(hub: &Hub, expected_monitors: usize) {
        // Registration flows through the hub loop; wait for it to apply.
        for _ in 0..50 {
            if hub.monitor_count().await == expected_monitors {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub did not reach {expected_monitors} monitors");
    }

    #[tokio::test]
    async fn test_teacher_joins_monitor_subset_student_does_not() {
        let hub = Hub::spawn();
        let (teacher_tx, mut teacher_rx) = mpsc::channel(8);
        let (student_tx, mut student_rx) = mpsc::channel(8);

        hub.register(ClientHandle::new(identity(Role::Teacher), teacher_tx))
            .await;
        hub.register(ClientHandle::new(identity(Role::Student), student_tx))
            .await;
        settle(&hub, 1).await;

        let frame = MonitorFrame::new(MonitorEvent::CompileStart, &identity(Role::Student), "go");
        hub.broadcast_to_monitors(&frame).await;

        let received = tokio::time::timeout(Duration::from_secs(1), teacher_rx.recv())
            .await
            .expect("monitor should receive the frame")
            .unwrap();
        assert!(matches!(received, Message::Text(_)));
        assert!(student_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_monitor_channel_never_blocks_broadcast() {
        let hub = Hub::spawn();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Message::Text("preload".to_string().into()))
            .unwrap(); // fill the channel

        hub.register(ClientHandle::new(identity(Role::Admin), tx))
            .await;
        settle(&hub, 1).await;

        let frame = MonitorFrame::new(MonitorEvent::OutputChunk, &identity(Role::Student), "x");
        // Must return promptly even though the only monitor cannot accept.
        tokio::time::timeout(Duration::from_secs(1), hub.broadcast_to_monitors(&frame))
            .await
            .expect("broadcast must not block on a congested monitor");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let hub = Hub::spawn();
        let (teacher_tx, mut teacher_rx) = mpsc::channel(8);
        let (student_tx, mut student_rx) = mpsc::channel(8);

        hub.register(ClientHandle::new(identity(Role::Teacher), teacher_tx))
            .await;
        hub.register(ClientHandle::new(identity(Role::Student), student_tx))
            .await;
        settle(&hub, 1).await;

        hub.broadcast(Message::Text("announcement".to_string().into()))
            .await;

        for rx in [&mut teacher_rx, &mut student_rx] {
            let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("every client should receive the broadcast")
                .unwrap();
            match received {
                Message::Text(text) => assert_eq!(text.as_str(), "announcement"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unregister_removes_monitor() {
        let hub = Hub::spawn();
        let (tx, _rx) = mpsc::channel(8);
        let handle = ClientHandle::new(identity(Role::Teacher), tx);
        let id = handle.id;

        hub.register(handle).await;
        settle(&hub, 1).await;

        hub.unregister(id).await;
        settle(&hub, 0).await;
    }
}
