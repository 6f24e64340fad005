use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::infrastructure::broker::{BrokerError, JobBroker};
use crate::modules::jobs::model::{JobEvent, JobEventKind, JobId, JobState};

pub type ConnectionId = u64;

/// Frames pushed to a subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Progress(u8),
    Status(JobState),
}

impl From<&JobEvent> for ServerMessage {
    fn from(event: &JobEvent) -> Self {
        match event.kind {
            JobEventKind::Progress { percent } => ServerMessage::Progress(percent),
            JobEventKind::Completed => ServerMessage::Status(JobState::Completed),
            JobEventKind::Failed { .. } => ServerMessage::Status(JobState::Failed),
        }
    }
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

struct Connection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    rooms: HashSet<JobId>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<JobId, HashSet<ConnectionId>>,
}

/// Per-job rooms of live client connections.
///
/// Events for a job reach only the connections that subscribed to it. Tearing
/// a connection down releases every room it joined.
#[derive(Default)]
pub struct NotificationRouter {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry().connections.insert(
            id,
            Connection {
                tx,
                rooms: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Joins the job's room. Returns false for an unknown connection.
    pub fn subscribe(&self, conn: ConnectionId, job_id: JobId) -> bool {
        let mut registry = self.registry();
        let Some(connection) = registry.connections.get_mut(&conn) else {
            return false;
        };
        connection.rooms.insert(job_id.clone());
        registry.rooms.entry(job_id).or_default().insert(conn);
        true
    }

    pub fn disconnect(&self, conn: ConnectionId) {
        let mut registry = self.registry();
        let Some(connection) = registry.connections.remove(&conn) else {
            return;
        };
        for job_id in connection.rooms {
            if let Some(members) = registry.rooms.get_mut(&job_id) {
                members.remove(&conn);
                if members.is_empty() {
                    registry.rooms.remove(&job_id);
                }
            }
        }
    }

    /// Delivers the event to the job's room. Returns how many connections got it.
    pub fn route(&self, event: &JobEvent) -> usize {
        let registry = self.registry();
        let Some(members) = registry.rooms.get(&event.job_id) else {
            return 0;
        };

        let message = ServerMessage::from(event);
        members
            .iter()
            .filter_map(|id| registry.connections.get(id))
            .filter(|connection| connection.tx.send(message.clone()).is_ok())
            .count()
    }

    #[cfg(test)]
    pub fn room_size(&self, job_id: &JobId) -> usize {
        self.registry().rooms.get(job_id).map_or(0, HashSet::len)
    }

    /// Relays broker events until the broker's stream ends.
    pub async fn run(self: Arc<Self>, broker: Arc<dyn JobBroker>) -> Result<(), BrokerError> {
        let mut events = broker.subscribe().await?;
        info!("📡 Notification router listening for job events");

        while let Some(event) = events.next().await {
            let delivered = self.route(&event);
            debug!("Event for {} delivered to {} clients", event.job_id, delivered);
        }

        warn!("Job event stream ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker::MemoryBroker;
    use crate::modules::jobs::model::JobOutcome;

    #[test]
    fn test_events_reach_only_their_room() {
        let router = NotificationRouter::new();
        let (alice, mut alice_rx) = router.connect();
        let (bob, mut bob_rx) = router.connect();
        let a = JobId::from("a");
        let b = JobId::from("b");

        assert!(router.subscribe(alice, a.clone()));
        assert!(router.subscribe(bob, b.clone()));

        assert_eq!(router.route(&JobEvent::progress(&a, 40)), 1);
        assert_eq!(alice_rx.try_recv().unwrap(), ServerMessage::Progress(40));
        assert!(bob_rx.try_recv().is_err());

        router.route(&JobEvent::terminal(&b, &JobOutcome::Completed));
        assert_eq!(bob_rx.try_recv().unwrap(), ServerMessage::Status(JobState::Completed));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_releases_rooms() {
        let router = NotificationRouter::new();
        let (conn, _rx) = router.connect();
        let (other, _other_rx) = router.connect();
        let job = JobId::from("job");

        router.subscribe(conn, job.clone());
        router.subscribe(conn, JobId::from("second"));
        router.subscribe(other, job.clone());
        assert_eq!(router.room_size(&job), 2);

        router.disconnect(conn);
        assert_eq!(router.room_size(&job), 1);
        assert_eq!(router.room_size(&JobId::from("second")), 0);
        assert!(!router.subscribe(conn, job.clone()));

        router.disconnect(other);
        assert_eq!(router.route(&JobEvent::progress(&job, 10)), 0);
    }

    #[test]
    fn test_wire_format() {
        let progress = serde_json::to_string(&ServerMessage::Progress(33)).unwrap();
        assert_eq!(progress, r#"{"event":"progress","data":33}"#);
        let failed = serde_json::to_string(&ServerMessage::Status(JobState::Failed)).unwrap();
        assert_eq!(failed, r#"{"event":"status","data":"failed"}"#);

        let msg: ClientMessage = serde_json::from_str(r#"{"action":"subscribe","jobId":"42"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { job_id: JobId::from("42") });
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"unsubscribe","jobId":"42"}"#).is_err());
    }

    #[tokio::test]
    async fn test_run_relays_broker_events() {
        let broker = Arc::new(MemoryBroker::new());
        let router = Arc::new(NotificationRouter::new());
        let id = broker.enqueue("uploads/a.mp4").await.unwrap();
        let (conn, mut rx) = router.connect();
        router.subscribe(conn, id.clone());

        let relay = tokio::spawn(router.clone().run(broker.clone()));
        // the relay subscribes asynchronously; publish once it is listening
        while broker.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        broker.publish_progress(&id, 50).await.unwrap();
        broker
            .publish_terminal(&id, &JobOutcome::Failed { reason: "boom".into() })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), ServerMessage::Progress(50));
        assert_eq!(rx.recv().await.unwrap(), ServerMessage::Status(JobState::Failed));
        relay.abort();
    }
}
