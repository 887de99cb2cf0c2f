//! In-process pub/sub for UI live updates.
//!
//! Built on `tokio::sync::broadcast`: publishers never block, slow
//! subscribers lag and lose the oldest events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TurnStarted,
    TurnEnded,
    TaskChanged,
    MessageDelivered,
    MergeFailed,
    TeamsRefresh,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Event {
    fn base(kind: EventKind, team: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            team: team.to_string(),
            agent: None,
            task_id: None,
            sender: None,
            error: None,
            detail: None,
        }
    }

    pub fn turn_started(team: &str, agent: &str) -> Self {
        Self {
            agent: Some(agent.to_string()),
            ..Self::base(EventKind::TurnStarted, team)
        }
    }

    pub fn turn_ended(team: &str, agent: &str, error: Option<String>) -> Self {
        Self {
            agent: Some(agent.to_string()),
            error,
            ..Self::base(EventKind::TurnEnded, team)
        }
    }

    pub fn task_changed(team: &str, task_id: i64, detail: &str) -> Self {
        Self {
            task_id: Some(task_id),
            detail: Some(detail.to_string()),
            ..Self::base(EventKind::TaskChanged, team)
        }
    }

    pub fn message_delivered(team: &str, sender: &str, recipient: &str) -> Self {
        Self {
            sender: Some(sender.to_string()),
            agent: Some(recipient.to_string()),
            ..Self::base(EventKind::MessageDelivered, team)
        }
    }

    pub fn merge_failed(team: &str, task_id: i64, detail: &str) -> Self {
        Self {
            task_id: Some(task_id),
            detail: Some(detail.to_string()),
            ..Self::base(EventKind::MergeFailed, team)
        }
    }

    pub fn teams_refresh() -> Self {
        Self::base(EventKind::TeamsRefresh, "")
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: Event) {
        // A send error just means there are no subscribers right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
