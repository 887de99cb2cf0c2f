//! Message router — one poll cycle at a time, so it can be tested without
//! running the daemon loop.
//!
//! With immediate delivery the undelivered sweep is normally empty; a
//! deferred producer (anything inserting rows without a `delivered_at`)
//! stays compatible.  Messages addressed to the configured human member
//! land in the boss queue so the UI can surface them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, error, info};

use crate::config;
use crate::db::Db;
use crate::events::{Event, EventBus};
use crate::types::Message;

/// In-memory queue for messages addressed to the boss.
#[derive(Default)]
pub struct BossQueue {
    messages: Mutex<VecDeque<Message>>,
}

impl BossQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, msg: Message) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(msg);
    }

    pub fn drain(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn peek(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

pub struct Router {
    db: Arc<Db>,
    bus: EventBus,
    pub boss_queue: Arc<BossQueue>,
    home: std::path::PathBuf,
    /// Highest boss-bound message id already surfaced, per team.
    surfaced: Mutex<std::collections::HashMap<String, i64>>,
}

impl Router {
    pub fn new(db: Arc<Db>, bus: EventBus, home: std::path::PathBuf) -> Self {
        Self {
            db,
            bus,
            boss_queue: BossQueue::new(),
            home,
            surfaced: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Run one routing cycle for a team.  Returns the number of messages
    /// routed.
    pub fn route_once(&self, team: &str) -> Result<usize> {
        let boss = config::get_boss(&self.home);
        let roster: Vec<String> = config::read_roster(&self.home, team)
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.name)
            .collect();
        let members: Vec<String> = config::list_members(&self.home)
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.name)
            .collect();

        let mut routed = 0usize;
        for msg in self.db.undelivered_messages(team)? {
            let known = roster.contains(&msg.recipient)
                || members.contains(&msg.recipient)
                || boss.as_deref() == Some(msg.recipient.as_str());
            if !known {
                error!(
                    "failed to deliver message from {} to unknown recipient {}",
                    msg.sender, msg.recipient
                );
                self.db.log_event(
                    team,
                    "router",
                    &format!("Message delivery failed: {} → {}", msg.sender, msg.recipient),
                )?;
            }
            // The row is marked delivered either way: the payload stays in
            // the store and the audit trail records the bad recipient.
            self.db.mark_delivered(team, msg.id)?;
            self.bus
                .broadcast(Event::message_delivered(team, &msg.sender, &msg.recipient));

            info!(
                "routed message | from={} | to={} | length={} chars | team={}",
                msg.sender,
                msg.recipient,
                msg.body.len(),
                team,
            );
            routed += 1;
        }

        // Surface delivered boss-bound messages exactly once, including
        // ones the synchronous send path delivered without the sweep.
        if let Some(boss_name) = boss.as_deref() {
            let mut surfaced = self.surfaced.lock().unwrap_or_else(|e| e.into_inner());
            let last = surfaced.get(team).copied().unwrap_or(0);
            let mut high = last;
            for msg in self.db.inbox(team, boss_name, true)? {
                if msg.id <= last {
                    continue;
                }
                high = high.max(msg.id);
                self.boss_queue.put(msg);
            }
            surfaced.insert(team.to_string(), high);
        }

        if routed > 0 {
            info!("routing cycle complete | team={team} | messages_routed={routed}");
        } else {
            debug!("routing cycle complete | team={team} | messages_routed=0");
        }
        Ok(routed)
    }
}
