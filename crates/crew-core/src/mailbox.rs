//! Mailbox: per-participant message queues over the store.
//!
//! Two logical queues per participant per team: the inbox (delivered rows
//! not yet processed) and the outbox (rows the participant sent).  Bodies
//! are arbitrary UTF-8 stored verbatim — newlines, commas, quotes and
//! emoji round-trip byte-for-byte.

use std::sync::Arc;

use anyhow::Result;

use crate::db::Db;
use crate::types::Message;

pub struct Mailbox {
    db: Arc<Db>,
}

impl Mailbox {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Send with immediate delivery.  Also writes the chat audit row.
    pub fn send(&self, team: &str, sender: &str, recipient: &str, body: &str) -> Result<i64> {
        self.db.send_message(team, sender, recipient, body)
    }

    /// Delivered messages for `agent`, ordered by delivery time.
    /// `unread_only` keeps rows whose `processed_at` is still null.
    pub fn read_inbox(&self, team: &str, agent: &str, unread_only: bool) -> Result<Vec<Message>> {
        self.db.inbox(team, agent, unread_only)
    }

    /// Messages `agent` sent.  With immediate delivery, `pending_only`
    /// returns empty by construction; the flag is kept for a deferred
    /// delivery variant.
    pub fn read_outbox(&self, team: &str, agent: &str, pending_only: bool) -> Result<Vec<Message>> {
        self.db.outbox(team, agent, pending_only)
    }

    pub fn mark_seen(&self, team: &str, ids: &[i64]) -> Result<()> {
        self.db.mark_seen(team, ids)
    }

    pub fn mark_processed(&self, team: &str, ids: &[i64]) -> Result<()> {
        self.db.mark_processed(team, ids)
    }

    pub fn has_unread(&self, team: &str, agent: &str) -> Result<bool> {
        Ok(self.db.count_unread(team, agent)? > 0)
    }

    pub fn count_unread(&self, team: &str, agent: &str) -> Result<u64> {
        self.db.count_unread(team, agent)
    }

    pub fn agents_with_unread(&self, team: &str) -> Result<Vec<String>> {
        self.db.agents_with_unread(team)
    }

    /// Merged inbox + outbox ordered by time, optionally filtered to one
    /// peer.
    pub fn recent_conversation(
        &self,
        team: &str,
        agent: &str,
        peer: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.db.recent_conversation(team, agent, peer, limit)
    }
}
