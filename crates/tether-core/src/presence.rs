//! Presence membership map.
//!
//! One map per channel, keyed by `client_id:connection_id`. Records are
//! replaced only by strictly newer events, so replayed or reordered presence
//! frames converge on the same membership. Leaves fabricated locally when
//! the connection is lost go through the same [`PresenceMap::remove`] path as
//! leaves from the service.

use std::collections::{HashMap, HashSet};
use tether_protocol::{PresenceAction, PresenceMessage};
use tracing::{debug, trace};

/// Membership table for one channel.
#[derive(Debug, Default)]
pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    sync_in_progress: bool,
    residual: Option<HashSet<String>>,
}

/// Whether `item` supersedes `existing`.
fn newer_than(item: &PresenceMessage, existing: &PresenceMessage) -> bool {
    if item.timestamp > existing.timestamp {
        return true;
    }
    existing.action == PresenceAction::Absent && existing.is_synthesized() && !item.is_synthesized()
}

impl PresenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an enter, update or present event.
    ///
    /// Returns whether the event was applied.
    pub fn put(&mut self, member: PresenceMessage) -> bool {
        let mut member = member;
        if matches!(member.action, PresenceAction::Enter | PresenceAction::Update) {
            member.action = PresenceAction::Present;
        }
        let key = member.member_key();
        if let Some(residual) = self.residual.as_mut() {
            residual.remove(&key);
        }
        if let Some(existing) = self.members.get(&key) {
            if !newer_than(&member, existing) {
                trace!(member = %key, "Stale presence event ignored");
                return false;
            }
        }
        self.members.insert(key, member);
        true
    }

    /// Apply a leave.
    ///
    /// Returns whether a member was actually removed. During a sync the
    /// member is replaced by an absent witness instead of being dropped, so
    /// that an older sync entry cannot bring it back.
    pub fn remove(&mut self, leave: &PresenceMessage) -> bool {
        let key = leave.member_key();
        let Some(existing) = self.members.get(&key) else {
            return false;
        };
        if !newer_than(leave, existing) {
            trace!(member = %key, "Stale leave ignored");
            return false;
        }
        if self.sync_in_progress {
            let mut witness = leave.clone();
            witness.action = PresenceAction::Absent;
            self.members.insert(key, witness);
        } else {
            self.members.remove(&key);
        }
        true
    }

    /// Begin a sync. Repeated calls during a sync are ignored.
    pub fn start_sync(&mut self) {
        if !self.sync_in_progress {
            debug!(members = self.members.len(), "Presence sync started");
            self.residual = Some(self.members.keys().cloned().collect());
            self.sync_in_progress = true;
        }
    }

    /// Finish a sync.
    ///
    /// Absent witnesses are dropped. Members present before the sync and not
    /// seen during it are removed and returned, so the caller can report
    /// them as having left.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        if !self.sync_in_progress {
            return Vec::new();
        }
        self.members.retain(|_, m| m.action != PresenceAction::Absent);
        let mut departed = Vec::new();
        for key in self.residual.take().unwrap_or_default() {
            if let Some(member) = self.members.remove(&key) {
                departed.push(member);
            }
        }
        self.sync_in_progress = false;
        debug!(departed = departed.len(), "Presence sync complete");
        departed
    }

    #[must_use]
    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    /// Leave every member at `now`, as if each had sent a leave.
    ///
    /// Returns the leaves that were applied.
    pub fn synthesize_leaves(&mut self, now: u64) -> Vec<PresenceMessage> {
        let members: Vec<PresenceMessage> = self.values().into_iter().cloned().collect();
        let mut applied = Vec::new();
        for member in members {
            let mut leave = PresenceMessage::new(
                PresenceAction::Leave,
                member.client_id.clone(),
                member.connection_id.clone(),
                now,
            );
            leave.data = member.data;
            if self.remove(&leave) {
                applied.push(leave);
            }
        }
        applied
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PresenceMessage> {
        self.members
            .get(key)
            .filter(|m| m.action != PresenceAction::Absent)
    }

    /// Present members.
    #[must_use]
    pub fn values(&self) -> Vec<&PresenceMessage> {
        self.members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .collect()
    }

    /// Present members, optionally filtered by client and connection.
    #[must_use]
    pub fn list(&self, client_id: Option<&str>, connection_id: Option<&str>) -> Vec<&PresenceMessage> {
        self.values()
            .into_iter()
            .filter(|m| client_id.map_or(true, |c| m.client_id == c))
            .filter(|m| connection_id.map_or(true, |c| m.connection_id == c))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and end any sync.
    ///
    /// Returns the present members that were dropped.
    pub fn clear(&mut self) -> Vec<PresenceMessage> {
        self.sync_in_progress = false;
        self.residual = None;
        self.members
            .drain()
            .map(|(_, member)| member)
            .filter(|m| m.action != PresenceAction::Absent)
            .collect()
    }
}
