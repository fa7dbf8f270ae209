//! Ephemeral presence per room: who is here, when they were last heard
//! from, and where their cursor sits.
//!
//! ```text
//! cursor event ──► touch() ──(≥ interval since last broadcast?)──► presence-update
//!                     │ no
//!                     ▼
//!               marked dirty ──► sweep() sends the trailing update
//!
//! edit / heartbeat ──► heartbeat()   (refresh only, no broadcast)
//! sweep() ──► expired() ──► implicit leave
//! ```
//!
//! Nothing here is persisted.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{now_millis, PresenceInfo, SessionId, UserId};

// ───────────────────────────────────────────────────────────────────
// Entry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PresenceEntry {
    user_id: UserId,
    last_seen: Instant,
    /// Wall-clock form of `last_seen` for the wire.
    last_seen_ms: u64,
    cursor: Option<usize>,
    last_broadcast: Option<Instant>,
    /// A throttled change is waiting for its broadcast.
    dirty: bool,
}

impl PresenceEntry {
    fn new(user_id: UserId, now: Instant) -> Self {
        Self {
            user_id,
            last_seen: now,
            last_seen_ms: now_millis(),
            cursor: None,
            last_broadcast: None,
            dirty: false,
        }
    }

    fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_ms = now_millis();
    }

    fn may_broadcast(&self, now: Instant, interval: Duration) -> bool {
        self.last_broadcast
            .map_or(true, |at| now.saturating_duration_since(at) >= interval)
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence of one room's members.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<SessionId, PresenceEntry>,
    broadcast_interval: Duration,
    heartbeat_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(broadcast_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            broadcast_interval,
            heartbeat_timeout,
        }
    }

    pub fn register(&mut self, session: SessionId, user_id: UserId, now: Instant) {
        self.entries
            .entry(session)
            .and_modify(|e| e.refresh(now))
            .or_insert_with(|| PresenceEntry::new(user_id, now));
    }

    pub fn remove(&mut self, session: &SessionId) -> bool {
        self.entries.remove(session).is_some()
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.entries.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn user_id(&self, session: &SessionId) -> Option<&str> {
        self.entries.get(session).map(|e| e.user_id.as_str())
    }

    /// Record activity without asking for a broadcast.
    pub fn heartbeat(&mut self, session: &SessionId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(session) {
            entry.refresh(now);
        }
    }

    /// Record activity and a cursor position. Returns `true` when the
    /// caller should broadcast now; otherwise the change is held for the
    /// next sweep.
    pub fn touch(&mut self, session: &SessionId, cursor: Option<usize>, now: Instant) -> bool {
        let interval = self.broadcast_interval;
        let Some(entry) = self.entries.get_mut(session) else {
            return false;
        };
        entry.refresh(now);
        entry.cursor = cursor;
        if entry.may_broadcast(now, interval) {
            entry.last_broadcast = Some(now);
            entry.dirty = false;
            true
        } else {
            entry.dirty = true;
            false
        }
    }

    /// Whether any throttled change is now due. Clears the pending marks
    /// of the entries it reports.
    pub fn take_due(&mut self, now: Instant) -> bool {
        let interval = self.broadcast_interval;
        let mut due = false;
        for entry in self.entries.values_mut() {
            if entry.dirty && entry.may_broadcast(now, interval) {
                entry.dirty = false;
                entry.last_broadcast = Some(now);
                due = true;
            }
        }
        due
    }

    /// Sessions silent for longer than the heartbeat window. They are
    /// removed from the tracker.
    pub fn expire(&mut self, now: Instant) -> Vec<SessionId> {
        let timeout = self.heartbeat_timeout;
        let stale: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    /// Wire listing, ordered by session id for stable output.
    pub fn list(&self) -> Vec<PresenceInfo> {
        let mut sessions: Vec<PresenceInfo> = self
            .entries
            .iter()
            .map(|(id, e)| PresenceInfo {
                id: *id,
                last_seen: e.last_seen_ms,
                cursor: e.cursor,
            })
            .collect();
        sessions.sort_by_key(|p| p.id);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Duration::from_millis(100), Duration::from_secs(30))
    }

    // ── Touch / rate limit tests ──

    #[test]
    fn test_first_touch_broadcasts() {
        let mut presence = tracker();
        let now = Instant::now();
        let s = SessionId::new();
        presence.register(s, "alice".into(), now);
        assert!(presence.touch(&s, Some(3), now));
        assert_eq!(presence.list()[0].cursor, Some(3));
    }

    #[test]
    fn test_touch_rate_limited_then_trailing() {
        let mut presence = tracker();
        let t0 = Instant::now();
        let s = SessionId::new();
        presence.register(s, "alice".into(), t0);

        assert!(presence.touch(&s, Some(1), t0));
        assert!(!presence.touch(&s, Some(2), t0 + Duration::from_millis(10)));
        assert!(!presence.take_due(t0 + Duration::from_millis(50)));
        assert!(presence.take_due(t0 + Duration::from_millis(120)));
        assert!(!presence.take_due(t0 + Duration::from_millis(500)));
        assert_eq!(presence.list()[0].cursor, Some(2));
        assert!(presence.touch(&s, Some(4), t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_rate_limit_is_per_session() {
        let mut presence = tracker();
        let now = Instant::now();
        let (a, b) = (SessionId::new(), SessionId::new());
        presence.register(a, "a".into(), now);
        presence.register(b, "b".into(), now);
        assert!(presence.touch(&a, None, now));
        assert!(presence.touch(&b, None, now));
    }

    #[test]
    fn test_touch_unknown_session_ignored() {
        let mut presence = tracker();
        assert!(!presence.touch(&SessionId::new(), Some(1), Instant::now()));
        assert!(presence.is_empty());
    }

    // ── Expiry tests ──

    #[test]
    fn test_expire_after_missed_heartbeats() {
        let mut presence = tracker();
        let t0 = Instant::now();
        let (quiet, chatty) = (SessionId::new(), SessionId::new());
        presence.register(quiet, "q".into(), t0);
        presence.register(chatty, "c".into(), t0);

        presence.heartbeat(&chatty, t0 + Duration::from_secs(25));
        let expired = presence.expire(t0 + Duration::from_secs(31));
        assert_eq!(expired, vec![quiet]);
        assert!(presence.contains(&chatty));
        assert_eq!(presence.user_id(&chatty), Some("c"));
        assert!(presence.expire(t0 + Duration::from_secs(40)).is_empty());
    }

    #[test]
    fn test_list_sorted_and_removal() {
        let mut presence = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            presence.register(SessionId::new(), "u".into(), now);
        }
        let list = presence.list();
        assert!(list.windows(2).all(|w| w[0].id < w[1].id));
        assert!(presence.remove(&list[0].id));
        assert_eq!(presence.len(), 4);
    }
}
