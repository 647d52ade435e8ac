//! Best-effort session history: a TTL-bounded window of recent turns.
//!
//! Not an authoritative store. Request-supplied history always wins; this
//! buffer only fills the gap when a client sends bare messages under a
//! session id. Entries expire after the TTL and the window keeps only the
//! most recent turns.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::ChatMessage;

struct SessionBuffer {
    turns: VecDeque<ChatMessage>,
    last_active: Instant,
}

/// TTL window store for chat sessions.
pub struct SessionStore {
    sessions: DashMap<String, Mutex<SessionBuffer>>,
    ttl: Duration,
    max_turns: usize,
}

impl SessionStore {
    /// Build a store keeping `max_turns` turns per session for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            max_turns: max_turns.max(2),
        }
    }

    /// Append a user/assistant exchange to a session.
    pub fn append(&self, session_id: &str, user: ChatMessage, assistant: ChatMessage) {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Mutex::new(SessionBuffer {
                    turns: VecDeque::new(),
                    last_active: Instant::now(),
                })
            });
        let mut buffer = entry.lock();
        buffer.last_active = Instant::now();
        buffer.turns.push_back(user);
        buffer.turns.push_back(assistant);
        while buffer.turns.len() > self.max_turns {
            buffer.turns.pop_front();
        }
    }

    /// Recent turns for a session, oldest first. Expired sessions read
    /// empty and are dropped.
    #[must_use]
    pub fn recent(&self, session_id: &str) -> Vec<ChatMessage> {
        let expired = match self.sessions.get(session_id) {
            Some(entry) => {
                let buffer = entry.lock();
                if buffer.last_active.elapsed() > self.ttl {
                    true
                } else {
                    return buffer.turns.iter().cloned().collect();
                }
            }
            None => return Vec::new(),
        };
        if expired {
            self.sessions.remove(session_id);
        }
        Vec::new()
    }

    /// Tracked session count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800), 20)
    }
}
