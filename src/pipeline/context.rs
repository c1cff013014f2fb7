//! Rolling conversation context
//!
//! A bounded window of past exchanges fed to response generation; the oldest
//! entry is evicted first.

use std::collections::VecDeque;

/// One completed exchange: what the user said and what the assistant replied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Transcribed user utterance
    pub user: String,
    /// Generated assistant reply
    pub assistant: String,
}

/// Bounded rolling window of conversation history
#[derive(Debug)]
pub struct ConversationContext {
    entries: VecDeque<ContextEntry>,
    capacity: usize,
}

impl ConversationContext {
    /// Create a window holding at most `capacity` exchanges
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Record a completed exchange, evicting the oldest when full
    pub fn push(&mut self, user: String, assistant: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ContextEntry { user, assistant });
    }

    /// Immutable snapshot for a pipeline run
    #[must_use]
    pub fn snapshot(&self) -> Vec<ContextEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of exchanges currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no history is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
