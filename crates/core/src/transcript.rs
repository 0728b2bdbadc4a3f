use crate::types::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One finalized message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    /// Never earlier than the timestamp of the entry before it.
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of the messages exchanged in one session, in causal order.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns a copy of the stored entry.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> TranscriptEntry {
        let now = Utc::now();
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let entry = TranscriptEntry {
            role,
            content: content.into(),
            timestamp,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// The last `window` entries, oldest first.
    pub fn recent(&self, window: usize) -> &[TranscriptEntry] {
        let start = self.entries.len().saturating_sub(window);
        &self.entries[start..]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
