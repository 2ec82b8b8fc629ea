//! Append-only chat/context log for an agent session.

use crate::protocol::Action;

/// One entry in the session log.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    /// A user or agent prompt that started a request.
    Prompt { messages: Vec<String>, ts: i64 },
    /// A streamed action. An in-progress (incomplete) action entry is
    /// replaced in place by its successor rather than appended, so an
    /// evolving single action never shows up twice.
    Action { action: Action, ts: i64 },
    /// An automatically scheduled follow-up request.
    Continuation { reason: String, ts: i64 },
}

/// The session's append-only log.
#[derive(Debug, Default)]
pub struct ChatHistory {
    entries: Vec<HistoryEntry>,
    /// Index of the trailing incomplete action entry, if any.
    open_action: Option<usize>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn push_prompt(&mut self, messages: Vec<String>, ts: i64) {
        self.open_action = None;
        self.entries.push(HistoryEntry::Prompt { messages, ts });
    }

    pub fn push_continuation(&mut self, reason: impl Into<String>, ts: i64) {
        self.open_action = None;
        self.entries.push(HistoryEntry::Continuation {
            reason: reason.into(),
            ts,
        });
    }

    /// Record a streamed action. Replaces the pending incomplete entry in
    /// place when one exists; otherwise appends.
    pub fn record_action(&mut self, action: Action, ts: i64) {
        let incomplete = !action.is_complete();
        let entry = HistoryEntry::Action { action, ts };
        match self.open_action {
            Some(index) => {
                self.entries[index] = entry;
                if !incomplete {
                    self.open_action = None;
                }
            }
            None => {
                self.entries.push(entry);
                if incomplete {
                    self.open_action = Some(self.entries.len() - 1);
                }
            }
        }
    }
}
