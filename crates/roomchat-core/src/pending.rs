//! Table of outbound messages awaiting acknowledgment.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{MessageId, OutboundFrame};

/// Outbound message not yet acknowledged by the far end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: MessageId,
    pub message: String,
    pub recipient_id: String,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
}

impl PendingMessage {
    /// Wire frame carrying this message.
    #[must_use]
    pub fn to_frame(&self) -> OutboundFrame {
        OutboundFrame::ChatMessage {
            message_id: self.id.clone(),
            message: self.message.clone(),
            recipient_id: self.recipient_id.clone(),
        }
    }
}

/// Pending messages keyed by id, iterated in insertion order.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u64, PendingMessage>,
    index: HashMap<MessageId, u64>,
    next_seq: u64,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message. Returns false if its id is already pending.
    pub fn insert(&mut self, msg: PendingMessage) -> bool {
        if self.index.contains_key(&msg.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(msg.id.clone(), seq);
        self.entries.insert(seq, msg);
        true
    }

    /// Remove a message by id.
    pub fn remove(&mut self, id: &MessageId) -> Option<PendingMessage> {
        let seq = self.index.remove(id)?;
        self.entries.remove(&seq)
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
