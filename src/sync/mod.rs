//! Client-side sync primitives: the ordered message store and the
//! incremental fetch cursor.
//!
//! Both types are plain state machines with no I/O. The poll loop in
//! [`crate::session`] owns one of each and drives them from fetch
//! results.

use std::collections::HashSet;

use crate::model::{Message, MessageId};

/// Tracks the newest message id this client has observed. `None` means
/// "never synced": the next fetch must ask for the full history.
#[derive(Debug, Clone, Default)]
pub struct SyncCursor {
    last_seen: Option<MessageId>,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> Option<&MessageId> {
        self.last_seen.as_ref()
    }

    /// Advance to the cursor a fetch reported. The backend sends `None`
    /// for empty batches; the cursor keeps its position so the client
    /// never re-downloads history it already has.
    pub fn advance(&mut self, last_message_id: Option<MessageId>) {
        if let Some(id) = last_message_id {
            self.last_seen = Some(id);
        }
    }

    /// Forget the position entirely. The next fetch becomes a full load.
    pub fn reset(&mut self) {
        self.last_seen = None;
    }
}

/// Ordered transcript of a conversation as observed by this client.
///
/// Messages keep the order the server returned them in; ids the store
/// has already absorbed are dropped on append, so a transport that
/// replays a batch cannot duplicate history.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a full history snapshot, discarding whatever was held
    /// before. Duplicate ids inside the snapshot keep their first
    /// occurrence.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.seen.clear();
        for message in messages {
            self.push_unseen(message);
        }
    }

    /// Append messages that are new to this store, in the order given.
    /// Returns how many were actually appended.
    pub fn append_new(&mut self, messages: Vec<Message>) -> usize {
        let before = self.messages.len();
        for message in messages {
            self.push_unseen(message);
        }
        self.messages.len() - before
    }

    fn push_unseen(&mut self, message: Message) {
        if self.seen.insert(message.id.clone()) {
            self.messages.push(message);
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Owned copy of the transcript for publishing to observers.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
