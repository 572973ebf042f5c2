use crate::models::message::{Message, MessageId, NewMessage};
use crate::services::error::StoreError;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Number of messages kept when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 50;

/// Bounded, newest-first collection of captured messages.
///
/// Shared by every SMTP session and by the caller inspecting the mailbox.
/// All mutations and the transaction counter go through one write lock, so
/// readers always see a complete list.
#[derive(Debug)]
pub struct MessageStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: VecDeque<Message>,
    last_id: MessageId,
    transactions: u64,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageStore {
    /// Creates an empty store holding at most `capacity` messages (at least one).
    pub fn new(capacity: usize) -> Self {
        MessageStore {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a message at the front, evicting the oldest entries past capacity.
    /// Counts as one processed transaction.
    pub fn insert(&self, new_message: NewMessage) -> Message {
        let mut inner = self.write();
        inner.last_id += 1;
        inner.transactions += 1;

        let message = new_message.into_message(inner.last_id, Utc::now());
        inner.messages.push_front(message.clone());

        while inner.messages.len() > self.capacity {
            if let Some(evicted) = inner.messages.pop_back() {
                debug!("Evicted message {} (capacity {})", evicted.id, self.capacity);
            }
        }

        info!(
            "Email {} from '{}' stored. Total messages: {}",
            message.id,
            message.from,
            inner.messages.len()
        );
        message
    }

    /// All messages, newest first.
    pub fn list(&self) -> Vec<Message> {
        self.read().messages.iter().cloned().collect()
    }

    pub fn get(&self, id: MessageId) -> Result<Message, StoreError> {
        self.read()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Removes one message. Returns whether it existed.
    pub fn delete(&self, id: MessageId) -> bool {
        let mut inner = self.write();
        match inner.messages.iter().position(|m| m.id == id) {
            Some(index) => {
                inner.messages.remove(index);
                info!(
                    "Message {} deleted. Remaining messages: {}",
                    id,
                    inner.messages.len()
                );
                true
            }
            None => false,
        }
    }

    /// Empties the store. The transaction counter is left untouched.
    pub fn clear(&self) {
        self.write().messages.clear();
        info!("All messages cleared");
    }

    /// Transactions stored since creation. Never decreases.
    pub fn connection_count(&self) -> u64 {
        self.read().transactions
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Envelope;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn draft(subject: &str) -> NewMessage {
        NewMessage {
            from: "a@x.com".to_string(),
            to: "b@y.com".to_string(),
            subject: subject.to_string(),
            date: String::new(),
            plain_body: "hello".to_string(),
            html_body: None,
            envelope: Envelope::default(),
            size: 5,
        }
    }

    #[test]
    fn keeps_newest_entries_up_to_capacity() {
        let store = MessageStore::new(3);
        for i in 0..7 {
            store.insert(draft(&format!("m{i}")));
        }

        let subjects: Vec<_> = store.list().into_iter().map(|m| m.subject).collect();
        assert_eq!(subjects, vec!["m6", "m5", "m4"]);
        assert_eq!(store.connection_count(), 7);
    }

    #[test]
    fn default_capacity_is_fifty() {
        let store = MessageStore::default();
        for i in 0..60 {
            store.insert(draft(&i.to_string()));
        }
        assert_eq!(store.len(), DEFAULT_CAPACITY);
        assert_eq!(store.list()[0].subject, "59");
        assert_eq!(store.list()[49].subject, "10");
    }

    #[test]
    fn stamps_unique_ids_and_capture_time() {
        let store = MessageStore::new(10);
        let first = store.insert(draft("a"));
        let second = store.insert(draft("b"));
        assert_ne!(first.id, second.id);
        assert!(second.received_at >= first.received_at);
        assert!(!first.has_html);
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let store = MessageStore::new(10);
        let message = store.insert(draft("a"));
        store.insert(draft("b"));

        assert!(store.delete(message.id));
        assert_eq!(store.get(message.id), Err(StoreError::NotFound(message.id)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn delete_unknown_id_leaves_store_unchanged() {
        let store = MessageStore::new(10);
        store.insert(draft("a"));
        let before = store.list();

        assert!(!store.delete(9999));
        assert_eq!(store.list(), before);
    }

    #[test]
    fn clear_keeps_connection_count() {
        let store = MessageStore::new(10);
        store.insert(draft("a"));
        store.insert(draft("b"));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.connection_count(), 2);

        let next = store.insert(draft("c"));
        assert_eq!(next.id, 3);
        assert_eq!(store.connection_count(), 3);
    }

    #[test]
    fn concurrent_inserts_never_collide() {
        let store = Arc::new(MessageStore::new(1000));
        let workers: Vec<_> = (0..8)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..25 {
                        store.insert(draft(&format!("{w}-{i}")));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let ids: HashSet<_> = store.list().into_iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(store.connection_count(), 200);
    }
}
