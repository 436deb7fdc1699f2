//! Retained message store
//!
//! At most one message per topic. Storing an empty payload clears the
//! topic, so a later subscriber receives nothing for it.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::protocol::QoS;
use crate::topic;

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub stored_at: Instant,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: RwLock<AHashMap<Arc<str>, RetainedMessage>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the retained message for `topic`.
    /// An empty payload clears it instead. Returns whether a message is now stored.
    pub fn set(&self, topic: &Arc<str>, payload: Bytes, qos: QoS) -> bool {
        if payload.is_empty() {
            self.clear(topic);
            return false;
        }
        let message = RetainedMessage {
            topic: topic.clone(),
            payload,
            qos,
            stored_at: Instant::now(),
        };
        self.messages.write().insert(topic.clone(), message);
        true
    }

    /// Remove the retained message for `topic`; returns whether one existed
    pub fn clear(&self, topic: &str) -> bool {
        self.messages.write().remove(topic).is_some()
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.messages.read().get(topic).cloned()
    }

    /// Retained messages whose topic matches `filter`, ordered by topic
    pub fn matching(&self, filter: &str) -> Vec<RetainedMessage> {
        let mut found: Vec<RetainedMessage> = self
            .messages
            .read()
            .values()
            .filter(|m| topic::matches(filter, &m.topic))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}
