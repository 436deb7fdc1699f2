//! Subscription registry
//!
//! Filter trie plus a per-session reverse index, both behind one lock so a
//! session removal is atomic with respect to lookups.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::matcher::validate_topic_filter;
use super::trie::TopicTrie;
use crate::protocol::SubscriptionOptions;
use crate::session::{Session, SessionId};

/// One (session, filter) subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    pub session: Arc<Session>,
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    /// Subscription identifier (v5.0, or the inline client's id)
    pub identifier: Option<u32>,
}

#[derive(Default)]
struct RegistryInner {
    trie: TopicTrie<Vec<Subscription>>,
    by_session: AHashMap<SessionId, AHashSet<Arc<str>>>,
}

impl RegistryInner {
    fn detach(&mut self, session_id: SessionId, filter: &str) -> bool {
        let now_empty = match self.trie.get_mut(filter) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|s| s.session.id() != session_id);
                if entries.len() == before {
                    return false;
                }
                entries.is_empty()
            }
            None => return false,
        };
        if now_empty {
            self.trie.remove(filter);
        }
        true
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the subscription of `session` to `filter`.
    ///
    /// Returns whether a subscription for the pair already existed. Fails
    /// without mutation on an invalid filter or a removed session.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
    ) -> Result<bool, &'static str> {
        validate_topic_filter(filter)?;

        let mut guard = self.inner.write();
        if !session.is_alive() {
            return Err("session is closed");
        }
        let inner = &mut *guard;

        let entries = inner.trie.entry(filter);
        if let Some(existing) = entries.iter_mut().find(|s| s.session.id() == session.id()) {
            existing.options = options;
            existing.identifier = identifier;
            return Ok(true);
        }

        let filter: Arc<str> = Arc::from(filter);
        entries.push(Subscription {
            session: session.clone(),
            filter: filter.clone(),
            options,
            identifier,
        });
        inner
            .by_session
            .entry(session.id())
            .or_default()
            .insert(filter);
        Ok(false)
    }

    /// Remove one subscription; returns whether it existed
    pub fn unsubscribe(&self, session_id: SessionId, filter: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.detach(session_id, filter) {
            return false;
        }
        if let Some(filters) = inner.by_session.get_mut(&session_id) {
            filters.remove(filter);
            if filters.is_empty() {
                inner.by_session.remove(&session_id);
            }
        }
        true
    }

    /// Remove every subscription of `session` and mark it dead.
    /// Returns the number of subscriptions removed.
    pub fn remove_session(&self, session: &Session) -> usize {
        let mut inner = self.inner.write();
        session.mark_dead();

        let Some(filters) = inner.by_session.remove(&session.id()) else {
            return 0;
        };
        for filter in &filters {
            inner.detach(session.id(), filter);
        }
        filters.len()
    }

    /// All subscriptions whose filter matches `topic`.
    ///
    /// The order is stable across calls without an intervening mutation.
    pub fn matching_subscribers(&self, topic: &str) -> SmallVec<[Subscription; 16]> {
        let mut out = SmallVec::new();
        self.inner
            .read()
            .trie
            .for_each_match(topic, |entries| out.extend(entries.iter().cloned()));
        out
    }

    /// Filters currently held by a session
    pub fn filters_of(&self, session_id: SessionId) -> Vec<Arc<str>> {
        self.inner
            .read()
            .by_session
            .get(&session_id)
            .map(|filters| filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct filters with at least one subscriber
    pub fn filter_count(&self) -> usize {
        self.inner.read().trie.len()
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.inner.read().by_session.values().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_session.is_empty()
    }
}
