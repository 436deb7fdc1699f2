//! Topic matching and subscription management
//!
//! Filter matching and validation follow the MQTT topic rules; the registry
//! indexes subscriptions in a segment trie so a publish only visits the
//! branches that can match its topic.

mod matcher;
mod registry;
mod trie;

pub use matcher::{
    has_wildcards, matches, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name, validate_topic_name_with_max_levels,
};
pub use registry::{Subscription, SubscriptionRegistry};
pub use trie::TopicTrie;
