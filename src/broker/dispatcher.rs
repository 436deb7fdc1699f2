//! Message dispatch
//!
//! Runs synchronously on the publishing task: update the retained store,
//! look up the matching subscriptions and hand each one a copy. Handing off
//! never awaits; network sessions get the encoded packet appended to their
//! write buffer and inline subscriptions get it queued for their worker.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::broker::SendError;
use crate::protocol::{QoS, RetainHandling, SubscriptionOptions};
use crate::retained::RetainedStore;
use crate::session::{Delivery, Session, SessionId};
use crate::topic::SubscriptionRegistry;

/// A message handed to the dispatcher. Immutable once published.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Publishing session, used for the no-local option
    pub publisher: Option<SessionId>,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            publisher: None,
        }
    }

    pub fn from_session(mut self, session: SessionId) -> Self {
        self.publisher = Some(session);
        self
    }
}

/// One network session's merged copy of a message
struct Pending {
    session: Arc<Session>,
    filter: Arc<str>,
    qos: QoS,
    retain: bool,
    subscription_ids: SmallVec<[u32; 2]>,
}

/// Owns the subscription registry and the retained store
#[derive(Default)]
pub struct Dispatcher {
    registry: SubscriptionRegistry,
    retained: RetainedStore,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    /// Route `message` to every matching subscription.
    ///
    /// Returns the number of successful hand-offs. A network session with
    /// several matching filters counts once; every inline subscription
    /// counts on its own.
    pub fn publish(&self, message: &Message) -> usize {
        if message.retain {
            self.retained
                .set(&message.topic, message.payload.clone(), message.qos);
        }

        let subscribers = self.registry.matching_subscribers(&message.topic);
        if subscribers.is_empty() {
            trace!("No subscribers for {}", message.topic);
            return 0;
        }

        let mut delivered = 0;
        let mut network: AHashMap<SessionId, Pending> = AHashMap::with_capacity(subscribers.len());

        for sub in subscribers {
            if sub.options.no_local && message.publisher == Some(sub.session.id()) {
                continue;
            }
            let qos = sub.options.qos.min(message.qos);
            let retain = message.retain && sub.options.retain_as_published;

            if sub.session.is_inline() {
                let delivery = Delivery {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                    qos,
                    retain,
                    subscription_ids: sub.identifier.into_iter().collect(),
                };
                delivered += hand_off(&sub.session, &sub.filter, &delivery);
                continue;
            }

            match network.entry(sub.session.id()) {
                Entry::Occupied(mut entry) => {
                    let pending = entry.get_mut();
                    pending.qos = pending.qos.max(qos);
                    pending.retain |= retain;
                    pending.subscription_ids.extend(sub.identifier);
                }
                Entry::Vacant(entry) => {
                    entry.insert(Pending {
                        qos,
                        retain,
                        subscription_ids: sub.identifier.into_iter().collect(),
                        session: sub.session,
                        filter: sub.filter,
                    });
                }
            }
        }

        for pending in network.into_values() {
            let delivery = Delivery {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: pending.qos,
                retain: pending.retain,
                subscription_ids: pending.subscription_ids,
            };
            delivered += hand_off(&pending.session, &pending.filter, &delivery);
        }

        trace!("Published {} to {} subscriber(s)", message.topic, delivered);
        delivered
    }

    /// Register a subscription and deliver the matching retained messages
    /// before any live publish can reach the session through it.
    ///
    /// Returns whether the subscription already existed.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
    ) -> Result<bool, &'static str> {
        let _gate = session.gate();
        let existed = self.registry.subscribe(session, filter, options, identifier)?;
        self.deliver_retained(session, filter, options, identifier, existed);
        Ok(existed)
    }

    pub fn unsubscribe(&self, session_id: SessionId, filter: &str) -> bool {
        self.registry.unsubscribe(session_id, filter)
    }

    /// Drop every subscription of `session` and mark it dead
    pub fn remove_session(&self, session: &Session) -> usize {
        self.registry.remove_session(session)
    }

    /// Queue the retained messages matching `filter` to `session`.
    ///
    /// Callers that need other packets (SUBACK) between registration and
    /// the retained messages hold the session gate across both steps.
    pub(crate) fn deliver_retained(
        &self,
        session: &Session,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
        existed: bool,
    ) -> usize {
        match options.retain_handling {
            RetainHandling::DoNotSend => return 0,
            RetainHandling::SendAtSubscribeIfNew if existed => return 0,
            _ => {}
        }

        let _gate = session.gate();
        let mut delivered = 0;
        for message in self.retained.matching(filter) {
            let delivery = Delivery {
                topic: message.topic,
                payload: message.payload,
                qos: options.qos.min(message.qos),
                retain: true,
                subscription_ids: identifier.into_iter().collect(),
            };
            delivered += hand_off(session, filter, &delivery);
        }
        if delivered > 0 {
            trace!(
                "Sent {} retained message(s) for {} to {}",
                delivered,
                filter,
                session.client_id()
            );
        }
        delivered
    }
}

/// Failures stay with the subscriber they concern
fn hand_off(session: &Session, filter: &str, delivery: &Delivery) -> usize {
    match session.deliver(filter, delivery) {
        Ok(()) => 1,
        Err(SendError::Closed) => {
            trace!(
                "Skipping {} for closed session {}",
                delivery.topic,
                session.client_id()
            );
            0
        }
        Err(e) => {
            debug!(
                "Delivery of {} to {} failed: {}",
                delivery.topic,
                session.client_id(),
                e
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InlineMessage, SharedWriter};
    use crate::codec::Decoder;
    use crate::protocol::{Packet, ProtocolVersion};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn inline_subscriber(
        dispatcher: &Dispatcher,
        filter: &str,
        id: Option<u32>,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<InlineMessage>) {
        let session = Session::inline("inline".into());
        let rx = attach(dispatcher, &session, filter, id);
        (session, rx)
    }

    fn attach(
        dispatcher: &Dispatcher,
        session: &Arc<Session>,
        filter: &str,
        id: Option<u32>,
    ) -> mpsc::UnboundedReceiver<InlineMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        session.attach_sink(filter.into(), tx);
        dispatcher
            .subscribe(session, filter, SubscriptionOptions::with_qos(QoS::AtLeastOnce), id)
            .unwrap();
        rx
    }

    fn network_subscriber(version: ProtocolVersion) -> (Arc<Session>, Arc<SharedWriter>) {
        let writer = Arc::new(SharedWriter::new(version, u32::MAX));
        (Session::network("net".into(), writer.clone()), writer)
    }

    fn published(writer: &SharedWriter, version: ProtocolVersion) -> Vec<crate::protocol::Publish> {
        let bytes = writer.take_buffer();
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(version);
        let mut offset = 0;
        let mut out = Vec::new();
        while let Some((packet, used)) = decoder.decode(&bytes[offset..]).unwrap() {
            match packet {
                Packet::Publish(p) => out.push(p),
                other => panic!("unexpected packet {:?}", other),
            }
            offset += used;
        }
        out
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InlineMessage>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push((
                m.topic.to_string(),
                String::from_utf8_lossy(&m.payload).into_owned(),
            ));
        }
        out
    }

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = Dispatcher::new();
        let count = dispatcher.publish(&Message::new("nobody/home", "x", QoS::AtMostOnce, false));
        assert_eq!(count, 0);
    }

    #[test]
    fn test_fifo_per_subscriber() {
        let dispatcher = Dispatcher::new();
        let (_session, mut rx) = inline_subscriber(&dispatcher, "a/b", None);

        for payload in ["p1", "p2", "p3"] {
            assert_eq!(
                dispatcher.publish(&Message::new("a/b", payload, QoS::AtMostOnce, false)),
                1
            );
        }
        let payloads: Vec<_> = drain(&mut rx).into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_retained_replace_and_clear() {
        let dispatcher = Dispatcher::new();
        dispatcher.publish(&Message::new("t", "old", QoS::AtMostOnce, true));
        dispatcher.publish(&Message::new("t", "new", QoS::AtMostOnce, true));

        let (_s, mut rx) = inline_subscriber(&dispatcher, "t", None);
        assert_eq!(drain(&mut rx), vec![("t".to_string(), "new".to_string())]);

        dispatcher.publish(&Message::new("t", Bytes::new(), QoS::AtMostOnce, true));
        assert!(dispatcher.retained().is_empty());

        let (_s2, mut rx2) = inline_subscriber(&dispatcher, "t", None);
        assert!(drain(&mut rx2).is_empty());
    }

    #[test]
    fn test_retained_before_live() {
        let dispatcher = Dispatcher::new();
        dispatcher.publish(&Message::new("sensor/1", "retained", QoS::AtMostOnce, true));

        let (_s, mut rx) = inline_subscriber(&dispatcher, "sensor/+", None);
        dispatcher.publish(&Message::new("sensor/1", "live", QoS::AtMostOnce, false));

        let first = rx.try_recv().unwrap();
        assert!(first.retain);
        assert_eq!(&first.payload[..], b"retained");
        let second = rx.try_recv().unwrap();
        assert!(!second.retain);
        assert_eq!(&second.payload[..], b"live");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_qos_downgrade_and_merge_for_network_session() {
        let dispatcher = Dispatcher::new();
        let (session, writer) = network_subscriber(ProtocolVersion::V5);
        dispatcher
            .subscribe(&session, "a/+", SubscriptionOptions::with_qos(QoS::AtMostOnce), Some(3))
            .unwrap();
        dispatcher
            .subscribe(&session, "a/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), Some(4))
            .unwrap();

        let count = dispatcher.publish(&Message::new("a/b", "v", QoS::AtLeastOnce, false));
        assert_eq!(count, 1);

        let packets = published(&writer, ProtocolVersion::V5);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].qos, QoS::AtLeastOnce);
        let mut ids = packets[0].properties.subscription_identifiers.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 4]);

        dispatcher.publish(&Message::new("a/b", "v", QoS::AtMostOnce, false));
        let packets = published(&writer, ProtocolVersion::V5);
        assert_eq!(packets[0].qos, QoS::AtMostOnce);
        assert_eq!(packets[0].packet_id, None);
    }

    #[test]
    fn test_inline_subscriptions_delivered_separately() {
        let dispatcher = Dispatcher::new();
        let session = Session::inline("inline".into());
        let mut exact = attach(&dispatcher, &session, "x/y", Some(1));
        let mut wild = attach(&dispatcher, &session, "x/#", Some(2));

        assert_eq!(dispatcher.publish(&Message::new("x/y", "v", QoS::AtMostOnce, false)), 2);
        assert_eq!(exact.try_recv().unwrap().subscription_id, Some(1));
        assert_eq!(wild.try_recv().unwrap().subscription_id, Some(2));
    }

    #[test]
    fn test_no_local() {
        let dispatcher = Dispatcher::new();
        let (session, writer) = network_subscriber(ProtocolVersion::V5);
        let options = SubscriptionOptions {
            no_local: true,
            ..Default::default()
        };
        dispatcher.subscribe(&session, "echo", options, None).unwrap();

        let own = Message::new("echo", "v", QoS::AtMostOnce, false).from_session(session.id());
        assert_eq!(dispatcher.publish(&own), 0);
        assert_eq!(dispatcher.publish(&Message::new("echo", "v", QoS::AtMostOnce, false)), 1);
        assert_eq!(published(&writer, ProtocolVersion::V5).len(), 1);
    }

    #[test]
    fn test_retain_as_published() {
        let dispatcher = Dispatcher::new();
        let (plain, plain_writer) = network_subscriber(ProtocolVersion::V5);
        let (rap, rap_writer) = network_subscriber(ProtocolVersion::V5);
        dispatcher
            .subscribe(&plain, "r", SubscriptionOptions::default(), None)
            .unwrap();
        let options = SubscriptionOptions {
            retain_as_published: true,
            ..Default::default()
        };
        dispatcher.subscribe(&rap, "r", options, None).unwrap();

        dispatcher.publish(&Message::new("r", "v", QoS::AtMostOnce, true));
        assert!(!published(&plain_writer, ProtocolVersion::V5)[0].retain);
        assert!(published(&rap_writer, ProtocolVersion::V5)[0].retain);
    }

    #[test]
    fn test_retain_handling() {
        let dispatcher = Dispatcher::new();
        dispatcher.publish(&Message::new("r/1", "v", QoS::AtMostOnce, true));
        let (session, writer) = network_subscriber(ProtocolVersion::V5);

        let never = SubscriptionOptions {
            retain_handling: RetainHandling::DoNotSend,
            ..Default::default()
        };
        dispatcher.subscribe(&session, "r/#", never, None).unwrap();
        assert!(published(&writer, ProtocolVersion::V5).is_empty());

        let if_new = SubscriptionOptions {
            retain_handling: RetainHandling::SendAtSubscribeIfNew,
            ..Default::default()
        };
        assert!(dispatcher.subscribe(&session, "r/#", if_new, None).unwrap());
        assert!(published(&writer, ProtocolVersion::V5).is_empty());

        assert!(!dispatcher.subscribe(&session, "r/+", if_new, None).unwrap());
        let packets = published(&writer, ProtocolVersion::V5);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].retain);
    }

    #[test]
    fn test_failing_subscriber_does_not_affect_others() {
        let dispatcher = Dispatcher::new();
        let (closing, _closing_writer) = network_subscriber(ProtocolVersion::V311);
        let (healthy, healthy_writer) = network_subscriber(ProtocolVersion::V311);
        for session in [&closing, &healthy] {
            dispatcher
                .subscribe(session, "t", SubscriptionOptions::default(), None)
                .unwrap();
        }

        // Closed transport whose registry entries are not yet removed
        closing.mark_dead();
        assert_eq!(dispatcher.publish(&Message::new("t", "v", QoS::AtMostOnce, false)), 1);
        assert_eq!(published(&healthy_writer, ProtocolVersion::V311).len(), 1);
    }

    #[test]
    fn test_removed_session_gets_nothing() {
        let dispatcher = Dispatcher::new();
        let (session, mut rx) = inline_subscriber(&dispatcher, "a/#", None);
        attach(&dispatcher, &session, "b", None);

        assert_eq!(dispatcher.remove_session(&session), 2);
        assert!(dispatcher.registry().is_empty());
        assert_eq!(dispatcher.publish(&Message::new("a/1", "v", QoS::AtMostOnce, false)), 0);
        assert!(rx.try_recv().is_err());
        assert!(dispatcher
            .subscribe(&session, "a/#", SubscriptionOptions::default(), None)
            .is_err());
    }

    #[test]
    fn test_wildcard_does_not_reach_dollar_topics() {
        let dispatcher = Dispatcher::new();
        let (_s, mut rx) = inline_subscriber(&dispatcher, "#", None);
        assert_eq!(dispatcher.publish(&Message::new("$SYS/stats", "1", QoS::AtMostOnce, false)), 0);
        assert_eq!(dispatcher.publish(&Message::new("a", "1", QoS::AtMostOnce, false)), 1);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_deep_topic_on_worker_sized_stack() {
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let deep = "/".repeat(60_000);
                let dispatcher = Dispatcher::new();
                let (session, writer) = network_subscriber(ProtocolVersion::V5);
                dispatcher
                    .subscribe(&session, &deep, SubscriptionOptions::default(), None)
                    .unwrap();

                let message = Message::new(deep.as_str(), "x", QoS::AtMostOnce, false);
                assert_eq!(dispatcher.publish(&message), 1);
                assert_eq!(published(&writer, ProtocolVersion::V5).len(), 1);
                assert_eq!(dispatcher.remove_session(&session), 1);
                assert!(dispatcher.registry().is_empty());
            })
            .unwrap();
        handle.join().unwrap();
    }
}
