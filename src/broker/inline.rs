//! Inline client
//!
//! An in-process participant that subscribes and publishes without a
//! network round trip. Each inline subscription is served by its own worker
//! task draining an ordered queue, so a handler never runs twice at once
//! for the same subscription and may itself publish (even to its own
//! filter) without deadlocking the dispatcher. Subscribing again to the
//! same filter starts the new handler only after the previous worker has
//! drained what was already queued to it.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::dispatcher::{Dispatcher, Message};
use super::BrokerError;
use crate::hooks::{Access, ClientInfo, Hooks};
use crate::protocol::{QoS, SubscriptionOptions};
use crate::session::Session;
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Client id of the inline session
pub const INLINE_CLIENT_ID: &str = "inline";

/// A message delivered to an inline handler
#[derive(Debug, Clone)]
pub struct InlineMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Identifier given when subscribing
    pub subscription_id: Option<u32>,
}

/// Callback of one inline subscription
#[async_trait]
pub trait InlineHandler: Send + Sync + 'static {
    async fn on_message(&self, client: &InlineClient, message: InlineMessage);
}

/// Forwards every message into a channel
#[async_trait]
impl InlineHandler for mpsc::UnboundedSender<InlineMessage> {
    async fn on_message(&self, _client: &InlineClient, message: InlineMessage) {
        let _ = self.send(message);
    }
}

/// Handle to the broker's inline session. Cheap to clone.
#[derive(Clone)]
pub struct InlineClient {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    hooks: Arc<dyn Hooks>,
    info: ClientInfo,
    /// Latest worker per filter
    workers: Arc<Mutex<AHashMap<Arc<str>, JoinHandle<()>>>>,
}

impl InlineClient {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, hooks: Arc<dyn Hooks>) -> Self {
        let info = ClientInfo::new(INLINE_CLIENT_ID, None);
        Self {
            session: Session::inline(info.client_id.clone()),
            dispatcher,
            hooks,
            info,
            workers: Arc::default(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.info.client_id
    }

    /// False once the broker has released the inline session
    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Subscribe `handler` to `filter`.
    ///
    /// `subscription_id` is reported back in every [`InlineMessage`]; 0
    /// means none. Subscribing again to the same filter replaces the
    /// handler. Matching retained messages are queued to the handler before
    /// any live message.
    pub async fn subscribe<H: InlineHandler>(
        &self,
        filter: &str,
        subscription_id: u32,
        handler: H,
    ) -> Result<(), BrokerError> {
        validate_topic_filter(filter).map_err(BrokerError::InvalidTopicFilter)?;
        if !self.is_alive() {
            return Err(BrokerError::Closed);
        }

        let options = SubscriptionOptions::with_qos(QoS::AtLeastOnce);
        let access = Access::Subscribe {
            filter,
            qos: options.qos,
        };
        if !self.hooks.on_authorize(&self.info, access).await? {
            debug!("Inline subscription to {} not authorized", filter);
            return Err(BrokerError::NotAuthorized);
        }

        let identifier = (subscription_id != 0).then_some(subscription_id);
        let filter: Arc<str> = Arc::from(filter);
        let (tx, mut rx) = mpsc::unbounded_channel::<InlineMessage>();

        {
            let _gate = self.session.gate();
            self.session.attach_sink(filter.clone(), tx);
            let existed = match self
                .dispatcher
                .registry()
                .subscribe(&self.session, &filter, options, identifier)
            {
                Ok(existed) => existed,
                Err(why) => {
                    self.session.detach_sink(&filter);
                    return Err(if self.is_alive() {
                        BrokerError::InvalidTopicFilter(why)
                    } else {
                        BrokerError::Closed
                    });
                }
            };
            self.dispatcher
                .deliver_retained(&self.session, &filter, options, identifier, existed);

            let mut workers = self.workers.lock();
            workers.retain(|_, worker| !worker.is_finished());
            // Replacing the sink closed the previous queue; it ends once drained
            let previous = workers.remove(&filter);
            let client = self.clone();
            let name = filter.clone();
            let worker = tokio::spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                while let Some(message) = rx.recv().await {
                    handler.on_message(&client, message).await;
                }
                trace!("Inline worker for {} stopped", name);
            });
            workers.insert(filter, worker);
        }
        Ok(())
    }

    /// Remove the subscription to `filter`; returns whether it existed.
    /// Messages already queued to its handler are still processed.
    pub fn unsubscribe(&self, filter: &str) -> bool {
        let _gate = self.session.gate();
        let existed = self.dispatcher.unsubscribe(self.session.id(), filter);
        self.session.detach_sink(filter);
        existed
    }

    /// Publish through the dispatcher. QoS above 1 is downgraded to 1.
    ///
    /// Returns the number of subscribers the message was handed to.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        retain: bool,
        qos: QoS,
    ) -> Result<usize, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopicName)?;
        if !self.is_alive() {
            return Err(BrokerError::Closed);
        }

        let qos = qos.min(QoS::AtLeastOnce);
        let access = Access::Publish { topic, qos, retain };
        if !self.hooks.on_authorize(&self.info, access).await? {
            debug!("Inline publish to {} not authorized", topic);
            return Err(BrokerError::NotAuthorized);
        }

        let message = Message::new(topic, payload, qos, retain).from_session(self.session.id());
        Ok(self.dispatcher.publish(&message))
    }
}

impl std::fmt::Debug for InlineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineClient")
            .field("session", &self.session)
            .finish()
    }
}
