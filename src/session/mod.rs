//! Sessions
//!
//! A session is the unit the subscription registry and dispatcher deal with.
//! It is either backed by a network connection (deliveries are encoded into
//! the connection's write buffer) or by the in-process inline client
//! (deliveries are queued to the handler of the matching subscription).
//!
//! Every session carries a delivery gate. Appending to the outlet always
//! happens under the gate, and a subscribe holds it across registration and
//! retained delivery, so retained messages reach the outlet before any live
//! publish routed through the new subscription.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::broker::{InlineMessage, SendError, SharedWriter};
use crate::protocol::QoS;

/// Process-unique session identifier
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Queue feeding the worker of one inline subscription
pub type InlineSink = mpsc::UnboundedSender<InlineMessage>;

/// One message as handed to a session outlet
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Arc<str>,
    pub payload: Bytes,
    /// Effective QoS after downgrade
    pub qos: QoS,
    pub retain: bool,
    /// Identifiers of the subscriptions that matched
    pub subscription_ids: SmallVec<[u32; 2]>,
}

enum Outlet {
    Network(Arc<SharedWriter>),
    /// Handler queue per subscribed filter
    Inline(Mutex<AHashMap<Arc<str>, InlineSink>>),
}

pub struct Session {
    id: SessionId,
    client_id: Arc<str>,
    outlet: Outlet,
    alive: AtomicBool,
    gate: ReentrantMutex<()>,
}

impl Session {
    fn with_outlet(client_id: Arc<str>, outlet: Outlet) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_id,
            outlet,
            alive: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        })
    }

    /// Session backed by a network connection
    pub fn network(client_id: Arc<str>, writer: Arc<SharedWriter>) -> Arc<Self> {
        Self::with_outlet(client_id, Outlet::Network(writer))
    }

    /// Session backed by in-process handlers
    pub fn inline(client_id: Arc<str>) -> Arc<Self> {
        Self::with_outlet(client_id, Outlet::Inline(Mutex::new(AHashMap::new())))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.outlet, Outlet::Inline(_))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Returns whether the session was alive before the call
    pub(crate) fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        match &self.outlet {
            Outlet::Network(writer) => writer.close(),
            // Dropping the senders lets the workers drain and exit
            Outlet::Inline(sinks) => sinks.lock().clear(),
        }
        was_alive
    }

    /// Acquire the delivery gate. Reentrant on the same thread.
    pub fn gate(&self) -> ReentrantMutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Hand one message to the outlet. `filter` selects the inline handler.
    pub fn deliver(&self, filter: &str, delivery: &Delivery) -> Result<(), SendError> {
        let _gate = self.gate.lock();
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        match &self.outlet {
            Outlet::Network(writer) => writer.send_publish(delivery),
            Outlet::Inline(sinks) => {
                let sinks = sinks.lock();
                let sink = sinks.get(filter).ok_or(SendError::NoHandler)?;
                let subscription_id = delivery.subscription_ids.first().copied();
                sink.send(InlineMessage {
                    topic: delivery.topic.clone(),
                    payload: delivery.payload.clone(),
                    qos: delivery.qos,
                    retain: delivery.retain,
                    subscription_id,
                })
                .map_err(|_| SendError::Closed)
            }
        }
    }

    /// Network writer, if this is a network session
    pub fn writer(&self) -> Option<&Arc<SharedWriter>> {
        match &self.outlet {
            Outlet::Network(writer) => Some(writer),
            Outlet::Inline(_) => None,
        }
    }

    /// Install the handler queue for `filter`, returning the one it replaced
    pub(crate) fn attach_sink(&self, filter: Arc<str>, sink: InlineSink) -> Option<InlineSink> {
        match &self.outlet {
            Outlet::Inline(sinks) => sinks.lock().insert(filter, sink),
            Outlet::Network(_) => None,
        }
    }

    pub(crate) fn detach_sink(&self, filter: &str) -> Option<InlineSink> {
        match &self.outlet {
            Outlet::Inline(sinks) => sinks.lock().remove(filter),
            Outlet::Network(_) => None,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("inline", &self.is_inline())
            .field("alive", &self.is_alive())
            .finish()
    }
}
