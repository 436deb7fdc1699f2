//! MQTT Broker Core
//!
//! The broker accepts TCP clients, hosts the optional inline client and
//! owns the dispatcher. Lifecycle: construct, [`Broker::run`] until the
//! shutdown signal, then every session is released.

mod connection;
mod dispatcher;
mod error;
mod inline;
mod writer;

pub use connection::ConnectionError;
pub use dispatcher::{Dispatcher, Message};
pub use error::BrokerError;
pub use inline::{InlineClient, InlineHandler, InlineMessage, INLINE_CLIENT_ID};
pub use writer::{SendError, SharedWriter};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::QoS;
use crate::topic::validate_topic_name;
use connection::{ClientMap, Connection};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum connections (0 = unbounded)
    pub max_connections: usize,
    /// Maximum incoming packet size
    pub max_packet_size: usize,
    /// Time a new connection has to send CONNECT
    pub connect_timeout: Duration,
    /// Maximum levels in a topic name or filter from a client (0 = unlimited)
    pub max_topic_levels: usize,
    /// Default keep alive (if client specifies 0)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Maximum QoS (0 or 1)
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Host the in-process inline client
    pub inline_client: bool,
    /// How long shutdown waits for connections before aborting them
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 10_000,
            max_packet_size: 1024 * 1024, // 1 MB
            connect_timeout: Duration::from_secs(10),
            max_topic_levels: 128,
            default_keep_alive: 60,
            max_keep_alive: 65535,
            max_qos: QoS::AtLeastOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            inline_client: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        let max_qos = QoS::from_u8(config.mqtt.max_qos)
            .unwrap_or(QoS::AtLeastOnce)
            .min(QoS::AtLeastOnce);
        Self {
            bind_addr: config.server.bind,
            max_connections: config.limits.max_connections,
            max_packet_size: config.limits.max_packet_size,
            connect_timeout: config.limits.connect_timeout_duration(),
            max_topic_levels: config.limits.max_topic_levels,
            default_keep_alive: config.session.default_keep_alive,
            max_keep_alive: config.session.max_keep_alive,
            max_qos,
            retain_available: config.mqtt.retain_available,
            wildcard_subscription_available: config.mqtt.wildcard_subscriptions,
            subscription_identifiers_available: config.mqtt.subscription_identifiers,
            inline_client: config.mqtt.inline_client,
            shutdown_timeout: config.server.shutdown_timeout_duration(),
        }
    }
}

/// Triggers broker shutdown from another task
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Resolves once shutdown was requested, or when the broker is gone
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// The MQTT Broker
pub struct Broker {
    config: Arc<BrokerConfig>,
    dispatcher: Arc<Dispatcher>,
    /// Connected network clients by client id
    clients: Arc<ClientMap>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    inline: Option<InlineClient>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new());
        let inline = config
            .inline_client
            .then(|| InlineClient::new(dispatcher.clone(), hooks.clone()));

        Self {
            config: Arc::new(config),
            dispatcher,
            clients: Arc::new(ClientMap::new()),
            hooks,
            inline,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The inline client, unless disabled in the configuration
    pub fn inline_client(&self) -> Option<&InlineClient> {
        self.inline.as_ref()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Request shutdown; [`Broker::run`] returns once connections are closed
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Bind the listener and serve until shutdown.
    ///
    /// A bind failure is returned immediately. On shutdown the listener is
    /// closed, connected clients are disconnected (v5.0 clients receive
    /// DISCONNECT Server shutting down) and every session is released.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", listener.local_addr()?);

        let mut shutdown = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        let mut conn = Connection::new(
                            stream,
                            addr,
                            self.dispatcher.clone(),
                            self.clients.clone(),
                            self.config.clone(),
                            self.hooks.clone(),
                            self.shutdown.subscribe(),
                        );
                        connections.spawn(async move {
                            if let Err(e) = conn.run().await {
                                debug!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },

                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!("Shutting down ({} connection(s) open)", connections.len());

        let grace = self.config.shutdown_timeout;
        let drained = timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, aborting",
                connections.len(),
                grace
            );
            connections.shutdown().await;
        }

        self.release_inline();
        info!("Broker stopped");
        Ok(())
    }

    /// Publish a message from the server itself. Hooks are not consulted.
    ///
    /// Returns the number of subscribers the message was handed to.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopicName)?;
        let message = Message::new(topic, payload, qos.min(QoS::AtLeastOnce), retain);
        Ok(self.dispatcher.publish(&message))
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of registered subscriptions, inline ones included
    pub fn subscription_count(&self) -> usize {
        self.dispatcher.registry().len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.dispatcher.retained().len()
    }

    /// Payload currently retained for `topic`
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.dispatcher.retained().get(topic).map(|m| m.payload)
    }

    fn release_inline(&self) {
        if let Some(inline) = &self.inline {
            let removed = self.dispatcher.remove_session(inline.session());
            if removed > 0 {
                debug!("Released inline client ({} subscription(s))", removed);
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Inline workers hold the inline session; releasing it stops them
        self.release_inline();
    }
}
