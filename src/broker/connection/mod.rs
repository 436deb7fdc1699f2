//! MQTT Connection Handler
//!
//! One task per network client. The task owns the socket; everything the
//! broker sends to the client (acks and deliveries alike) goes through the
//! session's [`SharedWriter`] and is flushed here when the writer signals.

mod connect;
mod disconnect;
mod publish;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::dispatcher::Dispatcher;
use super::{shutdown_signalled, BrokerConfig, SendError, SharedWriter};
use crate::codec::{Decoder, Encoder};
use crate::hooks::{ClientInfo, Hooks};
use crate::protocol::{
    DecodeError, Disconnect, Packet, ProtocolError, ProtocolVersion, ReasonCode, Will,
};
use crate::session::Session;

/// Connected clients by client id
pub(crate) type ClientMap = DashMap<Arc<str>, Arc<Session>>;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// CONNECT refused with this reason
    Refused(ReasonCode),
    /// The client broke a rule; the connection is closed with this reason
    Violation(ReasonCode),
    Send(SendError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Refused(code) => write!(f, "CONNECT refused: {:?}", code),
            ConnectionError::Violation(code) => write!(f, "Closed by server: {:?}", code),
            ConnectionError::Send(e) => write!(f, "Send error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<SendError> for ConnectionError {
    fn from(e: SendError) -> Self {
        ConnectionError::Send(e)
    }
}

impl ConnectionError {
    /// Reason for the v5.0 DISCONNECT sent before closing, if any
    fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            ConnectionError::Violation(code) => Some(*code),
            ConnectionError::Protocol(ProtocolError::Decode(DecodeError::PacketTooLarge)) => {
                Some(ReasonCode::PacketTooLarge)
            }
            ConnectionError::Protocol(ProtocolError::Decode(_)) => {
                Some(ReasonCode::MalformedPacket)
            }
            ConnectionError::Protocol(ProtocolError::KeepAliveTimeout) => {
                Some(ReasonCode::KeepAliveTimeout)
            }
            ConnectionError::Protocol(_) => Some(ReasonCode::ProtocolError),
            _ => None,
        }
    }
}

/// Removes the session from the registry and the client map however the
/// connection task ends, including when it is aborted.
pub(crate) struct SessionGuard {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    clients: Arc<ClientMap>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self.dispatcher.remove_session(&self.session);
        let id = self.session.id();
        self.clients
            .remove_if(self.session.client_id(), |_, s| s.id() == id);
        trace!(
            "Released session {} ({} subscription(s))",
            self.session.client_id(),
            removed
        );
    }
}

/// State of an accepted client
pub(crate) struct Connected {
    pub(crate) session: Arc<Session>,
    pub(crate) writer: Arc<SharedWriter>,
    pub(crate) client: ClientInfo,
    pub(crate) protocol_version: ProtocolVersion,
    /// Negotiated keep alive in seconds, 0 disables it
    pub(crate) keep_alive: u16,
    pub(crate) will: Option<Will>,
    pub(crate) guard: SessionGuard,
}

/// What the read loop does after a packet
pub(crate) enum Flow {
    Continue,
    Disconnect { publish_will: bool },
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) decoder: Decoder,
    /// Used for CONNACK refusals, before a writer exists
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) clients: Arc<ClientMap>,
    pub(crate) config: Arc<BrokerConfig>,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        stream: S,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        clients: Arc<ClientMap>,
        config: Arc<BrokerConfig>,
        hooks: Arc<dyn Hooks>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            dispatcher,
            clients,
            config,
            hooks,
            shutdown,
        }
    }

    /// Run the connection handler until the client goes away or the broker
    /// shuts down
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.clone();
        let connect_timeout = self.config.connect_timeout;

        let connected = tokio::select! {
            result = timeout(connect_timeout, self.read_connect()) => match result {
                Ok(result) => result?,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    return Err(ConnectionError::Timeout);
                }
            },
            _ = shutdown_signalled(&mut shutdown) => return Err(ConnectionError::Shutdown),
        };

        self.run_connected(connected).await
    }

    /// Run the main connection loop
    async fn run_connected(&mut self, conn: Connected) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.clone();
        let writer = conn.writer.clone();

        // 1.5x the negotiated interval, 0 disables the check
        let keep_alive = (conn.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(conn.keep_alive) * 1500));
        let mut deadline = keep_alive.map(|k| Instant::now() + k);
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            conn.client.client_id, conn.keep_alive, keep_alive
        );

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed from {}", self.addr);
                            self.handle_disconnect(conn, true, false).await;
                            return Ok(());
                        }
                        Ok(_) => {
                            deadline = keep_alive.map(|k| Instant::now() + k);
                            match self.process_packets(&conn).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::Disconnect { publish_will }) => {
                                    self.handle_disconnect(conn, publish_will, true).await;
                                    return Ok(());
                                }
                                Err(e) => return Err(self.close_with_error(conn, e).await),
                            }
                        }
                        Err(e) => {
                            debug!("Read error from {}: {}", self.addr, e);
                            self.handle_disconnect(conn, true, false).await;
                            return Err(e.into());
                        }
                    }
                }

                // Flush outgoing packets queued by the dispatcher or by this task
                _ = writer.notified() => {
                    if let Err(e) = self.flush(&writer).await {
                        debug!("Write error to {}: {}", self.addr, e);
                        self.handle_disconnect(conn, true, false).await;
                        return Err(e);
                    }
                    if !writer.is_alive() {
                        debug!("Session of {} was closed by the broker", conn.client.client_id);
                        self.handle_disconnect(conn, true, false).await;
                        return Ok(());
                    }
                }

                _ = wait_deadline(deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", conn.client.client_id);
                    let e = ConnectionError::Protocol(ProtocolError::KeepAliveTimeout);
                    return Err(self.close_with_error(conn, e).await);
                }

                _ = shutdown_signalled(&mut shutdown) => {
                    debug!("Disconnecting {} for shutdown", conn.client.client_id);
                    if conn.protocol_version == ProtocolVersion::V5 {
                        let disconnect = Disconnect::new(ReasonCode::ServerShuttingDown);
                        let _ = writer.send_packet(&Packet::Disconnect(disconnect));
                    }
                    self.handle_disconnect(conn, false, false).await;
                    return Err(ConnectionError::Shutdown);
                }
            }
        }
    }

    /// Decode and handle every complete packet in the read buffer
    async fn process_packets(&mut self, conn: &Connected) -> Result<Flow, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            trace!("{} from {}", packet.name(), conn.client.client_id);
            if let Flow::Disconnect { publish_will } = self.handle_packet(conn, packet).await? {
                return Ok(Flow::Disconnect { publish_will });
            }
        }
        Ok(Flow::Continue)
    }

    /// Handle an incoming packet
    async fn handle_packet(
        &mut self,
        conn: &Connected,
        packet: Packet,
    ) -> Result<Flow, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(conn, publish).await,
            Packet::PubAck(puback) => {
                // Nothing is retransmitted, so there is no state to release
                trace!(
                    "PUBACK {} from {}",
                    puback.packet_id,
                    conn.client.client_id
                );
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(conn, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(conn, unsubscribe),
            Packet::PingReq => {
                queue(&conn.writer, &Packet::PingResp)?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect(disconnect) => {
                debug!(
                    "DISCONNECT from {} (reason: {:?})",
                    conn.client.client_id, disconnect.reason_code
                );
                // Normal disconnection discards the will; 0x04 keeps it
                let publish_will = disconnect.reason_code == ReasonCode::DisconnectWithWill;
                Ok(Flow::Disconnect { publish_will })
            }
            other => {
                warn!(
                    "Unexpected {} from {}",
                    other.name(),
                    conn.client.client_id
                );
                Err(ProtocolError::ProtocolViolation("unexpected packet type").into())
            }
        }
    }

    /// Write everything queued on the writer to the socket
    pub(crate) async fn flush(&mut self, writer: &SharedWriter) -> Result<(), ConnectionError> {
        let data = writer.take_buffer();
        if !data.is_empty() {
            self.stream.write_all(&data).await?;
        }
        Ok(())
    }

    /// Tell a v5.0 client why it is being dropped, then release the session
    async fn close_with_error(&mut self, conn: Connected, error: ConnectionError) -> ConnectionError {
        debug!("Closing {}: {}", conn.client.client_id, error);
        if conn.protocol_version == ProtocolVersion::V5 {
            if let Some(reason) = error.disconnect_reason() {
                let _ = conn
                    .writer
                    .send_packet(&Packet::Disconnect(Disconnect::new(reason)));
            }
        }
        self.handle_disconnect(conn, true, false).await;
        error
    }
}

/// Queue a packet for this connection. A closed writer is not an error
/// here; the connection loop notices it on the next wakeup.
pub(crate) fn queue(writer: &SharedWriter, packet: &Packet) -> Result<(), ConnectionError> {
    match writer.send_packet(packet) {
        Ok(()) | Err(SendError::Closed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
