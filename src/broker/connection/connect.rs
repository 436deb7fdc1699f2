//! CONNECT packet handling

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use super::{queue, rand_id, Connected, Connection, ConnectionError, SessionGuard};
use crate::broker::SharedWriter;
use crate::hooks::ClientInfo;
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolError,
    ProtocolVersion, ReasonCode,
};
use crate::session::Session;
use crate::topic::validate_topic_name_with_max_levels;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<Connected, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        other => {
                            debug!("First packet from {} was {}", self.addr, other.name());
                            Err(ProtocolError::ProtocolViolation("first packet must be CONNECT")
                                .into())
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    // Answer in the v3.1.1 framing the client can parse
                    self.encoder.set_protocol_version(ProtocolVersion::V311);
                    return Err(self.refuse(ReasonCode::UnsupportedProtocolVersion).await);
                }
                Err(e) => {
                    if let Some(version) = self.decoder.protocol_version() {
                        self.encoder.set_protocol_version(version);
                        if version == ProtocolVersion::V5 {
                            let reason = match e {
                                DecodeError::PacketTooLarge => ReasonCode::PacketTooLarge,
                                _ => ReasonCode::MalformedPacket,
                            };
                            let _ = self.refuse(reason).await;
                        }
                    }
                    return Err(e.into());
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Send a refusing CONNACK and build the matching error
    async fn refuse(&mut self, reason_code: ReasonCode) -> ConnectionError {
        let connack = ConnAck {
            session_present: false,
            reason_code,
            properties: Properties::default(),
        };
        let mut buf = BytesMut::new();
        if self
            .encoder
            .encode(&Packet::ConnAck(connack), &mut buf)
            .is_ok()
        {
            let _ = self.stream.write_all(&buf).await;
            let _ = self.stream.flush().await;
        }
        ConnectionError::Refused(reason_code)
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<Connected, ConnectionError> {
        let protocol_version = connect.protocol_version;
        self.decoder.set_protocol_version(protocol_version);
        self.encoder.set_protocol_version(protocol_version);

        // A zero-length client id is only acceptable with a clean start
        if connect.client_id.is_empty() && !connect.clean_start {
            debug!(
                "Rejecting empty client ID with clean_start=false from {}",
                self.addr
            );
            return Err(self.refuse(ReasonCode::ClientIdNotValid).await);
        }

        let assigned = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned {
            format!("edgemq-{:x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };
        let client = ClientInfo::new(client_id.clone(), connect.username.as_deref());

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        match self
            .hooks
            .on_authenticate(&client, connect.password.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Authentication failed for {}", client_id);
                return Err(self.refuse(ReasonCode::NotAuthorized).await);
            }
            Err(e) => {
                error!("Authentication error for {}: {}", client_id, e);
                return Err(self.refuse(ReasonCode::UnspecifiedError).await);
            }
        }

        if let Some(will) = &connect.will {
            let max_levels = self.config.max_topic_levels;
            let refusal = if validate_topic_name_with_max_levels(&will.topic, max_levels).is_err() {
                Some(ReasonCode::TopicNameInvalid)
            } else if will.qos > self.config.max_qos {
                Some(ReasonCode::QoSNotSupported)
            } else if will.retain && !self.config.retain_available {
                Some(ReasonCode::RetainNotSupported)
            } else {
                None
            };
            if let Some(reason) = refusal {
                debug!("Refusing will of {}: {:?}", client_id, reason);
                return Err(self.refuse(reason).await);
            }
        }

        // A takeover does not count against the limit
        let is_takeover = self.clients.contains_key(&client_id);
        if !is_takeover
            && self.config.max_connections > 0
            && self.clients.len() >= self.config.max_connections
        {
            debug!(
                "Max connections ({}) reached, rejecting {}",
                self.config.max_connections, client_id
            );
            return Err(self.refuse(ReasonCode::ServerUnavailable).await);
        }

        // Largest packet the client is willing to receive
        let client_max_packet = connect.properties.maximum_packet_size.unwrap_or(u32::MAX);
        let writer = Arc::new(SharedWriter::new(protocol_version, client_max_packet));
        let session = Session::network(client_id.clone(), writer.clone());

        if let Some(previous) = self.clients.insert(client_id.clone(), session.clone()) {
            self.take_over(&previous);
        }
        let guard = SessionGuard {
            session: session.clone(),
            dispatcher: self.dispatcher.clone(),
            clients: self.clients.clone(),
        };

        let keep_alive = if connect.keep_alive == 0 {
            self.config.default_keep_alive
        } else {
            connect.keep_alive.min(self.config.max_keep_alive)
        };

        let mut properties = Properties::default();
        if protocol_version == ProtocolVersion::V5 {
            if assigned {
                properties.assigned_client_identifier = Some(client_id.to_string());
            }
            if keep_alive != connect.keep_alive {
                properties.server_keep_alive = Some(keep_alive);
            }
            properties.maximum_qos = Some(self.config.max_qos as u8);
            if !self.config.retain_available {
                properties.retain_available = Some(0);
            }
            if !self.config.wildcard_subscription_available {
                properties.wildcard_subscription_available = Some(0);
            }
            if !self.config.subscription_identifiers_available {
                properties.subscription_identifier_available = Some(0);
            }
            properties.shared_subscription_available = Some(0);
            properties.maximum_packet_size = u32::try_from(self.config.max_packet_size).ok();
        }

        let connack = ConnAck {
            session_present: false,
            reason_code: ReasonCode::Success,
            properties,
        };
        queue(&writer, &Packet::ConnAck(connack))?;

        self.hooks.on_client_connected(&client).await;
        debug!(
            "Client {} connected from {} ({:?}, keep alive {}s)",
            client_id, self.addr, protocol_version, keep_alive
        );

        Ok(Connected {
            session,
            writer,
            client,
            protocol_version,
            keep_alive,
            will: connect.will,
            guard,
        })
    }

    /// Close the connection currently holding the client id
    fn take_over(&self, previous: &Arc<Session>) {
        debug!("Session takeover for {}", previous.client_id());
        if let Some(writer) = previous.writer() {
            if writer.protocol_version() == ProtocolVersion::V5 {
                let disconnect = Disconnect::new(ReasonCode::SessionTakenOver);
                let _ = writer.send_packet(&Packet::Disconnect(disconnect));
            }
        }
        // Closes the previous writer; its task flushes the DISCONNECT and exits
        self.dispatcher.remove_session(previous);
    }
}
