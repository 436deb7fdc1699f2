//! PUBLISH packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, trace};

use super::{queue, Connected, Connection, ConnectionError, Flow};
use crate::broker::dispatcher::Message;
use crate::hooks::Access;
use crate::protocol::{Packet, PubAck, Publish, QoS, ReasonCode};
use crate::topic::validate_topic_name_with_max_levels;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBLISH packet
    pub(crate) async fn handle_publish(
        &mut self,
        conn: &Connected,
        publish: Publish,
    ) -> Result<Flow, ConnectionError> {
        if publish.qos > self.config.max_qos {
            debug!(
                "{} published at {:?} above the maximum {:?}",
                conn.client.client_id, publish.qos, self.config.max_qos
            );
            return Err(ConnectionError::Violation(ReasonCode::QoSNotSupported));
        }
        // Topic Alias Maximum is never advertised, so any alias is invalid
        if publish.properties.topic_alias.is_some() {
            return Err(ConnectionError::Violation(ReasonCode::TopicAliasInvalid));
        }
        if let Err(why) =
            validate_topic_name_with_max_levels(&publish.topic, self.config.max_topic_levels)
        {
            debug!(
                "Invalid topic '{}' from {}: {}",
                publish.topic, conn.client.client_id, why
            );
            return Err(ConnectionError::Violation(ReasonCode::TopicNameInvalid));
        }
        if publish.retain && !self.config.retain_available {
            return Err(ConnectionError::Violation(ReasonCode::RetainNotSupported));
        }

        let access = Access::Publish {
            topic: &publish.topic,
            qos: publish.qos,
            retain: publish.retain,
        };
        let denied = match self.hooks.on_authorize(&conn.client, access).await {
            Ok(true) => None,
            Ok(false) => {
                debug!(
                    "PUBLISH denied for {} to topic {} (ACL)",
                    conn.client.client_id, publish.topic
                );
                Some(ReasonCode::NotAuthorized)
            }
            Err(e) => {
                error!("ACL check error for {}: {}", conn.client.client_id, e);
                Some(ReasonCode::UnspecifiedError)
            }
        };

        let reason = match denied {
            Some(reason) => reason,
            None => {
                let topic = publish.topic.clone();
                let size = publish.payload.len();
                let message = Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                    publisher: Some(conn.session.id()),
                };
                let delivered = self.dispatcher.publish(&message);
                trace!(
                    "PUBLISH {} from {} ({} bytes) -> {} subscriber(s)",
                    topic,
                    conn.client.client_id,
                    size,
                    delivered
                );
                if delivered == 0 {
                    ReasonCode::NoMatchingSubscribers
                } else {
                    ReasonCode::Success
                }
            }
        };

        // QoS 0 has no acknowledgement, so a refusal is silent. A v3.1.1
        // PUBACK carries no reason code.
        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                queue(&conn.writer, &Packet::PubAck(PubAck::with_reason(packet_id, reason)))?;
            }
        }
        Ok(Flow::Continue)
    }
}
