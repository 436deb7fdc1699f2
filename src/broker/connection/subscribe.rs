//! SUBSCRIBE and UNSUBSCRIBE packet handling

use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use super::{queue, Connected, Connection, ConnectionError, Flow};
use crate::hooks::Access;
use crate::protocol::{
    Packet, Properties, ReasonCode, SubAck, Subscribe, Subscription, SubscriptionOptions,
    UnsubAck, Unsubscribe,
};
use crate::topic::{has_wildcards, validate_topic_filter_with_max_levels};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    ///
    /// Authorization is awaited first. Registration, the SUBACK and the
    /// retained messages then happen under the session gate, so the client
    /// sees SUBACK, then the retained messages, then live traffic.
    pub(crate) async fn handle_subscribe(
        &mut self,
        conn: &Connected,
        subscribe: Subscribe,
    ) -> Result<Flow, ConnectionError> {
        let identifier = subscribe
            .properties
            .subscription_identifiers
            .first()
            .copied();
        if identifier.is_some() && !self.config.subscription_identifiers_available {
            return Err(ConnectionError::Violation(ReasonCode::SubIdNotSupported));
        }

        let mut decisions = Vec::with_capacity(subscribe.subscriptions.len());
        for sub in &subscribe.subscriptions {
            decisions.push(self.check_subscription(conn, sub).await);
        }

        let session = &conn.session;
        let _gate = session.gate();

        let mut reason_codes = Vec::with_capacity(decisions.len());
        let mut accepted: SmallVec<[(&str, SubscriptionOptions, bool); 4]> = SmallVec::new();
        for (sub, decision) in subscribe.subscriptions.iter().zip(decisions) {
            let options = match decision {
                Ok(options) => options,
                Err(reason) => {
                    reason_codes.push(reason);
                    continue;
                }
            };
            match self
                .dispatcher
                .registry()
                .subscribe(session, &sub.filter, options, identifier)
            {
                Ok(existed) => {
                    debug!(
                        "SUBSCRIBE {} to {} (QoS {:?})",
                        conn.client.client_id, sub.filter, options.qos
                    );
                    reason_codes.push(ReasonCode::granted(options.qos));
                    accepted.push((sub.filter.as_str(), options, existed));
                }
                Err(why) => {
                    debug!(
                        "SUBSCRIBE {} to {} failed: {}",
                        conn.client.client_id, sub.filter, why
                    );
                    reason_codes.push(ReasonCode::UnspecifiedError);
                }
            }
        }

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        queue(&conn.writer, &Packet::SubAck(suback))?;

        for (filter, options, existed) in accepted {
            self.dispatcher
                .deliver_retained(session, filter, options, identifier, existed);
        }
        Ok(Flow::Continue)
    }

    /// Options to register for one requested filter, or the SUBACK failure code
    async fn check_subscription(
        &self,
        conn: &Connected,
        sub: &Subscription,
    ) -> Result<SubscriptionOptions, ReasonCode> {
        if validate_topic_filter_with_max_levels(&sub.filter, self.config.max_topic_levels).is_err()
        {
            debug!(
                "Invalid filter '{}' from {}",
                sub.filter, conn.client.client_id
            );
            return Err(ReasonCode::TopicFilterInvalid);
        }
        if sub.filter.starts_with("$share/") {
            return Err(ReasonCode::SharedSubsNotSupported);
        }
        if !self.config.wildcard_subscription_available && has_wildcards(&sub.filter) {
            return Err(ReasonCode::WildcardSubsNotSupported);
        }

        let mut options = sub.options;
        options.qos = options.qos.min(self.config.max_qos);

        let access = Access::Subscribe {
            filter: &sub.filter,
            qos: options.qos,
        };
        match self.hooks.on_authorize(&conn.client, access).await {
            Ok(true) => Ok(options),
            Ok(false) => {
                debug!(
                    "SUBSCRIBE denied for {} to filter {} (ACL)",
                    conn.client.client_id, sub.filter
                );
                Err(ReasonCode::NotAuthorized)
            }
            Err(e) => {
                error!("ACL check error for {}: {}", conn.client.client_id, e);
                Err(ReasonCode::UnspecifiedError)
            }
        }
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) fn handle_unsubscribe(
        &mut self,
        conn: &Connected,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                let removed = self.dispatcher.unsubscribe(conn.session.id(), filter);
                debug!("UNSUBSCRIBE {} from {}", conn.client.client_id, filter);
                if removed {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            })
            .collect();

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        queue(&conn.writer, &Packet::UnsubAck(unsuback))?;
        Ok(Flow::Continue)
    }
}
