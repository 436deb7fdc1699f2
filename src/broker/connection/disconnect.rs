//! Disconnect handling and will message publishing

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use super::{Connected, Connection};
use crate::broker::dispatcher::Message;
use crate::hooks::{Access, ClientInfo};
use crate::protocol::Will;
use crate::session::SessionId;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Release the session and finish the connection.
    ///
    /// `graceful` is true when the client sent DISCONNECT.
    pub(crate) async fn handle_disconnect(
        &mut self,
        conn: Connected,
        publish_will: bool,
        graceful: bool,
    ) {
        let Connected {
            session,
            writer,
            client,
            will,
            guard,
            ..
        } = conn;

        // Unregister before the will goes out so it never loops back
        drop(guard);

        if publish_will {
            if let Some(will) = will {
                self.publish_will(&client, session.id(), will).await;
            }
        }

        self.hooks.on_client_disconnected(&client, graceful).await;

        // Whatever was queued before the close (DISCONNECT, last acks)
        let data = writer.take_buffer();
        if !data.is_empty() {
            let _ = self.stream.write_all(&data).await;
        }
        let _ = self.stream.shutdown().await;
        debug!("Client {} disconnected", client.client_id);
    }

    async fn publish_will(&self, client: &ClientInfo, session_id: SessionId, will: Will) {
        let access = Access::Publish {
            topic: &will.topic,
            qos: will.qos,
            retain: will.retain,
        };
        match self.hooks.on_authorize(client, access).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Will of {} to {} denied (ACL)",
                    client.client_id, will.topic
                );
                return;
            }
            Err(e) => {
                error!("ACL check error for will of {}: {}", client.client_id, e);
                return;
            }
        }

        debug!(
            "Publishing will message for {} to {}",
            client.client_id, will.topic
        );
        let message = Message::new(will.topic, will.payload, will.qos, will.retain)
            .from_session(session_id);
        self.dispatcher.publish(&message);
    }
}
