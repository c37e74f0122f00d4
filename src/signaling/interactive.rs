// Call-in requests
//
// Only served on the interactive surface. A viewer asks to be promoted, the
// broadcaster accepts, and the viewer then publishes through the regular
// transport and produce requests as a secondary producer.

use super::{handler::ConnectionContext, Channel, Event, SignalingHandler};
use crate::{
    media::RoomId,
    session::PeerKey,
    Result, SfuError,
};

fn require_interactive(ctx: &ConnectionContext, request: &str) -> Result<()> {
    if ctx.channel() != Channel::Interactive {
        return Err(SfuError::Signaling(format!(
            "{} is only available on the interactive channel",
            request
        )));
    }
    Ok(())
}

impl SignalingHandler {
    pub(super) async fn request_interactive(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        user_id: String,
    ) -> Result<Vec<Event>> {
        require_interactive(ctx, "requestInteractive")?;
        self.join(ctx, &room_id)?;

        let notified = self.hub.broadcast(
            &room_id,
            &Event::ClientRequestInteractive {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            },
            None,
            Some(Channel::Interactive),
        );
        tracing::info!(room_id = %room_id, user_id = %user_id, notified, "Call-in requested");
        Ok(Vec::new())
    }

    pub(super) async fn allow_interactive(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        user_id: String,
    ) -> Result<Vec<Event>> {
        require_interactive(ctx, "allowInteractive")?;
        let router = self.rooms.get_or_create_router(&room_id).await?;
        self.join(ctx, &room_id)?;

        self.hub.broadcast(
            &room_id,
            &Event::InteractiveAccepted {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                router_rtp_capabilities: router.rtp_capabilities(),
            },
            Some(ctx.outbox().connection_id()),
            Some(Channel::Interactive),
        );
        tracing::info!(room_id = %room_id, user_id = %user_id, "Call-in accepted");
        Ok(Vec::new())
    }

    pub(super) async fn end_interactive(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        user_id: String,
    ) -> Result<Vec<Event>> {
        require_interactive(ctx, "endInteractive")?;

        let key = PeerKey::new(Channel::Interactive, user_id.as_str());
        let closed = self.registry.close_room_resources(&key, &room_id);
        if !closed.is_empty() {
            self.bridge.detach_producers(&room_id, &closed).await;
        }
        self.bridge
            .stop_if_idle(&room_id, || self.registry.room_has_producers(&room_id))
            .await;

        self.hub.broadcast(
            &room_id,
            &Event::InteractiveEnded {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
                producer_ids: closed,
            },
            None,
            None,
        );
        tracing::info!(room_id = %room_id, user_id = %user_id, "Call-in ended");
        Ok(Vec::new())
    }
}
