// Signaling request handler
//
// Every connection owns a `ConnectionContext`; its requests are handled in
// order by the shared `SignalingHandler`, which drives the room registry, the
// resource registry, the presence counter and the transcoding bridge.

use std::{collections::HashSet, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{hub::RoomHub, Channel, Envelope, Event, Outbox, Request};
use crate::{
    engine::{DtlsParameters, Router},
    media::{MediaKind, RoomId, RtpCapabilities, RtpParameters},
    presence::PresenceCounter,
    room::RoomRegistry,
    session::{PeerKey, ProducerRole, ResourceRegistry},
    transcode::TranscodeBridge,
    transport::{TransportDirection, TransportInfo, TransportSettings},
    ErrorCode, Result, SfuError,
};

/// State of one signaling connection
pub struct ConnectionContext {
    outbox: Outbox,
    /// Rooms this connection joined
    rooms: HashSet<RoomId>,
    /// Peers registered through this connection
    peers: HashSet<PeerKey>,
    /// (room, client) pairs counted as viewers
    viewers: HashSet<(RoomId, String)>,
}

impl ConnectionContext {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            rooms: HashSet::new(),
            peers: HashSet::new(),
            viewers: HashSet::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.outbox.channel()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn joined(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    fn peer_key(&self, client_id: &str) -> PeerKey {
        PeerKey::new(self.channel(), client_id)
    }
}

/// Turns client requests into registry and router operations
pub struct SignalingHandler {
    pub(super) rooms: Arc<RoomRegistry>,
    pub(super) registry: Arc<ResourceRegistry>,
    pub(super) hub: Arc<RoomHub>,
    pub(super) presence: PresenceCounter,
    pub(super) bridge: Arc<TranscodeBridge>,
    transport_settings: TransportSettings,
}

fn parse<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|err| SfuError::InvalidParameters(format!("{}: {}", what, err)))
}

fn parse_dtls(value: Value) -> Result<DtlsParameters> {
    let dtls: DtlsParameters = parse(value, "dtlsParameters")?;
    if dtls.fingerprints.is_empty() {
        return Err(SfuError::InvalidParameters("dtlsParameters.fingerprints is empty".to_string()));
    }
    Ok(dtls)
}

impl SignalingHandler {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        registry: Arc<ResourceRegistry>,
        hub: Arc<RoomHub>,
        presence: PresenceCounter,
        bridge: Arc<TranscodeBridge>,
        transport_settings: TransportSettings,
    ) -> Self {
        Self {
            rooms,
            registry,
            hub,
            presence,
            bridge,
            transport_settings,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    pub fn presence(&self) -> &PresenceCounter {
        &self.presence
    }

    pub fn bridge(&self) -> &Arc<TranscodeBridge> {
        &self.bridge
    }

    /// Handle one text frame
    pub async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.handle(ctx, envelope).await,
            Err((request_id, err)) => {
                tracing::warn!(connection_id = ctx.outbox.connection_id(), "Rejected frame: {}", err);
                ctx.outbox.reply(request_id, Event::from_error(&err)).await;
            }
        }
    }

    /// Handle one request and send its replies
    pub async fn handle(&self, ctx: &mut ConnectionContext, envelope: Envelope) {
        let Envelope { request_id, request } = envelope;
        let name = request.name();
        tracing::debug!(
            connection_id = ctx.outbox.connection_id(),
            channel = ?ctx.channel(),
            request = name,
            "Handling request"
        );

        match self.dispatch(ctx, request).await {
            Ok(replies) => {
                for event in replies {
                    ctx.outbox.reply(request_id.clone(), event).await;
                }
            }
            Err(err) => {
                match err.code() {
                    ErrorCode::EngineFailure | ErrorCode::Internal | ErrorCode::ExternalProcessFailure => {
                        tracing::error!(request = name, "Request failed: {}", err)
                    }
                    _ => tracing::warn!(request = name, "Request rejected: {}", err),
                }
                ctx.outbox.reply(request_id, Event::from_error(&err)).await;
            }
        }
    }

    async fn dispatch(&self, ctx: &mut ConnectionContext, request: Request) -> Result<Vec<Event>> {
        match request {
            Request::CreateRoom { room_id } => self.create_room(ctx, room_id).await,
            Request::GetRouterRtpCapabilities { room_id } => self.router_capabilities(ctx, room_id).await,
            Request::CreateTransport {
                room_id,
                client_id,
                direction,
            } => self.create_transport(ctx, room_id, client_id, direction).await,
            Request::ConnectTransport {
                room_id,
                client_id,
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(ctx, room_id, client_id, transport_id, dtls_parameters)
                    .await
            }
            Request::Produce {
                room_id,
                client_id,
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.produce(ctx, room_id, client_id, transport_id, kind, rtp_parameters)
                    .await
            }
            Request::GetProducers { room_id } => Ok(vec![Event::Producers {
                producers: self.registry.producer_list(&room_id),
            }]),
            Request::Consume {
                room_id,
                client_id,
                producer_id,
                transport_id,
                rtp_capabilities,
            } => {
                self.consume(ctx, room_id, client_id, producer_id, transport_id, rtp_capabilities)
                    .await
            }
            Request::RemoveViewer { room_id, client_id } => {
                let viewers = self.presence.remove(&room_id, &client_id).await?;
                ctx.viewers.remove(&(room_id, client_id));
                Ok(vec![Event::ViewerCount { viewers }])
            }
            Request::StopStreaming { room_id, client_id } => {
                self.stop_streaming(ctx, room_id, client_id).await
            }
            Request::RequestInteractive { room_id, user_id } => {
                self.request_interactive(ctx, room_id, user_id).await
            }
            Request::AllowInteractive { room_id, user_id } => {
                self.allow_interactive(ctx, room_id, user_id).await
            }
            Request::EndInteractive { room_id, user_id } => {
                self.end_interactive(ctx, room_id, user_id).await
            }
        }
    }

    pub(super) fn join(&self, ctx: &mut ConnectionContext, room_id: &str) -> Result<()> {
        if self.hub.join(room_id, &ctx.outbox)? {
            tracing::info!(room_id = %room_id, connection_id = ctx.outbox.connection_id(), "Connection joined room");
        }
        ctx.rooms.insert(room_id.to_string());
        Ok(())
    }

    /// Join, turning a full room into a `roomJoinError` reply
    fn join_or_reject(&self, ctx: &mut ConnectionContext, room_id: &str) -> Result<Option<Event>> {
        match self.join(ctx, room_id) {
            Ok(()) => Ok(None),
            Err(err @ SfuError::RoomFull(_)) => Ok(Some(Event::RoomJoinError {
                room_id: room_id.to_string(),
                message: err.to_string(),
            })),
            Err(err) => Err(err),
        }
    }

    fn existing_router(&self, room_id: &str) -> Result<Arc<dyn Router>> {
        self.rooms
            .get_router(room_id)
            .ok_or_else(|| SfuError::NotFound(format!("room {}", room_id)))
    }

    async fn create_room(&self, ctx: &mut ConnectionContext, room_id: RoomId) -> Result<Vec<Event>> {
        let router = self.rooms.get_or_create_router(&room_id).await?;
        if let Some(rejection) = self.join_or_reject(ctx, &room_id)? {
            return Ok(vec![rejection]);
        }

        self.hub.broadcast(
            &room_id,
            &Event::NewRoomAvailable {
                room_id: room_id.clone(),
            },
            Some(ctx.outbox.connection_id()),
            None,
        );
        Ok(vec![Event::RoomCreated {
            room_id,
            router_rtp_capabilities: router.rtp_capabilities(),
        }])
    }

    async fn router_capabilities(&self, ctx: &mut ConnectionContext, room_id: RoomId) -> Result<Vec<Event>> {
        let router = self.rooms.get_or_create_router(&room_id).await?;
        if let Some(rejection) = self.join_or_reject(ctx, &room_id)? {
            return Ok(vec![rejection]);
        }
        Ok(vec![Event::RouterRtpCapabilities {
            room_id,
            rtp_capabilities: router.rtp_capabilities(),
        }])
    }

    async fn create_transport(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        client_id: String,
        direction: TransportDirection,
    ) -> Result<Vec<Event>> {
        let router = self.rooms.get_or_create_router(&room_id).await?;
        self.join(ctx, &room_id)?;

        let key = ctx.peer_key(&client_id);
        self.registry.create_peer(key.clone(), &room_id, ctx.outbox.clone());
        ctx.peers.insert(key.clone());

        let transport = self
            .registry
            .create_transport(&router, &key, &room_id, direction, self.transport_settings.webrtc_options())
            .await?;
        Ok(vec![Event::TransportIsCreated {
            transport_options: TransportInfo::from_transport(transport.as_ref(), &self.transport_settings.ice_servers),
        }])
    }

    async fn connect_transport(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        client_id: String,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<Vec<Event>> {
        let dtls = parse_dtls(dtls_parameters)?;
        let key = ctx.peer_key(&client_id);
        self.registry.connect_transport(&key, &transport_id, dtls).await?;

        let viewers = self.presence.add(&room_id, &client_id).await?;
        ctx.viewers.insert((room_id.clone(), client_id));
        Ok(vec![
            Event::TransportConnected { viewers },
            Event::Producers {
                producers: self.registry.producer_list(&room_id),
            },
        ])
    }

    async fn produce(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        client_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Vec<Event>> {
        let router = self.existing_router(&room_id)?;
        let key = ctx.peer_key(&client_id);

        if let Some(existing) = self.registry.find_producer(&key, &room_id, kind) {
            let hls_url = if self.bridge.is_active(&room_id).await {
                Some(self.bridge.playlist_url(&room_id))
            } else {
                None
            };
            return Ok(vec![Event::ProducerCreated {
                producer_id: existing.producer.id(),
                hls_url,
            }]);
        }

        let rtp_parameters: RtpParameters = parse(rtp_parameters, "rtpParameters")?;
        let entry = self
            .registry
            .create_producer(
                &key,
                &room_id,
                &transport_id,
                kind,
                rtp_parameters,
                ProducerRole::from(ctx.channel()),
            )
            .await?;
        let producer_id = entry.producer.id();

        let hls_url = match self.bridge.attach(&room_id, &router, &producer_id).await {
            Ok(url) => Some(url),
            Err(err) => {
                tracing::error!(room_id = %room_id, producer_id = %producer_id, "Transcoding bridge failed: {}", err);
                None
            }
        };

        self.hub.broadcast(
            &room_id,
            &Event::NewProducer {
                producer_id: producer_id.clone(),
                client_id,
                kind,
                hls_url: hls_url.clone(),
            },
            Some(ctx.outbox.connection_id()),
            None,
        );
        Ok(vec![Event::ProducerCreated { producer_id, hls_url }])
    }

    async fn consume(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        client_id: String,
        producer_id: String,
        transport_id: String,
        rtp_capabilities: Value,
    ) -> Result<Vec<Event>> {
        let router = self.existing_router(&room_id)?;
        let capabilities: RtpCapabilities = parse(rtp_capabilities, "rtpCapabilities")?;
        if self.registry.producer(&producer_id).is_none() {
            return Err(SfuError::NotFound(format!("producer {}", producer_id)));
        }
        if !router.can_consume(&producer_id, &capabilities) {
            return Err(SfuError::CapabilityMismatch(producer_id));
        }

        let key = ctx.peer_key(&client_id);
        let entry = self
            .registry
            .create_consumer(&key, &room_id, &transport_id, &producer_id, &capabilities)
            .await?;
        let consumer = &entry.consumer;
        Ok(vec![Event::ConsumerCreated {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        }])
    }

    async fn stop_streaming(
        &self,
        ctx: &mut ConnectionContext,
        room_id: RoomId,
        client_id: String,
    ) -> Result<Vec<Event>> {
        let key = ctx.peer_key(&client_id);
        let closed = self.registry.close_room_resources(&key, &room_id);
        if !closed.is_empty() {
            self.hub.broadcast(
                &room_id,
                &Event::LivestreamStopped {
                    producer_ids: closed.clone(),
                },
                Some(ctx.outbox.connection_id()),
                None,
            );
            self.bridge.detach_producers(&room_id, &closed).await;
        }
        self.bridge
            .stop_if_idle(&room_id, || self.registry.room_has_producers(&room_id))
            .await;
        Ok(vec![Event::StreamingStopped { success: true }])
    }

    /// Release everything the connection owned
    pub async fn disconnect(&self, ctx: ConnectionContext) {
        let connection_id = ctx.outbox.connection_id();
        let mut touched: HashSet<RoomId> = ctx.rooms.clone();

        for key in &ctx.peers {
            for (room_id, closed) in self.registry.remove_peer(key) {
                if !closed.is_empty() {
                    self.hub.broadcast(
                        &room_id,
                        &Event::LivestreamStopped {
                            producer_ids: closed.clone(),
                        },
                        Some(connection_id),
                        None,
                    );
                    self.bridge.detach_producers(&room_id, &closed).await;
                }
                touched.insert(room_id);
            }
        }

        for (room_id, client_id) in &ctx.viewers {
            if let Err(err) = self.presence.remove(room_id, client_id).await {
                tracing::warn!(room_id = %room_id, client_id = %client_id, "Failed to update presence: {}", err);
            }
        }

        for room_id in &ctx.rooms {
            self.hub.leave(room_id, connection_id);
        }

        for room_id in touched {
            self.bridge
                .stop_if_idle(&room_id, || self.registry.room_has_producers(&room_id))
                .await;
            if self.hub.member_count(&room_id) == 0 && self.registry.room_is_idle(&room_id) {
                self.evict_room(&room_id).await;
            }
        }
        tracing::info!(connection_id, "Connection cleaned up");
    }

    async fn evict_room(&self, room_id: &str) {
        self.bridge.stop(room_id).await;
        if self.rooms.evict(room_id) {
            if let Err(err) = self.presence.clear(room_id).await {
                tracing::warn!(room_id = %room_id, "Failed to clear presence: {}", err);
            }
        }
    }

    /// Tear a room down under its members (its router is gone)
    pub async fn close_room(&self, room_id: &str, reason: &str) {
        self.registry.forget_room(room_id);
        self.bridge.stop(room_id).await;
        let notified = self.hub.close_room(
            room_id,
            &Event::RoomClosed {
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            },
        );
        if let Err(err) = self.presence.clear(room_id).await {
            tracing::warn!(room_id = %room_id, "Failed to clear presence: {}", err);
        }
        tracing::warn!(room_id = %room_id, members = notified.len(), reason = %reason, "Room closed");
    }
}
