// Signaling module for the SFU
//
// This module defines the JSON message protocol spoken over the signaling
// channel, the outbound handle used to reach a connection, and the handler
// turning client requests into registry and router operations.

pub mod handler;
pub mod hub;
pub mod interactive;
pub mod server;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    engine::{CloseSignal, CloseTrigger, ConsumerType},
    media::{ConsumerId, MediaKind, ProducerId, RoomId, RtpCapabilities, RtpParameters},
    session::ProducerInfo,
    transport::{TransportDirection, TransportInfo},
    ErrorCode, Result, SfuError,
};

pub use handler::SignalingHandler;
pub use hub::RoomHub;
pub use server::SignalingServer;

/// Signaling surface a connection was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Broadcast and viewing (`/live/streaming`)
    Streaming,
    /// Call-in (`/live/interactive`)
    Interactive,
}

impl Channel {
    /// Surface selected by a request path
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "" | "/live/streaming" => Some(Channel::Streaming),
            "/live/interactive" => Some(Channel::Interactive),
            _ => None,
        }
    }
}

/// Identifier of one signaling connection
pub type ConnectionId = u64;

/// Allocate a connection id
pub fn next_connection_id() -> ConnectionId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Requests a client can send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    CreateRoom {
        room_id: RoomId,
    },
    GetRouterRtpCapabilities {
        room_id: RoomId,
    },
    CreateTransport {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
        #[serde(default)]
        direction: TransportDirection,
    },
    ConnectTransport {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
        transport_id: String,
        /// Validated by the handler
        dtls_parameters: Value,
    },
    Produce {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
        transport_id: String,
        kind: MediaKind,
        /// Validated by the handler
        rtp_parameters: Value,
    },
    GetProducers {
        room_id: RoomId,
    },
    Consume {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
        producer_id: ProducerId,
        transport_id: String,
        /// Validated by the handler
        rtp_capabilities: Value,
    },
    RemoveViewer {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
    },
    StopStreaming {
        room_id: RoomId,
        #[serde(alias = "peerId")]
        client_id: String,
    },
    RequestInteractive {
        room_id: RoomId,
        user_id: String,
    },
    AllowInteractive {
        room_id: RoomId,
        user_id: String,
    },
    EndInteractive {
        room_id: RoomId,
        user_id: String,
    },
}

impl Request {
    /// Wire name of the request
    pub fn name(&self) -> &'static str {
        match self {
            Request::CreateRoom { .. } => "createRoom",
            Request::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            Request::CreateTransport { .. } => "createTransport",
            Request::ConnectTransport { .. } => "connectTransport",
            Request::Produce { .. } => "produce",
            Request::GetProducers { .. } => "getProducers",
            Request::Consume { .. } => "consume",
            Request::RemoveViewer { .. } => "removeViewer",
            Request::StopStreaming { .. } => "stopStreaming",
            Request::RequestInteractive { .. } => "requestInteractive",
            Request::AllowInteractive { .. } => "allowInteractive",
            Request::EndInteractive { .. } => "endInteractive",
        }
    }
}

/// A request with its optional correlation id
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

impl Envelope {
    /// Parse a text frame.
    ///
    /// On failure the correlation id is still recovered when the frame was a
    /// JSON object carrying one.
    pub fn parse(text: &str) -> std::result::Result<Self, (Option<String>, SfuError)> {
        let value: Value = serde_json::from_str(text).map_err(|err| (None, SfuError::from(err)))?;
        let request_id = value
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        serde_json::from_value(value)
            .map_err(|err| (request_id, SfuError::Signaling(format!("malformed request: {}", err))))
    }
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    RoomCreated {
        room_id: RoomId,
        router_rtp_capabilities: RtpCapabilities,
    },
    /// Another member created the room
    NewRoomAvailable {
        room_id: RoomId,
    },
    RoomJoinError {
        room_id: RoomId,
        message: String,
    },
    RouterRtpCapabilities {
        room_id: RoomId,
        rtp_capabilities: RtpCapabilities,
    },
    TransportIsCreated {
        transport_options: TransportInfo,
    },
    TransportConnected {
        /// Distinct viewers after this connect
        viewers: u64,
    },
    Producers {
        producers: Vec<ProducerInfo>,
    },
    ProducerCreated {
        producer_id: ProducerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        hls_url: Option<String>,
    },
    NewProducer {
        producer_id: ProducerId,
        client_id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        hls_url: Option<String>,
    },
    ConsumerCreated {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        consumer_type: ConsumerType,
        producer_paused: bool,
    },
    ViewerCount {
        viewers: u64,
    },
    LivestreamStopped {
        producer_ids: Vec<ProducerId>,
    },
    StreamingStopped {
        success: bool,
    },
    ClientRequestInteractive {
        room_id: RoomId,
        user_id: String,
    },
    InteractiveAccepted {
        room_id: RoomId,
        user_id: String,
        router_rtp_capabilities: RtpCapabilities,
    },
    InteractiveEnded {
        room_id: RoomId,
        user_id: String,
        producer_ids: Vec<ProducerId>,
    },
    /// Quality index of one of the client's producers moved
    QualityChanged {
        producer_id: ProducerId,
        quality_index: u8,
    },
    /// A consumer was closed because its producer went away
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// The room's router is gone; rejoin to continue
    RoomClosed {
        room_id: RoomId,
        reason: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Event {
    /// Whether losing this event leaves the client in a consistent state
    pub fn is_droppable(&self) -> bool {
        matches!(self, Event::QualityChanged { .. })
    }

    /// Error event for `err`, with a client-safe message
    pub fn from_error(err: &SfuError) -> Self {
        Event::Error {
            code: err.code(),
            message: err.client_message(),
        }
    }
}

/// An event addressed to one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

impl Outbound {
    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Handle used to send events to one connection
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    channel: Channel,
    tx: mpsc::Sender<Outbound>,
    lagged: Arc<CloseTrigger>,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, channel: Channel, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            connection_id,
            channel,
            tx,
            lagged: Arc::new(CloseTrigger::new()),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Send a direct reply, waiting for queue space
    pub async fn reply(&self, request_id: Option<String>, event: Event) {
        if self.tx.send(Outbound { request_id, event }).await.is_err() {
            tracing::debug!(connection_id = self.connection_id, "Reply to closed connection dropped");
        }
    }

    /// Send an unsolicited event without waiting.
    ///
    /// With a full queue, droppable events are discarded. Any other event
    /// marks the connection as lagged, and the server then closes it so the
    /// usual disconnect cleanup runs.
    pub fn notify(&self, event: Event) {
        let droppable = event.is_droppable();
        match self.tx.try_send(Outbound {
            request_id: None,
            event,
        }) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) if droppable => tracing::debug!(
                connection_id = self.connection_id,
                "Outbound queue full, dropping notification"
            ),
            Err(mpsc::error::TrySendError::Full(outbound)) => {
                if self.lagged.fire() {
                    tracing::warn!(
                        connection_id = self.connection_id,
                        event = ?outbound.event,
                        "Outbound queue full, closing lagging connection"
                    );
                }
            }
        }
    }

    /// Fires once a non-droppable event could not be queued
    pub fn lagged(&self) -> CloseSignal {
        self.lagged.signal()
    }

    pub fn has_lagged(&self) -> bool {
        self.lagged.is_fired()
    }

    /// Whether the connection is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn paths_select_channels() {
        assert_eq!(Channel::from_path("/"), Some(Channel::Streaming));
        assert_eq!(Channel::from_path("/live/streaming"), Some(Channel::Streaming));
        assert_eq!(Channel::from_path("/live/interactive/"), Some(Channel::Interactive));
        assert_eq!(Channel::from_path("/metrics"), None);
    }

    #[test]
    fn requests_parse_with_correlation_and_aliases() {
        let envelope = Envelope::parse(
            &json!({
                "type": "createTransport",
                "requestId": "7",
                "roomId": "r1",
                "peerId": "alice",
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("7"));
        assert_eq!(
            envelope.request,
            Request::CreateTransport {
                room_id: "r1".to_string(),
                client_id: "alice".to_string(),
                direction: TransportDirection::Send,
            }
        );
    }

    #[test]
    fn unknown_requests_keep_their_id() {
        let (request_id, err) =
            Envelope::parse(r#"{"type":"selfDestruct","requestId":"9"}"#).unwrap_err();
        assert_eq!(request_id.as_deref(), Some("9"));
        assert_eq!(err.code(), ErrorCode::BadRequest);

        let (request_id, err) = Envelope::parse("not json").unwrap_err();
        assert!(request_id.is_none());
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    fn quality(index: u8) -> Event {
        Event::QualityChanged {
            producer_id: "p1".to_string(),
            quality_index: index,
        }
    }

    #[test]
    fn replies_wait_for_space_while_notifications_are_dropped() {
        let (tx, mut rx) = mpsc::channel(1);
        let outbox = Outbox::new(1, Channel::Streaming, tx);
        outbox.notify(Event::ViewerCount { viewers: 1 });
        outbox.notify(quality(1));
        assert!(!outbox.has_lagged());

        let mut reply = tokio_test::task::spawn(
            outbox.reply(Some("1".to_string()), Event::StreamingStopped { success: true }),
        );
        tokio_test::assert_pending!(reply.poll());
        assert_eq!(rx.try_recv().unwrap().event, Event::ViewerCount { viewers: 1 });
        assert!(reply.is_woken());
        tokio_test::assert_ready!(reply.poll());
        assert_eq!(rx.try_recv().unwrap().request_id.as_deref(), Some("1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_events_on_a_full_queue_mark_the_connection_lagged() {
        let (tx, mut rx) = mpsc::channel(4);
        let outbox = Outbox::new(1, Channel::Streaming, tx);
        let lagged = outbox.lagged();
        for viewers in 0..4 {
            outbox.notify(Event::ViewerCount { viewers });
        }

        outbox.notify(quality(1));
        assert!(!outbox.has_lagged());

        outbox.notify(Event::LivestreamStopped {
            producer_ids: vec!["p1".to_string()],
        });
        assert!(outbox.has_lagged());
        lagged.closed().await;

        // A connection that keeps up is never marked.
        for _ in 0..4 {
            rx.try_recv().unwrap();
        }
        let (tx, _rx) = mpsc::channel(4);
        let fresh = Outbox::new(2, Channel::Streaming, tx);
        fresh.notify(Event::RoomClosed {
            room_id: "r1".to_string(),
            reason: "media worker died".to_string(),
        });
        assert!(!fresh.has_lagged());
    }

    #[test]
    fn events_serialize_in_camel_case() {
        let outbound = Outbound {
            request_id: Some("1".to_string()),
            event: Event::ProducerCreated {
                producer_id: "p1".to_string(),
                hls_url: None,
            },
        };
        let value: Value = serde_json::from_str(&outbound.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "producerCreated", "requestId": "1", "producerId": "p1" })
        );
    }
}
