// Media engine interface for the SFU
//
// The engine owns the actual RTP/ICE/DTLS/SRTP machinery. The control plane
// only talks to it through the traits in this module. `MediasoupEngine` runs
// mediasoup worker processes; `LocalEngine` is an in-process double used by
// the tests.

#[cfg(any(test, feature = "test-util"))]
pub mod local;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    media::{
        ConsumerId, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
        RtpParameters, TransportId, WorkerId,
    },
    Result, SfuError,
};

#[cfg(any(test, feature = "test-util"))]
pub use local::LocalEngine;
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;

/// Port range a worker binds its transports to (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port
    pub min: u16,
    /// Last port
    pub max: u16,
}

impl PortRange {
    /// Number of ports in the range
    pub fn len(&self) -> usize {
        (self.max as usize + 1).saturating_sub(self.min as usize)
    }

    /// Whether the range holds no port
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Settings used to spawn a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Engine log level
    pub log_level: String,
    /// Ports for this worker's transports
    pub port_range: PortRange,
}

/// Address a transport listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    /// Local bind address
    pub ip: IpAddr,
    /// Address advertised in ICE candidates
    pub announced_ip: Option<IpAddr>,
}

/// STUN/TURN server handed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Options for a WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Initial outgoing bitrate estimate (bps)
    pub initial_available_outgoing_bitrate: u32,
}

/// Options for a plain (unencrypted) RTP transport
#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    /// Multiplex RTP and RTCP on one port
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet
    pub comedia: bool,
}

/// ICE parameters of a WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// ICE candidate of a WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// DTLS role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters (local or remote)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS state of a WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Transport level statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// Round-trip time in milliseconds
    pub round_trip_time: Option<f64>,
    /// Estimated available outgoing bitrate (bps)
    pub available_outgoing_bitrate: Option<u32>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Score reported for one producer stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    pub ssrc: u32,
    pub rid: Option<u8>,
    /// 0 (worst) to 10 (best)
    pub score: u8,
}

/// Spatial/temporal layer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: u8,
}

/// How a consumer receives its producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
}

/// Fires once when the owner of the signal closes
#[derive(Debug)]
pub struct CloseTrigger(watch::Sender<bool>);

impl CloseTrigger {
    /// Create an open trigger
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(tx)
    }

    /// Fire the trigger; returns `true` only for the first call
    pub fn fire(&self) -> bool {
        self.0.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Whether the trigger has fired
    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    /// A signal observing this trigger
    pub fn signal(&self) -> CloseSignal {
        CloseSignal(self.0.subscribe())
    }
}

impl Default for CloseTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a `CloseTrigger`
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    /// Whether the owner is already closed
    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the owner closes (or is dropped)
    pub async fn closed(mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Media engine: spawns workers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a new worker
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>>;
}

/// A media worker process
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// OS process id, when the worker is a process
    fn pid(&self) -> Option<u32>;

    fn port_range(&self) -> PortRange;

    fn closed(&self) -> bool;

    /// Fires when the worker dies or is closed
    fn close_signal(&self) -> CloseSignal;

    /// Create a router with the given codecs
    async fn create_router(&self, media_codecs: &[RtpCodecCapability]) -> Result<Arc<dyn Router>>;

    /// Close the worker and everything it hosts
    fn close(&self);
}

/// Routing context of one room
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> RouterId;

    /// Worker hosting this router
    fn worker_id(&self) -> WorkerId;

    /// Codecs the router routes, with payload types assigned
    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>>;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    fn close(&self);
}

/// Secured media channel to one client
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    /// Local DTLS parameters
    fn dtls_parameters(&self) -> DtlsParameters;

    /// DTLS state updates
    fn dtls_state(&self) -> watch::Receiver<DtlsState>;

    /// Provide the remote DTLS parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    async fn get_stats(&self) -> Result<TransportStats>;

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()>;

    fn closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    fn close(&self);
}

/// Unencrypted RTP tap
#[async_trait]
pub trait PlainTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Local RTP port
    fn local_port(&self) -> u16;

    /// Local RTCP port (`None` with rtcp-mux)
    fn local_rtcp_port(&self) -> Option<u16>;

    /// Send media to `ip:port` (and RTCP to `rtcp_port`)
    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> Result<()>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>>;

    fn closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    fn close(&self);
}

/// A published track
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Periodic score updates
    fn scores(&self) -> watch::Receiver<Vec<ProducerScore>>;

    fn closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    fn close(&self);
}

/// A forwarded copy of a producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn consumer_type(&self) -> ConsumerType;

    fn producer_paused(&self) -> bool;

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()>;

    fn preferred_layers(&self) -> Option<ConsumerLayers>;

    /// Layers actually being forwarded, as reported by the engine
    fn layers(&self) -> watch::Receiver<Option<ConsumerLayers>>;

    fn closed(&self) -> bool;

    fn close_signal(&self) -> CloseSignal;

    fn close(&self);
}

/// Run an engine request with a deadline
pub async fn bounded<T, F>(timeout: Duration, what: &str, request: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(SfuError::Timeout(what.to_string())),
    }
}
