// mediasoup backed media engine
//
// Every engine object wraps the matching mediasoup handle. mediasoup closes an
// object when its last handle is dropped, so `close()` drops the wrapper's
// handle after closing the children it created. Engine-side closes (worker
// death, producer close) reach the wrappers through the mediasoup event
// handlers, which fire the wrapper's `CloseTrigger`.

use std::{
    net::IpAddr,
    sync::{Arc, Weak},
};

use ::mediasoup::{
    consumer::{
        Consumer as MsConsumer, ConsumerLayers as MsConsumerLayers, ConsumerOptions,
        ConsumerType as MsConsumerType,
    },
    data_structures::{DtlsState as MsDtlsState, ListenInfo, Protocol as MsProtocol},
    plain_transport::{
        PlainTransport as MsPlainTransport, PlainTransportOptions as MsPlainTransportOptions,
        PlainTransportRemoteParameters,
    },
    producer::{Producer as MsProducer, ProducerId as MsProducerId, ProducerOptions},
    router::{Router as MsRouter, RouterOptions},
    rtp_parameters::{
        MediaKind as MsMediaKind, RtpCapabilities as MsRtpCapabilities,
        RtpCodecCapability as MsRtpCodecCapability, RtpParameters as MsRtpParameters,
    },
    transport::{Transport as _, TransportGeneric as _},
    webrtc_transport::{
        WebRtcTransport as MsWebRtcTransport, WebRtcTransportListenInfos,
        WebRtcTransportOptions as MsWebRtcTransportOptions, WebRtcTransportRemoteParameters,
    },
    worker::{Worker as MsWorker, WorkerLogLevel, WorkerSettings as MsWorkerSettings},
    worker_manager::WorkerManager,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::{
    CloseSignal, CloseTrigger, Consumer, ConsumerLayers, ConsumerType, DtlsParameters, DtlsState,
    IceCandidate, IceParameters, ListenIp, MediaEngine, PlainTransport, PlainTransportOptions,
    PortRange, Producer, ProducerScore, Router, TransportStats, WebRtcTransport,
    WebRtcTransportOptions, Worker, WorkerSettings,
};
use crate::{
    media::{
        ConsumerId, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
        RtpParameters, TransportId, WorkerId,
    },
    Result, SfuError,
};

/// Media engine running mediasoup worker processes
#[derive(Clone)]
pub struct MediasoupEngine {
    manager: WorkerManager,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn engine_error(what: &str, err: impl std::fmt::Display) -> SfuError {
    SfuError::Engine(format!("{}: {}", what, err))
}

/// Move a value between the wire types and mediasoup's types, which share the
/// same JSON shape
fn convert<T: Serialize + ?Sized, U: DeserializeOwned>(what: &str, value: &T) -> Result<U> {
    let json = serde_json::to_value(value)?;
    serde_json::from_value(json).map_err(|err| SfuError::InvalidParameters(format!("{}: {}", what, err)))
}

fn producer_id(id: &str) -> Result<MsProducerId> {
    convert("producer id", id)
}

fn log_level(level: &str) -> WorkerLogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "none" => WorkerLogLevel::None,
        _ => WorkerLogLevel::Error,
    }
}

fn media_kind(kind: MsMediaKind) -> MediaKind {
    match kind {
        MsMediaKind::Audio => MediaKind::Audio,
        MsMediaKind::Video => MediaKind::Video,
    }
}

fn ms_media_kind(kind: MediaKind) -> MsMediaKind {
    match kind {
        MediaKind::Audio => MsMediaKind::Audio,
        MediaKind::Video => MsMediaKind::Video,
    }
}

fn dtls_state(state: MsDtlsState) -> DtlsState {
    match state {
        MsDtlsState::New => DtlsState::New,
        MsDtlsState::Connecting => DtlsState::Connecting,
        MsDtlsState::Connected => DtlsState::Connected,
        MsDtlsState::Failed => DtlsState::Failed,
        MsDtlsState::Closed => DtlsState::Closed,
    }
}

fn consumer_layers(layers: &MsConsumerLayers) -> ConsumerLayers {
    ConsumerLayers {
        spatial_layer: layers.spatial_layer,
        temporal_layer: layers.temporal_layer.unwrap_or(0),
    }
}

fn listen_info(listen_ip: &ListenIp, protocol: MsProtocol, port_range: PortRange) -> ListenInfo {
    ListenInfo {
        protocol,
        ip: listen_ip.ip,
        announced_address: listen_ip.announced_ip.map(|ip| ip.to_string()),
        expose_internal_ip: false,
        port: None,
        port_range: Some(port_range.min..=port_range.max),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    }
}

fn ice_parameters(value: &Value) -> IceParameters {
    IceParameters {
        username_fragment: value["usernameFragment"].as_str().unwrap_or_default().to_string(),
        password: value["password"].as_str().unwrap_or_default().to_string(),
        ice_lite: value["iceLite"].as_bool().unwrap_or(true),
    }
}

fn ice_candidate(value: &Value) -> Option<IceCandidate> {
    let address = value.get("address").or_else(|| value.get("ip"))?.as_str()?;
    Some(IceCandidate {
        foundation: value["foundation"].as_str()?.to_string(),
        priority: u32::try_from(value["priority"].as_u64()?).ok()?,
        ip: address.parse::<IpAddr>().ok()?,
        protocol: serde_json::from_value(value["protocol"].clone()).ok()?,
        port: u16::try_from(value["port"].as_u64()?).ok()?,
        candidate_type: value["type"].as_str().unwrap_or("host").to_string(),
        tcp_type: value.get("tcpType").and_then(Value::as_str).map(str::to_string),
    })
}

fn producer_scores<T: Serialize + ?Sized>(scores: &T) -> Vec<ProducerScore> {
    let Ok(Value::Array(entries)) = serde_json::to_value(scores) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            Some(ProducerScore {
                ssrc: u32::try_from(entry["ssrc"].as_u64()?).ok()?,
                rid: entry["encodingIdx"].as_u64().and_then(|idx| u8::try_from(idx).ok()),
                score: u8::try_from(entry["score"].as_u64()?).ok()?,
            })
        })
        .collect()
}

/// Every `roundTripTime` reported anywhere in a stats document
fn collect_round_trip_times(value: &Value, out: &mut Vec<f64>) {
    match value {
        Value::Object(fields) => {
            for (name, field) in fields {
                match field.as_f64() {
                    Some(rtt) if name == "roundTripTime" && rtt > 0.0 => out.push(rtt),
                    _ => collect_round_trip_times(field, out),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_round_trip_times(item, out);
            }
        }
        _ => {}
    }
}

fn live<T>(entries: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut entries = entries.lock();
    entries.retain(|entry| entry.strong_count() > 0);
    entries.iter().filter_map(Weak::upgrade).collect()
}

fn handle<T: Clone>(slot: &Mutex<Option<T>>, what: &str, id: &str) -> Result<T> {
    slot.lock()
        .clone()
        .ok_or_else(|| SfuError::Engine(format!("{} {} is closed", what, id)))
}

fn fire_on(trigger: &Arc<CloseTrigger>) -> impl Fn() + Send + Sync + 'static {
    let trigger = trigger.clone();
    move || {
        trigger.fire();
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>> {
        if settings.port_range.is_empty() {
            return Err(SfuError::InvalidParameters("empty worker port range".to_string()));
        }
        let mut worker_settings = MsWorkerSettings::default();
        worker_settings.log_level = log_level(&settings.log_level);

        let worker = self
            .manager
            .create_worker(worker_settings)
            .await
            .map_err(|err| engine_error("failed to spawn mediasoup worker", err))?;

        let id = worker.id().to_string();
        let trigger = Arc::new(CloseTrigger::new());
        worker
            .on_dead({
                let trigger = trigger.clone();
                let id = id.clone();
                move |exit| {
                    tracing::error!(worker_id = %id, "mediasoup worker died: {:?}", exit);
                    trigger.fire();
                }
            })
            .detach();
        worker.on_close(fire_on(&trigger)).detach();

        tracing::debug!(
            worker_id = %id,
            min_port = settings.port_range.min,
            max_port = settings.port_range.max,
            "mediasoup worker created"
        );
        Ok(Arc::new(MediasoupWorker {
            id,
            port_range: settings.port_range,
            worker: Mutex::new(Some(worker)),
            trigger,
            routers: Mutex::new(Vec::new()),
        }))
    }
}

/// Worker process
pub struct MediasoupWorker {
    id: WorkerId,
    port_range: PortRange,
    worker: Mutex<Option<MsWorker>>,
    trigger: Arc<CloseTrigger>,
    routers: Mutex<Vec<Weak<MediasoupRouter>>>,
}

#[async_trait]
impl Worker for MediasoupWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn port_range(&self) -> PortRange {
        self.port_range
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    async fn create_router(&self, media_codecs: &[RtpCodecCapability]) -> Result<Arc<dyn Router>> {
        if self.closed() {
            return Err(SfuError::Engine(format!("worker {} is closed", self.id)));
        }
        let worker = handle(&self.worker, "worker", &self.id)?;
        let codecs: Vec<MsRtpCodecCapability> = convert("router codecs", media_codecs)?;
        let router = worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|err| engine_error("failed to create router", err))?;

        let capabilities: RtpCapabilities = convert("router capabilities", router.rtp_capabilities())?;
        let trigger = Arc::new(CloseTrigger::new());
        router.on_close(fire_on(&trigger)).detach();

        let router = Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            worker_id: self.id.clone(),
            port_range: self.port_range,
            capabilities,
            router: Mutex::new(Some(router)),
            trigger,
            webrtc_transports: Mutex::new(Vec::new()),
            plain_transports: Mutex::new(Vec::new()),
        });
        self.routers.lock().push(Arc::downgrade(&router));
        Ok(router)
    }

    fn close(&self) {
        if !self.trigger.fire() {
            return;
        }
        for router in live(&self.routers) {
            router.close();
        }
        self.worker.lock().take();
        tracing::debug!(worker_id = %self.id, "mediasoup worker closed");
    }
}

/// Router of one room
pub struct MediasoupRouter {
    id: RouterId,
    worker_id: WorkerId,
    port_range: PortRange,
    capabilities: RtpCapabilities,
    router: Mutex<Option<MsRouter>>,
    trigger: Arc<CloseTrigger>,
    webrtc_transports: Mutex<Vec<Weak<MediasoupWebRtcTransport>>>,
    plain_transports: Mutex<Vec<Weak<MediasoupPlainTransport>>>,
}

#[async_trait]
impl Router for MediasoupRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn worker_id(&self) -> WorkerId {
        self.worker_id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>> {
        let router = handle(&self.router, "router", &self.id)?;

        let mut infos = Vec::new();
        for listen_ip in &options.listen_ips {
            if options.enable_udp {
                infos.push(listen_info(listen_ip, MsProtocol::Udp, self.port_range));
            }
            if options.enable_tcp {
                infos.push(listen_info(listen_ip, MsProtocol::Tcp, self.port_range));
            }
        }
        let mut infos = infos.into_iter();
        let first = infos.next().ok_or_else(|| {
            SfuError::InvalidParameters("no listen ip with an enabled protocol".to_string())
        })?;
        let listen_infos = infos.fold(WebRtcTransportListenInfos::new(first), |all, info| all.insert(info));

        let mut transport_options = MsWebRtcTransportOptions::new(listen_infos);
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.initial_available_outgoing_bitrate = options.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|err| engine_error("failed to create WebRTC transport", err))?;
        let transport = Arc::new(MediasoupWebRtcTransport::new(transport, self.id.clone())?);
        self.webrtc_transports.lock().push(Arc::downgrade(&transport));
        Ok(transport)
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>> {
        let router = handle(&self.router, "router", &self.id)?;

        let mut transport_options = MsPlainTransportOptions::new(listen_info(
            &options.listen_ip,
            MsProtocol::Udp,
            self.port_range,
        ));
        transport_options.rtcp_mux = options.rtcp_mux;
        transport_options.comedia = options.comedia;

        let transport = router
            .create_plain_transport(transport_options)
            .await
            .map_err(|err| engine_error("failed to create plain transport", err))?;
        let transport = Arc::new(MediasoupPlainTransport::new(transport, options.comedia)?);
        self.plain_transports.lock().push(Arc::downgrade(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(router) = self.router.lock().clone() else {
            return false;
        };
        let (Ok(producer), Ok(capabilities)) = (
            producer_id(producer),
            convert::<_, MsRtpCapabilities>("rtp capabilities", rtp_capabilities),
        ) else {
            return false;
        };
        router.can_consume(&producer, &capabilities)
    }

    fn close(&self) {
        if !self.trigger.fire() {
            return;
        }
        for transport in live(&self.webrtc_transports) {
            transport.close();
        }
        for transport in live(&self.plain_transports) {
            transport.close();
        }
        self.router.lock().take();
        tracing::debug!(router_id = %self.id, "mediasoup router closed");
    }
}

/// WebRTC transport to one client
pub struct MediasoupWebRtcTransport {
    id: TransportId,
    router_id: RouterId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    local_dtls: DtlsParameters,
    dtls_tx: Arc<watch::Sender<DtlsState>>,
    transport: Mutex<Option<MsWebRtcTransport>>,
    trigger: Arc<CloseTrigger>,
    producers: Mutex<Vec<Weak<MediasoupProducer>>>,
    consumers: Mutex<Vec<Weak<MediasoupConsumer>>>,
}

impl MediasoupWebRtcTransport {
    fn new(transport: MsWebRtcTransport, router_id: RouterId) -> Result<Self> {
        let ice = serde_json::to_value(transport.ice_parameters())?;
        let candidates = serde_json::to_value(transport.ice_candidates())?;
        let ice_candidates = candidates
            .as_array()
            .map(|entries| entries.iter().filter_map(ice_candidate).collect())
            .unwrap_or_default();
        let local_dtls: DtlsParameters = convert("local DTLS parameters", &transport.dtls_parameters())?;

        let (dtls_tx, _dtls_rx) = watch::channel(dtls_state(transport.dtls_state()));
        let dtls_tx = Arc::new(dtls_tx);
        transport
            .on_dtls_state_change({
                let dtls_tx = dtls_tx.clone();
                move |state| {
                    dtls_tx.send_replace(dtls_state(state));
                }
            })
            .detach();

        let trigger = Arc::new(CloseTrigger::new());
        transport.on_close(Box::new(fire_on(&trigger))).detach();

        Ok(Self {
            id: transport.id().to_string(),
            router_id,
            ice_parameters: ice_parameters(&ice),
            ice_candidates,
            local_dtls,
            dtls_tx,
            transport: Mutex::new(Some(transport)),
            trigger,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        })
    }

    fn handle(&self) -> Result<MsWebRtcTransport> {
        handle(&self.transport, "transport", &self.id)
    }

    /// Mean RTT over the streams carried by this transport
    async fn round_trip_time(&self) -> Option<f64> {
        let mut samples = Vec::new();
        for consumer in live(&self.consumers) {
            if let Some(stats) = consumer.stats().await {
                collect_round_trip_times(&stats, &mut samples);
            }
        }
        for producer in live(&self.producers) {
            if let Some(stats) = producer.stats().await {
                collect_round_trip_times(&stats, &mut samples);
            }
        }
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

#[async_trait]
impl WebRtcTransport for MediasoupWebRtcTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.local_dtls.clone()
    }

    fn dtls_state(&self) -> watch::Receiver<DtlsState> {
        self.dtls_tx.subscribe()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SfuError::InvalidParameters("no DTLS fingerprints".to_string()));
        }
        let transport = self.handle()?;
        let dtls_parameters = convert("DTLS parameters", &dtls_parameters)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|err| engine_error("failed to connect transport", err))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        if rtp_parameters.codecs.is_empty() {
            return Err(SfuError::InvalidParameters("rtpParameters.codecs is empty".to_string()));
        }
        let transport = self.handle()?;
        let parameters: MsRtpParameters = convert("rtpParameters", &rtp_parameters)?;
        let producer = transport
            .produce(ProducerOptions::new(ms_media_kind(kind), parameters))
            .await
            .map_err(|err| SfuError::InvalidParameters(format!("cannot produce: {}", err)))?;

        let producer = Arc::new(MediasoupProducer::new(producer, rtp_parameters));
        self.producers.lock().push(Arc::downgrade(&producer));
        tracing::debug!(transport_id = %self.id, router_id = %self.router_id, producer_id = %producer.id, "mediasoup producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        let transport = self.handle()?;
        let mut options = ConsumerOptions::new(
            producer_id(producer)?,
            convert("rtpCapabilities", rtp_capabilities)?,
        );
        options.paused = paused;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|err| engine_error("failed to consume", err))?;

        let consumer = Arc::new(MediasoupConsumer::new(consumer)?);
        self.consumers.lock().push(Arc::downgrade(&consumer));
        Ok(consumer)
    }

    async fn get_stats(&self) -> Result<TransportStats> {
        let transport = self.handle()?;
        let stats = transport
            .get_stats()
            .await
            .map_err(|err| engine_error("failed to read transport stats", err))?;
        let stats = serde_json::to_value(&stats)?;
        let stat = stats.get(0).cloned().unwrap_or(Value::Null);

        Ok(TransportStats {
            round_trip_time: self.round_trip_time().await,
            available_outgoing_bitrate: stat["availableOutgoingBitrate"]
                .as_u64()
                .and_then(|bitrate| u32::try_from(bitrate).ok()),
            bytes_received: stat["bytesReceived"].as_u64().unwrap_or(0),
            bytes_sent: stat["bytesSent"].as_u64().unwrap_or(0),
        })
    }

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        self.handle()?
            .set_max_outgoing_bitrate(bitrate)
            .await
            .map_err(|err| engine_error("failed to set max outgoing bitrate", err))
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    fn close(&self) {
        if !self.trigger.fire() {
            return;
        }
        self.dtls_tx.send_replace(DtlsState::Closed);
        for consumer in live(&self.consumers) {
            consumer.close();
        }
        for producer in live(&self.producers) {
            producer.close();
        }
        self.transport.lock().take();
    }
}

/// Plain RTP transport feeding an external process
pub struct MediasoupPlainTransport {
    id: TransportId,
    comedia: bool,
    local_port: u16,
    local_rtcp_port: Option<u16>,
    transport: Mutex<Option<MsPlainTransport>>,
    trigger: Arc<CloseTrigger>,
    consumers: Mutex<Vec<Weak<MediasoupConsumer>>>,
}

impl MediasoupPlainTransport {
    fn new(transport: MsPlainTransport, comedia: bool) -> Result<Self> {
        let tuple = serde_json::to_value(transport.tuple())?;
        let local_port = tuple["localPort"]
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| SfuError::Engine("plain transport has no local port".to_string()))?;
        let local_rtcp_port = match transport.rtcp_tuple() {
            Some(rtcp) => serde_json::to_value(rtcp)?["localPort"]
                .as_u64()
                .and_then(|port| u16::try_from(port).ok()),
            None => None,
        };

        let trigger = Arc::new(CloseTrigger::new());
        transport.on_close(Box::new(fire_on(&trigger))).detach();

        Ok(Self {
            id: transport.id().to_string(),
            comedia,
            local_port,
            local_rtcp_port,
            transport: Mutex::new(Some(transport)),
            trigger,
            consumers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PlainTransport for MediasoupPlainTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn local_rtcp_port(&self) -> Option<u16> {
        self.local_rtcp_port
    }

    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> Result<()> {
        if self.comedia {
            return Err(SfuError::InvalidParameters(
                "comedia transports learn the remote address".to_string(),
            ));
        }
        let transport = handle(&self.transport, "transport", &self.id)?;
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(ip),
                port: Some(port),
                rtcp_port,
                srtp_parameters: None,
            })
            .await
            .map_err(|err| engine_error("failed to connect plain transport", err))
    }

    async fn consume(
        &self,
        producer: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        let transport = handle(&self.transport, "transport", &self.id)?;
        let mut options = ConsumerOptions::new(
            producer_id(producer)?,
            convert("rtpCapabilities", rtp_capabilities)?,
        );
        options.paused = paused;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|err| engine_error("failed to consume", err))?;

        let consumer = Arc::new(MediasoupConsumer::new(consumer)?);
        self.consumers.lock().push(Arc::downgrade(&consumer));
        Ok(consumer)
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    fn close(&self) {
        if !self.trigger.fire() {
            return;
        }
        for consumer in live(&self.consumers) {
            consumer.close();
        }
        self.transport.lock().take();
    }
}

/// Published track
pub struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    scores_tx: Arc<watch::Sender<Vec<ProducerScore>>>,
    producer: Mutex<Option<MsProducer>>,
    trigger: Arc<CloseTrigger>,
}

impl MediasoupProducer {
    fn new(producer: MsProducer, rtp_parameters: RtpParameters) -> Self {
        let (scores_tx, _scores_rx) = watch::channel(Vec::new());
        let scores_tx = Arc::new(scores_tx);
        producer
            .on_score({
                let scores_tx = scores_tx.clone();
                move |scores| {
                    scores_tx.send_replace(producer_scores(scores));
                }
            })
            .detach();

        let trigger = Arc::new(CloseTrigger::new());
        producer.on_close(fire_on(&trigger)).detach();

        Self {
            id: producer.id().to_string(),
            kind: media_kind(producer.kind()),
            rtp_parameters,
            scores_tx,
            producer: Mutex::new(Some(producer)),
            trigger,
        }
    }

    async fn stats(&self) -> Option<Value> {
        let producer = self.producer.lock().clone()?;
        let stats = producer.get_stats().await.ok()?;
        serde_json::to_value(&stats).ok()
    }
}

impl Producer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn scores(&self) -> watch::Receiver<Vec<ProducerScore>> {
        self.scores_tx.subscribe()
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    fn close(&self) {
        if self.trigger.fire() {
            self.producer.lock().take();
        }
    }
}

/// Forwarded copy of a producer
pub struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    layers_tx: Arc<watch::Sender<Option<ConsumerLayers>>>,
    consumer: Mutex<Option<MsConsumer>>,
    trigger: Arc<CloseTrigger>,
}

impl MediasoupConsumer {
    fn new(consumer: MsConsumer) -> Result<Self> {
        let rtp_parameters: RtpParameters = convert("consumer rtpParameters", consumer.rtp_parameters())?;
        let consumer_type = match consumer.r#type() {
            MsConsumerType::Simulcast => ConsumerType::Simulcast,
            MsConsumerType::Svc => ConsumerType::Svc,
            MsConsumerType::Simple | MsConsumerType::Pipe => ConsumerType::Simple,
        };

        let (layers_tx, _layers_rx) = watch::channel(consumer.current_layers().as_ref().map(consumer_layers));
        let layers_tx = Arc::new(layers_tx);
        consumer
            .on_layers_change({
                let layers_tx = layers_tx.clone();
                move |layers| {
                    layers_tx.send_replace(layers.as_ref().map(consumer_layers));
                }
            })
            .detach();

        let trigger = Arc::new(CloseTrigger::new());
        consumer.on_producer_close(fire_on(&trigger)).detach();
        consumer.on_close(fire_on(&trigger)).detach();

        Ok(Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: media_kind(consumer.kind()),
            rtp_parameters,
            consumer_type,
            layers_tx,
            consumer: Mutex::new(Some(consumer)),
            trigger,
        })
    }

    async fn stats(&self) -> Option<Value> {
        let consumer = self.consumer.lock().clone()?;
        let stats = consumer.get_stats().await.ok()?;
        serde_json::to_value(&stats).ok()
    }

    fn handle(&self) -> Result<MsConsumer> {
        handle(&self.consumer, "consumer", &self.id)
    }
}

#[async_trait]
impl Consumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn producer_paused(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .map(|consumer| consumer.producer_paused())
            .unwrap_or(false)
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()> {
        // Simple consumers have no layers to pick from.
        if self.consumer_type == ConsumerType::Simple {
            return Ok(());
        }
        self.handle()?
            .set_preferred_layers(MsConsumerLayers {
                spatial_layer: layers.spatial_layer,
                temporal_layer: Some(layers.temporal_layer),
            })
            .await
            .map_err(|err| engine_error("failed to set preferred layers", err))
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.consumer
            .lock()
            .as_ref()
            .and_then(|consumer| consumer.preferred_layers())
            .as_ref()
            .map(consumer_layers)
    }

    fn layers(&self) -> watch::Receiver<Option<ConsumerLayers>> {
        self.layers_tx.subscribe()
    }

    fn closed(&self) -> bool {
        self.trigger.is_fired()
    }

    fn close_signal(&self) -> CloseSignal {
        self.trigger.signal()
    }

    fn close(&self) {
        if self.trigger.fire() {
            self.consumer.lock().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::Protocol;

    #[test]
    fn candidates_accept_address_or_ip() {
        let modern = json!({
            "foundation": "udpcandidate",
            "priority": 1076302079u64,
            "address": "203.0.113.7",
            "protocol": "udp",
            "port": 40012,
            "type": "host"
        });
        let legacy = json!({
            "foundation": "tcpcandidate",
            "priority": 1076276479u64,
            "ip": "203.0.113.7",
            "protocol": "tcp",
            "port": 40013,
            "type": "host",
            "tcpType": "passive"
        });

        let udp = ice_candidate(&modern).unwrap();
        assert_eq!(udp.port, 40012);
        assert_eq!(udp.protocol, Protocol::Udp);
        let tcp = ice_candidate(&legacy).unwrap();
        assert_eq!(tcp.tcp_type.as_deref(), Some("passive"));
        assert!(ice_candidate(&json!({ "foundation": "x" })).is_none());
    }

    #[test]
    fn round_trip_times_are_found_in_nested_stats() {
        let stats = json!([
            { "type": "outbound-rtp", "roundTripTime": 42.5, "score": 10 },
            { "type": "inbound-rtp", "nested": { "roundTripTime": 17.5 } },
            { "type": "outbound-rtp", "roundTripTime": 0 }
        ]);
        let mut samples = Vec::new();
        collect_round_trip_times(&stats, &mut samples);
        assert_eq!(samples, vec![42.5, 17.5]);
    }

    #[test]
    fn producer_scores_use_the_encoding_index() {
        let scores = json!([
            { "encodingIdx": 0, "ssrc": 1111, "rid": "r0", "score": 9 },
            { "encodingIdx": 1, "ssrc": 2222, "rid": "r1", "score": 3 }
        ]);
        let scores = producer_scores(&scores);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[1].rid, Some(1));
        assert_eq!(scores[1].score, 3);
    }

    #[test]
    fn log_levels_fall_back_to_error() {
        assert!(matches!(log_level("WARN"), WorkerLogLevel::Warn));
        assert!(matches!(log_level("verbose"), WorkerLogLevel::Error));
    }
}
