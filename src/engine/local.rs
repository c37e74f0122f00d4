// In-process media engine
//
// `LocalEngine` models the lifecycle of a media engine without touching the
// network: workers own a port range, routers own transports, transports own
// producers and consumers, and closing any of them cascades downwards exactly
// like the real engine does. Statistics, producer scores, consumer layers,
// DTLS failures and worker deaths are driven through the inspection hooks on
// `LocalEngine`, which is how the test-suite feeds the adaptation loops. Only
// built for tests and with the `test-util` feature.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    CloseSignal, CloseTrigger, Consumer, ConsumerLayers, ConsumerType, DtlsFingerprint,
    DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters, MediaEngine, PlainTransport,
    PlainTransportOptions, PortRange, Producer, ProducerScore, Protocol, Router, TransportStats,
    WebRtcTransport, WebRtcTransportOptions, Worker, WorkerSettings,
};
use crate::{
    media::{
        codec::assign_payload_types, new_id, ConsumerId, MediaKind, ProducerId, RouterId,
        RtpCapabilities, RtpCodecCapability, RtpEncodingParameters, RtpParameters, TransportId,
        WorkerId,
    },
    Result, SfuError,
};

/// Everything the engine currently hosts, by id
#[derive(Default)]
struct LocalIndex {
    workers: DashMap<WorkerId, Arc<LocalWorker>>,
    webrtc_transports: DashMap<TransportId, Arc<LocalWebRtcTransport>>,
    plain_transports: DashMap<TransportId, Arc<LocalPlainTransport>>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    consumers: DashMap<ConsumerId, Arc<LocalConsumer>>,
}

/// In-process media engine
#[derive(Clone, Default)]
pub struct LocalEngine {
    index: Arc<LocalIndex>,
    failing_spawns: Arc<AtomicUsize>,
}

impl LocalEngine {
    /// Create a new engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` worker spawns fail
    pub fn fail_next_spawns(&self, count: usize) {
        self.failing_spawns.store(count, Ordering::SeqCst);
    }

    /// Ids of live workers
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.index.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Simulate a crash of a worker process
    pub fn kill_worker(&self, worker_id: &str) -> bool {
        let worker = self.index.workers.get(worker_id).map(|entry| entry.value().clone());
        match worker {
            Some(worker) => {
                tracing::warn!(worker_id = %worker_id, "Killing local worker");
                worker.shutdown();
                true
            }
            None => false,
        }
    }

    /// Access a WebRTC transport by id
    pub fn webrtc_transport(&self, id: &str) -> Option<Arc<LocalWebRtcTransport>> {
        self.index.webrtc_transports.get(id).map(|entry| entry.value().clone())
    }

    /// Access a plain transport by id
    pub fn plain_transport(&self, id: &str) -> Option<Arc<LocalPlainTransport>> {
        self.index.plain_transports.get(id).map(|entry| entry.value().clone())
    }

    /// Access a producer by id
    pub fn producer(&self, id: &str) -> Option<Arc<LocalProducer>> {
        self.index.producers.get(id).map(|entry| entry.value().clone())
    }

    /// Access a consumer by id
    pub fn consumer(&self, id: &str) -> Option<Arc<LocalConsumer>> {
        self.index.consumers.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live engine objects: (transports, producers, consumers)
    pub fn live_counts(&self) -> (usize, usize, usize) {
        (
            self.index.webrtc_transports.len() + self.index.plain_transports.len(),
            self.index.producers.len(),
            self.index.consumers.len(),
        )
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>> {
        let failing = self
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SfuError::Engine("failed to spawn worker".to_string()));
        }
        if settings.port_range.is_empty() {
            return Err(SfuError::InvalidParameters("empty worker port range".to_string()));
        }

        let worker = Arc::new(LocalWorker {
            id: new_id(),
            port_range: settings.port_range,
            ports: Arc::new(Mutex::new(PortAllocator::new(settings.port_range))),
            trigger: CloseTrigger::new(),
            routers: Mutex::new(Vec::new()),
            index: Arc::downgrade(&self.index),
        });
        self.index.workers.insert(worker.id.clone(), worker.clone());

        tracing::debug!(
            worker_id = %worker.id,
            min_port = settings.port_range.min,
            max_port = settings.port_range.max,
            log_level = %settings.log_level,
            "Local worker created"
        );
        Ok(worker)
    }
}

/// Hands out ports of a worker's range
struct PortAllocator {
    range: PortRange,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            next: range.min,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Result<u16> {
        for _ in 0..self.range.len() {
            let port = self.next;
            self.next = if port >= self.range.max { self.range.min } else { port + 1 };
            if self.in_use.insert(port) {
                return Ok(port);
            }
        }
        Err(SfuError::Engine(format!(
            "no free port in range {}-{}",
            self.range.min, self.range.max
        )))
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

type SharedPorts = Arc<Mutex<PortAllocator>>;

/// Worker of the local engine
pub struct LocalWorker {
    id: WorkerId,
    port_range: PortRange,
    ports: SharedPorts,
    trigger: CloseTrigger,
    routers: Mutex<Vec<Arc<LocalRouter>>>,
    index: Weak<LocalIndex>,
}

impl LocalWorker {
    fn shutdown(&self) {
        if !self.trigger.fire() {
            return;
        }
        let routers: Vec<_> = self.routers.lock().drain(..).collect();
        for router in routers {
            router.close();
        }
        if let Some(index) = self.index.upgrade() {
            index.workers.remove(&self.id);
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
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
        if media_codecs.is_empty() {
            return Err(SfuError::InvalidParameters("router needs at least one codec".to_string()));
        }

        let router = Arc::new_cyclic(|me| LocalRouter {
            id: new_id(),
            worker_id: self.id.clone(),
            capabilities: RtpCapabilities {
                codecs: assign_payload_types(media_codecs),
                header_extensions: Vec::new(),
            },
            trigger: CloseTrigger::new(),
            webrtc_transports: Mutex::new(Vec::new()),
            plain_transports: Mutex::new(Vec::new()),
            producers: DashMap::new(),
            ports: self.ports.clone(),
            index: self.index.clone(),
            me: me.clone(),
        });
        self.routers.lock().push(router.clone());
        Ok(router)
    }

    fn close(&self) {
        self.shutdown();
    }
}

/// Router of the local engine
pub struct LocalRouter {
    id: RouterId,
    worker_id: WorkerId,
    capabilities: RtpCapabilities,
    trigger: CloseTrigger,
    webrtc_transports: Mutex<Vec<Arc<LocalWebRtcTransport>>>,
    plain_transports: Mutex<Vec<Arc<LocalPlainTransport>>>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    ports: SharedPorts,
    index: Weak<LocalIndex>,
    me: Weak<LocalRouter>,
}

impl LocalRouter {
    fn ensure_open(&self) -> Result<()> {
        if self.trigger.is_fired() {
            Err(SfuError::Engine(format!("router {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    /// Whether the router routes this codec
    fn supports(&self, kind: MediaKind, rtp_parameters: &RtpParameters) -> bool {
        match rtp_parameters.media_codec() {
            Some(codec) => self.capabilities.codecs.iter().any(|capability| {
                capability.kind == kind
                    && capability.matches(&codec.mime_type, codec.clock_rate, codec.channels)
            }),
            None => false,
        }
    }

    fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<LocalConsumer>> {
        self.ensure_open()?;
        let producer = self
            .producers
            .get(producer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SfuError::NotFound(format!("producer {}", producer_id)))?;
        if !self.can_consume(producer_id, rtp_capabilities) {
            return Err(SfuError::CapabilityMismatch(producer_id.to_string()));
        }

        let consumer = Arc::new(LocalConsumer::new(&producer, rtp_capabilities, paused));
        producer.consumers.lock().push(consumer.clone());
        if let Some(index) = self.index.upgrade() {
            index.consumers.insert(consumer.id.clone(), consumer.clone());
        }
        Ok(consumer)
    }
}

#[async_trait]
impl Router for LocalRouter {
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
        self.ensure_open()?;
        if !options.enable_udp && !options.enable_tcp {
            return Err(SfuError::InvalidParameters("neither UDP nor TCP enabled".to_string()));
        }
        if options.listen_ips.is_empty() {
            return Err(SfuError::InvalidParameters("no listen ip".to_string()));
        }

        let port = self.ports.lock().allocate()?;
        let mut ice_candidates = Vec::new();
        for (position, listen_ip) in options.listen_ips.iter().enumerate() {
            let ip = listen_ip.announced_ip.unwrap_or(listen_ip.ip);
            let base = 1_000_000u32.saturating_sub(position as u32 * 1000);
            if options.enable_udp {
                ice_candidates.push(IceCandidate {
                    foundation: format!("udpcandidate{}", position),
                    priority: if options.prefer_udp { base + 100 } else { base },
                    ip,
                    protocol: Protocol::Udp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                });
            }
            if options.enable_tcp {
                ice_candidates.push(IceCandidate {
                    foundation: format!("tcpcandidate{}", position),
                    priority: if options.prefer_udp { base } else { base + 100 },
                    ip,
                    protocol: Protocol::Tcp,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                });
            }
        }

        let (dtls_tx, _dtls_rx) = watch::channel(DtlsState::New);
        let transport = Arc::new(LocalWebRtcTransport {
            id: new_id(),
            ice_parameters: IceParameters {
                username_fragment: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
                password: uuid::Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            local_dtls: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            dtls_tx,
            remote_dtls: Mutex::new(None),
            stats: Mutex::new(TransportStats {
                round_trip_time: None,
                available_outgoing_bitrate: Some(options.initial_available_outgoing_bitrate),
                bytes_received: 0,
                bytes_sent: 0,
            }),
            max_outgoing_bitrate: Mutex::new(None),
            bitrate_updates: AtomicUsize::new(0),
            stats_requests: AtomicUsize::new(0),
            rejected_bitrate_updates: AtomicUsize::new(0),
            port,
            trigger: CloseTrigger::new(),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            router: self.me.clone(),
            ports: self.ports.clone(),
            index: self.index.clone(),
        });

        self.webrtc_transports.lock().push(transport.clone());
        if let Some(index) = self.index.upgrade() {
            index.webrtc_transports.insert(transport.id.clone(), transport.clone());
        }
        Ok(transport)
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>> {
        self.ensure_open()?;
        let (rtp_port, rtcp_port) = {
            let mut ports = self.ports.lock();
            let rtp_port = ports.allocate()?;
            let rtcp_port = if options.rtcp_mux {
                None
            } else {
                match ports.allocate() {
                    Ok(port) => Some(port),
                    Err(err) => {
                        ports.release(rtp_port);
                        return Err(err);
                    }
                }
            };
            (rtp_port, rtcp_port)
        };

        let transport = Arc::new(LocalPlainTransport {
            id: new_id(),
            listen_ip: options.listen_ip.announced_ip.unwrap_or(options.listen_ip.ip),
            comedia: options.comedia,
            rtp_port,
            rtcp_port,
            remote: Mutex::new(None),
            trigger: CloseTrigger::new(),
            consumers: Mutex::new(Vec::new()),
            router: self.me.clone(),
            ports: self.ports.clone(),
            index: self.index.clone(),
        });

        self.plain_transports.lock().push(transport.clone());
        if let Some(index) = self.index.upgrade() {
            index.plain_transports.insert(transport.id.clone(), transport.clone());
        }
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producers.get(producer_id) else {
            return false;
        };
        if producer.closed() {
            return false;
        }
        let Some(codec) = producer.rtp_parameters.media_codec() else {
            return false;
        };
        rtp_capabilities.codecs.iter().any(|capability| {
            capability.kind == producer.kind
                && capability.matches(&codec.mime_type, codec.clock_rate, codec.channels)
        })
    }

    fn close(&self) {
        if !self.trigger.fire() {
            return;
        }
        let webrtc: Vec<_> = self.webrtc_transports.lock().drain(..).collect();
        for transport in webrtc {
            transport.close();
        }
        let plain: Vec<_> = self.plain_transports.lock().drain(..).collect();
        for transport in plain {
            transport.close();
        }
        self.producers.clear();
    }
}

fn random_fingerprint() -> String {
    let bytes: Vec<u8> = uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(uuid::Uuid::new_v4().as_bytes().iter())
        .copied()
        .collect();
    bytes
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// WebRTC transport of the local engine
pub struct LocalWebRtcTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    local_dtls: DtlsParameters,
    dtls_tx: watch::Sender<DtlsState>,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    stats: Mutex<TransportStats>,
    max_outgoing_bitrate: Mutex<Option<u32>>,
    bitrate_updates: AtomicUsize,
    stats_requests: AtomicUsize,
    rejected_bitrate_updates: AtomicUsize,
    port: u16,
    trigger: CloseTrigger,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    router: Weak<LocalRouter>,
    ports: SharedPorts,
    index: Weak<LocalIndex>,
}

impl LocalWebRtcTransport {
    /// Replace the statistics returned by `get_stats`
    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    /// Report a DTLS failure
    pub fn fail_dtls(&self) {
        self.dtls_tx.send_replace(DtlsState::Failed);
    }

    /// Last value passed to `set_max_outgoing_bitrate`
    pub fn max_outgoing_bitrate(&self) -> Option<u32> {
        *self.max_outgoing_bitrate.lock()
    }

    /// How many times `set_max_outgoing_bitrate` was called
    pub fn bitrate_updates(&self) -> usize {
        self.bitrate_updates.load(Ordering::SeqCst)
    }

    /// How many times `get_stats` was called
    pub fn stats_requests(&self) -> usize {
        self.stats_requests.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls to `set_max_outgoing_bitrate` fail
    pub fn reject_bitrate_updates(&self, count: usize) {
        self.rejected_bitrate_updates.store(count, Ordering::SeqCst);
    }

    /// Local ICE port
    pub fn port(&self) -> u16 {
        self.port
    }

    fn ensure_open(&self) -> Result<()> {
        if self.trigger.is_fired() {
            Err(SfuError::Engine(format!("transport {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn router(&self) -> Result<Arc<LocalRouter>> {
        self.router
            .upgrade()
            .ok_or_else(|| SfuError::Engine(format!("router of transport {} is gone", self.id)))
    }
}

#[async_trait]
impl WebRtcTransport for LocalWebRtcTransport {
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
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(SfuError::InvalidParameters("no DTLS fingerprints".to_string()));
        }
        {
            let mut remote = self.remote_dtls.lock();
            if remote.is_some() {
                return Err(SfuError::Engine("connect() already called".to_string()));
            }
            *remote = Some(dtls_parameters);
        }
        self.dtls_tx.send_replace(DtlsState::Connecting);
        self.dtls_tx.send_replace(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>> {
        self.ensure_open()?;
        let router = self.router()?;
        if rtp_parameters.codecs.is_empty() {
            return Err(SfuError::InvalidParameters("rtpParameters.codecs is empty".to_string()));
        }
        if !router.supports(kind, &rtp_parameters) {
            return Err(SfuError::InvalidParameters(format!(
                "no {} codec in rtpParameters is supported by the router",
                kind
            )));
        }

        let (scores_tx, _scores_rx) = watch::channel(Vec::new());
        let producer = Arc::new(LocalProducer {
            id: new_id(),
            kind,
            rtp_parameters,
            scores_tx,
            trigger: CloseTrigger::new(),
            consumers: Mutex::new(Vec::new()),
            router: self.router.clone(),
            index: self.index.clone(),
        });

        self.producers.lock().push(producer.clone());
        router.producers.insert(producer.id.clone(), producer.clone());
        if let Some(index) = self.index.upgrade() {
            index.producers.insert(producer.id.clone(), producer.clone());
        }
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        self.ensure_open()?;
        let consumer = self.router()?.consume(producer_id, rtp_capabilities, paused)?;
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }

    async fn get_stats(&self) -> Result<TransportStats> {
        self.ensure_open()?;
        self.stats_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.stats.lock().clone())
    }

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<()> {
        self.ensure_open()?;
        let rejected = self
            .rejected_bitrate_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SfuError::Engine(format!("transport {} rejected bitrate {}", self.id, bitrate)));
        }
        *self.max_outgoing_bitrate.lock() = Some(bitrate);
        self.bitrate_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
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
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }
        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close();
        }
        self.ports.lock().release(self.port);
        if let Some(index) = self.index.upgrade() {
            index.webrtc_transports.remove(&self.id);
        }
    }
}

/// Plain RTP transport of the local engine
pub struct LocalPlainTransport {
    id: TransportId,
    listen_ip: IpAddr,
    comedia: bool,
    rtp_port: u16,
    rtcp_port: Option<u16>,
    remote: Mutex<Option<(IpAddr, u16, Option<u16>)>>,
    trigger: CloseTrigger,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    router: Weak<LocalRouter>,
    ports: SharedPorts,
    index: Weak<LocalIndex>,
}

impl LocalPlainTransport {
    /// Remote address given to `connect`
    pub fn remote(&self) -> Option<(IpAddr, u16, Option<u16>)> {
        *self.remote.lock()
    }

    /// Address the transport listens on
    pub fn listen_ip(&self) -> IpAddr {
        self.listen_ip
    }
}

#[async_trait]
impl PlainTransport for LocalPlainTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn local_port(&self) -> u16 {
        self.rtp_port
    }

    fn local_rtcp_port(&self) -> Option<u16> {
        self.rtcp_port
    }

    async fn connect(&self, ip: IpAddr, port: u16, rtcp_port: Option<u16>) -> Result<()> {
        if self.trigger.is_fired() {
            return Err(SfuError::Engine(format!("transport {} is closed", self.id)));
        }
        if self.comedia {
            return Err(SfuError::InvalidParameters(
                "comedia transports learn the remote address".to_string(),
            ));
        }
        if self.rtcp_port.is_some() && rtcp_port.is_none() {
            return Err(SfuError::InvalidParameters("missing rtcp port".to_string()));
        }
        *self.remote.lock() = Some((ip, port, rtcp_port));
        Ok(())
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn Consumer>> {
        if self.trigger.is_fired() {
            return Err(SfuError::Engine(format!("transport {} is closed", self.id)));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| SfuError::Engine(format!("router of transport {} is gone", self.id)))?;
        let consumer = router.consume(producer_id, rtp_capabilities, paused)?;
        self.consumers.lock().push(consumer.clone());
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
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }
        {
            let mut ports = self.ports.lock();
            ports.release(self.rtp_port);
            if let Some(port) = self.rtcp_port {
                ports.release(port);
            }
        }
        if let Some(index) = self.index.upgrade() {
            index.plain_transports.remove(&self.id);
        }
    }
}

/// Producer of the local engine
pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    scores_tx: watch::Sender<Vec<ProducerScore>>,
    trigger: CloseTrigger,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    router: Weak<LocalRouter>,
    index: Weak<LocalIndex>,
}

impl LocalProducer {
    /// Publish a score update
    pub fn report_score(&self, scores: Vec<ProducerScore>) {
        self.scores_tx.send_replace(scores);
    }
}

impl Producer for LocalProducer {
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
        if !self.trigger.fire() {
            return;
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
        if let Some(index) = self.index.upgrade() {
            index.producers.remove(&self.id);
        }
    }
}

/// Consumer of the local engine
pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: ConsumerType,
    max_layers: Option<ConsumerLayers>,
    preferred: Mutex<Option<ConsumerLayers>>,
    layers_tx: watch::Sender<Option<ConsumerLayers>>,
    paused: bool,
    trigger: CloseTrigger,
    index: Weak<LocalIndex>,
}

impl LocalConsumer {
    fn new(producer: &LocalProducer, rtp_capabilities: &RtpCapabilities, paused: bool) -> Self {
        let source = &producer.rtp_parameters;
        let mut codecs = Vec::new();
        if let Some(codec) = source.media_codec() {
            let mut codec = codec.clone();
            if let Some(payload_type) = rtp_capabilities
                .codecs
                .iter()
                .find(|capability| {
                    capability.matches(&codec.mime_type, codec.clock_rate, codec.channels)
                })
                .and_then(|capability| capability.preferred_payload_type)
            {
                codec.payload_type = payload_type;
            }
            codecs.push(codec);
        }

        let scalability = source
            .encodings
            .first()
            .and_then(|encoding| encoding.scalability_mode.as_deref())
            .and_then(parse_scalability_mode);
        let (consumer_type, max_layers) = if source.encodings.len() > 1 {
            let temporal = scalability.map(|(_, temporal)| temporal).unwrap_or(1);
            (
                ConsumerType::Simulcast,
                Some(ConsumerLayers {
                    spatial_layer: (source.encodings.len() - 1) as u8,
                    temporal_layer: temporal.saturating_sub(1),
                }),
            )
        } else if let Some((spatial, temporal)) = scalability.filter(|(s, t)| *s > 1 || *t > 1) {
            (
                ConsumerType::Svc,
                Some(ConsumerLayers {
                    spatial_layer: spatial.saturating_sub(1),
                    temporal_layer: temporal.saturating_sub(1),
                }),
            )
        } else {
            (ConsumerType::Simple, None)
        };

        let (layers_tx, _layers_rx) = watch::channel(None);
        Self {
            id: new_id(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs,
                encodings: vec![RtpEncodingParameters {
                    ssrc: Some(rand_ssrc()),
                    ..Default::default()
                }],
                header_extensions: Vec::new(),
                extra: Default::default(),
            },
            consumer_type,
            max_layers,
            preferred: Mutex::new(None),
            layers_tx,
            paused,
            trigger: CloseTrigger::new(),
            index: producer.index.clone(),
        }
    }

    /// Publish the layers the engine is actually forwarding
    pub fn report_layers(&self, layers: Option<ConsumerLayers>) {
        self.layers_tx.send_replace(layers);
    }

    /// Whether the consumer was created paused
    pub fn paused(&self) -> bool {
        self.paused
    }
}

/// `L3T3` → (3, 3)
fn parse_scalability_mode(mode: &str) -> Option<(u8, u8)> {
    let rest = mode.strip_prefix('L')?;
    let (spatial, rest) = rest.split_once('T')?;
    let temporal: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((spatial.parse().ok()?, temporal.parse().ok()?))
}

fn rand_ssrc() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let seed = uuid::Uuid::new_v4().as_u128() as u32;
    seed.wrapping_add(NEXT.fetch_add(1, Ordering::Relaxed)) | 1
}

#[async_trait]
impl Consumer for LocalConsumer {
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
        false
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> Result<()> {
        if self.trigger.is_fired() {
            return Err(SfuError::Engine(format!("consumer {} is closed", self.id)));
        }
        // Simple consumers have no layers to pick from.
        let Some(max) = self.max_layers else {
            return Ok(());
        };
        *self.preferred.lock() = Some(ConsumerLayers {
            spatial_layer: layers.spatial_layer.min(max.spatial_layer),
            temporal_layer: layers.temporal_layer.min(max.temporal_layer),
        });
        Ok(())
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.preferred.lock()
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
        if !self.trigger.fire() {
            return;
        }
        if let Some(index) = self.index.upgrade() {
            index.consumers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;

    use super::*;
    use crate::media::codec::media_codecs;

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            log_level: "warn".to_string(),
            port_range: PortRange { min: 40000, max: 40009 },
        }
    }

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![super::super::ListenIp {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn vp8_parameters(encodings: usize) -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": (0..encodings)
                .map(|i| json!({ "ssrc": 1000 + i, "scalabilityMode": "L1T3" }))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn closing_a_worker_cascades_to_consumers() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(worker_settings()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(transport_options()).await.unwrap();
        let recv = router.create_webrtc_transport(transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters(1)).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), &router.rtp_capabilities(), false)
            .await
            .unwrap();
        assert_eq!(engine.live_counts(), (2, 1, 1));

        assert!(engine.kill_worker(&worker.id()));
        assert!(router.closed());
        assert!(send.closed() && recv.closed());
        assert!(producer.closed() && consumer.closed());
        assert_eq!(engine.live_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn capability_mismatch_is_detected() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(worker_settings()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters(1)).await.unwrap();

        let audio_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs
                .into_iter()
                .filter(|codec| codec.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(&producer.id(), &audio_only));
        assert!(router.can_consume(&producer.id(), &router.rtp_capabilities()));
    }

    #[tokio::test]
    async fn simulcast_consumer_clamps_preferred_layers() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(worker_settings()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(transport_options()).await.unwrap();
        let recv = router.create_webrtc_transport(transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters(2)).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), &router.rtp_capabilities(), false)
            .await
            .unwrap();

        assert_eq!(consumer.consumer_type(), ConsumerType::Simulcast);
        consumer
            .set_preferred_layers(ConsumerLayers { spatial_layer: 2, temporal_layer: 2 })
            .await
            .unwrap();
        assert_eq!(
            consumer.preferred_layers(),
            Some(ConsumerLayers { spatial_layer: 1, temporal_layer: 2 })
        );
    }

    #[tokio::test]
    async fn ports_are_recycled_after_close() {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(WorkerSettings {
                log_level: "warn".to_string(),
                port_range: PortRange { min: 41000, max: 41000 },
            })
            .await
            .unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let first = router.create_webrtc_transport(transport_options()).await.unwrap();
        assert!(router.create_webrtc_transport(transport_options()).await.is_err());

        first.close();
        assert!(router.create_webrtc_transport(transport_options()).await.is_ok());
    }

    #[tokio::test]
    async fn connect_rejects_empty_fingerprints_and_repeats() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(worker_settings()).await.unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let transport = router.create_webrtc_transport(transport_options()).await.unwrap();

        let empty = DtlsParameters { role: DtlsRole::Auto, fingerprints: Vec::new() };
        assert!(matches!(
            transport.connect(empty).await,
            Err(SfuError::InvalidParameters(_))
        ));

        let remote = transport.dtls_parameters();
        transport.connect(remote.clone()).await.unwrap();
        assert_eq!(*transport.dtls_state().borrow(), DtlsState::Connected);
        assert!(transport.connect(remote).await.is_err());
    }

    #[test]
    fn scalability_modes_parse() {
        assert_eq!(parse_scalability_mode("L1T3"), Some((1, 3)));
        assert_eq!(parse_scalability_mode("L3T3_KEY"), Some((3, 3)));
        assert_eq!(parse_scalability_mode("S2T1"), None);
    }
}
