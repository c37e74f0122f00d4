// Session management module for the SFU
//
// This module keeps track of every peer and of the transports, producers and
// consumers it owns. Resources are indexed globally by id and in their
// owner's sets; closing a resource, whatever the cause, removes it from both.

use std::{
    collections::{BTreeSet, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    bandwidth::BitratePolicy,
    engine::{
        bounded, Consumer, DtlsParameters, DtlsState, Producer, Router, WebRtcTransport,
        WebRtcTransportOptions,
    },
    media::{
        ConsumerId, MediaKind, ProducerId, RoomId, RtpCapabilities, RtpParameters, TransportId,
    },
    signaling::{Channel, Event, Outbox},
    simulcast::{spawn_layer_observer, spawn_score_observer, QualityIndex},
    transport::{BitrateMonitor, TransportDirection},
    Result, SfuError,
};

/// Identity of a peer: the surface it talks on and its client id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub channel: Channel,
    pub id: String,
}

impl PeerKey {
    pub fn new(channel: Channel, id: impl Into<String>) -> Self {
        Self {
            channel,
            id: id.into(),
        }
    }
}

/// Role of a producer in its room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerRole {
    /// Published by the broadcaster
    Primary,
    /// Published by a call-in guest
    Secondary,
}

impl From<Channel> for ProducerRole {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::Streaming => ProducerRole::Primary,
            Channel::Interactive => ProducerRole::Secondary,
        }
    }
}

/// Producer listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: String,
    pub role: ProducerRole,
}

/// Derived signaling state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unjoined,
    Joined,
    TransportPending,
    TransportConnected {
        producing: usize,
        consuming: usize,
    },
}

/// A registered peer
struct Peer {
    room_id: RoomId,
    outbox: Outbox,
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

/// A registered transport
pub struct TransportEntry {
    pub transport: Arc<dyn WebRtcTransport>,
    pub peer: PeerKey,
    pub room_id: RoomId,
    pub direction: TransportDirection,
    connected: AtomicBool,
}

impl TransportEntry {
    /// Whether `connect` succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A registered producer
pub struct ProducerEntry {
    pub producer: Arc<dyn Producer>,
    pub peer: PeerKey,
    pub room_id: RoomId,
    pub role: ProducerRole,
    pub quality: QualityIndex,
}

impl ProducerEntry {
    fn info(&self) -> ProducerInfo {
        ProducerInfo {
            id: self.producer.id(),
            kind: self.producer.kind(),
            peer_id: self.peer.id.clone(),
            role: self.role,
        }
    }
}

/// A registered consumer
pub struct ConsumerEntry {
    pub consumer: Arc<dyn Consumer>,
    pub peer: PeerKey,
    pub room_id: RoomId,
    pub producer_id: ProducerId,
}

/// Settings of the resource registry
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Deadline of engine requests
    pub engine_timeout: Duration,
    /// Policy of the bitrate monitors
    pub bitrate_policy: BitratePolicy,
    /// Sampling interval of the bitrate monitors
    pub sample_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(10),
            bitrate_policy: BitratePolicy::default(),
            sample_interval: crate::transport::adaptation::DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// Peers and the media resources they own
pub struct ResourceRegistry {
    peers: DashMap<PeerKey, Peer>,
    transports: DashMap<TransportId, Arc<TransportEntry>>,
    producers: DashMap<ProducerId, Arc<ProducerEntry>>,
    consumers: DashMap<ConsumerId, Arc<ConsumerEntry>>,
    settings: RegistrySettings,
    me: Weak<ResourceRegistry>,
}

impl ResourceRegistry {
    pub fn new(settings: RegistrySettings) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            peers: DashMap::new(),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            settings,
            me: me.clone(),
        })
    }

    /// Register a peer; a repeat call keeps its resources and refreshes the
    /// room and outbox
    pub fn create_peer(&self, key: PeerKey, room_id: &str, outbox: Outbox) {
        self.peers
            .entry(key)
            .and_modify(|peer| {
                peer.room_id = room_id.to_string();
                peer.outbox = outbox.clone();
            })
            .or_insert_with(|| Peer {
                room_id: room_id.to_string(),
                outbox,
                transports: HashSet::new(),
                producers: HashSet::new(),
                consumers: HashSet::new(),
            });
    }

    pub fn has_peer(&self, key: &PeerKey) -> bool {
        self.peers.contains_key(key)
    }

    fn outbox(&self, key: &PeerKey) -> Option<Outbox> {
        self.peers.get(key).map(|peer| peer.outbox.clone())
    }

    /// Create a transport on `router` for the peer
    pub async fn create_transport(
        &self,
        router: &Arc<dyn Router>,
        key: &PeerKey,
        room_id: &str,
        direction: TransportDirection,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>> {
        if !self.peers.contains_key(key) {
            return Err(SfuError::NotFound(format!("peer {}", key.id)));
        }

        let transport = bounded(
            self.settings.engine_timeout,
            "transport creation",
            router.create_webrtc_transport(options),
        )
        .await?;
        let transport_id = transport.id();

        let entry = Arc::new(TransportEntry {
            transport: transport.clone(),
            peer: key.clone(),
            room_id: room_id.to_string(),
            direction,
            connected: AtomicBool::new(false),
        });
        self.transports.insert(transport_id.clone(), entry);

        let owned = match self.peers.get_mut(key) {
            Some(mut peer) => {
                peer.transports.insert(transport_id.clone());
                true
            }
            None => false,
        };
        if !owned {
            // The peer disconnected while the engine was busy.
            self.transports.remove(&transport_id);
            transport.close();
            return Err(SfuError::NotFound(format!("peer {}", key.id)));
        }

        self.observe_transport(transport.clone(), direction);
        tracing::info!(
            transport_id = %transport_id,
            client_id = %key.id,
            room_id = %room_id,
            direction = ?direction,
            "Transport created"
        );
        Ok(transport)
    }

    fn observe_transport(&self, transport: Arc<dyn WebRtcTransport>, direction: TransportDirection) {
        let registry = self.me.clone();
        let policy = self.settings.bitrate_policy;
        let interval = self.settings.sample_interval;

        tokio::spawn(async move {
            let transport_id = transport.id();
            let mut dtls = transport.dtls_state();
            let closed = transport.close_signal().closed();
            tokio::pin!(closed);
            let mut monitoring = false;

            loop {
                let state = *dtls.borrow_and_update();
                match state {
                    DtlsState::Connected if direction == TransportDirection::Send && !monitoring => {
                        BitrateMonitor::spawn(transport.clone(), policy, interval);
                        monitoring = true;
                    }
                    DtlsState::Failed | DtlsState::Closed => {
                        tracing::info!(transport_id = %transport_id, state = ?state, "DTLS ended, closing transport");
                        transport.close();
                        break;
                    }
                    _ => {}
                }

                tokio::select! {
                    _ = &mut closed => break,
                    changed = dtls.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            if let Some(registry) = registry.upgrade() {
                if registry.forget_transport(&transport_id).is_some() {
                    tracing::debug!(transport_id = %transport_id, "Transport closed");
                }
            }
        });
    }

    /// Provide the remote DTLS parameters of a transport
    pub async fn connect_transport(
        &self,
        key: &PeerKey,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let entry = self.owned_transport(key, transport_id)?;
        bounded(
            self.settings.engine_timeout,
            "transport connect",
            entry.transport.connect(dtls_parameters),
        )
        .await?;
        entry.connected.store(true, Ordering::SeqCst);
        tracing::info!(transport_id = %transport_id, client_id = %key.id, "Transport connected");
        Ok(())
    }

    fn owned_transport(&self, key: &PeerKey, transport_id: &str) -> Result<Arc<TransportEntry>> {
        let entry = self
            .transports
            .get(transport_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SfuError::NotFound(format!("transport {}", transport_id)))?;
        if &entry.peer != key {
            return Err(SfuError::InvalidParameters(format!(
                "transport {} does not belong to {}",
                transport_id, key.id
            )));
        }
        Ok(entry)
    }

    pub fn transport(&self, transport_id: &str) -> Option<Arc<TransportEntry>> {
        self.transports.get(transport_id).map(|entry| entry.value().clone())
    }

    /// Publish a track on one of the peer's send transports
    pub async fn create_producer(
        &self,
        key: &PeerKey,
        room_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        role: ProducerRole,
    ) -> Result<Arc<ProducerEntry>> {
        let transport = self.owned_transport(key, transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(SfuError::InvalidParameters(format!(
                "transport {} is not a send transport",
                transport_id
            )));
        }
        if transport.room_id != room_id {
            return Err(SfuError::InvalidParameters(format!(
                "transport {} belongs to room {}",
                transport_id, transport.room_id
            )));
        }

        let producer = bounded(
            self.settings.engine_timeout,
            "produce",
            transport.transport.produce(kind, rtp_parameters),
        )
        .await?;
        let producer_id = producer.id();

        let entry = Arc::new(ProducerEntry {
            producer: producer.clone(),
            peer: key.clone(),
            room_id: room_id.to_string(),
            role,
            quality: QualityIndex::new(),
        });
        self.producers.insert(producer_id.clone(), entry.clone());

        let outbox = match self.peers.get_mut(key) {
            Some(mut peer) => {
                peer.producers.insert(producer_id.clone());
                Some(peer.outbox.clone())
            }
            None => None,
        };
        let Some(outbox) = outbox else {
            self.producers.remove(&producer_id);
            producer.close();
            return Err(SfuError::NotFound(format!("peer {}", key.id)));
        };

        let notified_id = producer_id.clone();
        spawn_score_observer(producer.clone(), entry.quality.clone(), move |quality_index| {
            outbox.notify(Event::QualityChanged {
                producer_id: notified_id.clone(),
                quality_index,
            });
        });
        self.observe_close(producer.close_signal(), Resource::Producer(producer_id.clone()));

        tracing::info!(
            producer_id = %producer_id,
            client_id = %key.id,
            room_id = %room_id,
            kind = %kind,
            role = ?role,
            "Producer created"
        );
        Ok(entry)
    }

    /// Forward a producer to one of the peer's receive transports
    pub async fn create_consumer(
        &self,
        key: &PeerKey,
        room_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Arc<ConsumerEntry>> {
        let transport = self.owned_transport(key, transport_id)?;
        if transport.direction != TransportDirection::Recv {
            return Err(SfuError::InvalidParameters(format!(
                "transport {} is not a receive transport",
                transport_id
            )));
        }
        let source_room = self
            .producers
            .get(producer_id)
            .map(|entry| entry.room_id.clone())
            .ok_or_else(|| SfuError::NotFound(format!("producer {}", producer_id)))?;
        if source_room != room_id || transport.room_id != room_id {
            return Err(SfuError::NotFound(format!(
                "producer {} in room {}",
                producer_id, room_id
            )));
        }

        let consumer = bounded(
            self.settings.engine_timeout,
            "consume",
            transport.transport.consume(producer_id, rtp_capabilities, false),
        )
        .await?;
        let consumer_id = consumer.id();

        let entry = Arc::new(ConsumerEntry {
            consumer: consumer.clone(),
            peer: key.clone(),
            room_id: room_id.to_string(),
            producer_id: producer_id.to_string(),
        });
        self.consumers.insert(consumer_id.clone(), entry.clone());

        let owned = match self.peers.get_mut(key) {
            Some(mut peer) => {
                peer.consumers.insert(consumer_id.clone());
                true
            }
            None => false,
        };
        if !owned {
            self.consumers.remove(&consumer_id);
            consumer.close();
            return Err(SfuError::NotFound(format!("peer {}", key.id)));
        }

        spawn_layer_observer(consumer.clone());
        self.observe_close(consumer.close_signal(), Resource::Consumer(consumer_id.clone()));

        tracing::info!(
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            client_id = %key.id,
            room_id = %room_id,
            "Consumer created"
        );
        Ok(entry)
    }

    fn observe_close(&self, signal: crate::engine::CloseSignal, resource: Resource) {
        let registry = self.me.clone();
        tokio::spawn(async move {
            signal.closed().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match resource {
                Resource::Producer(id) => {
                    registry.forget_producer(&id);
                }
                Resource::Consumer(id) => {
                    if let Some(entry) = registry.forget_consumer(&id) {
                        // Still registered, so nobody tore it down on purpose.
                        if !registry.producers.contains_key(&entry.producer_id) {
                            if let Some(outbox) = registry.outbox(&entry.peer) {
                                outbox.notify(Event::ConsumerClosed {
                                    consumer_id: id,
                                    producer_id: entry.producer_id.clone(),
                                });
                            }
                        }
                    }
                }
            }
        });
    }

    fn forget_transport(&self, id: &str) -> Option<Arc<TransportEntry>> {
        let (_, entry) = self.transports.remove(id)?;
        if let Some(mut peer) = self.peers.get_mut(&entry.peer) {
            peer.transports.remove(id);
        }
        Some(entry)
    }

    fn forget_producer(&self, id: &str) -> Option<Arc<ProducerEntry>> {
        let (_, entry) = self.producers.remove(id)?;
        if let Some(mut peer) = self.peers.get_mut(&entry.peer) {
            peer.producers.remove(id);
        }
        Some(entry)
    }

    fn forget_consumer(&self, id: &str) -> Option<Arc<ConsumerEntry>> {
        let (_, entry) = self.consumers.remove(id)?;
        if let Some(mut peer) = self.peers.get_mut(&entry.peer) {
            peer.consumers.remove(id);
        }
        Some(entry)
    }

    /// Existing producer of the peer for `kind` in `room_id`
    pub fn find_producer(&self, key: &PeerKey, room_id: &str, kind: MediaKind) -> Option<Arc<ProducerEntry>> {
        let ids: Vec<ProducerId> = self.peers.get(key)?.producers.iter().cloned().collect();
        ids.into_iter()
            .filter_map(|id| self.producers.get(&id).map(|entry| entry.value().clone()))
            .find(|entry| {
                entry.room_id == room_id && entry.producer.kind() == kind && !entry.producer.closed()
            })
    }

    /// Close everything the peer owns in `room_id`.
    ///
    /// Consumers of other peers fed by the closed producers are closed too and
    /// their owners told so. Returns the ids of the producers this call closed.
    pub fn close_room_resources(&self, key: &PeerKey, room_id: &str) -> Vec<ProducerId> {
        let Some((transport_ids, producer_ids, consumer_ids)) = self.peers.get(key).map(|peer| {
            (
                peer.transports.iter().cloned().collect::<Vec<_>>(),
                peer.producers.iter().cloned().collect::<Vec<_>>(),
                peer.consumers.iter().cloned().collect::<Vec<_>>(),
            )
        }) else {
            return Vec::new();
        };

        let producer_ids: Vec<ProducerId> = producer_ids
            .into_iter()
            .filter(|id| {
                self.producers
                    .get(id)
                    .map(|entry| entry.room_id == room_id)
                    .unwrap_or(false)
            })
            .collect();

        let mut closed = Vec::new();
        for producer_id in producer_ids {
            let dependents: Vec<ConsumerId> = self
                .consumers
                .iter()
                .filter(|entry| entry.producer_id == producer_id)
                .map(|entry| entry.key().clone())
                .collect();
            for consumer_id in dependents {
                if let Some(entry) = self.forget_consumer(&consumer_id) {
                    entry.consumer.close();
                    if &entry.peer != key {
                        if let Some(outbox) = self.outbox(&entry.peer) {
                            outbox.notify(Event::ConsumerClosed {
                                consumer_id,
                                producer_id: producer_id.clone(),
                            });
                        }
                    }
                }
            }

            if let Some(entry) = self.forget_producer(&producer_id) {
                entry.producer.close();
                closed.push(producer_id);
            }
        }

        for consumer_id in consumer_ids {
            let in_room = self
                .consumers
                .get(&consumer_id)
                .map(|entry| entry.room_id == room_id)
                .unwrap_or(false);
            if in_room {
                if let Some(entry) = self.forget_consumer(&consumer_id) {
                    entry.consumer.close();
                }
            }
        }

        for transport_id in transport_ids {
            let in_room = self
                .transports
                .get(&transport_id)
                .map(|entry| entry.room_id == room_id)
                .unwrap_or(false);
            if in_room {
                if let Some(entry) = self.forget_transport(&transport_id) {
                    entry.transport.close();
                }
            }
        }

        if !closed.is_empty() {
            tracing::info!(client_id = %key.id, room_id = %room_id, producers = ?closed, "Closed room resources");
        }
        closed
    }

    /// Tear down the peer completely; returns the closed producers per room
    pub fn remove_peer(&self, key: &PeerKey) -> Vec<(RoomId, Vec<ProducerId>)> {
        let Some(rooms) = self.peer_rooms(key) else {
            return Vec::new();
        };

        let closed = rooms
            .into_iter()
            .map(|room_id| {
                let producers = self.close_room_resources(key, &room_id);
                (room_id, producers)
            })
            .collect();
        self.peers.remove(key);
        tracing::info!(client_id = %key.id, channel = ?key.channel, "Peer removed");
        closed
    }

    fn peer_rooms(&self, key: &PeerKey) -> Option<BTreeSet<RoomId>> {
        let (room_id, transports, producers, consumers) = self.peers.get(key).map(|peer| {
            (
                peer.room_id.clone(),
                peer.transports.iter().cloned().collect::<Vec<_>>(),
                peer.producers.iter().cloned().collect::<Vec<_>>(),
                peer.consumers.iter().cloned().collect::<Vec<_>>(),
            )
        })?;

        let mut rooms = BTreeSet::new();
        rooms.insert(room_id);
        rooms.extend(transports.iter().filter_map(|id| self.transports.get(id).map(|e| e.room_id.clone())));
        rooms.extend(producers.iter().filter_map(|id| self.producers.get(id).map(|e| e.room_id.clone())));
        rooms.extend(consumers.iter().filter_map(|id| self.consumers.get(id).map(|e| e.room_id.clone())));
        Some(rooms)
    }

    /// Every open producer of `room_id`
    pub fn producer_list(&self, room_id: &str) -> Vec<ProducerInfo> {
        let mut list: Vec<ProducerInfo> = self
            .producers
            .iter()
            .filter(|entry| entry.room_id == room_id && !entry.producer.closed())
            .map(|entry| entry.info())
            .collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn producer(&self, producer_id: &str) -> Option<Arc<ProducerEntry>> {
        self.producers.get(producer_id).map(|entry| entry.value().clone())
    }

    pub fn room_has_producers(&self, room_id: &str) -> bool {
        self.producers.iter().any(|entry| entry.room_id == room_id)
    }

    /// Whether no peer or resource refers to `room_id`
    pub fn room_is_idle(&self, room_id: &str) -> bool {
        !self.peers.iter().any(|peer| peer.room_id == room_id)
            && !self.transports.iter().any(|entry| entry.room_id == room_id)
            && !self.producers.iter().any(|entry| entry.room_id == room_id)
            && !self.consumers.iter().any(|entry| entry.room_id == room_id)
    }

    /// Signaling state derived from what the peer owns
    pub fn peer_state(&self, key: &PeerKey) -> PeerState {
        let Some((transports, producing, consuming)) = self.peers.get(key).map(|peer| {
            (
                peer.transports.iter().cloned().collect::<Vec<_>>(),
                peer.producers.len(),
                peer.consumers.len(),
            )
        }) else {
            return PeerState::Unjoined;
        };

        if transports.is_empty() {
            return PeerState::Joined;
        }
        let connected = transports.iter().any(|id| {
            self.transports
                .get(id)
                .map(|entry| entry.is_connected())
                .unwrap_or(false)
        });
        if connected {
            PeerState::TransportConnected {
                producing,
                consuming,
            }
        } else {
            PeerState::TransportPending
        }
    }

    /// Number of registry entries owned by the peer, across every map
    pub fn owned_entries(&self, key: &PeerKey) -> usize {
        self.peers.get(key).map(|_| 1).unwrap_or(0)
            + self.transports.iter().filter(|entry| &entry.peer == key).count()
            + self.producers.iter().filter(|entry| &entry.peer == key).count()
            + self.consumers.iter().filter(|entry| &entry.peer == key).count()
    }

    /// Drop every peer whose room was torn down underneath it
    pub fn forget_room(&self, room_id: &str) {
        let keys: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|peer| peer.room_id == room_id)
            .map(|peer| peer.key().clone())
            .collect();
        for key in keys {
            self.close_room_resources(&key, room_id);
        }
    }
}

enum Resource {
    Producer(ProducerId),
    Consumer(ConsumerId),
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        engine::{ConsumerLayers, ListenIp, LocalEngine, MediaEngine, PortRange, ProducerScore, WorkerSettings},
        media::codec::media_codecs,
        signaling::{Outbound, Outbox},
    };

    struct Fixture {
        engine: LocalEngine,
        router: Arc<dyn Router>,
        registry: Arc<ResourceRegistry>,
    }

    async fn fixture() -> Fixture {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(WorkerSettings {
                log_level: "warn".to_string(),
                port_range: PortRange { min: 30000, max: 30099 },
            })
            .await
            .unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        Fixture {
            engine,
            router,
            registry: ResourceRegistry::new(RegistrySettings::default()),
        }
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
            }],
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn outbox(channel: Channel) -> (Outbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (Outbox::new(crate::signaling::next_connection_id(), channel, tx), rx)
    }

    fn opus() -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
            "encodings": [{ "ssrc": 42 }],
        }))
        .unwrap()
    }

    fn vp8(encodings: usize) -> RtpParameters {
        let encodings: Vec<_> = (0..encodings)
            .map(|index| json!({ "ssrc": 1000 + index, "rid": format!("r{}", index), "scalabilityMode": "L1T3" }))
            .collect();
        serde_json::from_value(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": encodings,
        }))
        .unwrap()
    }

    async fn publish(
        f: &Fixture,
        key: &PeerKey,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> (Arc<ProducerEntry>, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = outbox(key.channel);
        f.registry.create_peer(key.clone(), "r1", outbox);
        let transport = f
            .registry
            .create_transport(&f.router, key, "r1", TransportDirection::Send, options())
            .await
            .unwrap();
        let producer = f
            .registry
            .create_producer(key, "r1", &transport.id(), kind, rtp_parameters, ProducerRole::Primary)
            .await
            .unwrap();
        (producer, rx)
    }

    async fn publisher(f: &Fixture, key: &PeerKey) -> Arc<ProducerEntry> {
        publish(f, key, MediaKind::Audio, opus()).await.0
    }

    async fn viewer(f: &Fixture, key: &PeerKey, producer_id: &str) -> (Arc<ConsumerEntry>, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = outbox(key.channel);
        f.registry.create_peer(key.clone(), "r1", outbox);
        let recv = f
            .registry
            .create_transport(&f.router, key, "r1", TransportDirection::Recv, options())
            .await
            .unwrap();
        let consumer = f
            .registry
            .create_consumer(key, "r1", &recv.id(), producer_id, &f.router.rtp_capabilities())
            .await
            .unwrap();
        (consumer, rx)
    }

    #[tokio::test]
    async fn producing_needs_a_send_transport() {
        let f = fixture().await;
        let key = PeerKey::new(Channel::Streaming, "alice");
        let (outbox, _rx) = outbox(Channel::Streaming);
        f.registry.create_peer(key.clone(), "r1", outbox);
        let recv = f
            .registry
            .create_transport(&f.router, &key, "r1", TransportDirection::Recv, options())
            .await
            .unwrap();

        let result = f
            .registry
            .create_producer(&key, "r1", &recv.id(), MediaKind::Audio, opus(), ProducerRole::Primary)
            .await;
        assert!(matches!(result, Err(SfuError::InvalidParameters(_))));

        let missing = f
            .registry
            .create_producer(&key, "r1", "nope", MediaKind::Audio, opus(), ProducerRole::Primary)
            .await;
        assert!(matches!(missing, Err(SfuError::NotFound(_))));
    }

    #[tokio::test]
    async fn closing_room_resources_is_idempotent() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        let producer = publisher(&f, &alice).await;

        let bob = PeerKey::new(Channel::Streaming, "bob");
        let (bob_outbox, mut bob_rx) = outbox(Channel::Streaming);
        f.registry.create_peer(bob.clone(), "r1", bob_outbox);
        let recv = f
            .registry
            .create_transport(&f.router, &bob, "r1", TransportDirection::Recv, options())
            .await
            .unwrap();
        let consumer = f
            .registry
            .create_consumer(&bob, "r1", &recv.id(), &producer.producer.id(), &f.router.rtp_capabilities())
            .await
            .unwrap();

        let closed = f.registry.close_room_resources(&alice, "r1");
        assert_eq!(closed, vec![producer.producer.id()]);
        assert!(consumer.consumer.closed());
        assert!(f.registry.close_room_resources(&alice, "r1").is_empty());

        let notice = bob_rx.recv().await.unwrap();
        assert!(matches!(notice.event, Event::ConsumerClosed { .. }));
        assert_eq!(f.registry.peer_state(&bob), PeerState::TransportPending);
    }

    #[tokio::test]
    async fn removed_peer_leaves_nothing_behind() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        publisher(&f, &alice).await;
        assert!(f.registry.owned_entries(&alice) >= 3);

        let closed = f.registry.remove_peer(&alice);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1.len(), 1);
        assert_eq!(f.registry.owned_entries(&alice), 0);
        assert!(f.registry.room_is_idle("r1"));
        assert_eq!(f.engine.live_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn engine_side_close_is_observed() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        let producer = publisher(&f, &alice).await;
        let transport_id = f
            .registry
            .transports
            .iter()
            .map(|entry| entry.key().clone())
            .next()
            .unwrap();

        f.engine.webrtc_transport(&transport_id).unwrap().fail_dtls();
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.registry.owned_entries(&alice) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(producer.producer.closed());
        assert!(f.registry.producer_list("r1").is_empty());
        assert_eq!(f.registry.peer_state(&alice), PeerState::Joined);
    }

    #[tokio::test]
    async fn existing_producer_is_found_per_kind() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        let producer = publisher(&f, &alice).await;

        let found = f.registry.find_producer(&alice, "r1", MediaKind::Audio).unwrap();
        assert_eq!(found.producer.id(), producer.producer.id());
        assert!(f.registry.find_producer(&alice, "r1", MediaKind::Video).is_none());
        assert!(f.registry.find_producer(&alice, "r2", MediaKind::Audio).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_teardown_reports_each_producer_once() {
        for _ in 0..32 {
            let f = fixture().await;
            let alice = PeerKey::new(Channel::Streaming, "alice");
            let audio = publisher(&f, &alice).await;
            let send_id = f.registry.peers.get(&alice).unwrap().transports.iter().next().cloned().unwrap();
            let video = f
                .registry
                .create_producer(&alice, "r1", &send_id, MediaKind::Video, vp8(1), ProducerRole::Primary)
                .await
                .unwrap();

            let bob = PeerKey::new(Channel::Streaming, "bob");
            let (consumer, mut bob_rx) = viewer(&f, &bob, &audio.producer.id()).await;

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let room_close = tokio::spawn({
                let registry = f.registry.clone();
                let barrier = barrier.clone();
                let alice = alice.clone();
                async move {
                    barrier.wait().await;
                    registry.close_room_resources(&alice, "r1")
                }
            });
            let peer_removal = tokio::spawn({
                let registry = f.registry.clone();
                let barrier = barrier.clone();
                let alice = alice.clone();
                async move {
                    barrier.wait().await;
                    registry.remove_peer(&alice)
                }
            });
            let (closed_by_room, closed_by_removal) = tokio::join!(room_close, peer_removal);

            let mut reported = closed_by_room.unwrap();
            reported.extend(closed_by_removal.unwrap().into_iter().flat_map(|(_, producers)| producers));
            reported.sort();
            let mut expected = vec![audio.producer.id(), video.producer.id()];
            expected.sort();
            assert_eq!(reported, expected);

            assert_eq!(f.registry.owned_entries(&alice), 0);
            assert!(f.registry.producer_list("r1").is_empty());
            assert!(!f.registry.room_has_producers("r1"));
            assert!(consumer.consumer.closed());
            assert!(f.registry.consumers.is_empty());
            // bob keeps his peer entry and receive transport
            assert_eq!(f.registry.owned_entries(&bob), 2);

            let notice = bob_rx.recv().await.unwrap();
            assert!(matches!(notice.event, Event::ConsumerClosed { .. }));
            assert!(bob_rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn low_scores_reach_the_publisher_as_quality_changes() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        let (producer, mut rx) = publish(&f, &alice, MediaKind::Video, vp8(1)).await;
        let producer_id = producer.producer.id();
        // let the observer subscribe
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let engine_producer = f.engine.producer(&producer_id).unwrap();
        engine_producer.report_score(vec![ProducerScore {
            ssrc: 1000,
            rid: None,
            score: 3,
        }]);

        let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match notice.event {
            Event::QualityChanged {
                producer_id: changed,
                quality_index,
            } => {
                assert_eq!(changed, producer_id);
                assert_eq!(quality_index, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(producer.quality.get(), 1);
    }

    #[tokio::test]
    async fn reported_layers_lower_the_preferred_layers() {
        let f = fixture().await;
        let alice = PeerKey::new(Channel::Streaming, "alice");
        let (producer, _alice_rx) = publish(&f, &alice, MediaKind::Video, vp8(3)).await;
        let bob = PeerKey::new(Channel::Streaming, "bob");
        let (consumer, _bob_rx) = viewer(&f, &bob, &producer.producer.id()).await;

        let starting = ConsumerLayers {
            spatial_layer: 2,
            temporal_layer: 2,
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.consumer.preferred_layers() != Some(starting) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let lowered = ConsumerLayers {
            spatial_layer: 1,
            temporal_layer: 0,
        };
        f.engine
            .consumer(&consumer.consumer.id())
            .unwrap()
            .report_layers(Some(lowered));
        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.consumer.preferred_layers() != Some(lowered) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // higher layers never raise the request again
        f.engine
            .consumer(&consumer.consumer.id())
            .unwrap()
            .report_layers(Some(starting));
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(consumer.consumer.preferred_layers(), Some(lowered));
    }
}
