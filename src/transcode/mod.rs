// Transcoding bridge module for the SFU
//
// This module taps a room's media into an external transcoder producing HLS.
// The first producer of a room opens a plain RTP transport towards two local
// UDP ports, describes the stream in an SDP file and starts exactly one
// transcoder reading from it. Later producers only add consumers on the same
// transport.

pub mod ffmpeg;

use std::{
    collections::HashMap,
    fmt::Write as _,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    net::UdpSocket,
    sync::{oneshot, Mutex},
};

use crate::{
    engine::{bounded, Consumer, ListenIp, PlainTransport, PlainTransportOptions, Router},
    media::{new_id, MediaKind, ProducerId, RoomId, RtpCodecParameters},
    Result, SfuError,
};

pub use ffmpeg::FfmpegTranscoder;

/// Transcoding bridge configuration
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Directory holding one sub-directory per room
    pub output_dir: PathBuf,
    /// Public base URL of `output_dir`
    pub hls_base_url: String,
    /// Address the media is sent to
    pub bind_ip: IpAddr,
    /// Wait after killing a transcoder before its ports are reused
    pub stop_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./hls_output"),
            hls_base_url: "http://127.0.0.1:8080/hls".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            stop_grace: Duration::from_secs(1),
        }
    }
}

impl TranscodeConfig {
    /// Playlist URL of a room
    pub fn playlist_url(&self, room_id: &str) -> String {
        format!("{}/{}/stream.m3u8", self.hls_base_url.trim_end_matches('/'), room_id)
    }
}

/// What a transcoder is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub room_id: RoomId,
    /// Room output directory
    pub output_dir: PathBuf,
    /// Stream description to read
    pub sdp_path: PathBuf,
    /// Playlist to write
    pub playlist_path: PathBuf,
    /// RTP port
    pub media_port: u16,
    /// RTCP port
    pub control_port: u16,
}

impl TranscodeJob {
    pub fn new(room_id: &str, base_dir: &Path, media_port: u16, control_port: u16) -> Self {
        let output_dir = base_dir.join(room_id);
        Self {
            room_id: room_id.to_string(),
            sdp_path: output_dir.join("stream.sdp"),
            playlist_path: output_dir.join("stream.m3u8"),
            output_dir,
            media_port,
            control_port,
        }
    }
}

/// Starts transcoder processes
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>>;
}

/// A running transcoder
#[async_trait]
pub trait TranscodeProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit; returns its exit code
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Kill the process forcefully
    async fn kill(&mut self) -> Result<()>;
}

/// SDP describing one RTP stream sent to `ip:media_port`
pub fn session_description(
    ip: IpAddr,
    media_port: u16,
    control_port: u16,
    kind: MediaKind,
    codec: &RtpCodecParameters,
) -> String {
    let family = if ip.is_ipv4() { "IP4" } else { "IP6" };
    let name = codec
        .mime_type
        .split_once('/')
        .map(|(_, name)| name)
        .unwrap_or(&codec.mime_type);

    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN {} {}", family, ip);
    let _ = writeln!(sdp, "s=live-sfu");
    let _ = writeln!(sdp, "c=IN {} {}", family, ip);
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "m={} {} RTP/AVP {}", kind, media_port, codec.payload_type);
    let _ = writeln!(sdp, "a=rtcp:{}", control_port);
    match codec.channels {
        Some(channels) if kind == MediaKind::Audio => {
            let _ = writeln!(sdp, "a=rtpmap:{} {}/{}/{}", codec.payload_type, name, codec.clock_rate, channels);
        }
        _ => {
            let _ = writeln!(sdp, "a=rtpmap:{} {}/{}", codec.payload_type, name, codec.clock_rate);
        }
    }
    if !codec.parameters.is_empty() {
        let fmtp: Vec<String> = codec
            .parameters
            .iter()
            .map(|(key, value)| match value.as_str() {
                Some(text) => format!("{}={}", key, text),
                None => format!("{}={}", key, value),
            })
            .collect();
        let _ = writeln!(sdp, "a=fmtp:{} {}", codec.payload_type, fmtp.join(";"));
    }
    let _ = writeln!(sdp, "a=recvonly");
    sdp
}

/// Two local UDP ports held open until the transcoder is about to bind them
struct PortReservation {
    media: UdpSocket,
    control: UdpSocket,
}

impl PortReservation {
    async fn bind(ip: IpAddr) -> Result<Self> {
        Ok(Self {
            media: UdpSocket::bind((ip, 0)).await?,
            control: UdpSocket::bind((ip, 0)).await?,
        })
    }

    fn ports(&self) -> Result<(u16, u16)> {
        Ok((self.media.local_addr()?.port(), self.control.local_addr()?.port()))
    }
}

struct TranscodeSession {
    generation: String,
    plain: Arc<dyn PlainTransport>,
    consumers: HashMap<ProducerId, Arc<dyn Consumer>>,
    playlist_url: String,
    media_port: u16,
    control_port: u16,
    stop: Option<oneshot::Sender<()>>,
    stopped: Option<oneshot::Receiver<()>>,
}

impl TranscodeSession {
    fn release(&mut self) {
        for (_, consumer) in self.consumers.drain() {
            consumer.close();
        }
        self.plain.close();
    }
}

type SessionCell = Arc<Mutex<Option<TranscodeSession>>>;

/// Room-scoped bridge to the transcoder
pub struct TranscodeBridge {
    transcoder: Arc<dyn Transcoder>,
    config: TranscodeConfig,
    engine_timeout: Duration,
    sessions: DashMap<RoomId, SessionCell>,
    me: Weak<TranscodeBridge>,
}

impl TranscodeBridge {
    pub fn new(transcoder: Arc<dyn Transcoder>, config: TranscodeConfig, engine_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            transcoder,
            config,
            engine_timeout,
            sessions: DashMap::new(),
            me: me.clone(),
        })
    }

    /// Playlist URL of a room
    pub fn playlist_url(&self, room_id: &str) -> String {
        self.config.playlist_url(room_id)
    }

    fn cell(&self, room_id: &str) -> SessionCell {
        self.sessions
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Feed `producer_id` into the room's transcoder, starting it if needed.
    ///
    /// Returns the room's playlist URL.
    pub async fn attach(&self, room_id: &str, router: &Arc<dyn Router>, producer_id: &str) -> Result<String> {
        let cell = self.cell(room_id);
        let mut guard = cell.lock().await;

        if let Some(session) = guard.as_mut() {
            if !session.consumers.contains_key(producer_id) {
                let consumer = bounded(
                    self.engine_timeout,
                    "bridge consume",
                    session.plain.consume(producer_id, &router.rtp_capabilities(), false),
                )
                .await?;
                session.consumers.insert(producer_id.to_string(), consumer);
                tracing::debug!(room_id = %room_id, producer_id = %producer_id, "Producer added to transcode session");
            }
            return Ok(session.playlist_url.clone());
        }

        match self.start_session(room_id, router, producer_id).await {
            Ok(session) => {
                let url = session.playlist_url.clone();
                *guard = Some(session);
                Ok(url)
            }
            Err(err) => {
                drop(guard);
                self.forget(room_id, &cell);
                Err(err)
            }
        }
    }

    /// Drop the room's cell if it is empty and nobody else holds it
    fn forget(&self, room_id: &str, cell: &SessionCell) {
        // One reference in the map and the caller's own.
        let removed = self.sessions.remove_if(room_id, |_, current| {
            Arc::ptr_eq(current, cell)
                && Arc::strong_count(current) == 2
                && current.try_lock().map(|session| session.is_none()).unwrap_or(false)
        });
        if removed.is_some() {
            tracing::trace!(room_id = %room_id, "Transcode cell released");
        }
    }

    /// Number of rooms holding a session cell
    pub fn tracked_rooms(&self) -> usize {
        self.sessions.len()
    }

    async fn start_session(
        &self,
        room_id: &str,
        router: &Arc<dyn Router>,
        producer_id: &str,
    ) -> Result<TranscodeSession> {
        let plain = bounded(
            self.engine_timeout,
            "plain transport creation",
            router.create_plain_transport(PlainTransportOptions {
                listen_ip: ListenIp {
                    ip: self.config.bind_ip,
                    announced_ip: None,
                },
                rtcp_mux: false,
                comedia: false,
            }),
        )
        .await?;

        match self.launch(room_id, router, &plain, producer_id).await {
            Ok(session) => Ok(session),
            Err(err) => {
                plain.close();
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        room_id: &str,
        router: &Arc<dyn Router>,
        plain: &Arc<dyn PlainTransport>,
        producer_id: &str,
    ) -> Result<TranscodeSession> {
        let reservation = PortReservation::bind(self.config.bind_ip).await?;
        let (media_port, control_port) = reservation.ports()?;
        bounded(
            self.engine_timeout,
            "plain transport connect",
            plain.connect(self.config.bind_ip, media_port, Some(control_port)),
        )
        .await?;

        let consumer = bounded(
            self.engine_timeout,
            "bridge consume",
            plain.consume(producer_id, &router.rtp_capabilities(), false),
        )
        .await?;
        let parameters = consumer.rtp_parameters();
        let Some(codec) = parameters.media_codec() else {
            consumer.close();
            return Err(SfuError::InvalidParameters(format!("producer {} has no media codec", producer_id)));
        };

        let job = TranscodeJob::new(room_id, &self.config.output_dir, media_port, control_port);
        let sdp = session_description(self.config.bind_ip, media_port, control_port, consumer.kind(), codec);
        tokio::fs::create_dir_all(&job.output_dir).await?;
        tokio::fs::write(&job.sdp_path, sdp).await?;

        drop(reservation);
        let process = match self.transcoder.spawn(&job).await {
            Ok(process) => process,
            Err(err) => {
                consumer.close();
                return Err(match err {
                    SfuError::ExternalProcess(_) => err,
                    other => SfuError::ExternalProcess(other.to_string()),
                });
            }
        };

        let generation = new_id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        self.supervise(room_id.to_string(), generation.clone(), process, stop_rx, stopped_tx);

        let mut consumers = HashMap::new();
        consumers.insert(producer_id.to_string(), consumer);
        tracing::info!(
            room_id = %room_id,
            media_port,
            control_port,
            generation = %generation,
            "Transcode session started"
        );
        Ok(TranscodeSession {
            generation,
            plain: plain.clone(),
            consumers,
            playlist_url: self.config.playlist_url(room_id),
            media_port,
            control_port,
            stop: Some(stop_tx),
            stopped: Some(stopped_rx),
        })
    }

    fn supervise(
        &self,
        room_id: RoomId,
        generation: String,
        mut process: Box<dyn TranscodeProcess>,
        stop: oneshot::Receiver<()>,
        stopped: oneshot::Sender<()>,
    ) {
        let bridge = self.me.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = process.wait() => Some(status),
                _ = stop => None,
            };

            match exited {
                None => {
                    if let Err(err) = process.kill().await {
                        tracing::warn!(room_id = %room_id, "Failed to kill transcoder: {}", err);
                    }
                    let _ = stopped.send(());
                }
                Some(status) => {
                    drop(stopped);
                    let err = match status {
                        Ok(code) => SfuError::ExternalProcess(format!("transcoder exited with code {:?}", code)),
                        Err(err) => SfuError::ExternalProcess(err.to_string()),
                    };
                    tracing::error!(room_id = %room_id, pid = ?process.pid(), "{}", err);
                    if let Some(bridge) = bridge.upgrade() {
                        bridge.clear_if_current(&room_id, &generation).await;
                    }
                }
            }
        });
    }

    async fn clear_if_current(&self, room_id: &str, generation: &str) {
        let Some(cell) = self.sessions.get(room_id).map(|cell| cell.clone()) else {
            return;
        };
        let mut guard = cell.lock().await;
        let current = guard
            .as_ref()
            .map(|session| session.generation == generation)
            .unwrap_or(false);
        if current {
            if let Some(mut session) = guard.take() {
                session.release();
                tracing::info!(room_id = %room_id, "Transcode session cleared after exit");
            }
        }
        drop(guard);
        self.forget(room_id, &cell);
    }

    /// Drop the bridge consumers of closed producers
    pub async fn detach_producers(&self, room_id: &str, producer_ids: &[ProducerId]) {
        let Some(cell) = self.sessions.get(room_id).map(|cell| cell.clone()) else {
            return;
        };
        let mut guard = cell.lock().await;
        if let Some(session) = guard.as_mut() {
            for producer_id in producer_ids {
                if let Some(consumer) = session.consumers.remove(producer_id) {
                    consumer.close();
                }
            }
        }
    }

    /// Kill the room's transcoder and release its transport.
    ///
    /// Returns whether a session was running.
    pub async fn stop(&self, room_id: &str) -> bool {
        self.stop_unless(room_id, || false).await
    }

    /// Stop the room's session unless `in_use` reports live producers.
    ///
    /// `in_use` runs under the room's session lock, so a producer attaching
    /// concurrently either keeps the session alive or starts a new one after
    /// this stop.
    pub async fn stop_if_idle<F>(&self, room_id: &str, in_use: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        self.stop_unless(room_id, in_use).await
    }

    async fn stop_unless<F>(&self, room_id: &str, keep: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let Some(cell) = self.sessions.get(room_id).map(|cell| cell.clone()) else {
            return false;
        };
        let mut guard = cell.lock().await;
        if keep() {
            return false;
        }
        let stopped = match guard.take() {
            Some(session) => {
                self.shut_down(room_id, session).await;
                true
            }
            None => false,
        };
        drop(guard);
        self.forget(room_id, &cell);
        stopped
    }

    async fn shut_down(&self, room_id: &str, mut session: TranscodeSession) {
        if let Some(stop) = session.stop.take() {
            let _ = stop.send(());
        }
        if let Some(stopped) = session.stopped.take() {
            let _ = stopped.await;
        }
        tokio::time::sleep(self.config.stop_grace).await;
        session.release();

        tracing::info!(
            room_id = %room_id,
            media_port = session.media_port,
            control_port = session.control_port,
            "Transcode session stopped"
        );
    }

    /// Whether the room has a running session
    pub async fn is_active(&self, room_id: &str) -> bool {
        let Some(cell) = self.sessions.get(room_id).map(|cell| cell.clone()) else {
            return false;
        };
        let active = cell.lock().await.is_some();
        active
    }

    /// Producers currently fed into the room's transcoder
    pub async fn bridged_producers(&self, room_id: &str) -> Vec<ProducerId> {
        let Some(cell) = self.sessions.get(room_id).map(|cell| cell.clone()) else {
            return Vec::new();
        };
        let guard = cell.lock().await;
        let mut ids: Vec<ProducerId> = guard
            .as_ref()
            .map(|session| session.consumers.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Stop every running session
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for room_id in rooms {
            self.stop(&room_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        engine::{LocalEngine, MediaEngine, PortRange, WebRtcTransportOptions, WorkerSettings},
        media::{codec::media_codecs, RtpParameters},
    };

    #[derive(Default)]
    struct CountingTranscoder {
        spawned: AtomicUsize,
        killed: Arc<AtomicUsize>,
    }

    struct IdleProcess {
        killed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TranscodeProcess for IdleProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<Option<i32>> {
            futures::future::pending().await
        }

        async fn kill(&mut self) -> Result<()> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Transcoder for CountingTranscoder {
        async fn spawn(&self, _job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleProcess {
                killed: self.killed.clone(),
            }))
        }
    }

    /// Binds the job's ports the way the real transcoder does
    #[derive(Default)]
    struct BindingTranscoder {
        bound: AtomicUsize,
    }

    #[async_trait]
    impl Transcoder for BindingTranscoder {
        async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>> {
            let _media = UdpSocket::bind((Ipv4Addr::LOCALHOST, job.media_port)).await?;
            let _control = UdpSocket::bind((Ipv4Addr::LOCALHOST, job.control_port)).await?;
            self.bound.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleProcess {
                killed: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    struct ExitingTranscoder;

    struct ExitedProcess;

    #[async_trait]
    impl TranscodeProcess for ExitedProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> Result<Option<i32>> {
            Ok(Some(1))
        }

        async fn kill(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transcoder for ExitingTranscoder {
        async fn spawn(&self, _job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>> {
            Ok(Box::new(ExitedProcess))
        }
    }

    fn config() -> TranscodeConfig {
        TranscodeConfig {
            output_dir: std::env::temp_dir().join(format!("live-sfu-{}", new_id())),
            stop_grace: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn room_with_producers() -> (Arc<dyn Router>, Vec<ProducerId>) {
        let engine = LocalEngine::new();
        let worker = engine
            .create_worker(WorkerSettings {
                log_level: "warn".to_string(),
                port_range: PortRange { min: 31000, max: 31050 },
            })
            .await
            .unwrap();
        let router = worker.create_router(&media_codecs()).await.unwrap();
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions {
                listen_ips: vec![ListenIp {
                    ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    announced_ip: None,
                }],
                enable_udp: true,
                enable_tcp: false,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
            })
            .await
            .unwrap();

        let video: RtpParameters = serde_json::from_value(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 1 }],
        }))
        .unwrap();
        let audio: RtpParameters = serde_json::from_value(json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
            "encodings": [{ "ssrc": 2 }],
        }))
        .unwrap();
        let v = transport.produce(MediaKind::Video, video).await.unwrap();
        let a = transport.produce(MediaKind::Audio, audio).await.unwrap();
        (router, vec![v.id(), a.id()])
    }

    #[test]
    fn sdp_describes_the_stream() {
        let codec = RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: [("useinbandfec".to_string(), json!(1))].into_iter().collect(),
            rtcp_feedback: Vec::new(),
        };
        let sdp = session_description(IpAddr::V4(Ipv4Addr::LOCALHOST), 5004, 5005, MediaKind::Audio, &codec);
        assert!(sdp.contains("c=IN IP4 127.0.0.1\n"));
        assert!(sdp.contains("m=audio 5004 RTP/AVP 100\n"));
        assert!(sdp.contains("a=rtcp:5005\n"));
        assert!(sdp.contains("a=rtpmap:100 opus/48000/2\n"));
        assert!(sdp.contains("a=fmtp:100 useinbandfec=1\n"));
    }

    #[tokio::test]
    async fn reserved_ports_stay_busy_until_released() {
        let reservation = PortReservation::bind(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        let (media_port, control_port) = reservation.ports().unwrap();
        assert_ne!(media_port, control_port);
        assert!(UdpSocket::bind((Ipv4Addr::LOCALHOST, media_port)).await.is_err());
        assert!(UdpSocket::bind((Ipv4Addr::LOCALHOST, control_port)).await.is_err());

        drop(reservation);
        UdpSocket::bind((Ipv4Addr::LOCALHOST, media_port)).await.unwrap();
        UdpSocket::bind((Ipv4Addr::LOCALHOST, control_port)).await.unwrap();
    }

    #[tokio::test]
    async fn transcoder_can_bind_the_reserved_ports() {
        let (router, producers) = room_with_producers().await;
        let transcoder = Arc::new(BindingTranscoder::default());
        let config = config();
        let bridge = TranscodeBridge::new(transcoder.clone(), config.clone(), Duration::from_secs(5));

        bridge.attach("r1", &router, &producers[0]).await.unwrap();
        assert_eq!(transcoder.bound.load(Ordering::SeqCst), 1);

        assert!(bridge.stop("r1").await);
        let _ = std::fs::remove_dir_all(&config.output_dir);
    }

    #[tokio::test]
    async fn one_transcoder_per_room() {
        let (router, producers) = room_with_producers().await;
        let transcoder = Arc::new(CountingTranscoder::default());
        let config = config();
        let bridge = TranscodeBridge::new(transcoder.clone(), config.clone(), Duration::from_secs(5));

        let url = bridge.attach("r1", &router, &producers[0]).await.unwrap();
        assert_eq!(url, "http://127.0.0.1:8080/hls/r1/stream.m3u8");
        bridge.attach("r1", &router, &producers[1]).await.unwrap();
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.bridged_producers("r1").await.len(), 2);
        assert!(config.output_dir.join("r1").join("stream.sdp").exists());

        assert!(bridge.stop("r1").await);
        assert!(!bridge.stop("r1").await);
        assert_eq!(transcoder.killed.load(Ordering::SeqCst), 1);

        bridge.attach("r1", &router, &producers[0]).await.unwrap();
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 2);

        let _ = std::fs::remove_dir_all(&config.output_dir);
    }

    #[tokio::test]
    async fn idle_check_runs_under_the_session_lock() {
        let (router, producers) = room_with_producers().await;
        let transcoder = Arc::new(CountingTranscoder::default());
        let config = config();
        let bridge = TranscodeBridge::new(transcoder.clone(), config.clone(), Duration::from_secs(5));
        bridge.attach("r1", &router, &producers[0]).await.unwrap();

        // A producer registered since the caller last looked keeps the session.
        let kept = bridge
            .stop_if_idle("r1", || {
                let locked = bridge
                    .sessions
                    .get("r1")
                    .map(|cell| cell.try_lock().is_err())
                    .unwrap_or(false);
                assert!(locked);
                true
            })
            .await;
        assert!(!kept);
        assert!(bridge.is_active("r1").await);
        assert_eq!(transcoder.killed.load(Ordering::SeqCst), 0);

        assert!(bridge.stop_if_idle("r1", || false).await);
        assert!(!bridge.is_active("r1").await);
        assert_eq!(transcoder.killed.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(&config.output_dir);
    }

    #[tokio::test]
    async fn session_cells_are_released() {
        let (router, producers) = room_with_producers().await;
        let config = config();
        let bridge = TranscodeBridge::new(Arc::new(CountingTranscoder::default()), config.clone(), Duration::from_secs(5));

        bridge.attach("r1", &router, &producers[0]).await.unwrap();
        bridge.attach("r2", &router, &producers[1]).await.unwrap();
        assert_eq!(bridge.tracked_rooms(), 2);
        bridge.stop("r1").await;
        assert_eq!(bridge.tracked_rooms(), 1);
        bridge.shutdown().await;
        assert_eq!(bridge.tracked_rooms(), 0);

        // Stopping a room that never bridged leaves nothing behind either.
        assert!(!bridge.stop("never").await);
        assert_eq!(bridge.tracked_rooms(), 0);

        let _ = std::fs::remove_dir_all(&config.output_dir);
    }

    #[tokio::test]
    async fn exited_session_releases_its_cell() {
        let (router, producers) = room_with_producers().await;
        let config = config();
        let bridge = TranscodeBridge::new(Arc::new(ExitingTranscoder), config.clone(), Duration::from_secs(5));

        bridge.attach("r1", &router, &producers[0]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while bridge.tracked_rooms() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!bridge.is_active("r1").await);

        let _ = std::fs::remove_dir_all(&config.output_dir);
    }
}
