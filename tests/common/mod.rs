// Shared fixtures for the signaling tests

#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use live_sfu::{
    engine::LocalEngine,
    media::new_id,
    presence::MemoryPresenceStore,
    sfu::{Sfu, SfuConfig},
    signaling::{
        handler::ConnectionContext, next_connection_id, Channel, Outbound, Outbox, SignalingHandler,
    },
    transcode::{TranscodeConfig, TranscodeJob, TranscodeProcess, Transcoder},
    worker::WorkerPoolConfig,
    Result,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

/// Transcoder whose processes run until told to exit
#[derive(Default)]
pub struct FakeTranscoder {
    spawned: AtomicUsize,
    killed: Arc<AtomicUsize>,
    exits: Mutex<Vec<oneshot::Sender<i32>>>,
}

impl FakeTranscoder {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Make the most recent process exit with `code`
    pub fn crash_latest(&self, code: i32) -> bool {
        match self.exits.lock().pop() {
            Some(exit) => exit.send(code).is_ok(),
            None => false,
        }
    }
}

struct FakeProcess {
    exit: Option<oneshot::Receiver<i32>>,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl TranscodeProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        match self.exit.take() {
            Some(exit) => match exit.await {
                Ok(code) => Ok(Some(code)),
                Err(_) => futures::future::pending().await,
            },
            None => futures::future::pending().await,
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn spawn(&self, _job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.exits.lock().push(tx);
        Ok(Box::new(FakeProcess {
            exit: Some(rx),
            killed: self.killed.clone(),
        }))
    }
}

/// An SFU on the local engine with in-memory presence
pub struct Harness {
    pub engine: Arc<LocalEngine>,
    pub transcoder: Arc<FakeTranscoder>,
    pub presence: Arc<MemoryPresenceStore>,
    pub sfu: Sfu,
    output_dir: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut SfuConfig)) -> Self {
        let output_dir = std::env::temp_dir().join(format!("live-sfu-test-{}", new_id()));
        let mut config = SfuConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            workers: WorkerPoolConfig {
                num_workers: 2,
                retry_delay: Duration::from_millis(50),
                ..WorkerPoolConfig::default()
            },
            sample_interval: Duration::from_secs(3600),
            transcode: TranscodeConfig {
                output_dir: output_dir.clone(),
                stop_grace: Duration::from_millis(10),
                ..TranscodeConfig::default()
            },
            engine_timeout: Duration::from_secs(5),
            ..SfuConfig::default()
        };
        adjust(&mut config);

        let engine = Arc::new(LocalEngine::new());
        let transcoder = Arc::new(FakeTranscoder::default());
        let presence = Arc::new(MemoryPresenceStore::new());
        let sfu = Sfu::new(engine.clone(), transcoder.clone(), presence.clone(), config)
            .await
            .unwrap();
        Self {
            engine,
            transcoder,
            presence,
            sfu,
            output_dir,
        }
    }

    pub fn handler(&self) -> Arc<SignalingHandler> {
        self.sfu.handler().clone()
    }

    pub fn client(&self, channel: Channel) -> Client {
        let (tx, rx) = mpsc::channel(256);
        Client {
            ctx: Some(ConnectionContext::new(Outbox::new(next_connection_id(), channel, tx))),
            rx,
            handler: self.handler(),
            next_request: 0,
            events: Vec::new(),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.output_dir);
    }
}

/// A signaling connection driven in-process
pub struct Client {
    ctx: Option<ConnectionContext>,
    rx: mpsc::Receiver<Outbound>,
    handler: Arc<SignalingHandler>,
    next_request: u64,
    /// Unsolicited events received so far
    events: Vec<Value>,
}

pub fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "4B:9E:12:77:AA:01" }],
    })
}

pub fn rtp_parameters(kind: &str) -> Value {
    match kind {
        "audio" => json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
            "encodings": [{ "ssrc": 1111 }],
        }),
        _ => json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [
                { "rid": "r0", "scalabilityMode": "L1T3" },
                { "rid": "r1", "scalabilityMode": "L1T3" },
                { "rid": "r2", "scalabilityMode": "L1T3" },
            ],
        }),
    }
}

impl Client {
    pub fn connection_id(&self) -> u64 {
        self.context().outbox().connection_id()
    }

    fn context(&self) -> &ConnectionContext {
        self.ctx.as_ref().expect("client already disconnected")
    }

    fn collect(&mut self, request_id: &str) -> Vec<Value> {
        let mut replies = Vec::new();
        while let Ok(outbound) = self.rx.try_recv() {
            let value = serde_json::to_value(&outbound).unwrap();
            if outbound.request_id.as_deref() == Some(request_id) {
                replies.push(value);
            } else {
                self.events.push(value);
            }
        }
        replies
    }

    /// Send a raw text frame and return the replies it produced
    pub async fn send_text(&mut self, request_id: &str, text: &str) -> Vec<Value> {
        let ctx = self.ctx.as_mut().expect("client already disconnected");
        self.handler.handle_text(ctx, text).await;
        self.collect(request_id)
    }

    /// Send a request and return every direct reply
    pub async fn send(&mut self, mut request: Value) -> Vec<Value> {
        self.next_request += 1;
        let request_id = self.next_request.to_string();
        request["requestId"] = json!(request_id);
        self.send_text(&request_id, &request.to_string()).await
    }

    /// Send a request expecting exactly one reply
    pub async fn request(&mut self, request: Value) -> Value {
        let mut replies = self.send(request).await;
        assert_eq!(replies.len(), 1, "expected one reply, got {:?}", replies);
        replies.remove(0)
    }

    /// Unsolicited events received so far, oldest first
    pub fn take_events(&mut self) -> Vec<Value> {
        self.collect("");
        std::mem::take(&mut self.events)
    }

    /// Wait for an unsolicited event of type `kind`
    pub async fn wait_event(&mut self, kind: &str) -> Value {
        if let Some(position) = self.events.iter().position(|event| event["type"] == kind) {
            return self.events.remove(position);
        }
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                let outbound = self.rx.recv().await.expect("outbox closed");
                let value = serde_json::to_value(&outbound).unwrap();
                if value["type"] == kind {
                    return value;
                }
                self.events.push(value);
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} event within {:?}", kind, deadline))
    }

    pub async fn join(&mut self, room_id: &str) -> Value {
        let reply = self
            .request(json!({ "type": "getRouterRtpCapabilities", "roomId": room_id }))
            .await;
        assert_eq!(reply["type"], "routerRtpCapabilities", "{}", reply);
        reply["rtpCapabilities"].clone()
    }

    /// Create and connect a transport; returns its id
    pub async fn transport(&mut self, room_id: &str, client_id: &str, direction: &str) -> String {
        let created = self
            .request(json!({
                "type": "createTransport",
                "roomId": room_id,
                "clientId": client_id,
                "direction": direction,
            }))
            .await;
        assert_eq!(created["type"], "transportIsCreated", "{}", created);
        let transport_id = created["transportOptions"]["id"].as_str().unwrap().to_string();

        let replies = self
            .send(json!({
                "type": "connectTransport",
                "roomId": room_id,
                "clientId": client_id,
                "transportId": transport_id,
                "dtlsParameters": dtls(),
            }))
            .await;
        assert_eq!(replies.len(), 2, "{:?}", replies);
        assert_eq!(replies[0]["type"], "transportConnected");
        assert_eq!(replies[1]["type"], "producers");
        transport_id
    }

    /// Publish a track; returns the `producerCreated` reply
    pub async fn produce(&mut self, room_id: &str, client_id: &str, transport_id: &str, kind: &str) -> Value {
        let reply = self
            .request(json!({
                "type": "produce",
                "roomId": room_id,
                "clientId": client_id,
                "transportId": transport_id,
                "kind": kind,
                "rtpParameters": rtp_parameters(kind),
            }))
            .await;
        assert_eq!(reply["type"], "producerCreated", "{}", reply);
        reply
    }

    pub async fn producers(&mut self, room_id: &str) -> Vec<Value> {
        let reply = self.request(json!({ "type": "getProducers", "roomId": room_id })).await;
        reply["producers"].as_array().cloned().unwrap_or_default()
    }

    pub async fn disconnect(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.handler.disconnect(ctx).await;
        }
    }
}
