// Implementation of the SFU core components
//
// This file wires the worker pool, the registries, the transcoding bridge and
// the signaling server together and owns their background tasks.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    bandwidth::BitratePolicy,
    engine::{CloseTrigger, MediaEngine},
    presence::{PresenceCounter, PresenceStore},
    room::RoomRegistry,
    session::{RegistrySettings, ResourceRegistry},
    signaling::{hub::MAX_ROOM_CAPACITY, RoomHub, SignalingHandler, SignalingServer},
    transcode::{TranscodeBridge, TranscodeConfig, Transcoder},
    transport::{adaptation::DEFAULT_SAMPLE_INTERVAL, TransportSettings},
    worker::{WorkerPool, WorkerPoolConfig},
};

/// SFU configuration
#[derive(Debug, Clone)]
pub struct SfuConfig {
    /// Address of the signaling listener
    pub bind_addr: SocketAddr,
    /// Media worker pool
    pub workers: WorkerPoolConfig,
    /// ICE and DTLS settings of client transports
    pub transport: TransportSettings,
    /// Outgoing bitrate adaptation
    pub bitrate_policy: BitratePolicy,
    /// Sampling interval of the adaptation loop
    pub sample_interval: Duration,
    /// HLS transcoding bridge
    pub transcode: TranscodeConfig,
    /// Deadline of every engine request
    pub engine_timeout: Duration,
    /// Maximum signaling connections per room
    pub max_room_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            workers: WorkerPoolConfig::default(),
            transport: TransportSettings::default(),
            bitrate_policy: BitratePolicy::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            transcode: TranscodeConfig::default(),
            engine_timeout: Duration::from_secs(10),
            max_room_capacity: MAX_ROOM_CAPACITY,
        }
    }
}

/// SFU implementation
pub struct Sfu {
    config: SfuConfig,
    pool: Arc<WorkerPool>,
    handler: Arc<SignalingHandler>,
    shutdown: CloseTrigger,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sfu {
    /// Start the worker pool and build the registries on top of it
    pub async fn new(
        engine: Arc<dyn MediaEngine>,
        transcoder: Arc<dyn Transcoder>,
        presence_store: Arc<dyn PresenceStore>,
        config: SfuConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::start(engine, config.workers.clone())
            .await
            .context("failed to start the media worker pool")?;

        let rooms = Arc::new(RoomRegistry::new(pool.clone(), config.engine_timeout));
        let registry = ResourceRegistry::new(RegistrySettings {
            engine_timeout: config.engine_timeout,
            bitrate_policy: config.bitrate_policy,
            sample_interval: config.sample_interval,
        });
        let bridge = TranscodeBridge::new(transcoder, config.transcode.clone(), config.engine_timeout);
        let handler = Arc::new(SignalingHandler::new(
            rooms,
            registry,
            Arc::new(RoomHub::new(config.max_room_capacity)),
            PresenceCounter::new(presence_store),
            bridge,
            config.transport.clone(),
        ));

        let sfu = Self {
            config,
            pool,
            handler,
            shutdown: CloseTrigger::new(),
            tasks: Mutex::new(Vec::new()),
        };
        sfu.watch_worker_deaths();
        tracing::info!(workers = sfu.pool.len(), "SFU initialized");
        Ok(sfu)
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn handler(&self) -> &Arc<SignalingHandler> {
        &self.handler
    }

    /// Close the rooms of every worker that dies
    fn watch_worker_deaths(&self) {
        let mut deaths = self.pool.subscribe_deaths();
        let handler = self.handler.clone();
        let shutdown = self.shutdown.signal();

        let task = tokio::spawn(async move {
            let stopped = shutdown.closed();
            tokio::pin!(stopped);
            loop {
                let worker_id = tokio::select! {
                    _ = &mut stopped => return,
                    death = deaths.recv() => match death {
                        Ok(worker_id) => worker_id,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Missed worker death notifications");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };

                let rooms = handler.rooms().evict_worker(&worker_id);
                tracing::warn!(worker_id = %worker_id, rooms = rooms.len(), "Evicting rooms of dead worker");
                for room_id in rooms {
                    handler.close_room(&room_id, "media worker died").await;
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Bind the signaling server and start accepting connections
    pub async fn start(&self) -> Result<SocketAddr> {
        let server = SignalingServer::bind(self.config.bind_addr, self.handler.clone())
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_addr))?;
        let addr = server.local_addr()?;

        let shutdown = self.shutdown.signal();
        let task = tokio::spawn(async move {
            if let Err(err) = server.run(shutdown).await {
                tracing::error!("Signaling server failed: {}", err);
            }
        });
        self.tasks.lock().push(task);
        tracing::info!(addr = %addr, "SFU started");
        Ok(addr)
    }

    /// Stop accepting connections, terminate transcoders and close workers
    pub async fn shutdown(&self) {
        if !self.shutdown.fire() {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.handler.bridge().shutdown().await;
        self.pool.shutdown();
        tracing::info!("SFU stopped");
    }
}
