// Room registry module for the SFU
//
// This module maps room ids to their router. A router is created lazily on the
// first reference to a room, on a worker picked by the pool, and is reused for
// the room's whole lifetime.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::{
    engine::{bounded, Router},
    media::{codec::media_codecs, RoomId, RtpCodecCapability},
    worker::WorkerPool,
    Result,
};

type RouterCell = Arc<OnceCell<Arc<dyn Router>>>;

/// Room id → router
pub struct RoomRegistry {
    pool: Arc<WorkerPool>,
    rooms: DashMap<RoomId, RouterCell>,
    media_codecs: Vec<RtpCodecCapability>,
    engine_timeout: Duration,
}

impl RoomRegistry {
    /// Create a registry allocating routers from `pool`
    pub fn new(pool: Arc<WorkerPool>, engine_timeout: Duration) -> Self {
        Self {
            pool,
            rooms: DashMap::new(),
            media_codecs: media_codecs(),
            engine_timeout,
        }
    }

    /// Router of `room_id`, creating it on first use.
    ///
    /// Concurrent callers for a new room share a single creation. A failed
    /// creation leaves no entry behind, so the next call tries again.
    pub async fn get_or_create_router(&self, room_id: &str) -> Result<Arc<dyn Router>> {
        loop {
            let cell = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let created = cell
                .get_or_try_init(|| async {
                    let worker = self.pool.acquire_worker()?;
                    let router = bounded(
                        self.engine_timeout,
                        "router creation",
                        worker.create_router(&self.media_codecs),
                    )
                    .await?;
                    tracing::info!(
                        room_id = %room_id,
                        router_id = %router.id(),
                        worker_id = %router.worker_id(),
                        "Router created"
                    );
                    Ok::<_, crate::SfuError>(router)
                })
                .await;

            match created {
                Ok(router) if !router.closed() => return Ok(router.clone()),
                Ok(_) => {
                    // The router died with its worker before the room was evicted.
                    self.rooms.remove_if(room_id, |_, current| Arc::ptr_eq(current, &cell));
                }
                Err(err) => {
                    self.rooms.remove_if(room_id, |_, current| {
                        Arc::ptr_eq(current, &cell) && current.get().is_none()
                    });
                    tracing::warn!(room_id = %room_id, "Router creation failed: {}", err);
                    return Err(err);
                }
            }
        }
    }

    /// Router of `room_id` if it exists
    pub fn get_router(&self, room_id: &str) -> Option<Arc<dyn Router>> {
        self.rooms
            .get(room_id)
            .and_then(|cell| cell.get().cloned())
            .filter(|router| !router.closed())
    }

    /// Close the router of `room_id` and forget the room
    pub fn evict(&self, room_id: &str) -> bool {
        match self.rooms.remove(room_id) {
            Some((_, cell)) => {
                if let Some(router) = cell.get() {
                    router.close();
                    tracing::info!(room_id = %room_id, router_id = %router.id(), "Room evicted");
                }
                true
            }
            None => false,
        }
    }

    /// Evict every room hosted on `worker_id`
    pub fn evict_worker(&self, worker_id: &str) -> Vec<RoomId> {
        let on_worker = |cell: &RouterCell| {
            cell.get()
                .map(|router| router.worker_id() == worker_id)
                .unwrap_or(false)
        };
        let candidates: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| on_worker(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for room_id in candidates {
            if let Some((_, cell)) = self.rooms.remove_if(&room_id, |_, cell| on_worker(cell)) {
                if let Some(router) = cell.get() {
                    router.close();
                }
                evicted.push(room_id);
            }
        }
        if !evicted.is_empty() {
            tracing::warn!(worker_id = %worker_id, rooms = ?evicted, "Evicted rooms of dead worker");
        }
        evicted
    }

    /// Ids of every known room
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }
}
