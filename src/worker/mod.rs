// Worker pool module for the SFU
//
// This module owns the fixed set of media workers. Each worker slot is bound
// to its own port range, rooms are spread over the slots round-robin, and a
// worker that dies is replaced in place on the same range.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{
    engine::{MediaEngine, PortRange, Worker, WorkerSettings},
    media::WorkerId,
    Result, SfuError,
};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers (one per CPU core by default)
    pub num_workers: usize,
    /// First port of the first worker's range
    pub rtc_min_port: u16,
    /// Size of every worker's port range
    pub ports_per_worker: u16,
    /// Engine log level
    pub log_level: String,
    /// Delay between attempts to replace a dead worker
    pub retry_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            rtc_min_port: 10000,
            ports_per_worker: 100,
            log_level: "warn".to_string(),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Port range of slot `index`
    pub fn port_range(&self, index: usize) -> Result<PortRange> {
        let min = self.rtc_min_port as usize + index * self.ports_per_worker as usize;
        let max = min + self.ports_per_worker as usize - 1;
        if self.ports_per_worker == 0 || max > u16::MAX as usize {
            return Err(SfuError::InvalidParameters(format!(
                "port range of worker {} does not fit ({}-{})",
                index, min, max
            )));
        }
        Ok(PortRange {
            min: min as u16,
            max: max as u16,
        })
    }

    fn settings(&self, index: usize) -> Result<WorkerSettings> {
        Ok(WorkerSettings {
            log_level: self.log_level.clone(),
            port_range: self.port_range(index)?,
        })
    }
}

/// Fixed set of media workers
pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    config: WorkerPoolConfig,
    slots: Vec<RwLock<Arc<dyn Worker>>>,
    next: AtomicUsize,
    deaths: broadcast::Sender<WorkerId>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Spawn every worker and start watching them
    pub async fn start(engine: Arc<dyn MediaEngine>, config: WorkerPoolConfig) -> Result<Arc<Self>> {
        if config.num_workers == 0 {
            return Err(SfuError::InvalidParameters("worker pool needs at least one worker".to_string()));
        }

        let mut slots = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            let worker = engine.create_worker(config.settings(index)?).await?;
            tracing::info!(
                worker_id = %worker.id(),
                pid = ?worker.pid(),
                min_port = worker.port_range().min,
                max_port = worker.port_range().max,
                "Worker started"
            );
            slots.push(RwLock::new(worker));
        }

        let (deaths, _) = broadcast::channel(64);
        let pool = Arc::new(Self {
            engine,
            config,
            slots,
            next: AtomicUsize::new(0),
            deaths,
            shutting_down: AtomicBool::new(false),
        });

        for index in 0..pool.slots.len() {
            let worker = pool.slots[index].read().clone();
            Self::watch_slot(Arc::downgrade(&pool), index, worker);
        }
        Ok(pool)
    }

    /// Next live worker, round-robin
    pub fn acquire_worker(&self) -> Result<Arc<dyn Worker>> {
        let len = self.slots.len();
        for _ in 0..len {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
            let worker = self.slots[index].read().clone();
            if !worker.closed() {
                return Ok(worker);
            }
        }
        Err(SfuError::Engine("no live worker available".to_string()))
    }

    /// Current worker of every slot
    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        self.slots.iter().map(|slot| slot.read().clone()).collect()
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slot
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ids of workers that died
    pub fn subscribe_deaths(&self) -> broadcast::Receiver<WorkerId> {
        self.deaths.subscribe()
    }

    /// Close every worker and stop replacing them
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in &self.slots {
            slot.read().close();
        }
        tracing::info!("Worker pool shut down");
    }

    fn watch_slot(pool: Weak<Self>, index: usize, worker: Arc<dyn Worker>) {
        let signal = worker.close_signal();
        let worker_id = worker.id();
        drop(worker);

        tokio::spawn(async move {
            signal.closed().await;
            let Some(this) = pool.upgrade() else {
                return;
            };
            if this.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            tracing::error!(worker_id = %worker_id, slot = index, "Worker died");
            let _ = this.deaths.send(worker_id);
            let (engine, retry_delay) = (this.engine.clone(), this.config.retry_delay);
            drop(this);

            Self::on_worker_died(pool, engine, index, retry_delay).await;
        });
    }

    async fn on_worker_died(
        pool: Weak<Self>,
        engine: Arc<dyn MediaEngine>,
        index: usize,
        retry_delay: Duration,
    ) {
        loop {
            let settings = match pool.upgrade() {
                Some(this) if !this.shutting_down.load(Ordering::SeqCst) => {
                    match this.config.settings(index) {
                        Ok(settings) => settings,
                        Err(err) => {
                            tracing::error!(slot = index, "Cannot replace worker: {}", err);
                            return;
                        }
                    }
                }
                _ => return,
            };

            match engine.create_worker(settings).await {
                Ok(worker) => {
                    let Some(this) = pool.upgrade() else {
                        worker.close();
                        return;
                    };
                    if this.shutting_down.load(Ordering::SeqCst) {
                        worker.close();
                        return;
                    }
                    tracing::info!(worker_id = %worker.id(), slot = index, "Worker replaced");
                    *this.slots[index].write() = worker.clone();
                    Self::watch_slot(pool.clone(), index, worker);
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        slot = index,
                        "Failed to replace worker, retrying in {:?}: {}",
                        retry_delay,
                        err
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::engine::LocalEngine;

    fn config(num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            retry_delay: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn wait_for_replacement(pool: &WorkerPool, dead: &str) -> Arc<dyn Worker> {
        loop {
            let live: Vec<_> = pool.workers().into_iter().filter(|w| !w.closed()).collect();
            if live.len() == pool.len() && live.iter().all(|w| w.id() != dead) {
                return pool.workers()[0].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn port_ranges_are_disjoint() {
        let config = config(3);
        assert_eq!(config.port_range(0).unwrap(), PortRange { min: 10000, max: 10099 });
        assert_eq!(config.port_range(2).unwrap(), PortRange { min: 10200, max: 10299 });

        let overflow = WorkerPoolConfig {
            rtc_min_port: 65500,
            ..config
        };
        assert!(overflow.port_range(1).is_err());
    }

    #[tokio::test]
    async fn acquire_is_round_robin() {
        let pool = WorkerPool::start(Arc::new(LocalEngine::new()), config(2)).await.unwrap();
        let first = pool.acquire_worker().unwrap().id();
        let second = pool.acquire_worker().unwrap().id();
        let third = pool.acquire_worker().unwrap().id();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn dead_worker_is_skipped_and_replaced() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(Arc::new(engine.clone()), config(2)).await.unwrap();
        let mut deaths = pool.subscribe_deaths();
        let victim = pool.workers()[0].id();
        let survivor = pool.workers()[1].id();

        engine.fail_next_spawns(1);
        assert!(engine.kill_worker(&victim));
        for _ in 0..4 {
            let worker = pool.acquire_worker().unwrap();
            assert!(!worker.closed());
        }

        let died = tokio::time::timeout(Duration::from_secs(2), deaths.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(died, victim);

        tokio::time::timeout(Duration::from_secs(5), wait_for_replacement(&pool, &victim))
            .await
            .unwrap();
        let replacement = pool.workers()[0].clone();
        assert_eq!(replacement.port_range(), PortRange { min: 10000, max: 10099 });
        let ids: HashSet<_> = pool.workers().iter().map(|w| w.id()).collect();
        assert!(ids.contains(&survivor));
    }

    #[tokio::test]
    async fn no_live_worker_is_an_engine_failure() {
        let pool = WorkerPool::start(Arc::new(LocalEngine::new()), config(1)).await.unwrap();
        pool.shutdown();
        assert!(matches!(pool.acquire_worker(), Err(SfuError::Engine(_))));
    }
}
