// Simulcast and quality module for the SFU
//
// Producers carry a quality index that degrades while the engine reports poor
// stream scores. Consumers start on the highest layers and ratchet down to
// what the engine reports as achievable, one dimension at a time.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use tokio::task::JoinHandle;

use crate::engine::{Consumer, ConsumerLayers, Producer, ProducerScore};

/// Quality index a producer starts with
pub const DEFAULT_QUALITY_INDEX: u8 = 2;

/// Scores below this count as degraded
pub const MIN_GOOD_SCORE: u8 = 5;

/// Layers requested for a new consumer
pub const STARTING_LAYERS: ConsumerLayers = ConsumerLayers {
    spatial_layer: 2,
    temporal_layer: 2,
};

/// Shared quality index of one producer
#[derive(Debug, Clone)]
pub struct QualityIndex(Arc<AtomicU8>);

impl QualityIndex {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(DEFAULT_QUALITY_INDEX)))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }

    /// Account for one score report; returns the new index when it moved
    pub fn observe(&self, scores: &[ProducerScore]) -> Option<u8> {
        if !scores.iter().any(|score| score.score < MIN_GOOD_SCORE) {
            return None;
        }
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |index| index.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

impl Default for QualityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Requested consumer layers that only ever go down
#[derive(Debug, Clone, Copy)]
pub struct LayerRatchet {
    requested: ConsumerLayers,
}

impl LayerRatchet {
    pub fn new(start: ConsumerLayers) -> Self {
        Self { requested: start }
    }

    /// Currently requested layers
    pub fn requested(&self) -> ConsumerLayers {
        self.requested
    }

    /// Clamp to `reported`; returns the new request when it changed
    pub fn observe(&mut self, reported: ConsumerLayers) -> Option<ConsumerLayers> {
        let next = ConsumerLayers {
            spatial_layer: self.requested.spatial_layer.min(reported.spatial_layer),
            temporal_layer: self.requested.temporal_layer.min(reported.temporal_layer),
        };
        if next == self.requested {
            return None;
        }
        self.requested = next;
        Some(next)
    }
}

/// Follow the scores of `producer` until it closes
pub fn spawn_score_observer<F>(
    producer: Arc<dyn Producer>,
    quality: QualityIndex,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(u8) + Send + 'static,
{
    tokio::spawn(async move {
        let producer_id = producer.id();
        let mut scores = producer.scores();
        let closed = producer.close_signal().closed();
        tokio::pin!(closed);
        drop(producer);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                changed = scores.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let report = scores.borrow_and_update().clone();
            if let Some(index) = quality.observe(&report) {
                tracing::info!(producer_id = %producer_id, quality_index = index, "Producer quality degraded");
                on_change(index);
            }
        }
    })
}

/// Request the starting layers on `consumer` and ratchet them down as the
/// engine reports layer changes, until the consumer closes
pub fn spawn_layer_observer(consumer: Arc<dyn Consumer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let consumer_id = consumer.id();
        if let Err(err) = consumer.set_preferred_layers(STARTING_LAYERS).await {
            tracing::warn!(consumer_id = %consumer_id, "Failed to set starting layers: {}", err);
        }

        let mut ratchet = LayerRatchet::new(STARTING_LAYERS);
        let mut layers = consumer.layers();
        let closed = consumer.close_signal().closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                changed = layers.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let Some(reported) = *layers.borrow_and_update() else {
                continue;
            };
            if let Some(next) = ratchet.observe(reported) {
                match consumer.set_preferred_layers(next).await {
                    Ok(()) => tracing::debug!(
                        consumer_id = %consumer_id,
                        spatial = next.spatial_layer,
                        temporal = next.temporal_layer,
                        "Lowered preferred layers"
                    ),
                    Err(err) => {
                        if consumer.closed() {
                            break;
                        }
                        tracing::warn!(consumer_id = %consumer_id, "Failed to set preferred layers: {}", err);
                    }
                }
            }
        }
    })
}
