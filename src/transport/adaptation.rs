// Bitrate adaptation for send transports
//
// A monitor samples the transport statistics on a fixed interval and applies
// the cap computed by `BitratePolicy`. The engine is only called when the cap
// actually changes.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{bandwidth::BitratePolicy, engine::WebRtcTransport};

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Periodic bitrate monitor of one transport
pub struct BitrateMonitor;

impl BitrateMonitor {
    /// Start monitoring `transport` until it closes
    pub fn spawn(
        transport: Arc<dyn WebRtcTransport>,
        policy: BitratePolicy,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let transport_id = transport.id();
            let closed = transport.close_signal().closed();
            tokio::pin!(closed);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            let mut current = policy.initial_bitrate;
            let mut applied: Option<u32> = None;

            loop {
                tokio::select! {
                    _ = &mut closed => break,
                    _ = ticker.tick() => {}
                }

                let stats = match transport.get_stats().await {
                    Ok(stats) => stats,
                    Err(err) => {
                        if transport.closed() {
                            break;
                        }
                        tracing::warn!(transport_id = %transport_id, "Failed to get transport stats: {}", err);
                        continue;
                    }
                };

                let next = policy.next_bitrate(current, &stats);
                if applied == Some(next) {
                    continue;
                }

                match transport.set_max_outgoing_bitrate(next).await {
                    Ok(()) => {
                        tracing::debug!(
                            transport_id = %transport_id,
                            bitrate = next,
                            rtt = ?stats.round_trip_time,
                            "Applied outgoing bitrate cap"
                        );
                        current = next;
                        applied = Some(next);
                    }
                    Err(err) => {
                        if transport.closed() {
                            break;
                        }
                        tracing::warn!(transport_id = %transport_id, "Failed to set outgoing bitrate: {}", err);
                    }
                }
            }

            tracing::debug!(transport_id = %transport_id, "Bitrate monitor stopped");
        })
    }
}
