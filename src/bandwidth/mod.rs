// Bandwidth management module for the SFU
//
// This module holds the bitrate policy applied to send transports: back off
// while the round-trip time is high, grow again while the path is clean and
// the engine estimates spare capacity.

use serde::{Deserialize, Serialize};

use crate::engine::TransportStats;

/// Outgoing bitrate policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitratePolicy {
    /// Cap applied when monitoring starts (bps)
    pub initial_bitrate: u32,
    /// RTT above which the cap decays (ms)
    pub high_rtt_ms: f64,
    /// RTT below which the cap may grow (ms)
    pub low_rtt_ms: f64,
    /// Multiplier on high RTT
    pub decay: f64,
    /// Multiplier on low RTT with spare capacity
    pub growth: f64,
    /// Lowest cap (bps)
    pub floor: u32,
    /// Highest cap (bps)
    pub ceiling: u32,
}

impl Default for BitratePolicy {
    fn default() -> Self {
        Self {
            initial_bitrate: 600_000,
            high_rtt_ms: 100.0,
            low_rtt_ms: 50.0,
            decay: 0.8,
            growth: 1.2,
            floor: 100_000,
            ceiling: 1_500_000,
        }
    }
}

impl BitratePolicy {
    /// Cap to apply after observing `stats` with `current` in place
    pub fn next_bitrate(&self, current: u32, stats: &TransportStats) -> u32 {
        let Some(rtt) = stats.round_trip_time else {
            return current;
        };

        if rtt > self.high_rtt_ms {
            let decayed = (current as f64 * self.decay).round() as u32;
            return decayed.max(self.floor);
        }

        let spare = stats
            .available_outgoing_bitrate
            .map(|available| available > current)
            .unwrap_or(false);
        if rtt < self.low_rtt_ms && spare {
            let grown = (current as f64 * self.growth).round().min(u32::MAX as f64) as u32;
            return grown.min(self.ceiling);
        }

        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rtt: Option<f64>, available: Option<u32>) -> TransportStats {
        TransportStats {
            round_trip_time: rtt,
            available_outgoing_bitrate: available,
            ..Default::default()
        }
    }

    #[test]
    fn high_rtt_decays_to_floor() {
        let policy = BitratePolicy::default();
        assert_eq!(policy.next_bitrate(600_000, &stats(Some(150.0), None)), 480_000);
        assert_eq!(policy.next_bitrate(110_000, &stats(Some(150.0), None)), 100_000);
        assert_eq!(policy.next_bitrate(100_000, &stats(Some(150.0), None)), 100_000);
    }

    #[test]
    fn low_rtt_grows_only_with_spare_capacity() {
        let policy = BitratePolicy::default();
        assert_eq!(
            policy.next_bitrate(600_000, &stats(Some(20.0), Some(2_000_000))),
            720_000
        );
        assert_eq!(
            policy.next_bitrate(600_000, &stats(Some(20.0), Some(500_000))),
            600_000
        );
        assert_eq!(
            policy.next_bitrate(1_400_000, &stats(Some(20.0), Some(5_000_000))),
            1_500_000
        );
    }

    #[test]
    fn moderate_or_missing_rtt_holds() {
        let policy = BitratePolicy::default();
        assert_eq!(policy.next_bitrate(600_000, &stats(Some(75.0), Some(2_000_000))), 600_000);
        assert_eq!(policy.next_bitrate(600_000, &stats(None, Some(2_000_000))), 600_000);
    }
}
