//! Round-trip time estimation (Jacobson/Karels)
//!
//! `EstimatedRTT = (1-α)·EstimatedRTT + α·SampleRTT`
//! `DevRTT       = (1-β)·DevRTT + β·|SampleRTT - EstimatedRTT|`
//! `RTO          = EstimatedRTT + 4·DevRTT`
//!
//! Samples taken from ACKs of retransmitted packets are not filtered out
//! (no Karn's algorithm), so heavy loss biases the estimate upward.
use std::time::Duration;

use crate::{RTT_ALPHA, RTT_BETA};

/// Smoothed RTT and deviation, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttEstimator {
    estimated_rtt: f64,
    dev_rtt: f64,
    samples: u64,
}

impl RttEstimator {
    /// Start from an initial estimate with zero deviation
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            estimated_rtt: initial_rtt.as_secs_f64(),
            dev_rtt: 0.0,
            samples: 0,
        }
    }

    /// Fold one RTT sample into the estimate and return the new RTO
    pub fn update(&mut self, sample: Duration) -> Duration {
        let sample = sample.as_secs_f64();
        self.estimated_rtt = (1.0 - RTT_ALPHA) * self.estimated_rtt + RTT_ALPHA * sample;
        self.dev_rtt =
            (1.0 - RTT_BETA) * self.dev_rtt + RTT_BETA * (sample - self.estimated_rtt).abs();
        self.samples += 1;
        self.rto()
    }

    pub fn estimated_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.estimated_rtt)
    }

    pub fn dev_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.dev_rtt)
    }

    /// Current retransmission timeout
    pub fn rto(&self) -> Duration {
        Duration::from_secs_f64(self.estimated_rtt + 4.0 * self.dev_rtt)
    }

    /// Number of samples folded in so far
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
