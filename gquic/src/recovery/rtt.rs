//! # RTT Estimation
//!
//! Smoothed RTT and mean deviation via exponentially weighted moving
//! averages, feeding the retransmission and tail-loss-probe timers.

#![forbid(unsafe_code)]

use core::time::Duration;

/// Default initial RTT before any sample arrives.
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Floor for the computed retransmission delay.
pub const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);

/// Ceiling for the computed retransmission delay (before backoff).
pub const MAX_RETRANSMISSION_TIME: Duration = Duration::from_secs(60);

/// RTT estimator.
///
/// Peer-reported ack delay is subtracted from samples when doing so does
/// not push the sample below the observed minimum.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed_rtt: Duration,
    mean_deviation: Duration,
    min_rtt: Duration,
    latest_rtt: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(INITIAL_RTT)
    }
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            smoothed_rtt: initial_rtt,
            mean_deviation: initial_rtt / 2,
            min_rtt: initial_rtt,
            latest_rtt: initial_rtt,
            has_sample: false,
        }
    }

    /// Feed one sample; `ack_delay` is the peer-reported time it sat on
    /// the ack.
    pub fn update(&mut self, rtt_sample: Duration, ack_delay: Duration) {
        let mut sample = rtt_sample;
        if !self.has_sample || sample < self.min_rtt {
            self.min_rtt = sample;
        }
        // Only trust the reported delay when the adjusted sample stays
        // plausible.
        if sample > ack_delay && sample - ack_delay >= self.min_rtt {
            sample -= ack_delay;
        }
        self.latest_rtt = sample;

        if !self.has_sample {
            self.smoothed_rtt = sample;
            self.mean_deviation = sample / 2;
            self.has_sample = true;
        } else {
            let deviation = if self.smoothed_rtt > sample {
                self.smoothed_rtt - sample
            } else {
                sample - self.smoothed_rtt
            };
            self.mean_deviation = (self.mean_deviation * 3 + deviation) / 4;
            self.smoothed_rtt = (self.smoothed_rtt * 7 + sample) / 8;
        }
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Base retransmission delay: SRTT + 4 * deviation, clamped.
    pub fn retransmission_delay(&self) -> Duration {
        (self.smoothed_rtt + 4 * self.mean_deviation)
            .clamp(MIN_RETRANSMISSION_TIME, MAX_RETRANSMISSION_TIME)
    }
}
