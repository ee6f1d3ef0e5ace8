#![forbid(unsafe_code)]

//! RFC 6298 round-trip estimation.

use std::time::Duration;

/// Lower bound on the retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_secs(1);
/// Upper bound on the (backed-off) retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);

const INITIAL_RTT: Duration = Duration::from_millis(333);

#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed_rtt: Duration,
    rtt_var: Duration,
    min_rtt: Duration,
    latest_rtt: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            smoothed_rtt: INITIAL_RTT,
            rtt_var: INITIAL_RTT / 2,
            min_rtt: Duration::MAX,
            latest_rtt: INITIAL_RTT,
            has_sample: false,
        }
    }

    /// Feed a sample from an ack of a previously-unacked packet.
    pub fn on_sample(&mut self, r: Duration) {
        self.latest_rtt = r;
        self.min_rtt = self.min_rtt.min(r);

        if !self.has_sample {
            self.smoothed_rtt = r;
            self.rtt_var = r / 2;
            self.has_sample = true;
            return;
        }

        let diff = if self.smoothed_rtt > r {
            self.smoothed_rtt - r
        } else {
            r - self.smoothed_rtt
        };
        // rtt_var <- 3/4 var + 1/4 |srtt - r|
        self.rtt_var = (self.rtt_var * 3 + diff) / 4;
        // srtt <- 7/8 srtt + 1/8 r
        self.smoothed_rtt = (self.smoothed_rtt * 7 + r) / 8;
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn min_rtt(&self) -> Duration {
        if self.min_rtt == Duration::MAX {
            self.smoothed_rtt
        } else {
            self.min_rtt
        }
    }

    /// `smoothed + 4·var`, floored at one second.
    pub fn rto(&self) -> Duration {
        (self.smoothed_rtt + 4 * self.rtt_var).max(MIN_RTO)
    }

    /// Threshold age for time-based loss detection:
    /// `9/8 · max(smoothed, latest)`.
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed_rtt.max(self.latest_rtt);
        base + base / 8
    }
}
