#![forbid(unsafe_code)]

//! NewReno congestion control. Window arithmetic is in payload bytes.

use std::time::{Duration, Instant};

use crate::packet::MAX_PAYLOAD;

/// Initial congestion window.
pub const INITIAL_CWND: u64 = 15000;
/// Sender maximum segment size; the window never drops below one of
/// these.
pub const MSS: u64 = MAX_PAYLOAD as u64;

#[derive(Debug)]
pub struct CongestionCtrl {
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    /// Losses of packets sent before this instant fall inside the
    /// current recovery window and do not re-halve the window.
    recovery_start: Option<Instant>,
    recovery_window: Duration,
}

impl CongestionCtrl {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            recovery_window: Duration::ZERO,
        }
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Whether another packet of `size` payload bytes may go on the wire.
    pub fn can_send(&self, size: usize) -> bool {
        self.bytes_in_flight + size as u64 <= self.cwnd
    }

    pub fn on_send(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes as u64;
    }

    pub fn on_ack(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);

        if self.cwnd < self.ssthresh {
            // Slow start: one MSS per acked packet doubles per RTT.
            self.cwnd += bytes as u64;
        } else {
            // Congestion avoidance.
            self.cwnd += (MSS * MSS) / self.cwnd;
        }
    }

    /// A packet sent at `sent_time` was declared lost.
    pub fn on_loss(&mut self, now: Instant, sent_time: Instant, bytes: usize, rtt: Duration) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes as u64);

        // Losses inside an open recovery window, or of packets sent
        // before it opened, belong to the same loss event.
        if let Some(start) = self.recovery_start {
            if now < start + self.recovery_window || sent_time < start {
                return;
            }
        }

        self.ssthresh = (self.cwnd / 2).max(MSS);
        self.cwnd = self.ssthresh;
        self.recovery_start = Some(now);
        self.recovery_window = rtt;
    }

    /// Forget in-flight accounting for a retransmission-timeout reset.
    pub fn on_rto_reset(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(MSS);
        self.cwnd = MSS.max(INITIAL_CWND / 2);
    }
}

impl Default for CongestionCtrl {
    fn default() -> Self {
        Self::new()
    }
}
