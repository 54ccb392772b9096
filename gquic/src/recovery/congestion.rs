//! # Send Algorithm Interface
//!
//! Strategy seam for congestion control. The engine consumes this
//! interface; real algorithm internals live behind it and are injected at
//! construction. Per the engine's ownership rules, strategies share no
//! mutable state with the engine; everything they need arrives as call
//! parameters.
//!
//! [`FixedWindowSender`] is the reference implementation: a fixed
//! congestion window with no growth or shrink dynamics, enough to drive
//! the engine's gating, queuing and timer behavior (and its tests)
//! without pretending to be a real controller.

#![forbid(unsafe_code)]

use core::time::Duration;

use crate::recovery::rtt::RttEstimator;
use crate::types::{Instant, SequenceNumber};

/// Congestion-control strategy consumed by the engine.
pub trait SendAlgorithm: Send {
    /// A packet left the engine.
    fn on_packet_sent(
        &mut self,
        now: Instant,
        sequence_number: SequenceNumber,
        bytes: usize,
        retransmittable: bool,
    );

    /// Ack processing finished: `bytes_in_flight` is the authoritative
    /// post-event value from the retransmission ledger.
    fn on_congestion_event(
        &mut self,
        rtt_updated: bool,
        acked_bytes: usize,
        lost_bytes: usize,
        bytes_in_flight: usize,
    );

    /// A full retransmission timeout fired.
    ///
    /// `packets_retransmitted` is false when the timeout found nothing to
    /// retransmit.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// May `bytes` more be sent right now?
    fn can_send(&self, bytes: usize) -> bool;

    /// Delay until the next send is allowed (zero when unblocked; used to
    /// arm the send alarm when `can_send` says no).
    fn time_until_send(&self, now: Instant) -> Duration;

    /// Base retransmission delay before backoff.
    fn retransmission_delay(&self, rtt: &RttEstimator) -> Duration;

    /// Current congestion window in bytes.
    fn congestion_window(&self) -> usize;

    /// Algorithm name for logs.
    fn name(&self) -> &'static str;
}

/// Creates send algorithm instances; injected so the algorithm can be
/// swapped per connection.
pub trait SendAlgorithmFactory: Send + Sync {
    fn create(&self, initial_window: usize) -> Box<dyn SendAlgorithm>;
    fn name(&self) -> &'static str;
}

// ============================================================================
// Fixed window reference sender
// ============================================================================

/// Gate on a fixed window of bytes in flight.
#[derive(Debug)]
pub struct FixedWindowSender {
    congestion_window: usize,
    bytes_in_flight: usize,
    /// Delay to report while blocked; models pacing for the send alarm.
    blocked_retry_delay: Duration,
}

impl FixedWindowSender {
    pub fn new(congestion_window: usize) -> Self {
        Self {
            congestion_window,
            bytes_in_flight: 0,
            blocked_retry_delay: Duration::from_millis(1),
        }
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }
}

impl SendAlgorithm for FixedWindowSender {
    fn on_packet_sent(
        &mut self,
        _now: Instant,
        _sequence_number: SequenceNumber,
        bytes: usize,
        retransmittable: bool,
    ) {
        if retransmittable {
            self.bytes_in_flight = self.bytes_in_flight.saturating_add(bytes);
        }
    }

    fn on_congestion_event(
        &mut self,
        _rtt_updated: bool,
        _acked_bytes: usize,
        _lost_bytes: usize,
        bytes_in_flight: usize,
    ) {
        self.bytes_in_flight = bytes_in_flight;
    }

    fn on_retransmission_timeout(&mut self, _packets_retransmitted: bool) {
        self.bytes_in_flight = 0;
    }

    fn can_send(&self, bytes: usize) -> bool {
        self.bytes_in_flight.saturating_add(bytes) <= self.congestion_window
    }

    fn time_until_send(&self, _now: Instant) -> Duration {
        if self.bytes_in_flight < self.congestion_window {
            Duration::ZERO
        } else {
            self.blocked_retry_delay
        }
    }

    fn retransmission_delay(&self, rtt: &RttEstimator) -> Duration {
        rtt.retransmission_delay()
    }

    fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}

/// Factory for [`FixedWindowSender`].
pub struct FixedWindowFactory;

impl SendAlgorithmFactory for FixedWindowFactory {
    fn create(&self, initial_window: usize) -> Box<dyn SendAlgorithm> {
        Box::new(FixedWindowSender::new(initial_window))
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}
