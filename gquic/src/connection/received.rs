//! # Received Packet Tracking
//!
//! Book-keeping for the inbound half of a connection: the largest observed
//! sequence number, the set of missing packets below it, duplicate
//! filtering, receive timestamps, and everything an outgoing ack frame
//! needs. The peer's stop-waiting frames advance a floor below which
//! missing packets stop being interesting.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use tinyvec::TinyVec;

use crate::entropy::ReceivedEntropyTracker;
use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::types::MAX_ACK_TIMESTAMPS;
use crate::frames::{AckFrame, PacketTimestamp, StopWaitingFrame};
use crate::packet::PacketHeader;
use crate::types::{Instant, SequenceNumber};

/// Outcome of recording one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// First time this packet was seen, in order.
    NewInOrder,
    /// First time seen, but it arrived out of order (it was missing, or
    /// left a gap behind it).
    NewOutOfOrder,
    /// Already seen, or below the peer's stop-waiting floor.
    Ignored,
}

/// Tracks received packets and builds outgoing acks.
#[derive(Debug)]
pub struct ReceivedPacketManager {
    creation_time: Instant,
    largest_observed: SequenceNumber,
    time_of_largest_observed: Option<Instant>,
    /// Packets below `largest_observed` not yet received.
    missing: BTreeSet<SequenceNumber>,
    /// Received packets above the floor, for duplicate filtering.
    received: BTreeSet<SequenceNumber>,
    /// Packets reconstructed by FEC since the last ack was built.
    revived: BTreeSet<SequenceNumber>,
    /// Receive times reported in the next ack, newest capped.
    receive_times: Vec<(SequenceNumber, Instant)>,
    /// Floor from the peer's stop-waiting frames.
    peer_least_awaiting: SequenceNumber,
    entropy: ReceivedEntropyTracker,
    /// Bound on tracked missing packets.
    max_tracked_missing: usize,
}

impl ReceivedPacketManager {
    pub fn new(creation_time: Instant, max_tracked_missing: usize) -> Self {
        Self {
            creation_time,
            largest_observed: 0,
            time_of_largest_observed: None,
            missing: BTreeSet::new(),
            received: BTreeSet::new(),
            revived: BTreeSet::new(),
            receive_times: Vec::new(),
            peer_least_awaiting: 0,
            entropy: ReceivedEntropyTracker::new(),
            max_tracked_missing,
        }
    }

    pub fn largest_observed(&self) -> SequenceNumber {
        self.largest_observed
    }

    pub fn is_missing(&self, sequence_number: SequenceNumber) -> bool {
        self.missing.contains(&sequence_number)
    }

    /// The received-entropy tracker, shared with ack serialization for
    /// truncation-time recomputation.
    pub fn entropy(&self) -> &ReceivedEntropyTracker {
        &self.entropy
    }

    /// Record an inbound packet (data or FEC).
    ///
    /// Fails with `TooManyOutstandingReceivedPackets` when the missing set
    /// outgrows its bound.
    pub fn record_received(&mut self, header: &PacketHeader, now: Instant) -> Result<ReceiptOutcome> {
        let seq = header.sequence_number;
        if seq < self.peer_least_awaiting || !self.received.insert(seq) {
            return Ok(ReceiptOutcome::Ignored);
        }

        self.entropy.record_received(seq, header.entropy_flag);
        if self.receive_times.len() < MAX_ACK_TIMESTAMPS {
            self.receive_times.push((seq, now));
        }

        let outcome = if seq > self.largest_observed {
            // Everything between the old and new largest is now missing.
            let first_gap = self.largest_observed.max(self.peer_least_awaiting.saturating_sub(1)) + 1;
            for missing in first_gap..seq {
                if !self.received.contains(&missing) {
                    self.missing.insert(missing);
                }
            }
            let had_gap = self.largest_observed != 0 && seq != self.largest_observed + 1;
            self.largest_observed = seq;
            self.time_of_largest_observed = Some(now);
            if had_gap {
                ReceiptOutcome::NewOutOfOrder
            } else {
                ReceiptOutcome::NewInOrder
            }
        } else {
            self.missing.remove(&seq);
            ReceiptOutcome::NewOutOfOrder
        };

        if self.missing.len() > self.max_tracked_missing {
            return Err(Error::new(
                QuicErrorCode::TooManyOutstandingReceivedPackets,
                "too many missing packets tracked",
            ));
        }
        Ok(outcome)
    }

    /// Record a FEC-revived packet. Its entropy is unknowable and is
    /// deliberately not folded into the received-entropy accumulation; the
    /// sequence number is reported through the ack's revived set instead.
    pub fn record_revived(&mut self, sequence_number: SequenceNumber) {
        self.missing.remove(&sequence_number);
        if sequence_number >= self.peer_least_awaiting {
            self.received.insert(sequence_number);
            self.revived.insert(sequence_number);
        }
    }

    /// Apply a peer stop-waiting frame.
    ///
    /// The floor never moves backwards; a frame that tries is a protocol
    /// violation.
    pub fn on_stop_waiting(&mut self, frame: &StopWaitingFrame) -> Result<()> {
        if frame.least_unacked < self.peer_least_awaiting {
            return Err(Error::new(
                QuicErrorCode::InvalidStopWaitingData,
                "stop waiting moved backwards",
            ));
        }
        self.peer_least_awaiting = frame.least_unacked;
        self.entropy.set_cumulative(frame.least_unacked, frame.entropy_hash);
        self.missing = self.missing.split_off(&frame.least_unacked);
        self.received = self.received.split_off(&frame.least_unacked);
        self.revived = self.revived.split_off(&frame.least_unacked);
        Ok(())
    }

    /// Build the next outgoing ack frame.
    ///
    /// Receive timestamps and the revived set are consumed: they are
    /// reported once.
    pub fn build_ack(&mut self, now: Instant) -> AckFrame {
        let delta_time = match self.time_of_largest_observed {
            Some(t) => now.saturating_duration_since(t),
            None => core::time::Duration::ZERO,
        };

        // Arrival order: the wire encodes later entries as non-negative
        // increments over the previous receive time.
        let mut timestamps: TinyVec<[PacketTimestamp; 2]> = TinyVec::new();
        for &(seq, time) in self.receive_times.iter() {
            let delta = self.largest_observed.saturating_sub(seq);
            if delta > u8::MAX as u64 {
                continue;
            }
            timestamps.push(PacketTimestamp {
                delta_from_largest: delta as u8,
                time_delta_us: time
                    .saturating_duration_since(self.creation_time)
                    .as_micros()
                    .min(u64::MAX as u128) as u64,
            });
        }
        self.receive_times.clear();

        AckFrame {
            entropy_hash: self.entropy.cumulative(self.largest_observed),
            largest_observed: self.largest_observed,
            delta_time,
            timestamps,
            missing_packets: self.missing.clone(),
            revived_packets: std::mem::take(&mut self.revived),
            is_truncated: false,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
