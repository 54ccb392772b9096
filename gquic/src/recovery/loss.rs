//! # Sent-Packet Ledger and Loss Detection
//!
//! The ledger is the single owner of every sent-but-unresolved packet:
//! entries enter when a packet leaves the engine and leave when the packet
//! is acked, declared lost, or the connection closes. Loss detection is a
//! strategy consumed by the engine; the nack-threshold detector ships as
//! the reference implementation (a packet is lost once enough later
//! packets have been acked over it).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::frames::Frame;
use crate::packet::EncryptionLevel;
use crate::recovery::rtt::RttEstimator;
use crate::types::{Instant, SequenceNumber};

/// Acks over a missing packet before it is declared lost.
pub const NACKS_BEFORE_LOSS: u32 = 3;

/// One sent packet awaiting resolution.
#[derive(Debug, Clone)]
pub struct SentPacketRecord {
    pub sequence_number: SequenceNumber,
    pub sent_time: Instant,
    pub bytes: usize,
    pub encryption_level: EncryptionLevel,
    /// Frames to replay in a fresh packet if this one is lost.
    pub retransmittable_frames: Vec<Frame>,
    /// Counts toward the congestion window.
    pub in_flight: bool,
    pub is_fec_packet: bool,
    /// Acks processed while this packet stayed missing.
    pub nack_count: u32,
}

impl SentPacketRecord {
    pub fn is_retransmittable(&self) -> bool {
        !self.retransmittable_frames.is_empty()
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Retransmission ledger keyed by sequence number.
///
/// Entries are created and retired in roughly monotonic order, so an
/// ordered map keyed by sequence number keeps every scan the engine needs
/// (least unacked, oldest retransmittable) cheap.
#[derive(Debug, Default)]
pub struct SentPacketLedger {
    packets: BTreeMap<SequenceNumber, SentPacketRecord>,
}

impl SentPacketLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_sent(&mut self, record: SentPacketRecord) {
        self.packets.insert(record.sequence_number, record);
    }

    /// Resolve an acked packet, removing and returning its record.
    pub fn on_packet_acked(&mut self, sequence_number: SequenceNumber) -> Option<SentPacketRecord> {
        self.packets.remove(&sequence_number)
    }

    /// Remove a packet declared lost.
    pub fn on_packet_lost(&mut self, sequence_number: SequenceNumber) -> Option<SentPacketRecord> {
        self.packets.remove(&sequence_number)
    }

    pub fn contains(&self, sequence_number: SequenceNumber) -> bool {
        self.packets.contains_key(&sequence_number)
    }

    pub fn get(&self, sequence_number: SequenceNumber) -> Option<&SentPacketRecord> {
        self.packets.get(&sequence_number)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Smallest outstanding sequence number, if any.
    pub fn least_unacked(&self) -> Option<SequenceNumber> {
        self.packets.keys().next().copied()
    }

    /// Oldest packet still carrying retransmittable frames (the tail-loss
    /// probe target).
    pub fn oldest_retransmittable(&self) -> Option<&SentPacketRecord> {
        self.packets.values().find(|p| p.is_retransmittable())
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.packets.values().filter(|p| p.in_flight).map(|p| p.bytes).sum()
    }

    pub fn has_in_flight(&self) -> bool {
        self.packets.values().any(|p| p.in_flight)
    }

    /// Strip and return a packet's retransmittable frames, leaving the
    /// record in place to await its ack (used by probe and timeout
    /// retransmissions, which re-send the frames under a new number).
    pub fn take_retransmittable_frames(
        &mut self,
        sequence_number: SequenceNumber,
    ) -> Option<Vec<Frame>> {
        let record = self.packets.get_mut(&sequence_number)?;
        if record.retransmittable_frames.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut record.retransmittable_frames))
    }

    /// RTO: everything stops counting toward the window, FEC included.
    pub fn mark_all_not_in_flight(&mut self) {
        for packet in self.packets.values_mut() {
            packet.in_flight = false;
        }
    }

    /// Count a nack against every tracked packet below `largest_observed`
    /// that this ack reported missing.
    pub fn record_nacks<'a>(
        &mut self,
        largest_observed: SequenceNumber,
        missing: impl IntoIterator<Item = &'a SequenceNumber>,
    ) {
        for &seq in missing {
            if seq > largest_observed {
                continue;
            }
            if let Some(record) = self.packets.get_mut(&seq) {
                record.nack_count += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SentPacketRecord> {
        self.packets.values()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

// ============================================================================
// Loss detection strategy
// ============================================================================

/// Loss-detection strategy consumed by the engine.
///
/// Called after every processed ack; returns the packets now considered
/// lost. The strategy never mutates the ledger; the engine retires the
/// returned packets itself.
pub trait LossDetection: Send {
    fn detect_lost_packets(
        &mut self,
        ledger: &SentPacketLedger,
        largest_observed: SequenceNumber,
        rtt: &RttEstimator,
        now: Instant,
    ) -> Vec<SequenceNumber>;

    /// Deadline for time-based detection, if the strategy uses one.
    fn timeout(&self) -> Option<Instant>;

    fn name(&self) -> &'static str;
}

/// Nack-threshold detector: a packet is lost once `NACKS_BEFORE_LOSS` acks
/// have been processed while it stayed missing.
#[derive(Debug)]
pub struct NackThresholdDetector {
    threshold: u32,
}

impl Default for NackThresholdDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl NackThresholdDetector {
    pub fn new() -> Self {
        Self { threshold: NACKS_BEFORE_LOSS }
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self { threshold: threshold.max(1) }
    }
}

impl LossDetection for NackThresholdDetector {
    fn detect_lost_packets(
        &mut self,
        ledger: &SentPacketLedger,
        largest_observed: SequenceNumber,
        _rtt: &RttEstimator,
        _now: Instant,
    ) -> Vec<SequenceNumber> {
        ledger
            .iter()
            .filter(|p| p.sequence_number < largest_observed && p.nack_count >= self.threshold)
            .map(|p| p.sequence_number)
            .collect()
    }

    fn timeout(&self) -> Option<Instant> {
        None
    }

    fn name(&self) -> &'static str {
        "nack_threshold"
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
