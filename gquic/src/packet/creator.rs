//! # Packet Creator
//!
//! Accumulates frames into outgoing packets under the size, sequence-number
//! -length and FEC-group constraints:
//!
//! - a frame is only accepted when it fits the space left in the current
//!   packet (the caller flushes and retries otherwise);
//! - non-final frames are serialized self-delimiting, the final stream
//!   frame of a packet omits its length field;
//! - the wire sequence-number length changes only at a packet boundary
//!   that is also a FEC-group boundary, so staged changes wait for the
//!   group to close;
//! - padding, when requested, fills the packet with padding bytes after
//!   the real frames (which are then all serialized with explicit
//!   lengths).

#![forbid(unsafe_code)]

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::config::FecSendPolicy;
use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::{Frame, FrameEncoder, ReceivedEntropyCalculator};
use crate::packet::fec::FecGroup;
use crate::packet::parser::PacketBuilder;
use crate::packet::{
    header_size, number, EncryptionLevel, PacketCodec, PacketHeader, SerializedPacket,
};
use crate::types::{ConnectionId, ConnectionIdLength, SequenceNumber, SequenceNumberLength};
use crate::version::QuicVersion;

/// Chooses each outgoing packet's entropy bit.
///
/// The bit must be unpredictable to the peer (a peer that can guess the
/// cumulative hash could ack packets it never received); tests inject a
/// fixed source.
pub trait EntropyFlagSource: Send {
    fn next(&mut self, sequence_number: SequenceNumber) -> bool;
}

/// Deterministic source for tests: every packet gets the same bit.
#[derive(Debug, Clone, Copy)]
pub struct FixedEntropySource(pub bool);

impl EntropyFlagSource for FixedEntropySource {
    fn next(&mut self, _sequence_number: SequenceNumber) -> bool {
        self.0
    }
}

/// Default source backed by a small PRNG.
#[derive(Debug)]
pub struct RandomEntropySource {
    rng: SmallRng,
}

impl RandomEntropySource {
    /// Seed deterministically (the seed comes from the connection's nonce
    /// material).
    pub fn from_seed(seed: u64) -> Self {
        Self { rng: SmallRng::seed_from_u64(seed) }
    }

    /// Seed from OS entropy.
    pub fn new() -> Self {
        Self { rng: SmallRng::from_entropy() }
    }
}

impl Default for RandomEntropySource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropyFlagSource for RandomEntropySource {
    fn next(&mut self, _sequence_number: SequenceNumber) -> bool {
        self.rng.gen()
    }
}

// ============================================================================
// Creator
// ============================================================================

/// Builds outgoing packets frame by frame.
pub struct PacketCreator {
    connection_id: ConnectionId,
    connection_id_length: ConnectionIdLength,
    /// Version tag carried while version negotiation is unconfirmed.
    version: Option<QuicVersion>,
    /// Last assigned sequence number.
    sequence_number: SequenceNumber,
    sequence_number_length: SequenceNumberLength,
    /// Staged length, applied at the next safe packet boundary.
    next_sequence_number_length: SequenceNumberLength,
    max_packet_length: usize,
    max_packets_per_fec_group: u8,
    fec_group: Option<FecGroup>,
    pending_frames: Vec<Frame>,
    /// Conservative payload estimate: every pending frame self-delimiting.
    pending_payload_size: usize,
    entropy_source: Box<dyn EntropyFlagSource>,
}

impl PacketCreator {
    pub fn new(
        connection_id: ConnectionId,
        version: Option<QuicVersion>,
        max_packet_length: usize,
        max_packets_per_fec_group: u8,
        entropy_source: Box<dyn EntropyFlagSource>,
    ) -> Self {
        Self {
            connection_id,
            connection_id_length: ConnectionIdLength::EightBytes,
            version,
            sequence_number: 0,
            sequence_number_length: SequenceNumberLength::Six,
            next_sequence_number_length: SequenceNumberLength::Six,
            max_packet_length,
            max_packets_per_fec_group: max_packets_per_fec_group.max(1),
            fec_group: None,
            pending_frames: Vec::new(),
            pending_payload_size: 0,
            entropy_source,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn sequence_number_length(&self) -> SequenceNumberLength {
        self.sequence_number_length
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    /// Raise or lower the packet size; takes effect for the next packet.
    pub fn set_max_packet_length(&mut self, length: usize) {
        self.max_packet_length = length;
    }

    /// Stop sending the version tag once negotiation settles.
    pub fn clear_version_flag(&mut self) {
        self.version = None;
    }

    /// Switch to a renegotiated version (the tag keeps being sent until
    /// [`Self::clear_version_flag`]).
    pub fn set_version(&mut self, version: QuicVersion) {
        self.version = Some(version);
    }

    pub fn set_max_packets_per_fec_group(&mut self, max: u8) {
        self.max_packets_per_fec_group = max.max(1);
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.pending_frames.is_empty()
    }

    /// Stage a sequence-number-length change; it is applied at the next
    /// packet boundary outside an open FEC group.
    pub fn set_next_sequence_number_length(&mut self, length: SequenceNumberLength) {
        self.next_sequence_number_length = length;
    }

    /// Recompute the staged length from the peer's least-awaited packet and
    /// the estimated packets in flight, with 4x headroom for reordering.
    pub fn update_sequence_number_length(
        &mut self,
        least_packet_awaited_by_peer: SequenceNumber,
        max_packets_in_flight: u64,
    ) {
        let current_delta = self.sequence_number + 1 - least_packet_awaited_by_peer.min(self.sequence_number + 1);
        let delta = current_delta.max(max_packets_in_flight);
        self.next_sequence_number_length = number::min_length_for_gap(delta.saturating_mul(4));
    }

    fn prospective_header_size(&self) -> usize {
        header_size(
            self.connection_id_length,
            self.version.is_some(),
            self.sequence_number_length,
            self.fec_group.is_some(),
        )
    }

    /// Space left for frames in the packet being built.
    pub fn bytes_free(&self) -> usize {
        self.max_packet_length
            .saturating_sub(self.prospective_header_size() + self.pending_payload_size)
    }

    /// Offer a frame to the current packet.
    ///
    /// Returns false when the frame does not fit; the caller must flush and
    /// try again. An ack frame is accepted whenever a useful truncated form
    /// fits.
    pub fn add_frame(&mut self, frame: Frame) -> bool {
        if self.pending_frames.is_empty() {
            // The first frame of a packet pins the header layout.
            self.maybe_apply_next_sequence_number_length();
        }
        let free = self.bytes_free();
        let needed = match &frame {
            // A truncated ack shrinks to its fixed fields; accept it when
            // those plus one nack range fit.
            Frame::Ack(ack) => {
                let fixed = 1
                    + 1
                    + SequenceNumberLength::for_value(ack.largest_observed).len()
                    + 2
                    + 1
                    + if ack.missing_packets.is_empty() { 0 } else { 2 + 1 + 1 + 1 };
                fixed.min(FrameEncoder::size(
                    &frame,
                    self.sequence_number_length,
                    false,
                ))
            }
            _ => FrameEncoder::size(&frame, self.sequence_number_length, false),
        };
        if needed > free {
            return false;
        }
        self.pending_payload_size +=
            FrameEncoder::size(&frame, self.sequence_number_length, false).min(free);
        self.pending_frames.push(frame);
        true
    }

    /// Open a FEC group starting at the next sequence number.
    ///
    /// Opening while frames are pending would put an unprotected packet
    /// inside the group and is refused.
    pub fn maybe_start_fec_group(&mut self) -> Result<bool> {
        if self.fec_group.is_some() {
            return Ok(false);
        }
        if self.has_pending_frames() {
            return Err(Error::new(
                QuicErrorCode::InternalError,
                "cannot open a fec group with unflushed frames",
            ));
        }
        self.fec_group = Some(FecGroup::open(self.sequence_number + 1));
        trace!(group = self.sequence_number + 1, "opened fec group");
        Ok(true)
    }

    pub fn has_open_fec_group(&self) -> bool {
        self.fec_group.is_some()
    }

    /// The open group reached its member cap and must emit.
    pub fn fec_group_is_full(&self) -> bool {
        self.fec_group
            .as_ref()
            .is_some_and(|g| g.num_protected() >= self.max_packets_per_fec_group as usize)
    }

    /// Whether the FEC packet should go out now.
    ///
    /// With `AnyTrigger` a non-empty group emits as soon as it is full or
    /// forced; with `AlarmTrigger` only a forced close (the FEC alarm or
    /// connection teardown) emits.
    pub fn should_emit_fec(&self, force: bool, policy: FecSendPolicy) -> bool {
        match &self.fec_group {
            None => false,
            Some(group) if group.is_empty() => false,
            Some(_) => match policy {
                FecSendPolicy::AnyTrigger => force || self.fec_group_is_full(),
                FecSendPolicy::AlarmTrigger => force,
            },
        }
    }

    fn next_packet_header(&mut self, is_fec: bool, entropy_flag: bool) -> PacketHeader {
        self.sequence_number += 1;
        PacketHeader {
            connection_id: self.connection_id,
            connection_id_length: self.connection_id_length,
            version: self.version,
            sequence_number: self.sequence_number,
            sequence_number_length: self.sequence_number_length,
            entropy_flag,
            fec_flag: is_fec,
            fec_group: self.fec_group.as_ref().map(|g| g.group_number()),
        }
    }

    /// Apply a staged sequence-number-length change if the packet boundary
    /// is also a FEC group boundary.
    fn maybe_apply_next_sequence_number_length(&mut self) {
        if self.fec_group.is_none() {
            self.sequence_number_length = self.next_sequence_number_length;
        }
    }

    /// Serialize the pending frames into a packet.
    ///
    /// With `pad_to`, padding bytes fill the packet up to the target (or as
    /// far as the packet size allows); padding is skipped entirely when no
    /// room is left after the real frames.
    pub fn flush(
        &mut self,
        pad_to: Option<usize>,
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
        entropy_calculator: &dyn ReceivedEntropyCalculator,
    ) -> Result<SerializedPacket> {
        if self.pending_frames.is_empty() {
            return Err(Error::new(QuicErrorCode::InternalError, "flush without pending frames"));
        }

        let entropy_flag = self.entropy_source.next(self.sequence_number + 1);
        let header = self.next_packet_header(false, entropy_flag);
        let header_len = header.wire_size();

        let mut payload = Vec::with_capacity(self.max_packet_length.saturating_sub(header_len));
        let frames = std::mem::take(&mut self.pending_frames);
        self.pending_payload_size = 0;

        let padding_requested = pad_to.is_some();
        for (i, frame) in frames.iter().enumerate() {
            // When padding follows, every frame self-delimits.
            let last = !padding_requested && i == frames.len() - 1;
            let remaining = self
                .max_packet_length
                .checked_sub(header_len + payload.len())
                .ok_or_else(|| {
                    Error::new(QuicErrorCode::InternalError, "pending frames overflow the packet")
                })?;
            FrameEncoder::append_frame(
                frame,
                last,
                header.sequence_number,
                header.sequence_number_length,
                remaining,
                entropy_calculator,
                &mut payload,
            )?;
        }

        if let Some(target) = pad_to {
            let target = target.min(self.max_packet_length);
            let free = target.saturating_sub(header_len + payload.len());
            if free > 0 {
                payload.resize(payload.len() + free, 0x00);
            }
        }

        if let Some(group) = &mut self.fec_group {
            group.protect(&payload);
        }

        let retransmittable_frames: Vec<Frame> =
            frames.iter().filter(|f| f.is_retransmittable()).cloned().collect();

        let packet = Self::seal(&header, payload, codec, level)?;
        Ok(SerializedPacket {
            sequence_number: header.sequence_number,
            sequence_number_length: header.sequence_number_length,
            packet,
            entropy_flag,
            retransmittable_frames,
            is_fec_packet: false,
        })
    }

    /// Close the open FEC group and serialize its FEC packet.
    pub fn serialize_fec(
        &mut self,
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
    ) -> Result<SerializedPacket> {
        let group = self.fec_group.take().ok_or_else(|| {
            Error::new(QuicErrorCode::InternalError, "no open fec group to serialize")
        })?;
        if group.is_empty() {
            return Err(Error::new(QuicErrorCode::InternalError, "fec group protects no packets"));
        }

        let entropy_flag = self.entropy_source.next(self.sequence_number + 1);
        self.sequence_number += 1;
        let header = PacketHeader {
            connection_id: self.connection_id,
            connection_id_length: self.connection_id_length,
            version: self.version,
            sequence_number: self.sequence_number,
            sequence_number_length: self.sequence_number_length,
            entropy_flag,
            fec_flag: true,
            fec_group: Some(group.group_number()),
        };
        trace!(
            group = group.group_number(),
            members = group.num_protected(),
            sequence_number = header.sequence_number,
            "emitting fec packet"
        );

        let redundancy = group.emit();
        let packet =
            PacketBuilder::build_fec_packet(&header, &redundancy, codec, level)?;
        // The group is closed: staged length changes may now land.
        self.maybe_apply_next_sequence_number_length();
        Ok(SerializedPacket {
            sequence_number: header.sequence_number,
            sequence_number_length: header.sequence_number_length,
            packet,
            entropy_flag,
            retransmittable_frames: Vec::new(),
            is_fec_packet: true,
        })
    }

    fn seal(
        header: &PacketHeader,
        mut payload: Vec<u8>,
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
    ) -> Result<bytes::Bytes> {
        let mut out = Vec::with_capacity(header.wire_size() + payload.len());
        PacketBuilder::append_header(header, &mut out)?;
        let header_len = out.len();
        codec.seal(level, header.sequence_number, &out[..header_len], &mut payload)?;
        out.extend_from_slice(&payload);
        Ok(bytes::Bytes::from(out))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
