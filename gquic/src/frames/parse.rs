//! # Frame Parsing and Serialization
//!
//! Lazy, allocation-light frame decoding plus the matching encoder. The
//! decoder yields frames one at a time through [`FrameIterator`] and
//! reports the first structurally invalid field with a frame-specific
//! error code. The encoder is budget-aware: every frame kind fails when it
//! cannot fit the remaining space except the ack frame, which truncates
//! its missing-packet ranges instead (recomputing its entropy hash over
//! the range it still enumerates).
//!
//! Frames other than the last in a packet must self-delimit; only the last
//! stream frame of a packet may omit its data-length field.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use bytes::Bytes;
use tinyvec::TinyVec;

use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::types::*;
use crate::packet::PacketHeader;
use crate::types::{
    EntropyHash, LittleEndianCodec, SequenceNumber, SequenceNumberLength, UFloat16,
};
use core::time::Duration;

// ============================================================================
// Byte cursor
// ============================================================================

/// Forward-only cursor over a packet payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_uint(&mut self, len: usize) -> Option<u64> {
        let value = LittleEndianCodec::read(&self.buf[self.pos.min(self.buf.len())..], len)?;
        self.pos += len;
        Some(value)
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

fn err(code: QuicErrorCode, detail: &'static str) -> Error {
    Error::new(code, detail)
}

// ============================================================================
// Decoder
// ============================================================================

/// Decodes the frame stream of one data packet.
///
/// Stop-waiting deltas are relative to the packet's own sequence number, so
/// the decoder carries the header context it was created from.
pub struct FrameDecoder {
    sequence_number: SequenceNumber,
    sequence_number_length: SequenceNumberLength,
}

impl FrameDecoder {
    pub fn new(header: &PacketHeader) -> Self {
        Self {
            sequence_number: header.sequence_number,
            sequence_number_length: header.sequence_number_length,
        }
    }

    /// Lazily iterate over the frames of `payload`.
    ///
    /// Iteration stops after the first error; the error is yielded once.
    pub fn iter<'a>(&'a self, payload: &'a [u8]) -> FrameIterator<'a> {
        FrameIterator {
            decoder: self,
            reader: Reader::new(payload),
            done: false,
        }
    }

    /// Decode every frame of `payload`.
    ///
    /// A data packet without a single frame is malformed.
    pub fn decode_all(&self, payload: &[u8]) -> Result<Vec<Frame>> {
        let frames: Vec<Frame> = self.iter(payload).collect::<Result<_>>()?;
        if frames.is_empty() {
            return Err(err(QuicErrorCode::MissingPayload, "packet contains no frames"));
        }
        Ok(frames)
    }

    fn decode_frame(&self, reader: &mut Reader<'_>) -> Result<Frame> {
        let frame_type = reader
            .read_u8()
            .ok_or_else(|| err(QuicErrorCode::InvalidFrameData, "unable to read frame type"))?;

        if frame_type & STREAM_FRAME_MASK != 0 {
            return self.decode_stream(frame_type, reader);
        }
        if frame_type & ACK_FRAME_MASK != 0 {
            return self.decode_ack(frame_type, reader);
        }

        match frame_type {
            FRAME_TYPE_PADDING => {
                // Padding runs to the end of the packet.
                reader.read_rest();
                Ok(Frame::Padding)
            }
            FRAME_TYPE_RST_STREAM => Self::decode_rst_stream(reader),
            FRAME_TYPE_CONNECTION_CLOSE => Self::decode_connection_close(reader),
            FRAME_TYPE_GOAWAY => Self::decode_goaway(reader),
            FRAME_TYPE_WINDOW_UPDATE => Self::decode_window_update(reader),
            FRAME_TYPE_BLOCKED => Self::decode_blocked(reader),
            FRAME_TYPE_STOP_WAITING => self.decode_stop_waiting(reader),
            FRAME_TYPE_PING => Ok(Frame::Ping),
            _ => Err(err(QuicErrorCode::InvalidFrameData, "unknown frame type")),
        }
    }

    fn decode_stream(&self, frame_type: u8, reader: &mut Reader<'_>) -> Result<Frame> {
        let fin = frame_type & STREAM_FRAME_BIT_FIN != 0;
        let has_data_length = frame_type & STREAM_FRAME_BIT_DATA_LENGTH != 0;
        let offset_bits = (frame_type & STREAM_FRAME_OFFSET_MASK) >> STREAM_FRAME_OFFSET_SHIFT;
        let offset_len = if offset_bits == 0 { 0 } else { offset_bits as usize + 1 };
        let id_len = (frame_type & STREAM_FRAME_ID_MASK) as usize + 1;

        let stream_id = reader
            .read_uint(id_len)
            .ok_or_else(|| err(QuicErrorCode::InvalidStreamData, "unable to read stream id"))?
            as u32;

        let offset = if offset_len == 0 {
            0
        } else {
            reader.read_uint(offset_len).ok_or_else(|| {
                err(QuicErrorCode::InvalidStreamData, "unable to read stream offset")
            })?
        };

        let data = if has_data_length {
            let len = reader.read_uint(2).ok_or_else(|| {
                err(QuicErrorCode::InvalidStreamData, "unable to read stream data length")
            })? as usize;
            reader.read_bytes(len).ok_or_else(|| {
                err(QuicErrorCode::InvalidStreamData, "stream data shorter than its length field")
            })?
        } else {
            reader.read_rest()
        };

        Ok(Frame::Stream(StreamFrame {
            stream_id,
            fin,
            offset,
            data: Bytes::copy_from_slice(data),
        }))
    }

    fn decode_ack(&self, frame_type: u8, reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidAckData, detail);

        let has_nacks = frame_type & ACK_FRAME_BIT_NACKS != 0;
        let is_truncated = frame_type & ACK_FRAME_BIT_TRUNCATED != 0;
        let largest_len = SequenceNumberLength::from_flag_bits(
            (frame_type & ACK_FRAME_LARGEST_OBSERVED_MASK) >> ACK_FRAME_LARGEST_OBSERVED_SHIFT,
        );
        let missing_len =
            SequenceNumberLength::from_flag_bits(frame_type & ACK_FRAME_MISSING_DELTA_MASK);

        let entropy_hash = reader
            .read_u8()
            .ok_or_else(|| invalid("unable to read entropy hash of received packets"))?
            as EntropyHash;
        let largest_observed = reader
            .read_uint(largest_len.len())
            .ok_or_else(|| invalid("unable to read largest observed"))?;
        let delta_time = Duration::from_micros(UFloat16::decode(
            reader
                .read_uint(2)
                .ok_or_else(|| invalid("unable to read ack delta time"))? as u16,
        ));

        let num_timestamps = reader
            .read_u8()
            .ok_or_else(|| invalid("unable to read number of received packets"))?;
        let mut timestamps: TinyVec<[PacketTimestamp; 2]> = TinyVec::new();
        let mut running_us = 0u64;
        for i in 0..num_timestamps {
            let delta_from_largest = reader
                .read_u8()
                .ok_or_else(|| invalid("unable to read sequence delta in received packets"))?;
            let time_delta_us = if i == 0 {
                running_us = reader
                    .read_uint(4)
                    .ok_or_else(|| invalid("unable to read time delta in received packets"))?;
                running_us
            } else {
                let incremental = reader.read_uint(2).ok_or_else(|| {
                    invalid("unable to read incremental time delta in received packets")
                })?;
                running_us = running_us.saturating_add(UFloat16::decode(incremental as u16));
                running_us
            };
            timestamps.push(PacketTimestamp { delta_from_largest, time_delta_us });
        }

        let mut missing_packets = BTreeSet::new();
        let mut revived_packets = BTreeSet::new();
        if has_nacks {
            let num_ranges = reader
                .read_u8()
                .ok_or_else(|| invalid("unable to read num missing packet ranges"))?;
            let mut current = largest_observed;
            for _ in 0..num_ranges {
                let delta = reader
                    .read_uint(missing_len.len())
                    .ok_or_else(|| invalid("unable to read missing sequence number delta"))?;
                let range_length = reader
                    .read_u8()
                    .ok_or_else(|| invalid("unable to read missing sequence number range"))?
                    as u64;
                if delta == 0 || current < delta || current - delta < range_length {
                    return Err(invalid("nack range out of order"));
                }
                let high = current - delta;
                let low = high - range_length;
                for seq in low..=high {
                    missing_packets.insert(seq);
                }
                current = low;
            }

            let num_revived = reader
                .read_u8()
                .ok_or_else(|| invalid("unable to read num revived packets"))?;
            for _ in 0..num_revived {
                let revived = reader
                    .read_uint(largest_len.len())
                    .ok_or_else(|| invalid("unable to read revived packet"))?;
                revived_packets.insert(revived);
            }
        }

        Ok(Frame::Ack(AckFrame {
            entropy_hash,
            largest_observed,
            delta_time,
            timestamps,
            missing_packets,
            revived_packets,
            is_truncated,
        }))
    }

    fn decode_stop_waiting(&self, reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidStopWaitingData, detail);

        let entropy_hash = reader
            .read_u8()
            .ok_or_else(|| invalid("unable to read entropy hash of sent packets"))?
            as EntropyHash;
        let delta = reader
            .read_uint(self.sequence_number_length.len())
            .ok_or_else(|| invalid("unable to read least unacked delta"))?;
        if delta > self.sequence_number {
            return Err(invalid("least unacked delta exceeds packet sequence number"));
        }

        Ok(Frame::StopWaiting(StopWaitingFrame {
            entropy_hash,
            least_unacked: self.sequence_number - delta,
        }))
    }

    fn decode_rst_stream(reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidRstStreamData, detail);

        let stream_id = reader
            .read_uint(4)
            .ok_or_else(|| invalid("unable to read stream id"))? as u32;
        let byte_offset = reader
            .read_uint(8)
            .ok_or_else(|| invalid("unable to read rst stream sent byte offset"))?;
        let error_code = QuicErrorCode::from_wire(
            reader
                .read_uint(4)
                .ok_or_else(|| invalid("unable to read rst stream error code"))? as u32,
        );

        Ok(Frame::RstStream(RstStreamFrame { stream_id, error_code, byte_offset }))
    }

    fn decode_connection_close(reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidConnectionCloseData, detail);

        let error_code = QuicErrorCode::from_wire(
            reader
                .read_uint(4)
                .ok_or_else(|| invalid("unable to read connection close error code"))?
                as u32,
        );
        let reason = Self::decode_reason(reader)
            .ok_or_else(|| invalid("unable to read connection close reason"))?;

        Ok(Frame::ConnectionClose(ConnectionCloseFrame { error_code, reason }))
    }

    fn decode_goaway(reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidGoawayData, detail);

        let error_code = QuicErrorCode::from_wire(
            reader
                .read_uint(4)
                .ok_or_else(|| invalid("unable to read goaway error code"))? as u32,
        );
        let last_good_stream_id = reader
            .read_uint(4)
            .ok_or_else(|| invalid("unable to read goaway last good stream id"))?
            as u32;
        let reason =
            Self::decode_reason(reader).ok_or_else(|| invalid("unable to read goaway reason"))?;

        Ok(Frame::GoAway(GoAwayFrame { error_code, last_good_stream_id, reason }))
    }

    fn decode_window_update(reader: &mut Reader<'_>) -> Result<Frame> {
        let invalid = |detail| err(QuicErrorCode::InvalidWindowUpdateData, detail);

        let stream_id = reader
            .read_uint(4)
            .ok_or_else(|| invalid("unable to read window update stream id"))?
            as u32;
        let byte_offset = reader
            .read_uint(8)
            .ok_or_else(|| invalid("unable to read window update byte offset"))?;

        Ok(Frame::WindowUpdate(WindowUpdateFrame { stream_id, byte_offset }))
    }

    fn decode_blocked(reader: &mut Reader<'_>) -> Result<Frame> {
        let stream_id = reader.read_uint(4).ok_or_else(|| {
            err(QuicErrorCode::InvalidBlockedData, "unable to read blocked stream id")
        })? as u32;
        Ok(Frame::Blocked(BlockedFrame { stream_id }))
    }

    fn decode_reason(reader: &mut Reader<'_>) -> Option<String> {
        let len = reader.read_uint(2)? as usize;
        let bytes = reader.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Lazy frame iterator; see [`FrameDecoder::iter`].
pub struct FrameIterator<'a> {
    decoder: &'a FrameDecoder,
    reader: Reader<'a>,
    done: bool,
}

impl<'a> Iterator for FrameIterator<'a> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.reader.is_empty() {
            return None;
        }
        match self.decoder.decode_frame(&mut self.reader) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Supplies the cumulative received-entropy hash up to a given packet.
///
/// The encoder consults this when it truncates an ack, so the written hash
/// covers exactly the packets the frame still enumerates.
pub trait ReceivedEntropyCalculator {
    fn entropy_hash(&self, sequence_number: SequenceNumber) -> EntropyHash;
}

impl<F: Fn(SequenceNumber) -> EntropyHash> ReceivedEntropyCalculator for F {
    fn entropy_hash(&self, sequence_number: SequenceNumber) -> EntropyHash {
        self(sequence_number)
    }
}

/// Contiguous missing-packet range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NackRange {
    low: SequenceNumber,
    high: SequenceNumber,
}

/// Serializes frames into packet payloads.
pub struct FrameEncoder;

impl FrameEncoder {
    fn stream_offset_len(offset: u64) -> usize {
        if offset == 0 {
            0
        } else {
            // The wire cannot carry a 1-byte offset.
            let mut len = 2;
            while len < 8 && offset >> (8 * len) != 0 {
                len += 1;
            }
            len
        }
    }

    fn stream_id_len(stream_id: u32) -> usize {
        let mut len = 1;
        while len < 4 && stream_id >> (8 * len) != 0 {
            len += 1;
        }
        len
    }

    /// Header bytes of a stream frame (everything but the data).
    pub fn stream_frame_overhead(stream_id: u32, offset: u64, last_frame: bool) -> usize {
        1 + Self::stream_id_len(stream_id)
            + Self::stream_offset_len(offset)
            + if last_frame { 0 } else { 2 }
    }

    /// Untruncated serialized size of a frame.
    ///
    /// For ack frames this is the size before any budget-driven truncation,
    /// capped at [`MAX_NACK_RANGES`] ranges.
    pub fn size(
        frame: &Frame,
        header_sequence_number_length: SequenceNumberLength,
        last_frame: bool,
    ) -> usize {
        match frame {
            Frame::Padding => 1,
            Frame::Ping | Frame::MtuDiscovery => 1,
            Frame::Stream(s) => {
                Self::stream_frame_overhead(s.stream_id, s.offset, last_frame) + s.data.len()
            }
            Frame::Ack(ack) => {
                let ranges = Self::build_nack_ranges(&ack.missing_packets);
                let kept = ranges.len().min(MAX_NACK_RANGES);
                let largest_len = SequenceNumberLength::for_value(ack.largest_observed);
                let missing_len = Self::missing_delta_length(ack.largest_observed, &ranges);
                Self::ack_size_for(
                    largest_len,
                    missing_len,
                    ack.timestamps.len(),
                    kept,
                    !ranges.is_empty(),
                    ack.revived_packets.len(),
                )
            }
            Frame::StopWaiting(_) => 2 + header_sequence_number_length.len(),
            Frame::RstStream(_) => 1 + 4 + 8 + 4,
            Frame::ConnectionClose(c) => 1 + 4 + 2 + c.reason.len(),
            Frame::GoAway(g) => 1 + 4 + 4 + 2 + g.reason.len(),
            Frame::WindowUpdate(_) => 1 + 4 + 8,
            Frame::Blocked(_) => 1 + 4,
        }
    }

    fn ack_size_for(
        largest_len: SequenceNumberLength,
        missing_len: SequenceNumberLength,
        num_timestamps: usize,
        num_ranges: usize,
        has_nacks: bool,
        num_revived: usize,
    ) -> usize {
        let timestamps = if num_timestamps == 0 { 0 } else { 5 + 3 * (num_timestamps - 1) };
        let nacks = if has_nacks {
            1 + num_ranges * (missing_len.len() + 1) + 1 + num_revived * largest_len.len()
        } else {
            0
        };
        1 + 1 + largest_len.len() + 2 + 1 + timestamps + nacks
    }

    /// Serialize `frame` onto `out`, using at most `budget` bytes.
    ///
    /// Returns true when an ack frame had to be truncated. Non-ack frames
    /// that exceed the budget are an engine bug (the creator checks sizes
    /// before committing) and fail with `InternalError`.
    pub fn append_frame(
        frame: &Frame,
        last_frame: bool,
        header_sequence_number: SequenceNumber,
        header_sequence_number_length: SequenceNumberLength,
        budget: usize,
        entropy_calculator: &dyn ReceivedEntropyCalculator,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        if let Frame::Ack(ack) = frame {
            return Self::append_ack(ack, budget, entropy_calculator, out);
        }

        if Self::size(frame, header_sequence_number_length, last_frame) > budget {
            return Err(err(QuicErrorCode::InternalError, "frame exceeds packet budget"));
        }

        match frame {
            Frame::Padding => out.push(FRAME_TYPE_PADDING),
            Frame::Ping | Frame::MtuDiscovery => out.push(FRAME_TYPE_PING),
            Frame::Stream(s) => Self::append_stream(s, last_frame, out)?,
            Frame::StopWaiting(s) => Self::append_stop_waiting(
                s,
                header_sequence_number,
                header_sequence_number_length,
                out,
            )?,
            Frame::RstStream(r) => {
                out.push(FRAME_TYPE_RST_STREAM);
                push_uint(out, r.stream_id as u64, 4);
                push_uint(out, r.byte_offset, 8);
                push_uint(out, r.error_code.to_wire() as u64, 4);
            }
            Frame::ConnectionClose(c) => {
                out.push(FRAME_TYPE_CONNECTION_CLOSE);
                push_uint(out, c.error_code.to_wire() as u64, 4);
                Self::append_reason(&c.reason, out)?;
            }
            Frame::GoAway(g) => {
                out.push(FRAME_TYPE_GOAWAY);
                push_uint(out, g.error_code.to_wire() as u64, 4);
                push_uint(out, g.last_good_stream_id as u64, 4);
                Self::append_reason(&g.reason, out)?;
            }
            Frame::WindowUpdate(w) => {
                out.push(FRAME_TYPE_WINDOW_UPDATE);
                push_uint(out, w.stream_id as u64, 4);
                push_uint(out, w.byte_offset, 8);
            }
            Frame::Blocked(b) => {
                out.push(FRAME_TYPE_BLOCKED);
                push_uint(out, b.stream_id as u64, 4);
            }
            Frame::Ack(_) => unreachable!("handled above"),
        }
        Ok(false)
    }

    fn append_stream(frame: &StreamFrame, last_frame: bool, out: &mut Vec<u8>) -> Result<()> {
        if !last_frame && frame.data.len() > u16::MAX as usize {
            return Err(err(
                QuicErrorCode::InternalError,
                "stream frame data exceeds the 16-bit length field",
            ));
        }

        let id_len = Self::stream_id_len(frame.stream_id);
        let offset_len = Self::stream_offset_len(frame.offset);
        let offset_bits = if offset_len == 0 { 0 } else { (offset_len - 1) as u8 };

        let mut frame_type = STREAM_FRAME_MASK | (id_len - 1) as u8;
        frame_type |= offset_bits << STREAM_FRAME_OFFSET_SHIFT;
        if frame.fin {
            frame_type |= STREAM_FRAME_BIT_FIN;
        }
        if !last_frame {
            frame_type |= STREAM_FRAME_BIT_DATA_LENGTH;
        }

        out.push(frame_type);
        push_uint(out, frame.stream_id as u64, id_len);
        if offset_len > 0 {
            push_uint(out, frame.offset, offset_len);
        }
        if !last_frame {
            push_uint(out, frame.data.len() as u64, 2);
        }
        out.extend_from_slice(&frame.data);
        Ok(())
    }

    fn append_stop_waiting(
        frame: &StopWaitingFrame,
        header_sequence_number: SequenceNumber,
        length: SequenceNumberLength,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if frame.least_unacked > header_sequence_number {
            return Err(err(
                QuicErrorCode::InternalError,
                "least unacked ahead of the packet carrying it",
            ));
        }
        let delta = header_sequence_number - frame.least_unacked;
        if SequenceNumberLength::for_value(delta) > length {
            return Err(err(
                QuicErrorCode::InternalError,
                "least unacked delta does not fit the header sequence number length",
            ));
        }
        out.push(FRAME_TYPE_STOP_WAITING);
        out.push(frame.entropy_hash);
        push_uint(out, delta, length.len());
        Ok(())
    }

    fn append_reason(reason: &str, out: &mut Vec<u8>) -> Result<()> {
        if reason.len() > u16::MAX as usize {
            return Err(err(QuicErrorCode::InternalError, "reason phrase too long"));
        }
        push_uint(out, reason.len() as u64, 2);
        out.extend_from_slice(reason.as_bytes());
        Ok(())
    }

    /// Group a missing-packet set into wire ranges, ascending, splitting
    /// runs longer than the one-byte range field can carry.
    fn build_nack_ranges(missing: &BTreeSet<SequenceNumber>) -> Vec<NackRange> {
        let mut ranges: Vec<NackRange> = Vec::new();
        for &seq in missing {
            match ranges.last_mut() {
                Some(last) if seq == last.high + 1 && last.high - last.low < u8::MAX as u64 => {
                    last.high = seq;
                }
                _ => ranges.push(NackRange { low: seq, high: seq }),
            }
        }
        ranges
    }

    fn missing_delta_length(
        largest_observed: SequenceNumber,
        ranges: &[NackRange],
    ) -> SequenceNumberLength {
        match ranges.first() {
            Some(first) => SequenceNumberLength::for_value(largest_observed - first.low),
            None => SequenceNumberLength::One,
        }
    }

    /// Append an ack frame, truncating its nack ranges to `budget`.
    ///
    /// Truncation keeps the ranges nearest the least-unacked floor, drops
    /// the rest, clamps `largest_observed` to one above the highest kept
    /// missing packet, drops receive timestamps (they refer to the old
    /// largest), and recomputes the entropy hash over the surviving range.
    fn append_ack(
        ack: &AckFrame,
        budget: usize,
        entropy_calculator: &dyn ReceivedEntropyCalculator,
        out: &mut Vec<u8>,
    ) -> Result<bool> {
        let all_ranges = Self::build_nack_ranges(&ack.missing_packets);

        let mut largest_observed = ack.largest_observed;
        let mut entropy_hash = ack.entropy_hash;
        let mut kept = all_ranges.len().min(MAX_NACK_RANGES);
        let mut truncated = all_ranges.len() > kept;
        let mut num_timestamps = ack.timestamps.len().min(MAX_ACK_TIMESTAMPS);

        // Sizes shrink monotonically while truncating, so this settles in a
        // couple of rounds.
        for _ in 0..4 {
            if truncated {
                largest_observed = all_ranges[kept - 1].high + 1;
                num_timestamps = 0;
            }
            let largest_len = SequenceNumberLength::for_value(largest_observed);
            let missing_len = Self::missing_delta_length(largest_observed, &all_ranges[..kept]);
            let num_revived = ack
                .revived_packets
                .iter()
                .filter(|&&seq| seq <= largest_observed)
                .count()
                .min(u8::MAX as usize);
            let size = Self::ack_size_for(
                largest_len,
                missing_len,
                num_timestamps,
                kept,
                kept > 0,
                num_revived,
            );
            if size <= budget {
                break;
            }

            // Timestamps are expendable; shed them before cutting ranges.
            if num_timestamps > 0 {
                num_timestamps = 0;
                continue;
            }
            let overflow = size - budget;
            let per_range = missing_len.len() + 1;
            let dropped = (overflow + per_range - 1) / per_range;
            if dropped >= kept {
                return Err(err(
                    QuicErrorCode::InternalError,
                    "ack frame cannot fit the packet budget",
                ));
            }
            kept -= dropped;
            truncated = true;
        }

        if truncated {
            largest_observed = all_ranges[kept - 1].high + 1;
            num_timestamps = 0;
            entropy_hash = entropy_calculator.entropy_hash(largest_observed);
        }

        let ranges = &all_ranges[..kept];
        let has_nacks = !ranges.is_empty();
        let largest_len = SequenceNumberLength::for_value(largest_observed);
        let missing_len = Self::missing_delta_length(largest_observed, ranges);

        let mut frame_type = ACK_FRAME_MASK
            | (largest_len.to_flag_bits() << ACK_FRAME_LARGEST_OBSERVED_SHIFT)
            | missing_len.to_flag_bits();
        if has_nacks {
            frame_type |= ACK_FRAME_BIT_NACKS;
        }
        if truncated || ack.is_truncated {
            frame_type |= ACK_FRAME_BIT_TRUNCATED;
        }

        out.push(frame_type);
        out.push(entropy_hash);
        push_uint(out, largest_observed, largest_len.len());
        let delta_us = UFloat16::encode(ack.delta_time.as_micros().min(u64::MAX as u128) as u64);
        push_uint(out, delta_us as u64, 2);

        out.push(num_timestamps as u8);
        let mut prev_us = 0u64;
        for (i, ts) in ack.timestamps.iter().take(num_timestamps).enumerate() {
            out.push(ts.delta_from_largest);
            if i == 0 {
                push_uint(out, ts.time_delta_us & 0xFFFF_FFFF, 4);
            } else {
                let incremental = UFloat16::encode(ts.time_delta_us.saturating_sub(prev_us));
                push_uint(out, incremental as u64, 2);
            }
            prev_us = ts.time_delta_us;
        }

        if has_nacks {
            out.push(ranges.len() as u8);
            let mut current = largest_observed;
            for range in ranges.iter().rev() {
                push_uint(out, current - range.high, missing_len.len());
                out.push((range.high - range.low) as u8);
                current = range.low;
            }

            let revived: Vec<SequenceNumber> = ack
                .revived_packets
                .iter()
                .copied()
                .filter(|&seq| seq <= largest_observed)
                .take(u8::MAX as usize)
                .collect();
            out.push(revived.len() as u8);
            for seq in revived {
                push_uint(out, seq, largest_len.len());
            }
        }

        Ok(truncated)
    }
}

fn push_uint(out: &mut Vec<u8>, value: u64, len: usize) {
    let start = out.len();
    out.resize(start + len, 0);
    LittleEndianCodec::write(value, len, &mut out[start..])
        .expect("value checked against field width");
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketHeader;
    use crate::types::ConnectionIdLength;

    fn test_header(sequence_number: SequenceNumber) -> PacketHeader {
        PacketHeader {
            connection_id: 0xFEDC_BA98_7654_3210,
            connection_id_length: ConnectionIdLength::EightBytes,
            version: None,
            sequence_number,
            sequence_number_length: SequenceNumberLength::Six,
            entropy_flag: false,
            fec_flag: false,
            fec_group: None,
        }
    }

    fn no_entropy(_: SequenceNumber) -> EntropyHash {
        0
    }

    fn round_trip(frame: Frame, last: bool) -> Frame {
        let header = test_header(0x1234_5678);
        let mut out = Vec::new();
        FrameEncoder::append_frame(
            &frame,
            last,
            header.sequence_number,
            header.sequence_number_length,
            1400,
            &no_entropy,
            &mut out,
        )
        .unwrap();
        let decoder = FrameDecoder::new(&header);
        let frames = decoder.decode_all(&out).unwrap();
        assert_eq!(frames.len(), 1);
        frames.into_iter().next().unwrap()
    }

    // ========================================================================
    // Wire vectors
    // ========================================================================

    mod wire_vectors {
        use super::*;

        #[test]
        fn stream_frame_with_fin_and_full_lengths() {
            // frame type: stream | fin | data length | 8-byte offset |
            // 4-byte stream id
            let payload = [
                0xFF, // frame type
                0x04, 0x03, 0x02, 0x01, // stream id
                0x54, 0x76, 0x10, 0x32, 0xDC, 0xFE, 0x98, 0xBA, // offset
                0x0C, 0x00, // data length
                b'h', b'e', b'l', b'l', b'o', b' ', b'w', b'o', b'r', b'l', b'd', b'!',
            ];
            let decoder = FrameDecoder::new(&test_header(1));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::Stream(s) => {
                    assert_eq!(s.stream_id, 0x0102_0304);
                    assert!(s.fin);
                    assert_eq!(s.offset, 0xBA98_FEDC_3210_7654);
                    assert_eq!(&s.data[..], b"hello world!");
                }
                other => panic!("expected stream frame, got {other:?}"),
            }
        }

        #[test]
        fn stream_frame_without_data_length_consumes_rest() {
            // type 0x80 | id len 1: no fin, no length, no offset
            let payload = [0x80, 0x05, 0xAA, 0xBB, 0xCC];
            let decoder = FrameDecoder::new(&test_header(1));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::Stream(s) => {
                    assert_eq!(s.stream_id, 5);
                    assert_eq!(s.offset, 0);
                    assert!(!s.fin);
                    assert_eq!(&s.data[..], &[0xAA, 0xBB, 0xCC]);
                }
                other => panic!("expected stream frame, got {other:?}"),
            }
        }

        #[test]
        fn ack_frame_with_one_nack_range() {
            // (has nacks, 6-byte largest observed, 1-byte missing delta)
            let payload = [
                0x6C, // frame type
                0xBA, // entropy hash
                0xBF, 0x9A, 0x78, 0x56, 0x34, 0x12, // largest observed
                0x00, 0x00, // zero delta time
                0x00, // no timestamps
                0x01, // one missing range
                0x01, // missing delta
                0x00, // range length (single packet)
                0x00, // no revived packets
            ];
            let decoder = FrameDecoder::new(&test_header(0x1234_5678_9AA8));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::Ack(ack) => {
                    assert_eq!(ack.entropy_hash, 0xBA);
                    assert_eq!(ack.largest_observed, 0x0123_4567_89ABF);
                    assert!(!ack.is_truncated);
                    assert_eq!(ack.missing_packets.len(), 1);
                    assert!(ack.missing_packets.contains(&0x0123_4567_89ABE));
                    assert!(ack.revived_packets.is_empty());
                }
                other => panic!("expected ack frame, got {other:?}"),
            }
        }

        #[test]
        fn ack_frame_without_nacks_ends_after_timestamps() {
            let payload = [
                0x4C, // no nacks, 6-byte largest observed
                0xBA, // entropy
                0xBF, 0x9A, 0x78, 0x56, 0x34, 0x12, // largest observed
                0x00, 0x00, // delta time
                0x00, // no timestamps
            ];
            let decoder = FrameDecoder::new(&test_header(0x1234_5678_9AA8));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::Ack(ack) => {
                    assert_eq!(ack.largest_observed, 0x0123_4567_89ABF);
                    assert!(ack.missing_packets.is_empty());
                }
                other => panic!("expected ack frame, got {other:?}"),
            }
        }

        #[test]
        fn stop_waiting_frame_delta_is_relative_to_header() {
            let payload = [
                0x06, // frame type
                0xAB, // entropy of sent packets
                0x08, 0x00, 0x00, 0x00, 0x00, 0x00, // least unacked delta
            ];
            let decoder = FrameDecoder::new(&test_header(0x0123_4567_89AA8));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::StopWaiting(sw) => {
                    assert_eq!(sw.entropy_hash, 0xAB);
                    assert_eq!(sw.least_unacked, 0x0123_4567_89AA0);
                }
                other => panic!("expected stop waiting frame, got {other:?}"),
            }
        }

        #[test]
        fn rst_stream_frame_field_order() {
            let payload = [
                0x01, // frame type
                0x04, 0x03, 0x02, 0x01, // stream id
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // byte offset
                0x01, 0x00, 0x00, 0x00, // error code
            ];
            let decoder = FrameDecoder::new(&test_header(1));
            let frames = decoder.decode_all(&payload).unwrap();
            match &frames[0] {
                Frame::RstStream(rst) => {
                    assert_eq!(rst.stream_id, 0x0102_0304);
                    assert_eq!(rst.byte_offset, 0x0807_0605_0403_0201);
                    assert_eq!(rst.error_code, QuicErrorCode::InternalError);
                }
                other => panic!("expected rst stream frame, got {other:?}"),
            }
        }

        #[test]
        fn padding_consumes_the_rest_of_the_packet() {
            let payload = [0x00, 0x00, 0x00, 0x00];
            let decoder = FrameDecoder::new(&test_header(1));
            let frames = decoder.decode_all(&payload).unwrap();
            assert_eq!(frames, vec![Frame::Padding]);
        }
    }

    // ========================================================================
    // Round trips
    // ========================================================================

    mod round_trips {
        use super::*;

        #[test]
        fn every_regular_frame_round_trips() {
            let frames = vec![
                Frame::Ping,
                Frame::RstStream(RstStreamFrame {
                    stream_id: 7,
                    error_code: QuicErrorCode::PeerGoingAway,
                    byte_offset: 0x1_0000,
                }),
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code: QuicErrorCode::NoError,
                    reason: "bye".to_string(),
                }),
                Frame::GoAway(GoAwayFrame {
                    error_code: QuicErrorCode::PeerGoingAway,
                    last_good_stream_id: 11,
                    reason: "shutting down".to_string(),
                }),
                Frame::WindowUpdate(WindowUpdateFrame { stream_id: 3, byte_offset: 1 << 40 }),
                Frame::Blocked(BlockedFrame { stream_id: 3 }),
                Frame::StopWaiting(StopWaitingFrame { entropy_hash: 0x55, least_unacked: 100 }),
            ];
            for frame in frames {
                assert_eq!(round_trip(frame.clone(), false), frame);
            }
        }

        #[test]
        fn stream_frame_round_trips_across_length_combinations() {
            for stream_id in [1u32, 0x1FF, 0x1_FFFF, 0x0102_0304] {
                for offset in [0u64, 0x300, 0x1_0000_0000, u64::MAX >> 8] {
                    for last in [false, true] {
                        let frame = Frame::Stream(StreamFrame {
                            stream_id,
                            fin: offset == 0,
                            offset,
                            data: Bytes::from_static(b"payload"),
                        });
                        assert_eq!(round_trip(frame.clone(), last), frame);
                    }
                }
            }
        }

        #[test]
        fn ack_frame_round_trips_with_nacks_timestamps_and_revived() {
            let mut ack = AckFrame {
                entropy_hash: 0x42,
                largest_observed: 1000,
                delta_time: Duration::from_micros(300),
                ..AckFrame::default()
            };
            for seq in [100u64, 101, 102, 500, 700] {
                ack.missing_packets.insert(seq);
            }
            ack.revived_packets.insert(101);
            ack.timestamps.push(PacketTimestamp { delta_from_largest: 0, time_delta_us: 2000 });
            ack.timestamps.push(PacketTimestamp { delta_from_largest: 3, time_delta_us: 3000 });

            assert_eq!(round_trip(Frame::Ack(ack.clone()), false), Frame::Ack(ack));
        }

        #[test]
        fn mtu_discovery_decodes_as_ping() {
            assert_eq!(round_trip(Frame::MtuDiscovery, false), Frame::Ping);
        }

        #[test]
        fn long_missing_runs_split_into_multiple_ranges() {
            let mut ack = AckFrame {
                largest_observed: 2000,
                ..AckFrame::default()
            };
            // 600 contiguous missing packets: needs three wire ranges.
            for seq in 1000u64..1600 {
                ack.missing_packets.insert(seq);
            }
            match round_trip(Frame::Ack(ack.clone()), false) {
                Frame::Ack(decoded) => {
                    assert_eq!(decoded.missing_packets, ack.missing_packets);
                    assert!(!decoded.is_truncated);
                }
                other => panic!("expected ack frame, got {other:?}"),
            }
        }
    }

    // ========================================================================
    // Ack truncation
    // ========================================================================

    mod ack_truncation {
        use super::*;

        /// Ack over `num_ranges` alternating missing packets: missing odd
        /// numbers 1, 3, 5, ... with largest observed at the top.
        fn alternating_ack(num_ranges: u64) -> AckFrame {
            let mut ack = AckFrame {
                entropy_hash: 0xFF,
                largest_observed: 2 * num_ranges,
                ..AckFrame::default()
            };
            for i in 0..num_ranges {
                ack.missing_packets.insert(2 * i + 1);
            }
            ack
        }

        fn encode_with_budget(ack: &AckFrame, budget: usize) -> (Vec<u8>, bool) {
            let mut out = Vec::new();
            let truncated = FrameEncoder::append_ack(
                ack,
                budget,
                &|seq: SequenceNumber| (seq % 251) as EntropyHash,
                &mut out,
            )
            .unwrap();
            (out, truncated)
        }

        fn decode(buf: &[u8]) -> AckFrame {
            let decoder = FrameDecoder::new(&test_header(0x1234_5678));
            match decoder.decode_all(buf).unwrap().remove(0) {
                Frame::Ack(ack) => ack,
                other => panic!("expected ack frame, got {other:?}"),
            }
        }

        #[test]
        fn range_cap_truncates_and_clamps_largest_observed() {
            let ack = alternating_ack(300);
            let (buf, truncated) = encode_with_budget(&ack, 1400);
            assert!(truncated);

            let decoded = decode(&buf);
            assert!(decoded.is_truncated);
            // 255 lowest ranges survive: missing 1..=509 odd.
            assert_eq!(decoded.missing_packets.len(), 255);
            assert_eq!(*decoded.missing_packets.iter().next().unwrap(), 1);
            assert_eq!(*decoded.missing_packets.iter().next_back().unwrap(), 509);
            assert_eq!(decoded.largest_observed, 510);
            // Entropy recomputed over the enumerated range only.
            assert_eq!(decoded.entropy_hash, (510 % 251) as EntropyHash);
        }

        #[test]
        fn size_budget_truncates_harder() {
            let ack = alternating_ack(300);
            let (buf, truncated) = encode_with_budget(&ack, 500);
            assert!(truncated);
            assert!(buf.len() <= 500);

            let decoded = decode(&buf);
            assert!(decoded.is_truncated);
            assert!(decoded.missing_packets.len() < 255);
            let highest = *decoded.missing_packets.iter().next_back().unwrap();
            assert_eq!(decoded.largest_observed, highest + 1);
            assert_eq!(*decoded.missing_packets.iter().next().unwrap(), 1);
        }

        #[test]
        fn untruncated_ack_keeps_caller_entropy() {
            let ack = alternating_ack(10);
            let (buf, truncated) = encode_with_budget(&ack, 1400);
            assert!(!truncated);

            let decoded = decode(&buf);
            assert!(!decoded.is_truncated);
            assert_eq!(decoded.entropy_hash, 0xFF);
            assert_eq!(decoded.largest_observed, 20);
            assert_eq!(decoded.missing_packets, ack.missing_packets);
        }

        #[test]
        fn timestamps_are_dropped_on_truncation() {
            let mut ack = alternating_ack(300);
            ack.timestamps.push(PacketTimestamp { delta_from_largest: 0, time_delta_us: 99 });
            let (buf, truncated) = encode_with_budget(&ack, 1400);
            assert!(truncated);
            assert!(decode(&buf).timestamps.is_empty());
        }
    }

    // ========================================================================
    // Malformed input
    // ========================================================================

    mod malformed {
        use super::*;

        fn first_error(payload: &[u8]) -> Error {
            let decoder = FrameDecoder::new(&test_header(0x1000));
            decoder.decode_all(payload).unwrap_err()
        }

        #[test]
        fn truncated_stream_data_reports_stream_error() {
            // declared length 5, only 2 bytes present
            let payload = [0xA0, 0x01, 0x05, 0x00, 0xAA, 0xBB];
            assert_eq!(first_error(&payload).code(), QuicErrorCode::InvalidStreamData);
        }

        #[test]
        fn unknown_frame_type_is_rejected() {
            let payload = [0x0D];
            assert_eq!(first_error(&payload).code(), QuicErrorCode::InvalidFrameData);
        }

        #[test]
        fn truncated_ack_body_reports_ack_error() {
            let payload = [0x4C, 0xBA, 0xBF, 0x9A]; // largest observed cut short
            assert_eq!(first_error(&payload).code(), QuicErrorCode::InvalidAckData);
        }

        #[test]
        fn out_of_order_nack_range_is_rejected() {
            // largest observed 10, then a missing delta of zero
            let payload = [
                0x60, // ack, has nacks, 1-byte largest, 1-byte delta
                0x00, // entropy
                0x0A, // largest observed
                0x00, 0x00, // delta time
                0x00, // timestamps
                0x01, // one range
                0x00, // delta 0: invalid
                0x00,
            ];
            let e = first_error(&payload);
            assert_eq!(e.code(), QuicErrorCode::InvalidAckData);
            assert_eq!(e.detail(), "nack range out of order");
        }

        #[test]
        fn stop_waiting_beyond_header_sequence_is_rejected() {
            let header = test_header(5);
            let decoder = FrameDecoder::new(&header);
            // delta 10 > header sequence number 5
            let payload = [0x06, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00];
            let e = decoder.decode_all(&payload).unwrap_err();
            assert_eq!(e.code(), QuicErrorCode::InvalidStopWaitingData);
        }

        #[test]
        fn empty_payload_is_missing_payload() {
            let e = first_error(&[]);
            assert_eq!(e.code(), QuicErrorCode::MissingPayload);
        }

        #[test]
        fn iterator_stops_after_first_error() {
            let header = test_header(0x1000);
            let decoder = FrameDecoder::new(&header);
            let payload = [0x07, 0x0D, 0x07]; // ping, bad type, ping
            let results: Vec<_> = decoder.iter(&payload).collect();
            assert_eq!(results.len(), 2);
            assert!(results[0].is_ok());
            assert!(results[1].is_err());
        }
    }
}
