//! # Frame Types
//!
//! The closed set of frames a data packet can carry. Frames own their
//! payloads (`Bytes`), so a parsed frame never borrows from the packet
//! buffer that produced it and can be queued for retransmission as-is.
//!
//! ## Frame Classification
//!
//! - **Retransmittable**: stream and control frames that must be re-sent in
//!   a fresh packet if their packet is lost.
//! - **Non-retransmittable**: acks, stop-waiting, padding and MTU probes,
//!   whose information is regenerated rather than replayed.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::collections::BTreeSet;

use bytes::Bytes;
use tinyvec::TinyVec;

use crate::error::QuicErrorCode;
use crate::types::{EntropyHash, SequenceNumber, StreamId, StreamOffset};

/// Stream id of the crypto/handshake stream; its frames bypass congestion
/// gating and are the only data legal in cleartext during the handshake.
pub const CRYPTO_STREAM_ID: StreamId = 1;

// ============================================================================
// Frame Type Bytes
// ============================================================================

/// Regular frame type bytes. Stream and ack frames use flag-bearing "special"
/// type bytes instead (see the masks below).
pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_RST_STREAM: u8 = 0x01;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_TYPE_GOAWAY: u8 = 0x03;
pub const FRAME_TYPE_WINDOW_UPDATE: u8 = 0x04;
pub const FRAME_TYPE_BLOCKED: u8 = 0x05;
pub const FRAME_TYPE_STOP_WAITING: u8 = 0x06;
pub const FRAME_TYPE_PING: u8 = 0x07;

/// Stream frames: `1 f d ooo ss`: set high bit, fin, data-length-present,
/// offset length (0,2..8 bytes), stream-id length (1..4 bytes).
pub const STREAM_FRAME_MASK: u8 = 0x80;
pub const STREAM_FRAME_BIT_FIN: u8 = 0x40;
pub const STREAM_FRAME_BIT_DATA_LENGTH: u8 = 0x20;
pub const STREAM_FRAME_OFFSET_SHIFT: u8 = 2;
pub const STREAM_FRAME_OFFSET_MASK: u8 = 0x1C;
pub const STREAM_FRAME_ID_MASK: u8 = 0x03;

/// Ack frames: `01 n t ll mm`: has-nack-ranges, truncated,
/// largest-observed length, missing-delta length.
pub const ACK_FRAME_MASK: u8 = 0x40;
pub const ACK_FRAME_BIT_NACKS: u8 = 0x20;
pub const ACK_FRAME_BIT_TRUNCATED: u8 = 0x10;
pub const ACK_FRAME_LARGEST_OBSERVED_SHIFT: u8 = 2;
pub const ACK_FRAME_LARGEST_OBSERVED_MASK: u8 = 0x0C;
pub const ACK_FRAME_MISSING_DELTA_MASK: u8 = 0x03;

/// Cap on nack ranges in a single ack frame (the count is a single byte).
pub const MAX_NACK_RANGES: usize = 255;

/// Cap on receive timestamps reported per ack.
pub const MAX_ACK_TIMESTAMPS: usize = 255;

// ============================================================================
// Frame payload structs
// ============================================================================

/// Application or crypto data on a stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub fin: bool,
    pub offset: StreamOffset,
    pub data: Bytes,
}

/// One receive-time report inside an ack frame.
///
/// `delta_from_largest` counts down from `largest_observed`; the time is
/// microseconds since the reporting connection's creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketTimestamp {
    pub delta_from_largest: u8,
    pub time_delta_us: u64,
}

/// Acknowledgment state for received packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckFrame {
    /// Cumulative entropy hash of every received packet up to
    /// `largest_observed` (recomputed over the enumerated range when the
    /// frame is truncated).
    pub entropy_hash: EntropyHash,

    /// Highest packet number observed.
    pub largest_observed: SequenceNumber,

    /// Time elapsed between receiving `largest_observed` and sending this
    /// ack.
    pub delta_time: Duration,

    /// Receive-time reports, in arrival order.
    pub timestamps: TinyVec<[PacketTimestamp; 2]>,

    /// Every packet below `largest_observed` not yet received.
    pub missing_packets: BTreeSet<SequenceNumber>,

    /// Packets recovered through FEC revival rather than direct receipt.
    pub revived_packets: BTreeSet<SequenceNumber>,

    /// Set when the missing-packet list was cut down to fit a size budget.
    pub is_truncated: bool,
}

/// Tells the peer to stop waiting for (nacking) packets below
/// `least_unacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopWaitingFrame {
    /// Cumulative entropy hash of sent packets below `least_unacked`.
    pub entropy_hash: EntropyHash,
    pub least_unacked: SequenceNumber,
}

/// Abruptly terminates one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: QuicErrorCode,
    /// Final number of bytes the sender wrote on the stream.
    pub byte_offset: StreamOffset,
}

/// Terminates the connection with a code and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: QuicErrorCode,
    pub reason: String,
}

/// Announces that no new streams will be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub error_code: QuicErrorCode,
    pub last_good_stream_id: StreamId,
    pub reason: String,
}

/// Raises the peer's flow-control offset for a stream (or, with stream id
/// zero, the connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub byte_offset: StreamOffset,
}

/// Reports that the sender is flow-control blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    pub stream_id: StreamId,
}

// ============================================================================
// Unified frame type
// ============================================================================

/// A single frame, as parsed from or built into a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Filler byte(s); consumes the rest of the packet.
    Padding,

    /// Stream data.
    Stream(StreamFrame),

    /// Acknowledgment.
    Ack(AckFrame),

    /// Least-unacked advertisement.
    StopWaiting(StopWaitingFrame),

    /// Keepalive.
    Ping,

    /// Stream reset.
    RstStream(RstStreamFrame),

    /// Connection termination.
    ConnectionClose(ConnectionCloseFrame),

    /// Graceful shutdown announcement.
    GoAway(GoAwayFrame),

    /// Flow-control window update.
    WindowUpdate(WindowUpdateFrame),

    /// Flow-control blocked report.
    Blocked(BlockedFrame),

    /// MTU probe filler; identical to Ping on the wire, but never
    /// retransmitted.
    MtuDiscovery,
}

impl Frame {
    /// True if the frame must be re-sent in a new packet when its packet is
    /// declared lost.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::StopWaiting(_) | Frame::MtuDiscovery
        )
    }

    /// True if the frame belongs to the crypto/handshake stream.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Frame::Stream(s) if s.stream_id == CRYPTO_STREAM_ID)
    }
}
