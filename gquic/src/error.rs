//! # Protocol Error Types
//!
//! Two layers of error information travel together through the engine:
//! a stable numeric [`QuicErrorCode`] (carried on the wire in
//! CONNECTION_CLOSE and RST_STREAM frames) and a static detail string
//! naming the first structurally invalid field, in the tradition of the
//! framer's "Unable to read ..." diagnostics.
//!
//! Framing and protocol-state errors are fatal to the connection and are
//! never retried; only transport-level write blocking is retried, and that
//! is signalled out of band (see [`crate::connection::WriteResult`]), not
//! through this type.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = core::result::Result<T, Error>;

/// Stable wire error codes.
///
/// The numeric values are carried in CONNECTION_CLOSE frames and must not
/// be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QuicErrorCode {
    /// Graceful shutdown, no error
    NoError = 0,

    /// Internal engine invariant violated
    InternalError = 1,

    /// Stream data received after the stream was terminated
    StreamDataAfterTermination = 2,

    /// Malformed packet header
    InvalidPacketHeader = 3,

    /// Unrecognized or malformed frame type
    InvalidFrameData = 4,

    /// Malformed FEC packet or redundancy payload
    InvalidFecData = 5,

    /// Malformed RST_STREAM frame
    InvalidRstStreamData = 6,

    /// Malformed CONNECTION_CLOSE frame
    InvalidConnectionCloseData = 7,

    /// Malformed GOAWAY frame
    InvalidGoawayData = 8,

    /// Malformed WINDOW_UPDATE frame
    InvalidWindowUpdateData = 9,

    /// Malformed BLOCKED frame
    InvalidBlockedData = 10,

    /// Malformed ACK frame, or an ack referencing unsent data
    InvalidAckData = 11,

    /// Malformed version negotiation packet
    InvalidVersionNegotiationPacket = 12,

    /// Malformed public reset packet
    InvalidPublicResetPacket = 13,

    /// Payload could not be decrypted
    DecryptionFailure = 14,

    /// Payload could not be encrypted
    EncryptionFailure = 15,

    /// Packet exceeded the maximum packet size
    PacketTooLarge = 16,

    /// Frame addressed a stream the engine does not know
    PacketForNonexistentStream = 17,

    /// Peer sent GOAWAY and is terminating
    PeerGoingAway = 18,

    /// Stream id is invalid for its direction or origin
    InvalidStreamId = 19,

    /// Stream limit exceeded
    TooManyOpenStreams = 20,

    /// Connection was terminated by a public reset packet
    PublicReset = 21,

    /// No mutually supported protocol version
    InvalidVersion = 22,

    /// Idle network timeout expired
    ConnectionTimedOut = 25,

    /// Peer address changed mid-connection
    ErrorMigratingAddress = 26,

    /// Transport write failed hard (not a transient block)
    PacketWriteError = 27,

    /// Malformed stream frame
    InvalidStreamData = 46,

    /// Data packet arrived carrying no frames
    MissingPayload = 48,

    /// Malformed STOP_WAITING frame, or one that moved backwards
    InvalidStopWaitingData = 60,

    /// Data arrived unencrypted on a stream that requires encryption
    UnencryptedStreamData = 61,

    /// Overall connection age limit expired
    OverallTimedOut = 67,

    /// Retransmission ledger grew beyond its bound
    TooManyOutstandingSentPackets = 68,

    /// Missing-packet tracking grew beyond its bound
    TooManyOutstandingReceivedPackets = 69,
}

impl QuicErrorCode {
    /// Numeric wire value.
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Decode a wire value; unknown codes collapse to `InternalError` so a
    /// peer speaking a newer dialect still closes cleanly.
    pub fn from_wire(value: u32) -> Self {
        use QuicErrorCode::*;
        match value {
            0 => NoError,
            1 => InternalError,
            2 => StreamDataAfterTermination,
            3 => InvalidPacketHeader,
            4 => InvalidFrameData,
            5 => InvalidFecData,
            6 => InvalidRstStreamData,
            7 => InvalidConnectionCloseData,
            8 => InvalidGoawayData,
            9 => InvalidWindowUpdateData,
            10 => InvalidBlockedData,
            11 => InvalidAckData,
            12 => InvalidVersionNegotiationPacket,
            13 => InvalidPublicResetPacket,
            14 => DecryptionFailure,
            15 => EncryptionFailure,
            16 => PacketTooLarge,
            17 => PacketForNonexistentStream,
            18 => PeerGoingAway,
            19 => InvalidStreamId,
            20 => TooManyOpenStreams,
            21 => PublicReset,
            22 => InvalidVersion,
            25 => ConnectionTimedOut,
            26 => ErrorMigratingAddress,
            27 => PacketWriteError,
            46 => InvalidStreamData,
            48 => MissingPayload,
            60 => InvalidStopWaitingData,
            61 => UnencryptedStreamData,
            67 => OverallTimedOut,
            68 => TooManyOutstandingSentPackets,
            69 => TooManyOutstandingReceivedPackets,
            _ => InternalError,
        }
    }
}

/// Engine error: a wire code plus the first invalid field or violated
/// invariant, as a static string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{code:?}: {detail}")]
pub struct Error {
    code: QuicErrorCode,
    detail: &'static str,
}

impl Error {
    pub fn new(code: QuicErrorCode, detail: &'static str) -> Self {
        Self { code, detail }
    }

    pub fn code(&self) -> QuicErrorCode {
        self.code
    }

    pub fn detail(&self) -> &'static str {
        self.detail
    }
}
