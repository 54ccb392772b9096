//! # Packet Layer
//!
//! Wire-level packet structure: the public/private flag bytes, the packet
//! header, serialized-packet handles, and the encryption seam. Submodules:
//!
//! - [`number`]: sequence-number truncation and reconstruction
//! - [`parser`]: packet parse/build, including the unencrypted public-reset
//!   and version-negotiation formats
//! - [`creator`]: frame packing into outgoing packets
//! - [`fec`]: XOR forward-error-correction groups
//!
//! ## Data packet layout
//!
//! ```text
//! public_flags(1) | connection_id(0/1/4/8) | version_tag(4, optional) |
//! sequence_number(1/2/4/6) | private_flags(1) | fec_group_offset(1, optional) |
//! frames... (or FEC redundancy bytes when the FEC-packet flag is set)
//! ```

#![forbid(unsafe_code)]

pub mod creator;
pub mod fec;
pub mod number;
pub mod parser;

use bytes::Bytes;

use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::Frame;
use crate::types::{
    ConnectionId, ConnectionIdLength, EntropyHash, SequenceNumber, SequenceNumberLength,
};
use crate::version::QuicVersion;

// ============================================================================
// Flag bytes
// ============================================================================

/// Public flags: version negotiation requested / in progress.
pub const PUBLIC_FLAG_VERSION: u8 = 0x01;
/// Public flags: this is a public reset packet.
pub const PUBLIC_FLAG_RESET: u8 = 0x02;
/// Public flags: mask of the connection-id length bits.
pub const PUBLIC_FLAG_CONNECTION_ID_MASK: u8 = 0x0C;
/// Public flags: mask of the sequence-number length bits.
pub const PUBLIC_FLAG_SEQUENCE_LENGTH_MASK: u8 = 0x30;
/// Highest valid public-flags value; anything above is malformed.
pub const PUBLIC_FLAGS_MAX: u8 = 0x3F;

/// Private flags: the packet's entropy bit.
pub const PRIVATE_FLAG_ENTROPY: u8 = 0x01;
/// Private flags: the packet belongs to an open FEC group.
pub const PRIVATE_FLAG_FEC_GROUP: u8 = 0x02;
/// Private flags: the packet *is* the FEC packet of its group.
pub const PRIVATE_FLAG_FEC: u8 = 0x04;
/// Highest valid private-flags value.
pub const PRIVATE_FLAGS_MAX: u8 = 0x07;

pub(crate) fn connection_id_length_to_flags(length: ConnectionIdLength) -> u8 {
    match length {
        ConnectionIdLength::Absent => 0x00,
        ConnectionIdLength::OneByte => 0x04,
        ConnectionIdLength::FourBytes => 0x08,
        ConnectionIdLength::EightBytes => 0x0C,
    }
}

pub(crate) fn connection_id_length_from_flags(flags: u8) -> ConnectionIdLength {
    match flags & PUBLIC_FLAG_CONNECTION_ID_MASK {
        0x00 => ConnectionIdLength::Absent,
        0x04 => ConnectionIdLength::OneByte,
        0x08 => ConnectionIdLength::FourBytes,
        _ => ConnectionIdLength::EightBytes,
    }
}

// ============================================================================
// Packet header
// ============================================================================

/// Parsed or to-be-built packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Connection identifier (full value, even when truncated on the wire).
    pub connection_id: ConnectionId,

    /// How many connection-id bytes travel on the wire.
    pub connection_id_length: ConnectionIdLength,

    /// Version tag present (client packets before version confirmation).
    pub version: Option<QuicVersion>,

    /// Full logical sequence number.
    pub sequence_number: SequenceNumber,

    /// Wire length of the sequence number.
    pub sequence_number_length: SequenceNumberLength,

    /// Entropy bit from the private flags.
    pub entropy_flag: bool,

    /// This packet is the FEC packet of its group.
    pub fec_flag: bool,

    /// Sequence number of the first packet in this packet's FEC group,
    /// `None` when the packet is not FEC-protected.
    pub fec_group: Option<SequenceNumber>,
}

impl PacketHeader {
    /// Per-packet entropy hash: bit `sequence_number % 8`, or zero when the
    /// entropy flag is clear.
    pub fn entropy_hash(&self) -> EntropyHash {
        if self.entropy_flag {
            1 << (self.sequence_number % 8)
        } else {
            0
        }
    }

    /// Serialized header size in bytes.
    pub fn wire_size(&self) -> usize {
        1 + self.connection_id_length.len()
            + if self.version.is_some() { 4 } else { 0 }
            + self.sequence_number_length.len()
            + 1
            + if self.fec_group.is_some() { 1 } else { 0 }
    }
}

/// Header size for a given shape, without building a header first.
pub fn header_size(
    connection_id_length: ConnectionIdLength,
    include_version: bool,
    sequence_number_length: SequenceNumberLength,
    in_fec_group: bool,
) -> usize {
    1 + connection_id_length.len()
        + if include_version { 4 } else { 0 }
        + sequence_number_length.len()
        + 1
        + if in_fec_group { 1 } else { 0 }
}

// ============================================================================
// Serialized packets
// ============================================================================

/// A fully serialized outgoing packet, ready for the transport.
///
/// The contained frames are kept alongside the bytes so the engine can
/// re-queue them if the packet is later declared lost; `packet` itself is
/// retained verbatim only while a transport write is blocked.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    pub sequence_number: SequenceNumber,
    pub sequence_number_length: SequenceNumberLength,
    pub packet: Bytes,
    pub entropy_flag: bool,
    /// Frames that must be retransmitted if this packet is lost.
    pub retransmittable_frames: Vec<Frame>,
    /// True for the FEC packet of a group.
    pub is_fec_packet: bool,
}

impl SerializedPacket {
    /// Entropy hash contribution of this packet.
    pub fn entropy_hash(&self) -> EntropyHash {
        if self.entropy_flag {
            1 << (self.sequence_number % 8)
        } else {
            0
        }
    }
}

// ============================================================================
// Encryption seam
// ============================================================================

/// Encryption level a packet was sealed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Cleartext, before any handshake material exists.
    None,
    /// Initial keys derived from the handshake.
    Initial,
    /// Forward-secure keys.
    ForwardSecure,
}

/// Seals and opens packet payloads.
///
/// Cryptography is out of scope for the engine; implementations are
/// injected. The header bytes are passed as associated data so an
/// implementation can authenticate them.
pub trait PacketCodec: Send {
    /// Encrypt `payload` in place for the given packet.
    fn seal(
        &self,
        level: EncryptionLevel,
        sequence_number: SequenceNumber,
        associated_data: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<()>;

    /// Decrypt a payload; returns the plaintext and the level it actually
    /// decrypted at (`hint` is the engine's current receive level, but an
    /// implementation may fall back to an earlier key).
    fn open(
        &self,
        hint: EncryptionLevel,
        sequence_number: SequenceNumber,
        associated_data: &[u8],
        payload: &[u8],
    ) -> Result<(Vec<u8>, EncryptionLevel)>;
}

/// Pass-through codec for tests and for the cleartext handshake phase.
#[derive(Debug, Default)]
pub struct NullPacketCodec;

impl PacketCodec for NullPacketCodec {
    fn seal(
        &self,
        _level: EncryptionLevel,
        _sequence_number: SequenceNumber,
        _associated_data: &[u8],
        _payload: &mut Vec<u8>,
    ) -> Result<()> {
        Ok(())
    }

    fn open(
        &self,
        hint: EncryptionLevel,
        _sequence_number: SequenceNumber,
        _associated_data: &[u8],
        payload: &[u8],
    ) -> Result<(Vec<u8>, EncryptionLevel)> {
        Ok((payload.to_vec(), hint))
    }
}

/// Reject oversized packets early, before any parsing.
pub(crate) fn check_packet_size(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::new(QuicErrorCode::PacketTooLarge, "packet exceeds maximum size"));
    }
    Ok(())
}
