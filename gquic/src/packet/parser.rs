//! # Packet Parsing and Building
//!
//! The packet-level wire codec: header encode/decode, the encryption seam,
//! frame-stream dispatch, FEC packets, and the two unencrypted special
//! packet formats (version negotiation and public reset).
//!
//! The parser is stateful per connection: truncated sequence numbers are
//! reconstructed against the last number seen, and truncated connection ids
//! are completed from the connection's full id.

#![forbid(unsafe_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

use crate::config::MAX_PACKET_SIZE;
use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::{Frame, FrameDecoder, FrameEncoder, ReceivedEntropyCalculator};
use crate::packet::{
    check_packet_size, connection_id_length_from_flags, connection_id_length_to_flags, number,
    EncryptionLevel, PacketCodec, PacketHeader, PRIVATE_FLAGS_MAX, PRIVATE_FLAG_ENTROPY,
    PRIVATE_FLAG_FEC, PRIVATE_FLAG_FEC_GROUP, PUBLIC_FLAGS_MAX, PUBLIC_FLAG_RESET,
    PUBLIC_FLAG_SEQUENCE_LENGTH_MASK, PUBLIC_FLAG_VERSION,
};
use crate::types::{
    make_tag, ConnectionId, ConnectionIdLength, LittleEndianCodec, SequenceNumber,
    SequenceNumberLength,
};
use crate::version::QuicVersion;

/// Message tag opening a public reset packet.
pub const TAG_PRST: u32 = make_tag(b"PRST");
/// Public reset: nonce proof value.
pub const TAG_RNON: u32 = make_tag(b"RNON");
/// Public reset: rejected sequence number.
pub const TAG_RSEQ: u32 = make_tag(b"RSEQ");
/// Public reset: observed client address.
pub const TAG_CADR: u32 = make_tag(b"CADR");

/// Which side of the connection this parser serves.
///
/// Only clients accept version negotiation packets; only servers see
/// version-flagged data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Client,
    Server,
}

/// Decoded public reset message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicResetPacket {
    /// Proof the resetter saw traffic on this connection.
    pub nonce_proof: u64,
    /// Sequence number the reset was provoked by.
    pub rejected_sequence_number: SequenceNumber,
    /// Client address as observed by the resetter, when included.
    pub client_address: Option<SocketAddr>,
}

/// Outcome of parsing one inbound datagram.
#[derive(Debug, Clone)]
pub enum ParsedPacket {
    /// Version negotiation (client side only): every tag the server speaks.
    VersionNegotiation { connection_id: ConnectionId, version_tags: Vec<u32> },

    /// Public reset: the connection is dead.
    PublicReset { connection_id: ConnectionId, reset: PublicResetPacket },

    /// Data packet carrying a version tag the parser does not speak
    /// (server side; the engine answers with version negotiation).
    UnsupportedVersion { connection_id: ConnectionId, version_tag: u32 },

    /// Regular data packet with its frames.
    ///
    /// `payload` is the decrypted frame bytes, kept for FEC parity
    /// accumulation when the packet belongs to a group; `level` is the
    /// encryption level the payload decrypted at.
    Data { header: PacketHeader, frames: Vec<Frame>, payload: Bytes, level: EncryptionLevel },

    /// FEC packet: the XOR redundancy for the group named in the header.
    Fec { header: PacketHeader, redundancy: Bytes },
}

// ============================================================================
// Parser
// ============================================================================

/// Stateful per-connection packet parser.
pub struct PacketParser {
    perspective: Perspective,
    /// Completes truncated connection ids.
    connection_id: ConnectionId,
    /// Anchor for sequence-number reconstruction.
    last_sequence_number: SequenceNumber,
}

impl PacketParser {
    pub fn new(perspective: Perspective, connection_id: ConnectionId) -> Self {
        Self { perspective, connection_id, last_sequence_number: 0 }
    }

    /// Anchor used to widen truncated sequence numbers; exposed so the
    /// engine can resynchronize after its own sends.
    pub fn set_last_sequence_number(&mut self, sequence_number: SequenceNumber) {
        self.last_sequence_number = sequence_number;
    }

    /// Parse one inbound datagram.
    ///
    /// `codec` opens the encrypted frame payload of data and FEC packets;
    /// version negotiation and public reset packets are cleartext.
    pub fn parse(
        &mut self,
        bytes: &[u8],
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
    ) -> Result<ParsedPacket> {
        let invalid = |detail| Error::new(QuicErrorCode::InvalidPacketHeader, detail);
        check_packet_size(bytes.len(), MAX_PACKET_SIZE)?;

        let mut pos = 0usize;
        let public_flags = *bytes.first().ok_or_else(|| invalid("unable to read public flags"))?;
        pos += 1;
        if public_flags > PUBLIC_FLAGS_MAX {
            return Err(invalid("illegal public flags value"));
        }

        let cid_length = connection_id_length_from_flags(public_flags);
        let connection_id = self.read_connection_id(bytes, &mut pos, cid_length)?;

        if public_flags & PUBLIC_FLAG_RESET != 0 {
            let reset = Self::parse_public_reset(&bytes[pos..])?;
            return Ok(ParsedPacket::PublicReset { connection_id, reset });
        }

        let mut version = None;
        if public_flags & PUBLIC_FLAG_VERSION != 0 {
            if self.perspective == Perspective::Client {
                let tags = Self::parse_version_tags(&bytes[pos..])?;
                return Ok(ParsedPacket::VersionNegotiation {
                    connection_id,
                    version_tags: tags,
                });
            }
            let tag = LittleEndianCodec::read(&bytes[pos..], 4)
                .ok_or_else(|| invalid("unable to read version tag"))? as u32;
            pos += 4;
            match QuicVersion::from_tag(tag) {
                Some(v) => version = Some(v),
                None => {
                    return Ok(ParsedPacket::UnsupportedVersion {
                        connection_id,
                        version_tag: tag,
                    })
                }
            }
        }

        let seq_length = SequenceNumberLength::from_flag_bits(
            (public_flags & PUBLIC_FLAG_SEQUENCE_LENGTH_MASK) >> 4,
        );
        let wire_seq = LittleEndianCodec::read(&bytes[pos..], seq_length.len())
            .ok_or_else(|| invalid("unable to read sequence number"))?;
        pos += seq_length.len();
        let sequence_number =
            number::reconstruct(wire_seq, seq_length, self.last_sequence_number);
        if sequence_number == 0 {
            return Err(invalid("sequence numbers start at one"));
        }

        let private_flags =
            *bytes.get(pos).ok_or_else(|| invalid("unable to read private flags"))?;
        pos += 1;
        if private_flags > PRIVATE_FLAGS_MAX {
            return Err(invalid("illegal private flags value"));
        }
        let entropy_flag = private_flags & PRIVATE_FLAG_ENTROPY != 0;
        let fec_flag = private_flags & PRIVATE_FLAG_FEC != 0;

        let fec_group = if private_flags & PRIVATE_FLAG_FEC_GROUP != 0 {
            let offset = *bytes
                .get(pos)
                .ok_or_else(|| invalid("unable to read fec group offset"))?
                as u64;
            pos += 1;
            if offset >= sequence_number {
                return Err(invalid("fec group starts before the first packet"));
            }
            Some(sequence_number - offset)
        } else {
            None
        };

        let header = PacketHeader {
            connection_id,
            connection_id_length: cid_length,
            version,
            sequence_number,
            sequence_number_length: seq_length,
            entropy_flag,
            fec_flag,
            fec_group,
        };

        let associated_data = &bytes[..pos];
        let (payload, decrypted_level) =
            codec.open(level, sequence_number, associated_data, &bytes[pos..])?;

        self.last_sequence_number = sequence_number;

        if fec_flag {
            if fec_group.is_none() || payload.is_empty() {
                return Err(Error::new(
                    QuicErrorCode::InvalidFecData,
                    "fec packet without group or redundancy",
                ));
            }
            return Ok(ParsedPacket::Fec { header, redundancy: Bytes::from(payload) });
        }

        let frames = FrameDecoder::new(&header).decode_all(&payload)?;
        Ok(ParsedPacket::Data {
            header,
            frames,
            payload: Bytes::from(payload),
            level: decrypted_level,
        })
    }

    fn read_connection_id(
        &self,
        bytes: &[u8],
        pos: &mut usize,
        length: ConnectionIdLength,
    ) -> Result<ConnectionId> {
        if length == ConnectionIdLength::Absent {
            return Ok(self.connection_id);
        }
        let wire = LittleEndianCodec::read(&bytes[*pos..], length.len()).ok_or_else(|| {
            Error::new(QuicErrorCode::InvalidPacketHeader, "unable to read connection id")
        })?;
        *pos += length.len();
        // A truncated id keeps the low bytes; the high bytes come from the
        // connection's full id.
        let full = match length {
            ConnectionIdLength::EightBytes => wire,
            ConnectionIdLength::FourBytes => (self.connection_id & !0xFFFF_FFFF) | wire,
            ConnectionIdLength::OneByte => (self.connection_id & !0xFF) | wire,
            ConnectionIdLength::Absent => unreachable!(),
        };
        Ok(full)
    }

    fn parse_version_tags(bytes: &[u8]) -> Result<Vec<u32>> {
        let invalid = |detail| Error::new(QuicErrorCode::InvalidVersionNegotiationPacket, detail);
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(invalid("unable to read supported version in negotiation"));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| LittleEndianCodec::read(chunk, 4).unwrap_or(0) as u32)
            .collect())
    }

    fn parse_public_reset(bytes: &[u8]) -> Result<PublicResetPacket> {
        let invalid = |detail| Error::new(QuicErrorCode::InvalidPublicResetPacket, detail);

        let message_tag = LittleEndianCodec::read(bytes, 4)
            .ok_or_else(|| invalid("unable to read reset message"))? as u32;
        if message_tag != TAG_PRST {
            return Err(invalid("reset message tag mismatch"));
        }
        let num_entries = LittleEndianCodec::read(&bytes[4..], 2)
            .ok_or_else(|| invalid("unable to read reset message"))? as usize;
        // Two bytes of padding follow the entry count.
        let mut pos = 8;

        let mut entries = Vec::with_capacity(num_entries.min(8));
        let mut previous_end = 0u32;
        for _ in 0..num_entries {
            let tag = LittleEndianCodec::read(&bytes[pos.min(bytes.len())..], 4)
                .ok_or_else(|| invalid("unable to read reset message"))? as u32;
            let end_offset = LittleEndianCodec::read(&bytes[(pos + 4).min(bytes.len())..], 4)
                .ok_or_else(|| invalid("unable to read reset message"))? as u32;
            if end_offset < previous_end {
                return Err(invalid("reset message offsets out of order"));
            }
            entries.push((tag, previous_end, end_offset));
            previous_end = end_offset;
            pos += 8;
        }

        let values = &bytes[pos.min(bytes.len())..];
        if values.len() != previous_end as usize {
            return Err(invalid("unable to read reset message"));
        }

        let value_of = |wanted: u32| -> Option<&[u8]> {
            entries
                .iter()
                .find(|(tag, _, _)| *tag == wanted)
                .map(|&(_, start, end)| &values[start as usize..end as usize])
        };

        let nonce_proof = value_of(TAG_RNON)
            .and_then(|v| LittleEndianCodec::read(v, 8).filter(|_| v.len() == 8))
            .ok_or_else(|| invalid("unable to read nonce proof"))?;
        let rejected_sequence_number = value_of(TAG_RSEQ)
            .and_then(|v| LittleEndianCodec::read(v, 8).filter(|_| v.len() == 8))
            .ok_or_else(|| invalid("unable to read rejected sequence number"))?;

        let client_address = match value_of(TAG_CADR) {
            None => None,
            Some(v) => Some(Self::parse_client_address(v).ok_or_else(|| {
                invalid("unable to read client address")
            })?),
        };

        Ok(PublicResetPacket { nonce_proof, rejected_sequence_number, client_address })
    }

    fn parse_client_address(bytes: &[u8]) -> Option<SocketAddr> {
        let family = LittleEndianCodec::read(bytes, 2)?;
        let (ip, rest): (IpAddr, &[u8]) = match family {
            2 => {
                let octets: [u8; 4] = bytes.get(2..6)?.try_into().ok()?;
                (IpAddr::V4(Ipv4Addr::from(octets)), bytes.get(6..)?)
            }
            10 => {
                let octets: [u8; 16] = bytes.get(2..18)?.try_into().ok()?;
                (IpAddr::V6(Ipv6Addr::from(octets)), bytes.get(18..)?)
            }
            _ => return None,
        };
        if rest.len() != 2 {
            return None;
        }
        let port = LittleEndianCodec::read(rest, 2)? as u16;
        Some(SocketAddr::new(ip, port))
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Stateless packet serializer.
pub struct PacketBuilder;

impl PacketBuilder {
    /// Serialize a packet header onto `out`.
    pub fn append_header(header: &PacketHeader, out: &mut Vec<u8>) -> Result<()> {
        let mut public_flags = connection_id_length_to_flags(header.connection_id_length);
        public_flags |= header.sequence_number_length.to_flag_bits() << 4;
        if header.version.is_some() {
            public_flags |= PUBLIC_FLAG_VERSION;
        }
        out.push(public_flags);

        let cid_len = header.connection_id_length.len();
        if cid_len > 0 {
            let wire = if cid_len == 8 {
                header.connection_id
            } else {
                header.connection_id & ((1u64 << (8 * cid_len)) - 1)
            };
            push_uint(out, wire, cid_len);
        }
        if let Some(version) = header.version {
            push_uint(out, version.to_tag() as u64, 4);
        }

        let wire_seq = number::truncate(header.sequence_number, header.sequence_number_length);
        push_uint(out, wire_seq, header.sequence_number_length.len());

        let mut private_flags = 0u8;
        if header.entropy_flag {
            private_flags |= PRIVATE_FLAG_ENTROPY;
        }
        if header.fec_flag {
            private_flags |= PRIVATE_FLAG_FEC;
        }
        if header.fec_group.is_some() {
            private_flags |= PRIVATE_FLAG_FEC_GROUP;
        }
        out.push(private_flags);

        if let Some(group) = header.fec_group {
            let offset = header.sequence_number.checked_sub(group).ok_or_else(|| {
                Error::new(QuicErrorCode::InternalError, "fec group ahead of packet")
            })?;
            if offset > u8::MAX as u64 {
                return Err(Error::new(
                    QuicErrorCode::InternalError,
                    "fec group offset exceeds one byte",
                ));
            }
            out.push(offset as u8);
        }
        Ok(())
    }

    /// Build and seal a complete data packet.
    ///
    /// Fails with `PacketTooLarge` when the frames cannot fit `budget`
    /// bytes; an oversized ack frame truncates itself instead.
    pub fn build_data_packet(
        header: &PacketHeader,
        frames: &[Frame],
        budget: usize,
        entropy_calculator: &dyn ReceivedEntropyCalculator,
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
    ) -> Result<Bytes> {
        let mut out = Vec::with_capacity(budget);
        Self::append_header(header, &mut out)?;
        let header_len = out.len();

        let mut payload = Vec::with_capacity(budget.saturating_sub(header_len));
        for (i, frame) in frames.iter().enumerate() {
            let last = i == frames.len() - 1;
            let remaining = budget
                .checked_sub(header_len + payload.len())
                .ok_or_else(|| Error::new(QuicErrorCode::PacketTooLarge, "frames exceed budget"))?;
            if !matches!(frame, Frame::Ack(_))
                && FrameEncoder::size(frame, header.sequence_number_length, last) > remaining
            {
                return Err(Error::new(QuicErrorCode::PacketTooLarge, "frames exceed budget"));
            }
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

        codec.seal(level, header.sequence_number, &out[..header_len], &mut payload)?;
        out.extend_from_slice(&payload);
        if out.len() > budget {
            return Err(Error::new(QuicErrorCode::PacketTooLarge, "sealed packet exceeds budget"));
        }
        Ok(Bytes::from(out))
    }

    /// Build and seal a FEC packet carrying `redundancy`.
    pub fn build_fec_packet(
        header: &PacketHeader,
        redundancy: &[u8],
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
    ) -> Result<Bytes> {
        debug_assert!(header.fec_flag && header.fec_group.is_some());
        let mut out = Vec::new();
        Self::append_header(header, &mut out)?;
        let header_len = out.len();
        let mut payload = redundancy.to_vec();
        codec.seal(level, header.sequence_number, &out[..header_len], &mut payload)?;
        out.extend_from_slice(&payload);
        Ok(Bytes::from(out))
    }

    /// Build a cleartext version negotiation packet (server side).
    pub fn build_version_negotiation(
        connection_id: ConnectionId,
        versions: &[QuicVersion],
    ) -> Bytes {
        let mut out = Vec::with_capacity(9 + 4 * versions.len());
        out.push(PUBLIC_FLAG_VERSION | connection_id_length_to_flags(ConnectionIdLength::EightBytes));
        push_uint(&mut out, connection_id, 8);
        for version in versions {
            push_uint(&mut out, version.to_tag() as u64, 4);
        }
        Bytes::from(out)
    }

    /// Build a cleartext public reset packet.
    pub fn build_public_reset(connection_id: ConnectionId, reset: &PublicResetPacket) -> Bytes {
        let mut out = Vec::new();
        out.push(PUBLIC_FLAG_RESET | connection_id_length_to_flags(ConnectionIdLength::EightBytes));
        push_uint(&mut out, connection_id, 8);
        push_uint(&mut out, TAG_PRST as u64, 4);

        let mut values: Vec<(u32, Vec<u8>)> = Vec::with_capacity(3);
        let mut fixed = [0u8; 8];
        LittleEndianCodec::write(reset.nonce_proof, 8, &mut fixed).expect("eight byte field");
        values.push((TAG_RNON, fixed.to_vec()));
        LittleEndianCodec::write(reset.rejected_sequence_number, 8, &mut fixed)
            .expect("eight byte field");
        values.push((TAG_RSEQ, fixed.to_vec()));
        if let Some(address) = reset.client_address {
            let mut encoded = Vec::with_capacity(20);
            match address.ip() {
                IpAddr::V4(ip) => {
                    push_uint(&mut encoded, 2, 2);
                    encoded.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    push_uint(&mut encoded, 10, 2);
                    encoded.extend_from_slice(&ip.octets());
                }
            }
            push_uint(&mut encoded, address.port() as u64, 2);
            values.push((TAG_CADR, encoded));
        }

        push_uint(&mut out, values.len() as u64, 2);
        push_uint(&mut out, 0, 2);
        let mut end = 0u32;
        for (tag, value) in &values {
            end += value.len() as u32;
            push_uint(&mut out, *tag as u64, 4);
            push_uint(&mut out, end as u64, 4);
        }
        for (_, value) in &values {
            out.extend_from_slice(value);
        }
        Bytes::from(out)
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
