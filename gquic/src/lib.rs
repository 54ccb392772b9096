//! gquic: legacy-QUIC-style transport protocol engine
//!
//! A sans-IO implementation of a pre-standard QUIC dialect: custom packet
//! framing with truncated sequence numbers, XOR forward-error-correction
//! groups, one-bit entropy hashes, tail-loss probes and retransmission
//! timeouts, path MTU discovery, and tag-value public reset / version
//! negotiation packets.
//!
//! # Architecture
//!
//! - **Pure state machine**: the engine consumes datagrams and `Instant`s
//!   and produces datagrams and events; clocks, sockets and timers live
//!   outside.
//! - **Single-owner state**: one [`connection::ConnectionEngine`] per
//!   connection owns the retransmission ledger, FEC groups and entropy
//!   trackers; no internal locking.
//! - **Injected strategies**: congestion control and loss detection are
//!   trait objects handed in at construction; reference implementations
//!   ship for defaults and tests.
//! - **Owned frames**: parsed frames carry `bytes::Bytes` payloads, so
//!   retransmission queues never borrow from packet buffers.
//!
//! # Module Organization
//!
//! - `packet`: header codec, sequence numbers, packet creator, FEC groups
//! - `frames`: frame types and the frame-stream codec
//! - `connection`: the per-connection engine, alarms, received-packet state
//! - `recovery`: retransmission ledger, loss detection, congestion seam
//! - `entropy`: sent/received entropy hash tracking

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod entropy;
pub mod error;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod types;
pub mod version;

pub use config::{EngineConfig, FecSendPolicy};
pub use connection::{
    AlarmKind, CloseSource, ConnectionEngine, ConnectionEvent, ConnectionState, ConnectionStats,
    PacketWriter, WriteResult,
};
pub use error::{Error, QuicErrorCode, Result};
pub use frames::Frame;
pub use packet::creator::{EntropyFlagSource, FixedEntropySource, RandomEntropySource};
pub use packet::parser::{PacketParser, Perspective, PublicResetPacket};
pub use packet::{
    EncryptionLevel, NullPacketCodec, PacketCodec, PacketHeader, SerializedPacket,
};
pub use recovery::{LossDetection, SendAlgorithm};
pub use types::{ConnectionId, Instant, SequenceNumber};
pub use version::QuicVersion;
