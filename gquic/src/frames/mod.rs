//! # Frame Layer
//!
//! Frame definitions ([`types`]) and the wire codec for the frame stream of
//! a data packet ([`parse`]).

#![forbid(unsafe_code)]

pub mod parse;
pub mod types;

pub use parse::{FrameDecoder, FrameEncoder, FrameIterator, ReceivedEntropyCalculator};
pub use types::{
    AckFrame, BlockedFrame, ConnectionCloseFrame, Frame, GoAwayFrame, PacketTimestamp,
    RstStreamFrame, StopWaitingFrame, StreamFrame, WindowUpdateFrame, CRYPTO_STREAM_ID,
};
