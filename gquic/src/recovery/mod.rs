//! Retransmission ledger, loss detection and the congestion-control seam.

#![forbid(unsafe_code)]

mod rtt;
pub mod congestion;
pub mod loss;

pub use congestion::{FixedWindowFactory, FixedWindowSender, SendAlgorithm, SendAlgorithmFactory};
pub use loss::{
    LossDetection, NackThresholdDetector, SentPacketLedger, SentPacketRecord, NACKS_BEFORE_LOSS,
};
pub use rtt::{RttEstimator, INITIAL_RTT, MAX_RETRANSMISSION_TIME, MIN_RETRANSMISSION_TIME};
