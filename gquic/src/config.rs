//! # Engine Configuration
//!
//! Per-connection tuning knobs with conservative defaults. Everything here
//! is plain data; the engine reads it once at construction and never
//! mutates it.

#![forbid(unsafe_code)]

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Default maximum packet size in bytes (payload + header, pre-encryption).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1350;

/// Hard ceiling on packet size; larger inbound packets are rejected.
pub const MAX_PACKET_SIZE: usize = 1452;

/// Target packet size for MTU discovery probes.
pub const MTU_DISCOVERY_TARGET_PACKET_SIZE: usize = 1450;

/// Number of MTU probes sent before discovery gives up for good.
pub const MTU_DISCOVERY_ATTEMPTS: u32 = 3;

/// Packet count between the connection start and the first MTU probe; the
/// spacing doubles after every probe.
pub const PACKETS_BETWEEN_MTU_PROBES_BASE: u64 = 100;

/// When the FEC group for an outgoing packet stream closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FecSendPolicy {
    /// Emit the FEC packet as soon as the group closes.
    AnyTrigger,
    /// Hold the closed group until the FEC alarm fires.
    AlarmTrigger,
}

/// Connection engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial maximum packet size; MTU discovery may raise it.
    pub max_packet_size: usize,

    /// Upper bound on packets per FEC group before adaptation.
    pub max_packets_per_fec_group: u8,

    /// FEC emission trigger policy.
    pub fec_send_policy: FecSendPolicy,

    /// Tail-loss-probe budget before falling back to a full RTO.
    pub max_tail_loss_probes: u32,

    /// Close the connection after this long without any network event.
    pub idle_timeout: Duration,

    /// Close the connection after this total age, if set.
    pub overall_timeout: Option<Duration>,

    /// Keepalive ping interval while streams are open.
    pub ping_interval: Duration,

    /// Delayed-ack timer.
    pub delayed_ack_timeout: Duration,

    /// Whether to probe for a larger path MTU.
    pub mtu_discovery_enabled: bool,

    /// MTU probe target size.
    pub mtu_discovery_target: usize,

    /// Bound on tracked missing packets before the connection is closed
    /// with `TooManyOutstandingReceivedPackets`.
    pub max_tracked_missing_packets: usize,

    /// Bound on unacked entries in the retransmission ledger before the
    /// connection is closed with `TooManyOutstandingSentPackets`.
    pub max_outstanding_sent_packets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_packets_per_fec_group: 10,
            fec_send_policy: FecSendPolicy::AnyTrigger,
            max_tail_loss_probes: 2,
            idle_timeout: Duration::from_secs(30),
            overall_timeout: None,
            ping_interval: Duration::from_secs(15),
            delayed_ack_timeout: Duration::from_millis(25),
            mtu_discovery_enabled: false,
            mtu_discovery_target: MTU_DISCOVERY_TARGET_PACKET_SIZE,
            max_tracked_missing_packets: 10_000,
            max_outstanding_sent_packets: 10_000,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_packet_size > MAX_PACKET_SIZE {
            errors.push(format!(
                "max_packet_size {} exceeds hard ceiling {}",
                self.max_packet_size, MAX_PACKET_SIZE
            ));
        }
        if self.max_packet_size < 64 {
            errors.push(format!(
                "max_packet_size {} leaves no room for a header and a frame",
                self.max_packet_size
            ));
        }
        if self.max_packets_per_fec_group == 0 {
            errors.push("max_packets_per_fec_group must be at least 1".to_string());
        }
        if self.mtu_discovery_enabled && self.mtu_discovery_target <= self.max_packet_size {
            errors.push(format!(
                "mtu_discovery_target {} does not exceed max_packet_size {}",
                self.mtu_discovery_target, self.max_packet_size
            ));
        }
        if self.mtu_discovery_target > MAX_PACKET_SIZE {
            errors.push(format!(
                "mtu_discovery_target {} exceeds hard ceiling {}",
                self.mtu_discovery_target, MAX_PACKET_SIZE
            ));
        }
        if self.idle_timeout.is_zero() {
            errors.push("idle_timeout must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
