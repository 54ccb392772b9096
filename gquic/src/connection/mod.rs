//! # Connection Engine
//!
//! The per-connection state machine. One engine instance owns everything a
//! connection needs (packet creator and parser, retransmission ledger,
//! entropy trackers, FEC groups, alarms) and is driven entirely from the
//! outside: inbound datagrams arrive through [`ConnectionEngine::on_packet`],
//! time arrives through [`ConnectionEngine::on_alarm`], and transport
//! writability through [`ConnectionEngine::on_can_write`]. All calls are
//! serialized by the caller; the engine never blocks and holds no locks.
//!
//! Congestion control and loss detection are injected strategies; the
//! engine feeds them events and obeys their answers.

#![forbid(unsafe_code)]

pub mod alarms;
pub mod received;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::{EngineConfig, FecSendPolicy, MTU_DISCOVERY_ATTEMPTS, PACKETS_BETWEEN_MTU_PROBES_BASE};
use crate::entropy::SentEntropyTracker;
use crate::error::{Error, QuicErrorCode, Result};
use crate::frames::{
    AckFrame, BlockedFrame, ConnectionCloseFrame, Frame, FrameDecoder, GoAwayFrame,
    RstStreamFrame, StopWaitingFrame, StreamFrame, WindowUpdateFrame, CRYPTO_STREAM_ID,
};
use crate::packet::creator::{EntropyFlagSource, PacketCreator};
use crate::packet::fec::FecReceiveGroup;
use crate::packet::parser::{PacketBuilder, PacketParser, ParsedPacket, Perspective};
use crate::packet::{EncryptionLevel, PacketCodec, PacketHeader, SerializedPacket};
use crate::recovery::{LossDetection, RttEstimator, SendAlgorithm, SentPacketLedger, SentPacketRecord};
use crate::types::{ConnectionId, Instant, SequenceNumber};
use crate::version::{highest_common_version, QuicVersion, SUPPORTED_VERSIONS};

pub use alarms::{AlarmKind, AlarmSet, ALL_ALARMS};
pub use received::{ReceiptOutcome, ReceivedPacketManager};

/// Floor for the tail-loss-probe delay.
const MIN_TAIL_LOSS_PROBE_TIMEOUT: core::time::Duration = core::time::Duration::from_millis(10);

/// Upper bound on simultaneously tracked inbound FEC groups.
const MAX_TRACKED_FEC_GROUPS: usize = 50;

// ============================================================================
// Collaborator interfaces
// ============================================================================

/// Result of handing one packet to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Bytes accepted.
    Ok(usize),
    /// Transport is full; the engine buffers the packet verbatim and
    /// resends it after [`ConnectionEngine::on_can_write`].
    Blocked,
    /// Hard failure; the connection closes with `PacketWriteError`.
    Err(i32),
}

/// Transport sink for serialized packets.
pub trait PacketWriter: Send {
    fn write_packet(&mut self, packet: &[u8]) -> WriteResult;
}

// ============================================================================
// States, events, stats
// ============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; handshake not yet confirmed.
    Idle,
    /// Handshake confirmed; full service.
    Established,
    /// Tearing down: the close frame is on its way out.
    Closing,
    /// Dead. Every alarm is cancelled; no further side effects.
    Closed,
}

/// Who ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    Local,
    Peer,
    /// An unauthenticated public reset packet.
    Reset,
}

/// Observable connection activity, drained via
/// [`ConnectionEngine::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StreamFrame(StreamFrame),
    StreamReset(RstStreamFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    PingReceived,
    VersionNegotiated(QuicVersion),
    /// A missing packet was reconstructed from FEC redundancy.
    PacketRevived(SequenceNumber),
    /// An MTU probe was acked; the packet size ceiling rose.
    MtuRaised(usize),
    Closed { error: QuicErrorCode, reason: String, source: CloseSource },
}

/// Connection counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub duplicate_packets: u64,
    pub packets_retransmitted: u64,
    pub tlp_count: u64,
    pub rto_count: u64,
    pub fec_packets_sent: u64,
    pub packets_revived: u64,
    pub acks_sent: u64,
    pub packets_queued: u64,
    pub version_negotiation_packets_sent: u64,
}

// ============================================================================
// MTU discovery state
// ============================================================================

#[derive(Debug)]
struct MtuDiscovery {
    enabled: bool,
    target: usize,
    probes_sent: u32,
    /// Total-packets-sent threshold that triggers the next probe.
    next_probe_at: u64,
    /// Sequence numbers of unacked probes, with their probed size.
    outstanding: BTreeMap<SequenceNumber, usize>,
    /// Set permanently once a probe is acked or the attempt budget is
    /// exhausted.
    finished: bool,
}

impl MtuDiscovery {
    fn new(enabled: bool, target: usize) -> Self {
        Self {
            enabled,
            target,
            probes_sent: 0,
            next_probe_at: PACKETS_BETWEEN_MTU_PROBES_BASE,
            outstanding: BTreeMap::new(),
            finished: false,
        }
    }

    fn probing_active(&self) -> bool {
        self.enabled && !self.finished
    }

    fn on_probe_sent(&mut self, sequence_number: SequenceNumber) {
        self.outstanding.insert(sequence_number, self.target);
        self.probes_sent += 1;
        if self.probes_sent >= MTU_DISCOVERY_ATTEMPTS {
            self.finished = true;
        } else {
            // Probes at packet counts base*(2^(n+1)-1): 100, 300, 700, ...
            self.next_probe_at =
                PACKETS_BETWEEN_MTU_PROBES_BASE * ((1u64 << (self.probes_sent + 1)) - 1);
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The per-connection protocol engine.
pub struct ConnectionEngine {
    config: EngineConfig,
    perspective: Perspective,
    connection_id: ConnectionId,
    state: ConnectionState,
    version: QuicVersion,
    /// The peer confirmed our version; stop sending the tag.
    version_confirmed: bool,
    /// A version negotiation packet is only acceptable before any other
    /// packet.
    regular_packet_processed: bool,
    /// Bad version tags already answered with a negotiation packet.
    vn_tags_answered: BTreeSet<u32>,

    creation_time: Instant,
    last_network_activity: Instant,

    creator: PacketCreator,
    parser: PacketParser,
    codec: Box<dyn PacketCodec>,
    send_level: EncryptionLevel,
    recv_level: EncryptionLevel,

    writer: Box<dyn PacketWriter>,
    write_blocked: bool,
    queued_packets: VecDeque<SerializedPacket>,

    send_algorithm: Box<dyn SendAlgorithm>,
    loss_detection: Box<dyn LossDetection>,
    rtt: RttEstimator,
    ledger: SentPacketLedger,
    sent_entropy: SentEntropyTracker,
    received: ReceivedPacketManager,
    fec_groups: BTreeMap<SequenceNumber, FecReceiveGroup>,
    fec_protection_enabled: bool,

    alarms: AlarmSet,
    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,

    has_open_streams: bool,
    /// Ack-eliciting packets received since the last ack went out.
    ack_eliciting_since_ack: u32,
    consecutive_tlp_count: u32,
    consecutive_rto_count: u32,
    mtu: MtuDiscovery,
}

impl ConnectionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        perspective: Perspective,
        connection_id: ConnectionId,
        version: QuicVersion,
        codec: Box<dyn PacketCodec>,
        writer: Box<dyn PacketWriter>,
        send_algorithm: Box<dyn SendAlgorithm>,
        loss_detection: Box<dyn LossDetection>,
        entropy_source: Box<dyn EntropyFlagSource>,
        now: Instant,
    ) -> Self {
        let creator = PacketCreator::new(
            connection_id,
            // Servers never send the version tag; clients do until the
            // version is confirmed.
            (perspective == Perspective::Client).then_some(version),
            config.max_packet_size,
            config.max_packets_per_fec_group,
            entropy_source,
        );
        let mut engine = Self {
            perspective,
            connection_id,
            state: ConnectionState::Idle,
            version,
            version_confirmed: false,
            regular_packet_processed: false,
            vn_tags_answered: BTreeSet::new(),
            creation_time: now,
            last_network_activity: now,
            creator,
            parser: PacketParser::new(perspective, connection_id),
            codec,
            send_level: EncryptionLevel::None,
            recv_level: EncryptionLevel::None,
            writer,
            write_blocked: false,
            queued_packets: VecDeque::new(),
            send_algorithm,
            loss_detection,
            rtt: RttEstimator::default(),
            ledger: SentPacketLedger::new(),
            sent_entropy: SentEntropyTracker::new(),
            received: ReceivedPacketManager::new(now, config.max_tracked_missing_packets),
            fec_groups: BTreeMap::new(),
            fec_protection_enabled: false,
            alarms: AlarmSet::new(),
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            has_open_streams: false,
            ack_eliciting_since_ack: 0,
            consecutive_tlp_count: 0,
            consecutive_rto_count: 0,
            mtu: MtuDiscovery::new(config.mtu_discovery_enabled, config.mtu_discovery_target),
            config,
        };
        engine.arm_timeout_alarm(now);
        engine
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn version(&self) -> QuicVersion {
        self.version
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn max_packet_length(&self) -> usize {
        self.creator.max_packet_length()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Earliest pending alarm, for the external scheduler.
    pub fn next_alarm_deadline(&self) -> Option<(AlarmKind, Instant)> {
        self.alarms.next_deadline()
    }

    #[cfg(test)]
    pub(crate) fn alarms(&self) -> &AlarmSet {
        &self.alarms
    }

    /// Drain the next observable event.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Serialized packets waiting on congestion or transport space.
    pub fn has_queued_data(&self) -> bool {
        !self.queued_packets.is_empty()
    }

    /// Hint for the keepalive ping: re-armed after every sent packet while
    /// streams are open.
    pub fn set_has_open_streams(&mut self, open: bool) {
        self.has_open_streams = open;
    }

    /// Turn on FEC protection for subsequently sent packets.
    pub fn set_fec_protection(&mut self, enabled: bool) {
        self.fec_protection_enabled = enabled;
    }

    /// The handshake layer confirmed the connection: raise the encryption
    /// level and stop advertising the version.
    pub fn on_handshake_complete(&mut self, _now: Instant) {
        self.state = ConnectionState::Established;
        self.send_level = EncryptionLevel::ForwardSecure;
        self.recv_level = EncryptionLevel::ForwardSecure;
        self.version_confirmed = true;
        self.creator.clear_version_flag();
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Queue stream data for transmission.
    pub fn send_stream_data(
        &mut self,
        stream_id: u32,
        offset: u64,
        fin: bool,
        data: Bytes,
        now: Instant,
    ) -> Result<()> {
        self.send_frames(vec![Frame::Stream(StreamFrame { stream_id, fin, offset, data })], now)
    }

    /// Pack frames into packets and hand them to the transport.
    ///
    /// Frames of the crypto stream bypass congestion gating. Oversized
    /// stream frames are split across packets; any other frame must fit a
    /// packet on its own.
    pub fn send_frames(&mut self, frames: Vec<Frame>, now: Instant) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::new(QuicErrorCode::InternalError, "send on a closed connection"));
        }

        let wants_fec = self.fec_protection_enabled
            && frames.iter().any(|f| f.is_retransmittable());
        if wants_fec && !self.creator.has_open_fec_group() && !self.creator.has_pending_frames() {
            self.creator.maybe_start_fec_group()?;
        }

        for frame in frames {
            match frame {
                Frame::Stream(stream) => self.add_stream_frame(stream, now)?,
                other => {
                    if !self.creator.add_frame(other.clone()) {
                        self.flush_pending(now)?;
                        if !self.creator.add_frame(other) {
                            return Err(Error::new(
                                QuicErrorCode::InternalError,
                                "frame does not fit an empty packet",
                            ));
                        }
                    }
                }
            }
            self.maybe_close_full_fec_group(now)?;
        }
        self.flush_pending(now)?;
        self.maybe_emit_fec(false, now)
    }

    fn add_stream_frame(&mut self, frame: StreamFrame, now: Instant) -> Result<()> {
        let mut offset = frame.offset;
        let mut data = frame.data;
        loop {
            let chunk_frame = StreamFrame {
                stream_id: frame.stream_id,
                fin: frame.fin && data.is_empty(),
                offset,
                data: Bytes::new(),
            };
            // How much of the remaining data fits this packet.
            let overhead = crate::frames::FrameEncoder::stream_frame_overhead(
                frame.stream_id,
                offset,
                false,
            );
            let free = self.creator.bytes_free();
            if free < overhead + 1 && !data.is_empty() {
                self.flush_pending(now)?;
                self.maybe_close_full_fec_group(now)?;
                continue;
            }
            let chunk_len = data.len().min(free.saturating_sub(overhead));
            let chunk = StreamFrame {
                fin: frame.fin && chunk_len == data.len(),
                offset,
                data: data.split_to(chunk_len),
                ..chunk_frame
            };
            let added = self.creator.add_frame(Frame::Stream(chunk));
            if !added {
                self.flush_pending(now)?;
                self.maybe_close_full_fec_group(now)?;
                continue;
            }
            offset += chunk_len as u64;
            if data.is_empty() {
                return Ok(());
            }
            self.flush_pending(now)?;
            self.maybe_close_full_fec_group(now)?;
        }
    }

    fn flush_pending(&mut self, now: Instant) -> Result<()> {
        if !self.creator.has_pending_frames() {
            return Ok(());
        }
        let entropy = self.received.entropy();
        let calculator = |seq: SequenceNumber| entropy.cumulative(seq);
        let packet =
            self.creator.flush(None, &*self.codec, self.send_level, &calculator)?;
        self.dispatch(packet, now, false)
    }

    fn maybe_close_full_fec_group(&mut self, now: Instant) -> Result<()> {
        if self.creator.fec_group_is_full() && !self.creator.has_pending_frames() {
            return self.maybe_emit_fec(false, now);
        }
        if self.creator.fec_group_is_full()
            && self.config.fec_send_policy == FecSendPolicy::AlarmTrigger
            && !self.alarms.is_set(AlarmKind::Fec)
        {
            let delay = self.retransmission_delay() / 2;
            self.alarms.set(AlarmKind::Fec, now.saturating_add(delay));
        }
        Ok(())
    }

    fn maybe_emit_fec(&mut self, force: bool, now: Instant) -> Result<()> {
        if !self.creator.should_emit_fec(force, self.config.fec_send_policy) {
            if self.creator.has_open_fec_group()
                && self.config.fec_send_policy == FecSendPolicy::AlarmTrigger
                && !self.alarms.is_set(AlarmKind::Fec)
            {
                let delay = self.retransmission_delay() / 2;
                self.alarms.set(AlarmKind::Fec, now.saturating_add(delay));
            }
            return Ok(());
        }
        let packet = self.creator.serialize_fec(&*self.codec, self.send_level)?;
        self.stats.fec_packets_sent += 1;
        self.alarms.cancel(AlarmKind::Fec);
        self.dispatch(packet, now, false)
    }

    /// Gate, queue or write one serialized packet.
    fn dispatch(
        &mut self,
        packet: SerializedPacket,
        now: Instant,
        bypass_congestion: bool,
    ) -> Result<()> {
        let retransmittable = !packet.retransmittable_frames.is_empty();
        let is_handshake =
            packet.retransmittable_frames.iter().any(Frame::is_handshake);

        if retransmittable
            && !is_handshake
            && !bypass_congestion
            && !self.send_algorithm.can_send(packet.packet.len())
        {
            trace!(
                sequence_number = packet.sequence_number,
                "congestion blocked, queueing packet"
            );
            self.stats.packets_queued += 1;
            self.queued_packets.push_back(packet);
            let delay = self.send_algorithm.time_until_send(now);
            self.alarms.set_min(AlarmKind::Send, now.saturating_add(delay));
            return Ok(());
        }

        if self.write_blocked {
            self.stats.packets_queued += 1;
            self.queued_packets.push_back(packet);
            return Ok(());
        }

        self.write_packet(packet, now)
    }

    /// Write one packet; on transport backpressure the serialized bytes are
    /// kept and retried verbatim.
    fn write_packet(&mut self, packet: SerializedPacket, now: Instant) -> Result<()> {
        match self.writer.write_packet(&packet.packet) {
            WriteResult::Ok(_) => {
                self.on_packet_written(packet, now);
                Ok(())
            }
            WriteResult::Blocked => {
                trace!(sequence_number = packet.sequence_number, "transport write blocked");
                self.write_blocked = true;
                self.queued_packets.push_front(packet);
                Ok(())
            }
            WriteResult::Err(code) => {
                warn!(error = code, "transport write failed");
                self.close_internal(
                    QuicErrorCode::PacketWriteError,
                    "transport write failed".to_string(),
                    CloseSource::Local,
                    false,
                    now,
                );
                Err(Error::new(QuicErrorCode::PacketWriteError, "transport write failed"))
            }
        }
    }

    fn on_packet_written(&mut self, packet: SerializedPacket, now: Instant) {
        let sequence_number = packet.sequence_number;
        let bytes = packet.packet.len();
        let retransmittable = !packet.retransmittable_frames.is_empty();
        let in_flight = retransmittable || packet.is_fec_packet;

        self.sent_entropy.record_sent(sequence_number, packet.entropy_flag);
        self.ledger.on_packet_sent(SentPacketRecord {
            sequence_number,
            sent_time: now,
            bytes,
            encryption_level: self.send_level,
            retransmittable_frames: packet.retransmittable_frames,
            in_flight,
            is_fec_packet: packet.is_fec_packet,
            nack_count: 0,
        });
        self.send_algorithm.on_packet_sent(now, sequence_number, bytes, in_flight);

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.last_network_activity = now;
        self.arm_timeout_alarm(now);

        if in_flight {
            let deadline = now.saturating_add(self.retransmission_delay());
            self.alarms.set_min(AlarmKind::Retransmission, deadline);
        }
        if self.has_open_streams {
            self.alarms.set(AlarmKind::Ping, now.saturating_add(self.config.ping_interval));
        }
        if self.mtu.probing_active()
            && self.stats.packets_sent >= self.mtu.next_probe_at
            && !self.alarms.is_set(AlarmKind::MtuDiscovery)
        {
            self.alarms.set(AlarmKind::MtuDiscovery, now);
        }

        if self.ledger.len() > self.config.max_outstanding_sent_packets {
            self.close_internal(
                QuicErrorCode::TooManyOutstandingSentPackets,
                "retransmission ledger overflow".to_string(),
                CloseSource::Local,
                true,
                now,
            );
        }
    }

    /// The transport became writable again.
    ///
    /// Draining happens on the chained ResumeWrites alarm rather than
    /// synchronously, so the notification callback cannot re-enter the
    /// transport.
    pub fn on_can_write(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.write_blocked = false;
        if !self.queued_packets.is_empty() {
            self.alarms.set(AlarmKind::ResumeWrites, now);
        }
    }

    fn drain_queued_packets(&mut self, now: Instant) {
        while let Some(packet) = self.queued_packets.pop_front() {
            let retransmittable = !packet.retransmittable_frames.is_empty();
            let is_handshake =
                packet.retransmittable_frames.iter().any(Frame::is_handshake);
            if retransmittable
                && !is_handshake
                && !self.send_algorithm.can_send(packet.packet.len())
            {
                let delay = self.send_algorithm.time_until_send(now);
                self.alarms.set_min(AlarmKind::Send, now.saturating_add(delay));
                self.queued_packets.push_front(packet);
                return;
            }
            if self.write_packet(packet, now).is_err() {
                return;
            }
            if self.write_blocked {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one inbound datagram.
    pub fn on_packet(&mut self, bytes: &[u8], now: Instant) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.stats.bytes_received += bytes.len() as u64;

        let parsed = match self.parser.parse(bytes, &*self.codec, self.recv_level) {
            Ok(parsed) => parsed,
            Err(e) if e.code() == QuicErrorCode::DecryptionFailure => {
                // Undecryptable packets are dropped, not fatal: keys may
                // simply not have caught up.
                debug!("dropping undecryptable packet");
                return Ok(());
            }
            Err(e) => {
                self.close_internal(
                    e.code(),
                    e.detail().to_string(),
                    CloseSource::Local,
                    true,
                    now,
                );
                return Err(e);
            }
        };

        self.last_network_activity = now;
        self.arm_timeout_alarm(now);

        match parsed {
            ParsedPacket::VersionNegotiation { version_tags, .. } => {
                self.on_version_negotiation(&version_tags, now)
            }
            ParsedPacket::UnsupportedVersion { version_tag, .. } => {
                self.on_unsupported_version(version_tag, now);
                Ok(())
            }
            ParsedPacket::PublicReset { reset, .. } => {
                debug!(
                    rejected = reset.rejected_sequence_number,
                    "connection reset by public reset packet"
                );
                self.close_internal(
                    QuicErrorCode::PublicReset,
                    "public reset".to_string(),
                    CloseSource::Reset,
                    false,
                    now,
                );
                Ok(())
            }
            ParsedPacket::Fec { header, redundancy } => self.on_fec_packet(header, redundancy, now),
            ParsedPacket::Data { header, frames, payload, level } => {
                self.on_data_packet(header, frames, payload, level, now)
            }
        }
    }

    fn on_version_negotiation(&mut self, tags: &[u32], now: Instant) -> Result<()> {
        // Only clients parse these, and only before any regular packet.
        if self.version_confirmed || self.regular_packet_processed {
            debug!("ignoring late version negotiation packet");
            return Ok(());
        }
        if tags.contains(&self.version.to_tag()) {
            let e = Error::new(
                QuicErrorCode::InvalidVersionNegotiationPacket,
                "peer negotiated the version already in use",
            );
            self.close_internal(e.code(), e.detail().to_string(), CloseSource::Local, false, now);
            return Err(e);
        }
        match highest_common_version(tags) {
            Some(version) => {
                debug!(?version, "version renegotiated");
                self.version = version;
                self.creator.set_version(version);
                self.events.push_back(ConnectionEvent::VersionNegotiated(version));
                Ok(())
            }
            None => {
                let e = Error::new(QuicErrorCode::InvalidVersion, "no common protocol version");
                self.close_internal(
                    e.code(),
                    e.detail().to_string(),
                    CloseSource::Local,
                    false,
                    now,
                );
                Err(e)
            }
        }
    }

    fn on_unsupported_version(&mut self, tag: u32, _now: Instant) {
        if self.perspective != Perspective::Server {
            return;
        }
        // One negotiation packet per distinct bad version bounds the
        // reflection surface.
        if !self.vn_tags_answered.insert(tag) {
            return;
        }
        debug!(tag, "answering unsupported version with negotiation packet");
        let packet =
            PacketBuilder::build_version_negotiation(self.connection_id, &SUPPORTED_VERSIONS);
        // Fire and forget: negotiation packets are not tracked or retried.
        if !matches!(self.writer.write_packet(&packet), WriteResult::Ok(_)) {
            debug!("version negotiation packet dropped by transport");
        }
        self.stats.version_negotiation_packets_sent += 1;
    }

    fn on_fec_packet(&mut self, header: PacketHeader, redundancy: Bytes, now: Instant) -> Result<()> {
        self.regular_packet_processed = true;
        let group_number = match header.fec_group {
            Some(g) => g,
            None => return Ok(()),
        };
        match self.received.record_received(&header, now) {
            Ok(ReceiptOutcome::Ignored) => {
                self.stats.duplicate_packets += 1;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                self.close_internal(
                    e.code(),
                    e.detail().to_string(),
                    CloseSource::Local,
                    true,
                    now,
                );
                return Err(e);
            }
        }
        self.stats.packets_received += 1;

        let group = self
            .fec_groups
            .entry(group_number)
            .or_insert_with(|| FecReceiveGroup::new(group_number));
        group.on_fec_packet(header.sequence_number, &redundancy);
        self.try_revive(group_number, now)?;
        self.schedule_ack(ReceiptOutcome::NewOutOfOrder, false, now);
        Ok(())
    }

    fn try_revive(&mut self, group_number: SequenceNumber, now: Instant) -> Result<()> {
        let Some(group) = self.fec_groups.get(&group_number) else {
            return Ok(());
        };
        if group.is_complete() {
            self.fec_groups.remove(&group_number);
            return Ok(());
        }
        let Some((sequence_number, payload)) = group.revive() else {
            return Ok(());
        };
        self.fec_groups.remove(&group_number);

        debug!(sequence_number, group = group_number, "revived packet from fec redundancy");
        self.stats.packets_revived += 1;
        self.received.record_revived(sequence_number);
        self.events.push_back(ConnectionEvent::PacketRevived(sequence_number));

        // Parse the reconstructed payload as a frame stream; trailing
        // padding from the XOR length is harmless.
        let synthetic_header = PacketHeader {
            connection_id: self.connection_id,
            connection_id_length: crate::types::ConnectionIdLength::EightBytes,
            version: None,
            sequence_number,
            sequence_number_length: crate::types::SequenceNumberLength::Six,
            entropy_flag: false,
            fec_flag: false,
            fec_group: Some(group_number),
        };
        match FrameDecoder::new(&synthetic_header).decode_all(&payload) {
            Ok(frames) => self.process_frames(&synthetic_header, frames, self.recv_level, now),
            Err(e) => {
                debug!(error = %e, "revived payload did not parse; dropping");
                Ok(())
            }
        }
    }

    fn on_data_packet(
        &mut self,
        header: PacketHeader,
        frames: Vec<Frame>,
        payload: Bytes,
        level: EncryptionLevel,
        now: Instant,
    ) -> Result<()> {
        self.regular_packet_processed = true;
        if self.perspective == Perspective::Client {
            // Any regular packet from the server confirms our version.
            self.version_confirmed = true;
            self.creator.clear_version_flag();
        }

        match self.received.record_received(&header, now) {
            Ok(ReceiptOutcome::Ignored) => {
                self.stats.duplicate_packets += 1;
                return Ok(());
            }
            Ok(outcome) => {
                self.stats.packets_received += 1;
                if let Some(group_number) = header.fec_group {
                    let group = self
                        .fec_groups
                        .entry(group_number)
                        .or_insert_with(|| FecReceiveGroup::new(group_number));
                    group.on_data_packet(header.sequence_number, &payload);
                    self.try_revive(group_number, now)?;
                    if self.fec_groups.len() > MAX_TRACKED_FEC_GROUPS {
                        let oldest = *self.fec_groups.keys().next().expect("non-empty");
                        self.fec_groups.remove(&oldest);
                    }
                }
                let ack_eliciting = frames.iter().any(Frame::is_retransmittable);
                self.process_frames(&header, frames, level, now)?;
                if self.state != ConnectionState::Closed {
                    self.schedule_ack(outcome, ack_eliciting, now);
                }
                Ok(())
            }
            Err(e) => {
                self.close_internal(
                    e.code(),
                    e.detail().to_string(),
                    CloseSource::Local,
                    true,
                    now,
                );
                Err(e)
            }
        }
    }

    fn process_frames(
        &mut self,
        _header: &PacketHeader,
        frames: Vec<Frame>,
        level: EncryptionLevel,
        now: Instant,
    ) -> Result<()> {
        for frame in frames {
            match frame {
                Frame::Padding => {}
                Frame::Stream(stream) => {
                    self.check_stream_encryption(&stream, level, now)?;
                    self.events.push_back(ConnectionEvent::StreamFrame(stream));
                }
                Frame::Ack(ack) => self.process_ack(&ack, now)?,
                Frame::StopWaiting(stop_waiting) => {
                    if let Err(e) = self.received.on_stop_waiting(&stop_waiting) {
                        self.close_internal(
                            e.code(),
                            e.detail().to_string(),
                            CloseSource::Local,
                            true,
                            now,
                        );
                        return Err(e);
                    }
                }
                Frame::Ping => self.events.push_back(ConnectionEvent::PingReceived),
                Frame::RstStream(rst) => {
                    self.events.push_back(ConnectionEvent::StreamReset(rst))
                }
                Frame::ConnectionClose(close) => {
                    debug!(code = ?close.error_code, reason = %close.reason, "peer closed connection");
                    self.close_internal(
                        close.error_code,
                        close.reason,
                        CloseSource::Peer,
                        false,
                        now,
                    );
                    return Ok(());
                }
                Frame::GoAway(goaway) => {
                    self.events.push_back(ConnectionEvent::GoAway(goaway))
                }
                Frame::WindowUpdate(wu) => {
                    self.events.push_back(ConnectionEvent::WindowUpdate(wu))
                }
                Frame::Blocked(blocked) => {
                    self.events.push_back(ConnectionEvent::Blocked(blocked))
                }
                Frame::MtuDiscovery => {}
            }
        }
        Ok(())
    }

    fn check_stream_encryption(
        &mut self,
        stream: &StreamFrame,
        level: EncryptionLevel,
        now: Instant,
    ) -> Result<()> {
        let cleartext = level == EncryptionLevel::None;
        let violation = if self.state == ConnectionState::Established {
            // After the handshake nothing may arrive in cleartext, the
            // crypto stream included.
            cleartext
        } else {
            // During the handshake only the crypto stream may be cleartext.
            cleartext && stream.stream_id != CRYPTO_STREAM_ID
        };
        if violation {
            let e = Error::new(
                QuicErrorCode::UnencryptedStreamData,
                "unencrypted stream data where encryption is required",
            );
            self.close_internal(e.code(), e.detail().to_string(), CloseSource::Local, true, now);
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ack processing
    // ------------------------------------------------------------------

    fn process_ack(&mut self, ack: &AckFrame, now: Instant) -> Result<()> {
        if ack.largest_observed > self.creator.sequence_number() {
            let e = Error::new(QuicErrorCode::InvalidAckData, "ack references an unsent packet");
            self.close_internal(e.code(), e.detail().to_string(), CloseSource::Local, true, now);
            return Err(e);
        }
        // Revived packets never contributed to the peer's received
        // entropy, so they are excluded exactly like missing ones.
        if !self.sent_entropy.is_valid_entropy(
            ack.largest_observed,
            ack.missing_packets.iter().chain(ack.revived_packets.iter()),
            ack.entropy_hash,
        ) {
            let e = Error::new(QuicErrorCode::InvalidAckData, "ack entropy hash mismatch");
            self.close_internal(e.code(), e.detail().to_string(), CloseSource::Local, true, now);
            return Err(e);
        }

        // RTT from the largest newly acked packet.
        let mut rtt_updated = false;
        if let Some(record) = self.ledger.get(ack.largest_observed) {
            if !ack.missing_packets.contains(&ack.largest_observed) {
                let sample = now.saturating_duration_since(record.sent_time);
                self.rtt.update(sample, ack.delta_time);
                rtt_updated = true;
            }
        }

        // Everything at or below largest_observed and not missing is acked.
        let acked: Vec<SequenceNumber> = self
            .ledger
            .iter()
            .map(|p| p.sequence_number)
            .filter(|&seq| seq <= ack.largest_observed && !ack.missing_packets.contains(&seq))
            .collect();

        let mut acked_bytes = 0usize;
        let mut newly_acked = false;
        for seq in acked {
            if let Some(record) = self.ledger.on_packet_acked(seq) {
                newly_acked = true;
                if record.in_flight {
                    acked_bytes += record.bytes;
                }
                if let Some(size) = self.mtu.outstanding.remove(&seq) {
                    debug!(new_size = size, "mtu probe acknowledged");
                    self.mtu.finished = true;
                    self.creator.set_max_packet_length(size);
                    self.events.push_back(ConnectionEvent::MtuRaised(size));
                }
            }
        }
        if newly_acked {
            self.consecutive_tlp_count = 0;
            self.consecutive_rto_count = 0;
        }

        // Count nacks, then ask the loss strategy for its verdict.
        self.ledger.record_nacks(ack.largest_observed, ack.missing_packets.iter());
        let lost = self.loss_detection.detect_lost_packets(
            &self.ledger,
            ack.largest_observed,
            &self.rtt,
            now,
        );
        let mut lost_bytes = 0usize;
        let mut frames_to_retransmit: Vec<Vec<Frame>> = Vec::new();
        for seq in lost {
            if let Some(record) = self.ledger.on_packet_lost(seq) {
                debug!(sequence_number = seq, "packet declared lost");
                if record.in_flight {
                    lost_bytes += record.bytes;
                }
                // The FEC packet itself is never retransmitted.
                if !record.is_fec_packet && record.is_retransmittable() {
                    frames_to_retransmit.push(record.retransmittable_frames);
                }
            }
        }

        self.send_algorithm.on_congestion_event(
            rtt_updated,
            acked_bytes,
            lost_bytes,
            self.ledger.bytes_in_flight(),
        );

        for frames in frames_to_retransmit {
            self.stats.packets_retransmitted += 1;
            self.send_frames(frames, now)?;
        }

        // Ledger floor moved: prune entropy and adapt the wire lengths.
        let least_unacked = self.least_unacked();
        self.sent_entropy.clear_below(least_unacked);
        let max_packets_in_flight =
            (self.send_algorithm.congestion_window() / self.creator.max_packet_length().max(1))
                as u64;
        self.creator.update_sequence_number_length(least_unacked, max_packets_in_flight);
        if self.fec_protection_enabled {
            let adaptive = (max_packets_in_flight / 2).clamp(2, 255) as u8;
            self.creator.set_max_packets_per_fec_group(adaptive);
        }

        // Re-arm or clear the retransmission alarm.
        if self.ledger.iter().any(|p| p.in_flight && p.is_retransmittable()) {
            let deadline = now.saturating_add(self.retransmission_delay());
            self.alarms.set(AlarmKind::Retransmission, deadline);
        } else {
            self.alarms.cancel(AlarmKind::Retransmission);
        }
        Ok(())
    }

    fn least_unacked(&self) -> SequenceNumber {
        self.ledger.least_unacked().unwrap_or(self.creator.sequence_number() + 1)
    }

    // ------------------------------------------------------------------
    // Acks out
    // ------------------------------------------------------------------

    fn schedule_ack(&mut self, outcome: ReceiptOutcome, ack_eliciting: bool, now: Instant) {
        if ack_eliciting {
            self.ack_eliciting_since_ack += 1;
        }
        let immediate = outcome == ReceiptOutcome::NewOutOfOrder
            || self.ack_eliciting_since_ack >= 2;
        if immediate {
            if let Err(e) = self.send_ack(now) {
                debug!(error = %e, "failed to send immediate ack");
            }
        } else if ack_eliciting && !self.alarms.is_set(AlarmKind::Ack) {
            self.alarms
                .set(AlarmKind::Ack, now.saturating_add(self.config.delayed_ack_timeout));
        }
    }

    fn send_ack(&mut self, now: Instant) -> Result<()> {
        self.alarms.cancel(AlarmKind::Ack);
        self.ack_eliciting_since_ack = 0;

        let ack = self.received.build_ack(now);
        let least_unacked = self.least_unacked();
        let stop_waiting = StopWaitingFrame {
            entropy_hash: self.sent_entropy.cumulative(least_unacked.saturating_sub(1)),
            least_unacked,
        };
        self.stats.acks_sent += 1;
        self.send_frames(vec![Frame::Ack(ack), Frame::StopWaiting(stop_waiting)], now)
    }

    // ------------------------------------------------------------------
    // Alarms
    // ------------------------------------------------------------------

    /// External scheduler entry point: fire one alarm.
    ///
    /// Stale fires (alarm re-armed or cancelled since scheduling) are
    /// no-ops.
    pub fn on_alarm(&mut self, kind: AlarmKind, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if !self.alarms.take_if_due(kind, now) {
            return;
        }
        match kind {
            AlarmKind::Ack => {
                if let Err(e) = self.send_ack(now) {
                    debug!(error = %e, "delayed ack failed");
                }
            }
            AlarmKind::Retransmission => self.on_retransmission_alarm(now),
            AlarmKind::Fec => {
                if let Err(e) = self.maybe_emit_fec(true, now) {
                    debug!(error = %e, "fec alarm emit failed");
                }
            }
            AlarmKind::Ping => {
                if self.has_open_streams {
                    if let Err(e) = self.send_frames(vec![Frame::Ping], now) {
                        debug!(error = %e, "keepalive ping failed");
                    }
                }
            }
            AlarmKind::Timeout => self.on_timeout_alarm(now),
            AlarmKind::Send | AlarmKind::ResumeWrites => self.drain_queued_packets(now),
            AlarmKind::MtuDiscovery => self.send_mtu_probe(now),
        }
    }

    fn retransmission_delay(&self) -> core::time::Duration {
        if self.consecutive_tlp_count < self.config.max_tail_loss_probes
            && self.config.max_tail_loss_probes > 0
        {
            // Tail loss probe: a fraction of an RTO.
            (2 * self.rtt.smoothed_rtt()).max(MIN_TAIL_LOSS_PROBE_TIMEOUT)
        } else {
            let base = self.send_algorithm.retransmission_delay(&self.rtt);
            base.saturating_mul(1 << self.consecutive_rto_count.min(16))
        }
    }

    fn on_retransmission_alarm(&mut self, now: Instant) {
        if !self.ledger.iter().any(|p| p.in_flight && p.is_retransmittable()) {
            return;
        }

        if self.consecutive_tlp_count < self.config.max_tail_loss_probes {
            // Tail loss probe: one copy of the oldest unacked
            // retransmittable packet, without a full timeout.
            self.consecutive_tlp_count += 1;
            self.stats.tlp_count += 1;
            let probe_frames = self.take_oldest_retransmittable_frames();
            debug!(probe = self.consecutive_tlp_count, "sending tail loss probe");
            if let Some(frames) = probe_frames {
                self.stats.packets_retransmitted += 1;
                if let Err(e) = self.send_frames(frames, now) {
                    debug!(error = %e, "tail loss probe failed");
                }
            }
        } else {
            // Full RTO.
            self.consecutive_rto_count += 1;
            self.stats.rto_count += 1;
            debug!(backoff = self.consecutive_rto_count, "retransmission timeout");

            let mut frames_to_retransmit: Vec<Vec<Frame>> = Vec::new();
            let in_flight: Vec<SequenceNumber> = self
                .ledger
                .iter()
                .filter(|p| p.in_flight && p.is_retransmittable() && !p.is_fec_packet)
                .map(|p| p.sequence_number)
                .collect();
            for seq in in_flight {
                if let Some(frames) = self.ledger.take_retransmittable_frames(seq) {
                    frames_to_retransmit.push(frames);
                }
            }
            // Everything in flight, the FEC packet included, stops
            // counting toward the window.
            self.ledger.mark_all_not_in_flight();
            self.send_algorithm.on_retransmission_timeout(!frames_to_retransmit.is_empty());
            for frames in frames_to_retransmit {
                self.stats.packets_retransmitted += 1;
                if let Err(e) = self.send_frames(frames, now) {
                    debug!(error = %e, "rto retransmission failed");
                    break;
                }
            }
        }

        if self.state != ConnectionState::Closed
            && self.ledger.iter().any(|p| p.in_flight && p.is_retransmittable())
        {
            let deadline = now.saturating_add(self.retransmission_delay());
            self.alarms.set(AlarmKind::Retransmission, deadline);
        }
    }

    /// Strip and return the retransmittable frames of the oldest packet
    /// still carrying any; the record itself stays in the ledger awaiting
    /// its ack.
    fn take_oldest_retransmittable_frames(&mut self) -> Option<Vec<Frame>> {
        let seq = self.ledger.oldest_retransmittable()?.sequence_number;
        self.ledger.take_retransmittable_frames(seq)
    }

    fn on_timeout_alarm(&mut self, now: Instant) {
        let idle_deadline = self.last_network_activity.saturating_add(self.config.idle_timeout);
        if now >= idle_deadline {
            self.close_internal(
                QuicErrorCode::ConnectionTimedOut,
                "no network activity".to_string(),
                CloseSource::Local,
                true,
                now,
            );
            return;
        }
        if let Some(overall) = self.config.overall_timeout {
            let overall_deadline = self.creation_time.saturating_add(overall);
            if now >= overall_deadline {
                self.close_internal(
                    QuicErrorCode::OverallTimedOut,
                    "connection exceeded its maximum lifetime".to_string(),
                    CloseSource::Local,
                    true,
                    now,
                );
                return;
            }
        }
        self.arm_timeout_alarm(now);
    }

    fn arm_timeout_alarm(&mut self, _now: Instant) {
        let mut deadline = self.last_network_activity.saturating_add(self.config.idle_timeout);
        if let Some(overall) = self.config.overall_timeout {
            deadline = deadline.min(self.creation_time.saturating_add(overall));
        }
        self.alarms.set(AlarmKind::Timeout, deadline);
    }

    fn send_mtu_probe(&mut self, now: Instant) {
        if !self.mtu.probing_active() {
            return;
        }
        if self.creator.has_pending_frames() || self.creator.has_open_fec_group() {
            // A probe cannot share a packet or a group; try again shortly.
            self.alarms.set(AlarmKind::MtuDiscovery, now.saturating_add(
                core::time::Duration::from_millis(1),
            ));
            return;
        }

        let target = self.mtu.target;
        let previous_max = self.creator.max_packet_length();
        self.creator.set_max_packet_length(target);
        let entropy = self.received.entropy();
        let calculator = |seq: SequenceNumber| entropy.cumulative(seq);
        let probe = if self.creator.add_frame(Frame::MtuDiscovery) {
            self.creator.flush(Some(target), &*self.codec, self.send_level, &calculator)
        } else {
            Err(Error::new(QuicErrorCode::InternalError, "mtu probe did not fit"))
        };
        self.creator.set_max_packet_length(previous_max);

        match probe {
            Ok(packet) => {
                debug!(
                    sequence_number = packet.sequence_number,
                    size = packet.packet.len(),
                    "sending mtu probe"
                );
                // Probe bookkeeping first: the write below must not see a
                // stale threshold and re-arm the probe alarm.
                self.mtu.on_probe_sent(packet.sequence_number);
                let _ = self.dispatch(packet, now, true);
            }
            Err(e) => debug!(error = %e, "mtu probe construction failed"),
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Close the connection locally, notifying the peer.
    pub fn close(&mut self, error: QuicErrorCode, reason: &str, now: Instant) {
        self.close_internal(error, reason.to_string(), CloseSource::Local, true, now);
    }

    /// Idempotent teardown: every fatal path funnels here exactly once.
    fn close_internal(
        &mut self,
        error: QuicErrorCode,
        reason: String,
        source: CloseSource,
        notify_peer: bool,
        now: Instant,
    ) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        debug!(code = ?error, %reason, ?source, "closing connection");
        self.state = ConnectionState::Closing;

        if notify_peer {
            let close_frame = Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: error,
                reason: reason.clone(),
            });
            // Best effort: a close that cannot be sent is dropped, never
            // queued or retried.
            if self.creator.add_frame(close_frame) {
                let entropy = self.received.entropy();
                let calculator = |seq: SequenceNumber| entropy.cumulative(seq);
                if let Ok(packet) =
                    self.creator.flush(None, &*self.codec, self.send_level, &calculator)
                {
                    let _ = self.writer.write_packet(&packet.packet);
                }
            }
        }

        self.state = ConnectionState::Closed;
        self.alarms.cancel_all();
        self.queued_packets.clear();
        self.events.push_back(ConnectionEvent::Closed { error, reason, source });
    }
}
