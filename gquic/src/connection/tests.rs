//! # Connection Engine Tests
//!
//! Exercises the engine end to end through its three entry points
//! (`on_packet`, `on_alarm`, `on_can_write`) with a scripted transport and
//! a recording send algorithm. Peer packets are built with the real
//! packet builder, so every test also crosses the wire codec.

#![cfg(test)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::config::{EngineConfig, FecSendPolicy};
use crate::connection::{
    AlarmKind, CloseSource, ConnectionEngine, ConnectionEvent, ConnectionState, PacketWriter,
    WriteResult,
};
use crate::error::QuicErrorCode;
use crate::frames::{AckFrame, Frame, StreamFrame};
use crate::packet::creator::FixedEntropySource;
use crate::packet::parser::{
    PacketBuilder, PacketParser, ParsedPacket, Perspective, PublicResetPacket,
};
use crate::packet::{EncryptionLevel, NullPacketCodec, PacketCodec, PacketHeader};
use crate::recovery::{FixedWindowSender, NackThresholdDetector, RttEstimator, SendAlgorithm};
use crate::types::{
    make_tag, ConnectionId, ConnectionIdLength, EntropyHash, Instant, SequenceNumber,
    SequenceNumberLength,
};
use crate::version::QuicVersion;

const CID: ConnectionId = 0xFEED_FACE_CAFE_F00D;
const WINDOW: usize = 1 << 30;

fn at_ms(ms: u64) -> Instant {
    Instant::from_nanos(ms * 1_000_000)
}

fn no_entropy(_: SequenceNumber) -> EntropyHash {
    0
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct TransportState {
    packets: Vec<Vec<u8>>,
    blocked: bool,
    fail: bool,
}

struct SharedWriter(Arc<Mutex<TransportState>>);

impl PacketWriter for SharedWriter {
    fn write_packet(&mut self, packet: &[u8]) -> WriteResult {
        let mut state = self.0.lock().unwrap();
        if state.fail {
            return WriteResult::Err(1);
        }
        if state.blocked {
            return WriteResult::Blocked;
        }
        state.packets.push(packet.to_vec());
        WriteResult::Ok(packet.len())
    }
}

#[derive(Default)]
struct AlgorithmEvents {
    rto_calls: Vec<bool>,
}

/// Fixed-window sender that records strategy callbacks for assertions.
struct RecordingAlgorithm {
    inner: FixedWindowSender,
    events: Arc<Mutex<AlgorithmEvents>>,
}

impl SendAlgorithm for RecordingAlgorithm {
    fn on_packet_sent(
        &mut self,
        now: Instant,
        sequence_number: SequenceNumber,
        bytes: usize,
        retransmittable: bool,
    ) {
        self.inner.on_packet_sent(now, sequence_number, bytes, retransmittable);
    }

    fn on_congestion_event(
        &mut self,
        rtt_updated: bool,
        acked_bytes: usize,
        lost_bytes: usize,
        bytes_in_flight: usize,
    ) {
        self.inner.on_congestion_event(rtt_updated, acked_bytes, lost_bytes, bytes_in_flight);
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.events.lock().unwrap().rto_calls.push(packets_retransmitted);
        self.inner.on_retransmission_timeout(packets_retransmitted);
    }

    fn can_send(&self, bytes: usize) -> bool {
        self.inner.can_send(bytes)
    }

    fn time_until_send(&self, now: Instant) -> core::time::Duration {
        self.inner.time_until_send(now)
    }

    fn retransmission_delay(&self, rtt: &RttEstimator) -> core::time::Duration {
        self.inner.retransmission_delay(rtt)
    }

    fn congestion_window(&self) -> usize {
        self.inner.congestion_window()
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Codec opening every packet at a fixed level, for cleartext tests.
struct FixedLevelCodec(EncryptionLevel);

impl PacketCodec for FixedLevelCodec {
    fn seal(
        &self,
        _level: EncryptionLevel,
        _sequence_number: SequenceNumber,
        _associated_data: &[u8],
        _payload: &mut Vec<u8>,
    ) -> crate::error::Result<()> {
        Ok(())
    }

    fn open(
        &self,
        _hint: EncryptionLevel,
        _sequence_number: SequenceNumber,
        _associated_data: &[u8],
        payload: &[u8],
    ) -> crate::error::Result<(Vec<u8>, EncryptionLevel)> {
        Ok((payload.to_vec(), self.0))
    }
}

struct TestHarness {
    engine: ConnectionEngine,
    transport: Arc<Mutex<TransportState>>,
    alg_events: Arc<Mutex<AlgorithmEvents>>,
    out_parser: PacketParser,
    parsed_so_far: usize,
    peer_seq: SequenceNumber,
}

impl TestHarness {
    fn build(
        perspective: Perspective,
        config: EngineConfig,
        window: usize,
        entropy_bit: bool,
        codec: Box<dyn PacketCodec>,
    ) -> Self {
        let transport: Arc<Mutex<TransportState>> = Arc::default();
        let alg_events: Arc<Mutex<AlgorithmEvents>> = Arc::default();
        let engine = ConnectionEngine::new(
            config,
            perspective,
            CID,
            QuicVersion::Q025,
            codec,
            Box::new(SharedWriter(transport.clone())),
            Box::new(RecordingAlgorithm {
                inner: FixedWindowSender::new(window),
                events: alg_events.clone(),
            }),
            Box::new(NackThresholdDetector::new()),
            Box::new(FixedEntropySource(entropy_bit)),
            at_ms(0),
        );
        let out_perspective = match perspective {
            Perspective::Server => Perspective::Client,
            Perspective::Client => Perspective::Server,
        };
        Self {
            engine,
            transport,
            alg_events,
            out_parser: PacketParser::new(out_perspective, CID),
            parsed_so_far: 0,
            peer_seq: 0,
        }
    }

    fn server() -> Self {
        let mut harness = Self::build(
            Perspective::Server,
            EngineConfig::default(),
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        );
        harness.engine.on_handshake_complete(at_ms(0));
        harness
    }

    fn written_count(&self) -> usize {
        self.transport.lock().unwrap().packets.len()
    }

    fn written(&self, index: usize) -> Vec<u8> {
        self.transport.lock().unwrap().packets[index].clone()
    }

    fn set_blocked(&self, blocked: bool) {
        self.transport.lock().unwrap().blocked = blocked;
    }

    /// Parse every packet written since the last drain.
    fn drain_packets(&mut self) -> Vec<ParsedPacket> {
        let packets: Vec<Vec<u8>> = {
            let state = self.transport.lock().unwrap();
            state.packets[self.parsed_so_far..].to_vec()
        };
        self.parsed_so_far += packets.len();
        packets
            .iter()
            .map(|bytes| {
                self.out_parser
                    .parse(bytes, &NullPacketCodec, EncryptionLevel::ForwardSecure)
                    .expect("engine emitted an unparseable packet")
            })
            .collect()
    }

    /// Flatten newly written data packets into (sequence number, frames).
    fn drain_frames(&mut self) -> Vec<(SequenceNumber, Vec<Frame>)> {
        self.drain_packets()
            .into_iter()
            .filter_map(|parsed| match parsed {
                ParsedPacket::Data { header, frames, .. } => {
                    Some((header.sequence_number, frames))
                }
                _ => None,
            })
            .collect()
    }

    fn peer_header(&mut self, fec_group: Option<SequenceNumber>) -> PacketHeader {
        self.peer_seq += 1;
        PacketHeader {
            connection_id: CID,
            connection_id_length: ConnectionIdLength::EightBytes,
            version: None,
            sequence_number: self.peer_seq,
            sequence_number_length: SequenceNumberLength::Six,
            entropy_flag: false,
            fec_flag: false,
            fec_group,
        }
    }

    /// Build and deliver one peer packet carrying `frames`.
    fn deliver(&mut self, frames: Vec<Frame>, now: Instant) -> crate::error::Result<()> {
        let header = self.peer_header(None);
        let bytes = PacketBuilder::build_data_packet(
            &header,
            &frames,
            1400,
            &no_entropy,
            &NullPacketCodec,
            EncryptionLevel::None,
        )
        .unwrap();
        self.engine.on_packet(&bytes, now)
    }

    /// Deliver an ack for everything up to `largest` except `missing`.
    fn ack(&mut self, largest: SequenceNumber, missing: &[SequenceNumber], now: Instant) {
        let mut ack = AckFrame { largest_observed: largest, ..AckFrame::default() };
        for &seq in missing {
            ack.missing_packets.insert(seq);
        }
        self.deliver(vec![Frame::Ack(ack)], now).unwrap();
    }

    fn fire(&mut self, kind: AlarmKind) {
        let deadline = self
            .engine
            .alarms()
            .deadline(kind)
            .unwrap_or_else(|| panic!("{kind:?} alarm not armed"));
        self.engine.on_alarm(kind, deadline);
    }

    fn events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.engine.poll_event() {
            events.push(event);
        }
        events
    }

    fn stream_frame(data: &'static [u8]) -> Frame {
        Frame::Stream(StreamFrame {
            stream_id: 5,
            fin: false,
            offset: 0,
            data: Bytes::from_static(data),
        })
    }
}

// ============================================================================
// Send path
// ============================================================================

mod send_path {
    use super::*;

    #[test]
    fn stream_data_is_packetized_and_written() {
        let mut h = TestHarness::server();
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"hello"), at_ms(1))
            .unwrap();

        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        let (seq, frames) = &frames[0];
        assert_eq!(*seq, 1);
        match &frames[0] {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, 5);
                assert_eq!(&s.data[..], b"hello");
            }
            other => panic!("expected stream frame, got {other:?}"),
        }
        assert_eq!(h.engine.stats().packets_sent, 1);
    }

    #[test]
    fn congestion_blocked_packets_queue_and_arm_the_send_alarm() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig::default(),
            0, // zero window: nothing retransmittable may fly
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));

        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"stalled"), at_ms(1))
            .unwrap();
        assert_eq!(h.written_count(), 0);
        assert!(h.engine.has_queued_data());
        assert!(h.engine.alarms().is_set(AlarmKind::Send));
    }

    #[test]
    fn crypto_stream_bypasses_the_congestion_window() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig::default(),
            0,
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));

        h.engine
            .send_stream_data(1, 0, false, Bytes::from_static(b"handshake"), at_ms(1))
            .unwrap();
        assert_eq!(h.written_count(), 1);
        assert!(!h.engine.has_queued_data());
    }

    #[test]
    fn oversized_stream_data_splits_across_packets() {
        let mut h = TestHarness::server();
        let data = Bytes::from(vec![0x5A; 3000]);
        h.engine.send_stream_data(5, 0, false, data, at_ms(1)).unwrap();

        let packets = h.drain_frames();
        assert!(packets.len() >= 3);
        let mut reassembled = Vec::new();
        let mut expected_offset = 0u64;
        for (_, frames) in &packets {
            for frame in frames {
                if let Frame::Stream(s) = frame {
                    assert_eq!(s.offset, expected_offset);
                    expected_offset += s.data.len() as u64;
                    reassembled.extend_from_slice(&s.data);
                }
            }
        }
        assert_eq!(reassembled.len(), 3000);
        assert!(reassembled.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn blocked_transport_buffers_and_resends_the_same_packet() {
        let mut h = TestHarness::server();
        h.set_blocked(true);
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"retry me"), at_ms(1))
            .unwrap();
        assert_eq!(h.written_count(), 0);
        assert!(h.engine.has_queued_data());

        // More sends while blocked stack up behind the first.
        h.engine
            .send_stream_data(5, 8, false, Bytes::from_static(b"second"), at_ms(2))
            .unwrap();
        assert_eq!(h.written_count(), 0);

        h.set_blocked(false);
        h.engine.on_can_write(at_ms(3));
        h.fire(AlarmKind::ResumeWrites);

        let frames = h.drain_frames();
        assert_eq!(frames.len(), 2);
        // Original sequence numbers, not re-encoded.
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[1].0, 2);
        assert!(!h.engine.has_queued_data());
    }

    #[test]
    fn write_error_closes_the_connection() {
        let mut h = TestHarness::server();
        h.transport.lock().unwrap().fail = true;
        let err = h
            .engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"doomed"), at_ms(1))
            .unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::PacketWriteError);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.engine.next_alarm_deadline(), None);
    }
}

// ============================================================================
// Loss, TLP and RTO
// ============================================================================

mod retransmission {
    use super::*;

    /// Packets 1..=3 go out; an ack names largest=3 with 2 missing. After
    /// the nack threshold, packet 2's data returns under a fresh number.
    #[test]
    fn nacked_packet_is_retransmitted_with_new_sequence_number() {
        let mut h = TestHarness::server();
        for chunk in [&b"one"[..], b"two", b"three"] {
            h.engine
                .send_stream_data(5, 0, false, Bytes::copy_from_slice(chunk), at_ms(1))
                .unwrap();
        }
        assert_eq!(h.written_count(), 3);
        h.drain_packets();

        // Three acks with packet 2 missing reach the nack threshold.
        h.ack(3, &[2], at_ms(10));
        h.ack(3, &[2], at_ms(11));
        assert_eq!(h.engine.stats().packets_retransmitted, 0);
        h.ack(3, &[2], at_ms(12));
        assert_eq!(h.engine.stats().packets_retransmitted, 1);

        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        let (seq, frames) = &frames[0];
        assert!(*seq >= 4, "retransmission uses a fresh sequence number");
        match &frames[0] {
            Frame::Stream(s) => assert_eq!(&s.data[..], b"two"),
            other => panic!("expected stream frame, got {other:?}"),
        }
    }

    #[test]
    fn tlp_probes_precede_the_full_rto() {
        let mut h = TestHarness::server();
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"probe me"), at_ms(1))
            .unwrap();
        h.drain_packets();

        // Two tail loss probes: no strategy timeout callback.
        h.fire(AlarmKind::Retransmission);
        assert_eq!(h.engine.stats().tlp_count, 1);
        assert!(h.alg_events.lock().unwrap().rto_calls.is_empty());

        h.fire(AlarmKind::Retransmission);
        assert_eq!(h.engine.stats().tlp_count, 2);
        assert!(h.alg_events.lock().unwrap().rto_calls.is_empty());

        // Budget exhausted: exactly one OnRetransmissionTimeout(true).
        h.fire(AlarmKind::Retransmission);
        assert_eq!(h.engine.stats().rto_count, 1);
        assert_eq!(h.alg_events.lock().unwrap().rto_calls.as_slice(), &[true]);

        // Each probe and the RTO re-sent the stream data.
        let frames = h.drain_frames();
        assert_eq!(frames.len(), 3);
        for (_, packet_frames) in &frames {
            match &packet_frames[0] {
                Frame::Stream(s) => assert_eq!(&s.data[..], b"probe me"),
                other => panic!("expected stream frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn rto_backoff_doubles_and_acks_clear_the_alarm() {
        let mut h = TestHarness::server();
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"backoff"), at_ms(1))
            .unwrap();

        for _ in 0..2 {
            h.fire(AlarmKind::Retransmission); // TLPs
        }
        let rto1_fire = h.engine.alarms().deadline(AlarmKind::Retransmission).unwrap();
        h.engine.on_alarm(AlarmKind::Retransmission, rto1_fire);
        let rto2_fire = h.engine.alarms().deadline(AlarmKind::Retransmission).unwrap();
        h.engine.on_alarm(AlarmKind::Retransmission, rto2_fire);
        let rto3_fire = h.engine.alarms().deadline(AlarmKind::Retransmission).unwrap();

        let first_backoff = rto2_fire.duration_since(rto1_fire).unwrap();
        let second_backoff = rto3_fire.duration_since(rto2_fire).unwrap();
        assert!(second_backoff >= first_backoff * 2, "each RTO doubles the delay");
        assert_eq!(h.engine.stats().rto_count, 2);
        assert_eq!(h.alg_events.lock().unwrap().rto_calls.as_slice(), &[true, true]);

        // A full ack empties the ledger and clears the alarm.
        h.drain_packets();
        let largest = h.engine.stats().packets_sent;
        h.ack(largest, &[], at_ms(5_000));
        assert!(!h.engine.alarms().is_set(AlarmKind::Retransmission));
    }
}

// ============================================================================
// Acks out
// ============================================================================

mod acking {
    use super::*;

    #[test]
    fn ack_eliciting_packet_arms_the_delayed_ack_alarm() {
        let mut h = TestHarness::server();
        h.deliver(vec![TestHarness::stream_frame(b"in")], at_ms(5)).unwrap();
        assert_eq!(h.written_count(), 0, "no immediate ack for one in-order packet");
        assert!(h.engine.alarms().is_set(AlarmKind::Ack));

        h.fire(AlarmKind::Ack);
        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        let kinds: Vec<bool> = frames[0]
            .1
            .iter()
            .map(|f| matches!(f, Frame::Ack(_) | Frame::StopWaiting(_)))
            .collect();
        assert!(kinds.iter().all(|&k| k), "delayed ack bundles ack and stop waiting");
        assert_eq!(h.engine.stats().acks_sent, 1);
    }

    #[test]
    fn second_ack_eliciting_packet_acks_immediately() {
        let mut h = TestHarness::server();
        h.deliver(vec![TestHarness::stream_frame(b"a")], at_ms(5)).unwrap();
        assert_eq!(h.written_count(), 0);
        h.deliver(vec![TestHarness::stream_frame(b"b")], at_ms(6)).unwrap();
        assert_eq!(h.written_count(), 1);
        assert!(!h.engine.alarms().is_set(AlarmKind::Ack));
    }

    #[test]
    fn out_of_order_arrival_acks_immediately() {
        let mut h = TestHarness::server();
        h.deliver(vec![TestHarness::stream_frame(b"first")], at_ms(5)).unwrap();
        h.fire(AlarmKind::Ack);
        h.drain_packets();

        // Peer jumps from 1 to 5: gap forces an instant ack.
        h.peer_seq = 4;
        h.deliver(vec![TestHarness::stream_frame(b"gap")], at_ms(7)).unwrap();
        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        match frames[0].1.iter().find(|f| matches!(f, Frame::Ack(_))) {
            Some(Frame::Ack(ack)) => {
                assert_eq!(ack.largest_observed, 5);
                assert!(ack.missing_packets.contains(&2));
                assert!(ack.missing_packets.contains(&4));
            }
            other => panic!("expected an ack frame, got {other:?}"),
        }
    }

    #[test]
    fn peer_acks_of_unsent_packets_are_fatal() {
        let mut h = TestHarness::server();
        let err = h
            .deliver(
                vec![Frame::Ack(AckFrame { largest_observed: 5, ..AckFrame::default() })],
                at_ms(5),
            )
            .unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::InvalidAckData);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn entropy_mismatch_in_ack_is_fatal() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig::default(),
            WINDOW,
            true, // every sent packet carries its entropy bit
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"entropic"), at_ms(1))
            .unwrap();

        // Hash of zero cannot match packet 1's entropy contribution.
        let err = h
            .deliver(
                vec![Frame::Ack(AckFrame { largest_observed: 1, ..AckFrame::default() })],
                at_ms(5),
            )
            .unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::InvalidAckData);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        let closed = h
            .events()
            .into_iter()
            .find(|e| matches!(e, ConnectionEvent::Closed { .. }));
        match closed {
            Some(ConnectionEvent::Closed { error, .. }) => {
                assert_eq!(error, QuicErrorCode::InvalidAckData)
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }
}

// ============================================================================
// FEC
// ============================================================================

mod fec {
    use super::*;

    #[test]
    fn full_group_emits_exactly_one_fec_packet() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig {
                max_packets_per_fec_group: 2,
                fec_send_policy: FecSendPolicy::AnyTrigger,
                ..EngineConfig::default()
            },
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));
        h.engine.set_fec_protection(true);

        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"aaaa"), at_ms(1))
            .unwrap();
        h.engine
            .send_stream_data(5, 4, false, Bytes::from_static(b"bbbb"), at_ms(2))
            .unwrap();

        let packets = h.drain_packets();
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            ParsedPacket::Data { header, .. } => assert_eq!(header.fec_group, Some(1)),
            other => panic!("expected protected data packet, got {other:?}"),
        }
        match &packets[2] {
            ParsedPacket::Fec { header, redundancy } => {
                assert_eq!(header.fec_group, Some(1));
                assert_eq!(header.sequence_number, 3);
                assert!(!redundancy.is_empty());
            }
            other => panic!("expected fec packet, got {other:?}"),
        }
        assert_eq!(h.engine.stats().fec_packets_sent, 1);
    }

    #[test]
    fn alarm_policy_holds_the_group_until_the_fec_alarm() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig {
                max_packets_per_fec_group: 2,
                fec_send_policy: FecSendPolicy::AlarmTrigger,
                ..EngineConfig::default()
            },
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));
        h.engine.set_fec_protection(true);

        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"held"), at_ms(1))
            .unwrap();
        assert_eq!(h.engine.stats().fec_packets_sent, 0);
        assert!(h.engine.alarms().is_set(AlarmKind::Fec));

        h.fire(AlarmKind::Fec);
        assert_eq!(h.engine.stats().fec_packets_sent, 1);
    }

    /// Build a two-packet peer FEC group, withhold the second packet, and
    /// let the FEC packet revive it.
    #[test]
    fn missing_group_member_is_revived_and_reported() {
        let mut h = TestHarness::server();

        let frames_one = vec![TestHarness::stream_frame(b"alpha"), Frame::Padding];
        let frames_two = vec![
            Frame::Stream(StreamFrame {
                stream_id: 5,
                fin: false,
                offset: 5,
                data: Bytes::from_static(b"beta!"),
            }),
            Frame::Padding,
        ];

        let build = |h: &mut TestHarness, frames: &[Frame]| {
            let header = h.peer_header(Some(1));
            PacketBuilder::build_data_packet(
                &header,
                frames,
                1400,
                &no_entropy,
                &NullPacketCodec,
                EncryptionLevel::None,
            )
            .unwrap()
        };
        let packet_one = build(&mut h, &frames_one);
        let packet_two = build(&mut h, &frames_two);

        // Payloads start after the 17-byte header (16 + fec offset byte).
        let payload = |bytes: &[u8]| bytes[17..].to_vec();
        let mut redundancy = payload(&packet_one);
        let second = payload(&packet_two);
        if second.len() > redundancy.len() {
            redundancy.resize(second.len(), 0);
        }
        for (slot, byte) in redundancy.iter_mut().zip(second.iter()) {
            *slot ^= byte;
        }
        let fec_header = PacketHeader {
            fec_flag: true,
            ..h.peer_header(Some(1))
        };
        let fec_packet = PacketBuilder::build_fec_packet(
            &fec_header,
            &redundancy,
            &NullPacketCodec,
            EncryptionLevel::None,
        )
        .unwrap();

        h.engine.on_packet(&packet_one, at_ms(5)).unwrap();
        h.engine.on_packet(&fec_packet, at_ms(6)).unwrap();

        let events = h.events();
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::PacketRevived(2))));
        let stream_payloads: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::StreamFrame(s) => Some(&s.data[..]),
                _ => None,
            })
            .collect();
        assert_eq!(stream_payloads, vec![&b"alpha"[..], b"beta!"]);
        assert_eq!(h.engine.stats().packets_revived, 1);

        // The ack reports the packet as revived, not received.
        let frames = h.drain_frames();
        let ack = frames
            .iter()
            .flat_map(|(_, fs)| fs.iter())
            .find_map(|f| match f {
                Frame::Ack(ack) => Some(ack.clone()),
                _ => None,
            })
            .expect("revival triggers an ack");
        assert!(ack.revived_packets.contains(&2));
        assert!(ack.missing_packets.is_empty());
    }
}

// ============================================================================
// Timeouts, ping, MTU discovery
// ============================================================================

mod timers {
    use super::*;

    #[test]
    fn idle_timeout_closes_the_connection() {
        let mut h = TestHarness::server();
        h.fire(AlarmKind::Timeout);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        match h.events().pop() {
            Some(ConnectionEvent::Closed { error, source, .. }) => {
                assert_eq!(error, QuicErrorCode::ConnectionTimedOut);
                assert_eq!(source, CloseSource::Local);
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }

    #[test]
    fn network_activity_rearms_the_idle_timeout() {
        let mut h = TestHarness::server();
        h.deliver(vec![TestHarness::stream_frame(b"alive")], at_ms(10_000)).unwrap();
        // The deadline moved past the original creation-based one.
        let deadline = h.engine.alarms().deadline(AlarmKind::Timeout).unwrap();
        assert_eq!(deadline, at_ms(40_000));

        // Firing at the new deadline with no further activity closes.
        h.engine.on_alarm(AlarmKind::Timeout, deadline);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn overall_timeout_closes_despite_activity() {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig {
                overall_timeout: Some(core::time::Duration::from_secs(10)),
                ..EngineConfig::default()
            },
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));

        h.deliver(vec![TestHarness::stream_frame(b"busy")], at_ms(9_000)).unwrap();
        let deadline = h.engine.alarms().deadline(AlarmKind::Timeout).unwrap();
        assert_eq!(deadline, at_ms(10_000), "overall deadline wins");

        h.engine.on_alarm(AlarmKind::Timeout, deadline);
        match h.events().pop() {
            Some(ConnectionEvent::Closed { error, .. }) => {
                assert_eq!(error, QuicErrorCode::OverallTimedOut)
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }

    #[test]
    fn ping_keepalive_fires_while_streams_are_open() {
        let mut h = TestHarness::server();
        h.engine.set_has_open_streams(true);
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"open"), at_ms(1))
            .unwrap();
        assert!(h.engine.alarms().is_set(AlarmKind::Ping));
        h.drain_packets();

        h.fire(AlarmKind::Ping);
        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].1[0], Frame::Ping));
        // Sending the ping re-armed the alarm.
        assert!(h.engine.alarms().is_set(AlarmKind::Ping));
    }

    fn mtu_harness() -> TestHarness {
        let mut h = TestHarness::build(
            Perspective::Server,
            EngineConfig {
                mtu_discovery_enabled: true,
                ..EngineConfig::default()
            },
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        );
        h.engine.on_handshake_complete(at_ms(0));
        h
    }

    fn send_packets(h: &mut TestHarness, count: u64) {
        for _ in 0..count {
            h.engine
                .send_stream_data(5, 0, false, Bytes::from_static(b"x"), at_ms(1))
                .unwrap();
        }
    }

    #[test]
    fn acked_probe_raises_the_packet_size() {
        let mut h = mtu_harness();
        send_packets(&mut h, 100);
        assert!(h.engine.alarms().is_set(AlarmKind::MtuDiscovery));

        h.fire(AlarmKind::MtuDiscovery);
        let probe_seq = h.engine.stats().packets_sent;
        assert_eq!(h.written(h.written_count() - 1).len(), 1450);

        h.ack(probe_seq, &[], at_ms(50));
        assert_eq!(h.engine.max_packet_length(), 1450);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::MtuRaised(1450))));
    }

    #[test]
    fn unacked_probes_disable_discovery_for_good() {
        let mut h = mtu_harness();

        // Three probes at exponentially spaced packet counts.
        for threshold in [100u64, 300, 700] {
            let already_sent = h.engine.stats().packets_sent;
            send_packets(&mut h, threshold.saturating_sub(already_sent));
            assert!(
                h.engine.alarms().is_set(AlarmKind::MtuDiscovery),
                "probe alarm at packet {threshold}"
            );
            h.fire(AlarmKind::MtuDiscovery);
        }

        // Discovery gave up: more traffic never arms the alarm again.
        send_packets(&mut h, 800);
        assert!(!h.engine.alarms().is_set(AlarmKind::MtuDiscovery));
        assert_eq!(h.engine.max_packet_length(), 1350);
    }
}

// ============================================================================
// Version negotiation and resets
// ============================================================================

mod negotiation_and_reset {
    use super::*;

    fn client() -> TestHarness {
        TestHarness::build(
            Perspective::Client,
            EngineConfig::default(),
            WINDOW,
            false,
            Box::new(NullPacketCodec),
        )
    }

    #[test]
    fn client_downgrades_to_the_best_common_version() {
        let mut h = client();
        let vn = PacketBuilder::build_version_negotiation(CID, &[QuicVersion::Q024]);
        h.engine.on_packet(&vn, at_ms(1)).unwrap();

        assert_eq!(h.engine.version(), QuicVersion::Q024);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::VersionNegotiated(QuicVersion::Q024))));
    }

    #[test]
    fn negotiation_listing_the_current_version_is_fatal() {
        let mut h = client();
        let vn =
            PacketBuilder::build_version_negotiation(CID, &[QuicVersion::Q025, QuicVersion::Q024]);
        let err = h.engine.on_packet(&vn, at_ms(1)).unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::InvalidVersionNegotiationPacket);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn negotiation_with_no_common_version_is_fatal() {
        let mut h = client();
        let mut vn = PacketBuilder::build_version_negotiation(CID, &[]).to_vec();
        vn.extend_from_slice(&make_tag(b"Q099").to_le_bytes());
        let err = h.engine.on_packet(&vn, at_ms(1)).unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::InvalidVersion);
    }

    #[test]
    fn negotiation_after_regular_traffic_is_ignored() {
        let mut h = client();
        h.engine.on_handshake_complete(at_ms(0));
        h.deliver(vec![TestHarness::stream_frame(b"settled")], at_ms(1)).unwrap();

        let vn = PacketBuilder::build_version_negotiation(CID, &[QuicVersion::Q024]);
        h.engine.on_packet(&vn, at_ms(2)).unwrap();
        assert_eq!(h.engine.version(), QuicVersion::Q025);
        assert_eq!(h.engine.state(), ConnectionState::Established);
    }

    #[test]
    fn server_answers_unknown_versions_once_per_tag() {
        let mut h = TestHarness::server();
        let mut packet = vec![0x3D];
        packet.extend_from_slice(&CID.to_le_bytes());
        packet.extend_from_slice(&make_tag(b"Q099").to_le_bytes());
        packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07]);

        h.engine.on_packet(&packet, at_ms(1)).unwrap();
        h.engine.on_packet(&packet, at_ms(2)).unwrap();
        assert_eq!(h.engine.stats().version_negotiation_packets_sent, 1);
        assert_eq!(h.written_count(), 1);

        // The reply lists everything we speak.
        let reply = h.written(0);
        let mut parser = PacketParser::new(Perspective::Client, CID);
        match parser
            .parse(&reply, &NullPacketCodec, EncryptionLevel::None)
            .unwrap()
        {
            ParsedPacket::VersionNegotiation { version_tags, .. } => {
                assert!(version_tags.contains(&QuicVersion::Q025.to_tag()));
                assert!(version_tags.contains(&QuicVersion::Q024.to_tag()));
            }
            other => panic!("expected version negotiation, got {other:?}"),
        }
    }

    #[test]
    fn public_reset_kills_the_connection_without_a_reply() {
        let mut h = TestHarness::server();
        let reset = PacketBuilder::build_public_reset(
            CID,
            &PublicResetPacket {
                nonce_proof: 0x1122,
                rejected_sequence_number: 7,
                client_address: None,
            },
        );
        h.engine.on_packet(&reset, at_ms(1)).unwrap();

        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.written_count(), 0, "reset closure is silent");
        assert_eq!(h.engine.next_alarm_deadline(), None);
        match h.events().pop() {
            Some(ConnectionEvent::Closed { error, source, .. }) => {
                assert_eq!(error, QuicErrorCode::PublicReset);
                assert_eq!(source, CloseSource::Reset);
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }
}

// ============================================================================
// Encryption boundary and peer close
// ============================================================================

mod security_and_close {
    use super::*;

    fn cleartext_harness() -> TestHarness {
        TestHarness::build(
            Perspective::Server,
            EngineConfig::default(),
            WINDOW,
            false,
            Box::new(FixedLevelCodec(EncryptionLevel::None)),
        )
    }

    #[test]
    fn cleartext_crypto_stream_is_fine_during_the_handshake() {
        let mut h = cleartext_harness();
        h.deliver(
            vec![Frame::Stream(StreamFrame {
                stream_id: 1,
                fin: false,
                offset: 0,
                data: Bytes::from_static(b"client hello"),
            })],
            at_ms(1),
        )
        .unwrap();
        assert_ne!(h.engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn cleartext_data_stream_during_handshake_is_fatal() {
        let mut h = cleartext_harness();
        let err = h
            .deliver(vec![TestHarness::stream_frame(b"too early")], at_ms(1))
            .unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::UnencryptedStreamData);
        assert_eq!(h.engine.state(), ConnectionState::Closed);
    }

    #[test]
    fn cleartext_after_handshake_is_fatal_even_on_the_crypto_stream() {
        let mut h = cleartext_harness();
        h.engine.on_handshake_complete(at_ms(0));
        let err = h
            .deliver(
                vec![Frame::Stream(StreamFrame {
                    stream_id: 1,
                    fin: false,
                    offset: 0,
                    data: Bytes::from_static(b"late cleartext"),
                })],
                at_ms(1),
            )
            .unwrap_err();
        assert_eq!(err.code(), QuicErrorCode::UnencryptedStreamData);
    }

    #[test]
    fn peer_connection_close_tears_down_without_reply() {
        let mut h = TestHarness::server();
        h.deliver(
            vec![Frame::ConnectionClose(crate::frames::ConnectionCloseFrame {
                error_code: QuicErrorCode::PeerGoingAway,
                reason: "done here".to_string(),
            })],
            at_ms(1),
        )
        .unwrap();

        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.written_count(), 0, "no close frame echoed back");
        match h.events().pop() {
            Some(ConnectionEvent::Closed { error, reason, source }) => {
                assert_eq!(error, QuicErrorCode::PeerGoingAway);
                assert_eq!(reason, "done here");
                assert_eq!(source, CloseSource::Peer);
            }
            other => panic!("expected close event, got {other:?}"),
        }
    }

    #[test]
    fn local_close_notifies_the_peer_and_cancels_alarms() {
        let mut h = TestHarness::server();
        h.engine
            .send_stream_data(5, 0, false, Bytes::from_static(b"pending"), at_ms(1))
            .unwrap();
        h.drain_packets();

        h.engine.close(QuicErrorCode::NoError, "goodbye", at_ms(2));
        assert_eq!(h.engine.state(), ConnectionState::Closed);
        assert_eq!(h.engine.next_alarm_deadline(), None);

        let frames = h.drain_frames();
        assert_eq!(frames.len(), 1);
        match &frames[0].1[0] {
            Frame::ConnectionClose(close) => {
                assert_eq!(close.error_code, QuicErrorCode::NoError);
                assert_eq!(close.reason, "goodbye");
            }
            other => panic!("expected connection close frame, got {other:?}"),
        }

        // Closing again is a no-op.
        h.engine.close(QuicErrorCode::NoError, "again", at_ms(3));
        assert_eq!(h.drain_frames().len(), 0);
    }

    #[test]
    fn duplicate_packets_are_counted_and_dropped() {
        let mut h = TestHarness::server();
        let header = h.peer_header(None);
        let bytes = PacketBuilder::build_data_packet(
            &header,
            &[TestHarness::stream_frame(b"once")],
            1400,
            &no_entropy,
            &NullPacketCodec,
            EncryptionLevel::None,
        )
        .unwrap();

        h.engine.on_packet(&bytes, at_ms(1)).unwrap();
        h.engine.on_packet(&bytes, at_ms(2)).unwrap();
        assert_eq!(h.engine.stats().packets_received, 1);
        assert_eq!(h.engine.stats().duplicate_packets, 1);

        let stream_events = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::StreamFrame(_)))
            .count();
        assert_eq!(stream_events, 1);
    }
}
