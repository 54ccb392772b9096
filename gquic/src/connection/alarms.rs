//! # Connection Alarms
//!
//! The engine owns one deadline per alarm kind; an external scheduler reads
//! the earliest deadline and calls back into the engine when it passes.
//! Setting a deadline replaces the previous one, and cancel is idempotent,
//! so handlers can re-arm freely.

#![forbid(unsafe_code)]

use crate::types::Instant;

/// Every timer the engine runs. Firing one invokes exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmKind {
    /// Delayed-ack timer.
    Ack,
    /// Tail-loss probe / retransmission timeout.
    Retransmission,
    /// Force-close the open FEC group.
    Fec,
    /// Keepalive while streams are open.
    Ping,
    /// Idle and overall connection deadlines.
    Timeout,
    /// Retry congestion-blocked sends.
    Send,
    /// Drain packets buffered behind a blocked transport.
    ResumeWrites,
    /// Send the next MTU probe.
    MtuDiscovery,
}

/// All of [`AlarmKind`], for iteration.
pub const ALL_ALARMS: [AlarmKind; 8] = [
    AlarmKind::Ack,
    AlarmKind::Retransmission,
    AlarmKind::Fec,
    AlarmKind::Ping,
    AlarmKind::Timeout,
    AlarmKind::Send,
    AlarmKind::ResumeWrites,
    AlarmKind::MtuDiscovery,
];

/// Deadline registry for one connection.
#[derive(Debug, Default)]
pub struct AlarmSet {
    deadlines: [Option<Instant>; 8],
}

fn index(kind: AlarmKind) -> usize {
    match kind {
        AlarmKind::Ack => 0,
        AlarmKind::Retransmission => 1,
        AlarmKind::Fec => 2,
        AlarmKind::Ping => 3,
        AlarmKind::Timeout => 4,
        AlarmKind::Send => 5,
        AlarmKind::ResumeWrites => 6,
        AlarmKind::MtuDiscovery => 7,
    }
}

impl AlarmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) an alarm.
    pub fn set(&mut self, kind: AlarmKind, deadline: Instant) {
        self.deadlines[index(kind)] = Some(deadline);
    }

    /// Arm only if it would fire earlier than the current deadline.
    pub fn set_min(&mut self, kind: AlarmKind, deadline: Instant) {
        let slot = &mut self.deadlines[index(kind)];
        match slot {
            Some(current) if *current <= deadline => {}
            _ => *slot = Some(deadline),
        }
    }

    /// Cancel; idempotent.
    pub fn cancel(&mut self, kind: AlarmKind) {
        self.deadlines[index(kind)] = None;
    }

    /// Cancel every alarm; used exactly once at connection close.
    pub fn cancel_all(&mut self) {
        self.deadlines = [None; 8];
    }

    pub fn deadline(&self, kind: AlarmKind) -> Option<Instant> {
        self.deadlines[index(kind)]
    }

    pub fn is_set(&self, kind: AlarmKind) -> bool {
        self.deadline(kind).is_some()
    }

    /// The next alarm to fire, for the external scheduler.
    pub fn next_deadline(&self) -> Option<(AlarmKind, Instant)> {
        ALL_ALARMS
            .iter()
            .filter_map(|&kind| self.deadline(kind).map(|d| (kind, d)))
            .min_by_key(|&(_, d)| d)
    }

    /// Consume a due deadline: clears and returns true when `kind` is set
    /// and due at `now`. A fire for an unset or not-yet-due alarm is a
    /// stale callback and returns false.
    pub fn take_if_due(&mut self, kind: AlarmKind, now: Instant) -> bool {
        match self.deadline(kind) {
            Some(deadline) if deadline <= now => {
                self.cancel(kind);
                true
            }
            _ => false,
        }
    }
}
