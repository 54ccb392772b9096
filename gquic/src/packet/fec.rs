//! # Forward Error Correction Groups
//!
//! A FEC group covers a contiguous run of data packets. The group's
//! redundancy is the byte-wise XOR of every protected payload, right-padded
//! to the longest member. If exactly one member of a closed group goes
//! missing, XOR-ing the redundancy with the surviving members reconstructs
//! it byte for byte (any trailing zero bytes decode as padding frames).
//!
//! The send side accumulates payloads as packets leave; the receive side
//! mirrors the accumulation and revives the missing packet once the FEC
//! packet arrives.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::types::SequenceNumber;

/// XOR `data` into `acc`, growing `acc` to the longer length.
fn xor_fold(acc: &mut Vec<u8>, data: &[u8]) {
    if data.len() > acc.len() {
        acc.resize(data.len(), 0);
    }
    for (slot, &byte) in acc.iter_mut().zip(data.iter()) {
        *slot ^= byte;
    }
}

// ============================================================================
// Send side
// ============================================================================

/// An open FEC group on the send side.
#[derive(Debug)]
pub struct FecGroup {
    group_number: SequenceNumber,
    redundancy: Vec<u8>,
    num_protected: usize,
}

impl FecGroup {
    /// Open a group; `group_number` is the sequence number the first
    /// protected packet will carry.
    pub fn open(group_number: SequenceNumber) -> Self {
        Self { group_number, redundancy: Vec::new(), num_protected: 0 }
    }

    pub fn group_number(&self) -> SequenceNumber {
        self.group_number
    }

    pub fn num_protected(&self) -> usize {
        self.num_protected
    }

    pub fn is_empty(&self) -> bool {
        self.num_protected == 0
    }

    /// Fold one outgoing packet payload (the frame bytes, not the header)
    /// into the redundancy.
    pub fn protect(&mut self, payload: &[u8]) {
        xor_fold(&mut self.redundancy, payload);
        self.num_protected += 1;
    }

    /// Close the group, yielding the redundancy payload for its FEC packet.
    pub fn emit(self) -> Bytes {
        debug_assert!(self.num_protected > 0);
        Bytes::from(self.redundancy)
    }
}

// ============================================================================
// Receive side
// ============================================================================

/// A FEC group under reconstruction on the receive side.
///
/// Members are the data packets numbered from the group key up to (but not
/// including) the FEC packet. The group closes when the FEC packet arrives;
/// at that point at most one missing member can be revived.
#[derive(Debug)]
pub struct FecReceiveGroup {
    group_number: SequenceNumber,
    parity: Vec<u8>,
    received: BTreeSet<SequenceNumber>,
    fec_packet: Option<(SequenceNumber, Vec<u8>)>,
}

impl FecReceiveGroup {
    pub fn new(group_number: SequenceNumber) -> Self {
        Self { group_number, parity: Vec::new(), received: BTreeSet::new(), fec_packet: None }
    }

    pub fn group_number(&self) -> SequenceNumber {
        self.group_number
    }

    /// Record a protected data packet's decrypted payload.
    ///
    /// Duplicates and packets outside the group are ignored.
    pub fn on_data_packet(&mut self, sequence_number: SequenceNumber, payload: &[u8]) {
        if sequence_number < self.group_number {
            return;
        }
        if let Some((fec_seq, _)) = self.fec_packet {
            if sequence_number >= fec_seq {
                return;
            }
        }
        if !self.received.insert(sequence_number) {
            return;
        }
        xor_fold(&mut self.parity, payload);
    }

    /// Record the group's FEC packet. Returns false when a FEC packet was
    /// already seen for this group.
    pub fn on_fec_packet(&mut self, sequence_number: SequenceNumber, redundancy: &[u8]) -> bool {
        if self.fec_packet.is_some() || sequence_number <= self.group_number {
            return false;
        }
        // Any data packet recorded past the FEC packet is not a member.
        self.received.retain(|&seq| seq < sequence_number);
        self.fec_packet = Some((sequence_number, redundancy.to_vec()));
        true
    }

    /// Number of data packets the closed group protects.
    fn member_count(&self) -> Option<u64> {
        self.fec_packet.as_ref().map(|(fec_seq, _)| fec_seq - self.group_number)
    }

    /// True when the FEC packet has arrived and exactly one member is
    /// missing.
    pub fn can_revive(&self) -> bool {
        match self.member_count() {
            Some(members) => self.received.len() as u64 == members - 1,
            None => false,
        }
    }

    /// True when every member (and the FEC packet) arrived; nothing to do.
    pub fn is_complete(&self) -> bool {
        match self.member_count() {
            Some(members) => self.received.len() as u64 == members,
            None => false,
        }
    }

    /// Reconstruct the single missing member.
    ///
    /// The revived payload carries the group's padded length; trailing
    /// zeros parse as padding frames.
    pub fn revive(&self) -> Option<(SequenceNumber, Bytes)> {
        if !self.can_revive() {
            return None;
        }
        let (fec_seq, redundancy) = self.fec_packet.as_ref()?;
        let missing = (self.group_number..*fec_seq).find(|seq| !self.received.contains(seq))?;

        let mut payload = redundancy.clone();
        xor_fold(&mut payload, &self.parity);
        Some((missing, Bytes::from(payload)))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
