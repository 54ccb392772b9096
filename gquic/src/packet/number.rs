//! # Sequence Number Encoding/Decoding
//!
//! Packet sequence numbers are 64-bit logical values carried on the wire in
//! their low 1, 2, 4 or 6 bytes. The receiver reconstructs the full value
//! by picking, among the candidates in the previous, current and next
//! epoch (an epoch is one wire-length period, up to `2^48`), the one
//! closest to `last_seen + 1`.
//!
//! Reconstruction is exact for any value within half an epoch of
//! `last_seen + 1` in either direction, which covers both forward rollover
//! and out-of-order arrival across an epoch boundary.

#![forbid(unsafe_code)]

use crate::types::{SequenceNumber, SequenceNumberLength};

/// Absolute difference of two unsigned values.
fn delta(a: u64, b: u64) -> u64 {
    if a < b {
        b - a
    } else {
        a - b
    }
}

/// The candidate closer to `target` (ties go to `a`).
fn closest_to(target: u64, a: u64, b: u64) -> u64 {
    if delta(target, a) < delta(target, b) {
        a
    } else {
        b
    }
}

/// Truncate a full sequence number to its wire form.
pub fn truncate(sequence_number: SequenceNumber, length: SequenceNumberLength) -> u64 {
    let bits = 8 * length.len() as u32;
    if bits >= 64 {
        sequence_number
    } else {
        sequence_number & ((1u64 << bits) - 1)
    }
}

/// Reconstruct a full sequence number from its wire form.
///
/// `last_seen` is the most recent sequence number observed in the same
/// direction (sent or received); the wire value is interpreted relative to
/// `last_seen + 1`.
pub fn reconstruct(
    wire: u64,
    length: SequenceNumberLength,
    last_seen: SequenceNumber,
) -> SequenceNumber {
    let epoch_delta = 1u64 << (8 * length.len() as u32);
    let expected = last_seen.wrapping_add(1);
    let epoch = last_seen & !(epoch_delta - 1);
    let prev_epoch = epoch.wrapping_sub(epoch_delta);
    let next_epoch = epoch.wrapping_add(epoch_delta);

    closest_to(
        expected,
        epoch.wrapping_add(wire),
        closest_to(
            expected,
            prev_epoch.wrapping_add(wire),
            next_epoch.wrapping_add(wire),
        ),
    )
}

/// Smallest wire length able to disambiguate sequence numbers `gap` apart.
///
/// Callers pass four times the real window to leave reordering headroom.
pub fn min_length_for_gap(gap: u64) -> SequenceNumberLength {
    if gap < 1 << 8 {
        SequenceNumberLength::One
    } else if gap < 1 << 16 {
        SequenceNumberLength::Two
    } else if gap < 1 << 32 {
        SequenceNumberLength::Four
    } else {
        SequenceNumberLength::Six
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
