//! # Protocol Versions and Negotiation
//!
//! Versions are identified by four-byte ASCII tags (`Q024`, `Q025`) carried
//! in the packet header when the version flag is set, and listed in version
//! negotiation packets.
//!
//! ## Negotiation
//!
//! 1. The client sends its packets with the version flag and its chosen tag
//!    until the server confirms the version.
//! 2. A server that does not support the tag replies with a version
//!    negotiation packet listing everything it speaks.
//! 3. The client restarts with the highest mutually supported version, or
//!    fails with `InvalidVersion` when there is no overlap.

#![forbid(unsafe_code)]

use crate::types::make_tag;

/// Protocol versions this engine speaks, newest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QuicVersion {
    Q024,
    Q025,
}

/// All supported versions, in preference order (most preferred first).
pub const SUPPORTED_VERSIONS: [QuicVersion; 2] = [QuicVersion::Q025, QuicVersion::Q024];

impl QuicVersion {
    /// Four-byte wire tag for this version.
    pub fn to_tag(self) -> u32 {
        match self {
            QuicVersion::Q024 => make_tag(b"Q024"),
            QuicVersion::Q025 => make_tag(b"Q025"),
        }
    }

    /// Decode a wire tag; `None` for versions this engine does not speak.
    pub fn from_tag(tag: u32) -> Option<Self> {
        if tag == make_tag(b"Q024") {
            Some(QuicVersion::Q024)
        } else if tag == make_tag(b"Q025") {
            Some(QuicVersion::Q025)
        } else {
            None
        }
    }
}

/// Pick the most preferred version out of a peer's offered tag list.
pub fn highest_common_version(offered_tags: &[u32]) -> Option<QuicVersion> {
    for version in SUPPORTED_VERSIONS {
        if offered_tags.contains(&version.to_tag()) {
            return Some(version);
        }
    }
    None
}
