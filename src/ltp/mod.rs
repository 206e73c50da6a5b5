//! LTP (Licklider Transmission Protocol, RFC 5326) reliability layer over
//! UDP.
//!
//! Submodules:
//! - [`fragment_map`] — reception-claim interval sets
//! - [`session_preventer`] — bounded history guarding against session
//!   resurrection under IP fragmentation reordering
//! - [`rate_limiter`] — outbound UDP shaping
//! - [`wire`] — segment encode/decode
//! - [`sender`] / [`receiver`] — per-session state machines
//! - [`engine`] — the per-UDP-port reactor that owns session tables, the
//!   timer wheel, and the rate limiter

pub mod engine;
pub mod fragment_map;
pub mod rate_limiter;
pub mod receiver;
pub mod sender;
pub mod session_preventer;
pub mod wire;

/// Identifies an LTP session: the originating engine's id plus a
/// session-local serial number it assigned (RFC 5326 §2's session ID,
/// carried as two SDNVs on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub engine_id: u64,
    pub session_number: u64,
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.engine_id, self.session_number)
    }
}
