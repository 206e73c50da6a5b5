//! Bundle wire formats: BPv6 (SDNV), BPv7 (CBOR), and the shared CTEB codec.

pub mod bpv6;
pub mod bpv7;
pub mod custody_signal;
pub mod cteb;
pub mod eid;
pub mod primary;
pub mod sdnv;

pub use eid::Eid;
pub use primary::{parse, BundleVersion, ParsedBundle};
