//! A version-agnostic view over a parsed bundle's primary-block fields,
//! the shape the dispatcher (C6) actually needs (spec §4.6 step 1: "Parse
//! primary block, extract destination, priority, expiration, custody
//! flags").

use super::bpv6::BundleV6;
use super::bpv7::BundleV7;
use super::eid::Eid;
use crate::error::BundleCodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleVersion {
    V6,
    V7,
}

#[derive(Debug, Clone)]
pub struct ParsedBundle {
    pub version: BundleVersion,
    pub destination: Eid,
    pub priority: u8,
    pub absolute_expiration_ms: u64,
    pub custody_requested: bool,
    pub total_length: u64,
    /// Set when the primary block's `IS_ADMIN_RECORD` flag is set: this
    /// bundle is a custody signal or other administrative record, not user
    /// data, and should be processed rather than stored/forwarded.
    pub is_admin_record: bool,
    /// The admin record's payload-block body, present whenever
    /// `is_admin_record` is set and a payload block was found.
    pub admin_record_payload: Option<Vec<u8>>,
    /// The full on-wire byte run, preserved so storage can persist it
    /// byte-exact and so egress can replay it unchanged.
    pub raw: Vec<u8>,
}

/// BPv6 payload canonical block type (RFC 5050 §4.5.1).
const PAYLOAD_BLOCK_TYPE: u8 = 1;

/// Sniffs the version byte/CBOR-ness and parses accordingly. BPv6 bundles
/// begin with a literal version byte `6`; BPv7 bundles begin with a CBOR
/// array header whose first element is the integer `7`. We only need to
/// distinguish these two cases, so checking the first byte against `6`
/// suffices (BPv7's leading CBOR array-header byte is always `>= 0x80`).
pub fn parse(raw: &[u8]) -> Result<ParsedBundle, BundleCodecError> {
    match raw.first() {
        Some(6) => {
            let bundle = BundleV6::deserialize(raw)?;
            let total_length = raw.len() as u64;
            let is_admin_record = bundle.primary.flags.contains(super::bpv6::BundleFlags::IS_ADMIN_RECORD);
            let admin_record_payload = is_admin_record
                .then(|| bundle.canonical_blocks.iter().find(|b| b.block_type == PAYLOAD_BLOCK_TYPE))
                .flatten()
                .map(|b| b.body.clone());
            Ok(ParsedBundle {
                version: BundleVersion::V6,
                destination: bundle.primary.destination,
                priority: bundle.primary.flags.priority(),
                absolute_expiration_ms: bundle.primary.absolute_expiration_ms(),
                custody_requested: bundle
                    .primary
                    .flags
                    .contains(super::bpv6::BundleFlags::CUSTODY_REQUESTED),
                total_length,
                is_admin_record,
                admin_record_payload,
                raw: raw.to_vec(),
            })
        }
        Some(_) => {
            let bundle = BundleV7::deserialize(raw)?;
            let destination = super::bpv7::eid_from_wire(&bundle.primary.destination)?;
            // BPv7 encodes priority in bits 7-8 of the processing flags,
            // mirroring the BPv6 convention this core keys the catalog on.
            let priority = ((bundle.primary.bundle_processing_flags >> 7) & 0b11) as u8;
            let custody_requested = bundle.primary.bundle_processing_flags & 0x0000_0008 != 0;
            // Bit 1 of the bundle processing flags, the same administrative-
            // record bit BPv6 assigns (RFC 9171 §4.2.3 keeps the low-order
            // flag bits from RFC 5050).
            let is_admin_record = bundle.primary.bundle_processing_flags & 0x0000_0002 != 0;
            let admin_record_payload = is_admin_record
                .then(|| bundle.canonical_blocks.iter().find(|b| b.block_type == PAYLOAD_BLOCK_TYPE))
                .flatten()
                .map(|b| b.data.clone());
            Ok(ParsedBundle {
                version: BundleVersion::V7,
                destination,
                priority,
                absolute_expiration_ms: bundle.primary.absolute_expiration_ms(),
                custody_requested,
                total_length: raw.len() as u64,
                is_admin_record,
                admin_record_payload,
                raw: raw.to_vec(),
            })
        }
        None => Err(BundleCodecError::TruncatedField("bundle is empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::bpv6::{BundleFlags, CanonicalBlock, PrimaryBlock};

    #[test]
    fn sniffs_bpv6() {
        let bundle = BundleV6 {
            primary: PrimaryBlock {
                flags: BundleFlags::CUSTODY_REQUESTED.with_priority(1),
                destination: Eid::new(1, 1),
                source: Eid::new(2, 1),
                report_to: Eid::NULL,
                custodian: Eid::new(2, 1),
                creation_timestamp_secs: 1000,
                creation_sequence: 0,
                lifetime_ms: 60_000,
                fragment_offset: 0,
                total_adu_length: 0,
            },
            canonical_blocks: vec![CanonicalBlock { block_type: 1, flags: 0, body: vec![9, 9] }],
        };
        let raw = bundle.serialize();
        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.version, BundleVersion::V6);
        assert_eq!(parsed.destination, Eid::new(1, 1));
        assert_eq!(parsed.priority, 1);
        assert!(parsed.custody_requested);
    }
}
