//! Bundle Protocol version 6 (RFC 5050), SDNV-encoded, CBHE-compressed
//! (endpoint ids encoded directly as `(node, service)` SDNV pairs rather
//! than through the dictionary byte array — the same compression HDTN's
//! "ipn" CBHE codepath uses).

use super::eid::Eid;
use super::sdnv::{decode_u64, encode_u64};
use crate::error::BundleCodecError;

/// Bundle processing control flags (a subset of RFC 5050 §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleFlags(pub u64);

impl BundleFlags {
    pub const IS_FRAGMENT: BundleFlags = BundleFlags(0x0000_0001);
    pub const IS_ADMIN_RECORD: BundleFlags = BundleFlags(0x0000_0002);
    pub const DO_NOT_FRAGMENT: BundleFlags = BundleFlags(0x0000_0004);
    pub const CUSTODY_REQUESTED: BundleFlags = BundleFlags(0x0000_0008);
    pub const IS_CBHE: BundleFlags = BundleFlags(0x0000_0010);
    // Priority occupies two further bits; see `priority()`/`with_priority()`
    // below rather than a named constant here.

    pub fn contains(self, other: BundleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: BundleFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for BundleFlags {
    type Output = BundleFlags;
    fn bitor(self, rhs: BundleFlags) -> BundleFlags {
        BundleFlags(self.0 | rhs.0)
    }
}

/// Priority occupies bits 7-8 of the flags word (0=bulk, 1=normal, 2=expedited).
const PRIORITY_SHIFT: u32 = 7;
const PRIORITY_MASK: u64 = 0b11 << PRIORITY_SHIFT;

impl BundleFlags {
    pub fn priority(self) -> u8 {
        ((self.0 & PRIORITY_MASK) >> PRIORITY_SHIFT) as u8
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.0 = (self.0 & !PRIORITY_MASK) | (((priority as u64) & 0b11) << PRIORITY_SHIFT);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryBlock {
    pub flags: BundleFlags,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub custodian: Eid,
    pub creation_timestamp_secs: u64,
    pub creation_sequence: u64,
    pub lifetime_ms: u64,
    pub fragment_offset: u64,
    pub total_adu_length: u64,
}

impl PrimaryBlock {
    pub fn absolute_expiration_ms(&self) -> u64 {
        self.creation_timestamp_secs.saturating_mul(1000).saturating_add(self.lifetime_ms)
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(6); // version
        encode_u64(self.flags.0, out);
        encode_u64(self.destination.node, out);
        encode_u64(self.destination.service, out);
        encode_u64(self.source.node, out);
        encode_u64(self.source.service, out);
        encode_u64(self.report_to.node, out);
        encode_u64(self.report_to.service, out);
        encode_u64(self.custodian.node, out);
        encode_u64(self.custodian.service, out);
        encode_u64(self.creation_timestamp_secs, out);
        encode_u64(self.creation_sequence, out);
        encode_u64(self.lifetime_ms, out);
        if self.flags.contains(BundleFlags::IS_FRAGMENT) {
            encode_u64(self.fragment_offset, out);
            encode_u64(self.total_adu_length, out);
        }
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), BundleCodecError> {
        let mut pos = 0usize;
        let version = *buf.first().ok_or(BundleCodecError::TruncatedField("version"))?;
        if version != 6 {
            return Err(BundleCodecError::UnsupportedVersion(version));
        }
        pos += 1;

        macro_rules! sdnv {
            ($field:literal) => {{
                let (v, n) = decode_u64(&buf[pos..]).map_err(|_| BundleCodecError::TruncatedField($field))?;
                pos += n;
                v
            }};
        }

        let flags = BundleFlags(sdnv!("flags"));
        let dest = Eid::new(sdnv!("dest.node"), sdnv!("dest.service"));
        let src = Eid::new(sdnv!("src.node"), sdnv!("src.service"));
        let report_to = Eid::new(sdnv!("report_to.node"), sdnv!("report_to.service"));
        let custodian = Eid::new(sdnv!("custodian.node"), sdnv!("custodian.service"));
        let creation_timestamp_secs = sdnv!("creation_timestamp");
        let creation_sequence = sdnv!("creation_sequence");
        let lifetime_ms = sdnv!("lifetime");
        let (fragment_offset, total_adu_length) = if flags.contains(BundleFlags::IS_FRAGMENT) {
            (sdnv!("fragment_offset"), sdnv!("total_adu_length"))
        } else {
            (0, 0)
        };

        Ok((
            PrimaryBlock {
                flags,
                destination: dest,
                source: src,
                report_to,
                custodian,
                creation_timestamp_secs,
                creation_sequence,
                lifetime_ms,
                fragment_offset,
                total_adu_length,
            },
            pos,
        ))
    }
}

/// A canonical (extension) block, preserved byte-exact through storage when
/// its type is not one this codec understands natively (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBlock {
    pub block_type: u8,
    pub flags: u64,
    pub body: Vec<u8>,
}

impl CanonicalBlock {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.block_type);
        encode_u64(self.flags, out);
        encode_u64(self.body.len() as u64, out);
        out.extend_from_slice(&self.body);
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize), BundleCodecError> {
        let mut pos = 0usize;
        let block_type = *buf.first().ok_or(BundleCodecError::TruncatedField("block_type"))?;
        pos += 1;
        let (flags, n) = decode_u64(&buf[pos..]).map_err(|_| BundleCodecError::TruncatedField("block flags"))?;
        pos += n;
        let (len, n) = decode_u64(&buf[pos..]).map_err(|_| BundleCodecError::TruncatedField("block length"))?;
        pos += n;
        let len = len as usize;
        if buf.len() < pos + len {
            return Err(BundleCodecError::TruncatedField("block body"));
        }
        let body = buf[pos..pos + len].to_vec();
        pos += len;
        Ok((CanonicalBlock { block_type, flags, body }, pos))
    }
}

/// A full BPv6 bundle: primary block plus zero or more canonical blocks
/// (glossary: "Bundle").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleV6 {
    pub primary: PrimaryBlock,
    pub canonical_blocks: Vec<CanonicalBlock>,
}

impl BundleV6 {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.primary.serialize(&mut out);
        for block in &self.canonical_blocks {
            block.serialize(&mut out);
        }
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, BundleCodecError> {
        let (primary, mut pos) = PrimaryBlock::deserialize(buf)?;
        let mut canonical_blocks = Vec::new();
        while pos < buf.len() {
            let (block, n) = CanonicalBlock::deserialize(&buf[pos..])?;
            pos += n;
            canonical_blocks.push(block);
        }
        Ok(BundleV6 { primary, canonical_blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_primary() -> PrimaryBlock {
        PrimaryBlock {
            flags: BundleFlags::IS_CBHE | BundleFlags::CUSTODY_REQUESTED.with_priority(2),
            destination: Eid::new(10, 1),
            source: Eid::new(20, 1),
            report_to: Eid::new(0, 0),
            custodian: Eid::new(20, 1),
            creation_timestamp_secs: 1_700_000_000,
            creation_sequence: 7,
            lifetime_ms: 3_600_000,
            fragment_offset: 0,
            total_adu_length: 0,
        }
    }

    #[test]
    fn primary_round_trips() {
        let p = sample_primary();
        let mut buf = Vec::new();
        p.serialize(&mut buf);
        let (decoded, consumed) = PrimaryBlock::deserialize(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, p);
    }

    #[test]
    fn fragment_fields_only_present_when_flagged() {
        let mut p = sample_primary();
        p.flags.set(BundleFlags::IS_FRAGMENT);
        p.fragment_offset = 4096;
        p.total_adu_length = 65536;
        let mut buf = Vec::new();
        p.serialize(&mut buf);
        let (decoded, _) = PrimaryBlock::deserialize(&buf).unwrap();
        assert_eq!(decoded.fragment_offset, 4096);
        assert_eq!(decoded.total_adu_length, 65536);
    }

    #[test]
    fn unknown_canonical_block_preserved_byte_exact() {
        let bundle = BundleV6 {
            primary: sample_primary(),
            canonical_blocks: vec![CanonicalBlock {
                block_type: 0xee, // unrecognized by this codec
                flags: 0,
                body: vec![1, 2, 3, 4, 5],
            }],
        };
        let bytes = bundle.serialize();
        let decoded = BundleV6::deserialize(&bytes).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn priority_bits_round_trip() {
        for priority in 0u8..=2 {
            let f = BundleFlags::default().with_priority(priority);
            assert_eq!(f.priority(), priority);
        }
    }
}
