//! Custody-Transfer Enhancement Block: a BPv6 canonical block, type `0x0a`,
//! carrying the per-hop custody id (glossary: CTEB). Wire format per
//! `examples/original_source/common/bpcodec/include/codec/CustodyTransferEnhancementBlock.h`:
//!
//! ```text
//! +----------------+----------------+----------------+----------------+
//! | Canonical block type 0x0a       | Block Flags*   | Block Length*  |
//! +----------------------------------+----------------+---------------+
//! | Custody ID* | CTEB creator custodian EID (variable-length string)  |
//! +--------------------------------------------------------------------+
//!   * SDNV
//! ```

use super::bpv6::CanonicalBlock;
use super::sdnv::{decode_u64, encode_u64};
use crate::error::BundleCodecError;

pub const CTEB_BLOCK_TYPE: u8 = 0x0a;

/// `1 (type) + 10 (flags sdnv) + 1 (length sdnv, 1-byte form) + 10 (custody
/// id sdnv) + 45 (longest CBHE EID string)`.
pub const CTEB_MAX_SERIALIZATION_SIZE: usize = 1 + 10 + 1 + 10 + 45;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cteb {
    pub block_flags: u64,
    pub custody_id: u64,
    pub creator_custodian_eid: String,
}

impl Cteb {
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CTEB_MAX_SERIALIZATION_SIZE);
        encode_u64(self.custody_id, &mut body);
        body.extend_from_slice(self.creator_custodian_eid.as_bytes());
        body
    }

    pub fn to_canonical_block(&self) -> CanonicalBlock {
        CanonicalBlock {
            block_type: CTEB_BLOCK_TYPE,
            flags: self.block_flags,
            body: self.serialize_body(),
        }
    }

    pub fn from_canonical_block(block: &CanonicalBlock) -> Result<Self, BundleCodecError> {
        if block.block_type != CTEB_BLOCK_TYPE {
            return Err(BundleCodecError::MalformedBundle("not a CTEB block (wrong type code)"));
        }
        let (custody_id, n) =
            decode_u64(&block.body).map_err(|_| BundleCodecError::TruncatedField("cteb.custody_id"))?;
        let eid_bytes = &block.body[n..];
        let creator_custodian_eid = String::from_utf8(eid_bytes.to_vec())
            .map_err(|_| BundleCodecError::MalformedBundle("cteb creator EID is not valid UTF-8"))?;
        Ok(Cteb { block_flags: block.flags, custody_id, creator_custodian_eid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(custody_id: u64) {
        let cteb = Cteb {
            block_flags: 0,
            custody_id,
            creator_custodian_eid: "ipn:18446744073709551615.18446744073709551615".to_string(),
        };
        let block = cteb.to_canonical_block();
        assert!(block.body.len() + 1 /* type */ + 10 /* flags sdnv worst case */ + 1
            <= CTEB_MAX_SERIALIZATION_SIZE + 10 /* generous headroom for this check */);
        let decoded = Cteb::from_canonical_block(&block).unwrap();
        assert_eq!(decoded, cteb);
    }

    #[test]
    fn round_trips_boundary_custody_ids() {
        for id in [0u64, 1, 127, 128, u32::MAX as u64, u64::MAX] {
            round_trip(id);
        }
    }

    #[test]
    fn rejects_wrong_block_type() {
        let block = CanonicalBlock { block_type: 0x01, flags: 0, body: vec![0] };
        assert!(Cteb::from_canonical_block(&block).is_err());
    }

    #[test]
    fn max_eid_form_fits_budget() {
        let cteb = Cteb {
            block_flags: 0,
            custody_id: u64::MAX,
            creator_custodian_eid: "ipn:18446744073709551615.18446744073709551615".to_string(),
        };
        let body = cteb.serialize_body();
        // type(1) + flags sdnv(<=10) + length sdnv(<=1 for bodies < 128) + body
        assert!(1 + 10 + 1 + body.len() <= CTEB_MAX_SERIALIZATION_SIZE);
    }
}
