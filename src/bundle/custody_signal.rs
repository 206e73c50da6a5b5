//! Custody-signal admin records: the payload of a bundle whose primary
//! block flags carry `IS_ADMIN_RECORD`. Two forms are accepted, both
//! carrying one or more `custodyId` values directly (this core's
//! simplification of custody-release bookkeeping around the custody id the
//! CTEB already assigns per bundle, rather than RFC 5050's bundle-identity
//! tuple of source EID + creation timestamp):
//!
//! Classic (RFC 5050 §6.1) custody signal, one custody id per record:
//! ```text
//! +----------------+----------------+----------------------+----------------------+
//! | Admin rec type/flags (4/4 bits) |  Status byte          |  Time of signal*    |
//! +----------------+----------------+----------------------+----------------------+
//! |  Custody ID*                                                                  |
//! +--------------------------------------------------------------------------------+
//!   * SDNV
//! ```
//!
//! Aggregate Custody Signal (ACS): one status byte plus a run-length-encoded
//! list of custody id ranges ("fills"), so one admin record can acknowledge
//! many custody ids at once (glossary: ACS).
//! ```text
//! +----------------+----------------+----------------+
//! | Admin rec type/flags (4/4 bits) | Status byte     |
//! +----------------+----------------+----------------+
//! | Fill count*    | (start diff*, length*) x count   |
//! +----------------+-----------------------------------+
//!   * SDNV. The first fill's start diff is the absolute first custody id in
//!   the run; every subsequent fill's start diff is the gap from the
//!   previous fill's end.
//! ```

use super::sdnv::{decode_u64, encode_u64};
use crate::error::BundleCodecError;

pub const ADMIN_RECORD_TYPE_CUSTODY_SIGNAL: u8 = 0x01;
pub const ADMIN_RECORD_TYPE_AGGREGATE_CUSTODY_SIGNAL: u8 = 0x04;

const STATUS_SUCCEEDED_BIT: u8 = 0x80;

fn record_type(first_byte: u8) -> u8 {
    first_byte >> 4
}

/// Decodes the custody ids a custody-release admin record reports as
/// succeeded, dispatching on the admin record type nibble. Failed signals
/// are parsed (so a malformed trailing signal is still caught) but
/// contribute no ids — those bundles are left for custody-timer expiry to
/// retry (spec §4.6's timer-expiry path already owns that retransmission).
pub fn decode_custody_ids(payload: &[u8]) -> Result<Vec<u64>, BundleCodecError> {
    let &first = payload.first().ok_or(BundleCodecError::TruncatedField("admin record type"))?;
    match record_type(first) {
        ADMIN_RECORD_TYPE_CUSTODY_SIGNAL => decode_classic_custody_signal(payload),
        ADMIN_RECORD_TYPE_AGGREGATE_CUSTODY_SIGNAL => decode_aggregate_custody_signal(payload),
        _ => Err(BundleCodecError::MalformedBundle("unrecognized admin record type for custody release")),
    }
}

fn decode_classic_custody_signal(payload: &[u8]) -> Result<Vec<u64>, BundleCodecError> {
    let status = *payload.get(1).ok_or(BundleCodecError::TruncatedField("custody signal status"))?;
    let mut pos = 2usize;
    let (_time_of_signal_secs, n) =
        decode_u64(&payload[pos..]).map_err(|_| BundleCodecError::TruncatedField("custody signal time"))?;
    pos += n;
    let (custody_id, _) =
        decode_u64(&payload[pos..]).map_err(|_| BundleCodecError::TruncatedField("custody signal custody id"))?;
    if status & STATUS_SUCCEEDED_BIT == 0 {
        return Ok(Vec::new());
    }
    Ok(vec![custody_id])
}

fn decode_aggregate_custody_signal(payload: &[u8]) -> Result<Vec<u64>, BundleCodecError> {
    let status = *payload.get(1).ok_or(BundleCodecError::TruncatedField("acs status"))?;
    let mut pos = 2usize;
    let (fill_count, n) = decode_u64(&payload[pos..]).map_err(|_| BundleCodecError::TruncatedField("acs fill count"))?;
    pos += n;

    let mut ids = Vec::new();
    let mut cursor: u64 = 0;
    let mut first = true;
    for _ in 0..fill_count {
        let (diff, n) = decode_u64(&payload[pos..]).map_err(|_| BundleCodecError::TruncatedField("acs fill start"))?;
        pos += n;
        let (length, n) = decode_u64(&payload[pos..]).map_err(|_| BundleCodecError::TruncatedField("acs fill length"))?;
        pos += n;

        let start = if first { diff } else { cursor.saturating_add(diff) };
        first = false;
        cursor = start.saturating_add(length);

        if status & STATUS_SUCCEEDED_BIT != 0 {
            ids.extend(start..start.saturating_add(length));
        }
    }
    Ok(ids)
}

/// Encodes a classic custody signal reporting `custody_id` as succeeded or
/// failed at `time_of_signal_secs`, the wire counterpart to
/// [`decode_custody_ids`]'s classic branch.
pub fn encode_classic_custody_signal(custody_id: u64, succeeded: bool, reason: u8, time_of_signal_secs: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(ADMIN_RECORD_TYPE_CUSTODY_SIGNAL << 4);
    let status = if succeeded { STATUS_SUCCEEDED_BIT } else { 0 } | (reason & 0x7f);
    out.push(status);
    encode_u64(time_of_signal_secs, &mut out);
    encode_u64(custody_id, &mut out);
    out
}

/// Encodes an Aggregate Custody Signal over `custody_ids`, coalescing
/// consecutive ids into run-length fills the way [`decode_custody_ids`]'s
/// ACS branch expects. `custody_ids` need not be pre-sorted.
pub fn encode_aggregate_custody_signal(custody_ids: &[u64], succeeded: bool, reason: u8) -> Vec<u8> {
    let mut sorted: Vec<u64> = custody_ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for id in sorted {
        match runs.last_mut() {
            Some((start, length)) if *start + *length == id => *length += 1,
            _ => runs.push((id, 1)),
        }
    }

    let mut out = Vec::new();
    out.push(ADMIN_RECORD_TYPE_AGGREGATE_CUSTODY_SIGNAL << 4);
    let status = if succeeded { STATUS_SUCCEEDED_BIT } else { 0 } | (reason & 0x7f);
    out.push(status);
    encode_u64(runs.len() as u64, &mut out);

    let mut cursor = 0u64;
    let mut first = true;
    for (start, length) in runs {
        let diff = if first { start } else { start - cursor };
        first = false;
        encode_u64(diff, &mut out);
        encode_u64(length, &mut out);
        cursor = start + length;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_round_trips_succeeded() {
        let payload = encode_classic_custody_signal(777, true, 0, 1_700_000_000);
        let ids = decode_custody_ids(&payload).unwrap();
        assert_eq!(ids, vec![777]);
    }

    #[test]
    fn classic_failed_signal_yields_no_ids() {
        let payload = encode_classic_custody_signal(777, false, 3, 1_700_000_000);
        let ids = decode_custody_ids(&payload).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn aggregate_round_trips_contiguous_run() {
        let ids: Vec<u64> = (100..110).collect();
        let payload = encode_aggregate_custody_signal(&ids, true, 0);
        let decoded = decode_custody_ids(&payload).unwrap();
        assert_eq!(decoded, ids);
    }

    #[test]
    fn aggregate_round_trips_disjoint_runs_in_one_record() {
        let mut ids: Vec<u64> = (0..5).collect();
        ids.extend(100..103);
        ids.extend([500]);
        let payload = encode_aggregate_custody_signal(&ids, true, 0);
        let mut decoded = decode_custody_ids(&payload).unwrap();
        decoded.sort_unstable();
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn aggregate_failed_signal_yields_no_ids() {
        let payload = encode_aggregate_custody_signal(&[1, 2, 3], false, 1);
        assert!(decode_custody_ids(&payload).unwrap().is_empty());
    }

    #[test]
    fn boundary_custody_ids_round_trip() {
        for id in [0u64, 1, 127, 128, u64::MAX] {
            let payload = encode_classic_custody_signal(id, true, 0, 0);
            assert_eq!(decode_custody_ids(&payload).unwrap(), vec![id]);
        }
    }

    #[test]
    fn unrecognized_admin_record_type_is_rejected() {
        let payload = vec![0x20, 0x80, 0x00, 0x00];
        assert!(decode_custody_ids(&payload).is_err());
    }

    #[test]
    fn truncated_payload_errors_instead_of_panicking() {
        assert!(decode_custody_ids(&[]).is_err());
        assert!(decode_custody_ids(&[ADMIN_RECORD_TYPE_CUSTODY_SIGNAL << 4]).is_err());
    }
}
