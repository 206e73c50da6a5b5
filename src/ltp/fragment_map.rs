//! Fragment sets: a sorted set of disjoint, non-abutting `[begin, end]`
//! byte intervals, used by LTP receivers to track reception claims.

use std::collections::BTreeSet;

/// Half-open-by-convention closed interval `[begin, end]` (both inclusive),
/// matching the source's `data_fragment_t`. Ordering treats touching or
/// overlapping intervals as equal, so inserting one into a `BTreeSet`
/// collides with (rather than sits beside) any interval it abuts or
/// overlaps — the mechanism `insert_fragment` uses to coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFragment {
    pub begin: u64,
    pub end: u64,
}

impl DataFragment {
    pub fn new(begin: u64, end: u64) -> Self {
        DataFragment { begin, end }
    }
}

impl PartialOrd for DataFragment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataFragment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `self < other` iff `self.end + 1 < other.begin` (no overlap, no
        // abutment); `other < self` symmetrically; otherwise equal. This is
        // the exact comparator `data_fragment_t::operator<` implements.
        if self.end.saturating_add(1) < other.begin {
            std::cmp::Ordering::Less
        } else if other.end.saturating_add(1) < self.begin {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    }
}

pub type FragmentSet = BTreeSet<DataFragment>;

/// Inserts `key`, expanding and re-inserting in place of any interval it
/// overlaps or abuts, repeating until a non-colliding insertion succeeds.
/// Idempotent and commutative: the final set depends only on the union of
/// all inserted intervals, not on insertion order (testable property #3).
pub fn insert_fragment(set: &mut FragmentSet, mut key: DataFragment) {
    loop {
        match set.get(&key) {
            None => {
                set.insert(key);
                return;
            }
            Some(existing) => {
                if key.begin >= existing.begin && key.end <= existing.end {
                    return; // fits entirely inside; set already covers it
                }
                let merged = DataFragment::new(key.begin.min(existing.begin), key.end.max(existing.end));
                set.remove(existing);
                key = merged;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub reception_claims: Vec<ReceptionClaim>,
}

/// Sentinel meaning "auto-detect this bound from the set's extremes",
/// matching the source's `UINT64_MAX` convention.
pub const AUTO_DETECT: u64 = u64::MAX;

/// Builds a report segment covering `[lower_bound, upper_bound)` (or
/// auto-detected extremes) from the current fragment set.
pub fn populate_report_segment(
    set: &FragmentSet,
    mut lower_bound: u64,
    mut upper_bound: u64,
) -> Option<ReportSegment> {
    if set.is_empty() {
        return None;
    }

    if lower_bound == AUTO_DETECT {
        lower_bound = set.iter().next().unwrap().begin;
    }

    if upper_bound == AUTO_DETECT {
        upper_bound = set.iter().next_back().unwrap().end + 1;
    }
    if lower_bound >= upper_bound {
        return None;
    }
    let span = upper_bound - lower_bound;

    let probe = DataFragment::new(lower_bound, lower_bound);
    let mut claims = Vec::with_capacity(set.len());
    for fragment in set.range(probe..) {
        let begin = fragment.begin.max(lower_bound);
        if begin >= upper_bound {
            break;
        }
        let offset = begin - lower_bound;
        let mut length = (fragment.end + 1) - begin;
        length = length.min(span);
        length = length.min(upper_bound - begin);
        if length > 0 {
            claims.push(ReceptionClaim { offset, length });
        }
    }
    Some(ReportSegment { lower_bound, upper_bound, reception_claims: claims })
}

/// Reconstructs a fragment set from a report segment's reception claims.
pub fn add_report_segment_to_fragment_set(set: &mut FragmentSet, report: &ReportSegment) {
    for claim in &report.reception_claims {
        let begin = report.lower_bound + claim.offset;
        insert_fragment(set, DataFragment::new(begin, begin + claim.length - 1));
    }
}

/// Computes the complement of `report`'s reception claims within
/// `[lower_bound, upper_bound)` — the set of byte ranges the sender still
/// needs to retransmit (scenario S6).
pub fn add_report_segment_to_fragment_set_needing_resent(
    needing_resent: &mut FragmentSet,
    report: &ReportSegment,
) {
    if report.reception_claims.is_empty() {
        return;
    }
    let lower_bound = report.lower_bound;
    let first = &report.reception_claims[0];
    if first.offset > 0 {
        insert_fragment(needing_resent, DataFragment::new(lower_bound, lower_bound + first.offset - 1));
    }
    let mut previous: Option<&ReceptionClaim> = None;
    for claim in &report.reception_claims {
        if let Some(prev) = previous {
            let begin = lower_bound + prev.offset + prev.length;
            let end = (lower_bound + claim.offset).saturating_sub(1);
            if begin <= end {
                insert_fragment(needing_resent, DataFragment::new(begin, end));
            }
        }
        previous = Some(claim);
    }
    let last = previous.expect("checked non-empty above");
    let begin = lower_bound + last.offset + last.length;
    if begin < report.upper_bound {
        insert_fragment(needing_resent, DataFragment::new(begin, report.upper_bound - 1));
    }
}

/// Worst-case SDNV-encoded size of one reception claim: two SDNVs (offset,
/// length) at up to 10 bytes each, the same bound `cteb.rs`'s
/// `CTEB_MAX_SERIALIZATION_SIZE` uses for its own SDNV fields.
const MAX_CLAIM_WIRE_BYTES: usize = 20;

/// Worst-case fixed overhead of one report segment on the wire: a segment
/// type byte plus seven SDNV fields (session id's two halves, report serial
/// number, checkpoint serial number, lower bound, upper bound, claim count),
/// each up to 10 bytes.
const REPORT_FIXED_OVERHEAD_BYTES: usize = 1 + 10 * 7;

/// How many reception claims fit in one report segment bounded by
/// `mtu_report` bytes, conservatively. Used to split a report whose window
/// is too wide for one segment into several (spec §4.4).
pub fn max_claims_per_report(mtu_report: usize) -> usize {
    let usable = mtu_report.saturating_sub(REPORT_FIXED_OVERHEAD_BYTES);
    (usable / MAX_CLAIM_WIRE_BYTES).max(1)
}

/// Splits `full` into one or more report segments with at most `max_claims`
/// reception claims each. Each partition re-windows its `lower_bound`/
/// `upper_bound` to span only its own claims and re-offsets them relative to
/// that sub-window, so every partition is a self-contained, valid
/// `ReportSegment` on the wire. An empty-claims report (nothing received
/// yet) is returned unpartitioned.
pub fn partition_report_segment(full: &ReportSegment, max_claims: usize) -> Vec<ReportSegment> {
    if full.reception_claims.len() <= max_claims.max(1) {
        return vec![full.clone()];
    }
    full.reception_claims
        .chunks(max_claims.max(1))
        .map(|chunk| {
            let base_offset = chunk[0].offset;
            let last = chunk.last().expect("chunks are non-empty");
            let window_lower = full.lower_bound + base_offset;
            let window_upper = full.lower_bound + last.offset + last.length;
            let reception_claims = chunk
                .iter()
                .map(|c| ReceptionClaim { offset: c.offset - base_offset, length: c.length })
                .collect();
            ReportSegment { lower_bound: window_lower, upper_bound: window_upper, reception_claims }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_coalesces_overlaps_and_abutments() {
        let mut set = FragmentSet::new();
        insert_fragment(&mut set, DataFragment::new(0, 9));
        insert_fragment(&mut set, DataFragment::new(10, 19)); // abuts
        assert_eq!(set.len(), 1);
        assert_eq!(*set.iter().next().unwrap(), DataFragment::new(0, 19));

        insert_fragment(&mut set, DataFragment::new(15, 25)); // overlaps
        assert_eq!(set.len(), 1);
        assert_eq!(*set.iter().next().unwrap(), DataFragment::new(0, 25));
    }

    #[test]
    fn insert_is_commutative() {
        let mut forward = FragmentSet::new();
        for f in [DataFragment::new(0, 9), DataFragment::new(20, 29), DataFragment::new(10, 19)] {
            insert_fragment(&mut forward, f);
        }
        let mut reverse = FragmentSet::new();
        for f in [DataFragment::new(10, 19), DataFragment::new(20, 29), DataFragment::new(0, 9)] {
            insert_fragment(&mut reverse, f);
        }
        assert_eq!(forward, reverse);
    }

    #[test]
    fn non_adjacent_fragments_stay_separate() {
        let mut set = FragmentSet::new();
        insert_fragment(&mut set, DataFragment::new(0, 9));
        insert_fragment(&mut set, DataFragment::new(11, 19)); // gap at byte 10
        assert_eq!(set.len(), 2);
    }

    /// Scenario S6.
    #[test]
    fn scenario_s6_fragment_set_report() {
        let mut set = FragmentSet::new();
        insert_fragment(&mut set, DataFragment::new(1000, 2999));
        insert_fragment(&mut set, DataFragment::new(4000, 4499));

        let report = populate_report_segment(&set, 1000, 6000).unwrap();
        assert_eq!(report.lower_bound, 1000);
        assert_eq!(report.upper_bound, 6000);
        assert_eq!(
            report.reception_claims,
            vec![ReceptionClaim { offset: 0, length: 2000 }, ReceptionClaim { offset: 3000, length: 500 }]
        );

        let mut needing_resent = FragmentSet::new();
        add_report_segment_to_fragment_set_needing_resent(&mut needing_resent, &report);
        let expected: FragmentSet =
            [DataFragment::new(3000, 3999), DataFragment::new(4500, 5999)].into_iter().collect();
        assert_eq!(needing_resent, expected);
    }

    #[test]
    fn auto_detect_bounds_use_set_extremes() {
        let mut set = FragmentSet::new();
        insert_fragment(&mut set, DataFragment::new(100, 199));
        insert_fragment(&mut set, DataFragment::new(300, 399));
        let report = populate_report_segment(&set, AUTO_DETECT, AUTO_DETECT).unwrap();
        assert_eq!(report.lower_bound, 100);
        assert_eq!(report.upper_bound, 400);
    }

    #[test]
    fn reconstructs_fragment_set_from_report() {
        let report = ReportSegment {
            lower_bound: 1000,
            upper_bound: 6000,
            reception_claims: vec![ReceptionClaim { offset: 0, length: 2000 }, ReceptionClaim { offset: 3000, length: 500 }],
        };
        let mut set = FragmentSet::new();
        add_report_segment_to_fragment_set(&mut set, &report);
        let expected: FragmentSet =
            [DataFragment::new(1000, 2999), DataFragment::new(4000, 4499)].into_iter().collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn claims_union_stays_within_window() {
        let mut set = FragmentSet::new();
        insert_fragment(&mut set, DataFragment::new(0, 999));
        let report = populate_report_segment(&set, 0, 500).unwrap();
        for claim in &report.reception_claims {
            assert!(claim.offset + claim.length <= report.upper_bound - report.lower_bound);
        }
    }

    #[test]
    fn report_under_budget_is_not_partitioned() {
        let report = ReportSegment {
            lower_bound: 0,
            upper_bound: 1000,
            reception_claims: vec![ReceptionClaim { offset: 0, length: 1000 }],
        };
        let partitions = partition_report_segment(&report, max_claims_per_report(200));
        assert_eq!(partitions, vec![report]);
    }

    #[test]
    fn report_over_budget_splits_into_several_self_contained_segments() {
        // Ten disjoint, non-abutting claims, one byte apart so they don't coalesce.
        let mut set = FragmentSet::new();
        for i in 0..10u64 {
            let base = i * 10;
            insert_fragment(&mut set, DataFragment::new(base, base + 4));
        }
        let full = populate_report_segment(&set, 0, 100).unwrap();
        assert_eq!(full.reception_claims.len(), 10);

        let max_claims = 3;
        let partitions = partition_report_segment(&full, max_claims);
        assert_eq!(partitions.len(), 4); // 3 + 3 + 3 + 1

        // Every partition's claims re-offset relative to its own window and
        // reassemble, via `add_report_segment_to_fragment_set`, to the same
        // set that `full` would reconstruct.
        let mut reassembled = FragmentSet::new();
        for partition in &partitions {
            assert!(partition.reception_claims.len() <= max_claims);
            add_report_segment_to_fragment_set(&mut reassembled, partition);
        }
        let mut expected = FragmentSet::new();
        add_report_segment_to_fragment_set(&mut expected, &full);
        assert_eq!(reassembled, expected);
    }

    #[test]
    fn max_claims_per_report_is_at_least_one() {
        assert_eq!(max_claims_per_report(0), 1);
        assert_eq!(max_claims_per_report(10), 1);
    }
}
