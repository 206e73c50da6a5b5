//! Custody transfer timers (spec §4.5, C5): tracks, per final-destination
//! EID, which custody ids are waiting on a custody signal and when each one
//! times out. Grounded directly on
//! `examples/original_source/module/storage/{include,src}/CustodyTimers.{h,cpp}`:
//! a FIFO list per destination plus a side index for O(1) cancellation,
//! since timers for one destination always expire in insertion order.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::bundle::eid::Eid;

struct Entry {
    custody_id: u64,
    deadline: Instant,
}

pub struct CustodyTimers {
    timeout: Duration,
    by_dest: HashMap<Eid, VecDeque<Entry>>,
    dest_of: HashMap<u64, Eid>,
}

impl CustodyTimers {
    pub fn new(timeout: Duration) -> Self {
        CustodyTimers { timeout, by_dest: HashMap::new(), dest_of: HashMap::new() }
    }

    /// Starts a timer for `custody_id` destined to `final_dest_eid`. Returns
    /// `false` (no-op) if a timer for that custody id is already running.
    pub fn start(&mut self, final_dest_eid: Eid, custody_id: u64, now: Instant) -> bool {
        if self.dest_of.contains_key(&custody_id) {
            return false;
        }
        self.by_dest
            .entry(final_dest_eid)
            .or_default()
            .push_back(Entry { custody_id, deadline: now + self.timeout });
        self.dest_of.insert(custody_id, final_dest_eid);
        true
    }

    /// Cancels the timer for `custody_id` (a custody signal arrived).
    /// Returns `false` if no such timer was running.
    pub fn cancel(&mut self, custody_id: u64) -> bool {
        let Some(dest) = self.dest_of.remove(&custody_id) else {
            return false;
        };
        if let Some(list) = self.by_dest.get_mut(&dest) {
            if let Some(pos) = list.iter().position(|e| e.custody_id == custody_id) {
                list.remove(pos);
            }
            if list.is_empty() {
                self.by_dest.remove(&dest);
            }
        }
        true
    }

    /// Pops one expired timer whose destination is in `available_dest_eids`,
    /// preferring the earliest-expiring among them. Used when only a subset
    /// of destinations currently have an open contact worth retransmitting
    /// over.
    pub fn poll_expired(&mut self, available_dest_eids: &[Eid], now: Instant) -> Option<(Eid, u64)> {
        let mut best: Option<(Eid, Instant)> = None;
        for dest in available_dest_eids {
            if let Some(front) = self.by_dest.get(dest).and_then(|list| list.front()) {
                if front.deadline <= now {
                    match best {
                        Some((_, deadline)) if deadline <= front.deadline => {}
                        _ => best = Some((*dest, front.deadline)),
                    }
                }
            }
        }
        let (dest, _) = best?;
        let list = self.by_dest.get_mut(&dest)?;
        let entry = list.pop_front()?;
        if list.is_empty() {
            self.by_dest.remove(&dest);
        }
        self.dest_of.remove(&entry.custody_id);
        Some((dest, entry.custody_id))
    }

    /// Pops one expired timer regardless of destination.
    pub fn poll_any_expired(&mut self, now: Instant) -> Option<u64> {
        let dest = self
            .by_dest
            .iter()
            .filter_map(|(dest, list)| list.front().filter(|e| e.deadline <= now).map(|e| (*dest, e.deadline)))
            .min_by_key(|(_, deadline)| *deadline)
            .map(|(dest, _)| dest)?;
        let list = self.by_dest.get_mut(&dest)?;
        let entry = list.pop_front()?;
        if list.is_empty() {
            self.by_dest.remove(&dest);
        }
        self.dest_of.remove(&entry.custody_id);
        Some(entry.custody_id)
    }

    pub fn len(&self) -> usize {
        self.dest_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dest_of.is_empty()
    }

    pub fn len_for_dest(&self, dest: &Eid) -> usize {
        self.by_dest.get(dest).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(n: u64) -> Eid {
        Eid::new(n, 1)
    }

    /// Boundary behavior from spec §8: start(d,c); advance_clock(T-1);
    /// poll_expired == None; advance_clock(1); poll_expired == c.
    #[test]
    fn boundary_behavior_fires_exactly_at_timeout() {
        let mut timers = CustodyTimers::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let dest = eid(1);
        timers.start(dest, 42, t0);

        let almost = t0 + Duration::from_millis(99);
        assert_eq!(timers.poll_expired(&[dest], almost), None);

        let exact = t0 + Duration::from_millis(100);
        assert_eq!(timers.poll_expired(&[dest], exact), Some((dest, 42)));
    }

    #[test]
    fn cancel_prevents_expiry() {
        let mut timers = CustodyTimers::new(Duration::from_millis(10));
        let t0 = Instant::now();
        let dest = eid(2);
        timers.start(dest, 7, t0);
        assert!(timers.cancel(7));
        assert_eq!(timers.poll_expired(&[dest], t0 + Duration::from_millis(100)), None);
    }

    #[test]
    fn fifo_order_within_one_destination() {
        let mut timers = CustodyTimers::new(Duration::from_millis(10));
        let t0 = Instant::now();
        let dest = eid(3);
        timers.start(dest, 1, t0);
        timers.start(dest, 2, t0 + Duration::from_millis(1));
        let later = t0 + Duration::from_millis(50);
        assert_eq!(timers.poll_expired(&[dest], later), Some((dest, 1)));
        assert_eq!(timers.poll_expired(&[dest], later), Some((dest, 2)));
        assert_eq!(timers.poll_expired(&[dest], later), None);
    }

    #[test]
    fn poll_any_expired_ignores_availability_filter() {
        let mut timers = CustodyTimers::new(Duration::from_millis(5));
        let t0 = Instant::now();
        timers.start(eid(4), 99, t0);
        let later = t0 + Duration::from_millis(50);
        assert_eq!(timers.poll_any_expired(later), Some(99));
    }

    #[test]
    fn duplicate_start_for_same_custody_id_is_rejected() {
        let mut timers = CustodyTimers::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(timers.start(eid(5), 1, t0));
        assert!(!timers.start(eid(5), 1, t0));
        assert_eq!(timers.len(), 1);
    }
}
