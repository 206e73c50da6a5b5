//! Session-recreation preventer: a bounded LRU-style history of
//! recently-completed session numbers, so a late/duplicated data segment
//! under IP fragmentation can't accidentally resurrect a finished session.
//! A fixed-size ring buffer of session numbers plus a `HashSet` for O(1)
//! membership, evicting the oldest ring slot's occupant when full.

use std::collections::HashSet;

pub struct SessionRecreationPreventer {
    capacity: usize,
    ring: Vec<u64>,
    next_index: usize,
    full: bool,
    seen: HashSet<u64>,
}

impl SessionRecreationPreventer {
    /// `capacity == 0` disables the preventer: `add_session` always reports
    /// "not previously seen" and nothing is ever remembered.
    pub fn new(capacity: usize) -> Self {
        SessionRecreationPreventer {
            capacity,
            ring: vec![0; capacity],
            next_index: 0,
            full: false,
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `session_number`. Returns `true` if it was newly inserted,
    /// `false` if it was already present (the caller should treat the
    /// incoming segment as a duplicate/resurrection attempt and drop it).
    pub fn add_session(&mut self, session_number: u64) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(session_number) {
            return false;
        }
        if self.full {
            let evicted = self.ring[self.next_index];
            self.seen.remove(&evicted);
        }
        self.ring[self.next_index] = session_number;
        self.next_index += 1;
        if self.next_index == self.capacity {
            self.next_index = 0;
            self.full = true;
        }
        true
    }

    pub fn contains_session(&self, session_number: u64) -> bool {
        self.seen.contains(&session_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_behavior_evicts_oldest_on_overflow() {
        const N: usize = 8;
        let mut p = SessionRecreationPreventer::new(N);
        for id in 0..N as u64 {
            assert!(p.add_session(id));
        }
        for id in 0..N as u64 {
            assert!(p.contains_session(id));
        }
        assert!(p.add_session(N as u64));
        assert!(!p.contains_session(0), "id 0 must be evicted");
        for id in 1..=N as u64 {
            assert!(p.contains_session(id), "id {id} must still be present");
        }
    }

    #[test]
    fn duplicate_insertion_rejected() {
        let mut p = SessionRecreationPreventer::new(4);
        assert!(p.add_session(5));
        assert!(!p.add_session(5));
    }

    #[test]
    fn zero_capacity_disables_tracking() {
        let mut p = SessionRecreationPreventer::new(0);
        assert!(p.add_session(1));
        assert!(p.add_session(1));
        assert!(!p.contains_session(1));
    }
}
