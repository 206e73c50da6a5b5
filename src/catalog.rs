//! C2: Bundle Storage Catalog.
//!
//! `destinationEid -> PriorityVec[3] -> ExpirationMap[u64 -> FIFO<custodyId>]`.
//! Selection picks the lowest-priority-index non-empty bucket, then the
//! earliest expiration within it, then FIFO order among ties.
//!
//! Uses a `BTreeMap` for the expiration axis rather than the source's
//! fixed-window circular buffer of per-second buckets (`BundleStorageManager.h`,
//! `NUMBER_OF_EXPIRATIONS = 86400*2`); a sorted map avoids the fixed window's
//! `DESIGN.md` for the rationale.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::bundle::eid::Eid;
use crate::error::CatalogError;

#[derive(Debug, Clone)]
pub struct BundleDescriptor {
    pub custody_id: u64,
    pub destination_eid: Eid,
    pub priority: u8,
    pub absolute_expiration_ms: u64,
    pub total_length: u64,
    pub segment_chain: Vec<u32>,
    pub is_custodial: bool,
}

const NUM_PRIORITIES: usize = 3;

/// Where a descriptor lives, so `cancel`/`select_next` can remove it in
/// O(log expirations-in-bucket) without re-walking the whole tree.
#[derive(Debug, Clone)]
struct Locator {
    destination: Eid,
    priority: u8,
    expiration_ms: u64,
}

type ExpirationMap = BTreeMap<u64, VecDeque<u64>>;

#[derive(Default)]
struct PerDestination {
    priorities: [ExpirationMap; NUM_PRIORITIES],
}

pub struct BundleStorageCatalog {
    destinations: HashMap<Eid, PerDestination>,
    descriptors: HashMap<u64, BundleDescriptor>,
    locators: HashMap<u64, Locator>,
    len: usize,
    /// Descriptors `select_next` found already expired while scanning and
    /// dropped from the catalog. Their segments are not freed here — the
    /// caller drains this via `take_expired_from_selection` and frees them,
    /// the same division of labor `sweep_expired`'s caller already has.
    dropped_on_selection: Vec<BundleDescriptor>,
}

impl BundleStorageCatalog {
    pub fn new() -> Self {
        BundleStorageCatalog {
            destinations: HashMap::new(),
            descriptors: HashMap::new(),
            locators: HashMap::new(),
            len: 0,
            dropped_on_selection: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts into the innermost FIFO list. Equal expirations are tolerated
    /// (appended to the same bucket's deque, preserving insertion order).
    pub fn enqueue(&mut self, descriptor: BundleDescriptor) -> Result<(), CatalogError> {
        if self.descriptors.contains_key(&descriptor.custody_id) {
            return Err(CatalogError::AlreadyPresent(descriptor.custody_id));
        }
        let priority = (descriptor.priority as usize).min(NUM_PRIORITIES - 1);
        let locator = Locator {
            destination: descriptor.destination_eid.clone(),
            priority: priority as u8,
            expiration_ms: descriptor.absolute_expiration_ms,
        };
        self.destinations
            .entry(descriptor.destination_eid.clone())
            .or_default()
            .priorities[priority]
            .entry(descriptor.absolute_expiration_ms)
            .or_default()
            .push_back(descriptor.custody_id);
        self.locators.insert(descriptor.custody_id, locator);
        self.descriptors.insert(descriptor.custody_id, descriptor);
        self.len += 1;
        Ok(())
    }

    /// Same as `enqueue`, but jumps to the front of its priority/expiration
    /// bucket — used by the dispatcher's timer-expiry path to retransmit
    /// promptly (it jumps to the front because it had already been in
    /// flight").
    pub fn enqueue_front(&mut self, descriptor: BundleDescriptor) -> Result<(), CatalogError> {
        if self.descriptors.contains_key(&descriptor.custody_id) {
            return Err(CatalogError::AlreadyPresent(descriptor.custody_id));
        }
        let priority = (descriptor.priority as usize).min(NUM_PRIORITIES - 1);
        let locator = Locator {
            destination: descriptor.destination_eid.clone(),
            priority: priority as u8,
            expiration_ms: descriptor.absolute_expiration_ms,
        };
        self.destinations
            .entry(descriptor.destination_eid.clone())
            .or_default()
            .priorities[priority]
            .entry(descriptor.absolute_expiration_ms)
            .or_default()
            .push_front(descriptor.custody_id);
        self.locators.insert(descriptor.custody_id, locator);
        self.descriptors.insert(descriptor.custody_id, descriptor);
        self.len += 1;
        Ok(())
    }

    /// Pops and returns the next descriptor to release for `destination`:
    /// the FIFO head of the lowest-index non-empty priority's
    /// earliest-expiration non-empty bucket. Descriptors already expired
    /// (`expiry <= now_ms`) are silently dropped (caller is responsible for
    /// freeing their segments) and the scan continues.
    pub fn select_next(&mut self, destination: &Eid, now_ms: u64) -> Option<BundleDescriptor> {
        loop {
            let per_dest = self.destinations.get_mut(destination)?;
            let mut found: Option<(usize, u64)> = None;
            for (priority, bucket) in per_dest.priorities.iter().enumerate() {
                if let Some((&expiration, _)) = bucket.iter().next() {
                    found = Some((priority, expiration));
                    break;
                }
            }
            let (priority, expiration) = found?;
            let bucket = &mut per_dest.priorities[priority];
            let deque = bucket.get_mut(&expiration).expect("just found");
            let custody_id = deque.pop_front().expect("non-empty bucket");
            if deque.is_empty() {
                bucket.remove(&expiration);
            }
            if per_dest.priorities.iter().all(|p| p.is_empty()) {
                self.destinations.remove(destination);
            }
            self.locators.remove(&custody_id);
            let descriptor = self.descriptors.remove(&custody_id).expect("locator/descriptor in sync");
            self.len -= 1;

            if descriptor.absolute_expiration_ms <= now_ms {
                self.dropped_on_selection.push(descriptor);
                continue; // expired: caller frees its segments, keep scanning
            }
            return Some(descriptor);
        }
    }

    /// Drains the descriptors `select_next` found already expired while
    /// scanning for the next bundle to release. The caller must free each
    /// one's `segment_chain` — `select_next` only removes them from the
    /// catalog's own bookkeeping, the same split `sweep_expired` keeps with
    /// its caller.
    pub fn take_expired_from_selection(&mut self) -> Vec<BundleDescriptor> {
        std::mem::take(&mut self.dropped_on_selection)
    }

    /// Removes a descriptor by custody id regardless of destination/priority,
    /// via the side index — used by the custody-release path.
    pub fn cancel(&mut self, custody_id: u64) -> Result<BundleDescriptor, CatalogError> {
        let locator = self
            .locators
            .remove(&custody_id)
            .ok_or(CatalogError::NotFound(custody_id))?;
        let per_dest = self
            .destinations
            .get_mut(&locator.destination)
            .ok_or(CatalogError::NotFound(custody_id))?;
        let bucket = &mut per_dest.priorities[locator.priority as usize];
        let deque = bucket.get_mut(&locator.expiration_ms).ok_or(CatalogError::NotFound(custody_id))?;
        let pos = deque
            .iter()
            .position(|&id| id == custody_id)
            .ok_or(CatalogError::NotFound(custody_id))?;
        deque.remove(pos);
        if deque.is_empty() {
            bucket.remove(&locator.expiration_ms);
        }
        if per_dest.priorities.iter().all(|p| p.is_empty()) {
            self.destinations.remove(&locator.destination);
        }
        self.len -= 1;
        Ok(self.descriptors.remove(&custody_id).expect("locator/descriptor in sync"))
    }

    pub fn contains(&self, custody_id: u64) -> bool {
        self.descriptors.contains_key(&custody_id)
    }

    /// Drops every descriptor whose `absolute_expiration_ms <= now_ms`,
    /// returning the freed custody ids (periodic sweep variant of expiry
    /// handling).
    pub fn sweep_expired(&mut self, now_ms: u64) -> Vec<BundleDescriptor> {
        let expired_ids: Vec<u64> = self
            .descriptors
            .values()
            .filter(|d| d.absolute_expiration_ms <= now_ms)
            .map(|d| d.custody_id)
            .collect();
        expired_ids
            .into_iter()
            .map(|id| self.cancel(id).expect("id came from descriptors"))
            .collect()
    }
}

impl Default for BundleStorageCatalog {
    fn default() -> Self {
        Self::new()
    }
}
