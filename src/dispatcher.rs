//! C6: Dispatcher — the integrating loop coupling ingress, storage (C1-C3),
//! the contact schedule, custody timers, and outducts.
//!
//! Shaped around a single struct owning a handful of mutex-guarded
//! shape: one struct owning a handful of `Mutex`-guarded collections behind
//! a single handle, accessed from whichever task currently holds work,
//! rather than an actor with its own dedicated thread — the same "C2
//! catalog: single write mutex... readers allowed only via the dispatcher
//! thread that also writes" policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::bundle::custody_signal;
use crate::bundle::eid::Eid;
use crate::bundle::primary::{self, ParsedBundle};
use crate::catalog::{BundleDescriptor, BundleStorageCatalog};
use crate::custody::timers::CustodyTimers;
use crate::error::DispatchError;
use crate::observer::{NodeEvent, Observer};
use crate::outduct::{ForwardOutcome, Masker, Outduct};
use crate::storage::StorageEngine;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

/// Outcome of [`Dispatcher::accept_bundle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Delivered straight through to an outduct with an open contact
    /// (the cut-through path).
    CutThrough(u64),
    /// No contact/capacity available; persisted to the catalog (step 4).
    Stored(u64),
    /// The accepted bytes were a custody-release admin record (ACS or
    /// classic), not user data; it was consumed by the custody-release path
    /// rather than stored or forwarded. Carries the number of custody ids
    /// it reported as succeeded.
    CustodySignalProcessed(usize),
}

struct InFlight {
    descriptor: BundleDescriptor,
}

/// C6's public handle. One per node; owns C2/C3/C5 and the outduct/masker
/// registrations supplied at construction.
pub struct Dispatcher {
    catalog: Mutex<BundleStorageCatalog>,
    storage: Arc<StorageEngine>,
    custody_timers: Mutex<CustodyTimers>,
    /// Descriptors currently out for delivery and awaiting a custody signal
    /// (or, if not custodial, awaiting the final-hop egress ack) — keyed on
    /// custody id so the custody-release and timer-expiry paths can find
    /// them without re-walking the catalog (the custody-release and
    /// timer-expiry paths).
    in_flight: Mutex<HashMap<u64, InFlight>>,
    outducts: Mutex<HashMap<Eid, Arc<dyn Outduct>>>,
    /// Destinations the scheduler currently reports an open contact for
    /// (contact opens for destination D; only poll
    /// destinations currently available").
    open_contacts: Mutex<std::collections::HashSet<Eid>>,
    masker: Arc<dyn Masker>,
    next_custody_id: AtomicU64,
    ingress_capacity: usize,
    ingress_inflight: AtomicU64,
    observer: Arc<dyn Observer>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<StorageEngine>,
        custody_timeout: std::time::Duration,
        masker: Arc<dyn Masker>,
        observer: Arc<dyn Observer>,
        ingress_capacity: usize,
    ) -> Self {
        Dispatcher {
            catalog: Mutex::new(BundleStorageCatalog::new()),
            storage,
            custody_timers: Mutex::new(CustodyTimers::new(custody_timeout)),
            in_flight: Mutex::new(HashMap::new()),
            outducts: Mutex::new(HashMap::new()),
            open_contacts: Mutex::new(std::collections::HashSet::new()),
            masker,
            next_custody_id: AtomicU64::new(1),
            ingress_capacity,
            ingress_inflight: AtomicU64::new(0),
            observer,
        }
    }

    pub fn register_outduct(&self, destination: Eid, outduct: Arc<dyn Outduct>) {
        self.outducts.lock().unwrap().insert(destination, outduct);
    }

    pub fn catalog_len(&self) -> usize {
        self.catalog.lock().unwrap().len()
    }

    pub fn custody_timer_count(&self) -> usize {
        self.custody_timers.lock().unwrap().len()
    }

    /// Scheduler -> dispatcher: a contact for `destination` has opened.
    /// Drains as much of the catalog for that destination as the outduct's
    /// pipeline capacity allows.
    pub async fn on_contact_opened(&self, destination: Eid) -> Result<(), DispatchError> {
        self.open_contacts.lock().unwrap().insert(destination);
        self.release_contact(&destination).await
    }

    pub fn on_contact_closed(&self, destination: &Eid) {
        self.open_contacts.lock().unwrap().remove(destination);
    }

    fn is_contact_open(&self, destination: &Eid) -> bool {
        self.open_contacts.lock().unwrap().contains(destination)
    }

    fn outduct_for(&self, destination: &Eid) -> Option<Arc<dyn Outduct>> {
        self.outducts.lock().unwrap().get(destination).cloned()
    }

    /// Ingress -> dispatcher: parse, mask, and either cut through to an open
    /// outduct or fall back to storage (the per-bundle path on
    /// accept").
    pub async fn accept_bundle(&self, raw: Vec<u8>) -> Result<AcceptOutcome, DispatchError> {
        if self.ingress_inflight.load(Ordering::Acquire) as usize >= self.ingress_capacity {
            self.observer.on_event(NodeEvent::BackpressureEngaged);
            return Err(DispatchError::Backpressure);
        }
        self.ingress_inflight.fetch_add(1, Ordering::AcqRel);
        let result = self.accept_bundle_inner(raw).await;
        self.ingress_inflight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn accept_bundle_inner(&self, raw: Vec<u8>) -> Result<AcceptOutcome, DispatchError> {
        let parsed: ParsedBundle = primary::parse(&raw)?;

        if parsed.is_admin_record {
            let payload = parsed.admin_record_payload.as_deref().unwrap_or(&[]);
            let custody_ids = custody_signal::decode_custody_ids(payload)?;
            self.on_custody_signal(&custody_ids)?;
            self.observer.on_event(NodeEvent::CustodySignalReceived { count: custody_ids.len() });
            return Ok(AcceptOutcome::CustodySignalProcessed(custody_ids.len()));
        }

        let destination = self.masker.query(&parsed);
        let custody_id = self.next_custody_id.fetch_add(1, Ordering::Relaxed);

        if self.is_contact_open(&destination) {
            if let Some(outduct) = self.outduct_for(&destination) {
                if outduct.ready_to_send() {
                    match outduct.forward(raw.clone(), custody_id) {
                        ForwardOutcome::Ok => {
                            if parsed.custody_requested {
                                self.custody_timers.lock().unwrap().start(destination, custody_id, Instant::now());
                            }
                            self.observer.on_event(NodeEvent::CutThroughDelivered { custody_id });
                            return Ok(AcceptOutcome::CutThrough(custody_id));
                        }
                        ForwardOutcome::WouldBlock | ForwardOutcome::Failed => {
                            // fall through to storage
                        }
                    }
                }
            }
        }

        let descriptor = self
            .storage
            .store_bundle(
                custody_id,
                destination,
                parsed.priority,
                parsed.absolute_expiration_ms,
                parsed.custody_requested,
                raw,
            )
            .await?;
        self.catalog.lock().unwrap().enqueue(descriptor)?;
        self.observer.on_event(NodeEvent::Stored { custody_id });
        Ok(AcceptOutcome::Stored(custody_id))
    }

    /// Drains the catalog for `destination` while the outduct has pipeline
    /// capacity.
    async fn release_contact(&self, destination: &Eid) -> Result<(), DispatchError> {
        let Some(outduct) = self.outduct_for(destination) else {
            return Ok(());
        };
        loop {
            if !outduct.ready_to_send() {
                break;
            }
            let descriptor = {
                let mut catalog = self.catalog.lock().unwrap();
                let selected = catalog.select_next(destination, now_ms());
                let expired = catalog.take_expired_from_selection();
                drop(catalog);
                for expired_descriptor in expired {
                    self.storage.free_chain(&expired_descriptor.segment_chain)?;
                }
                match selected {
                    Some(d) => d,
                    None => break,
                }
            };
            let exact_len = descriptor.total_length as usize;
            let bytes = self.storage.read_bundle(&descriptor, exact_len).await?;
            let custody_id = descriptor.custody_id;
            match outduct.forward(bytes, custody_id) {
                ForwardOutcome::Ok => {
                    if descriptor.is_custodial {
                        self.custody_timers.lock().unwrap().start(
                            descriptor.destination_eid,
                            custody_id,
                            Instant::now(),
                        );
                        self.in_flight.lock().unwrap().insert(custody_id, InFlight { descriptor });
                    } else {
                        self.storage.free_chain(&descriptor.segment_chain)?;
                    }
                }
                ForwardOutcome::WouldBlock | ForwardOutcome::Failed => {
                    // Outduct can't take it right now; put it back at the
                    // front so FIFO order for this bucket is preserved and
                    // stop draining until the next contact-open signal.
                    self.catalog.lock().unwrap().enqueue_front(descriptor)?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Custody-release path: both ACS and classic RFC-5050 custody signals
    /// land here with one or more custody ids.
    pub fn on_custody_signal(&self, custody_ids: &[u64]) -> Result<(), DispatchError> {
        for &custody_id in custody_ids {
            self.custody_timers.lock().unwrap().cancel(custody_id);
            if let Some(in_flight) = self.in_flight.lock().unwrap().remove(&custody_id) {
                self.storage.free_chain(&in_flight.descriptor.segment_chain)?;
            }
        }
        Ok(())
    }

    /// Non-custodial final-hop egress ack: frees segments immediately
    /// without touching the custody timer set (if not custodial, free
    /// segments immediately after outduct acknowledges").
    pub fn on_outduct_ack(&self, custody_id: u64) -> Result<(), DispatchError> {
        if let Some(in_flight) = self.in_flight.lock().unwrap().remove(&custody_id) {
            if !in_flight.descriptor.is_custodial {
                self.storage.free_chain(&in_flight.descriptor.segment_chain)?;
            }
        }
        Ok(())
    }

    /// Timer-expiry path: re-enqueues any custody timer that expired for a
    /// destination with a currently open contact, jumping to the front of
    /// its priority/expiration bucket for prompt retransmission (spec
    /// §4.6).
    pub fn poll_custody_timers(&self, now: Instant) -> Result<Vec<u64>, DispatchError> {
        let available: Vec<Eid> = self.open_contacts.lock().unwrap().iter().copied().collect();
        let mut reenqueued = Vec::new();
        loop {
            let expired = self.custody_timers.lock().unwrap().poll_expired(&available, now);
            let Some((_dest, custody_id)) = expired else { break };
            let Some(in_flight) = self.in_flight.lock().unwrap().remove(&custody_id) else {
                continue;
            };
            self.catalog.lock().unwrap().enqueue_front(in_flight.descriptor)?;
            self.observer.on_event(NodeEvent::CustodyTimerExpired { custody_id });
            reenqueued.push(custody_id);
        }
        Ok(reenqueued)
    }

    /// Periodic expiration sweep over the catalog, freeing
    /// segments for anything that expired while sitting in storage.
    pub fn sweep_expired_storage(&self) -> Result<usize, DispatchError> {
        let expired = self.catalog.lock().unwrap().sweep_expired(now_ms());
        let count = expired.len();
        for descriptor in expired {
            self.storage.free_chain(&descriptor.segment_chain)?;
        }
        Ok(count)
    }
}
