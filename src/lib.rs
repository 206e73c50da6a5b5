//! DTN node core: BPv6/BPv7 bundle storage, an LTP convergence layer, and
//! custody-transfer accounting (see `SPEC_FULL.md`).
//!
//! Module map, leaves first (mirrors the component table in spec §2):
//! - [`segment_alloc`] — C1, the fixed-depth bitmap-tree segment allocator.
//! - [`catalog`] — C2, the `(destination, priority, expiration)` bundle
//!   storage catalog.
//! - [`storage`] — C3, segment split/reassembly and on-disk persistence.
//! - [`ltp`] — C4, the LTP session engine (sender/receiver state machines,
//!   fragment sets, the session-recreation preventer, rate limiting, wire
//!   codec).
//! - [`custody`] — C5, per-destination custody timer FIFOs.
//! - [`dispatcher`] — C6, the integrating ingress/storage/egress loop.
//! - [`bundle`] — BPv6/BPv7/CTEB wire codecs and endpoint ids.
//! - [`outduct`] — the Masker/Scheduler/Outduct collaborator traits (spec
//!   §6) the dispatcher depends on without implementing.
//! - [`config`] — plain config structs the embedding binary deserializes.
//! - [`error`] — the crate-wide error taxonomy (spec §7).
//! - [`observer`] — the typed event channel replacing the original
//!   callback-based API (spec §9).

pub mod bundle;
pub mod catalog;
pub mod config;
pub mod custody;
pub mod dispatcher;
pub mod error;
pub mod ltp;
pub mod observer;
pub mod outduct;
pub mod segment_alloc;
pub mod storage;

pub use bundle::Eid;
pub use catalog::{BundleDescriptor, BundleStorageCatalog};
pub use config::NodeConfig;
pub use custody::timers::CustodyTimers;
pub use dispatcher::{AcceptOutcome, Dispatcher};
pub use error::NodeError;
pub use observer::{NodeEvent, Observer, TracingObserver};
pub use outduct::{ForwardOutcome, IdentityMasker, Masker, Outduct, Scheduler};
pub use segment_alloc::{SegmentAllocator, CAPACITY as SEGMENT_ALLOCATOR_CAPACITY};
pub use storage::StorageEngine;
