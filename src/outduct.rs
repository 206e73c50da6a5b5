//! External collaborator interfaces the dispatcher depends on but does
//! not implement: the Masker, the contact-graph Scheduler, and the
//! per-destination Outduct. These are trait seams, not concrete
//! convergence-layer implementations — the CLI runners, TCPCLv4/STCP/UDP
//! socket plumbing, and CGR route computation live on the embedder's
//! side of these traits.

use crate::bundle::eid::Eid;
use crate::bundle::primary::ParsedBundle;

/// `Masker.query(bundle) -> EID`: a pure function from a bundle view to a
/// possibly-rewritten logical destination EID under which the catalog keys
/// this bundle. Never modifies the bundle itself (glossary: "Logical EID").
pub trait Masker: Send + Sync {
    fn query(&self, bundle: &ParsedBundle) -> Eid;
}

/// A `Masker` that never rewrites anything, used when no masking is
/// configured.
pub struct IdentityMasker;

impl Masker for IdentityMasker {
    fn query(&self, bundle: &ParsedBundle) -> Eid {
        bundle.destination
    }
}

/// `Scheduler.next_hop(src, dest, now) -> nodeId`: contact-graph routing,
/// a black box the dispatcher only consults for "what's the next hop right
/// now". Route computation itself is not implemented here.
pub trait Scheduler: Send + Sync {
    fn next_hop(&self, src: Eid, dest: Eid, now_ms: u64) -> Option<Eid>;
}

/// Result of one `Outduct::forward` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Ok,
    WouldBlock,
    Failed,
}

/// `Outduct.forward(bytes, user_data) -> ok|would_block|failed` plus an
/// asynchronous `on_ack(user_data)` the dispatcher is notified of out of
/// band (through [`crate::dispatcher::Dispatcher::on_outduct_ack`]) once the
/// underlying convergence layer confirms delivery.
pub trait Outduct: Send + Sync {
    /// Whether the outduct currently has pipeline capacity to accept
    /// another bundle without blocking.
    fn ready_to_send(&self) -> bool;

    fn forward(&self, bytes: Vec<u8>, user_data: u64) -> ForwardOutcome;
}
