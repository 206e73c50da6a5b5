//! Typed event channel replacing the original C++ user callbacks
//! (`TransmissionSessionCompleted`, `RedPartReception`, `SessionCancelled`),
//! generalized to dispatcher-level events too (design note §9: "Callbacks vs
//! result channels").

use crate::ltp::SessionId;
use crate::error::LtpSessionTerminationReason;

/// Events an embedder can observe without the core depending on any
/// particular telemetry sink (design note §9: "Global state").
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// C4: a sender session finished transmitting its red part and the
    /// final report claimed full coverage.
    TransmissionSessionCompleted(SessionId),
    /// C4: a receiver session's fragment set now equals `[0, redPartLength)`.
    RedPartReception {
        session_id: SessionId,
        client_service_id: u32,
        red_part_length: u64,
        is_end_of_block: bool,
    },
    /// C4: a session (sender or receiver) was torn down.
    SessionCancelled(SessionId, LtpSessionTerminationReason),
    /// C6: a bundle was accepted via cut-through.
    CutThroughDelivered { custody_id: u64 },
    /// C6: a bundle was stored because no contact/capacity was available.
    Stored { custody_id: u64 },
    /// C6: ingress refused an accept due to backpressure.
    BackpressureEngaged,
    /// C6: a custody timer expired and the bundle was re-enqueued.
    CustodyTimerExpired { custody_id: u64 },
    /// C3: a store file was marked degraded after repeated I/O failures.
    StoreDegraded { store_index: usize },
    /// C6: an inbound ACS or classic custody-signal admin record was
    /// processed, releasing `count` custody ids.
    CustodySignalReceived { count: usize },
}

/// Anything that wants to watch the node's behavior implements this. The
/// core never assumes a particular sink (log line, metrics counter,
/// websocket push) lives behind it.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: NodeEvent);
}

/// An `Observer` that only forwards events into `tracing`, used when no
/// embedder-supplied observer is configured.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::TransmissionSessionCompleted(id) => {
                tracing::info!(session = ?id, "LTP transmission session completed")
            }
            NodeEvent::RedPartReception { session_id, red_part_length, .. } => {
                tracing::info!(session = ?session_id, red_part_length, "LTP red part received")
            }
            NodeEvent::SessionCancelled(id, reason) => {
                tracing::warn!(session = ?id, %reason, "LTP session cancelled")
            }
            NodeEvent::CutThroughDelivered { custody_id } => {
                tracing::debug!(custody_id, "cut-through delivery")
            }
            NodeEvent::Stored { custody_id } => {
                tracing::debug!(custody_id, "bundle stored")
            }
            NodeEvent::BackpressureEngaged => {
                tracing::warn!("ingress backpressure engaged")
            }
            NodeEvent::CustodyTimerExpired { custody_id } => {
                tracing::info!(custody_id, "custody timer expired, re-enqueued")
            }
            NodeEvent::StoreDegraded { store_index } => {
                tracing::error!(store_index, "store file degraded")
            }
            NodeEvent::CustodySignalReceived { count } => {
                tracing::debug!(count, "custody signal processed")
            }
        }
    }
}
