//! LTP receiver session state machine.
//!
//! ```text
//!   Idle -> Receiving -> SendingReport -> Receiving (more data arrives)
//!                                      \-> Done (red part fully claimed)
//!                    \-> Cancelled (Cx received, or session-recreation hit)
//! ```

use std::time::{Duration, Instant};

use super::fragment_map::{
    max_claims_per_report, partition_report_segment, populate_report_segment, DataFragment, FragmentSet,
    ReportSegment, AUTO_DETECT,
};
use super::wire::{CancelAckSegment, DataSegment, LtpSegment, ReportSegmentWire};
use super::SessionId;
use crate::error::LtpSessionTerminationReason;
use crate::observer::NodeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
    SendingReport,
    Done,
    Cancelled,
}

struct PendingReport {
    report: ReportSegmentWire,
    deadline: Instant,
    attempts: u32,
}

pub struct ReceiverSession {
    pub session_id: SessionId,
    pub state: ReceiverState,
    client_service_id: u32,
    red_part_length: Option<u64>,
    received: FragmentSet,
    next_report_serial: u64,
    report_segment_mtu: u32,
    report_retransmit_timeout: Duration,
    max_report_retries: u32,
    outstanding_reports: Vec<PendingReport>,
    outbound: Vec<LtpSegment>,
    events: Vec<NodeEvent>,
    termination: Option<LtpSessionTerminationReason>,
    inactivity: Option<Duration>,
    last_activity: Option<Instant>,
}

impl ReceiverSession {
    pub fn new(
        session_id: SessionId,
        client_service_id: u32,
        report_segment_mtu: u32,
        report_retransmit_timeout: Duration,
        max_report_retries: u32,
    ) -> Self {
        Self::with_inactivity(
            session_id,
            client_service_id,
            report_segment_mtu,
            report_retransmit_timeout,
            max_report_retries,
            None,
        )
    }

    /// Same as [`Self::new`] but also arms a session-inactivity timeout: a
    /// receiver that sees no data segment, checkpoint, or report-ack for
    /// `inactivity` is cancelled with `Timeout` on the next tick.
    pub fn with_inactivity(
        session_id: SessionId,
        client_service_id: u32,
        report_segment_mtu: u32,
        report_retransmit_timeout: Duration,
        max_report_retries: u32,
        inactivity: Option<Duration>,
    ) -> Self {
        ReceiverSession {
            session_id,
            state: ReceiverState::Idle,
            client_service_id,
            red_part_length: None,
            received: FragmentSet::new(),
            next_report_serial: 1,
            report_segment_mtu,
            report_retransmit_timeout,
            max_report_retries,
            outstanding_reports: Vec::new(),
            outbound: Vec::new(),
            events: Vec::new(),
            termination: None,
            inactivity,
            last_activity: None,
        }
    }

    pub fn take_outbound(&mut self) -> Vec<LtpSegment> {
        std::mem::take(&mut self.outbound)
    }

    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn termination_reason(&self) -> Option<LtpSessionTerminationReason> {
        self.termination
    }

    /// Feeds an inbound data segment. Reports are generated whenever a
    /// checkpoint is received, covering the full extent of the red part
    /// received so far.
    pub fn on_data_segment(&mut self, segment: &DataSegment, now: Instant) {
        if self.state == ReceiverState::Done || self.state == ReceiverState::Cancelled {
            return;
        }
        self.last_activity = Some(now);
        self.state = ReceiverState::Receiving;
        if !segment.is_green {
            let begin = segment.offset;
            let end = segment.offset + segment.length - 1;
            super::fragment_map::insert_fragment(&mut self.received, DataFragment::new(begin, end));
        }

        if let Some(cp) = segment.checkpoint_serial_number {
            self.emit_report(cp, now);
        }
    }

    /// Builds a report covering the reception state so far and emits it as
    /// one or more wire segments, each bounded by `report_segment_mtu`
    /// (spec §4.4: a report whose window needs more room than `mtu_report`
    /// allows must be split across multiple report segments). Completion is
    /// decided from the full, unsplit report — a partition only narrows the
    /// wire representation, never the coverage it asserts.
    fn emit_report(&mut self, checkpoint_serial_number: u64, now: Instant) {
        let lower_bound = if self.red_part_length.is_some() { 0 } else { AUTO_DETECT };
        let upper_bound = self.red_part_length.unwrap_or(AUTO_DETECT);
        let Some(full_report) = populate_report_segment(&self.received, lower_bound, upper_bound) else {
            return;
        };
        let is_complete = self.is_red_part_complete(&full_report);
        let max_claims = max_claims_per_report(self.report_segment_mtu as usize);

        self.state = ReceiverState::SendingReport;
        for partition in partition_report_segment(&full_report, max_claims) {
            let report_serial_number = self.next_report_serial;
            self.next_report_serial += 1;
            let wire = ReportSegmentWire {
                session_id: self.session_id,
                report_serial_number,
                checkpoint_serial_number,
                lower_bound: partition.lower_bound,
                upper_bound: partition.upper_bound,
                claims: partition
                    .reception_claims
                    .iter()
                    .map(|c| super::wire::ReceptionClaimWire { offset: c.offset, length: c.length })
                    .collect(),
            };
            self.outbound.push(LtpSegment::Report(wire.clone()));
            self.outstanding_reports.push(PendingReport {
                report: wire,
                deadline: now + self.report_retransmit_timeout,
                attempts: 0,
            });
        }

        if is_complete {
            self.state = ReceiverState::Done;
            self.events.push(NodeEvent::RedPartReception {
                session_id: self.session_id,
                client_service_id: self.client_service_id,
                red_part_length: full_report.upper_bound,
                is_end_of_block: true,
            });
        } else {
            self.state = ReceiverState::Receiving;
        }
    }

    fn is_red_part_complete(&self, report_segment: &ReportSegment) -> bool {
        let total: u64 = report_segment.reception_claims.iter().map(|c| c.length).sum();
        total == report_segment.upper_bound - report_segment.lower_bound
    }

    /// Acknowledges a report-ack, clearing its retransmit timer.
    pub fn on_report_ack(&mut self, report_serial_number: u64) {
        self.last_activity = Some(self.last_activity.unwrap_or_else(Instant::now));
        self.outstanding_reports.retain(|r| r.report.report_serial_number != report_serial_number);
    }

    pub fn on_timer_tick(&mut self, now: Instant) {
        if self.state == ReceiverState::Done || self.state == ReceiverState::Cancelled {
            return;
        }
        if let (Some(inactivity), Some(last_activity)) = (self.inactivity, self.last_activity) {
            if now.saturating_duration_since(last_activity) >= inactivity {
                self.cancel(LtpSessionTerminationReason::Timeout);
                return;
            }
        }
        let mut cancel = false;
        for pending in self.outstanding_reports.iter_mut() {
            if pending.deadline <= now {
                pending.attempts += 1;
                if pending.attempts > self.max_report_retries {
                    cancel = true;
                    break;
                }
                self.outbound.push(LtpSegment::Report(pending.report.clone()));
                pending.deadline = now + self.report_retransmit_timeout;
            }
        }
        if cancel {
            self.cancel(LtpSessionTerminationReason::RetransmitLimitExceeded);
        }
    }

    pub fn on_cancel(&mut self, reason_code: u8) {
        self.outbound.push(LtpSegment::CancelAck(CancelAckSegment { session_id: self.session_id }));
        self.cancel(LtpSessionTerminationReason::CancelledByPeer(reason_code));
    }

    pub fn cancel(&mut self, reason: LtpSessionTerminationReason) {
        self.state = ReceiverState::Cancelled;
        self.termination = Some(reason);
        self.events.push(NodeEvent::SessionCancelled(self.session_id, reason));
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ReceiverState::Done | ReceiverState::Cancelled)
    }

    pub fn client_service_id(&self) -> u32 {
        self.client_service_id
    }

    /// Reassembles the contiguous payload received so far, if the red part
    /// has been fully received (`[0, len)` with no gaps).
    pub fn reassembled_payload(&self, buffers: &std::collections::HashMap<u64, Vec<u8>>) -> Option<Vec<u8>> {
        if self.received.len() != 1 {
            return None;
        }
        let span = self.received.iter().next().unwrap();
        if span.begin != 0 {
            return None;
        }
        let mut out = Vec::with_capacity((span.end - span.begin + 1) as usize);
        let mut offsets: Vec<&u64> = buffers.keys().collect();
        offsets.sort();
        for offset in offsets {
            out.extend_from_slice(&buffers[offset]);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId { engine_id: 2, session_number: 9 }
    }

    fn data(offset: u64, length: u64, checkpoint: Option<u64>) -> DataSegment {
        DataSegment {
            session_id: sid(),
            is_checkpoint: checkpoint.is_some(),
            is_green: false,
            client_service_id: 1,
            offset,
            length,
            payload: vec![0u8; length as usize],
            checkpoint_serial_number: checkpoint,
            report_serial_number: None,
        }
    }

    /// A generous mtu so these tests exercise the unpartitioned (single
    /// report segment) path.
    const ROOMY_MTU: u32 = 10_000;

    #[test]
    fn full_reception_emits_red_part_event_and_completes() {
        let mut receiver = ReceiverSession::new(sid(), 1, ROOMY_MTU, Duration::from_millis(500), 3);
        let now = Instant::now();
        receiver.on_data_segment(&data(0, 500, None), now);
        receiver.on_data_segment(&data(500, 500, Some(1)), now);
        assert_eq!(receiver.state, ReceiverState::Done);
        let events = receiver.take_events();
        assert!(matches!(events[0], NodeEvent::RedPartReception { red_part_length: 1000, .. }));
    }

    #[test]
    fn gap_prevents_completion_and_report_reflects_it() {
        let mut receiver = ReceiverSession::new(sid(), 1, ROOMY_MTU, Duration::from_millis(500), 3);
        let now = Instant::now();
        receiver.on_data_segment(&data(0, 300, None), now);
        receiver.on_data_segment(&data(700, 300, Some(1)), now);
        assert_ne!(receiver.state, ReceiverState::Done);
        let outbound = receiver.take_outbound();
        assert_eq!(outbound.len(), 1);
    }

    /// A report whose window needs more room than `report_segment_mtu`
    /// allows is split across multiple wire segments, and completion is
    /// still driven off the full coverage rather than any one partition.
    #[test]
    fn report_wider_than_mtu_splits_across_segments() {
        let mut receiver = ReceiverSession::new(sid(), 1, 40, Duration::from_millis(500), 3);
        let now = Instant::now();
        // Eight disjoint one-byte claims separated by gaps, forcing eight
        // reception claims in the report; a 40-byte mtu budgets for very few
        // claims per segment (see `max_claims_per_report`).
        for i in 0..8u64 {
            receiver.on_data_segment(&data(i * 10, 1, None), now);
        }
        receiver.on_data_segment(&data(79, 1, Some(1)), now);
        let outbound = receiver.take_outbound();
        assert!(outbound.len() > 1, "report must be split into more than one segment");
        for segment in &outbound {
            let LtpSegment::Report(report) = segment else { panic!("expected report segments") };
            assert!(report.claims.len() <= 2, "each partition must respect the mtu-derived claim budget");
        }
    }

    #[test]
    fn report_resent_until_ack_then_stops() {
        let mut receiver = ReceiverSession::new(sid(), 1, ROOMY_MTU, Duration::from_millis(10), 5);
        let mut now = Instant::now();
        receiver.on_data_segment(&data(0, 100, Some(1)), now);
        receiver.take_outbound();
        now += Duration::from_millis(20);
        receiver.on_timer_tick(now);
        assert_eq!(receiver.take_outbound().len(), 1);
        receiver.on_report_ack(1);
        now += Duration::from_millis(20);
        receiver.on_timer_tick(now);
        assert_eq!(receiver.take_outbound().len(), 0);
    }
}
