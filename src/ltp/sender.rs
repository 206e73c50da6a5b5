//! LTP sender session state machine.
//!
//! ```text
//!   Idle -> Transmitting -> AwaitingReport -> Done
//!                   \              \-> Transmitting (gaps resent)
//!                    \-> Cancelled (any state, on Cx or retry exhaustion)
//! ```
//!
//! The session owns no socket; it is driven by `LtpEngine` (one reactor
//! thread per UDP port), which feeds it timer ticks and inbound
//! report segments and drains `take_outbound()` to actually send.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::wire::{DataSegment, LtpSegment, ReportSegmentWire};
use super::SessionId;
use crate::error::LtpSessionTerminationReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Transmitting,
    AwaitingReport,
    Done,
    Cancelled,
}

struct CheckpointTimer {
    serial_number: u64,
    deadline: Instant,
    attempts: u32,
    /// The data segment to resend verbatim if this checkpoint expires.
    segment: DataSegment,
}

pub struct SenderSession {
    pub session_id: SessionId,
    pub state: SenderState,
    client_service_id: u32,
    red_part_length: u64,
    mtu_data: u32,
    checkpoint_every_nth: u32,
    retransmit_timeout: Duration,
    max_retries_per_serial_number: u32,
    next_checkpoint_serial: u64,
    /// Offsets still pending first transmission.
    pending_offset: u64,
    payload: Vec<u8>,
    outstanding_checkpoints: HashMap<u64, CheckpointTimer>,
    /// Union of every reception claim seen across all report segments so
    /// far, accumulated rather than judged one report at a time so that an
    /// mtu-partitioned report (spec §4.4) — split across several
    /// `on_report_segment` calls — still converges to `Done` once their
    /// union covers the whole red part.
    received_coverage: super::fragment_map::FragmentSet,
    outbound: Vec<LtpSegment>,
    segments_since_checkpoint: u32,
    termination: Option<LtpSessionTerminationReason>,
    last_activity: Instant,
    /// `session_inactivity` from the owning engine's config, or `None` to
    /// disable the idle check (used by tests that don't care about it).
    inactivity: Option<Duration>,
}

impl SenderSession {
    pub fn new(
        session_id: SessionId,
        client_service_id: u32,
        payload: Vec<u8>,
        mtu_data: u32,
        checkpoint_every_nth: u32,
        retransmit_timeout: Duration,
        max_retries_per_serial_number: u32,
    ) -> Self {
        Self::with_inactivity(
            session_id,
            client_service_id,
            payload,
            mtu_data,
            checkpoint_every_nth,
            retransmit_timeout,
            max_retries_per_serial_number,
            None,
        )
    }

    /// Same as [`Self::new`], but wires up the `session_inactivity` timeout:
    /// a session with no progress for `session_inactivity` is cancelled,
    /// symmetrically on both the sender and receiver side.
    pub fn with_inactivity(
        session_id: SessionId,
        client_service_id: u32,
        payload: Vec<u8>,
        mtu_data: u32,
        checkpoint_every_nth: u32,
        retransmit_timeout: Duration,
        max_retries_per_serial_number: u32,
        inactivity: Option<Duration>,
    ) -> Self {
        let red_part_length = payload.len() as u64;
        SenderSession {
            session_id,
            state: SenderState::Idle,
            client_service_id,
            red_part_length,
            mtu_data,
            checkpoint_every_nth,
            retransmit_timeout,
            max_retries_per_serial_number,
            next_checkpoint_serial: 1,
            pending_offset: 0,
            payload,
            outstanding_checkpoints: HashMap::new(),
            received_coverage: super::fragment_map::FragmentSet::new(),
            outbound: Vec::new(),
            segments_since_checkpoint: 0,
            termination: None,
            last_activity: Instant::now(),
            inactivity,
        }
    }

    /// Drains segments queued for transmission since the last call.
    pub fn take_outbound(&mut self) -> Vec<LtpSegment> {
        std::mem::take(&mut self.outbound)
    }

    pub fn termination_reason(&self) -> Option<LtpSessionTerminationReason> {
        self.termination
    }

    /// Begins emitting data segments until the red part is fully covered.
    /// Every Nth segment (if `checkpoint_every_nth
    /// != 0`) is flagged checkpoint; the final segment is always a mandatory
    /// checkpoint regardless.
    pub fn start(&mut self, now: Instant) {
        self.last_activity = now;
        self.state = SenderState::Transmitting;
        while self.pending_offset < self.red_part_length {
            let remaining = self.red_part_length - self.pending_offset;
            let chunk_len = remaining.min(self.mtu_data as u64);
            let is_last = self.pending_offset + chunk_len >= self.red_part_length;
            self.segments_since_checkpoint += 1;
            let is_discretionary_checkpoint =
                self.checkpoint_every_nth != 0 && self.segments_since_checkpoint >= self.checkpoint_every_nth;
            let is_checkpoint = is_last || is_discretionary_checkpoint;

            let offset = self.pending_offset;
            let payload = self.payload[offset as usize..(offset + chunk_len) as usize].to_vec();

            let checkpoint_serial_number = if is_checkpoint {
                self.segments_since_checkpoint = 0;
                let serial = self.next_checkpoint_serial;
                self.next_checkpoint_serial += 1;
                Some(serial)
            } else {
                None
            };

            let segment = DataSegment {
                session_id: self.session_id,
                is_checkpoint,
                is_green: false,
                client_service_id: self.client_service_id,
                offset,
                length: chunk_len,
                payload,
                checkpoint_serial_number,
                report_serial_number: None,
            };

            if let Some(serial) = checkpoint_serial_number {
                self.outstanding_checkpoints.insert(
                    serial,
                    CheckpointTimer { serial_number: serial, deadline: now + self.retransmit_timeout, attempts: 0, segment: segment.clone() },
                );
            }
            self.outbound.push(LtpSegment::Data(segment));
            self.pending_offset += chunk_len;
        }
        self.state = SenderState::AwaitingReport;
    }

    /// Called periodically by the engine's timer wheel; retransmits any
    /// checkpoint whose retransmit timer has fired, cancelling the session
    /// with `RLEXC` if any checkpoint exceeds its retry budget, and with
    /// `Timeout` if no progress has been made within `session_inactivity`.
    pub fn on_timer_tick(&mut self, now: Instant) {
        let inactivity = self.inactivity;
        self.on_timer_tick_with_inactivity(now, inactivity);
    }

    /// Same as [`Self::on_timer_tick`] but with an explicit inactivity
    /// override, independent of `self.inactivity` — used by tests that want
    /// to exercise the idle check without threading it through construction.
    pub fn on_timer_tick_with_inactivity(&mut self, now: Instant, inactivity: Option<Duration>) {
        if self.state == SenderState::Done || self.state == SenderState::Cancelled {
            return;
        }
        if let Some(inactivity) = inactivity {
            if now.saturating_duration_since(self.last_activity) >= inactivity {
                self.cancel(LtpSessionTerminationReason::Timeout);
                return;
            }
        }
        let expired: Vec<u64> = self
            .outstanding_checkpoints
            .values()
            .filter(|t| t.deadline <= now)
            .map(|t| t.serial_number)
            .collect();
        for serial in expired {
            let timer = self.outstanding_checkpoints.get_mut(&serial).unwrap();
            timer.attempts += 1;
            if timer.attempts > self.max_retries_per_serial_number {
                self.cancel(LtpSessionTerminationReason::RetransmitLimitExceeded);
                return;
            }
            self.outbound.push(LtpSegment::Data(timer.segment.clone()));
            timer.deadline = now + self.retransmit_timeout;
        }
    }

    /// Processes a report segment: resends any gap in `[lowerBound,
    /// upperBound)` the report's claims don't cover, acknowledges the
    /// report's serial number, and — if the claims cover the whole red
    /// part — transitions to `Done`.
    pub fn on_report_segment(&mut self, report: &ReportSegmentWire, now: Instant) {
        if self.state == SenderState::Done || self.state == SenderState::Cancelled {
            return;
        }
        self.last_activity = now;
        self.outstanding_checkpoints.remove(&report.checkpoint_serial_number);

        for claim in &report.claims {
            let begin = report.lower_bound + claim.offset;
            super::fragment_map::insert_fragment(
                &mut self.received_coverage,
                super::fragment_map::DataFragment::new(begin, begin + claim.length - 1),
            );
        }
        let report_segment = super::fragment_map::ReportSegment {
            lower_bound: report.lower_bound,
            upper_bound: report.upper_bound,
            reception_claims: report.claims.iter().map(|c| super::fragment_map::ReceptionClaim { offset: c.offset, length: c.length }).collect(),
        };
        let mut needing_resent = super::fragment_map::FragmentSet::new();
        super::fragment_map::add_report_segment_to_fragment_set_needing_resent(&mut needing_resent, &report_segment);
        for gap in needing_resent {
            let offset = gap.begin;
            let length = gap.end - gap.begin + 1;
            let payload = self.payload[offset as usize..(offset + length) as usize].to_vec();
            let serial = self.next_checkpoint_serial;
            self.next_checkpoint_serial += 1;
            let segment = DataSegment {
                session_id: self.session_id,
                is_checkpoint: true,
                is_green: false,
                client_service_id: self.client_service_id,
                offset,
                length,
                payload,
                checkpoint_serial_number: Some(serial),
                report_serial_number: Some(report.report_serial_number),
            };
            self.outstanding_checkpoints.insert(
                serial,
                CheckpointTimer { serial_number: serial, deadline: now + self.retransmit_timeout, attempts: 0, segment: segment.clone() },
            );
            self.outbound.push(LtpSegment::Data(segment));
        }

        self.outbound.push(LtpSegment::ReportAck(super::wire::ReportAckSegment {
            session_id: self.session_id,
            report_serial_number: report.report_serial_number,
        }));

        let fully_claimed = self
            .received_coverage
            .iter()
            .any(|span| span.begin == 0 && span.end + 1 >= self.red_part_length);
        if fully_claimed {
            self.state = SenderState::Done;
        }
    }

    pub fn cancel(&mut self, reason: LtpSessionTerminationReason) {
        self.state = SenderState::Cancelled;
        self.termination = Some(reason);
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, SenderState::Done | SenderState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ltp::wire::ReceptionClaimWire;

    fn sid() -> SessionId {
        SessionId { engine_id: 1, session_number: 1 }
    }

    /// Scenario S4: sender transmits 10 checkpointed segments; first report
    /// omits segment #3's range; sender resends exactly that range; a
    /// second, fully-covering report completes the session.
    #[test]
    fn scenario_s4_ltp_red_part_retransmit() {
        let payload = vec![0xABu8; 1000]; // 10 segments of 100 bytes
        let mut sender = SenderSession::new(sid(), 1, payload.clone(), 100, 1, Duration::from_millis(500), 5);
        let now = Instant::now();
        sender.start(now);
        assert_eq!(sender.take_outbound().len(), 10);

        // First report: everything except [300, 399] (segment #3, 0-indexed 3rd chunk).
        let report = ReportSegmentWire {
            session_id: sid(),
            report_serial_number: 1,
            checkpoint_serial_number: 10, // ack the final mandatory checkpoint
            lower_bound: 0,
            upper_bound: 1000,
            claims: vec![
                ReceptionClaimWire { offset: 0, length: 300 },
                ReceptionClaimWire { offset: 400, length: 600 },
            ],
        };
        sender.on_report_segment(&report, now);
        assert_ne!(sender.state, SenderState::Done);
        let resent = sender.take_outbound();
        let resent_data: Vec<&DataSegment> = resent
            .iter()
            .filter_map(|s| if let LtpSegment::Data(d) = s { Some(d) } else { None })
            .collect();
        assert_eq!(resent_data.len(), 1);
        assert_eq!(resent_data[0].offset, 300);
        assert_eq!(resent_data[0].length, 100);

        // Second report claims everything.
        let report2 = ReportSegmentWire {
            session_id: sid(),
            report_serial_number: 2,
            checkpoint_serial_number: 11,
            lower_bound: 0,
            upper_bound: 1000,
            claims: vec![ReceptionClaimWire { offset: 0, length: 1000 }],
        };
        sender.on_report_segment(&report2, now);
        assert_eq!(sender.state, SenderState::Done);
    }

    #[test]
    fn retransmit_timeout_resends_checkpoint() {
        let mut sender = SenderSession::new(sid(), 1, vec![1, 2, 3, 4], 100, 0, Duration::from_millis(10), 3);
        let now = Instant::now();
        sender.start(now);
        sender.take_outbound();
        sender.on_timer_tick(now + Duration::from_millis(20));
        let resent = sender.take_outbound();
        assert_eq!(resent.len(), 1);
    }

    #[test]
    fn exceeding_retries_cancels_with_rlexc() {
        let mut sender = SenderSession::new(sid(), 1, vec![1, 2, 3, 4], 100, 0, Duration::from_millis(1), 1);
        let mut now = Instant::now();
        sender.start(now);
        sender.take_outbound();
        for _ in 0..3 {
            now += Duration::from_millis(5);
            sender.on_timer_tick(now);
        }
        assert_eq!(sender.state, SenderState::Cancelled);
        assert_eq!(sender.termination_reason(), Some(LtpSessionTerminationReason::RetransmitLimitExceeded));
    }
}
