//! The per-UDP-port LTP reactor: owns all session state for one
//! `LtpEngineConfig`, demultiplexes inbound segments to the right session,
//! drives timer ticks, and shapes outbound traffic through
//! [`rate_limiter::LtpSendRateLimiter`]. A single-reactor-thread-per-socket
//! layout: one struct owns a table of per-peer state machines behind one
//! mutex-free handle, driven by one `tokio` task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::LtpEngineConfig;
use crate::error::LtpError;
use crate::observer::NodeEvent;

use super::rate_limiter::LtpSendRateLimiter;
use super::receiver::ReceiverSession;
use super::sender::SenderSession;
use super::session_preventer::SessionRecreationPreventer;
use super::wire::{self, LtpSegment};
use super::SessionId;

/// One outbound datagram the caller should hand to its UDP socket.
pub struct OutboundDatagram {
    pub bytes: Vec<u8>,
}

pub struct LtpEngine {
    config: LtpEngineConfig,
    next_session_number: u64,
    senders: HashMap<SessionId, SenderSession>,
    receivers: HashMap<SessionId, ReceiverSession>,
    preventer: SessionRecreationPreventer,
    rate_limiter: LtpSendRateLimiter,
    outbound: Vec<OutboundDatagram>,
    events: Vec<NodeEvent>,
}

impl LtpEngine {
    pub fn new(config: LtpEngineConfig) -> Self {
        let preventer = SessionRecreationPreventer::new(config.session_recreation_preventer_capacity);
        let rate_limiter = LtpSendRateLimiter::new(
            config.max_send_rate_bits_per_sec,
            1.0,
            config.max_udp_packets_to_send_per_system_call,
        );
        LtpEngine {
            next_session_number: 1,
            senders: HashMap::new(),
            receivers: HashMap::new(),
            preventer,
            rate_limiter,
            outbound: Vec::new(),
            config,
            events: Vec::new(),
        }
    }

    fn round_trip_timeout(&self) -> Duration {
        let one_way: Duration = self.config.one_way_light_time.into();
        let margin: Duration = self.config.one_way_margin_time.into();
        (one_way + margin) * 2
    }

    /// Starts a new outbound session carrying `payload` as the session's red
    /// part to `client_service_id` on the configured remote engine.
    pub fn start_session(&mut self, client_service_id: u32, payload: Vec<u8>, now: Instant) -> SessionId {
        let session_id = SessionId { engine_id: self.config.engine_id, session_number: self.next_session_number };
        self.next_session_number += 1;
        let mut sender = SenderSession::with_inactivity(
            session_id,
            client_service_id,
            payload,
            self.config.ltp_data_segment_mtu,
            self.config.checkpoint_every_nth_tx_packet,
            self.round_trip_timeout(),
            self.config.max_retries_per_serial_number,
            Some(self.config.session_inactivity.into()),
        );
        sender.start(now);
        self.drain_sender_outbound(&mut sender);
        self.senders.insert(session_id, sender);
        session_id
    }

    /// Advances every live session's timers; call this on a fixed tick from
    /// the owning `tokio` task. Pure computation, no I/O inside — the caller
    /// owns the actual socket reads and writes.
    pub fn on_timer_tick(&mut self, now: Instant) {
        let mut finished_senders = Vec::new();
        for (id, sender) in self.senders.iter_mut() {
            sender.on_timer_tick(now);
            if sender.is_complete() {
                finished_senders.push(*id);
            }
        }
        for id in &finished_senders {
            self.finish_sender(*id);
        }
        for sender in self.senders.values_mut() {
            self.outbound.extend(sender.take_outbound().into_iter().map(|s| OutboundDatagram { bytes: wire::serialize(&s) }));
        }

        let mut finished_receivers = Vec::new();
        for (id, receiver) in self.receivers.iter_mut() {
            receiver.on_timer_tick(now);
            if receiver.is_complete() {
                finished_receivers.push(*id);
            }
        }
        for id in &finished_receivers {
            self.finish_receiver(*id);
        }
    }

    fn finish_sender(&mut self, id: SessionId) {
        if let Some(mut sender) = self.senders.remove(&id) {
            self.drain_sender_outbound(&mut sender);
            match sender.termination_reason() {
                Some(reason) => self.events.push(NodeEvent::SessionCancelled(id, reason)),
                None => self.events.push(NodeEvent::TransmissionSessionCompleted(id)),
            }
        }
    }

    fn finish_receiver(&mut self, id: SessionId) {
        if let Some(mut receiver) = self.receivers.remove(&id) {
            self.outbound.extend(
                receiver
                    .take_outbound()
                    .into_iter()
                    .map(|s| OutboundDatagram { bytes: wire::serialize(&s) }),
            );
            self.events.extend(receiver.take_events());
        }
    }

    fn drain_sender_outbound(&mut self, sender: &mut SenderSession) {
        for segment in sender.take_outbound() {
            self.outbound.push(OutboundDatagram { bytes: wire::serialize(&segment) });
        }
    }

    /// Processes one inbound UDP datagram.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) -> Result<(), LtpError> {
        let segment = wire::deserialize(bytes)?;
        match segment {
            LtpSegment::Data(data) => {
                let session_id = data.session_id;
                if !self.preventer.add_session(session_id.session_number) && !self.receivers.contains_key(&session_id) {
                    return Ok(()); // duplicate/resurrected session, drop
                }
                let round_trip_timeout = self.round_trip_timeout();
                let max_retries = self.config.max_retries_per_serial_number;
                let inactivity = Some(self.config.session_inactivity.into());
                let report_segment_mtu = self.config.ltp_report_segment_mtu;
                let receiver = self.receivers.entry(session_id).or_insert_with(|| {
                    ReceiverSession::with_inactivity(
                        session_id,
                        data.client_service_id,
                        report_segment_mtu,
                        round_trip_timeout,
                        max_retries,
                        inactivity,
                    )
                });
                receiver.on_data_segment(&data, now);
                if receiver.is_complete() {
                    self.finish_receiver(session_id);
                } else {
                    self.outbound.extend(
                        receiver
                            .take_outbound()
                            .into_iter()
                            .map(|s| OutboundDatagram { bytes: wire::serialize(&s) }),
                    );
                }
            }
            LtpSegment::Report(report) => {
                if let Some(sender) = self.senders.get_mut(&report.session_id) {
                    sender.on_report_segment(&report, now);
                    let done = sender.is_complete();
                    self.drain_sender_outbound(sender);
                    if done {
                        self.finish_sender(report.session_id);
                    }
                }
            }
            LtpSegment::ReportAck(ack) => {
                if let Some(receiver) = self.receivers.get_mut(&ack.session_id) {
                    receiver.on_report_ack(ack.report_serial_number);
                }
            }
            LtpSegment::Cancel(cancel) => {
                if cancel.from_sender {
                    if let Some(receiver) = self.receivers.get_mut(&cancel.session_id) {
                        receiver.on_cancel(cancel.reason_code);
                        self.outbound.extend(
                            receiver
                                .take_outbound()
                                .into_iter()
                                .map(|s| OutboundDatagram { bytes: wire::serialize(&s) }),
                        );
                        self.finish_receiver(cancel.session_id);
                    }
                } else if let Some(mut sender) = self.senders.remove(&cancel.session_id) {
                    sender.cancel(crate::error::LtpSessionTerminationReason::CancelledByPeer(cancel.reason_code));
                    self.events.push(NodeEvent::SessionCancelled(cancel.session_id, crate::error::LtpSessionTerminationReason::CancelledByPeer(cancel.reason_code)));
                    self.outbound.push(OutboundDatagram {
                        bytes: wire::serialize(&LtpSegment::CancelAck(wire::CancelAckSegment { session_id: cancel.session_id })),
                    });
                }
            }
            LtpSegment::CancelAck(_ack) => {
                // No retransmit timer is modeled for Cx/CAx themselves; receipt is advisory.
            }
        }
        Ok(())
    }

    /// Drains rate-limited outbound datagrams ready to be written to the
    /// socket right now. The caller is responsible for the actual `send`
    /// syscalls and for calling this again once budget refills.
    pub fn take_outbound(&mut self, now: Instant) -> Vec<OutboundDatagram> {
        let sizes: Vec<usize> = self.outbound.iter().map(|d| d.bytes.len()).collect();
        let n = self.rate_limiter.batch_size(&sizes, now);
        self.outbound.drain(..n).collect()
    }

    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }
}
