//! LTP segment wire format (RFC 5326): a header byte (version,
//! segment type code), session id, extension counts (always zero here —
//! header/trailer extensions are not modeled by this core), then a
//! segment-specific body.

use super::SessionId;
use crate::bundle::sdnv::{decode_u64, encode_u64};
use crate::error::LtpError;

const LTP_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTypeCode {
    RedData = 0,
    RedCheckpointData = 1,
    GreenData = 2,
    ReportSegment = 3,
    ReportAck = 4,
    CancelFromSender = 5,
    CancelFromReceiver = 6,
    CancelAck = 7,
}

impl SegmentTypeCode {
    fn from_u8(v: u8) -> Result<Self, LtpError> {
        Ok(match v {
            0 => SegmentTypeCode::RedData,
            1 => SegmentTypeCode::RedCheckpointData,
            2 => SegmentTypeCode::GreenData,
            3 => SegmentTypeCode::ReportSegment,
            4 => SegmentTypeCode::ReportAck,
            5 => SegmentTypeCode::CancelFromSender,
            6 => SegmentTypeCode::CancelFromReceiver,
            7 => SegmentTypeCode::CancelAck,
            _ => return Err(LtpError::MalformedSegment("unknown segment type code")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub session_id: SessionId,
    pub is_checkpoint: bool,
    pub is_green: bool,
    pub client_service_id: u32,
    pub offset: u64,
    pub length: u64,
    pub payload: Vec<u8>,
    pub checkpoint_serial_number: Option<u64>,
    pub report_serial_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionClaimWire {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegmentWire {
    pub session_id: SessionId,
    pub report_serial_number: u64,
    pub checkpoint_serial_number: u64,
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub claims: Vec<ReceptionClaimWire>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportAckSegment {
    pub session_id: SessionId,
    pub report_serial_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelSegment {
    pub session_id: SessionId,
    pub from_sender: bool,
    pub reason_code: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelAckSegment {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LtpSegment {
    Data(DataSegment),
    Report(ReportSegmentWire),
    ReportAck(ReportAckSegment),
    Cancel(CancelSegment),
    CancelAck(CancelAckSegment),
}

fn write_header(segment_type: SegmentTypeCode, session_id: SessionId, out: &mut Vec<u8>) {
    out.push((LTP_VERSION << 4) | (segment_type as u8));
    encode_u64(session_id.engine_id, out);
    encode_u64(session_id.session_number, out);
    encode_u64(0, out); // header extension count
    encode_u64(0, out); // trailer extension count
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn sdnv(&mut self) -> Result<u64, LtpError> {
        let (v, n) =
            decode_u64(&self.buf[self.pos..]).map_err(|_| LtpError::MalformedSegment("truncated sdnv"))?;
        self.pos += n;
        Ok(v)
    }

    fn byte(&mut self) -> Result<u8, LtpError> {
        let b = *self.buf.get(self.pos).ok_or(LtpError::MalformedSegment("truncated byte"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], LtpError> {
        if self.buf.len() < self.pos + n {
            return Err(LtpError::MalformedSegment("truncated payload"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn read_header(reader: &mut Reader) -> Result<(SegmentTypeCode, SessionId), LtpError> {
    let header = reader.byte()?;
    let version = header >> 4;
    if version != LTP_VERSION {
        return Err(LtpError::MalformedSegment("unsupported LTP version"));
    }
    let segment_type = SegmentTypeCode::from_u8(header & 0x0f)?;
    let session_id = SessionId { engine_id: reader.sdnv()?, session_number: reader.sdnv()? };
    let _header_ext_count = reader.sdnv()?;
    let _trailer_ext_count = reader.sdnv()?;
    Ok((segment_type, session_id))
}

pub fn serialize(segment: &LtpSegment) -> Vec<u8> {
    let mut out = Vec::new();
    match segment {
        LtpSegment::Data(d) => {
            let ty = match (d.is_green, d.is_checkpoint) {
                (true, _) => SegmentTypeCode::GreenData,
                (false, true) => SegmentTypeCode::RedCheckpointData,
                (false, false) => SegmentTypeCode::RedData,
            };
            write_header(ty, d.session_id, &mut out);
            encode_u64(d.client_service_id as u64, &mut out);
            encode_u64(d.offset, &mut out);
            encode_u64(d.length, &mut out);
            out.extend_from_slice(&d.payload);
            if let Some(cp) = d.checkpoint_serial_number {
                out.push(1);
                encode_u64(cp, &mut out);
            } else {
                out.push(0);
            }
            if let Some(rs) = d.report_serial_number {
                out.push(1);
                encode_u64(rs, &mut out);
            } else {
                out.push(0);
            }
        }
        LtpSegment::Report(r) => {
            write_header(SegmentTypeCode::ReportSegment, r.session_id, &mut out);
            encode_u64(r.report_serial_number, &mut out);
            encode_u64(r.checkpoint_serial_number, &mut out);
            encode_u64(r.upper_bound, &mut out);
            encode_u64(r.lower_bound, &mut out);
            encode_u64(r.claims.len() as u64, &mut out);
            for claim in &r.claims {
                encode_u64(claim.offset, &mut out);
                encode_u64(claim.length, &mut out);
            }
        }
        LtpSegment::ReportAck(ra) => {
            write_header(SegmentTypeCode::ReportAck, ra.session_id, &mut out);
            encode_u64(ra.report_serial_number, &mut out);
        }
        LtpSegment::Cancel(c) => {
            let ty = if c.from_sender { SegmentTypeCode::CancelFromSender } else { SegmentTypeCode::CancelFromReceiver };
            write_header(ty, c.session_id, &mut out);
            out.push(c.reason_code);
        }
        LtpSegment::CancelAck(ca) => {
            write_header(SegmentTypeCode::CancelAck, ca.session_id, &mut out);
        }
    }
    out
}

pub fn deserialize(buf: &[u8]) -> Result<LtpSegment, LtpError> {
    let mut reader = Reader { buf, pos: 0 };
    let (segment_type, session_id) = read_header(&mut reader)?;
    Ok(match segment_type {
        SegmentTypeCode::RedData | SegmentTypeCode::RedCheckpointData | SegmentTypeCode::GreenData => {
            let client_service_id = reader.sdnv()? as u32;
            let offset = reader.sdnv()?;
            let length = reader.sdnv()?;
            let payload = reader.bytes(length as usize)?.to_vec();
            let has_cp = reader.byte()? == 1;
            let checkpoint_serial_number = if has_cp { Some(reader.sdnv()?) } else { None };
            let has_rs = reader.byte()? == 1;
            let report_serial_number = if has_rs { Some(reader.sdnv()?) } else { None };
            LtpSegment::Data(DataSegment {
                session_id,
                is_checkpoint: matches!(segment_type, SegmentTypeCode::RedCheckpointData),
                is_green: matches!(segment_type, SegmentTypeCode::GreenData),
                client_service_id,
                offset,
                length,
                payload,
                checkpoint_serial_number,
                report_serial_number,
            })
        }
        SegmentTypeCode::ReportSegment => {
            let report_serial_number = reader.sdnv()?;
            let checkpoint_serial_number = reader.sdnv()?;
            let upper_bound = reader.sdnv()?;
            let lower_bound = reader.sdnv()?;
            let claim_count = reader.sdnv()?;
            let mut claims = Vec::with_capacity(claim_count as usize);
            for _ in 0..claim_count {
                let offset = reader.sdnv()?;
                let length = reader.sdnv()?;
                claims.push(ReceptionClaimWire { offset, length });
            }
            LtpSegment::Report(ReportSegmentWire {
                session_id,
                report_serial_number,
                checkpoint_serial_number,
                lower_bound,
                upper_bound,
                claims,
            })
        }
        SegmentTypeCode::ReportAck => {
            LtpSegment::ReportAck(ReportAckSegment { session_id, report_serial_number: reader.sdnv()? })
        }
        SegmentTypeCode::CancelFromSender | SegmentTypeCode::CancelFromReceiver => {
            LtpSegment::Cancel(CancelSegment {
                session_id,
                from_sender: matches!(segment_type, SegmentTypeCode::CancelFromSender),
                reason_code: reader.byte()?,
            })
        }
        SegmentTypeCode::CancelAck => LtpSegment::CancelAck(CancelAckSegment { session_id }),
    })
}
