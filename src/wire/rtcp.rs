//! RTCP packet encoding/decoding (RFC 3550 §6).
//!
//! Builds and parses compound RTCP packets: SR, RR, SDES and BYE are fully
//! modeled; APP is recognized but treated as an opaque blob to log and skip.

use crate::error::CoreError;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;

const RTCP_VERSION: u8 = 2;

pub const SDES_CNAME: u8 = 1;
pub const SDES_NAME: u8 = 2;
pub const SDES_EMAIL: u8 = 3;
pub const SDES_PHONE: u8 = 4;
pub const SDES_LOC: u8 = 5;
pub const SDES_TOOL: u8 = 6;
pub const SDES_NOTE: u8 = 7;
pub const SDES_PRIV: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenderInfo {
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32, // 24-bit value, stored in low bits
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    /// (item type, value) pairs in wire order.
    pub items: Vec<(u8, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    Sr {
        ssrc: u32,
        info: SenderInfo,
        reports: Vec<ReceptionReport>,
    },
    Rr {
        ssrc: u32,
        reports: Vec<ReceptionReport>,
    },
    Sdes {
        chunks: Vec<SdesChunk>,
    },
    Bye {
        sources: Vec<u32>,
        reason: Option<String>,
    },
    App {
        ssrc: u32,
        subtype: u8,
        name: [u8; 4],
        data: Vec<u8>,
    },
}

fn pad_to_word(buf: &mut Vec<u8>, start: usize) {
    while (buf.len() - start) % 4 != 0 {
        buf.push(0);
    }
}

fn write_header_placeholder(buf: &mut Vec<u8>, rc: u8, pt: u8) -> usize {
    buf.push(RTCP_VERSION << 6 | (rc & 0x1F));
    buf.push(pt);
    let len_pos = buf.len();
    buf.extend_from_slice(&[0, 0]);
    len_pos
}

fn backpatch_length(buf: &mut [u8], start: usize, len_pos: usize) {
    let words = (buf.len() - start) / 4 - 1;
    buf[len_pos] = (words >> 8) as u8;
    buf[len_pos + 1] = words as u8;
}

fn write_reception_report(buf: &mut Vec<u8>, r: &ReceptionReport) {
    buf.extend_from_slice(&r.ssrc.to_be_bytes());
    buf.push(r.fraction_lost);
    let lost = r.cumulative_lost & 0x00FF_FFFF;
    buf.push((lost >> 16) as u8);
    buf.push((lost >> 8) as u8);
    buf.push(lost as u8);
    buf.extend_from_slice(&r.extended_highest_seq.to_be_bytes());
    buf.extend_from_slice(&r.jitter.to_be_bytes());
    buf.extend_from_slice(&r.lsr.to_be_bytes());
    buf.extend_from_slice(&r.dlsr.to_be_bytes());
}

fn read_reception_report(data: &[u8]) -> ReceptionReport {
    ReceptionReport {
        ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        fraction_lost: data[4],
        cumulative_lost: u32::from_be_bytes([0, data[5], data[6], data[7]]),
        extended_highest_seq: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        lsr: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        dlsr: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
    }
}

/// Encode a single RTCP sub-packet (header + body), length-prefixed per
/// RFC 3550 §6.4.
fn encode_one(packet: &RtcpPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match packet {
        RtcpPacket::Sr {
            ssrc,
            info,
            reports,
        } => {
            let len_pos = write_header_placeholder(&mut buf, reports.len() as u8, PT_SR);
            buf.extend_from_slice(&ssrc.to_be_bytes());
            buf.extend_from_slice(&(info.ntp_timestamp >> 32).to_be_bytes()[4..8]);
            buf.extend_from_slice(&(info.ntp_timestamp as u32).to_be_bytes());
            buf.extend_from_slice(&info.rtp_timestamp.to_be_bytes());
            buf.extend_from_slice(&info.packet_count.to_be_bytes());
            buf.extend_from_slice(&info.octet_count.to_be_bytes());
            for r in reports {
                write_reception_report(&mut buf, r);
            }
            backpatch_length(&mut buf, 0, len_pos);
        }
        RtcpPacket::Rr { ssrc, reports } => {
            let len_pos = write_header_placeholder(&mut buf, reports.len() as u8, PT_RR);
            buf.extend_from_slice(&ssrc.to_be_bytes());
            for r in reports {
                write_reception_report(&mut buf, r);
            }
            backpatch_length(&mut buf, 0, len_pos);
        }
        RtcpPacket::Sdes { chunks } => {
            let len_pos = write_header_placeholder(&mut buf, chunks.len() as u8, PT_SDES);
            for chunk in chunks {
                let chunk_start = buf.len();
                buf.extend_from_slice(&chunk.ssrc.to_be_bytes());
                for (item_type, value) in &chunk.items {
                    let bytes = value.as_bytes();
                    buf.push(*item_type);
                    buf.push(bytes.len() as u8);
                    buf.extend_from_slice(bytes);
                }
                buf.push(0); // terminator
                pad_to_word(&mut buf, chunk_start);
            }
            backpatch_length(&mut buf, 0, len_pos);
        }
        RtcpPacket::Bye { sources, reason } => {
            let len_pos = write_header_placeholder(&mut buf, sources.len() as u8, PT_BYE);
            for ssrc in sources {
                buf.extend_from_slice(&ssrc.to_be_bytes());
            }
            if let Some(reason) = reason {
                let start = buf.len();
                let bytes = reason.as_bytes();
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
                pad_to_word(&mut buf, start);
            }
            backpatch_length(&mut buf, 0, len_pos);
        }
        RtcpPacket::App {
            ssrc,
            subtype,
            name,
            data,
        } => {
            let len_pos = write_header_placeholder(&mut buf, *subtype, PT_APP);
            buf.extend_from_slice(&ssrc.to_be_bytes());
            buf.extend_from_slice(name);
            let start = buf.len();
            buf.extend_from_slice(data);
            pad_to_word(&mut buf, start - 8); // pad relative to full APP body
            backpatch_length(&mut buf, 0, len_pos);
        }
    }
    buf
}

/// Build a compound RTCP packet. The first part MUST be SR or RR.
pub fn build_compound_rtcp(parts: &[RtcpPacket]) -> Result<Vec<u8>, CoreError> {
    match parts.first() {
        Some(RtcpPacket::Sr { .. }) | Some(RtcpPacket::Rr { .. }) => {}
        _ => return Err(CoreError::MalformedLength),
    }
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(&encode_one(part));
    }
    Ok(out)
}

/// Returns true iff `data` looks like an RTCP packet: at least 4 bytes,
/// version bits = 2, and the packet-type byte is in {200..204}.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 4 && (data[0] >> 6) == RTCP_VERSION && (PT_SR..=PT_APP).contains(&data[1])
}

/// Walk a compound RTCP packet into its sub-packets.
pub fn parse_compound_rtcp(data: &[u8]) -> Result<Vec<RtcpPacket>, CoreError> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        if data.len() - offset < 4 {
            return Err(CoreError::MalformedLength);
        }
        let rc = data[offset] & 0x1F;
        let pt = data[offset + 1];
        let length_words =
            u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if offset + packet_len > data.len() {
            return Err(CoreError::MalformedLength);
        }
        let body = &data[offset + 4..offset + packet_len];

        let parsed = match pt {
            PT_SR => {
                if body.len() < 20 {
                    return Err(CoreError::MalformedLength);
                }
                let ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let ntp_hi = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                let ntp_lo = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
                let info = SenderInfo {
                    ntp_timestamp: ((ntp_hi as u64) << 32) | ntp_lo as u64,
                    rtp_timestamp: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
                    packet_count: u32::from_be_bytes([body[16], body[17], body[18], body[19]]),
                    octet_count: u32::from_be_bytes([body[20], body[21], body[22], body[23]]),
                };
                let mut reports = Vec::with_capacity(rc as usize);
                let mut roff = 24;
                for _ in 0..rc {
                    if roff + 24 > body.len() {
                        return Err(CoreError::MalformedLength);
                    }
                    reports.push(read_reception_report(&body[roff..roff + 24]));
                    roff += 24;
                }
                RtcpPacket::Sr {
                    ssrc,
                    info,
                    reports,
                }
            }
            PT_RR => {
                if body.len() < 4 {
                    return Err(CoreError::MalformedLength);
                }
                let ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let mut reports = Vec::with_capacity(rc as usize);
                let mut roff = 4;
                for _ in 0..rc {
                    if roff + 24 > body.len() {
                        return Err(CoreError::MalformedLength);
                    }
                    reports.push(read_reception_report(&body[roff..roff + 24]));
                    roff += 24;
                }
                RtcpPacket::Rr { ssrc, reports }
            }
            PT_SDES => {
                let mut chunks = Vec::with_capacity(rc as usize);
                let mut coff = 0;
                for _ in 0..rc {
                    if coff + 4 > body.len() {
                        return Err(CoreError::MalformedLength);
                    }
                    let chunk_start = coff;
                    let ssrc = u32::from_be_bytes([
                        body[coff],
                        body[coff + 1],
                        body[coff + 2],
                        body[coff + 3],
                    ]);
                    coff += 4;
                    let mut items = Vec::new();
                    loop {
                        if coff >= body.len() {
                            return Err(CoreError::MalformedLength);
                        }
                        let item_type = body[coff];
                        if item_type == 0 {
                            coff += 1;
                            break;
                        }
                        if coff + 2 > body.len() {
                            return Err(CoreError::MalformedLength);
                        }
                        let item_len = body[coff + 1] as usize;
                        let val_start = coff + 2;
                        let val_end = val_start + item_len;
                        if val_end > body.len() {
                            return Err(CoreError::MalformedLength);
                        }
                        let value = String::from_utf8_lossy(&body[val_start..val_end]).into_owned();
                        items.push((item_type, value));
                        coff = val_end;
                    }
                    // chunk padded to 32-bit boundary.
                    let consumed = coff - chunk_start;
                    let pad = (4 - consumed % 4) % 4;
                    coff += pad;
                    chunks.push(SdesChunk { ssrc, items });
                }
                RtcpPacket::Sdes { chunks }
            }
            PT_BYE => {
                let mut sources = Vec::with_capacity(rc as usize);
                let mut coff = 0;
                for _ in 0..rc {
                    if coff + 4 > body.len() {
                        return Err(CoreError::MalformedLength);
                    }
                    sources.push(u32::from_be_bytes([
                        body[coff],
                        body[coff + 1],
                        body[coff + 2],
                        body[coff + 3],
                    ]));
                    coff += 4;
                }
                let reason = if coff < body.len() {
                    let len = body[coff] as usize;
                    let start = coff + 1;
                    let end = start + len;
                    if end > body.len() {
                        return Err(CoreError::MalformedLength);
                    }
                    Some(String::from_utf8_lossy(&body[start..end]).into_owned())
                } else {
                    None
                };
                RtcpPacket::Bye { sources, reason }
            }
            PT_APP => {
                if body.len() < 8 {
                    return Err(CoreError::MalformedLength);
                }
                let ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let mut name = [0u8; 4];
                name.copy_from_slice(&body[4..8]);
                RtcpPacket::App {
                    ssrc,
                    subtype: rc,
                    name,
                    data: body[8..].to_vec(),
                }
            }
            other => return Err(CoreError::UnknownPacketType(other)),
        };

        out.push(parsed);
        offset += packet_len;
    }

    Ok(out)
}
