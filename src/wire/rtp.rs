//! RTP packet encoding/decoding (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::ops::Range;

use crate::error::CoreError;

/// Fixed portion of the RTP header (up to and including SSRC).
pub const FIXED_HEADER_SIZE: usize = 12;

/// Fixed RTP protocol version.
pub const RTP_VERSION: u8 = 2;

/// Header extension per RFC 3550 §5.3.1: a 16-bit profile-defined id
/// followed by `data.len() / 4` 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<RtpExtension>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    fn header_len(&self) -> usize {
        let mut len = FIXED_HEADER_SIZE + self.csrc.len() * 4;
        if let Some(ext) = &self.extension {
            len += 4 + ext.data.len();
        }
        len
    }
}

/// Encode an RTP packet. Fails with `OversizedPayload` if the resulting
/// packet would exceed `mtu` bytes.
pub fn encode_rtp(header: &RtpHeader, payload: &[u8], mtu: usize) -> Result<Vec<u8>, CoreError> {
    let total_len = header.header_len() + payload.len();
    if total_len > mtu {
        return Err(CoreError::OversizedPayload {
            len: payload.len(),
            mtu,
        });
    }

    let mut buf = Vec::with_capacity(total_len);

    let ext_bit = if header.extension.is_some() { 0x10 } else { 0 };
    let pad_bit = if header.padding { 0x20 } else { 0 };
    buf.push(RTP_VERSION << 6 | pad_bit | ext_bit | (header.csrc.len() as u8 & 0x0F));
    buf.push((if header.marker { 0x80 } else { 0 }) | (header.payload_type & 0x7F));
    buf.extend_from_slice(&header.sequence_number.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(&header.ssrc.to_be_bytes());
    for csrc in &header.csrc {
        buf.extend_from_slice(&csrc.to_be_bytes());
    }
    if let Some(ext) = &header.extension {
        buf.extend_from_slice(&ext.profile.to_be_bytes());
        let words = (ext.data.len() / 4) as u16;
        buf.extend_from_slice(&words.to_be_bytes());
        buf.extend_from_slice(&ext.data);
    }
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode an RTP packet, returning the header and the byte range of the
/// payload within `data` (trailing padding, if any, is excluded).
pub fn decode_rtp(data: &[u8]) -> Result<(RtpHeader, Range<usize>), CoreError> {
    if data.len() < FIXED_HEADER_SIZE {
        return Err(CoreError::TruncatedPacket(data.len()));
    }

    let version = data[0] >> 6;
    if version != RTP_VERSION {
        return Err(CoreError::UnsupportedVersion(version));
    }

    let padding = (data[0] & 0x20) != 0;
    let has_extension = (data[0] & 0x10) != 0;
    let cc = (data[0] & 0x0F) as usize;
    let marker = (data[1] & 0x80) != 0;
    let payload_type = data[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([data[2], data[3]]);
    let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

    let csrc_end = FIXED_HEADER_SIZE + cc * 4;
    if data.len() < csrc_end {
        return Err(CoreError::TruncatedPacket(data.len()));
    }
    let mut csrc = Vec::with_capacity(cc);
    for i in 0..cc {
        let off = FIXED_HEADER_SIZE + i * 4;
        csrc.push(u32::from_be_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
        ]));
    }

    let mut payload_start = csrc_end;
    let extension = if has_extension {
        if data.len() < payload_start + 4 {
            return Err(CoreError::TruncatedPacket(data.len()));
        }
        let profile = u16::from_be_bytes([data[payload_start], data[payload_start + 1]]);
        let words = u16::from_be_bytes([data[payload_start + 2], data[payload_start + 3]]) as usize;
        let ext_data_start = payload_start + 4;
        let ext_data_end = ext_data_start + words * 4;
        if data.len() < ext_data_end {
            return Err(CoreError::TruncatedPacket(data.len()));
        }
        let ext_data = data[ext_data_start..ext_data_end].to_vec();
        payload_start = ext_data_end;
        Some(RtpExtension {
            profile,
            data: ext_data,
        })
    } else {
        None
    };

    let mut payload_end = data.len();
    if padding {
        let pad_len = *data.last().ok_or(CoreError::TruncatedPacket(data.len()))? as usize;
        if pad_len == 0 || payload_start + pad_len > payload_end {
            return Err(CoreError::TruncatedPacket(data.len()));
        }
        payload_end -= pad_len;
    }
    if payload_start > payload_end {
        return Err(CoreError::TruncatedPacket(data.len()));
    }

    Ok((
        RtpHeader {
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        },
        payload_start..payload_end,
    ))
}
