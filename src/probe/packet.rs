//! QoS wire format.
//!
//! Request:  `[magic:1][ver/flow:1][seq:1][id:2][timestamp_ms:8][title:N]`
//! Response: `[magic:1][ver/flow:1][seq:1][id:2][timestamp_ms:8]`
//!
//! Multi-byte fields are big-endian. The codec only extracts fields; magic and
//! version checks belong to the caller.

use thiserror::Error;

use crate::models::{FlowControl, FlowControlType};

pub const REQUEST_MAGIC: u8 = 0x59;
pub const RESPONSE_MAGIC: u8 = 0x95;

/// Size of the fixed header shared by requests and responses.
pub const HEADER_LEN: usize = 13;
pub const MIN_RESPONSE_LEN: usize = HEADER_LEN;
pub const MAX_PACKET_LEN: usize = 1500;
pub const MAX_TITLE_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

const VERSION_MASK: u8 = 0xF0;
const FLOW_MASK: u8 = 0x0F;
const FLOW_BAN_BIT: u8 = 0x08;
const FLOW_UNITS_MASK: u8 = 0x07;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub magic: u8,
    pub version_flow: u8,
    pub sequence: u8,
    pub identifier: u16,
    pub timestamp_ms: u64,
    pub title: Vec<u8>,
}

impl RequestPacket {
    pub fn new(title: &str, identifier: u16, sequence: u8, timestamp_ms: u64) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            version_flow: 0,
            sequence,
            identifier,
            timestamp_ms,
            title: title.as_bytes().to_vec(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.title.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        write_header(
            &mut buf,
            self.magic,
            self.version_flow,
            self.sequence,
            self.identifier,
            self.timestamp_ms,
        );
        buf.extend_from_slice(&self.title);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = read_header(buf)?;
        Ok(Self {
            magic: header.magic,
            version_flow: header.version_flow,
            sequence: header.sequence,
            identifier: header.identifier,
            timestamp_ms: header.timestamp_ms,
            title: buf[HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePacket {
    pub magic: u8,
    pub version_flow: u8,
    pub sequence: u8,
    pub identifier: u16,
    pub timestamp_ms: u64,
}

impl ResponsePacket {
    /// Build the response a server would send for `request`.
    pub fn echo(request: &RequestPacket, flow_control: FlowControl) -> Self {
        Self {
            magic: RESPONSE_MAGIC,
            version_flow: encode_flow_control(flow_control),
            sequence: request.sequence,
            identifier: request.identifier,
            timestamp_ms: request.timestamp_ms,
        }
    }

    pub fn version(&self) -> u8 {
        (self.version_flow & VERSION_MASK) >> 4
    }

    pub fn flow_control(&self) -> FlowControl {
        decode_flow_control(self.version_flow)
    }

    /// Correct magic byte and protocol version 0.
    pub fn is_valid_header(&self) -> bool {
        self.magic == RESPONSE_MAGIC && self.version() == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        write_header(
            &mut buf,
            self.magic,
            self.version_flow,
            self.sequence,
            self.identifier,
            self.timestamp_ms,
        );
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        read_header(buf)
    }
}

/// Decode the low nibble of a version/flow byte.
///
/// `0` is no flow control. With bit 3 set it is a ban whose low three bits
/// count units from zero; otherwise a throttle counting units from one.
pub fn decode_flow_control(version_flow: u8) -> FlowControl {
    let nibble = version_flow & FLOW_MASK;
    if nibble == 0 {
        FlowControl::NONE
    } else if nibble & FLOW_BAN_BIT != 0 {
        FlowControl::ban((nibble & FLOW_UNITS_MASK) + 1)
    } else {
        FlowControl::throttle(nibble & FLOW_UNITS_MASK)
    }
}

/// Encode flow control into a nibble. Units are clamped to 1..=7 for a
/// throttle and 1..=8 for a ban.
pub fn encode_flow_control(fc: FlowControl) -> u8 {
    match fc.kind {
        FlowControlType::None => 0,
        FlowControlType::Throttle => fc.units.clamp(1, 7),
        FlowControlType::Ban => FLOW_BAN_BIT | (fc.units.clamp(1, 8) - 1),
    }
}

fn write_header(
    buf: &mut Vec<u8>,
    magic: u8,
    version_flow: u8,
    sequence: u8,
    identifier: u16,
    timestamp_ms: u64,
) {
    buf.push(magic);
    buf.push(version_flow);
    buf.push(sequence);
    buf.extend_from_slice(&identifier.to_be_bytes());
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
}

/// A response is exactly the shared header, so it doubles as the header type.
fn read_header(buf: &[u8]) -> Result<ResponsePacket, PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::TooShort {
            len: buf.len(),
            min: HEADER_LEN,
        });
    }

    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&buf[5..13]);

    Ok(ResponsePacket {
        magic: buf[0],
        version_flow: buf[1],
        sequence: buf[2],
        identifier: u16::from_be_bytes([buf[3], buf[4]]),
        timestamp_ms: u64::from_be_bytes(timestamp),
    })
}
