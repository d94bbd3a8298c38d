//! RCT frame codec
//!
//! Wire layout, after the start marker and with escaping removed:
//!
//! ```text
//! +---------+--------------+---------------------------------+---------+
//! | command | length (1|2) | [address(4)] oid(4) data(...)   | crc(2)  |
//! +---------+--------------+---------------------------------+---------+
//! ```
//!
//! Every `+` or `-` inside the frame is preceded by `-`. The CRC is
//! CRC-16/CCITT-FALSE over command, length and payload, padded with one zero
//! byte when that span has odd length.
//!
//! Decoding never fails the stream: malformed candidates come back as
//! [`DecodeEvent::Error`] after the offending bytes have been consumed, so the
//! next call resumes at the next start marker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::command::Command;
use super::value::{DataKind, Value};

pub const START_BYTE: u8 = b'+';
pub const ESCAPE_BYTE: u8 = b'-';

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const OID_LEN: usize = 4;
const ADDRESS_LEN: usize = 4;
/// Largest plausible payload for an identifier of numeric kind
const MAX_NUMERIC_LENGTH: usize = 30;
/// Largest plausible string payload outside of long frames
const MAX_STRING_LENGTH: usize = 251;

/// Classification of a malformed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    Crc,
    Command,
    Payload,
    Length,
}

impl DecodeErrorKind {
    pub const ALL: [DecodeErrorKind; 4] = [Self::Crc, Self::Command, Self::Payload, Self::Length];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crc => "crc",
            Self::Command => "command",
            Self::Payload => "payload",
            Self::Length => "length",
        }
    }
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame (or its payload) that could not be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    /// Identifier, when enough of the frame was read to know it
    pub oid: Option<u32>,
    pub message: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            oid: None,
            message: message.into(),
        }
    }

    fn with_oid(mut self, oid: u32) -> Self {
        self.oid = Some(oid);
        self
    }
}

/// One well-formed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Device address, present on plant frames only
    pub address: Option<u32>,
    pub oid: u32,
    pub data: Bytes,
}

impl Frame {
    /// Read request for a single identifier
    pub fn read(oid: u32) -> Self {
        Self {
            command: Command::Read,
            address: None,
            oid,
            data: Bytes::new(),
        }
    }

    /// Response carrying `data`, switching to a long response when the payload
    /// does not fit a one byte length
    pub fn response(oid: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let command = if OID_LEN + data.len() > usize::from(u8::MAX) {
            Command::LongResponse
        } else {
            Command::Response
        };
        Self {
            command,
            address: None,
            oid,
            data,
        }
    }

    /// Declared length: identifier, optional address and data
    pub fn payload_len(&self) -> usize {
        let address = if self.address.is_some() { ADDRESS_LEN } else { 0 };
        address + OID_LEN + self.data.len()
    }

    /// Decode the data part as `kind`
    pub fn value(&self, kind: DataKind) -> Result<Value, DecodeError> {
        kind.decode(&self.data)
            .map_err(|reason| DecodeError::new(DecodeErrorKind::Payload, reason).with_oid(self.oid))
    }
}

/// Result of one decode step
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Frame(Frame),
    Error(DecodeError),
}

/// Looks up the value kind of an identifier for the length plausibility checks
pub type KindLookup = fn(u32) -> Option<DataKind>;

/// Frame codec, usable directly or through `tokio_util::codec`
#[derive(Debug, Clone, Copy, Default)]
pub struct RctCodec {
    kind_lookup: Option<KindLookup>,
}

impl RctCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the per-kind length limits
    pub fn with_kind_lookup(lookup: KindLookup) -> Self {
        Self {
            kind_lookup: Some(lookup),
        }
    }
}

/// CRC-16/CCITT-FALSE with odd-length padding
pub fn checksum(body: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(body);
    if body.len() % 2 == 1 {
        digest.update(&[0]);
    }
    digest.finalize()
}

/// Encoded read request for `oid`
pub fn encode_request(oid: u32) -> BytesMut {
    let mut dst = BytesMut::with_capacity(2 * (3 + OID_LEN + 2) + 1);
    write_frame(Command::Read, None, oid, &[], &mut dst);
    dst
}

fn write_frame(command: Command, address: Option<u32>, oid: u32, data: &[u8], dst: &mut BytesMut) {
    let length = address.map_or(0, |_| ADDRESS_LEN) + OID_LEN + data.len();

    let mut body = Vec::with_capacity(length + 5);
    body.push(command.as_u8());
    if command.is_long() {
        body.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        body.push(length as u8);
    }
    if let Some(address) = address {
        body.extend_from_slice(&address.to_be_bytes());
    }
    body.extend_from_slice(&oid.to_be_bytes());
    body.extend_from_slice(data);
    let crc = checksum(&body);
    body.extend_from_slice(&crc.to_be_bytes());

    dst.reserve(body.len() * 2 + 1);
    dst.put_u8(START_BYTE);
    for byte in body {
        if byte == START_BYTE || byte == ESCAPE_BYTE {
            dst.put_u8(ESCAPE_BYTE);
        }
        dst.put_u8(byte);
    }
}

impl Encoder<Frame> for RctCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = frame.payload_len();
        let limit = if frame.command.is_long() {
            usize::from(u16::MAX)
        } else {
            usize::from(u8::MAX)
        };
        if length > limit {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("payload of {} bytes does not fit {}", length, frame.command),
            ));
        }

        write_frame(frame.command, frame.address, frame.oid, &frame.data, dst);
        Ok(())
    }
}

impl Decoder for RctCodec {
    type Item = DecodeEvent;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Anything in front of a start marker can never become a frame
        let Some(start) = src.iter().position(|b| *b == START_BYTE) else {
            src.clear();
            return Ok(None);
        };
        if start > 0 {
            src.advance(start);
        }

        match scan(src, self.kind_lookup) {
            Scan::Incomplete => Ok(None),
            Scan::Frame { frame, consumed } => {
                src.advance(consumed);
                Ok(Some(DecodeEvent::Frame(frame)))
            },
            Scan::Error { error, consumed } => {
                src.advance(consumed);
                Ok(Some(DecodeEvent::Error(error)))
            },
        }
    }
}

enum Scan {
    Incomplete,
    Frame { frame: Frame, consumed: usize },
    Error { error: DecodeError, consumed: usize },
}

enum Next {
    Byte(u8),
    Incomplete,
    /// Unescaped start marker at this raw offset: the candidate was cut short
    Interrupted(usize),
}

/// Unescaping reader over a raw candidate, starting after the start marker
struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Next {
        match self.raw.get(self.pos) {
            None => Next::Incomplete,
            Some(&START_BYTE) => Next::Interrupted(self.pos),
            Some(&ESCAPE_BYTE) => match self.raw.get(self.pos + 1) {
                Some(&byte) => {
                    self.pos += 2;
                    Next::Byte(byte)
                },
                None => Next::Incomplete,
            },
            Some(&byte) => {
                self.pos += 1;
                Next::Byte(byte)
            },
        }
    }
}

/// Scan one candidate frame starting at `raw[0]` (a start marker)
fn scan(raw: &[u8], kind_lookup: Option<KindLookup>) -> Scan {
    let mut cursor = Cursor { raw, pos: 1 };

    macro_rules! next_byte {
        () => {
            match cursor.next() {
                Next::Byte(byte) => byte,
                Next::Incomplete => return Scan::Incomplete,
                Next::Interrupted(at) => {
                    return Scan::Error {
                        error: DecodeError::new(
                            DecodeErrorKind::Length,
                            "frame interrupted by start marker",
                        ),
                        consumed: at,
                    }
                },
            }
        };
    }

    let mut body = Vec::with_capacity(32);

    let command_byte = next_byte!();
    body.push(command_byte);
    let command = match Command::try_from(command_byte) {
        Ok(command) => command,
        Err(byte) => {
            return Scan::Error {
                error: DecodeError::new(
                    DecodeErrorKind::Command,
                    format!("unknown command 0x{:02X}", byte),
                ),
                consumed: cursor.pos,
            }
        },
    };

    let length = if command.is_long() {
        let high = next_byte!();
        let low = next_byte!();
        body.extend_from_slice(&[high, low]);
        usize::from(u16::from_be_bytes([high, low]))
    } else {
        let length = next_byte!();
        body.push(length);
        usize::from(length)
    };

    let header = if command.is_plant() {
        ADDRESS_LEN + OID_LEN
    } else {
        OID_LEN
    };
    if length < header {
        return Scan::Error {
            error: DecodeError::new(
                DecodeErrorKind::Length,
                format!("declared length {} below minimum {}", length, header),
            ),
            consumed: cursor.pos,
        };
    }

    let payload_start = body.len();
    for index in 0..length {
        body.push(next_byte!());

        if index + 1 == header {
            let oid_at = payload_start + header - OID_LEN;
            let oid = u32::from_be_bytes([
                body[oid_at],
                body[oid_at + 1],
                body[oid_at + 2],
                body[oid_at + 3],
            ]);
            if let Some(kind) = kind_lookup.and_then(|lookup| lookup(oid)) {
                let implausible = if kind.is_numeric() {
                    length > MAX_NUMERIC_LENGTH
                } else {
                    !command.is_long() && length > MAX_STRING_LENGTH
                };
                if implausible {
                    return Scan::Error {
                        error: DecodeError::new(
                            DecodeErrorKind::Length,
                            format!("declared length {} implausible for {:?}", length, kind),
                        )
                        .with_oid(oid),
                        consumed: cursor.pos,
                    };
                }
            }
        }
    }

    let crc_high = next_byte!();
    let crc_low = next_byte!();
    let received = u16::from_be_bytes([crc_high, crc_low]);
    let computed = checksum(&body);

    let payload = &body[payload_start..];
    let (address, oid_bytes) = if command.is_plant() {
        let address = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        (Some(address), &payload[ADDRESS_LEN..header])
    } else {
        (None, &payload[..OID_LEN])
    };
    let oid = u32::from_be_bytes([oid_bytes[0], oid_bytes[1], oid_bytes[2], oid_bytes[3]]);

    if received != computed {
        return Scan::Error {
            error: DecodeError::new(
                DecodeErrorKind::Crc,
                format!(
                    "checksum mismatch: received 0x{:04X}, computed 0x{:04X}",
                    received, computed
                ),
            )
            .with_oid(oid),
            consumed: cursor.pos,
        };
    }

    Scan::Frame {
        frame: Frame {
            command,
            address,
            oid,
            data: Bytes::copy_from_slice(&payload[header..]),
        },
        consumed: cursor.pos,
    }
}
