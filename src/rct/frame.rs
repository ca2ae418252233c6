use crate::prelude::*;

use bytes::{Buf, BufMut, BytesMut};
use nom::{
    combinator::map,
    number::complete::{be_u16, be_u32, be_u8},
    sequence::tuple,
    IResult,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::codec::Decoder;

/// Default TCP port of the inverter's protocol server
pub const PORT: u16 = 8899;

pub const START_BYTE: u8 = 0x2b; // '+'
/// Marks the end of a stream and escapes START_BYTE/ESCAPE_BYTE inside one
pub const ESCAPE_BYTE: u8 = 0x2d; // '-'

// start, command, 1-byte length, 2-byte CRC
const MIN_FRAME_LENGTH: usize = 5;
const MAX_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Read = 0x01,
    Write = 0x02,
    LongWrite = 0x03,
    Response = 0x05,
    LongResponse = 0x06,
    ReadPeriodically = 0x08,
    Extension = 0x3c,
}

impl Command {
    /// Long frames carry a 2-byte length field
    pub fn is_long(byte: u8) -> bool {
        byte == u8::from(Command::LongWrite) || byte == u8::from(Command::LongResponse)
    }
}

// ObjectId {{{
/// 4-byte register identifier, written as 8 hex digits
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        if hex.is_empty() || hex.len() > 8 {
            bail!("{} is not a valid object id", s);
        }

        u32::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|err| anyhow!("{} is not a valid object id: {}", s, err))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
} // }}}

/// CRC-16/CCITT-FALSE as the inverter firmware computes it: odd-length
/// input is padded with one zero byte.
pub fn crc(data: &[u8]) -> u16 {
    let mut state = crc16::State::<crc16::CCITT_FALSE>::new();
    state.update(data);
    if data.len() % 2 == 1 {
        state.update(&[0]);
    }
    state.get()
}

// Request {{{
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub command: Command,
    pub id: ObjectId,
    pub data: Vec<u8>,
}

impl Request {
    pub fn read(id: ObjectId) -> Self {
        Self {
            command: Command::Read,
            id,
            data: Vec::new(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let command = u8::from(self.command);
        // length counts the id and data bytes
        let length = 4 + self.data.len();

        let mut body = Vec::with_capacity(length + 3);
        body.push(command);
        if Command::is_long(command) {
            body.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            body.push(length as u8);
        }
        body.extend_from_slice(&self.id.to_bytes());
        body.extend_from_slice(&self.data);

        let mut r = Vec::with_capacity(body.len() + 3);
        r.push(START_BYTE);
        r.extend_from_slice(&body);
        r.extend_from_slice(&crc(&body).to_be_bytes());
        r
    }
} // }}}

/// Total frame length, read from the header. `buf` must start with the
/// start byte and hold at least MIN_FRAME_LENGTH bytes.
pub fn frame_length(buf: &[u8]) -> usize {
    if Command::is_long(buf[1]) {
        6 + u16::from_be_bytes([buf[2], buf[3]]) as usize
    } else {
        5 + buf[2] as usize
    }
}

// Response {{{
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub command: u8,
    /// declared length of id plus data
    pub length: u16,
    pub id: ObjectId,
    pub data: Vec<u8>,
    pub crc_ok: bool,
}

fn short_header(input: &[u8]) -> IResult<&[u8], (u8, u16, u32)> {
    tuple((be_u8, map(be_u8, u16::from), be_u32))(input)
}

fn long_header(input: &[u8]) -> IResult<&[u8], (u8, u16, u32)> {
    tuple((be_u8, be_u16, be_u32))(input)
}

impl Response {
    /// Parse one complete frame, start byte and CRC included. The CRC
    /// result is recorded in `crc_ok` rather than failing the parse.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_LENGTH {
            bail!("frame too short: {} bytes", frame.len());
        }

        let (body, checksum) = frame[1..].split_at(frame.len() - 3);
        let crc_ok = u16::from_be_bytes([checksum[0], checksum[1]]) == crc(body);

        let parsed = if Command::is_long(body[0]) {
            long_header(body)
        } else {
            short_header(body)
        };
        let (data, (command, length, id)) = parsed
            .map_err(|_| anyhow!("frame too short for an object id: {:02X?}", frame))?;

        Ok(Self {
            command,
            length,
            id: ObjectId(id),
            data: data.to_vec(),
            crc_ok,
        })
    }

    pub fn info_text(&self) -> String {
        format!(
            "{} {} {}",
            self.command,
            i32::from(self.length) - 4,
            self.id
        )
    }
} // }}}

// Unescaper {{{
/// Drops escape bytes from the raw stream. An escape byte followed by
/// START_BYTE or ESCAPE_BYTE is dropped and the byte after it is copied
/// as data; that byte never starts another escape.
pub struct Unescaper {
    lookahead: bool,
    /// an escape byte was seen and the byte after it has not been
    pending: bool,
}

impl Unescaper {
    /// With `lookahead`, a lone escape byte ending a chunk is held back and
    /// classified once the next chunk arrives. Without it, the byte is
    /// passed through unresolved.
    pub fn new(lookahead: bool) -> Self {
        Self {
            lookahead,
            pending: false,
        }
    }

    pub fn unescape(&mut self, chunk: &[u8], out: &mut BytesMut) {
        for &byte in chunk {
            if std::mem::take(&mut self.pending) {
                if byte == START_BYTE || byte == ESCAPE_BYTE {
                    out.put_u8(byte);
                    continue;
                }
                out.put_u8(ESCAPE_BYTE);
            }

            if byte == ESCAPE_BYTE {
                self.pending = true;
            } else {
                out.put_u8(byte);
            }
        }

        if self.pending && !self.lookahead {
            debug!("not handling escape byte at end of chunk");
            self.pending = false;
            out.put_u8(ESCAPE_BYTE);
        }
    }
} // }}}

// FrameDecoder {{{
/// Extracts frames from an unescaped buffer. After a CRC failure no
/// further frame is returned until `resume` is called, as the buffer
/// alignment can no longer be trusted.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    halted: bool,
    skipped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&mut self) {
        self.halted = false;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Non-zero noise bytes discarded since the last call
    pub fn take_skipped(&mut self) -> u64 {
        std::mem::take(&mut self.skipped)
    }
}

impl Decoder for FrameDecoder {
    type Item = Response;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>> {
        if self.halted {
            return Ok(None);
        }

        if src.len() > MAX_BUFFER_SIZE {
            bail!(
                "Buffer overflow: {} bytes buffered without a complete frame",
                src.len()
            );
        }

        let skip = src
            .iter()
            .position(|b| *b == START_BYTE)
            .unwrap_or(src.len());
        for b in src[..skip].iter().filter(|b| **b != 0) {
            // runs of 0 show up regularly between frames
            trace!("skipping {:#04x}", b);
            self.skipped += 1;
        }
        src.advance(skip);

        if src.len() < MIN_FRAME_LENGTH {
            return Ok(None);
        }

        let frame_length = frame_length(src);
        if src.len() < frame_length {
            debug!(
                "full frame not yet received ({} of {} bytes)",
                src.len(),
                frame_length
            );
            return Ok(None);
        }

        let frame = src.split_to(frame_length);
        match Response::parse(&frame) {
            Ok(response) => {
                if !response.crc_ok {
                    self.halted = true;
                }
                Ok(Some(response))
            }
            Err(err) => {
                warn!("discarding malformed frame: {}", err);
                self.halted = true;
                Ok(None)
            }
        }
    }
} // }}}

// FrameReader {{{
/// Receive side of one connection: unescapes each chunk into the running
/// buffer and extracts every complete frame, in arrival order.
pub struct FrameReader {
    unescaper: Unescaper,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(escape_lookahead: bool) -> Self {
        Self {
            unescaper: Unescaper::new(escape_lookahead),
            decoder: FrameDecoder::new(),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Response>> {
        self.unescaper.unescape(chunk, &mut self.buffer);
        self.decoder.resume();

        let mut r = Vec::new();
        while let Some(response) = self.decoder.decode(&mut self.buffer)? {
            r.push(response);
        }

        Ok(r)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn take_skipped(&mut self) -> u64 {
        self.decoder.take_skipped()
    }
} // }}}
