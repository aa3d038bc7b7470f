//! Binary codec for state vectors and updates
//!
//! The format is self-describing and version tagged. Unsigned integers use
//! the protobuf varint layout (7 payload bits per byte, high bit set when
//! more bytes follow); signed integers keep their sign in bit 6 of the first
//! byte. Strings and buffers are prefixed with their byte length.
//!
//! Decoding never partially applies anything: payloads are decoded into owned
//! values first, and only a fully decoded value is handed to a transaction.

pub mod update;

use crate::error::{Result, SyncError};
use crate::id::ID;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::encoding::{decode_varint, encode_varint};

pub use update::Update;

/// Version tag written in front of every payload
pub const FORMAT_VERSION: u8 = 1;

/// Longest unsigned varint for a 64-bit value
const MAX_VARINT_LEN: usize = 10;

/// Types that can be written into a binary payload
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);

    /// Encode into a fresh, version-tagged buffer
    fn encode_v1(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(FORMAT_VERSION);
        self.encode(&mut encoder);
        encoder.into_bytes()
    }
}

/// Types that can be read back from a binary payload
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self>;

    /// Decode a version-tagged buffer, rejecting trailing bytes
    fn decode_v1(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != FORMAT_VERSION {
            tracing::warn!(version, "rejecting payload with unknown version");
            return Err(SyncError::UnsupportedVersion(version));
        }
        let value = Self::decode(&mut decoder)?;
        if decoder.has_remaining() {
            return Err(SyncError::Decode(format!(
                "{} trailing bytes",
                decoder.remaining()
            )));
        }
        Ok(value)
    }
}

/// Growable output buffer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.freeze().to_vec()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_var_u64(&mut self, value: u64) {
        encode_varint(value, &mut self.buf);
    }

    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    /// Signed varint: sign in bit 6 of the first byte, 6 payload bits there
    pub fn write_var_i64(&mut self, value: i64) {
        let negative = value < 0;
        let mut rest = value.unsigned_abs();
        let mut first = (rest & 0x3F) as u8;
        if negative {
            first |= 0x40;
        }
        rest >>= 6;
        if rest > 0 {
            first |= 0x80;
        }
        self.buf.put_u8(first);
        while rest > 0 {
            let mut byte = (rest & 0x7F) as u8;
            rest >>= 7;
            if rest > 0 {
                byte |= 0x80;
            }
            self.buf.put_u8(byte);
        }
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.put_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_buf(value.as_bytes());
    }

    pub fn write_id(&mut self, id: &ID) {
        self.write_var_u64(id.client);
        self.write_var_u32(id.clock);
    }
}

/// Cursor over an input payload
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(SyncError::UnexpectedEof);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let terminated = self.buf.iter().take(MAX_VARINT_LEN).any(|byte| byte & 0x80 == 0);
        if !terminated && self.buf.len() < MAX_VARINT_LEN {
            return Err(SyncError::UnexpectedEof);
        }
        decode_varint(&mut self.buf).map_err(|e| SyncError::Decode(e.to_string()))
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| SyncError::Decode(format!("{value} exceeds 32 bits")))
    }

    /// Read a length prefix, bounded by the bytes left in the payload
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_var_u64()?;
        if len > self.remaining() as u64 {
            return Err(SyncError::UnexpectedEof);
        }
        Ok(len as usize)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        let first = self.read_u8()?;
        let negative = first & 0x40 != 0;
        let mut magnitude = (first & 0x3F) as u64;
        let mut more = first & 0x80 != 0;
        let mut shift = 6u32;
        while more {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 62 && byte & 0x7C != 0) {
                return Err(SyncError::Decode("variable-length integer overflow".into()));
            }
            magnitude |= ((byte & 0x7F) as u64) << shift;
            more = byte & 0x80 != 0;
            shift += 7;
        }
        if negative {
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(SyncError::Decode("signed integer overflow".into()));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            i64::try_from(magnitude)
                .map_err(|_| SyncError::Decode("signed integer overflow".into()))
        }
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn read_buf(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_exact(len)
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_buf()?;
        std::str::from_utf8(bytes).map_err(|e| SyncError::Decode(format!("invalid UTF-8: {e}")))
    }

    pub fn read_id(&mut self) -> Result<ID> {
        let client = self.read_var_u64()?;
        let clock = self.read_var_u32()?;
        Ok(ID::new(client, clock))
    }
}
