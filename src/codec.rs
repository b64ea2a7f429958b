//! Little-endian binary packet codec shared by the TCP and UDP transports.
//!
//! Wire format is bit-exact with the real (non-updatable) game client: fixed-size
//! primitives, 3-float vectors, and two string encodings (ASCII byte-length prefixed,
//! UTF-32 codepoint-length prefixed). Built on `bytes::{Buf, BufMut}` rather than
//! introducing a dedicated byte-order crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum accepted TCP body size. Larger frames are a protocol violation.
pub const MAX_TCP_BODY_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet ended before expected field could be read")]
    UnexpectedEof,
    #[error("string length prefix exceeded remaining buffer")]
    StringTooLong,
    #[error("tcp body exceeded {MAX_TCP_BODY_SIZE} bytes")]
    BodyTooLarge,
    #[error("invalid utf-32 codepoint in string")]
    InvalidCodepoint,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A 3-component float vector, as used for position/rotation/velocity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3F {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Reads primitives out of a little-endian packet body.
///
/// Every read that would overrun the buffer returns `CodecError::UnexpectedEof`
/// rather than panicking; the caller aborts processing of that one message.
pub struct PacketReader {
    buf: Bytes,
}

impl PacketReader {
    pub fn new(body: Bytes) -> Self {
        Self { buf: body }
    }

    fn require(&self, n: usize) -> CodecResult<()> {
        if self.buf.remaining() < n {
            Err(CodecError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> CodecResult<i8> {
        self.require(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.require(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_i16(&mut self) -> CodecResult<i16> {
        self.require(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.require(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        self.require(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_f32(&mut self) -> CodecResult<f32> {
        self.require(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_bytes(&mut self, n: usize) -> CodecResult<Vec<u8>> {
        self.require(n)?;
        let mut out = vec![0u8; n];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_vector3f(&mut self) -> CodecResult<Vector3F> {
        Ok(Vector3F {
            x: self.read_f32()?,
            y: self.read_f32()?,
            z: self.read_f32()?,
        })
    }

    /// ASCII string: u8 byte-length prefix, no terminator.
    pub fn read_ascii_string(&mut self) -> CodecResult<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(bytes.into_iter().map(|b| b as char).collect())
    }

    /// UTF-32 string: u8 codepoint-length prefix, each codepoint a little-endian u32.
    pub fn read_utf32_string(&mut self) -> CodecResult<String> {
        let len = self.read_u8()? as usize;
        let mut s = String::with_capacity(len);
        for _ in 0..len {
            let cp = self.read_u32()?;
            let ch = char::from_u32(cp).ok_or(CodecError::InvalidCodepoint)?;
            s.push(ch);
        }
        Ok(s)
    }
}

/// Append-only little-endian packet body writer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn write_vector3f(&mut self, v: Vector3F) -> &mut Self {
        self.write_f32(v.x).write_f32(v.y).write_f32(v.z)
    }

    /// ASCII string: u8 byte-length prefix, truncated to 255 bytes.
    pub fn write_ascii_string(&mut self, s: &str) -> &mut Self {
        let bytes: Vec<u8> = s.chars().take(255).map(|c| c as u8).collect();
        self.write_u8(bytes.len() as u8);
        self.write_bytes(&bytes)
    }

    /// UTF-32 string: u8 codepoint-length prefix, each codepoint a little-endian u32.
    pub fn write_utf32_string(&mut self, s: &str) -> &mut Self {
        let chars: Vec<char> = s.chars().take(255).collect();
        self.write_u8(chars.len() as u8);
        for ch in chars {
            self.write_u32(ch as u32);
        }
        self
    }

    /// Frame this packet's body as a TCP message: `u32 bodyLen | body`.
    pub fn into_tcp_frame(self) -> Bytes {
        let body = self.buf.freeze();
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32_le(body.len() as u32);
        framed.put_slice(&body);
        framed.freeze()
    }
}

/// Parses a length-prefixed TCP frame body out of a growable receive buffer.
///
/// Returns `Some(body)` and drains the frame from `buf` if a full frame is present.
/// Returns `None` if more bytes are needed. Returns an error if the declared body
/// length exceeds `MAX_TCP_BODY_SIZE`.
pub fn try_read_tcp_frame(buf: &mut BytesMut) -> CodecResult<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let body_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;

    if body_len > MAX_TCP_BODY_SIZE {
        return Err(CodecError::BodyTooLarge);
    }

    if buf.len() < 4 + body_len {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(body_len).freeze();
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_primitives() {
        let mut w = PacketWriter::new();
        w.write_u8(0xAB)
            .write_i16(-42)
            .write_u32(123_456)
            .write_f32(3.5)
            .write_vector3f(Vector3F { x: 1.0, y: 2.0, z: 3.0 });

        let mut r = PacketReader::new(w.into_bytes());
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_i16().unwrap(), -42);
        assert_eq!(r.read_u32().unwrap(), 123_456);
        assert_eq!(r.read_f32().unwrap(), 3.5);
        assert_eq!(r.read_vector3f().unwrap(), Vector3F { x: 1.0, y: 2.0, z: 3.0 });
    }

    #[test]
    fn roundtrip_ascii_string() {
        let mut w = PacketWriter::new();
        w.write_ascii_string("ks_mazda_mx5_cup");
        let mut r = PacketReader::new(w.into_bytes());
        assert_eq!(r.read_ascii_string().unwrap(), "ks_mazda_mx5_cup");
    }

    #[test]
    fn roundtrip_utf32_string() {
        let mut w = PacketWriter::new();
        w.write_utf32_string("Dรriver");
        let mut r = PacketReader::new(w.into_bytes());
        assert_eq!(r.read_utf32_string().unwrap(), "Dรriver");
    }

    #[test]
    fn short_read_errors_without_panicking() {
        let mut r = PacketReader::new(Bytes::from_static(&[0x01]));
        assert!(matches!(r.read_u32(), Err(CodecError::UnexpectedEof)));
    }

    #[test]
    fn tcp_frame_roundtrip() {
        let mut w = PacketWriter::new();
        w.write_u8(0x3D).write_u16(202);
        let frame = w.into_tcp_frame();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);

        let body = try_read_tcp_frame(&mut buf).unwrap().expect("full frame present");
        let mut r = PacketReader::new(body);
        assert_eq!(r.read_u8().unwrap(), 0x3D);
        assert_eq!(r.read_u16().unwrap(), 202);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        buf.put_u8(0x01);
        assert!(try_read_tcp_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_TCP_BODY_SIZE + 1) as u32);
        assert!(matches!(try_read_tcp_frame(&mut buf), Err(CodecError::BodyTooLarge)));
    }
}
