//! Binary State Buffer
//!
//! Flat little-endian byte buffers for snapshots and wire messages.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  StateWriter (append-only)        StateReader (cursor)       │
//! │  add_u16 ──► [lo][hi]             get_u16 ◄── [lo][hi]       │
//! │  add_vec3 ─► [x f32][y f32][z f32]                           │
//! │  add_string► [len u8][utf-8 bytes ...]                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The writer has a declared capacity; writing beyond it is a programming
//! error and panics in every build profile. The reader never panics: running
//! out of bytes yields [`BufferError::Truncated`].

use thiserror::Error;

use super::math::{Quat, Vec3};

/// Errors raised while decoding a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Reader ran past the available bytes.
    #[error("truncated buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidString,

    /// A field held a value outside its declared range.
    #[error("invalid value {value} for field {field}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Raw value read.
        value: u32,
    },
}

/// Append-only writer with a pre-declared capacity.
#[derive(Debug, Clone)]
pub struct StateWriter {
    data: Vec<u8>,
    capacity: Option<usize>,
}

impl StateWriter {
    /// Create a writer that may hold at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Create a writer without a capacity bound (message framing).
    pub fn growable() -> Self {
        Self {
            data: Vec::new(),
            capacity: None,
        }
    }

    /// Number of bytes written.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing was written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes written so far.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the writer and return its bytes.
    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        if let Some(cap) = self.capacity {
            assert!(
                self.data.len() + bytes.len() <= cap,
                "state buffer overflow: {} + {} bytes exceeds capacity {}",
                self.data.len(),
                bytes.len(),
                cap
            );
        }
        self.data.extend_from_slice(bytes);
        self
    }

    /// Append a u8.
    pub fn add_u8(&mut self, value: u8) -> &mut Self {
        self.put(&[value])
    }

    /// Append an i8.
    pub fn add_i8(&mut self, value: i8) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    /// Append a u16 (little-endian).
    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    /// Append an i16 (little-endian).
    pub fn add_i16(&mut self, value: i16) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    /// Append a u32 (little-endian).
    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    /// Append an i32 (little-endian).
    pub fn add_i32(&mut self, value: i32) -> &mut Self {
        self.put(&value.to_le_bytes())
    }

    /// Append an IEEE-754 f32 (little-endian bit pattern).
    pub fn add_f32(&mut self, value: f32) -> &mut Self {
        self.put(&value.to_bits().to_le_bytes())
    }

    /// Append a bool as one byte.
    pub fn add_bool(&mut self, value: bool) -> &mut Self {
        self.add_u8(value as u8)
    }

    /// Append a vector as 3 floats.
    pub fn add_vec3(&mut self, v: Vec3) -> &mut Self {
        self.add_f32(v.x).add_f32(v.y).add_f32(v.z)
    }

    /// Append a quaternion as 4 floats.
    pub fn add_quat(&mut self, q: Quat) -> &mut Self {
        self.add_f32(q.x).add_f32(q.y).add_f32(q.z).add_f32(q.w)
    }

    /// Append a u8-length-prefixed UTF-8 string.
    pub fn add_string(&mut self, s: &str) -> &mut Self {
        let len = s.len();
        assert!(len <= u8::MAX as usize, "string field longer than 255 bytes: {}", len);
        self.add_u8(len as u8);
        self.put(s.as_bytes())
    }

    /// Append raw bytes.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put(bytes)
    }
}

/// Cursor over a byte slice, consuming in write order.
#[derive(Debug, Clone)]
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    /// Create a reader at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True when all bytes were consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current read offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BufferError> {
        if self.remaining() < n {
            return Err(BufferError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.take(n).map(|_| ())
    }

    /// Read a u8.
    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read an i8.
    pub fn get_i8(&mut self) -> Result<i8, BufferError> {
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    /// Read a u16.
    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read an i16.
    pub fn get_i16(&mut self) -> Result<i16, BufferError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    /// Read a u32.
    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read an i32.
    pub fn get_i32(&mut self) -> Result<i32, BufferError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read an f32.
    pub fn get_f32(&mut self) -> Result<f32, BufferError> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    /// Read a bool (any non-zero byte is true).
    pub fn get_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a 3-float vector.
    pub fn get_vec3(&mut self) -> Result<Vec3, BufferError> {
        Ok(Vec3::new(self.get_f32()?, self.get_f32()?, self.get_f32()?))
    }

    /// Read a 4-float quaternion.
    pub fn get_quat(&mut self) -> Result<Quat, BufferError> {
        Ok(Quat::new(self.get_f32()?, self.get_f32()?, self.get_f32()?, self.get_f32()?))
    }

    /// Read a u8-length-prefixed string.
    pub fn get_string(&mut self) -> Result<String, BufferError> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| BufferError::InvalidString)
    }

    /// Read `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], BufferError> {
        self.take(n)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_little_endian_layout() {
        let mut w = StateWriter::with_capacity(7);
        w.add_u8(0xAB).add_u16(0x1234).add_u32(0xDEADBEEF);
        assert_eq!(w.as_bytes(), &[0xAB, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_read_in_write_order() {
        let mut w = StateWriter::with_capacity(64);
        w.add_i8(-5)
            .add_i16(-1234)
            .add_i32(-123456)
            .add_f32(1.5)
            .add_vec3(Vec3::new(1.0, -2.0, 3.0))
            .add_quat(Quat::IDENTITY)
            .add_string("K3");

        let bytes = w.into_bytes();
        let mut r = StateReader::new(&bytes);
        assert_eq!(r.get_i8().unwrap(), -5);
        assert_eq!(r.get_i16().unwrap(), -1234);
        assert_eq!(r.get_i32().unwrap(), -123456);
        assert_eq!(r.get_f32().unwrap(), 1.5);
        assert_eq!(r.get_vec3().unwrap(), Vec3::new(1.0, -2.0, 3.0));
        assert_eq!(r.get_quat().unwrap(), Quat::IDENTITY);
        assert_eq!(r.get_string().unwrap(), "K3");
        assert!(r.is_empty());
    }

    #[test]
    #[should_panic(expected = "state buffer overflow")]
    fn test_write_past_capacity_panics() {
        let mut w = StateWriter::with_capacity(3);
        w.add_u16(1).add_u16(2);
    }

    #[test]
    fn test_read_past_end_is_truncated() {
        let bytes = [1u8, 2, 3];
        let mut r = StateReader::new(&bytes);
        assert_eq!(r.get_u16().unwrap(), 0x0201);
        let err = r.get_u32().unwrap_err();
        assert_eq!(err, BufferError::Truncated { needed: 4, remaining: 1 });
        // A failed read consumes nothing
        assert_eq!(r.get_u8().unwrap(), 3);
    }

    #[test]
    fn test_truncated_string_body() {
        let bytes = [5u8, b'a', b'b'];
        let mut r = StateReader::new(&bytes);
        assert!(matches!(r.get_string(), Err(BufferError::Truncated { .. })));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let bytes = [2u8, 0xFF, 0xFE];
        let mut r = StateReader::new(&bytes);
        assert_eq!(r.get_string().unwrap_err(), BufferError::InvalidString);
    }

    #[test]
    fn test_growable_writer_has_no_bound() {
        let mut w = StateWriter::growable();
        for i in 0..10_000u32 {
            w.add_u32(i);
        }
        assert_eq!(w.len(), 40_000);
    }

    proptest! {
        #[test]
        fn prop_f32_bits_roundtrip(bits in any::<u32>()) {
            let value = f32::from_bits(bits);
            let mut w = StateWriter::with_capacity(4);
            w.add_f32(value);
            let bytes = w.into_bytes();
            let back = StateReader::new(&bytes).get_f32().unwrap();
            prop_assert_eq!(back.to_bits(), bits);
        }

        #[test]
        fn prop_truncation_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let mut r = StateReader::new(&data);
            while r.get_vec3().is_ok() {}
            prop_assert!(r.remaining() < 12);
        }
    }
}
