//! Three-Mode Bit Stream
//!
//! Every piece of deterministic state is serialized by one routine that takes
//! a `&mut BitStream`. The stream decides what the routine means:
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ Write      │ value → little-endian bytes appended to buf   │
//! │ Read       │ bytes at cursor → value (field overwritten)   │
//! │ Checksum   │ value → bytes folded into FNV-1a accumulator  │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Since the three modes walk the exact same field sequence, a write followed
//! by a read followed by a checksum yields the checksum of the original.

use super::hash::ChecksumAccumulator;

/// Stream operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Append encoded bytes to the buffer.
    Write,
    /// Decode from the buffer into the live value.
    Read,
    /// Fold encoded bytes into the running checksum.
    Checksum,
}

/// Bit stream errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Ran out of input while reading.
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A length prefix exceeds what this platform or stream can hold.
    #[error("Length prefix {0} is out of range")]
    LengthOverflow(u64),
    /// Decoded value is not valid for its field.
    #[error("Invalid data: {0}")]
    Invalid(String),
}

/// Anything walkable by a [`BitStream`].
pub trait Serializable {
    /// Walk every field through `stream`. Must visit fields in the same
    /// order for all three modes.
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError>;
}

/// The three-mode stream.
#[derive(Debug, Clone)]
pub struct BitStream {
    mode: StreamMode,
    buffer: Vec<u8>,
    cursor: usize,
    checksum: ChecksumAccumulator,
}

impl BitStream {
    /// Empty stream in write mode.
    pub fn writer() -> Self {
        Self::with_mode(StreamMode::Write)
    }

    /// Stream reading from `bytes`.
    pub fn reader(bytes: Vec<u8>) -> Self {
        Self {
            mode: StreamMode::Read,
            buffer: bytes,
            cursor: 0,
            checksum: ChecksumAccumulator::new(),
        }
    }

    /// Stream in checksum mode.
    pub fn checksum() -> Self {
        Self::with_mode(StreamMode::Checksum)
    }

    fn with_mode(mode: StreamMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            cursor: 0,
            checksum: ChecksumAccumulator::new(),
        }
    }

    /// Switch mode and clear all state, keeping the buffer allocation.
    pub fn reset(&mut self, mode: StreamMode) {
        self.mode = mode;
        self.buffer.clear();
        self.cursor = 0;
        self.checksum.reset();
    }

    /// Switch to read mode over `bytes`, reusing the allocation.
    pub fn reset_reader(&mut self, bytes: &[u8]) {
        self.reset(StreamMode::Read);
        self.buffer.extend_from_slice(bytes);
    }

    /// Current mode.
    #[inline]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// True in read mode.
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.mode == StreamMode::Read
    }

    /// True in write mode.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.mode == StreamMode::Write
    }

    /// Written bytes (write mode) or the input (read mode).
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the stream and return its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Accumulated checksum (checksum mode).
    #[inline]
    pub fn checksum_value(&self) -> u64 {
        self.checksum.finish()
    }

    /// Unread bytes in read mode.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.cursor)
    }

    // =========================================================================
    // PRIMITIVES
    // =========================================================================

    /// Pass `bytes` through the stream. In read mode they are overwritten.
    pub fn serialize_raw(&mut self, bytes: &mut [u8]) -> Result<(), StreamError> {
        match self.mode {
            StreamMode::Write => self.buffer.extend_from_slice(bytes),
            StreamMode::Checksum => self.checksum.update_bytes(bytes),
            StreamMode::Read => {
                let remaining = self.remaining();
                if bytes.len() > remaining {
                    return Err(StreamError::UnexpectedEof {
                        needed: bytes.len(),
                        remaining,
                    });
                }
                let end = self.cursor + bytes.len();
                bytes.copy_from_slice(&self.buffer[self.cursor..end]);
                self.cursor = end;
            }
        }
        Ok(())
    }

    /// Serialize a u8.
    pub fn serialize_u8(&mut self, value: &mut u8) -> Result<(), StreamError> {
        let mut buf = [*value];
        self.serialize_raw(&mut buf)?;
        *value = buf[0];
        Ok(())
    }

    /// Serialize a bool as one byte. Any byte other than 0/1 is rejected.
    pub fn serialize_bool(&mut self, value: &mut bool) -> Result<(), StreamError> {
        let mut byte = *value as u8;
        self.serialize_u8(&mut byte)?;
        *value = match byte {
            0 => false,
            1 => true,
            other => return Err(StreamError::Invalid(format!("bool byte {other}"))),
        };
        Ok(())
    }

    /// Serialize a u16.
    pub fn serialize_u16(&mut self, value: &mut u16) -> Result<(), StreamError> {
        let mut buf = value.to_le_bytes();
        self.serialize_raw(&mut buf)?;
        *value = u16::from_le_bytes(buf);
        Ok(())
    }

    /// Serialize an i32.
    pub fn serialize_i32(&mut self, value: &mut i32) -> Result<(), StreamError> {
        let mut buf = value.to_le_bytes();
        self.serialize_raw(&mut buf)?;
        *value = i32::from_le_bytes(buf);
        Ok(())
    }

    /// Serialize a u32.
    pub fn serialize_u32(&mut self, value: &mut u32) -> Result<(), StreamError> {
        let mut buf = value.to_le_bytes();
        self.serialize_raw(&mut buf)?;
        *value = u32::from_le_bytes(buf);
        Ok(())
    }

    /// Serialize a u64.
    pub fn serialize_u64(&mut self, value: &mut u64) -> Result<(), StreamError> {
        let mut buf = value.to_le_bytes();
        self.serialize_raw(&mut buf)?;
        *value = u64::from_le_bytes(buf);
        Ok(())
    }

    /// Serialize a collection length as u32.
    pub fn serialize_len(&mut self, len: &mut usize) -> Result<(), StreamError> {
        let mut wire = u32::try_from(*len).map_err(|_| StreamError::LengthOverflow(*len as u64))?;
        self.serialize_u32(&mut wire)?;
        *len = wire as usize;
        Ok(())
    }

    /// Serialize a u32-length-prefixed byte vector.
    pub fn serialize_bytes(&mut self, value: &mut Vec<u8>) -> Result<(), StreamError> {
        let mut len = value.len();
        self.serialize_len(&mut len)?;
        if self.is_reading() {
            if len > self.remaining() {
                return Err(StreamError::UnexpectedEof {
                    needed: len,
                    remaining: self.remaining(),
                });
            }
            value.clear();
            value.resize(len, 0);
        }
        self.serialize_raw(value.as_mut_slice())
    }

    /// Length-prefixed bytes from a shared reference. Write and checksum
    /// modes only; lets shared (copy-on-write) data be walked without a clone.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        if self.is_reading() {
            return Err(StreamError::Invalid("put_bytes on a read stream".into()));
        }
        let mut len = bytes.len();
        self.serialize_len(&mut len)?;
        if self.mode == StreamMode::Write {
            self.buffer.extend_from_slice(bytes);
        } else {
            self.checksum.update_bytes(bytes);
        }
        Ok(())
    }

    /// Serialize a nested [`Serializable`].
    #[inline]
    pub fn serialize_value<T: Serializable + ?Sized>(&mut self, value: &mut T) -> Result<(), StreamError> {
        value.serialize(self)
    }
}

impl Serializable for u8 {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u8(self)
    }
}

impl Serializable for i32 {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_i32(self)
    }
}

impl Serializable for u32 {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u32(self)
    }
}

impl Serializable for u64 {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_u64(self)
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        stream.serialize_bytes(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Sample {
        a: u8,
        b: i32,
        c: u64,
        flag: bool,
        payload: Vec<u8>,
    }

    impl Serializable for Sample {
        fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
            stream.serialize_u8(&mut self.a)?;
            stream.serialize_i32(&mut self.b)?;
            stream.serialize_u64(&mut self.c)?;
            stream.serialize_bool(&mut self.flag)?;
            stream.serialize_bytes(&mut self.payload)
        }
    }

    fn sample() -> Sample {
        Sample {
            a: 7,
            b: -12345,
            c: u64::MAX - 3,
            flag: true,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut original = sample();
        let mut writer = BitStream::writer();
        original.serialize(&mut writer).unwrap();

        let mut reader = BitStream::reader(writer.into_bytes());
        let mut decoded = Sample::default();
        decoded.serialize(&mut reader).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_checksum_commutes_with_round_trip() {
        let mut original = sample();
        let mut direct = BitStream::checksum();
        original.serialize(&mut direct).unwrap();

        let mut writer = BitStream::writer();
        original.serialize(&mut writer).unwrap();
        let mut reader = BitStream::reader(writer.into_bytes());
        let mut decoded = Sample::default();
        decoded.serialize(&mut reader).unwrap();

        let mut after = BitStream::checksum();
        decoded.serialize(&mut after).unwrap();

        assert_eq!(direct.checksum_value(), after.checksum_value());
    }

    #[test]
    fn test_checksum_equals_fnv_of_written_bytes() {
        let mut value = sample();
        let mut writer = BitStream::writer();
        value.serialize(&mut writer).unwrap();

        let mut checksum = BitStream::checksum();
        value.serialize(&mut checksum).unwrap();

        assert_eq!(checksum.checksum_value(), crate::core::hash::fnv1a(writer.bytes()));
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut reader = BitStream::reader(vec![1, 2]);
        let mut v = 0u32;
        assert_eq!(
            reader.serialize_u32(&mut v),
            Err(StreamError::UnexpectedEof { needed: 4, remaining: 2 })
        );
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut reader = BitStream::reader(vec![2]);
        let mut flag = false;
        assert!(matches!(reader.serialize_bool(&mut flag), Err(StreamError::Invalid(_))));
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut writer = BitStream::writer();
        let mut huge = 1_000u32;
        writer.serialize_u32(&mut huge).unwrap();

        let mut reader = BitStream::reader(writer.into_bytes());
        let mut bytes = Vec::new();
        assert!(matches!(
            reader.serialize_bytes(&mut bytes),
            Err(StreamError::UnexpectedEof { needed: 1000, .. })
        ));
    }

    #[test]
    fn test_reset_reuses_stream() {
        let mut stream = BitStream::writer();
        let mut v = 5u32;
        stream.serialize_u32(&mut v).unwrap();
        stream.reset(StreamMode::Checksum);
        assert!(stream.bytes().is_empty());
        stream.serialize_u32(&mut v).unwrap();
        assert_eq!(stream.checksum_value(), crate::core::hash::fnv1a(&5u32.to_le_bytes()));
    }
}
