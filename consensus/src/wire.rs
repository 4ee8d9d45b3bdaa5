//! Minimal binary reader/writer for the consensus wire format.
//!
//! Fixed-width little-endian integers, raw 32-byte hashes, and
//! u32-length-prefixed variable fields. Every decode failure is local to
//! the one message being read and maps to a [`WireError`].

use talos_common::{Hash, WireError};

/// Writer over a growable byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.buf.extend_from_slice(hash.as_bytes());
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed vector of hashes.
    pub fn write_hashes(&mut self, hashes: &[Hash]) {
        self.write_u32(hashes.len() as u32);
        for hash in hashes {
            self.write_hash(hash);
        }
    }

    /// Raw bytes with no length prefix (fixed-width fields).
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader over a byte slice, tracking the current position.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < count {
            return Err(WireError::UnexpectedEnd {
                needed: count - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_hash(&mut self) -> Result<Hash, WireError> {
        let bytes = self.take(32)?;
        Ok(Hash::from_slice(bytes).unwrap())
    }

    /// Length-prefixed byte string. The declared length is checked against
    /// the remaining input before allocating, so a corrupt prefix cannot
    /// trigger an oversized allocation.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let declared = self.read_u32()? as usize;
        if declared > self.remaining() {
            return Err(WireError::LengthOverflow {
                declared,
                remaining: self.remaining(),
            });
        }
        Ok(self.take(declared)?.to_vec())
    }

    /// Length-prefixed vector of hashes.
    pub fn read_hashes(&mut self) -> Result<Vec<Hash>, WireError> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(32) > self.remaining() {
            return Err(WireError::LengthOverflow {
                declared: count.saturating_mul(32),
                remaining: self.remaining(),
            });
        }
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(self.read_hash()?);
        }
        Ok(hashes)
    }

    /// Fixed-width raw bytes.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        self.take(count)
    }

    /// Assert the input is fully consumed.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.remaining() > 0 {
            return Err(WireError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}
