//! Golomb-Rice coding over a growable bit buffer.
//!
//! A value `d` is written as its quotient `d >> b` in unary (that many one
//! bits, then a zero bit) followed by the remainder `d & (2^b - 1)` as a
//! `b`-bit field, least significant bit first. Bits are packed LSB first
//! into bytes, so bit `i` of the stream is bit `i % 8` of byte `i / 8`.
//!
//! Callers feed deltas between successive values of a non-decreasing
//! sequence; the first value is its own delta. Encoder and decoder must
//! agree on `b`.

use crate::error::{Error, Result};

/// Bit-addressable buffer with a single cursor shared by encode and decode.
#[derive(Debug, Clone)]
pub struct GolombBuffer {
    bytes: Vec<u8>,
    capacity_bits: usize,
    cursor: usize,
    /// Number of valid bits: the furthest position ever written, or the
    /// full received payload for a decoding buffer.
    len_bits: usize,
    b: u32,
}

fn check_parameter(b: u32) -> Result<()> {
    if b == 0 || b >= 64 {
        return Err(Error::InvalidParameter(format!(
            "golomb parameter b must be in 1..=63, got {b}"
        )));
    }
    Ok(())
}

impl GolombBuffer {
    /// An empty encoding buffer holding at most `capacity_bits` bits.
    pub fn with_capacity(capacity_bits: usize, b: u32) -> Result<Self> {
        check_parameter(b)?;
        Ok(Self {
            bytes: Vec::with_capacity(capacity_bits.div_ceil(8).min(1 << 20)),
            capacity_bits,
            cursor: 0,
            len_bits: 0,
            b,
        })
    }

    /// A decoding buffer over a received payload.
    pub fn from_bytes(data: &[u8], b: u32) -> Result<Self> {
        check_parameter(b)?;
        Ok(Self {
            bytes: data.to_vec(),
            capacity_bits: data.len() * 8,
            cursor: 0,
            len_bits: data.len() * 8,
            b,
        })
    }

    pub fn parameter(&self) -> u32 {
        self.b
    }

    pub fn capacity_bits(&self) -> usize {
        self.capacity_bits
    }

    /// Current cursor position in bits.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Move the cursor. Positions beyond the capacity are rejected.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.capacity_bits {
            return Err(Error::Capacity {
                needed: pos,
                capacity: self.capacity_bits,
            });
        }
        self.cursor = pos;
        Ok(())
    }

    /// Number of valid bits.
    pub fn bit_len(&self) -> usize {
        self.len_bits
    }

    /// Smallest byte count holding every valid bit.
    pub fn byte_size(&self) -> usize {
        self.len_bits.div_ceil(8)
    }

    /// The byte-aligned encoded payload, padding bits are zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.byte_size()]
    }

    /// Bits needed to code `delta` with this buffer's parameter.
    pub fn code_length(&self, delta: u64) -> u128 {
        u128::from(delta >> self.b) + 1 + u128::from(self.b)
    }

    /// Append one delta at the cursor. On a capacity error nothing is
    /// written and the cursor does not move.
    pub fn encode(&mut self, delta: u64) -> Result<()> {
        let needed = self.code_length(delta);
        let end = self.cursor as u128 + needed;
        if end > self.capacity_bits as u128 {
            return Err(Error::Capacity {
                needed: usize::try_from(end).unwrap_or(usize::MAX),
                capacity: self.capacity_bits,
            });
        }

        let quotient = delta >> self.b;
        let remainder = delta & ((1u64 << self.b) - 1);
        for _ in 0..quotient {
            self.write_bit(true);
        }
        self.write_bit(false);
        for i in 0..self.b {
            self.write_bit(remainder >> i & 1 == 1);
        }
        Ok(())
    }

    /// Read the next delta at the cursor.
    pub fn decode(&mut self) -> Result<u64> {
        let mut quotient = 0u64;
        while self.read_bit()? {
            quotient += 1;
        }
        if quotient > u64::MAX >> self.b {
            return Err(Error::MalformedBlock(format!(
                "unary quotient {quotient} overflows with b = {}",
                self.b
            )));
        }
        let mut remainder = 0u64;
        for i in 0..self.b {
            if self.read_bit()? {
                remainder |= 1 << i;
            }
        }
        Ok(quotient << self.b | remainder)
    }

    fn write_bit(&mut self, bit: bool) {
        let byte = self.cursor / 8;
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }
        let mask = 1u8 << (self.cursor % 8);
        if bit {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }
        self.cursor += 1;
        self.len_bits = self.len_bits.max(self.cursor);
    }

    fn read_bit(&mut self) -> Result<bool> {
        if self.cursor >= self.len_bits {
            return Err(Error::MalformedBlock(format!(
                "read past end of {} valid bits",
                self.len_bits
            )));
        }
        let bit = self.bytes[self.cursor / 8] >> (self.cursor % 8) & 1 == 1;
        self.cursor += 1;
        Ok(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn encode_sorted(values: &[u64], b: u32) -> GolombBuffer {
        let capacity: u128 = values
            .iter()
            .scan(0u64, |last, &v| {
                let delta = v - *last;
                *last = v;
                Some(u128::from(delta >> b) + 1 + u128::from(b))
            })
            .sum();
        let mut code = GolombBuffer::with_capacity(capacity as usize, b).unwrap();
        let mut last = 0;
        for &v in values {
            code.encode(v - last).unwrap();
            last = v;
        }
        code
    }

    fn decode_sorted(bytes: &[u8], count: usize, b: u32) -> Vec<u64> {
        let mut code = GolombBuffer::from_bytes(bytes, b).unwrap();
        let mut last = 0;
        (0..count)
            .map(|_| {
                last += code.decode().unwrap();
                last
            })
            .collect()
    }

    #[test]
    fn ascending_sequences_round_trip() {
        let mut rng = SmallRng::seed_from_u64(7);
        for b in 1..=20 {
            let mut values: Vec<u64> = (0..200).map(|_| rng.gen_range(0..1_000_000)).collect();
            values.sort_unstable();
            values.dedup();
            let code = encode_sorted(&values, b);
            assert_eq!(decode_sorted(code.as_bytes(), values.len(), b), values, "b = {b}");
        }
    }

    #[test]
    fn zero_delta_round_trips_for_every_parameter() {
        for b in 1..64 {
            let mut code = GolombBuffer::with_capacity(1 + b as usize, b).unwrap();
            code.encode(0).unwrap();
            assert_eq!(code.bit_len(), 1 + b as usize);
            let mut read = GolombBuffer::from_bytes(code.as_bytes(), b).unwrap();
            assert_eq!(read.decode().unwrap(), 0);
        }
    }

    #[test]
    fn known_bit_layout() {
        // 13 with b = 2: quotient 3 -> 1110, remainder 1 -> bits 1,0.
        let mut code = GolombBuffer::with_capacity(64, 2).unwrap();
        code.encode(13).unwrap();
        assert_eq!(code.bit_len(), 6);
        assert_eq!(code.as_bytes(), &[0b0001_0111]);
    }

    #[test]
    fn capacity_is_enforced_without_partial_writes() {
        let mut code = GolombBuffer::with_capacity(10, 3).unwrap();
        code.encode(5).unwrap(); // 4 bits
        let err = code.encode(40).unwrap_err(); // 5 + 1 + 3 = 9 bits
        assert!(matches!(err, Error::Capacity { needed: 13, capacity: 10 }));
        assert_eq!(code.position(), 4);
        assert_eq!(code.byte_size(), 1);
    }

    #[test]
    fn seek_rewinds_for_a_second_pass() {
        let mut code = GolombBuffer::with_capacity(128, 4).unwrap();
        code.encode(100).unwrap();
        code.encode(3).unwrap();
        let written = code.bit_len();
        code.seek(0).unwrap();
        assert_eq!(code.decode().unwrap(), 100);
        assert_eq!(code.decode().unwrap(), 3);
        assert_eq!(code.position(), written);
        assert!(code.seek(129).is_err());
    }

    #[test]
    fn reading_past_the_payload_is_malformed() {
        let mut code = GolombBuffer::from_bytes(&[0xff], 2).unwrap();
        assert!(matches!(code.decode(), Err(Error::MalformedBlock(_))));
    }

    #[test]
    fn invalid_parameter_rejected() {
        assert!(GolombBuffer::with_capacity(8, 0).is_err());
        assert!(GolombBuffer::from_bytes(&[], 64).is_err());
    }
}
