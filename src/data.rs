//! Item serialization and the block writer/reader boundary.
//!
//! Items are written either with a fixed width (integers, little-endian)
//! or as a `u64` length prefix followed by raw bytes (strings, blobs).
//! Pairs concatenate their halves. This is the only serialization
//! contract the table, spill files and fingerprint blocks rely on.

use std::mem::size_of;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// A value that can be written to and read back from a byte stream.
pub trait Item: Sized {
    /// Serialized size if every value of the type has the same width.
    const FIXED_SIZE: Option<usize> = None;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize, what: &'static str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            what,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! fixed_width_item {
    ($t:ty, $put:ident, $get:ident) => {
        impl Item for $t {
            const FIXED_SIZE: Option<usize> = Some(size_of::<$t>());

            #[inline]
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            #[inline]
            fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                ensure_remaining(buf, size_of::<$t>(), stringify!($t))?;
                Ok(buf.$get())
            }
        }
    };
}

fixed_width_item!(u8, put_u8, get_u8);
fixed_width_item!(u32, put_u32_le, get_u32_le);
fixed_width_item!(u64, put_u64_le, get_u64_le);
fixed_width_item!(i32, put_i32_le, get_i32_le);
fixed_width_item!(i64, put_i64_le, get_i64_le);
fixed_width_item!(f64, put_f64_le, get_f64_le);

// usize travels as u64 so blocks are portable between hosts.
impl Item for usize {
    const FIXED_SIZE: Option<usize> = Some(8);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self as u64);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let value = u64::decode(buf)?;
        usize::try_from(value).map_err(|_| Error::Decode(format!("{value} overflows usize")))
    }
}

impl Item for bool {
    const FIXED_SIZE: Option<usize> = Some(1);

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(u8::from(*self));
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Decode(format!("invalid bool byte {other}"))),
        }
    }
}

fn decode_len_prefixed<B: Buf>(buf: &mut B) -> Result<Bytes> {
    let len = usize::decode(buf)?;
    ensure_remaining(buf, len, "length-prefixed payload")?;
    Ok(buf.copy_to_bytes(len))
}

impl Item for Bytes {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.len() as u64);
        buf.put_slice(self);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        decode_len_prefixed(buf)
    }
}

impl Item for String {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.len() as u64);
        buf.put_slice(self.as_bytes());
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = decode_len_prefixed(buf)?;
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl<A: Item, B: Item> Item for (A, B) {
    const FIXED_SIZE: Option<usize> = match (A::FIXED_SIZE, B::FIXED_SIZE) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    };

    fn encode<W: BufMut>(&self, buf: &mut W) {
        self.0.encode(buf);
        self.1.encode(buf);
    }

    fn decode<R: Buf>(buf: &mut R) -> Result<Self> {
        let a = A::decode(buf)?;
        let b = B::decode(buf)?;
        Ok((a, b))
    }
}

/// Serialize a single item into a fresh buffer.
pub fn to_bytes<T: Item>(item: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(T::FIXED_SIZE.unwrap_or(16));
    item.encode(&mut buf);
    buf.freeze()
}

/// An ordered byte-stream writer. Closing a writer is the end-of-data signal
/// for whoever reads the other side.
pub trait BlockWriter {
    /// Append raw bytes.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Force buffered bytes out to the underlying stream.
    fn flush(&mut self) -> Result<()>;

    /// Flush and close. Later writes fail.
    fn close(&mut self) -> Result<()>;

    /// Serialize and append one item.
    fn put<T: Item>(&mut self, item: &T) -> Result<()> {
        let mut buf = BytesMut::new();
        item.encode(&mut buf);
        self.append(&buf)
    }
}

#[derive(Debug, Default)]
struct MemoryFile {
    data: BytesMut,
    flushes: usize,
    closed: bool,
}

/// Shared view of what a [`MemoryWriter`] has flushed so far.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    file: Arc<Mutex<MemoryFile>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer appending into this sink.
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            buffer: BytesMut::new(),
            sink: self.clone(),
            closed: false,
        }
    }

    /// Bytes flushed so far.
    pub fn bytes(&self) -> Bytes {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&file.data)
    }

    /// A reader over the bytes flushed so far.
    pub fn reader(&self) -> BlockReader {
        BlockReader::new(self.bytes())
    }

    pub fn is_closed(&self) -> bool {
        self.file.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn num_flushes(&self) -> usize {
        self.file.lock().unwrap_or_else(PoisonError::into_inner).flushes
    }
}

/// In-memory [`BlockWriter`], buffering until `flush`.
#[derive(Debug)]
pub struct MemoryWriter {
    buffer: BytesMut,
    sink: MemorySink,
    closed: bool,
}

impl BlockWriter for MemoryWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::WriterClosed);
        }
        self.buffer.put_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::WriterClosed);
        }
        let mut file = self.sink.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.data.put(self.buffer.split());
        file.flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.closed = true;
        self.sink.file.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        Ok(())
    }
}

/// Synchronous reader over a contiguous byte buffer.
#[derive(Debug, Clone)]
pub struct BlockReader {
    data: Bytes,
}

impl BlockReader {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn has_next(&self) -> bool {
        self.data.has_remaining()
    }

    pub fn next<T: Item>(&mut self) -> Result<T> {
        T::decode(&mut self.data)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        ensure_remaining(&self.data, len, "raw read")?;
        Ok(self.data.split_to(len))
    }

    /// Decode items until the buffer is exhausted.
    pub fn collect<T: Item>(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next() {
            out.push(self.next()?);
        }
        Ok(out)
    }
}
