//! Cursor byte buffers used to assemble and pick apart protocol packets.
//! All multi-byte scalars are network byte order. Strings travel as UTF-8
//! behind a four-byte length; identifiers and short names behind a one-byte
//! length.

use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use std::str;

/// Advances `read` past `count` bytes and returns them, failing when the
/// packet ends early.
#[inline]
fn take<'a>(data: &'a [u8], read: &mut usize, count: usize) -> NetworkResult<&'a [u8]> {
    if count > data.len() - *read {
        return Err(NetworkError::Fatal(ErrorType::TruncatedPacket));
    }

    let slice = &data[*read..*read + count];
    *read += count;
    Ok(slice)
}

#[inline]
fn take_u8(data: &[u8], read: &mut usize) -> NetworkResult<u8> {
    Ok(take(data, read, 1)?[0])
}

#[inline]
fn take_i32(data: &[u8], read: &mut usize) -> NetworkResult<i32> {
    Ok(BigEndian::read_i32(take(data, read, 4)?))
}

#[inline]
fn take_i64(data: &[u8], read: &mut usize) -> NetworkResult<i64> {
    Ok(BigEndian::read_i64(take(data, read, 8)?))
}

#[inline]
fn take_array<'a>(data: &'a [u8], read: &mut usize) -> NetworkResult<&'a [u8]> {
    let length = take_u8(data, read)? as usize;
    take(data, read, length)
}

#[inline]
fn take_string(data: &[u8], read: &mut usize) -> NetworkResult<String> {
    let length = take_i32(data, read)?;
    if length < 0 {
        return Err(NetworkError::Fatal(ErrorType::TruncatedPacket));
    }

    let bytes = take(data, read, length as usize)?;
    match str::from_utf8(bytes) {
        Ok(text) => Ok(text.to_owned()),
        Err(_) => Err(NetworkError::Fatal(ErrorType::MalformedText)),
    }
}

/// A growless, capacity-bounded byte buffer with independent read and write
/// cursors. Outbound packets are composed into one of these; the frame
/// scratch area the driver peels frames into is another.
pub struct PacketBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl PacketBuffer {
    /// An empty buffer owning `capacity` bytes of storage.
    #[inline]
    pub fn with_capacity(capacity: usize) -> PacketBuffer {
        PacketBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.write
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write == 0
    }

    /// Bytes written but not yet read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// The written-but-unread region.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Rewinds both cursors, discarding buffered contents.
    #[inline]
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    #[inline]
    fn ensure(&self, count: usize) -> NetworkResult<()> {
        if count > self.data.len() - self.write {
            return Err(NetworkError::Fatal(ErrorType::Overflow));
        }
        Ok(())
    }

    #[inline]
    pub fn put_u8(&mut self, value: u8) -> NetworkResult<()> {
        self.ensure(1)?;
        self.data[self.write] = value;
        self.write += 1;
        Ok(())
    }

    #[inline]
    pub fn put_i32(&mut self, value: i32) -> NetworkResult<()> {
        self.ensure(4)?;
        BigEndian::write_i32(&mut self.data[self.write..self.write + 4], value);
        self.write += 4;
        Ok(())
    }

    #[inline]
    pub fn put_i64(&mut self, value: i64) -> NetworkResult<()> {
        self.ensure(8)?;
        BigEndian::write_i64(&mut self.data[self.write..self.write + 8], value);
        self.write += 8;
        Ok(())
    }

    #[inline]
    pub fn put_bool(&mut self, value: bool) -> NetworkResult<()> {
        self.put_u8(if value { 1 } else { 0 })
    }

    /// Appends the bytes verbatim, without a length tag.
    #[inline]
    pub fn put_raw(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        self.ensure(bytes.len())?;
        self.data[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        Ok(())
    }

    /// Appends a one-byte length tag followed by the bytes. Arrays longer
    /// than 255 bytes cannot be described on the wire.
    #[inline]
    pub fn put_array(&mut self, bytes: &[u8]) -> NetworkResult<()> {
        if bytes.len() > u8::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::OversizeArray));
        }

        self.ensure(1 + bytes.len())?;
        self.put_u8(bytes.len() as u8)?;
        self.put_raw(bytes)
    }

    /// Appends a four-byte big-endian UTF-8 byte count followed by the
    /// encoded string.
    #[inline]
    pub fn put_string(&mut self, text: &str) -> NetworkResult<()> {
        let bytes = text.as_bytes();
        self.ensure(4 + bytes.len())?;
        self.put_i32(bytes.len() as i32)?;
        self.put_raw(bytes)
    }

    /// One-byte-length variant of [`put_string`](Self::put_string), used for
    /// short names such as channel join requests.
    #[inline]
    pub fn put_string_byte_len(&mut self, text: &str) -> NetworkResult<()> {
        let bytes = text.as_bytes();
        if bytes.len() > u8::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::OversizeArray));
        }

        self.ensure(1 + bytes.len())?;
        self.put_u8(bytes.len() as u8)?;
        self.put_raw(bytes)
    }

    #[inline]
    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        take_u8(&self.data[..self.write], &mut self.read)
    }

    #[inline]
    pub fn get_i32(&mut self) -> NetworkResult<i32> {
        take_i32(&self.data[..self.write], &mut self.read)
    }

    #[inline]
    pub fn get_i64(&mut self) -> NetworkResult<i64> {
        take_i64(&self.data[..self.write], &mut self.read)
    }

    #[inline]
    pub fn get_bool(&mut self) -> NetworkResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a one-byte length tag and returns a reference to that many
    /// following bytes. The borrow must not outlive the buffer.
    #[inline]
    pub fn get_array(&mut self) -> NetworkResult<&[u8]> {
        take_array(&self.data[..self.write], &mut self.read)
    }

    #[inline]
    pub fn get_string(&mut self) -> NetworkResult<String> {
        take_string(&self.data[..self.write], &mut self.read)
    }

    /// Returns the unread tail and advances the read cursor to the end.
    #[inline]
    pub fn get_remaining_as_array(&mut self) -> &[u8] {
        let slice = &self.data[self.read..self.write];
        self.read = self.write;
        slice
    }
}

/// A non-owning read view over an existing byte slice: read cursor at the
/// start, write cursor at the end. This is how inbound frames are picked
/// apart without copying their payloads.
pub struct PacketView<'a> {
    data: &'a [u8],
    read: usize,
}

impl<'a> PacketView<'a> {
    #[inline]
    pub fn wrap(data: &'a [u8]) -> PacketView<'a> {
        PacketView { data, read: 0 }
    }

    /// Bytes left to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.data.len() - self.read
    }

    #[inline]
    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        take_u8(self.data, &mut self.read)
    }

    #[inline]
    pub fn get_i32(&mut self) -> NetworkResult<i32> {
        take_i32(self.data, &mut self.read)
    }

    #[inline]
    pub fn get_i64(&mut self) -> NetworkResult<i64> {
        take_i64(self.data, &mut self.read)
    }

    #[inline]
    pub fn get_bool(&mut self) -> NetworkResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    #[inline]
    pub fn get_array(&mut self) -> NetworkResult<&'a [u8]> {
        take_array(self.data, &mut self.read)
    }

    #[inline]
    pub fn get_string(&mut self) -> NetworkResult<String> {
        take_string(self.data, &mut self.read)
    }

    #[inline]
    pub fn get_remaining_as_array(&mut self) -> &'a [u8] {
        let slice = &self.data[self.read..];
        self.read = self.data.len();
        slice
    }
}

/// Free list of packet buffers keyed by capacity class. Outbound packet
/// headers are small and allocated on every send, so recycling them keeps
/// the hot path allocation-free.
pub struct PacketPool {
    buckets: HashMap<usize, Vec<PacketBuffer>>,
}

impl PacketPool {
    /// Capacity classes sized for the packet headers this protocol
    /// produces: bare opcodes, id-bearing headers, and the worst-case
    /// multicast recipient list.
    const CLASSES: [usize; 3] = [64, 1024, 8192];
    const MAX_POOLED_PER_CLASS: usize = 8;

    #[inline]
    pub fn new() -> PacketPool {
        PacketPool {
            buckets: HashMap::new(),
        }
    }

    #[inline]
    fn class_for(capacity: usize) -> usize {
        for &class in Self::CLASSES.iter() {
            if capacity <= class {
                return class;
            }
        }
        capacity
    }

    /// Fetches a cleared buffer of at least `capacity` bytes, reusing a
    /// pooled one when available.
    #[inline]
    pub fn acquire(&mut self, capacity: usize) -> PacketBuffer {
        let class = Self::class_for(capacity);

        match self.buckets.get_mut(&class).and_then(Vec::pop) {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => PacketBuffer::with_capacity(class),
        }
    }

    /// Returns a buffer to its capacity-class bucket. Buckets are bounded;
    /// surplus buffers are simply dropped.
    #[inline]
    pub fn release(&mut self, buffer: PacketBuffer) {
        let bucket = self.buckets.entry(buffer.capacity()).or_insert_with(Vec::new);

        if bucket.len() < Self::MAX_POOLED_PER_CLASS {
            bucket.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_u8(0xAB).unwrap();
        buffer.put_i32(-559038737).unwrap();
        buffer.put_i64(0x0102_0304_0506_0708).unwrap();
        buffer.put_bool(true).unwrap();
        buffer.put_bool(false).unwrap();

        assert_eq!(buffer.get_u8().unwrap(), 0xAB);
        assert_eq!(buffer.get_i32().unwrap(), -559038737);
        assert_eq!(buffer.get_i64().unwrap(), 0x0102_0304_0506_0708);
        assert!(buffer.get_bool().unwrap());
        assert!(!buffer.get_bool().unwrap());
        assert_eq!(buffer.readable(), 0);
    }

    #[test]
    fn test_i32_is_big_endian() {
        let mut buffer = PacketBuffer::with_capacity(4);

        buffer.put_i32(0x0102_0304).unwrap();

        assert_eq!(buffer.read_slice(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_i64_is_full_eight_byte_swap() {
        // All eight bytes must participate in the byte order, not just the
        // low half.
        let mut buffer = PacketBuffer::with_capacity(8);

        buffer.put_i64(0x0102_0304_0506_0708).unwrap();

        assert_eq!(
            buffer.read_slice(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_array_roundtrip() {
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_array(&[0xBE, 0xEF]).unwrap();

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.get_array().unwrap(), &[0xBE, 0xEF]);
    }

    #[test]
    fn test_array_too_long() {
        let mut buffer = PacketBuffer::with_capacity(512);

        let result = buffer.put_array(&[0u8; 256]);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::OversizeArray));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_string("hello").unwrap();

        assert_eq!(
            buffer.read_slice(),
            &[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']
        );
        assert_eq!(buffer.get_string().unwrap(), "hello");
    }

    #[test]
    fn test_string_length_counts_utf8_bytes() {
        // Two characters, six UTF-8 bytes. The tag must describe the bytes.
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_string("日本").unwrap();

        assert_eq!(&buffer.read_slice()[..4], &[0, 0, 0, 6]);
        assert_eq!(buffer.get_string().unwrap(), "日本");
    }

    #[test]
    fn test_string_byte_len() {
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_string_byte_len("lobby").unwrap();

        assert_eq!(buffer.read_slice(), &[5, b'l', b'o', b'b', b'b', b'y']);
    }

    #[test]
    fn test_string_malformed_utf8() {
        let mut buffer = PacketBuffer::with_capacity(64);

        buffer.put_i32(2).unwrap();
        buffer.put_raw(&[0xC3, 0x28]).unwrap();

        assert_eq!(
            buffer.get_string().unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedText)
        );
    }

    #[test]
    fn test_write_overflow() {
        let mut buffer = PacketBuffer::with_capacity(3);

        buffer.put_u8(1).unwrap();

        assert_eq!(
            buffer.put_i32(2).unwrap_err(),
            NetworkError::Fatal(ErrorType::Overflow)
        );
        // A failed write leaves the cursor untouched.
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_read_past_end() {
        let mut buffer = PacketBuffer::with_capacity(8);

        buffer.put_u8(1).unwrap();
        buffer.get_u8().unwrap();

        assert_eq!(
            buffer.get_u8().unwrap_err(),
            NetworkError::Fatal(ErrorType::TruncatedPacket)
        );
    }

    #[test]
    fn test_truncated_array() {
        let mut view = PacketView::wrap(&[5, 1, 2]);

        assert_eq!(
            view.get_array().unwrap_err(),
            NetworkError::Fatal(ErrorType::TruncatedPacket)
        );
    }

    #[test]
    fn test_view_wraps_full_slice() {
        let data = [0u8, 0, 0, 42, 0xFF];
        let mut view = PacketView::wrap(&data);

        assert_eq!(view.readable(), 5);
        assert_eq!(view.get_i32().unwrap(), 42);
        assert_eq!(view.get_remaining_as_array(), &[0xFF]);
        assert_eq!(view.readable(), 0);
    }

    #[test]
    fn test_remaining_as_array() {
        let mut buffer = PacketBuffer::with_capacity(16);

        buffer.put_u8(9).unwrap();
        buffer.put_raw(&[1, 2, 3]).unwrap();
        buffer.get_u8().unwrap();

        assert_eq!(buffer.get_remaining_as_array(), &[1, 2, 3]);
        assert_eq!(buffer.readable(), 0);
        // Reading the empty tail again is fine.
        assert_eq!(buffer.get_remaining_as_array(), &[] as &[u8]);
    }

    #[test]
    fn test_pool_recycles_by_class() {
        let mut pool = PacketPool::new();

        let mut buffer = pool.acquire(10);
        assert_eq!(buffer.capacity(), 64);
        buffer.put_u8(1).unwrap();
        pool.release(buffer);

        // The recycled buffer comes back cleared.
        let buffer = pool.acquire(32);
        assert_eq!(buffer.capacity(), 64);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pool_oversize_is_exact() {
        let mut pool = PacketPool::new();

        let buffer = pool.acquire(100_000);

        assert_eq!(buffer.capacity(), 100_000);
    }
}
