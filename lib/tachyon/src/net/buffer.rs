use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

// Capacities are multiples of this so the ring always holds at least one
// maximum-size frame plus its length prefix.
const BUF_SIZE_INCREMENT: usize = 65536;

/// Why an ingress pass stopped reading.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IngressEnd {
    /// The source has no more bytes for now (`WouldBlock`).
    Drained,
    /// The buffer filled up; decode frames and call again.
    Full,
    /// The source reported end-of-stream.
    Closed,
}

/// A contiguous FIFO byte ring. Data is appended at the tail from a
/// non-blocking reader and consumed from the head by the frame decoder; both
/// regions are always available as single slices.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be divisible by {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Read from the supplied non-blocking reader until it would block, the
    /// stream ends, or the buffer fills. Returns the byte count taken in and
    /// the reason the pass stopped. Only genuine I/O failures are errors.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, IngressEnd)> {
        let mut received = 0;

        while self.data.len() < self.size {
            let buffered = self.data.len();

            unsafe {
                let free = self.data.tail_head_slice();
                let window = free.len().min(self.size - buffered);

                match reader.read(&mut free[..window]) {
                    Ok(0) => return Ok((received, IngressEnd::Closed)),
                    Ok(count) => {
                        self.data.move_tail(count as isize);
                        received += count;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok((received, IngressEnd::Drained));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }

        Ok((received, IngressEnd::Full))
    }

    /// Append bytes directly, bypassing a reader. Test and frame-assembly
    /// helper; panics when the data does not fit.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.free_capacity(),
            "Buffer overrun: {} bytes into {} free",
            bytes.len(),
            self.free_capacity()
        );

        unsafe {
            self.data.tail_head_slice()[..bytes.len()].copy_from_slice(bytes);
            self.data.move_tail(bytes.len() as isize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader handing out its data in fixed-size chunks, then signalling
    /// either `WouldBlock` or end-of-stream.
    struct MockStream {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        eof_at_end: bool,
    }

    impl MockStream {
        fn new(data: Vec<u8>, chunk: usize, eof_at_end: bool) -> MockStream {
            MockStream {
                data,
                cursor: 0,
                chunk,
                eof_at_end,
            }
        }
    }

    impl io::Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                if self.eof_at_end {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    #[test]
    fn test_ingress_until_drained() {
        let payload: Vec<_> = (0..2000u32).map(|item| item as u8).collect();
        let mut stream = MockStream::new(payload.clone(), 333, false);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let (received, end) = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, payload.len());
        assert_eq!(end, IngressEnd::Drained);
        assert_eq!(buffer.read_slice(), &payload[..]);
    }

    #[test]
    fn test_ingress_reports_closed() {
        let mut stream = MockStream::new(vec![1, 2, 3], 2, true);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let (received, end) = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, 3);
        assert_eq!(end, IngressEnd::Closed);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_when_full() {
        let payload = vec![7u8; BUF_SIZE_INCREMENT * 2];
        let mut stream = MockStream::new(payload, 4096, false);
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        let (received, end) = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, BUF_SIZE_INCREMENT);
        assert_eq!(end, IngressEnd::Full);
        assert_eq!(buffer.free_capacity(), 0);

        // Consuming makes room for the rest.
        buffer.consume(BUF_SIZE_INCREMENT / 2);
        let (received, end) = buffer.ingress(&mut stream).unwrap();

        assert_eq!(received, BUF_SIZE_INCREMENT / 2);
        assert_eq!(end, IngressEnd::Full);
    }

    #[test]
    fn test_ingress_propagates_real_errors() {
        struct BrokenStream;

        impl io::Read for BrokenStream {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }

        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);
        let result = buffer.ingress(BrokenStream);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_consume_and_wraparound() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        // Cycle more data through the ring than its capacity to exercise
        // wraparound of the backing deque.
        for round in 0..8u32 {
            let payload: Vec<_> = (0..BUF_SIZE_INCREMENT / 4)
                .map(|item| (item as u8).wrapping_add(round as u8))
                .collect();

            buffer.push_bytes(&payload);
            assert_eq!(buffer.read_slice(), &payload[..]);
            buffer.consume(payload.len());
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_clear() {
        let mut buffer = Buffer::new(BUF_SIZE_INCREMENT);

        buffer.push_bytes(&[1, 2, 3]);
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), BUF_SIZE_INCREMENT);
    }

    #[test]
    #[should_panic(expected = "Buffer size must be divisible by 65536, got 100000")]
    fn test_fail_on_incorrect_increment() {
        let _ = Buffer::new(100000);
    }
}
