//! Framed transport driver: owns the non-blocking stream socket, the
//! inbound ring and the outbound frame queue, and splits the byte stream
//! into length-prefixed frames for the codec.

use crate::net::buffer::{Buffer, IngressEnd};
use crate::net::packet::PacketBuffer;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use mio::net::TcpStream;
use quark::logging::{self, debug, trace, warn};
use std::collections::VecDeque;
use std::io::Write;
use std::net::Shutdown;

/// Largest legal frame payload, opcode included. The four-byte length
/// prefix is not counted.
pub const MAX_FRAME_SIZE: usize = 65_535;

const LENGTH_PREFIX_SIZE: usize = 4;

// Room for at least two maximum-size frames so a burst never deadlocks the
// peel loop.
const INBOUND_BUF_SIZE: usize = 2 * 65536;

/// One fully framed outbound packet and how much of it has hit the wire.
struct PendingFrame {
    data: Box<[u8]>,
    sent: usize,
}

/// The transport driver. All operations are non-blocking; `Wait` outcomes
/// mean "call again when the socket signals readiness". Concurrent entry is
/// not possible: every operation takes `&mut self`.
pub struct Driver {
    stream: Option<TcpStream>,
    inbound: Buffer,
    outbound: VecDeque<PendingFrame>,
    peer_closed: bool,
    log: logging::Logger,
}

impl Driver {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Driver {
        Driver {
            stream: None,
            inbound: Buffer::new(INBOUND_BUF_SIZE),
            outbound: VecDeque::new(),
            peer_closed: false,
            log: logging::child(log),
        }
    }

    /// Adopts a freshly connected (or connecting) stream. The driver must
    /// be closed for this operation to succeed.
    #[inline]
    pub fn open(&mut self, stream: TcpStream) {
        if self.stream.is_some() {
            panic!("Attempted to open an already open driver");
        }

        debug!(self.log, "transport opened"; "context" => "open");
        self.stream = Some(stream);
        self.peer_closed = false;
    }

    /// Shuts the socket down and discards all buffered state.
    #[inline]
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
            debug!(self.log, "transport closed";
                   "context" => "close",
                   "unsent_frames" => self.outbound.len(),
                   "unread_bytes" => self.inbound.len());
        }

        self.inbound.clear();
        self.outbound.clear();
        self.peer_closed = false;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The underlying stream, for poll registration by the owner.
    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// True once the peer has closed its end of the stream.
    #[inline]
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Returns true if there is outgoing data queued on the driver.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// The readiness interest an external reactor should register for the
    /// driver's socket in its current state. Writable interest is only
    /// wanted while frames are pending.
    #[inline]
    pub fn interest(&self) -> mio::Ready {
        match self.has_egress() {
            true => mio::Ready::readable() | mio::Ready::writable(),
            false => mio::Ready::readable(),
        }
    }

    /// Frames the supplied byte ranges as one packet and queues it, then
    /// attempts an immediate partial send. A fatal send error is deferred:
    /// the frame stays queued and the failure surfaces as a peer close on
    /// the next pump.
    pub fn enqueue(&mut self, parts: &[&[u8]]) -> NetworkResult<()> {
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();

        if payload_len > MAX_FRAME_SIZE {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let mut data = vec![0u8; LENGTH_PREFIX_SIZE + payload_len].into_boxed_slice();
        BigEndian::write_u32(&mut data[..LENGTH_PREFIX_SIZE], payload_len as u32);

        let mut cursor = LENGTH_PREFIX_SIZE;
        for part in parts {
            data[cursor..cursor + part.len()].copy_from_slice(part);
            cursor += part.len();
        }

        trace!(self.log, "frame queued";
               "context" => "enqueue",
               "payload_len" => payload_len,
               "queued_frames" => self.outbound.len() + 1);

        self.outbound.push_back(PendingFrame { data, sent: 0 });

        match self.flush() {
            Ok(_) | Err(NetworkError::Wait) => Ok(()),
            Err(err) => {
                warn!(self.log, "send failed, deferring close";
                      "context" => "enqueue", "error" => %err);
                self.peer_closed = true;
                Ok(())
            }
        }
    }

    /// Pushes queued frames to the socket until the queue empties or the
    /// socket would block.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        let Driver { stream, outbound, .. } = self;

        let stream = match stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(0),
        };

        flush_to(outbound, stream)
    }

    /// Reads all available bytes off the socket into the inbound ring.
    /// Returns why the pass stopped; `Full` means the caller must peel
    /// frames and call again before waiting for readiness.
    pub fn fill(&mut self) -> NetworkResult<IngressEnd> {
        let Driver { stream, inbound, log, .. } = self;

        let stream = match stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(IngressEnd::Drained),
        };

        let (received, end) = inbound.ingress(stream).map_err(NetworkError::from)?;

        trace!(log, "ingress pass";
               "context" => "fill",
               "received" => received,
               "end" => ?end);

        if end == IngressEnd::Closed {
            self.peer_closed = true;
        }

        Ok(end)
    }

    /// Attempts to peel one complete frame out of the inbound ring into the
    /// supplied scratch buffer. Returns false when no complete frame is
    /// buffered yet. An over-length prefix is a fatal protocol error.
    pub fn next_frame(&mut self, scratch: &mut PacketBuffer) -> NetworkResult<bool> {
        let buffered = self.inbound.read_slice();

        if buffered.len() < LENGTH_PREFIX_SIZE {
            return Ok(false);
        }

        let length = BigEndian::read_u32(&buffered[..LENGTH_PREFIX_SIZE]) as usize;

        if length > MAX_FRAME_SIZE {
            warn!(self.log, "over-length frame";
                  "context" => "next_frame", "length" => length);
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        if buffered.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(false);
        }

        scratch.clear();
        scratch.put_raw(&buffered[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length])?;
        self.inbound.consume(LENGTH_PREFIX_SIZE + length);

        Ok(true)
    }

    /// Test hook: feed raw wire bytes into the inbound ring, bypassing the
    /// socket.
    #[cfg(test)]
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.inbound.push_bytes(bytes);
    }

    /// Test hook: snapshot of the queued outbound frames, prefix included.
    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> Vec<Vec<u8>> {
        self.outbound.iter().map(|frame| frame.data.to_vec()).collect()
    }
}

fn flush_to<W: Write>(
    outbound: &mut VecDeque<PendingFrame>,
    mut writer: W,
) -> NetworkResult<usize> {
    let mut total = 0;

    while let Some(frame) = outbound.front_mut() {
        match writer.write(&frame.data[frame.sent..]) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::PeerClosed)),
            Ok(count) => {
                frame.sent += count;
                total += count;

                if frame.sent == frame.data.len() {
                    outbound.pop_front();
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(total)
}
