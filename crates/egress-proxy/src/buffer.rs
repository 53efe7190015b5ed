//! Fixed-capacity byte buffers.
//!
//! Each session owns four of these. Occupancy never exceeds capacity: every
//! producer (socket read, buffer transfer, generated response) only fills the
//! space that is free, and the caller is told how much was taken.

use std::io::{self, Read, Write};

/// Outcome of one non-blocking read into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were appended. Zero only when the buffer had no room.
    Bytes(usize),
    /// The source has nothing to offer right now.
    WouldBlock,
    /// The peer closed its write side.
    EndOfStream,
    /// The read failed.
    Error(io::ErrorKind),
}

/// Outcome of one non-blocking write from a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were written and consumed.
    Bytes(usize),
    /// The sink cannot accept bytes right now.
    WouldBlock,
    /// The write failed.
    Error(io::ErrorKind),
}

/// A bounded FIFO of bytes.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl ByteBuffer {
    /// Allocates a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Bytes that can still be appended.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// The buffered bytes, oldest first.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Drops `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len());
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Appends as much of `bytes` as fits and returns how much that was.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let space = self.writable_space();
        space[..n].copy_from_slice(&bytes[..n]);
        self.tail += n;
        n
    }

    /// Moves as many bytes as `dst` has room for, showing each moved slice to
    /// `inspect` before it is consumed here.
    pub fn transfer_into<F>(&mut self, dst: &mut ByteBuffer, mut inspect: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let n = self.len().min(dst.free());
        if n == 0 {
            return 0;
        }
        let chunk = &self.data[self.head..self.head + n];
        inspect(chunk);
        let pushed = dst.push(chunk);
        debug_assert_eq!(pushed, n);
        self.consume(pushed);
        pushed
    }

    /// Performs a single read from `src` into the free space.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> ReadOutcome {
        if self.free() == 0 {
            return ReadOutcome::Bytes(0);
        }

        loop {
            let space = self.writable_space();
            match src.read(space) {
                Ok(0) => return ReadOutcome::EndOfStream,
                Ok(n) => {
                    self.tail += n;
                    return ReadOutcome::Bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::WouldBlock,
                Err(e) => return ReadOutcome::Error(e.kind()),
            }
        }
    }

    /// Performs a single write of the buffered bytes to `dst`.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> WriteOutcome {
        if self.is_empty() {
            return WriteOutcome::Bytes(0);
        }

        loop {
            match dst.write(self.readable()) {
                Ok(0) => return WriteOutcome::Error(io::ErrorKind::WriteZero),
                Ok(n) => {
                    self.consume(n);
                    return WriteOutcome::Bytes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::WouldBlock,
                Err(e) => return WriteOutcome::Error(e.kind()),
            }
        }
    }

    /// All free space as one contiguous slice at the end.
    fn writable_space(&mut self) -> &mut [u8] {
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        &mut self.data[self.tail..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A reader/writer that hands out at most `step` bytes per call.
    struct Trickle {
        input: Vec<u8>,
        output: Vec<u8>,
        step: usize,
        blocked: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.step.min(buf.len()).min(self.input.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.step.min(buf.len());
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn push_takes_only_what_fits() {
        let mut buf = ByteBuffer::new(4);
        assert_eq!(buf.push(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.push(b"x"), 0);
        assert_eq!(buf.readable(), b"abcd");
    }

    #[test]
    fn consume_then_push_compacts() {
        let mut buf = ByteBuffer::new(4);
        buf.push(b"abcd");
        buf.consume(3);
        assert_eq!(buf.free(), 3);
        assert_eq!(buf.push(b"xyz"), 3);
        assert_eq!(buf.readable(), b"dxyz");
    }

    #[test]
    fn transfer_respects_destination_space() {
        let mut src = ByteBuffer::new(8);
        let mut dst = ByteBuffer::new(3);
        src.push(b"hello");

        let mut seen = Vec::new();
        let moved = src.transfer_into(&mut dst, |chunk| seen.extend_from_slice(chunk));
        assert_eq!(moved, 3);
        assert_eq!(seen, b"hel");
        assert_eq!(src.readable(), b"lo");
        assert_eq!(dst.readable(), b"hel");

        assert_eq!(src.transfer_into(&mut dst, |_| {}), 0);
    }

    #[test]
    fn fill_reports_end_of_stream() {
        let mut buf = ByteBuffer::new(16);
        let mut src = Cursor::new(b"abc".to_vec());
        assert_eq!(buf.fill_from(&mut src), ReadOutcome::Bytes(3));
        assert_eq!(buf.fill_from(&mut src), ReadOutcome::EndOfStream);
    }

    #[test]
    fn fill_on_full_buffer_reads_nothing() {
        let mut buf = ByteBuffer::new(2);
        buf.push(b"ab");
        let mut src = Cursor::new(b"cd".to_vec());
        assert_eq!(buf.fill_from(&mut src), ReadOutcome::Bytes(0));
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn would_block_is_not_an_error() {
        let mut buf = ByteBuffer::new(8);
        let mut io = Trickle {
            input: b"abc".to_vec(),
            output: Vec::new(),
            step: 8,
            blocked: true,
        };
        assert_eq!(buf.fill_from(&mut io), ReadOutcome::WouldBlock);

        buf.push(b"xy");
        assert_eq!(buf.write_to(&mut io), WriteOutcome::WouldBlock);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_writes_keep_remainder() {
        let mut buf = ByteBuffer::new(8);
        buf.push(b"abcdef");
        let mut sink = Trickle {
            input: Vec::new(),
            output: Vec::new(),
            step: 4,
            blocked: false,
        };

        assert_eq!(buf.write_to(&mut sink), WriteOutcome::Bytes(4));
        assert_eq!(buf.readable(), b"ef");
        assert_eq!(buf.write_to(&mut sink), WriteOutcome::Bytes(2));
        assert!(buf.is_empty());
        assert_eq!(sink.output, b"abcdef");
    }

    #[test]
    fn bounded_pipe_moves_everything() {
        // A producer much larger than any buffer drains through two small
        // buffers without loss and without exceeding capacity.
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut src = Trickle {
            input: payload.clone(),
            output: Vec::new(),
            step: 700,
            blocked: false,
        };
        let mut sink = Trickle {
            input: Vec::new(),
            output: Vec::new(),
            step: 300,
            blocked: false,
        };
        let mut inbound = ByteBuffer::new(512);
        let mut outbound = ByteBuffer::new(256);

        let mut eof = false;
        while !(eof && inbound.is_empty() && outbound.is_empty()) {
            if !eof && inbound.free() > 0 && !outbound.is_full() {
                if inbound.fill_from(&mut src) == ReadOutcome::EndOfStream {
                    eof = true;
                }
            }
            inbound.transfer_into(&mut outbound, |_| {});
            outbound.write_to(&mut sink);
            assert!(inbound.len() <= inbound.capacity());
            assert!(outbound.len() <= outbound.capacity());
        }

        assert_eq!(sink.output, payload);
    }
}
