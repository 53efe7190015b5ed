//! Relays the rest of a plain HTTP request after its rewritten request line.
//!
//! A plain session serves exactly one request. Header lines are copied one
//! at a time with the client's connection-management headers replaced by
//! `Connection: close`, then the body is copied up to its declared length.
//! Whatever the client sends after that is discarded, never forwarded.

use crate::buffer::ByteBuffer;

const CONNECTION_CLOSE: &[u8] = b"Connection: close\r\n";

/// Headers that describe the client's hop rather than the request.
const HOP_BY_HOP: [&str; 3] = ["connection", "proxy-connection", "keep-alive"];

/// A header line that can never fit the upstream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderTooLarge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    /// This many body bytes are still to be copied.
    Body(u64),
    /// Chunked body; copied until the session ends.
    Unbounded,
    Done,
}

#[derive(Debug)]
pub(crate) struct RequestRelay {
    phase: Phase,
    content_length: Option<u64>,
    chunked: bool,
}

impl RequestRelay {
    pub fn new() -> Self {
        Self {
            phase: Phase::Headers,
            content_length: None,
            chunked: false,
        }
    }

    /// True once the request has been fully handed to `dst`.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Moves what fits from `src` to `dst`. Returns whether anything moved
    /// or was dropped.
    pub fn relay(
        &mut self,
        src: &mut ByteBuffer,
        dst: &mut ByteBuffer,
    ) -> Result<bool, HeaderTooLarge> {
        let mut progress = false;

        while self.phase == Phase::Headers {
            let Some(pos) = src.readable().iter().position(|&b| b == b'\n') else {
                if src.is_full() {
                    return Err(HeaderTooLarge);
                }
                return Ok(progress);
            };
            let len = pos + 1;
            let line = &src.readable()[..len];
            let content = line_content(line);

            if content.is_empty() {
                if dst.free() < CONNECTION_CLOSE.len() + len {
                    return blocked(dst, progress);
                }
                dst.push(CONNECTION_CLOSE);
                dst.push(line);
                self.phase = self.body_phase();
            } else if !is_hop_by_hop(content) {
                if dst.free() < len {
                    return blocked(dst, progress);
                }
                self.note_header(content);
                dst.push(line);
            }
            src.consume(len);
            progress = true;
        }

        match self.phase {
            Phase::Headers => {}
            Phase::Body(remaining) => {
                let n = (src.len() as u64).min(remaining) as usize;
                let n = dst.push(&src.readable()[..n]);
                src.consume(n);
                progress |= n > 0;

                let remaining = remaining - n as u64;
                self.phase = if remaining == 0 {
                    Phase::Done
                } else {
                    Phase::Body(remaining)
                };
            }
            Phase::Unbounded => progress |= src.transfer_into(dst, |_| {}) > 0,
            Phase::Done => {}
        }

        if self.phase == Phase::Done && !src.is_empty() {
            src.clear();
            progress = true;
        }
        Ok(progress)
    }

    fn note_header(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let Some((name, value)) = text.split_once(':') else {
            return;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") && self.content_length.is_none() {
            self.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        {
            self.chunked = true;
        }
    }

    fn body_phase(&self) -> Phase {
        if self.chunked {
            return Phase::Unbounded;
        }
        match self.content_length {
            Some(n) if n > 0 => Phase::Body(n),
            _ => Phase::Done,
        }
    }
}

/// Waiting for `dst` to drain is fine unless it is already empty.
fn blocked(dst: &ByteBuffer, progress: bool) -> Result<bool, HeaderTooLarge> {
    if dst.is_empty() {
        Err(HeaderTooLarge)
    } else {
        Ok(progress)
    }
}

fn line_content(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_hop_by_hop(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = String::from_utf8_lossy(&line[..colon]);
    let name = name.trim();
    HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize, bytes: &[u8]) -> ByteBuffer {
        let mut buf = ByteBuffer::new(capacity);
        assert_eq!(buf.push(bytes), bytes.len());
        buf
    }

    fn relay_all(relay: &mut RequestRelay, input: &[u8]) -> Vec<u8> {
        let mut src = buffer(4096, input);
        let mut dst = ByteBuffer::new(4096);
        relay.relay(&mut src, &mut dst).unwrap();
        dst.readable().to_vec()
    }

    #[test]
    fn connection_headers_become_close() {
        let mut relay = RequestRelay::new();
        let out = relay_all(
            &mut relay,
            b"Host: a.com\r\nProxy-Connection: keep-alive\r\nconnection: Keep-Alive\r\nKeep-Alive: 300\r\nAccept: */*\r\n\r\n",
        );
        assert_eq!(
            out,
            b"Host: a.com\r\nAccept: */*\r\nConnection: close\r\n\r\n".to_vec()
        );
        assert!(relay.is_done());
    }

    #[test]
    fn bytes_after_the_request_are_dropped() {
        let mut relay = RequestRelay::new();
        let out = relay_all(
            &mut relay,
            b"Host: a.com\r\n\r\nGET http://blocked.example/ HTTP/1.1\r\n\r\n",
        );
        assert_eq!(out, b"Host: a.com\r\nConnection: close\r\n\r\n".to_vec());
    }

    #[test]
    fn body_is_copied_up_to_content_length() {
        let mut relay = RequestRelay::new();
        let out = relay_all(
            &mut relay,
            b"Content-Length: 4\r\n\r\nbodyGET http://next.example/ HTTP/1.1\r\n",
        );
        assert!(out.ends_with(b"\r\n\r\nbody"));
        assert!(relay.is_done());
    }

    #[test]
    fn body_spans_several_passes() {
        let mut relay = RequestRelay::new();
        let mut src = buffer(64, b"Content-Length: 10\r\n\r\n01234");
        let mut dst = ByteBuffer::new(64);
        relay.relay(&mut src, &mut dst).unwrap();
        assert!(!relay.is_done());

        src.push(b"56789extra");
        relay.relay(&mut src, &mut dst).unwrap();
        assert!(dst.readable().ends_with(b"0123456789"));
        assert!(relay.is_done());
        assert!(src.is_empty());
    }

    #[test]
    fn chunked_body_is_not_bounded() {
        let mut relay = RequestRelay::new();
        let out = relay_all(
            &mut relay,
            b"Transfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n",
        );
        assert!(out.ends_with(b"4\r\nbody\r\n0\r\n\r\n"));
        assert!(!relay.is_done());
    }

    #[test]
    fn waits_for_room_then_resumes() {
        let mut relay = RequestRelay::new();
        let mut src = buffer(64, b"Host: a.com\r\n\r\n");
        let mut dst = buffer(40, b"GET / HTTP/1.1\r\n");

        // The terminator plus Connection: close does not fit yet.
        assert_eq!(relay.relay(&mut src, &mut dst), Ok(true));
        assert!(!relay.is_done());

        dst.consume(dst.len());
        assert_eq!(relay.relay(&mut src, &mut dst), Ok(true));
        assert!(relay.is_done());
    }

    #[test]
    fn oversized_header_line_is_rejected() {
        let mut relay = RequestRelay::new();
        let mut src = buffer(16, b"X-Long: 01234567");
        let mut dst = ByteBuffer::new(64);
        assert_eq!(relay.relay(&mut src, &mut dst), Err(HeaderTooLarge));
    }
}
