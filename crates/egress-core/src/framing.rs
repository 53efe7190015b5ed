//! Incremental HTTP response framing.
//!
//! Fed with the upstream→client byte stream of a plain GET session, in
//! whatever slices the non-blocking reads produce. It locates the end of the
//! header block, decides how the body is delimited, and mirrors the response
//! into a bounded buffer so that a byte-complete response can be cached.
//!
//! Only `Content-Length` framed responses are ever complete. Chunked and
//! close-delimited responses keep flowing but are never cacheable.

use std::fmt;

/// Header terminator.
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Upper bound on the response header block.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// How the body of a response is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Exactly this many bytes follow the header block.
    ContentLength(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the upstream closes.
    UntilClose,
}

impl fmt::Display for BodyLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentLength(n) => write!(f, "content-length {n}"),
            Self::Chunked => f.write_str("chunked"),
            Self::UntilClose => f.write_str("until-close"),
        }
    }
}

/// Outcome of feeding a slice to the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingProgress {
    /// More bytes are expected.
    InProgress,
    /// The response is byte-complete.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Headers,
    Body,
    Done,
}

/// Framing state for one response.
#[derive(Debug)]
pub struct ResponseFraming {
    phase: Phase,
    header_buf: Vec<u8>,
    status: Option<u16>,
    content_length: Option<u64>,
    chunked: bool,
    body_length: Option<BodyLength>,
    bytes_remaining: u64,
    accumulated: Vec<u8>,
    max_accumulated: usize,
    cache_eligible: bool,
    cache_error_responses: bool,
    complete: bool,
}

impl ResponseFraming {
    /// Creates a framer that mirrors at most `max_accumulated - 1` bytes.
    pub fn new(max_accumulated: usize) -> Self {
        Self {
            phase: Phase::Headers,
            header_buf: Vec::new(),
            status: None,
            content_length: None,
            chunked: false,
            body_length: None,
            bytes_remaining: 0,
            accumulated: Vec::new(),
            max_accumulated,
            cache_eligible: true,
            cache_error_responses: false,
            complete: false,
        }
    }

    /// Allows responses with status >= 400 to be cached.
    pub fn with_cache_error_responses(mut self, enabled: bool) -> Self {
        self.cache_error_responses = enabled;
        self
    }

    /// Creates a framer that only tracks where the response ends.
    pub fn uncached() -> Self {
        let mut framing = Self::new(0);
        framing.cache_eligible = false;
        framing
    }

    /// Feeds the next slice of upstream bytes, exactly as forwarded.
    pub fn observe(&mut self, bytes: &[u8]) -> FramingProgress {
        match self.phase {
            Phase::Headers => self.observe_headers(bytes),
            Phase::Body => self.observe_body(bytes),
            Phase::Done if self.complete => FramingProgress::Complete,
            Phase::Done => FramingProgress::InProgress,
        }
    }

    fn observe_headers(&mut self, bytes: &[u8]) -> FramingProgress {
        let search_from = self.header_buf.len().saturating_sub(HEAD_END.len() - 1);
        self.header_buf.extend_from_slice(bytes);

        let Some(pos) = find(&self.header_buf[search_from..], HEAD_END) else {
            if self.header_buf.len() > MAX_HEADER_SIZE {
                tracing::debug!(
                    size = self.header_buf.len(),
                    "response headers too large, caching disabled"
                );
                self.abandon_cache();
                self.header_buf = Vec::new();
                self.phase = Phase::Done;
            }
            return FramingProgress::InProgress;
        };

        let head_len = search_from + pos + HEAD_END.len();
        let mut buf = std::mem::take(&mut self.header_buf);
        let body = buf.split_off(head_len);

        self.parse_head(&buf);
        self.mirror(&buf);
        self.phase = Phase::Body;

        self.observe_body(&body)
    }

    fn parse_head(&mut self, head: &[u8]) {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        self.status = lines
            .next()
            .and_then(|status_line| status_line.split(' ').nth(1))
            .and_then(|code| code.trim().parse().ok());

        let mut content_length_seen = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            if name.eq_ignore_ascii_case("content-length") && !content_length_seen {
                content_length_seen = true;
                self.content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value
                    .split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            {
                self.chunked = true;
            }
        }

        let body_length = match self.status {
            Some(204) | Some(304) => BodyLength::ContentLength(0),
            _ if self.chunked => BodyLength::Chunked,
            _ => match self.content_length {
                Some(n) => BodyLength::ContentLength(n),
                None => BodyLength::UntilClose,
            },
        };

        match body_length {
            BodyLength::ContentLength(n) => self.bytes_remaining = n,
            BodyLength::Chunked | BodyLength::UntilClose => self.abandon_cache(),
        }

        match self.status {
            Some(status) if status >= 400 && !self.cache_error_responses => self.abandon_cache(),
            Some(_) => {}
            None => self.abandon_cache(),
        }

        tracing::trace!(status = ?self.status, body = %body_length, "response head parsed");
        self.body_length = Some(body_length);
    }

    fn observe_body(&mut self, bytes: &[u8]) -> FramingProgress {
        match self.body_length {
            Some(BodyLength::ContentLength(_)) => {
                let take = (bytes.len() as u64).min(self.bytes_remaining) as usize;
                self.mirror(&bytes[..take]);
                self.bytes_remaining -= take as u64;

                if self.bytes_remaining == 0 {
                    self.phase = Phase::Done;
                    self.complete = true;
                    FramingProgress::Complete
                } else {
                    FramingProgress::InProgress
                }
            }
            _ => FramingProgress::InProgress,
        }
    }

    fn mirror(&mut self, bytes: &[u8]) {
        if !self.cache_eligible || bytes.is_empty() {
            return;
        }
        if self.accumulated.len() + bytes.len() >= self.max_accumulated {
            tracing::trace!("response exceeds cache entry cap, caching abandoned");
            self.abandon_cache();
            return;
        }
        self.accumulated.extend_from_slice(bytes);
    }

    fn abandon_cache(&mut self) {
        self.cache_eligible = false;
        self.accumulated = Vec::new();
    }

    /// Takes the mirrored response if it is complete and still cacheable.
    pub fn take_cacheable(&mut self) -> Option<Vec<u8>> {
        if self.complete && self.cache_eligible {
            self.cache_eligible = false;
            Some(std::mem::take(&mut self.accumulated))
        } else {
            None
        }
    }

    /// Returns true once a Content-Length body has been fully seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns the response status code, if parsed.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Returns the parsed Content-Length (first occurrence).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Returns true if the response is chunked.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Returns the body delimitation, once headers are parsed.
    pub fn body_length(&self) -> Option<BodyLength> {
        self.body_length
    }

    /// Returns true while the response may still be cached.
    pub fn is_cache_eligible(&self) -> bool {
        self.cache_eligible
    }

    /// Number of bytes mirrored so far.
    pub fn accumulated_len(&self) -> usize {
        self.accumulated.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 1024 * 1024;

    fn feed_all(framing: &mut ResponseFraming, chunks: &[&[u8]]) -> FramingProgress {
        let mut progress = FramingProgress::InProgress;
        for chunk in chunks {
            progress = framing.observe(chunk);
        }
        progress
    }

    #[test]
    fn content_length_in_one_slice() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut framing = ResponseFraming::new(CAP);

        assert_eq!(framing.observe(response), FramingProgress::Complete);
        assert_eq!(framing.status(), Some(200));
        assert_eq!(framing.body_length(), Some(BodyLength::ContentLength(5)));
        assert_eq!(framing.take_cacheable().as_deref(), Some(&response[..]));
        assert_eq!(framing.take_cacheable(), None);
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut framing = ResponseFraming::new(CAP);
        let progress = feed_all(
            &mut framing,
            &[
                b"HTTP/1.1 200 OK\r\ncontent-length: 3\r",
                b"\n\r",
                b"\nab",
                b"c",
            ],
        );
        assert_eq!(progress, FramingProgress::Complete);
        let cached = framing.take_cacheable().unwrap();
        assert!(cached.ends_with(b"\r\n\r\nabc"));
    }

    #[test]
    fn header_names_are_case_insensitive_and_first_length_wins() {
        let mut framing = ResponseFraming::new(CAP);
        framing.observe(b"HTTP/1.1 200 OK\r\nCONTENT-LENGTH: 2\r\nContent-Length: 9\r\n\r\n");
        assert_eq!(framing.content_length(), Some(2));
        assert_eq!(framing.observe(b"ok"), FramingProgress::Complete);
    }

    #[test]
    fn bytes_after_body_are_not_mirrored() {
        let mut framing = ResponseFraming::new(CAP);
        let progress = framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA");
        assert_eq!(progress, FramingProgress::Complete);
        let cached = framing.take_cacheable().unwrap();
        assert!(cached.ends_with(b"ok"));
    }

    #[test]
    fn chunked_is_never_cacheable() {
        let mut framing = ResponseFraming::new(CAP);
        let progress = feed_all(
            &mut framing,
            &[
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, Chunked\r\nContent-Length: 5\r\n\r\n",
                b"5\r\nhello\r\n0\r\n\r\n",
            ],
        );
        assert_eq!(progress, FramingProgress::InProgress);
        assert!(framing.is_chunked());
        assert_eq!(framing.body_length(), Some(BodyLength::Chunked));
        assert!(!framing.is_cache_eligible());
        assert_eq!(framing.take_cacheable(), None);
    }

    #[test]
    fn unknown_length_is_never_cacheable() {
        let mut framing = ResponseFraming::new(CAP);
        framing.observe(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nsome body");
        assert_eq!(framing.body_length(), Some(BodyLength::UntilClose));
        assert!(!framing.is_complete());
        assert_eq!(framing.take_cacheable(), None);
    }

    #[test]
    fn oversized_response_abandons_cache_only() {
        let mut framing = ResponseFraming::new(64);
        framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        assert!(framing.is_cache_eligible());

        let progress = framing.observe(&[b'x'; 100]);
        assert_eq!(progress, FramingProgress::Complete);
        assert!(!framing.is_cache_eligible());
        assert_eq!(framing.accumulated_len(), 0);
        assert_eq!(framing.take_cacheable(), None);
    }

    #[test]
    fn error_status_not_cached_by_default() {
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";

        let mut framing = ResponseFraming::new(CAP);
        assert_eq!(framing.observe(response), FramingProgress::Complete);
        assert_eq!(framing.take_cacheable(), None);

        let mut framing = ResponseFraming::new(CAP).with_cache_error_responses(true);
        framing.observe(response);
        assert!(framing.take_cacheable().is_some());
    }

    #[test]
    fn not_modified_has_empty_body() {
        let mut framing = ResponseFraming::new(CAP);
        let progress = framing.observe(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 120\r\n\r\n");
        assert_eq!(progress, FramingProgress::Complete);
    }

    #[test]
    fn oversized_headers_give_up() {
        let mut framing = ResponseFraming::new(CAP);
        framing.observe(b"HTTP/1.1 200 OK\r\nX-Long: ");
        framing.observe(&vec![b'a'; MAX_HEADER_SIZE]);
        assert!(!framing.is_cache_eligible());
        assert_eq!(framing.body_length(), None);
        assert_eq!(
            framing.observe(b"\r\nContent-Length: 0\r\n\r\n"),
            FramingProgress::InProgress
        );
        assert_eq!(framing.take_cacheable(), None);
    }

    #[test]
    fn uncached_framer_still_finds_the_end() {
        let mut framing = ResponseFraming::uncached();
        assert_eq!(
            framing.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
            FramingProgress::Complete
        );
        assert_eq!(framing.accumulated_len(), 0);
        assert_eq!(framing.take_cacheable(), None);
    }
}
