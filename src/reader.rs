//! Streaming reader handle (spec §4.6). Bound to the current inbound
//! message; exposes a lazily advancing window with pause/resume semantics
//! across the boundary of a suspended operation.

use crate::error::*;

#[derive(Debug)]
pub enum PeekOutcome<'a> {
    Bytes(&'a [u8]),
    NeedMore,
}

/// Saved reader state handed back by [`crate::context::Context::read_pause`]
/// and restored on the next `read_handshake`/`read_application` call for the
/// same logical message (spec §4.6 "Pausing").
#[derive(Clone, Debug)]
pub(crate) struct PausedReader {
    pub pos: usize,
}

#[derive(Clone, Debug)]
pub struct Reader {
    data: Vec<u8>,
    pos: usize,
    /// Whether more bytes may still arrive for this message (false once the
    /// message is fully buffered, as is always true for reassembled
    /// datagram messages and for application data/alerts).
    complete: bool,
}

impl Reader {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Reader {
            data,
            pos: 0,
            complete: true,
        }
    }

    pub(crate) fn new_partial(data: Vec<u8>) -> Self {
        Reader {
            data,
            pos: 0,
            complete: false,
        }
    }

    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub(crate) fn append(&mut self, more: &[u8]) {
        self.data.extend_from_slice(more);
    }

    pub(crate) fn restore(&mut self, paused: PausedReader) {
        self.pos = paused.pos.min(self.data.len());
    }

    pub(crate) fn pause_state(&self) -> PausedReader {
        PausedReader { pos: self.pos }
    }

    /// `peek` may return fewer bytes than requested only if the message
    /// ends there (spec §4.6).
    pub fn peek(&self, n: usize) -> PeekOutcome<'_> {
        let available = self.data.len() - self.pos;
        if available >= n {
            PeekOutcome::Bytes(&self.data[self.pos..self.pos + n])
        } else if self.complete {
            PeekOutcome::Bytes(&self.data[self.pos..])
        } else {
            PeekOutcome::NeedMore
        }
    }

    pub fn advance(&mut self, n: usize) -> Result<()> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(Error::ErrBadInput("advance beyond available message bytes"));
        }
        self.pos += n;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_returns_exact_window_without_consuming() {
        let r = Reader::new(b"hello world".to_vec());
        assert!(matches!(r.peek(5), PeekOutcome::Bytes(b) if b == b"hello"));
        assert_eq!(r.remaining(), 11);
    }

    #[test]
    fn advance_moves_the_window() {
        let mut r = Reader::new(b"hello world".to_vec());
        r.advance(6).unwrap();
        assert!(matches!(r.peek(5), PeekOutcome::Bytes(b) if b == b"world"));
    }

    #[test]
    fn peek_past_end_of_an_incomplete_message_asks_for_more() {
        let r = Reader::new_partial(b"abc".to_vec());
        assert!(matches!(r.peek(10), PeekOutcome::NeedMore));
    }

    #[test]
    fn peek_past_end_of_a_complete_message_returns_the_short_remainder() {
        let r = Reader::new(b"abc".to_vec());
        assert!(matches!(r.peek(10), PeekOutcome::Bytes(b) if b == b"abc"));
    }

    #[test]
    fn pause_and_restore_round_trips_position() {
        let mut r = Reader::new(b"hello world".to_vec());
        r.advance(6).unwrap();
        let paused = r.pause_state();
        let mut r2 = Reader::new(b"hello world".to_vec());
        r2.restore(paused);
        assert!(matches!(r2.peek(5), PeekOutcome::Bytes(b) if b == b"world"));
    }

    #[test]
    fn advance_beyond_remaining_is_rejected() {
        let mut r = Reader::new(b"abc".to_vec());
        assert!(r.advance(10).is_err());
    }
}
