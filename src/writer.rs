//! Streaming writer handle (spec §4.6), symmetric to [`crate::reader::Reader`].
//! Backed by a scratch buffer sized by `Context` — to the whole declared
//! message length when one is known, so the caller can fill it across
//! several `reserve`/`commit` calls before a single `dispatch` fragments it
//! across as many records as it takes, or to one record's remaining
//! capacity when no length was declared (in which case the message may
//! never span more than that one record/fragment).

use crate::error::*;

#[derive(Debug)]
pub enum ReserveOutcome<'a> {
    Ready(&'a mut [u8]),
}

#[derive(Clone, Debug)]
pub(crate) struct PausedWriter {
    pub committed_total: u32,
}

pub struct Writer {
    scratch: Vec<u8>,
    used: usize,
    declared_len: Option<u32>,
    committed_total: u32,
}

impl Writer {
    pub(crate) fn new(capacity: usize, declared_len: Option<u32>) -> Self {
        Writer {
            scratch: vec![0u8; capacity],
            used: 0,
            declared_len,
            committed_total: 0,
        }
    }

    pub(crate) fn pause_allowed(&self) -> bool {
        self.declared_len.is_some()
    }

    pub(crate) fn pause_state(&self) -> PausedWriter {
        PausedWriter {
            committed_total: self.committed_total,
        }
    }

    pub(crate) fn restore(&mut self, paused: PausedWriter) {
        self.committed_total = paused.committed_total;
    }

    pub(crate) fn declared_len(&self) -> Option<u32> {
        self.declared_len
    }

    /// Returns a writable window of up to `n` bytes. If a total length was
    /// declared, reserving beyond it fails outright with `bad-input`. The
    /// scratch buffer is sized to the whole declared length up front (the
    /// caller fills one buffer across `reserve`/`commit` calls, and a single
    /// `dispatch` is what splits it across records, spec §4.4), so there is
    /// no mid-fill point at which reserving more room requires a dispatch.
    /// Without a declared length, fragmentation is disallowed (spec §4.4):
    /// exceeding the one record/fragment this scratch buffer holds is
    /// itself `bad-input`.
    pub fn reserve(&mut self, n: usize) -> Result<ReserveOutcome<'_>> {
        if let Some(total) = self.declared_len {
            if self.committed_total as usize + n > total as usize {
                return Err(Error::ErrBadInput("reserve exceeds declared message length"));
            }
        }
        if self.used + n > self.scratch.len() {
            return Err(Error::ErrBadInput(
                "message length was not declared up front; cannot fragment across records",
            ));
        }
        Ok(ReserveOutcome::Ready(&mut self.scratch[self.used..self.used + n]))
    }

    pub fn commit(&mut self, n: usize) -> Result<()> {
        if self.used + n > self.scratch.len() {
            return Err(Error::ErrBadInput("commit exceeds reserved capacity"));
        }
        self.used += n;
        self.committed_total += n as u32;
        Ok(())
    }

    /// Drains the bytes committed so far in the current record, resetting
    /// the scratch cursor for the next one.
    pub(crate) fn take_committed(&mut self) -> Vec<u8> {
        let bytes = self.scratch[..self.used].to_vec();
        self.used = 0;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_commit_accumulates_bytes() {
        let mut w = Writer::new(16, Some(5));
        if let ReserveOutcome::Ready(buf) = w.reserve(5).unwrap() {
            buf.copy_from_slice(b"hello");
        } else {
            panic!("expected Ready");
        }
        w.commit(5).unwrap();
        assert_eq!(w.take_committed(), b"hello");
    }

    #[test]
    fn reserve_beyond_declared_length_is_bad_input() {
        let mut w = Writer::new(16, Some(3));
        assert!(w.reserve(4).is_err());
    }

    #[test]
    fn reserve_beyond_capacity_without_declared_length_is_bad_input() {
        let mut w = Writer::new(4, None);
        assert!(w.reserve(5).is_err());
    }

    #[test]
    fn pausing_is_disallowed_when_length_is_unknown() {
        let w = Writer::new(16, None);
        assert!(!w.pause_allowed());
    }
}
