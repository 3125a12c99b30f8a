//! L1: the thin transport shim (spec §4.1). The MPS never blocks on I/O
//! itself; every layer above calls through [`Transport`] and propagates
//! `want-read`/`want-write` when the collaborator isn't ready yet.

use std::fmt;

/// Bitmask of external conditions that would let a `would-block` call make
/// progress if retried (spec §6 "Dependencies bitmask").
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Dependencies(u8);

impl Dependencies {
    pub const NONE: Dependencies = Dependencies(0);
    pub const READABLE: Dependencies = Dependencies(0b001);
    pub const WRITABLE: Dependencies = Dependencies(0b010);
    pub const TIMER: Dependencies = Dependencies(0b100);

    pub fn contains(self, other: Dependencies) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Dependencies {
    type Output = Dependencies;
    fn bitor(self, rhs: Dependencies) -> Dependencies {
        Dependencies(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Dependencies {
    fn bitor_assign(&mut self, rhs: Dependencies) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![];
        if self.contains(Dependencies::READABLE) {
            parts.push("readable");
        }
        if self.contains(Dependencies::WRITABLE) {
            parts.push("writable");
        }
        if self.contains(Dependencies::TIMER) {
            parts.push("timer");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// Outcome of a non-blocking send.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SendOutcome {
    Written(usize),
    WouldBlock,
}

/// Outcome of a non-blocking receive.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RecvOutcome {
    Received(usize),
    WouldBlock,
    Timeout,
}

/// L1 collaborator contract (spec §4.1). For datagram transports each
/// `send`/`recv` call is exactly one datagram; for stream transports it is
/// an arbitrary chunk of the byte stream.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> std::io::Result<SendOutcome>;
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<RecvOutcome>;
    fn recv_with_timeout(&mut self, buf: &mut [u8], timeout_ms: u64) -> std::io::Result<RecvOutcome>;
}

/// What [`Timer::get`] reports relative to the two deadlines set by
/// [`Timer::set`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TimerState {
    Cancelled,
    PreIntermediate,
    PostIntermediate,
    Expired,
}

/// L1 monotonic timer collaborator (spec §4.1). `intermediate_ms` marks the
/// current retransmission deadline; `final_ms` is an outer bound some
/// callers use as a hard stop (the flight layer uses only `intermediate_ms`,
/// always setting `final_ms` equal to it, since its own doubling/backoff
/// logic owns the outer bound).
pub trait Timer {
    fn set(&mut self, intermediate_ms: u64, final_ms: u64);
    fn cancel(&mut self);
    fn get(&self) -> TimerState;
}

/// In-process transport and timer doubles used by this crate's own tests
/// and by integration tests under `tests/`. Not gated behind `cfg(test)`
/// since external test binaries link the library without it.
pub mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    /// An in-process, lossy, reordering datagram pipe: two endpoints sharing
    /// two queues. Stands in for the teacher's UDP `Conn` double for
    /// deterministic tests (spec §8 end-to-end scenarios).
    #[derive(Clone)]
    pub struct LossyPipe {
        inbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
        outbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
        pub drop_next_n_sends: usize,
    }

    impl LossyPipe {
        /// Builds a connected pair: `a`'s sends land in `b`'s recv queue and
        /// vice versa.
        pub fn pair() -> (LossyPipe, LossyPipe) {
            let q1 = Rc::new(RefCell::new(VecDeque::new()));
            let q2 = Rc::new(RefCell::new(VecDeque::new()));
            (
                LossyPipe {
                    inbox: q1.clone(),
                    outbox: q2.clone(),
                    drop_next_n_sends: 0,
                },
                LossyPipe {
                    inbox: q2,
                    outbox: q1,
                    drop_next_n_sends: 0,
                },
            )
        }

        pub fn reorder_last_two_pending(&self) {
            let mut q = self.inbox.borrow_mut();
            let len = q.len();
            if len >= 2 {
                q.swap(len - 1, len - 2);
            }
        }

        /// Splits the oldest pending item into its constituent on-wire
        /// records — parsed by each record's own 13-byte header and declared
        /// content length — and re-queues them as separate units. Stands in
        /// for a stream transport delivering one TCP segment per record
        /// rather than one coalesced write, so a peer pumping a receive at a
        /// time sees a handshake message split across records arrive one
        /// record at a time instead of all at once.
        pub fn split_next_pending_into_records(&self) {
            use crate::record_layer::record_layer_header::RECORD_LAYER_HEADER_SIZE;

            let mut q = self.inbox.borrow_mut();
            let whole = match q.pop_front() {
                Some(w) => w,
                None => return,
            };
            let mut rest = &whole[..];
            let mut records = Vec::new();
            while rest.len() >= RECORD_LAYER_HEADER_SIZE {
                let content_len = u16::from_be_bytes([rest[11], rest[12]]) as usize;
                let total = RECORD_LAYER_HEADER_SIZE + content_len;
                if rest.len() < total {
                    break;
                }
                records.push(rest[..total].to_vec());
                rest = &rest[total..];
            }
            for record in records.into_iter().rev() {
                q.push_front(record);
            }
        }
    }

    impl Transport for LossyPipe {
        fn send(&mut self, bytes: &[u8]) -> std::io::Result<SendOutcome> {
            if self.drop_next_n_sends > 0 {
                self.drop_next_n_sends -= 1;
                return Ok(SendOutcome::Written(bytes.len()));
            }
            self.outbox.borrow_mut().push_back(bytes.to_vec());
            Ok(SendOutcome::Written(bytes.len()))
        }

        fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<RecvOutcome> {
            match self.inbox.borrow_mut().pop_front() {
                Some(dgram) => {
                    let n = dgram.len().min(buf.len());
                    buf[..n].copy_from_slice(&dgram[..n]);
                    Ok(RecvOutcome::Received(n))
                }
                None => Ok(RecvOutcome::WouldBlock),
            }
        }

        fn recv_with_timeout(
            &mut self,
            buf: &mut [u8],
            _timeout_ms: u64,
        ) -> std::io::Result<RecvOutcome> {
            match self.recv(buf)? {
                RecvOutcome::Received(n) => Ok(RecvOutcome::Received(n)),
                _ => Ok(RecvOutcome::Timeout),
            }
        }
    }

    /// A manually-advanced timer driven by test code calling [`ManualTimer::advance`]
    /// instead of a real clock, so timeout-doubling tests are deterministic.
    pub struct ManualTimer {
        now: Instant,
        deadline: Option<(Instant, Instant)>,
    }

    impl ManualTimer {
        pub fn new() -> Self {
            ManualTimer {
                now: Instant::now(),
                deadline: None,
            }
        }

        pub fn advance(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
        }
    }

    impl Default for ManualTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Timer for ManualTimer {
        fn set(&mut self, intermediate_ms: u64, final_ms: u64) {
            self.deadline = Some((
                self.now + Duration::from_millis(intermediate_ms),
                self.now + Duration::from_millis(final_ms),
            ));
        }

        fn cancel(&mut self) {
            self.deadline = None;
        }

        fn get(&self) -> TimerState {
            match self.deadline {
                None => TimerState::Cancelled,
                Some((intermediate, final_deadline)) => {
                    if self.now >= final_deadline {
                        TimerState::Expired
                    } else if self.now >= intermediate {
                        TimerState::PostIntermediate
                    } else {
                        TimerState::PreIntermediate
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn lossy_pipe_delivers_in_order() {
        let (mut a, mut b) = LossyPipe::pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), RecvOutcome::Received(3));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.recv(&mut buf).unwrap(), RecvOutcome::Received(3));
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn manual_timer_reports_expiry_states() {
        let mut t = ManualTimer::new();
        t.set(100, 100);
        assert_eq!(t.get(), TimerState::PreIntermediate);
        t.advance(100);
        assert_eq!(t.get(), TimerState::Expired);
    }

    #[test]
    fn dependencies_display_lists_set_bits() {
        let d = Dependencies::READABLE | Dependencies::TIMER;
        assert_eq!(d.to_string(), "readable|timer");
    }
}
