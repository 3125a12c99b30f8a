//! Crate-wide configuration (spec §6 `init(config)`). Not file-backed —
//! config-file parsing remains a non-goal (spec §1); callers build this
//! struct programmatically, the way `dtls::config::Config` is built by its
//! caller.

/// Whether the byte stream underneath is datagram- or stream-oriented. Per
/// spec §9 design notes, this is a runtime field rather than a Cargo
/// feature/conditional compilation switch, since a single process may need
/// both (e.g. a library embedding both TLS and DTLS support).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    Stream,
    Datagram,
}

/// Default maximum record payload in bytes before the write path opens a
/// new fragment/record (spec §3.1 Supplemented: wire constants — matches
/// RFC 6347 guidance and the teacher's MTU-adjacent defaults).
pub const DEFAULT_MTU: usize = 1200;

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    /// Minimum/initial retransmission timeout.
    pub retransmit_timeout_min_ms: u64,
    /// Cap the doubling retransmission timeout backs off to.
    pub retransmit_timeout_max_ms: u64,
    /// Maximum number of handshake messages (+ optional CCS) the flight
    /// layer will accumulate as "our outgoing flight" before requiring the
    /// user to end it (defends against unbounded retransmission buffers).
    pub max_flight_length: usize,
    /// `K` in spec §4.5: number of reassembly slots reserved for messages
    /// that arrive ahead of the next-expected sequence number.
    pub future_message_buffers: usize,
    /// Maximum plaintext bytes packed into one outgoing record before L2
    /// opens a new one.
    pub max_record_payload: usize,
    /// Bounded number of `finalize`-state timer expiries with no new
    /// incoming message before the flight layer gives up and returns to
    /// `done` (spec §9 Open Question 2 — exposed as a knob rather than
    /// hardwired; see DESIGN.md).
    pub finalize_retransmit_limit: usize,
}

impl Config {
    pub fn new(mode: Mode) -> Self {
        Config {
            mode,
            retransmit_timeout_min_ms: 1_000,
            retransmit_timeout_max_ms: 60_000,
            max_flight_length: 5,
            future_message_buffers: 4,
            max_record_payload: DEFAULT_MTU,
            finalize_retransmit_limit: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::new(Mode::Datagram);
        assert_eq!(c.max_flight_length, 5);
        assert_eq!(c.future_message_buffers, 4);
    }
}
