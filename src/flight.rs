//! L4 flight/retransmission state machine (spec §4.4) — the heart of the
//! DTLS reliability layer. This module owns only the *state*: which flight
//! state we're in, the retransmission substate, the outgoing flight buffer,
//! and the timeout-doubling schedule. I/O consequences (actually putting
//! bytes on the wire, starting/reading the real timer) are carried out by
//! `Context`, which calls these pure transition methods and acts on their
//! return values.

use crate::config::Config;
use crate::handshake::handshake_header::HandshakeType;
use crate::retransmit::RetransmitHandle;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum State {
    Done,
    Send,
    Await,
    Receive,
    Finalize,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum RetransmitSubstate {
    None,
    Resend,
    RequestResend,
}

/// One message of our outgoing flight, kept around so it can be replayed
/// verbatim (modulo record sequence numbers) on retransmission.
pub(crate) enum OutgoingMessage {
    Handshake {
        handshake_type: HandshakeType,
        message_sequence: u16,
        handle: RetransmitHandle,
    },
    Ccs,
}

/// What the caller should do as a result of a timer expiry (spec §4.4
/// "On timer expiry").
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TimerAction {
    /// Retransmit the whole outgoing flight; timeout already doubled.
    Resend,
    /// Ask the peer to retransmit (implemented, absent per-message ACKs, by
    /// replaying our own last flight); timeout already doubled.
    RequestResend,
    /// `finalize`'s bounded retry budget is exhausted; return to `done`.
    GiveUp,
    /// Nothing to do (we're in `done` or `send`; the timer shouldn't have
    /// been running, but tolerate a stray tick).
    None,
}

pub(crate) struct FlightMachine {
    state: State,
    retransmit_substate: RetransmitSubstate,
    pub outgoing: Vec<OutgoingMessage>,
    timeout_ms: u64,
    min_timeout_ms: u64,
    max_timeout_ms: u64,
    finalize_retry_limit: usize,
    finalize_retry_count: usize,
    max_flight_length: usize,
}

impl FlightMachine {
    pub fn new(config: &Config) -> Self {
        FlightMachine {
            state: State::Done,
            retransmit_substate: RetransmitSubstate::None,
            outgoing: Vec::new(),
            timeout_ms: config.retransmit_timeout_min_ms,
            min_timeout_ms: config.retransmit_timeout_min_ms,
            max_timeout_ms: config.retransmit_timeout_max_ms,
            finalize_retry_limit: config.finalize_retransmit_limit,
            finalize_retry_count: 0,
            max_flight_length: config.max_flight_length,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn retransmit_substate(&self) -> RetransmitSubstate {
        self.retransmit_substate
    }

    pub fn current_timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// `done -> send` (first message of a new outgoing flight) or a no-op
    /// `send -> send` for subsequent messages of the same flight.
    pub fn begin_or_continue_send(&mut self) -> crate::error::Result<()> {
        match self.state {
            State::Done => {
                self.state = State::Send;
                self.outgoing.clear();
                Ok(())
            }
            State::Send => Ok(()),
            _ => Err(crate::error::Error::ErrInvalidFsmTransition),
        }
    }

    /// Spec §6 `max_flight_length` (default 5): bounds how many messages one
    /// outgoing flight may accumulate, so a misbehaving caller can't grow the
    /// retransmission buffer without limit.
    pub fn push_outgoing(&mut self, msg: OutgoingMessage) -> crate::error::Result<()> {
        if self.state != State::Send {
            return Err(crate::error::Error::ErrInvalidFsmTransition);
        }
        if self.outgoing.len() >= self.max_flight_length {
            return Err(crate::error::Error::ErrBadInput(
                "flight already holds the configured maximum number of messages",
            ));
        }
        self.outgoing.push(msg);
        Ok(())
    }

    /// `send -> await`: the flight has been dispatched and flushed.
    pub fn end_flight(&mut self) -> crate::error::Result<()> {
        if self.state != State::Send {
            return Err(crate::error::Error::ErrInvalidFsmTransition);
        }
        self.state = State::Await;
        self.reset_timeout();
        self.retransmit_substate = RetransmitSubstate::None;
        Ok(())
    }

    /// `send -> finalize`.
    pub fn end_handshake(&mut self) -> crate::error::Result<()> {
        if self.state != State::Send {
            return Err(crate::error::Error::ErrInvalidFsmTransition);
        }
        self.state = State::Finalize;
        self.finalize_retry_count = 0;
        self.reset_timeout();
        Ok(())
    }

    /// `await -> receive`: first message of the next incoming flight
    /// arrived in sequence. Progress resets the timeout to the minimum.
    pub fn on_next_flight_started(&mut self) {
        if self.state == State::Await {
            self.state = State::Receive;
            self.reset_timeout();
            self.retransmit_substate = RetransmitSubstate::None;
        }
    }

    /// `receive -> done`: the user consumed the last message of the
    /// incoming flight (spec's read-flags "ends-flight").
    pub fn on_incoming_flight_consumed(&mut self) {
        if self.state == State::Receive {
            self.state = State::Done;
            self.outgoing.clear();
            self.retransmit_substate = RetransmitSubstate::None;
        }
    }

    /// Any state -> `done`, on fatal error or orderly shutdown.
    pub fn force_done(&mut self) {
        self.state = State::Done;
        self.outgoing.clear();
        self.retransmit_substate = RetransmitSubstate::None;
    }

    /// Spec §4.4 "On timer expiry". Doubles the timeout (capped at
    /// `max_timeout_ms`) whenever a resend/request-resend is triggered.
    pub fn on_timer_expiry(&mut self) -> TimerAction {
        match self.state {
            State::Await => {
                self.double_timeout();
                self.retransmit_substate = RetransmitSubstate::Resend;
                TimerAction::Resend
            }
            State::Receive => {
                self.double_timeout();
                self.retransmit_substate = RetransmitSubstate::RequestResend;
                TimerAction::RequestResend
            }
            State::Finalize => {
                if self.finalize_retry_count >= self.finalize_retry_limit {
                    self.state = State::Done;
                    self.outgoing.clear();
                    TimerAction::GiveUp
                } else {
                    self.finalize_retry_count += 1;
                    self.double_timeout();
                    TimerAction::Resend
                }
            }
            State::Done | State::Send => TimerAction::None,
        }
    }

    fn reset_timeout(&mut self) {
        self.timeout_ms = self.min_timeout_ms;
    }

    fn double_timeout(&mut self) {
        self.timeout_ms = (self.timeout_ms * 2).min(self.max_timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn cfg() -> Config {
        let mut c = Config::new(Mode::Datagram);
        c.retransmit_timeout_min_ms = 1_000;
        c.retransmit_timeout_max_ms = 8_000;
        c
    }

    #[test]
    fn full_flight_lifecycle() {
        let mut m = FlightMachine::new(&cfg());
        assert_eq!(m.state(), State::Done);
        m.begin_or_continue_send().unwrap();
        m.push_outgoing(OutgoingMessage::Ccs).unwrap();
        assert_eq!(m.state(), State::Send);
        m.end_flight().unwrap();
        assert_eq!(m.state(), State::Await);
        m.on_next_flight_started();
        assert_eq!(m.state(), State::Receive);
        m.on_incoming_flight_consumed();
        assert_eq!(m.state(), State::Done);
    }

    #[test]
    fn timeout_doubles_geometrically_and_caps_at_max() {
        let mut m = FlightMachine::new(&cfg());
        m.begin_or_continue_send().unwrap();
        m.end_flight().unwrap();
        assert_eq!(m.current_timeout_ms(), 1_000);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.current_timeout_ms(), 2_000);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.current_timeout_ms(), 4_000);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.current_timeout_ms(), 8_000);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.current_timeout_ms(), 8_000); // capped
    }

    #[test]
    fn progress_resets_timeout_to_minimum() {
        let mut m = FlightMachine::new(&cfg());
        m.begin_or_continue_send().unwrap();
        m.end_flight().unwrap();
        m.on_timer_expiry();
        m.on_timer_expiry();
        assert_eq!(m.current_timeout_ms(), 4_000);
        m.on_next_flight_started();
        assert_eq!(m.current_timeout_ms(), 1_000);
    }

    #[test]
    fn finalize_gives_up_after_bounded_retries() {
        let mut m = FlightMachine::new(&cfg());
        m.begin_or_continue_send().unwrap();
        m.end_handshake().unwrap();
        assert_eq!(m.state(), State::Finalize);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.on_timer_expiry(), TimerAction::Resend);
        assert_eq!(m.on_timer_expiry(), TimerAction::GiveUp);
        assert_eq!(m.state(), State::Done);
    }

    #[test]
    fn pushing_outgoing_message_outside_send_state_is_rejected() {
        let mut m = FlightMachine::new(&cfg());
        assert!(m.push_outgoing(OutgoingMessage::Ccs).is_err());
    }

    #[test]
    fn flight_length_is_capped_at_the_configured_maximum() {
        let mut c = cfg();
        c.max_flight_length = 2;
        let mut m = FlightMachine::new(&c);
        m.begin_or_continue_send().unwrap();
        m.push_outgoing(OutgoingMessage::Ccs).unwrap();
        m.push_outgoing(OutgoingMessage::Ccs).unwrap();
        assert!(m.push_outgoing(OutgoingMessage::Ccs).is_err());
    }
}
