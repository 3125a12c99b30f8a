//! The top-level MPS surface (spec §6): `Context` wires L1 through L4
//! together and exposes the read/write/shutdown API the TLS state machine
//! above is expected to drive from a single flow of control (spec §5).

use std::collections::{HashMap, VecDeque};

use crate::aead::RandomSource;
use crate::alert::{Alert, AlertDescription, AlertLevel};
use crate::change_cipher_spec::ChangeCipherSpec;
use crate::config::{Config, Mode};
use crate::content::ContentType;
use crate::epoch::{EpochParams, EpochTable};
use crate::error::*;
use crate::flight::{FlightMachine, OutgoingMessage, State as FlightState, TimerAction};
use crate::handshake::handshake_header::{HandshakeHeader, HandshakeType, HANDSHAKE_HEADER_LENGTH};
use crate::message::{HandshakeFragment, InboundMessage, MessageLayer};
use crate::reassembly::{FeedOutcome, Reassembly};
use crate::reader::{PausedReader, Reader};
use crate::record_layer::RecordLayer;
use crate::retransmit::RetransmitHandle;
use crate::transport::{Dependencies, RecvOutcome, Timer, TimerState, Transport};
use crate::writer::{PausedWriter, Writer};

/// Message flags (spec §6 "Message flags"): which position a message
/// occupies in its flight, set by the user on both the read and write
/// sides.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const CONTRIBUTES_TO_FLIGHT: MessageFlags = MessageFlags(0b001);
    pub const ENDS_FLIGHT: MessageFlags = MessageFlags(0b010);
    pub const ENDS_HANDSHAKE: MessageFlags = MessageFlags(0b100);

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Open,
    /// The peer's read direction is known finished (a non-fatal
    /// `close_notify` was received): writes still proceed, but no further
    /// inbound message will ever arrive. Spec §6 `connection_state`.
    WriteOnly,
    /// Our own write direction is closed while reads remain possible.
    /// Reachable only through a caller-driven half-close that stops writing
    /// without calling [`Context::close`] (the crate exposes no separate
    /// half-close API, so this variant exists for the same read/write
    /// symmetry the spec's state set names, see DESIGN.md).
    ReadOnly,
    Closed,
    Blocked,
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub reason: String,
    pub detail: Option<crate::error::AlertDetail>,
}

/// What the user gets back from `read()` (spec §6): which accessor to call
/// next to actually retrieve the message.
#[derive(Debug)]
pub enum ReadOutcome {
    Application,
    Handshake,
    Alert,
    ChangeCipherSpec,
}

enum OutstandingRead {
    Application(Reader),
    Handshake {
        reader: Reader,
        epoch: u64,
        message_sequence: u16,
        handshake_type: HandshakeType,
        total_len: u32,
    },
}

/// Where a partially-received stream-mode handshake message's bytes
/// currently live, so a fragment arriving mid-read appends to the live
/// reader while one arriving between calls grows the buffer and, if the
/// user had paused, re-announces the message as available (spec §4.3
/// stream demux, spec §4.6 pause/resume).
#[derive(PartialEq, Eq, Debug)]
enum StreamHandshakeLocation {
    /// Sitting in `pending_inbound`, not yet claimed by `read_handshake`.
    Queued,
    /// Claimed: its bytes live in `outstanding_read`.
    Open,
    /// Claimed and then paused: its bytes live only here until re-queued.
    Paused,
}

/// Accumulates one stream-mode handshake message's bytes across however
/// many record payloads it takes to arrive (spec §4.3: stream mode has no
/// per-fragment header restated at record boundaries, unlike datagram
/// mode, so there is nothing for the reassembly submodule's slot model to
/// key off of — this is a simple append-only cursor instead).
struct StreamHandshakeBuffer {
    epoch: u64,
    handshake_type: HandshakeType,
    total_len: u32,
    bytes: Vec<u8>,
    location: StreamHandshakeLocation,
}

enum OutstandingWrite {
    Application(Writer),
    Handshake {
        writer: Writer,
        epoch: u64,
        message_sequence: u16,
        handshake_type: HandshakeType,
        retransmit_callback: Option<crate::retransmit::RetransmitFn>,
        retransmit_context: Option<Box<dyn std::any::Any + Send>>,
    },
}

/// The MPS context (spec §6): owns the epoch table, L2/L3/L4, and the
/// collaborator handles, and is the sole entry point the user's TLS/DTLS
/// state machine drives.
pub struct Context {
    config: Config,
    epochs: EpochTable,
    record_layer: RecordLayer,
    message_layer: MessageLayer,
    reassembly: Reassembly,
    flight: FlightMachine,

    transport: Option<Box<dyn Transport>>,
    timer: Option<Box<dyn Timer>>,
    random: Option<Box<dyn RandomSource>>,

    connection_state: ConnectionState,
    error_state: Option<ErrorState>,

    pending_inbound: VecDeque<InboundMessage>,
    outstanding_read: Option<OutstandingRead>,
    read_flags: MessageFlags,

    outstanding_write: Option<OutstandingWrite>,
    write_flags: MessageFlags,

    next_outgoing_message_sequence: u16,
    /// `(epoch, message_sequence)` of every handshake message consumed so
    /// far from the incoming flight currently being received; armed into
    /// the reassembly submodule's detection set once the flight ends
    /// (spec §4.4).
    current_incoming_flight: Vec<(u64, u16)>,

    paused_readers: HashMap<(u64, u16), PausedReader>,
    paused_writers: HashMap<u16, PausedWriter>,

    /// Stream-mode-only: in-progress handshake messages keyed by message
    /// sequence, growing as further record payloads arrive (spec §4.3).
    /// Always empty in `Mode::Datagram`, where the reassembly submodule
    /// owns the equivalent bookkeeping.
    stream_handshake_buffers: HashMap<u16, StreamHandshakeBuffer>,
}

impl Context {
    pub fn init(config: Config) -> Self {
        let mode = config.mode;
        let max_payload = config.max_record_payload;
        let future_buffers = config.future_message_buffers;
        Context {
            flight: FlightMachine::new(&config),
            config,
            epochs: EpochTable::new(),
            record_layer: RecordLayer::new(mode, max_payload),
            message_layer: MessageLayer::new(mode),
            reassembly: Reassembly::new(future_buffers),
            transport: None,
            timer: None,
            random: None,
            connection_state: ConnectionState::Open,
            error_state: None,
            pending_inbound: VecDeque::new(),
            outstanding_read: None,
            read_flags: MessageFlags::NONE,
            outstanding_write: None,
            write_flags: MessageFlags::NONE,
            next_outgoing_message_sequence: 0,
            current_incoming_flight: Vec::new(),
            paused_readers: HashMap::new(),
            paused_writers: HashMap::new(),
            stream_handshake_buffers: HashMap::new(),
        }
    }

    pub fn set_bio(&mut self, transport: Box<dyn Transport>, timer: Box<dyn Timer>) {
        self.transport = Some(transport);
        self.timer = Some(timer);
    }

    pub fn set_random(&mut self, random: Box<dyn RandomSource>) {
        self.random = Some(random);
    }

    pub fn register_epoch(&mut self, params: EpochParams) -> u64 {
        self.epochs.register(params)
    }

    pub fn activate_read_epoch(&mut self, epoch: u64) -> Result<()> {
        self.epochs.activate_read(epoch)?;
        log::debug!("activated read epoch {}", epoch);
        Ok(())
    }

    pub fn activate_write_epoch(&mut self, epoch: u64) -> Result<()> {
        self.epochs.activate_write(epoch)?;
        log::debug!("activated write epoch {}", epoch);
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn error_state(&self) -> Option<&ErrorState> {
        self.error_state.as_ref()
    }

    // ---- fatal error bookkeeping (spec §7) -------------------------------

    /// Records `err` as the terminal error, sending a fatal alert first
    /// unless `err` already originated from one, and forces the flight
    /// machine back to `done` so no further retransmission fires.
    fn fail(&mut self, err: Error) -> Error {
        if !err.is_fatal() {
            return err;
        }
        if self.should_alert(&err) {
            let _ = self.send_fatal_alert(alert_description_for(&err));
        }
        self.connection_state = ConnectionState::Blocked;
        self.error_state = Some(ErrorState {
            reason: err.to_string(),
            detail: alert_detail_for(&err),
        });
        self.flight.force_done();
        err
    }

    fn should_alert(&self, err: &Error) -> bool {
        !matches!(err, Error::ErrAlertSent(_) | Error::ErrAlertReceived(_))
    }

    fn check_not_blocked(&self) -> Result<()> {
        if self.connection_state == ConnectionState::Blocked {
            return Err(Error::ErrBlocked(
                self.error_state
                    .as_ref()
                    .map(|e| e.reason.clone())
                    .unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Rejects opening a write handle once our own write direction is known
    /// finished (spec §6 `connection_state` `read-only`/`closed`).
    fn check_writable(&self) -> Result<()> {
        match self.connection_state {
            ConnectionState::ReadOnly | ConnectionState::Closed => {
                Err(Error::ErrBlocked("write direction is closed".to_string()))
            }
            _ => Ok(()),
        }
    }

    // ---- sequence-number abstraction break (spec §6) ---------------------

    pub fn get_sequence_number(&self, epoch: u64) -> Result<[u8; 8]> {
        Ok(self.epochs.get(epoch)?.write_sequence.to_be_bytes())
    }

    pub fn force_sequence_number(&mut self, epoch: u64, seq: &[u8; 8]) -> Result<()> {
        self.epochs.force_write_sequence(epoch, u64::from_be_bytes(*seq))
    }

    // ---- read side ---------------------------------------------------

    pub fn read_dependencies(&self) -> Dependencies {
        let mut deps = Dependencies::NONE;
        if self.pending_inbound.is_empty() {
            deps |= Dependencies::READABLE;
        }
        if matches!(self.flight.state(), FlightState::Await | FlightState::Receive | FlightState::Finalize) {
            deps |= Dependencies::TIMER;
        }
        deps
    }

    /// Pumps one receive from the transport if nothing is already queued,
    /// demultiplexes everything it yields, and reports what kind of message
    /// is now at the front of the queue (spec §6 `read()`).
    pub fn read(&mut self) -> Result<ReadOutcome> {
        self.check_not_blocked()?;
        if let Err(e) = self.service_timer() {
            return Err(self.fail(e));
        }

        if self.outstanding_read.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }

        if self.pending_inbound.is_empty() {
            match self.pump_transport() {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => return Err(e),
                Err(e) => return Err(self.fail(e)),
            }
        }

        self.read_check().ok_or_else(Error::want_read)
    }

    pub fn read_check(&self) -> Option<ReadOutcome> {
        match self.pending_inbound.front() {
            Some(InboundMessage::Application(_)) => Some(ReadOutcome::Application),
            Some(InboundMessage::Handshake(_)) => Some(ReadOutcome::Handshake),
            Some(InboundMessage::Alert(_)) => Some(ReadOutcome::Alert),
            Some(InboundMessage::ChangeCipherSpec) => Some(ReadOutcome::ChangeCipherSpec),
            None => None,
        }
    }

    fn service_timer(&mut self) -> Result<()> {
        let expired = match &self.timer {
            Some(t) => t.get() == TimerState::Expired,
            None => false,
        };
        if !expired {
            return Ok(());
        }
        match self.flight.on_timer_expiry() {
            TimerAction::Resend | TimerAction::RequestResend => {
                self.retransmit_last_flight()?;
                self.rearm_timer();
            }
            TimerAction::GiveUp => return Err(Error::ErrRetransmitExhausted),
            TimerAction::None => {}
        }
        Ok(())
    }

    fn rearm_timer(&mut self) {
        let ms = self.flight.current_timeout_ms();
        if let Some(t) = &mut self.timer {
            t.set(ms, ms);
        }
    }

    /// Forces the next [`Context::read`]/[`Context::service_timer`] call to
    /// observe an expired timer, without waiting on a real or manual clock.
    /// Test-only: scenario tests drive retransmission without coupling
    /// themselves to a specific `Timer` implementation's clock.
    #[cfg(test)]
    pub(crate) fn force_timer_expiry(&mut self) {
        if let Some(t) = &mut self.timer {
            t.set(0, 0);
        }
    }

    /// Receives and processes one unit of L1 input (one datagram, or
    /// whatever bytes are available on a stream), feeding every record it
    /// contains through L2/L3 and, for handshake fragments, the reassembly
    /// submodule, queuing whatever becomes available for the user.
    fn pump_transport(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::ErrInternal("pump_transport with no transport set"))?;

        let mut buf = vec![0u8; 64 * 1024];
        let n = match transport.recv(&mut buf)? {
            RecvOutcome::Received(n) => n,
            RecvOutcome::WouldBlock | RecvOutcome::Timeout => return Err(Error::want_read()),
        };
        buf.truncate(n);

        match self.config.mode {
            Mode::Datagram => self.record_layer.receive_datagram(&buf, &mut self.epochs)?,
            Mode::Stream => self.record_layer.receive_stream(&buf, &mut self.epochs)?,
        }

        while let Some(header) = self.record_layer.open_read() {
            let plaintext = self.record_layer.read_payload().unwrap_or(&[]).to_vec();
            let content_type = header.content_type;
            let epoch = header.epoch as u64;
            self.record_layer.consume_read();

            let messages = self.message_layer.demux(content_type, epoch, &plaintext)?;
            for msg in messages {
                self.handle_inbound(msg)?;
            }
        }
        Ok(())
    }

    fn handle_inbound(&mut self, msg: InboundMessage) -> Result<()> {
        match msg {
            InboundMessage::Handshake(frag) => self.handle_inbound_handshake(frag)?,
            other => self.pending_inbound.push_back(other),
        }
        Ok(())
    }

    fn handle_inbound_handshake(&mut self, frag: HandshakeFragment) -> Result<()> {
        match self.config.mode {
            Mode::Datagram => self.handle_inbound_handshake_datagram(frag),
            Mode::Stream => self.handle_inbound_handshake_stream(frag),
        }
    }

    fn handle_inbound_handshake_datagram(&mut self, frag: HandshakeFragment) -> Result<()> {
        match self.reassembly.feed(frag)? {
            FeedOutcome::Accepted => {
                while let Some(ready) = self.reassembly.try_take_ready() {
                    if self.flight.state() == FlightState::Await {
                        self.flight.on_next_flight_started();
                    }
                    self.current_incoming_flight.push((ready.epoch, ready.message_sequence));
                    self.pending_inbound.push_back(InboundMessage::Handshake(HandshakeFragment {
                        epoch: ready.epoch,
                        message_sequence: ready.message_sequence,
                        handshake_type: ready.handshake_type,
                        total_len: ready.bytes.len() as u32,
                        fragment_offset: 0,
                        bytes: ready.bytes,
                    }));
                }
            }
            FeedOutcome::PeerRetransmission { trigger_resend } => {
                if trigger_resend {
                    log::debug!("peer retransmitted its flight; replaying ours");
                    self.retransmit_last_flight()?;
                    self.rearm_timer();
                }
            }
            FeedOutcome::Dropped => {
                log::trace!("dropped out-of-window or untracked duplicate handshake fragment");
            }
        }
        Ok(())
    }

    /// Stream mode has no out-of-order reassembly to do (the transport
    /// already guarantees byte order), so this just grows a per-message
    /// buffer as record payloads arrive and either appends straight onto a
    /// reader the user is already holding, or (re-)announces the message
    /// as available in `pending_inbound` (spec §4.3, §4.6 "Pausing").
    fn handle_inbound_handshake_stream(&mut self, frag: HandshakeFragment) -> Result<()> {
        let message_sequence = frag.message_sequence;
        let is_new = !self.stream_handshake_buffers.contains_key(&message_sequence);
        let buf = self
            .stream_handshake_buffers
            .entry(message_sequence)
            .or_insert_with(|| StreamHandshakeBuffer {
                epoch: frag.epoch,
                handshake_type: frag.handshake_type,
                total_len: frag.total_len,
                bytes: Vec::new(),
                location: StreamHandshakeLocation::Queued,
            });
        buf.bytes.extend_from_slice(&frag.bytes);
        let complete = buf.bytes.len() as u32 >= buf.total_len;

        match buf.location {
            StreamHandshakeLocation::Open => {
                if let Some(OutstandingRead::Handshake {
                    reader,
                    message_sequence: open_sequence,
                    ..
                }) = &mut self.outstanding_read
                {
                    if *open_sequence == message_sequence {
                        reader.append(&frag.bytes);
                        if complete {
                            reader.mark_complete();
                        }
                    }
                }
            }
            StreamHandshakeLocation::Paused => {
                buf.location = StreamHandshakeLocation::Queued;
                if self.flight.state() == FlightState::Await {
                    self.flight.on_next_flight_started();
                }
                self.pending_inbound.push_back(InboundMessage::Handshake(HandshakeFragment {
                    epoch: buf.epoch,
                    message_sequence,
                    handshake_type: buf.handshake_type,
                    total_len: buf.total_len,
                    fragment_offset: 0,
                    bytes: Vec::new(),
                }));
            }
            StreamHandshakeLocation::Queued => {
                if is_new {
                    if self.flight.state() == FlightState::Await {
                        self.flight.on_next_flight_started();
                    }
                    self.pending_inbound.push_back(InboundMessage::Handshake(HandshakeFragment {
                        epoch: buf.epoch,
                        message_sequence,
                        handshake_type: buf.handshake_type,
                        total_len: buf.total_len,
                        fragment_offset: 0,
                        bytes: Vec::new(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Opens the front-of-queue message as application data for reading
    /// (spec §6 `read_application`).
    pub fn read_application(&mut self) -> Result<&mut Reader> {
        self.check_not_blocked()?;
        if self.outstanding_read.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        match self.pending_inbound.pop_front() {
            Some(InboundMessage::Application(bytes)) => {
                self.outstanding_read = Some(OutstandingRead::Application(Reader::new(bytes)));
                match self.outstanding_read.as_mut().unwrap() {
                    OutstandingRead::Application(r) => Ok(r),
                    _ => unreachable!(),
                }
            }
            Some(other) => {
                self.pending_inbound.push_front(other);
                Err(Error::ErrBadInput("next inbound message is not application data"))
            }
            None => Err(Error::want_read()),
        }
    }

    /// Opens the front-of-queue message as a handshake message for reading,
    /// reporting its opaque type, declared total length, and a canonical
    /// 12-byte handshake header — `(type, total length, offset 0, fragment
    /// length = total length)` — as the message's additional-data bytes
    /// (spec §6 `read_handshake`). The header is reconstructed as a single
    /// whole-message header regardless of how many wire fragments the
    /// message actually arrived in, since transcript-hash computation above
    /// this layer hashes the reassembled message once, not once per
    /// fragment. Restores any saved cursor position if this
    /// `(epoch, message_sequence)` was previously paused.
    pub fn read_handshake(&mut self) -> Result<(&mut Reader, HandshakeType, u32, Vec<u8>)> {
        self.check_not_blocked()?;
        if self.outstanding_read.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        match self.pending_inbound.pop_front() {
            Some(InboundMessage::Handshake(frag)) => {
                let epoch = frag.epoch;
                let message_sequence = frag.message_sequence;
                let handshake_type = frag.handshake_type;

                let (total_len, mut reader) = match self.config.mode {
                    Mode::Datagram => (frag.total_len, Reader::new(frag.bytes)),
                    Mode::Stream => {
                        let buf = self
                            .stream_handshake_buffers
                            .get_mut(&message_sequence)
                            .ok_or(Error::ErrInternal("stream handshake buffer missing for a queued message"))?;
                        buf.location = StreamHandshakeLocation::Open;
                        let complete = buf.bytes.len() as u32 >= buf.total_len;
                        let mut r = Reader::new_partial(buf.bytes.clone());
                        if complete {
                            r.mark_complete();
                        }
                        (buf.total_len, r)
                    }
                };
                if let Some(paused) = self.paused_readers.remove(&(epoch, message_sequence)) {
                    reader.restore(paused);
                }
                self.outstanding_read = Some(OutstandingRead::Handshake {
                    reader,
                    epoch,
                    message_sequence,
                    handshake_type,
                    total_len,
                });
                let header = HandshakeHeader {
                    handshake_type,
                    length: total_len,
                    message_sequence,
                    fragment_offset: 0,
                    fragment_length: total_len,
                };
                let mut additional_data = Vec::with_capacity(header.size());
                header.marshal(&mut additional_data)?;
                match self.outstanding_read.as_mut().unwrap() {
                    OutstandingRead::Handshake { reader, handshake_type, total_len, .. } => {
                        Ok((reader, *handshake_type, *total_len, additional_data))
                    }
                    _ => unreachable!(),
                }
            }
            Some(other) => {
                self.pending_inbound.push_front(other);
                Err(Error::ErrBadInput("next inbound message is not a handshake message"))
            }
            None => Err(Error::want_read()),
        }
    }

    /// Pops and returns the front-of-queue alert without opening a reader
    /// handle (alerts are always exactly two bytes, spec §3): a fatal alert
    /// is surfaced as a terminal error, per spec §7. A non-fatal
    /// `close_notify` marks the peer's read direction as finished — the
    /// connection becomes `write-only` (spec §6 `connection_state`) rather
    /// than terminating outright, since we may still have our own flight to
    /// finish sending.
    pub fn read_alert(&mut self) -> Result<Alert> {
        self.check_not_blocked()?;
        match self.pending_inbound.pop_front() {
            Some(InboundMessage::Alert(a)) => {
                if a.alert_level == AlertLevel::Fatal {
                    let detail: crate::error::AlertDetail = a.into();
                    return Err(self.fail(Error::ErrAlertReceived(detail)));
                }
                if a.alert_description == AlertDescription::CloseNotify {
                    self.connection_state = match self.connection_state {
                        ConnectionState::Open => ConnectionState::WriteOnly,
                        ConnectionState::ReadOnly => ConnectionState::Closed,
                        other => other,
                    };
                }
                Ok(a)
            }
            Some(other) => {
                self.pending_inbound.push_front(other);
                Err(Error::ErrBadInput("next inbound message is not an alert"))
            }
            None => Err(Error::want_read()),
        }
    }

    /// Pops the front-of-queue `ChangeCipherSpec` marker (spec §6
    /// `read_change_cipher_spec`).
    pub fn read_change_cipher_spec(&mut self) -> Result<()> {
        self.check_not_blocked()?;
        match self.pending_inbound.pop_front() {
            Some(InboundMessage::ChangeCipherSpec) => Ok(()),
            Some(other) => {
                self.pending_inbound.push_front(other);
                Err(Error::ErrBadInput("next inbound message is not a change_cipher_spec"))
            }
            None => Err(Error::want_read()),
        }
    }

    pub fn read_set_flags(&mut self, flags: MessageFlags) {
        self.read_flags = flags;
    }

    /// Suspends the outstanding handshake reader and hands back control
    /// without consuming the message (spec §4.6 "Pausing"); only a
    /// handshake reader may be paused, since application data/alerts have
    /// no multi-call lifetime to suspend.
    pub fn read_pause(&mut self) -> Result<()> {
        match self.outstanding_read.take() {
            Some(OutstandingRead::Handshake {
                reader,
                epoch,
                message_sequence,
                ..
            }) => {
                self.paused_readers.insert((epoch, message_sequence), reader.pause_state());
                if let Some(buf) = self.stream_handshake_buffers.get_mut(&message_sequence) {
                    buf.location = StreamHandshakeLocation::Paused;
                }
                Ok(())
            }
            Some(other) => {
                self.outstanding_read = Some(other);
                Err(Error::ErrBadInput("only a handshake reader may be paused"))
            }
            None => Err(Error::ErrBadInput("no outstanding reader to pause")),
        }
    }

    /// Releases the outstanding reader handle; if the read-side flags
    /// marked the just-consumed message as ending the incoming flight, this
    /// also drives the flight state machine `receive -> done` transition
    /// and arms retransmission detection for the flight just finished.
    pub fn read_consume(&mut self) -> Result<()> {
        let outstanding = self
            .outstanding_read
            .take()
            .ok_or(Error::ErrBadInput("no outstanding reader to consume"))?;

        if let OutstandingRead::Handshake { epoch, message_sequence, .. } = &outstanding {
            self.paused_readers.remove(&(*epoch, *message_sequence));
            self.stream_handshake_buffers.remove(message_sequence);
        }

        if self.read_flags.contains(MessageFlags::ENDS_FLIGHT) {
            self.reassembly.arm_detection(std::mem::take(&mut self.current_incoming_flight));
            self.flight.on_incoming_flight_consumed();
        }
        self.read_flags = MessageFlags::NONE;
        Ok(())
    }

    // ---- write side ----------------------------------------------------

    pub fn write_dependencies(&self) -> Dependencies {
        Dependencies::WRITABLE
    }

    pub fn write_application(&mut self) -> Result<&mut Writer> {
        self.check_not_blocked()?;
        self.check_writable()?;
        if self.outstanding_write.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        let epoch = self.epochs.active_write();
        self.record_layer.open_write(ContentType::ApplicationData, epoch, &mut self.epochs)?;
        let cap = self.record_layer.remaining_capacity();
        self.outstanding_write = Some(OutstandingWrite::Application(Writer::new(cap, None)));
        match self.outstanding_write.as_mut().unwrap() {
            OutstandingWrite::Application(w) => Ok(w),
            _ => unreachable!(),
        }
    }

    /// Opens a handshake message for writing (spec §6, §4.4 "write-side
    /// fragmentation"). `length` is `None` for an undeclared length (such a
    /// message cannot later be paused, spec §4.6). `retransmit` carries an
    /// optional deterministic regeneration callback plus its owned context
    /// (spec §3 "Retransmission handle"); when absent, the committed bytes
    /// are kept verbatim for replay.
    pub fn write_handshake(
        &mut self,
        handshake_type: HandshakeType,
        length: Option<u32>,
        retransmit: Option<(crate::retransmit::RetransmitFn, Box<dyn std::any::Any + Send>)>,
    ) -> Result<&mut Writer> {
        self.check_not_blocked()?;
        self.check_writable()?;
        if self.outstanding_write.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        self.flight.begin_or_continue_send()?;

        let epoch = self.epochs.active_write();
        let message_sequence = self.next_outgoing_message_sequence;
        self.next_outgoing_message_sequence = self.next_outgoing_message_sequence.wrapping_add(1);

        self.record_layer.open_write(ContentType::Handshake, epoch, &mut self.epochs)?;
        // A declared length sizes the scratch buffer to the whole message:
        // fragmentation across records happens at `dispatch`/`emit_handshake_fragment`
        // time, not while the caller is still filling the writer. Without a
        // declared length there is nothing to fragment (spec §4.4), so the
        // writer is bounded to what the current record can hold.
        let cap = match length {
            Some(len) => len as usize,
            None => handshake_write_capacity(self.record_layer.remaining_capacity()),
        };
        let writer = match self.paused_writers.remove(&message_sequence) {
            Some(paused) => {
                let mut w = Writer::new(cap, length);
                w.restore(paused);
                w
            }
            None => Writer::new(cap, length),
        };

        let (retransmit_callback, retransmit_context) = match retransmit {
            Some((f, ctx)) => (Some(f), Some(ctx)),
            None => (None, None),
        };

        self.outstanding_write = Some(OutstandingWrite::Handshake {
            writer,
            epoch,
            message_sequence,
            handshake_type,
            retransmit_callback,
            retransmit_context,
        });
        match self.outstanding_write.as_mut().unwrap() {
            OutstandingWrite::Handshake { writer, .. } => Ok(writer),
            _ => unreachable!(),
        }
    }

    pub fn write_alert(&mut self, alert: Alert) -> Result<()> {
        self.check_not_blocked()?;
        self.check_writable()?;
        if self.outstanding_write.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        let epoch = self.epochs.active_write();
        self.record_layer.open_write(ContentType::Alert, epoch, &mut self.epochs)?;
        let mut bytes = vec![];
        alert.marshal(&mut bytes)?;
        self.record_layer.write_payload(&bytes)?;
        self.record_layer.dispatch_write(&mut self.epochs)?;
        self.flush()
    }

    pub fn write_ccs(&mut self) -> Result<()> {
        self.check_not_blocked()?;
        self.check_writable()?;
        if self.outstanding_write.is_some() {
            return Err(Error::ErrHandleOutstanding);
        }
        self.flight.begin_or_continue_send()?;
        let epoch = self.epochs.active_write();
        self.record_layer.open_write(ContentType::ChangeCipherSpec, epoch, &mut self.epochs)?;
        let mut bytes = vec![];
        ChangeCipherSpec.marshal(&mut bytes)?;
        self.record_layer.write_payload(&bytes)?;
        self.record_layer.dispatch_write(&mut self.epochs)?;
        self.flight.push_outgoing(OutgoingMessage::Ccs)?;
        Ok(())
    }

    pub fn write_set_flags(&mut self, flags: MessageFlags) {
        self.write_flags = flags;
    }

    /// Suspends the outstanding handshake writer (spec §4.6); only allowed
    /// when the message declared its total length up front, since an
    /// undeclared-length message has nothing to resume against.
    pub fn write_pause(&mut self) -> Result<()> {
        match &self.outstanding_write {
            Some(OutstandingWrite::Handshake { writer, .. }) => {
                if !writer.pause_allowed() {
                    return Err(Error::ErrLengthUnknown);
                }
                if let Some(OutstandingWrite::Handshake { writer, message_sequence, .. }) = self.outstanding_write.take() {
                    self.paused_writers.insert(message_sequence, writer.pause_state());
                }
                Ok(())
            }
            Some(_) => Err(Error::ErrBadInput("only a handshake writer may be paused")),
            None => Err(Error::ErrBadInput("no outstanding writer to pause")),
        }
    }

    /// Flushes the currently open record for the outstanding write handle.
    /// For a handshake message whose committed bytes exceed one record's
    /// capacity, this opens successive fragments (spec §4.4) carrying the
    /// same `(sequence, type, total length)` and advancing `(offset,
    /// fragment length)`.
    pub fn dispatch(&mut self) -> Result<()> {
        self.check_not_blocked()?;
        let outstanding = self
            .outstanding_write
            .take()
            .ok_or(Error::ErrBadInput("no outstanding writer to dispatch"))?;

        match outstanding {
            OutstandingWrite::Application(mut writer) => {
                let bytes = writer.take_committed();
                self.record_layer.write_payload(&bytes)?;
                self.record_layer.dispatch_write(&mut self.epochs)?;
            }
            OutstandingWrite::Handshake {
                mut writer,
                epoch,
                message_sequence,
                handshake_type,
                retransmit_callback,
                retransmit_context,
            } => {
                let body = writer.take_committed();
                let total_len = writer.declared_len().unwrap_or(body.len() as u32);

                self.emit_handshake_fragment(epoch, handshake_type, message_sequence, total_len, 0, &body)?;

                let handle = match retransmit_callback {
                    Some(generate) => RetransmitHandle::Callback {
                        generate,
                        context: retransmit_context
                            .ok_or(Error::ErrInternal("retransmit callback missing its context"))?,
                    },
                    None => RetransmitHandle::Raw(body),
                };
                self.flight.push_outgoing(OutgoingMessage::Handshake {
                    handshake_type,
                    message_sequence,
                    handle,
                })?;
                self.paused_writers.remove(&message_sequence);
            }
        }

        if self.write_flags.contains(MessageFlags::ENDS_HANDSHAKE) {
            self.record_layer.dispatch_write(&mut self.epochs)?;
            self.flush()?;
            self.flight.end_handshake()?;
            self.rearm_timer();
        } else if self.write_flags.contains(MessageFlags::ENDS_FLIGHT) {
            self.record_layer.dispatch_write(&mut self.epochs)?;
            self.flush()?;
            self.flight.end_flight()?;
            self.rearm_timer();
        }
        self.write_flags = MessageFlags::NONE;
        Ok(())
    }

    /// Splits `body` into as many records as the current L2 capacity
    /// demands (spec §4.4 "write-side fragmentation"). In `Mode::Datagram`
    /// every record restates the 12-byte handshake header, matching
    /// `MessageLayer::demux_datagram_handshake`; in `Mode::Stream` the
    /// 4-byte stream header (type, 24-bit length) is written once at the
    /// start of the message and the remaining records carry raw body bytes
    /// only, matching `MessageLayer::demux_stream_handshake`.
    fn emit_handshake_fragment(
        &mut self,
        epoch: u64,
        handshake_type: HandshakeType,
        message_sequence: u16,
        total_len: u32,
        offset: u32,
        body: &[u8],
    ) -> Result<()> {
        match self.config.mode {
            Mode::Datagram => self.emit_handshake_fragment_datagram(epoch, handshake_type, message_sequence, total_len, offset, body),
            Mode::Stream => self.emit_handshake_fragment_stream(epoch, handshake_type, total_len, offset, body),
        }
    }

    fn emit_handshake_fragment_datagram(
        &mut self,
        epoch: u64,
        handshake_type: HandshakeType,
        message_sequence: u16,
        total_len: u32,
        offset: u32,
        body: &[u8],
    ) -> Result<()> {
        let mut remaining = body;
        let mut offset = offset;
        loop {
            self.record_layer.open_write(ContentType::Handshake, epoch, &mut self.epochs)?;
            let cap = handshake_write_capacity(self.record_layer.remaining_capacity()).max(1);
            let take = remaining.len().min(cap);
            let header = HandshakeHeader {
                handshake_type,
                length: total_len,
                message_sequence,
                fragment_offset: offset,
                fragment_length: take as u32,
            };
            let mut wire = Vec::with_capacity(HANDSHAKE_HEADER_LENGTH + take);
            header.marshal(&mut wire)?;
            wire.extend_from_slice(&remaining[..take]);
            self.record_layer.write_payload(&wire)?;
            self.record_layer.dispatch_write(&mut self.epochs)?;

            remaining = &remaining[take..];
            offset += take as u32;
            if remaining.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// `offset == 0` is always the start of a fresh message on the write
    /// side (the stream has no resumable mid-message retransmit slot the
    /// way datagram mode does), so the 4-byte stream header is only ever
    /// written on the first record of the loop.
    fn emit_handshake_fragment_stream(
        &mut self,
        epoch: u64,
        handshake_type: HandshakeType,
        total_len: u32,
        offset: u32,
        body: &[u8],
    ) -> Result<()> {
        const STREAM_HEADER_LEN: usize = 4;
        let mut remaining = body;
        let mut first = offset == 0;
        loop {
            self.record_layer.open_write(ContentType::Handshake, epoch, &mut self.epochs)?;
            let header_len = if first { STREAM_HEADER_LEN } else { 0 };
            let cap = self.record_layer.remaining_capacity().saturating_sub(header_len).max(1);
            let take = remaining.len().min(cap);
            let mut wire = Vec::with_capacity(header_len + take);
            if first {
                let len_bytes = total_len.to_be_bytes();
                wire.push(handshake_type.0);
                wire.extend_from_slice(&len_bytes[1..]);
            }
            wire.extend_from_slice(&remaining[..take]);
            self.record_layer.write_payload(&wire)?;
            self.record_layer.dispatch_write(&mut self.epochs)?;

            remaining = &remaining[take..];
            first = false;
            if remaining.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Replays every message of the outgoing flight verbatim (modulo record
    /// sequence numbers, which always advance): spec §8 scenario 3.
    fn retransmit_last_flight(&mut self) -> Result<()> {
        let epoch = self.epochs.active_write();
        let items: Vec<(bool, HandshakeType, u16, Option<Vec<u8>>)> = self
            .flight
            .outgoing
            .iter()
            .map(|m| match m {
                OutgoingMessage::Handshake {
                    handshake_type,
                    message_sequence,
                    handle,
                } => (false, *handshake_type, *message_sequence, handle.body()),
                OutgoingMessage::Ccs => (true, HandshakeType(0), 0, None),
            })
            .collect();

        for (is_ccs, handshake_type, message_sequence, body) in items {
            if is_ccs {
                self.record_layer.open_write(ContentType::ChangeCipherSpec, epoch, &mut self.epochs)?;
                let mut bytes = vec![];
                ChangeCipherSpec.marshal(&mut bytes)?;
                self.record_layer.write_payload(&bytes)?;
                self.record_layer.dispatch_write(&mut self.epochs)?;
            } else if let Some(body) = body {
                let total_len = body.len() as u32;
                self.emit_handshake_fragment(epoch, handshake_type, message_sequence, total_len, 0, &body)?;
            }
        }
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::ErrInternal("flush with no transport set"))?;
        self.record_layer.flush(transport.as_mut())
    }

    // ---- shutdown (spec §6, §7) -----------------------------------------

    pub fn send_fatal_alert(&mut self, description: AlertDescription) -> Result<()> {
        let epoch = self.epochs.active_write();
        let alert = Alert {
            alert_level: AlertLevel::Fatal,
            alert_description: description,
        };
        self.record_layer.open_write(ContentType::Alert, epoch, &mut self.epochs)?;
        let mut bytes = vec![];
        alert.marshal(&mut bytes)?;
        self.record_layer.write_payload(&bytes)?;
        self.record_layer.dispatch_write(&mut self.epochs)?;
        self.flush()?;

        let detail = crate::error::AlertDetail {
            level: AlertLevel::Fatal as u8,
            description: description as u8,
        };
        self.connection_state = ConnectionState::Blocked;
        self.error_state = Some(ErrorState {
            reason: format!("fatal alert sent: {}", description),
            detail: Some(detail),
        });
        self.flight.force_done();
        Ok(())
    }

    /// Sends a warning-level `close_notify`: the orderly-shutdown alert
    /// (spec §7 distinguishes it from the fatal alerts `send_fatal_alert`
    /// sends). Does not touch `connection_state`/`error_state` — unlike a
    /// fatal alert, a `close_notify` we send is not itself a terminal error
    /// on our side.
    fn send_close_notify(&mut self) -> Result<()> {
        let epoch = self.epochs.active_write();
        let alert = Alert {
            alert_level: AlertLevel::Warning,
            alert_description: AlertDescription::CloseNotify,
        };
        self.record_layer.open_write(ContentType::Alert, epoch, &mut self.epochs)?;
        let mut bytes = vec![];
        alert.marshal(&mut bytes)?;
        self.record_layer.write_payload(&bytes)?;
        self.record_layer.dispatch_write(&mut self.epochs)?;
        self.flush()
    }

    /// Orderly shutdown (spec §6 `close()`); idempotent (spec §8). Sends a
    /// warning-level `close_notify`, not a fatal alert, so the peer takes
    /// the non-fatal `read_alert` path (`connection_state` -> `WriteOnly`)
    /// rather than being told the connection failed.
    pub fn close(&mut self) -> Result<()> {
        if self.connection_state == ConnectionState::Closed {
            return Ok(());
        }
        if self.connection_state != ConnectionState::Blocked {
            let _ = self.send_close_notify();
        }
        self.connection_state = ConnectionState::Closed;
        self.flight.force_done();
        Ok(())
    }
}

/// Handshake fragments reserve `HANDSHAKE_HEADER_LENGTH` bytes of whatever
/// the record layer has left.
fn handshake_write_capacity(record_capacity: usize) -> usize {
    record_capacity.saturating_sub(HANDSHAKE_HEADER_LENGTH)
}

fn alert_description_for(err: &Error) -> AlertDescription {
    match err {
        Error::ErrInvalidRecord => AlertDescription::BadRecordMac,
        Error::ErrInvalidPadding => AlertDescription::DecodeError,
        Error::ErrInvalidCipherSpec | Error::ErrInvalidAlert => AlertDescription::DecodeError,
        Error::ErrFragmentOverflow { .. }
        | Error::ErrFragmentLengthMismatch { .. }
        | Error::ErrFragmentByteMismatch { .. } => AlertDescription::DecodeError,
        Error::ErrBadInput(_) => AlertDescription::IllegalParameter,
        Error::ErrRetransmitExhausted => AlertDescription::HandshakeFailure,
        _ => AlertDescription::InternalError,
    }
}

fn alert_detail_for(err: &Error) -> Option<crate::error::AlertDetail> {
    match err {
        Error::ErrAlertSent(d) | Error::ErrAlertReceived(d) => Some(*d),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::test_support::TestAesGcm;
    use crate::transport::test_support::{LossyPipe, ManualTimer};

    fn epoch_params(key: u8) -> EpochParams {
        EpochParams {
            read_aead: Box::new(TestAesGcm::new(&[key; 16])),
            write_aead: Box::new(TestAesGcm::new(&[key; 16])),
            read_salt: [0; 4],
            write_salt: [0; 4],
        }
    }

    /// Builds a connected pair of contexts sharing one symmetric epoch-0
    /// key, the simplest collaborator wiring a scenario test needs.
    fn connected_pair() -> (Context, Context) {
        let (pipe_a, pipe_b) = LossyPipe::pair();
        let mut a = Context::init(Config::new(Mode::Datagram));
        let mut b = Context::init(Config::new(Mode::Datagram));
        a.set_bio(Box::new(pipe_a), Box::new(ManualTimer::new()));
        b.set_bio(Box::new(pipe_b), Box::new(ManualTimer::new()));

        let ea = a.register_epoch(epoch_params(5));
        a.activate_read_epoch(ea).unwrap();
        a.activate_write_epoch(ea).unwrap();
        let eb = b.register_epoch(epoch_params(5));
        b.activate_read_epoch(eb).unwrap();
        b.activate_write_epoch(eb).unwrap();

        (a, b)
    }

    #[test]
    fn application_data_round_trips_between_two_contexts() {
        let (mut a, mut b) = connected_pair();

        let w = a.write_application().unwrap();
        if let crate::writer::ReserveOutcome::Ready(buf) = w.reserve(5).unwrap() {
            buf.copy_from_slice(b"hello");
        } else {
            panic!("expected capacity for 5 bytes");
        }
        w.commit(5).unwrap();
        a.dispatch().unwrap();
        a.flush().unwrap();

        assert!(matches!(b.read().unwrap(), ReadOutcome::Application));
        let r = b.read_application().unwrap();
        assert!(matches!(r.peek(5), crate::reader::PeekOutcome::Bytes(bytes) if bytes == b"hello"));
        b.read_consume().unwrap();
    }

    #[test]
    fn single_fragment_handshake_message_round_trips() {
        let (mut a, mut b) = connected_pair();

        let w = a.write_handshake(HandshakeType(1), Some(11), None).unwrap();
        if let crate::writer::ReserveOutcome::Ready(buf) = w.reserve(11).unwrap() {
            buf.copy_from_slice(b"hello world");
        } else {
            panic!("expected capacity for 11 bytes");
        }
        w.commit(11).unwrap();
        a.write_set_flags(MessageFlags::ENDS_FLIGHT);
        a.dispatch().unwrap();

        assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
        let (r, htype, total_len, additional_data) = b.read_handshake().unwrap();
        assert_eq!(htype, HandshakeType(1));
        assert_eq!(total_len, 11);
        assert_eq!(additional_data.len(), crate::handshake::handshake_header::HANDSHAKE_HEADER_LENGTH);
        assert!(matches!(r.peek(11), crate::reader::PeekOutcome::Bytes(bytes) if bytes == b"hello world"));
        b.read_set_flags(MessageFlags::ENDS_FLIGHT);
        b.read_consume().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let (mut a, _b) = connected_pair();
        a.close().unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Closed);
        a.close().unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn non_fatal_close_notify_makes_the_connection_write_only() {
        let (mut a, mut b) = connected_pair();
        a.write_alert(Alert {
            alert_level: AlertLevel::Warning,
            alert_description: AlertDescription::CloseNotify,
        })
        .unwrap();
        a.flush().unwrap();

        assert!(matches!(b.read().unwrap(), ReadOutcome::Alert));
        let alert = b.read_alert().unwrap();
        assert_eq!(alert.alert_description, AlertDescription::CloseNotify);
        assert_eq!(b.connection_state(), ConnectionState::WriteOnly);

        // still allowed to write after the peer's read direction is done
        assert!(b.write_application().is_ok());
    }

    #[test]
    fn second_outstanding_write_is_rejected_while_one_is_open() {
        let (mut a, _b) = connected_pair();
        let _w = a.write_application().unwrap();
        assert!(a.write_application().is_err());
    }
}
