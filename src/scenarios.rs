//! End-to-end scenario tests driving the public `Context` API over the
//! in-process transport doubles, exercising spec §8's named scenarios
//! against the full L1-L4 pipeline rather than any one layer in isolation.

#![cfg(test)]

use crate::aead::test_support::TestAesGcm;
use crate::config::{Config, Mode};
use crate::context::{Context, MessageFlags, ReadOutcome};
use crate::epoch::EpochParams;
use crate::handshake::handshake_header::HandshakeType;
use crate::reader::PeekOutcome;
use crate::transport::test_support::{LossyPipe, ManualTimer};
use crate::writer::ReserveOutcome;

fn epoch_params(key: u8) -> EpochParams {
    EpochParams {
        read_aead: Box::new(TestAesGcm::new(&[key; 16])),
        write_aead: Box::new(TestAesGcm::new(&[key; 16])),
        read_salt: [0; 4],
        write_salt: [0; 4],
    }
}

fn wire_up(config_a: Config, config_b: Config) -> (Context, Context, LossyPipe, LossyPipe) {
    let (pipe_a, pipe_b) = LossyPipe::pair();
    let spy_a = pipe_a.clone();
    let spy_b = pipe_b.clone();

    let mut a = Context::init(config_a);
    let mut b = Context::init(config_b);
    a.set_bio(Box::new(pipe_a), Box::new(ManualTimer::new()));
    b.set_bio(Box::new(pipe_b), Box::new(ManualTimer::new()));

    let ea = a.register_epoch(epoch_params(11));
    a.activate_read_epoch(ea).unwrap();
    a.activate_write_epoch(ea).unwrap();
    let eb = b.register_epoch(epoch_params(11));
    b.activate_read_epoch(eb).unwrap();
    b.activate_write_epoch(eb).unwrap();

    (a, b, spy_a, spy_b)
}

fn connected_pair() -> (Context, Context, LossyPipe, LossyPipe) {
    wire_up(Config::new(Mode::Datagram), Config::new(Mode::Datagram))
}

fn stream_pair(max_record_payload: usize) -> (Context, Context, LossyPipe, LossyPipe) {
    let mut config = Config::new(Mode::Stream);
    config.max_record_payload = max_record_payload;
    wire_up(config.clone(), config)
}

fn write_whole_handshake(ctx: &mut Context, htype: HandshakeType, body: &[u8], flags: MessageFlags) {
    let w = ctx.write_handshake(htype, Some(body.len() as u32), None).unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(body.len()).unwrap() {
        buf.copy_from_slice(body);
    } else {
        panic!("expected capacity for {} bytes", body.len());
    }
    w.commit(body.len()).unwrap();
    ctx.write_set_flags(flags);
    ctx.dispatch().unwrap();
}

fn expect_handshake(ctx: &mut Context, htype: HandshakeType, body: &[u8], flags: MessageFlags) {
    assert!(matches!(ctx.read().unwrap(), ReadOutcome::Handshake));
    let (r, actual_type, ..) = ctx.read_handshake().unwrap();
    assert_eq!(actual_type, htype);
    assert!(matches!(r.peek(body.len()), PeekOutcome::Bytes(b) if b == body));
    ctx.read_set_flags(flags);
    ctx.read_consume().unwrap();
}

/// Scenario 1: a clean single-message flight delivered end to end, with both
/// the write-side and read-side "ends the flight and the handshake" flags
/// driving the flight machine all the way back to `done` on both peers.
#[test]
fn clean_flight_exchange_delivers_a_single_handshake_message() {
    /*env_logger::Builder::new()
    .filter(None, log::LevelFilter::Trace)
    .init();*/

    let (mut a, mut b, ..) = connected_pair();

    write_whole_handshake(
        &mut a,
        HandshakeType(1),
        b"client hello",
        MessageFlags::ENDS_FLIGHT | MessageFlags::ENDS_HANDSHAKE,
    );
    expect_handshake(
        &mut b,
        HandshakeType(1),
        b"client hello",
        MessageFlags::ENDS_FLIGHT,
    );
}

/// Scenario 2: a record retransmitted at the exact same sequence number
/// (simulating a duplicated wire datagram) is silently dropped by the
/// per-epoch replay window rather than delivered twice.
#[test]
fn duplicate_incoming_record_is_dropped_by_the_replay_window() {
    let (mut a, mut b, ..) = connected_pair();

    let epoch = 0u64;
    let w = a.write_application().unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(4).unwrap() {
        buf.copy_from_slice(b"once");
    } else {
        panic!("expected capacity");
    }
    w.commit(4).unwrap();
    a.dispatch().unwrap();
    a.flush().unwrap();

    // Roll the write sequence counter back and resend the identical record,
    // reproducing a duplicated datagram at the wire level.
    a.force_sequence_number(epoch, &[0u8; 8]).unwrap();
    let w = a.write_application().unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(4).unwrap() {
        buf.copy_from_slice(b"once");
    } else {
        panic!("expected capacity");
    }
    w.commit(4).unwrap();
    a.dispatch().unwrap();
    a.flush().unwrap();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Application));
    let r = b.read_application().unwrap();
    assert!(matches!(r.peek(4), PeekOutcome::Bytes(bytes) if bytes == b"once"));
    b.read_consume().unwrap();

    // The duplicate record shares a sequence number already inside the
    // replay window, so it never surfaces as a second application message.
    assert!(b.read().is_err());
}

/// Scenario 3: a flight that goes unanswered past its retransmission timeout
/// is replayed verbatim; the peer, having already advanced past that
/// message sequence, silently discards the resend rather than redelivering
/// it to the user.
#[test]
fn unanswered_flight_is_retransmitted_on_timer_expiry() {
    let mut config = Config::new(Mode::Datagram);
    config.retransmit_timeout_min_ms = 1_000;
    let (mut a, mut b, ..) = wire_up(config.clone(), config);

    write_whole_handshake(
        &mut a,
        HandshakeType(2),
        b"flight one",
        MessageFlags::ENDS_FLIGHT,
    );

    expect_handshake(&mut b, HandshakeType(2), b"flight one", MessageFlags::ENDS_FLIGHT);

    // `a` never hears back from `b`; its await timer fires and it resends.
    // (The test timer is advanced directly rather than through a real clock.)
    a.force_timer_expiry();
    assert!(a.read().is_err());

    // The resend reaches `b`, but `b` already consumed sequence 0: dropped.
    assert!(b.read().is_err());
}

/// Scenario 4: fragments of one handshake message arriving out of order
/// (simulated by reordering the last two queued datagrams) still reassemble
/// into the original byte sequence once the middle fragment catches up.
#[test]
fn reordered_fragments_reassemble_into_the_original_message() {
    let mut config = Config::new(Mode::Datagram);
    config.max_record_payload = 40;
    let (mut a, mut b, _spy_a, spy_b) = wire_up(config.clone(), config);

    let body: Vec<u8> = (0u8..70).collect();
    let w = a.write_handshake(HandshakeType(3), Some(body.len() as u32), None).unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(body.len()).unwrap() {
        buf.copy_from_slice(&body);
    } else {
        panic!("expected capacity for the whole message across fragments");
    }
    w.commit(body.len()).unwrap();
    a.write_set_flags(MessageFlags::ENDS_FLIGHT);
    a.dispatch().unwrap();

    // Three fragments, each its own datagram at this payload size: swap the
    // last two so the final fragment arrives before the middle one.
    spy_b.reorder_last_two_pending();

    let mut reassembled = None;
    for _ in 0..5 {
        match b.read() {
            Ok(ReadOutcome::Handshake) => {
                let (r, htype, ..) = b.read_handshake().unwrap();
                assert_eq!(htype, HandshakeType(3));
                match r.peek(body.len()) {
                    PeekOutcome::Bytes(bytes) => reassembled = Some(bytes.to_vec()),
                    PeekOutcome::NeedMore => panic!("expected the fully reassembled message"),
                }
                b.read_set_flags(MessageFlags::ENDS_FLIGHT);
                b.read_consume().unwrap();
                break;
            }
            Ok(_) => panic!("expected a handshake message"),
            Err(_) => continue,
        }
    }

    assert_eq!(reassembled.expect("message never reassembled"), body);
}

/// Scenario 5: a message sent ahead of its predecessor (simulated by
/// flushing two independent messages as separate datagrams and swapping
/// them) is buffered in a future slot and released only once the gap closes.
#[test]
fn future_message_is_buffered_until_its_predecessor_arrives() {
    let (mut a, mut b, _spy_a, spy_b) = connected_pair();

    let w = a.write_handshake(HandshakeType(4), Some(1), None).unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(1).unwrap() {
        buf.copy_from_slice(b"A");
    } else {
        panic!("expected capacity");
    }
    w.commit(1).unwrap();
    a.dispatch().unwrap();
    a.flush().unwrap();

    let w = a.write_handshake(HandshakeType(4), Some(1), None).unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(1).unwrap() {
        buf.copy_from_slice(b"B");
    } else {
        panic!("expected capacity");
    }
    w.commit(1).unwrap();
    a.write_set_flags(MessageFlags::ENDS_FLIGHT);
    a.dispatch().unwrap();

    // `b` now has two queued datagrams; swap them so "B" arrives first.
    spy_b.reorder_last_two_pending();

    // First pump only delivers the future message's fragment: nothing ready.
    assert!(b.read().is_err());

    // Second pump delivers the predecessor, releasing both in order.
    assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
    let (r, ..) = b.read_handshake().unwrap();
    assert!(matches!(r.peek(1), PeekOutcome::Bytes(bytes) if bytes == b"A"));
    b.read_consume().unwrap();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
    let (r, ..) = b.read_handshake().unwrap();
    assert!(matches!(r.peek(1), PeekOutcome::Bytes(bytes) if bytes == b"B"));
    b.read_set_flags(MessageFlags::ENDS_FLIGHT);
    b.read_consume().unwrap();
}

/// Scenario 6: switching both directions to a freshly registered epoch
/// starts a brand new sequence counter and requires the new key to decrypt,
/// while leaving earlier epoch-0 traffic unaffected.
#[test]
fn epoch_boundary_starts_a_fresh_sequence_space() {
    let (mut a, mut b, ..) = connected_pair();

    let w = a.write_application().unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(9).unwrap() {
        buf.copy_from_slice(b"epoch 0 1");
    } else {
        panic!("expected capacity");
    }
    w.commit(9).unwrap();
    a.dispatch().unwrap();
    a.flush().unwrap();
    assert!(matches!(b.read().unwrap(), ReadOutcome::Application));
    let r = b.read_application().unwrap();
    assert!(matches!(r.peek(9), PeekOutcome::Bytes(bytes) if bytes == b"epoch 0 1"));
    b.read_consume().unwrap();

    let new_epoch_a = a.register_epoch(epoch_params(99));
    let new_epoch_b = b.register_epoch(epoch_params(99));
    assert_eq!(a.get_sequence_number(new_epoch_a).unwrap(), [0u8; 8]);

    a.activate_write_epoch(new_epoch_a).unwrap();
    b.activate_read_epoch(new_epoch_b).unwrap();

    let w = a.write_application().unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(9).unwrap() {
        buf.copy_from_slice(b"epoch 1!!");
    } else {
        panic!("expected capacity");
    }
    w.commit(9).unwrap();
    a.dispatch().unwrap();
    a.flush().unwrap();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Application));
    let r = b.read_application().unwrap();
    assert!(matches!(r.peek(9), PeekOutcome::Bytes(bytes) if bytes == b"epoch 1!!"));
    b.read_consume().unwrap();

    // The new epoch's own counter advanced independently of epoch 0's.
    assert_eq!(a.get_sequence_number(new_epoch_a).unwrap(), [0, 0, 0, 0, 0, 0, 0, 1]);
}

/// Scenario 7: in `Mode::Stream`, a declared-length handshake message large
/// enough to span three records arrives to the peer one record payload at a
/// time (no per-record fragment header restated on the wire, spec §4.3).
/// Each record beyond the first finds the user already holding a paused
/// reader for that message; the reader reports `NeedMore` until the final
/// record lands, at which point it reports the complete reassembled body —
/// the stream-mode partial-read/pause-resume path of spec §4.6.
#[test]
fn stream_mode_message_spanning_records_resumes_across_pauses() {
    let (mut a, mut b, _spy_a, spy_b) = stream_pair(20);

    let body: Vec<u8> = (0u8..50).collect();
    let w = a.write_handshake(HandshakeType(5), Some(body.len() as u32), None).unwrap();
    if let ReserveOutcome::Ready(buf) = w.reserve(body.len()).unwrap() {
        buf.copy_from_slice(&body);
    } else {
        panic!("expected capacity for the whole message across fragments");
    }
    w.commit(body.len()).unwrap();
    a.write_set_flags(MessageFlags::ENDS_FLIGHT);
    a.dispatch().unwrap();

    // `a`'s single flush coalesced every record into one stream write; split
    // it back into the three on-wire records a real TCP stack could have
    // delivered across separate reads.
    spy_b.split_next_pending_into_records();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
    let (r, htype, total_len, _additional_data) = b.read_handshake().unwrap();
    assert_eq!(htype, HandshakeType(5));
    assert_eq!(total_len, body.len() as u32);
    assert!(matches!(r.peek(body.len()), PeekOutcome::NeedMore));
    b.read_pause().unwrap();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
    let (r, ..) = b.read_handshake().unwrap();
    assert!(matches!(r.peek(body.len()), PeekOutcome::NeedMore));
    b.read_pause().unwrap();

    assert!(matches!(b.read().unwrap(), ReadOutcome::Handshake));
    let (r, ..) = b.read_handshake().unwrap();
    match r.peek(body.len()) {
        PeekOutcome::Bytes(bytes) => assert_eq!(bytes, &body[..]),
        PeekOutcome::NeedMore => panic!("expected the final record to complete the message"),
    }
    b.read_set_flags(MessageFlags::ENDS_FLIGHT);
    b.read_consume().unwrap();
}
