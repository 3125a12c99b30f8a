//! Reassembly submodule (spec §4.5): `1 + K` slots, slot 0 holding the next
//! expected handshake message, slots `1..K` buffering messages that arrived
//! ahead of schedule.

use std::collections::HashMap;

use crate::error::*;
use crate::handshake::handshake_header::HandshakeType;
use crate::message::HandshakeFragment;

/// Per-message retransmission-detection tag (spec §4.4 / glossary).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum DetectionState {
    Enabled,
    OnHold,
}

enum SlotState {
    Empty,
    /// A single fragment covered the whole message; its bytes are held
    /// directly, with no bitmask bookkeeping (spec §4.5 step 2).
    NoFragmentation { handshake_type: HandshakeType, bytes: Vec<u8> },
    /// More than one fragment is needed; bytes and a per-byte bitmask are
    /// allocated on first partial fragment (spec §9 design notes: deferred
    /// allocation).
    Windowed {
        handshake_type: HandshakeType,
        total_len: u32,
        buffer: Vec<u8>,
        received: Vec<bool>,
    },
}

struct Slot {
    state: SlotState,
    epoch: Option<u64>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            state: SlotState::Empty,
            epoch: None,
        }
    }

    fn is_complete(&self) -> bool {
        match &self.state {
            SlotState::Empty => false,
            SlotState::NoFragmentation { .. } => true,
            SlotState::Windowed { received, .. } => received.iter().all(|b| *b),
        }
    }

    fn take_bytes(&mut self) -> (HandshakeType, Vec<u8>) {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::NoFragmentation { handshake_type, bytes } => (handshake_type, bytes),
            SlotState::Windowed {
                handshake_type,
                buffer,
                ..
            } => (handshake_type, buffer),
            SlotState::Empty => unreachable!("take_bytes on empty slot"),
        }
    }
}

/// A message delivered to the user: fully reassembled bytes plus its
/// identifying fields.
pub(crate) struct ReassembledMessage {
    pub epoch: u64,
    pub message_sequence: u16,
    pub handshake_type: HandshakeType,
    pub bytes: Vec<u8>,
}

pub(crate) struct Reassembly {
    slots: Vec<Slot>,
    next_expected: u16,
    /// `(epoch, message_sequence) -> detection state`, for messages of the
    /// last fully-received incoming flight (spec §4.4 "retransmission
    /// detection record").
    detection: HashMap<(u64, u16), DetectionState>,
}

/// What [`Reassembly::feed`] reports so the flight layer can act on it.
pub(crate) enum FeedOutcome {
    /// Bytes accepted; slot 0 may or may not be complete yet — call
    /// `try_take_ready` to find out.
    Accepted,
    /// The fragment's `(epoch, seq)` matched a retransmission-detection
    /// entry; the flight layer should react per spec §4.4. `trigger_resend`
    /// is true only when the matched entry was already `enabled` — the
    /// case that actually retransmits our flight; a match on an `on-hold`
    /// entry just flips it back to `enabled` and does nothing else.
    PeerRetransmission { trigger_resend: bool },
    /// Out of window (too far in the future, or a stale duplicate with no
    /// tracked detection state): silently dropped per spec §4.5 step 6.
    Dropped,
}

impl Reassembly {
    pub fn new(future_message_buffers: usize) -> Self {
        let mut slots = Vec::with_capacity(1 + future_message_buffers);
        for _ in 0..=future_message_buffers {
            slots.push(Slot::empty());
        }
        Reassembly {
            slots,
            next_expected: 0,
            detection: HashMap::new(),
        }
    }

    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    fn future_capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Feeds one fragment from L3 (spec §4.5 "On feed").
    pub fn feed(&mut self, frag: HandshakeFragment) -> Result<FeedOutcome> {
        let seq = frag.message_sequence;

        if seq_before(seq, self.next_expected) {
            return match self.detection.get_mut(&(frag.epoch, seq)) {
                Some(state) => {
                    let trigger_resend = *state == DetectionState::Enabled;
                    if trigger_resend {
                        for (key, other) in self.detection.iter_mut() {
                            *other = if *key == (frag.epoch, seq) {
                                DetectionState::Enabled
                            } else {
                                DetectionState::OnHold
                            };
                        }
                    } else {
                        *state = DetectionState::Enabled;
                    }
                    Ok(FeedOutcome::PeerRetransmission { trigger_resend })
                }
                None => Ok(FeedOutcome::Dropped),
            };
        }

        let slot_index = seq.wrapping_sub(self.next_expected) as usize;
        if slot_index > self.future_capacity() {
            return Ok(FeedOutcome::Dropped);
        }

        self.merge_into_slot(slot_index, frag)?;
        Ok(FeedOutcome::Accepted)
    }

    fn merge_into_slot(&mut self, index: usize, frag: HandshakeFragment) -> Result<()> {
        let whole_message = frag.fragment_offset == 0 && frag.bytes.len() as u32 == frag.total_len;

        let slot = &mut self.slots[index];
        if let Some(existing_epoch) = slot.epoch {
            if existing_epoch != frag.epoch {
                return Err(Error::ErrInvalidRecord);
            }
        } else {
            slot.epoch = Some(frag.epoch);
        }

        match &slot.state {
            SlotState::Empty if whole_message => {
                slot.state = SlotState::NoFragmentation {
                    handshake_type: frag.handshake_type,
                    bytes: frag.bytes,
                };
                return Ok(());
            }
            _ => {}
        }

        // Either the slot already holds state for this sequence, or this is
        // the first *partial* fragment for it: either way, upgrade/allocate
        // a windowed buffer and merge in.
        if let SlotState::Empty = slot.state {
            slot.state = SlotState::Windowed {
                handshake_type: frag.handshake_type,
                total_len: frag.total_len,
                buffer: vec![0u8; frag.total_len as usize],
                received: vec![false; frag.total_len as usize],
            };
        } else if let SlotState::NoFragmentation { handshake_type, bytes } = &slot.state {
            // Upgrade a previously no-fragmentation slot (spec §4.5 step 3):
            // copy the borrowed bytes into an owned, bitmasked buffer.
            let total_len = bytes.len() as u32;
            let mut buffer = vec![0u8; total_len as usize];
            buffer.copy_from_slice(bytes);
            let received = vec![true; total_len as usize];
            slot.state = SlotState::Windowed {
                handshake_type: *handshake_type,
                total_len,
                buffer,
                received,
            };
        }

        let (handshake_type, total_len, buffer, received) = match &mut slot.state {
            SlotState::Windowed {
                handshake_type,
                total_len,
                buffer,
                received,
            } => (handshake_type, total_len, buffer, received),
            _ => unreachable!(),
        };

        if *handshake_type != frag.handshake_type || *total_len != frag.total_len {
            return Err(Error::ErrFragmentLengthMismatch { seq: frag.message_sequence });
        }

        let start = frag.fragment_offset as usize;
        let end = start + frag.bytes.len();
        if end > *total_len as usize {
            return Err(Error::ErrFragmentOverflow {
                offset: frag.fragment_offset,
                offset_plus_len: end as u32,
                total_len: *total_len,
            });
        }

        for (i, byte) in frag.bytes.iter().enumerate() {
            let pos = start + i;
            if received[pos] && buffer[pos] != *byte {
                return Err(Error::ErrFragmentByteMismatch { seq: frag.message_sequence });
            }
            buffer[pos] = *byte;
            received[pos] = true;
        }

        Ok(())
    }

    /// If slot 0 is complete, pops it, shifts every other slot down, and
    /// returns the reassembled message. Repeated calls drain any further
    /// slots that become complete as a result (spec §4.5 "Message-available
    /// event").
    pub fn try_take_ready(&mut self) -> Option<ReassembledMessage> {
        if !self.slots[0].is_complete() {
            return None;
        }
        let epoch = self.slots[0].epoch.take().expect("complete slot has an epoch");
        let (handshake_type, bytes) = self.slots[0].take_bytes();
        let message_sequence = self.next_expected;

        self.slots.remove(0);
        self.slots.push(Slot::empty());
        self.next_expected = self.next_expected.wrapping_add(1);

        Some(ReassembledMessage {
            epoch,
            message_sequence,
            handshake_type,
            bytes,
        })
    }

    /// Replaces the retransmission-detection set with the messages of the
    /// flight that was just fully received (spec §4.4: tracked "for each
    /// message of the last fully-received incoming flight").
    pub fn arm_detection(&mut self, messages: impl IntoIterator<Item = (u64, u16)>) {
        self.detection.clear();
        for key in messages {
            self.detection.insert(key, DetectionState::Enabled);
        }
    }

    pub fn clear_detection(&mut self) {
        self.detection.clear();
    }
}

/// Sequence-number comparison that tolerates `u16` wraparound the same way
/// the teacher's record sequence arithmetic does: "before" means strictly
/// less when neither side is within half the space of wrapping around.
fn seq_before(seq: u16, next_expected: u16) -> bool {
    seq.wrapping_sub(next_expected) > u16::MAX / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(seq: u16, total: u32, offset: u32, body: &[u8]) -> HandshakeFragment {
        HandshakeFragment {
            epoch: 0,
            message_sequence: seq,
            handshake_type: HandshakeType(1),
            total_len: total,
            fragment_offset: offset,
            bytes: body.to_vec(),
        }
    }

    #[test]
    fn whole_message_in_one_fragment_is_immediately_available() {
        let mut r = Reassembly::new(4);
        r.feed(frag(0, 5, 0, b"hello")).unwrap();
        let msg = r.try_take_ready().unwrap();
        assert_eq!(msg.bytes, b"hello");
        assert_eq!(r.next_expected(), 1);
    }

    #[test]
    fn reordered_fragments_reassemble_in_declared_order() {
        let mut r = Reassembly::new(4);
        r.feed(frag(0, 256, 100, &[2u8; 100])).unwrap();
        assert!(r.try_take_ready().is_none());
        r.feed(frag(0, 256, 0, &[1u8; 100])).unwrap();
        assert!(r.try_take_ready().is_none());
        r.feed(frag(0, 256, 200, &[3u8; 56])).unwrap();
        let msg = r.try_take_ready().unwrap();
        let mut expected = vec![1u8; 100];
        expected.extend(vec![2u8; 100]);
        expected.extend(vec![3u8; 56]);
        assert_eq!(msg.bytes, expected);
    }

    #[test]
    fn future_messages_buffer_and_release_in_order() {
        let mut r = Reassembly::new(2);
        r.feed(frag(1, 1, 0, b"B")).unwrap();
        r.feed(frag(2, 1, 0, b"C")).unwrap();
        assert!(r.try_take_ready().is_none());
        r.feed(frag(0, 1, 0, b"A")).unwrap();

        let m0 = r.try_take_ready().unwrap();
        assert_eq!(m0.bytes, b"A");
        let m1 = r.try_take_ready().unwrap();
        assert_eq!(m1.bytes, b"B");
        let m2 = r.try_take_ready().unwrap();
        assert_eq!(m2.bytes, b"C");
    }

    #[test]
    fn more_than_k_future_messages_are_dropped() {
        let mut r = Reassembly::new(2);
        assert!(matches!(r.feed(frag(3, 1, 0, b"D")).unwrap(), FeedOutcome::Dropped));
    }

    #[test]
    fn overlapping_fragments_must_agree() {
        let mut r = Reassembly::new(4);
        r.feed(frag(0, 10, 0, &[1u8; 5])).unwrap();
        assert!(r.feed(frag(0, 10, 2, &[9u8; 5])).is_err());
    }

    #[test]
    fn overlapping_fragments_matching_bytes_are_fine() {
        let mut r = Reassembly::new(4);
        r.feed(frag(0, 10, 0, &[1, 2, 3, 4, 5])).unwrap();
        r.feed(frag(0, 10, 3, &[4, 5, 6, 7, 8])).unwrap();
        assert!(r.try_take_ready().is_none());
        r.feed(frag(0, 10, 8, &[9, 10])).unwrap();
        let msg = r.try_take_ready().unwrap();
        assert_eq!(msg.bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn duplicate_of_a_detection_tracked_message_reports_retransmission() {
        let mut r = Reassembly::new(4);
        r.feed(frag(0, 1, 0, b"A")).unwrap();
        r.try_take_ready().unwrap();
        r.arm_detection(vec![(0, 0)]);
        let outcome = r.feed(frag(0, 1, 0, b"A")).unwrap();
        assert!(matches!(outcome, FeedOutcome::PeerRetransmission { .. }));
    }
}
