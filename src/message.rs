//! L3: demultiplexes L2 plaintext into typed messages (spec §4.3). Does not
//! reassemble handshake fragments — that is the reassembly submodule's job
//! (spec §4.5); this layer only ever hands up one fragment/chunk at a time.

use crate::alert::Alert;
use crate::change_cipher_spec::ChangeCipherSpec;
use crate::content::ContentType;
use crate::error::*;
use crate::handshake::handshake_header::{HandshakeHeader, HandshakeType, HANDSHAKE_HEADER_LENGTH};

/// One handshake fragment as L3 hands it to the reassembly submodule: the
/// fields named in spec §3 "Handshake message (datagram)" plus the epoch it
/// arrived under (needed for retransmission-detection, spec §4.4).
#[derive(Clone, Debug)]
pub(crate) struct HandshakeFragment {
    pub epoch: u64,
    pub message_sequence: u16,
    pub handshake_type: HandshakeType,
    pub total_len: u32,
    pub fragment_offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) enum InboundMessage {
    Handshake(HandshakeFragment),
    Application(Vec<u8>),
    Alert(Alert),
    ChangeCipherSpec,
}

/// Per-connection streaming decode state for TLS (stream-mode) handshake
/// messages, which may span an arbitrary number of records with no
/// fragment header repeated at record boundaries (unlike DTLS, where every
/// fragment restates its header).
struct StreamCursor {
    next_message_sequence: u16,
    in_progress: Option<(HandshakeType, u32, u32)>, // (type, total_len, bytes_so_far)
}

impl StreamCursor {
    fn new() -> Self {
        StreamCursor {
            next_message_sequence: 0,
            in_progress: None,
        }
    }
}

pub struct MessageLayer {
    mode: crate::config::Mode,
    stream_cursor: StreamCursor,
}

impl MessageLayer {
    pub fn new(mode: crate::config::Mode) -> Self {
        MessageLayer {
            mode,
            stream_cursor: StreamCursor::new(),
        }
    }

    /// Demultiplexes one decrypted record's plaintext. A single record may
    /// carry more than one complete handshake message (teacher's comment on
    /// `record_layer::unpack_datagram`), so this can return several
    /// fragments for a handshake record.
    pub(crate) fn demux(
        &mut self,
        content_type: ContentType,
        epoch: u64,
        plaintext: &[u8],
    ) -> Result<Vec<InboundMessage>> {
        match content_type {
            ContentType::ApplicationData => Ok(vec![InboundMessage::Application(plaintext.to_vec())]),
            ContentType::Alert => {
                if plaintext.len() != 2 {
                    return Err(Error::ErrInvalidAlert);
                }
                let alert = Alert::unmarshal(&mut &plaintext[..])?;
                Ok(vec![InboundMessage::Alert(alert)])
            }
            ContentType::ChangeCipherSpec => {
                if plaintext.len() != 1 {
                    return Err(Error::ErrInvalidCipherSpec);
                }
                ChangeCipherSpec::unmarshal(&mut &plaintext[..])?;
                Ok(vec![InboundMessage::ChangeCipherSpec])
            }
            ContentType::Handshake => match self.mode {
                crate::config::Mode::Datagram => self.demux_datagram_handshake(epoch, plaintext),
                crate::config::Mode::Stream => self.demux_stream_handshake(epoch, plaintext),
            },
            ContentType::Invalid => Err(Error::ErrInvalidRecord),
        }
    }

    fn demux_datagram_handshake(&mut self, epoch: u64, plaintext: &[u8]) -> Result<Vec<InboundMessage>> {
        let mut out = vec![];
        let mut rest = plaintext;
        while !rest.is_empty() {
            if rest.len() < HANDSHAKE_HEADER_LENGTH {
                return Err(Error::ErrInvalidRecord);
            }
            let mut cursor = rest;
            let header = HandshakeHeader::unmarshal(&mut cursor)?;
            let available = rest.len() - HANDSHAKE_HEADER_LENGTH;
            let frag_len = header.fragment_length as usize;
            if frag_len > available {
                return Err(Error::ErrInvalidRecord);
            }
            if header
                .fragment_offset
                .checked_add(header.fragment_length)
                .map(|end| end > header.length)
                .unwrap_or(true)
            {
                return Err(Error::ErrFragmentOverflow {
                    offset: header.fragment_offset,
                    offset_plus_len: header.fragment_offset.saturating_add(header.fragment_length),
                    total_len: header.length,
                });
            }

            let bytes = rest[HANDSHAKE_HEADER_LENGTH..HANDSHAKE_HEADER_LENGTH + frag_len].to_vec();
            out.push(InboundMessage::Handshake(HandshakeFragment {
                epoch,
                message_sequence: header.message_sequence,
                handshake_type: header.handshake_type,
                total_len: header.length,
                fragment_offset: header.fragment_offset,
                bytes,
            }));
            rest = &rest[HANDSHAKE_HEADER_LENGTH + frag_len..];
        }
        Ok(out)
    }

    fn demux_stream_handshake(&mut self, epoch: u64, plaintext: &[u8]) -> Result<Vec<InboundMessage>> {
        const STREAM_HEADER_LEN: usize = 4;
        let mut out = vec![];
        let mut rest = plaintext;
        while !rest.is_empty() {
            let (handshake_type, total_len, so_far) = match self.stream_cursor.in_progress {
                Some(state) => state,
                None => {
                    if rest.len() < STREAM_HEADER_LEN {
                        return Err(Error::ErrInvalidRecord);
                    }
                    let handshake_type = HandshakeType(rest[0]);
                    let total_len = u32::from_be_bytes([0, rest[1], rest[2], rest[3]]);
                    rest = &rest[STREAM_HEADER_LEN..];
                    let state = (handshake_type, total_len, 0u32);
                    self.stream_cursor.in_progress = Some(state);
                    state
                }
            };

            let remaining_in_message = (total_len - so_far) as usize;
            let take = remaining_in_message.min(rest.len());
            let bytes = rest[..take].to_vec();
            rest = &rest[take..];

            let message_sequence = self.stream_cursor.next_message_sequence;
            out.push(InboundMessage::Handshake(HandshakeFragment {
                epoch,
                message_sequence,
                handshake_type,
                total_len,
                fragment_offset: so_far,
                bytes,
            }));

            let new_so_far = so_far + take as u32;
            if new_so_far >= total_len {
                self.stream_cursor.in_progress = None;
                self.stream_cursor.next_message_sequence = self.stream_cursor.next_message_sequence.wrapping_add(1);
            } else {
                self.stream_cursor.in_progress = Some((handshake_type, total_len, new_so_far));
            }
        }
        Ok(out)
    }
}
