pub mod record_layer_header;
pub mod replay_window;

use std::collections::VecDeque;
use std::io::Write;

use record_layer_header::*;

use crate::aead::record_aad;
use crate::config::Mode;
use crate::content::ContentType;
use crate::epoch::EpochTable;
use crate::error::*;

/// A fully decrypted incoming record, queued for L3 to demultiplex.
pub(crate) struct DecryptedRecord {
    pub header: RecordLayerHeader,
    pub plaintext: Vec<u8>,
}

/// The outgoing record currently being filled by `open_write`/writer
/// commits. Plaintext accumulates here until `dispatch_write` encrypts it.
struct OpenRecord {
    content_type: ContentType,
    epoch: u64,
    plaintext: Vec<u8>,
}

/// L2: wire framing, epoch-keyed AEAD, replay protection, and record/datagram
/// coalescing (spec §4.2). Does not own the epoch table or the transport —
/// those are passed in by the caller (the `Context`), matching "the MPS
/// context exclusively owns" from spec §3 Ownership.
pub struct RecordLayer {
    mode: Mode,
    max_payload: usize,
    protocol_version: ProtocolVersion,

    open: Option<OpenRecord>,
    /// Wire bytes of already-encrypted records waiting to be coalesced into
    /// the next outgoing datagram (or stream chunk) and handed to L1.
    ready_records: Vec<Vec<u8>>,

    /// Incoming on-wire record byte ranges not yet parsed (datagram mode:
    /// one entry per record inside the last-received datagram; stream mode:
    /// a single growing buffer sliced off as headers are parsed).
    inbound_wire: VecDeque<Vec<u8>>,
    decrypted: VecDeque<DecryptedRecord>,

    current_read: Option<DecryptedRecord>,
}

impl RecordLayer {
    pub fn new(mode: Mode, max_payload: usize) -> Self {
        RecordLayer {
            mode,
            max_payload,
            protocol_version: DTLS1_2,
            open: None,
            ready_records: Vec::new(),
            inbound_wire: VecDeque::new(),
            decrypted: VecDeque::new(),
            current_read: None,
        }
    }

    /// Feeds one on-wire datagram (already received from L1) into the
    /// record layer. A datagram may carry several records back to back
    /// (spec §4.2, grounded in the teacher's `unpack_datagram`); each is
    /// decrypted independently, so one record's AEAD failure never hides
    /// the records after it in the same datagram (spec §9 Open Question 1).
    pub fn receive_datagram(&mut self, raw: &[u8], epochs: &mut EpochTable) -> Result<()> {
        debug_assert!(self.mode == Mode::Datagram);
        for wire_record in unpack_records(raw)? {
            match decrypt_record(&wire_record, epochs) {
                Ok(decrypted) => self.decrypted.push_back(decrypted),
                Err(Error::ErrInvalidRecord) => {
                    log::debug!("dropping record that failed AEAD/replay check in datagram mode");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Feeds a chunk of on-wire stream bytes. Unlike datagram mode, a
    /// decrypt failure here is fatal (spec §4.2, §7): stream framing has no
    /// datagram boundary to recover at.
    pub fn receive_stream(&mut self, raw: &[u8], epochs: &mut EpochTable) -> Result<()> {
        debug_assert!(self.mode == Mode::Stream);
        self.inbound_wire.push_back(raw.to_vec());
        let mut buf: Vec<u8> = self.inbound_wire.drain(..).flatten().collect();

        loop {
            if buf.len() < RECORD_LAYER_HEADER_SIZE {
                break;
            }
            let mut cursor = buf.as_slice();
            let header = RecordLayerHeader::unmarshal(&mut cursor)?;
            let total = RECORD_LAYER_HEADER_SIZE + header.content_len as usize;
            if buf.len() < total {
                break;
            }
            let wire_record = buf[..total].to_vec();
            buf.drain(..total);
            self.decrypted.push_back(decrypt_record(&wire_record, epochs)?);
        }

        if !buf.is_empty() {
            self.inbound_wire.push_back(buf);
        }
        Ok(())
    }

    /// Pulls the next decrypted record, exposing its header; the plaintext
    /// is retrieved with [`RecordLayer::read_payload`] and released with
    /// [`RecordLayer::consume_read`].
    pub fn open_read(&mut self) -> Option<RecordLayerHeader> {
        if self.current_read.is_none() {
            self.current_read = self.decrypted.pop_front();
        }
        self.current_read.as_ref().map(|r| r.header)
    }

    pub fn read_payload(&self) -> Option<&[u8]> {
        self.current_read.as_ref().map(|r| r.plaintext.as_slice())
    }

    pub fn consume_read(&mut self) {
        self.current_read = None;
    }

    pub fn has_pending_read(&self) -> bool {
        self.current_read.is_some() || !self.decrypted.is_empty()
    }

    /// Allocates space in the current outgoing record for `content_type`
    /// under `epoch`, opening a new record if the type/epoch differ from
    /// whatever is already open or there's no room left. Returns the
    /// remaining capacity so the writer above can bound its `reserve`s.
    pub fn open_write(
        &mut self,
        content_type: ContentType,
        epoch: u64,
        epochs: &mut EpochTable,
    ) -> Result<()> {
        let needs_new = match &self.open {
            Some(o) => o.content_type != content_type || o.epoch != epoch || self.remaining_capacity() == 0,
            None => true,
        };
        if needs_new {
            if self.open.is_some() {
                self.dispatch_write(epochs)?;
            }
            self.open = Some(OpenRecord {
                content_type,
                epoch,
                plaintext: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn remaining_capacity(&self) -> usize {
        match &self.open {
            Some(o) => self.max_payload.saturating_sub(o.plaintext.len()),
            None => self.max_payload,
        }
    }

    /// Appends plaintext to the currently open record. Capped by
    /// `remaining_capacity`; callers (the writer) must not exceed it.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or(Error::ErrInternal("write_payload with no open record"))?;
        if bytes.len() > self.max_payload.saturating_sub(open.plaintext.len()) {
            return Err(Error::ErrInternal("write_payload overruns record capacity"));
        }
        open.plaintext.extend_from_slice(bytes);
        Ok(())
    }

    /// Closes the current outgoing record region, encrypting it under its
    /// epoch and queuing the wire bytes for the next `flush`.
    pub fn dispatch_write(&mut self, epochs: &mut EpochTable) -> Result<()> {
        let open = match self.open.take() {
            Some(o) => o,
            None => return Ok(()),
        };
        if open.plaintext.is_empty() {
            return Ok(());
        }

        let seq = epochs.next_write_sequence(open.epoch)?;
        let mut header = RecordLayerHeader {
            content_type: open.content_type,
            protocol_version: self.protocol_version,
            epoch: open.epoch as u16,
            sequence_number: seq,
            content_len: 0,
        };

        let entry = epochs.get(open.epoch)?;
        let nonce = crate::aead::derive_nonce(&entry.params.write_salt, seq);
        let aad = record_aad(&header);
        let ciphertext = entry
            .params
            .write_aead
            .encrypt(&aad, &nonce, &open.plaintext)
            .map_err(|_| Error::ErrInternal("AEAD encryption failed"))?;
        header.content_len = ciphertext.len() as u16;

        let mut wire = Vec::with_capacity(RECORD_LAYER_HEADER_SIZE + ciphertext.len());
        header.marshal(&mut wire)?;
        wire.write_all(&ciphertext)?;

        self.ready_records.push(wire);
        Ok(())
    }

    /// Hands all prepared records to L1, coalescing as many as fit into one
    /// datagram for datagram mode (spec §4.2 "multiple records into a single
    /// datagram where space allows"); for stream mode, all ready bytes are
    /// concatenated into a single send.
    pub fn flush(&mut self, transport: &mut dyn crate::transport::Transport) -> Result<()> {
        if self.ready_records.is_empty() {
            return Ok(());
        }

        match self.mode {
            Mode::Stream => {
                let mut all = Vec::new();
                for rec in self.ready_records.drain(..) {
                    all.extend_from_slice(&rec);
                }
                send_all(transport, &all)?;
            }
            Mode::Datagram => {
                let mut datagram = Vec::new();
                let mut pending: Vec<Vec<u8>> = self.ready_records.drain(..).collect();
                pending.reverse();
                while let Some(rec) = pending.pop() {
                    if !datagram.is_empty() && datagram.len() + rec.len() > self.max_payload {
                        send_all(transport, &datagram)?;
                        datagram.clear();
                    }
                    datagram.extend_from_slice(&rec);
                }
                if !datagram.is_empty() {
                    send_all(transport, &datagram)?;
                }
            }
        }
        Ok(())
    }

    pub fn has_pending_write(&self) -> bool {
        self.open.is_some() || !self.ready_records.is_empty()
    }
}

fn send_all(transport: &mut dyn crate::transport::Transport, bytes: &[u8]) -> Result<()> {
    use crate::transport::SendOutcome;
    match transport.send(bytes)? {
        SendOutcome::Written(_) => Ok(()),
        SendOutcome::WouldBlock => Err(Error::want_write()),
    }
}

/// Splits one on-wire datagram into its constituent record byte ranges
/// (grounded in the teacher's `unpack_datagram`: spec §4.2 notes that
/// multiple records of the same flight may share a datagram).
fn unpack_records(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut out = vec![];
    let mut offset = 0;
    while offset != buf.len() {
        if buf.len() - offset < RECORD_LAYER_HEADER_SIZE {
            return Err(Error::ErrInvalidRecord);
        }
        let content_len = u16::from_be_bytes([
            buf[offset + RECORD_LAYER_HEADER_SIZE - 2],
            buf[offset + RECORD_LAYER_HEADER_SIZE - 1],
        ]) as usize;
        let pkt_len = RECORD_LAYER_HEADER_SIZE + content_len;
        if offset + pkt_len > buf.len() {
            return Err(Error::ErrInvalidRecord);
        }
        out.push(buf[offset..offset + pkt_len].to_vec());
        offset += pkt_len;
    }
    Ok(out)
}

fn decrypt_record(wire: &[u8], epochs: &mut EpochTable) -> Result<DecryptedRecord> {
    let mut cursor = wire;
    let header = RecordLayerHeader::unmarshal(&mut cursor)?;
    let ciphertext = cursor;

    let entry = epochs.get_mut(header.epoch as u64)?;
    if !entry.read_window.check(header.sequence_number) {
        return Err(Error::ErrInvalidRecord);
    }

    let nonce = crate::aead::derive_nonce(&entry.params.read_salt, header.sequence_number);
    let aad = record_aad(&header);
    let plaintext = entry
        .params
        .read_aead
        .decrypt(&aad, &nonce, ciphertext)
        .map_err(|_| Error::ErrInvalidRecord)?;

    entry.read_window.accept(header.sequence_number);

    Ok(DecryptedRecord { header, plaintext })
}
