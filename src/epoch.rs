use std::collections::BTreeMap;

use crate::aead::AeadTransform;
use crate::error::*;
use crate::record_layer::replay_window::ReplayWindow;

/// AEAD parameters registered for one epoch: separate read/write transforms
/// (traffic keys differ by direction) and their per-direction nonce salts.
/// Ownership transfers to the `EpochTable` on `register`.
pub struct EpochParams {
    pub read_aead: Box<dyn AeadTransform + Send + Sync>,
    pub write_aead: Box<dyn AeadTransform + Send + Sync>,
    pub read_salt: [u8; 4],
    pub write_salt: [u8; 4],
}

pub(crate) struct EpochEntry {
    pub params: EpochParams,
    pub write_sequence: u64,
    pub read_window: ReplayWindow,
}

/// Epoch lifecycle (spec §3 Epoch): created by `register`, activated
/// independently per direction, retained while referenced, freed once
/// strictly older than both active directions and unreferenced.
pub struct EpochTable {
    entries: BTreeMap<u64, EpochEntry>,
    next_id: u64,
    active_read: u64,
    active_write: u64,
}

impl EpochTable {
    pub fn new() -> Self {
        EpochTable {
            entries: BTreeMap::new(),
            next_id: 0,
            active_read: 0,
            active_write: 0,
        }
    }

    pub fn register(&mut self, params: EpochParams) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            EpochEntry {
                params,
                write_sequence: 0,
                read_window: ReplayWindow::new(),
            },
        );
        id
    }

    pub fn activate_read(&mut self, epoch: u64) -> Result<()> {
        if !self.entries.contains_key(&epoch) {
            return Err(Error::ErrUnknownEpoch(epoch));
        }
        self.active_read = epoch;
        Ok(())
    }

    pub fn activate_write(&mut self, epoch: u64) -> Result<()> {
        if !self.entries.contains_key(&epoch) {
            return Err(Error::ErrUnknownEpoch(epoch));
        }
        self.active_write = epoch;
        Ok(())
    }

    pub fn active_read(&self) -> u64 {
        self.active_read
    }

    pub fn active_write(&self) -> u64 {
        self.active_write
    }

    pub(crate) fn get(&self, epoch: u64) -> Result<&EpochEntry> {
        self.entries.get(&epoch).ok_or(Error::ErrUnknownEpoch(epoch))
    }

    pub(crate) fn get_mut(&mut self, epoch: u64) -> Result<&mut EpochEntry> {
        self.entries
            .get_mut(&epoch)
            .ok_or(Error::ErrUnknownEpoch(epoch))
    }

    /// Allocates the next strictly-monotonic write sequence number for
    /// `epoch` and advances the counter.
    pub(crate) fn next_write_sequence(&mut self, epoch: u64) -> Result<u64> {
        let entry = self.get_mut(epoch)?;
        let seq = entry.write_sequence;
        entry.write_sequence += 1;
        Ok(seq)
    }

    /// Sets the next write sequence number (abstraction-break; spec §6
    /// `force_sequence_number`, used only for the HelloVerifyRequest
    /// cookie round-trip).
    pub(crate) fn force_write_sequence(&mut self, epoch: u64, seq: u64) -> Result<()> {
        self.get_mut(epoch)?.write_sequence = seq;
        Ok(())
    }

    /// Drops epochs strictly older than both active directions that no
    /// buffered message still references.
    pub fn collect_garbage(&mut self, referenced: &[u64]) {
        let active_read = self.active_read;
        let active_write = self.active_write;
        self.entries.retain(|&id, _| {
            let still_live = id >= active_read || id >= active_write;
            still_live || referenced.contains(&id)
        });
    }
}

impl Default for EpochTable {
    fn default() -> Self {
        Self::new()
    }
}
