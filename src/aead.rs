use crate::record_layer::record_layer_header::RecordLayerHeader;

/// Narrow collaborator contract for the bulk AEAD transform (spec §6).
/// Concrete cipher suites (AES-GCM, AES-CCM, ChaCha20-Poly1305, ...) live
/// outside this crate; the MPS only ever calls through this trait.
pub trait AeadTransform {
    /// `nonce` is whatever the registered cipher needs (commonly a 4-byte
    /// implicit salt prefix concatenated with the 8-byte record sequence
    /// number); deriving it is the epoch's job, not the transform's.
    fn encrypt(&self, aad: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError>;
    fn decrypt(&self, aad: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError>;
    /// Bytes of authentication tag/expansion added by `encrypt`.
    fn overhead(&self) -> usize;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum AeadError {
    #[error("AEAD authentication failed")]
    AuthFailed,
}

/// Narrow collaborator contract for the random source (spec §6).
pub trait RandomSource {
    fn fill(&self, buf: &mut [u8]);
}

/// Builds the additional authenticated data for a record: the 13-byte
/// record header, with the sequence number's full 64-bit width (the wire
/// form truncates to 48 bits, but the AAD needs to disambiguate epochs
/// exactly as the teacher's `generate_aead_additional_data` does).
pub(crate) fn record_aad(header: &RecordLayerHeader) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[0] = header.content_type as u8;
    aad[1] = header.protocol_version.major;
    aad[2] = header.protocol_version.minor;
    aad[3..5].copy_from_slice(&header.epoch.to_be_bytes());
    aad[5..11].copy_from_slice(&header.sequence_number.to_be_bytes()[2..]);
    aad[11..13].copy_from_slice(&header.content_len.to_be_bytes());
    aad
}

/// Deterministic nonce derivation: 4-byte salt fixed at epoch registration
/// concatenated with the 8-byte record sequence number, matching the
/// construction `dtls::crypto::crypto_gcm` documents for AES-GCM.
pub(crate) fn derive_nonce(salt: &[u8; 4], sequence_number: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(salt);
    nonce[4..].copy_from_slice(&sequence_number.to_be_bytes());
    nonce
}
