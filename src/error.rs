use std::io;

use thiserror::Error;

use crate::transport::Dependencies;

pub type Result<T> = std::result::Result<T, Error>;

/// The alert value recorded when a fatal alert terminates the connection,
/// either because we sent one or because the peer did.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AlertDetail {
    pub level: u8,
    pub description: u8,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Non-fatal backpressure: retry once one of `Dependencies` fires.
    #[error("would block on {0:?}")]
    WouldBlock(Dependencies),

    #[error("record framing or AEAD authentication failed")]
    ErrInvalidRecord,
    #[error("record sequence number {seq} outside replay window (hi={hi})")]
    ErrReplayed { seq: u64, hi: u64 },
    #[error("epoch {0} is not registered")]
    ErrUnknownEpoch(u64),
    #[error("change_cipher_spec body must be exactly one byte of value 1")]
    ErrInvalidCipherSpec,
    #[error("alert body must be exactly two bytes")]
    ErrInvalidAlert,
    #[error("fragment [{offset}, {offset_plus_len}) overflows declared total length {total_len}")]
    ErrFragmentOverflow {
        offset: u32,
        offset_plus_len: u32,
        total_len: u32,
    },
    #[error("fragments of handshake sequence {seq} disagree on total length")]
    ErrFragmentLengthMismatch { seq: u16 },
    #[error("overlapping fragment bytes disagree for handshake sequence {seq}")]
    ErrFragmentByteMismatch { seq: u16 },
    #[error("invalid padding")]
    ErrInvalidPadding,
    #[error("bad input: {0}")]
    ErrBadInput(&'static str),
    #[error("a reader or writer handle is already outstanding on this context")]
    ErrHandleOutstanding,
    #[error("message length was not declared; cannot fragment or pause")]
    ErrLengthUnknown,
    #[error("retransmission timeout exhausted without progress")]
    ErrRetransmitExhausted,
    #[error("fatal alert sent: level={}, description={}", .0.level, .0.description)]
    ErrAlertSent(AlertDetail),
    #[error("fatal alert received: level={}, description={}", .0.level, .0.description)]
    ErrAlertReceived(AlertDetail),
    #[error("invalid state machine transition")]
    ErrInvalidFsmTransition,
    #[error("connection is blocked: {0}")]
    ErrBlocked(String),
    #[error("internal invariant violated: {0}")]
    ErrInternal(&'static str),

    #[error("{0}")]
    Io(#[from] IoError),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl Error {
    pub(crate) fn want_read() -> Error {
        Error::WouldBlock(Dependencies::READABLE)
    }

    pub(crate) fn want_write() -> Error {
        Error::WouldBlock(Dependencies::WRITABLE)
    }

    /// Whether this failure is one the MPS must record as terminal
    /// blocking info on the context (every failure except `WouldBlock`).
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, Error::WouldBlock(_))
    }
}
