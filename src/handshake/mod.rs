pub mod handshake_header;

pub use handshake_header::{HandshakeHeader, HandshakeType, HANDSHAKE_HEADER_LENGTH};
