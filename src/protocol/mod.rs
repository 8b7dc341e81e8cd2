//! Legacy WebSocket wire protocol (Hixie-75/76).

pub mod frame;
pub mod handshake;

pub use frame::{CLOSE_FRAME, Decoded, FrameDecoder, Frames, decode, encode, encode_into};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, ProtocolVersion, compute_digest, key_number,
};
