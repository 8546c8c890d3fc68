//! Wire format: the upgrade handshake and the framing that follows it.
//!
//! Both halves are stateless apart from the incremental [`FrameDecoder`];
//! connection state lives in the server.

pub mod frame;
pub mod handshake;

pub use frame::{encode, Frame, FrameDecoder, CLOSE_MARKER};
pub use handshake::{challenge_response, key_part, HandshakeRequest, Location};
