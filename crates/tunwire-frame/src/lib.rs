//! Length-prefixed message framing for the tunnel protocol.
//!
//! Every message on the wire is:
//! - A 4-byte big-endian payload length
//! - Exactly that many payload bytes
//!
//! There is no magic number and no channel id; the handshake line that
//! precedes the first frame is what keeps the two peers in sync.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_length, encode, encode_frame, FrameConfig, LENGTH_PREFIX_SIZE,
    MAX_FRAME_LEN,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
