//! Frame layout for hive control messages
//!
//! ```text
//! [ magic 4B ][ type u16 BE ][ JSON body ... ]
//! ```
//!
//! The magic tag keeps the overlay's traffic distinguishable from every other
//! consumer of the host node's custom-message channel: a frame that does not
//! start with it is handed back to the host untouched. Type numbers are odd
//! so hosts following the it's-ok-to-be-odd convention never disconnect a
//! peer over a type they do not know.

use super::limits::json_depth_ok;
use crate::error::{HiveError, Result};

/// `HIVE` in ASCII.
pub const WIRE_MAGIC: [u8; 4] = [0x48, 0x49, 0x56, 0x45];

/// Hard cap on a whole frame, enforced before any decoding.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum JSON nesting depth, enforced by a byte scan before parsing.
pub const MAX_JSON_DEPTH: usize = 16;

const HEADER_LEN: usize = WIRE_MAGIC.len() + 2;

/// True iff the buffer starts with the hive magic tag. The dispatcher's first
/// test on any custom-message event.
pub fn has_magic(buf: &[u8]) -> bool {
    buf.len() >= WIRE_MAGIC.len() && buf[..WIRE_MAGIC.len()] == WIRE_MAGIC
}

/// Split a magic-verified frame into its type number and body bytes.
///
/// Size and depth gates run here, before the body reaches a parser.
pub fn split_frame(buf: &[u8]) -> Result<(u16, &[u8])> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(HiveError::RateLimited("oversize frame"));
    }
    if !has_magic(buf) {
        return Err(HiveError::Invariant("split_frame on non-magic buffer".into()));
    }
    if buf.len() < HEADER_LEN {
        return Err(HiveError::Malformed("truncated frame header".into()));
    }
    let msg_type = u16::from_be_bytes([buf[4], buf[5]]);
    let body = &buf[HEADER_LEN..];
    if !json_depth_ok(body, MAX_JSON_DEPTH) {
        return Err(HiveError::Malformed("body nesting too deep".into()));
    }
    Ok((msg_type, body))
}

/// Wrap an encoded body into a full frame.
pub fn seal_frame(msg_type: u16, body: &[u8]) -> Result<Vec<u8>> {
    if HEADER_LEN + body.len() > MAX_FRAME_SIZE {
        return Err(HiveError::Invariant(format!(
            "outbound frame type {msg_type:#06x} would be {} bytes",
            HEADER_LEN + body.len()
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&WIRE_MAGIC);
    frame.extend_from_slice(&msg_type.to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}
