//! Binary pane-output frames.
//!
//! Wire format: `[1-byte pane ID length][pane ID, UTF-8][raw pane data]`
//!
//! The length byte caps pane IDs at 255 bytes. Longer IDs are truncated on
//! encode to the longest prefix of at most 255 bytes that ends on a UTF-8
//! character boundary. For ASCII IDs that is exactly the first 255 bytes; an
//! ID with a multi-byte character straddling byte 255 is cut up to three
//! bytes shorter. Two IDs sharing the kept prefix collide on the wire.

/// Longest pane ID representable in a frame header.
pub const MAX_PANE_ID_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame declares a {declared}-byte pane ID but only {available} bytes follow")]
    Truncated { declared: usize, available: usize },

    #[error("pane ID is not valid UTF-8")]
    InvalidPaneId,
}

/// A decoded frame borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub pane_id: &'a str,
    pub data: &'a [u8],
}

/// The bytes of `pane_id` that fit in a frame header.
///
/// Truncation counts bytes, not characters, so a cut may split a multi-byte
/// character; the cut is backed off to the nearest character boundary to
/// keep the header valid UTF-8.
pub fn wire_pane_id(pane_id: &str) -> &str {
    if pane_id.len() <= MAX_PANE_ID_LEN {
        return pane_id;
    }
    let mut end = MAX_PANE_ID_LEN;
    while !pane_id.is_char_boundary(end) {
        end -= 1;
    }
    &pane_id[..end]
}

/// Encode one pane output chunk.
pub fn encode_frame(pane_id: &str, data: &[u8]) -> Vec<u8> {
    let id = wire_pane_id(pane_id).as_bytes();
    let mut frame = Vec::with_capacity(1 + id.len() + data.len());
    // wire_pane_id guarantees the length fits in a byte.
    frame.push(id.len() as u8);
    frame.extend_from_slice(id);
    frame.extend_from_slice(data);
    frame
}

/// Decode a frame, validating the declared ID length against what follows.
pub fn decode_frame(frame: &[u8]) -> Result<Frame<'_>, FrameError> {
    let (&len, rest) = frame.split_first().ok_or(FrameError::Empty)?;
    let len = len as usize;
    if len > rest.len() {
        return Err(FrameError::Truncated {
            declared: len,
            available: rest.len(),
        });
    }
    let (id, data) = rest.split_at(len);
    let pane_id = std::str::from_utf8(id).map_err(|_| FrameError::InvalidPaneId)?;
    Ok(Frame { pane_id, data })
}
