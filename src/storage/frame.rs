//! History log frame format: length-prefixed, checksummed records
//!
//! ```text
//! +-----------+-------------+--------------------------------------------------+
//! | len (u32) | crc32 (u32) | body (len bytes)                                 |
//! +-----------+-------------+--------------------------------------------------+
//! body = timestamp (i64) | key_len (u32) | key | value_len (u32) | value
//! ```
//!
//! All integers are little-endian. Keys and values may contain any bytes,
//! including newlines and tabs, since every field is length-prefixed.

use crate::core::record::Record;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `len` + `crc32` prefix
pub const FRAME_HEADER_LEN: usize = 8;

/// Smallest valid body: timestamp plus two empty length-prefixed strings
pub const MIN_BODY_LEN: usize = 8 + 4 + 4;

/// Largest body a frame may announce (256 MiB)
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Result of decoding the frame at the start of a byte window
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A valid record spanning `frame_len` bytes
    Complete { record: Record, frame_len: usize },
    /// Not enough bytes for the announced frame: a torn trailing write
    Incomplete,
    /// The frame is fully present but its content is bad; skip `frame_len` bytes
    Corrupt { frame_len: usize, reason: String },
}

/// Encode a record into a single frame
pub fn encode(record: &Record) -> Result<Bytes> {
    let key = record.key.as_bytes();
    let body_len = MIN_BODY_LEN + key.len() + record.value.len();
    if body_len > MAX_FRAME_LEN {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("record of {body_len} bytes exceeds frame limit of {MAX_FRAME_LEN}"),
        )));
    }

    let mut body = BytesMut::with_capacity(body_len);
    body.put_i64_le(record.timestamp.as_secs());
    body.put_u32_le(key.len() as u32);
    body.put_slice(key);
    body.put_u32_le(record.value.len() as u32);
    body.put_slice(&record.value);
    debug_assert_eq!(body.len(), body_len);

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body_len);
    frame.put_u32_le(body_len as u32);
    frame.put_u32_le(crc32fast::hash(&body));
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode the frame at the start of `buf`
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < FRAME_HEADER_LEN {
        return Decoded::Incomplete;
    }

    let mut header = &buf[..FRAME_HEADER_LEN];
    let body_len = header.get_u32_le() as usize;
    let checksum = header.get_u32_le();

    // A length this large cannot be trusted to find the next frame.
    if body_len > MAX_FRAME_LEN {
        return Decoded::Incomplete;
    }

    let frame_len = FRAME_HEADER_LEN + body_len;
    if buf.len() < frame_len {
        return Decoded::Incomplete;
    }

    let body = &buf[FRAME_HEADER_LEN..frame_len];
    let actual = crc32fast::hash(body);
    if actual != checksum {
        return Decoded::Corrupt {
            frame_len,
            reason: format!("checksum mismatch: expected {checksum:#010x}, got {actual:#010x}"),
        };
    }

    match decode_body(body) {
        Ok(record) => Decoded::Complete { record, frame_len },
        Err(reason) => Decoded::Corrupt { frame_len, reason },
    }
}

/// Whether the lengths at the start of `buf` are consistent with a whole
/// frame. Does not verify the checksum.
pub fn could_start_frame(buf: &[u8]) -> bool {
    if buf.len() < FRAME_HEADER_LEN + MIN_BODY_LEN {
        return false;
    }
    let body_len = (&buf[..4]).get_u32_le() as usize;
    if !(MIN_BODY_LEN..=MAX_FRAME_LEN).contains(&body_len) || FRAME_HEADER_LEN + body_len > buf.len() {
        return false;
    }

    let key_len = (&buf[16..20]).get_u32_le() as usize;
    if key_len > body_len - MIN_BODY_LEN {
        return false;
    }
    let value_at = 20 + key_len;
    let value_len = (&buf[value_at..value_at + 4]).get_u32_le() as usize;
    MIN_BODY_LEN + key_len + value_len == body_len
}

fn decode_body(mut body: &[u8]) -> std::result::Result<Record, String> {
    if body.len() < MIN_BODY_LEN {
        return Err(format!("body of {} bytes is too short", body.len()));
    }

    let timestamp = Timestamp::from_secs(body.get_i64_le());

    let key_len = body.get_u32_le() as usize;
    if body.remaining() < key_len + 4 {
        return Err(format!("key length {key_len} overruns frame"));
    }
    let key = String::from_utf8(body[..key_len].to_vec())
        .map_err(|e| format!("key is not valid UTF-8: {e}"))?;
    body.advance(key_len);

    let value_len = body.get_u32_le() as usize;
    if body.remaining() != value_len {
        return Err(format!(
            "value length {value_len} does not match remaining {} bytes",
            body.remaining()
        ));
    }
    let value = body.to_vec();

    Ok(Record {
        timestamp,
        key,
        value,
    })
}
