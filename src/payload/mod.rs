//! Dump-payload envelope — the self-describing, checksummed value encoding.
//!
//! Every value the freezer stores is wrapped in a small binary envelope so
//! that a payload read back from disk can be validated before it is trusted:
//!
//! ```text
//! [MAGIC "DMP1"][VERSION u32 LE][BODY_LEN u32 LE][BODY][CRC32 LE]
//! ```
//!
//! The CRC32 is computed over everything preceding it (magic, version,
//! length, body). [`decode`] verifies the checksum and returns the body;
//! callers on the read path treat any failure as a cache miss — a corrupt
//! freezer value must never surface a stale or garbled byte string to a
//! client.
//!
//! The layout is fixed, so the envelope is read and written with plain
//! offset arithmetic; there is no general serialization layer behind it.
//! The body is an opaque byte sequence supplied by whatever object codec
//! sits above this crate.


use crc32fast::Hasher as Crc32;
use thiserror::Error;

/// Magic constant identifying a dump-payload envelope.
pub const PAYLOAD_MAGIC: [u8; 4] = *b"DMP1";

/// Current envelope format version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Fixed overhead added around a body: magic + version + length + crc.
pub const PAYLOAD_OVERHEAD: usize = 4 + 4 + 4 + 4;

/// Offset of the body length field (magic and version precede it).
const LEN_AT: usize = 8;

/// Offset of the first body byte.
const BODY_AT: usize = 12;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when an envelope fails validation.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The buffer does not start with [`PAYLOAD_MAGIC`].
    #[error("bad payload magic")]
    BadMagic,

    /// The envelope was written by an unknown format version.
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u32),

    /// The stored CRC32 does not match the recomputed one.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    /// The buffer ended before the envelope was complete.
    #[error("truncated payload")]
    Truncated,

    /// The body cannot be represented by the u32 length field.
    #[error("payload body too large ({0} bytes)")]
    TooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// Encode / decode
// ------------------------------------------------------------------------------------------------

/// Wrap `body` in a dump-payload envelope.
pub fn encode(body: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let body_len = u32::try_from(body.len()).map_err(|_| PayloadError::TooLarge(body.len()))?;

    let mut buf = Vec::with_capacity(body.len() + PAYLOAD_OVERHEAD);
    buf.extend_from_slice(&PAYLOAD_MAGIC);
    buf.extend_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(body);

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Validate an envelope and return its body.
///
/// Framing is checked before the checksum, so a buffer cut short reports
/// [`PayloadError::Truncated`] rather than a checksum mismatch.
pub fn decode(buf: &[u8]) -> Result<Vec<u8>, PayloadError> {
    if buf.len() < PAYLOAD_OVERHEAD {
        return Err(PayloadError::Truncated);
    }
    if buf[..4] != PAYLOAD_MAGIC {
        return Err(PayloadError::BadMagic);
    }

    let version = field_u32(buf, 4);
    if version != PAYLOAD_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }

    let body_len = field_u32(buf, LEN_AT) as usize;
    let Some(crc_at) = BODY_AT.checked_add(body_len) else {
        return Err(PayloadError::Truncated);
    };
    let Some(total) = crc_at.checked_add(4) else {
        return Err(PayloadError::Truncated);
    };
    if buf.len() < total {
        return Err(PayloadError::Truncated);
    }

    let stored_crc = field_u32(buf, crc_at);
    let mut hasher = Crc32::new();
    hasher.update(&buf[..crc_at]);
    if hasher.finalize() != stored_crc {
        return Err(PayloadError::ChecksumMismatch);
    }

    Ok(buf[BODY_AT..crc_at].to_vec())
}

/// Read the little-endian u32 at `at`. Callers bounds-check first.
fn field_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}
