//! Block compression for record payloads, used opportunistically by
//! [`crate::Segment::offer`] and reversed by `poll`/`parse_and_truncate`.
use crate::{Error, Result};

const ZSTD_LEVEL: i32 = 3;

pub fn compress(payload: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(payload, ZSTD_LEVEL)
        .map_err(|e| Error::Corrupt(format!("zstd compress: {e}")))
}

/// Zstd frames carry their own content size, so the caller never needs to
/// know the uncompressed length up front -- it falls out of decoding.
pub fn decompress(stored: &[u8]) -> Result<Vec<u8>> {
    let mut out = zstd::stream::decode_all(stored)
        .map_err(|e| Error::Corrupt(format!("zstd decompress: {e}")))?;
    out.shrink_to_fit();
    Ok(out)
}
