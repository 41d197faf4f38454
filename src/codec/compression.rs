//! Payload compression for the realtime transport.
//!
//! Outbound payloads are zlib-compressed. Inbound payloads are usually zlib as
//! well, but some topics deliver gzip or plain bytes depending on broker
//! version, so [`decompress`] tries each encoding in turn and falls back to
//! the raw input.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::{Compression, Decompress, FlushDecompress, Status, read::GzDecoder, write::ZlibEncoder};

/// Upper bound on the size of an inflated payload (16 MiB).
pub const MAX_INFLATED_LEN: u64 = 16 * 1024 * 1024;

/// Encoding detected on an inbound payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// zlib stream (RFC 1950).
    Zlib,
    /// gzip member (RFC 1952).
    Gzip,
    /// Not compressed.
    Raw,
}

/// Result of [`decompress`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decompressed {
    /// Inflated (or original) bytes.
    pub bytes: Bytes,
    /// Encoding that succeeded.
    pub encoding: PayloadEncoding,
}

/// Compress `payload` with zlib at the default level.
///
/// # Errors
///
/// Returns an [`io::Error`] if the encoder fails to write.
///
/// # Examples
///
/// ```
/// use mqttot::codec::compression::{PayloadEncoding, compress, decompress};
///
/// let packed = compress(br#"{"action":"send_item"}"#).expect("compress");
/// let unpacked = decompress(packed.into());
/// assert_eq!(unpacked.encoding, PayloadEncoding::Zlib);
/// assert_eq!(&unpacked.bytes[..], br#"{"action":"send_item"}"#);
/// ```
pub fn compress(payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2 + 16), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Inflate `payload`, tolerating gzip or uncompressed input.
///
/// This never fails: input that is neither zlib nor gzip is returned as-is
/// with [`PayloadEncoding::Raw`].
#[must_use]
pub fn decompress(payload: Bytes) -> Decompressed {
    if looks_like_zlib(&payload) {
        if let Ok(bytes) = inflate_zlib(&payload) {
            return Decompressed {
                bytes,
                encoding: PayloadEncoding::Zlib,
            };
        }
    }
    if payload.starts_with(&[0x1f, 0x8b]) {
        if let Ok(bytes) = inflate(GzDecoder::new(&payload[..])) {
            return Decompressed {
                bytes,
                encoding: PayloadEncoding::Gzip,
            };
        }
    }
    Decompressed {
        bytes: payload,
        encoding: PayloadEncoding::Raw,
    }
}

/// A zlib header is a CMF byte with method 8 followed by an FLG byte making
/// the pair a multiple of 31.
fn looks_like_zlib(payload: &[u8]) -> bool {
    match payload {
        [cmf, flg, ..] => cmf & 0x0F == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

/// Inflate a complete zlib stream. Truncated streams are rejected rather than
/// returning the partial output.
fn inflate_zlib(payload: &[u8]) -> io::Result<Bytes> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(payload.len().saturating_mul(4).max(64));
    loop {
        let consumed = usize::try_from(inflater.total_in())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "zlib input overflow"))?;
        let status = inflater
            .decompress_vec(&payload[consumed..], &mut out, FlushDecompress::Finish)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match status {
            Status::StreamEnd => return Ok(Bytes::from(out)),
            Status::Ok | Status::BufError if out.len() == out.capacity() => {
                if out.len() as u64 >= MAX_INFLATED_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "inflated payload exceeds limit",
                    ));
                }
                out.reserve(out.len());
            }
            Status::Ok | Status::BufError => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated zlib stream",
                ));
            }
        }
    }
}

fn inflate(decoder: impl Read) -> io::Result<Bytes> {
    let mut out = Vec::new();
    let read = decoder.take(MAX_INFLATED_LEN + 1).read_to_end(&mut out)?;
    if read as u64 > MAX_INFLATED_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "inflated payload exceeds limit",
        ));
    }
    Ok(Bytes::from(out))
}
