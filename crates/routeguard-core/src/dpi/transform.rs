//! ClientHello transforms
//!
//! The transform rewrites the first flight so a middlebox that inspects
//! single segments, or single TLS records, never sees the whole SNI at once:
//!
//! - optional padding extension, growing the hello to a target size
//! - optional TLS record split, with the record boundary inside the hostname
//! - segmentation into small writes, with one boundary inside the hostname

use super::tls::{
    read_u24, write_u24, ClientHello, CONTENT_TYPE_HANDSHAKE, EXT_PADDING, HANDSHAKE_HEADER_LEN,
    MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN,
};
use crate::config::FragmentConfig;
use bytes::Bytes;
use rand::Rng;
use thiserror::Error;

/// Transform construction failure; the flow falls back to passthrough
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The hello carries no usable server name
    #[error("ClientHello has no server name")]
    NoServerName,

    /// The hello has no extensions block to extend
    #[error("ClientHello has no extensions block")]
    NoExtensions,

    /// An offset points outside the buffer
    #[error("ClientHello offsets exceed the buffer ({0} bytes)")]
    OutOfBounds(usize),

    /// Padding would overflow a single record
    #[error("padded ClientHello would be {0} bytes, above the record limit")]
    TooLarge(usize),

    /// Options cannot produce any segment
    #[error("invalid transform options: {0}")]
    InvalidOptions(&'static str),
}

/// Transform settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOptions {
    /// Maximum bytes per emitted segment
    pub segment_size: usize,
    /// Place one segment boundary inside the hostname
    pub split_at_sni: bool,
    /// Split the handshake into two TLS records
    pub split_records: bool,
    /// Pad the record payload up to this many bytes
    pub padding: Option<u16>,
    /// Randomize segment lengths in `1..=segment_size`
    pub jitter: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self::from(&FragmentConfig::default())
    }
}

impl From<&FragmentConfig> for TransformOptions {
    fn from(config: &FragmentConfig) -> Self {
        Self {
            segment_size: config.segment_size,
            split_at_sni: config.split_at_sni,
            split_records: config.split_records,
            padding: config.padding,
            jitter: config.jitter,
        }
    }
}

/// Build the segments that replace `buf`
///
/// `hello` must come from parsing `buf`. Bytes after the ClientHello record
/// are emitted unchanged as the last segment.
pub fn build_segments(
    buf: &[u8],
    hello: &ClientHello,
    opts: &TransformOptions,
) -> Result<Vec<Bytes>, TransformError> {
    if opts.segment_size == 0 {
        return Err(TransformError::InvalidOptions("segment_size is zero"));
    }
    let sni = hello
        .server_name
        .as_ref()
        .ok_or(TransformError::NoServerName)?;
    if hello.record_end > buf.len() || sni.offset + sni.len > hello.record_end || sni.len == 0 {
        return Err(TransformError::OutOfBounds(buf.len()));
    }

    let mut record = buf[..hello.record_end].to_vec();
    let trailer = &buf[hello.record_end..];

    if let Some(target) = opts.padding {
        pad(&mut record, hello, usize::from(target))?;
    }

    // Hostname midpoint, as an offset into the record
    let sni_mid = sni.offset + sni.len / 2;

    // With a record split the first record ends exactly at the midpoint,
    // so the cut offset is the same either way.
    let stream = if opts.split_records {
        split_record(&record, sni_mid)
    } else {
        record
    };
    let sni_cut = sni_mid;

    let cuts = cut_points(stream.len(), opts, opts.split_at_sni.then_some(sni_cut));
    let stream = Bytes::from(stream);
    let mut segments = Vec::with_capacity(cuts.len() + 2);
    let mut start = 0;
    for cut in cuts {
        segments.push(stream.slice(start..cut));
        start = cut;
    }
    segments.push(stream.slice(start..));
    if !trailer.is_empty() {
        segments.push(Bytes::copy_from_slice(trailer));
    }
    Ok(segments)
}

/// Append a padding extension and fix the three enclosing lengths
fn pad(record: &mut Vec<u8>, hello: &ClientHello, target: usize) -> Result<(), TransformError> {
    let ext_len_offset = hello
        .extensions_len_offset
        .ok_or(TransformError::NoExtensions)?;
    if hello.extensions_end != record.len() {
        return Err(TransformError::OutOfBounds(record.len()));
    }

    let payload = record.len() - RECORD_HEADER_LEN;
    // An extension costs 4 header bytes before any padding data
    if payload + 4 > target {
        return Ok(());
    }
    let fill = target - payload - 4;
    let grown = payload + 4 + fill;
    if grown > MAX_RECORD_PAYLOAD {
        return Err(TransformError::TooLarge(grown));
    }

    #[allow(clippy::cast_possible_truncation)]
    {
        record.extend_from_slice(&EXT_PADDING.to_be_bytes());
        record.extend_from_slice(&(fill as u16).to_be_bytes());
    }
    record.resize(record.len() + fill, 0);

    let added = 4 + fill;
    let ext_len = usize::from(u16::from_be_bytes([
        record[ext_len_offset],
        record[ext_len_offset + 1],
    ])) + added;
    let hs_len = read_u24(&record[RECORD_HEADER_LEN + 1..RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN]) + added;

    #[allow(clippy::cast_possible_truncation)]
    {
        record[ext_len_offset..ext_len_offset + 2].copy_from_slice(&(ext_len as u16).to_be_bytes());
        record[3..5].copy_from_slice(&(grown as u16).to_be_bytes());
    }
    write_u24(
        &mut record[RECORD_HEADER_LEN + 1..RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN],
        hs_len,
    );
    Ok(())
}

/// Re-frame one record as two, splitting the payload at `at`
///
/// The first record ends at `at`; the second starts with a fresh header.
fn split_record(record: &[u8], at: usize) -> Vec<u8> {
    let payload = &record[RECORD_HEADER_LEN..];
    let first = at - RECORD_HEADER_LEN;
    let (a, b) = payload.split_at(first);

    let mut out = Vec::with_capacity(record.len() + RECORD_HEADER_LEN);
    for part in [a, b] {
        out.push(CONTENT_TYPE_HANDSHAKE);
        out.extend_from_slice(&record[1..3]);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(part.len() as u16).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Sorted, deduplicated cut offsets strictly inside `0..len`
fn cut_points(len: usize, opts: &TransformOptions, sni_cut: Option<usize>) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut rng = rand::thread_rng();
    let mut pos = 0;
    loop {
        let step = if opts.jitter {
            rng.gen_range(1..=opts.segment_size)
        } else {
            opts.segment_size
        };
        pos += step;
        if pos >= len {
            break;
        }
        cuts.push(pos);
    }
    if let Some(cut) = sni_cut.filter(|&c| c > 0 && c < len) {
        cuts.push(cut);
    }
    cuts.sort_unstable();
    cuts.dedup();
    cuts
}
