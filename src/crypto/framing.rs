//! Byte framing around cipher output.
//!
//! ```text
//! manager output:    '#' b64(data key id) '#' <algorithm-framed payload>
//! algorithm-framed:  '*' b64(algorithm id) '*' <cipher suite output>
//! ```
//!
//! Both identifiers use the standard base64 alphabet without padding, which
//! never contains either delimiter.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use nom::{
    IResult,
    bytes::complete::{tag, take_until},
    sequence::delimited,
};

pub const ALGORITHM_DELIMITER: u8 = b'*';
pub const DATA_KEY_ID_DELIMITER: u8 = b'#';

fn frame(delimiter: u8, input: &[u8]) -> IResult<&[u8], &[u8]> {
    let d = [delimiter];
    delimited(tag(&d[..]), take_until(&d[..]), tag(&d[..]))(input)
}

fn wrap(delimiter: u8, id: &str, payload: &[u8]) -> Vec<u8> {
    let encoded = STANDARD_NO_PAD.encode(id);
    let mut out = Vec::with_capacity(encoded.len() + 2 + payload.len());
    out.push(delimiter);
    out.extend_from_slice(encoded.as_bytes());
    out.push(delimiter);
    out.extend_from_slice(payload);
    out
}

/// Outcome of looking for a leading `<d> id <d>` frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Decoded identifier and the bytes following the frame.
    Framed(String, &'a [u8]),
    /// A complete frame whose content is not base64-encoded UTF-8.
    Malformed,
    /// No opening delimiter, or no closing one.
    Absent,
}

fn unwrap(delimiter: u8, input: &[u8]) -> Frame<'_> {
    let Ok((rest, encoded)) = frame(delimiter, input) else {
        return Frame::Absent;
    };
    match STANDARD_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
    {
        Some(id) => Frame::Framed(id, rest),
        None => Frame::Malformed,
    }
}

pub fn tag_algorithm(algorithm: &str, payload: &[u8]) -> Vec<u8> {
    wrap(ALGORITHM_DELIMITER, algorithm, payload)
}

/// Splits off the algorithm tag. `Frame::Absent` means the payload is
/// untagged and must be treated as legacy output.
pub fn split_algorithm(payload: &[u8]) -> Frame<'_> {
    unwrap(ALGORITHM_DELIMITER, payload)
}

pub fn embed_data_key_id(id: &str, payload: &[u8]) -> Vec<u8> {
    wrap(DATA_KEY_ID_DELIMITER, id, payload)
}

/// Splits off the data key id, or `None` if the payload carries none.
pub fn split_data_key_id(payload: &[u8]) -> Option<(String, &[u8])> {
    match unwrap(DATA_KEY_ID_DELIMITER, payload) {
        Frame::Framed(id, rest) if !id.is_empty() => Some((id, rest)),
        _ => None,
    }
}
