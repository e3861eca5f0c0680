//! Bencode helpers: raw span scanning plus serde_bencode glue.
//!
//! Typed decoding goes through `serde_bencode`. The scanner exists for the
//! two places where exact byte positions matter: hashing the info
//! dictionary as it appeared on the wire, and splitting extension messages
//! whose bencoded header is followed by raw payload.

use std::ops::Range;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::super::TorrentError;

/// Nesting limit for scanned values.
const MAX_DEPTH: usize = 64;

fn malformed(reason: impl std::fmt::Display) -> TorrentError {
    TorrentError::invalid_metadata(format!("malformed bencode: {reason}"))
}

/// Returns the index one past the end of the value starting at `start`.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Truncated or malformed bencode
pub fn value_end(data: &[u8], start: usize) -> Result<usize, TorrentError> {
    let mut pos = start;
    let mut depth = 0usize;

    loop {
        let byte = *data
            .get(pos)
            .ok_or_else(|| malformed(format!("unexpected end of data at {pos}")))?;

        match byte {
            b'd' | b'l' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(malformed("nesting too deep"));
                }
                pos += 1;
                continue;
            }
            b'e' => {
                if depth == 0 {
                    return Err(malformed(format!("unexpected end marker at {pos}")));
                }
                depth -= 1;
                pos += 1;
            }
            b'i' => {
                let end = find_byte(data, pos + 1, b'e')?;
                let digits = &data[pos + 1..end];
                let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
                if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
                    return Err(malformed(format!("invalid integer at {pos}")));
                }
                pos = end + 1;
            }
            b'0'..=b'9' => {
                let (content, end) = string_span(data, pos)?;
                debug_assert!(content.end == end);
                pos = end;
            }
            other => {
                return Err(malformed(format!(
                    "unexpected byte 0x{other:02x} at {pos}"
                )));
            }
        }

        if depth == 0 {
            return Ok(pos);
        }
    }
}

/// Parses the byte string at `pos`, returning its content range and end.
fn string_span(data: &[u8], pos: usize) -> Result<(Range<usize>, usize), TorrentError> {
    let colon = find_byte(data, pos, b':')?;
    let length_digits = &data[pos..colon];
    if length_digits.is_empty() || !length_digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed(format!("invalid string length at {pos}")));
    }

    let length: usize = std::str::from_utf8(length_digits)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| malformed(format!("string length overflow at {pos}")))?;

    let content_start = colon + 1;
    let end = content_start
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| malformed(format!("string at {pos} runs past end of data")))?;

    Ok((content_start..end, end))
}

fn find_byte(data: &[u8], from: usize, needle: u8) -> Result<usize, TorrentError> {
    data.get(from..)
        .and_then(|rest| rest.iter().position(|byte| *byte == needle))
        .map(|offset| from + offset)
        .ok_or_else(|| malformed(format!("missing '{}' after {from}", needle as char)))
}

/// Locates the raw bytes of `key`'s value in a top-level dictionary.
///
/// Returns `Ok(None)` when the dictionary has no such key.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Data is not a well-formed dictionary
pub fn dict_value_span(data: &[u8], key: &[u8]) -> Result<Option<Range<usize>>, TorrentError> {
    if data.first() != Some(&b'd') {
        return Err(malformed("expected a dictionary"));
    }

    let mut pos = 1;
    loop {
        match data.get(pos) {
            Some(b'e') => return Ok(None),
            Some(b'0'..=b'9') => {}
            Some(other) => {
                return Err(malformed(format!(
                    "dictionary key must be a string, found 0x{other:02x}"
                )));
            }
            None => return Err(malformed("unterminated dictionary")),
        }

        let (key_range, value_start) = string_span(data, pos)?;
        let value_stop = value_end(data, value_start)?;
        if &data[key_range] == key {
            return Ok(Some(value_start..value_stop));
        }
        pos = value_stop;
    }
}

/// Decodes the first bencoded value in `data`, returning it with the number
/// of bytes it occupied. Trailing bytes are left for the caller.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Malformed value or wrong shape for `T`
pub fn decode_prefix<T: DeserializeOwned>(data: &[u8]) -> Result<(T, usize), TorrentError> {
    let end = value_end(data, 0)?;
    let value = decode(&data[..end])?;
    Ok((value, end))
}

/// Decodes a complete bencoded value.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Malformed value or wrong shape for `T`
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, TorrentError> {
    serde_bencode::from_bytes(data).map_err(malformed)
}

/// Encodes a value. Dictionary keys come out sorted as bencode requires.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Value has a shape bencode cannot express
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TorrentError> {
    serde_bencode::to_bytes(value)
        .map_err(|e| TorrentError::invalid_metadata(format!("cannot encode bencode: {e}")))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_value_end_nested() {
        let simple = b"d4:name4:teste";
        assert_eq!(value_end(simple, 0).unwrap(), simple.len());

        let nested = b"d4:infod4:name4:testee";
        assert_eq!(value_end(nested, 0).unwrap(), nested.len());

        let with_list = b"d4:listl4:itemi-3ee4:name4:teste";
        assert_eq!(value_end(with_list, 0).unwrap(), with_list.len());
    }

    #[test]
    fn test_value_end_stops_at_first_value() {
        let data = b"i42e4:rest";
        assert_eq!(value_end(data, 0).unwrap(), 4);
        assert_eq!(value_end(data, 4).unwrap(), data.len());
    }

    #[test]
    fn test_value_end_rejects_garbage() {
        assert!(value_end(b"d4:name", 0).is_err());
        assert!(value_end(b"i12x4e", 0).is_err());
        assert!(value_end(b"5:abc", 0).is_err());
        assert!(value_end(b"e", 0).is_err());
        assert!(value_end(b"x", 0).is_err());
        assert!(value_end(b"ie", 0).is_err());
    }

    #[test]
    fn test_dict_value_span_finds_raw_bytes() {
        let data = b"d8:announce3:url4:infod6:lengthi5eee";
        let span = dict_value_span(data, b"info").unwrap().unwrap();
        assert_eq!(&data[span], b"d6:lengthi5ee");

        assert!(dict_value_span(data, b"missing").unwrap().is_none());
        assert!(dict_value_span(b"l4:infoe", b"info").is_err());
    }

    #[test]
    fn test_decode_prefix_leaves_payload() {
        #[derive(Deserialize)]
        struct Header {
            msg_type: i64,
            piece: i64,
        }

        let data = b"d8:msg_typei1e5:piecei0eeRAWPAYLOAD";
        let (header, consumed): (Header, usize) = decode_prefix(data).unwrap();
        assert_eq!(header.msg_type, 1);
        assert_eq!(header.piece, 0);
        assert_eq!(&data[consumed..], b"RAWPAYLOAD");
    }

    #[test]
    fn test_encode_sorts_keys() {
        #[derive(Serialize)]
        struct Message {
            piece: i64,
            msg_type: i64,
        }

        let bytes = encode(&Message {
            piece: 2,
            msg_type: 0,
        })
        .unwrap();
        assert_eq!(bytes, b"d8:msg_typei0e5:piecei2ee");
    }

    fn arb_bencode() -> impl Strategy<Value = Vec<u8>> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(|n| format!("i{n}e").into_bytes()),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(|bytes| {
                let mut out = format!("{}:", bytes.len()).into_bytes();
                out.extend(bytes);
                out
            }),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(|items| {
                    let mut out = vec![b'l'];
                    items.into_iter().for_each(|item| out.extend(item));
                    out.push(b'e');
                    out
                }),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..6).prop_map(|entries| {
                    let mut out = vec![b'd'];
                    for (key, value) in entries {
                        out.extend(format!("{}:{key}", key.len()).into_bytes());
                        out.extend(value);
                    }
                    out.push(b'e');
                    out
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_value_end_spans_whole_value(value in arb_bencode(), trailer in proptest::collection::vec(any::<u8>(), 0..8)) {
            let mut data = value.clone();
            data.extend(&trailer);
            prop_assert_eq!(value_end(&data, 0).unwrap(), value.len());
        }

        #[test]
        fn prop_truncated_values_are_rejected(value in arb_bencode()) {
            prop_assume!(value.len() > 1);
            let truncated = &value[..value.len() - 1];
            prop_assert!(value_end(truncated, 0).is_err());
        }
    }
}
