//! Key codec for encoding extracted key values to bytes.
//!
//! Primary keys and index entries are stored under a tagged,
//! length-prefixed encoding of the extracted JSON value. The encoding is
//! deterministic and prefix-free: no valid encoding is a proper prefix of
//! another, so an encoded key followed by a separator can be safely
//! prefix-scanned.

use crate::error::Error;
use serde_json::Value;

/// Type tag for encoded key values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyTag {
    Number = 1,
    String = 2,
    Array = 3,
}

/// Encode a key value to bytes.
///
/// Valid keys are numbers, strings, and arrays of valid keys (composite
/// keys extracted from an ordered field list). Anything else - null,
/// booleans, objects - is rejected, since such values cannot identify a
/// record unambiguously.
///
/// Format:
/// - Tag (1 byte)
/// - Number: f64 bits (8 bytes, big-endian); integral JSON numbers encode
///   identically to their float spelling
/// - String: length (4 bytes, little-endian) + UTF-8 bytes
/// - Array: element count (4 bytes, little-endian) + concatenated element
///   encodings
pub fn encode_key(value: &Value) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value)?;
    Ok(buf)
}

fn encode_into(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    match value {
        Value::Number(n) => {
            let float = n
                .as_f64()
                .ok_or_else(|| Error::InvalidKey(format!("number {n} is not representable")))?;
            buf.push(KeyTag::Number as u8);
            buf.extend_from_slice(&float.to_bits().to_be_bytes());
            Ok(())
        }
        Value::String(s) => {
            buf.push(KeyTag::String as u8);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        }
        Value::Array(items) => {
            buf.push(KeyTag::Array as u8);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(buf, item)?;
            }
            Ok(())
        }
        other => Err(Error::InvalidKey(format!(
            "{other} is not a valid key (expected number, string, or array)"
        ))),
    }
}
