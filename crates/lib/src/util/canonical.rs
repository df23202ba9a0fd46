//! Canonical JSON encoding.
//!
//! Digests over JSON documents (layer IDs, manifest IDs) are only stable if
//! every encoder produces the same bytes for the same value. Canonical form
//! here means: object keys sorted bytewise, no insignificant whitespace, and
//! serde_json's formatting for strings and numbers.

use serde::Serialize;
use serde_json::Value;

/// Encode `value` as canonical JSON.
pub fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
  let value = serde_json::to_value(value)?;
  let mut out = Vec::new();
  write_value(&mut out, &value)?;
  Ok(out)
}

/// Encode `value` as a canonical JSON string.
pub fn to_string<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
  let bytes = to_vec(value)?;
  // Only serde_json output and ASCII punctuation are written, so this is UTF-8.
  Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), serde_json::Error> {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

      out.push(b'{');
      for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(b',');
        }
        serde_json::to_writer(&mut *out, key)?;
        out.push(b':');
        write_value(out, value)?;
      }
      out.push(b'}');
    }
    Value::Array(items) => {
      out.push(b'[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(b',');
        }
        write_value(out, item)?;
      }
      out.push(b']');
    }
    scalar => serde_json::to_writer(&mut *out, scalar)?,
  }
  Ok(())
}
