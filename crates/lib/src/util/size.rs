//! Human-readable byte sizes.
//!
//! Sizes use binary multiples: `1GiB`, `512m` and `512MB` all mean powers of 1024.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid size: {0:?}")]
pub struct SizeError(pub String);

const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Parse a size such as `1024`, `512m`, `1.5GiB` or `2 GB` into bytes.
pub fn parse_size(input: &str) -> Result<i64, SizeError> {
  let err = || SizeError(input.to_string());
  let trimmed = input.trim();

  let split = trimmed
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(trimmed.len());
  let (number, suffix) = trimmed.split_at(split);
  if number.is_empty() {
    return Err(err());
  }
  let number: f64 = number.parse().map_err(|_| err())?;

  let suffix = suffix.trim_start().to_ascii_lowercase();
  let unit = suffix.trim_end_matches('b').trim_end_matches('i');
  let shift = match unit {
    "" => 0,
    "k" => 10,
    "m" => 20,
    "g" => 30,
    "t" => 40,
    "p" => 50,
    _ => return Err(err()),
  };
  // Reject things like "5kbb" that trimming would otherwise accept.
  let expected_len = unit.len() + usize::from(suffix.contains('i')) + usize::from(suffix.ends_with('b'));
  if suffix.len() != expected_len {
    return Err(err());
  }

  Ok((number * (1u64 << shift) as f64) as i64)
}

/// Format a byte count using binary units, e.g. `1.5 MiB`.
pub fn human_size(bytes: u64) -> String {
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} {}", bytes, UNITS[0])
  } else {
    format!("{:.1} {}", value, UNITS[unit])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_plain_bytes() {
    assert_eq!(parse_size("1024").unwrap(), 1024);
  }

  #[test]
  fn parse_binary_suffixes() {
    assert_eq!(parse_size("1k").unwrap(), 1024);
    assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
    assert_eq!(parse_size("1GiB").unwrap(), 1 << 30);
    assert_eq!(parse_size("2 GB").unwrap(), 2 << 30);
    assert_eq!(parse_size("1.5g").unwrap(), 3 << 29);
  }

  #[test]
  fn parse_rejects_garbage() {
    assert!(parse_size("").is_err());
    assert!(parse_size("lots").is_err());
    assert!(parse_size("5x").is_err());
    assert!(parse_size("5kbb").is_err());
  }

  #[test]
  fn human_size_formats() {
    assert_eq!(human_size(500), "500 B");
    assert_eq!(human_size(1536), "1.5 KiB");
    assert_eq!(human_size(1 << 30), "1.0 GiB");
  }
}
