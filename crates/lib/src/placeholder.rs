//! Template interpolation for layer environment values.
//!
//! Environment values may reference build-wide values that are only known
//! once the manifest is loaded, such as the TUF repository URL.
//!
//! # Placeholder Format
//!
//! - `{{ .Name }}` - the value registered under `Name`
//!
//! Whitespace inside the braces is optional, so `{{.Name}}` works too.
//! Everything outside `{{ ... }}` passes through unchanged, including shell
//! variables like `$PATH`.
//!
//! # Example
//!
//! ```
//! use flynn_builder_lib::placeholder::{parse, Segment};
//!
//! let segments = parse("{{ .TUFRepository }}/targets").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder("TUFRepository".to_string()),
//!     Segment::Literal("/targets".to_string()),
//! ]);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A reference to a named value
  Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved placeholder: {0}")]
  Unresolved(String),
}

/// Trait for resolving placeholder values.
pub trait Resolver {
  fn resolve(&self, name: &str) -> Result<&str, PlaceholderError>;
}

impl Resolver for BTreeMap<String, String> {
  fn resolve(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::Unresolved(name.to_string()))
  }
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a `{{` is never closed or its content is not `.Name`.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut rest = input;
  let mut offset = 0;

  while let Some(start) = rest.find("{{") {
    if start > 0 {
      segments.push(Segment::Literal(rest[..start].to_string()));
    }

    let after_open = &rest[start + 2..];
    let end = after_open.find("}}").ok_or(PlaceholderError::Unclosed(offset + start))?;
    let content = after_open[..end].trim();
    segments.push(Segment::Placeholder(parse_placeholder_content(content)?));

    let consumed = start + 2 + end + 2;
    rest = &rest[consumed..];
    offset += consumed;
  }

  if !rest.is_empty() {
    segments.push(Segment::Literal(rest.to_string()));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<String, PlaceholderError> {
  let name = content
    .strip_prefix('.')
    .ok_or_else(|| PlaceholderError::Malformed(format!("expected '.Name', got '{content}'")))?;

  let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if !valid {
    return Err(PlaceholderError::Malformed(format!("invalid name '{name}'")));
  }
  Ok(name.to_string())
}

/// Substitute all placeholders in a string using the provided resolver.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(name) => result.push_str(resolver.resolve(name)?),
    }
  }

  Ok(result)
}
