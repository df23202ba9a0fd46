//! Go build constraints.
//!
//! Decides whether a Go source file takes part in a build for a given
//! target platform. Three mechanisms are honored:
//! - `//go:build` expressions (`linux && (amd64 || arm64) && !cgo`)
//! - legacy `// +build` lines (space = OR, comma = AND, `!` = NOT)
//! - `_GOOS`, `_GOARCH` and `_GOOS_GOARCH` file name suffixes

use thiserror::Error;

const KNOWN_OS: &[&str] = &[
  "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js", "linux", "nacl", "netbsd",
  "openbsd", "plan9", "solaris", "wasip1", "windows", "zos",
];

const KNOWN_ARCH: &[&str] = &[
  "386",
  "amd64",
  "amd64p32",
  "arm",
  "armbe",
  "arm64",
  "arm64be",
  "loong64",
  "mips",
  "mipsle",
  "mips64",
  "mips64le",
  "mips64p32",
  "mips64p32le",
  "ppc",
  "ppc64",
  "ppc64le",
  "riscv",
  "riscv64",
  "s390",
  "s390x",
  "sparc",
  "sparc64",
  "wasm",
];

const UNIX_OS: &[&str] = &[
  "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "linux", "netbsd", "openbsd", "solaris",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid build constraint {expr:?}: {message}")]
pub struct ConstraintError {
  pub expr: String,
  pub message: String,
}

/// Target platform a Go package is evaluated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildContext {
  pub goos: String,
  pub goarch: String,
  pub cgo: bool,
}

impl BuildContext {
  pub fn new(goos: &str, goarch: &str, cgo: bool) -> Self {
    Self {
      goos: goos.to_string(),
      goarch: goarch.to_string(),
      cgo,
    }
  }

  /// Whether a single build tag is satisfied.
  pub fn matches_tag(&self, tag: &str) -> bool {
    if tag == self.goos || tag == self.goarch || tag == "gc" {
      return true;
    }
    if tag == "cgo" {
      return self.cgo;
    }
    if tag == "unix" {
      return UNIX_OS.contains(&self.goos.as_str());
    }
    // Release tags: every go1.N is satisfied by a current toolchain.
    if let Some(minor) = tag.strip_prefix("go1.") {
      return minor.parse::<u32>().is_ok();
    }
    matches!(
      (self.goos.as_str(), tag),
      ("android", "linux") | ("illumos", "solaris") | ("ios", "darwin")
    )
  }

  /// Whether the `_GOOS`/`_GOARCH` suffixes of a file name allow it.
  pub fn matches_file_name(&self, file_name: &str) -> bool {
    let stem = file_name.split_once('.').map(|(stem, _)| stem).unwrap_or(file_name);
    let stem = stem.strip_suffix("_test").unwrap_or(stem);
    let Some(idx) = stem.find('_') else {
      return true;
    };
    let parts: Vec<&str> = stem[idx..].split('_').collect();
    let n = parts.len();

    if n >= 2 && KNOWN_OS.contains(&parts[n - 2]) && KNOWN_ARCH.contains(&parts[n - 1]) {
      return self.matches_tag(parts[n - 2]) && self.matches_tag(parts[n - 1]);
    }
    if KNOWN_OS.contains(&parts[n - 1]) || KNOWN_ARCH.contains(&parts[n - 1]) {
      return self.matches_tag(parts[n - 1]);
    }
    true
  }

  /// Evaluate a `//go:build` expression.
  pub fn eval_go_build(&self, expr: &str) -> Result<bool, ConstraintError> {
    let tokens = tokenize(expr)?;
    let mut parser = ExprParser {
      tokens: &tokens,
      pos: 0,
      ctx: self,
      expr,
    };
    let value = parser.or()?;
    if parser.pos != tokens.len() {
      return Err(parser.error("unexpected token"));
    }
    Ok(value)
  }

  /// Evaluate the options of one `// +build` line.
  pub fn eval_plus_build(&self, line: &str) -> bool {
    line.split_whitespace().any(|option| {
      option.split(',').all(|term| match term.strip_prefix('!') {
        Some(tag) => !tag.is_empty() && !self.matches_tag(tag),
        None => !term.is_empty() && self.matches_tag(term),
      })
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
  Tag(&'a str),
  Not,
  And,
  Or,
  LParen,
  RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token<'_>>, ConstraintError> {
  let mut tokens = Vec::new();
  let bytes = expr.as_bytes();
  let mut i = 0;

  while i < bytes.len() {
    let c = bytes[i];
    match c {
      b' ' | b'\t' => i += 1,
      b'!' => {
        tokens.push(Token::Not);
        i += 1;
      }
      b'(' => {
        tokens.push(Token::LParen);
        i += 1;
      }
      b')' => {
        tokens.push(Token::RParen);
        i += 1;
      }
      b'&' if bytes.get(i + 1) == Some(&b'&') => {
        tokens.push(Token::And);
        i += 2;
      }
      b'|' if bytes.get(i + 1) == Some(&b'|') => {
        tokens.push(Token::Or);
        i += 2;
      }
      c if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' => {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.') {
          i += 1;
        }
        tokens.push(Token::Tag(&expr[start..i]));
      }
      _ => {
        return Err(ConstraintError {
          expr: expr.to_string(),
          message: format!("unexpected character {:?}", c as char),
        });
      }
    }
  }
  Ok(tokens)
}

struct ExprParser<'a, 'b> {
  tokens: &'b [Token<'a>],
  pos: usize,
  ctx: &'b BuildContext,
  expr: &'b str,
}

impl ExprParser<'_, '_> {
  fn error(&self, message: &str) -> ConstraintError {
    ConstraintError {
      expr: self.expr.to_string(),
      message: message.to_string(),
    }
  }

  fn or(&mut self) -> Result<bool, ConstraintError> {
    let mut value = self.and()?;
    while self.tokens.get(self.pos) == Some(&Token::Or) {
      self.pos += 1;
      let rhs = self.and()?;
      value = value || rhs;
    }
    Ok(value)
  }

  fn and(&mut self) -> Result<bool, ConstraintError> {
    let mut value = self.not()?;
    while self.tokens.get(self.pos) == Some(&Token::And) {
      self.pos += 1;
      let rhs = self.not()?;
      value = value && rhs;
    }
    Ok(value)
  }

  fn not(&mut self) -> Result<bool, ConstraintError> {
    match self.tokens.get(self.pos) {
      Some(Token::Not) => {
        self.pos += 1;
        Ok(!self.not()?)
      }
      Some(Token::LParen) => {
        self.pos += 1;
        let value = self.or()?;
        if self.tokens.get(self.pos) != Some(&Token::RParen) {
          return Err(self.error("missing )"));
        }
        self.pos += 1;
        Ok(value)
      }
      Some(Token::Tag(tag)) => {
        self.pos += 1;
        Ok(self.ctx.matches_tag(tag))
      }
      _ => Err(self.error("expected tag")),
    }
  }
}
