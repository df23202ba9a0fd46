//! Go source walker.
//!
//! Computes the workspace files a Go package build reads: the package's own
//! sources plus, transitively, those of every non-standard-library package
//! it imports. Results are memoized per import path, and concurrent requests
//! for the same package share one load.
//!
//! Import paths resolve against the workspace in this order:
//! 1. the module prefix (`github.com/flynn/flynn/pkg/x` -> `pkg/x`)
//! 2. `vendor/<import path>`
//! 3. standard library (first path element has no dot), contributing nothing

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;
use walkdir::WalkDir;

use super::InputError;
use super::constraint::BuildContext;

/// Source files of one Go package, by category, relative to the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoPackage {
  pub dir: String,
  pub go_files: Vec<String>,
  pub cgo_files: Vec<String>,
  pub c_files: Vec<String>,
  pub s_files: Vec<String>,
  pub ignored_go_files: Vec<String>,
  pub imports: BTreeSet<String>,
}

impl GoPackage {
  /// Every file of the package, categories in a fixed order.
  pub fn files(&self) -> Vec<String> {
    [
      &self.go_files,
      &self.cgo_files,
      &self.c_files,
      &self.s_files,
      &self.ignored_go_files,
    ]
    .into_iter()
    .flatten()
    .map(|name| join_rel(&self.dir, name))
    .collect()
  }
}

fn join_rel(dir: &str, name: &str) -> String {
  if dir.is_empty() {
    name.to_string()
  } else {
    format!("{dir}/{name}")
  }
}

/// Normalize a workspace-relative directory (`./pkg/x/` -> `pkg/x`).
pub fn clean_dir(dir: &str) -> String {
  dir
    .split('/')
    .filter(|part| !part.is_empty() && *part != ".")
    .collect::<Vec<_>>()
    .join("/")
}

/// The package clause, imports and build constraints of a Go file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoHeader {
  pub package: String,
  pub imports: Vec<String>,
  pub go_build: Option<String>,
  pub plus_build: Vec<String>,
}

impl GoHeader {
  /// Whether the file's build constraints hold for `ctx`.
  pub fn matches(&self, ctx: &BuildContext) -> Result<bool, InputError> {
    if let Some(expr) = &self.go_build {
      return Ok(ctx.eval_go_build(expr)?);
    }
    Ok(self.plus_build.iter().all(|line| ctx.eval_plus_build(line)))
  }
}

/// Parse the header of a Go source file.
pub fn parse_header(src: &str) -> Result<GoHeader, String> {
  let mut header = GoHeader::default();
  scan_constraints(src, &mut header);

  let mut lexer = Lexer::new(src);
  match lexer.next_token()? {
    Some(Token::Ident("package")) => {}
    _ => return Err("expected package clause".to_string()),
  }
  match lexer.next_token()? {
    Some(Token::Ident(name)) => header.package = name.to_string(),
    _ => return Err("expected package name".to_string()),
  }

  loop {
    match lexer.next_token()? {
      Some(Token::Punct(';')) => continue,
      Some(Token::Ident("import")) => {}
      _ => break,
    }
    match lexer.next_token()? {
      Some(Token::Punct('(')) => loop {
        match lexer.next_token()? {
          Some(Token::Punct(')')) => break,
          Some(Token::Punct(';')) => continue,
          Some(token) => header.imports.push(import_spec(&mut lexer, token)?),
          None => return Err("unterminated import block".to_string()),
        }
      },
      Some(token) => header.imports.push(import_spec(&mut lexer, token)?),
      None => return Err("expected import spec".to_string()),
    }
  }

  Ok(header)
}

/// `[name | .] "path"`, with `first` already consumed.
fn import_spec(lexer: &mut Lexer<'_>, first: Token<'_>) -> Result<String, String> {
  match first {
    Token::Str(path) => Ok(path),
    Token::Ident(_) | Token::Punct('.') => match lexer.next_token()? {
      Some(Token::Str(path)) => Ok(path),
      _ => Err("expected import path".to_string()),
    },
    _ => Err("malformed import spec".to_string()),
  }
}

/// Collect `//go:build` and `// +build` lines preceding the package clause.
fn scan_constraints(src: &str, header: &mut GoHeader) {
  let mut in_block = false;
  for line in src.lines() {
    let line = line.trim();
    if in_block {
      in_block = !line.contains("*/");
      continue;
    }
    if line.is_empty() {
      continue;
    }
    if let Some(comment) = line.strip_prefix("//") {
      if let Some(expr) = comment.strip_prefix("go:build") {
        if expr.is_empty() || expr.starts_with(char::is_whitespace) {
          header.go_build = Some(expr.trim().to_string());
        }
      } else if let Some(rest) = comment.trim_start().strip_prefix("+build")
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
      {
        header.plus_build.push(rest.trim().to_string());
      }
      continue;
    }
    if let Some(rest) = line.strip_prefix("/*") {
      in_block = !rest.contains("*/");
      continue;
    }
    break;
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
  Ident(&'a str),
  Str(String),
  Punct(char),
}

struct Lexer<'a> {
  src: &'a str,
  pos: usize,
}

impl<'a> Lexer<'a> {
  fn new(src: &'a str) -> Self {
    Self { src, pos: 0 }
  }

  fn rest(&self) -> &'a str {
    &self.src[self.pos..]
  }

  fn skip_trivia(&mut self) -> Result<(), String> {
    loop {
      let rest = self.rest();
      let trimmed = rest.trim_start();
      self.pos += rest.len() - trimmed.len();

      if trimmed.starts_with("//") {
        self.pos += trimmed.find('\n').unwrap_or(trimmed.len());
      } else if trimmed.starts_with("/*") {
        let end = trimmed[2..].find("*/").ok_or("unterminated comment")?;
        self.pos += end + 4;
      } else {
        return Ok(());
      }
    }
  }

  fn next_token(&mut self) -> Result<Option<Token<'a>>, String> {
    self.skip_trivia()?;
    let rest = self.rest();
    let Some(c) = rest.chars().next() else {
      return Ok(None);
    };

    if c.is_alphabetic() || c == '_' {
      let len = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
      self.pos += len;
      return Ok(Some(Token::Ident(&rest[..len])));
    }

    match c {
      '`' => {
        let end = rest[1..].find('`').ok_or("unterminated raw string")?;
        self.pos += end + 2;
        Ok(Some(Token::Str(rest[1..end + 1].to_string())))
      }
      '"' => {
        let mut value = String::new();
        let mut chars = rest[1..].char_indices();
        while let Some((i, c)) = chars.next() {
          match c {
            '"' => {
              self.pos += i + 2;
              return Ok(Some(Token::Str(value)));
            }
            '\\' => {
              if let Some((_, escaped)) = chars.next() {
                value.push(escaped);
              }
            }
            '\n' => break,
            c => value.push(c),
          }
        }
        Err("unterminated string".to_string())
      }
      c => {
        self.pos += c.len_utf8();
        Ok(Some(Token::Punct(c)))
      }
    }
  }
}

/// Scan the package in workspace directory `dir` for `ctx`.
pub fn scan_package(workspace: &Path, dir: &str, ctx: &BuildContext) -> Result<GoPackage, InputError> {
  let abs = workspace.join(dir);
  let package_error = |message: String| InputError::GoPackage {
    dir: dir.to_string(),
    message,
  };

  let mut pkg = GoPackage {
    dir: dir.to_string(),
    ..Default::default()
  };

  let walker = WalkDir::new(&abs).min_depth(1).max_depth(1).sort_by_file_name();
  for entry in walker {
    let entry = entry.map_err(|e| package_error(e.to_string()))?;
    if !entry.file_type().is_file() {
      continue;
    }
    let Some(name) = entry.file_name().to_str() else {
      continue;
    };
    if name.starts_with('_') || name.starts_with('.') {
      continue;
    }

    let Some((_, ext)) = name.rsplit_once('.') else {
      continue;
    };
    match ext {
      "go" => {
        if name.ends_with("_test.go") {
          continue;
        }
        if !ctx.matches_file_name(name) {
          pkg.ignored_go_files.push(name.to_string());
          continue;
        }
        let src = std::fs::read_to_string(entry.path()).map_err(|e| package_error(format!("{name}: {e}")))?;
        let header = parse_header(&src).map_err(|e| package_error(format!("{name}: {e}")))?;
        if !header.matches(ctx)? {
          pkg.ignored_go_files.push(name.to_string());
          continue;
        }

        let is_cgo = header.imports.iter().any(|import| import == "C");
        if is_cgo && !ctx.cgo {
          pkg.ignored_go_files.push(name.to_string());
          continue;
        }
        if is_cgo {
          pkg.cgo_files.push(name.to_string());
        } else {
          pkg.go_files.push(name.to_string());
        }
        pkg.imports.extend(header.imports.into_iter().filter(|import| import != "C"));
      }
      "c" if ctx.matches_file_name(name) => pkg.c_files.push(name.to_string()),
      "s" | "S" if ctx.matches_file_name(name) => pkg.s_files.push(name.to_string()),
      _ => {}
    }
  }

  if pkg.go_files.is_empty() && pkg.cgo_files.is_empty() {
    return Err(package_error("no buildable Go source files".to_string()));
  }
  Ok(pkg)
}

type Memo = Arc<OnceCell<Arc<Vec<String>>>>;

/// Memoizing transitive source loader for one build context.
pub struct GoWalker {
  workspace: PathBuf,
  module: String,
  ctx: BuildContext,
  loaded: RwLock<HashMap<String, Memo>>,
}

impl GoWalker {
  pub fn new(workspace: &Path, module: &str, ctx: BuildContext) -> Self {
    Self {
      workspace: workspace.to_path_buf(),
      module: module.to_string(),
      ctx,
      loaded: RwLock::new(HashMap::new()),
    }
  }

  /// Import path of workspace directory `dir`.
  pub fn import_path(&self, dir: &str) -> String {
    let dir = clean_dir(dir);
    if dir.is_empty() {
      self.module.clone()
    } else {
      format!("{}/{}", self.module, dir)
    }
  }

  /// Transitive source files of the package in workspace directory `dir`,
  /// deduplicated, first occurrence wins.
  pub async fn load(&self, dir: &str) -> Result<Vec<String>, InputError> {
    let files = self.load_import(self.import_path(dir)).await?;
    let mut seen = HashSet::new();
    Ok(files.iter().filter(|file| seen.insert(file.as_str())).cloned().collect())
  }

  fn load_import(&self, import: String) -> BoxFuture<'_, Result<Arc<Vec<String>>, InputError>> {
    Box::pin(async move {
      let memo = {
        let loaded = self.loaded.read().await;
        loaded.get(&import).cloned()
      };
      let memo = match memo {
        Some(memo) => memo,
        None => self.loaded.write().await.entry(import.clone()).or_default().clone(),
      };
      let files = memo.get_or_try_init(|| self.resolve_import(&import)).await?;
      Ok(files.clone())
    })
  }

  async fn resolve_import(&self, import: &str) -> Result<Arc<Vec<String>>, InputError> {
    let Some(dir) = self.import_dir(import)? else {
      return Ok(Arc::new(Vec::new()));
    };

    let workspace = self.workspace.clone();
    let ctx = self.ctx.clone();
    let scan_dir = dir.clone();
    let pkg = tokio::task::spawn_blocking(move || scan_package(&workspace, &scan_dir, &ctx)).await??;
    debug!(import = %import, dir = %dir, imports = pkg.imports.len(), "loaded go package");

    let mut files = pkg.files();
    for dep in &pkg.imports {
      files.extend(self.load_import(dep.clone()).await?.iter().cloned());
    }
    Ok(Arc::new(files))
  }

  /// Workspace directory of `import`, or `None` for the standard library.
  fn import_dir(&self, import: &str) -> Result<Option<String>, InputError> {
    if import == self.module {
      return Ok(Some(String::new()));
    }
    if let Some(rest) = import.strip_prefix(&self.module)
      && let Some(rel) = rest.strip_prefix('/')
    {
      return Ok(Some(rel.to_string()));
    }

    let vendored = format!("vendor/{import}");
    if self.workspace.join(&vendored).is_dir() {
      return Ok(Some(vendored));
    }

    let first = import.split('/').next().unwrap_or(import);
    if !first.contains('.') {
      return Ok(None);
    }

    Err(InputError::GoImport {
      import: import.to_string(),
      message: "cannot find package in workspace or vendor".to_string(),
    })
  }
}
