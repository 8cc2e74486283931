//! A C11 compiler front-end: parses and type-checks preprocessed C source
//! and emits QBE intermediate language.
//!
//! The compilation context collects what the translation unit shares: the
//! basic-type singletons, the target descriptor, the global symbol and
//! aggregate-type tables with their id counters, the tentative-definitions
//! list, interned string-literal globals, and the output buffer the
//! emitter appends to.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;

use hashbrown::HashMap;

pub mod decl;
pub mod emit;
pub mod eval;
pub mod expr;
pub mod init;
pub mod ir;
pub mod scan;
pub mod scope;
pub mod stmt;
pub mod targ;
pub mod token;
pub mod types;

use decl::{Decl, Parser};
use ir::{GlobalId, Value};
use scan::TokenStream;
use targ::Target;
use token::{Loc, TokenKind};
use types::Types;

/// A fatal diagnostic. Parsing stops at the first one; `main` prints it
/// and exits nonzero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{0}: error: {1}")]
  Diag(Loc, String),
  #[error("error: {0}")]
  Msg(String),
  #[error("{0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn new(loc: &Loc, msg: impl Into<String>) -> Error {
    Error::Diag(loc.clone(), msg.into())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct GlobalInfo {
  pub name: Rc<str>,
  /// Nonzero for private globals, which render with an `.L` prefix and
  /// this id as suffix.
  pub id: u32,
}

pub struct Context {
  pub tys: Types,
  pub targ: Target,
  out: RefCell<Vec<u8>>,
  pub globals: RefCell<Vec<GlobalInfo>>,
  /// Tags of emitted aggregate types; the render id is the index plus one.
  pub typerefs: RefCell<Vec<Option<Rc<str>>>>,
  pub labelid: Cell<u32>,
  privid: Cell<u32>,
  /// Interned string-literal globals, keyed by their decoded contents.
  pub strings: RefCell<HashMap<Vec<u8>, Rc<Decl>>>,
  pub tentative: RefCell<Vec<Rc<Decl>>>,
}

impl Context {
  pub fn new() -> Context {
    let tys = Types::new();
    let targ = Target::new(&tys);
    Context {
      tys,
      targ,
      out: RefCell::new(vec![]),
      globals: RefCell::new(vec![]),
      typerefs: RefCell::new(vec![]),
      labelid: Cell::new(0),
      privid: Cell::new(0),
      strings: RefCell::new(HashMap::new()),
      tentative: RefCell::new(vec![]),
    }
  }

  pub fn mkglobal(&self, name: &str, private: bool) -> Value {
    let id = if private {
      let id = self.privid.get() + 1;
      self.privid.set(id);
      id
    } else {
      0
    };
    let mut globals = self.globals.borrow_mut();
    globals.push(GlobalInfo { name: Rc::from(name), id });
    Value::Global(GlobalId(globals.len() as u32 - 1))
  }

  pub fn write(&self, s: &str) {
    self.out.borrow_mut().extend_from_slice(s.as_bytes());
  }
}

impl Default for Context {
  fn default() -> Context {
    Context::new()
  }
}

/// Compile one translation unit to textual IR.
pub fn compile(file: &str, src: &str, out: &mut dyn Write) -> Result<()> {
  let ctx = Context::new();
  let mut p = Parser::new(&ctx, file, src)?;
  while p.ts.kind() != TokenKind::Eof {
    if !p.decl(None)? {
      return p.ts.err("expected declaration or function definition");
    }
  }
  // remaining tentative definitions become zero-initialized objects
  let tentative: Vec<_> = ctx.tentative.borrow().clone();
  for d in tentative {
    if d.tentative.get() {
      emit::data(&ctx, &d, None)?;
    }
  }
  out.write_all(&ctx.out.borrow())?;
  Ok(())
}

/// `-E`: reprint the token stream, one token per line.
pub fn dump_tokens(file: &str, src: &str, out: &mut dyn Write) -> Result<()> {
  let mut ts = TokenStream::new(file, src)?;
  while ts.kind() != TokenKind::Eof {
    writeln!(out, "{}", ts.tok.text())?;
    ts.next()?;
  }
  Ok(())
}

/// Compile to a string, for tests.
pub fn compile_to_string(src: &str) -> Result<String> {
  let mut out = vec![];
  compile("<test>", src, &mut out)?;
  Ok(String::from_utf8(out).expect("IR output is UTF-8"))
}
