//! The character scanner and the one-token-lookahead stream the parsers
//! consume. The input is already preprocessed; newlines are scanned as
//! tokens and dropped by the stream.

use std::rc::Rc;

use crate::token::{Loc, Token, TokenKind};
use crate::{Error, Result};

pub struct Scanner {
  src: Vec<char>,
  pos: usize,
  chr: Option<char>,
  loc: Loc,
  buf: String,
  usebuf: bool,
}

fn is_odigit(c: char) -> bool {
  c.is_digit(8)
}

impl Scanner {
  pub fn new(file: &str, src: &str) -> Scanner {
    let mut s = Scanner {
      src: src.chars().collect(),
      pos: 0,
      chr: None,
      loc: Loc { file: Rc::from(file), line: 1, col: 0 },
      buf: String::new(),
      usebuf: false,
    };
    s.nextchar();
    s
  }

  fn getchar(&mut self) -> Option<char> {
    let c = self.src.get(self.pos).copied();
    if c.is_some() {
      self.pos += 1;
    }
    c
  }

  fn nextchar(&mut self) {
    if self.usebuf && let Some(c) = self.chr {
      self.buf.push(c);
    }
    loop {
      self.chr = self.getchar();
      if self.chr == Some('\n') {
        self.loc.line += 1;
        self.loc.col = 1;
      } else {
        self.loc.col += 1;
      }
      if self.chr != Some('\\') {
        break;
      }
      // line splice
      if self.src.get(self.pos) == Some(&'\n') {
        self.pos += 1;
        self.loc.line += 1;
        self.loc.col = 1;
      } else {
        break;
      }
    }
  }

  fn op2(&mut self, t1: TokenKind, t2: TokenKind) -> TokenKind {
    self.nextchar();
    if self.chr != Some('=') {
      return t1;
    }
    self.nextchar();
    t2
  }

  fn op3(&mut self, t1: TokenKind, t2: TokenKind, t3: TokenKind) -> TokenKind {
    let c = self.chr;
    self.nextchar();
    if self.chr == Some('=') {
      self.nextchar();
      return t2;
    }
    if self.chr != c {
      return t1;
    }
    self.nextchar();
    t3
  }

  fn op4(&mut self, t1: TokenKind, t2: TokenKind, t3: TokenKind, t4: TokenKind) -> TokenKind {
    let c = self.chr;
    self.nextchar();
    if self.chr == Some('=') {
      self.nextchar();
      return t2;
    }
    if self.chr != c {
      return t1;
    }
    self.nextchar();
    if self.chr != Some('=') {
      return t3;
    }
    self.nextchar();
    t4
  }

  fn ident(&mut self) -> Result<TokenKind> {
    self.usebuf = true;
    while let Some(c) = self.chr {
      if !c.is_alphanumeric() && c != '_' {
        break;
      }
      self.nextchar();
    }
    // string and character literal prefixes stay part of the literal
    let isprefix = matches!(self.buf.as_str(), "L" | "u" | "U" | "u8");
    if isprefix && self.chr == Some('"') {
      return self.stringlit();
    }
    if isprefix && self.chr == Some('\'') {
      return self.charconst();
    }
    Ok(TokenKind::Ident)
  }

  fn number(&mut self) -> TokenKind {
    let mut allowsign = false;
    self.usebuf = true;
    loop {
      self.nextchar();
      match self.chr {
        Some('e' | 'E' | 'p' | 'P') => allowsign = true,
        Some('+' | '-') => {
          if !allowsign {
            break;
          }
        }
        Some('.' | '_') => allowsign = false,
        Some(c) if c.is_alphanumeric() => allowsign = false,
        _ => break,
      }
    }
    TokenKind::Number
  }

  fn escape(&mut self) -> Result<()> {
    self.nextchar();
    match self.chr {
      Some('x') => {
        self.nextchar();
        if !matches!(self.chr, Some(c) if c.is_ascii_hexdigit()) {
          return Err(Error::new(&self.loc, "invalid hexadecimal escape sequence"));
        }
        while matches!(self.chr, Some(c) if c.is_ascii_hexdigit()) {
          self.nextchar();
        }
      }
      Some(c) if is_odigit(c) => {
        self.nextchar();
        if matches!(self.chr, Some(c) if is_odigit(c)) {
          self.nextchar();
          if matches!(self.chr, Some(c) if is_odigit(c)) {
            self.nextchar();
          }
        }
      }
      Some('\'' | '"' | '?' | '\\' | 'a' | 'b' | 'f' | 'n' | 'r' | 't' | 'v') => self.nextchar(),
      _ => return Err(Error::new(&self.loc, "invalid escape sequence")),
    }
    Ok(())
  }

  fn charconst(&mut self) -> Result<TokenKind> {
    self.usebuf = true;
    self.nextchar();
    loop {
      match self.chr {
        Some('\\') => self.escape()?,
        Some('\'') => {
          self.nextchar();
          return Ok(TokenKind::CharConst);
        }
        Some('\n') | None => {
          return Err(Error::new(&self.loc, "unterminated character constant"));
        }
        _ => self.nextchar(),
      }
    }
  }

  fn stringlit(&mut self) -> Result<TokenKind> {
    self.usebuf = true;
    self.nextchar();
    loop {
      match self.chr {
        Some('\\') => self.escape()?,
        Some('"') => {
          self.nextchar();
          return Ok(TokenKind::StringLit);
        }
        Some('\n') | None => {
          return Err(Error::new(&self.loc, "unterminated string literal"));
        }
        _ => self.nextchar(),
      }
    }
  }

  fn scankind(&mut self) -> Result<TokenKind> {
    use TokenKind::*;
    loop {
      let Some(c) = self.chr else { return Ok(Eof) };
      return Ok(match c {
        ' ' | '\t' | '\x0c' | '\x0b' | '\r' => {
          self.nextchar();
          continue;
        }
        '!' => self.op2(Lnot, Neq),
        '"' => self.stringlit()?,
        '#' => {
          self.nextchar();
          if self.chr != Some('#') {
            Hash
          } else {
            self.nextchar();
            HashHash
          }
        }
        '%' => self.op2(Mod, ModAssign),
        '&' => self.op3(Band, BandAssign, Land),
        '\'' => self.charconst()?,
        '*' => self.op2(Mul, MulAssign),
        '+' => self.op3(Add, AddAssign, Inc),
        '-' => {
          let tok = self.op3(Sub, SubAssign, Dec);
          if tok != Sub || self.chr != Some('>') {
            tok
          } else {
            self.nextchar();
            Arrow
          }
        }
        '/' => self.op2(Div, DivAssign),
        '<' => self.op4(Less, Leq, Shl, ShlAssign),
        '=' => self.op2(Assign, Eql),
        '>' => self.op4(Greater, Geq, Shr, ShrAssign),
        '^' => self.op2(Xor, XorAssign),
        '|' => self.op3(Bor, BorAssign, Lor),
        '\n' => {
          self.nextchar();
          Newline
        }
        '[' => {
          self.nextchar();
          LBrack
        }
        ']' => {
          self.nextchar();
          RBrack
        }
        '(' => {
          self.nextchar();
          LParen
        }
        ')' => {
          self.nextchar();
          RParen
        }
        '{' => {
          self.nextchar();
          LBrace
        }
        '}' => {
          self.nextchar();
          RBrace
        }
        '.' => {
          if self.src.get(self.pos) == Some(&'.') && self.src.get(self.pos + 1) == Some(&'.') {
            self.pos += 2;
            self.loc.col += 2;
            self.nextchar();
            Ellipsis
          } else {
            self.nextchar();
            if matches!(self.chr, Some(c) if c.is_ascii_digit()) {
              // floating constant like `.5`
              self.buf.push('.');
              self.number()
            } else {
              Period
            }
          }
        }
        '~' => {
          self.nextchar();
          Bnot
        }
        '?' => {
          self.nextchar();
          Question
        }
        ':' => {
          self.nextchar();
          Colon
        }
        ';' => {
          self.nextchar();
          Semicolon
        }
        ',' => {
          self.nextchar();
          Comma
        }
        c if c.is_ascii_digit() => self.number(),
        c if c.is_alphabetic() || c == '_' => self.ident()?,
        c if !c.is_control() => {
          return Err(Error::new(&self.loc, format!("unexpected character '{c}'")));
        }
        c => {
          return Err(Error::new(&self.loc, format!("unexpected character '\\x{:02x}'", c as u32)));
        }
      });
    }
  }

  pub fn scan(&mut self) -> Result<Token> {
    let loc = self.loc.clone();
    let kind = self.scankind()?;
    let lit = if self.usebuf {
      self.usebuf = false;
      std::mem::take(&mut self.buf)
    } else {
      String::new()
    };
    Ok(Token { kind, loc, lit })
  }
}

/// The stream interface the parsers see: the current token plus a single
/// token of buffered lookahead, with newlines dropped and identifiers
/// mapped through the keyword table.
pub struct TokenStream {
  scanner: Scanner,
  pub tok: Token,
  pending: Option<Token>,
}

impl TokenStream {
  pub fn new(file: &str, src: &str) -> Result<TokenStream> {
    let mut scanner = Scanner::new(file, src);
    let tok = Self::nextinto(&mut scanner)?;
    Ok(TokenStream { scanner, tok, pending: None })
  }

  fn nextinto(scanner: &mut Scanner) -> Result<Token> {
    let mut t = loop {
      let t = scanner.scan()?;
      if t.kind != TokenKind::Newline {
        break t;
      }
    };
    if t.kind == TokenKind::Ident
      && let Some(kw) = TokenKind::keyword(&t.lit)
    {
      t.kind = kw;
      t.lit.clear();
    }
    Ok(t)
  }

  pub fn kind(&self) -> TokenKind {
    self.tok.kind
  }

  pub fn loc(&self) -> Loc {
    self.tok.loc.clone()
  }

  pub fn next(&mut self) -> Result<()> {
    self.tok = match self.pending.take() {
      Some(t) => t,
      None => Self::nextinto(&mut self.scanner)?,
    };
    Ok(())
  }

  /// If the token after the current one has kind `kind`, consume both and
  /// return true; otherwise leave the stream positioned at the current
  /// token with the lookahead buffered.
  pub fn peek(&mut self, kind: TokenKind) -> Result<bool> {
    if self.pending.is_none() {
      self.pending = Some(Self::nextinto(&mut self.scanner)?);
    }
    if self.pending.as_ref().is_some_and(|t| t.kind == kind) {
      self.pending = None;
      self.tok = Self::nextinto(&mut self.scanner)?;
      return Ok(true);
    }
    Ok(false)
  }

  /// Require the current token to have kind `kind`; advance past it and
  /// return its literal.
  pub fn expect(&mut self, kind: TokenKind, msg: &str) -> Result<String> {
    if self.tok.kind != kind {
      return Err(Error::new(
        &self.tok.loc,
        format!("expected '{}' {}, saw '{}'", kind, msg, self.tok.text()),
      ));
    }
    let lit = std::mem::take(&mut self.tok.lit);
    self.next()?;
    Ok(lit)
  }

  /// Advance past the current token if it has kind `kind`.
  pub fn consume(&mut self, kind: TokenKind) -> Result<bool> {
    if self.tok.kind != kind {
      return Ok(false);
    }
    self.next()?;
    Ok(true)
  }

  pub fn err<T>(&self, msg: impl Into<String>) -> Result<T> {
    Err(Error::new(&self.tok.loc, msg))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use TokenKind::*;

  fn kinds(src: &str) -> Vec<TokenKind> {
    let mut ts = TokenStream::new("<test>", src).unwrap();
    let mut out = vec![];
    while ts.kind() != Eof {
      out.push(ts.kind());
      ts.next().unwrap();
    }
    out
  }

  #[test]
  fn punctuators() {
    assert_eq!(kinds("a <<= b >> c ... -> .5 .."), vec![
      Ident, ShlAssign, Ident, Shr, Ident, Ellipsis, Arrow, Number, Period, Period,
    ]);
  }

  #[test]
  fn keywords_and_idents() {
    assert_eq!(kinds("int intx _Bool typeof __typeof__"), vec![
      Int, Ident, Bool, Typeof, Typeof,
    ]);
  }

  #[test]
  fn literals_keep_quotes() {
    let mut ts = TokenStream::new("<test>", "L\"hi\" u8\"x\" 'a' 0x1fUL").unwrap();
    assert_eq!(ts.kind(), StringLit);
    assert_eq!(ts.tok.lit, "L\"hi\"");
    ts.next().unwrap();
    assert_eq!(ts.tok.lit, "u8\"x\"");
    ts.next().unwrap();
    assert_eq!(ts.kind(), CharConst);
    assert_eq!(ts.tok.lit, "'a'");
    ts.next().unwrap();
    assert_eq!(ts.kind(), Number);
    assert_eq!(ts.tok.lit, "0x1fUL");
  }

  #[test]
  fn peek_consumes_on_match() {
    let mut ts = TokenStream::new("<test>", "lab : x").unwrap();
    assert_eq!(ts.kind(), Ident);
    assert!(ts.peek(Colon).unwrap());
    assert_eq!(ts.kind(), Ident);
    assert_eq!(ts.tok.lit, "x");
  }

  #[test]
  fn line_splice() {
    assert_eq!(kinds("ab\\\ncd"), vec![Ident]);
  }
}
