//! Expression parsing: recursive descent with precedence climbing for the
//! binary operators, eager lvalue decay, usual arithmetic conversions, and
//! the desugarings the IR builder expects (member access through pointer
//! arithmetic, compound assignment through a shared temporary).

use std::cell::Cell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::decl::{Decl, DeclBuiltin, DeclKind, Parser};
use crate::eval::eval;
use crate::ir::Value;
use crate::token::{Loc, TokenKind};
use crate::types::{self, Bitfield, Ty, TypeProp, TypeQual, compatible, mkpointer, same};
use crate::{Error, Result};

pub type ExprRef = Rc<Expr>;

#[derive(Clone, Copy, Debug)]
pub enum Constant {
  Int(u64),
  Float(f64),
}

impl Constant {
  pub fn int(&self) -> u64 {
    match *self {
      Constant::Int(i) => i,
      Constant::Float(f) => f as u64,
    }
  }

  pub fn float(&self) -> f64 {
    match *self {
      Constant::Int(i) => i as f64,
      Constant::Float(f) => f,
    }
  }
}

/// Decoded string-literal contents: raw code units of the given byte width,
/// including the terminating NUL. Data emission may overwrite units in
/// place when later initializers land inside the string.
pub struct StringLit {
  pub data: std::cell::RefCell<Vec<u8>>,
  pub width: u64,
}

impl StringLit {
  pub fn units(&self) -> u64 {
    self.data.borrow().len() as u64 / self.width
  }

  pub fn unit(&self, i: u64) -> u64 {
    let data = self.data.borrow();
    let at = (i * self.width) as usize;
    match self.width {
      1 => data[at] as u64,
      2 => u16::from_le_bytes([data[at], data[at + 1]]) as u64,
      _ => u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as u64,
    }
  }

  pub fn set_unit(&self, i: u64, v: u64) {
    let mut data = self.data.borrow_mut();
    let at = (i * self.width) as usize;
    match self.width {
      1 => data[at] = v as u8,
      2 => data[at..at + 2].copy_from_slice(&(v as u16).to_le_bytes()),
      _ => data[at..at + 4].copy_from_slice(&(v as u32).to_le_bytes()),
    }
  }
}

pub enum BuiltinExpr {
  Alloca(ExprRef),
  Unreachable,
  VaStart(ExprRef),
  VaArg(ExprRef),
}

pub enum ExprKind {
  Ident(Rc<Decl>),
  Const(Constant),
  String(StringLit),
  Call { func: ExprRef, args: Vec<ExprRef> },
  Bitfield { base: ExprRef, bits: Bitfield },
  IncDec { op: TokenKind, post: bool, base: ExprRef },
  Compound { init: Vec<crate::init::Init> },
  Unary { op: TokenKind, base: ExprRef },
  Cast { base: ExprRef },
  Binary { op: TokenKind, l: ExprRef, r: ExprRef },
  Cond { cond: ExprRef, t: ExprRef, f: ExprRef },
  Assign { l: ExprRef, r: ExprRef },
  Comma { exprs: Vec<ExprRef> },
  Builtin(BuiltinExpr),
  /// Placeholder for the address temporary of a compound assignment; the
  /// IR builder fills the slot when the first half executes.
  Temp(Cell<Option<Value>>),
}

pub struct Expr {
  pub kind: ExprKind,
  /// The unqualified type of the expression.
  pub ty: Ty,
  /// Qualifiers of the designated object, for lvalues.
  pub qual: TypeQual,
  pub lvalue: bool,
  /// This is a pointer decayed from an array or function designator.
  pub decayed: bool,
}

pub fn mkexpr(kind: ExprKind, ty: &Ty) -> Expr {
  Expr { kind, ty: ty.clone(), qual: TypeQual::empty(), lvalue: false, decayed: false }
}

pub fn mkconst(ty: &Ty, n: u64) -> ExprRef {
  Rc::new(mkexpr(ExprKind::Const(Constant::Int(n)), ty))
}

pub fn mkfltconst(ty: &Ty, f: f64) -> ExprRef {
  Rc::new(mkexpr(ExprKind::Const(Constant::Float(f)), ty))
}

/// Undo decay: the designator a decayed pointer came from.
pub fn decayed_base(e: &ExprRef) -> &ExprRef {
  if e.decayed
    && let ExprKind::Unary { op: TokenKind::Band, base } = &e.kind
  {
    return base;
  }
  e
}

/// Conversion of array and function designators (C11 6.3.2.1): an lvalue
/// of array type becomes a pointer to its first element, a function
/// designator a pointer to the function. The result remembers it decayed.
pub fn decay(e: ExprRef) -> ExprRef {
  let t = e.ty.clone();
  let pt = if t.is_array() {
    mkpointer(t.base(), t.base_qual())
  } else if t.is_func() {
    mkpointer(t, TypeQual::empty())
  } else {
    return e;
  };
  let mut ne = mkexpr(ExprKind::Unary { op: TokenKind::Band, base: e }, &pt);
  ne.decayed = true;
  Rc::new(ne)
}

/// Declared width of a bit-field expression, for promotion.
pub fn bitfieldwidth(e: &Expr) -> Option<u32> {
  match &e.kind {
    ExprKind::Bitfield { bits, .. } => {
      Some(e.ty.size.get() as u32 * 8 - bits.before - bits.after)
    }
    _ => None,
  }
}

pub fn exprconvert(e: ExprRef, t: &Ty) -> ExprRef {
  if compatible(&e.ty, t) {
    return e;
  }
  Rc::new(mkexpr(ExprKind::Cast { base: e }, t))
}

fn nullpointer(e: &Expr) -> bool {
  let ExprKind::Const(Constant::Int(0)) = e.kind else { return false };
  e.ty.prop.contains(TypeProp::INT) || (e.ty.is_pointer() && e.ty.base().is_void())
}

fn set_lvalue(e: &mut ExprRef, lvalue: bool) {
  Rc::get_mut(e).expect("fresh expression node").lvalue = lvalue;
}

fn precedence(t: TokenKind) -> i32 {
  use TokenKind::*;
  match t {
    Lor => 0,
    Land => 1,
    Bor => 2,
    Xor => 3,
    Band => 4,
    Eql | Neq => 5,
    Less | Greater | Leq | Geq => 6,
    Shl | Shr => 7,
    Add | Sub => 8,
    Mul | Div | Mod => 9,
    _ => -1,
  }
}

struct CharCursor<'a> {
  s: &'a [char],
  i: usize,
}

impl<'a> CharCursor<'a> {
  fn new(s: &'a [char]) -> CharCursor<'a> {
    CharCursor { s, i: 0 }
  }

  fn peek(&self) -> Option<char> {
    self.s.get(self.i).copied()
  }

  fn bump(&mut self) -> Option<char> {
    let c = self.peek();
    if c.is_some() {
      self.i += 1;
    }
    c
  }

  fn done(&self) -> bool {
    self.i >= self.s.len()
  }
}

/// Decode one character or escape sequence. Returns the code point and
/// whether it came from a hex or octal escape, which bypasses UTF-8
/// encoding and writes a raw code unit.
fn decodechar(cur: &mut CharCursor<'_>, desc: &str, loc: &Loc) -> Result<(u32, bool)> {
  let c = cur.bump().ok_or_else(|| Error::new(loc, format!("{desc} ends unexpectedly")))?;
  if c != '\\' {
    return Ok((c as u32, false));
  }
  let c = cur.bump().ok_or_else(|| Error::new(loc, "incomplete escape sequence"))?;
  Ok(match c {
    '\'' | '"' | '?' | '\\' => (c as u32, false),
    'a' => (0x07, false),
    'b' => (0x08, false),
    'f' => (0x0c, false),
    'n' => (0x0a, false),
    'r' => (0x0d, false),
    't' => (0x09, false),
    'v' => (0x0b, false),
    'x' => {
      let mut v: u32 = 0;
      while let Some(c) = cur.peek().filter(char::is_ascii_hexdigit) {
        cur.bump();
        v = v.wrapping_mul(16).wrapping_add(c.to_digit(16).expect("hex digit"));
      }
      (v, true)
    }
    '0'..='7' => {
      let mut v = c.to_digit(8).expect("octal digit");
      for _ in 0..2 {
        match cur.peek().and_then(|c| c.to_digit(8)) {
          Some(d) => {
            cur.bump();
            v = v * 8 + d;
          }
          None => break,
        }
      }
      (v, true)
    }
    _ => return Err(Error::new(loc, "invalid escape sequence")),
  })
}

fn encodechar(buf: &mut Vec<u8>, width: u64, chr: u32, hexoct: bool) {
  match width {
    1 => {
      if hexoct {
        buf.push(chr as u8);
      } else {
        let c = char::from_u32(chr).expect("valid code point");
        let mut tmp = [0u8; 4];
        buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
      }
    }
    2 => {
      if hexoct {
        buf.extend_from_slice(&(chr as u16).to_le_bytes());
      } else {
        let c = char::from_u32(chr).expect("valid code point");
        let mut tmp = [0u16; 2];
        for unit in c.encode_utf16(&mut tmp) {
          buf.extend_from_slice(&unit.to_le_bytes());
        }
      }
    }
    _ => buf.extend_from_slice(&chr.to_le_bytes()),
  }
}

/// Parse a hexadecimal floating constant (`0x1.8p3`); the suffix remains.
fn hexfloat(lit: &str) -> Option<(f64, &str)> {
  let rest = lit.strip_prefix("0x").or_else(|| lit.strip_prefix("0X"))?;
  let mut mant: f64 = 0.0;
  let mut frac = 0i32;
  let mut seen_digit = false;
  let mut chars = rest.char_indices().peekable();
  let mut in_frac = false;
  let mut expstart = None;
  while let Some(&(i, c)) = chars.peek() {
    if let Some(d) = c.to_digit(16) {
      mant = mant * 16.0 + d as f64;
      if in_frac {
        frac += 1;
      }
      seen_digit = true;
      chars.next();
    } else if c == '.' && !in_frac {
      in_frac = true;
      chars.next();
    } else {
      expstart = Some(i);
      break;
    }
  }
  if !seen_digit {
    return None;
  }
  let exp = &rest[expstart?..];
  let tail = exp.strip_prefix(['p', 'P'])?;
  let (sign, tail) = match tail.strip_prefix(['+', '-']) {
    Some(t) => (if tail.starts_with('-') { -1i32 } else { 1 }, t),
    None => (1, tail),
  };
  let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
  if digits.is_empty() {
    return None;
  }
  let e: i32 = digits.parse().ok()?;
  let suffix = &tail[digits.len()..];
  Some((mant * 2f64.powi(sign * e - 4 * frac), suffix))
}

/// Make a decimal floating literal palatable to `f64::from_str`, which
/// rejects forms like `1.` and `.5e3`... with a bare point.
fn parse_decfloat(text: &str) -> Option<f64> {
  let (mant, exp) = match text.find(['e', 'E']) {
    Some(i) => (&text[..i], &text[i..]),
    None => (text, ""),
  };
  let mut mant = mant.to_string();
  if mant.starts_with('.') {
    mant.insert(0, '0');
  }
  if mant.ends_with('.') {
    mant.push('0');
  }
  format!("{mant}{exp}").parse().ok()
}

impl Parser<'_> {
  fn mkunary(&self, op: TokenKind, base: ExprRef) -> Result<ExprRef> {
    let loc = self.ts.loc();
    match op {
      TokenKind::Band => {
        let base = if base.decayed { decayed_base(&base).clone() } else { base };
        // struct and union rvalues are addressable too, since member
        // access compiles through their address
        if !base.lvalue && !base.ty.is_func() && !base.ty.is_struct_or_union() {
          return Err(Error::new(&loc, "'&' operand is not an lvalue or function designator"));
        }
        if matches!(base.kind, ExprKind::Bitfield { .. }) {
          return Err(Error::new(&loc, "cannot take address of bit-field"));
        }
        let t = mkpointer(base.ty.clone(), base.qual);
        Ok(Rc::new(mkexpr(ExprKind::Unary { op, base }, &t)))
      }
      TokenKind::Mul => {
        if !base.ty.is_pointer() {
          return Err(Error::new(&loc, "cannot dereference non-pointer"));
        }
        let mut e = mkexpr(ExprKind::Unary { op, base: base.clone() }, &base.ty.base());
        e.qual = base.ty.base_qual();
        e.lvalue = true;
        Ok(decay(Rc::new(e)))
      }
      _ => panic!("internal error: unknown unary operator"),
    }
  }

  /// Assignment conversion (C11 6.5.16.1): checks the constraint for the
  /// target kind, then inserts a cast if the types differ.
  pub fn exprassign(&self, e: ExprRef, t: &Ty) -> Result<ExprRef> {
    let loc = self.ts.loc();
    let et = &e.ty;
    if t.is_bool() {
      if !et.prop.contains(TypeProp::ARITH) && !et.is_pointer() {
        return Err(Error::new(&loc, "assignment to bool must be from arithmetic or pointer type"));
      }
    } else if t.is_pointer() {
      if !nullpointer(&e) {
        if !et.is_pointer() {
          return Err(Error::new(&loc, "assignment to pointer must be from pointer or null pointer constant"));
        }
        let tb = t.base();
        let eb = et.base();
        if !tb.is_void() && !eb.is_void() && !compatible(&tb, &eb) {
          return Err(Error::new(&loc, "base types of pointer assignment must be compatible or void"));
        }
        if et.base_qual() & t.base_qual() != et.base_qual() {
          return Err(Error::new(&loc, "assignment to pointer discards qualifiers"));
        }
      }
    } else if t.is_struct_or_union() {
      if !compatible(t, et) {
        let what = if t.is_union() { "union" } else { "struct" };
        return Err(Error::new(&loc, format!("assignment to {what} type must be from compatible type")));
      }
    } else {
      assert!(t.prop.contains(TypeProp::ARITH));
      if !et.prop.contains(TypeProp::ARITH) {
        return Err(Error::new(&loc, "assignment to arithmetic type must be from arithmetic type"));
      }
    }
    Ok(exprconvert(e, t))
  }

  pub fn exprpromote(&self, e: ExprRef) -> ExprRef {
    let t = self.ctx.tys.promote(&e.ty, bitfieldwidth(&e));
    exprconvert(e, &t)
  }

  fn usualconvert(&self, l: &mut ExprRef, r: &mut ExprRef) -> Ty {
    let t = self.ctx.tys.commonreal(&l.ty, bitfieldwidth(l), &r.ty, bitfieldwidth(r));
    *l = exprconvert(l.clone(), &t);
    *r = exprconvert(r.clone(), &t);
    t
  }

  fn mkbinary(&self, loc: &Loc, op: TokenKind, l: ExprRef, r: ExprRef) -> Result<ExprRef> {
    use TokenKind::*;
    let ctx = self.ctx;
    let mut l = l;
    let mut r = r;
    let lp = l.ty.prop;
    let rp = r.ty.prop;
    let mut op = op;
    let t;
    match op {
      Lor | Land => {
        if !lp.contains(TypeProp::SCALAR) {
          return Err(Error::new(loc, format!("left operand of '{op}' operator must be scalar")));
        }
        if !rp.contains(TypeProp::SCALAR) {
          return Err(Error::new(loc, format!("right operand of '{op}' operator must be scalar")));
        }
        t = ctx.tys.tint.clone();
      }
      Eql | Neq => {
        t = ctx.tys.tint.clone();
        if lp.contains(TypeProp::ARITH) && rp.contains(TypeProp::ARITH) {
          self.usualconvert(&mut l, &mut r);
        } else {
          if !l.ty.is_pointer() {
            std::mem::swap(&mut l, &mut r);
          }
          if !l.ty.is_pointer() {
            return Err(Error::new(loc, format!("invalid operands to '{op}' operator")));
          }
          r = eval(ctx, &r)?;
          l = eval(ctx, &l)?;
          if nullpointer(&r) {
            r = exprconvert(r, &l.ty);
          } else if nullpointer(&l) {
            l = exprconvert(l, &r.ty);
          } else {
            if !r.ty.is_pointer() {
              return Err(Error::new(loc, format!("invalid operands to '{op}' operator")));
            }
            if l.ty.base().is_void() {
              std::mem::swap(&mut l, &mut r);
            }
            if r.ty.base().is_void() && !l.ty.base().is_func() {
              r = exprconvert(r, &l.ty);
            } else if !compatible(&l.ty.base(), &r.ty.base()) {
              return Err(Error::new(loc, format!("pointer operands to '{op}' operator are to incompatible types")));
            }
          }
        }
      }
      Less | Greater | Leq | Geq => {
        t = ctx.tys.tint.clone();
        if lp.contains(TypeProp::REAL) && rp.contains(TypeProp::REAL) {
          self.usualconvert(&mut l, &mut r);
        } else if l.ty.is_pointer() && r.ty.is_pointer() {
          if !compatible(&l.ty.base(), &r.ty.base()) || l.ty.base().is_func() {
            return Err(Error::new(loc, format!("pointer operands to '{op}' operator must be to compatible object types")));
          }
        } else {
          return Err(Error::new(loc, format!("invalid operands to '{op}' operator")));
        }
      }
      Bor | Xor | Band => {
        if !lp.contains(TypeProp::INT) || !rp.contains(TypeProp::INT) {
          return Err(Error::new(loc, format!("operands to '{op}' operator must be integer")));
        }
        t = self.usualconvert(&mut l, &mut r);
      }
      Add => {
        if lp.contains(TypeProp::ARITH) && rp.contains(TypeProp::ARITH) {
          t = self.usualconvert(&mut l, &mut r);
        } else {
          if r.ty.is_pointer() {
            std::mem::swap(&mut l, &mut r);
          }
          let rp = r.ty.prop;
          if !l.ty.is_pointer() || !rp.contains(TypeProp::INT) {
            return Err(Error::new(loc, "invalid operands to '+' operator"));
          }
          t = l.ty.clone();
          let base = t.base();
          if base.incomplete.get() || base.is_func() {
            return Err(Error::new(loc, "pointer operand to '+' must be to complete object type"));
          }
          let ulong = &ctx.tys.tulong;
          r = self.mkbinary(loc, Mul, exprconvert(r, ulong), mkconst(ulong, base.size.get()))?;
        }
      }
      Sub => {
        if lp.contains(TypeProp::ARITH) && rp.contains(TypeProp::ARITH) {
          t = self.usualconvert(&mut l, &mut r);
        } else {
          if !l.ty.is_pointer() || (!rp.contains(TypeProp::INT) && !r.ty.is_pointer()) {
            return Err(Error::new(loc, "invalid operands to '-' operator"));
          }
          let base = l.ty.base();
          if base.incomplete.get() || base.is_func() {
            return Err(Error::new(loc, "pointer operand to '-' must be to complete object type"));
          }
          if rp.contains(TypeProp::INT) {
            t = l.ty.clone();
            let ulong = &ctx.tys.tulong;
            r = self.mkbinary(loc, Mul, exprconvert(r, ulong), mkconst(ulong, base.size.get()))?;
          } else {
            if !compatible(&base, &r.ty.base()) {
              return Err(Error::new(loc, "pointer operands to '-' are to incompatible types"));
            }
            op = Div;
            t = ctx.tys.tlong.clone();
            let diff = self.mkbinary(loc, Sub, exprconvert(l, &t), exprconvert(r, &t))?;
            r = mkconst(&t, base.size.get());
            l = diff;
          }
        }
      }
      Mod => {
        if !lp.contains(TypeProp::INT) || !rp.contains(TypeProp::INT) {
          return Err(Error::new(loc, "operands to '%' operator must be integer"));
        }
        t = self.usualconvert(&mut l, &mut r);
      }
      Mul | Div => {
        if !lp.contains(TypeProp::ARITH) || !rp.contains(TypeProp::ARITH) {
          return Err(Error::new(loc, format!("operands to '{op}' operator must be arithmetic")));
        }
        t = self.usualconvert(&mut l, &mut r);
      }
      Shl | Shr => {
        if !lp.contains(TypeProp::INT) || !rp.contains(TypeProp::INT) {
          return Err(Error::new(loc, format!("operands to '{op}' operator must be integer")));
        }
        l = self.exprpromote(l);
        r = self.exprpromote(r);
        t = l.ty.clone();
      }
      _ => panic!("internal error: unknown binary operator"),
    }
    Ok(Rc::new(mkexpr(ExprKind::Binary { op, l, r }, &t)))
  }

  fn inttype(&self, val: u64, decimal: bool, suffix: &str) -> Result<Ty> {
    let tys = &self.ctx.tys;
    let limits: [(&Ty, &str, Option<&str>); 6] = [
      (&tys.tint, "", None),
      (&tys.tuint, "u", None),
      (&tys.tlong, "l", None),
      (&tys.tulong, "ul", Some("lu")),
      (&tys.tllong, "ll", None),
      (&tys.tullong, "ull", Some("llu")),
    ];
    let end = suffix.to_ascii_lowercase();
    let Some(mut i) =
      limits.iter().position(|&(_, e1, e2)| end == e1 || e2.is_some_and(|e2| end == e2))
    else {
      return self.ts.err(format!("invalid integer constant suffix '{suffix}'"));
    };
    let step = if i % 2 == 1 || decimal { 2 } else { 1 };
    while i < limits.len() {
      let t = limits[i].0;
      if val <= u64::MAX >> ((8 - t.size.get()) * 8 + u64::from(t.is_signed())) {
        return Ok(t.clone());
      }
      i += step;
    }
    self.ts.err("no suitable type for constant")
  }

  fn number(&mut self) -> Result<ExprRef> {
    let loc = self.ts.loc();
    let lit = std::mem::take(&mut self.ts.tok.lit);
    let bytes: Vec<char> = lit.chars().collect();
    let base = if bytes.first() == Some(&'0') {
      match bytes.get(1).map(|c| c.to_ascii_lowercase()) {
        Some('x') => 16,
        Some('b') => 2,
        _ => 8,
      }
    } else {
      10
    };
    let floatmarks: &[char] = if base == 16 { &['.', 'p', 'P'] } else { &['.', 'e', 'E'] };
    let e = if lit.contains(floatmarks) {
      let (val, suffix) = if base == 16 {
        hexfloat(&lit).ok_or_else(|| Error::new(&loc, format!("invalid floating constant '{lit}'")))?
      } else {
        let stripped = lit.trim_end_matches(['f', 'F', 'l', 'L']);
        let v = parse_decfloat(stripped)
          .ok_or_else(|| Error::new(&loc, format!("invalid floating constant '{lit}'")))?;
        (v, &lit[stripped.len()..])
      };
      let tys = &self.ctx.tys;
      let t = match suffix {
        "" => &tys.tdouble,
        "f" | "F" => &tys.tfloat,
        "l" | "L" => &tys.tldouble,
        _ => return Err(Error::new(&loc, format!("invalid floating constant suffix '{suffix}'"))),
      };
      mkfltconst(t, val)
    } else {
      let digits_at = match base {
        16 | 2 => 2,
        _ => 0,
      };
      let ndigits = bytes[digits_at..]
        .iter()
        .take_while(|c| c.is_digit(if base == 8 { 8 } else { base }))
        .count();
      let digits: String = bytes[digits_at..digits_at + ndigits].iter().collect();
      let suffix: String = bytes[digits_at + ndigits..].iter().collect();
      let val = u128::from_str_radix(&digits, base)
        .ok()
        .filter(|&v| v <= u64::MAX as u128)
        .ok_or_else(|| Error::new(&loc, format!("invalid integer constant '{lit}'")))?
        as u64;
      mkconst(&self.inttype(val, base == 10, &suffix)?, val)
    };
    self.ts.next()?;
    Ok(e)
  }

  /// Concatenate adjacent string literals and decode their contents. All
  /// literals must agree on a prefix; the element type follows it.
  pub fn stringconcat(&mut self, forceutf8: bool) -> Result<(Vec<u8>, Ty)> {
    assert_eq!(self.ts.kind(), TokenKind::StringLit);
    let mut parts: SmallVec<[(Vec<char>, Loc); 4]> = SmallVec::new();
    let mut kind = '\0';
    loop {
      let lit: Vec<char> = self.ts.tok.lit.chars().collect();
      let (newkind, body_at) = match lit.first() {
        Some('u') if lit.get(1) == Some(&'8') => ('8', 3),
        Some(&c @ ('u' | 'U' | 'L')) => (c, 2),
        Some('"') => ('\0', 1),
        _ => panic!("internal error: malformed string literal"),
      };
      if kind != newkind && kind != '\0' && newkind != '\0' {
        return self.ts.err("adjacent string literals have differing prefixes");
      }
      if newkind != '\0' {
        kind = newkind;
      }
      // strip the quotes
      parts.push((lit[body_at..lit.len() - 1].to_vec(), self.ts.loc()));
      self.ts.next()?;
      if self.ts.kind() != TokenKind::StringLit {
        break;
      }
    }
    if forceutf8 || kind == '8' {
      kind = '\0';
    }
    let tys = &self.ctx.tys;
    let t = match kind {
      '\0' => tys.tchar.clone(),
      'u' => tys.tushort.clone(),
      'U' => tys.tuint.clone(),
      _ => self.ctx.targ.typewchar.clone(),
    };
    let width = t.size.get();
    let mut buf = vec![];
    for (body, loc) in &parts {
      let mut cur = CharCursor::new(body);
      while !cur.done() {
        let (chr, hexoct) = decodechar(&mut cur, "string literal", loc)?;
        encodechar(&mut buf, width, chr, hexoct);
      }
    }
    encodechar(&mut buf, width, 0, false);
    Ok((buf, t))
  }

  fn generic(&mut self) -> Result<ExprRef> {
    self.ts.next()?;
    self.ts.expect(TokenKind::LParen, "after '_Generic'")?;
    let e = self.assignexpr()?;
    self.ts.expect(TokenKind::Comma, "after generic selector expression")?;
    let want = e.ty.clone();
    let mut matched: Option<ExprRef> = None;
    let mut def: Option<ExprRef> = None;
    loop {
      if self.ts.consume(TokenKind::Default)? {
        if def.is_some() {
          return self.ts.err("multiple default expressions in generic association list");
        }
        self.ts.expect(TokenKind::Colon, "after 'default'")?;
        def = Some(self.assignexpr()?);
      } else {
        let mut qual = TypeQual::empty();
        let Some(t) = self.typename(Some(&mut qual))? else {
          return self.ts.err("expected typename for generic association");
        };
        self.ts.expect(TokenKind::Colon, "after type name")?;
        let e = self.assignexpr()?;
        if compatible(&t, &want) && qual.is_empty() {
          if matched.is_some() {
            return self.ts.err("generic selector matches multiple associations");
          }
          matched = Some(e);
        }
      }
      if !self.ts.consume(TokenKind::Comma)? {
        break;
      }
    }
    self.ts.expect(TokenKind::RParen, "after generic association list")?;
    match matched.or(def) {
      Some(e) => Ok(e),
      None => self.ts.err("generic selector matches no associations and no default was specified"),
    }
  }

  fn charconst(&mut self) -> Result<ExprRef> {
    let loc = self.ts.loc();
    let lit: Vec<char> = self.ts.tok.lit.chars().collect();
    let tys = &self.ctx.tys;
    let (t, at) = match lit.first() {
      Some('L') => (self.ctx.targ.typewchar.clone(), 1),
      Some('u') if lit.get(1) == Some(&'8') => (tys.tuchar.clone(), 2),
      Some('u') => (tys.tushort.clone(), 1),
      Some('U') => (tys.tuint.clone(), 1),
      _ => (tys.tint.clone(), 0),
    };
    assert_eq!(lit[at], '\'');
    let body = &lit[at + 1..lit.len() - 1];
    let mut cur = CharCursor::new(body);
    let (chr, _) = decodechar(&mut cur, "character constant", &loc)?;
    if !cur.done() {
      return Err(Error::new(&loc, "character constant contains more than one character"));
    }
    self.ts.next()?;
    Ok(mkconst(&t, chr as u64))
  }

  fn primaryexpr(&mut self) -> Result<ExprRef> {
    use TokenKind::*;
    match self.ts.kind() {
      Ident => {
        let Some(d) = self.scope.get_decl(&self.ts.tok.lit, true) else {
          return self.ts.err(format!("undeclared identifier: {}", self.ts.tok.lit));
        };
        let mut e = mkexpr(ExprKind::Ident(d.clone()), &d.ty.borrow());
        e.qual = d.qual;
        e.lvalue = matches!(d.kind, DeclKind::Object);
        let mut e = Rc::new(e);
        if !matches!(d.kind, DeclKind::Builtin(_)) {
          e = decay(e);
        }
        self.ts.next()?;
        Ok(e)
      }
      StringLit => {
        let (data, elem) = self.stringconcat(false)?;
        let width = elem.size.get();
        let size = data.len() as u64 / width;
        let t = types::mkarray(elem, TypeQual::empty(), Some(size));
        let mut e = mkexpr(
          ExprKind::String(crate::expr::StringLit { data: std::cell::RefCell::new(data), width }),
          &t,
        );
        e.lvalue = true;
        Ok(decay(Rc::new(e)))
      }
      CharConst => self.charconst(),
      Number => self.number(),
      LParen => {
        self.ts.next()?;
        let e = self.expr()?;
        self.ts.expect(RParen, "after expression")?;
        Ok(e)
      }
      Generic => self.generic(),
      _ => self.ts.err("expected primary expression"),
    }
  }

  /// Walk `.name` and `[index]` designators after `__builtin_offsetof`.
  fn offsetof_designator(&mut self, mut t: Ty, offset: &mut u64) -> Result<()> {
    loop {
      match self.ts.kind() {
        TokenKind::LBrack => {
          if !t.is_array() {
            return self.ts.err("index designator is only valid for array types");
          }
          self.ts.next()?;
          let i = self.intconstexpr(false)?;
          self.ts.expect(TokenKind::RBrack, "for index designator")?;
          t = t.base();
          *offset += i * t.size.get();
        }
        TokenKind::Period => {
          if !t.is_struct_or_union() {
            return self.ts.err("member designator only valid for struct/union types");
          }
          self.ts.next()?;
          let name = self.ts.expect(TokenKind::Ident, "for member designator")?;
          let Some(m) = types::member(&t, &name, offset) else {
            return self.ts.err(format!("struct/union has no member named '{name}'"));
          };
          t = m.ty;
        }
        _ => return Ok(()),
      }
    }
  }

  fn builtinfunc(&mut self, kind: DeclBuiltin) -> Result<ExprRef> {
    let ctx = self.ctx;
    let tys = &ctx.tys;
    Ok(match kind {
      DeclBuiltin::Alloca => {
        let e = self.assignexpr()?;
        let e = self.exprassign(e, &tys.tulong)?;
        let t = mkpointer(tys.tvoid.clone(), TypeQual::empty());
        Rc::new(mkexpr(ExprKind::Builtin(BuiltinExpr::Alloca(e)), &t))
      }
      DeclBuiltin::ConstantP => {
        let e = self.condexpr()?;
        let folded = eval(ctx, &e)?;
        mkconst(&tys.tint, matches!(folded.kind, ExprKind::Const(_)) as u64)
      }
      DeclBuiltin::Expect => {
        // no-op: evaluate and return the expression itself
        let e = self.assignexpr()?;
        self.ts.expect(TokenKind::Comma, "after expression")?;
        self.assignexpr()?;
        e
      }
      DeclBuiltin::Inff => mkfltconst(&tys.tfloat, f64::INFINITY),
      DeclBuiltin::Nanf => {
        let e = self.assignexpr()?;
        let ok = e.decayed
          && matches!(&decayed_base(&e).kind, ExprKind::String(s) if s.units() <= 1);
        if !ok {
          return self.ts.err("__builtin_nanf currently only supports empty string literals");
        }
        mkfltconst(&tys.tfloat, f64::NAN)
      }
      DeclBuiltin::Offsetof => {
        let Some(t) = self.typename(None)? else {
          return self.ts.err("expected type name");
        };
        self.ts.expect(TokenKind::Comma, "after type name")?;
        let name = self.ts.expect(TokenKind::Ident, "after ','")?;
        if !t.is_struct_or_union() {
          return self.ts.err("type is not a struct/union type");
        }
        let mut offset = 0;
        let Some(m) = types::member(&t, &name, &mut offset) else {
          return self.ts.err(format!("struct/union has no member named '{name}'"));
        };
        self.offsetof_designator(m.ty, &mut offset)?;
        mkconst(&tys.tulong, offset)
      }
      DeclBuiltin::TypesCompatibleP => {
        let Some(t1) = self.typename(None)? else {
          return self.ts.err("expected type name");
        };
        self.ts.expect(TokenKind::Comma, "after type name")?;
        let Some(t2) = self.typename(None)? else {
          return self.ts.err("expected type name");
        };
        mkconst(&tys.tint, compatible(&t1, &t2) as u64)
      }
      DeclBuiltin::Unreachable => {
        Rc::new(mkexpr(ExprKind::Builtin(BuiltinExpr::Unreachable), &tys.tvoid))
      }
      DeclBuiltin::VaArg => {
        let mut ap = self.assignexpr()?;
        if !same(&ap.ty, &ctx.targ.typeadjvalist) {
          return self.ts.err("va_arg argument must have type va_list");
        }
        if Rc::ptr_eq(&ctx.targ.typeadjvalist, &ctx.targ.typevalist) {
          ap = self.mkunary(TokenKind::Band, ap)?;
        }
        self.ts.expect(TokenKind::Comma, "after va_list")?;
        let mut qual = TypeQual::empty();
        let Some(t) = self.typename(Some(&mut qual))? else {
          return self.ts.err("expected type name");
        };
        let mut e = mkexpr(ExprKind::Builtin(BuiltinExpr::VaArg(ap)), &t);
        e.qual = qual;
        Rc::new(e)
      }
      DeclBuiltin::VaCopy => {
        let mut dst = self.assignexpr()?;
        if !same(&dst.ty, &ctx.targ.typeadjvalist) {
          return self.ts.err("va_copy destination must have type va_list");
        }
        if !Rc::ptr_eq(&ctx.targ.typeadjvalist, &ctx.targ.typevalist) {
          dst = self.mkunary(TokenKind::Mul, dst)?;
        }
        self.ts.expect(TokenKind::Comma, "after target va_list")?;
        let mut src = self.assignexpr()?;
        if !same(&src.ty, &ctx.targ.typeadjvalist) {
          return self.ts.err("va_copy source must have type va_list");
        }
        if !Rc::ptr_eq(&ctx.targ.typeadjvalist, &ctx.targ.typevalist) {
          src = self.mkunary(TokenKind::Mul, src)?;
        }
        Rc::new(mkexpr(ExprKind::Assign { l: dst, r: src }, &tys.tvoid))
      }
      DeclBuiltin::VaEnd => {
        let e = self.assignexpr()?;
        if !same(&e.ty, &ctx.targ.typeadjvalist) {
          return self.ts.err("va_end argument must have type va_list");
        }
        Rc::new(mkexpr(ExprKind::Cast { base: e }, &tys.tvoid))
      }
      DeclBuiltin::VaStart => {
        let mut ap = self.assignexpr()?;
        if !same(&ap.ty, &ctx.targ.typeadjvalist) {
          return self.ts.err("va_start argument must have type va_list");
        }
        if Rc::ptr_eq(&ctx.targ.typeadjvalist, &ctx.targ.typevalist) {
          ap = self.mkunary(TokenKind::Band, ap)?;
        }
        self.ts.expect(TokenKind::Comma, "after va_list")?;
        let param = self.assignexpr()?;
        if !matches!(decayed_base(&param).kind, ExprKind::Ident(_)) {
          return self.ts.err("expected parameter identifier");
        }
        Rc::new(mkexpr(ExprKind::Builtin(BuiltinExpr::VaStart(ap)), &tys.tvoid))
      }
    })
  }

  fn mkincdec(&self, op: TokenKind, base: ExprRef, post: bool) -> Result<ExprRef> {
    let loc = self.ts.loc();
    if !base.lvalue {
      return Err(Error::new(&loc, format!("operand of '{op}' operator must be an lvalue")));
    }
    if base.qual.contains(TypeQual::CONST) {
      return Err(Error::new(&loc, format!("operand of '{op}' operator is const qualified")));
    }
    let t = base.ty.clone();
    Ok(Rc::new(mkexpr(ExprKind::IncDec { op, post, base }, &t)))
  }

  fn postfixexpr(&mut self, r: Option<ExprRef>) -> Result<ExprRef> {
    use TokenKind::*;
    let mut r = match r {
      Some(r) => r,
      None => self.primaryexpr()?,
    };
    loop {
      let e = match self.ts.kind() {
        LBrack => {
          self.ts.next()?;
          let mut arr = r;
          let mut idx = self.expr()?;
          if !arr.ty.is_pointer() {
            if !idx.ty.is_pointer() {
              return self.ts.err("either array or index must be pointer type");
            }
            std::mem::swap(&mut arr, &mut idx);
          }
          if arr.ty.base().incomplete.get() {
            return self.ts.err("array is pointer to incomplete type");
          }
          if !idx.ty.prop.contains(TypeProp::INT) {
            return self.ts.err("index is not an integer type");
          }
          let loc = self.ts.loc();
          let e = self.mkunary(Mul, self.mkbinary(&loc, Add, arr, idx)?)?;
          self.ts.expect(RBrack, "after array index")?;
          e
        }
        LParen => {
          self.ts.next()?;
          if let ExprKind::Ident(d) = &decayed_base(&r).kind
            && let DeclKind::Builtin(b) = d.kind
          {
            let e = self.builtinfunc(b)?;
            self.ts.expect(RParen, "after builtin parameters")?;
            r = e;
            continue;
          }
          if !r.ty.is_pointer() || !r.ty.base().is_func() {
            return self.ts.err("called object is not a function");
          }
          let functype = r.ty.base();
          let fd = functype.func();
          let mut args: Vec<ExprRef> = vec![];
          while self.ts.kind() != RParen {
            if !args.is_empty() {
              self.ts.expect(Comma, "or ')' after function call argument")?;
            }
            if args.len() >= fd.params.len() && !fd.isvararg && fd.paraminfo {
              return self.ts.err("too many arguments for function call");
            }
            let mut a = self.assignexpr()?;
            a = if !fd.isprototype || (fd.isvararg && args.len() >= fd.params.len()) {
              self.exprpromote(a)
            } else {
              self.exprassign(a, &fd.params[args.len()].ty())?
            };
            args.push(a);
          }
          if args.len() < fd.params.len() && !fd.isvararg && fd.paraminfo {
            return self.ts.err("not enough arguments for function call");
          }
          self.ts.next()?;
          let e = Rc::new(mkexpr(ExprKind::Call { func: r, args }, &functype.base()));
          decay(e)
        }
        Period | Arrow => {
          let op = self.ts.kind();
          if op == Period {
            r = self.mkunary(Band, r)?;
          }
          if !r.ty.is_pointer() {
            return self.ts.err(format!("'{op}' operator must be applied to pointer to struct/union"));
          }
          let t = r.ty.base();
          let tq = r.ty.base_qual();
          if !t.is_struct_or_union() {
            return self.ts.err(format!("'{op}' operator must be applied to pointer to struct/union"));
          }
          self.ts.next()?;
          if self.ts.kind() != Ident {
            return self.ts.err(format!("expected identifier after '{op}' operator"));
          }
          let lvalue = op == Arrow
            || matches!(&r.kind, ExprKind::Unary { base, .. } if base.lvalue);
          let mut offset = 0;
          let Some(m) = types::member(&t, &self.ts.tok.lit, &mut offset) else {
            return self.ts.err(format!("struct/union has no member named '{}'", self.ts.tok.lit));
          };
          let ulong = &self.ctx.tys.tulong;
          let sum = Rc::new(mkexpr(
            ExprKind::Binary { op: Add, l: exprconvert(r, ulong), r: mkconst(ulong, offset) },
            &mkpointer(m.ty.clone(), tq | m.qual),
          ));
          let mut e = self.mkunary(Mul, sum)?;
          set_lvalue(&mut e, lvalue);
          if m.bits.any() {
            let t = e.ty.clone();
            let mut bf = mkexpr(ExprKind::Bitfield { base: e, bits: m.bits }, &t);
            bf.lvalue = lvalue;
            e = Rc::new(bf);
          }
          self.ts.next()?;
          e
        }
        Inc | Dec => {
          let e = self.mkincdec(self.ts.kind(), r, true)?;
          self.ts.next()?;
          e
        }
        _ => return Ok(r),
      };
      r = e;
    }
  }

  fn unaryexpr(&mut self) -> Result<ExprRef> {
    use TokenKind::*;
    let op = self.ts.kind();
    Ok(match op {
      Inc | Dec => {
        self.ts.next()?;
        let l = self.unaryexpr()?;
        self.mkincdec(op, l, false)?
      }
      Band | Mul => {
        self.ts.next()?;
        let e = self.castexpr()?;
        self.mkunary(op, e)?
      }
      Add => {
        self.ts.next()?;
        let e = self.castexpr()?;
        if !e.ty.prop.contains(TypeProp::ARITH) {
          return self.ts.err("operand of unary '+' operator must have arithmetic type");
        }
        if e.ty.prop.contains(TypeProp::INT) { self.exprpromote(e) } else { e }
      }
      Sub => {
        self.ts.next()?;
        let mut e = self.castexpr()?;
        if !e.ty.prop.contains(TypeProp::ARITH) {
          return self.ts.err("operand of unary '-' operator must have arithmetic type");
        }
        if e.ty.prop.contains(TypeProp::INT) {
          e = self.exprpromote(e);
        }
        let t = e.ty.clone();
        Rc::new(mkexpr(ExprKind::Unary { op, base: e }, &t))
      }
      Bnot => {
        self.ts.next()?;
        let mut e = self.castexpr()?;
        if !e.ty.prop.contains(TypeProp::INT) {
          return self.ts.err("operand of '~' operator must have integer type");
        }
        e = self.exprpromote(e);
        let loc = self.ts.loc();
        let t = e.ty.clone();
        self.mkbinary(&loc, Xor, e, mkconst(&t, u64::MAX))?
      }
      Lnot => {
        self.ts.next()?;
        let e = self.castexpr()?;
        if !e.ty.prop.contains(TypeProp::SCALAR) {
          return self.ts.err("operator '!' must have scalar operand");
        }
        let loc = self.ts.loc();
        let zero = mkconst(&self.ctx.tys.tint, 0);
        self.mkbinary(&loc, Eql, e, zero)?
      }
      Sizeof | Alignof => {
        self.ts.next()?;
        let mut t = None;
        let mut e = None;
        if self.ts.consume(LParen)? {
          t = self.typename(None)?;
          if t.is_some() {
            self.ts.expect(RParen, "after type name")?;
            // might be part of a compound literal
            if op == Sizeof && self.ts.kind() == LBrace {
              self.parseinit(t.as_ref().expect("type name"))?;
            }
          } else {
            let inner = self.expr()?;
            self.ts.expect(RParen, "after expression")?;
            e = Some(if op == Sizeof { self.postfixexpr(Some(inner))? } else { inner });
          }
        } else if op == Sizeof {
          e = Some(self.unaryexpr()?);
        } else {
          return self.ts.err("expected '(' after 'alignof'");
        }
        let t = match t {
          Some(t) => t,
          None => {
            let e = e.expect("operand");
            let e = decayed_base(&e);
            if matches!(e.kind, ExprKind::Bitfield { .. }) {
              return self.ts.err(format!("'{op}' operator applied to bitfield expression"));
            }
            e.ty.clone()
          }
        };
        if t.incomplete.get() {
          return self.ts.err(format!("'{op}' operator applied to incomplete type"));
        }
        if t.is_func() {
          return self.ts.err(format!("'{op}' operator applied to function type"));
        }
        let v = if op == Sizeof { t.size.get() } else { t.align.get() as u64 };
        mkconst(&self.ctx.tys.tulong, v)
      }
      _ => self.postfixexpr(None)?,
    })
  }

  fn castexpr(&mut self) -> Result<ExprRef> {
    use TokenKind::*;
    if self.ts.consume(LParen)? {
      let mut tq = TypeQual::empty();
      let t = self.typename(Some(&mut tq))?;
      let Some(t) = t else {
        let e = self.expr()?;
        self.ts.expect(RParen, "after expression to match '('")?;
        return self.postfixexpr(Some(e));
      };
      self.ts.expect(RParen, "after type name")?;
      if self.ts.kind() == LBrace {
        let init = self.parseinit(&t)?;
        let mut e = mkexpr(ExprKind::Compound { init }, &t);
        e.qual = tq;
        e.lvalue = true;
        return self.postfixexpr(Some(decay(Rc::new(e))));
      }
      if !t.is_void() && !t.prop.contains(TypeProp::SCALAR) {
        return self.ts.err("cast type must be scalar");
      }
      let e = self.castexpr()?;
      if !t.is_void() && !e.ty.prop.contains(TypeProp::SCALAR) {
        return self.ts.err("cast operand must have scalar type");
      }
      return Ok(Rc::new(mkexpr(ExprKind::Cast { base: e }, &t)));
    }
    self.unaryexpr()
  }

  fn binaryexpr(&mut self, l: Option<ExprRef>, i: i32) -> Result<ExprRef> {
    let mut l = match l {
      Some(l) => l,
      None => self.castexpr()?,
    };
    loop {
      let j = precedence(self.ts.kind());
      if j < i {
        return Ok(l);
      }
      let op = self.ts.kind();
      let loc = self.ts.loc();
      self.ts.next()?;
      let mut r = self.castexpr()?;
      loop {
        let k = precedence(self.ts.kind());
        if k <= j {
          break;
        }
        r = self.binaryexpr(Some(r), k)?;
      }
      l = self.mkbinary(&loc, op, l, r)?;
    }
  }

  pub fn condexpr(&mut self) -> Result<ExprRef> {
    let ctx = self.ctx;
    let e = self.binaryexpr(None, 0)?;
    if !self.ts.consume(TokenKind::Question)? {
      return Ok(e);
    }
    let mut l = self.expr()?;
    self.ts.expect(TokenKind::Colon, "in conditional expression")?;
    let mut r = self.condexpr()?;

    let lt = l.ty.clone();
    let rt = r.ty.clone();
    let t;
    if Rc::ptr_eq(&lt, &rt) {
      t = lt;
    } else if lt.prop.contains(TypeProp::ARITH) && rt.prop.contains(TypeProp::ARITH) {
      t = self.usualconvert(&mut l, &mut r);
    } else if lt.is_void() && rt.is_void() {
      t = ctx.tys.tvoid.clone();
    } else {
      l = eval(ctx, &l)?;
      r = eval(ctx, &r)?;
      if nullpointer(&l) && rt.is_pointer() {
        t = rt;
      } else if nullpointer(&r) && lt.is_pointer() {
        t = lt;
      } else if lt.is_pointer() && rt.is_pointer() {
        let tq = lt.base_qual() | rt.base_qual();
        let lb = lt.base();
        let rb = rt.base();
        let m = if lb.is_void() || rb.is_void() {
          ctx.tys.tvoid.clone()
        } else if compatible(&lb, &rb) {
          types::composite(&lb, &rb)
        } else {
          return self.ts.err("operands of conditional operator must have compatible types");
        };
        t = mkpointer(m, tq);
      } else {
        return self.ts.err("invalid operands to conditional operator");
      }
    }
    let e = eval(ctx, &e)?;
    if let ExprKind::Const(c) = &e.kind
      && e.ty.prop.contains(TypeProp::INT)
    {
      return Ok(exprconvert(if c.int() != 0 { l } else { r }, &t));
    }
    Ok(Rc::new(mkexpr(ExprKind::Cond { cond: e, t: l, f: r }, &t)))
  }

  pub fn constexpr(&mut self) -> Result<ExprRef> {
    let e = self.condexpr()?;
    eval(self.ctx, &e)
  }

  /// A constant expression required to fold to an integer.
  pub fn intconstexpr(&mut self, allowneg: bool) -> Result<u64> {
    let e = self.constexpr()?;
    let ExprKind::Const(c) = &e.kind else {
      return self.ts.err("not an integer constant expression");
    };
    if !e.ty.prop.contains(TypeProp::INT) {
      return self.ts.err("not an integer constant expression");
    }
    let v = c.int();
    if !allowneg && e.ty.is_signed() && v >> 63 != 0 {
      return self.ts.err("integer constant expression cannot be negative");
    }
    Ok(v)
  }

  fn mkassign(&self, l: ExprRef, r: ExprRef) -> Result<ExprRef> {
    let t = l.ty.clone();
    let r = self.exprassign(r, &t)?;
    Ok(Rc::new(mkexpr(ExprKind::Assign { l, r }, &t)))
  }

  pub fn assignexpr(&mut self) -> Result<ExprRef> {
    use TokenKind::*;
    let l = self.condexpr()?;
    if matches!(l.kind, ExprKind::Binary { .. } | ExprKind::Comma { .. } | ExprKind::Cast { .. }) {
      return Ok(l);
    }
    let op = match self.ts.kind() {
      Assign => None,
      MulAssign => Some(Mul),
      DivAssign => Some(Div),
      ModAssign => Some(Mod),
      AddAssign => Some(Add),
      SubAssign => Some(Sub),
      ShlAssign => Some(Shl),
      ShrAssign => Some(Shr),
      BandAssign => Some(Band),
      XorAssign => Some(Xor),
      BorAssign => Some(Bor),
      _ => return Ok(l),
    };
    if !l.lvalue {
      return self.ts.err("left side of assignment expression is not an lvalue");
    }
    self.ts.next()?;
    let r = self.assignexpr()?;
    let Some(op) = op else { return self.mkassign(l, r) };
    // rewrite `E1 op= E2` as `T = &E1, *T = *T op E2` where T is a
    // temporary holding the address of E1, evaluated once
    let (l, bits) = match &l.kind {
      ExprKind::Bitfield { base, bits } => (base.clone(), Some(*bits)),
      _ => (l, None),
    };
    let tmp = Rc::new(Expr {
      kind: ExprKind::Temp(Cell::new(None)),
      ty: mkpointer(l.ty.clone(), l.qual),
      qual: TypeQual::empty(),
      lvalue: true,
      decayed: false,
    });
    let addr = self.mkunary(Band, l)?;
    let save = self.mkassign(tmp.clone(), addr)?;
    let mut lhs = self.mkunary(Mul, tmp)?;
    if let Some(bits) = bits {
      let t = lhs.ty.clone();
      let mut bf = mkexpr(ExprKind::Bitfield { base: lhs, bits }, &t);
      bf.lvalue = true;
      lhs = Rc::new(bf);
    }
    let loc = self.ts.loc();
    let rhs = self.mkbinary(&loc, op, lhs.clone(), r)?;
    let update = self.mkassign(lhs.clone(), rhs)?;
    let t = lhs.ty.clone();
    Ok(Rc::new(mkexpr(ExprKind::Comma { exprs: vec![save, update] }, &t)))
  }

  pub fn expr(&mut self) -> Result<ExprRef> {
    let mut exprs = vec![self.assignexpr()?];
    while self.ts.consume(TokenKind::Comma)? {
      exprs.push(self.assignexpr()?);
    }
    if exprs.len() == 1 {
      return Ok(exprs.pop().expect("expression"));
    }
    let t = exprs.last().expect("expression").ty.clone();
    Ok(Rc::new(mkexpr(ExprKind::Comma { exprs }, &t)))
  }
}
