//! Fold-only constant evaluation. Folding builds fresh nodes instead of
//! mutating in place; anything that does not fold comes back with its
//! children folded as far as they go, which is the shape the data emitter
//! expects for address constants like `&x + 4`.

use std::rc::Rc;

use crate::decl::{DeclKind, stringdecl};
use crate::expr::{Constant, ExprKind, ExprRef, mkconst, mkexpr, mkfltconst};
use crate::token::TokenKind;
use crate::types::{Ty, TypeProp};
use crate::{Context, Error, Result};

/// Bring a 64-bit fold result into range for `t`: zero-masked for narrow
/// unsigned types, sign-extended for narrow signed ones. Folded constants
/// then match what the emitted IR computes at runtime.
fn normalize(t: &Ty, v: u64) -> u64 {
  if !t.prop.contains(TypeProp::INT) {
    return v;
  }
  if t.is_bool() {
    return (v != 0) as u64;
  }
  let bits = t.size.get() * 8;
  if bits >= 64 {
    return v;
  }
  let masked = v & (u64::MAX >> (64 - bits));
  if t.is_signed() && masked >> (bits - 1) != 0 { masked | (u64::MAX << bits) } else { masked }
}

fn foldcast(dst: &Ty, src: &Ty, c: Constant) -> Constant {
  if dst.prop.contains(TypeProp::FLOAT) {
    let v = if src.prop.contains(TypeProp::INT) {
      if src.is_signed() { c.int() as i64 as f64 } else { c.int() as f64 }
    } else {
      c.float()
    };
    Constant::Float(v)
  } else if src.prop.contains(TypeProp::FLOAT) {
    let f = c.float();
    let v = if dst.is_signed() { f as i64 as u64 } else { f as u64 };
    Constant::Int(normalize(dst, v))
  } else {
    Constant::Int(normalize(dst, c.int()))
  }
}

fn intconst(e: &ExprRef) -> Option<u64> {
  match &e.kind {
    ExprKind::Const(c) => Some(c.int()),
    _ => None,
  }
}

pub fn eval(ctx: &Context, e: &ExprRef) -> Result<ExprRef> {
  match &e.kind {
    ExprKind::Ident(d) => {
      if !matches!(d.kind, DeclKind::Const) {
        return Ok(e.clone());
      }
      let crate::ir::Value::Int(v) = d.value.get().expect("constant value") else {
        panic!("internal error: constant declaration has no integer value");
      };
      Ok(mkconst(&d.ty.borrow(), v))
    }
    ExprKind::Unary { op: TokenKind::Band, base } => {
      let l = eval(ctx, base)?;
      match &l.kind {
        // &*p is p
        ExprKind::Unary { op: TokenKind::Mul, base: inner } => eval(ctx, inner),
        ExprKind::String(_) => {
          let d = stringdecl(ctx, &l)?;
          let mut ident = mkexpr(ExprKind::Ident(d), &l.ty);
          ident.lvalue = true;
          let mut ne = mkexpr(ExprKind::Unary { op: TokenKind::Band, base: Rc::new(ident) }, &e.ty);
          ne.decayed = e.decayed;
          Ok(Rc::new(ne))
        }
        _ => {
          let mut ne = mkexpr(ExprKind::Unary { op: TokenKind::Band, base: l }, &e.ty);
          ne.decayed = e.decayed;
          ne.qual = e.qual;
          Ok(Rc::new(ne))
        }
      }
    }
    ExprKind::Unary { op: TokenKind::Sub, base } => {
      let l = eval(ctx, base)?;
      if let ExprKind::Const(c) = &l.kind {
        if e.ty.prop.contains(TypeProp::FLOAT) {
          return Ok(mkfltconst(&e.ty, -c.float()));
        }
        return Ok(mkconst(&e.ty, normalize(&e.ty, c.int().wrapping_neg())));
      }
      Ok(Rc::new(mkexpr(ExprKind::Unary { op: TokenKind::Sub, base: l }, &e.ty)))
    }
    ExprKind::Cast { base } => {
      let l = eval(ctx, base)?;
      if let ExprKind::Const(c) = &l.kind {
        let mut ne = mkexpr(ExprKind::Const(foldcast(&e.ty, &l.ty, *c)), &e.ty);
        ne.qual = e.qual;
        return Ok(Rc::new(ne));
      }
      if l.ty.is_pointer() && e.ty.is_pointer() {
        return Ok(l);
      }
      Ok(Rc::new(mkexpr(ExprKind::Cast { base: l }, &e.ty)))
    }
    ExprKind::Binary { op, l, r } => {
      let op = *op;
      let l = eval(ctx, l)?;
      let r = eval(ctx, r)?;
      let rebuild = |l: ExprRef, r: ExprRef| {
        Ok(Rc::new(mkexpr(ExprKind::Binary { op, l, r }, &e.ty)))
      };
      let ExprKind::Const(lc) = &l.kind else { return rebuild(l, r) };
      if op == TokenKind::Lor {
        return Ok(if lc.int() == 0 { r } else { l });
      }
      if op == TokenKind::Land {
        return Ok(if lc.int() != 0 { r } else { l });
      }
      let ExprKind::Const(rc) = &r.kind else { return rebuild(l, r) };
      let (lc, rc) = (*lc, *rc);
      if l.ty.prop.contains(TypeProp::FLOAT) {
        let (a, b) = (lc.float(), rc.float());
        let int = |v: bool| Ok(mkconst(&e.ty, v as u64));
        return match op {
          TokenKind::Mul => Ok(mkfltconst(&e.ty, a * b)),
          TokenKind::Div => Ok(mkfltconst(&e.ty, a / b)),
          TokenKind::Add => Ok(mkfltconst(&e.ty, a + b)),
          TokenKind::Sub => Ok(mkfltconst(&e.ty, a - b)),
          TokenKind::Less => int(a < b),
          TokenKind::Greater => int(a > b),
          TokenKind::Leq => int(a <= b),
          TokenKind::Geq => int(a >= b),
          TokenKind::Eql => int(a == b),
          TokenKind::Neq => int(a != b),
          _ => panic!("internal error: unknown binary expression"),
        };
      }
      let signed = l.ty.is_signed();
      let (a, b) = (lc.int(), rc.int());
      let (sa, sb) = (a as i64, b as i64);
      let arith = |v: u64| Ok(mkconst(&e.ty, normalize(&e.ty, v)));
      let cmp = |v: bool| Ok(mkconst(&e.ty, v as u64));
      let divcheck = || {
        if b == 0 {
          Err(Error::Msg("division by zero in constant expression".into()))
        } else {
          Ok(())
        }
      };
      match op {
        TokenKind::Mul => arith(a.wrapping_mul(b)),
        TokenKind::Div => {
          divcheck()?;
          arith(if signed { sa.wrapping_div(sb) as u64 } else { a / b })
        }
        TokenKind::Mod => {
          divcheck()?;
          arith(if signed { sa.wrapping_rem(sb) as u64 } else { a % b })
        }
        TokenKind::Add => arith(a.wrapping_add(b)),
        TokenKind::Sub => arith(a.wrapping_sub(b)),
        TokenKind::Shl => arith(a.wrapping_shl(b as u32 & 63)),
        TokenKind::Shr => {
          arith(if signed { (sa >> (b & 63)) as u64 } else { a >> (b & 63) })
        }
        TokenKind::Band => arith(a & b),
        TokenKind::Bor => arith(a | b),
        TokenKind::Xor => arith(a ^ b),
        TokenKind::Less => cmp(if signed { sa < sb } else { a < b }),
        TokenKind::Greater => cmp(if signed { sa > sb } else { a > b }),
        TokenKind::Leq => cmp(if signed { sa <= sb } else { a <= b }),
        TokenKind::Geq => cmp(if signed { sa >= sb } else { a >= b }),
        TokenKind::Eql => cmp(a == b),
        TokenKind::Neq => cmp(a != b),
        _ => panic!("internal error: unknown binary expression"),
      }
    }
    ExprKind::Cond { cond, t, f } => {
      let c = eval(ctx, cond)?;
      match intconst(&c) {
        Some(v) => eval(ctx, if v != 0 { t } else { f }),
        None => Ok(Rc::new(mkexpr(
          ExprKind::Cond { cond: c, t: t.clone(), f: f.clone() },
          &e.ty,
        ))),
      }
    }
    _ => Ok(e.clone()),
  }
}
