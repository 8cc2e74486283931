//! Initializer elaboration (C11 6.7.9): brace-nested designators walk a
//! cursor over the target object, producing a sorted list of byte/bit
//! ranges with owning expressions. Later ranges displace earlier ones they
//! cover; a range contained in an earlier one stays after it, overriding
//! the covered units at emission time.

use arrayvec::ArrayVec;

use crate::decl::Parser;
use crate::expr::{ExprKind, ExprRef, decayed_base};
use crate::token::TokenKind;
use crate::types::{Bitfield, Ty, TypeKind, TypeProp, compatible};
use crate::{Error, Result};

/// One elaborated initializer record covering `[start, end)` bytes of the
/// object, refined by `bits` when the target is a bit-field.
pub struct Init {
  pub start: u64,
  pub end: u64,
  pub bits: Bitfield,
  pub expr: ExprRef,
}

const MAXDEPTH: usize = 32;

struct Object {
  offset: u64,
  ty: Ty,
  iscur: bool,
  idx: u64,
  mem: usize,
}

struct InitParser {
  obj: ArrayVec<Object, MAXDEPTH>,
  cur: Option<usize>,
  sub: usize,
  init: Vec<Init>,
  /// Position from which overlap scanning resumes.
  last: usize,
}

fn bitrange(i: &Init) -> (u64, u64) {
  (i.start * 8 + i.bits.before as u64, i.end * 8 - i.bits.after as u64)
}

impl InitParser {
  fn initadd(&mut self, new: Init) {
    let (ns, ne) = bitrange(&new);
    let mut i = self.last;
    while let Some(old) = self.init.get(i) {
      let (os, oe) = bitrange(old);
      if oe <= ns {
        // no overlap yet
        i += 1;
        continue;
      }
      if ne <= os {
        // no overlap, insert before `old`
        break;
      }
      if oe <= ne {
        // `new` covers this and possibly following initializers
        let mut j = i;
        while j < self.init.len() && bitrange(&self.init[j]).1 <= ne {
          j += 1;
        }
        self.init.drain(i..j);
        break;
      }
      // `old` covers `new`, keep looking
      i += 1;
    }
    self.init.insert(i, new);
    self.last = i + 1;
  }

  fn subobj(&mut self, t: Ty, off: u64) -> Result<()> {
    let off = off + self.obj[self.sub].offset;
    self.sub += 1;
    if self.sub == MAXDEPTH {
      return Err(Error::Msg("too many designators".into()));
    }
    let o = Object { offset: off, ty: t, iscur: false, idx: 0, mem: 0 };
    if self.sub == self.obj.len() {
      self.obj.push(o);
    } else {
      self.obj[self.sub] = o;
    }
    Ok(())
  }

  fn findmember(&mut self, name: &str) -> Result<bool> {
    let t = self.obj[self.sub].ty.clone();
    let n = t.struct_def().members.borrow().len();
    for i in 0..n {
      let m = t.struct_def().members.borrow()[i].clone();
      match &m.name {
        Some(mn) => {
          if mn == name {
            self.obj[self.sub].mem = i;
            self.subobj(m.ty, m.offset)?;
            return Ok(true);
          }
        }
        None => {
          self.obj[self.sub].mem = i;
          self.subobj(m.ty.clone(), m.offset)?;
          if self.findmember(name)? {
            return Ok(true);
          }
          self.sub -= 1;
        }
      }
    }
    Ok(false)
  }

  fn focus(&mut self) -> Result<()> {
    let t = self.obj[self.sub].ty.clone();
    let sub = match &t.kind {
      TypeKind::Array(..) => {
        self.obj[self.sub].idx = 0;
        if t.incomplete.get() {
          updatearray(&t, 0);
        }
        t.base()
      }
      TypeKind::Struct(_) | TypeKind::Union(_) => {
        self.obj[self.sub].mem = 0;
        t.struct_def().members.borrow()[0].ty.clone()
      }
      _ => panic!("internal error: init cursor has unexpected type"),
    };
    self.subobj(sub, 0)
  }
}

/// Extend an incomplete array to cover index `i`.
fn updatearray(t: &Ty, i: u64) {
  if !t.incomplete.get() {
    return;
  }
  let TypeKind::Array(d, len) = &t.kind else { panic!("not an array") };
  if i + 1 > len.get() {
    len.set(i + 1);
    t.size.set((i + 1) * d.base.size.get());
  }
}

impl Parser<'_> {
  fn designator(&mut self, p: &mut InitParser) -> Result<()> {
    p.last = 0;
    p.sub = p.cur.expect("designator outside braces");
    loop {
      let t = p.obj[p.sub].ty.clone();
      match self.ts.kind() {
        TokenKind::LBrack => {
          if !t.is_array() {
            return self.ts.err("index designator is only valid for array types");
          }
          self.ts.next()?;
          let i = self.intconstexpr(false)?;
          p.obj[p.sub].idx = i;
          if t.incomplete.get() {
            updatearray(&t, i);
          } else if i >= t.array_len() {
            return self.ts.err("index designator is larger than array length");
          }
          self.ts.expect(TokenKind::RBrack, "for index designator")?;
          let base = t.base();
          let sz = base.size.get();
          p.subobj(base, i * sz)?;
        }
        TokenKind::Period => {
          if !t.is_struct_or_union() {
            return self.ts.err("member designator only valid for struct/union types");
          }
          self.ts.next()?;
          let name = self.ts.expect(TokenKind::Ident, "for member designator")?;
          if !p.findmember(&name)? {
            let what = if t.is_union() { "union" } else { "struct" };
            return self.ts.err(format!("{what} has no member named '{name}'"));
          }
        }
        _ => {
          self.ts.expect(TokenKind::Assign, "after designator")?;
          return Ok(());
        }
      }
    }
  }

  fn advance(&mut self, p: &mut InitParser) -> Result<()> {
    loop {
      p.sub -= 1;
      let t = p.obj[p.sub].ty.clone();
      match &t.kind {
        TypeKind::Array(..) => {
          p.obj[p.sub].idx += 1;
          let i = p.obj[p.sub].idx;
          if t.incomplete.get() {
            updatearray(&t, i);
          }
          if i < t.array_len() {
            let base = t.base();
            let sz = base.size.get();
            return p.subobj(base, sz * i);
          }
        }
        TypeKind::Struct(_) => {
          p.obj[p.sub].mem += 1;
          let i = p.obj[p.sub].mem;
          let m = t.struct_def().members.borrow().get(i).cloned();
          if let Some(m) = m {
            return p.subobj(m.ty, m.offset);
          }
        }
        _ => {}
      }
      if Some(p.sub) == p.cur {
        return self.ts.err("too many initializers for type");
      }
    }
  }

  /// Parse a brace-or-scalar initializer for an object of type `t`.
  pub fn parseinit(&mut self, t: &Ty) -> Result<Vec<Init>> {
    let mut p = InitParser {
      obj: ArrayVec::new(),
      cur: None,
      sub: 0,
      init: vec![],
      last: 0,
    };
    p.obj.push(Object { offset: 0, ty: t.clone(), iscur: false, idx: 0, mem: 0 });
    if t.incomplete.get() && !t.is_array() {
      return self.ts.err("initializer specified for incomplete type");
    }
    'outer: loop {
      if let Some(cur) = p.cur {
        if matches!(self.ts.kind(), TokenKind::LBrack | TokenKind::Period) {
          self.designator(&mut p)?;
        } else if p.sub != cur {
          self.advance(&mut p)?;
        } else if p.obj[cur].ty.is_struct_or_union() {
          p.focus()?;
        }
      }
      let mut skip_clear = false;
      if self.ts.consume(TokenKind::LBrace)? {
        if self.ts.consume(TokenKind::RBrace)? {
          if p.obj[p.sub].ty.incomplete.get() {
            return self.ts.err("array of unknown size has empty initializer");
          }
          skip_clear = true;
        } else {
          if p.cur == Some(p.sub) {
            if p.obj[p.sub].ty.prop.contains(TypeProp::SCALAR) {
              return self.ts.err("nested braces around scalar initializer");
            }
            assert!(p.obj[p.sub].ty.is_array());
            p.focus()?;
          }
          p.cur = Some(p.sub);
          p.obj[p.sub].iscur = true;
          continue 'outer;
        }
      } else {
        let mut expr = self.assignexpr()?;
        loop {
          let t = p.obj[p.sub].ty.clone();
          match &t.kind {
            TypeKind::Array(..) => {
              let base = t.base();
              if expr.decayed
                && matches!(decayed_base(&expr).kind, ExprKind::String(_))
                && base.prop.contains(TypeProp::INT)
              {
                let s = decayed_base(&expr).clone();
                let selem = s.ty.base();
                if !(base.prop.contains(TypeProp::CHAR) && selem.prop.contains(TypeProp::CHAR))
                  && !compatible(&base, &selem)
                {
                  return self.ts.err("cannot initialize array with string literal of different width");
                }
                if t.incomplete.get() {
                  let units = match &s.kind {
                    ExprKind::String(lit) => lit.units(),
                    _ => unreachable!(),
                  };
                  updatearray(&t, units - 1);
                }
                expr = s;
                break;
              }
            }
            TypeKind::Struct(_) | TypeKind::Union(_) => {
              if compatible(&expr.ty, &t) {
                break;
              }
            }
            _ => {
              assert!(t.prop.contains(TypeProp::SCALAR));
              expr = self.exprassign(expr, &t)?;
              break;
            }
          }
          p.focus()?;
        }
        let bits = if p.sub > 0 && p.obj[p.sub - 1].ty.is_struct_or_union() {
          let parent = &p.obj[p.sub - 1];
          parent.ty.struct_def().members.borrow()[parent.mem].bits
        } else {
          Bitfield::default()
        };
        let (start, sz) = (p.obj[p.sub].offset, p.obj[p.sub].ty.size.get());
        p.initadd(Init { start, end: start + sz, bits, expr });
      }
      loop {
        if !skip_clear && p.obj[p.sub].ty.incomplete.get() {
          p.obj[p.sub].ty.incomplete.set(false);
        }
        skip_clear = false;
        if p.cur.is_none() {
          return Ok(p.init);
        }
        if self.ts.consume(TokenKind::Comma)? {
          if self.ts.kind() != TokenKind::RBrace {
            continue 'outer;
          }
        } else if self.ts.kind() != TokenKind::RBrace {
          return self.ts.err("expected ',' or '}' after initializer");
        }
        self.ts.next()?;
        let cur = p.cur.expect("open brace");
        p.sub = cur;
        let mut c = cur;
        p.cur = loop {
          if c == 0 {
            break None;
          }
          c -= 1;
          if p.obj[c].iscur {
            break Some(c);
          }
        };
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn mk(start: u64, end: u64, before: u32, after: u32) -> Init {
    Init {
      start,
      end,
      bits: Bitfield { before, after },
      expr: crate::expr::mkconst(&crate::types::Types::new().tint, 0),
    }
  }

  fn parser() -> InitParser {
    let mut p = InitParser { obj: ArrayVec::new(), cur: None, sub: 0, init: vec![], last: 0 };
    p.obj.push(Object {
      offset: 0,
      ty: crate::types::Types::new().tint,
      iscur: false,
      idx: 0,
      mem: 0,
    });
    p
  }

  #[test]
  fn initadd_sorted_non_overlapping() {
    let mut p = parser();
    p.initadd(mk(0, 4, 0, 0));
    p.last = 0;
    p.initadd(mk(8, 12, 0, 0));
    p.last = 0;
    p.initadd(mk(4, 8, 0, 0));
    let ranges: Vec<_> = p.init.iter().map(|i| (i.start, i.end)).collect();
    assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 12)]);
  }

  #[test]
  fn initadd_later_covers_earlier() {
    let mut p = parser();
    p.initadd(mk(0, 4, 0, 0));
    p.last = 0;
    p.initadd(mk(4, 8, 0, 0));
    p.last = 0;
    p.initadd(mk(0, 8, 0, 0));
    let ranges: Vec<_> = p.init.iter().map(|i| (i.start, i.end)).collect();
    assert_eq!(ranges, vec![(0, 8)]);
  }

  #[test]
  fn initadd_contained_follows_container() {
    // the contained record stays after its container, so data emission
    // can fold it into the covered units
    let mut p = parser();
    p.initadd(mk(0, 16, 0, 0));
    p.last = 0;
    p.initadd(mk(4, 8, 0, 0));
    let ranges: Vec<_> = p.init.iter().map(|i| (i.start, i.end)).collect();
    assert_eq!(ranges, vec![(0, 16), (4, 8)]);
  }

  #[test]
  fn initadd_bit_precise() {
    // two bit-fields in the same storage unit do not displace each other
    let mut p = parser();
    p.initadd(mk(0, 4, 0, 29));
    p.last = 0;
    p.initadd(mk(0, 4, 3, 24));
    assert_eq!(p.init.len(), 2);
    assert_eq!(p.init[0].bits.before, 0);
    assert_eq!(p.init[1].bits.before, 3);
  }
}
