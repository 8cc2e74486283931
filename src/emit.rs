//! Textual IR output: functions with their blocks and folded call
//! argument lists, data records with `z` gap padding and bit-field byte
//! combining, and aggregate type definitions.

use std::fmt::Write as _;
use std::rc::Rc;

use hashbrown::HashSet;
use itertools::Itertools;

use crate::decl::{Decl, Linkage};
use crate::eval::eval;
use crate::expr::{ExprKind, ExprRef};
use crate::init::Init;
use crate::ir::{BlockId, Class, Func, Jump, Opcode, Value, repr};
use crate::token::TokenKind;
use crate::types::{Bitfield, Ty, TypeProp, alignup};
use crate::{Context, Error, Result};

fn gfmt(x: f64) -> String {
  if x.is_nan() {
    "nan".into()
  } else if x.is_infinite() {
    if x < 0.0 { "-inf".into() } else { "inf".into() }
  } else {
    format!("{x}")
  }
}

/// Render an operand with its sigil: `$` global (`.L` prefix when
/// private), `%` temporary, `:` aggregate type, bare constants otherwise.
fn vstr(ctx: &Context, v: Value) -> String {
  match v {
    Value::Int(i) => i.to_string(),
    Value::Flt(x) => format!("s_{}", gfmt(x)),
    Value::Dbl(x) => format!("d_{}", gfmt(x)),
    Value::Temp(id) => format!("%.{id}"),
    Value::Global(g) => {
      let globals = ctx.globals.borrow();
      let gi = &globals[g.0 as usize];
      if gi.id != 0 { format!("$.L{}.{}", gi.name, gi.id) } else { format!("${}", gi.name) }
    }
    Value::TypeRef(i) => {
      let typerefs = ctx.typerefs.borrow();
      match &typerefs[i as usize] {
        Some(name) => format!(":{}.{}", name, i + 1),
        None => format!(":.{}", i + 1),
      }
    }
  }
}

/// The class position of an instruction or parameter: an aggregate type
/// reference when one is attached, the class letter otherwise.
fn cstr(ctx: &Context, class: Option<Class>, v: Option<Value>) -> String {
  if let Some(v @ Value::TypeRef(_)) = v {
    return vstr(ctx, v);
  }
  match class {
    Some(c) => c.ch().to_string(),
    None => panic!("internal error: type has no QBE representation"),
  }
}

/// Emit the aggregate type definition for `t` if it is a struct or union
/// without one yet, member types first. Struct members sharing a storage
/// unit collapse into one item; unions nest each member in its own braces.
pub fn emittype(ctx: &Context, t: &Ty) -> Result<()> {
  if t.value.get().is_some() || !t.is_struct_or_union() {
    return Ok(());
  }
  let idx = {
    let mut typerefs = ctx.typerefs.borrow_mut();
    typerefs.push(t.struct_def().tag.clone());
    typerefs.len() as u32 - 1
  };
  t.value.set(Some(Value::TypeRef(idx)));
  {
    let members = t.struct_def().members.borrow();
    for m in members.iter() {
      let mut sub = m.ty.clone();
      while sub.is_array() {
        sub = sub.base();
      }
      emittype(ctx, &sub)?;
    }
  }
  let mut s = format!("type {} = ", vstr(ctx, Value::TypeRef(idx)));
  if Rc::ptr_eq(t, &ctx.targ.valiststruct) {
    let _ = writeln!(s, "align {} {{ {} }}", t.align.get(), t.size.get());
    ctx.write(&s);
    return Ok(());
  }
  s.push_str("{ ");
  let members = t.struct_def().members.borrow();
  let isstruct = !t.is_union();
  let mut i = 0;
  while i < members.len() {
    let mut mi = i;
    let mut off = 0;
    if isstruct {
      // pick the representative member of this storage unit
      for j in i + 1..members.len() {
        if members[j].offset >= alignup(members[mi].offset + 1, 8) {
          break;
        }
        if members[j].offset <= members[mi].offset {
          mi = j;
        }
      }
      off = members[mi].offset + members[mi].ty.size.get();
    } else {
      s.push_str("{ ");
    }
    let mut count = 1;
    let mut sub = members[mi].ty.clone();
    while sub.is_array() {
      count *= sub.array_len();
      sub = sub.base();
    }
    match sub.value.get() {
      Some(v @ Value::TypeRef(_)) => s.push_str(&vstr(ctx, v)),
      _ => s.push(repr(&sub)?.data),
    }
    if count > 1 {
      let _ = write!(s, " {count}");
    }
    if isstruct {
      s.push_str(", ");
      // skip members contained in the same storage unit
      let mut j = mi + 1;
      while j < members.len() && members[j].offset < off {
        j += 1;
      }
      i = j;
    } else {
      s.push_str(" } ");
      i += 1;
    }
  }
  s.push_str("}\n");
  ctx.write(&s);
  Ok(())
}

/// The lazily-emitted `__func__` data record.
pub fn funcname(ctx: &Context, v: Value, name: &str) -> Result<()> {
  ctx.write(&format!("data {} = {{ b \"{name}\", b 0 }}\n", vstr(ctx, v)));
  Ok(())
}

fn dataitem(ctx: &Context, e: &ExprRef, size: u64, s: &mut String) -> Result<()> {
  match &e.kind {
    ExprKind::Unary { op, base } => {
      if *op != TokenKind::Band {
        panic!("internal error: not an address expression");
      }
      let ExprKind::Ident(d) = &base.kind else {
        return Err(Error::Msg("initializer is not a constant expression".into()));
      };
      let v = d.value.get().expect("global value");
      assert!(matches!(v, Value::Global(_)), "internal error: not a global");
      s.push_str(&vstr(ctx, v));
    }
    ExprKind::Binary { op, l, r } => {
      if *op != TokenKind::Add
        || !matches!(l.kind, ExprKind::Unary { .. })
        || !matches!(r.kind, ExprKind::Const(_))
      {
        return Err(Error::Msg("initializer is not a constant expression".into()));
      }
      dataitem(ctx, l, 0, s)?;
      s.push_str(" + ");
      dataitem(ctx, r, 0, s)?;
    }
    ExprKind::Const(c) => {
      if e.ty.prop.contains(TypeProp::FLOAT) {
        let sigil = if e.ty.size.get() == 4 { 's' } else { 'd' };
        let _ = write!(s, "{sigil}_{}", gfmt(c.float()));
      } else {
        let _ = write!(s, "{}", c.int());
      }
    }
    ExprKind::String(lit) => {
      let w = lit.width;
      let units = lit.units();
      let mut i = 0;
      if w == 1 {
        s.push('"');
        while i < units && i < size {
          let c = lit.unit(i) as u8;
          if c.is_ascii_graphic() && c != b'"' && c != b'\\' || c == b' ' {
            s.push(c as char);
          } else {
            let _ = write!(s, "\\{c:03o}");
          }
          i += 1;
        }
        s.push('"');
      } else {
        while i < units && i * w < size {
          let _ = write!(s, "{} ", lit.unit(i));
          i += 1;
        }
      }
      if i * w < size {
        let _ = write!(s, ", z {}", size - i * w);
      }
    }
    _ => return Err(Error::Msg("initializer is not a constant expression".into())),
  }
  Ok(())
}

/// Serialize an object's initializer list sorted by offset, filling gaps
/// with `z` records and packing contiguous bit-fields into bytes. A
/// missing list emits a fully zeroed object (tentative definitions).
pub fn data(ctx: &Context, d: &Decl, init: Option<&[Init]>) -> Result<()> {
  struct Rec {
    start: u64,
    end: u64,
    bits: Bitfield,
    expr: ExprRef,
  }
  let mut recs: Vec<Rec> = vec![];
  if let Some(init) = init {
    for i in init {
      recs.push(Rec { start: i.start, end: i.end, bits: i.bits, expr: eval(ctx, &i.expr)? });
    }
  }
  let mut s = String::new();
  if d.linkage == Linkage::Extern {
    s.push_str("export ");
  }
  let _ = write!(
    s,
    "data {} = align {} {{ ",
    vstr(ctx, d.value.get().expect("global value")),
    d.align.get()
  );

  let mut offset: u64 = 0;
  let mut bits: u64 = 0;
  let mut i = 0;
  while i < recs.len() {
    let cur_at = i;
    // fold records landing inside this one into its units
    while i + 1 < recs.len()
      && (recs[i + 1].start * 8 + recs[i + 1].bits.before as u64)
        < (recs[cur_at].end * 8 - recs[cur_at].bits.after as u64)
    {
      let cur = &recs[cur_at];
      let next = &recs[i + 1];
      let ExprKind::String(lit) = &cur.expr.kind else {
        panic!("internal error: overlapping initializer is not a string");
      };
      let ExprKind::Const(c) = &next.expr.kind else {
        panic!("internal error: overlapping initializer is not a constant");
      };
      lit.set_unit((next.start - cur.start) / lit.width, c.int());
      i += 1;
    }
    let cur = &recs[cur_at];
    let start = cur.start + cur.bits.before as u64 / 8;
    let end = cur.end - (cur.bits.after as u64 + 7) / 8;
    if offset < start && bits != 0 {
      // unfinished byte from the previous bit-field
      let _ = write!(s, "b {}, ", bits & 0xff);
      offset += 1;
      bits = 0;
    }
    if offset < start {
      let _ = write!(s, "z {}, ", start - offset);
    }
    if cur.bits.any() {
      let ExprKind::Const(c) = &cur.expr.kind else {
        return Err(Error::Msg("initializer is not a constant expression".into()));
      };
      assert!(cur.expr.ty.prop.contains(TypeProp::INT));
      bits |= c.int() << (cur.bits.before % 8);
      let mut o = start;
      while o < end {
        let _ = write!(s, "b {}, ", bits & 0xff);
        bits >>= 8;
        o += 1;
      }
      // clear the upper `after` bits in the last byte, or all bits when
      // the field ended on a byte boundary
      bits &= 0x7f >> ((cur.bits.after + 7) % 8);
    } else {
      let mut t = cur.expr.ty.clone();
      if t.is_array() {
        t = t.base();
      }
      let _ = write!(s, "{} ", repr(&t)?.data);
      dataitem(ctx, &cur.expr, cur.end - cur.start, &mut s)?;
      s.push_str(", ");
    }
    offset = end.max(start);
    i += 1;
  }
  if bits != 0 {
    let _ = write!(s, "b {}, ", bits & 0xff);
    offset += 1;
  }
  let size = d.ty.borrow().size.get();
  assert!(offset <= size);
  if offset < size {
    let _ = write!(s, "z {} ", size - offset);
  }
  s.push_str("}\n");
  ctx.write(&s);
  Ok(())
}

fn labelstr(f: &Func, b: BlockId) -> String {
  format!("@{}.{}", f[b].name, f[b].id)
}

/// Serialize a finished function. Unreferenced dead blocks (created after
/// a terminator) are omitted.
pub fn func(ctx: &Context, f: &mut Func, global: bool) -> Result<()> {
  let last = *f.order.last().expect("function has blocks");
  if f[last].jump.is_none() {
    // implicitly return 0 from main when control reaches the end
    let v = if f.name == "main" && Rc::ptr_eq(&f.ty.base(), &ctx.tys.tint) {
      Some(Value::Int(0))
    } else {
      None
    };
    f.ret(v);
  }
  let mut referenced: HashSet<BlockId> = HashSet::new();
  for &b in &f.order {
    match f[b].jump {
      Some(Jump::Jmp(l)) => {
        referenced.insert(l);
      }
      Some(Jump::Jnz(_, l1, l2)) => {
        referenced.insert(l1);
        referenced.insert(l2);
      }
      _ => {}
    }
    if let Some(phi) = &f[b].phi {
      referenced.extend(phi.pred);
    }
  }

  let mut s = String::new();
  if global {
    s.push_str("export\n");
  }
  s.push_str("function ");
  let rt = f.ty.base();
  if !rt.is_void() {
    let _ = write!(s, "{} ", cstr(ctx, repr(&rt)?.class, rt.value.get()));
  }
  s.push_str(&vstr(ctx, f.decl.value.get().expect("function global")));
  s.push('(');
  let params = &f.ty.func().params;
  let mut parts = Vec::with_capacity(params.len());
  for p in params {
    let pt = p.ty();
    parts.push(format!(
      "{} {}",
      cstr(ctx, repr(&pt)?.class, pt.value.get()),
      vstr(ctx, p.value.get().expect("parameter value"))
    ));
  }
  s.push_str(&parts.iter().join(", "));
  if f.ty.func().isvararg {
    s.push_str(", ...");
  }
  s.push_str(") {\n");

  for &bid in &f.order {
    let b = &f[bid];
    if b.dead && !referenced.contains(&bid) {
      continue;
    }
    let _ = writeln!(s, "{}", labelstr(f, bid));
    if let Some(phi) = &b.phi {
      let _ = writeln!(
        s,
        "\t{} ={} phi {} {}, {} {}",
        vstr(ctx, phi.res),
        phi.class.ch(),
        labelstr(f, phi.pred[0]),
        vstr(ctx, phi.val[0]),
        labelstr(f, phi.pred[1]),
        vstr(ctx, phi.val[1]),
      );
    }
    let mut idx = 0;
    while idx < b.insts.len() {
      let inst = &b.insts[idx];
      s.push('\t');
      if let Some(res) = inst.res {
        let _ = write!(s, "{} ={} ", vstr(ctx, res), cstr(ctx, inst.class, inst.arg[1]));
      }
      let _ = write!(s, "{} {}", inst.op.name(), vstr(ctx, inst.arg[0].expect("operand")));
      idx += 1;
      if inst.op == Opcode::Call {
        s.push('(');
        let mut first = true;
        while idx < b.insts.len() {
          let arg = &b.insts[idx];
          if arg.op == Opcode::Vararg {
            s.push_str(", ...");
            idx += 1;
            continue;
          }
          if arg.op != Opcode::Arg {
            break;
          }
          if !first {
            s.push_str(", ");
          }
          first = false;
          let _ = write!(
            s,
            "{} {}",
            cstr(ctx, arg.class, arg.arg[1]),
            vstr(ctx, arg.arg[0].expect("argument value"))
          );
          idx += 1;
        }
        s.push(')');
      } else if let Some(a1) = inst.arg[1] {
        let _ = write!(s, ", {}", vstr(ctx, a1));
      }
      s.push('\n');
    }
    match &b.jump {
      Some(Jump::Ret(v)) => {
        s.push_str("\tret");
        if let Some(v) = v {
          let _ = write!(s, " {}", vstr(ctx, *v));
        }
        s.push('\n');
      }
      Some(Jump::Jmp(l)) => {
        let _ = writeln!(s, "\tjmp {}", labelstr(f, *l));
      }
      Some(Jump::Jnz(v, l1, l2)) => {
        let _ = writeln!(
          s,
          "\tjnz {}, {}, {}",
          vstr(ctx, *v),
          labelstr(f, *l1),
          labelstr(f, *l2)
        );
      }
      None => {}
    }
  }
  s.push_str("}\n");
  ctx.write(&s);
  Ok(())
}
