//! The SSA IR: typed values, instructions, blocks with optional two-input
//! phis, and the per-function builder the statement and declaration parsers
//! drive. Lowering appends to the current block; once a block's terminator
//! is set, further instructions land in an unplaced "dead" block that the
//! emitter drops unless something still references it.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::decl::{Decl, DeclKind, Linkage, stringdecl};
use crate::emit;
use crate::expr::{BuiltinExpr, ExprKind, ExprRef};
use crate::init::Init;
use crate::token::{Loc, TokenKind};
use crate::types::{self, Bitfield, Ty, TypeProp, TypeQual, compatible};
use crate::{Context, Error, Result};

/// Index of a block within its function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId(pub u32);

/// Index of a global symbol in the context's global table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GlobalId(pub u32);

/// An IR operand.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Value {
  Global(GlobalId),
  Int(u64),
  /// Single-precision float constant, emitted as `s_...`.
  Flt(f64),
  /// Double-precision float constant, emitted as `d_...`.
  Dbl(f64),
  Temp(u32),
  /// Reference to an emitted aggregate type definition (`:tag.N`).
  TypeRef(u32),
}

/// QBE base class of a value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Class {
  W,
  L,
  S,
  D,
}

impl Class {
  pub fn ch(self) -> char {
    match self {
      Class::W => 'w',
      Class::L => 'l',
      Class::S => 's',
      Class::D => 'd',
    }
  }
}

/// Pointers are lowered in the `l` class.
pub const PTR_CLASS: Class = Class::L;

macro_rules! opcodes {
  ($($name:ident: $text:literal,)*) => {
    /// The closed instruction set.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum Opcode { $($name),* }

    impl Opcode {
      pub fn name(self) -> &'static str {
        match self { $(Opcode::$name => $text),* }
      }
    }
  }
}

opcodes! {
  Add: "add", Sub: "sub", Mul: "mul", Div: "div", Udiv: "udiv",
  Rem: "rem", Urem: "urem", Neg: "neg",
  And: "and", Or: "or", Xor: "xor", Shl: "shl", Shr: "shr", Sar: "sar",
  Ceqw: "ceqw", Ceql: "ceql", Ceqs: "ceqs", Ceqd: "ceqd",
  Cnew: "cnew", Cnel: "cnel", Cnes: "cnes", Cned: "cned",
  Csltw: "csltw", Csgtw: "csgtw", Cslew: "cslew", Csgew: "csgew",
  Cultw: "cultw", Cugtw: "cugtw", Culew: "culew", Cugew: "cugew",
  Csltl: "csltl", Csgtl: "csgtl", Cslel: "cslel", Csgel: "csgel",
  Cultl: "cultl", Cugtl: "cugtl", Culel: "culel", Cugel: "cugel",
  Clts: "clts", Cgts: "cgts", Cles: "cles", Cges: "cges",
  Cltd: "cltd", Cgtd: "cgtd", Cled: "cled", Cged: "cged",
  Loadub: "loadub", Loadsb: "loadsb", Loaduh: "loaduh", Loadsh: "loadsh",
  Loadw: "loadw", Loadl: "loadl", Loads: "loads", Loadd: "loadd",
  Storeb: "storeb", Storeh: "storeh", Storew: "storew", Storel: "storel",
  Stores: "stores", Stored: "stored",
  Extsb: "extsb", Extub: "extub", Extsh: "extsh", Extuh: "extuh",
  Extsw: "extsw", Extuw: "extuw",
  Exts: "exts", Truncd: "truncd",
  Stosi: "stosi", Stoui: "stoui", Dtosi: "dtosi", Dtoui: "dtoui",
  Swtof: "swtof", Uwtof: "uwtof", Sltof: "sltof", Ultof: "ultof",
  Alloc4: "alloc4", Alloc8: "alloc8", Alloc16: "alloc16",
  Vastart: "vastart", Vaarg: "vaarg",
  Call: "call", Arg: "arg", Vararg: "vararg",
}

/// The QBE rendering of a C type: base class, data-item letter, and the
/// load/store opcodes matching its size and signedness.
#[derive(Clone, Copy)]
pub struct Repr {
  pub class: Option<Class>,
  pub data: char,
  pub load: Opcode,
  pub store: Opcode,
}

const fn mkrepr(class: Class, data: char, load: Opcode, store: Opcode) -> Repr {
  Repr { class: Some(class), data, load, store }
}

/// Map a type to its QBE representation. Aggregates are addressed through
/// pointers, so they render in the `l` class.
pub fn repr(t: &Ty) -> Result<Repr> {
  const UB: Repr = mkrepr(Class::W, 'b', Opcode::Loadub, Opcode::Storeb);
  const SB: Repr = mkrepr(Class::W, 'b', Opcode::Loadsb, Opcode::Storeb);
  const UH: Repr = mkrepr(Class::W, 'h', Opcode::Loaduh, Opcode::Storeh);
  const SH: Repr = mkrepr(Class::W, 'h', Opcode::Loadsh, Opcode::Storeh);
  const W: Repr = mkrepr(Class::W, 'w', Opcode::Loadw, Opcode::Storew);
  const L: Repr = mkrepr(Class::L, 'l', Opcode::Loadl, Opcode::Storel);
  const S: Repr = mkrepr(Class::S, 's', Opcode::Loads, Opcode::Stores);
  const D: Repr = mkrepr(Class::D, 'd', Opcode::Loadd, Opcode::Stored);

  if t.is_void() {
    return Ok(Repr { class: None, data: '\0', load: Opcode::Loadl, store: Opcode::Storel });
  }
  if !t.prop.contains(TypeProp::SCALAR) {
    return Ok(L);
  }
  Ok(match t.size.get() {
    1 => {
      if t.is_signed() {
        SB
      } else {
        UB
      }
    }
    2 => {
      if t.is_signed() {
        SH
      } else {
        UH
      }
    }
    4 => {
      if t.prop.contains(TypeProp::FLOAT) {
        S
      } else {
        W
      }
    }
    8 => {
      if t.prop.contains(TypeProp::FLOAT) {
        D
      } else {
        L
      }
    }
    16 => return Err(Error::Msg("long double is not yet supported".into())),
    _ => panic!("internal error: type has no QBE representation"),
  })
}

#[derive(Debug)]
pub struct Inst {
  pub op: Opcode,
  pub class: Option<Class>,
  pub res: Option<Value>,
  pub arg: [Option<Value>; 2],
}

#[derive(Clone, Copy, Debug)]
pub enum Jump {
  Jmp(BlockId),
  Jnz(Value, BlockId, BlockId),
  Ret(Option<Value>),
}

#[derive(Debug)]
pub struct Phi {
  pub class: Class,
  pub pred: [BlockId; 2],
  pub val: [Value; 2],
  pub res: Value,
}

pub struct Block {
  pub name: Rc<str>,
  pub id: u32,
  pub insts: Vec<Inst>,
  pub phi: Option<Phi>,
  pub jump: Option<Jump>,
  /// Created after a terminator; dropped by the emitter when unreferenced.
  pub dead: bool,
}

/// An addressable location, with the bit-field layout when the lvalue
/// designates one.
#[derive(Clone, Copy)]
pub struct Lvalue {
  pub addr: Value,
  pub bits: Bitfield,
}

impl Lvalue {
  pub fn plain(addr: Value) -> Lvalue {
    Lvalue { addr, bits: Bitfield::default() }
  }
}

pub struct GotoLabel {
  pub blk: BlockId,
  pub defined: bool,
}

/// A function under construction.
pub struct Func {
  pub decl: Rc<Decl>,
  pub name: String,
  pub ty: Ty,
  pub blocks: Vec<Block>,
  /// Emission order of placed blocks.
  pub order: Vec<BlockId>,
  pub start: BlockId,
  cur: BlockId,
  pub gotos: HashMap<String, GotoLabel>,
  lastid: u32,
  namedecl: Option<Rc<Decl>>,
}

impl Index<BlockId> for Func {
  type Output = Block;
  fn index(&self, i: BlockId) -> &Block {
    &self.blocks[i.0 as usize]
  }
}

impl IndexMut<BlockId> for Func {
  fn index_mut(&mut self, i: BlockId) -> &mut Block {
    &mut self.blocks[i.0 as usize]
  }
}

impl Func {
  /// Start a new function: a `start` block for parameter slots and allocs,
  /// then a `body` label where statement lowering begins. Parameters are
  /// spilled to fresh slots unless they are aggregates passed by reference.
  pub fn new(
    ctx: &Context,
    decl: Rc<Decl>,
    name: &str,
    t: Ty,
    scope: &mut crate::scope::Scope,
  ) -> Result<Func> {
    let mut f = Func {
      decl,
      name: name.to_string(),
      ty: t.clone(),
      blocks: vec![],
      order: vec![],
      start: BlockId(0),
      cur: BlockId(0),
      gotos: HashMap::new(),
      lastid: 0,
      namedecl: None,
    };
    let start = f.new_block(ctx, "start");
    f.place(start);
    f.start = start;
    emit::emittype(ctx, &t.base())?;

    let loc = Loc { file: Rc::from("<prologue>"), line: 0, col: 0 };
    for p in &t.func().params {
      let pt = if t.func().isprototype {
        p.ty()
      } else {
        ctx.tys.promote(&p.ty(), None)
      };
      emit::emittype(ctx, &pt)?;
      let v = f.temp();
      p.value.set(Some(v));
      let Some(name) = &p.name else { continue };
      let d = Rc::new(Decl::new(DeclKind::Object, p.ty(), p.qual.get(), Linkage::None));
      if p.ty().value.get().is_some() {
        // aggregate parameter: the temporary already holds its address
        d.value.set(Some(v));
      } else {
        let v = if compatible(&p.ty(), &pt) {
          v
        } else {
          f.convert(ctx, &p.ty(), &pt, v)?.expect("parameter conversion")
        };
        f.init(ctx, &loc, &d, None)?;
        f.store(ctx, &loc, &p.ty(), TypeQual::empty(), Lvalue::plain(d.value.get().expect("slot")), v)?;
      }
      scope.put_decl(name.clone(), d);
    }

    let fnty = types::mkarray(ctx.tys.tchar.clone(), TypeQual::CONST, Some(name.len() as u64 + 1));
    let d = Rc::new(Decl::new(DeclKind::Object, fnty, TypeQual::empty(), Linkage::None));
    d.value.set(Some(ctx.mkglobal("__func__", true)));
    scope.put_decl("__func__", d.clone());
    f.namedecl = Some(d);

    let body = f.new_block(ctx, "body");
    f.place(body);
    Ok(f)
  }

  pub fn new_block(&mut self, ctx: &Context, name: &str) -> BlockId {
    let id = ctx.labelid.get() + 1;
    ctx.labelid.set(id);
    self.blocks.push(Block {
      name: Rc::from(name),
      id,
      insts: vec![],
      phi: None,
      jump: None,
      dead: false,
    });
    BlockId(self.blocks.len() as u32 - 1)
  }

  fn place(&mut self, b: BlockId) {
    self.order.push(b);
    self.cur = b;
  }

  /// Place `b` as the next block in emission order and make it current.
  pub fn label(&mut self, b: BlockId) {
    self.place(b);
  }

  pub fn temp(&mut self) -> Value {
    self.lastid += 1;
    Value::Temp(self.lastid)
  }

  fn emit(
    &mut self,
    ctx: &Context,
    op: Opcode,
    class: Option<Class>,
    arg0: Option<Value>,
    arg1: Option<Value>,
  ) -> Option<Value> {
    if self[self.cur].jump.is_some() {
      let b = self.new_block(ctx, "dead");
      self[b].dead = true;
      self.place(b);
    }
    let res = if class.is_some() && op != Opcode::Arg { Some(self.temp()) } else { None };
    let cur = self.cur;
    self[cur].insts.push(Inst { op, class, res, arg: [arg0, arg1] });
    res
  }

  fn emit_r(&mut self, ctx: &Context, op: Opcode, class: Class, arg0: Value, arg1: Option<Value>) -> Value {
    self.emit(ctx, op, Some(class), Some(arg0), arg1).expect("instruction has a result")
  }

  pub fn jmp(&mut self, l: BlockId) {
    let cur = self.cur;
    let b = &mut self[cur];
    if b.jump.is_none() {
      b.jump = Some(Jump::Jmp(l));
    }
  }

  pub fn jnz(&mut self, ctx: &Context, v: Value, t: Option<&Ty>, l1: BlockId, l2: BlockId) -> Result<()> {
    if self[self.cur].jump.is_some() {
      return Ok(());
    }
    let mut v = v;
    if let Some(t) = t {
      assert!(t.prop.contains(TypeProp::SCALAR));
      // QBE cannot fold away a bool conversion for int, so only convert
      // where jnz would otherwise see the wrong width
      if t.prop.contains(TypeProp::INT) && t.size.get() < 4 {
        v = self.convert(ctx, &ctx.tys.tint, t, v)?.expect("conversion");
      } else if t.prop.contains(TypeProp::FLOAT) || t.size.get() > 4 {
        v = self.convert(ctx, &ctx.tys.tbool, t, v)?.expect("conversion");
      }
    }
    let cur = self.cur;
    self[cur].jump = Some(Jump::Jnz(v, l1, l2));
    Ok(())
  }

  pub fn ret(&mut self, v: Option<Value>) {
    let cur = self.cur;
    let b = &mut self[cur];
    if b.jump.is_none() {
      b.jump = Some(Jump::Ret(v));
    }
  }

  /// The block for a goto label, created on first mention.
  pub fn goto_label(&mut self, ctx: &Context, name: &str) -> BlockId {
    if let Some(g) = self.gotos.get(name) {
      return g.blk;
    }
    let blk = self.new_block(ctx, name);
    self.gotos.insert(name.to_string(), GotoLabel { blk, defined: false });
    blk
  }

  /// Allocate a stack slot for `d` in the start block.
  pub fn alloc(&mut self, loc: &Loc, d: &Decl) -> Result<()> {
    let t = d.ty.borrow().clone();
    if t.incomplete.get() || t.size.get() == 0 {
      return Err(Error::new(loc, "object has incomplete type"));
    }
    let mut size = t.size.get();
    let align = d.align.get();
    let op = match align {
      1 | 2 | 4 => Opcode::Alloc4,
      8 => Opcode::Alloc8,
      16 => Opcode::Alloc16,
      _ => {
        size += align as u64 - 16;
        Opcode::Alloc16
      }
    };
    let res = self.temp();
    let start = self.start;
    self[start].insts.push(Inst {
      op,
      class: Some(PTR_CLASS),
      res: Some(res),
      arg: [Some(Value::Int(size)), None],
    });
    let mut v = res;
    if align > 16 {
      // round the pointer up to the requested alignment
      for (op, arg) in [(Opcode::Add, align as u64 - 16), (Opcode::And, !(align as u64 - 1))] {
        let res = self.temp();
        let start = self.start;
        self[start].insts.push(Inst {
          op,
          class: Some(PTR_CLASS),
          res: Some(res),
          arg: [Some(v), Some(Value::Int(arg))],
        });
        v = res;
      }
    }
    d.value.set(Some(v));
    Ok(())
  }

  /// Extract a bit-field from a loaded storage unit: shift the field's low
  /// bit to position 0 with the right sign behavior.
  fn bits(&mut self, ctx: &Context, t: &Ty, mut v: Value, b: Bitfield) -> Value {
    let class = if t.size.get() <= 4 { Class::W } else { Class::L };
    let mut bits = b.after;
    if bits != 0 {
      bits += ((((t.size.get() + 3) & !3) - t.size.get()) * 8) as u32;
      v = self.emit_r(ctx, Opcode::Shl, class, v, Some(Value::Int(bits as u64)));
    }
    bits += b.before;
    if bits != 0 {
      let op = if t.is_signed() { Opcode::Sar } else { Opcode::Shr };
      v = self.emit_r(ctx, op, class, v, Some(Value::Int(bits as u64)));
    }
    v
  }

  /// Copy `size` bytes with power-of-two strides at the given alignment.
  fn copy(&mut self, ctx: &Context, mut dst: Value, mut src: Value, size: u64, align: u32) {
    assert!(align.is_power_of_two());
    let (load, store, class, align) = match align {
      1 => (Opcode::Loadub, Opcode::Storeb, Class::W, 1),
      2 => (Opcode::Loaduh, Opcode::Storeh, Class::W, 2),
      4 => (Opcode::Loadw, Opcode::Storew, Class::W, 4),
      _ => (Opcode::Loadl, Opcode::Storel, Class::L, 8),
    };
    let inc = Value::Int(align);
    let mut off = 0;
    loop {
      let tmp = self.emit_r(ctx, load, class, src, None);
      self.emit(ctx, store, None, Some(tmp), Some(dst));
      off += align;
      if off >= size {
        break;
      }
      src = self.emit_r(ctx, Opcode::Add, PTR_CLASS, src, Some(inc));
      dst = self.emit_r(ctx, Opcode::Add, PTR_CLASS, dst, Some(inc));
    }
  }

  /// Store `v` into `lval`. For bit-fields the stored unit is merged with a
  /// mask; the returned value is the field read back (truncated and
  /// sign-adjusted), which is the value of an assignment expression.
  pub fn store(
    &mut self,
    ctx: &Context,
    loc: &Loc,
    t: &Ty,
    tq: TypeQual,
    lval: Lvalue,
    mut v: Value,
  ) -> Result<Value> {
    if tq.contains(TypeQual::VOLATILE) {
      return Err(Error::new(loc, "volatile store is not yet supported"));
    }
    if tq.contains(TypeQual::CONST) {
      return Err(Error::new(loc, "cannot store to 'const' object"));
    }
    assert!(!lval.bits.any() || t.prop.contains(TypeProp::INT));
    let mut r = v;
    if t.is_struct_or_union() || t.is_array() {
      self.copy(ctx, lval.addr, v, t.size.get(), t.align.get());
      return Ok(r);
    }
    let t = if t.is_pointer() { &ctx.tys.tulong } else { t };
    assert!(t.prop.contains(TypeProp::SCALAR));
    let qt = repr(t)?;
    let class = qt.class.expect("scalar class");
    let bits = lval.bits.before + lval.bits.after;
    if bits != 0 {
      let w = t.size.get() as u32 * 8;
      let mask = (u64::MAX >> (64 - w + bits)) << lval.bits.before;
      v = self.emit_r(ctx, Opcode::Shl, class, v, Some(Value::Int(lval.bits.before as u64)));
      r = self.bits(ctx, t, v, lval.bits);
      v = self.emit_r(ctx, Opcode::And, class, v, Some(Value::Int(mask)));
      let old = self.emit_r(ctx, qt.load, class, lval.addr, None);
      let old = self.emit_r(ctx, Opcode::And, class, old, Some(Value::Int(!mask)));
      v = self.emit_r(ctx, Opcode::Or, class, v, Some(old));
    }
    self.emit(ctx, qt.store, None, Some(v), Some(lval.addr));
    Ok(r)
  }

  /// Load from `lval`. Aggregates evaluate to their address.
  pub fn load(&mut self, ctx: &Context, t: &Ty, lval: Lvalue) -> Result<Value> {
    if t.is_struct_or_union() || t.is_array() {
      return Ok(lval.addr);
    }
    let qt = repr(t)?;
    let v = self.emit_r(ctx, qt.load, qt.class.expect("scalar class"), lval.addr, None);
    Ok(self.bits(ctx, t, v, lval.bits))
  }

  /// Convert `l` from `src` to `dst`. Conversion to `_Bool` compares
  /// against zero in the source's class; widening within a signedness is a
  /// plain extension; int/float conversions pick the matching opcode.
  pub fn convert(&mut self, ctx: &Context, dst: &Ty, src: &Ty, mut l: Value) -> Result<Option<Value>> {
    let tys = &ctx.tys;
    let src = if src.is_pointer() { &tys.tulong } else { src };
    let dst = if dst.is_pointer() { &tys.tulong } else { dst };
    if dst.is_void() {
      return Ok(None);
    }
    if !src.prop.contains(TypeProp::REAL) || !dst.prop.contains(TypeProp::REAL) {
      panic!("internal error: unsupported conversion");
    }
    let class;
    let op;
    let mut r = None;
    if dst.is_bool() {
      class = Class::W;
      if src.prop.contains(TypeProp::INT) {
        r = Some(Value::Int(0));
        op = match src.size.get() {
          1 => {
            l = self.emit_r(ctx, Opcode::Extub, Class::W, l, None);
            Opcode::Cnew
          }
          2 => {
            l = self.emit_r(ctx, Opcode::Extuh, Class::W, l, None);
            Opcode::Cnew
          }
          4 => Opcode::Cnew,
          8 => Opcode::Cnel,
          _ => panic!("internal error: unknown integer conversion"),
        };
      } else {
        match src.size.get() {
          4 => {
            op = Opcode::Cnes;
            r = Some(Value::Flt(0.0));
          }
          8 => {
            op = Opcode::Cned;
            r = Some(Value::Dbl(0.0));
          }
          _ => panic!("internal error: unknown floating point conversion"),
        }
      }
    } else if dst.prop.contains(TypeProp::INT) {
      class = if dst.size.get() == 8 { Class::L } else { Class::W };
      if src.prop.contains(TypeProp::INT) {
        if dst.size.get() <= src.size.get() {
          return Ok(Some(l));
        }
        op = match (src.size.get(), src.is_signed()) {
          (4, true) => Opcode::Extsw,
          (4, false) => Opcode::Extuw,
          (2, true) => Opcode::Extsh,
          (2, false) => Opcode::Extuh,
          (1, true) => Opcode::Extsb,
          (1, false) => Opcode::Extub,
          _ => panic!("internal error: unknown integer conversion"),
        };
      } else if dst.is_signed() {
        op = if src.size.get() == 8 { Opcode::Dtosi } else { Opcode::Stosi };
      } else {
        op = if src.size.get() == 8 { Opcode::Dtoui } else { Opcode::Stoui };
      }
    } else {
      class = if dst.size.get() == 8 { Class::D } else { Class::S };
      if src.prop.contains(TypeProp::INT) {
        op = match (src.size.get() == 8, src.is_signed()) {
          (true, true) => Opcode::Sltof,
          (false, true) => Opcode::Swtof,
          (true, false) => Opcode::Ultof,
          (false, false) => Opcode::Uwtof,
        };
      } else {
        if src.size.get() == dst.size.get() {
          return Ok(Some(l));
        }
        op = if src.size.get() < dst.size.get() { Opcode::Exts } else { Opcode::Truncd };
      }
    }
    Ok(Some(self.emit_r(ctx, op, class, l, r)))
  }

  /// The address (and bit-field layout) of an lvalue expression.
  fn lval(&mut self, ctx: &Context, loc: &Loc, e: &ExprRef) -> Result<Lvalue> {
    let mut lval = Lvalue::plain(Value::Int(0));
    let e = if let ExprKind::Bitfield { base, bits } = &e.kind {
      lval.bits = *bits;
      base
    } else {
      e
    };
    match &e.kind {
      ExprKind::Ident(d) => {
        if !matches!(d.kind, DeclKind::Object | DeclKind::Func) {
          return Err(Error::new(loc, "identifier is not an object or function"));
        }
        if let Some(nd) = &self.namedecl
          && Rc::ptr_eq(d, nd)
        {
          emit::funcname(ctx, nd.value.get().expect("__func__ global"), &self.name)?;
          self.namedecl = None;
        }
        lval.addr = d.value.get().expect("declaration has a value");
      }
      ExprKind::String(_) => {
        let d = stringdecl(ctx, e)?;
        lval.addr = d.value.get().expect("string global");
      }
      ExprKind::Compound { init } => {
        let d = Decl::new(DeclKind::Object, e.ty.clone(), e.qual, Linkage::None);
        self.init(ctx, loc, &d, Some(init.as_slice()))?;
        lval.addr = d.value.get().expect("compound literal slot");
      }
      ExprKind::Unary { op: TokenKind::Mul, base } => {
        lval.addr = self.expr(ctx, loc, base)?.expect("pointer value");
      }
      _ => {
        if !e.ty.is_struct_or_union() {
          return Err(Error::new(loc, "expression is not an object"));
        }
        lval.addr = self.expr(ctx, loc, e)?.expect("aggregate value");
      }
    }
    Ok(lval)
  }

  /// Lower an expression, appending instructions to the current block.
  pub fn expr(&mut self, ctx: &Context, loc: &Loc, e: &ExprRef) -> Result<Option<Value>> {
    match &e.kind {
      ExprKind::Ident(d) => match d.kind {
        DeclKind::Object => {
          let t = d.ty.borrow().clone();
          let lval = Lvalue::plain(d.value.get().expect("declaration has a value"));
          Ok(Some(self.load(ctx, &t, lval)?))
        }
        DeclKind::Const => Ok(Some(d.value.get().expect("constant value"))),
        _ => panic!("internal error: unimplemented declaration kind"),
      },
      ExprKind::Const(c) => {
        let t = &e.ty;
        if t.prop.contains(TypeProp::INT) || t.is_pointer() {
          return Ok(Some(Value::Int(c.int())));
        }
        assert!(t.prop.contains(TypeProp::FLOAT));
        Ok(Some(if t.size.get() == 4 { Value::Flt(c.float()) } else { Value::Dbl(c.float()) }))
      }
      ExprKind::Bitfield { .. } | ExprKind::Compound { .. } => {
        let lval = self.lval(ctx, loc, e)?;
        Ok(Some(self.load(ctx, &e.ty, lval)?))
      }
      ExprKind::IncDec { op, post, base } => {
        let lval = self.lval(ctx, loc, base)?;
        let l = self.load(ctx, &base.ty, lval)?;
        let t = &e.ty;
        let r = if t.is_pointer() {
          Value::Int(t.base().size.get())
        } else if t.prop.contains(TypeProp::INT) {
          Value::Int(1)
        } else if t.prop.contains(TypeProp::FLOAT) {
          if t.size.get() == 4 { Value::Flt(1.0) } else { Value::Dbl(1.0) }
        } else {
          panic!("internal error: not a scalar")
        };
        let op = if *op == TokenKind::Inc { Opcode::Add } else { Opcode::Sub };
        let class = repr(t)?.class.expect("scalar class");
        let v = self.emit_r(ctx, op, class, l, Some(r));
        let v = self.store(ctx, loc, t, e.qual, lval, v)?;
        Ok(Some(if *post { l } else { v }))
      }
      ExprKind::Call { func, args } => {
        let mut argvals: SmallVec<[Option<Value>; 8]> = SmallVec::new();
        for arg in args {
          emit::emittype(ctx, &arg.ty)?;
          argvals.push(self.expr(ctx, loc, arg)?);
        }
        let t = &e.ty;
        emit::emittype(ctx, t)?;
        let fval = self.expr(ctx, loc, func)?.expect("function address");
        let v = self.emit(ctx, Opcode::Call, repr(t)?.class, Some(fval), t.value.get());
        let functype = func.ty.base();
        let fd = functype.func();
        for (i, arg) in args.iter().enumerate() {
          if fd.isvararg && i == fd.params.len() {
            self.emit(ctx, Opcode::Vararg, None, None, None);
          }
          let t = &arg.ty;
          self.emit(ctx, Opcode::Arg, repr(t)?.class, argvals[i], t.value.get());
        }
        Ok(v)
      }
      ExprKind::Unary { op, base } => match op {
        TokenKind::Band => Ok(Some(self.lval(ctx, loc, base)?.addr)),
        TokenKind::Mul => {
          let r = self.expr(ctx, loc, base)?.expect("pointer value");
          Ok(Some(self.load(ctx, &e.ty, Lvalue::plain(r))?))
        }
        TokenKind::Sub => {
          let r = self.expr(ctx, loc, base)?.expect("operand value");
          let class = repr(&e.ty)?.class.expect("scalar class");
          Ok(Some(self.emit_r(ctx, Opcode::Neg, class, r, None)))
        }
        _ => panic!("internal error: unknown unary expression"),
      },
      ExprKind::Cast { base } => {
        let l = self.expr(ctx, loc, base)?;
        match l {
          Some(l) => self.convert(ctx, &e.ty, &base.ty, l),
          None => Ok(None),
        }
      }
      ExprKind::Binary { op, l, r } => self.binary(ctx, loc, e, *op, l, r),
      ExprKind::Cond { cond, t, f } => {
        let b0 = self.new_block(ctx, "cond_true");
        let b1 = self.new_block(ctx, "cond_false");
        let b2 = self.new_block(ctx, "cond_join");

        let v = self.expr(ctx, loc, cond)?.expect("condition value");
        self.jnz(ctx, v, Some(&cond.ty), b0, b1)?;

        self.label(b0);
        let v0 = self.expr(ctx, loc, t)?;
        let p0 = self.cur;
        self.jmp(b2);

        self.label(b1);
        let v1 = self.expr(ctx, loc, f)?;
        let p1 = self.cur;

        self.label(b2);
        if e.ty.is_void() {
          return Ok(None);
        }
        let res = self.temp();
        self[b2].phi = Some(Phi {
          class: repr(&e.ty)?.class.expect("scalar class"),
          pred: [p0, p1],
          val: [v0.expect("arm value"), v1.expect("arm value")],
          res,
        });
        Ok(Some(res))
      }
      ExprKind::Assign { l, r } => {
        let rv = self.expr(ctx, loc, r)?.expect("assignment source");
        if let ExprKind::Temp(slot) = &l.kind {
          slot.set(Some(rv));
          Ok(Some(rv))
        } else {
          let lval = self.lval(ctx, loc, l)?;
          Ok(Some(self.store(ctx, loc, &l.ty, l.qual, lval, rv)?))
        }
      }
      ExprKind::Comma { exprs } => {
        let (last, init) = exprs.split_last().expect("comma operands");
        for e in init {
          self.expr(ctx, loc, e)?;
        }
        self.expr(ctx, loc, last)
      }
      ExprKind::Builtin(b) => match b {
        BuiltinExpr::VaStart(ap) => {
          let l = self.expr(ctx, loc, ap)?.expect("va_list address");
          self.emit(ctx, Opcode::Vastart, None, Some(l), None);
          Ok(None)
        }
        BuiltinExpr::VaArg(ap) => {
          if !e.ty.prop.contains(TypeProp::SCALAR) {
            return Err(Error::new(loc, "va_arg with non-scalar type is not yet supported"));
          }
          let l = self.expr(ctx, loc, ap)?.expect("va_list address");
          Ok(Some(self.emit_r(ctx, Opcode::Vaarg, repr(&e.ty)?.class.expect("scalar class"), l, None)))
        }
        BuiltinExpr::Alloca(size) => {
          let l = self.expr(ctx, loc, size)?.expect("allocation size");
          Ok(Some(self.emit_r(ctx, Opcode::Alloc16, PTR_CLASS, l, None)))
        }
        BuiltinExpr::Unreachable => Ok(None),
      },
      ExprKind::Temp(slot) => Ok(Some(slot.get().expect("temporary not materialized"))),
      ExprKind::String(_) => {
        let lval = self.lval(ctx, loc, e)?;
        Ok(Some(self.load(ctx, &e.ty, lval)?))
      }
    }
  }

  fn binary(
    &mut self,
    ctx: &Context,
    loc: &Loc,
    e: &ExprRef,
    op: TokenKind,
    lexpr: &ExprRef,
    rexpr: &ExprRef,
  ) -> Result<Option<Value>> {
    use Opcode::*;
    let l = self.expr(ctx, loc, lexpr)?.expect("operand value");
    if op == TokenKind::Lor || op == TokenKind::Land {
      let b0 = self.new_block(ctx, "logic_right");
      let b1 = self.new_block(ctx, "logic_join");
      let t = &lexpr.ty;
      let val0 = if op == TokenKind::Lor {
        self.jnz(ctx, l, Some(t), b1, b0)?;
        Value::Int(1)
      } else {
        self.jnz(ctx, l, Some(t), b0, b1)?;
        Value::Int(0)
      };
      let p0 = self.cur;
      self.label(b0);
      let r = self.expr(ctx, loc, rexpr)?.expect("operand value");
      let val1 = self.convert(ctx, &ctx.tys.tbool, &rexpr.ty, r)?.expect("conversion");
      let p1 = self.cur;
      self.label(b1);
      let res = self.temp();
      self[b1].phi = Some(Phi { class: Class::W, pred: [p0, p1], val: [val0, val1], res });
      return Ok(Some(res));
    }
    let r = self.expr(ctx, loc, rexpr)?.expect("operand value");
    let t = if lexpr.ty.is_pointer() { ctx.tys.tulong.clone() } else { lexpr.ty.clone() };
    let int = t.prop.contains(TypeProp::INT);
    let fp = t.prop.contains(TypeProp::FLOAT);
    let signed = t.is_signed();
    let wide = t.size.get() > 4;
    let op = match op {
      TokenKind::Mul => Mul,
      TokenKind::Div => {
        if !int || signed {
          Div
        } else {
          Udiv
        }
      }
      TokenKind::Mod => {
        if signed {
          Rem
        } else {
          Urem
        }
      }
      TokenKind::Add => Add,
      TokenKind::Sub => Sub,
      TokenKind::Shl => Shl,
      TokenKind::Shr => {
        if signed {
          Sar
        } else {
          Shr
        }
      }
      TokenKind::Bor => Or,
      TokenKind::Band => And,
      TokenKind::Xor => Xor,
      TokenKind::Less => match (wide, fp, signed) {
        (false, true, _) => Clts,
        (false, _, true) => Csltw,
        (false, _, false) => Cultw,
        (true, true, _) => Cltd,
        (true, _, true) => Csltl,
        (true, _, false) => Cultl,
      },
      TokenKind::Greater => match (wide, fp, signed) {
        (false, true, _) => Cgts,
        (false, _, true) => Csgtw,
        (false, _, false) => Cugtw,
        (true, true, _) => Cgtd,
        (true, _, true) => Csgtl,
        (true, _, false) => Cugtl,
      },
      TokenKind::Leq => match (wide, fp, signed) {
        (false, true, _) => Cles,
        (false, _, true) => Cslew,
        (false, _, false) => Culew,
        (true, true, _) => Cled,
        (true, _, true) => Cslel,
        (true, _, false) => Culel,
      },
      TokenKind::Geq => match (wide, fp, signed) {
        (false, true, _) => Cges,
        (false, _, true) => Csgew,
        (false, _, false) => Cugew,
        (true, true, _) => Cged,
        (true, _, true) => Csgel,
        (true, _, false) => Cugel,
      },
      TokenKind::Eql => match (wide, fp) {
        (false, true) => Ceqs,
        (false, false) => Ceqw,
        (true, true) => Ceqd,
        (true, false) => Ceql,
      },
      TokenKind::Neq => match (wide, fp) {
        (false, true) => Cnes,
        (false, false) => Cnew,
        (true, true) => Cned,
        (true, false) => Cnel,
      },
      _ => panic!("internal error: unimplemented binary expression"),
    };
    let class = repr(&e.ty)?.class.expect("scalar class");
    Ok(Some(self.emit_r(ctx, op, class, l, Some(r))))
  }

  /// Store zeros over `[offset, end)` with stores sized by alignment.
  fn zero(&mut self, ctx: &Context, addr: Value, align: u32, mut offset: u64, end: u64) {
    let align = align as u64;
    let mut a: u64 = 1;
    while offset < end {
      if (align - (offset & (align - 1))) & a != 0 {
        let store = match a {
          1 => Opcode::Storeb,
          2 => Opcode::Storeh,
          4 => Opcode::Storew,
          _ => Opcode::Storel,
        };
        let dst = if offset != 0 {
          self.emit_r(ctx, Opcode::Add, PTR_CLASS, addr, Some(Value::Int(offset)))
        } else {
          addr
        };
        self.emit(ctx, store, None, Some(Value::Int(0)), Some(dst));
        offset += a;
      }
      if a < align {
        a <<= 1;
      }
    }
  }

  /// Allocate a local object and lower its initializer: gaps are zeroed,
  /// string initializers splat per code unit, everything else stores the
  /// evaluated expression at its byte range.
  pub fn init(&mut self, ctx: &Context, loc: &Loc, d: &Decl, init: Option<&[Init]>) -> Result<()> {
    self.alloc(loc, d)?;
    let Some(inits) = init else { return Ok(()) };
    let base = d.value.get().expect("alloc slot");
    let (talign, tsize) = {
      let t = d.ty.borrow();
      (t.align.get(), t.size.get())
    };
    let mut offset = 0;
    let mut max = 0;
    for init in inits {
      self.zero(ctx, base, talign, offset, init.start);
      let mut dst = Lvalue { addr: base, bits: init.bits };
      if let ExprKind::String(s) = &init.expr.kind {
        let elem = init.expr.ty.base();
        let w = elem.size.get();
        let units = s.units();
        let mut i = 0;
        while i < units && i * w < init.end - init.start {
          let off = Value::Int(init.start + i * w);
          dst.addr = self.emit_r(ctx, Opcode::Add, PTR_CLASS, base, Some(off));
          let v = Value::Int(s.unit(i));
          self.store(ctx, loc, &elem, TypeQual::empty(), dst, v)?;
          i += 1;
        }
        offset = init.start + i * w;
      } else {
        if offset < init.end && dst.bits.any() {
          self.zero(ctx, base, talign, offset, init.end);
        }
        dst.addr = base;
        // skip the add for offset zero so QBE's memopt can see the store
        if init.start > 0 {
          dst.addr = self.emit_r(ctx, Opcode::Add, PTR_CLASS, base, Some(Value::Int(init.start)));
        }
        let src = self.expr(ctx, loc, &init.expr)?.expect("initializer value");
        self.store(ctx, loc, &init.expr.ty, TypeQual::empty(), dst, src)?;
        offset = init.end;
      }
      max = max.max(offset);
    }
    self.zero(ctx, base, talign, max, tsize);
    Ok(())
  }

  /// Lower a switch into a binary search over the sorted case keys: one
  /// equality test per node, an unsigned less-than picking the half.
  pub fn switch(
    &mut self,
    ctx: &Context,
    v: Value,
    t: &Ty,
    cases: &BTreeMap<u64, BlockId>,
    defaultlabel: BlockId,
  ) -> Result<()> {
    let class = repr(t)?.class.expect("integer class");
    let entries: Vec<(u64, BlockId)> = cases.iter().map(|(&k, &b)| (k, b)).collect();
    self.casesearch(ctx, class, v, &entries, defaultlabel)
  }

  fn casesearch(
    &mut self,
    ctx: &Context,
    class: Class,
    v: Value,
    cases: &[(u64, BlockId)],
    defaultlabel: BlockId,
  ) -> Result<()> {
    if cases.is_empty() {
      self.jmp(defaultlabel);
      return Ok(());
    }
    let mid = cases.len() / 2;
    let (key, body) = cases[mid];
    let ne = self.new_block(ctx, "switch_ne");
    let lt = self.new_block(ctx, "switch_lt");
    let gt = self.new_block(ctx, "switch_gt");

    let eq = if class == Class::W { Opcode::Ceqw } else { Opcode::Ceql };
    let ult = if class == Class::W { Opcode::Cultw } else { Opcode::Cultl };
    let res = self.emit_r(ctx, eq, Class::W, v, Some(Value::Int(key)));
    self.jnz(ctx, res, None, body, ne)?;
    self.label(ne);
    let res = self.emit_r(ctx, ult, Class::W, v, Some(Value::Int(key)));
    self.jnz(ctx, res, None, lt, gt)?;
    self.label(lt);
    self.casesearch(ctx, class, v, &cases[..mid], defaultlabel)?;
    self.label(gt);
    self.casesearch(ctx, class, v, &cases[mid + 1..], defaultlabel)
  }
}

/// Resolve the goto map at end of function: every label jumped to must have
/// been defined somewhere in the body.
pub fn check_gotos(f: &Func, loc: &Loc) -> Result<()> {
  for (name, g) in &f.gotos {
    if !g.defined {
      return Err(Error::new(loc, format!("label '{name}' is used but not defined")));
    }
  }
  Ok(())
}

