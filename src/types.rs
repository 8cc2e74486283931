//! The C type graph: canonical basic types, derived-type constructors, and
//! the compatibility/composition/promotion rules.
//!
//! Types are `Rc` handles. The basic types are singletons created once per
//! [`Types`] table, so pointer identity (`Rc::ptr_eq`) implies type identity
//! for them; derived types are freshly allocated and never deduplicated.
//! Completion of tagged types and incomplete arrays happens in place through
//! `Cell`/`RefCell` fields, which is what lets a struct contain pointers to
//! itself without ownership cycles.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::ir::Value;

pub type Ty = Rc<Type>;

bitflags! {
  /// Type qualifiers, stored on derived types for their base type.
  #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
  pub struct TypeQual: u8 {
    const CONST    = 1 << 0;
    const RESTRICT = 1 << 1;
    const VOLATILE = 1 << 2;
    const ATOMIC   = 1 << 3;
  }
}

bitflags! {
  /// Derived classification of a type, fixed at construction.
  #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
  pub struct TypeProp: u8 {
    const CHAR   = 1 << 0;
    const INT    = 1 << 1;
    const REAL   = 1 << 2;
    const ARITH  = 1 << 3;
    const SCALAR = 1 << 4;
    const FLOAT  = 1 << 5;
  }
}

/// Sub-kind of a basic arithmetic type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BasicKind {
  Bool,
  Char,
  Short,
  Int,
  Long,
  LongLong,
  Float,
  Double,
  LongDouble,
}

/// Bit-field layout within a storage unit of the member's declared type:
/// the number of bits before and after the field.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Bitfield {
  pub before: u32,
  pub after: u32,
}

impl Bitfield {
  pub fn any(&self) -> bool {
    self.before != 0 || self.after != 0
  }
}

#[derive(Clone)]
pub struct Member {
  pub name: Option<String>,
  pub ty: Ty,
  pub qual: TypeQual,
  pub offset: u64,
  pub bits: Bitfield,
}

/// Base type plus the qualifiers that apply to it.
#[derive(Clone)]
pub struct Derived {
  pub base: Ty,
  pub qual: TypeQual,
}

/// A type together with the qualifiers of the declared object.
#[derive(Clone)]
pub struct QualType {
  pub ty: Ty,
  pub qual: TypeQual,
}

#[derive(Clone)]
pub struct Param {
  pub name: Option<String>,
  /// `None` until a K&R parameter declaration supplies the type.
  pub ty: RefCell<Option<Ty>>,
  pub qual: Cell<TypeQual>,
  /// The parameter's IR temporary, assigned when a definition is lowered.
  pub value: Cell<Option<Value>>,
}

impl Param {
  pub fn new(name: Option<String>, ty: Option<Ty>, qual: TypeQual) -> Param {
    Param { name, ty: RefCell::new(ty), qual: Cell::new(qual), value: Cell::new(None) }
  }

  pub fn ty(&self) -> Ty {
    self.ty.borrow().clone().expect("parameter type not yet declared")
  }
}

pub struct FuncType {
  pub params: Vec<Param>,
  pub isprototype: bool,
  pub isvararg: bool,
  pub isnoreturn: Cell<bool>,
  /// True when the declarator conveyed type information for each parameter.
  pub paraminfo: bool,
}

pub struct StructDef {
  pub tag: Option<Rc<str>>,
  pub members: RefCell<Vec<Member>>,
}

pub enum TypeKind {
  Void,
  Basic { kind: BasicKind, signed: bool },
  Pointer(Derived),
  /// Length 0 with the `incomplete` flag set means unknown length.
  Array(Derived, Cell<u64>),
  Func(Derived, FuncType),
  Struct(StructDef),
  Union(StructDef),
  /// The enum's integer base; swapped from `unsigned int` to `int` when a
  /// negative enumerator appears.
  Enum(RefCell<Ty>),
}

pub struct Type {
  pub kind: TypeKind,
  pub prop: TypeProp,
  pub size: Cell<u64>,
  pub align: Cell<u32>,
  pub incomplete: Cell<bool>,
  /// Struct ends in a flexible array member.
  pub flexible: Cell<bool>,
  /// The emitted IR aggregate reference (`:tag.N`), set on first use.
  pub value: Cell<Option<Value>>,
}

impl fmt::Debug for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // the type graph is cyclic, so print only the top level
    let kind = match &self.kind {
      TypeKind::Void => "void",
      TypeKind::Basic { kind, .. } => return write!(f, "{kind:?}"),
      TypeKind::Pointer(_) => "pointer",
      TypeKind::Array(..) => "array",
      TypeKind::Func(..) => "func",
      TypeKind::Struct(_) => "struct",
      TypeKind::Union(_) => "union",
      TypeKind::Enum(_) => "enum",
    };
    write!(f, "{kind} (size {})", self.size.get())
  }
}

fn mk(kind: TypeKind, prop: TypeProp, size: u64, align: u32) -> Ty {
  Rc::new(Type {
    kind,
    prop,
    size: Cell::new(size),
    align: Cell::new(align),
    incomplete: Cell::new(false),
    flexible: Cell::new(false),
    value: Cell::new(None),
  })
}

fn int_prop() -> TypeProp {
  TypeProp::SCALAR | TypeProp::ARITH | TypeProp::REAL | TypeProp::INT
}

fn basic(kind: BasicKind, size: u64, signed: bool, extra: TypeProp) -> Ty {
  mk(TypeKind::Basic { kind, signed }, int_prop() | extra, size, size as u32)
}

fn flt(kind: BasicKind, size: u64) -> Ty {
  mk(
    TypeKind::Basic { kind, signed: false },
    TypeProp::SCALAR | TypeProp::ARITH | TypeProp::REAL | TypeProp::FLOAT,
    size,
    size as u32,
  )
}

pub fn mkpointer(base: Ty, qual: TypeQual) -> Ty {
  mk(TypeKind::Pointer(Derived { base, qual }), TypeProp::SCALAR, 8, 8)
}

pub fn mkarray(base: Ty, qual: TypeQual, len: Option<u64>) -> Ty {
  let align = base.align.get();
  let size = base.size.get() * len.unwrap_or(0);
  let t = mk(TypeKind::Array(Derived { base, qual }, Cell::new(len.unwrap_or(0))), TypeProp::empty(), size, align);
  t.incomplete.set(len.is_none());
  t
}

pub fn mkfunc(ret: Ty, qual: TypeQual, func: FuncType) -> Ty {
  mk(TypeKind::Func(Derived { base: ret, qual }, func), TypeProp::empty(), 0, 0)
}

pub fn mkstruct(is_union: bool, tag: Option<Rc<str>>) -> Ty {
  let def = StructDef { tag, members: RefCell::new(vec![]) };
  let t = mk(if is_union { TypeKind::Union(def) } else { TypeKind::Struct(def) }, TypeProp::empty(), 0, 0);
  t.incomplete.set(true);
  t
}

pub const fn alignup(x: u64, a: u64) -> u64 {
  (x + a - 1) & !(a - 1)
}

pub const fn aligndown(x: u64, a: u64) -> u64 {
  x & !(a - 1)
}

impl Type {
  /// The base type of a derived type, or an enum's integer base.
  pub fn base(&self) -> Ty {
    match &self.kind {
      TypeKind::Pointer(d) | TypeKind::Array(d, _) | TypeKind::Func(d, _) => d.base.clone(),
      TypeKind::Enum(b) => b.borrow().clone(),
      _ => panic!("type has no base"),
    }
  }

  /// Qualifiers applied to the base type.
  pub fn base_qual(&self) -> TypeQual {
    match &self.kind {
      TypeKind::Pointer(d) | TypeKind::Array(d, _) | TypeKind::Func(d, _) => d.qual,
      _ => TypeQual::empty(),
    }
  }

  pub fn is_signed(&self) -> bool {
    match &self.kind {
      TypeKind::Basic { signed, .. } => *signed,
      TypeKind::Enum(b) => b.borrow().is_signed(),
      _ => false,
    }
  }

  /// Integer conversion rank (C11 6.3.1.1).
  pub fn rank(&self) -> u32 {
    match &self.kind {
      TypeKind::Enum(b) => b.borrow().rank(),
      TypeKind::Basic { kind, .. } => match kind {
        BasicKind::Bool => 1,
        BasicKind::Char => 2,
        BasicKind::Short => 3,
        BasicKind::Int => 4,
        BasicKind::Long => 5,
        BasicKind::LongLong => 6,
        _ => panic!("internal error: rank of non-integer type"),
      },
      _ => panic!("internal error: rank of non-integer type"),
    }
  }

  pub fn func(&self) -> &FuncType {
    match &self.kind {
      TypeKind::Func(_, f) => f,
      _ => panic!("not a function type"),
    }
  }

  pub fn struct_def(&self) -> &StructDef {
    match &self.kind {
      TypeKind::Struct(d) | TypeKind::Union(d) => d,
      _ => panic!("not a struct or union type"),
    }
  }

  pub fn array_len(&self) -> u64 {
    match &self.kind {
      TypeKind::Array(_, len) => len.get(),
      _ => panic!("not an array type"),
    }
  }

  pub fn is_void(&self) -> bool {
    matches!(self.kind, TypeKind::Void)
  }

  pub fn is_pointer(&self) -> bool {
    matches!(self.kind, TypeKind::Pointer(_))
  }

  pub fn is_array(&self) -> bool {
    matches!(self.kind, TypeKind::Array(..))
  }

  pub fn is_func(&self) -> bool {
    matches!(self.kind, TypeKind::Func(..))
  }

  pub fn is_struct_or_union(&self) -> bool {
    matches!(self.kind, TypeKind::Struct(_) | TypeKind::Union(_))
  }

  pub fn is_union(&self) -> bool {
    matches!(self.kind, TypeKind::Union(_))
  }

  pub fn is_bool(&self) -> bool {
    matches!(self.kind, TypeKind::Basic { kind: BasicKind::Bool, .. })
  }
}

/// Compatibility (C11 6.2.7). An enum is compatible with exactly its integer
/// base, but not with another enum of the same base. Basic types rely on
/// singleton identity, so `char` and `signed char` stay distinct.
pub fn compatible(t1: &Ty, t2: &Ty) -> bool {
  if Rc::ptr_eq(t1, t2) {
    return true;
  }
  match (&t1.kind, &t2.kind) {
    (TypeKind::Enum(b), _) => Rc::ptr_eq(&b.borrow(), t2),
    (_, TypeKind::Enum(b)) => Rc::ptr_eq(&b.borrow(), t1),
    (TypeKind::Pointer(d1), TypeKind::Pointer(d2)) => {
      d1.qual == d2.qual && compatible(&d1.base, &d2.base)
    }
    (TypeKind::Array(d1, l1), TypeKind::Array(d2, l2)) => {
      if !t1.incomplete.get() && !t2.incomplete.get() && l1.get() != l2.get() {
        return false;
      }
      d1.qual == d2.qual && compatible(&d1.base, &d2.base)
    }
    (TypeKind::Func(d1, f1), TypeKind::Func(d2, f2)) => {
      if f1.isvararg != f2.isvararg || f1.params.len() != f2.params.len() {
        return false;
      }
      for (p1, p2) in f1.params.iter().zip(&f2.params) {
        match (&*p1.ty.borrow(), &*p2.ty.borrow()) {
          (Some(t1), Some(t2)) if compatible(t1, t2) => {}
          _ => return false,
        }
      }
      d1.qual == d2.qual && compatible(&d1.base, &d2.base)
    }
    _ => false,
  }
}

pub fn same(t1: &Ty, t2: &Ty) -> bool {
  compatible(t1, t2)
}

/// The composite of two compatible types. Returns the first type; merging
/// prototype information and array lengths is deliberately left out.
pub fn composite(t1: &Ty, _t2: &Ty) -> Ty {
  t1.clone()
}

/// Function parameter type adjustment (C11 6.7.6.3p7): arrays decay to
/// pointers carrying the element qualifiers merged with the incoming set,
/// functions to pointers to themselves.
pub fn adjust(t: &Ty, tq: &mut TypeQual) -> Ty {
  match &t.kind {
    TypeKind::Array(d, _) => {
      let t = mkpointer(d.base.clone(), *tq | d.qual);
      *tq = TypeQual::empty();
      t
    }
    TypeKind::Func(..) => mkpointer(t.clone(), TypeQual::empty()),
    _ => t.clone(),
  }
}

/// Look up `name` in a struct or union, descending into anonymous members
/// in preorder; the total byte offset accumulates into `offset`.
pub fn member(t: &Ty, name: &str, offset: &mut u64) -> Option<Member> {
  for m in t.struct_def().members.borrow().iter() {
    match &m.name {
      Some(n) => {
        if n == name {
          *offset += m.offset;
          return Some(m.clone());
        }
      }
      None => {
        if let Some(sub) = member(&m.ty, name, offset) {
          *offset += m.offset;
          return Some(sub);
        }
      }
    }
  }
  None
}

/// The basic-type singleton table, created once per compilation context.
pub struct Types {
  pub tvoid: Ty,
  pub tbool: Ty,
  pub tchar: Ty,
  pub tschar: Ty,
  pub tuchar: Ty,
  pub tshort: Ty,
  pub tushort: Ty,
  pub tint: Ty,
  pub tuint: Ty,
  pub tlong: Ty,
  pub tulong: Ty,
  pub tllong: Ty,
  pub tullong: Ty,
  pub tfloat: Ty,
  pub tdouble: Ty,
  pub tldouble: Ty,
}

impl Types {
  pub fn new() -> Types {
    let tvoid = mk(TypeKind::Void, TypeProp::empty(), 0, 0);
    tvoid.incomplete.set(true);
    Types {
      tvoid,
      tbool: basic(BasicKind::Bool, 1, false, TypeProp::empty()),
      tchar: basic(BasicKind::Char, 1, true, TypeProp::CHAR),
      tschar: basic(BasicKind::Char, 1, true, TypeProp::CHAR),
      tuchar: basic(BasicKind::Char, 1, false, TypeProp::CHAR),
      tshort: basic(BasicKind::Short, 2, true, TypeProp::empty()),
      tushort: basic(BasicKind::Short, 2, false, TypeProp::empty()),
      tint: basic(BasicKind::Int, 4, true, TypeProp::empty()),
      tuint: basic(BasicKind::Int, 4, false, TypeProp::empty()),
      tlong: basic(BasicKind::Long, 8, true, TypeProp::empty()),
      tulong: basic(BasicKind::Long, 8, false, TypeProp::empty()),
      tllong: basic(BasicKind::LongLong, 8, true, TypeProp::empty()),
      tullong: basic(BasicKind::LongLong, 8, false, TypeProp::empty()),
      tfloat: flt(BasicKind::Float, 4),
      tdouble: flt(BasicKind::Double, 8),
      tldouble: flt(BasicKind::LongDouble, 16),
    }
  }

  /// A fresh enum type, initially based on `unsigned int`.
  pub fn mkenum(&self) -> Ty {
    let t = mk(TypeKind::Enum(RefCell::new(self.tuint.clone())), int_prop(), 4, 4);
    t.incomplete.set(true);
    t
  }

  /// Integer and default-argument promotion (C11 6.3.1.1p2). `width` is the
  /// declared bit-field width of the operand, if it is one.
  pub fn promote(&self, t: &Ty, width: Option<u32>) -> Ty {
    if Rc::ptr_eq(t, &self.tfloat) {
      return self.tdouble.clone();
    }
    if t.prop.contains(TypeProp::INT)
      && (t.rank() <= self.tint.rank() || width.is_some_and(|w| w <= 32))
    {
      let w = width.unwrap_or(t.size.get() as u32 * 8);
      return if w - u32::from(t.is_signed()) < 32 { self.tint.clone() } else { self.tuint.clone() };
    }
    t.clone()
  }

  /// The common real type of two operands (C11 6.3.1.8), with bit-field
  /// widths participating in promotion.
  pub fn commonreal(&self, t1: &Ty, w1: Option<u32>, t2: &Ty, w2: Option<u32>) -> Ty {
    assert!(t1.prop.contains(TypeProp::REAL) && t2.prop.contains(TypeProp::REAL));
    for t in [&self.tldouble, &self.tdouble, &self.tfloat] {
      if Rc::ptr_eq(t1, t) || Rc::ptr_eq(t2, t) {
        return t.clone();
      }
    }
    let mut t1 = self.promote(t1, w1);
    let mut t2 = self.promote(t2, w2);
    if Rc::ptr_eq(&t1, &t2) {
      return t1;
    }
    if t1.is_signed() == t2.is_signed() {
      return if t1.rank() > t2.rank() { t1 } else { t2 };
    }
    if t1.is_signed() {
      std::mem::swap(&mut t1, &mut t2);
    }
    // t1 is the unsigned operand
    if t1.rank() >= t2.rank() {
      return t1;
    }
    if t1.size.get() < t2.size.get() {
      return t2;
    }
    if Rc::ptr_eq(&t2, &self.tlong) {
      return self.tulong.clone();
    }
    if Rc::ptr_eq(&t2, &self.tllong) {
      return self.tullong.clone();
    }
    panic!("internal error: could not find common real type");
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn singleton_identity() {
    let tys = Types::new();
    assert!(compatible(&tys.tint, &tys.tint.clone()));
    assert!(!compatible(&tys.tchar, &tys.tschar));
    assert!(!compatible(&tys.tint, &tys.tuint));
    assert!(!compatible(&tys.tlong, &tys.tllong));
  }

  #[test]
  fn compatible_is_reflexive() {
    let tys = Types::new();
    for t in [&tys.tvoid, &tys.tbool, &tys.tuchar, &tys.tint, &tys.tulong, &tys.tdouble] {
      assert!(compatible(t, t));
    }
    let p = mkpointer(tys.tint.clone(), TypeQual::CONST);
    assert!(compatible(&p, &p));
    let q = mkpointer(tys.tint.clone(), TypeQual::CONST);
    assert!(compatible(&p, &q));
    assert!(!compatible(&p, &mkpointer(tys.tint.clone(), TypeQual::empty())));
  }

  #[test]
  fn array_compatibility() {
    let tys = Types::new();
    let a5 = mkarray(tys.tint.clone(), TypeQual::empty(), Some(5));
    let b5 = mkarray(tys.tint.clone(), TypeQual::empty(), Some(5));
    let a6 = mkarray(tys.tint.clone(), TypeQual::empty(), Some(6));
    let ax = mkarray(tys.tint.clone(), TypeQual::empty(), None);
    assert!(compatible(&a5, &b5));
    assert!(!compatible(&a5, &a6));
    assert!(compatible(&a5, &ax));
    assert_eq!(a5.size.get(), 20);
  }

  #[test]
  fn enum_compatibility() {
    let tys = Types::new();
    let e1 = tys.mkenum();
    let e2 = tys.mkenum();
    assert!(compatible(&e1, &tys.tuint));
    assert!(compatible(&tys.tuint, &e1));
    assert!(!compatible(&e1, &tys.tint));
    assert!(!compatible(&e1, &e2));
    *e1.kind_enum_base() = tys.tint.clone();
    assert!(compatible(&e1, &tys.tint));
    assert!(e1.is_signed());
  }

  #[test]
  fn promotion_idempotent() {
    let tys = Types::new();
    for t in [&tys.tbool, &tys.tchar, &tys.tuchar, &tys.tshort, &tys.tushort, &tys.tint,
      &tys.tuint, &tys.tlong, &tys.tulong, &tys.tfloat, &tys.tdouble]
    {
      let once = tys.promote(t, None);
      let twice = tys.promote(&once, None);
      assert!(Rc::ptr_eq(&once, &twice), "{t:?}");
    }
    assert!(Rc::ptr_eq(&tys.promote(&tys.tchar, None), &tys.tint));
    assert!(Rc::ptr_eq(&tys.promote(&tys.tushort, None), &tys.tint));
    assert!(Rc::ptr_eq(&tys.promote(&tys.tfloat, None), &tys.tdouble));
  }

  #[test]
  fn bitfield_promotion() {
    let tys = Types::new();
    // a 32-bit unsigned bit-field does not fit in int
    assert!(Rc::ptr_eq(&tys.promote(&tys.tuint, Some(32)), &tys.tuint));
    assert!(Rc::ptr_eq(&tys.promote(&tys.tuint, Some(31)), &tys.tint));
    assert!(Rc::ptr_eq(&tys.promote(&tys.tulong, Some(16)), &tys.tint));
  }

  #[test]
  fn commonreal_symmetric() {
    let tys = Types::new();
    let ints = [&tys.tchar, &tys.tshort, &tys.tint, &tys.tuint, &tys.tlong, &tys.tulong,
      &tys.tllong, &tys.tullong, &tys.tfloat, &tys.tdouble];
    for t1 in ints {
      for t2 in ints {
        let a = tys.commonreal(t1, None, t2, None);
        let b = tys.commonreal(t2, None, t1, None);
        assert!(Rc::ptr_eq(&a, &b), "{t1:?} vs {t2:?}");
      }
    }
    assert!(Rc::ptr_eq(&tys.commonreal(&tys.tint, None, &tys.tuint, None), &tys.tuint));
    assert!(Rc::ptr_eq(&tys.commonreal(&tys.tuint, None, &tys.tlong, None), &tys.tlong));
    assert!(Rc::ptr_eq(&tys.commonreal(&tys.tulong, None, &tys.tllong, None), &tys.tullong));
    assert!(Rc::ptr_eq(&tys.commonreal(&tys.tint, None, &tys.tfloat, None), &tys.tfloat));
  }

  #[test]
  fn anonymous_member_lookup() {
    let tys = Types::new();
    let inner = mkstruct(false, None);
    inner.struct_def().members.borrow_mut().push(Member {
      name: Some("x".into()),
      ty: tys.tint.clone(),
      qual: TypeQual::empty(),
      offset: 4,
      bits: Bitfield::default(),
    });
    let outer = mkstruct(false, Some("s".into()));
    outer.struct_def().members.borrow_mut().push(Member {
      name: None,
      ty: inner,
      qual: TypeQual::empty(),
      offset: 8,
      bits: Bitfield::default(),
    });
    let mut off = 0;
    let m = member(&outer, "x", &mut off).unwrap();
    assert_eq!(off, 12);
    assert!(Rc::ptr_eq(&m.ty, &tys.tint));
    assert!(member(&outer, "y", &mut 0).is_none());
  }

  #[test]
  fn parameter_adjustment() {
    let tys = Types::new();
    let arr = mkarray(tys.tint.clone(), TypeQual::CONST, Some(3));
    let mut tq = TypeQual::VOLATILE;
    let adj = adjust(&arr, &mut tq);
    assert!(adj.is_pointer());
    assert_eq!(adj.base_qual(), TypeQual::CONST | TypeQual::VOLATILE);
    assert_eq!(tq, TypeQual::empty());
  }
}

impl Type {
  /// Test-only access to an enum's base slot.
  #[cfg(test)]
  fn kind_enum_base(&self) -> std::cell::RefMut<'_, Ty> {
    match &self.kind {
      TypeKind::Enum(b) => b.borrow_mut(),
      _ => panic!("not an enum"),
    }
  }
}
