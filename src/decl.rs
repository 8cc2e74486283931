//! Declaration parsing (C11 6.7): specifier accumulation, recursive
//! declarators, struct/union/enum assembly with bit-field layout, storage
//! class and linkage resolution, and tentative definitions. The `Parser`
//! defined here is the compilation driver; the expression, initializer and
//! statement parsers extend it from their own modules.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bitflags::bitflags;
use tracing::debug;

use crate::emit;
use crate::expr::{ExprKind, ExprRef};
use crate::init::Init;
use crate::ir::{Func, Value, check_gotos};
use crate::scan::TokenStream;
use crate::scope::Scope;
use crate::token::TokenKind;
use crate::types::{
  self, Bitfield, FuncType, Member, Param, QualType, Ty, TypeKind, TypeProp, TypeQual, alignup,
  compatible, composite, mkarray, mkfunc, mkpointer, mkstruct, same,
};
use crate::{Context, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeclBuiltin {
  Alloca,
  ConstantP,
  Expect,
  Inff,
  Nanf,
  Offsetof,
  TypesCompatibleP,
  Unreachable,
  VaArg,
  VaCopy,
  VaEnd,
  VaStart,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeclKind {
  Type,
  Object,
  Func,
  Const,
  Builtin(DeclBuiltin),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
  None,
  Intern,
  Extern,
}

pub struct Decl {
  pub kind: DeclKind,
  pub linkage: Linkage,
  /// Merged with the composite type on redeclaration.
  pub ty: RefCell<Ty>,
  pub qual: TypeQual,
  /// The IR value: a global label, a stack slot address, or a constant.
  pub value: Cell<Option<Value>>,
  /// May be stricter than the type requires.
  pub align: Cell<u32>,
  pub tentative: Cell<bool>,
  pub defined: Cell<bool>,
  pub asmname: RefCell<Option<Rc<str>>>,
  /// An inline definition, not emitted as an external definition.
  pub inlinedefn: Cell<bool>,
}

impl Decl {
  pub fn new(kind: DeclKind, t: Ty, qual: TypeQual, linkage: Linkage) -> Decl {
    let align = if matches!(kind, DeclKind::Object) { t.align.get() } else { 0 };
    Decl {
      kind,
      linkage,
      ty: RefCell::new(t),
      qual,
      value: Cell::new(None),
      align: Cell::new(align),
      tentative: Cell::new(false),
      defined: Cell::new(false),
      asmname: RefCell::new(None),
      inlinedefn: Cell::new(false),
    }
  }
}

fn kind_matches(a: DeclKind, b: DeclKind) -> bool {
  std::mem::discriminant(&a) == std::mem::discriminant(&b)
}

bitflags! {
  #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
  struct StorageClass: u8 {
    const TYPEDEF     = 1 << 0;
    const EXTERN      = 1 << 1;
    const STATIC      = 1 << 2;
    const AUTO        = 1 << 3;
    const REGISTER    = 1 << 4;
    const THREADLOCAL = 1 << 5;
  }
}

bitflags! {
  #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
  struct TypeSpec: u16 {
    const CHAR     = 1 << 0;
    const INT      = 1 << 1;
    const FLOAT    = 1 << 2;
    const DOUBLE   = 1 << 3;
    const SHORT    = 1 << 4;
    const LONG     = 1 << 5;
    const LONG2    = 1 << 6;
    const SIGNED   = 1 << 7;
    const UNSIGNED = 1 << 8;
  }
}

bitflags! {
  #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
  struct FuncSpec: u8 {
    const INLINE   = 1 << 0;
    const NORETURN = 1 << 1;
  }
}

/// Scratch declarator modifiers, composed innermost outward once the whole
/// declarator has been read.
enum DeclMod {
  Ptr(TypeQual),
  Arr(TypeQual, Option<u64>),
  Fn(FuncType),
}

struct StructBuilder {
  ty: Ty,
  /// Bits remaining in the last byte of the current storage unit.
  bits: u32,
}

pub struct Parser<'a> {
  pub ts: TokenStream,
  pub ctx: &'a Context,
  pub scope: Scope,
  pub switches: Vec<crate::stmt::SwitchCases>,
}

static BUILTINS: &[(&str, DeclBuiltin)] = &[
  ("__builtin_alloca", DeclBuiltin::Alloca),
  ("__builtin_constant_p", DeclBuiltin::ConstantP),
  ("__builtin_expect", DeclBuiltin::Expect),
  ("__builtin_inff", DeclBuiltin::Inff),
  ("__builtin_nanf", DeclBuiltin::Nanf),
  ("__builtin_offsetof", DeclBuiltin::Offsetof),
  ("__builtin_types_compatible_p", DeclBuiltin::TypesCompatibleP),
  ("__builtin_unreachable", DeclBuiltin::Unreachable),
  ("__builtin_va_arg", DeclBuiltin::VaArg),
  ("__builtin_va_copy", DeclBuiltin::VaCopy),
  ("__builtin_va_end", DeclBuiltin::VaEnd),
  ("__builtin_va_start", DeclBuiltin::VaStart),
];

impl<'a> Parser<'a> {
  pub fn new(ctx: &'a Context, file: &str, src: &str) -> Result<Parser<'a>> {
    let mut scope = Scope::new();
    for &(name, b) in BUILTINS {
      let d = Decl::new(DeclKind::Builtin(b), ctx.tys.tvoid.clone(), TypeQual::empty(), Linkage::None);
      scope.put_decl(name, Rc::new(d));
    }
    let valist = Decl::new(
      DeclKind::Type,
      ctx.targ.typevalist.clone(),
      TypeQual::empty(),
      Linkage::None,
    );
    scope.put_decl("__builtin_va_list", Rc::new(valist));
    Ok(Parser { ts: TokenStream::new(file, src)?, ctx, scope, switches: vec![] })
  }

  fn istypename(&self, name: &str) -> bool {
    self.scope.get_decl(name, true).is_some_and(|d| matches!(d.kind, DeclKind::Type))
  }

  /// 6.7.1 Storage-class specifiers. `thread_local` may combine with
  /// exactly one of `static` or `extern`.
  fn storageclass(&mut self, sc: Option<&mut StorageClass>) -> Result<bool> {
    use TokenKind::*;
    let new = match self.ts.kind() {
      Typedef => StorageClass::TYPEDEF,
      Extern => StorageClass::EXTERN,
      Static => StorageClass::STATIC,
      ThreadLocal => StorageClass::THREADLOCAL,
      Auto => StorageClass::AUTO,
      Register => StorageClass::REGISTER,
      _ => return Ok(false),
    };
    let Some(sc) = sc else {
      return self.ts.err("storage class not allowed in this declaration");
    };
    let allowed = if sc.is_empty() {
      StorageClass::all()
    } else if *sc == StorageClass::THREADLOCAL {
      StorageClass::STATIC | StorageClass::EXTERN
    } else if *sc == StorageClass::STATIC || *sc == StorageClass::EXTERN {
      StorageClass::THREADLOCAL
    } else {
      StorageClass::empty()
    };
    if !allowed.contains(new) {
      return self.ts.err("invalid combination of storage class specifiers");
    }
    sc.insert(new);
    self.ts.next()?;
    Ok(true)
  }

  /// 6.7.3 Type qualifiers.
  fn typequal(&mut self, tq: &mut TypeQual) -> Result<bool> {
    match self.ts.kind() {
      TokenKind::Const => tq.insert(TypeQual::CONST),
      TokenKind::Volatile => tq.insert(TypeQual::VOLATILE),
      TokenKind::Restrict => tq.insert(TypeQual::RESTRICT),
      TokenKind::Atomic => {
        return self.ts.err("_Atomic type qualifier is not yet supported");
      }
      _ => return Ok(false),
    }
    self.ts.next()?;
    Ok(true)
  }

  /// 6.7.4 Function specifiers.
  fn funcspec(&mut self, fs: Option<&mut FuncSpec>) -> Result<bool> {
    let new = match self.ts.kind() {
      TokenKind::Inline => FuncSpec::INLINE,
      TokenKind::Noreturn => FuncSpec::NORETURN,
      _ => return Ok(false),
    };
    let Some(fs) = fs else {
      return self.ts.err("function specifier not allowed in this declaration");
    };
    fs.insert(new);
    self.ts.next()?;
    Ok(true)
  }

  fn tagspec(&mut self) -> Result<Ty> {
    let kind = self.ts.kind();
    assert!(matches!(kind, TokenKind::Struct | TokenKind::Union | TokenKind::Enum));
    self.ts.next()?;
    let mut tag = None;
    let mut t = None;
    if self.ts.kind() != TokenKind::LBrace {
      let tg = self.ts.expect(TokenKind::Ident, "or '{' after struct/union")?;
      t = self.scope.get_tag(&tg, false);
      if !self.scope.at_file_scope()
        && t.is_none()
        && self.ts.kind() != TokenKind::LBrace
        && (kind == TokenKind::Enum || self.ts.kind() != TokenKind::Semicolon)
      {
        t = self.scope.get_tag_enclosing(&tg);
      }
      tag = Some(tg);
    }
    let t = match t {
      Some(t) => {
        let matches = match kind {
          TokenKind::Struct => matches!(t.kind, TypeKind::Struct(_)),
          TokenKind::Union => matches!(t.kind, TypeKind::Union(_)),
          _ => matches!(t.kind, TypeKind::Enum(_)),
        };
        if !matches {
          return self.ts.err(format!(
            "redeclaration of tag '{}' with different kind",
            tag.as_deref().unwrap_or("")
          ));
        }
        t
      }
      None => {
        let t = if kind == TokenKind::Enum {
          self.ctx.tys.mkenum()
        } else {
          mkstruct(kind == TokenKind::Union, tag.as_deref().map(Rc::from))
        };
        if let Some(tag) = &tag {
          self.scope.put_tag(tag.clone(), t.clone());
        }
        t
      }
    };
    if self.ts.kind() != TokenKind::LBrace {
      return Ok(t);
    }
    if !t.incomplete.get() {
      return self.ts.err(format!("redefinition of tag '{}'", tag.as_deref().unwrap_or("")));
    }
    self.ts.next()?;
    match &t.kind {
      TypeKind::Struct(_) | TypeKind::Union(_) => {
        let mut b = StructBuilder { ty: t.clone(), bits: 0 };
        loop {
          self.structdecl(&mut b)?;
          if self.ts.kind() == TokenKind::RBrace {
            break;
          }
        }
        if t.struct_def().members.borrow().is_empty() {
          return self.ts.err("struct/union has no members");
        }
        self.ts.next()?;
        t.size.set(alignup(t.size.get(), t.align.get() as u64));
        t.incomplete.set(false);
      }
      TypeKind::Enum(base) => {
        let tys = &self.ctx.tys;
        let mut large = false;
        let mut i: u64 = 0;
        while self.ts.kind() == TokenKind::Ident {
          let name = std::mem::take(&mut self.ts.tok.lit);
          self.ts.next()?;
          let invalid = |s: &Self| {
            s.ts.err::<()>(format!(
              "enumerator '{name}' value cannot be represented as 'int' or 'unsigned int'"
            ))
          };
          if self.ts.consume(TokenKind::Assign)? {
            let e = self.constexpr()?;
            let ExprKind::Const(c) = &e.kind else {
              return self.ts.err("expected integer constant expression");
            };
            if !e.ty.prop.contains(TypeProp::INT) {
              return self.ts.err("expected integer constant expression");
            }
            i = c.int();
            if e.ty.is_signed() && i >= 1 << 63 {
              if i < (i32::MIN as i64 as u64) {
                invalid(self)?;
              }
              *base.borrow_mut() = tys.tint.clone();
            } else if i >= 1 << 32 {
              invalid(self)?;
            }
          } else if i == 1 << 32 {
            invalid(self)?;
          }
          let d = Decl::new(DeclKind::Const, tys.tint.clone(), TypeQual::empty(), Linkage::None);
          d.value.set(Some(Value::Int(i)));
          if i >= 1 << 31 && i < 1 << 63 {
            large = true;
            *d.ty.borrow_mut() = tys.tuint.clone();
          }
          if large && t.is_signed() {
            return self.ts.err("neither 'int' nor 'unsigned' can represent all enumerator values");
          }
          self.scope.put_decl(name, Rc::new(d));
          if !self.ts.consume(TokenKind::Comma)? {
            break;
          }
          i = i.wrapping_add(1);
        }
        self.ts.expect(TokenKind::RBrace, "to close enum specifier")?;
        t.incomplete.set(false);
      }
      _ => unreachable!(),
    }
    Ok(t)
  }

  /// 6.7 Declaration specifiers: qualifiers, storage classes, function
  /// specifiers and type specifiers in any order, the latter collapsed to
  /// one of the basic singletons.
  fn declspecs(
    &mut self,
    mut sc: Option<&mut StorageClass>,
    mut fs: Option<&mut FuncSpec>,
    mut align: Option<&mut u32>,
  ) -> Result<Option<QualType>> {
    use TokenKind::*;
    let mut t: Option<Ty> = None;
    let mut ts = TypeSpec::empty();
    let mut tq = TypeQual::empty();
    let mut ntypes = 0;
    if let Some(sc) = sc.as_deref_mut() {
      *sc = StorageClass::empty();
    }
    if let Some(fs) = fs.as_deref_mut() {
      *fs = FuncSpec::empty();
    }
    if let Some(align) = align.as_deref_mut() {
      *align = 0;
    }
    loop {
      if self.typequal(&mut tq)?
        || self.storageclass(sc.as_deref_mut())?
        || self.funcspec(fs.as_deref_mut())?
      {
        continue;
      }
      match self.ts.kind() {
        // 6.7.2 Type specifiers
        Void => {
          t = Some(self.ctx.tys.tvoid.clone());
          ntypes += 1;
          self.ts.next()?;
        }
        Char => {
          ts |= TypeSpec::CHAR;
          ntypes += 1;
          self.ts.next()?;
        }
        Short => {
          if ts.contains(TypeSpec::SHORT) {
            return self.ts.err("duplicate 'short'");
          }
          ts |= TypeSpec::SHORT;
          self.ts.next()?;
        }
        Int => {
          ts |= TypeSpec::INT;
          ntypes += 1;
          self.ts.next()?;
        }
        Long => {
          if ts.contains(TypeSpec::LONG2) {
            return self.ts.err("too many 'long'");
          }
          if ts.contains(TypeSpec::LONG) {
            ts |= TypeSpec::LONG2;
          }
          ts |= TypeSpec::LONG;
          self.ts.next()?;
        }
        Float => {
          ts |= TypeSpec::FLOAT;
          ntypes += 1;
          self.ts.next()?;
        }
        Double => {
          ts |= TypeSpec::DOUBLE;
          ntypes += 1;
          self.ts.next()?;
        }
        Signed => {
          if ts.contains(TypeSpec::SIGNED) {
            return self.ts.err("duplicate 'signed'");
          }
          ts |= TypeSpec::SIGNED;
          self.ts.next()?;
        }
        Unsigned => {
          if ts.contains(TypeSpec::UNSIGNED) {
            return self.ts.err("duplicate 'unsigned'");
          }
          ts |= TypeSpec::UNSIGNED;
          self.ts.next()?;
        }
        Bool => {
          t = Some(self.ctx.tys.tbool.clone());
          ntypes += 1;
          self.ts.next()?;
        }
        Complex => return self.ts.err("_Complex is not yet supported"),
        Atomic => return self.ts.err("_Atomic is not yet supported"),
        Struct | Union | Enum => {
          t = Some(self.tagspec()?);
          ntypes += 1;
        }
        Ident => {
          if t.is_some() || !ts.is_empty() {
            break;
          }
          let Some(d) = self.scope.get_decl(&self.ts.tok.lit, true) else { break };
          if !matches!(d.kind, DeclKind::Type) {
            break;
          }
          t = Some(d.ty.borrow().clone());
          tq |= d.qual;
          ntypes += 1;
          self.ts.next()?;
        }
        Typeof => {
          self.ts.next()?;
          self.ts.expect(LParen, "after 'typeof'")?;
          match self.typename(Some(&mut tq))? {
            Some(ty) => t = Some(ty),
            None => {
              let e = self.expr()?;
              let e = crate::expr::decayed_base(&e);
              t = Some(e.ty.clone());
              tq |= e.qual;
            }
          }
          ntypes += 1;
          self.ts.expect(RParen, "to close 'typeof'")?;
        }

        // 6.7.5 Alignment specifier
        Alignas => {
          if align.is_none() {
            return self.ts.err("alignment specifier not allowed in this declaration");
          }
          self.ts.next()?;
          self.ts.expect(LParen, "after 'alignas'")?;
          let i = match self.typename(None)? {
            Some(other) => other.align.get() as u64,
            None => self.intconstexpr(false)?,
          };
          if i & i.wrapping_sub(1) != 0 {
            return self.ts.err(format!("invalid alignment: {i}"));
          }
          if let Some(align) = align.as_deref_mut()
            && (i as u32) > *align
          {
            *align = i as u32;
          }
          self.ts.expect(RParen, "to close 'alignas' specifier")?;
        }

        _ => break,
      }
      if ntypes > 1 || (t.is_some() && !ts.is_empty()) {
        return self.ts.err("multiple types in declaration specifiers");
      }
    }
    let tys = &self.ctx.tys;
    if t.is_none() && !ts.is_empty() {
      let signed = ts.contains(TypeSpec::SIGNED);
      let unsigned = ts.contains(TypeSpec::UNSIGNED);
      if signed && unsigned {
        return self.ts.err("invalid combination of type specifiers");
      }
      let base = ts.difference(TypeSpec::SIGNED | TypeSpec::UNSIGNED);
      let longlong = TypeSpec::LONG | TypeSpec::LONG2;
      t = Some(if base == TypeSpec::CHAR {
        if unsigned {
          tys.tuchar.clone()
        } else if signed {
          tys.tschar.clone()
        } else {
          tys.tchar.clone()
        }
      } else if base == TypeSpec::SHORT || base == (TypeSpec::SHORT | TypeSpec::INT) {
        if unsigned { tys.tushort.clone() } else { tys.tshort.clone() }
      } else if base.is_empty() || base == TypeSpec::INT {
        if unsigned { tys.tuint.clone() } else { tys.tint.clone() }
      } else if base == TypeSpec::LONG || base == (TypeSpec::LONG | TypeSpec::INT) {
        if unsigned { tys.tulong.clone() } else { tys.tlong.clone() }
      } else if base == longlong || base == (longlong | TypeSpec::INT) {
        if unsigned { tys.tullong.clone() } else { tys.tllong.clone() }
      } else if base == TypeSpec::FLOAT && !signed && !unsigned {
        tys.tfloat.clone()
      } else if base == TypeSpec::DOUBLE && !signed && !unsigned {
        tys.tdouble.clone()
      } else if base == (TypeSpec::LONG | TypeSpec::DOUBLE) && !signed && !unsigned {
        tys.tldouble.clone()
      } else {
        return self.ts.err("invalid combination of type specifiers");
      });
    }
    let Some(t) = t else {
      if !tq.is_empty()
        || sc.as_deref().is_some_and(|sc| !sc.is_empty())
        || fs.as_deref().is_some_and(|fs| !fs.is_empty())
      {
        return self.ts.err("declaration has no type specifier");
      }
      return Ok(None);
    };
    // qualifiers of a typedef'd array apply to the element type
    if !tq.is_empty() && t.is_array() {
      let len = if t.incomplete.get() { None } else { Some(t.array_len()) };
      let t = mkarray(t.base(), t.base_qual() | tq, len);
      return Ok(Some(QualType { ty: t, qual: TypeQual::empty() }));
    }
    Ok(Some(QualType { ty: t, qual: tq }))
  }

  /// Parse a parameter list after the opening parenthesis, either a
  /// prototype or a K&R identifier list.
  fn funcmod(&mut self) -> Result<FuncType> {
    let mut params: Vec<Param> = vec![];
    let mut isprototype = false;
    let mut isvararg = false;
    match self.ts.kind() {
      TokenKind::Ident if !self.istypename(&self.ts.tok.lit) => {
        // identifier list (K&R declaration)
        loop {
          params.push(Param::new(Some(std::mem::take(&mut self.ts.tok.lit)), None, TypeQual::empty()));
          self.ts.next()?;
          if !(self.ts.consume(TokenKind::Comma)? && self.ts.kind() == TokenKind::Ident) {
            break;
          }
        }
      }
      TokenKind::RParen => {}
      _ => {
        isprototype = true;
        loop {
          params.push(self.parameter()?);
          if !self.ts.consume(TokenKind::Comma)? {
            break;
          }
          if self.ts.consume(TokenKind::Ellipsis)? {
            isvararg = true;
            break;
          }
        }
        if params.len() == 1 && params[0].ty().is_void() {
          params.clear();
        }
      }
    }
    self.ts.expect(TokenKind::RParen, "to close function declarator")?;
    let paraminfo = isprototype || !params.is_empty() || self.ts.kind() == TokenKind::LBrace;
    Ok(FuncType { params, isprototype, isvararg, isnoreturn: Cell::new(false), paraminfo })
  }

  /// 6.7.6 Declarators. Modifiers accumulate into `mods` ordered so that
  /// composing from the back attaches the innermost derivation first.
  fn declarator_mods(
    &mut self,
    mods: &mut Vec<DeclMod>,
    mut name: Option<&mut Option<String>>,
    allowabstract: bool,
  ) -> Result<()> {
    use TokenKind::*;
    while self.ts.consume(Mul)? {
      let mut tq = TypeQual::empty();
      while self.typequal(&mut tq)? {}
      mods.insert(0, DeclMod::Ptr(tq));
    }
    if let Some(name) = name.as_deref_mut() {
      *name = None;
    }
    // suffixes insert just before the leading pointers of this level;
    // the anchor is tracked as a distance from the list's tail
    let tail_dist = mods.len();
    let mut pending_fn = None;
    match self.ts.kind() {
      LParen => {
        self.ts.next()?;
        let isfunc = allowabstract
          && match self.ts.kind() {
            Mul | LParen => false,
            Ident => self.istypename(&self.ts.tok.lit),
            _ => true,
          };
        if isfunc {
          pending_fn = Some(self.funcmod()?);
        } else {
          self.declarator_mods(mods, name.as_deref_mut(), allowabstract)?;
          self.ts.expect(RParen, "after parenthesized declarator")?;
        }
      }
      Ident => {
        let Some(name) = name else {
          return self.ts.err("identifier not allowed in abstract declarator");
        };
        *name = Some(std::mem::take(&mut self.ts.tok.lit));
        self.ts.next()?;
      }
      _ => {
        if !allowabstract {
          return self.ts.err("expected '(' or identifier");
        }
      }
    }
    if let Some(f) = pending_fn {
      let at = mods.len() - tail_dist;
      mods.insert(at, DeclMod::Fn(f));
    }
    loop {
      match self.ts.kind() {
        LParen => {
          self.ts.next()?;
          let f = self.funcmod()?;
          let at = mods.len() - tail_dist;
          mods.insert(at, DeclMod::Fn(f));
        }
        LBrack => {
          self.ts.next()?;
          let mut tq = TypeQual::empty();
          loop {
            if self.ts.consume(Static)? || self.typequal(&mut tq)? {
              continue;
            }
            break;
          }
          if self.ts.kind() == Mul {
            return self.ts.err("VLAs are not yet supported");
          }
          let mut len = None;
          if self.ts.kind() != RBrack {
            let e = self.assignexpr()?;
            let e = crate::eval::eval(self.ctx, &e)?;
            let ExprKind::Const(c) = &e.kind else {
              return self.ts.err("VLAs are not yet supported");
            };
            if !e.ty.prop.contains(TypeProp::INT) {
              return self.ts.err("VLAs are not yet supported");
            }
            let i = c.int();
            if e.ty.is_signed() && i >> 63 != 0 {
              return self.ts.err("array length must be non-negative");
            }
            len = Some(i);
          }
          self.ts.expect(RBrack, "after array length")?;
          let at = mods.len() - tail_dist;
          mods.insert(at, DeclMod::Arr(tq, len));
        }
        _ => return Ok(()),
      }
    }
  }

  fn declarator(
    &mut self,
    base: QualType,
    mut name: Option<&mut Option<String>>,
    allowabstract: bool,
  ) -> Result<QualType> {
    let mut mods = vec![];
    self.declarator_mods(&mut mods, name.as_deref_mut(), allowabstract)?;
    let mut base = base;
    for m in mods.into_iter().rev() {
      base = match m {
        DeclMod::Ptr(tq) => QualType { ty: mkpointer(base.ty, base.qual), qual: tq },
        DeclMod::Arr(tq, len) => {
          if base.ty.incomplete.get() {
            return self.ts.err("array element has incomplete type");
          }
          if base.ty.is_func() {
            return self.ts.err("array element has function type");
          }
          QualType { ty: mkarray(base.ty, base.qual, len), qual: tq }
        }
        DeclMod::Fn(f) => {
          if base.ty.is_func() {
            return self.ts.err("function declarator specifies function return type");
          }
          if base.ty.is_array() {
            return self.ts.err("function declarator specifies array return type");
          }
          QualType { ty: mkfunc(base.ty, base.qual, f), qual: TypeQual::empty() }
        }
      };
    }
    Ok(base)
  }

  fn parameter(&mut self) -> Result<Param> {
    let mut sc = StorageClass::empty();
    let Some(base) = self.declspecs(Some(&mut sc), None, None)? else {
      return self.ts.err("no type in parameter declaration");
    };
    if !sc.is_empty() && sc != StorageClass::REGISTER {
      return self.ts.err("parameter declaration has invalid storage-class specifier");
    }
    let mut name = None;
    let qt = self.declarator(base, Some(&mut name), true)?;
    let mut tq = qt.qual;
    let ty = types::adjust(&qt.ty, &mut tq);
    Ok(Param::new(name, Some(ty), tq))
  }

  /// A K&R parameter declaration line before the function body.
  fn paramdecl(&mut self, params: &[Param]) -> Result<bool> {
    let mut sc = StorageClass::empty();
    let Some(base) = self.declspecs(Some(&mut sc), None, None)? else { return Ok(false) };
    if !sc.is_empty() && sc != StorageClass::REGISTER {
      return self.ts.err("parameter declaration has invalid storage-class specifier");
    }
    loop {
      let mut name = None;
      let qt = self.declarator(base.clone(), Some(&mut name), false)?;
      let name = name.expect("named declarator");
      let Some(p) = params.iter().find(|p| p.name.as_deref() == Some(name.as_str())) else {
        return self.ts.err(format!("old-style function declarator has no parameter named '{name}'"));
      };
      let mut tq = qt.qual;
      *p.ty.borrow_mut() = Some(types::adjust(&qt.ty, &mut tq));
      p.qual.set(tq);
      if self.ts.kind() == TokenKind::Semicolon {
        break;
      }
      self.ts.expect(TokenKind::Comma, "or ';' after parameter declarator")?;
    }
    self.ts.next()?;
    Ok(true)
  }

  fn addmember(
    &mut self,
    b: &mut StructBuilder,
    mt: QualType,
    name: Option<String>,
    mut align: u32,
    width: Option<u64>,
  ) -> Result<()> {
    let t = &b.ty;
    let mty = mt.ty;
    if t.flexible.get() {
      return self.ts.err("struct has member after flexible array member");
    }
    if mty.incomplete.get() {
      if !mty.is_array() {
        return self.ts.err("struct member has incomplete type");
      }
      t.flexible.set(true);
    }
    if mty.is_func() {
      return self.ts.err("struct member has function type");
    }
    if mty.flexible.get() {
      return self.ts.err("struct member contains flexible array member");
    }
    assert!(width.is_some() || mty.align.get() > 0);
    let mut m = if name.is_some() || width.is_none() {
      Some(Member { name, ty: mty.clone(), qual: mt.qual, offset: 0, bits: Bitfield::default() })
    } else {
      None
    };
    let isstruct = matches!(t.kind, TypeKind::Struct(_));
    match width {
      None => {
        let m = m.as_mut().expect("member");
        if align < mty.align.get() {
          if align != 0 {
            return self.ts.err("specified alignment of struct member is less strict than is required by type");
          }
          align = mty.align.get();
        }
        if isstruct {
          m.offset = alignup(t.size.get(), align as u64);
          t.size.set(m.offset + mty.size.get());
        } else {
          m.offset = 0;
          if t.size.get() < mty.size.get() {
            t.size.set(mty.size.get());
          }
        }
        b.bits = 0;
      }
      Some(width) => {
        if !mty.prop.contains(TypeProp::INT) {
          return self.ts.err("bit-field has invalid type");
        }
        if align != 0 {
          return self.ts.err("alignment specified for bit-field");
        }
        if width == 0 && m.as_ref().is_some_and(|m| m.name.is_some()) {
          return self.ts.err("bit-field with zero width must not have declarator");
        }
        if width > mty.size.get() * 8 {
          return self.ts.err("bit-field exceeds width of underlying type");
        }
        align = mty.align.get();
        if isstruct {
          // end of the storage unit for this bit-field
          let end = alignup(t.size.get(), mty.size.get());
          if width == 0 || width > (end - t.size.get()) * 8 + b.bits as u64 {
            // no room, allocate a new storage unit
            t.size.set(end);
            b.bits = 0;
          }
          if let Some(m) = m.as_mut() {
            m.offset = types::aligndown(t.size.get() - (b.bits != 0) as u64, mty.size.get());
            m.bits.before = ((t.size.get() - m.offset) * 8) as u32 - b.bits;
            m.bits.after = (mty.size.get() * 8) as u32 - width as u32 - m.bits.before;
          }
          t.size.set(t.size.get() + (width.wrapping_sub(b.bits as u64).wrapping_add(7)) / 8);
          b.bits = ((b.bits as u64).wrapping_sub(width) % 8) as u32;
        } else if let Some(m) = m.as_mut() {
          m.offset = 0;
          m.bits.before = 0;
          m.bits.after = (mty.size.get() * 8 - width) as u32;
          if t.size.get() < mty.size.get() {
            t.size.set(mty.size.get());
          }
        }
      }
    }
    if let Some(m) = m {
      if t.align.get() < align {
        t.align.set(align);
      }
      t.struct_def().members.borrow_mut().push(m);
    }
    Ok(())
  }

  fn structdecl(&mut self, b: &mut StructBuilder) -> Result<()> {
    if self.staticassert()? {
      return Ok(());
    }
    let mut align = 0;
    let Some(base) = self.declspecs(None, None, Some(&mut align))? else {
      return self.ts.err("no type in struct member declaration");
    };
    if self.ts.kind() == TokenKind::Semicolon {
      // anonymous struct/union member
      if !base.ty.is_struct_or_union() || base.ty.struct_def().tag.is_some() {
        return self.ts.err("struct declaration must declare at least one member");
      }
      self.ts.next()?;
      return self.addmember(b, base, None, align, None);
    }
    loop {
      if self.ts.consume(TokenKind::Colon)? {
        let width = self.intconstexpr(false)?;
        self.addmember(b, base.clone(), None, 0, Some(width))?;
      } else {
        let mut name = None;
        let mt = self.declarator(base.clone(), Some(&mut name), false)?;
        let width = if self.ts.consume(TokenKind::Colon)? {
          Some(self.intconstexpr(false)?)
        } else {
          None
        };
        self.addmember(b, mt, name, align, width)?;
      }
      if self.ts.kind() == TokenKind::Semicolon {
        break;
      }
      self.ts.expect(TokenKind::Comma, "or ';' after declarator")?;
    }
    self.ts.next()?;
    Ok(())
  }

  /// 6.7.7 Type names.
  pub fn typename(&mut self, tq: Option<&mut TypeQual>) -> Result<Option<Ty>> {
    let Some(base) = self.declspecs(None, None, None)? else { return Ok(None) };
    let qt = self.declarator(base, None, true)?;
    if let Some(tq) = tq {
      *tq |= qt.qual;
    }
    Ok(Some(qt.ty))
  }

  fn staticassert(&mut self) -> Result<bool> {
    if !self.ts.consume(TokenKind::StaticAssert)? {
      return Ok(false);
    }
    self.ts.expect(TokenKind::LParen, "after static_assert")?;
    let c = self.intconstexpr(true)?;
    if self.ts.consume(TokenKind::Comma)? {
      if self.ts.kind() != TokenKind::StringLit {
        return self.ts.err("expected string literal after static assertion expression");
      }
      let (data, _) = self.stringconcat(true)?;
      if c == 0 {
        let msg = String::from_utf8_lossy(&data[..data.len().saturating_sub(1)]).into_owned();
        return self.ts.err(format!("static assertion failed: {msg}"));
      }
    } else if c == 0 {
      return self.ts.err("static assertion failed");
    }
    self.ts.expect(TokenKind::RParen, "after static assertion")?;
    self.ts.expect(TokenKind::Semicolon, "after static assertion")?;
    Ok(true)
  }

  fn declcommon(
    &mut self,
    kind: DeclKind,
    name: &str,
    asmname: Option<Rc<str>>,
    t: Ty,
    tq: TypeQual,
    sc: StorageClass,
    prior: Option<Rc<Decl>>,
  ) -> Result<Rc<Decl>> {
    let ctx = self.ctx;
    let kindstr = if matches!(kind, DeclKind::Func) { "function" } else { "object" };
    let filescope = self.scope.at_file_scope();
    if let Some(prior) = prior {
      if prior.linkage == Linkage::None {
        return self.ts.err(format!("{kindstr} '{name}' with no linkage redeclared"));
      }
      let linkage = getlinkage(kind, sc, Some(&prior), filescope);
      if prior.linkage != linkage {
        return self.ts.err(format!("{kindstr} '{name}' redeclared with different linkage"));
      }
      if !compatible(&t, &prior.ty.borrow()) || tq != prior.qual {
        return self.ts.err(format!("{kindstr} '{name}' redeclared with incompatible type"));
      }
      if let Some(an) = &asmname
        && prior.asmname.borrow().as_deref() != Some(&**an)
      {
        return self.ts.err(format!("{kindstr} '{name}' redeclared with different assembler name"));
      }
      let merged = composite(&t, &prior.ty.borrow());
      *prior.ty.borrow_mut() = merged;
      return Ok(prior);
    }
    let mut prior = if filescope { None } else { self.scope.get_decl_enclosing(name) };
    let linkage = getlinkage(kind, sc, prior.as_ref(), filescope);
    let mut t = t;
    let mut asmname = asmname;
    if linkage != Linkage::None && !filescope {
      if !self.scope.parent_is_file() {
        prior = self.scope.get_decl_file(name);
      }
      if let Some(p) = prior
        && p.linkage != Linkage::None
      {
        if !kind_matches(p.kind, kind) {
          return self.ts.err(format!("'{name}' redeclared with different kind"));
        }
        if p.linkage != linkage {
          return self.ts.err(format!("{kindstr} '{name}' redeclared with different linkage"));
        }
        if !compatible(&t, &p.ty.borrow()) || tq != p.qual {
          return self.ts.err(format!("{kindstr} '{name}' redeclared with incompatible type"));
        }
        match &asmname {
          None => asmname = p.asmname.borrow().clone(),
          Some(an) => {
            if p.asmname.borrow().as_deref() != Some(&**an) {
              return self.ts.err(format!("{kindstr} '{name}' redeclared with different assembler name"));
            }
          }
        }
        t = composite(&t, &p.ty.borrow());
      }
    }
    let d = Rc::new(Decl::new(kind, t, tq, linkage));
    self.scope.put_decl(name, d.clone());
    if matches!(kind, DeclKind::Func) || linkage != Linkage::None || sc.contains(StorageClass::STATIC)
    {
      let symbol = asmname.as_deref().unwrap_or(name);
      d.value.set(Some(ctx.mkglobal(symbol, linkage == Linkage::None && asmname.is_none())));
      *d.asmname.borrow_mut() = asmname;
    }
    debug!(name, ?linkage, "declared {kindstr}");
    Ok(d)
  }

  /// Parse one external declaration, or one block-scope declaration when a
  /// function is being built. Returns false if the lookahead does not start
  /// a declaration.
  pub fn decl(&mut self, mut f: Option<&mut Func>) -> Result<bool> {
    use TokenKind::*;
    let ctx = self.ctx;
    if self.staticassert()? {
      return Ok(true);
    }
    let mut sc = StorageClass::empty();
    let mut fs = FuncSpec::empty();
    let mut align = 0u32;
    let Some(base) = self.declspecs(Some(&mut sc), Some(&mut fs), Some(&mut align))? else {
      return Ok(false);
    };
    if f.is_some() {
      if sc == StorageClass::THREADLOCAL {
        return self.ts.err(
          "block scope declaration containing 'thread_local' must contain 'static' or 'extern'",
        );
      }
    } else {
      // 6.9p2
      if sc.contains(StorageClass::AUTO) {
        return self.ts.err("external declaration must not contain 'auto'");
      }
      if sc.contains(StorageClass::REGISTER) {
        return self.ts.err("external declaration must not contain 'register'");
      }
    }
    if sc.contains(StorageClass::THREADLOCAL) {
      return self.ts.err("'_Thread_local' is not yet supported");
    }
    if self.ts.consume(Semicolon)? {
      return Ok(true);
    }
    let mut allowfunc = f.is_none();
    loop {
      let mut name = None;
      let qt = self.declarator(base.clone(), Some(&mut name), false)?;
      let name = name.expect("named declarator");
      let t = qt.ty;
      let tq = qt.qual;
      let asmname: Option<Rc<str>> = if self.ts.consume(Asm)? {
        self.ts.expect(LParen, "after __asm__")?;
        if self.ts.kind() != StringLit {
          return self.ts.err("expected string literal for assembler name");
        }
        let (data, _) = self.stringconcat(true)?;
        self.ts.expect(RParen, "after assembler name")?;
        allowfunc = false;
        let label = String::from_utf8_lossy(&data[..data.len().saturating_sub(1)]).into_owned();
        Some(Rc::from(label))
      } else {
        None
      };
      let kind = if sc.contains(StorageClass::TYPEDEF) {
        DeclKind::Type
      } else if t.is_func() {
        DeclKind::Func
      } else {
        DeclKind::Object
      };
      let prior = self.scope.get_decl(&name, false);
      if let Some(p) = &prior
        && !kind_matches(p.kind, kind)
      {
        return self.ts.err(format!("'{name}' redeclared with different kind"));
      }
      match kind {
        DeclKind::Type => {
          if align != 0 {
            return self.ts.err(format!("typedef '{name}' declared with alignment specifier"));
          }
          if asmname.is_some() {
            return self.ts.err(format!("typedef '{name}' declared with assembler label"));
          }
          match prior {
            None => {
              let d = Decl::new(DeclKind::Type, t, tq, Linkage::None);
              self.scope.put_decl(name, Rc::new(d));
            }
            Some(p) => {
              if !same(&p.ty.borrow(), &t) || p.qual != tq {
                return self.ts.err(format!("typedef '{name}' redefined with different type"));
              }
            }
          }
        }
        DeclKind::Object => {
          if align != 0 && align < t.align.get() {
            return self.ts.err(format!(
              "object '{name}' requires alignment {}, which is stricter than specified alignment {align}",
              t.align.get()
            ));
          }
          let d = self.declcommon(kind, &name, asmname, t, tq, sc, prior)?;
          if d.align.get() < align {
            d.align.set(align);
          }
          let loc = self.ts.loc();
          let mut init: Option<Vec<Init>> = None;
          let mut define = true;
          if self.ts.consume(Assign)? {
            if f.is_some() && d.linkage != Linkage::None {
              let what = if d.linkage == Linkage::Extern { "external" } else { "internal" };
              return self.ts.err(format!(
                "object '{name}' with block scope and {what} linkage cannot have initializer"
              ));
            }
            if d.defined.get() {
              return self.ts.err(format!("object '{name}' redefined"));
            }
            let dt = d.ty.borrow().clone();
            init = Some(self.parseinit(&dt)?);
          } else if d.linkage != Linkage::None {
            if !sc.contains(StorageClass::EXTERN) && !d.defined.get() && !d.tentative.get() {
              d.tentative.set(true);
              ctx.tentative.borrow_mut().push(d.clone());
            }
            define = false;
          }
          if define {
            if d.linkage != Linkage::None || sc.contains(StorageClass::STATIC) {
              emit::data(ctx, &d, init.as_deref())?;
            } else {
              f.as_deref_mut()
                .expect("block-scope object outside function")
                .init(ctx, &loc, &d, init.as_deref())?;
            }
            d.defined.set(true);
            d.tentative.set(false);
          }
        }
        DeclKind::Func => {
          if align != 0 {
            return self.ts.err(format!("function '{name}' declared with alignment specifier"));
          }
          let ft = t.func();
          if fs.contains(FuncSpec::NORETURN) {
            ft.isnoreturn.set(true);
          }
          if f.is_some() && !sc.is_empty() && sc != StorageClass::EXTERN {
            // 6.7.1p7
            return self.ts.err(format!(
              "function '{name}' with block scope may only have storage class 'extern'"
            ));
          }
          if !ft.isprototype && !ft.params.is_empty() {
            if !allowfunc {
              return self.ts.err("function definition not allowed");
            }
            // collect parameter types before checking compatibility
            while self.paramdecl(&t.func().params)? {}
            if self.ts.kind() != LBrace {
              return self.ts.err("function declaration with identifier list is not part of definition");
            }
            for p in &t.func().params {
              if p.ty.borrow().is_none() {
                return self.ts.err(format!(
                  "old-style function definition does not declare '{}'",
                  p.name.as_deref().unwrap_or("")
                ));
              }
            }
          }
          let d = self.declcommon(kind, &name, asmname, t.clone(), tq, sc, prior.clone())?;
          d.inlinedefn.set(
            d.linkage == Linkage::Extern
              && fs.contains(FuncSpec::INLINE)
              && !sc.contains(StorageClass::EXTERN)
              && prior.is_none_or(|p| p.inlinedefn.get()),
          );
          if self.ts.kind() == LBrace {
            if !allowfunc {
              return self.ts.err("function definition not allowed");
            }
            if d.defined.get() {
              return self.ts.err(format!("function '{name}' redefined"));
            }
            let loc = self.ts.loc();
            self.scope.push();
            let mut func = Func::new(ctx, d.clone(), &name, t, &mut self.scope)?;
            self.stmt(&mut func)?;
            check_gotos(&func, &loc)?;
            if !d.inlinedefn.get() {
              emit::func(ctx, &mut func, d.linkage == Linkage::Extern)?;
            }
            self.scope.pop();
            d.defined.set(true);
            debug!(name = %name, "compiled function");
            return Ok(true);
          }
        }
        _ => unreachable!(),
      }
      if self.ts.consume(Semicolon)? {
        return Ok(true);
      }
      self.ts.expect(Comma, "or ';' after declarator")?;
      allowfunc = false;
    }
  }
}

fn getlinkage(kind: DeclKind, sc: StorageClass, prior: Option<&Rc<Decl>>, filescope: bool) -> Linkage {
  if sc.contains(StorageClass::STATIC) {
    return if filescope { Linkage::Intern } else { Linkage::None };
  }
  if sc.contains(StorageClass::EXTERN) || matches!(kind, DeclKind::Func) {
    return prior.map_or(Linkage::Extern, |p| p.linkage);
  }
  if filescope { Linkage::Extern } else { Linkage::None }
}

/// The interned data record for a string literal: one private global per
/// distinct contents, emitted on first use.
pub fn stringdecl(ctx: &Context, e: &ExprRef) -> Result<Rc<Decl>> {
  let ExprKind::String(s) = &e.kind else {
    panic!("internal error: not a string literal");
  };
  let key = s.data.borrow().clone();
  if let Some(d) = ctx.strings.borrow().get(&key) {
    return Ok(d.clone());
  }
  let d = Rc::new(Decl::new(DeclKind::Object, e.ty.clone(), TypeQual::empty(), Linkage::None));
  d.value.set(Some(ctx.mkglobal("string", true)));
  emit::data(
    ctx,
    &d,
    Some(&[Init { start: 0, end: e.ty.size.get(), bits: Bitfield::default(), expr: e.clone() }]),
  )?;
  ctx.strings.borrow_mut().insert(key, d.clone());
  Ok(d)
}
