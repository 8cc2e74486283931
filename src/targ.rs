//! The target descriptor. A single x86-64-shaped target: fixed integer
//! widths, `wchar_t` is `int`, and `va_list` is the SysV one-element array
//! of the register-save descriptor struct.

use std::rc::Rc;

use crate::types::{self, Bitfield, Member, Ty, TypeQual, Types, mkarray, mkpointer};

pub struct Target {
  pub typewchar: Ty,
  pub typevalist: Ty,
  /// `typevalist` after array-to-pointer decay, the type `va_list` has as a
  /// function argument.
  pub typeadjvalist: Ty,
  /// The struct behind `va_list`, emitted as an opaque `align 8 { 24 }`.
  pub valiststruct: Ty,
}

impl Target {
  pub fn new(tys: &Types) -> Target {
    let voidptr = mkpointer(tys.tvoid.clone(), TypeQual::empty());
    let s = types::mkstruct(false, Some(Rc::from("va_list")));
    {
      let mut members = s.struct_def().members.borrow_mut();
      let mut field = |name: &str, ty: &Ty, offset: u64| {
        members.push(Member {
          name: Some(name.into()),
          ty: ty.clone(),
          qual: TypeQual::empty(),
          offset,
          bits: Bitfield::default(),
        });
      };
      field("gp_offset", &tys.tuint, 0);
      field("fp_offset", &tys.tuint, 4);
      field("overflow_arg_area", &voidptr, 8);
      field("reg_save_area", &voidptr, 16);
    }
    s.size.set(24);
    s.align.set(8);
    s.incomplete.set(false);

    let typevalist = mkarray(s.clone(), TypeQual::empty(), Some(1));
    let mut tq = TypeQual::empty();
    let typeadjvalist = types::adjust(&typevalist, &mut tq);
    Target { typewchar: tys.tint.clone(), typevalist, typeadjvalist, valiststruct: s }
  }
}
