//! End-to-end tests: compile C snippets and check the emitted IR.

use qbecc::compile_to_string;

fn ok(src: &str) -> String {
  match compile_to_string(src) {
    Ok(ir) => ir,
    Err(e) => panic!("compilation failed: {e}\nsource: {src}"),
  }
}

fn fails(src: &str) -> String {
  match compile_to_string(src) {
    Ok(ir) => panic!("compilation unexpectedly succeeded:\n{ir}"),
    Err(e) => e.to_string(),
  }
}

#[test]
fn return_zero() {
  let ir = ok("int main(void) { return 0; }");
  assert!(ir.starts_with("export\nfunction w $main() {\n"), "{ir}");
  assert!(ir.contains("@start."), "{ir}");
  assert!(ir.contains("@body."), "{ir}");
  assert!(ir.contains("\tret 0\n"), "{ir}");
  assert!(ir.trim_end().ends_with('}'), "{ir}");
}

#[test]
fn implicit_return_from_main() {
  let ir = ok("int main(void) {}");
  assert!(ir.contains("\tret 0\n"), "{ir}");
}

#[test]
fn static_assert_pass_and_fail() {
  ok("static_assert(sizeof(int) == 4);");
  ok("_Static_assert(sizeof(long) == 8, \"long is 8 bytes\");");
  let msg = fails("static_assert(0, \"bad\");");
  assert!(msg.contains("bad"), "{msg}");
  let msg = fails("_Static_assert(0);");
  assert!(msg.contains("static assertion failed"), "{msg}");
}

#[test]
fn enumerator_overflow_makes_unsigned() {
  let ir = ok("enum { A = 0x80000000 };\nint x = __builtin_types_compatible_p(typeof(A), unsigned);\nunsigned y = A;\n");
  assert!(ir.contains("data $x = align 4 { w 1, }"), "{ir}");
  assert!(ir.contains("data $y = align 4 { w 2147483648, }"), "{ir}");
}

#[test]
fn enumerator_mixed_sign_rejected() {
  let msg = fails("enum { A = -1, B = 0x80000000 };");
  assert!(msg.contains("enumerator") || msg.contains("represent"), "{msg}");
}

#[test]
fn struct_layout() {
  let ir = ok("struct S { int x; char y; };\n\
    int a = sizeof(struct S);\n\
    unsigned long b = __builtin_offsetof(struct S, y);\n\
    int c = _Alignof(struct S);\n");
  assert!(ir.contains("data $a = align 4 { w 8, }"), "{ir}");
  assert!(ir.contains("data $b = align 8 { l 4, }"), "{ir}");
  assert!(ir.contains("data $c = align 4 { w 4, }"), "{ir}");
}

#[test]
fn bitfield_data_packs_into_bytes() {
  let ir = ok("struct { unsigned a:3; unsigned b:5; } s = { 5, 17 };");
  assert!(ir.contains("b 141"), "{ir}");
  assert!(ir.contains("z 3"), "{ir}");
}

#[test]
fn bitfield_load_and_store() {
  let ir = ok("struct B { unsigned a:3; int b:5; };\n\
    int g(struct B *p) { p->b = 9; return p->b; }\n");
  // write: mask and merge with the loaded unit
  assert!(ir.contains("and"), "{ir}");
  assert!(ir.contains("or"), "{ir}");
  // signed read: shift left, then arithmetic shift right
  assert!(ir.contains("shl"), "{ir}");
  assert!(ir.contains("sar"), "{ir}");
}

#[test]
fn switch_lowers_to_binary_search() {
  let ir = ok("int f(int x) {\n\
    switch (x) {\n\
    case 1: return 1;\n\
    case 1000000: return 2;\n\
    case -3: return 3;\n\
    }\n\
    return 0;\n\
  }\n");
  assert_eq!(ir.matches("ceqw").count(), 3, "{ir}");
  assert!(ir.contains("cultw"), "{ir}");
  assert!(ir.contains("@switch_case."), "{ir}");
}

#[test]
fn duplicate_case_rejected() {
  let msg = fails("int f(int x) { switch (x) { case 1: case 1: return 0; } return 1; }");
  assert!(msg.contains("multiple 'case' labels"), "{msg}");
}

#[test]
fn case_outside_switch_rejected() {
  let msg = fails("int f(int x) { case 1: return 0; }");
  assert!(msg.contains("'case' label must be in switch"), "{msg}");
}

#[test]
fn tentative_definition_zero_initialized() {
  let ir = ok("int t;\nint t;\n");
  assert!(ir.contains("export data $t = align 4 { z 4 }"), "{ir}");
  assert_eq!(ir.matches("data $t").count(), 1, "{ir}");
}

#[test]
fn tentative_overridden_by_definition() {
  let ir = ok("int t;\nint t = 7;\n");
  assert!(ir.contains("w 7"), "{ir}");
  assert_eq!(ir.matches("data $t").count(), 1, "{ir}");
}

#[test]
fn short_circuit_uses_phi() {
  let ir = ok("int h(int a, int b) { return a && b; }");
  assert!(ir.contains("phi"), "{ir}");
  assert!(ir.contains("jnz"), "{ir}");
  assert!(ir.contains("@logic_join."), "{ir}");
}

#[test]
fn string_literal_interned_and_quoted() {
  let ir = ok("const char *s = \"hi\";\nconst char *t = \"hi\";\n");
  assert!(ir.contains("b \"hi\\000\""), "{ir}");
  assert_eq!(ir.matches("b \"hi").count(), 1, "interned once: {ir}");
  assert!(ir.contains("export data $s = align 8 { l $.Lstring."), "{ir}");
}

#[test]
fn string_concatenation() {
  let ir = ok("const char *s = \"ab\" \"cd\";");
  assert!(ir.contains("b \"abcd\\000\""), "{ir}");
}

#[test]
fn wide_string_elements() {
  let ir = ok("unsigned short s[] = u\"a\";");
  // one 16-bit unit for 'a' plus the terminator
  assert!(ir.contains("h 97 0"), "{ir}");
}

#[test]
fn char_array_from_string() {
  let ir = ok("char s[] = \"hi\";\nint n = sizeof(s);\n");
  assert!(ir.contains("data $s = align 1 { b \"hi\\000\", }"), "{ir}");
  assert!(ir.contains("w 3"), "{ir}");
}

#[test]
fn generic_selection() {
  let ir = ok("int g = _Generic(1, int: 5, default: 6);");
  assert!(ir.contains("w 5"), "{ir}");
  let ir = ok("int g = _Generic(1.0, int: 5, default: 6);");
  assert!(ir.contains("w 6"), "{ir}");
}

#[test]
fn compound_literal() {
  let ir = ok("int f(void) { int *p = &(int){3}; return *p; }");
  assert!(ir.contains("alloc4"), "{ir}");
  assert!(ir.contains("storew 3"), "{ir}");
}

#[test]
fn goto_forward_and_undefined() {
  let ir = ok("int f(void) { goto end; end: return 1; }");
  assert!(ir.contains("jmp @end."), "{ir}");
  let msg = fails("int f(void) { goto nowhere; return 1; }");
  assert!(msg.contains("not defined"), "{msg}");
}

#[test]
fn varargs_call_marks_boundary() {
  let ir = ok("int printf(const char *, ...);\nint f(void) { return printf(\"%d\", 5); }");
  assert!(ir.contains(", ..., w 5"), "{ir}");
  assert!(ir.contains("call $printf("), "{ir}");
}

#[test]
fn vararg_function_header() {
  let ir = ok("int sum(int n, ...) { return n; }");
  assert!(ir.contains("function w $sum(w %.1, ...)"), "{ir}");
}

#[test]
fn knr_definition() {
  let ir = ok("int add(a, b) int a; int b; { return a + b; }");
  assert!(ir.contains("function w $add(w %.1, w %.2)"), "{ir}");
  assert!(ir.contains("\tadd"), "{ir}");
}

#[test]
fn pointer_difference_scales() {
  let ir = ok("long d(int *a, int *b) { return a - b; }");
  assert!(ir.contains("div"), "{ir}");
  assert!(ir.contains("4"), "{ir}");
}

#[test]
fn pointer_addition_scales() {
  let ir = ok("int *f(int *p) { return p + 2; }");
  assert!(ir.contains("mul"), "{ir}");
  assert!(ir.contains(", 4"), "index scaled by sizeof(int): {ir}");
}

#[test]
fn constant_folding() {
  let ir = ok("int x = (5 + 3) * 2 - 1;\n\
    int s = 1 << 10;\n\
    int q = -5 / 2;\n\
    unsigned char c = (unsigned char)300;\n");
  assert!(ir.contains("w 15"), "{ir}");
  assert!(ir.contains("w 1024"), "{ir}");
  // signed division truncates toward zero; -2 sign-extended to 64 bits
  assert!(ir.contains("w 18446744073709551614"), "{ir}");
  // narrow unsigned results are masked at fold time
  assert!(ir.contains("b 44"), "{ir}");
}

#[test]
fn division_by_zero_in_constant_rejected() {
  let msg = fails("int x = 1 / 0;");
  assert!(msg.contains("division by zero"), "{msg}");
}

#[test]
fn float_constants() {
  let ir = ok("double d = 1.5;\nfloat f = 0.25f;\nfloat h = 0x1.8p1f;\n");
  assert!(ir.contains("d_1.5"), "{ir}");
  assert!(ir.contains("s_0.25"), "{ir}");
  assert!(ir.contains("s_3"), "{ir}");
}

#[test]
fn conditional_constant_folds() {
  let ir = ok("int x = 1 ? 10 : 20;");
  assert!(ir.contains("w 10"), "{ir}");
}

#[test]
fn compound_assignment_shares_address() {
  let ir = ok("int f(int *p) { p[0] += 3; return p[0]; }");
  // one load and one store through the same computed address
  assert!(ir.contains("loadw"), "{ir}");
  assert!(ir.contains("storew"), "{ir}");
}

#[test]
fn aggregate_type_emitted_for_calls() {
  let ir = ok("struct P { long x, y; };\n\
    struct P mk(void);\n\
    long f(void) { struct P p = mk(); return p.x; }\n");
  assert!(ir.contains("type :P.1 = { l, l, }"), "{ir}");
  assert!(ir.contains("call $mk()"), "{ir}");
  assert!(ir.contains(":P.1"), "{ir}");
}

#[test]
fn union_type_nested_braces() {
  let ir = ok("union U { int i; double d; };\n\
    union U pass(union U);\n\
    double f(union U u) { return pass(u).d; }\n");
  assert!(ir.contains("type :U.1 = { { w } { d } }"), "{ir}");
}

#[test]
fn designated_initializers() {
  let ir = ok("struct S { int a, b, c; };\nstruct S s = { .c = 3, .a = 1 };");
  assert!(ir.contains("w 1, z 4, w 3"), "{ir}");
}

#[test]
fn array_designators_extend_incomplete() {
  let ir = ok("int a[] = { [3] = 7 };\nint n = sizeof(a);\n");
  assert!(ir.contains("z 12, w 7"), "{ir}");
  assert!(ir.contains("w 16"), "{ir}");
}

#[test]
fn later_initializer_overrides_earlier() {
  let ir = ok("int a[2] = { [0] = 1, [1] = 2, [0] = 9 };");
  assert!(ir.contains("w 9, w 2"), "{ir}");
  assert!(!ir.contains("w 1,"), "{ir}");
}

#[test]
fn local_initializer_zeroes_gaps() {
  let ir = ok("int f(void) { struct { char c; int x; } v = { 1, 2 }; return v.x; }");
  assert!(ir.contains("storeb"), "{ir}");
  assert!(ir.contains("storew"), "{ir}");
}

#[test]
fn static_local() {
  let ir = ok("int f(void) { static int n = 3; return n; }");
  assert!(ir.contains("data $.Ln."), "{ir}");
  assert!(ir.contains("w 3"), "{ir}");
}

#[test]
fn func_name_builtin() {
  let ir = ok("const char *f(void) { return __func__; }");
  assert!(ir.contains("b \"f\", b 0"), "{ir}");
}

#[test]
fn inline_definition_not_emitted() {
  let ir = ok("inline int twice(int x) { return 2 * x; }\nint f(int y) { return y; }");
  assert!(!ir.contains("$twice"), "{ir}");
  assert!(ir.contains("$f"), "{ir}");
}

#[test]
fn conversions() {
  let ir = ok("long f(int x) { return x; }\n\
    unsigned long g(unsigned x) { return x; }\n\
    double h(int x) { return x; }\n\
    int i(double x) { return x; }\n\
    _Bool b(long x) { return x; }\n");
  assert!(ir.contains("extsw"), "{ir}");
  assert!(ir.contains("extuw"), "{ir}");
  assert!(ir.contains("swtof"), "{ir}");
  assert!(ir.contains("dtosi"), "{ir}");
  assert!(ir.contains("cnel"), "{ir}");
}

#[test]
fn loops_and_break_continue() {
  let ir = ok("int f(int n) {\n\
    int s = 0;\n\
    for (int i = 0; i < n; i++) {\n\
      if (i == 3) continue;\n\
      if (i == 7) break;\n\
      s += i;\n\
    }\n\
    while (s > 100) s--;\n\
    do s++; while (s < 10);\n\
    return s;\n\
  }\n");
  assert!(ir.contains("@for_cond."), "{ir}");
  assert!(ir.contains("@for_cont."), "{ir}");
  assert!(ir.contains("@while_cond."), "{ir}");
  assert!(ir.contains("@do_body."), "{ir}");
}

#[test]
fn break_outside_loop_rejected() {
  let msg = fails("int f(void) { break; return 0; }");
  assert!(msg.contains("'break' statement must be in loop or switch"), "{msg}");
}

#[test]
fn undeclared_identifier_rejected() {
  let msg = fails("int f(void) { return zap; }");
  assert!(msg.contains("undeclared identifier"), "{msg}");
}

#[test]
fn incompatible_redeclaration_rejected() {
  let msg = fails("int x;\nlong x;\n");
  assert!(msg.contains("incompatible type"), "{msg}");
  let msg = fails("static int y;\nextern double y;\n");
  assert!(msg.contains("redeclared"), "{msg}");
}

#[test]
fn call_arity_checked() {
  let msg = fails("int f(int, int);\nint g(void) { return f(1); }");
  assert!(msg.contains("not enough arguments"), "{msg}");
  let msg = fails("int f(int);\nint g(void) { return f(1, 2); }");
  assert!(msg.contains("too many arguments"), "{msg}");
}

#[test]
fn lvalue_required_for_assignment() {
  let msg = fails("int f(int x) { 1 = x; return 0; }");
  assert!(msg.contains("lvalue"), "{msg}");
}

#[test]
fn const_store_rejected() {
  let msg = fails("int f(void) { const int x = 1; x = 2; return x; }");
  assert!(msg.contains("const"), "{msg}");
}

#[test]
fn address_of_bitfield_rejected() {
  let msg = fails("struct B { int a:3; };\nint *f(struct B *p) { return &p->a; }");
  assert!(msg.contains("bit-field"), "{msg}");
}

#[test]
fn flexible_array_member() {
  ok("struct V { int n; int data[]; };\nint f(struct V *v) { return v->data[0]; }");
  let msg = fails("struct V { int data[]; int n; };");
  assert!(msg.contains("flexible array member"), "{msg}");
}

#[test]
fn bitfield_wider_than_type_rejected() {
  let msg = fails("struct B { int a:33; };");
  assert!(msg.contains("exceeds width"), "{msg}");
}

#[test]
fn anonymous_member_access() {
  let ir = ok("struct S { struct { int x; }; int y; };\n\
    int f(struct S *s) { return s->x + s->y; }\n\
    int o = __builtin_offsetof(struct S, y);\n");
  assert!(ir.contains("data $o = align 4 { w 4, }"), "{ir}");
}

#[test]
fn unsupported_features_diagnosed() {
  assert!(fails("_Atomic int x;").contains("_Atomic"));
  assert!(fails("_Complex double z;").contains("_Complex"));
  assert!(fails("_Thread_local int t;").contains("_Thread_local"));
  assert!(fails("int f(int n) { int a[n]; return a[0]; }").contains("VLA"));
  assert!(fails("volatile int v;\nint f(void) { v = 1; return 0; }").contains("volatile"));
}

#[test]
fn alloca_builtin() {
  let ir = ok("void *f(void) { return __builtin_alloca(32); }");
  assert!(ir.contains("alloc16"), "{ir}");
}

#[test]
fn va_builtins() {
  let ir = ok("int first(int n, ...) {\n\
    __builtin_va_list ap;\n\
    __builtin_va_start(ap, n);\n\
    int v = __builtin_va_arg(ap, int);\n\
    __builtin_va_end(ap);\n\
    return v;\n\
  }\n");
  assert!(ir.contains("vastart"), "{ir}");
  assert!(ir.contains("vaarg"), "{ir}");
}

#[test]
fn typedefs_resolve() {
  let ir = ok("typedef unsigned long size_t;\nsize_t n = 8;\n");
  assert!(ir.contains("data $n = align 8 { l 8, }"), "{ir}");
}

#[test]
fn asm_label_renames_symbol() {
  let ir = ok("int counter __asm__(\"real_counter\") = 1;");
  assert!(ir.contains("data $real_counter"), "{ir}");
}

#[test]
fn unreachable_code_after_return_dropped() {
  let ir = ok("int f(void) { return 1; return 2; }");
  assert!(!ir.contains("@dead."), "{ir}");
  assert!(ir.contains("ret 1"), "{ir}");
}

#[test]
fn conditional_operator_lowering() {
  let ir = ok("int f(int c, int a, int b) { return c ? a : b; }");
  assert!(ir.contains("@cond_true."), "{ir}");
  assert!(ir.contains("phi"), "{ir}");
}

#[test]
fn large_alignment_masks_slot() {
  let ir = ok("int f(void) { _Alignas(64) int x = 1; return x; }");
  assert!(ir.contains("alloc16"), "{ir}");
  assert!(ir.contains("and"), "{ir}");
}
