//! Exercise the executable surface: file input, `-o`, `-E`, exit codes.

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

fn qbecc() -> Command {
  Command::new(env!("CARGO_BIN_EXE_qbecc"))
}

#[test]
fn compiles_file_to_output_file() {
  let dir = tempfile::tempdir().unwrap();
  let input = dir.path().join("t.c");
  let output = dir.path().join("t.qbe");
  fs::write(&input, "int main(void) { return 0; }\n").unwrap();
  let status = qbecc().arg("-o").arg(&output).arg(&input).status().unwrap();
  assert!(status.success());
  let ir = fs::read_to_string(&output).unwrap();
  assert!(ir.contains("function w $main()"), "{ir}");
}

#[test]
fn reads_stdin_by_default() {
  let mut child = qbecc()
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();
  child
    .stdin
    .as_mut()
    .unwrap()
    .write_all(b"int x = 3;\n")
    .unwrap();
  let out = child.wait_with_output().unwrap();
  assert!(out.status.success());
  let ir = String::from_utf8(out.stdout).unwrap();
  assert!(ir.contains("data $x = align 4 { w 3, }"), "{ir}");
}

#[test]
fn dump_tokens_mode() {
  let mut child = qbecc()
    .arg("-E")
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .unwrap();
  child
    .stdin
    .as_mut()
    .unwrap()
    .write_all(b"int main(void);\n")
    .unwrap();
  let out = child.wait_with_output().unwrap();
  assert!(out.status.success());
  let text = String::from_utf8(out.stdout).unwrap();
  let tokens: Vec<&str> = text.lines().collect();
  assert_eq!(tokens, ["int", "main", "(", "void", ")", ";"]);
}

#[test]
fn diagnostics_exit_nonzero_with_location() {
  let dir = tempfile::tempdir().unwrap();
  let input = dir.path().join("bad.c");
  fs::write(&input, "int x = ;\n").unwrap();
  let out = qbecc().arg(&input).output().unwrap();
  assert!(!out.status.success());
  let err = String::from_utf8(out.stderr).unwrap();
  assert!(err.contains("bad.c:1:"), "{err}");
  assert!(err.contains("error:"), "{err}");
}

#[test]
fn static_assert_failure_exits_nonzero() {
  let mut child = qbecc().stdin(Stdio::piped()).stderr(Stdio::piped()).spawn().unwrap();
  child
    .stdin
    .as_mut()
    .unwrap()
    .write_all(b"_Static_assert(0, \"bad\");\n")
    .unwrap();
  let out = child.wait_with_output().unwrap();
  assert!(!out.status.success());
  let err = String::from_utf8(out.stderr).unwrap();
  assert!(err.contains("bad"), "{err}");
}
