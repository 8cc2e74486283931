//! Nested declaration and tag namespaces. The scope stack replaces parent
//! pointers: frame 0 is file scope, lookups walk from the top frame down.

use std::rc::Rc;

use hashbrown::HashMap;

use crate::decl::Decl;
use crate::ir::BlockId;
use crate::types::Ty;

#[derive(Default)]
struct Frame {
  decls: HashMap<String, Rc<Decl>>,
  tags: HashMap<String, Ty>,
  breaklabel: Option<BlockId>,
  continuelabel: Option<BlockId>,
  /// Index into the statement parser's switch stack.
  switchcases: Option<usize>,
}

pub struct Scope {
  frames: Vec<Frame>,
}

impl Scope {
  pub fn new() -> Scope {
    Scope { frames: vec![Frame::default()] }
  }

  pub fn push(&mut self) {
    self.frames.push(Frame::default());
  }

  pub fn pop(&mut self) {
    assert!(self.frames.len() > 1, "cannot pop file scope");
    self.frames.pop();
  }

  pub fn at_file_scope(&self) -> bool {
    self.frames.len() == 1
  }

  pub fn parent_is_file(&self) -> bool {
    self.frames.len() == 2
  }

  pub fn put_decl(&mut self, name: impl Into<String>, d: Rc<Decl>) {
    self.frames.last_mut().expect("scope stack").decls.insert(name.into(), d);
  }

  pub fn put_tag(&mut self, name: impl Into<String>, t: Ty) {
    self.frames.last_mut().expect("scope stack").tags.insert(name.into(), t);
  }

  pub fn get_decl(&self, name: &str, recurse: bool) -> Option<Rc<Decl>> {
    self.lookup_decl(self.frames.len(), recurse, name)
  }

  /// Lookup starting at the enclosing scope, recursing outward.
  pub fn get_decl_enclosing(&self, name: &str) -> Option<Rc<Decl>> {
    self.lookup_decl(self.frames.len() - 1, true, name)
  }

  /// Lookup in file scope only.
  pub fn get_decl_file(&self, name: &str) -> Option<Rc<Decl>> {
    self.frames[0].decls.get(name).cloned()
  }

  fn lookup_decl(&self, top: usize, recurse: bool, name: &str) -> Option<Rc<Decl>> {
    for frame in self.frames[..top].iter().rev() {
      if let Some(d) = frame.decls.get(name) {
        return Some(d.clone());
      }
      if !recurse {
        break;
      }
    }
    None
  }

  pub fn get_tag(&self, name: &str, recurse: bool) -> Option<Ty> {
    for frame in self.frames.iter().rev() {
      if let Some(t) = frame.tags.get(name) {
        return Some(t.clone());
      }
      if !recurse {
        break;
      }
    }
    None
  }

  /// Tag lookup starting at the enclosing scope, recursing outward.
  pub fn get_tag_enclosing(&self, name: &str) -> Option<Ty> {
    for frame in self.frames[..self.frames.len() - 1].iter().rev() {
      if let Some(t) = frame.tags.get(name) {
        return Some(t.clone());
      }
    }
    None
  }

  pub fn set_breaklabel(&mut self, l: BlockId) {
    self.frames.last_mut().expect("scope stack").breaklabel = Some(l);
  }

  pub fn set_continuelabel(&mut self, l: BlockId) {
    self.frames.last_mut().expect("scope stack").continuelabel = Some(l);
  }

  pub fn set_switchcases(&mut self, idx: usize) {
    self.frames.last_mut().expect("scope stack").switchcases = Some(idx);
  }

  pub fn breaklabel(&self) -> Option<BlockId> {
    self.frames.iter().rev().find_map(|f| f.breaklabel)
  }

  pub fn continuelabel(&self) -> Option<BlockId> {
    self.frames.iter().rev().find_map(|f| f.continuelabel)
  }

  pub fn switchcases(&self) -> Option<usize> {
    self.frames.iter().rev().find_map(|f| f.switchcases)
  }
}
