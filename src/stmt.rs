//! Statement parsing (C11 6.8): pure dispatch on the first token, with the
//! control-flow blocks allocated up front and scratch break/continue labels
//! carried on the scope stack.

use std::collections::BTreeMap;

use crate::decl::Parser;
use crate::expr::exprconvert;
use crate::ir::{BlockId, Func};
use crate::token::TokenKind;
use crate::types::{Ty, TypeProp};
use crate::Result;

/// The case tree of the innermost switch, keyed by the 64-bit case value.
pub struct SwitchCases {
  pub cases: BTreeMap<u64, BlockId>,
  pub defaultlabel: Option<BlockId>,
  /// Promoted type of the controlling expression.
  pub ty: Ty,
}

impl Parser<'_> {
  fn gotolabel(&mut self, f: &mut Func) -> Result<bool> {
    if self.ts.kind() != TokenKind::Ident {
      return Ok(false);
    }
    let name = self.ts.tok.lit.clone();
    if !self.ts.peek(TokenKind::Colon)? {
      return Ok(false);
    }
    let blk = f.goto_label(self.ctx, &name);
    let g = f.gotos.get_mut(&name).expect("goto label");
    if g.defined {
      return self.ts.err(format!("duplicate label '{name}'"));
    }
    g.defined = true;
    f.label(blk);
    Ok(true)
  }

  /// 6.8 Statements and blocks.
  pub fn stmt(&mut self, f: &mut Func) -> Result<()> {
    use TokenKind::*;
    while self.gotolabel(f)? {}
    let ctx = self.ctx;
    let loc = self.ts.loc();
    match self.ts.kind() {
      // 6.8.1 Labeled statements
      Case => {
        self.ts.next()?;
        let Some(idx) = self.scope.switchcases() else {
          return self.ts.err("'case' label must be in switch");
        };
        let blk = f.new_block(ctx, "switch_case");
        f.label(blk);
        let i = self.intconstexpr(true)?;
        if self.switches[idx].cases.insert(i, blk).is_some() {
          return self.ts.err("multiple 'case' labels with same value");
        }
        self.ts.expect(Colon, "after case expression")?;
        self.stmt(f)?;
      }
      Default => {
        self.ts.next()?;
        let Some(idx) = self.scope.switchcases() else {
          return self.ts.err("'default' label must be in switch");
        };
        if self.switches[idx].defaultlabel.is_some() {
          return self.ts.err("multiple 'default' labels");
        }
        self.ts.expect(Colon, "after 'default'")?;
        let blk = f.new_block(ctx, "switch_default");
        self.switches[idx].defaultlabel = Some(blk);
        f.label(blk);
        self.stmt(f)?;
      }

      // 6.8.2 Compound statement
      LBrace => {
        self.ts.next()?;
        self.scope.push();
        while self.ts.kind() != RBrace {
          if self.gotolabel(f)? || !self.decl(Some(f))? {
            self.stmt(f)?;
          }
        }
        self.scope.pop();
        self.ts.next()?;
      }

      // 6.8.3 Expression statement
      Semicolon => self.ts.next()?,

      // 6.8.4 Selection statements
      If => {
        self.ts.next()?;
        self.scope.push();
        self.ts.expect(LParen, "after 'if'")?;
        let e = self.expr()?;
        let v = f.expr(ctx, &loc, &e)?.expect("condition value");
        self.ts.expect(RParen, "after expression")?;

        let tblk = f.new_block(ctx, "if_true");
        let fblk = f.new_block(ctx, "if_false");
        f.jnz(ctx, v, Some(&e.ty), tblk, fblk)?;

        f.label(tblk);
        self.scope.push();
        self.stmt(f)?;
        self.scope.pop();

        if self.ts.consume(Else)? {
          let join = f.new_block(ctx, "if_join");
          f.jmp(join);
          f.label(fblk);
          self.scope.push();
          self.stmt(f)?;
          self.scope.pop();
          f.label(join);
        } else {
          f.label(fblk);
        }
        self.scope.pop();
      }
      Switch => {
        self.ts.next()?;
        self.scope.push();
        self.ts.expect(LParen, "after 'switch'")?;
        let mut e = self.expr()?;
        self.ts.expect(RParen, "after expression")?;

        if !e.ty.prop.contains(TypeProp::INT) {
          return self.ts.err("controlling expression of switch statement must have integer type");
        }
        let promoted = ctx.tys.promote(&e.ty, None);
        e = exprconvert(e, &promoted);

        let cond = f.new_block(ctx, "switch_cond");
        let join = f.new_block(ctx, "switch_join");

        let v = f.expr(ctx, &loc, &e)?.expect("controlling value");
        f.jmp(cond);
        self.scope.push();
        self.scope.set_breaklabel(join);
        self.switches.push(SwitchCases {
          cases: BTreeMap::new(),
          defaultlabel: None,
          ty: e.ty.clone(),
        });
        self.scope.set_switchcases(self.switches.len() - 1);
        self.stmt(f)?;
        f.jmp(join);

        f.label(cond);
        let sw = self.switches.pop().expect("switch stack");
        f.switch(ctx, v, &sw.ty, &sw.cases, sw.defaultlabel.unwrap_or(join))?;
        self.scope.pop();

        f.label(join);
        self.scope.pop();
      }

      // 6.8.5 Iteration statements
      While => {
        self.ts.next()?;
        self.scope.push();
        self.ts.expect(LParen, "after 'while'")?;
        let e = self.expr()?;
        self.ts.expect(RParen, "after expression")?;

        let cond = f.new_block(ctx, "while_cond");
        let body = f.new_block(ctx, "while_body");
        let join = f.new_block(ctx, "while_join");

        f.label(cond);
        let v = f.expr(ctx, &loc, &e)?.expect("condition value");
        f.jnz(ctx, v, Some(&e.ty), body, join)?;
        f.label(body);
        self.scope.push();
        self.scope.set_continuelabel(cond);
        self.scope.set_breaklabel(join);
        self.stmt(f)?;
        self.scope.pop();
        f.jmp(cond);
        f.label(join);
        self.scope.pop();
      }
      Do => {
        self.ts.next()?;

        let body = f.new_block(ctx, "do_body");
        let join = f.new_block(ctx, "do_join");

        self.scope.push();
        self.scope.push();
        self.scope.set_continuelabel(body);
        self.scope.set_breaklabel(join);
        f.label(body);
        self.stmt(f)?;
        self.scope.pop();

        self.ts.expect(While, "after 'do' statement")?;
        self.ts.expect(LParen, "after 'while'")?;
        let e = self.expr()?;
        self.ts.expect(RParen, "after expression")?;

        let v = f.expr(ctx, &loc, &e)?.expect("condition value");
        f.jnz(ctx, v, Some(&e.ty), body, join)?;
        f.label(join);
        self.scope.pop();
        self.ts.expect(Semicolon, "after 'do' statement")?;
      }
      For => {
        self.ts.next()?;
        self.ts.expect(LParen, "after 'for'")?;
        self.scope.push();
        if !self.decl(Some(f))? {
          if self.ts.kind() != Semicolon {
            let e = self.expr()?;
            f.expr(ctx, &loc, &e)?;
          }
          self.ts.expect(Semicolon, "after 'for' initializer")?;
        }

        let cond = f.new_block(ctx, "for_cond");
        let body = f.new_block(ctx, "for_body");
        let cont = f.new_block(ctx, "for_cont");
        let join = f.new_block(ctx, "for_join");

        f.label(cond);
        if self.ts.kind() != Semicolon {
          let e = self.expr()?;
          let v = f.expr(ctx, &loc, &e)?.expect("condition value");
          f.jnz(ctx, v, Some(&e.ty), body, join)?;
        }
        self.ts.expect(Semicolon, "after 'for' condition")?;
        let post = if self.ts.kind() == RParen { None } else { Some(self.expr()?) };
        self.ts.expect(RParen, "after 'for' clauses")?;

        f.label(body);
        self.scope.push();
        self.scope.set_breaklabel(join);
        self.scope.set_continuelabel(cont);
        self.stmt(f)?;
        self.scope.pop();

        f.label(cont);
        if let Some(e) = post {
          f.expr(ctx, &loc, &e)?;
        }
        f.jmp(cond);
        f.label(join);
        self.scope.pop();
      }

      // 6.8.6 Jump statements
      Goto => {
        self.ts.next()?;
        let name = self.ts.expect(Ident, "after 'goto'")?;
        let blk = f.goto_label(ctx, &name);
        f.jmp(blk);
        self.ts.expect(Semicolon, "after 'goto' statement")?;
      }
      Continue => {
        self.ts.next()?;
        let Some(l) = self.scope.continuelabel() else {
          return self.ts.err("'continue' statement must be in loop");
        };
        f.jmp(l);
        self.ts.expect(Semicolon, "after 'continue' statement")?;
      }
      Break => {
        self.ts.next()?;
        let Some(l) = self.scope.breaklabel() else {
          return self.ts.err("'break' statement must be in loop or switch");
        };
        f.jmp(l);
        self.ts.expect(Semicolon, "after 'break' statement")?;
      }
      Return => {
        self.ts.next()?;
        let rt = f.ty.base();
        if rt.is_void() {
          f.ret(None);
        } else {
          let e = exprconvert(self.expr()?, &rt);
          let v = f.expr(ctx, &loc, &e)?;
          f.ret(v);
        }
        self.ts.expect(Semicolon, "after 'return' statement")?;
      }

      _ => {
        let e = self.expr()?;
        f.expr(ctx, &loc, &e)?;
        self.ts.expect(Semicolon, "after expression statement")?;
      }
    }
    Ok(())
  }
}
