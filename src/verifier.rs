//! A verifier for the structural rules the passes rely on.
//!
//! This is not a full type checker. It enforces the shape invariants that
//! keep graph edits sound:
//!
//! - Every inserted block ends with exactly one terminator, and only one.
//! - Phi instructions form a leading cluster at the top of their block, and
//!   their incoming arms agree with the CFG predecessors.
//! - The entry block has no predecessors and no phis.
//! - Branch targets are blocks inserted in the layout.
//! - Operands are valid value references.
//!
//! All problems are collected before reporting, so a broken module
//! surfaces every complaint at once.

use core::fmt;

use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashSet;
use crate::ir::{Function, Module};

/// The accumulated complaints from a verifier run.
#[derive(Debug, Default)]
pub struct VerifierErrors(pub Vec<String>);

impl VerifierErrors {
    fn report(&mut self, func: &Function, message: String) {
        self.0.push(format!("{}: {}", func.name, message));
    }

    /// Did the run pass?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VerifierErrors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "- {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerifierErrors {}

/// Verify one function, appending problems to `errors`.
fn verify_function_into(func: &Function, errors: &mut VerifierErrors) {
    let Some(entry) = func.entry_block() else {
        // Declarations have nothing to check.
        return;
    };

    let cfg = ControlFlowGraph::with_function(func);

    if cfg.num_preds(entry) != 0 {
        errors.report(func, format!("entry {entry} has predecessors"));
    }

    for block in func.layout.blocks() {
        let Some(last) = func.layout.last_inst(block) else {
            errors.report(func, format!("{block} is empty"));
            continue;
        };
        if !func.dfg[last].is_terminator() {
            errors.report(
                func,
                format!("{block} does not end in a terminator ({})", func.dfg[last]),
            );
        }

        let mut seen_non_phi = false;
        for inst in func.layout.block_insts(block) {
            let data = &func.dfg[inst];
            if data.is_terminator() && inst != last {
                errors.report(func, format!("terminator {data} in the middle of {block}"));
            }
            if data.is_phi() {
                if seen_non_phi {
                    errors.report(func, format!("phi below non-phi instruction in {block}"));
                }
                if block == entry {
                    errors.report(func, format!("phi in entry {block}"));
                }
            } else {
                seen_non_phi = true;
            }

            for value in data.arguments() {
                if !func.dfg.value_is_valid(value) {
                    errors.report(func, format!("invalid value reference in {block}"));
                }
            }
            for dest in data.branch_destinations() {
                if !func.dfg.block_is_valid(dest) || !func.layout.is_block_inserted(dest) {
                    errors.report(func, format!("branch in {block} targets detached {dest}"));
                }
            }
        }

        // Phi arms must match the CFG predecessors exactly.
        for inst in func.block_phis(block) {
            if let crate::ir::InstructionData::Phi { args, .. } = &func.dfg[inst] {
                let arms: FxHashSet<_> = args.iter().map(|&(pred, _)| pred).collect();
                let preds: FxHashSet<_> = cfg.pred_iter(block).map(|p| p.block).collect();
                if arms != preds {
                    errors.report(
                        func,
                        format!("phi in {block} disagrees with its predecessors"),
                    );
                }
                if args.len() != arms.len() {
                    errors.report(func, format!("phi in {block} has duplicate arms"));
                }
            }
        }
    }
}

/// Verify one function.
pub fn verify_function(func: &Function) -> Result<(), VerifierErrors> {
    let mut errors = VerifierErrors::default();
    verify_function_into(func, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Verify every function of a module.
pub fn verify_module(module: &Module) -> Result<(), VerifierErrors> {
    let mut errors = VerifierErrors::default();
    for (_, func) in module.functions.iter() {
        verify_function_into(func, &mut errors);
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Cursor, FuncCursor};
    use crate::ir::{Function, InstBuilder, IntCC, Signature, Type};

    #[test]
    fn accepts_well_formed() {
        let mut func = Function::with_name_signature(
            "abs",
            Signature::new(vec![Type::I32], Some(Type::I32)),
        );
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        let block2 = func.dfg.make_block();
        func.layout.append_block(block0);
        func.layout.append_block(block1);
        func.layout.append_block(block2);
        let arg = func.params[0];

        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        let cond = cur.ins().icmp_imm(IntCC::SignedLessThan, arg, 0);
        cur.ins().br(cond, block1, block2);

        let mut cur = FuncCursor::new(&mut func).at_bottom(block1);
        let zero = cur.func.dfg.iconst(Type::I32, 0);
        let neg = cur.ins().isub(zero, arg);
        cur.ins().ret(Some(neg));

        let mut cur = FuncCursor::new(&mut func).at_bottom(block2);
        cur.ins().ret(Some(arg));

        verify_function(&func).unwrap();
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![Type::I32], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let arg = func.params[0];
        let one = func.dfg.iconst(Type::I32, 1);
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        cur.ins().iadd(arg, one);

        let errors = verify_function(&func).unwrap_err();
        assert_eq!(errors.0.len(), 1);
        assert!(errors.0[0].contains("terminator"));
    }

    #[test]
    fn rejects_phi_in_entry() {
        let mut func =
            Function::with_name_signature("g", Signature::new(vec![Type::I32], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let arg = func.params[0];
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        let merged = cur.ins().phi(Type::I32, &[(block0, arg)]);
        cur.ins().ret(Some(merged));

        assert!(verify_function(&func).is_err());
    }
}
