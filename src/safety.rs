//! The safety oracle: which functions may be transformed at all.
//!
//! A function is hazardous when it contains a call whose callee is inline
//! assembly, or a call to `setjmp`/`_setjmp`/`longjmp` by name. Rewriting
//! such a function can break register or stack assumptions the hazard
//! depends on. For the string pass the hazard is contagious: any caller of
//! a hazardous function is itself off limits, computed to a fixed point
//! over the call graph (mutual recursion taints both sides).
//!
//! The oracle is an analysis. It never mutates the module.

use log::debug;

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Callee, FuncId, InstructionData, Module};

/// Callee names treated as non-local-jump hazards.
const SETJMP_FAMILY: &[&str] = &["setjmp", "_setjmp", "longjmp"];

/// Per-module safety facts. Compute once per pass with
/// [`SafetyOracle::compute`], then query per function.
pub struct SafetyOracle {
    /// Functions that directly contain inline asm or a setjmp-family call.
    hazardous: FxHashSet<FuncId>,
    /// Transitive closure of `hazardous` over the caller relation.
    tainted: FxHashSet<FuncId>,
    /// Functions containing a terminator the flattener cannot track.
    untracked_flow: FxHashSet<FuncId>,
}

impl SafetyOracle {
    /// Analyze `module`.
    pub fn compute(module: &Module) -> Self {
        let mut hazardous = FxHashSet::default();
        let mut untracked_flow = FxHashSet::default();
        // Reverse call graph: callee -> callers.
        let mut callers: FxHashMap<FuncId, Vec<FuncId>> = FxHashMap::default();

        for (id, func) in module.functions.iter() {
            for block in func.layout.blocks() {
                for inst in func.layout.block_insts(block) {
                    match &func.dfg[inst] {
                        InstructionData::Call { callee, .. } => match callee {
                            Callee::Asm => {
                                hazardous.insert(id);
                            }
                            Callee::Direct(target) => {
                                let name = module.functions[*target].name.as_str();
                                if SETJMP_FAMILY.contains(&name) {
                                    hazardous.insert(id);
                                }
                                callers.entry(*target).or_default().push(id);
                            }
                            Callee::Indirect(_) => {}
                        },
                        data if data.is_terminator() && !data.is_supported_terminator() => {
                            untracked_flow.insert(id);
                        }
                        _ => {}
                    }
                }
            }
        }

        // Propagate the hazard to callers until nothing changes.
        let mut tainted = hazardous.clone();
        let mut worklist: Vec<FuncId> = tainted.iter().copied().collect();
        while let Some(func) = worklist.pop() {
            if let Some(callers_of) = callers.get(&func) {
                for &caller in callers_of {
                    if tainted.insert(caller) {
                        worklist.push(caller);
                    }
                }
            }
        }

        debug!(
            "safety oracle: {} hazardous, {} tainted, {} with untracked flow",
            hazardous.len(),
            tainted.len(),
            untracked_flow.len()
        );

        Self {
            hazardous,
            tainted,
            untracked_flow,
        }
    }

    /// Does `func` directly contain inline asm or a setjmp-family call?
    pub fn is_hazardous(&self, func: FuncId) -> bool {
        self.hazardous.contains(&func)
    }

    /// Is `func` hazardous, or a (transitive) caller of a hazardous
    /// function? The string pass skips any global read through a tainted
    /// function.
    pub fn is_tainted(&self, func: FuncId) -> bool {
        self.tainted.contains(&func)
    }

    /// May the flattener rewrite `func`?
    pub fn may_flatten(&self, module: &Module, func: FuncId) -> bool {
        let f = &module.functions[func];
        if f.is_declaration() || f.is_intrinsic() {
            return false;
        }
        if f.layout.num_inserted_blocks() < 2 {
            return false;
        }
        if self.is_hazardous(func) || self.untracked_flow.contains(&func) {
            return false;
        }
        true
    }

    /// May the fake-code pass touch `func`? Untracked terminators are fine
    /// here; the pass only splits unconditional edges.
    pub fn may_insert_fake_code(&self, module: &Module, func: FuncId) -> bool {
        let f = &module.functions[func];
        !f.is_declaration() && !f.is_intrinsic() && !self.is_hazardous(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Cursor, FuncCursor};
    use crate::ir::{Function, InstBuilder, Module, Signature, Type};

    fn single_block_fn(name: &str) -> Function {
        let mut func = Function::with_name_signature(name, Signature::default());
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        cur.ins().ret(None);
        func
    }

    #[test]
    fn asm_taints_callers_transitively() {
        let mut module = Module::new("t.c", "x86_64-unknown-linux-gnu");

        // leaf() contains inline asm; mid() calls leaf(); top() calls mid().
        let mut leaf = Function::with_name_signature("leaf", Signature::default());
        let block0 = leaf.dfg.make_block();
        leaf.layout.append_block(block0);
        let mut cur = FuncCursor::new(&mut leaf).at_bottom(block0);
        cur.ins().call_asm(&[]);
        cur.ins().ret(None);
        let leaf = module.define_function(leaf);

        let mut mid = Function::with_name_signature("mid", Signature::default());
        let block0 = mid.dfg.make_block();
        mid.layout.append_block(block0);
        let mut cur = FuncCursor::new(&mut mid).at_bottom(block0);
        cur.ins().call(leaf, &[], None);
        cur.ins().ret(None);
        let mid = module.define_function(mid);

        let mut top = Function::with_name_signature("top", Signature::default());
        let block0 = top.dfg.make_block();
        top.layout.append_block(block0);
        let mut cur = FuncCursor::new(&mut top).at_bottom(block0);
        cur.ins().call(mid, &[], None);
        cur.ins().ret(None);
        let top = module.define_function(top);

        let clean = module.define_function(single_block_fn("clean"));

        let oracle = SafetyOracle::compute(&module);
        assert!(oracle.is_hazardous(leaf));
        assert!(!oracle.is_hazardous(mid));
        assert!(oracle.is_tainted(leaf));
        assert!(oracle.is_tainted(mid));
        assert!(oracle.is_tainted(top));
        assert!(!oracle.is_tainted(clean));
    }

    #[test]
    fn setjmp_by_name_is_hazardous() {
        let mut module = Module::new("t.c", "x86_64-unknown-linux-gnu");
        let setjmp = module.declare_function(
            "setjmp",
            Signature::new(vec![Type::Ptr], Some(Type::I32)),
        );

        let mut func =
            Function::with_name_signature("uses_setjmp", Signature::new(vec![], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        let buf = cur.ins().alloca(Type::I64, 32);
        let call = cur.ins().call(setjmp, &[buf], Some(Type::I32));
        let res = cur.func.dfg.inst_result(call).unwrap();
        cur.ins().ret(Some(res));
        let id = module.define_function(func);

        let oracle = SafetyOracle::compute(&module);
        assert!(oracle.is_hazardous(id));
        assert!(!oracle.may_flatten(&module, id));
        assert!(!oracle.may_insert_fake_code(&module, id));
    }

    #[test]
    fn mutual_recursion_over_hazard_taints_both() {
        let mut module = Module::new("t.c", "x86_64-unknown-linux-gnu");
        // a() and b() call each other; b() also calls asm.
        let mut a = Function::with_name_signature("a", Signature::default());
        let ab = a.dfg.make_block();
        a.layout.append_block(ab);
        let a_id = module.define_function(a);

        let mut b = Function::with_name_signature("b", Signature::default());
        let bb = b.dfg.make_block();
        b.layout.append_block(bb);
        let mut cur = FuncCursor::new(&mut b).at_bottom(bb);
        cur.ins().call(a_id, &[], None);
        cur.ins().call_asm(&[]);
        cur.ins().ret(None);
        let b_id = module.define_function(b);

        let mut cur_a = FuncCursor::new(&mut module.functions[a_id]).at_bottom(ab);
        cur_a.ins().call(b_id, &[], None);
        cur_a.ins().ret(None);

        let oracle = SafetyOracle::compute(&module);
        assert!(oracle.is_tainted(a_id));
        assert!(oracle.is_tainted(b_id));
    }

    #[test]
    fn small_functions_not_flattened() {
        let mut module = Module::new("t.c", "x86_64-unknown-linux-gnu");
        let id = module.define_function(single_block_fn("tiny"));
        let decl = module.declare_function("ext", Signature::default());

        let oracle = SafetyOracle::compute(&module);
        assert!(!oracle.may_flatten(&module, id));
        assert!(!oracle.may_flatten(&module, decl));
        assert!(oracle.may_insert_fake_code(&module, id));
        assert!(!oracle.may_insert_fake_code(&module, decl));
    }
}
