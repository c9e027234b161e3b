//! Control-flow flattening.
//!
//! Rewrites a function body as a dispatched state machine: the entry block
//! seeds a 32-bit state slot and jumps to a dispatcher, the dispatcher
//! switches on the state to reach one of the original blocks, and every
//! original block ends by storing its successor's state id and jumping back
//! to the dispatcher. Blocks ending in `return` or `unreachable` keep their
//! terminators. The result computes the same values through a control-flow
//! graph with no visible branch structure.
//!
//! The rewrite is committed per function: every precondition is checked
//! before the first edit, so a function is either fully flattened or left
//! untouched.

use log::{debug, trace};

use crate::cursor::{Cursor, FuncCursor};
use crate::demote::demote_ssa;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{
    Block, Function, InstBuilder, InstructionData, IntCC, Module, Type, Value,
};
use crate::report::Report;
use crate::rng::Xorshift32;
use crate::safety::SafetyOracle;
use crate::verifier::verify_function;

/// What happened to one function.
#[derive(Debug, PartialEq, Eq)]
pub enum FlattenOutcome {
    /// The function was rewritten; `case_blocks` original blocks now hang
    /// off the dispatcher.
    Flattened {
        /// Number of dispatched blocks.
        case_blocks: usize,
    },
    /// The function was left untouched.
    Skipped,
}

/// Run control-flow flattening over every eligible function of `module`.
pub fn do_control_flow_flattening(
    module: &mut Module,
    oracle: &SafetyOracle,
    rng: &mut Xorshift32,
    report: &mut Report,
) {
    let ids: Vec<_> = module.functions.keys().collect();
    for id in ids {
        let func = &module.functions[id];
        if func.is_declaration() || func.is_intrinsic() {
            continue;
        }
        if !oracle.may_flatten(module, id) {
            debug!("cff: skipping {} (safety oracle)", module.functions[id].name);
            report.skipped_functions += 1;
            continue;
        }
        match flatten_function(&mut module.functions[id], rng) {
            FlattenOutcome::Flattened { case_blocks } => {
                report.flattened_functions += 1;
                report.flattened_blocks += case_blocks as u32;
            }
            FlattenOutcome::Skipped => {
                debug!("cff: skipping {} (structure)", module.functions[id].name);
                report.skipped_functions += 1;
            }
        }
    }
}

/// Flatten one function. The caller has already consulted the safety
/// oracle; this checks the structural preconditions and performs the
/// rewrite.
pub fn flatten_function(func: &mut Function, rng: &mut Xorshift32) -> FlattenOutcome {
    let Some(entry) = func.entry_block() else {
        return FlattenOutcome::Skipped;
    };
    let case_blocks: Vec<Block> = func.layout.blocks().filter(|&b| b != entry).collect();
    if case_blocks.is_empty() {
        return FlattenOutcome::Skipped;
    }

    // Validate before mutating anything. The entry must fall through into
    // the state machine, every terminator must be rewritable, and every
    // branch target must be mappable to a state id (only the entry block
    // has none).
    let entry_term = func.layout.last_inst(entry).expect("entry has a terminator");
    if !matches!(
        func.dfg[entry_term],
        InstructionData::Jump { .. } | InstructionData::Br { .. } | InstructionData::Switch { .. }
    ) {
        return FlattenOutcome::Skipped;
    }
    for &block in &case_blocks {
        let term = func.layout.last_inst(block).expect("block has a terminator");
        let data = &func.dfg[term];
        if !data.is_supported_terminator() {
            return FlattenOutcome::Skipped;
        }
        if data.branch_destinations().contains(&entry) {
            // A branch back to the entry has no state id to store.
            return FlattenOutcome::Skipped;
        }
    }

    // Unique non-zero state id per dispatched block. Random ids give the
    // dispatcher switch no recognizable numbering.
    let mut ids: FxHashMap<Block, u32> = FxHashMap::default();
    let mut used = FxHashSet::default();
    for &block in &case_blocks {
        let mut id = rng.next_u32();
        while id == 0 || !used.insert(id) {
            id = rng.next_u32();
        }
        ids.insert(block, id);
    }

    // Step A: nothing may live across a block boundary in registers.
    demote_ssa(func);

    // The state slot joins the other demotion slots in the entry block.
    let state_slot = {
        let mut cur = FuncCursor::new(func).at_first_insertion_point(entry);
        cur.ins().alloca(Type::I32, 1)
    };

    let dispatcher = func.dfg.make_block();
    func.layout.insert_block_after(dispatcher, entry);
    let dead_end = func.dfg.make_block();
    func.layout.append_block(dead_end);

    // Translate the entry terminator into the initial state assignment and
    // fall into the dispatcher.
    {
        let data = func.dfg[entry_term].clone();
        let mut cur = FuncCursor::new(func).at_inst(entry_term);
        let init = next_state_value(&mut cur, &data, &ids);
        cur.ins().store(init, state_slot);
        cur.remove_inst_and_step_back();
        let mut cur = FuncCursor::new(func).at_bottom(entry);
        cur.ins().jump(dispatcher);
    }

    // The dispatcher reloads the state and fans out; the default arm is a
    // dead end because the slot only ever holds valid ids.
    {
        let mut cur = FuncCursor::new(func).at_bottom(dispatcher);
        let state = cur.ins().load(Type::I32, state_slot);
        let cases: Vec<(i64, Block)> = case_blocks
            .iter()
            .map(|&block| (i64::from(ids[&block]), block))
            .collect();
        cur.ins().switch(state, dead_end, &cases);

        let mut cur = FuncCursor::new(func).at_bottom(dead_end);
        cur.ins().unreachable();
    }

    // Step E: each dispatched block stores its successor's id and loops
    // back. Returns and unreachables stay as they are.
    for &block in &case_blocks {
        let term = func.layout.last_inst(block).expect("block has a terminator");
        let data = func.dfg[term].clone();
        if matches!(
            data,
            InstructionData::Return { .. } | InstructionData::Unreachable
        ) {
            continue;
        }
        let mut cur = FuncCursor::new(func).at_inst(term);
        let next = next_state_value(&mut cur, &data, &ids);
        cur.ins().store(next, state_slot);
        cur.remove_inst_and_step_back();
        let mut cur = FuncCursor::new(func).at_bottom(block);
        cur.ins().jump(dispatcher);
    }

    let swept = sweep_unreachable_blocks(func);
    if swept > 0 {
        trace!("cff: swept {swept} unreachable blocks in {}", func.name);
    }

    debug_assert!(verify_function(func).is_ok(), "cff broke {}", func.name);
    trace!("function {} after flattening: {}", func.name, func);
    FlattenOutcome::Flattened {
        case_blocks: case_blocks.len(),
    }
}

/// Compute, at the cursor position, the state id the given terminator
/// transfers to: a constant for a jump, a select for a conditional branch,
/// and a select cascade folded over the cases for a switch.
fn next_state_value(
    cur: &mut FuncCursor,
    term: &InstructionData,
    ids: &FxHashMap<Block, u32>,
) -> Value {
    let id_const = |cur: &mut FuncCursor, block: Block| {
        let id = i64::from(ids[&block]);
        cur.func.dfg.iconst(Type::I32, id)
    };
    match term {
        InstructionData::Jump { dest } => id_const(cur, *dest),
        InstructionData::Br {
            arg,
            then_dest,
            else_dest,
        } => {
            let then_id = id_const(cur, *then_dest);
            let else_id = id_const(cur, *else_dest);
            cur.ins().select(*arg, then_id, else_id)
        }
        InstructionData::Switch {
            arg,
            default_dest,
            cases,
        } => {
            let mut acc = id_const(cur, *default_dest);
            for &(case, dest) in cases {
                let dest_id = id_const(cur, dest);
                let hit = cur.ins().icmp_imm(IntCC::Equal, *arg, case);
                acc = cur.ins().select(hit, dest_id, acc);
            }
            acc
        }
        _ => unreachable!("validated terminator"),
    }
}

/// Drop blocks no path from the entry can reach. Their instructions are
/// detached from the layout; the blocks disappear from the function body.
fn sweep_unreachable_blocks(func: &mut Function) -> usize {
    let Some(entry) = func.entry_block() else {
        return 0;
    };
    let mut reachable = FxHashSet::default();
    let mut stack = vec![entry];
    while let Some(block) = stack.pop() {
        if !reachable.insert(block) {
            continue;
        }
        if let Some(term) = func.layout.last_inst(block) {
            stack.extend(func.dfg[term].branch_destinations());
        }
    }

    let dead: Vec<Block> = func
        .layout
        .blocks()
        .filter(|b| !reachable.contains(b))
        .collect();
    for &block in &dead {
        let insts: Vec<_> = func.layout.block_insts(block).collect();
        for inst in insts {
            func.layout.remove_inst(inst);
        }
        func.layout.remove_block(block);
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Signature;

    fn abs_function() -> Function {
        let mut func = Function::with_name_signature(
            "abs",
            Signature::new(vec![Type::I32], Some(Type::I32)),
        );
        let block0 = func.dfg.make_block();
        let block_neg = func.dfg.make_block();
        let block_pos = func.dfg.make_block();
        func.layout.append_block(block0);
        func.layout.append_block(block_neg);
        func.layout.append_block(block_pos);
        let arg = func.params[0];

        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        let cond = cur.ins().icmp_imm(IntCC::SignedLessThan, arg, 0);
        cur.ins().br(cond, block_neg, block_pos);

        let mut cur = FuncCursor::new(&mut func).at_bottom(block_neg);
        let zero = cur.func.dfg.iconst(Type::I32, 0);
        let neg = cur.ins().isub(zero, arg);
        cur.ins().ret(Some(neg));

        let mut cur = FuncCursor::new(&mut func).at_bottom(block_pos);
        cur.ins().ret(Some(arg));
        func
    }

    #[test]
    fn flattened_shape() {
        let mut func = abs_function();
        let mut rng = Xorshift32::from_seed(0xC0FFEE);
        let outcome = flatten_function(&mut func, &mut rng);
        assert_eq!(outcome, FlattenOutcome::Flattened { case_blocks: 2 });

        // Entry ends in an unconditional jump to the dispatcher, which
        // switches on a loaded state value.
        let entry = func.entry_block().unwrap();
        let entry_term = func.layout.last_inst(entry).unwrap();
        let InstructionData::Jump { dest: dispatcher } = func.dfg[entry_term] else {
            panic!("entry does not fall into a dispatcher");
        };
        let dispatch_term = func.layout.last_inst(dispatcher).unwrap();
        assert!(matches!(
            func.dfg[dispatch_term],
            InstructionData::Switch { .. }
        ));

        // No phis anywhere; every block ends in return, unreachable, or a
        // jump back to the dispatcher.
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                assert!(!func.dfg.is_phi(inst));
            }
            if block == entry || block == dispatcher {
                continue;
            }
            let term = func.layout.last_inst(block).unwrap();
            match &func.dfg[term] {
                InstructionData::Return { .. } | InstructionData::Unreachable => {}
                InstructionData::Jump { dest } => assert_eq!(*dest, dispatcher),
                other => panic!("unexpected terminator {other:?}"),
            }
        }
    }

    #[test]
    fn single_block_function_skipped() {
        let mut func =
            Function::with_name_signature("id", Signature::new(vec![Type::I32], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let arg = func.params[0];
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        cur.ins().ret(Some(arg));

        let mut rng = Xorshift32::from_seed(1);
        assert_eq!(flatten_function(&mut func, &mut rng), FlattenOutcome::Skipped);
    }

    #[test]
    fn indirect_jump_skipped() {
        let mut func = Function::with_name_signature("ij", Signature::new(vec![Type::Ptr], None));
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        func.layout.append_block(block0);
        func.layout.append_block(block1);
        let arg = func.params[0];
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        cur.ins().jump(block1);
        let mut cur = FuncCursor::new(&mut func).at_bottom(block1);
        cur.ins().indirect_jump(arg, &[block1]);

        let mut rng = Xorshift32::from_seed(1);
        assert_eq!(flatten_function(&mut func, &mut rng), FlattenOutcome::Skipped);
    }
}
