//! Fake code insertion.
//!
//! Splits unconditional edges with a conditional branch on a literal
//! `false`: the never-taken arm leads into a freshly synthesized block of
//! junk ALU arithmetic whose final value is volatile-stored into a
//! per-function sink slot, and which then falls through to the real
//! successor. Semantics are untouched; the junk only exists to be read.
//!
//! The predicate is intentionally a literal constant. A consumer that
//! folds constants will prove the fake blocks dead and may drop them;
//! strengthening the predicate to something opaque-but-not-constant is a
//! design change, not a fix.

use log::{debug, trace};

use crate::cursor::{Cursor, FuncCursor};
use crate::ir::{
    BinaryOp, Block, Function, Inst, InstBuilder, InstructionData, Module, Type, Value,
};
use crate::report::Report;
use crate::rng::Xorshift32;
use crate::safety::SafetyOracle;
use crate::verifier::verify_function;

/// Most edges split per function.
pub const MAX_FAKE_BLOCKS: u32 = 15;

/// Junk instructions per fake block, inclusive bounds.
const JUNK_INSTS: (u32, u32) = (2, 30);

/// The junk instruction repertoire.
const JUNK_OPS: &[BinaryOp] = &[
    BinaryOp::Iadd,
    BinaryOp::Isub,
    BinaryOp::Imul,
    BinaryOp::Bxor,
    BinaryOp::Ishl,
];

/// Run fake code insertion over every eligible function of `module`.
pub fn do_fake_code_insertion(
    module: &mut Module,
    oracle: &SafetyOracle,
    rng: &mut Xorshift32,
    report: &mut Report,
) {
    let ids: Vec<_> = module.functions.keys().collect();
    for id in ids {
        if !oracle.may_insert_fake_code(module, id) {
            continue;
        }
        let inserted = insert_fake_blocks(&mut module.functions[id], rng);
        if inserted > 0 {
            debug!(
                "fci: inserted {inserted} fake blocks into {}",
                module.functions[id].name
            );
        }
        report.inserted_blocks += inserted;
    }
}

/// Insert junk blocks into one function; returns how many were created.
pub fn insert_fake_blocks(func: &mut Function, rng: &mut Xorshift32) -> u32 {
    // An eligible predecessor ends in an unconditional jump whose target
    // does not start with a phi (splitting a phi predecessor would demand
    // phi surgery).
    let mut eligible: Vec<(Block, Inst, Block)> = Vec::new();
    for block in func.layout.blocks() {
        let Some(term) = func.layout.last_inst(block) else {
            continue;
        };
        if let InstructionData::Jump { dest } = func.dfg[term] {
            let leads_with_phi = func
                .layout
                .first_inst(dest)
                .is_some_and(|first| func.dfg.is_phi(first));
            if !leads_with_phi {
                eligible.push((block, term, dest));
            }
        }
    }
    if eligible.is_empty() {
        return 0;
    }

    let budget = rng.range(1, MAX_FAKE_BLOCKS + 1) as usize;
    rng.shuffle(&mut eligible);
    eligible.truncate(budget);

    let sink = sink_slot(func);
    for &(pred, term, succ) in &eligible {
        split_edge(func, pred, term, succ, sink, rng);
    }

    debug_assert!(verify_function(func).is_ok(), "fci broke {}", func.name);
    trace!("function {} after fake code insertion: {}", func.name, func);
    eligible.len() as u32
}

/// The per-function volatile sink the junk values drain into.
fn sink_slot(func: &mut Function) -> Value {
    let entry = func.entry_block().expect("inserting into a declaration");
    let mut cur = FuncCursor::new(func).at_first_insertion_point(entry);
    cur.ins().alloca(Type::I32, 1)
}

fn split_edge(
    func: &mut Function,
    pred: Block,
    term: Inst,
    succ: Block,
    sink: Value,
    rng: &mut Xorshift32,
) {
    let fake = func.dfg.make_block();
    func.layout.insert_block(fake, succ);

    // Junk arithmetic over an operand pool: every result feeds back into
    // the pool along with a fresh random constant, so later instructions
    // chew on earlier ones.
    let mut cur = FuncCursor::new(func).at_bottom(fake);
    let seed = cur.func.dfg.iconst(Type::I32, 42);
    let mut pool: Vec<Value> = vec![seed];
    let mut last = seed;
    for _ in 0..rng.range(JUNK_INSTS.0, JUNK_INSTS.1 + 1) {
        let op = JUNK_OPS[rng.below(JUNK_OPS.len() as u32) as usize];
        let lhs = pool[rng.below(pool.len() as u32) as usize];
        let rhs = pool[rng.below(pool.len() as u32) as usize];
        last = cur.ins().binary(op, lhs, rhs);
        let noise = cur.func.dfg.iconst(Type::I32, i64::from(rng.next_u32() as i32));
        pool.push(last);
        pool.push(noise);
    }
    cur.ins().store_volatile(last, sink);
    cur.ins().jump(succ);

    // The opaque predicate: branch on literal false with the fake block on
    // the taken arm.
    let never = func.dfg.iconst(Type::I1, 0);
    let mut cur = FuncCursor::new(func).at_inst(term);
    cur.remove_inst();
    cur.ins().br(never, fake, succ);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Signature, ValueData};

    fn two_block_function() -> Function {
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![Type::I32], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        let block1 = func.dfg.make_block();
        func.layout.append_block(block0);
        func.layout.append_block(block1);
        let arg = func.params[0];
        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        cur.ins().jump(block1);
        let mut cur = FuncCursor::new(&mut func).at_bottom(block1);
        cur.ins().ret(Some(arg));
        func
    }

    #[test]
    fn splits_edge_behind_literal_false() {
        let mut func = two_block_function();
        let mut rng = Xorshift32::from_seed(21);
        let inserted = insert_fake_blocks(&mut func, &mut rng);
        assert_eq!(inserted, 1);

        let entry = func.entry_block().unwrap();
        let term = func.layout.last_inst(entry).unwrap();
        let InstructionData::Br {
            arg,
            then_dest,
            else_dest,
        } = func.dfg[term].clone()
        else {
            panic!("predecessor terminator is not a conditional branch");
        };
        // The predicate is the literal false, and the fake block sits on
        // the true arm.
        assert!(matches!(
            func.dfg.value_def(arg),
            ValueData::Const { imm: 0, ty: Type::I1 }
        ));
        assert_ne!(then_dest, else_dest);

        // The fake block runs junk into a volatile store, then jumps to
        // the real successor.
        let insts: Vec<_> = func.layout.block_insts(then_dest).collect();
        assert!(insts.len() >= 2 + 2);
        let volatile_store = insts[insts.len() - 2];
        assert!(matches!(
            func.dfg[volatile_store],
            InstructionData::Store { volatile: true, .. }
        ));
        assert!(matches!(
            func.dfg[*insts.last().unwrap()],
            InstructionData::Jump { dest } if dest == else_dest
        ));
    }

    #[test]
    fn phi_led_successors_are_left_alone() {
        let mut func = two_block_function();
        // Give block1 a leading phi; its only edge is then ineligible.
        let block1 = func.layout.blocks().nth(1).unwrap();
        let entry = func.entry_block().unwrap();
        let arg = func.params[0];
        let first = func.layout.first_inst(block1).unwrap();
        let mut cur = FuncCursor::new(&mut func).at_inst(first);
        cur.ins().phi(Type::I32, &[(entry, arg)]);

        let mut rng = Xorshift32::from_seed(3);
        assert_eq!(insert_fake_blocks(&mut func, &mut rng), 0);
    }

    #[test]
    fn respects_budget_cap() {
        // A long jump chain offers more eligible edges than the cap.
        let mut func = Function::with_name_signature("chain", Signature::default());
        let blocks: Vec<Block> = (0..40).map(|_| func.dfg.make_block()).collect();
        for &b in &blocks {
            func.layout.append_block(b);
        }
        for pair in blocks.windows(2) {
            let mut cur = FuncCursor::new(&mut func).at_bottom(pair[0]);
            cur.ins().jump(pair[1]);
        }
        let mut cur = FuncCursor::new(&mut func).at_bottom(*blocks.last().unwrap());
        cur.ins().ret(None);

        let mut rng = Xorshift32::from_seed(8);
        let inserted = insert_fake_blocks(&mut func, &mut rng);
        assert!(inserted >= 1 && inserted <= MAX_FAKE_BLOCKS);
    }
}
