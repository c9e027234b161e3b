//! SSA-to-memory demotion.
//!
//! Rebuilding a CFG breaks dominance, so before the flattener reshuffles
//! blocks every value that crosses a block boundary is demoted to a stack
//! slot: phis become slot stores at each incoming predecessor plus a slot
//! load in each block that used the merged value, and any other
//! instruction result used outside its defining block gets a slot, a store
//! right after the definition, and a load in front of each remote use.
//! Afterwards every non-entry block is self-contained: all the values it
//! consumes are produced by its own instructions, by entry-block allocas,
//! or by function parameters.
//!
//! Demotion must be complete. A phi that survives into the flattened CFG
//! is a miscompile, so nothing here tries to be clever about phis that
//! look redundant.

use log::trace;

use crate::cursor::{Cursor, FuncCursor};
use crate::fx::FxHashMap;
use crate::ir::{Block, Function, Inst, InstBuilder, InstructionData, Type, Value};

/// Demote every cross-block SSA value of `func` into stack slot traffic.
/// After this returns the function contains no phi instructions.
pub fn demote_ssa(func: &mut Function) {
    demote_phis(func);
    demote_escaping_defs(func);
    trace!("function {} after ssa demotion: {}", func.name, func);
}

/// Allocate a slot in the entry block and return its address value.
fn entry_slot(func: &mut Function, ty: Type) -> Value {
    let entry = func.entry_block().expect("demoting a declaration");
    let mut cur = FuncCursor::new(func).at_first_insertion_point(entry);
    cur.ins().alloca(ty, 1)
}

/// Users of `value`, excluding phi instructions, paired with their blocks.
fn non_phi_users(func: &Function, value: Value) -> Vec<(Inst, Block)> {
    let mut users = Vec::new();
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            if func.dfg.is_phi(inst) {
                continue;
            }
            if func.dfg.inst_args(inst).contains(&value) {
                users.push((inst, block));
            }
        }
    }
    users
}

fn demote_phis(func: &mut Function) {
    struct PhiSite {
        inst: Inst,
        result: Value,
        ty: Type,
        incoming: Vec<(Block, Value)>,
    }

    let mut sites = Vec::new();
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            if let InstructionData::Phi { ty, args } = &func.dfg[inst] {
                sites.push(PhiSite {
                    inst,
                    result: func.dfg.inst_result(inst).expect("phi has a result"),
                    ty: *ty,
                    incoming: args.clone(),
                });
            }
        }
    }
    if sites.is_empty() {
        return;
    }
    trace!("demoting {} phis in {}", sites.len(), func.name);

    // One slot per phi; the incoming value is stored at the end of each
    // predecessor, which is exactly where the merged value changes.
    let slots: Vec<Value> = sites.iter().map(|site| entry_slot(func, site.ty)).collect();

    for (site, &slot) in sites.iter().zip(&slots) {
        for &(pred, value) in &site.incoming {
            let term = func
                .layout
                .last_inst(pred)
                .expect("phi predecessor has a terminator");
            let mut cur = FuncCursor::new(func).at_inst(term);
            cur.ins().store(value, slot);
        }
    }

    // Load the merged value once per using block, at the top (below the
    // remaining phi cluster), and rewrite that block's uses. Phi operand
    // lists are left alone: every phi's incoming values were already
    // copied out to predecessor stores above, and the phis themselves are
    // about to go away.
    for (site, &slot) in sites.iter().zip(&slots) {
        let mut loads: FxHashMap<Block, Value> = FxHashMap::default();
        for (user, block) in non_phi_users(func, site.result) {
            let loaded = *loads.entry(block).or_insert_with(|| {
                let mut cur = FuncCursor::new(func).at_first_insertion_point(block);
                cur.ins().load(site.ty, slot)
            });
            func.dfg[user].for_each_arg_mut(&mut |v| {
                if *v == site.result {
                    *v = loaded;
                }
            });
        }
    }

    for site in &sites {
        func.layout.remove_inst(site.inst);
    }
    debug_assert!(
        func.layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b))
            .all(|inst| !func.dfg.is_phi(inst)),
        "phi demotion left a phi behind"
    );
}

fn demote_escaping_defs(func: &mut Function) {
    // Snapshot before edits; the loads and stores inserted below are
    // single-block by construction and never need demotion themselves.
    let snapshot: Vec<(Block, Inst)> = func
        .layout
        .blocks()
        .flat_map(|block| {
            func.layout
                .block_insts(block)
                .map(move |inst| (block, inst))
        })
        .collect();

    for (def_block, inst) in snapshot {
        let Some(result) = func.dfg.inst_result(inst) else {
            continue;
        };
        // Entry-block allocas already dominate every block.
        if matches!(func.dfg[inst], InstructionData::Alloca { .. }) {
            continue;
        }
        let users = non_phi_users(func, result);
        if users.iter().all(|&(_, block)| block == def_block) {
            continue;
        }

        let ty = func.dfg.value_type(result);
        let slot = entry_slot(func, ty);
        let after = func
            .layout
            .next_inst(inst)
            .expect("a value-producing instruction is not a terminator");
        let mut cur = FuncCursor::new(func).at_inst(after);
        cur.ins().store(result, slot);

        for (user, block) in users {
            if block == def_block {
                continue;
            }
            let mut cur = FuncCursor::new(func).at_inst(user);
            let loaded = cur.ins().load(ty, slot);
            cur.func.dfg[user].for_each_arg_mut(&mut |v| {
                if *v == result {
                    *v = loaded;
                }
            });
        }
    }
}
