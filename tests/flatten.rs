//! Behavioral tests for control-flow flattening.

mod common;

use chakravyuha::interp::{Interpreter, Val};
use chakravyuha::ir::InstructionData;
use chakravyuha::{Config, Obfuscator, CONTROL_FLOW_FLATTEN_PASS, PreservedAnalyses};

fn seeded(seed: u32) -> Obfuscator {
    Obfuscator::new(Config {
        seed: Some(seed),
        ..Config::default()
    })
}

#[test]
fn abs_is_equivalent_after_flattening() {
    let (mut module, abs) = common::abs_module();
    let mut obfuscator = seeded(0x5EED);
    let preserved = obfuscator
        .run_pass(&mut module, CONTROL_FLOW_FLATTEN_PASS)
        .unwrap();
    assert_eq!(preserved, PreservedAnalyses::None);
    assert_eq!(obfuscator.report.flattened_functions, 1);
    assert_eq!(obfuscator.report.flattened_blocks, 2);

    let mut interp = Interpreter::new(&module);
    assert_eq!(interp.run(abs, &[Val::Int(-5)]), Ok(Some(Val::Int(5))));
    assert_eq!(interp.run(abs, &[Val::Int(0)]), Ok(Some(Val::Int(0))));
    assert_eq!(interp.run(abs, &[Val::Int(9)]), Ok(Some(Val::Int(9))));
}

#[test]
fn flattened_cfg_has_dispatcher_and_no_phis() {
    let (mut module, abs) = common::abs_module();
    let mut obfuscator = seeded(3);
    obfuscator
        .run_pass(&mut module, CONTROL_FLOW_FLATTEN_PASS)
        .unwrap();

    let func = &module.functions[abs];
    let entry = func.entry_block().unwrap();
    let entry_term = func.layout.last_inst(entry).unwrap();
    let InstructionData::Jump { dest: dispatcher } = func.dfg[entry_term] else {
        panic!("entry must fall into the dispatcher");
    };
    assert!(matches!(
        func.dfg[func.layout.last_inst(dispatcher).unwrap()],
        InstructionData::Switch { .. }
    ));

    let mut state_allocas = 0;
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            assert!(!func.dfg.is_phi(inst), "phi survived flattening");
            if matches!(func.dfg[inst], InstructionData::Alloca { .. }) {
                assert_eq!(block, entry, "allocas belong to the entry block");
                state_allocas += 1;
            }
        }
        // Every non-entry, non-dispatcher block either returns, is
        // unreachable, or stores the next state and loops back.
        if block == entry || block == dispatcher {
            continue;
        }
        let term = func.layout.last_inst(block).unwrap();
        match &func.dfg[term] {
            InstructionData::Return { .. } | InstructionData::Unreachable => {}
            InstructionData::Jump { dest } => {
                assert_eq!(*dest, dispatcher);
                let prev = func.layout.prev_inst(term).unwrap();
                assert!(matches!(func.dfg[prev], InstructionData::Store { .. }));
            }
            other => panic!("unexpected terminator {other:?}"),
        }
    }
    assert!(state_allocas >= 1, "missing the state slot");
}

#[test]
fn switch_is_equivalent_after_flattening() {
    let (mut module, pick) = common::switch_module();
    let mut obfuscator = seeded(0xABCD);
    obfuscator
        .run_pass(&mut module, CONTROL_FLOW_FLATTEN_PASS)
        .unwrap();

    let mut interp = Interpreter::new(&module);
    for (arg, expected) in [
        (1, 100),
        (2, 200),
        (3, 300),
        (4, 500),
        (5, 500),
        (9, -1),
        (-7, -1),
    ] {
        assert_eq!(
            interp.run(pick, &[Val::Int(arg)]),
            Ok(Some(Val::Int(expected))),
            "pick({arg})"
        );
    }
}

#[test]
fn flattening_is_stable_across_seeds() {
    for seed in [1u32, 2, 42, 0xFFFF_FFFF] {
        let (mut module, abs) = common::abs_module();
        let mut obfuscator = seeded(seed);
        obfuscator
            .run_pass(&mut module, CONTROL_FLOW_FLATTEN_PASS)
            .unwrap();
        let mut interp = Interpreter::new(&module);
        for arg in [-100, -1, 0, 1, 100, i64::from(i32::MAX)] {
            let expected = (arg as i32).wrapping_abs() as i64;
            assert_eq!(
                interp.run(abs, &[Val::Int(arg)]),
                Ok(Some(Val::Int(expected))),
                "abs({arg}) with seed {seed}"
            );
        }
    }
}

#[test]
fn identity_function_is_left_alone_but_correct() {
    let (mut module, id) = common::identity_module();
    let mut obfuscator = seeded(7);
    let preserved = obfuscator
        .run_pass(&mut module, CONTROL_FLOW_FLATTEN_PASS)
        .unwrap();
    // A single-block function cannot be flattened.
    assert_eq!(preserved, PreservedAnalyses::All);
    assert_eq!(obfuscator.report.skipped_functions, 1);

    let mut interp = Interpreter::new(&module);
    for arg in [-2, 0, 7, i64::from(i32::MAX)] {
        assert_eq!(interp.run(id, &[Val::Int(arg)]), Ok(Some(Val::Int(arg))));
    }
}
