//! Shared module builders for the integration suites.
#![allow(dead_code)]

use chakravyuha::cursor::{Cursor, FuncCursor};
use chakravyuha::ir::{
    FuncId, Function, GlobalVar, GlobalVarData, InstBuilder, IntCC, Module, Signature, Type,
};

pub const TRIPLE: &str = "x86_64-unknown-linux-gnu";

/// `int id(int x) { return x; }`
pub fn identity_module() -> (Module, FuncId) {
    let mut module = Module::new("identity.c", TRIPLE);
    let mut func =
        Function::with_name_signature("id", Signature::new(vec![Type::I32], Some(Type::I32)));
    let block0 = func.dfg.make_block();
    func.layout.append_block(block0);
    let arg = func.params[0];
    let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
    cur.ins().ret(Some(arg));
    let id = module.define_function(func);
    (module, id)
}

/// `int abs(int x) { return x < 0 ? -x : x; }`
pub fn abs_module() -> (Module, FuncId) {
    let mut module = Module::new("abs.c", TRIPLE);
    let id = module.define_function(abs_function());
    (module, id)
}

pub fn abs_function() -> Function {
    let mut func =
        Function::with_name_signature("abs", Signature::new(vec![Type::I32], Some(Type::I32)));
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

/// A switch returning 100/200/300 for 1/2/3, 500 for 4 (falling through
/// into the 5 arm) and 5, and -1 otherwise.
pub fn switch_module() -> (Module, FuncId) {
    let mut module = Module::new("switch.c", TRIPLE);
    let mut func =
        Function::with_name_signature("pick", Signature::new(vec![Type::I32], Some(Type::I32)));
    let entry = func.dfg.make_block();
    let arm1 = func.dfg.make_block();
    let arm2 = func.dfg.make_block();
    let arm3 = func.dfg.make_block();
    let arm4 = func.dfg.make_block();
    let arm5 = func.dfg.make_block();
    let other = func.dfg.make_block();
    for block in [entry, arm1, arm2, arm3, arm4, arm5, other] {
        func.layout.append_block(block);
    }
    let arg = func.params[0];

    let mut cur = FuncCursor::new(&mut func).at_bottom(entry);
    cur.ins().switch(
        arg,
        other,
        &[(1, arm1), (2, arm2), (3, arm3), (4, arm4), (5, arm5)],
    );

    for (arm, value) in [(arm1, 100), (arm2, 200), (arm3, 300)] {
        let mut cur = FuncCursor::new(&mut func).at_bottom(arm);
        let ret = cur.func.dfg.iconst(Type::I32, value);
        cur.ins().ret(Some(ret));
    }

    let mut cur = FuncCursor::new(&mut func).at_bottom(arm4);
    cur.ins().jump(arm5);

    let mut cur = FuncCursor::new(&mut func).at_bottom(arm5);
    let ret = cur.func.dfg.iconst(Type::I32, 500);
    cur.ins().ret(Some(ret));

    let mut cur = FuncCursor::new(&mut func).at_bottom(other);
    let ret = cur.func.dfg.iconst(Type::I32, -1);
    cur.ins().ret(Some(ret));

    let id = module.define_function(func);
    (module, id)
}

/// A module whose `main` passes a string literal to `puts`.
pub fn string_module(text: &[u8]) -> (Module, GlobalVar, FuncId) {
    let mut module = Module::new("hello.c", TRIPLE);
    let mut bytes = text.to_vec();
    bytes.push(0);
    let gv = module.add_global(GlobalVarData::constant_bytes(".str", bytes));
    let puts = module.declare_function("puts", Signature::new(vec![Type::Ptr], Some(Type::I32)));

    let mut main = Function::with_name_signature("main", Signature::new(vec![], Some(Type::I32)));
    let block0 = main.dfg.make_block();
    main.layout.append_block(block0);
    let mut cur = FuncCursor::new(&mut main).at_bottom(block0);
    let addr = cur.func.dfg.global_addr(gv);
    cur.ins().call(puts, &[addr], Some(Type::I32));
    let zero = cur.func.dfg.iconst(Type::I32, 0);
    cur.ins().ret(Some(zero));
    let main = module.define_function(main);
    (module, gv, main)
}

/// A two-block function containing an inline-asm call, plus a string
/// global only it reads.
pub fn asm_function_with_string(module: &mut Module, text: &[u8]) -> (FuncId, GlobalVar) {
    let mut bytes = text.to_vec();
    bytes.push(0);
    let gv = module.add_global(GlobalVarData::constant_bytes(".str.asm", bytes));
    let puts = match module.function_by_name("puts") {
        Some(id) => id,
        None => module.declare_function("puts", Signature::new(vec![Type::Ptr], Some(Type::I32))),
    };

    let mut func = Function::with_name_signature("asm_user", Signature::new(vec![], None));
    let block0 = func.dfg.make_block();
    let block1 = func.dfg.make_block();
    func.layout.append_block(block0);
    func.layout.append_block(block1);
    let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
    let addr = cur.func.dfg.global_addr(gv);
    cur.ins().call_asm(&[addr]);
    cur.ins().jump(block1);
    let mut cur = FuncCursor::new(&mut func).at_bottom(block1);
    let addr = cur.func.dfg.global_addr(gv);
    cur.ins().call(puts, &[addr], Some(Type::I32));
    cur.ins().ret(None);
    (module.define_function(func), gv)
}

/// A two-block function calling `setjmp`.
pub fn setjmp_function(module: &mut Module) -> FuncId {
    let setjmp = match module.function_by_name("setjmp") {
        Some(id) => id,
        None => module.declare_function("setjmp", Signature::new(vec![Type::Ptr], Some(Type::I32))),
    };

    let mut func =
        Function::with_name_signature("uses_setjmp", Signature::new(vec![], Some(Type::I32)));
    let block0 = func.dfg.make_block();
    let block1 = func.dfg.make_block();
    let block2 = func.dfg.make_block();
    for block in [block0, block1, block2] {
        func.layout.append_block(block);
    }
    let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
    let buf = cur.ins().alloca(Type::I64, 32);
    let call = cur.ins().call(setjmp, &[buf], Some(Type::I32));
    let jumped = cur.func.dfg.inst_result(call).unwrap();
    let is_zero = cur.ins().icmp_imm(IntCC::Equal, jumped, 0);
    cur.ins().br(is_zero, block1, block2);
    let mut cur = FuncCursor::new(&mut func).at_bottom(block1);
    let one = cur.func.dfg.iconst(Type::I32, 1);
    cur.ins().ret(Some(one));
    let mut cur = FuncCursor::new(&mut func).at_bottom(block2);
    let two = cur.func.dfg.iconst(Type::I32, 2);
    cur.ins().ret(Some(two));
    module.define_function(func)
}
