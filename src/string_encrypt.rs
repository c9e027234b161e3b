//! String encryption.
//!
//! Every constant NUL-terminated string global is replaced by:
//!
//! - a non-constant ciphertext global (decrypted in place on first use),
//! - a global holding the scheme's obfuscated key material,
//! - a private decryption stub that recomputes the key and decrypts the
//!   ciphertext in place,
//! - a set of dispatch functions and a dispatch-pointer global. The
//!   pointer starts at the slow dispatcher, which claims the first call
//!   with a compare-and-exchange (parking the pointer on a busy stub so
//!   the fast path cannot be observed early), runs the decryption stub
//!   exactly once, then publishes the fast dispatcher with a monotonic
//!   store and returns the plaintext address. The fast dispatcher just
//!   returns the address.
//!
//! Every instruction that used the plaintext address is rewritten to load
//! the dispatch pointer and call through it. The original global is erased
//! once no uses remain.
//!
//! Strings read from functions the safety oracle taints (inline asm or
//! setjmp-family, transitively through callers) are left as plaintext.

use log::{debug, trace};

use crate::cipher::{CipherScheme, KEY_LEN};
use crate::cursor::{Cursor, FuncCursor};
use crate::ir::{
    CastKind, FuncId, Function, GlobalVar, GlobalVarData, Inst, InstBuilder, IntCC, Linkage,
    Module, Signature, Type, Value,
};
use crate::report::Report;
use crate::rng::Xorshift32;
use crate::safety::SafetyOracle;
use crate::verifier::verify_function;

/// Run string encryption over every eligible string global of `module`.
pub fn do_string_encryption(
    module: &mut Module,
    oracle: &SafetyOracle,
    rng: &mut Xorshift32,
    report: &mut Report,
) {
    for gv in module.string_globals() {
        let users = module.global_users(gv);
        if users
            .iter()
            .any(|&(func, _)| oracle.is_tainted(func))
        {
            debug!(
                "se: leaving {} in plaintext (tainted reader)",
                module.globals[gv].name
            );
            continue;
        }
        encrypt_string(module, gv, users, rng);
        report.strings_encrypted += 1;
    }
}

fn encrypt_string(
    module: &mut Module,
    gv: GlobalVar,
    users: Vec<(FuncId, Inst)>,
    rng: &mut Xorshift32,
) {
    let name = module.globals[gv].name.clone();
    let plain = match &module.globals[gv].init {
        crate::ir::GlobalInit::Bytes(bytes) => bytes.clone(),
        _ => unreachable!("string globals are byte arrays"),
    };
    let scheme = CipherScheme::random(rng);
    trace!("se: encrypting {name} ({} bytes) with {}", plain.len(), scheme.name());

    // Ciphertext takes the original's linkage and alignment but must be
    // writable: decryption happens in place.
    let cipher_gv = {
        let original = &module.globals[gv];
        let mut data = GlobalVarData::mutable_bytes(format!("{name}.enc"), scheme.encrypt(&plain));
        data.linkage = original.linkage;
        data.align = original.align;
        module.add_global(data)
    };
    let key_gv = module.add_global(GlobalVarData::mutable_bytes(
        format!("{name}.key"),
        scheme.stored_key_material(),
    ));

    let ptr_sig = Signature::new(vec![], Some(Type::Ptr));
    let decode_fn = declare_local(module, format!("{name}.decode"), Signature::default());
    let slow_fn = declare_local(module, format!("{name}.slow"), ptr_sig.clone());
    let busy_fn = declare_local(module, format!("{name}.busy"), ptr_sig.clone());
    let fast_fn = declare_local(module, format!("{name}.fast"), ptr_sig);

    let dispatch_gv = module.add_global(GlobalVarData::func_ptr(
        format!("{name}.dispatch"),
        slow_fn,
    ));

    build_decode_stub(
        &mut module.functions[decode_fn],
        &scheme,
        cipher_gv,
        key_gv,
        plain.len() as i64,
    );
    build_slow_dispatch(
        &mut module.functions[slow_fn],
        dispatch_gv,
        cipher_gv,
        decode_fn,
        slow_fn,
        busy_fn,
        fast_fn,
    );
    build_return_stub(&mut module.functions[busy_fn], cipher_gv);
    build_return_stub(&mut module.functions[fast_fn], cipher_gv);

    debug_assert!(verify_function(&module.functions[decode_fn]).is_ok());
    debug_assert!(verify_function(&module.functions[slow_fn]).is_ok());

    for (func, inst) in users {
        rewrite_user(&mut module.functions[func], inst, gv, dispatch_gv);
    }
    module.erase_global(gv);
}

fn declare_local(module: &mut Module, name: String, sig: Signature) -> FuncId {
    let mut func = Function::with_name_signature(name, sig);
    func.linkage = Linkage::Local;
    module.define_function(func)
}

/// The in-place decryption stub. Keyed schemes first reverse the key
/// obfuscation into a stack buffer, then walk the ciphertext; the s-box
/// scheme substitutes through the embedded inverse permutation.
fn build_decode_stub(
    func: &mut Function,
    scheme: &CipherScheme,
    cipher_gv: GlobalVar,
    key_gv: GlobalVar,
    len: i64,
) {
    match scheme {
        CipherScheme::XorKey { .. } | CipherScheme::AddKey { .. } | CipherScheme::SubConst { .. } => {
            build_keyed_decode(func, scheme, cipher_gv, key_gv, len)
        }
        CipherScheme::SBox { .. } => build_sbox_decode(func, cipher_gv, key_gv, len),
    }
}

fn build_keyed_decode(
    func: &mut Function,
    scheme: &CipherScheme,
    cipher_gv: GlobalVar,
    key_gv: GlobalVar,
    len: i64,
) {
    let entry = func.dfg.make_block();
    let key_head = func.dfg.make_block();
    let key_body = func.dfg.make_block();
    let data_init = func.dfg.make_block();
    let data_head = func.dfg.make_block();
    let data_body = func.dfg.make_block();
    let done = func.dfg.make_block();
    for block in [entry, key_head, key_body, data_init, data_head, data_body, done] {
        func.layout.append_block(block);
    }

    let mut cur = FuncCursor::new(func).at_bottom(entry);
    let counter = cur.ins().alloca(Type::I32, 1);
    let key_buf = cur.ins().alloca(Type::I8, KEY_LEN as u32);
    let zero = cur.func.dfg.iconst(Type::I32, 0);
    cur.ins().store(zero, counter);
    cur.ins().jump(key_head);

    // Recompute the key from its stored form.
    let mut cur = FuncCursor::new(cur.func).at_bottom(key_head);
    let i = cur.ins().load(Type::I32, counter);
    let in_key = cur
        .ins()
        .icmp_imm(IntCC::SignedLessThan, i, KEY_LEN as i64);
    cur.ins().br(in_key, key_body, data_init);

    let mut cur = FuncCursor::new(cur.func).at_bottom(key_body);
    let i = cur.ins().load(Type::I32, counter);
    let key_addr = cur.func.dfg.global_addr(key_gv);
    let stored_ptr = cur.ins().ptr_add(key_addr, i);
    let stored = cur.ins().load(Type::I8, stored_ptr);
    let i8_index = cur.ins().cast(CastKind::Trunc, Type::I8, i);
    let recovered = match scheme {
        CipherScheme::XorKey { .. } => cur.ins().bxor(stored, i8_index),
        CipherScheme::AddKey { .. } => cur.ins().isub(stored, i8_index),
        CipherScheme::SubConst { .. } => {
            let ff = cur.func.dfg.iconst(Type::I8, 0xFF);
            cur.ins().isub(ff, stored)
        }
        CipherScheme::SBox { .. } => unreachable!("keyed schemes only"),
    };
    let slot_ptr = cur.ins().ptr_add(key_buf, i);
    cur.ins().store(recovered, slot_ptr);
    let one = cur.func.dfg.iconst(Type::I32, 1);
    let next = cur.ins().iadd(i, one);
    cur.ins().store(next, counter);
    cur.ins().jump(key_head);

    let mut cur = FuncCursor::new(cur.func).at_bottom(data_init);
    let zero = cur.func.dfg.iconst(Type::I32, 0);
    cur.ins().store(zero, counter);
    cur.ins().jump(data_head);

    // Decrypt the ciphertext in place.
    let mut cur = FuncCursor::new(cur.func).at_bottom(data_head);
    let i = cur.ins().load(Type::I32, counter);
    let in_data = cur.ins().icmp_imm(IntCC::SignedLessThan, i, len);
    cur.ins().br(in_data, data_body, done);

    let mut cur = FuncCursor::new(cur.func).at_bottom(data_body);
    let i = cur.ins().load(Type::I32, counter);
    let cipher_addr = cur.func.dfg.global_addr(cipher_gv);
    let byte_ptr = cur.ins().ptr_add(cipher_addr, i);
    let byte = cur.ins().load(Type::I8, byte_ptr);
    let fifteen = cur.func.dfg.iconst(Type::I32, (KEY_LEN - 1) as i64);
    let key_index = cur.ins().band(i, fifteen);
    let key_ptr = cur.ins().ptr_add(key_buf, key_index);
    let key_byte = cur.ins().load(Type::I8, key_ptr);
    let clear = match scheme {
        CipherScheme::XorKey { .. } | CipherScheme::SubConst { .. } => {
            cur.ins().bxor(byte, key_byte)
        }
        CipherScheme::AddKey { .. } => cur.ins().isub(byte, key_byte),
        CipherScheme::SBox { .. } => unreachable!("keyed schemes only"),
    };
    cur.ins().store(clear, byte_ptr);
    let one = cur.func.dfg.iconst(Type::I32, 1);
    let next = cur.ins().iadd(i, one);
    cur.ins().store(next, counter);
    cur.ins().jump(data_head);

    let mut cur = FuncCursor::new(cur.func).at_bottom(done);
    cur.ins().ret(None);
}

fn build_sbox_decode(func: &mut Function, cipher_gv: GlobalVar, inverse_gv: GlobalVar, len: i64) {
    let entry = func.dfg.make_block();
    let head = func.dfg.make_block();
    let body = func.dfg.make_block();
    let done = func.dfg.make_block();
    for block in [entry, head, body, done] {
        func.layout.append_block(block);
    }

    let mut cur = FuncCursor::new(func).at_bottom(entry);
    let counter = cur.ins().alloca(Type::I32, 1);
    let zero = cur.func.dfg.iconst(Type::I32, 0);
    cur.ins().store(zero, counter);
    cur.ins().jump(head);

    let mut cur = FuncCursor::new(cur.func).at_bottom(head);
    let i = cur.ins().load(Type::I32, counter);
    let in_data = cur.ins().icmp_imm(IntCC::SignedLessThan, i, len);
    cur.ins().br(in_data, body, done);

    let mut cur = FuncCursor::new(cur.func).at_bottom(body);
    let i = cur.ins().load(Type::I32, counter);
    let cipher_addr = cur.func.dfg.global_addr(cipher_gv);
    let byte_ptr = cur.ins().ptr_add(cipher_addr, i);
    let byte = cur.ins().load(Type::I8, byte_ptr);
    let index = cur.ins().cast(CastKind::Zext, Type::I32, byte);
    let inverse_addr = cur.func.dfg.global_addr(inverse_gv);
    let slot = cur.ins().ptr_add(inverse_addr, index);
    let clear = cur.ins().load(Type::I8, slot);
    cur.ins().store(clear, byte_ptr);
    let one = cur.func.dfg.iconst(Type::I32, 1);
    let next = cur.ins().iadd(i, one);
    cur.ins().store(next, counter);
    cur.ins().jump(head);

    let mut cur = FuncCursor::new(cur.func).at_bottom(done);
    cur.ins().ret(None);
}

/// The slow dispatcher: claim the first call by swinging the dispatch
/// pointer from the slow stub to the busy stub with a compare-and-exchange,
/// decrypt exactly once on a successful claim, and only then publish the
/// fast dispatcher with a monotonic store. The claim must not install the
/// fast stub itself: a caller arriving between the claim and the end of
/// decryption would otherwise be routed past the decrypting winner to
/// ciphertext. Losing racers fall straight through to the return.
fn build_slow_dispatch(
    func: &mut Function,
    dispatch_gv: GlobalVar,
    cipher_gv: GlobalVar,
    decode_fn: FuncId,
    slow_fn: FuncId,
    busy_fn: FuncId,
    fast_fn: FuncId,
) {
    let entry = func.dfg.make_block();
    let decrypt = func.dfg.make_block();
    let out = func.dfg.make_block();
    for block in [entry, decrypt, out] {
        func.layout.append_block(block);
    }

    let mut cur = FuncCursor::new(func).at_bottom(entry);
    let dispatch_addr = cur.func.dfg.global_addr(dispatch_gv);
    let slow_addr = cur.func.dfg.func_addr(slow_fn);
    let busy_addr = cur.func.dfg.func_addr(busy_fn);
    let prior = cur.ins().cmpxchg(dispatch_addr, slow_addr, busy_addr);
    let won = cur.ins().icmp(IntCC::Equal, prior, slow_addr);
    cur.ins().br(won, decrypt, out);

    let mut cur = FuncCursor::new(cur.func).at_bottom(decrypt);
    cur.ins().call(decode_fn, &[], None);
    let dispatch_addr = cur.func.dfg.global_addr(dispatch_gv);
    let fast_addr = cur.func.dfg.func_addr(fast_fn);
    cur.ins().store_atomic(fast_addr, dispatch_addr);
    cur.ins().jump(out);

    let mut cur = FuncCursor::new(cur.func).at_bottom(out);
    let plain_addr = cur.func.dfg.global_addr(cipher_gv);
    cur.ins().ret(Some(plain_addr));
}

/// A parameterless stub returning the address of the string's bytes. Used
/// twice per string: as the fast dispatcher installed after decryption,
/// and as the busy stand-in the claim parks the dispatch pointer on while
/// the winner decrypts (callers routed through it during that window get
/// the same best-effort pointer a losing racer gets).
fn build_return_stub(func: &mut Function, cipher_gv: GlobalVar) {
    let entry = func.dfg.make_block();
    func.layout.append_block(entry);
    let mut cur = FuncCursor::new(func).at_bottom(entry);
    let plain_addr = cur.func.dfg.global_addr(cipher_gv);
    cur.ins().ret(Some(plain_addr));
}

/// Rewrite one use site: load the dispatch pointer, call through it, and
/// substitute the returned pointer for the plaintext address operand. The
/// result already has pointer type, so no further casts are needed here;
/// a front end with typed pointers would bitcast locally.
fn rewrite_user(func: &mut Function, inst: Inst, gv: GlobalVar, dispatch_gv: GlobalVar) {
    let mut cur = FuncCursor::new(func).at_inst(inst);
    let dispatch_addr = cur.func.dfg.global_addr(dispatch_gv);
    let callee = cur.ins().load(Type::Ptr, dispatch_addr);
    let call = cur.ins().call_indirect(callee, &[], Some(Type::Ptr));
    let plain_ptr = cur.func.dfg.inst_result(call).expect("dispatch returns a pointer");

    let dfg = &mut cur.func.dfg;
    let replaced: Vec<Value> = dfg
        .inst_args(inst)
        .into_iter()
        .filter(|&v| dfg.is_global_addr(v, gv))
        .collect();
    dfg[inst].for_each_arg_mut(&mut |v| {
        if replaced.contains(v) {
            *v = plain_ptr;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::ir::GlobalInit;

    fn module_with_string(text: &[u8]) -> (Module, GlobalVar, FuncId) {
        let mut module = Module::new("t.c", "x86_64-unknown-linux-gnu");
        let mut bytes = text.to_vec();
        bytes.push(0);
        let gv = module.add_global(GlobalVarData::constant_bytes(".str", bytes));
        let puts = module.declare_function(
            "puts",
            Signature::new(vec![Type::Ptr], Some(Type::I32)),
        );

        let mut main =
            Function::with_name_signature("main", Signature::new(vec![], Some(Type::I32)));
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

    #[test]
    fn plaintext_global_is_erased() {
        let (mut module, gv, _main) = module_with_string(b"TEAM_CHAKRAVYUHA");
        let oracle = SafetyOracle::compute(&module);
        let mut rng = Xorshift32::from_seed(11);
        let mut report = Report::default();
        do_string_encryption(&mut module, &oracle, &mut rng, &mut report);

        assert_eq!(report.strings_encrypted, 1);
        assert!(module.global_is_dead(gv));
        // No live global carries the plaintext bytes.
        for (_, data) in module.live_globals() {
            if let GlobalInit::Bytes(bytes) = &data.init {
                assert!(!contains(bytes, b"TEAM_CHAKRAVYUHA"));
            }
        }
    }

    #[test]
    fn second_run_is_idempotent() {
        let (mut module, _gv, _main) = module_with_string(b"hello");
        let oracle = SafetyOracle::compute(&module);
        let mut rng = Xorshift32::from_seed(5);
        let mut report = Report::default();
        do_string_encryption(&mut module, &oracle, &mut rng, &mut report);
        assert_eq!(report.strings_encrypted, 1);

        let oracle = SafetyOracle::compute(&module);
        do_string_encryption(&mut module, &oracle, &mut rng, &mut report);
        assert_eq!(report.strings_encrypted, 1, "ciphertext was re-encrypted");
    }

    #[test]
    fn tainted_reader_keeps_plaintext() {
        let (mut module, gv, main) = module_with_string(b"secret");
        // Give main an inline-asm call; the oracle now taints it.
        let entry = module.functions[main].entry_block().unwrap();
        let first = module.functions[main].layout.first_inst(entry).unwrap();
        let mut cur = FuncCursor::new(&mut module.functions[main]).at_inst(first);
        cur.ins().call_asm(&[]);

        let oracle = SafetyOracle::compute(&module);
        let mut rng = Xorshift32::from_seed(5);
        let mut report = Report::default();
        do_string_encryption(&mut module, &oracle, &mut rng, &mut report);

        assert_eq!(report.strings_encrypted, 0);
        assert!(!module.global_is_dead(gv));
        assert!(module.globals[gv].is_string());
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
