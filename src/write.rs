//! Converting IR to text.
//!
//! The `write` module provides the textual rendering used by `Display`
//! implementations, log lines and tests. The report pass also measures
//! module size as the length of this rendering.

use core::fmt::{self, Write};

use crate::ir::{
    Callee, Function, GlobalInit, InstructionData, Linkage, Module, Value, ValueData,
};

/// Write `func` to `w` as text.
pub fn write_function(w: &mut dyn Write, func: &Function) -> fmt::Result {
    write!(w, "function %{}(", func.name)?;
    for (i, ty) in func.signature.params.iter().enumerate() {
        if i > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{ty}")?;
    }
    write!(w, ")")?;
    if let Some(ret) = func.signature.ret {
        write!(w, " -> {ret}")?;
    }
    if func.is_declaration() {
        return writeln!(w, ";");
    }
    writeln!(w, " {{")?;
    for block in func.layout.blocks() {
        writeln!(w, "{block}:")?;
        for inst in func.layout.block_insts(block) {
            write!(w, "    ")?;
            if let Some(result) = func.dfg.inst_result(inst) {
                write!(w, "{result} = ")?;
            }
            write_instruction(w, func, inst)?;
            writeln!(w)?;
        }
    }
    writeln!(w, "}}")
}

fn write_operand(w: &mut dyn Write, func: &Function, value: Value) -> fmt::Result {
    match *func.dfg.value_def(value) {
        ValueData::Const { imm, .. } => write!(w, "{imm}"),
        ValueData::GlobalAddr { gv } => write!(w, "{gv}"),
        ValueData::FuncAddr { func } => write!(w, "{func}"),
        ValueData::Inst { .. } | ValueData::Param { .. } => write!(w, "{value}"),
    }
}

fn write_operands(w: &mut dyn Write, func: &Function, values: &[Value]) -> fmt::Result {
    for (i, &v) in values.iter().enumerate() {
        if i > 0 {
            write!(w, ", ")?;
        }
        write_operand(w, func, v)?;
    }
    Ok(())
}

fn write_instruction(w: &mut dyn Write, func: &Function, inst: crate::ir::Inst) -> fmt::Result {
    let data = &func.dfg[inst];
    match data {
        InstructionData::Binary { op, args } => {
            write!(w, "{} ", op.name())?;
            write_operands(w, func, args)
        }
        InstructionData::Icmp { cond, args } => {
            write!(w, "icmp {} ", cond.name())?;
            write_operands(w, func, args)
        }
        InstructionData::Select { args } => {
            write!(w, "select ")?;
            write_operands(w, func, args)
        }
        InstructionData::Cast { arg, .. } => {
            let ty = func
                .dfg
                .inst_result(inst)
                .map(|v| func.dfg.value_type(v))
                .expect("cast has a result");
            write!(w, "{}.{ty} ", data.opcode_name())?;
            write_operand(w, func, *arg)
        }
        InstructionData::Alloca { ty, size } => write!(w, "alloca.{ty} {size}"),
        InstructionData::PtrAdd { args } => {
            write!(w, "ptr_add ")?;
            write_operands(w, func, args)
        }
        InstructionData::Load { ty, arg, volatile } => {
            write!(w, "load{}.{ty} ", if *volatile { ".volatile" } else { "" })?;
            write_operand(w, func, *arg)
        }
        InstructionData::Store {
            args,
            volatile,
            ordering,
        } => {
            let suffix = match (volatile, ordering) {
                (true, _) => ".volatile",
                (false, crate::ir::MemOrder::Monotonic) => ".atomic",
                (false, crate::ir::MemOrder::NotAtomic) => "",
            };
            write!(w, "store{suffix} ")?;
            write_operands(w, func, args)
        }
        InstructionData::CmpXchg { args } => {
            write!(w, "cmpxchg ")?;
            write_operands(w, func, args)
        }
        InstructionData::Call { callee, args } => {
            match callee {
                Callee::Direct(func_id) => write!(w, "call {func_id}(")?,
                Callee::Indirect(ptr) => {
                    write!(w, "call_indirect ")?;
                    write_operand(w, func, *ptr)?;
                    write!(w, "(")?;
                }
                Callee::Asm => write!(w, "call_asm(")?,
            }
            write_operands(w, func, args)?;
            write!(w, ")")
        }
        InstructionData::Phi { args, .. } => {
            write!(w, "phi ")?;
            for (i, (block, value)) in args.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "[{block}: ")?;
                write_operand(w, func, *value)?;
                write!(w, "]")?;
            }
            Ok(())
        }
        InstructionData::Jump { dest } => write!(w, "jump {dest}"),
        InstructionData::Br {
            arg,
            then_dest,
            else_dest,
        } => {
            write!(w, "br ")?;
            write_operand(w, func, *arg)?;
            write!(w, ", {then_dest}, {else_dest}")
        }
        InstructionData::Switch {
            arg,
            default_dest,
            cases,
        } => {
            write!(w, "switch ")?;
            write_operand(w, func, *arg)?;
            write!(w, ", {default_dest} [")?;
            for (i, (case, block)) in cases.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{case}: {block}")?;
            }
            write!(w, "]")
        }
        InstructionData::Return { arg } => match arg {
            Some(v) => {
                write!(w, "return ")?;
                write_operand(w, func, *v)
            }
            None => write!(w, "return"),
        },
        InstructionData::Unreachable => write!(w, "unreachable"),
        InstructionData::IndirectJump { arg, dests } => {
            write!(w, "indirect_jump ")?;
            write_operand(w, func, *arg)?;
            write!(w, ", [")?;
            for (i, block) in dests.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{block}")?;
            }
            write!(w, "]")
        }
    }
}

/// Write `module` to `w` as text: header, live globals, then functions.
pub fn write_module(w: &mut dyn Write, module: &Module) -> fmt::Result {
    writeln!(w, "; module \"{}\"", module.name)?;
    writeln!(w, "target triple = \"{}\"", module.triple)?;
    writeln!(w)?;
    for (gv, data) in module.live_globals() {
        let vis = match data.linkage {
            Linkage::Import => "external ",
            Linkage::Local => "private ",
            Linkage::Export => "",
        };
        let kind = if data.constant { "constant" } else { "global" };
        write!(w, "{gv} = {vis}{kind} ")?;
        match &data.init {
            GlobalInit::Bytes(bytes) => {
                write!(w, "[{} x i8] c\"", bytes.len())?;
                for &b in bytes {
                    if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
                        w.write_char(b as char)?;
                    } else {
                        write!(w, "\\{b:02x}")?;
                    }
                }
                write!(w, "\"")?;
            }
            GlobalInit::FuncPtr(func) => write!(w, "ptr {func}")?,
            GlobalInit::Zeroed(n) => write!(w, "[{n} x i8] zeroinitializer")?,
        }
        writeln!(w, ", align {}  ; {}", data.align, data.name)?;
    }
    writeln!(w)?;
    for (_, func) in module.functions.iter() {
        write_function(w, func)?;
        writeln!(w)?;
    }
    Ok(())
}

/// Size of the module's textual rendering, in bytes. The report pass uses
/// this as the IR size metric.
pub fn module_byte_size(module: &Module) -> usize {
    let mut text = String::new();
    write_module(&mut text, module).expect("formatting cannot fail");
    text.len()
}

/// Total bytes of byte-array global data in the module. String literal
/// storage dominates this number in front-end output, so the report calls
/// it string data size.
pub fn string_data_size(module: &Module) -> usize {
    module
        .live_globals()
        .filter_map(|(_, data)| match &data.init {
            GlobalInit::Bytes(bytes) => Some(bytes.len()),
            _ => None,
        })
        .sum()
}

/// Render a whole module to a `String`.
pub fn module_to_string(module: &Module) -> String {
    let mut text = String::new();
    write_module(&mut text, module).expect("formatting cannot fail");
    text
}
