//! A reference interpreter for the IR.
//!
//! The passes promise behavioral equivalence; this interpreter is how the
//! test suite checks it. It executes whole modules: byte-addressed global
//! and stack storage, direct and indirect calls (including calls through
//! the dispatch-pointer globals the string pass plants), and a small set
//! of host shims (`puts`, `setjmp`) with captured output. Execution is
//! sequential, so the atomic operations degenerate to their plain
//! counterparts. A fuel counter bounds runaway loops.

use cranelift_entity::EntityRef;
use thiserror::Error;

use crate::fx::FxHashMap;
use crate::ir::{
    BinaryOp, Block, Callee, CastKind, FuncId, GlobalInit, GlobalVar, InstructionData, IntCC,
    Module, Type, Value, ValueData,
};

/// Why execution stopped abnormally.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Trap {
    /// The fuel budget ran out; the program looped too long.
    #[error("out of fuel")]
    OutOfFuel,
    /// A call to an external function the interpreter has no shim for.
    #[error("undefined external function: {0}")]
    UndefinedFunction(String),
    /// A memory access fell outside its storage.
    #[error("memory access out of bounds")]
    MemoryFault,
    /// An `unreachable` terminator was executed.
    #[error("reached unreachable code")]
    Unreachable,
    /// The program used a construct the interpreter does not model.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// A runtime address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    /// Into a global's storage.
    Global {
        /// The global.
        gv: GlobalVar,
        /// Byte offset.
        offset: i64,
    },
    /// Into a stack slot created by an `alloca`.
    Stack {
        /// Owning frame index.
        frame: usize,
        /// Slot index within the frame.
        slot: usize,
        /// Byte offset.
        offset: i64,
    },
    /// A function address.
    Func(FuncId),
}

/// A runtime value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Val {
    /// An integer, kept zero-extended to 64 bits internally.
    Int(i64),
    /// A pointer.
    Ptr(Addr),
}

enum GlobalCell {
    Bytes(Vec<u8>),
    Func(Option<FuncId>),
}

/// The interpreter; owns the mutable runtime image of one module.
pub struct Interpreter<'a> {
    module: &'a Module,
    globals: Vec<GlobalCell>,
    frames: Vec<Vec<Vec<u8>>>,
    /// Output captured from the `puts` shim.
    pub stdout: Vec<u8>,
    fuel: u64,
}

const DEFAULT_FUEL: u64 = 10_000_000;

impl<'a> Interpreter<'a> {
    /// Create an interpreter with the default fuel budget.
    pub fn new(module: &'a Module) -> Self {
        Self::with_fuel(module, DEFAULT_FUEL)
    }

    /// Create an interpreter with an explicit fuel budget.
    pub fn with_fuel(module: &'a Module, fuel: u64) -> Self {
        let globals = module
            .globals
            .iter()
            .map(|(_, data)| match &data.init {
                GlobalInit::Bytes(bytes) => GlobalCell::Bytes(bytes.clone()),
                GlobalInit::FuncPtr(func) => GlobalCell::Func(Some(*func)),
                GlobalInit::Zeroed(n) => GlobalCell::Bytes(vec![0; *n as usize]),
            })
            .collect();
        Self {
            module,
            globals,
            frames: Vec::new(),
            stdout: Vec::new(),
            fuel,
        }
    }

    /// Run the function called `name`.
    pub fn run_by_name(&mut self, name: &str, args: &[Val]) -> Result<Option<Val>, Trap> {
        let id = self
            .module
            .function_by_name(name)
            .ok_or_else(|| Trap::UndefinedFunction(name.to_string()))?;
        self.run(id, args)
    }

    /// Run `func` with `args`. Integer return values come back
    /// sign-extended according to the function's return type.
    pub fn run(&mut self, func: FuncId, args: &[Val]) -> Result<Option<Val>, Trap> {
        let f = &self.module.functions[func];
        if f.is_declaration() {
            return self.host_call(func, args.to_vec());
        }
        let frame = self.frames.len();
        self.frames.push(Vec::new());
        let result = self.exec(func, args);
        self.frames.truncate(frame);
        result
    }

    /// The captured `puts` output as UTF-8.
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn exec(&mut self, id: FuncId, args: &[Val]) -> Result<Option<Val>, Trap> {
        let module = self.module;
        let func = &module.functions[id];
        let frame = self.frames.len() - 1;

        let mut vals: FxHashMap<Value, Val> = FxHashMap::default();
        for (param, arg) in func.params.iter().zip(args) {
            let canonical = match *arg {
                Val::Int(v) => Val::Int(mask(func.dfg.value_type(*param), v)),
                ptr => ptr,
            };
            vals.insert(*param, canonical);
        }

        let eval = |vals: &FxHashMap<Value, Val>, value: Value| -> Val {
            match *func.dfg.value_def(value) {
                ValueData::Const { ty, imm } => Val::Int(mask(ty, imm)),
                ValueData::GlobalAddr { gv } => Val::Ptr(Addr::Global { gv, offset: 0 }),
                ValueData::FuncAddr { func } => Val::Ptr(Addr::Func(func)),
                ValueData::Inst { .. } | ValueData::Param { .. } => vals
                    .get(&value)
                    .copied()
                    .unwrap_or_else(|| panic!("use of undefined value {value}")),
            }
        };

        let mut block = func
            .entry_block()
            .ok_or_else(|| Trap::UndefinedFunction(func.name.clone()))?;
        let mut prev_block: Option<Block> = None;

        'blocks: loop {
            // Phis read their incoming values as a parallel batch before
            // any of them is written.
            let phis = func.block_phis(block);
            if !phis.is_empty() {
                let pred = prev_block.expect("phi in entry block");
                let mut staged = Vec::with_capacity(phis.len());
                for phi in &phis {
                    let InstructionData::Phi { args, .. } = &func.dfg[*phi] else {
                        unreachable!()
                    };
                    let (_, incoming) = args
                        .iter()
                        .find(|&&(from, _)| from == pred)
                        .expect("phi has an arm for each predecessor");
                    let result = func.dfg.inst_result(*phi).expect("phi has a result");
                    staged.push((result, eval(&vals, *incoming)));
                }
                vals.extend(staged);
            }

            let insts: Vec<_> = func
                .layout
                .block_insts(block)
                .skip(phis.len())
                .collect();
            for inst in insts {
                self.fuel = self.fuel.checked_sub(1).ok_or(Trap::OutOfFuel)?;
                let data = &func.dfg[inst];
                let result_ty = func.dfg.inst_result(inst).map(|v| func.dfg.value_type(v));
                let mut bind = |vals: &mut FxHashMap<Value, Val>, val: Val| {
                    let result = func.dfg.inst_result(inst).expect("binding a result");
                    vals.insert(result, val);
                };
                match data {
                    InstructionData::Binary { op, args } => {
                        let ty = result_ty.expect("binary result");
                        let (Val::Int(a), Val::Int(b)) =
                            (eval(&vals, args[0]), eval(&vals, args[1]))
                        else {
                            return Err(Trap::Unsupported("pointer arithmetic via alu op"));
                        };
                        bind(&mut vals, Val::Int(binary_op(*op, ty, a, b)));
                    }
                    InstructionData::Icmp { cond, args } => {
                        let a = eval(&vals, args[0]);
                        let b = eval(&vals, args[1]);
                        let arg_ty = func.dfg.value_type(args[0]);
                        bind(&mut vals, Val::Int(icmp(*cond, arg_ty, a, b)? as i64));
                    }
                    InstructionData::Select { args } => {
                        let Val::Int(cond) = eval(&vals, args[0]) else {
                            return Err(Trap::Unsupported("pointer select condition"));
                        };
                        let picked = if cond != 0 { args[1] } else { args[2] };
                        let v = eval(&vals, picked);
                        bind(&mut vals, v);
                    }
                    InstructionData::Cast { kind, arg } => {
                        let ty = result_ty.expect("cast result");
                        let v = eval(&vals, *arg);
                        let out = match (kind, v) {
                            (CastKind::Bitcast, v) => v,
                            (CastKind::Zext, Val::Int(v)) | (CastKind::Trunc, Val::Int(v)) => {
                                Val::Int(mask(ty, v))
                            }
                            _ => return Err(Trap::Unsupported("pointer integer cast")),
                        };
                        bind(&mut vals, out);
                    }
                    InstructionData::Alloca { ty, size } => {
                        let bytes = ty.bytes() as usize * *size as usize;
                        self.frames[frame].push(vec![0; bytes]);
                        let slot = self.frames[frame].len() - 1;
                        bind(
                            &mut vals,
                            Val::Ptr(Addr::Stack {
                                frame,
                                slot,
                                offset: 0,
                            }),
                        );
                    }
                    InstructionData::PtrAdd { args } => {
                        let base = eval(&vals, args[0]);
                        let Val::Int(delta) = eval(&vals, args[1]) else {
                            return Err(Trap::Unsupported("pointer-typed offset"));
                        };
                        let delta = sext(func.dfg.value_type(args[1]), delta);
                        let out = match base {
                            Val::Ptr(Addr::Global { gv, offset }) => Val::Ptr(Addr::Global {
                                gv,
                                offset: offset + delta,
                            }),
                            Val::Ptr(Addr::Stack {
                                frame,
                                slot,
                                offset,
                            }) => Val::Ptr(Addr::Stack {
                                frame,
                                slot,
                                offset: offset + delta,
                            }),
                            _ => return Err(Trap::Unsupported("offsetting a function address")),
                        };
                        bind(&mut vals, out);
                    }
                    InstructionData::Load { ty, arg, .. } => {
                        let Val::Ptr(addr) = eval(&vals, *arg) else {
                            return Err(Trap::MemoryFault);
                        };
                        let v = self.load(addr, *ty)?;
                        bind(&mut vals, v);
                    }
                    InstructionData::Store { args, .. } => {
                        let v = eval(&vals, args[0]);
                        let Val::Ptr(addr) = eval(&vals, args[1]) else {
                            return Err(Trap::MemoryFault);
                        };
                        let ty = func.dfg.value_type(args[0]);
                        self.store(addr, ty, v)?;
                    }
                    InstructionData::CmpXchg { args } => {
                        let Val::Ptr(addr) = eval(&vals, args[0]) else {
                            return Err(Trap::MemoryFault);
                        };
                        let expected = eval(&vals, args[1]);
                        let replacement = eval(&vals, args[2]);
                        let ty = func.dfg.value_type(args[1]);
                        let prior = self.load(addr, ty)?;
                        if prior == expected {
                            self.store(addr, ty, replacement)?;
                        }
                        bind(&mut vals, prior);
                    }
                    InstructionData::Call { callee, args } => {
                        let arg_vals: Vec<Val> =
                            args.iter().map(|&a| eval(&vals, a)).collect();
                        let target = match callee {
                            Callee::Direct(func) => *func,
                            Callee::Indirect(ptr) => match eval(&vals, *ptr) {
                                Val::Ptr(Addr::Func(func)) => func,
                                _ => return Err(Trap::MemoryFault),
                            },
                            Callee::Asm => return Err(Trap::Unsupported("inline assembly")),
                        };
                        let returned = self.run(target, &arg_vals)?;
                        if func.dfg.inst_result(inst).is_some() {
                            let v = returned.ok_or(Trap::Unsupported(
                                "void callee used as a value",
                            ))?;
                            let canonical = match v {
                                Val::Int(i) => Val::Int(mask(result_ty.unwrap(), i)),
                                ptr => ptr,
                            };
                            bind(&mut vals, canonical);
                        }
                    }
                    InstructionData::Phi { .. } => {
                        return Err(Trap::Unsupported("phi below the leading cluster"))
                    }
                    InstructionData::Jump { dest } => {
                        prev_block = Some(block);
                        block = *dest;
                        continue 'blocks;
                    }
                    InstructionData::Br {
                        arg,
                        then_dest,
                        else_dest,
                    } => {
                        let Val::Int(cond) = eval(&vals, *arg) else {
                            return Err(Trap::Unsupported("pointer branch condition"));
                        };
                        prev_block = Some(block);
                        block = if cond != 0 { *then_dest } else { *else_dest };
                        continue 'blocks;
                    }
                    InstructionData::Switch {
                        arg,
                        default_dest,
                        cases,
                    } => {
                        let Val::Int(scrutinee) = eval(&vals, *arg) else {
                            return Err(Trap::Unsupported("pointer switch scrutinee"));
                        };
                        let ty = func.dfg.value_type(*arg);
                        let mut dest = *default_dest;
                        for &(case, target) in cases {
                            if mask(ty, case) == scrutinee {
                                dest = target;
                                break;
                            }
                        }
                        prev_block = Some(block);
                        block = dest;
                        continue 'blocks;
                    }
                    InstructionData::Return { arg } => {
                        return Ok(arg.map(|v| match eval(&vals, v) {
                            Val::Int(i) => Val::Int(sext(func.dfg.value_type(v), i)),
                            ptr => ptr,
                        }));
                    }
                    InstructionData::Unreachable => return Err(Trap::Unreachable),
                    InstructionData::IndirectJump { .. } => {
                        return Err(Trap::Unsupported("indirect jump"))
                    }
                }
            }
            // A verified block always ends in a terminator.
            unreachable!("fell off the end of {block}");
        }
    }

    fn host_call(&mut self, id: FuncId, args: Vec<Val>) -> Result<Option<Val>, Trap> {
        let name = self.module.functions[id].name.clone();
        match name.as_str() {
            "puts" => {
                let Some(Val::Ptr(addr)) = args.first() else {
                    return Err(Trap::MemoryFault);
                };
                let text = self.read_c_string(*addr)?;
                self.stdout.extend_from_slice(&text);
                self.stdout.push(b'\n');
                Ok(Some(Val::Int(0)))
            }
            // A setjmp that never longjmps back: first-return semantics.
            "setjmp" | "_setjmp" => Ok(Some(Val::Int(0))),
            "longjmp" => Err(Trap::Unsupported("longjmp")),
            _ => Err(Trap::UndefinedFunction(name)),
        }
    }

    fn read_c_string(&self, start: Addr) -> Result<Vec<u8>, Trap> {
        let mut out = Vec::new();
        let mut addr = start;
        loop {
            let Val::Int(byte) = self.load(addr, Type::I8)? else {
                return Err(Trap::MemoryFault);
            };
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte as u8);
            addr = match addr {
                Addr::Global { gv, offset } => Addr::Global {
                    gv,
                    offset: offset + 1,
                },
                Addr::Stack {
                    frame,
                    slot,
                    offset,
                } => Addr::Stack {
                    frame,
                    slot,
                    offset: offset + 1,
                },
                Addr::Func(_) => return Err(Trap::MemoryFault),
            };
        }
    }

    fn load(&self, addr: Addr, ty: Type) -> Result<Val, Trap> {
        match addr {
            Addr::Func(_) => Err(Trap::MemoryFault),
            Addr::Global { gv, offset } => match &self.globals[gv.index()] {
                GlobalCell::Func(func) => {
                    if ty != Type::Ptr || offset != 0 {
                        return Err(Trap::Unsupported("partial function-pointer load"));
                    }
                    let func = func.ok_or(Trap::MemoryFault)?;
                    Ok(Val::Ptr(Addr::Func(func)))
                }
                GlobalCell::Bytes(bytes) => read_scalar(bytes, offset, ty),
            },
            Addr::Stack {
                frame,
                slot,
                offset,
            } => {
                let bytes = self
                    .frames
                    .get(frame)
                    .and_then(|f| f.get(slot))
                    .ok_or(Trap::MemoryFault)?;
                read_scalar(bytes, offset, ty)
            }
        }
    }

    fn store(&mut self, addr: Addr, ty: Type, value: Val) -> Result<(), Trap> {
        match addr {
            Addr::Func(_) => Err(Trap::MemoryFault),
            Addr::Global { gv, offset } => match &mut self.globals[gv.index()] {
                GlobalCell::Func(cell) => {
                    let Val::Ptr(Addr::Func(func)) = value else {
                        return Err(Trap::Unsupported("non-function store to pointer cell"));
                    };
                    if offset != 0 {
                        return Err(Trap::MemoryFault);
                    }
                    *cell = Some(func);
                    Ok(())
                }
                GlobalCell::Bytes(bytes) => write_scalar(bytes, offset, ty, value),
            },
            Addr::Stack {
                frame,
                slot,
                offset,
            } => {
                let bytes = self
                    .frames
                    .get_mut(frame)
                    .and_then(|f| f.get_mut(slot))
                    .ok_or(Trap::MemoryFault)?;
                write_scalar(bytes, offset, ty, value)
            }
        }
    }

    /// A copy of a global's current bytes, for tests that inspect the
    /// runtime image.
    pub fn global_bytes(&self, gv: GlobalVar) -> Option<&[u8]> {
        match &self.globals[gv.index()] {
            GlobalCell::Bytes(bytes) => Some(bytes),
            GlobalCell::Func(_) => None,
        }
    }
}

fn read_scalar(bytes: &[u8], offset: i64, ty: Type) -> Result<Val, Trap> {
    if ty == Type::Ptr {
        return Err(Trap::Unsupported("pointer load from byte storage"));
    }
    let width = ty.bytes() as usize;
    let start = usize::try_from(offset).map_err(|_| Trap::MemoryFault)?;
    let end = start.checked_add(width).ok_or(Trap::MemoryFault)?;
    if end > bytes.len() {
        return Err(Trap::MemoryFault);
    }
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&bytes[start..end]);
    Ok(Val::Int(mask(ty, i64::from_le_bytes(raw))))
}

fn write_scalar(bytes: &mut [u8], offset: i64, ty: Type, value: Val) -> Result<(), Trap> {
    let Val::Int(v) = value else {
        return Err(Trap::Unsupported("pointer store to byte storage"));
    };
    let width = ty.bytes() as usize;
    let start = usize::try_from(offset).map_err(|_| Trap::MemoryFault)?;
    let end = start.checked_add(width).ok_or(Trap::MemoryFault)?;
    if end > bytes.len() {
        return Err(Trap::MemoryFault);
    }
    bytes[start..end].copy_from_slice(&mask(ty, v).to_le_bytes()[..width]);
    Ok(())
}

/// Zero-extended canonical form of `v` at type `ty`.
fn mask(ty: Type, v: i64) -> i64 {
    match ty.bits() {
        64 => v,
        bits => v & ((1i64 << bits) - 1),
    }
}

/// Sign-extended reading of the canonical form.
fn sext(ty: Type, v: i64) -> i64 {
    match ty.bits() {
        64 => v,
        bits => {
            let m = mask(ty, v);
            if m & (1i64 << (bits - 1)) != 0 {
                m | !((1i64 << bits) - 1)
            } else {
                m
            }
        }
    }
}

fn binary_op(op: BinaryOp, ty: Type, a: i64, b: i64) -> i64 {
    let shift_mask = i64::from(ty.bits().max(2) - 1);
    let out = match op {
        BinaryOp::Iadd => a.wrapping_add(b),
        BinaryOp::Isub => a.wrapping_sub(b),
        BinaryOp::Imul => a.wrapping_mul(b),
        BinaryOp::Band => a & b,
        BinaryOp::Bor => a | b,
        BinaryOp::Bxor => a ^ b,
        BinaryOp::Ishl => a.wrapping_shl((b & shift_mask) as u32),
        BinaryOp::Ushr => ((mask(ty, a) as u64) >> (b & shift_mask) as u32) as i64,
        BinaryOp::Sshr => sext(ty, a) >> (b & shift_mask) as u32,
    };
    mask(ty, out)
}

fn icmp(cond: IntCC, ty: Type, a: Val, b: Val) -> Result<bool, Trap> {
    match (a, b) {
        (Val::Int(a), Val::Int(b)) => Ok(match cond {
            IntCC::Equal => a == b,
            IntCC::NotEqual => a != b,
            IntCC::SignedLessThan => sext(ty, a) < sext(ty, b),
            IntCC::SignedLessThanOrEqual => sext(ty, a) <= sext(ty, b),
            IntCC::SignedGreaterThan => sext(ty, a) > sext(ty, b),
            IntCC::SignedGreaterThanOrEqual => sext(ty, a) >= sext(ty, b),
            IntCC::UnsignedLessThan => (mask(ty, a) as u64) < (mask(ty, b) as u64),
            IntCC::UnsignedGreaterThanOrEqual => (mask(ty, a) as u64) >= (mask(ty, b) as u64),
        }),
        (Val::Ptr(a), Val::Ptr(b)) => match cond {
            IntCC::Equal => Ok(a == b),
            IntCC::NotEqual => Ok(a != b),
            _ => Err(Trap::Unsupported("ordered pointer comparison")),
        },
        _ => Err(Trap::Unsupported("mixed pointer/integer comparison")),
    }
}
