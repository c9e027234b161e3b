//! Instruction formats.
//!
//! The in-memory representation of an instruction is the closed
//! [`InstructionData`] enum. Operand values are stored inline; the couple of
//! variants with unbounded operand lists (`Phi`, `Switch`, calls) own their
//! storage, which keeps graph edits simple at the cost of a little heap
//! traffic. Result values are tracked by the data flow graph, not here.

use core::fmt;

use smallvec::SmallVec;

use crate::ir::{Block, FuncId, Type, Value};

/// Binary integer ALU operations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    /// Wrapping addition.
    Iadd,
    /// Wrapping subtraction.
    Isub,
    /// Wrapping multiplication.
    Imul,
    /// Bitwise and.
    Band,
    /// Bitwise or.
    Bor,
    /// Bitwise exclusive or.
    Bxor,
    /// Shift left.
    Ishl,
    /// Logical shift right.
    Ushr,
    /// Arithmetic shift right.
    Sshr,
}

impl BinaryOp {
    /// Mnemonic used by the textual format.
    pub fn name(self) -> &'static str {
        match self {
            Self::Iadd => "iadd",
            Self::Isub => "isub",
            Self::Imul => "imul",
            Self::Band => "band",
            Self::Bor => "bor",
            Self::Bxor => "bxor",
            Self::Ishl => "ishl",
            Self::Ushr => "ushr",
            Self::Sshr => "sshr",
        }
    }
}

/// Condition codes for integer comparisons.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntCC {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// Signed `<`
    SignedLessThan,
    /// Signed `<=`
    SignedLessThanOrEqual,
    /// Signed `>`
    SignedGreaterThan,
    /// Signed `>=`
    SignedGreaterThanOrEqual,
    /// Unsigned `<`
    UnsignedLessThan,
    /// Unsigned `>=`
    UnsignedGreaterThanOrEqual,
}

impl IntCC {
    /// Mnemonic used by the textual format.
    pub fn name(self) -> &'static str {
        match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::SignedLessThan => "slt",
            Self::SignedLessThanOrEqual => "sle",
            Self::SignedGreaterThan => "sgt",
            Self::SignedGreaterThanOrEqual => "sge",
            Self::UnsignedLessThan => "ult",
            Self::UnsignedGreaterThanOrEqual => "uge",
        }
    }
}

/// Value cast kinds.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CastKind {
    /// Reinterpret bits (including pointer-to-pointer).
    Bitcast,
    /// Zero extension to a wider integer.
    Zext,
    /// Truncation to a narrower integer.
    Trunc,
}

/// Memory ordering on a store.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum MemOrder {
    /// A plain, non-atomic access.
    NotAtomic,
    /// A monotonic (relaxed) atomic access. This is the only ordering the
    /// string pass needs for dispatch-pointer publication.
    Monotonic,
}

/// The callee of a call instruction.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Callee {
    /// A direct call to a function in this module (possibly a declaration).
    Direct(FuncId),
    /// An indirect call through a pointer value.
    Indirect(Value),
    /// A call whose callee operand is inline assembly. The safety oracle
    /// refuses to transform functions containing one of these.
    Asm,
}

/// Contents of an instruction.
#[derive(Clone, PartialEq, Debug)]
pub enum InstructionData {
    /// Binary integer ALU operation. Both operands and the result share a
    /// type.
    Binary {
        /// The operation.
        op: BinaryOp,
        /// `[lhs, rhs]`.
        args: [Value; 2],
    },
    /// Integer (or pointer) comparison producing an `i1`.
    Icmp {
        /// Condition code.
        cond: IntCC,
        /// `[lhs, rhs]`.
        args: [Value; 2],
    },
    /// Two-way value select: `args[0] ? args[1] : args[2]`.
    Select {
        /// `[cond, if_true, if_false]`.
        args: [Value; 3],
    },
    /// Value cast. The result type lives with the result value.
    Cast {
        /// What kind of cast.
        kind: CastKind,
        /// The operand.
        arg: Value,
    },
    /// Stack slot allocation: `size` elements of `ty`. Yields a pointer.
    Alloca {
        /// Element type.
        ty: Type,
        /// Element count.
        size: u32,
    },
    /// Pointer plus byte offset. Yields a pointer.
    PtrAdd {
        /// `[ptr, offset]`.
        args: [Value; 2],
    },
    /// Memory load of a `ty`-typed scalar.
    Load {
        /// Loaded type.
        ty: Type,
        /// Address operand.
        arg: Value,
        /// Volatile accesses are never elided by consumers.
        volatile: bool,
    },
    /// Memory store of a scalar.
    Store {
        /// `[value, ptr]`.
        args: [Value; 2],
        /// Volatile accesses are never elided by consumers.
        volatile: bool,
        /// Atomicity of the access.
        ordering: MemOrder,
    },
    /// Atomic compare-and-exchange; yields the prior value of the location.
    CmpXchg {
        /// `[ptr, expected, replacement]`.
        args: [Value; 3],
    },
    /// Function call.
    Call {
        /// Who is being called.
        callee: Callee,
        /// Argument values.
        args: SmallVec<[Value; 4]>,
    },
    /// SSA merge point. Must appear in the leading cluster of a block.
    Phi {
        /// The merged type.
        ty: Type,
        /// One `(predecessor, value)` pair per incoming edge.
        args: Vec<(Block, Value)>,
    },
    /// Unconditional branch.
    Jump {
        /// Target block.
        dest: Block,
    },
    /// Conditional branch on an `i1`.
    Br {
        /// Condition.
        arg: Value,
        /// Taken when the condition is true.
        then_dest: Block,
        /// Taken when the condition is false.
        else_dest: Block,
    },
    /// Multi-way branch on an integer.
    Switch {
        /// Scrutinee.
        arg: Value,
        /// Taken when no case matches.
        default_dest: Block,
        /// `(case value, target)` pairs.
        cases: Vec<(i64, Block)>,
    },
    /// Function return.
    Return {
        /// The returned value, if the function returns one.
        arg: Option<Value>,
    },
    /// Marks an unreachable program point.
    Unreachable,
    /// Indirect branch through a computed address. Representative of the
    /// untracked terminators (indirectbr, callbr, invoke): the flattening
    /// pass refuses functions containing one.
    IndirectJump {
        /// Address operand.
        arg: Value,
        /// The set of possible targets.
        dests: Vec<Block>,
    },
}

impl InstructionData {
    /// Mnemonic used by the textual format and log lines.
    pub fn opcode_name(&self) -> &'static str {
        match self {
            Self::Binary { op, .. } => op.name(),
            Self::Icmp { .. } => "icmp",
            Self::Select { .. } => "select",
            Self::Cast { kind, .. } => match kind {
                CastKind::Bitcast => "bitcast",
                CastKind::Zext => "zext",
                CastKind::Trunc => "trunc",
            },
            Self::Alloca { .. } => "alloca",
            Self::PtrAdd { .. } => "ptr_add",
            Self::Load { .. } => "load",
            Self::Store { .. } => "store",
            Self::CmpXchg { .. } => "cmpxchg",
            Self::Call { .. } => "call",
            Self::Phi { .. } => "phi",
            Self::Jump { .. } => "jump",
            Self::Br { .. } => "br",
            Self::Switch { .. } => "switch",
            Self::Return { .. } => "return",
            Self::Unreachable => "unreachable",
            Self::IndirectJump { .. } => "indirect_jump",
        }
    }

    /// True if this instruction must be the last in its block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::Br { .. }
                | Self::Switch { .. }
                | Self::Return { .. }
                | Self::Unreachable
                | Self::IndirectJump { .. }
        )
    }

    /// True for terminators the flattening pass knows how to rewrite or
    /// keep. `IndirectJump` is the odd one out.
    pub fn is_supported_terminator(&self) -> bool {
        self.is_terminator() && !matches!(self, Self::IndirectJump { .. })
    }

    /// True for SSA merge points.
    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    /// Collect every value operand, in a stable order. Phi incoming values
    /// are included; their predecessor blocks are not.
    pub fn arguments(&self) -> SmallVec<[Value; 4]> {
        let mut out = SmallVec::new();
        match self {
            Self::Binary { args, .. } | Self::Icmp { args, .. } | Self::PtrAdd { args } => {
                out.extend_from_slice(args);
            }
            Self::Select { args } => out.extend_from_slice(args),
            Self::Cast { arg, .. } | Self::Load { arg, .. } => out.push(*arg),
            Self::Store { args, .. } => out.extend_from_slice(args),
            Self::CmpXchg { args } => out.extend_from_slice(args),
            Self::Call { callee, args } => {
                if let Callee::Indirect(ptr) = callee {
                    out.push(*ptr);
                }
                out.extend_from_slice(args);
            }
            Self::Phi { args, .. } => out.extend(args.iter().map(|&(_, v)| v)),
            Self::Br { arg, .. } | Self::Switch { arg, .. } | Self::IndirectJump { arg, .. } => {
                out.push(*arg);
            }
            Self::Return { arg } => out.extend(arg.iter().copied()),
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable => {}
        }
        out
    }

    /// Visit every value operand mutably.
    pub fn for_each_arg_mut(&mut self, visit: &mut dyn FnMut(&mut Value)) {
        match self {
            Self::Binary { args, .. } | Self::Icmp { args, .. } | Self::PtrAdd { args } => {
                args.iter_mut().for_each(visit);
            }
            Self::Select { args } => args.iter_mut().for_each(visit),
            Self::Cast { arg, .. } | Self::Load { arg, .. } => visit(arg),
            Self::Store { args, .. } => args.iter_mut().for_each(visit),
            Self::CmpXchg { args } => args.iter_mut().for_each(visit),
            Self::Call { callee, args } => {
                if let Callee::Indirect(ptr) = callee {
                    visit(ptr);
                }
                args.iter_mut().for_each(visit);
            }
            Self::Phi { args, .. } => args.iter_mut().for_each(|(_, v)| visit(v)),
            Self::Br { arg, .. } | Self::Switch { arg, .. } | Self::IndirectJump { arg, .. } => {
                visit(arg)
            }
            Self::Return { arg } => {
                if let Some(v) = arg {
                    visit(v);
                }
            }
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable => {}
        }
    }

    /// Collect the branch destinations of a terminator, in a stable order.
    /// Non-terminators yield an empty list.
    pub fn branch_destinations(&self) -> SmallVec<[Block; 2]> {
        let mut out = SmallVec::new();
        match self {
            Self::Jump { dest } => out.push(*dest),
            Self::Br {
                then_dest,
                else_dest,
                ..
            } => {
                out.push(*then_dest);
                out.push(*else_dest);
            }
            Self::Switch {
                default_dest,
                cases,
                ..
            } => {
                out.push(*default_dest);
                out.extend(cases.iter().map(|&(_, b)| b));
            }
            Self::IndirectJump { dests, .. } => out.extend(dests.iter().copied()),
            _ => {}
        }
        out
    }

    /// Visit every branch destination mutably.
    pub fn branch_destinations_mut(&mut self, visit: &mut dyn FnMut(&mut Block)) {
        match self {
            Self::Jump { dest } => visit(dest),
            Self::Br {
                then_dest,
                else_dest,
                ..
            } => {
                visit(then_dest);
                visit(else_dest);
            }
            Self::Switch {
                default_dest,
                cases,
                ..
            } => {
                visit(default_dest);
                cases.iter_mut().for_each(|(_, b)| visit(b));
            }
            Self::IndirectJump { dests, .. } => dests.iter_mut().for_each(visit),
            _ => {}
        }
    }
}

impl fmt::Display for InstructionData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.opcode_name())
    }
}
