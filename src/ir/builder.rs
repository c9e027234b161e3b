//! Instruction builders.
//!
//! A build context for inserting instructions: the `InstBuilder` trait has
//! one method per instruction format, each creating the instruction in the
//! data flow graph and handing it to an inserter. Value-producing formats
//! return the result value; the rest return the instruction itself.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::ir::{
    BinaryOp, Block, Callee, CastKind, DataFlowGraph, FuncId, Inst, InstructionData, IntCC,
    MemOrder, Type, Value,
};

/// Base trait for instruction inserters: a destination for built
/// instructions.
pub trait InstInserterBase<'f>: Sized {
    /// Get an immutable reference to the data flow graph.
    fn data_flow_graph(&self) -> &DataFlowGraph;

    /// Get a mutable reference to the data flow graph.
    fn data_flow_graph_mut(&mut self) -> &mut DataFlowGraph;

    /// Insert a new instruction which belongs to the DFG.
    fn insert_built_inst(self, inst: Inst) -> &'f mut DataFlowGraph;
}

/// Base trait for instruction builders: the `build` method creates and
/// places an instruction; everything else in [`InstBuilder`] is sugar on
/// top of it.
pub trait InstBuilderBase<'f>: Sized {
    /// Get an immutable reference to the data flow graph that will hold the
    /// constructed instructions.
    fn data_flow_graph(&self) -> &DataFlowGraph;

    /// Get a mutable reference to the data flow graph.
    fn data_flow_graph_mut(&mut self) -> &mut DataFlowGraph;

    /// Insert an instruction and return a reference to it, consuming the
    /// builder. When `result_ty` is given, a result value is created.
    fn build(self, data: InstructionData, result_ty: Option<Type>)
        -> (Inst, &'f mut DataFlowGraph);
}

/// Builder that inserts an instruction at the current position of an
/// inserter.
pub struct InsertBuilder<'f, IIB: InstInserterBase<'f>> {
    inserter: IIB,
    _marker: PhantomData<&'f ()>,
}

impl<'f, IIB: InstInserterBase<'f>> InsertBuilder<'f, IIB> {
    /// Create a new builder which inserts instructions at `inserter`'s
    /// current position.
    pub fn new(inserter: IIB) -> Self {
        Self { inserter, _marker: PhantomData }
    }
}

impl<'f, IIB: InstInserterBase<'f>> InstBuilderBase<'f> for InsertBuilder<'f, IIB> {
    fn data_flow_graph(&self) -> &DataFlowGraph {
        self.inserter.data_flow_graph()
    }

    fn data_flow_graph_mut(&mut self) -> &mut DataFlowGraph {
        self.inserter.data_flow_graph_mut()
    }

    fn build(
        mut self,
        data: InstructionData,
        result_ty: Option<Type>,
    ) -> (Inst, &'f mut DataFlowGraph) {
        let inst = self.inserter.data_flow_graph_mut().make_inst(data, result_ty);
        (inst, self.inserter.insert_built_inst(inst))
    }
}

/// One method per instruction format.
///
/// Value-producing formats return the result `Value`; terminators, stores
/// and calls return the `Inst` (call results are fetched from the DFG since
/// a callee may be void).
pub trait InstBuilder<'f>: InstBuilderBase<'f> {
    /// Binary ALU operation; result has the type of the left operand.
    fn binary(self, op: BinaryOp, x: Value, y: Value) -> Value {
        let ty = self.data_flow_graph().value_type(x);
        let (inst, dfg) = self.build(InstructionData::Binary { op, args: [x, y] }, Some(ty));
        dfg.inst_result(inst).unwrap()
    }

    /// Wrapping addition.
    fn iadd(self, x: Value, y: Value) -> Value {
        self.binary(BinaryOp::Iadd, x, y)
    }

    /// Wrapping subtraction.
    fn isub(self, x: Value, y: Value) -> Value {
        self.binary(BinaryOp::Isub, x, y)
    }

    /// Bitwise and.
    fn band(self, x: Value, y: Value) -> Value {
        self.binary(BinaryOp::Band, x, y)
    }

    /// Bitwise exclusive or.
    fn bxor(self, x: Value, y: Value) -> Value {
        self.binary(BinaryOp::Bxor, x, y)
    }

    /// Integer comparison; result is `i1`.
    fn icmp(self, cond: IntCC, x: Value, y: Value) -> Value {
        let (inst, dfg) = self.build(InstructionData::Icmp { cond, args: [x, y] }, Some(Type::I1));
        dfg.inst_result(inst).unwrap()
    }

    /// Integer comparison against an immediate.
    fn icmp_imm(mut self, cond: IntCC, x: Value, imm: i64) -> Value {
        let ty = self.data_flow_graph().value_type(x);
        let y = self.data_flow_graph_mut().iconst(ty, imm);
        self.icmp(cond, x, y)
    }

    /// Two-way select; result has the type of the first arm.
    fn select(self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.data_flow_graph().value_type(if_true);
        let (inst, dfg) = self.build(
            InstructionData::Select {
                args: [cond, if_true, if_false],
            },
            Some(ty),
        );
        dfg.inst_result(inst).unwrap()
    }

    /// Value cast to `ty`.
    fn cast(self, kind: CastKind, ty: Type, arg: Value) -> Value {
        let (inst, dfg) = self.build(InstructionData::Cast { kind, arg }, Some(ty));
        dfg.inst_result(inst).unwrap()
    }

    /// Stack slot of `size` elements of `ty`; yields a pointer.
    fn alloca(self, ty: Type, size: u32) -> Value {
        let (inst, dfg) = self.build(InstructionData::Alloca { ty, size }, Some(Type::Ptr));
        dfg.inst_result(inst).unwrap()
    }

    /// Pointer plus byte offset.
    fn ptr_add(self, ptr: Value, offset: Value) -> Value {
        let (inst, dfg) = self.build(
            InstructionData::PtrAdd {
                args: [ptr, offset],
            },
            Some(Type::Ptr),
        );
        dfg.inst_result(inst).unwrap()
    }

    /// Load a `ty`-typed scalar.
    fn load(self, ty: Type, ptr: Value) -> Value {
        let (inst, dfg) = self.build(
            InstructionData::Load {
                ty,
                arg: ptr,
                volatile: false,
            },
            Some(ty),
        );
        dfg.inst_result(inst).unwrap()
    }

    /// Plain store.
    fn store(self, x: Value, ptr: Value) -> Inst {
        self.build(
            InstructionData::Store {
                args: [x, ptr],
                volatile: false,
                ordering: MemOrder::NotAtomic,
            },
            None,
        )
        .0
    }

    /// Volatile store; consumers must not elide it.
    fn store_volatile(self, x: Value, ptr: Value) -> Inst {
        self.build(
            InstructionData::Store {
                args: [x, ptr],
                volatile: true,
                ordering: MemOrder::NotAtomic,
            },
            None,
        )
        .0
    }

    /// Monotonic atomic store.
    fn store_atomic(self, x: Value, ptr: Value) -> Inst {
        self.build(
            InstructionData::Store {
                args: [x, ptr],
                volatile: false,
                ordering: MemOrder::Monotonic,
            },
            None,
        )
        .0
    }

    /// Atomic compare-and-exchange; yields the prior value of the location,
    /// typed like `expected`.
    fn cmpxchg(self, ptr: Value, expected: Value, replacement: Value) -> Value {
        let ty = self.data_flow_graph().value_type(expected);
        let (inst, dfg) = self.build(
            InstructionData::CmpXchg {
                args: [ptr, expected, replacement],
            },
            Some(ty),
        );
        dfg.inst_result(inst).unwrap()
    }

    /// Direct call. `ret` is the callee's return type; fetch the result
    /// value from the DFG when it is `Some`.
    fn call(self, func: FuncId, args: &[Value], ret: Option<Type>) -> Inst {
        self.build(
            InstructionData::Call {
                callee: Callee::Direct(func),
                args: SmallVec::from_slice(args),
            },
            ret,
        )
        .0
    }

    /// Indirect call through a pointer.
    fn call_indirect(self, ptr: Value, args: &[Value], ret: Option<Type>) -> Inst {
        self.build(
            InstructionData::Call {
                callee: Callee::Indirect(ptr),
                args: SmallVec::from_slice(args),
            },
            ret,
        )
        .0
    }

    /// Call whose callee is inline assembly.
    fn call_asm(self, args: &[Value]) -> Inst {
        self.build(
            InstructionData::Call {
                callee: Callee::Asm,
                args: SmallVec::from_slice(args),
            },
            None,
        )
        .0
    }

    /// SSA merge point.
    fn phi(self, ty: Type, pairs: &[(Block, Value)]) -> Value {
        let (inst, dfg) = self.build(
            InstructionData::Phi {
                ty,
                args: pairs.to_vec(),
            },
            Some(ty),
        );
        dfg.inst_result(inst).unwrap()
    }

    /// Unconditional branch.
    fn jump(self, dest: Block) -> Inst {
        self.build(InstructionData::Jump { dest }, None).0
    }

    /// Conditional branch.
    fn br(self, cond: Value, then_dest: Block, else_dest: Block) -> Inst {
        self.build(
            InstructionData::Br {
                arg: cond,
                then_dest,
                else_dest,
            },
            None,
        )
        .0
    }

    /// Multi-way branch.
    fn switch(self, arg: Value, default_dest: Block, cases: &[(i64, Block)]) -> Inst {
        self.build(
            InstructionData::Switch {
                arg,
                default_dest,
                cases: cases.to_vec(),
            },
            None,
        )
        .0
    }

    /// Function return.
    fn ret(self, arg: Option<Value>) -> Inst {
        self.build(InstructionData::Return { arg }, None).0
    }

    /// Unreachable program point.
    fn unreachable(self) -> Inst {
        self.build(InstructionData::Unreachable, None).0
    }

    /// Indirect branch through a computed address.
    fn indirect_jump(self, arg: Value, dests: &[Block]) -> Inst {
        self.build(
            InstructionData::IndirectJump {
                arg,
                dests: dests.to_vec(),
            },
            None,
        )
        .0
    }
}

impl<'f, T: InstBuilderBase<'f>> InstBuilder<'f> for T {}
