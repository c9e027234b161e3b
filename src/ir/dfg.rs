//! Data flow graph tracking instructions, values and blocks.
//!
//! The `DataFlowGraph` owns the definition of every instruction, block and
//! value in a function. The order of blocks and instructions is tracked
//! separately by the `Layout`.

use core::ops::{Index, IndexMut};

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

use crate::ir::{Block, FuncId, GlobalVar, Inst, InstructionData, Type, Value};

/// Where a value comes from.
#[derive(Clone, PartialEq, Debug)]
pub enum ValueData {
    /// The result of an instruction.
    Inst {
        /// The value's type.
        ty: Type,
        /// The defining instruction.
        inst: Inst,
    },
    /// A function parameter.
    Param {
        /// The value's type.
        ty: Type,
        /// Parameter position.
        num: u16,
    },
    /// An integer immediate. First-class, so a branch predicate can be a
    /// literal constant.
    Const {
        /// The value's type.
        ty: Type,
        /// The bits, sign-extended to 64.
        imm: i64,
    },
    /// The address of a global variable.
    GlobalAddr {
        /// The referenced global.
        gv: GlobalVar,
    },
    /// The address of a function.
    FuncAddr {
        /// The referenced function.
        func: FuncId,
    },
}

/// Basic block bookkeeping. Blocks carry no parameters in this IR (merges
/// are phi instructions), so there is nothing here but the table slot.
#[derive(Clone, Default)]
pub struct BlockData {}

/// A data flow graph defines all instructions, blocks and values in a
/// function as well as the data dependencies between them.
#[derive(Clone)]
pub struct DataFlowGraph {
    /// Data about all of the instructions in the function. Program order is
    /// tracked by `Layout`.
    pub insts: PrimaryMap<Inst, InstructionData>,

    /// The result value of each instruction, if it has one. Kept in sync
    /// with `insts` by `make_inst`.
    results: SecondaryMap<Inst, PackedOption<Value>>,

    /// Basic blocks in the function. Not in program order.
    pub blocks: PrimaryMap<Block, BlockData>,

    /// Primary value table.
    values: PrimaryMap<Value, ValueData>,
}

impl DataFlowGraph {
    /// Create a new empty `DataFlowGraph`.
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            results: SecondaryMap::new(),
            blocks: PrimaryMap::new(),
            values: PrimaryMap::new(),
        }
    }

    /// Total number of instructions created, inserted in the layout or not.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Total number of values created.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Total number of blocks created, inserted in the layout or not.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Create a new basic block.
    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Returns `true` if the given block reference is valid.
    pub fn block_is_valid(&self, block: Block) -> bool {
        self.blocks.is_valid(block)
    }

    /// Returns `true` if the given value reference is valid.
    pub fn value_is_valid(&self, value: Value) -> bool {
        self.values.is_valid(value)
    }

    /// Create an instruction. When `result_ty` is given, a result value of
    /// that type is created alongside it.
    pub fn make_inst(&mut self, data: InstructionData, result_ty: Option<Type>) -> Inst {
        let inst = self.insts.push(data);
        if let Some(ty) = result_ty {
            let value = self.values.push(ValueData::Inst { ty, inst });
            self.results[inst] = value.into();
        }
        inst
    }

    /// The result value of `inst`, if it produces one.
    pub fn inst_result(&self, inst: Inst) -> Option<Value> {
        self.results[inst].expand()
    }

    /// Value operands of `inst`, in a stable order.
    pub fn inst_args(&self, inst: Inst) -> SmallVec<[Value; 4]> {
        self.insts[inst].arguments()
    }

    /// Create a function parameter value.
    pub fn make_param(&mut self, ty: Type, num: u16) -> Value {
        self.values.push(ValueData::Param { ty, num })
    }

    /// Create an integer immediate value.
    pub fn iconst(&mut self, ty: Type, imm: i64) -> Value {
        debug_assert!(ty.is_int());
        self.values.push(ValueData::Const { ty, imm })
    }

    /// Create a global-address value.
    pub fn global_addr(&mut self, gv: GlobalVar) -> Value {
        self.values.push(ValueData::GlobalAddr { gv })
    }

    /// Create a function-address value.
    pub fn func_addr(&mut self, func: FuncId) -> Value {
        self.values.push(ValueData::FuncAddr { func })
    }

    /// Where does `value` come from?
    pub fn value_def(&self, value: Value) -> &ValueData {
        &self.values[value]
    }

    /// The type of `value`. Addresses are pointers.
    pub fn value_type(&self, value: Value) -> Type {
        match self.values[value] {
            ValueData::Inst { ty, .. }
            | ValueData::Param { ty, .. }
            | ValueData::Const { ty, .. } => ty,
            ValueData::GlobalAddr { .. } | ValueData::FuncAddr { .. } => Type::Ptr,
        }
    }

    /// True if `value` is the integer immediate `imm`.
    pub fn is_const_int(&self, value: Value, imm: i64) -> bool {
        matches!(self.values[value], ValueData::Const { imm: i, .. } if i == imm)
    }

    /// True if `value` is the address of `gv`.
    pub fn is_global_addr(&self, value: Value, gv: GlobalVar) -> bool {
        matches!(self.values[value], ValueData::GlobalAddr { gv: g } if g == gv)
    }

    /// True if `inst` is an SSA merge point.
    pub fn is_phi(&self, inst: Inst) -> bool {
        self.insts[inst].is_phi()
    }

    /// Rewrite every use of `old` as a use of `new`, across all
    /// instructions, including phi incoming lists.
    pub fn replace_uses(&mut self, old: Value, new: Value) {
        for (_, data) in self.insts.iter_mut() {
            data.for_each_arg_mut(&mut |v| {
                if *v == old {
                    *v = new;
                }
            });
        }
    }
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Allow immutable access to instructions via indexing.
impl Index<Inst> for DataFlowGraph {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }
}

/// Allow mutable access to instructions via indexing.
impl IndexMut<Inst> for DataFlowGraph {
    fn index_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.insts[inst]
    }
}
