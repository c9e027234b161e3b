//! Representation of IR modules and functions.

pub mod builder;
pub mod dfg;
pub mod entities;
pub mod function;
pub mod instructions;
pub mod layout;
pub mod module;
pub mod types;

pub use crate::ir::builder::{InsertBuilder, InstBuilder, InstBuilderBase, InstInserterBase};
pub use crate::ir::dfg::{BlockData, DataFlowGraph, ValueData};
pub use crate::ir::entities::{Block, FuncId, GlobalVar, Inst, Value};
pub use crate::ir::function::{Function, Linkage, Signature};
pub use crate::ir::instructions::{
    BinaryOp, Callee, CastKind, InstructionData, IntCC, MemOrder,
};
pub use crate::ir::layout::Layout;
pub use crate::ir::module::{GlobalInit, GlobalVarData, Module};
pub use crate::ir::types::Type;
