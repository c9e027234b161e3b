//! Intermediate representation of a function.
//!
//! The `Function` struct defined in this module owns all of its basic
//! blocks, instructions and values.

use core::fmt;

use crate::ir::{Block, DataFlowGraph, Inst, Layout, Type, Value};
use crate::write::write_function;

/// Function parameter and return types.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Signature {
    /// Parameter types, in order.
    pub params: Vec<Type>,
    /// Return type, or `None` for a void function.
    pub ret: Option<Type>,
}

impl Signature {
    /// Create a signature from parts.
    pub fn new(params: Vec<Type>, ret: Option<Type>) -> Self {
        Self { params, ret }
    }
}

/// Linkage of a function or global variable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Linkage {
    /// Defined outside this module; only a declaration here.
    Import,
    /// Defined here, not visible outside the module.
    Local,
    /// Defined here and visible outside the module.
    Export,
}

/// A function.
///
/// Functions can be cloned, but it is not a very fast operation. The clone
/// will have all the same entity numbers as the original.
#[derive(Clone)]
pub struct Function {
    /// Name of this function, as the front end spelled it.
    pub name: String,

    /// Signature of this function.
    pub signature: Signature,

    /// Linkage of this function.
    pub linkage: Linkage,

    /// Parameter values, one per signature parameter.
    pub params: Vec<Value>,

    /// Data flow graph containing the primary definition of all
    /// instructions, blocks and values.
    pub dfg: DataFlowGraph,

    /// Layout of blocks and instructions in the function body.
    pub layout: Layout,
}

impl Function {
    /// Create a function with the given name and signature. Parameter
    /// values are created immediately; the body starts empty, so the result
    /// is a declaration until blocks are laid out.
    pub fn with_name_signature(name: impl Into<String>, signature: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let params = signature
            .params
            .iter()
            .enumerate()
            .map(|(num, &ty)| dfg.make_param(ty, num as u16))
            .collect();
        Self {
            name: name.into(),
            signature,
            linkage: Linkage::Export,
            params,
            dfg,
            layout: Layout::new(),
        }
    }

    /// A declaration has no body.
    pub fn is_declaration(&self) -> bool {
        self.layout.entry_block().is_none()
    }

    /// Compiler intrinsics are never transformed. The front end names them
    /// with the reserved `llvm.` prefix.
    pub fn is_intrinsic(&self) -> bool {
        self.name.starts_with("llvm.")
    }

    /// The entry block, if the function has a body.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.entry_block()
    }

    /// The first instruction of `block` that is not a phi. New non-phi
    /// instructions belong at or after this point.
    pub fn first_insertion_point(&self, block: Block) -> Option<Inst> {
        self.layout
            .block_insts(block)
            .find(|&inst| !self.dfg.is_phi(inst))
    }

    /// The phi instructions forming the leading cluster of `block`.
    pub fn block_phis(&self, block: Block) -> Vec<Inst> {
        self.layout
            .block_insts(block)
            .take_while(|&inst| self.dfg.is_phi(inst))
            .collect()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_function(f, self)
    }
}
