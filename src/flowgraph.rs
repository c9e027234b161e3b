//! A control flow graph represented as mappings of basic blocks to their
//! predecessors and successors.
//!
//! Successors are represented as basic blocks while predecessors are
//! tuples of a basic block and the branch instruction at its end that
//! transfers control. Each predecessor tuple corresponds to the end of a
//! predecessor block.

use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

use crate::ir::{Block, Function, Inst};

/// A basic block denoted by its enclosing Block and last instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockPredecessor {
    /// Enclosing Block key.
    pub block: Block,
    /// Last instruction in the basic block.
    pub inst: Inst,
}

impl BlockPredecessor {
    /// Convenient method to construct a new BlockPredecessor.
    pub fn new(block: Block, inst: Inst) -> Self {
        Self { block, inst }
    }
}

/// A container for the successors and predecessors of some Block.
#[derive(Clone, Default, PartialEq)]
struct CFGNode {
    /// Instructions that can branch or jump to this block.
    predecessors: SmallVec<[BlockPredecessor; 4]>,
    /// Set of blocks that are the targets of branches and jumps in this
    /// block, ordered by first occurrence and deduplicated.
    successors: SmallVec<[Block; 2]>,
}

/// The Control Flow Graph maintains a mapping of blocks to their
/// predecessors and successors.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CFGNode>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`.
    ///
    /// This will clear and overwrite any information already stored in this
    /// data structure.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        for block in func.layout.blocks() {
            self.compute_block(func, block);
        }
        self.valid = true;
    }

    fn compute_block(&mut self, func: &Function, block: Block) {
        if let Some(term) = func.layout.last_inst(block) {
            for dest in func.dfg[term].branch_destinations() {
                self.add_edge(block, term, dest);
            }
        }
    }

    fn invalidate_block_successors(&mut self, block: Block) {
        let successors = core::mem::take(&mut self.data[block].successors);
        for succ in successors {
            self.data[succ].predecessors.retain(|p| p.block != block);
        }
    }

    /// Recompute the control flow graph of `block`.
    ///
    /// This is for use after modifying instructions within a specific
    /// block. It recomputes all edges from `block` while leaving edges to
    /// `block` intact.
    pub fn recompute_block(&mut self, func: &Function, block: Block) {
        debug_assert!(self.is_valid());
        self.invalidate_block_successors(block);
        self.compute_block(func, block);
    }

    fn add_edge(&mut self, from: Block, from_inst: Inst, to: Block) {
        if !self.data[from].successors.contains(&to) {
            self.data[from].successors.push(to);
        }
        let pred = BlockPredecessor::new(from, from_inst);
        if !self.data[to].predecessors.contains(&pred) {
            self.data[to].predecessors.push(pred);
        }
    }

    /// Get an iterator over the CFG predecessors to `block`.
    pub fn pred_iter(&self, block: Block) -> impl Iterator<Item = BlockPredecessor> + '_ {
        self.data[block].predecessors.iter().copied()
    }

    /// Get an iterator over the CFG successors to `block`.
    pub fn succ_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        debug_assert!(self.is_valid());
        self.data[block].successors.iter().copied()
    }

    /// Number of predecessors of `block`.
    pub fn num_preds(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    /// Check if the CFG is in a valid state.
    ///
    /// Note that this doesn't perform any kind of validity checks. It
    /// simply checks if the `compute()` method has been called since the
    /// last `clear()`. It does not check that the CFG is consistent with
    /// the function.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}
