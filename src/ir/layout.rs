//! Function layout.
//!
//! The order of basic blocks in a function and the order of instructions in
//! a block is determined by the `Layout` data structure defined in this
//! module: doubly linked lists over side tables, so insertion and removal
//! anywhere are O(1) and entity references stay stable across edits.

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::ir::{Block, Inst};

/// The `Layout` struct determines the layout of blocks and instructions in
/// a function. It does not contain definitions of instructions or blocks,
/// but depends on `Inst` and `Block` entity references being defined
/// elsewhere.
///
/// This data structure determines:
///
/// - The order of blocks in the function.
/// - Which block contains a given instruction.
/// - The order of instructions within a block.
///
/// While data dependencies are not recorded, instruction ordering does
/// affect control dependencies, so part of the semantics of the program are
/// determined by the layout.
#[derive(Clone)]
pub struct Layout {
    /// Linked list nodes for the layout order of blocks. Forms a doubly
    /// linked list, terminated in both ends by `None`.
    blocks: SecondaryMap<Block, BlockNode>,

    /// Linked list nodes for the layout order of instructions. Forms a
    /// doubly linked list per block, terminated in both ends by `None`.
    insts: SecondaryMap<Inst, InstNode>,

    /// First block in the layout order, or `None` when no blocks have been
    /// laid out.
    first_block: Option<Block>,

    /// Last block in the layout order.
    last_block: Option<Block>,
}

#[derive(Clone, Default)]
struct BlockNode {
    prev: PackedOption<Block>,
    next: PackedOption<Block>,
    first_inst: PackedOption<Inst>,
    last_inst: PackedOption<Inst>,
    inserted: bool,
}

#[derive(Clone, Default)]
struct InstNode {
    /// The block containing this instruction, or `None` if the instruction
    /// is not yet inserted.
    block: PackedOption<Block>,
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
}

impl Layout {
    /// Create a new empty `Layout`.
    pub fn new() -> Self {
        Self {
            blocks: SecondaryMap::new(),
            insts: SecondaryMap::new(),
            first_block: None,
            last_block: None,
        }
    }
}

/// Methods for laying out blocks.
impl Layout {
    /// Is `block` currently part of the layout?
    pub fn is_block_inserted(&self, block: Block) -> bool {
        self.blocks[block].inserted
    }

    /// Insert `block` as the last block in the layout.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(!self.is_block_inserted(block));
        self.blocks[block].inserted = true;
        self.blocks[block].prev = self.last_block.into();
        self.blocks[block].next = None.into();
        match self.last_block {
            Some(last) => self.blocks[last].next = block.into(),
            None => self.first_block = Some(block),
        }
        self.last_block = Some(block);
    }

    /// Insert `block` in the layout immediately before `before`.
    pub fn insert_block(&mut self, block: Block, before: Block) {
        debug_assert!(!self.is_block_inserted(block));
        debug_assert!(self.is_block_inserted(before));
        let prev = self.blocks[before].prev;
        self.blocks[block].inserted = true;
        self.blocks[block].next = before.into();
        self.blocks[block].prev = prev;
        self.blocks[before].prev = block.into();
        match prev.expand() {
            Some(prev) => self.blocks[prev].next = block.into(),
            None => self.first_block = Some(block),
        }
    }

    /// Insert `block` in the layout immediately after `after`.
    pub fn insert_block_after(&mut self, block: Block, after: Block) {
        debug_assert!(!self.is_block_inserted(block));
        debug_assert!(self.is_block_inserted(after));
        let next = self.blocks[after].next;
        self.blocks[block].inserted = true;
        self.blocks[block].prev = after.into();
        self.blocks[block].next = next;
        self.blocks[after].next = block.into();
        match next.expand() {
            Some(next) => self.blocks[next].prev = block.into(),
            None => self.last_block = Some(block),
        }
    }

    /// Remove `block` from the layout. The block must be empty.
    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(self.is_block_inserted(block));
        debug_assert!(self.first_inst(block).is_none(), "remove_block on non-empty block");
        let prev = self.blocks[block].prev;
        let next = self.blocks[block].next;
        match prev.expand() {
            Some(prev) => self.blocks[prev].next = next,
            None => self.first_block = next.expand(),
        }
        match next.expand() {
            Some(next) => self.blocks[next].prev = prev,
            None => self.last_block = prev.expand(),
        }
        self.blocks[block] = BlockNode::default();
    }

    /// The entry block: first in the layout order.
    pub fn entry_block(&self) -> Option<Block> {
        self.first_block
    }

    /// The last block in the layout order.
    pub fn last_block(&self) -> Option<Block> {
        self.last_block
    }

    /// The block preceding `block` in the layout order.
    pub fn prev_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].prev.expand()
    }

    /// The block following `block` in the layout order.
    pub fn next_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].next.expand()
    }

    /// Iterate over the blocks in layout order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            layout: self,
            next: self.first_block,
        }
    }

    /// Number of blocks currently inserted in the layout.
    pub fn num_inserted_blocks(&self) -> usize {
        self.blocks().count()
    }
}

/// Methods for arranging instructions.
impl Layout {
    /// The block containing `inst`, or `None` if it is not inserted.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts[inst].block.expand()
    }

    /// Is `inst` currently part of the layout?
    pub fn is_inst_inserted(&self, inst: Inst) -> bool {
        self.insts[inst].block.is_some()
    }

    /// Append `inst` to the end of `block`.
    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        debug_assert!(!self.is_inst_inserted(inst));
        debug_assert!(self.is_block_inserted(block));
        let last = self.blocks[block].last_inst;
        self.insts[inst].block = block.into();
        self.insts[inst].prev = last;
        self.insts[inst].next = None.into();
        match last.expand() {
            Some(last) => self.insts[last].next = inst.into(),
            None => self.blocks[block].first_inst = inst.into(),
        }
        self.blocks[block].last_inst = inst.into();
    }

    /// Insert `inst` immediately before `before` in the same block.
    pub fn insert_inst(&mut self, inst: Inst, before: Inst) {
        debug_assert!(!self.is_inst_inserted(inst));
        let block = self
            .inst_block(before)
            .expect("insertion point not inserted");
        let prev = self.insts[before].prev;
        self.insts[inst].block = block.into();
        self.insts[inst].next = before.into();
        self.insts[inst].prev = prev;
        self.insts[before].prev = inst.into();
        match prev.expand() {
            Some(prev) => self.insts[prev].next = inst.into(),
            None => self.blocks[block].first_inst = inst.into(),
        }
    }

    /// Remove `inst` from the layout. Its definition remains in the data
    /// flow graph.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block(inst).expect("removing detached inst");
        let prev = self.insts[inst].prev;
        let next = self.insts[inst].next;
        match prev.expand() {
            Some(prev) => self.insts[prev].next = next,
            None => self.blocks[block].first_inst = next,
        }
        match next.expand() {
            Some(next) => self.insts[next].prev = prev,
            None => self.blocks[block].last_inst = prev,
        }
        self.insts[inst] = InstNode::default();
    }

    /// First instruction of `block`.
    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].first_inst.expand()
    }

    /// Last instruction of `block`. For a well-formed block this is the
    /// terminator.
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].last_inst.expand()
    }

    /// The instruction following `inst` in its block.
    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next.expand()
    }

    /// The instruction preceding `inst` in its block.
    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev.expand()
    }

    /// Iterate over the instructions of `block` in layout order.
    pub fn block_insts(&self, block: Block) -> Insts<'_> {
        Insts {
            layout: self,
            next: self.blocks[block].first_inst.expand(),
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new()
    }
}

/// An iterator over blocks in layout order. See [`Layout::blocks`].
pub struct Blocks<'f> {
    layout: &'f Layout,
    next: Option<Block>,
}

impl Iterator for Blocks<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        self.next = self.layout.next_block(block);
        Some(block)
    }
}

/// An iterator over the instructions of a block in layout order. See
/// [`Layout::block_insts`].
pub struct Insts<'f> {
    layout: &'f Layout,
    next: Option<Inst>,
}

impl Iterator for Insts<'_> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let inst = self.next?;
        self.next = self.layout.next_inst(inst);
        Some(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    fn b(n: usize) -> Block {
        Block::new(n)
    }

    fn i(n: usize) -> Inst {
        Inst::new(n)
    }

    #[test]
    fn block_order() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_block(b(2));
        layout.insert_block(b(1), b(2));
        layout.insert_block_after(b(3), b(2));
        assert_eq!(layout.blocks().collect::<Vec<_>>(), [b(0), b(1), b(2), b(3)]);
        assert_eq!(layout.entry_block(), Some(b(0)));
        assert_eq!(layout.last_block(), Some(b(3)));

        layout.remove_block(b(1));
        assert_eq!(layout.blocks().collect::<Vec<_>>(), [b(0), b(2), b(3)]);
        assert!(!layout.is_block_inserted(b(1)));
    }

    #[test]
    fn inst_order() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_inst(i(0), b(0));
        layout.append_inst(i(2), b(0));
        layout.insert_inst(i(1), i(2));
        assert_eq!(
            layout.block_insts(b(0)).collect::<Vec<_>>(),
            [i(0), i(1), i(2)]
        );
        assert_eq!(layout.first_inst(b(0)), Some(i(0)));
        assert_eq!(layout.last_inst(b(0)), Some(i(2)));
        assert_eq!(layout.inst_block(i(1)), Some(b(0)));

        layout.remove_inst(i(0));
        assert_eq!(layout.block_insts(b(0)).collect::<Vec<_>>(), [i(1), i(2)]);
        assert_eq!(layout.inst_block(i(0)), None);
    }
}
