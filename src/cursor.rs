//! Cursor library.
//!
//! This module defines cursor data types that can be used for inserting
//! instructions.

use crate::ir::{self, InsertBuilder, InstInserterBase};

/// The possible positions of a cursor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorPosition {
    /// Cursor is not pointing anywhere. No instructions can be inserted.
    Nowhere,
    /// Cursor is pointing at an existing instruction.
    /// New instructions will be inserted *before* the current instruction.
    At(ir::Inst),
    /// Cursor is before the beginning of a block. No instructions can be
    /// inserted. Calling `next_inst()` will move to the first instruction
    /// in the block.
    Before(ir::Block),
    /// Cursor is pointing after the end of a block.
    /// New instructions will be appended to the block.
    After(ir::Block),
}

/// All cursor types implement the `Cursor` trait which provides common
/// navigation operations.
pub trait Cursor {
    /// Get the current cursor position.
    fn position(&self) -> CursorPosition;

    /// Set the current position.
    fn set_position(&mut self, pos: CursorPosition);

    /// Borrow a reference to the function layout that this cursor is
    /// navigating.
    fn layout(&self) -> &ir::Layout;

    /// Borrow a mutable reference to the function layout that this cursor
    /// is navigating.
    fn layout_mut(&mut self) -> &mut ir::Layout;

    /// Rebuild this cursor positioned at `inst`.
    ///
    /// This is intended to be used as a builder method:
    ///
    /// ```ignore
    /// let mut pos = FuncCursor::new(func).at_inst(inst);
    /// ```
    fn at_inst(mut self, inst: ir::Inst) -> Self
    where
        Self: Sized,
    {
        self.goto_inst(inst);
        self
    }

    /// Rebuild this cursor positioned at the top of `block`.
    fn at_top(mut self, block: ir::Block) -> Self
    where
        Self: Sized,
    {
        self.goto_top(block);
        self
    }

    /// Rebuild this cursor positioned at the bottom of `block`, appending.
    fn at_bottom(mut self, block: ir::Block) -> Self
    where
        Self: Sized,
    {
        self.goto_bottom(block);
        self
    }

    /// Get the block corresponding to the current position.
    fn current_block(&self) -> Option<ir::Block> {
        match self.position() {
            CursorPosition::Nowhere => None,
            CursorPosition::At(inst) => self.layout().inst_block(inst),
            CursorPosition::Before(block) | CursorPosition::After(block) => Some(block),
        }
    }

    /// Get the instruction corresponding to the current position, if any.
    fn current_inst(&self) -> Option<ir::Inst> {
        match self.position() {
            CursorPosition::At(inst) => Some(inst),
            _ => None,
        }
    }

    /// Go to a specific instruction which must be inserted in the layout.
    /// New instructions will be inserted before `inst`.
    fn goto_inst(&mut self, inst: ir::Inst) {
        debug_assert!(self.layout().is_inst_inserted(inst));
        self.set_position(CursorPosition::At(inst));
    }

    /// Go to the top of `block`, before its first instruction.
    fn goto_top(&mut self, block: ir::Block) {
        debug_assert!(self.layout().is_block_inserted(block));
        self.set_position(CursorPosition::Before(block));
    }

    /// Go to the bottom of `block`, after its last instruction. New
    /// instructions will be appended to the block.
    fn goto_bottom(&mut self, block: ir::Block) {
        debug_assert!(self.layout().is_block_inserted(block));
        self.set_position(CursorPosition::After(block));
    }

    /// Move to the next instruction in the same block and return it.
    ///
    /// - If the cursor was positioned before a block, go to its first
    ///   instruction.
    /// - If there are no more instructions in the block, the cursor ends up
    ///   after the block and `None` is returned.
    fn next_inst(&mut self) -> Option<ir::Inst> {
        match self.position() {
            CursorPosition::Nowhere | CursorPosition::After(..) => None,
            CursorPosition::At(inst) => {
                if let Some(next) = self.layout().next_inst(inst) {
                    self.set_position(CursorPosition::At(next));
                    Some(next)
                } else {
                    let block = self
                        .layout()
                        .inst_block(inst)
                        .expect("current instruction removed?");
                    self.set_position(CursorPosition::After(block));
                    None
                }
            }
            CursorPosition::Before(block) => {
                if let Some(first) = self.layout().first_inst(block) {
                    self.set_position(CursorPosition::At(first));
                    Some(first)
                } else {
                    self.set_position(CursorPosition::After(block));
                    None
                }
            }
        }
    }

    /// Move to the previous instruction in the same block and return it.
    ///
    /// - If the cursor was positioned after a block, go to its last
    ///   instruction.
    /// - If there are no more instructions in the block, the cursor ends up
    ///   before the block and `None` is returned.
    fn prev_inst(&mut self) -> Option<ir::Inst> {
        match self.position() {
            CursorPosition::Nowhere | CursorPosition::Before(..) => None,
            CursorPosition::At(inst) => {
                if let Some(prev) = self.layout().prev_inst(inst) {
                    self.set_position(CursorPosition::At(prev));
                    Some(prev)
                } else {
                    let block = self
                        .layout()
                        .inst_block(inst)
                        .expect("current instruction removed?");
                    self.set_position(CursorPosition::Before(block));
                    None
                }
            }
            CursorPosition::After(block) => {
                if let Some(last) = self.layout().last_inst(block) {
                    self.set_position(CursorPosition::At(last));
                    Some(last)
                } else {
                    self.set_position(CursorPosition::Before(block));
                    None
                }
            }
        }
    }

    /// Insert an instruction at the current position. The cursor does not
    /// move, so repeated insertions happen in program order.
    fn insert_inst(&mut self, inst: ir::Inst) {
        match self.position() {
            CursorPosition::Nowhere | CursorPosition::Before(..) => {
                panic!("cannot insert instruction here")
            }
            CursorPosition::At(cur) => self.layout_mut().insert_inst(inst, cur),
            CursorPosition::After(block) => self.layout_mut().append_inst(inst, block),
        }
    }

    /// Remove the instruction under the cursor. The cursor moves to the
    /// next instruction (or after the block).
    fn remove_inst(&mut self) -> ir::Inst {
        let inst = self.current_inst().expect("no instruction to remove");
        self.next_inst();
        self.layout_mut().remove_inst(inst);
        inst
    }

    /// Remove the instruction under the cursor, moving to the previous
    /// instruction (or before the block).
    fn remove_inst_and_step_back(&mut self) -> ir::Inst {
        let inst = self.current_inst().expect("no instruction to remove");
        self.prev_inst();
        self.layout_mut().remove_inst(inst);
        inst
    }
}

/// Function cursor.
///
/// A `FuncCursor` holds a mutable reference to a whole `ir::Function` while
/// keeping a position too. The function can be re-borrowed by accessing the
/// public `cur.func` member directly whenever the cursor methods aren't
/// enough.
pub struct FuncCursor<'f> {
    pos: CursorPosition,
    /// The referenced function.
    pub func: &'f mut ir::Function,
}

impl<'f> FuncCursor<'f> {
    /// Create a new `FuncCursor` pointing nowhere.
    pub fn new(func: &'f mut ir::Function) -> Self {
        Self {
            pos: CursorPosition::Nowhere,
            func,
        }
    }

    /// Rebuild this cursor positioned at the first insertion point of
    /// `block`: before the first non-phi instruction, or appending if the
    /// block is all phis.
    pub fn at_first_insertion_point(mut self, block: ir::Block) -> Self {
        match self.func.first_insertion_point(block) {
            Some(inst) => self.goto_inst(inst),
            None => self.goto_bottom(block),
        }
        self
    }

    /// Get an instruction builder that inserts at the current position.
    pub fn ins(&mut self) -> InsertBuilder<'_, &mut FuncCursor<'f>> {
        InsertBuilder::new(self)
    }
}

impl Cursor for FuncCursor<'_> {
    fn position(&self) -> CursorPosition {
        self.pos
    }

    fn set_position(&mut self, pos: CursorPosition) {
        self.pos = pos;
    }

    fn layout(&self) -> &ir::Layout {
        &self.func.layout
    }

    fn layout_mut(&mut self) -> &mut ir::Layout {
        &mut self.func.layout
    }
}

impl<'c, 'f> InstInserterBase<'c> for &'c mut FuncCursor<'f> {
    fn data_flow_graph(&self) -> &ir::DataFlowGraph {
        &self.func.dfg
    }

    fn data_flow_graph_mut(&mut self) -> &mut ir::DataFlowGraph {
        &mut self.func.dfg
    }

    fn insert_built_inst(self, inst: ir::Inst) -> &'c mut ir::DataFlowGraph {
        self.insert_inst(inst);
        &mut self.func.dfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, InstBuilder, Signature, Type};

    #[test]
    fn insert_and_walk() {
        let mut func =
            Function::with_name_signature("f", Signature::new(vec![Type::I32], Some(Type::I32)));
        let block0 = func.dfg.make_block();
        func.layout.append_block(block0);
        let arg = func.params[0];

        let mut cur = FuncCursor::new(&mut func).at_bottom(block0);
        let one = cur.func.dfg.iconst(Type::I32, 1);
        let sum = cur.ins().iadd(arg, one);
        cur.ins().ret(Some(sum));

        let mut cur = FuncCursor::new(&mut func).at_top(block0);
        let first = cur.next_inst().unwrap();
        assert_eq!(cur.func.dfg.inst_result(first), Some(sum));
        assert!(cur.next_inst().is_some());
        assert!(cur.next_inst().is_none());
        assert_eq!(cur.position(), CursorPosition::After(block0));
    }
}
