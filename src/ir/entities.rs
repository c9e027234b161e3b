//! IR entity references.
//!
//! Instructions need to reference other entities in the function or module:
//! basic blocks, values, stack slots, globals. These references are not Rust
//! references, both because the ownership rules would make graph edits
//! painful and because 64-bit pointers waste space; they are `u32` newtypes
//! indexing tables in the owning `Function` or `Module`. There is a separate
//! index type per entity so we keep type safety.
//!
//! All reference types implement `Display` matching the textual IR format.

use cranelift_entity::entity_impl;

/// An opaque reference to a basic block in a function.
///
/// While the order is stable, it is arbitrary and does not necessarily
/// resemble the layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an SSA value: an instruction result, a function
/// parameter, or a first-class constant (integer immediate, global address,
/// function address).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a function in a module. Declarations and
/// definitions share the same table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "fn");

/// An opaque reference to a global variable in a module.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalVar(u32);
entity_impl!(GlobalVar, "gv");
