//! A module: functions plus global variables.

use core::fmt;

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::ir::{FuncId, Function, GlobalVar, Inst, Linkage, Signature};
use crate::write::write_module;

/// Initializer of a global variable.
#[derive(Clone, PartialEq, Debug)]
pub enum GlobalInit {
    /// Raw bytes, e.g. a string literal or ciphertext.
    Bytes(Vec<u8>),
    /// A single function pointer.
    FuncPtr(FuncId),
    /// `n` zero bytes.
    Zeroed(u32),
}

impl GlobalInit {
    /// Size of the initialized storage in bytes. Function pointers are one
    /// machine word.
    pub fn size(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::FuncPtr(_) => 8,
            Self::Zeroed(n) => *n as usize,
        }
    }
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct GlobalVarData {
    /// Symbol name.
    pub name: String,
    /// Initializer.
    pub init: GlobalInit,
    /// Constant globals may not be written at runtime.
    pub constant: bool,
    /// Linkage.
    pub linkage: Linkage,
    /// Alignment in bytes.
    pub align: u8,
    /// Erased globals have been replaced and are no longer emitted. The
    /// entity table is append-only, so erasure is a tombstone.
    dead: bool,
}

impl GlobalVarData {
    /// A constant byte-array global.
    pub fn constant_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            init: GlobalInit::Bytes(bytes),
            constant: true,
            linkage: Linkage::Local,
            align: 1,
            dead: false,
        }
    }

    /// A mutable byte-array global.
    pub fn mutable_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            constant: false,
            ..Self::constant_bytes(name, bytes)
        }
    }

    /// A mutable function-pointer global.
    pub fn func_ptr(name: impl Into<String>, func: FuncId) -> Self {
        Self {
            name: name.into(),
            init: GlobalInit::FuncPtr(func),
            constant: false,
            linkage: Linkage::Local,
            align: 8,
            dead: false,
        }
    }

    /// Is this a constant, NUL-terminated string: an `i8` array with
    /// exactly one NUL, at the end? This mirrors the C-string test front
    /// ends use for string literals.
    pub fn is_string(&self) -> bool {
        if self.dead || !self.constant {
            return false;
        }
        match &self.init {
            GlobalInit::Bytes(bytes) => {
                !bytes.is_empty()
                    && bytes[bytes.len() - 1] == 0
                    && !bytes[..bytes.len() - 1].contains(&0)
            }
            _ => false,
        }
    }
}

/// A module owns a set of functions and a set of global variables. It
/// carries the source file name and the target triple the front end
/// compiled for.
pub struct Module {
    /// Source file name.
    pub name: String,

    /// Target triple string, e.g. `x86_64-unknown-linux-gnu`.
    pub triple: String,

    /// All functions, declarations included.
    pub functions: PrimaryMap<FuncId, Function>,

    /// All global variables, erased tombstones included.
    pub globals: PrimaryMap<GlobalVar, GlobalVarData>,
}

impl Module {
    /// Create an empty module.
    pub fn new(name: impl Into<String>, triple: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triple: triple.into(),
            functions: PrimaryMap::new(),
            globals: PrimaryMap::new(),
        }
    }

    /// Add a function declaration (no body) for an external symbol.
    pub fn declare_function(&mut self, name: impl Into<String>, signature: Signature) -> FuncId {
        let mut func = Function::with_name_signature(name, signature);
        func.linkage = Linkage::Import;
        self.functions.push(func)
    }

    /// Add a function definition.
    pub fn define_function(&mut self, func: Function) -> FuncId {
        self.functions.push(func)
    }

    /// Look up a function by symbol name.
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    /// Add a global variable.
    pub fn add_global(&mut self, data: GlobalVarData) -> GlobalVar {
        self.globals.push(data)
    }

    /// Erase a global variable. The caller must have redirected all uses
    /// first; stale users of an erased global are a module-corruption bug.
    pub fn erase_global(&mut self, gv: GlobalVar) {
        debug_assert!(
            self.global_users(gv).is_empty(),
            "erasing global {} with live users",
            self.globals[gv].name
        );
        self.globals[gv].dead = true;
    }

    /// Has `gv` been erased?
    pub fn global_is_dead(&self, gv: GlobalVar) -> bool {
        self.globals[gv].dead
    }

    /// Iterate over the live (non-erased) globals.
    pub fn live_globals(&self) -> impl Iterator<Item = (GlobalVar, &GlobalVarData)> {
        self.globals.iter().filter(|(_, data)| !data.dead)
    }

    /// The live string globals of this module.
    pub fn string_globals(&self) -> Vec<GlobalVar> {
        self.live_globals()
            .filter(|(_, data)| data.is_string())
            .map(|(gv, _)| gv)
            .collect()
    }

    /// Every instruction whose operands reference the address of `gv`,
    /// paired with its enclosing function. Only instructions inserted in a
    /// layout count as users.
    pub fn global_users(&self, gv: GlobalVar) -> Vec<(FuncId, Inst)> {
        let mut users = Vec::new();
        for (id, func) in self.functions.iter() {
            for block in func.layout.blocks() {
                for inst in func.layout.block_insts(block) {
                    let args: SmallVec<[_; 4]> = func.dfg.inst_args(inst);
                    if args.iter().any(|&v| func.dfg.is_global_addr(v, gv)) {
                        users.push((id, inst));
                    }
                }
            }
        }
        users
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_module(f, self)
    }
}
