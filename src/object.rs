// File: src/object.rs
//
// Heap object variants for the Lox VM: interned strings, compiled
// functions, closures, upvalues and native-function wrappers.
// Lifetime is managed through `Rc` rather than an intrusive linked
// list freed at shutdown (see DESIGN.md, "Object lifetime").

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::value::Value;

/// A single mutable value slot, shared by `Rc` between the VM's value
/// stack and any `Upvalue` that captures it. Mirrors the teacher's own
/// `Arc<Mutex<Value>>` captured-variable cell (`src/vm.rs`'s `Upvalue`),
/// swapped for single-threaded `Rc<RefCell<_>>`.
pub type Cell = Rc<RefCell<Value>>;

pub fn new_cell(value: Value) -> Cell {
    Rc::new(RefCell::new(value))
}

/// An interned, immutable byte string with a precomputed hash.
#[derive(Debug)]
pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

impl PartialEq for LoxString {
    fn eq(&self, other: &Self) -> bool {
        // Strings reaching this point are always interned; content equality
        // and handle equality coincide, but comparing bytes here keeps the
        // type usable outside the intern table too (e.g. `find_string`).
        self.chars == other.chars
    }
}
impl Eq for LoxString {}

/// FNV-1a, 32-bit, matching the spec's string-hashing requirement.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

impl LoxString {
    fn new(chars: String) -> Self {
        let hash = fnv1a_hash(chars.as_bytes());
        Self { chars, hash }
    }
}

/// A compiled function: arity, upvalue count, optional name, and its
/// owned chunk of bytecode.
#[derive(Debug)]
pub struct LoxFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<Rc<LoxString>>,
    pub chunk: RefCell<Chunk>,
}

impl LoxFunction {
    pub fn new(name: Option<Rc<LoxString>>) -> Self {
        Self { arity: 0, upvalue_count: 0, name, chunk: RefCell::new(Chunk::new()) }
    }
}

/// A captured variable. `cell` is cloned (by `Rc`) straight from the
/// value-stack slot it closes over at `OP_CLOSURE` time, so the capture
/// stays valid once the defining call frame's stack slots are reclaimed:
/// the slot's storage lives as long as any `Upvalue` still references it,
/// independent of the VM's `Vec` of slots. See DESIGN.md "Upvalue closing".
#[derive(Debug)]
pub struct Upvalue {
    pub cell: Cell,
}

/// A function paired with its resolved upvalue array.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<LoxFunction>,
    pub upvalues: Vec<Rc<Upvalue>>,
}

/// A native (Rust-implemented) function: takes the argument slice and
/// returns either a value or a runtime error message.
pub struct NativeFn {
    pub name: Rc<LoxString>,
    pub arity: Option<u8>,
    pub function: Box<dyn Fn(&[Value]) -> Result<Value, String>>,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name.chars).finish()
    }
}

/// The heap object sum type. Identity is the `Rc` pointer; interning
/// guarantees that two strings with the same bytes share one `Rc`.
#[derive(Debug)]
pub enum Obj {
    String(Rc<LoxString>),
    Function(Rc<LoxFunction>),
    Native(Rc<NativeFn>),
    Closure(Rc<Closure>),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native",
            Obj::Closure(_) => "closure",
        }
    }

    pub fn as_string(&self) -> Option<&Rc<LoxString>> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Rc<Closure>> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&Rc<NativeFn>> {
        match self {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<LoxFunction>> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// Constructs an un-interned `LoxString` handle. Callers that need
/// canonicalization go through `Table::intern` instead (see `table.rs`).
pub fn make_string(chars: String) -> Rc<LoxString> {
    Rc::new(LoxString::new(chars))
}
