// File: src/native.rs
//
// Native (Rust-implemented) functions exposed to Lox scripts as plain
// global callables, registered the way the teacher's `builtins.rs`
// registers its standard library: one `Table::set` per entry, looked
// up through ordinary `OP_GET_GLOBAL`/`OP_CALL` at runtime.

use std::time::Instant;

use crate::value::Value;
use crate::vm::Vm;

/// Registers every native function into `vm`'s global table. Called
/// once from `Vm::new`.
pub fn define_natives(vm: &mut Vm) {
    let start = Instant::now();
    vm.define_native(
        "clock",
        Some(0),
        Box::new(move |_args| Ok(Value::Number(start.elapsed().as_secs_f64()))),
    );
}
