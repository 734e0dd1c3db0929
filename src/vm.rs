// File: src/vm.rs
//
// Stack-based virtual machine executing the bytecode the compiler
// emits: one value stack, one call-frame stack, a global-variable
// table and a shared string-intern table (spec §4.6).

use std::rc::Rc;

use crate::chunk::OpCode;
use crate::compiler::compile;
use crate::debug;
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::object::{new_cell, Cell, Closure, LoxFunction, LoxString, NativeFn, Obj, Upvalue};
use crate::table::Table;
use crate::value::Value;

const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0 (the callee itself).
    slot_base: usize,
}

/// Executes one call's worth of bytecode, then yields either `Ok(())` on
/// a clean top-level return or a `RuntimeError` describing the failure
/// and the call stack at the time it was raised.
pub struct Vm {
    frames: Vec<CallFrame>,
    /// Each slot is its own `Rc<RefCell<Value>>` cell rather than a bare
    /// `Value`, so a closure capturing a local (`OP_CLOSURE` cloning the
    /// cell at that slot into an `Upvalue`) keeps the variable alive and
    /// mutation-visible even after the defining call's frame is popped
    /// and its slot range is reused by later calls — see DESIGN.md
    /// "Upvalue closing".
    stack: Vec<Cell>,
    pub(crate) globals: Table,
    strings: Table,
    /// Mirrors the book's `DEBUG_TRACE_EXECUTION` define, but as a
    /// runtime flag instead of a compile-time one.
    pub trace_execution: bool,
    /// Mirrors the book's `DEBUG_PRINT_CODE` define.
    pub print_code: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(FRAMES_MAX * 256),
            globals: Table::new(),
            strings: Table::new(),
            trace_execution: false,
            print_code: false,
        };
        crate::native::define_natives(&mut vm);
        vm
    }

    pub(crate) fn define_native(
        &mut self,
        name: &str,
        arity: Option<u8>,
        function: Box<dyn Fn(&[Value]) -> Result<Value, String>>,
    ) {
        let name_handle = self.strings.intern(name.to_string());
        let native = NativeFn { name: Rc::clone(&name_handle), arity, function };
        self.globals.set(name_handle, Value::Obj(Rc::new(Obj::Native(Rc::new(native)))));
    }

    /// Compiles and runs `source`. Compile errors are accumulated and
    /// returned together; a runtime error aborts execution immediately
    /// with the call-stack trace captured at the failure point, and
    /// resets both stacks so the `Vm` is ready for the next `interpret`
    /// call (spec §4.6/§7).
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.strings).map_err(InterpretError::Compile)?;
        if self.print_code {
            print_chunk_tree(&function);
        }
        let closure = Rc::new(Closure { function, upvalues: Vec::new() });
        self.push(Value::Obj(Rc::new(Obj::Closure(Rc::clone(&closure)))));
        if let Err(err) = self.call(closure, 0) {
            self.reset_stack();
            return Err(InterpretError::Runtime(err));
        }
        match self.run() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.reset_stack();
                Err(InterpretError::Runtime(err))
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
    }

    fn push(&mut self, value: Value) {
        self.stack.push(new_cell(value));
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow").borrow().clone()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance].borrow().clone()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.borrow().read(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let value = frame.closure.function.chunk.borrow().read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        frame.closure.function.chunk.borrow().constants[idx].clone()
    }

    fn read_string_constant(&mut self) -> Rc<LoxString> {
        match self.read_constant() {
            Value::Obj(obj) => match obj.as_ref() {
                Obj::String(s) => Rc::clone(s),
                _ => unreachable!("constant operand was not a string"),
            },
            _ => unreachable!("constant operand was not an object"),
        }
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let chunk = frame.closure.function.chunk.borrow();
            let line = chunk.line_at(frame.ip.saturating_sub(1)) as usize;
            let name = frame.closure.function.name.as_ref().map(|n| n.chars.clone());
            trace.push(TraceFrame { line, name });
        }
        RuntimeError::new(message, trace)
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), RuntimeError> {
        if arg_count as usize != closure.function.arity as usize {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slot_base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        match &callee {
            Value::Obj(obj) => match obj.as_ref() {
                Obj::Closure(closure) => self.call(Rc::clone(closure), arg_count),
                Obj::Native(native) => {
                    if let Some(arity) = native.arity {
                        if arity != arg_count {
                            return Err(self.runtime_error(format!(
                                "Expected {} arguments but got {}.",
                                arity, arg_count
                            )));
                        }
                    }
                    let args_start = self.stack.len() - arg_count as usize;
                    let args: Vec<Value> =
                        self.stack[args_start..].iter().map(|cell| cell.borrow().clone()).collect();
                    let result = (native.function)(&args).map_err(|msg| self.runtime_error(msg))?;
                    self.stack.truncate(args_start - 1);
                    self.push(result);
                    Ok(())
                }
                _ => Err(self.runtime_error("Can only call functions and classes.")),
            },
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn binary_number_op(&mut self, f: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(f(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        if let (Some(a_str), Some(b_str)) = (a.as_string_bytes(), b.as_string_bytes()) {
            let concatenated = format!("{}{}", a_str, b_str);
            self.pop();
            self.pop();
            let handle = self.strings.intern(concatenated);
            self.push(Value::Obj(Rc::new(Obj::String(handle))));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                self.trace();
            }

            let instruction = self.read_byte();
            match OpCode::from_byte(instruction) {
                Some(OpCode::Constant) => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Some(OpCode::Nil) => self.push(Value::Nil),
                Some(OpCode::True) => self.push(Value::Bool(true)),
                Some(OpCode::False) => self.push(Value::Bool(false)),
                Some(OpCode::Pop) => {
                    self.pop();
                }
                Some(OpCode::GetLocal) => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    let value = self.stack[base + slot].borrow().clone();
                    self.push(value);
                }
                Some(OpCode::SetLocal) => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    let value = self.peek(0);
                    *self.stack[base + slot].borrow_mut() = value;
                }
                Some(OpCode::GetGlobal) => {
                    let name = self.read_string_constant();
                    match self.globals.get(&name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!("Undefined variable '{}'.", name.chars)))
                        }
                    }
                }
                Some(OpCode::DefineGlobal) => {
                    let name = self.read_string_constant();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                Some(OpCode::SetGlobal) => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    // A set-before-declared global both inserts and reports
                    // "new"; delete the stray entry before raising so the
                    // variable reads back as undefined (spec §9 "SET_GLOBAL
                    // zombie entry").
                    if self.globals.set(Rc::clone(&name), value) {
                        self.globals.delete(&name);
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", name.chars)));
                    }
                }
                Some(OpCode::GetUpvalue) => {
                    let slot = self.read_byte() as usize;
                    let value =
                        self.frames.last().unwrap().closure.upvalues[slot].cell.borrow().clone();
                    self.push(value);
                }
                Some(OpCode::SetUpvalue) => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    *self.frames.last().unwrap().closure.upvalues[slot].cell.borrow_mut() = value;
                }
                Some(OpCode::Equal) => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Some(OpCode::Greater) => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                Some(OpCode::Less) => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                Some(OpCode::Add) => self.op_add()?,
                Some(OpCode::Subtract) => self.binary_number_op(|a, b| Value::Number(a - b))?,
                Some(OpCode::Multiply) => self.binary_number_op(|a, b| Value::Number(a * b))?,
                Some(OpCode::Divide) => self.binary_number_op(|a, b| Value::Number(a / b))?,
                Some(OpCode::Not) => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Some(OpCode::Negate) => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                Some(OpCode::Print) => {
                    let value = self.pop();
                    println!("{}", value);
                }
                Some(OpCode::Jump) => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                Some(OpCode::JumpIfFalse) => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                Some(OpCode::Loop) => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                Some(OpCode::Call) => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                Some(OpCode::Closure) => {
                    let value = self.read_constant();
                    let function = match &value {
                        Value::Obj(obj) => obj
                            .as_function()
                            .cloned()
                            .expect("OP_CLOSURE constant must be a function"),
                        _ => unreachable!("OP_CLOSURE constant must be an object"),
                    };
                    let upvalue_count = function.upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte();
                        let index = self.read_byte() as usize;
                        let base = self.frames.last().unwrap().slot_base;
                        let cell = if is_local != 0 {
                            Rc::clone(&self.stack[base + index])
                        } else {
                            Rc::clone(&self.frames.last().unwrap().closure.upvalues[index].cell)
                        };
                        upvalues.push(Rc::new(Upvalue { cell }));
                    }
                    self.push(Value::Obj(Rc::new(Obj::Closure(Rc::new(Closure { function, upvalues })))));
                }
                Some(OpCode::Return) => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    if self.frames.is_empty() {
                        self.stack.truncate(frame.slot_base);
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                None => return Err(self.runtime_error(format!("Unknown opcode {}.", instruction))),
            }
        }
    }

    fn trace(&self) {
        let mut line = String::from("          ");
        for cell in &self.stack {
            line.push_str(&format!("[ {} ]", cell.borrow()));
        }
        eprintln!("{}", line);
        let frame = self.frames.last().unwrap();
        let chunk = frame.closure.function.chunk.borrow();
        let (text, _) = debug::disassemble_instruction(&chunk, frame.ip);
        eprintln!("{}", text);
    }
}

/// Recursively disassembles a function and every function nested inside
/// its constant pool, mirroring the book's `DEBUG_PRINT_CODE` behavior.
fn print_chunk_tree(function: &Rc<LoxFunction>) {
    let name = function.name.as_ref().map(|n| n.chars.as_str()).unwrap_or("<script>");
    eprintln!("{}", debug::disassemble_chunk(&function.chunk.borrow(), name));
    let nested: Vec<Rc<LoxFunction>> = function
        .chunk
        .borrow()
        .constants
        .iter()
        .filter_map(|c| match c {
            Value::Obj(obj) => obj.as_function().cloned(),
            _ => None,
        })
        .collect();
    for inner in &nested {
        print_chunk_tree(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) {
        let mut vm = Vm::new();
        vm.interpret(source).expect("expected successful interpretation");
    }

    #[test]
    fn arithmetic_and_print_work() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_concatenation_interns_result() {
        let mut vm = Vm::new();
        vm.interpret("var s = \"foo\" + \"bar\"; print s;").unwrap();
    }

    #[test]
    fn globals_roundtrip() {
        run_ok("var a = 1; a = a + 1; print a;");
    }

    #[test]
    fn block_scoping_shadows_outer_local() {
        run_ok("var x = 1; { var x = 2; print x; } print x;");
    }

    #[test]
    fn recursive_fibonacci() {
        run_ok("fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print fib(10);");
    }

    #[test]
    fn closures_capture_enclosing_locals_across_many_calls() {
        // The captured local's stack slot is reused by the time the first
        // `counter()` call runs (the defining frame already returned), so
        // this only passes if the upvalue keeps its own handle to the
        // value rather than an absolute, later-reused stack index.
        run_ok(
            "fun makeCounter() { var i = 0; fun count() { i = i + 1; print i; } return count; } \
             var c = makeCounter(); c(); c(); c();",
        );
    }

    #[test]
    fn closures_over_the_same_local_share_mutations() {
        run_ok(
            "fun pair() { var n = 0; fun inc() { n = n + 1; } fun get() { return n; } \
             inc(); inc(); print get(); } pair();",
        );
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("print nope;").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable 'nope'.")),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn assigning_to_undefined_global_does_not_create_it() {
        let mut vm = Vm::new();
        let err = vm.interpret("x = 1;").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable 'x'.")),
            _ => panic!("expected a runtime error"),
        }
        assert!(vm.globals.get(&vm.strings.intern("x".to_string())).is_none());
    }

    #[test]
    fn calling_a_non_callable_value_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("var x = 1; x();").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Can only call functions and classes.")),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("fun f(a, b) { return a + b; } f(1);").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Expected 2 arguments but got 1.")),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn adding_number_and_string_is_a_runtime_error_with_a_trace() {
        let mut vm = Vm::new();
        let err = vm.interpret("print 1 + \"a\";").unwrap_err();
        match err {
            InterpretError::Runtime(e) => {
                assert!(e.message.contains("Operands must be two numbers or two strings."));
                assert_eq!(e.trace.len(), 1);
                assert!(e.trace[0].name.is_none());
            }
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn clock_native_is_callable_with_no_arguments() {
        run_ok("print clock() >= 0;");
    }

    #[test]
    fn stack_and_frames_reset_after_a_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("print 1 + \"a\";").is_err());
        run_ok("print 1;");
    }
}
