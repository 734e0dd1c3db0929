// File: src/errors.rs
//
// Error handling and reporting for the Lox bytecode core.
// Provides structured error types with source location information
// and plain, snapshot-stable error messages for both the compiler
// and the virtual machine.

use std::fmt;

/// Source location information for tracking where code appears in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
}

impl SourceLocation {
    pub fn new(line: usize) -> Self {
        Self { line }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

/// A single accumulated compile error: `[line N] Error at WHERE: message`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub location: SourceLocation,
    pub at: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.location.line, self.at, self.message)
    }
}

impl std::error::Error for CompileError {}

/// One frame of the call stack at the moment a runtime error was raised,
/// used to print the innermost-to-outermost trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub line: usize,
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error raised by the VM, carrying the call-stack trace
/// captured at the point of failure (innermost frame first).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self { message: message.into(), trace }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i + 1 == self.trace.len() {
                write!(f, "{}", frame)?;
            } else {
                writeln!(f, "{}", frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Outcome of `Vm::interpret`, mirroring the book's `InterpretResult`.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
            InterpretError::Runtime(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for InterpretError {}

/// Writes a compile error to the given sink in the exact wording required
/// by the spec: `[line N] Error at 'lexeme': message` (or `at end`).
pub fn report_compile_error(out: &mut impl std::io::Write, err: &CompileError) {
    let _ = writeln!(out, "{}", err);
}

/// Writes a runtime error and its stack trace to the given sink.
pub fn report_runtime_error(out: &mut impl std::io::Write, err: &RuntimeError) {
    let _ = writeln!(out, "{}", err);
}
