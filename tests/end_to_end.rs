// Integration tests for the Lox bytecode core.
//
// Two layers: process-level tests drive the compiled `loxcore` binary
// over stdin and check exactly what spec scenarios say should be
// printed (stdout/stderr, exit code); library-level tests exercise
// `loxcore::vm::Vm`/`compile` directly for error taxonomy and compiler
// behavior that doesn't need a subprocess.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use loxcore::compiler::compile;
use loxcore::errors::InterpretError;
use loxcore::table::Table;
use loxcore::vm::Vm;

fn run(source: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_loxcore"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn loxcore");
    child.stdin.take().unwrap().write_all(source.as_bytes()).unwrap();
    child.wait_with_output().expect("failed to wait on loxcore")
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8(output.stderr.clone()).unwrap()
}

#[test]
fn arithmetic_precedence() {
    let out = run("print 1 + 2 * 3;");
    assert_eq!(stdout(&out), "7\n");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn string_concatenation() {
    let out = run("var a = \"foo\"; var b = \"bar\"; print a + b;");
    assert_eq!(stdout(&out), "foobar\n");
}

#[test]
fn block_scope_shadows_then_restores_outer_local() {
    let out = run("var x = 1; { var x = 2; print x; } print x;");
    assert_eq!(stdout(&out), "2\n1\n");
}

#[test]
fn recursive_fibonacci() {
    let out = run(
        "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print fib(10);",
    );
    assert_eq!(stdout(&out), "55\n");
}

#[test]
fn closure_captures_enclosing_local_across_calls() {
    let out = run(
        "fun makeCounter() { var i = 0; fun count() { i = i + 1; print i; } return count; } \
         var c = makeCounter(); c(); c(); c();",
    );
    assert_eq!(stdout(&out), "1\n2\n3\n");
}

#[test]
fn adding_number_and_string_is_a_runtime_error() {
    let out = run("print 1 + \"a\";");
    assert_eq!(out.status.code(), Some(70));
    let err = stderr(&out);
    assert!(err.contains("Operands must be two numbers or two strings."));
    assert!(err.contains("[line 1] in script"));
    assert_eq!(stdout(&out), "");
}

#[test]
fn missing_semicolon_is_a_compile_error_exit_65() {
    let out = run("print 1");
    assert_eq!(out.status.code(), Some(65));
    assert!(stderr(&out).contains("Expect ';' after value."));
}

#[test]
fn and_or_short_circuit() {
    let out = run("fun side(v) { print v; return v; } print side(false) and side(true); print side(true) or side(false);");
    // side(false) prints, `and` short-circuits so side(true) on the left branch never runs;
    // side(true) prints for the `or`, short-circuiting its own right-hand side(false).
    assert_eq!(stdout(&out), "false\nfalse\ntrue\ntrue\n");
}

#[test]
fn for_loop_accumulates() {
    let out = run("var sum = 0; for (var i = 1; i <= 5; i = i + 1) { sum = sum + i; } print sum;");
    assert_eq!(stdout(&out), "15\n");
}

#[test]
fn clock_native_returns_a_nonnegative_number() {
    let out = run("print clock() >= 0;");
    assert_eq!(stdout(&out), "true\n");
}

#[test]
fn unrecognized_flag_is_a_usage_error_exit_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_loxcore"))
        .arg("--not-a-real-flag")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            child.stdin.take().unwrap().write_all(b"")?;
            child.wait_with_output()
        })
        .expect("failed to run loxcore --not-a-real-flag");
    assert_eq!(output.status.code(), Some(64));
    assert_eq!(stdout(&output), "");
}

#[test]
fn print_code_flag_disassembles_to_stderr() {
    let output = Command::new(env!("CARGO_BIN_EXE_loxcore"))
        .arg("--print-code")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            child.stdin.take().unwrap().write_all(b"print 1;")?;
            child.wait_with_output()
        })
        .expect("failed to run loxcore --print-code");
    assert!(stderr(&output).contains("OP_CONSTANT"));
    assert!(stderr(&output).contains("OP_RETURN"));
}

// Library-level tests: compiler/VM error taxonomy that doesn't need a
// subprocess.

#[test]
fn compile_returns_all_accumulated_errors_and_no_function() {
    let mut strings = Table::new();
    let result = compile("var = 1;", &mut strings);
    assert!(result.is_err());
    let errors = result.unwrap_err();
    assert!(!errors.is_empty());
    assert!(errors[0].message.contains("Expect variable name."));
}

#[test]
fn undefined_global_reports_through_interpret_error() {
    let mut vm = Vm::new();
    match vm.interpret("print missing;") {
        Err(InterpretError::Runtime(err)) => {
            assert!(err.message.contains("Undefined variable 'missing'."));
            assert_eq!(err.trace.len(), 1);
        }
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn vm_recovers_and_accepts_further_programs_after_a_runtime_error() {
    let mut vm = Vm::new();
    assert!(vm.interpret("print 1 + \"a\";").is_err());
    assert!(vm.interpret("print 2 + 2;").is_ok());
}

#[test]
fn reading_local_in_its_own_initializer_is_a_compile_error() {
    let mut strings = Table::new();
    let result = compile("{ var a = a; }", &mut strings);
    let errors = result.unwrap_err();
    assert!(errors.iter().any(|e| e.message.contains("Can't read local variable in its own initializer.")));
}
