// File: src/main.rs
//
// Entry point for the loxcore binary: reads a script, runs it through
// the VM, and maps the result to a process exit code.

use std::io::Read as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser as ClapParser;
use loxcore::errors::{report_compile_error, report_runtime_error, InterpretError};
use loxcore::vm::Vm;

#[derive(ClapParser)]
#[command(
    name = "loxcore",
    about = "Lox — a bytecode compiler and stack-based virtual machine",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a Lox script. Omit or pass '-' to read from stdin.
    file: Option<PathBuf>,

    /// Disassemble every compiled function before running it.
    #[arg(long)]
    print_code: bool,

    /// Trace each executed instruction and the value stack.
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    // `Cli::parse()` calls `get_matches()`, which on a usage error prints
    // to stderr and calls `std::process::exit(2)` directly — the exit-code
    // mapping below would never run. `try_parse()` returns control to us
    // instead, so a usage error can map to the spec's exit code 64.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // `--help`/`--version` surface as an `Err` too, but aren't usage
        // errors: print to stdout and exit 0, same as `Cli::parse()` would.
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", err);
            return ExitCode::from(0);
        }
        Err(err) => {
            eprint!("{}", err);
            return ExitCode::from(64);
        }
    };

    let read_stdin = match &cli.file {
        None => true,
        Some(path) => path == &PathBuf::from("-"),
    };

    let source = if read_stdin {
        let mut buf = String::new();
        match std::io::stdin().read_to_string(&mut buf) {
            Ok(_) => buf,
            Err(err) => {
                eprintln!("Failed to read stdin: {}", err);
                return ExitCode::from(74);
            }
        }
    } else {
        let path = cli.file.as_ref().unwrap();
        match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Failed to read '{}': {}", path.display(), err);
                return ExitCode::from(74);
            }
        }
    };

    let mut vm = Vm::new();
    vm.print_code = cli.print_code;
    vm.trace_execution = cli.trace;

    match vm.interpret(&source) {
        Ok(()) => ExitCode::from(0),
        Err(InterpretError::Compile(errors)) => {
            for err in &errors {
                report_compile_error(&mut std::io::stderr(), err);
            }
            ExitCode::from(65)
        }
        Err(InterpretError::Runtime(err)) => {
            report_runtime_error(&mut std::io::stderr(), &err);
            ExitCode::from(70)
        }
    }
}
