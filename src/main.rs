// File: src/main.rs
//
// Command-line entry point: compile and run a source file, or drop into
// the interactive REPL.

mod repl;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};
use picoscheme::compiler::Compiler;
use picoscheme::disasm::disassemble_pool;
use picoscheme::errors::report;
use picoscheme::host::HostEnv;
use picoscheme::reader::read_program;
use picoscheme::vm::VM;

#[derive(ClapParser)]
#[command(
    name = "picoscheme",
    about = "A small Scheme-dialect bytecode compiler and VM",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run a source file
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Print each prototype's disassembly before executing
        #[arg(long)]
        trace: bool,
    },

    /// Launch the interactive REPL
    Repl {
        /// Print each prototype's disassembly before executing
        #[arg(long)]
        trace: bool,
    },

    /// Compile a source file and print its disassembly without running it
    Dump { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, trace } => run_file(&file, trace),
        Commands::Dump { file } => dump_file(&file),
        Commands::Repl { trace } => match repl::Repl::new(trace) {
            Ok(mut repl) => match repl.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("repl error: {}", err);
                    ExitCode::FAILURE
                }
            },
            Err(err) => {
                eprintln!("failed to start repl: {}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn run_file(path: &PathBuf, trace: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) => {
            report("io", &err);
            return ExitCode::FAILURE;
        }
    };

    let forms = match read_program(&source) {
        Ok(forms) => forms,
        Err(err) => {
            report("read", &err);
            return ExitCode::FAILURE;
        }
    };

    let pool = match Compiler::compile(&forms) {
        Ok(pool) => pool,
        Err(err) => {
            report("compile", &err);
            return ExitCode::FAILURE;
        }
    };

    if trace {
        print!("{}", disassemble_pool(&pool));
    }

    let mut vm = match VM::new(pool, HostEnv::prelude()) {
        Ok(vm) => vm,
        Err(err) => {
            report("runtime", &err);
            return ExitCode::FAILURE;
        }
    };
    vm.turn_debug(trace);

    match vm.start() {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            report("runtime", &err);
            ExitCode::FAILURE
        }
    }
}

fn dump_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(err) => {
            report("io", &err);
            return ExitCode::FAILURE;
        }
    };

    let forms = match read_program(&source) {
        Ok(forms) => forms,
        Err(err) => {
            report("read", &err);
            return ExitCode::FAILURE;
        }
    };

    let pool = match Compiler::compile(&forms) {
        Ok(pool) => pool,
        Err(err) => {
            report("compile", &err);
            return ExitCode::FAILURE;
        }
    };

    print!("{}", disassemble_pool(&pool));
    ExitCode::SUCCESS
}
