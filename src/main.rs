// File: src/main.rs
//
// Main entry point for the Canidae interpreter.
// Reads a .can source file, compiles it, and executes it on the VM.
// Exit codes: 0 on success, 65 for compile errors, 70 for runtime errors.

use canidae::compiler;
use canidae::errors::{EXIT_COMPILE_ERROR, EXIT_RUNTIME_ERROR};
use canidae::vm::Vm;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Parser)]
#[command(
    name = "canidae",
    about = "Canidae: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .can file to run
    file: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.file) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file {}.", cli.file.display());
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };

    let source_dir = cli
        .file
        .canonicalize()
        .ok()
        .and_then(|path| path.parent().map(|dir| Rc::new(dir.to_path_buf())));

    let function = match compiler::compile(&source, source_dir) {
        Ok(function) => function,
        Err(errors) => {
            for error in errors {
                eprintln!("{}", error);
            }
            std::process::exit(EXIT_COMPILE_ERROR);
        }
    };

    let mut vm = Vm::new();
    if let Err(report) = vm.interpret(function) {
        eprint!("{}", report);
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}
