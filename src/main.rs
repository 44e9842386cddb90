use clap::Parser;
use loxvm::{InterpretResult, Vm};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "loxvm")]
#[command(version)]
#[command(about = "A bytecode compiler and virtual machine for a small dynamic scripting language.", long_about = None)]
struct Cli {
    /// Script to run. Omitted to start the REPL.
    path: Option<PathBuf>,

    /// Print each executed instruction and the value stack as it runs.
    #[arg(short, long)]
    trace: bool,
}

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let positional = raw.iter().filter(|a| !a.starts_with('-')).count();
    if positional > 1 {
        eprintln!("Usage: loxvm [path] [--trace]");
        std::process::exit(64);
    }

    let cli = Cli::parse();
    let mut vm = Vm::new();
    vm.trace = cli.trace;

    match cli.path {
        Some(path) => run_file(&mut vm, &path),
        None => loxvm::repl::run(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &Path) {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {e}", path.display());
            std::process::exit(74);
        }
    };
    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => std::process::exit(65),
        InterpretResult::RuntimeError => std::process::exit(70),
    }
}
