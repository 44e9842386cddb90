use crate::backend::vm::Vm;
use std::io::{self, Write};

/// Interactive line loop. Each line compiles and runs independently, but the
/// `Vm`'s heap, globals, and interned strings persist across lines.
pub fn run(vm: &mut Vm) {
    let stdin = io::stdin();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(_) => break,
        }
    }
}
