// File: src/repl.rs
//
// Interactive REPL. Forms are read, compiled, and run one at a time against
// a constant pool and host environment that persist across the session, so
// a `define` on one line is visible to the next.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use picoscheme::compiler::Compiler;
use picoscheme::disasm::disassemble_pool;
use picoscheme::errors::report;
use picoscheme::host::HostEnv;
use picoscheme::reader::read_program;
use picoscheme::value::Value;
use picoscheme::vm::VM;

pub struct Repl {
    host: HostEnv,
    editor: DefaultEditor,
    trace: bool,
}

impl Repl {
    pub fn new(trace: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { host: HostEnv::prelude(), editor, trace })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", "picoscheme REPL — :quit to exit".bright_cyan());

        loop {
            match self.editor.readline("picoscheme> ") {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if trimmed == ":quit" || trimmed == ":q" {
                        break;
                    }
                    self.eval_line(trimmed);
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "readline error:".bright_red(), err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn eval_line(&mut self, line: &str) {
        let forms = match read_program(line) {
            Ok(forms) => forms,
            Err(err) => return report("read", &err),
        };

        let pool = match Compiler::compile_keep_last(&forms) {
            Ok(pool) => pool,
            Err(err) => return report("compile", &err),
        };

        if self.trace {
            eprint!("{}", disassemble_pool(&pool));
        }

        let host = std::mem::replace(&mut self.host, HostEnv::new());
        let mut vm = match VM::new(pool, host) {
            Ok(vm) => vm,
            Err(err) => return report("runtime", &err),
        };
        vm.turn_debug(self.trace);

        match vm.start() {
            Ok(Value::Undefined) => {}
            Ok(value) => println!("{} {}", "=>".bright_blue(), value),
            Err(err) => report("runtime", &err),
        }
        self.host = vm.host;
    }
}
