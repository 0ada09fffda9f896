// File: src/disasm.rs
//
// Human-readable listing of a compiled prototype, for `--trace` output and
// the REPL's `:disasm` command.

use std::fmt::Write;
use std::rc::Rc;

use crate::bytecode::{binop, unop, ConstantPool, FunctionProto, OpCode};

/// Renders one instruction's operand as source-level detail where that adds
/// information beyond the raw integer: the literal a `LOAD_CONST` loads,
/// the primitive a `BINOP`/`UNOP` names, the prototype a `BUILD_CLOSURE`
/// captures.
fn operand_comment(pool: &ConstantPool, op: OpCode, operand: i32) -> Option<String> {
    match op {
        OpCode::LoadConst => Some(format!("; {}", pool.value(operand as usize))),
        OpCode::BinOp => binop::name(operand as u8).map(|n| format!("; {}", n)),
        OpCode::UnOp => unop::name(operand as u8).map(|n| format!("; {}", n)),
        OpCode::BuildClosure => {
            let proto = pool.proto(operand as usize);
            Some(match proto.name() {
                Some(name) => format!("; proto #{} ({})", operand, name),
                None => format!("; proto #{}", operand),
            })
        }
        _ => None,
    }
}

/// Disassembles a single prototype's instruction list, without descending
/// into prototypes it references via `BUILD_CLOSURE` (the caller walks the
/// constant pool separately to reach those).
pub fn disassemble_proto(pool: &ConstantPool, proto: &Rc<FunctionProto>) -> String {
    let mut out = String::new();
    let header = match proto.name() {
        Some(name) => format!("-- proto {} (argc={}, variadic={}) --\n", name, proto.argc, proto.is_variadic),
        None => format!("-- proto (argc={}, variadic={}) --\n", proto.argc, proto.is_variadic),
    };
    out.push_str(&header);
    for (pc, inst) in proto.instructions.borrow().iter().enumerate() {
        let jump_target = match inst.op {
            OpCode::Jump | OpCode::Test => Some((pc as i32 + inst.operand) as usize),
            _ => None,
        };
        let comment = match jump_target {
            Some(target) => format!("; -> {}", target),
            None => operand_comment(pool, inst.op, inst.operand).unwrap_or_default(),
        };
        writeln!(out, "{:>4}  {:<20} {:>6}  {}", pc, inst.op.mnemonic(), inst.operand, comment).unwrap();
    }
    out
}

/// Disassembles every prototype in the pool, in pool order.
pub fn disassemble_pool(pool: &ConstantPool) -> String {
    let mut out = String::new();
    for index in 0..pool.len() {
        if let Some(proto) = pool.proto_if_proto(index) {
            out.push_str(&disassemble_proto(pool, proto));
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::reader::read_program;

    #[test]
    fn disassembles_a_simple_addition() {
        let forms = read_program("(+ 1 2)").unwrap();
        let pool = Compiler::compile(&forms).unwrap();
        let text = disassemble_proto(&pool, pool.entry_point());
        assert!(text.contains("BINOP"));
        assert!(text.contains("+"));
    }
}
