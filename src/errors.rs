// File: src/errors.rs
//
// Structured error types for the reader, compiler, and VM. No source spans
// are tracked (the syntax tree the reader hands the compiler carries
// none), so diagnostics describe the failing value/opcode/symbol rather
// than a line and column.

use colored::Colorize;
use std::fmt;

/// Failures raised while turning source text into a syntax tree: malformed
/// token shapes, mismatched parens, unterminated strings.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderError {
    UnexpectedEof,
    UnterminatedString,
    UnmatchedRightParen,
    InvalidNumber { text: String },
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReaderError::UnexpectedEof => write!(f, "unexpected end of input"),
            ReaderError::UnterminatedString => write!(f, "unterminated string literal"),
            ReaderError::UnmatchedRightParen => write!(f, "unmatched ')'"),
            ReaderError::InvalidNumber { text } => write!(f, "invalid number literal '{}'", text),
        }
    }
}

impl std::error::Error for ReaderError {}

/// Failures raised while the compiler walks the syntax tree. All of these
/// are "the program the reader handed us doesn't parse as a form" or "the
/// symbol table rejects this binding" — never a VM-internal bug.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A special form has the wrong shape: wrong list length, missing
    /// binding list, non-symbol where one was required, and so on.
    SyntaxStructure { form: String, detail: String },
    /// `add(name)` found `name` already bound in the current scope.
    DuplicateBinding { name: String },
    /// A keyword token appeared in head position that the generator has
    /// no emit rule for. Indicates a reader/compiler vocabulary mismatch.
    UnknownKeyword { keyword: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::SyntaxStructure { form, detail } => {
                write!(f, "malformed `{}`: {}", form, detail)
            }
            CompileError::DuplicateBinding { name } => {
                write!(f, "'{}' is already defined in this scope", name)
            }
            CompileError::UnknownKeyword { keyword } => {
                write!(f, "no code generator rule for keyword '{}'", keyword)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Failures raised while the VM executes bytecode. `UnknownPrimitive` and
/// `UnknownOpcode` indicate a compiler bug (an instruction the VM cannot
/// make sense of was emitted) and are always fatal; the rest are ordinary
/// program errors a host might want to report to a user.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    UndefinedLocal { slot: usize },
    UnboundGlobal { name: String },
    ArityMismatch { expected: String, got: usize },
    TypeMismatch { op: String, detail: String },
    UnknownPrimitive { op_id: u8 },
    UnknownOpcode { opcode: u8 },
    StackUnderflow { op: String },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::UndefinedLocal { slot } => {
                write!(f, "local slot {} read before assignment", slot)
            }
            VmError::UnboundGlobal { name } => write!(f, "unbound global '{}'", name),
            VmError::ArityMismatch { expected, got } => {
                write!(f, "expected {} argument(s), got {}", expected, got)
            }
            VmError::TypeMismatch { op, detail } => write!(f, "{}: {}", op, detail),
            VmError::UnknownPrimitive { op_id } => {
                write!(f, "unknown primitive operator id {} (compiler bug)", op_id)
            }
            VmError::UnknownOpcode { opcode } => {
                write!(f, "unknown opcode {} (compiler bug)", opcode)
            }
            VmError::StackUnderflow { op } => write!(f, "operand stack underflow in {}", op),
        }
    }
}

impl std::error::Error for VmError {}

/// Prints an error the way the CLI reports it: a bold red kind label
/// followed by the message. No source line is shown since the core
/// carries no spans.
pub fn report(kind: &str, err: &dyn fmt::Display) {
    eprintln!("{}: {}", kind.red().bold(), err);
}
