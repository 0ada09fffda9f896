// File: src/compiler.rs
//
// Bytecode compiler: walks the syntax tree the reader produces and emits
// instructions into a constant pool's prototypes.

use std::rc::Rc;

use crate::ast::{Sexpr, Token, TokenKind};
use crate::bytecode::{binop, unop, ConstantPool, FunctionProto, OpCode};
use crate::errors::CompileError;
use crate::symbol::{Resolution, SymbolTable};
use crate::value::Value;

pub struct Compiler {
    pool: ConstantPool,
    symbols: SymbolTable,
    main: Rc<FunctionProto>,
}

impl Compiler {
    fn new() -> Self {
        let main = FunctionProto::new(0, false);
        Compiler { pool: ConstantPool::new(), symbols: SymbolTable::new(main.clone()), main }
    }

    /// Compiles every top-level form into a constant pool whose last entry
    /// is the top-level prototype. Each form's value is discarded.
    pub fn compile(forms: &[Sexpr]) -> Result<ConstantPool, CompileError> {
        Self::compile_forms(forms, true)
    }

    /// Like `compile`, but the last top-level form's value is left on the
    /// top-level frame's stack instead of discarded — what the REPL calls
    /// so it can print the value of the line just evaluated.
    pub fn compile_keep_last(forms: &[Sexpr]) -> Result<ConstantPool, CompileError> {
        Self::compile_forms(forms, false)
    }

    fn compile_forms(forms: &[Sexpr], pop_last: bool) -> Result<ConstantPool, CompileError> {
        let mut compiler = Compiler::new();
        for (i, form) in forms.iter().enumerate() {
            compiler.gen_exp(form, false)?;
            if pop_last || i + 1 < forms.len() {
                compiler.emit(OpCode::Pop, 1);
            }
        }
        compiler.main.set_name("main");
        let proto = compiler.main.clone();
        compiler.pool.add_proto(proto);
        Ok(compiler.pool)
    }

    fn current_proto(&self) -> Rc<FunctionProto> {
        self.symbols.current_proto()
    }

    fn emit(&self, op: OpCode, operand: i32) -> usize {
        self.current_proto().emit(op, operand)
    }

    fn gen_exp(&mut self, ast: &Sexpr, is_tail: bool) -> Result<(), CompileError> {
        match ast {
            Sexpr::Atom(token) => self.singular_exp(token),
            Sexpr::List(items) => self.gen_list_exp(items, is_tail),
        }
    }

    fn singular_exp(&mut self, token: &Token) -> Result<(), CompileError> {
        match token.kind {
            TokenKind::Symbol => self.gen_load_symbol(&token.info),
            TokenKind::Number => {
                let value = parse_number(token)?;
                let index = self.pool.add_literal(value);
                self.emit(OpCode::LoadConst, index as i32);
                Ok(())
            }
            TokenKind::String => {
                let index = self.pool.add_literal(Value::string(token.info.clone()));
                self.emit(OpCode::LoadConst, index as i32);
                Ok(())
            }
            _ => Err(CompileError::SyntaxStructure {
                form: "expression".to_string(),
                detail: format!("unexpected token '{}' in value position", token.info),
            }),
        }
    }

    fn gen_list_exp(&mut self, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        let head = items.first().ok_or_else(|| CompileError::SyntaxStructure {
            form: "application".to_string(),
            detail: "empty form".to_string(),
        })?;

        if let Some(head_tok) = head.as_atom() {
            match head_tok.kind {
                TokenKind::Keyword => return self.gen_keyword_form(&head_tok.info, items, is_tail),
                TokenKind::Symbol => {
                    if let Some(op) = binop::id_for_symbol(&head_tok.info) {
                        return self.gen_binop(op, items);
                    }
                    if let Some(op) = unop::id_for_symbol(&head_tok.info) {
                        return self.gen_unop(op, items);
                    }
                    return self.gen_call(items, is_tail);
                }
                _ => {}
            }
        }
        Err(CompileError::SyntaxStructure {
            form: "application".to_string(),
            detail: "the head of a form must be a keyword or a symbol".to_string(),
        })
    }

    fn gen_keyword_form(&mut self, keyword: &str, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        match keyword {
            "begin" => self.gen_seq(items, is_tail),
            "if" => self.gen_if(items, is_tail),
            "let" => self.gen_let(items, is_tail),
            "lambda" => self.gen_lambda(items, false),
            "lambda_v" => self.gen_lambda(items, true),
            "define" => self.gen_define(items),
            "call/cc" => self.gen_call_cc(items),
            "quote" => self.gen_quote(items),
            other => Err(CompileError::UnknownKeyword { keyword: other.to_string() }),
        }
    }

    /// `(begin e1 … eN)`: e1..e(N-1) discarded, eN in the enclosing tail
    /// context.
    fn gen_seq(&mut self, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        let body = &items[1..];
        if body.is_empty() {
            return Err(CompileError::SyntaxStructure { form: "begin".to_string(), detail: "expected at least one expression".to_string() });
        }
        for expr in &body[..body.len() - 1] {
            self.gen_exp(expr, false)?;
            self.emit(OpCode::Pop, 1);
        }
        self.gen_exp(&body[body.len() - 1], is_tail)
    }

    /// `(if p t f)`.
    fn gen_if(&mut self, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        if items.len() != 4 {
            return Err(CompileError::SyntaxStructure { form: "if".to_string(), detail: "expected a predicate, a then-branch, and an else-branch".to_string() });
        }
        self.gen_exp(&items[1], false)?;
        let false_patch = self.emit(OpCode::Test, 0);
        self.gen_exp(&items[2], is_tail)?;
        let end_patch = self.emit(OpCode::Jump, 0);
        self.current_proto().patch_to_here(false_patch);
        self.gen_exp(&items[3], is_tail)?;
        self.current_proto().patch_to_here(end_patch);
        Ok(())
    }

    /// `(let ((x1 e1) … (xn en)) body)`.
    fn gen_let(&mut self, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        if items.len() != 3 {
            return Err(CompileError::SyntaxStructure { form: "let".to_string(), detail: "expected a binding list and a body expression".to_string() });
        }
        let bindings = items[1].as_list().ok_or_else(|| CompileError::SyntaxStructure { form: "let".to_string(), detail: "bindings must be a list".to_string() })?;

        self.symbols.push_let_scope();
        for binding in bindings {
            let pair = binding.as_list().filter(|p| p.len() == 2).ok_or_else(|| CompileError::SyntaxStructure {
                form: "let".to_string(),
                detail: "each binding must be a (name expr) pair".to_string(),
            })?;
            let name = pair[0].as_atom().filter(|t| t.kind == TokenKind::Symbol).ok_or_else(|| CompileError::SyntaxStructure {
                form: "let".to_string(),
                detail: "a binding's name must be a symbol".to_string(),
            })?;
            self.gen_exp(&pair[1], false)?;
            match self.symbols.add(&name.info, &mut self.pool)? {
                Resolution::Local(slot) => {
                    self.emit(OpCode::SetLocal, slot as i32);
                }
                _ => unreachable!("a let scope is never the global scope"),
            }
        }

        self.gen_exp(&items[2], is_tail)?;

        let depth = self.symbols.current_depth();
        self.emit(OpCode::CloseUpvar, depth as i32);
        self.current_proto().release_locals(bindings.len());
        self.symbols.pop();
        Ok(())
    }

    /// `(lambda (params…) body…)` / `(lambda_v (params… . rest) body…)`.
    fn gen_lambda(&mut self, items: &[Sexpr], is_variadic: bool) -> Result<(), CompileError> {
        let form_name = if is_variadic { "lambda_v" } else { "lambda" };
        if items.len() < 3 {
            return Err(CompileError::SyntaxStructure { form: form_name.to_string(), detail: "expected a parameter list and at least one body expression".to_string() });
        }
        let params = items[1].as_list().ok_or_else(|| CompileError::SyntaxStructure { form: form_name.to_string(), detail: "parameter list must be a list".to_string() })?;
        let body = &items[2..];

        let (fixed_params, rest_name): (&[Sexpr], Option<&Token>) = if is_variadic {
            if params.len() < 2 {
                return Err(CompileError::SyntaxStructure { form: form_name.to_string(), detail: "a variadic parameter list needs at least '. rest'".to_string() });
            }
            let fixed = &params[..params.len() - 2];
            let dot = params[params.len() - 2].as_atom().filter(|t| t.info == ".");
            if dot.is_none() {
                return Err(CompileError::SyntaxStructure { form: form_name.to_string(), detail: "expected '.' before the rest parameter".to_string() });
            }
            let rest = params[params.len() - 1].as_atom().ok_or_else(|| CompileError::SyntaxStructure { form: form_name.to_string(), detail: "the rest parameter must be a symbol".to_string() })?;
            (fixed, Some(rest))
        } else {
            (params, None)
        };

        let proto = FunctionProto::new(fixed_params.len(), is_variadic);
        self.symbols.push_function_scope(proto.clone());
        for (slot, param) in fixed_params.iter().enumerate() {
            let name = param.as_atom().filter(|t| t.kind == TokenKind::Symbol).ok_or_else(|| CompileError::SyntaxStructure { form: form_name.to_string(), detail: "a parameter must be a symbol".to_string() })?;
            self.symbols.declare_param(&name.info, slot)?;
        }
        if let Some(rest) = rest_name {
            self.symbols.declare_rest(&rest.info)?;
        }

        for expr in &body[..body.len() - 1] {
            self.gen_exp(expr, false)?;
            proto.emit(OpCode::Pop, 1);
        }
        self.gen_exp(&body[body.len() - 1], true)?;
        proto.emit(OpCode::Ret, 1);

        self.symbols.pop();
        let index = self.pool.add_proto(proto);
        self.emit(OpCode::BuildClosure, index as i32);
        Ok(())
    }

    /// `(define name expr)`.
    fn gen_define(&mut self, items: &[Sexpr]) -> Result<(), CompileError> {
        if items.len() != 3 {
            return Err(CompileError::SyntaxStructure { form: "define".to_string(), detail: "expected a name and an expression".to_string() });
        }
        let name = items[1].as_atom().filter(|t| t.kind == TokenKind::Symbol).ok_or_else(|| CompileError::SyntaxStructure { form: "define".to_string(), detail: "the name being defined must be a symbol".to_string() })?;

        let resolution = self.symbols.add(&name.info, &mut self.pool)?;
        self.gen_exp(&items[2], false)?;
        match resolution {
            Resolution::Global(index) => self.emit(OpCode::SetGlobal, index as i32),
            Resolution::Local(slot) => self.emit(OpCode::SetLocal, slot as i32),
            _ => unreachable!("add() only produces Global or Local"),
        };
        // A `define` expression evaluates to Undefined.
        self.emit(OpCode::LoadConst, 0);
        Ok(())
    }

    /// `(call/cc e)`.
    fn gen_call_cc(&mut self, items: &[Sexpr]) -> Result<(), CompileError> {
        if items.len() != 2 {
            return Err(CompileError::SyntaxStructure { form: "call/cc".to_string(), detail: "expected exactly one operand".to_string() });
        }
        self.gen_exp(&items[1], false)?;
        self.emit(OpCode::BuildContinuation, -1);
        self.emit(OpCode::Call, 1);
        Ok(())
    }

    /// `(quote datum)`: loads `datum` as a literal value rather than
    /// evaluating it. Converts the syntax tree directly into the matching
    /// runtime `Value` shape (symbols, numbers, strings, nested lists).
    fn gen_quote(&mut self, items: &[Sexpr]) -> Result<(), CompileError> {
        if items.len() != 2 {
            return Err(CompileError::SyntaxStructure { form: "quote".to_string(), detail: "expected exactly one operand".to_string() });
        }
        let value = sexpr_to_value(&items[1]);
        let index = self.pool.add_literal(value);
        self.emit(OpCode::LoadConst, index as i32);
        Ok(())
    }

    fn gen_binop(&mut self, op: u8, items: &[Sexpr]) -> Result<(), CompileError> {
        if items.len() != 3 {
            return Err(CompileError::SyntaxStructure { form: binop::name(op).unwrap_or("?").to_string(), detail: "expected exactly two operands".to_string() });
        }
        self.gen_exp(&items[1], false)?;
        self.gen_exp(&items[2], false)?;
        self.emit(OpCode::BinOp, op as i32);
        Ok(())
    }

    fn gen_unop(&mut self, op: u8, items: &[Sexpr]) -> Result<(), CompileError> {
        if items.len() != 2 {
            return Err(CompileError::SyntaxStructure { form: unop::name(op).unwrap_or("?").to_string(), detail: "expected exactly one operand".to_string() });
        }
        self.gen_exp(&items[1], false)?;
        self.emit(OpCode::UnOp, op as i32);
        Ok(())
    }

    /// `(f args…)` where `f` is a plain symbol, not a primitive operator.
    fn gen_call(&mut self, items: &[Sexpr], is_tail: bool) -> Result<(), CompileError> {
        let callee = items[0].as_atom().filter(|t| t.kind == TokenKind::Symbol).ok_or_else(|| CompileError::SyntaxStructure {
            form: "application".to_string(),
            detail: "the function position of a call must be a plain symbol".to_string(),
        })?;
        self.gen_load_symbol(&callee.info)?;
        for arg in &items[1..] {
            self.gen_exp(arg, false)?;
        }
        let argc = (items.len() - 1) as i32;
        if is_tail {
            self.emit(OpCode::TailCall, argc);
        } else {
            self.emit(OpCode::Call, argc);
        }
        Ok(())
    }

    fn gen_load_symbol(&mut self, name: &str) -> Result<(), CompileError> {
        let resolution = self.symbols.resolve(name, &mut self.pool)?;
        match resolution {
            Resolution::Global(index) => self.emit(OpCode::LoadGlobal, index as i32),
            Resolution::Local(slot) => self.emit(OpCode::LoadLocal, slot as i32),
            Resolution::Rest => self.emit(OpCode::LoadVarg, 0),
            Resolution::Upvalue(index) => self.emit(OpCode::LoadUpvar, index as i32),
        };
        Ok(())
    }
}

fn parse_number(token: &Token) -> Result<Value, CompileError> {
    if token.is_float_literal() {
        token.info.parse::<f64>().map(Value::Float).map_err(|_| CompileError::SyntaxStructure { form: "number".to_string(), detail: format!("invalid float literal '{}'", token.info) })
    } else {
        token.info.parse::<i64>().map(Value::Integer).map_err(|_| CompileError::SyntaxStructure { form: "number".to_string(), detail: format!("invalid integer literal '{}'", token.info) })
    }
}

fn sexpr_to_value(sexpr: &Sexpr) -> Value {
    match sexpr {
        Sexpr::Atom(t) => match t.kind {
            TokenKind::Symbol | TokenKind::Keyword => Value::symbol(t.info.clone()),
            TokenKind::Number => parse_number(t).unwrap_or(Value::Nil),
            TokenKind::String => Value::string(t.info.clone()),
            TokenKind::LeftParen | TokenKind::RightParen | TokenKind::QuoteTick => Value::Nil,
        },
        Sexpr::List(items) => {
            let values: Vec<Value> = items.iter().map(sexpr_to_value).collect();
            Value::list_from(&values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::OpCode;
    use crate::reader::read_program;

    fn compile_source(source: &str) -> ConstantPool {
        let forms = read_program(source).unwrap();
        Compiler::compile(&forms).unwrap()
    }

    #[test]
    fn integer_literal_compiles_to_load_const() {
        let pool = compile_source("5");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        assert!(matches!(insts[0].op, OpCode::LoadConst));
        assert_eq!(*pool.value(insts[0].operand as usize), Value::Integer(5));
    }

    #[test]
    fn define_binds_a_global_and_restores_undefined() {
        let pool = compile_source("(define x 5)");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        let ops: Vec<OpCode> = insts.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![OpCode::LoadConst, OpCode::SetGlobal, OpCode::LoadConst, OpCode::Pop]);
    }

    #[test]
    fn addition_emits_binop_add() {
        let pool = compile_source("(+ 1 2)");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        let binop_inst = insts.iter().find(|i| i.op == OpCode::BinOp).unwrap();
        assert_eq!(binop_inst.operand as u8, binop::ADD);
    }

    #[test]
    fn lambda_compiles_a_nested_prototype_ending_in_ret() {
        let pool = compile_source("(lambda (x) x)");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        assert!(insts.iter().any(|i| i.op == OpCode::BuildClosure));
        let closure_inst = insts.iter().find(|i| i.op == OpCode::BuildClosure).unwrap();
        let proto = pool.proto(closure_inst.operand as usize);
        let proto_insts = proto.instructions.borrow();
        assert_eq!(proto_insts.last().unwrap().op, OpCode::Ret);
    }

    #[test]
    fn let_emits_close_upvar_and_releases_slots() {
        let pool = compile_source("(let ((x 1)) x)");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        assert!(insts.iter().any(|i| i.op == OpCode::CloseUpvar));
        assert_eq!(main.max_locals.get(), 1);
    }

    #[test]
    fn call_cc_emits_build_continuation_then_call_one() {
        let pool = compile_source("(call/cc (lambda (k) (k 1)))");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        let cc_pos = insts.iter().position(|i| i.op == OpCode::BuildContinuation).unwrap();
        assert_eq!(insts[cc_pos + 1].op, OpCode::Call);
        assert_eq!(insts[cc_pos + 1].operand, 1);
    }

    #[test]
    fn quoted_list_compiles_to_a_literal_pair_structure() {
        let pool = compile_source("'(1 2)");
        let main = pool.entry_point();
        let insts = main.instructions.borrow();
        let value = pool.value(insts[0].operand as usize);
        assert_eq!(*value, Value::list_from(&[Value::Integer(1), Value::Integer(2)]));
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let forms = vec![Sexpr::List(vec![Sexpr::Atom(Token::keyword("cond"))])];
        assert!(Compiler::compile(&forms).is_err());
    }
}
