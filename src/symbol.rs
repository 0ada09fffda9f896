// File: src/symbol.rs
//
// The lexical-scope stack used during compilation: classifies every
// identifier reference as global, local, rest, or upvalue, and synthesizes
// upvalue descriptor chains through intermediate prototypes when a
// reference crosses a function boundary.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{ConstantPool, FunctionProto, UpvalueDescriptor};
use crate::errors::CompileError;

#[derive(Clone, Copy)]
enum SymbolRecord {
    Local(usize),
    Rest,
    Upvalue(usize),
    Global(usize),
}

struct Scope {
    proto: Rc<FunctionProto>,
    depth: usize,
    names: HashMap<String, SymbolRecord>,
}

/// How a reference to a name resolves, used by the compiler to choose the
/// matching `LOAD_*`/`SET_*` opcode.
#[derive(Clone, Copy)]
pub enum Resolution {
    Global(usize),
    Local(usize),
    Rest,
    Upvalue(usize),
}

/// The scope stack, with the root (global) scope always at index 0 and
/// never popped.
pub struct SymbolTable {
    scopes: Vec<Scope>,
    /// Scope-depth counter for the current prototype; reset to 0 whenever
    /// a new prototype is pushed, incremented by each nested `let`.
    depth_counter: usize,
}

impl SymbolTable {
    pub fn new(root_proto: Rc<FunctionProto>) -> Self {
        SymbolTable {
            scopes: vec![Scope { proto: root_proto, depth: 0, names: HashMap::new() }],
            depth_counter: 0,
        }
    }

    pub fn is_global(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn current_depth(&self) -> usize {
        self.scopes.last().unwrap().depth
    }

    pub fn current_proto(&self) -> Rc<FunctionProto> {
        self.scopes.last().unwrap().proto.clone()
    }

    /// Pushes a scope for a `let` body: same prototype, next depth.
    pub fn push_let_scope(&mut self) {
        self.depth_counter += 1;
        let proto = self.scopes.last().unwrap().proto.clone();
        let depth = self.depth_counter;
        self.scopes.push(Scope { proto, depth, names: HashMap::new() });
    }

    /// Pushes the root scope of a new `lambda`/`lambda_v` prototype.
    pub fn push_function_scope(&mut self, proto: Rc<FunctionProto>) {
        self.depth_counter = 0;
        self.scopes.push(Scope { proto, depth: 0, names: HashMap::new() });
    }

    pub fn pop(&mut self) {
        assert!(self.scopes.len() > 1, "cannot pop the global scope");
        self.scopes.pop();
    }

    /// Binds a fresh name in the current scope: a constant-pool global slot
    /// at the root scope, a freshly allocated local slot otherwise.
    pub fn add(&mut self, name: &str, pool: &mut ConstantPool) -> Result<Resolution, CompileError> {
        let is_global = self.is_global();
        let scope = self.scopes.last_mut().unwrap();
        if scope.names.contains_key(name) {
            return Err(CompileError::DuplicateBinding { name: name.to_string() });
        }
        if is_global {
            let index = pool.add_symbol(name);
            scope.names.insert(name.to_string(), SymbolRecord::Global(index));
            Ok(Resolution::Global(index))
        } else {
            let slot = scope.proto.alloc_local_slot();
            scope.names.insert(name.to_string(), SymbolRecord::Local(slot));
            Ok(Resolution::Local(slot))
        }
    }

    /// Binds a `lambda` parameter to its pre-assigned slot `0..argc`.
    pub fn declare_param(&mut self, name: &str, slot: usize) -> Result<(), CompileError> {
        let scope = self.scopes.last_mut().unwrap();
        if scope.names.contains_key(name) {
            return Err(CompileError::DuplicateBinding { name: name.to_string() });
        }
        scope.names.insert(name.to_string(), SymbolRecord::Local(slot));
        Ok(())
    }

    /// Binds the dotted rest parameter of a variadic `lambda_v`.
    pub fn declare_rest(&mut self, name: &str) -> Result<(), CompileError> {
        let scope = self.scopes.last_mut().unwrap();
        if scope.names.contains_key(name) {
            return Err(CompileError::DuplicateBinding { name: name.to_string() });
        }
        scope.names.insert(name.to_string(), SymbolRecord::Rest);
        Ok(())
    }

    /// Classifies a reference to `name`, synthesizing an upvalue chain
    /// through intermediate prototypes the first time a free variable
    /// crosses a function boundary.
    pub fn resolve(&mut self, name: &str, pool: &mut ConstantPool) -> Result<Resolution, CompileError> {
        let current_proto = self.current_proto();

        let found_index = self.scopes.iter().enumerate().rev().find(|(_, s)| s.names.contains_key(name)).map(|(i, _)| i);

        let found_index = match found_index {
            None => return Ok(Resolution::Global(pool.add_symbol(name))),
            Some(0) => return Ok(Resolution::Global(pool.add_symbol(name))),
            Some(i) => i,
        };

        let record = *self.scopes[found_index].names.get(name).unwrap();
        let owner_proto = self.scopes[found_index].proto.clone();

        if Rc::ptr_eq(&owner_proto, &current_proto) {
            return Ok(match record {
                SymbolRecord::Local(slot) => Resolution::Local(slot),
                SymbolRecord::Rest => Resolution::Rest,
                SymbolRecord::Upvalue(index) => Resolution::Upvalue(index),
                SymbolRecord::Global(_) => unreachable!("global scope excluded above"),
            });
        }

        self.synthesize_upvalue_chain(name, found_index, record)
    }

    fn synthesize_upvalue_chain(&mut self, name: &str, found_index: usize, found_record: SymbolRecord) -> Result<Resolution, CompileError> {
        let defining_depth = self.scopes[found_index].depth;
        let owner_proto = self.scopes[found_index].proto.clone();

        // Distinct prototypes strictly inside the defining scope's
        // prototype, ordered from its immediate inner child out to the
        // current (innermost) prototype. Scopes still belonging to the
        // defining prototype itself (further `let`s nested in the same
        // function) are not a boundary crossing and are skipped.
        let mut chain_protos: Vec<Rc<FunctionProto>> = Vec::new();
        for scope in &self.scopes[found_index + 1..] {
            if Rc::ptr_eq(&scope.proto, &owner_proto) {
                continue;
            }
            if chain_protos.last().map(|p| !Rc::ptr_eq(p, &scope.proto)).unwrap_or(true) {
                chain_protos.push(scope.proto.clone());
            }
        }

        let mut assigned: Vec<(Rc<FunctionProto>, usize)> = Vec::with_capacity(chain_protos.len());
        let mut previous_index: Option<usize> = None;
        for (i, proto) in chain_protos.iter().enumerate() {
            let descriptor = if i == 0 {
                match found_record {
                    SymbolRecord::Local(slot) => UpvalueDescriptor::Local { slot, scope_depth: defining_depth },
                    SymbolRecord::Rest => UpvalueDescriptor::Rest,
                    // The defining scope already turned this name into one
                    // of its own upvalues (it is itself nested); this
                    // prototype shares that entry rather than re-anchoring
                    // to a local slot.
                    SymbolRecord::Upvalue(index) => UpvalueDescriptor::Outer(index),
                    SymbolRecord::Global(_) => unreachable!("global scope excluded above"),
                }
            } else {
                UpvalueDescriptor::Outer(previous_index.expect("previous prototype in chain always assigns an index"))
            };
            proto.upvalue_descriptors.borrow_mut().push(descriptor);
            let index = proto.upvalue_descriptors.borrow().len() - 1;
            assigned.push((proto.clone(), index));
            previous_index = Some(index);
        }

        for scope in &mut self.scopes[found_index + 1..] {
            if let Some((_, index)) = assigned.iter().find(|(p, _)| Rc::ptr_eq(p, &scope.proto)) {
                scope.names.insert(name.to_string(), SymbolRecord::Upvalue(*index));
            }
        }

        Ok(Resolution::Upvalue(previous_index.expect("chain always synthesizes at least one descriptor")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ConstantPool;

    #[test]
    fn global_reference_pools_symbol_name() {
        let mut pool = ConstantPool::new();
        let root = FunctionProto::new(0, false);
        let mut table = SymbolTable::new(root);
        let resolution = table.resolve("display", &mut pool).unwrap();
        assert!(matches!(resolution, Resolution::Global(_)));
    }

    #[test]
    fn let_binding_resolves_to_local_in_same_prototype() {
        let mut pool = ConstantPool::new();
        let root = FunctionProto::new(0, false);
        let mut table = SymbolTable::new(root);
        table.push_let_scope();
        table.add("x", &mut pool).unwrap();
        let resolution = table.resolve("x", &mut pool).unwrap();
        assert!(matches!(resolution, Resolution::Local(_)));
    }

    #[test]
    fn one_hop_closure_capture_becomes_upvalue() {
        let mut pool = ConstantPool::new();
        let root = FunctionProto::new(0, false);
        let mut table = SymbolTable::new(root);

        let outer = FunctionProto::new(1, false);
        table.push_function_scope(outer.clone());
        table.declare_param("n", 0).unwrap();

        let inner = FunctionProto::new(1, false);
        table.push_function_scope(inner.clone());
        table.declare_param("x", 0).unwrap();

        let resolution = table.resolve("n", &mut pool).unwrap();
        assert!(matches!(resolution, Resolution::Upvalue(0)));
        assert_eq!(inner.upvalue_descriptors.borrow().len(), 1);
    }

    #[test]
    fn let_scope_nested_in_the_defining_function_is_not_a_proto_boundary() {
        let mut pool = ConstantPool::new();
        let root = FunctionProto::new(0, false);
        let mut table = SymbolTable::new(root);

        let outer = FunctionProto::new(1, false);
        table.push_function_scope(outer.clone());
        table.declare_param("n", 0).unwrap();
        table.push_let_scope();
        table.add("unused", &mut pool).unwrap();

        let inner = FunctionProto::new(0, false);
        table.push_function_scope(inner.clone());

        let resolution = table.resolve("n", &mut pool).unwrap();
        assert!(matches!(resolution, Resolution::Upvalue(0)));
        assert_eq!(inner.upvalue_descriptors.borrow().len(), 1);
        assert_eq!(outer.upvalue_descriptors.borrow().len(), 0);
    }

    #[test]
    fn duplicate_binding_in_same_scope_errors() {
        let mut pool = ConstantPool::new();
        let root = FunctionProto::new(0, false);
        let mut table = SymbolTable::new(root);
        table.push_let_scope();
        table.add("x", &mut pool).unwrap();
        let err = table.add("x", &mut pool).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateBinding { .. }));
    }
}
