// File: src/host.rs
//
// The embedding host: a string-keyed environment the VM reads through
// LOAD_GLOBAL and writes through SET_GLOBAL.

use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::VmError;
use crate::value::{HostFn, Value};

/// A binding a host symbol can resolve to: a callable, or a plain value
/// (e.g. a constant the embedder wants visible as a global).
pub enum HostBinding {
    Fn(HostFn),
    Value(Value),
}

/// The mapping from symbol name to host binding that the VM consults for
/// every `LOAD_GLOBAL`/`SET_GLOBAL`.
pub struct HostEnv {
    bindings: HashMap<String, HostBinding>,
}

impl HostEnv {
    pub fn new() -> Self {
        HostEnv { bindings: HashMap::new() }
    }

    pub fn bind_fn(&mut self, name: &str, f: impl Fn(&[Value]) -> Result<Vec<Value>, VmError> + 'static) {
        self.bindings.insert(name.to_string(), HostBinding::Fn(Rc::new(f)));
    }

    pub fn bind_value(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), HostBinding::Value(value));
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        match self.bindings.get(name)? {
            HostBinding::Fn(f) => Some(Value::HostFn(f.clone())),
            HostBinding::Value(v) => Some(v.clone()),
        }
    }

    /// `SET_GLOBAL` always rebinds as a plain value; a host function bound
    /// under the same name is simply shadowed.
    pub fn set(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), HostBinding::Value(value));
    }

    /// The default bindings: `display`, `assert`, `list`, `newline`, `not`.
    pub fn prelude() -> Self {
        let mut env = HostEnv::new();

        env.bind_fn("display", |args| {
            let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
            println!("{}", rendered.join(" "));
            Ok(vec![Value::Undefined])
        });

        env.bind_fn("newline", |_args| {
            println!();
            Ok(vec![Value::Undefined])
        });

        env.bind_fn("assert", |args| {
            if args.len() != 2 {
                return Err(VmError::ArityMismatch { expected: "2".to_string(), got: args.len() });
            }
            if args[0] != args[1] {
                return Err(VmError::TypeMismatch {
                    op: "assert".to_string(),
                    detail: format!("expected {} to equal {}", args[0], args[1]),
                });
            }
            Ok(vec![Value::Undefined])
        });

        env.bind_fn("list", |args| Ok(vec![Value::list_from(args)]));

        env.bind_fn("not", |args| {
            if args.len() != 1 {
                return Err(VmError::ArityMismatch { expected: "1".to_string(), got: args.len() });
            }
            let falsey = !args[0].is_truthy();
            Ok(vec![if falsey { Value::Integer(1) } else { Value::Nil }])
        });

        env
    }
}

impl Default for HostEnv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_passes_on_equal_values() {
        let env = HostEnv::prelude();
        let f = match env.get("assert").unwrap() {
            Value::HostFn(f) => f,
            _ => panic!("assert should be a host function"),
        };
        f(&[Value::Integer(6), Value::Integer(6)]).unwrap();
    }

    #[test]
    fn assert_fails_on_unequal_values() {
        let env = HostEnv::prelude();
        let f = match env.get("assert").unwrap() {
            Value::HostFn(f) => f,
            _ => panic!("assert should be a host function"),
        };
        assert!(f(&[Value::Integer(6), Value::Integer(5)]).is_err());
    }

    #[test]
    fn set_global_shadows_a_host_function() {
        let mut env = HostEnv::prelude();
        env.set("display", Value::Integer(7));
        assert_eq!(env.get("display"), Some(Value::Integer(7)));
    }
}
