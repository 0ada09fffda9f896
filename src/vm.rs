// File: src/vm.rs
//
// The virtual machine: frame chain, upvalue open/closed state machine, and
// the dispatch loop implementing every opcode in src/bytecode.rs.
// Continuations are implemented by forking the frame chain rather than by
// snapshotting it wholesale.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{binop, unop, ConstantPool, FunctionProto, Instruction, OpCode, UpvalueDescriptor};
use crate::errors::VmError;
use crate::host::HostEnv;
use crate::value::{Closure, Value};

/// An indirection cell shared between a closure and the frame slot it
/// captured. OPEN while the anchoring frame is live; CLOSED once the frame
/// has returned (or been superseded by a continuation fork) and the value
/// has been copied out.
pub struct Upvalue {
    state: RefCell<UpvalueState>,
}

enum UpvalueState {
    Open { frame: Rc<RefCell<Frame>>, anchor: UpvalueAnchor, scope_depth: usize },
    Closed(Value),
}

#[derive(Clone, Copy)]
enum UpvalueAnchor {
    Local(usize),
    Rest,
}

impl Upvalue {
    fn open_local(frame: Rc<RefCell<Frame>>, slot: usize, scope_depth: usize) -> Rc<Upvalue> {
        Rc::new(Upvalue {
            state: RefCell::new(UpvalueState::Open {
                frame,
                anchor: UpvalueAnchor::Local(slot),
                scope_depth,
            }),
        })
    }

    fn open_rest(frame: Rc<RefCell<Frame>>, scope_depth: usize) -> Rc<Upvalue> {
        Rc::new(Upvalue {
            state: RefCell::new(UpvalueState::Open {
                frame,
                anchor: UpvalueAnchor::Rest,
                scope_depth,
            }),
        })
    }

    pub fn get(&self) -> Value {
        match &*self.state.borrow() {
            UpvalueState::Open { frame, anchor, .. } => match anchor {
                UpvalueAnchor::Local(slot) => frame.borrow().locals[*slot].clone(),
                UpvalueAnchor::Rest => frame.borrow().varargs.clone().unwrap_or(Value::Nil),
            },
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    pub fn set(&self, value: Value) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            UpvalueState::Open { frame, anchor, .. } => match anchor {
                UpvalueAnchor::Local(slot) => frame.borrow_mut().locals[*slot] = value,
                UpvalueAnchor::Rest => frame.borrow_mut().varargs = Some(value),
            },
            UpvalueState::Closed(slot) => *slot = value,
        }
    }

    /// Idempotent: closing an already-closed upvalue is a no-op.
    fn close(&self) {
        let value = self.get();
        let mut state = self.state.borrow_mut();
        if matches!(&*state, UpvalueState::Open { .. }) {
            *state = UpvalueState::Closed(value);
        }
    }

    fn anchored_to(&self, frame: &Rc<RefCell<Frame>>) -> bool {
        matches!(&*self.state.borrow(), UpvalueState::Open { frame: f, .. } if Rc::ptr_eq(f, frame))
    }

    fn scope_depth(&self) -> Option<usize> {
        match &*self.state.borrow() {
            UpvalueState::Open { scope_depth, .. } => Some(*scope_depth),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// One activation record.
pub struct Frame {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Rc<Upvalue>>,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub varargs: Option<Value>,
    pub saved_pc: usize,
    pub to_be_forked: bool,
    /// Upvalues currently OPEN and anchored to this frame, i.e. created by a
    /// `BUILD_CLOSURE` executed while this frame was current. Consulted by
    /// `CLOSE_UPVAR` and by `RET`'s "close everything" pass.
    open_upvalues: Vec<Rc<Upvalue>>,
}

impl Frame {
    pub fn new(proto: Rc<FunctionProto>, upvalues: Vec<Rc<Upvalue>>, args: Vec<Value>) -> Result<Self, VmError> {
        let max_locals = proto.max_locals.get();
        let mut locals = vec![Value::Undefined; max_locals];
        let varargs;
        if proto.is_variadic {
            if args.len() < proto.argc {
                return Err(VmError::ArityMismatch {
                    expected: format!("at least {}", proto.argc),
                    got: args.len(),
                });
            }
            let (fixed, rest) = args.split_at(proto.argc);
            locals[..proto.argc].clone_from_slice(fixed);
            varargs = Some(Value::list_from(rest));
        } else {
            if args.len() != proto.argc {
                return Err(VmError::ArityMismatch { expected: proto.argc.to_string(), got: args.len() });
            }
            locals[..proto.argc].clone_from_slice(&args);
            varargs = None;
        }
        Ok(Frame {
            proto,
            upvalues,
            locals,
            stack: Vec::new(),
            varargs,
            saved_pc: 0,
            to_be_forked: false,
            open_upvalues: Vec::new(),
        })
    }

    /// Produces the copy-on-fork clone used when a continuation captures
    /// this frame: fresh locals/stack, shared prototype and
    /// captured-upvalue vector, no inherited open-upvalue registry (those
    /// stay anchored to `self`).
    fn clone_for_fork(&self) -> Frame {
        Frame {
            proto: self.proto.clone(),
            upvalues: self.upvalues.clone(),
            locals: self.locals.clone(),
            stack: self.stack.clone(),
            varargs: self.varargs.clone(),
            saved_pc: self.saved_pc,
            to_be_forked: false,
            open_upvalues: Vec::new(),
        }
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::StackUnderflow { op: "pop".to_string() })
    }
}

/// Closes every OPEN upvalue anchored to `frame` whose scope depth matches
/// `depth`, or every one of them when `depth` is `None` (the `RET` case).
fn close_upvars(frame: &Rc<RefCell<Frame>>, depth: Option<usize>) {
    let candidates: Vec<Rc<Upvalue>> = frame.borrow().open_upvalues.clone();
    for upvalue in candidates {
        if !upvalue.anchored_to(frame) {
            continue;
        }
        let matches = match depth {
            None => true,
            Some(d) => upvalue.scope_depth() == Some(d),
        };
        if matches {
            upvalue.close();
        }
    }
}

/// A persistent singly-linked list of frames, innermost first. Forking
/// shares the unaffected tail rather than copying it.
#[derive(Clone)]
struct FrameChain(Option<Rc<FrameChainNode>>);

struct FrameChainNode {
    frame: Rc<RefCell<Frame>>,
    parent: FrameChain,
}

impl FrameChain {
    fn empty() -> Self {
        FrameChain(None)
    }

    fn cons(frame: Rc<RefCell<Frame>>, parent: FrameChain) -> Self {
        FrameChain(Some(Rc::new(FrameChainNode { frame, parent })))
    }

    fn car(&self) -> Rc<RefCell<Frame>> {
        self.0.as_ref().expect("empty frame chain").frame.clone()
    }

    fn cdr(&self) -> FrameChain {
        self.0.as_ref().expect("empty frame chain").parent.clone()
    }

    fn is_root(&self) -> bool {
        matches!(&self.0, Some(node) if node.parent.0.is_none())
    }
}

/// Forks the frame chain. Returns `(new_chain, captured_chain)`: execution
/// continues on `new_chain`; `captured_chain` is frozen and becomes a
/// continuation's payload.
fn fork(chain: &FrameChain) -> (FrameChain, FrameChain) {
    let top = chain.car();
    let parent = chain.cdr();
    if chain.is_root() {
        let cloned = Rc::new(RefCell::new(top.borrow().clone_for_fork()));
        let new_chain = FrameChain::cons(cloned, FrameChain::empty());
        (new_chain, chain.clone())
    } else {
        parent.car().borrow_mut().to_be_forked = true;
        let cloned = Rc::new(RefCell::new(top.borrow().clone_for_fork()));
        let new_chain = FrameChain::cons(cloned, parent);
        (new_chain, chain.clone())
    }
}

/// A first-class continuation: a frozen frame chain captured at a
/// `call/cc` site.
pub struct ContinuationSnapshot {
    frames: FrameChain,
}

/// Builds the upvalue vector for a closure being constructed from `proto`
/// against the frame that is current at `BUILD_CLOSURE` time.
fn build_upvalues(proto: &Rc<FunctionProto>, current: &Rc<RefCell<Frame>>) -> Vec<Rc<Upvalue>> {
    let descriptors = proto.upvalue_descriptors.borrow();
    let mut result = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors.iter() {
        let upvalue = match *descriptor {
            UpvalueDescriptor::Local { slot, scope_depth } => Upvalue::open_local(current.clone(), slot, scope_depth),
            // The rest parameter lives in the function's own root scope,
            // which `let` never targets with an explicit `CLOSE_UPVAR`; the
            // scope depth is only ever consulted for that instruction, so
            // any fixed placeholder is safe here.
            UpvalueDescriptor::Rest => Upvalue::open_rest(current.clone(), 0),
            UpvalueDescriptor::Outer(index) => current.borrow().upvalues[index].clone(),
        };
        if matches!(descriptor, UpvalueDescriptor::Local { .. } | UpvalueDescriptor::Rest) {
            current.borrow_mut().open_upvalues.push(upvalue.clone());
        }
        result.push(upvalue);
    }
    result
}

fn numeric_binop(op: u8, a: Value, b: Value) -> Result<Value, VmError> {
    use Value::*;
    let name = || binop::name(op).unwrap_or("?").to_string();
    match op {
        binop::ADD | binop::SUB | binop::MUL => match (&a, &b) {
            (Integer(x), Integer(y)) => Ok(Integer(match op {
                binop::ADD => x + y,
                binop::SUB => x - y,
                _ => x * y,
            })),
            (Integer(_) | Float(_), Integer(_) | Float(_)) => {
                let x = as_f64(&a).unwrap();
                let y = as_f64(&b).unwrap();
                Ok(Float(match op {
                    binop::ADD => x + y,
                    binop::SUB => x - y,
                    _ => x * y,
                }))
            }
            _ => Err(VmError::TypeMismatch { op: name(), detail: format!("expected numbers, got {} and {}", a.type_name(), b.type_name()) }),
        },
        binop::DIV => {
            let x = as_f64(&a).ok_or_else(|| VmError::TypeMismatch { op: name(), detail: format!("expected a number, got {}", a.type_name()) })?;
            let y = as_f64(&b).ok_or_else(|| VmError::TypeMismatch { op: name(), detail: format!("expected a number, got {}", b.type_name()) })?;
            Ok(Float(x / y))
        }
        binop::CONS => Ok(Value::cons(a, b)),
        binop::EQ => Ok(bool_value(a == b)),
        binop::GT => {
            let x = as_f64(&a).ok_or_else(|| VmError::TypeMismatch { op: name(), detail: format!("expected a number, got {}", a.type_name()) })?;
            let y = as_f64(&b).ok_or_else(|| VmError::TypeMismatch { op: name(), detail: format!("expected a number, got {}", b.type_name()) })?;
            Ok(bool_value(x > y))
        }
        other => Err(VmError::UnknownPrimitive { op_id: other }),
    }
}

fn numeric_unop(op: u8, a: Value) -> Result<Value, VmError> {
    match op {
        unop::NEG => match a {
            Value::Integer(n) => Ok(Value::Integer(-n)),
            Value::Float(n) => Ok(Value::Float(-n)),
            other => Err(VmError::TypeMismatch { op: "-".to_string(), detail: format!("expected a number, got {}", other.type_name()) }),
        },
        unop::CAR => match a.as_pair() {
            Some((head, _)) => Ok(head.clone()),
            None => Err(VmError::TypeMismatch { op: "car".to_string(), detail: format!("expected a pair, got {}", a.type_name()) }),
        },
        unop::CDR => match a.as_pair() {
            Some((_, tail)) => Ok(tail.clone()),
            None => Err(VmError::TypeMismatch { op: "cdr".to_string(), detail: format!("expected a pair, got {}", a.type_name()) }),
        },
        other => Err(VmError::UnknownPrimitive { op_id: other }),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

/// This value model has no dedicated boolean; `not`/comparisons encode
/// false as `Nil` and true as `Integer(1)`, matching the host prelude.
fn bool_value(b: bool) -> Value {
    if b {
        Value::Integer(1)
    } else {
        Value::Nil
    }
}

/// Interprets compiled bytecode against a constant pool and a host
/// environment.
pub struct VM {
    consts: ConstantPool,
    pub host: HostEnv,
    frames: FrameChain,
    trace: bool,
}

impl VM {
    pub fn new(consts: ConstantPool, host: HostEnv) -> Result<Self, VmError> {
        let entry = consts.entry_point().clone();
        let frame = Frame::new(entry, Vec::new(), Vec::new())?;
        let frames = FrameChain::cons(Rc::new(RefCell::new(frame)), FrameChain::empty());
        Ok(VM { consts, host, frames, trace: false })
    }

    pub fn turn_debug(&mut self, on: bool) {
        self.trace = on;
    }

    /// Runs the program to completion. Running past the end of the
    /// top-level prototype's instructions is ordinary termination, not an
    /// error; the result is whatever is left on the top-level frame's
    /// operand stack (`Undefined` if it is empty), which is the REPL's last
    /// evaluated value when the caller compiled without a trailing `POP`.
    pub fn start(&mut self) -> Result<Value, VmError> {
        let mut frame = self.frames.car();
        let mut pc: usize = 0;

        loop {
            let at_end = pc >= frame.borrow().proto.len();
            if at_end {
                return Ok(frame.borrow_mut().stack.pop().unwrap_or(Value::Undefined));
            }
            let inst = frame.borrow().proto.instructions.borrow()[pc];

            if self.trace {
                self.print_trace(&frame, pc, inst);
            }

            match inst.op {
                OpCode::LoadLocal => {
                    let slot = inst.operand as usize;
                    let value = frame.borrow().locals[slot].clone();
                    if matches!(value, Value::Undefined) {
                        return Err(VmError::UndefinedLocal { slot });
                    }
                    frame.borrow_mut().stack.push(value);
                }
                OpCode::SetLocal => {
                    let value = frame.borrow_mut().pop()?;
                    let slot = inst.operand as usize;
                    frame.borrow_mut().locals[slot] = value;
                }
                OpCode::LoadGlobal => {
                    let name = self.consts.value(inst.operand as usize);
                    let name = symbol_name(name);
                    let value = self.host.get(name).ok_or_else(|| VmError::UnboundGlobal { name: name.to_string() })?;
                    frame.borrow_mut().stack.push(value);
                }
                OpCode::SetGlobal => {
                    let value = frame.borrow_mut().pop()?;
                    let name = symbol_name(self.consts.value(inst.operand as usize));
                    self.host.set(name, value);
                }
                OpCode::LoadUpvar => {
                    let index = inst.operand as usize;
                    let value = frame.borrow().upvalues[index].get();
                    frame.borrow_mut().stack.push(value);
                }
                OpCode::SetUpvar => {
                    let value = frame.borrow_mut().pop()?;
                    let index = inst.operand as usize;
                    frame.borrow().upvalues[index].set(value);
                }
                OpCode::LoadVarg => {
                    let value = frame.borrow().varargs.clone().unwrap_or(Value::Nil);
                    frame.borrow_mut().stack.push(value);
                }
                OpCode::LoadConst => {
                    let value = self.consts.value(inst.operand as usize).clone();
                    frame.borrow_mut().stack.push(value);
                }
                OpCode::BinOp => {
                    let b = frame.borrow_mut().pop()?;
                    let a = frame.borrow_mut().pop()?;
                    let result = numeric_binop(inst.operand as u8, a, b)?;
                    frame.borrow_mut().stack.push(result);
                }
                OpCode::UnOp => {
                    let a = frame.borrow_mut().pop()?;
                    let result = numeric_unop(inst.operand as u8, a)?;
                    frame.borrow_mut().stack.push(result);
                }
                OpCode::Call => {
                    let argc = inst.operand as usize;
                    let args = pop_args(&frame, argc)?;
                    let callee = frame.borrow_mut().pop()?;
                    frame.borrow_mut().saved_pc = pc;
                    match self.dispatch_call(callee, args, &frame)? {
                        CallOutcome::Entered(new_frame) => {
                            self.frames = FrameChain::cons(new_frame, self.frames.clone());
                            frame = self.frames.car();
                            pc = 0;
                            continue;
                        }
                        CallOutcome::Resumed(new_frames, new_pc) => {
                            self.frames = new_frames;
                            frame = self.frames.car();
                            pc = new_pc;
                            continue;
                        }
                        CallOutcome::HostReturned(rets) => {
                            frame.borrow_mut().stack.extend(rets);
                        }
                    }
                }
                OpCode::TailCall => {
                    let argc = inst.operand as usize;
                    let args = pop_args(&frame, argc)?;
                    let callee = frame.borrow_mut().pop()?;
                    match self.dispatch_call(callee, args, &frame)? {
                        CallOutcome::Entered(new_frame) => {
                            self.frames = FrameChain::cons(new_frame, self.frames.cdr());
                            frame = self.frames.car();
                            pc = 0;
                            continue;
                        }
                        CallOutcome::Resumed(new_frames, new_pc) => {
                            self.frames = new_frames;
                            frame = self.frames.car();
                            pc = new_pc;
                            continue;
                        }
                        CallOutcome::HostReturned(rets) => {
                            frame.borrow_mut().stack.extend(rets);
                        }
                    }
                }
                OpCode::Ret => {
                    let n = inst.operand as usize;
                    let rets = {
                        let f = frame.borrow();
                        let len = f.stack.len();
                        f.stack[len - n..].to_vec()
                    };
                    close_upvars(&frame, None);
                    self.frames = self.frames.cdr();
                    if self.frames.car().borrow().to_be_forked {
                        let (new_chain, _old_chain) = fork(&self.frames);
                        self.frames = new_chain;
                    }
                    frame = self.frames.car();
                    pc = frame.borrow().saved_pc;
                    frame.borrow_mut().stack.extend(rets);
                    pc += 1;
                    continue;
                }
                OpCode::Jump => {
                    pc = (pc as i64 + inst.operand as i64) as usize;
                    continue;
                }
                OpCode::Test => {
                    let value = frame.borrow_mut().pop()?;
                    if !value.is_truthy() {
                        pc = (pc as i64 + inst.operand as i64) as usize;
                        continue;
                    }
                }
                OpCode::Pop => {
                    let k = inst.operand as usize;
                    let mut f = frame.borrow_mut();
                    for _ in 0..k {
                        f.pop()?;
                    }
                }
                OpCode::CloseUpvar => {
                    close_upvars(&frame, Some(inst.operand as usize));
                }
                OpCode::BuildClosure => {
                    let proto = self.consts.proto(inst.operand as usize).clone();
                    let upvalues = build_upvalues(&proto, &frame);
                    let closure = Value::Closure(Rc::new(Closure { proto, upvalues }));
                    frame.borrow_mut().stack.push(closure);
                }
                OpCode::BuildContinuation => {
                    // The frame that captured this continuation must resume
                    // *past* the `CALL 1` that follows (the join point of
                    // the enclosing `call/cc` form), not at it: invoking the
                    // continuation later delivers its argument as that
                    // call's result rather than re-entering it as a call.
                    let (new_chain, captured) = fork(&self.frames);
                    captured.car().borrow_mut().pop()?;
                    captured.car().borrow_mut().saved_pc = pc + 2;
                    self.frames = new_chain;
                    frame = self.frames.car();
                    frame.borrow_mut().stack.push(Value::Continuation(Rc::new(ContinuationSnapshot { frames: captured })));
                }
                OpCode::Halt => return Ok(frame.borrow_mut().stack.pop().unwrap_or(Value::Undefined)),
            }
            pc += 1;
        }
    }

    fn dispatch_call(&self, callee: Value, args: Vec<Value>, _current: &Rc<RefCell<Frame>>) -> Result<CallOutcome, VmError> {
        match callee {
            Value::Closure(closure) => {
                let new_frame = Frame::new(closure.proto.clone(), closure.upvalues.clone(), args)?;
                Ok(CallOutcome::Entered(Rc::new(RefCell::new(new_frame))))
            }
            Value::Continuation(cc) => {
                if args.len() != 1 {
                    return Err(VmError::ArityMismatch { expected: "1".to_string(), got: args.len() });
                }
                let frames = cc.frames.clone();
                let top = frames.car();
                let pc = top.borrow().saved_pc;
                top.borrow_mut().stack.extend(args);
                Ok(CallOutcome::Resumed(frames, pc))
            }
            Value::HostFn(f) => {
                let rets = f(&args)?;
                Ok(CallOutcome::HostReturned(rets))
            }
            other => Err(VmError::TypeMismatch { op: "call".to_string(), detail: format!("{} is not callable", other.type_name()) }),
        }
    }

    fn print_trace(&self, frame: &Rc<RefCell<Frame>>, pc: usize, inst: Instruction) {
        let comment = match inst.op {
            OpCode::LoadConst | OpCode::LoadGlobal | OpCode::SetGlobal => {
                format!(" # {}", self.consts.value(inst.operand as usize))
            }
            OpCode::BinOp => format!(" # {}", binop::name(inst.operand as u8).unwrap_or("?")),
            OpCode::UnOp => format!(" # {}", unop::name(inst.operand as u8).unwrap_or("?")),
            _ => String::new(),
        };
        eprintln!("{:04}: {} {}{}", pc, inst.op.mnemonic(), inst.operand, comment);
        let _ = frame;
    }
}

enum CallOutcome {
    Entered(Rc<RefCell<Frame>>),
    Resumed(FrameChain, usize),
    HostReturned(Vec<Value>),
}

fn pop_args(frame: &Rc<RefCell<Frame>>, argc: usize) -> Result<Vec<Value>, VmError> {
    let mut f = frame.borrow_mut();
    if f.stack.len() < argc {
        return Err(VmError::StackUnderflow { op: "call".to_string() });
    }
    let start = f.stack.len() - argc;
    Ok(f.stack.split_off(start))
}

fn symbol_name(value: &Value) -> &str {
    match value {
        Value::Symbol(s) => s,
        Value::Str(s) => s.as_str(),
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_stays_integer() {
        let result = numeric_binop(binop::ADD, Value::Integer(2), Value::Integer(3)).unwrap();
        assert_eq!(result, Value::Integer(5));
    }

    #[test]
    fn division_promotes_to_float() {
        let result = numeric_binop(binop::DIV, Value::Integer(6), Value::Integer(3)).unwrap();
        assert_eq!(result, Value::Float(2.0));
    }

    #[test]
    fn cons_car_cdr_round_trip() {
        let pair = numeric_binop(binop::CONS, Value::Integer(1), Value::Integer(2)).unwrap();
        assert_eq!(numeric_unop(unop::CAR, pair.clone()).unwrap(), Value::Integer(1));
        assert_eq!(numeric_unop(unop::CDR, pair).unwrap(), Value::Integer(2));
    }

    #[test]
    fn upvalue_closes_and_retains_value() {
        let proto = FunctionProto::new(1, false);
        let frame = Rc::new(RefCell::new(Frame::new(proto, Vec::new(), vec![Value::Integer(41)]).unwrap()));
        let upvalue = Upvalue::open_local(frame.clone(), 0, 0);
        frame.borrow_mut().locals[0] = Value::Integer(42);
        assert_eq!(upvalue.get(), Value::Integer(42));
        frame.borrow_mut().open_upvalues.push(upvalue.clone());
        close_upvars(&frame, None);
        frame.borrow_mut().locals[0] = Value::Integer(0);
        assert_eq!(upvalue.get(), Value::Integer(42));
    }
}
