//! Stack-based bytecode interpreter.
//!
//! One VM executes one script at a time on one thread. Host types are
//! dispatched through the shared registry; the per-execution invocation
//! context lives in the VM and is cleared after every run.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::codec;
use crate::compiler;
use crate::error::{ExecError, RuntimeError};
use crate::invocation::{self, Invocation};
use crate::opcode::{OpCode, MULTI};
use crate::proto::FunctionProto;
use crate::registry::{HostBinOp, HostCmpOp, TypeRegistry};
use crate::value::{
    Closure, Function, HostValue, NativeCtx, NativeFunction, Table, TableKey, Upvalue, Value,
};

const MAX_FRAMES: usize = 256;
const MAX_STACK: usize = 65_536;

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of the callee value; locals start one above it.
    base: usize,
    want: u8,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    /// Open upvalues ordered by stack slot.
    open_upvalues: Vec<(usize, Rc<std::cell::RefCell<Upvalue>>)>,
    registry: Arc<TypeRegistry>,
    invocation: Option<Invocation>,
    /// Result count of the most recent multi-value call.
    multi_count: usize,
}

impl Vm {
    pub fn new(registry: Arc<TypeRegistry>) -> Vm {
        let mut globals = HashMap::new();
        install_prelude(&mut globals);
        invocation::install(&mut globals);
        registry.install_all(&mut globals);
        Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            globals,
            open_upvalues: Vec::new(),
            registry,
            invocation: None,
            multi_count: 0,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Compiles and runs `source`, returning the `this.returns` list.
    pub fn run_source(
        &mut self,
        source: &str,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, ExecError> {
        let proto = compiler::compile(source, codec::SOURCE_NAME)?;
        Ok(self.run_proto(&proto, args)?)
    }

    /// Runs a decoded prototype, returning the `this.returns` list.
    pub fn run_proto(
        &mut self,
        proto: &FunctionProto,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>, RuntimeError> {
        self.reset();
        self.invocation = Some(Invocation::new(args));
        let function = Function::from_proto(proto);
        let closure = Rc::new(Closure {
            function,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Closure(closure.clone()));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
            want: 0,
        });
        let result = self.execute();
        let invocation = self.invocation.take();
        self.reset();
        result?;
        Ok(invocation.map(|i| i.returns).unwrap_or_default())
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.invocation = None;
        self.multi_count = 0;
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        let mut closure = self.frames.last().expect("frame pushed by caller").closure.clone();
        let mut ip = 0usize;
        let mut base = self.frames.last().expect("frame pushed by caller").base;

        macro_rules! fail {
            ($at:expr, $($arg:tt)*) => {
                return Err(RuntimeError::new(
                    closure.function.line_at($at),
                    format!($($arg)*),
                ))
            };
        }

        loop {
            let op_at = ip;
            let Some(&byte) = closure.function.code.get(ip) else {
                fail!(op_at, "bytecode ran off the end");
            };
            ip += 1;
            let Some(op) = OpCode::from_byte(byte) else {
                fail!(op_at, "invalid opcode {byte:#04x}");
            };
            match op {
                OpCode::Const => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let Some(value) = closure.function.constants.get(idx as usize) else {
                        fail!(op_at, "constant index {idx} out of range");
                    };
                    self.stack.push(value.clone());
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::GetLocal => {
                    let slot = read_u8(&closure.function.code, &mut ip) as usize;
                    let value = self.stack[base + 1 + slot].clone();
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = read_u8(&closure.function.code, &mut ip) as usize;
                    let value = self.stack.pop().unwrap_or(Value::Nil);
                    self.stack[base + 1 + slot] = value;
                }
                OpCode::GetGlobal => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let name = self.constant_name(&closure, idx, op_at)?;
                    let value = self.globals.get(&*name).cloned().unwrap_or(Value::Nil);
                    self.stack.push(value);
                }
                OpCode::SetGlobal => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let name = self.constant_name(&closure, idx, op_at)?;
                    let value = self.stack.pop().unwrap_or(Value::Nil);
                    if matches!(value, Value::Nil) {
                        self.globals.remove(&*name);
                    } else {
                        self.globals.insert(name.to_string(), value);
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = read_u8(&closure.function.code, &mut ip) as usize;
                    let cell = closure.upvalues[idx].clone();
                    let value = match &*cell.borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = read_u8(&closure.function.code, &mut ip) as usize;
                    let value = self.stack.pop().unwrap_or(Value::Nil);
                    let cell = closure.upvalues[idx].clone();
                    let slot = match &*cell.borrow() {
                        Upvalue::Open(slot) => Some(*slot),
                        Upvalue::Closed(_) => None,
                    };
                    match slot {
                        Some(slot) => self.stack[slot] = value,
                        None => *cell.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.stack.pop();
                }
                OpCode::NewTable => {
                    let npos = read_u8(&closure.function.code, &mut ip) as usize;
                    let nkeyed = read_u8(&closure.function.code, &mut ip) as usize;
                    let total = npos + nkeyed * 2;
                    let start = self.stack.len() - total;
                    let items: Vec<Value> = self.stack.drain(start..).collect();
                    let mut table = Table::new();
                    for (i, value) in items[..npos].iter().enumerate() {
                        table.set(TableKey::Int(i as i64 + 1), value.clone());
                    }
                    for pair in items[npos..].chunks(2) {
                        let Some(key) = TableKey::from_value(&pair[0]) else {
                            fail!(op_at, "invalid table key of type {}", pair[0].kind());
                        };
                        table.set(key, pair[1].clone());
                    }
                    self.stack.push(Value::table(table));
                }
                OpCode::GetIndex => {
                    let index = self.stack.pop().unwrap_or(Value::Nil);
                    let obj = self.stack.pop().unwrap_or(Value::Nil);
                    let value = self.index_value(&obj, &index, &closure, op_at)?;
                    self.stack.push(value);
                }
                OpCode::SetIndex => {
                    let value = self.stack.pop().unwrap_or(Value::Nil);
                    let index = self.stack.pop().unwrap_or(Value::Nil);
                    let obj = self.stack.pop().unwrap_or(Value::Nil);
                    self.set_index(&obj, &index, value, &closure, op_at)?;
                }
                OpCode::GetField => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let name = self.constant_name(&closure, idx, op_at)?;
                    let obj = self.stack.pop().unwrap_or(Value::Nil);
                    let key = Value::Str(name);
                    let value = self.index_value(&obj, &key, &closure, op_at)?;
                    self.stack.push(value);
                }
                OpCode::SetField => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let name = self.constant_name(&closure, idx, op_at)?;
                    let value = self.stack.pop().unwrap_or(Value::Nil);
                    let obj = self.stack.pop().unwrap_or(Value::Nil);
                    self.set_index(&obj, &Value::Str(name), value, &closure, op_at)?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow => {
                    let rhs = self.stack.pop().unwrap_or(Value::Nil);
                    let lhs = self.stack.pop().unwrap_or(Value::Nil);
                    let result = self.arith(op, &lhs, &rhs, &closure, op_at)?;
                    self.stack.push(result);
                }
                OpCode::Concat => {
                    let rhs = self.stack.pop().unwrap_or(Value::Nil);
                    let lhs = self.stack.pop().unwrap_or(Value::Nil);
                    let result = match (concat_part(&lhs), concat_part(&rhs)) {
                        (Some(a), Some(b)) => Value::string(format!("{a}{b}")),
                        _ => {
                            let bad = if concat_part(&lhs).is_none() { &lhs } else { &rhs };
                            fail!(op_at, "attempt to concatenate a {} value", bad.kind());
                        }
                    };
                    self.stack.push(result);
                }
                OpCode::Neg => {
                    let operand = self.stack.pop().unwrap_or(Value::Nil);
                    let result = match &operand {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                        Value::UserData(ud) => match self.registry.get(&ud.tag) {
                            Some(t) => t
                                .neg(&operand)
                                .map_err(|m| RuntimeError::new(closure.function.line_at(op_at), m))?,
                            None => fail!(op_at, "attempt to negate a {} value", operand.kind()),
                        },
                        _ => fail!(op_at, "attempt to negate a {} value", operand.kind()),
                    };
                    self.stack.push(result);
                }
                OpCode::Not => {
                    let operand = self.stack.pop().unwrap_or(Value::Nil);
                    self.stack.push(Value::Bool(!operand.is_truthy()));
                }
                OpCode::Len => {
                    let operand = self.stack.pop().unwrap_or(Value::Nil);
                    let result = match &operand {
                        Value::Str(s) => Value::Int(s.len() as i64),
                        Value::Table(t) => Value::Int(t.borrow().length()),
                        Value::UserData(ud) => match self.registry.get(&ud.tag) {
                            Some(t) => t
                                .len(&operand)
                                .map_err(|m| RuntimeError::new(closure.function.line_at(op_at), m))?,
                            None => fail!(op_at, "attempt to take length of a userdata value"),
                        },
                        _ => fail!(op_at, "attempt to take length of a {} value", operand.kind()),
                    };
                    self.stack.push(result);
                }
                OpCode::Eq | OpCode::NotEq => {
                    let rhs = self.stack.pop().unwrap_or(Value::Nil);
                    let lhs = self.stack.pop().unwrap_or(Value::Nil);
                    let equal = self.values_equal(&lhs, &rhs, &closure, op_at)?;
                    self.stack
                        .push(Value::Bool(if op == OpCode::Eq { equal } else { !equal }));
                }
                OpCode::Less | OpCode::LessEq | OpCode::Greater | OpCode::GreaterEq => {
                    let rhs = self.stack.pop().unwrap_or(Value::Nil);
                    let lhs = self.stack.pop().unwrap_or(Value::Nil);
                    let result = self.order(op, &lhs, &rhs, &closure, op_at)?;
                    self.stack.push(Value::Bool(result));
                }
                OpCode::Jump => {
                    let offset = read_i16(&closure.function.code, &mut ip);
                    ip = offset_ip(ip, offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = read_i16(&closure.function.code, &mut ip);
                    let cond = self.stack.pop().unwrap_or(Value::Nil);
                    if !cond.is_truthy() {
                        ip = offset_ip(ip, offset);
                    }
                }
                OpCode::JumpIfFalseKeep => {
                    let offset = read_i16(&closure.function.code, &mut ip);
                    let truthy = self.stack.last().map(Value::is_truthy).unwrap_or(false);
                    if !truthy {
                        ip = offset_ip(ip, offset);
                    }
                }
                OpCode::JumpIfTrueKeep => {
                    let offset = read_i16(&closure.function.code, &mut ip);
                    let truthy = self.stack.last().map(Value::is_truthy).unwrap_or(false);
                    if truthy {
                        ip = offset_ip(ip, offset);
                    }
                }
                OpCode::Loop => {
                    let offset = read_i16(&closure.function.code, &mut ip);
                    ip = offset_ip(ip, offset);
                }
                OpCode::Call | OpCode::CallSpread => {
                    let fixed = read_u8(&closure.function.code, &mut ip) as usize;
                    let want = read_u8(&closure.function.code, &mut ip);
                    let argc = if op == OpCode::CallSpread {
                        let extra = self.multi_count;
                        self.multi_count = 0;
                        fixed + extra
                    } else {
                        fixed
                    };
                    let callee_index = self.stack.len() - 1 - argc;
                    if self.enter_call(callee_index, argc, want, &mut closure, &mut ip, &mut base, op_at)? {
                        continue;
                    }
                }
                OpCode::Invoke => {
                    let idx = read_u16(&closure.function.code, &mut ip);
                    let argc = read_u8(&closure.function.code, &mut ip) as usize;
                    let want = read_u8(&closure.function.code, &mut ip);
                    let name = self.constant_name(&closure, idx, op_at)?;
                    let recv_index = self.stack.len() - 1 - argc;
                    let recv = self.stack[recv_index].clone();
                    match &recv {
                        Value::Table(table) => {
                            let method = table.borrow().get(&TableKey::Str(name.to_string()));
                            if matches!(method, Value::Nil) {
                                fail!(op_at, "attempt to call missing method '{name}'");
                            }
                            self.stack.insert(recv_index, method);
                            if self.enter_call(
                                recv_index,
                                argc + 1,
                                want,
                                &mut closure,
                                &mut ip,
                                &mut base,
                                op_at,
                            )? {
                                continue;
                            }
                        }
                        Value::UserData(ud) => {
                            let Some(host_type) = self.registry.get(&ud.tag) else {
                                fail!(op_at, "unknown host type '{}'", ud.tag);
                            };
                            let args: Vec<Value> = self.stack.drain(recv_index + 1..).collect();
                            self.stack.truncate(recv_index);
                            let results = host_type
                                .call_method(&name, &recv, &args)
                                .map_err(|m| RuntimeError::new(closure.function.line_at(op_at), m))?;
                            self.push_results(results, want);
                        }
                        other => {
                            fail!(op_at, "attempt to call method '{name}' on a {} value", other.kind());
                        }
                    }
                }
                OpCode::Closure => {
                    let idx = read_u16(&closure.function.code, &mut ip) as usize;
                    let Some(proto) = closure.function.protos.get(idx).cloned() else {
                        fail!(op_at, "function prototype {idx} out of range");
                    };
                    let mut upvalues = Vec::with_capacity(proto.num_upvalues as usize);
                    for _ in 0..proto.num_upvalues {
                        let is_local = read_u8(&closure.function.code, &mut ip) != 0;
                        let index = read_u8(&closure.function.code, &mut ip) as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + 1 + index));
                        } else {
                            upvalues.push(closure.upvalues[index].clone());
                        }
                    }
                    self.stack.push(Value::Closure(Rc::new(Closure {
                        function: proto,
                        upvalues,
                    })));
                }
                OpCode::Return => {
                    let count = read_u8(&closure.function.code, &mut ip);
                    let n = if count == MULTI {
                        let n = self.multi_count;
                        self.multi_count = 0;
                        n
                    } else {
                        count as usize
                    };
                    let results: Vec<Value> = self.stack.split_off(self.stack.len() - n);
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    let frame = self.frames.pop().expect("returning from a live frame");
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push_results(results, frame.want);
                    let top = self.frames.last().expect("checked non-empty");
                    closure = top.closure.clone();
                    ip = top.ip;
                    base = top.base;
                }
                OpCode::ForPrep => {
                    let slot = read_u8(&closure.function.code, &mut ip) as usize;
                    let offset = read_i16(&closure.function.code, &mut ip);
                    let abs = base + 1 + slot;
                    let (control, limit, step) = self.for_numbers(abs, &closure, op_at)?;
                    if step_is_zero(&step) {
                        fail!(op_at, "'for' step is zero");
                    }
                    if for_in_range(&control, &limit, &step) {
                        self.stack[abs + 3] = control;
                    } else {
                        ip = offset_ip(ip, offset);
                    }
                }
                OpCode::ForLoop => {
                    let slot = read_u8(&closure.function.code, &mut ip) as usize;
                    let offset = read_i16(&closure.function.code, &mut ip);
                    let abs = base + 1 + slot;
                    let (control, limit, step) = self.for_numbers(abs, &closure, op_at)?;
                    let next = numeric_add(&control, &step);
                    if for_in_range(&next, &limit, &step) {
                        self.stack[abs] = next.clone();
                        self.stack[abs + 3] = next;
                        ip = offset_ip(ip, offset);
                    }
                }
            }
        }
    }

    /// Begins a call at `callee_index`. Returns true when a new script frame
    /// was entered (the caller's cached state has been switched).
    #[allow(clippy::too_many_arguments)]
    fn enter_call(
        &mut self,
        callee_index: usize,
        argc: usize,
        want: u8,
        closure: &mut Rc<Closure>,
        ip: &mut usize,
        base: &mut usize,
        op_at: usize,
    ) -> Result<bool, RuntimeError> {
        let callee = self.stack[callee_index].clone();
        match callee {
            Value::Closure(target) => {
                if self.frames.len() >= MAX_FRAMES {
                    return Err(RuntimeError::new(
                        closure.function.line_at(op_at),
                        "call stack overflow",
                    ));
                }
                if self.stack.len() >= MAX_STACK {
                    return Err(RuntimeError::new(
                        closure.function.line_at(op_at),
                        "value stack overflow",
                    ));
                }
                let expected = target.function.num_params as usize;
                let mut actual = argc;
                while actual < expected {
                    self.stack.push(Value::Nil);
                    actual += 1;
                }
                while actual > expected {
                    self.stack.pop();
                    actual -= 1;
                }
                self.frames.last_mut().expect("caller frame exists").ip = *ip;
                self.frames.push(CallFrame {
                    closure: target.clone(),
                    ip: 0,
                    base: callee_index,
                    want,
                });
                *closure = target;
                *ip = 0;
                *base = callee_index;
                Ok(true)
            }
            Value::Native(native) => {
                let args: Vec<Value> = self.stack.drain(callee_index + 1..).collect();
                self.stack.truncate(callee_index);
                let results = self
                    .call_native(&native, &args)
                    .map_err(|m| RuntimeError::new(closure.function.line_at(op_at), m))?;
                self.push_results(results, want);
                Ok(false)
            }
            other => Err(RuntimeError::new(
                closure.function.line_at(op_at),
                format!("attempt to call a {} value", other.kind()),
            )),
        }
    }

    fn call_native(
        &mut self,
        native: &NativeFunction,
        args: &[Value],
    ) -> Result<Vec<Value>, String> {
        let mut ctx = NativeCtx {
            invocation: &mut self.invocation,
            registry: &self.registry,
        };
        (native.func)(&mut ctx, args)
    }

    fn push_results(&mut self, mut results: Vec<Value>, want: u8) {
        if want == MULTI {
            self.multi_count = results.len();
            self.stack.append(&mut results);
        } else {
            results.resize(want as usize, Value::Nil);
            self.stack.append(&mut results);
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> Rc<std::cell::RefCell<Upvalue>> {
        if let Some((_, cell)) = self.open_upvalues.iter().find(|(s, _)| *s == slot) {
            return cell.clone();
        }
        let cell = Rc::new(std::cell::RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.push((slot, cell.clone()));
        cell
    }

    /// Closes every open upvalue at or above `from`.
    fn close_upvalues(&mut self, from: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for (slot, cell) in self.open_upvalues.drain(..) {
            if slot >= from {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
                *cell.borrow_mut() = Upvalue::Closed(value);
            } else {
                remaining.push((slot, cell));
            }
        }
        self.open_upvalues = remaining;
    }

    fn constant_name(
        &self,
        closure: &Rc<Closure>,
        idx: u16,
        op_at: usize,
    ) -> Result<Rc<str>, RuntimeError> {
        match closure.function.constants.get(idx as usize) {
            Some(Value::Str(s)) => Ok(s.clone()),
            _ => Err(RuntimeError::new(
                closure.function.line_at(op_at),
                format!("constant {idx} is not a name"),
            )),
        }
    }

    fn index_value(
        &self,
        obj: &Value,
        index: &Value,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<Value, RuntimeError> {
        match obj {
            Value::Table(table) => match TableKey::from_value(index) {
                Some(key) => Ok(table.borrow().get(&key)),
                None => Err(RuntimeError::new(
                    closure.function.line_at(op_at),
                    format!("invalid table key of type {}", index.kind()),
                )),
            },
            other => Err(RuntimeError::new(
                closure.function.line_at(op_at),
                format!("attempt to index a {} value", other.kind()),
            )),
        }
    }

    fn set_index(
        &self,
        obj: &Value,
        index: &Value,
        value: Value,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<(), RuntimeError> {
        match obj {
            Value::Table(table) => match TableKey::from_value(index) {
                Some(key) => {
                    table.borrow_mut().set(key, value);
                    Ok(())
                }
                None => Err(RuntimeError::new(
                    closure.function.line_at(op_at),
                    format!("invalid table key of type {}", index.kind()),
                )),
            },
            other => Err(RuntimeError::new(
                closure.function.line_at(op_at),
                format!("attempt to index a {} value", other.kind()),
            )),
        }
    }

    fn arith(
        &self,
        op: OpCode,
        lhs: &Value,
        rhs: &Value,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<Value, RuntimeError> {
        let line = closure.function.line_at(op_at);
        if let Some(host_op) = host_bin_op(op) {
            let tag = match (lhs, rhs) {
                (Value::UserData(ud), _) => Some(ud.tag.clone()),
                (_, Value::UserData(ud)) => Some(ud.tag.clone()),
                _ => None,
            };
            if let Some(tag) = tag {
                let Some(host_type) = self.registry.get(&tag) else {
                    return Err(RuntimeError::new(line, format!("unknown host type '{tag}'")));
                };
                return host_type
                    .binary(host_op, lhs, rhs)
                    .map_err(|m| RuntimeError::new(line, m));
            }
        }
        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                OpCode::Add => Value::Int(a.wrapping_add(*b)),
                OpCode::Sub => Value::Int(a.wrapping_sub(*b)),
                OpCode::Mul => Value::Int(a.wrapping_mul(*b)),
                OpCode::Div => Value::Float(*a as f64 / *b as f64),
                OpCode::Mod => {
                    if *b == 0 {
                        return Err(RuntimeError::new(line, "attempt to take modulo by zero"));
                    }
                    // Floored modulo; the sign follows the divisor, matching
                    // the float path below.
                    let r = a.wrapping_rem(*b);
                    Value::Int(if r != 0 && (r < 0) != (*b < 0) { r + *b } else { r })
                }
                OpCode::Pow => Value::Float((*a as f64).powf(*b as f64)),
                _ => unreachable!("arith only handles arithmetic opcodes"),
            },
            _ => {
                let (Some(a), Some(b)) = (numeric(lhs), numeric(rhs)) else {
                    let bad = if numeric(lhs).is_none() { lhs } else { rhs };
                    return Err(RuntimeError::new(
                        line,
                        format!("attempt to perform arithmetic on a {} value", bad.kind()),
                    ));
                };
                match op {
                    OpCode::Add => Value::Float(a + b),
                    OpCode::Sub => Value::Float(a - b),
                    OpCode::Mul => Value::Float(a * b),
                    OpCode::Div => Value::Float(a / b),
                    OpCode::Mod => Value::Float(a - (a / b).floor() * b),
                    OpCode::Pow => Value::Float(a.powf(b)),
                    _ => unreachable!("arith only handles arithmetic opcodes"),
                }
            }
        };
        Ok(result)
    }

    fn values_equal(
        &self,
        lhs: &Value,
        rhs: &Value,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<bool, RuntimeError> {
        let equal = match (lhs, rhs) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(&a.func, &b.func),
            (Value::UserData(a), Value::UserData(b)) if a.tag == b.tag => {
                match self.registry.get(&a.tag) {
                    Some(host_type) => host_type
                        .compare(HostCmpOp::Eq, lhs, rhs)
                        .map_err(|m| RuntimeError::new(closure.function.line_at(op_at), m))?,
                    None => Rc::ptr_eq(a, b),
                }
            }
            _ => false,
        };
        Ok(equal)
    }

    fn order(
        &self,
        op: OpCode,
        lhs: &Value,
        rhs: &Value,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<bool, RuntimeError> {
        let line = closure.function.line_at(op_at);
        // a > b is b < a; a >= b is b <= a.
        let (lhs, rhs, cmp) = match op {
            OpCode::Less => (lhs, rhs, HostCmpOp::Lt),
            OpCode::LessEq => (lhs, rhs, HostCmpOp::Le),
            OpCode::Greater => (rhs, lhs, HostCmpOp::Lt),
            OpCode::GreaterEq => (rhs, lhs, HostCmpOp::Le),
            _ => unreachable!("order only handles comparison opcodes"),
        };
        if matches!(lhs, Value::UserData(_)) || matches!(rhs, Value::UserData(_)) {
            let tag = match (lhs, rhs) {
                (Value::UserData(ud), _) => ud.tag.clone(),
                (_, Value::UserData(ud)) => ud.tag.clone(),
                _ => unreachable!("guarded by matches! above"),
            };
            let Some(host_type) = self.registry.get(&tag) else {
                return Err(RuntimeError::new(line, format!("unknown host type '{tag}'")));
            };
            return host_type
                .compare(cmp, lhs, rhs)
                .map_err(|m| RuntimeError::new(line, m));
        }
        match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(match cmp {
                HostCmpOp::Lt => a < b,
                HostCmpOp::Le => a <= b,
                HostCmpOp::Eq => a == b,
            }),
            _ => match (numeric(lhs), numeric(rhs)) {
                (Some(a), Some(b)) => Ok(match cmp {
                    HostCmpOp::Lt => a < b,
                    HostCmpOp::Le => a <= b,
                    HostCmpOp::Eq => a == b,
                }),
                _ => Err(RuntimeError::new(
                    line,
                    format!("attempt to compare {} with {}", lhs.kind(), rhs.kind()),
                )),
            },
        }
    }

    fn for_numbers(
        &self,
        abs: usize,
        closure: &Rc<Closure>,
        op_at: usize,
    ) -> Result<(Value, Value, Value), RuntimeError> {
        let line = closure.function.line_at(op_at);
        let check = |v: &Value, what: &str| -> Result<Value, RuntimeError> {
            match v {
                Value::Int(_) | Value::Float(_) => Ok(v.clone()),
                other => Err(RuntimeError::new(
                    line,
                    format!("'for' {what} must be a number, got {}", other.kind()),
                )),
            }
        };
        Ok((
            check(&self.stack[abs], "initial value")?,
            check(&self.stack[abs + 1], "limit")?,
            check(&self.stack[abs + 2], "step")?,
        ))
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> u8 {
    let byte = code.get(*ip).copied().unwrap_or(0);
    *ip += 1;
    byte
}

fn read_u16(code: &[u8], ip: &mut usize) -> u16 {
    let low = code.get(*ip).copied().unwrap_or(0) as u16;
    let high = code.get(*ip + 1).copied().unwrap_or(0) as u16;
    *ip += 2;
    low | (high << 8)
}

fn read_i16(code: &[u8], ip: &mut usize) -> i16 {
    read_u16(code, ip) as i16
}

fn offset_ip(ip: usize, offset: i16) -> usize {
    (ip as isize + offset as isize) as usize
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric_add(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
        _ => Value::Float(numeric(a).unwrap_or(0.0) + numeric(b).unwrap_or(0.0)),
    }
}

fn step_is_zero(step: &Value) -> bool {
    matches!(step, Value::Int(0)) || matches!(step, Value::Float(f) if *f == 0.0)
}

fn for_in_range(control: &Value, limit: &Value, step: &Value) -> bool {
    let (c, l) = (
        numeric(control).unwrap_or(0.0),
        numeric(limit).unwrap_or(0.0),
    );
    if numeric(step).unwrap_or(0.0) > 0.0 {
        c <= l
    } else {
        c >= l
    }
}

fn host_bin_op(op: OpCode) -> Option<HostBinOp> {
    match op {
        OpCode::Add => Some(HostBinOp::Add),
        OpCode::Sub => Some(HostBinOp::Sub),
        OpCode::Mul => Some(HostBinOp::Mul),
        OpCode::Div => Some(HostBinOp::Div),
        OpCode::Mod => Some(HostBinOp::Mod),
        OpCode::Pow => Some(HostBinOp::Pow),
        _ => None,
    }
}

fn concat_part(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.to_string()),
        Value::Int(_) | Value::Float(_) => Some(value.to_string()),
        _ => None,
    }
}

fn install_prelude(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "print".to_string(),
        Value::Native(NativeFunction::new("print", |ctx, args| {
            let parts: Vec<String> = args
                .iter()
                .map(|v| display_value(v, ctx.registry))
                .collect();
            tracing::info!(target: "script", "{}", parts.join("\t"));
            Ok(vec![])
        })),
    );
    globals.insert(
        "tostring".to_string(),
        Value::Native(NativeFunction::new("tostring", |ctx, args| {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            Ok(vec![Value::string(display_value(&value, ctx.registry))])
        })),
    );
    globals.insert(
        "type".to_string(),
        Value::Native(NativeFunction::new("type", |_ctx, args| {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            Ok(vec![Value::string(value.kind())])
        })),
    );
    globals.insert(
        "error".to_string(),
        Value::Native(NativeFunction::new("error", |ctx, args| {
            let message = args
                .first()
                .map(|v| display_value(v, ctx.registry))
                .unwrap_or_else(|| "error".to_string());
            Err(message)
        })),
    );
}

fn display_value(value: &Value, registry: &TypeRegistry) -> String {
    if let Value::UserData(ud) = value {
        if let Some(host_type) = registry.get(&ud.tag) {
            return host_type.to_display(ud);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, args: Vec<HostValue>) -> Result<Vec<HostValue>, ExecError> {
        let mut vm = Vm::new(TypeRegistry::with_defaults());
        vm.run_source(source, args)
    }

    fn run_ok(source: &str, args: Vec<HostValue>) -> Vec<HostValue> {
        run(source, args).expect("script should succeed")
    }

    #[test]
    fn adds_two_arguments() {
        let out = run_ok(
            "this.returns(this.argv(1) + this.argv(2))",
            vec![HostValue::Int(2), HostValue::Int(3)],
        );
        assert_eq!(out, vec![HostValue::Int(5)]);
    }

    #[test]
    fn locals_and_arithmetic() {
        let out = run_ok(
            "local a = 7\nlocal b = a * 3 - 1\nthis.returns(b, a / 2, 7 % 3, 2 ^ 10)",
            vec![],
        );
        assert_eq!(
            out,
            vec![
                HostValue::Int(20),
                HostValue::Float(3.5),
                HostValue::Int(1),
                HostValue::Float(1024.0),
            ]
        );
    }

    #[test]
    fn modulo_sign_follows_the_divisor() {
        let out = run_ok(
            "this.returns(5 % -3, -5 % 3, 5.0 % -3.0, -5.0 % 3.0, 5 % 3)",
            vec![],
        );
        assert_eq!(
            out,
            vec![
                HostValue::Int(-1),
                HostValue::Int(1),
                HostValue::Float(-1.0),
                HostValue::Float(1.0),
                HostValue::Int(2),
            ]
        );
    }

    #[test]
    fn control_flow_and_loops() {
        let out = run_ok(
            r#"
            local total = 0
            for i = 1, 10 do
                if i % 2 == 0 then
                    total = total + i
                end
            end
            local n = 0
            while true do
                n = n + 1
                if n >= 3 then break end
            end
            this.returns(total, n)
            "#,
            vec![],
        );
        assert_eq!(out, vec![HostValue::Int(30), HostValue::Int(3)]);
    }

    #[test]
    fn for_loop_with_negative_step() {
        let out = run_ok(
            "local acc = 0\nfor i = 5, 1, -2 do acc = acc + i end\nthis.returns(acc)",
            vec![],
        );
        assert_eq!(out, vec![HostValue::Int(9)]);
    }

    #[test]
    fn functions_and_recursion() {
        let out = run_ok(
            r#"
            local function fib(n)
                if n < 2 then return n end
                return fib(n - 1) + fib(n - 2)
            end
            this.returns(fib(10))
            "#,
            vec![],
        );
        assert_eq!(out, vec![HostValue::Int(55)]);
    }

    #[test]
    fn closures_capture_upvalues() {
        let out = run_ok(
            r#"
            local function counter()
                local n = 0
                return function()
                    n = n + 1
                    return n
                end
            end
            local tick = counter()
            tick()
            tick()
            this.returns(tick())
            "#,
            vec![],
        );
        assert_eq!(out, vec![HostValue::Int(3)]);
    }

    #[test]
    fn tables_and_method_calls() {
        let out = run_ok(
            r#"
            local obj = { base = 10 }
            function obj:bump(n)
                self.base = self.base + n
                return self.base
            end
            obj:bump(5)
            this.returns(obj:bump(1), obj.base, #"hello")
            "#,
            vec![],
        );
        assert_eq!(
            out,
            vec![HostValue::Int(16), HostValue::Int(16), HostValue::Int(5)]
        );
    }

    #[test]
    fn argv_spread_forwards_all_inputs() {
        let out = run_ok(
            "this.returns(this.argv())",
            vec![
                HostValue::Int(1),
                HostValue::Str("two".into()),
                HostValue::Bool(true),
            ],
        );
        assert_eq!(
            out,
            vec![
                HostValue::Int(1),
                HostValue::Str("two".into()),
                HostValue::Bool(true),
            ]
        );
    }

    #[test]
    fn table_returns_become_maps() {
        let out = run_ok(
            r#"this.returns({ name = "unit", count = 2 })"#,
            vec![],
        );
        let HostValue::Map(map) = &out[0] else {
            panic!("expected map, got {:?}", out);
        };
        assert_eq!(map.get("name"), Some(&HostValue::Str("unit".into())));
        assert_eq!(map.get("count"), Some(&HostValue::Int(2)));
    }

    #[test]
    fn short_circuit_yields_operands() {
        let out = run_ok(
            "this.returns(nil or 5, false and 1, 2 and 3)",
            vec![],
        );
        assert_eq!(
            out,
            vec![HostValue::Int(5), HostValue::Bool(false), HostValue::Int(3)]
        );
    }

    #[test]
    fn string_ops() {
        let out = run_ok(
            r#"this.returns("a" .. "b" .. 1, "abc" < "abd")"#,
            vec![],
        );
        assert_eq!(
            out,
            vec![HostValue::Str("ab1".into()), HostValue::Bool(true)]
        );
    }

    #[test]
    fn runtime_error_carries_line() {
        let err = run("local a = 1\nlocal b = a + {}", vec![]).unwrap_err();
        let ExecError::Runtime(err) = err else {
            panic!("expected runtime error, got {err}");
        };
        assert_eq!(err.line, 2);
        assert!(err.message.contains("arithmetic"));
    }

    #[test]
    fn calling_nil_fails_cleanly() {
        let err = run("missing()", vec![]).unwrap_err();
        let ExecError::Runtime(err) = err else {
            panic!("expected runtime error");
        };
        assert!(err.message.contains("attempt to call a nil value"));
    }

    #[test]
    fn explicit_error_builtin() {
        let err = run(r#"error("boom")"#, vec![]).unwrap_err();
        let ExecError::Runtime(err) = err else {
            panic!("expected runtime error");
        };
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn deep_recursion_overflows_frames_not_process() {
        let err = run("local function f() return f() end\nf()", vec![]).unwrap_err();
        let ExecError::Runtime(err) = err else {
            panic!("expected runtime error");
        };
        assert!(err.message.contains("overflow"));
    }

    #[test]
    fn invocation_is_cleared_between_runs() {
        let mut vm = Vm::new(TypeRegistry::with_defaults());
        let out = vm
            .run_source("this.returns(this.argc())", vec![HostValue::Int(1)])
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(1)]);
        let out = vm.run_source("this.returns(this.argc())", vec![]).unwrap();
        assert_eq!(out, vec![HostValue::Int(0)]);
    }

    #[test]
    fn run_proto_matches_run_source() {
        let source = "this.returns(this.argv(1) * 2)";
        let blob = codec::compile(source).unwrap();
        let proto = codec::load(&blob).unwrap();
        let mut vm = Vm::new(TypeRegistry::with_defaults());
        let direct = vm.run_source(source, vec![HostValue::Int(21)]).unwrap();
        let loaded = vm.run_proto(&proto, vec![HostValue::Int(21)]).unwrap();
        assert_eq!(direct, loaded);
        assert_eq!(loaded, vec![HostValue::Int(42)]);
    }
}
