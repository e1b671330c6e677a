//! Runtime values.
//!
//! Values are single-threaded (`Rc`); a VM and everything it allocates stay
//! on one worker thread. The [`HostValue`] algebra is the Send-able
//! marshalling boundary between scripts and the host.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::proto::{Constant, FunctionProto};

#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Table(Rc<RefCell<Table>>),
    Closure(Rc<Closure>),
    Native(NativeFunction),
    UserData(Rc<UserData>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Rc::from(s.into().into_boxed_str()))
    }

    pub fn table(t: Table) -> Value {
        Value::Table(Rc::new(RefCell::new(t)))
    }

    /// Human-readable kind tag used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::Native(_) => "function",
            Value::UserData(_) => "userdata",
        }
    }

    /// Only `nil` and `false` are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Value::Str(s) => write!(f, "{s}"),
            Value::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Value::Closure(c) => write!(f, "function: {:p}", Rc::as_ptr(c)),
            Value::Native(n) => write!(f, "function: builtin '{}'", n.name),
            Value::UserData(u) => write!(f, "{}: {:p}", u.tag, Rc::as_ptr(u)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self} ({})", self.kind())
    }
}

/// Table keys are the comparable scalar subset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl TableKey {
    pub fn from_value(value: &Value) -> Option<TableKey> {
        match value {
            Value::Int(i) => Some(TableKey::Int(*i)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(TableKey::Int(*f as i64)),
            Value::Str(s) => Some(TableKey::Str(s.to_string())),
            Value::Bool(b) => Some(TableKey::Bool(*b)),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            TableKey::Int(i) => i.to_string(),
            TableKey::Str(s) => s.clone(),
            TableKey::Bool(b) => b.to_string(),
        }
    }
}

/// Insertion-ordered table.
#[derive(Debug, Default)]
pub struct Table {
    pub entries: IndexMap<TableKey, Value>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn get(&self, key: &TableKey) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: TableKey, value: Value) {
        if matches!(value, Value::Nil) {
            self.entries.shift_remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    /// Appends under the next free 1-based integer key.
    pub fn append(&mut self, value: Value) {
        let mut next = 1i64;
        while self.entries.contains_key(&TableKey::Int(next)) {
            next += 1;
        }
        self.set(TableKey::Int(next), value);
    }

    /// Border length: the count of consecutive integer keys from 1.
    pub fn length(&self) -> i64 {
        let mut n = 0i64;
        while self.entries.contains_key(&TableKey::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

/// Runtime function interned from a prototype: constants are converted once,
/// nested protos become shared children.
pub struct Function {
    pub num_params: u8,
    pub num_upvalues: u8,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub protos: Vec<Rc<Function>>,
    pub lines: Vec<(u32, u32)>,
    pub source_name: String,
}

impl Function {
    pub fn from_proto(proto: &FunctionProto) -> Rc<Function> {
        let constants = proto
            .constants
            .iter()
            .map(|c| match c {
                Constant::Nil => Value::Nil,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::string(s.clone()),
            })
            .collect();
        let protos = proto.protos.iter().map(Function::from_proto).collect();
        Rc::new(Function {
            num_params: proto.num_params,
            num_upvalues: proto.num_upvalues,
            code: proto.code.clone(),
            constants,
            protos,
            lines: proto.lines.clone(),
            source_name: proto.source_name.clone(),
        })
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        let mut covered = 0usize;
        for (line, count) in &self.lines {
            covered += *count as usize;
            if offset < covered {
                return *line;
            }
        }
        self.lines.last().map_or(0, |(line, _)| *line)
    }
}

pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

#[derive(Debug)]
pub enum Upvalue {
    /// Still lives on the value stack at this absolute slot.
    Open(usize),
    Closed(Value),
}

/// A host function callable from scripts. The closure may capture host state
/// (resolvers, shared registries); it lives on the VM's thread.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    #[allow(clippy::type_complexity)]
    pub func: Rc<dyn Fn(&mut NativeCtx<'_>, &[Value]) -> Result<Vec<Value>, String>>,
}

impl NativeFunction {
    pub fn new(
        name: &'static str,
        func: impl Fn(&mut NativeCtx<'_>, &[Value]) -> Result<Vec<Value>, String> + 'static,
    ) -> NativeFunction {
        NativeFunction {
            name,
            func: Rc::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "builtin '{}'", self.name)
    }
}

/// Context handed to native functions.
pub struct NativeCtx<'a> {
    pub invocation: &'a mut Option<crate::invocation::Invocation>,
    pub registry: &'a crate::registry::TypeRegistry,
}

/// Typed host payload with its registry tag.
pub struct UserData {
    pub tag: String,
    pub value: Box<dyn Any>,
}

impl UserData {
    pub fn new<T: Any>(tag: impl Into<String>, value: T) -> Rc<UserData> {
        Rc::new(UserData {
            tag: tag.into(),
            value: Box::new(value),
        })
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

/// The Send-able boundary algebra between scripts and the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Map(IndexMap<String, HostValue>),
}

impl HostValue {
    /// Converts an input argument into a script value. Byte payloads surface
    /// as strings, matching the script language's string-of-bytes model.
    pub fn to_value(&self) -> Value {
        match self {
            HostValue::Nil => Value::Nil,
            HostValue::Bool(b) => Value::Bool(*b),
            HostValue::Int(i) => Value::Int(*i),
            HostValue::Float(f) => Value::Float(*f),
            HostValue::Str(s) => Value::string(s.clone()),
            HostValue::Bytes(b) => Value::string(String::from_utf8_lossy(b).into_owned()),
            HostValue::Map(entries) => {
                let mut table = Table::new();
                for (key, value) in entries {
                    table.set(TableKey::Str(key.clone()), value.to_value());
                }
                Value::table(table)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn table_length_counts_consecutive_keys() {
        let mut t = Table::new();
        t.append(Value::Int(10));
        t.append(Value::Int(20));
        t.set(TableKey::Int(5), Value::Int(50));
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn nil_assignment_removes_entries() {
        let mut t = Table::new();
        t.set(TableKey::Str("k".into()), Value::Int(1));
        t.set(TableKey::Str("k".into()), Value::Nil);
        assert_eq!(t.entries.len(), 0);
    }

    #[test]
    fn host_map_becomes_string_keyed_table() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), HostValue::Int(1));
        let value = HostValue::Map(map).to_value();
        let Value::Table(t) = value else {
            panic!("expected table");
        };
        assert!(matches!(
            t.borrow().get(&TableKey::Str("a".into())),
            Value::Int(1)
        ));
    }
}
