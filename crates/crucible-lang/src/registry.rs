//! Host type registry.
//!
//! Host-side types expose operator-style APIs to scripts and convert script
//! user-data back into canonical host values. The registry is owned by the
//! pool and handed to every VM at construction; it is never ambient global
//! state. Registration is idempotent by name (first wins) and safe to call
//! at runtime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::value::{HostValue, UserData, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCmpOp {
    Eq,
    Lt,
    Le,
}

/// Descriptor wiring a host type into VMs.
///
/// Defaults reject every operation; types override what they support.
pub trait HostType: Send + Sync {
    /// Stable tag stored on every user-data instance of this type.
    fn name(&self) -> &'static str;

    /// Installs the type's global namespace values into a fresh VM.
    fn install(&self, globals: &mut HashMap<String, Value>);

    /// Canonical host representation used when a script returns this value.
    fn to_host(&self, ud: &UserData) -> Option<HostValue>;

    fn binary(&self, op: HostBinOp, _lhs: &Value, _rhs: &Value) -> Result<Value, String> {
        Err(format!("{} does not support {:?}", self.name(), op))
    }

    fn compare(&self, op: HostCmpOp, _lhs: &Value, _rhs: &Value) -> Result<bool, String> {
        Err(format!("{} does not support {:?}", self.name(), op))
    }

    fn neg(&self, _value: &Value) -> Result<Value, String> {
        Err(format!("{} does not support negation", self.name()))
    }

    fn len(&self, _value: &Value) -> Result<Value, String> {
        Err(format!("{} does not support #", self.name()))
    }

    fn to_display(&self, ud: &UserData) -> String {
        format!("<{}>", ud.tag)
    }

    fn call_method(
        &self,
        name: &str,
        _recv: &Value,
        _args: &[Value],
    ) -> Result<Vec<Value>, String> {
        Err(format!("unknown method '{name}' on {}", self.name()))
    }
}

/// Named, insertion-ordered set of host types shared by every VM a pool
/// creates.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<IndexMap<String, Arc<dyn HostType>>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Registry preloaded with the built-in types, in registration order:
    /// decimal, time, duration, service.
    pub fn with_defaults() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::new();
        registry.register(Arc::new(crate::types::decimal::DecimalType));
        registry.register(Arc::new(crate::types::time::TimeType));
        registry.register(Arc::new(crate::types::time::DurationType));
        registry.register(Arc::new(crate::types::service::ServiceType::with_passthrough()));
        Arc::new(registry)
    }

    /// Returns false when the name was already taken (first registration
    /// wins).
    pub fn register(&self, host_type: Arc<dyn HostType>) -> bool {
        let mut types = self.types.write().expect("type registry lock poisoned");
        let name = host_type.name().to_string();
        if types.contains_key(&name) {
            return false;
        }
        types.insert(name, host_type);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HostType>> {
        self.types
            .read()
            .expect("type registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Installs every registered type's globals in registration order.
    pub fn install_all(&self, globals: &mut HashMap<String, Value>) {
        let types = self.types.read().expect("type registry lock poisoned");
        for host_type in types.values() {
            host_type.install(globals);
        }
    }

    pub fn len(&self) -> usize {
        self.types.read().expect("type registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Nesting bound for script-to-host conversion; self-referencing tables
/// terminate with an error instead of unwinding the native stack.
const MAX_CONVERT_DEPTH: usize = 64;

/// Converts a script value to its host representation.
///
/// Integers stay 64-bit, bool/string pass through, tables recurse into
/// string-keyed maps, user-data resolves via its descriptor, and functions
/// and nil collapse to `Nil`.
pub fn value_to_host(value: &Value, registry: &TypeRegistry) -> Result<HostValue, String> {
    value_to_host_at(value, registry, 0)
}

fn value_to_host_at(
    value: &Value,
    registry: &TypeRegistry,
    depth: usize,
) -> Result<HostValue, String> {
    if depth > MAX_CONVERT_DEPTH {
        return Err("value nesting too deep to convert".to_string());
    }
    Ok(match value {
        Value::Nil | Value::Closure(_) | Value::Native(_) => HostValue::Nil,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Int(i) => HostValue::Int(*i),
        Value::Float(f) => HostValue::Float(*f),
        Value::Str(s) => HostValue::Str(s.to_string()),
        Value::Table(table) => {
            let mut map = IndexMap::new();
            for (key, entry) in &table.borrow().entries {
                map.insert(key.render(), value_to_host_at(entry, registry, depth + 1)?);
            }
            HostValue::Map(map)
        }
        Value::UserData(ud) => match registry.get(&ud.tag) {
            Some(host_type) => host_type.to_host(ud).unwrap_or(HostValue::Nil),
            None => HostValue::Nil,
        },
    })
}
