//! Per-execution invocation context: the `this` builtin.
//!
//! Each run installs one `Invocation` into the VM before the script starts;
//! the script reads its inputs through `this.argc`/`this.argv` and records
//! results with `this.returns`. The slot is owned by the VM and cleared when
//! the VM goes back to the pool.

use std::collections::HashMap;

use crate::registry::value_to_host;
use crate::value::{HostValue, NativeFunction, Table, TableKey, Value};

#[derive(Debug, Default)]
pub struct Invocation {
    pub args: Vec<HostValue>,
    pub returns: Vec<HostValue>,
}

impl Invocation {
    pub fn new(args: Vec<HostValue>) -> Invocation {
        Invocation {
            args,
            returns: Vec::new(),
        }
    }
}

/// Installs the `this` global.
pub fn install(globals: &mut HashMap<String, Value>) {
    let mut table = Table::new();

    table.set(
        TableKey::Str("argc".into()),
        Value::Native(NativeFunction::new("this.argc", |ctx, _args| {
            let n = ctx.invocation.as_ref().map_or(0, |i| i.args.len());
            Ok(vec![Value::Int(n as i64)])
        })),
    );

    table.set(
        TableKey::Str("argv".into()),
        Value::Native(NativeFunction::new("this.argv", |ctx, args| {
            let inputs: Vec<HostValue> = ctx
                .invocation
                .as_ref()
                .map(|i| i.args.clone())
                .unwrap_or_default();
            if args.is_empty() {
                return Ok(inputs.iter().map(HostValue::to_value).collect());
            }
            let mut picked = Vec::with_capacity(args.len());
            for arg in args {
                let Some(pos) = arg.as_int() else {
                    return Err(format!("argv index must be a number, got {}", arg.kind()));
                };
                if pos < 1 || pos as usize > inputs.len() {
                    return Err(format!(
                        "invalid index {pos} out of bound [1, {}]",
                        inputs.len()
                    ));
                }
                picked.push(inputs[pos as usize - 1].to_value());
            }
            Ok(picked)
        })),
    );

    table.set(
        TableKey::Str("returns".into()),
        Value::Native(NativeFunction::new("this.returns", |ctx, args| {
            let mut converted = Vec::with_capacity(args.len());
            for arg in args {
                converted.push(value_to_host(arg, ctx.registry)?);
            }
            ctx.invocation
                .get_or_insert_with(Invocation::default)
                .returns = converted;
            Ok(vec![])
        })),
    );

    globals.insert("this".to_string(), Value::table(table));
}
