//! The portable function prototype.
//!
//! `FunctionProto` is the unit of persistence: it owns every field an
//! executor needs to run a compiled script without the source text, including
//! string constants and the debug side tables. It is a plain serde-derived
//! tree, never a reinterpretation of interpreter internals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    pub source_name: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_upvalues: u8,
    pub num_params: u8,
    /// Reserved; the surface syntax has no vararg form today.
    pub is_vararg: bool,
    /// Upper bound on local slots the executor should reserve.
    pub num_registers: u8,
    #[serde(with = "serde_bytes")]
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub protos: Vec<FunctionProto>,
    /// Run-length encoded `(line, byte_count)` pairs covering `code`.
    pub lines: Vec<(u32, u32)>,
    pub locals: Vec<LocalInfo>,
    pub calls: Vec<CallInfo>,
    pub upvalue_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInfo {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub name: String,
    pub pc: u32,
}

impl FunctionProto {
    /// Resolves the source line for a bytecode offset.
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
