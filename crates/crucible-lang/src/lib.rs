//! The embedded script language: compiler, portable bytecode codec, VM,
//! pooled execution, and the host-type extension model.
//!
//! The pipeline is parse -> compile -> [`codec::encode`] -> persist ->
//! [`codec::load`] -> execute. A compiled blob is self-contained: any VM of
//! the same codec version can run it without the source text. Scripts read
//! their inputs and record their results through the `this` builtin
//! ([`invocation`]), and host types registered in a [`registry::TypeRegistry`]
//! are installed into every VM a [`pool::VmPool`] creates.

pub mod ast;
pub mod codec;
pub mod compiler;
pub mod error;
pub mod invocation;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod pool;
pub mod proto;
pub mod registry;
pub mod types;
pub mod value;
pub mod vm;

pub use codec::{compile, load};
pub use error::{CompileError, DecodeError, ExecError, RuntimeError};
pub use invocation::Invocation;
pub use pool::{PoolConfig, PooledVm, VmPool, DEFAULT_LIMIT};
pub use proto::FunctionProto;
pub use registry::{HostType, TypeRegistry};
pub use value::{HostValue, Value};
pub use vm::Vm;
