use thiserror::Error;

/// Source compilation failures: the script never produced a prototype.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },
    #[error("compile error at line {line}: {message}")]
    Compile { line: u32, message: String },
    #[error("failed to encode bytecode: {0}")]
    Encode(String),
}

impl CompileError {
    pub fn parse(line: u32, message: impl Into<String>) -> Self {
        CompileError::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn compile(line: u32, message: impl Into<String>) -> Self {
        CompileError::Compile {
            line,
            message: message.into(),
        }
    }
}

/// Failures reloading a compiled blob.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bytecode blob is truncated")]
    Truncated,
    #[error("not a compiled script (bad magic)")]
    BadMagic,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed bytecode: {0}")]
    Malformed(#[from] serde_cbor::Error),
}

/// A fault raised while a script was executing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error at line {line}: {message}")]
pub struct RuntimeError {
    pub line: u32,
    pub message: String,
}

impl RuntimeError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        RuntimeError {
            line,
            message: message.into(),
        }
    }
}

/// Umbrella error for pool-driven execution.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("vm pool is shut down")]
    PoolClosed,
    #[error("vm worker terminated unexpectedly")]
    WorkerGone,
}
