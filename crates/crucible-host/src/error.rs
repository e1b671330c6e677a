use crucible_lang::{CompileError, DecodeError, ExecError, RuntimeError};
use crucible_store::StoreError;
use thiserror::Error;

/// Service-level error taxonomy with stable wire codes.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("multiple scripts match prefix '{0}'")]
    MultipleMatches(String),
    #[error("deadline exceeded: {0}")]
    ContextTimeout(String),
    #[error("compile failed: {0}")]
    Compile(#[from] CompileError),
    #[error("script failed: {0}")]
    Runtime(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HostError {
    /// Stable code surfaced on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::InvalidParam(_) => "invalid_param",
            HostError::ScriptNotFound(_) => "script_not_found",
            HostError::MultipleMatches(_) => "multiple_matches",
            HostError::ContextTimeout(_) => "context_timeout",
            HostError::Compile(_) => "compile_error",
            HostError::Runtime(_) => "runtime_error",
            HostError::Internal(_) => "internal",
        }
    }

    /// Maps a store failure for an operation addressed by `key`.
    pub fn from_store(key: &str, err: StoreError) -> HostError {
        match err {
            StoreError::NotFound => HostError::ScriptNotFound(key.to_string()),
            StoreError::MultipleMatches => HostError::MultipleMatches(key.to_string()),
            other => HostError::Internal(other.to_string()),
        }
    }
}

impl From<ExecError> for HostError {
    fn from(err: ExecError) -> HostError {
        match err {
            ExecError::Compile(e) => HostError::Compile(e),
            ExecError::Runtime(e) => HostError::Runtime(e.to_string()),
            ExecError::Decode(e) => HostError::Internal(format!("stored bytecode unusable: {e}")),
            ExecError::PoolClosed | ExecError::WorkerGone => {
                HostError::Internal(err.to_string())
            }
        }
    }
}

impl From<RuntimeError> for HostError {
    fn from(err: RuntimeError) -> HostError {
        HostError::Runtime(err.to_string())
    }
}

impl From<DecodeError> for HostError {
    fn from(err: DecodeError) -> HostError {
        HostError::Internal(format!("stored bytecode unusable: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_by_kind() {
        let err = HostError::from_store("ab", StoreError::NotFound);
        assert_eq!(err.code(), "script_not_found");
        let err = HostError::from_store("ab", StoreError::MultipleMatches);
        assert_eq!(err.code(), "multiple_matches");
        let err = HostError::from_store("ab", StoreError::Corrupt("x".into()));
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn exec_errors_map_by_kind() {
        let compile = ExecError::Compile(CompileError::parse(1, "bad"));
        assert_eq!(HostError::from(compile).code(), "compile_error");
        let runtime = ExecError::Runtime(RuntimeError::new(1, "boom"));
        assert_eq!(HostError::from(runtime).code(), "runtime_error");
    }
}
