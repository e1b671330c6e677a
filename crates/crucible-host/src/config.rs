use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crucible_lang::pool::DEFAULT_LIMIT;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory holding the storage engine's files.
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    /// Maximum number of concurrently live VMs.
    pub pool_limit: usize,
    /// Per-request deadline; elapsing yields a context-timeout error.
    pub request_timeout: Duration,
    /// Result cap for find-by-prefix when the caller omits one.
    pub find_limit_default: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            listen: ([127, 0, 0, 1], 8040).into(),
            pool_limit: DEFAULT_LIMIT,
            request_timeout: Duration::from_secs(30),
            find_limit_default: 10,
        }
    }
}
