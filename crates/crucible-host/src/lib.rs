//! Service host: the script manager over store + codec + pool, the wire
//! `Any` algebra, and the HTTP façade exposing run/add/update/delete/
//! execute/find.

pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod wire;

pub use config::HostConfig;
pub use error::HostError;
pub use manager::ScriptManager;
pub use metrics::Metrics;
pub use wire::AnyValue;
