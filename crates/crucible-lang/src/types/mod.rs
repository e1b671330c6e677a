//! Built-in host types installed into every VM.

pub mod decimal;
pub mod service;
pub mod time;
