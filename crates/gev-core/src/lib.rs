//! # gev-core
//!
//! Core types for the gev reactor, platform-agnostic and free of OS
//! specific code. All descriptor and readiness handling lives in
//! `gev-loop`.
//!
//! ## Modules
//!
//! - `buffer` - Elastic byte FIFO used for socket receive/send staging
//! - `id` - Timer and connection identifier types
//! - `glog` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod buffer;
pub mod env;
pub mod glog;
pub mod id;

// Re-exports for convenience
pub use buffer::{Buffer, Drained};
pub use env::{env_get, env_get_bool};
pub use glog::LogLevel;
pub use id::{ConnId, TimerId};
