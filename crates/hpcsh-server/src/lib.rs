//! hpcsh-server: terminal session bridge for HPC clusters.
//!
//! Launches interactive shells inside `salloc` allocations on
//! pseudo-terminals and streams them to remote WebSocket clients. The
//! binary lives in `main.rs`; the library surface exists so the
//! out-of-scope HTTP layer (and the integration tests) can drive the
//! registry directly.

pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
pub mod slurm;
