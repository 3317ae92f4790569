//! Offload single pipeline module computations to remote worker pools.

pub mod cli;
pub mod compute;
pub mod config;
pub mod connection;
pub mod pool;
pub mod provenance;
pub mod runtime;
pub mod server;
