//! Fleet operator library.
//!
//! This crate primarily ships a `fleet-operator` binary, but we expose a
//! small library surface to enable integration testing and reuse.

pub mod config;
pub mod db;
pub mod provider;
pub mod scheduler;
