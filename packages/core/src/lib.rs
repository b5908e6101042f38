// Library root — exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod api;
pub mod db;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod repository;
pub mod scheduler;
pub mod services;

// These modules are mostly needed by the binary.
pub mod cli;
pub mod config;
pub mod logging;
