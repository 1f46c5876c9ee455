//! Core crate for the Kometa UI run service.

pub mod config;
pub mod config_registry;
pub mod container;
pub mod lease;
pub mod log_reader;
pub mod logging;
pub mod runs;
pub mod server;
