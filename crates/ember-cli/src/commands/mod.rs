//! CLI commands.

pub mod cleanup;
pub mod find_port;
pub mod info;
pub mod serve;
