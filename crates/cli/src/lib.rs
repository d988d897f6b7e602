//! Command-line tool for the partitioned grid.
//!
//! Provides commands for:
//! - Printing the balanced arrangement for a member list
//! - Printing the migrations a membership change produces
//! - Locating the partition and replica holders of keys
//! - Running an in-process cluster through joins and departures
//! - Dumping the effective configuration

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
