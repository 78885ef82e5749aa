//! CLI module for the Converge tool.
//!
//! This module provides the command-line interface for planning and
//! applying project files.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
