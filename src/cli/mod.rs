//! CLI module for the Halldyll deployment tool.
//!
//! This module provides the command-line interface for managing
//! infrastructure stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
