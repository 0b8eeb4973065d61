//! Command-line interface definitions.
//!
//! - `Cli`, `Commands`: argument definitions via clap
//! - `Display`: styled terminal output

mod commands;
mod display;

pub use commands::{CheckpointAction, Cli, Commands, ConfigAction, OutputFormat, WorktreeAction};
pub use display::Display;
