use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "forge")]
#[command(author, version, about = "Resilient task execution in isolated git worktrees", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize forge in the current repository
    Init,

    /// Manage task worktrees
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },

    /// Inspect saved checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum WorktreeAction {
    /// Create a worktree (named forge-<name>)
    Create {
        name: String,

        /// Branch to check out (default: forge/<name>)
        #[arg(long)]
        branch: Option<String>,

        /// Base for a new branch (default: HEAD)
        #[arg(long)]
        base: Option<String>,

        /// Replace an existing worktree with the same name
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// List worktrees
    List {
        /// Include worktrees not managed by forge
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Remove a worktree
    Remove {
        name: String,

        /// Remove even if dirty, locked or already gone
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Protect a worktree from cleanup
    Lock {
        name: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Release a lock
    Unlock { name: String },

    /// Remove all unlocked forge worktrees
    Clean {
        /// Only worktrees whose task finished
        #[arg(long)]
        completed_only: bool,
    },

    /// Run a shell command inside a worktree
    Run {
        name: String,

        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Stage and commit all changes in a worktree
    Commit {
        name: String,

        #[arg(long, short = 'm')]
        message: String,
    },
}

#[derive(Subcommand)]
pub enum CheckpointAction {
    /// Show the most recent checkpoint of a project
    Latest { project_id: String },

    /// List checkpoints of a project, newest first
    List { project_id: String },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Reset to defaults
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_collects_trailing_args() {
        let cli = Cli::parse_from(["forge", "worktree", "run", "api", "cargo", "test", "--lib"]);
        match cli.command {
            Commands::Worktree {
                action: WorktreeAction::Run { name, command },
            } => {
                assert_eq!(name, "api");
                assert_eq!(command, vec!["cargo", "test", "--lib"]);
            }
            _ => panic!("expected worktree run"),
        }
    }
}
