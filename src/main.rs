use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use forge::cli::{
    CheckpointAction, Cli, Commands, ConfigAction, Display, OutputFormat, WorktreeAction,
};
use forge::config::{ForgeConfig, ProjectPaths};
use forge::error::{ForgeError, Result, WorktreeError};
use forge::resilience::CheckpointManager;
use forge::worktree::WorktreeManager;

struct Context {
    display: Display,
    format: OutputFormat,
}

impl Context {
    fn text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    fn json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("forge=debug")
    } else {
        EnvFilter::new("forge=info")
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = Context {
        display: Display::new(),
        format: cli.output,
    };

    match cli.command {
        Commands::Init => cmd_init(&ctx).await,
        Commands::Worktree { action } => cmd_worktree(&ctx, action).await,
        Commands::Checkpoint { action } => cmd_checkpoint(&ctx, action).await,
        Commands::Config { action } => cmd_config(&ctx, action).await,
    }
}

fn find_project_root() -> Result<PathBuf> {
    let current = std::env::current_dir()?;

    let mut path = current.as_path();
    loop {
        if path.join(".git").exists() {
            return Ok(path.to_path_buf());
        }
        path = path.parent().ok_or_else(|| {
            ForgeError::Worktree(WorktreeError::NotAGitRepo {
                path: current.clone(),
            })
        })?;
    }
}

async fn load_project() -> Result<(ProjectPaths, ForgeConfig)> {
    let root = find_project_root()?;
    let config = ForgeConfig::load(&ProjectPaths::forge_dir_of(&root)).await?;
    let paths = ProjectPaths::new(root, &config);
    Ok((paths, config))
}

async fn cmd_init(ctx: &Context) -> Result<()> {
    let root = find_project_root()?;
    let config = ForgeConfig::default();
    let paths = ProjectPaths::new(root, &config);

    if paths.is_initialized() {
        if ctx.text() {
            ctx.display
                .print_warning("forge is already initialized in this repository.");
        }
        return Ok(());
    }

    paths.ensure_dirs().await?;
    config.save(&paths.forge_dir).await?;

    if ctx.text() {
        ctx.display.print_success("Initialized forge.");
        ctx.display
            .print_info(&format!("Configuration: {}", paths.config_file().display()));
        ctx.display
            .print_info(&format!("Checkpoints: {}", paths.checkpoints_dir.display()));
    } else {
        ctx.json(&serde_json::json!({
            "initialized": true,
            "config": paths.config_file(),
        }))?;
    }
    Ok(())
}

async fn cmd_worktree(ctx: &Context, action: WorktreeAction) -> Result<()> {
    let (paths, config) = load_project().await?;
    let manager = WorktreeManager::from_paths(&paths, &config)?;

    match action {
        WorktreeAction::Create {
            name,
            branch,
            base,
            force,
        } => {
            let wt = manager
                .create_worktree(&name, branch.as_deref(), base.as_deref(), force)
                .await?;
            if ctx.text() {
                ctx.display
                    .print_success(&format!("Created worktree {}", wt.name()));
                ctx.display.print_worktree(&wt);
            } else {
                ctx.json(&wt)?;
            }
        }
        WorktreeAction::List { all } => {
            let worktrees = if all {
                manager.list_worktrees().await?
            } else {
                manager.list_managed().await?
            };
            if ctx.text() {
                ctx.display.print_worktrees(&worktrees);
            } else {
                ctx.json(&worktrees)?;
            }
        }
        WorktreeAction::Remove { name, force } => {
            manager.remove_worktree(&name, force).await?;
            if ctx.text() {
                ctx.display
                    .print_success(&format!("Removed worktree {name}"));
            }
        }
        WorktreeAction::Lock { name, reason } => {
            manager.lock_worktree(&name, reason.as_deref()).await?;
            if ctx.text() {
                ctx.display.print_success(&format!("Locked worktree {name}"));
            }
        }
        WorktreeAction::Unlock { name } => {
            manager.unlock_worktree(&name).await?;
            if ctx.text() {
                ctx.display
                    .print_success(&format!("Unlocked worktree {name}"));
            }
        }
        WorktreeAction::Clean { completed_only } => {
            let removed = manager.clean_worktrees(completed_only).await?;
            if ctx.text() {
                ctx.display
                    .print_success(&format!("Removed {removed} worktree(s)"));
            } else {
                ctx.json(&serde_json::json!({ "removed": removed }))?;
            }
        }
        WorktreeAction::Run { name, command } => {
            let output = manager.run_in_worktree(&name, &command.join(" ")).await?;
            if ctx.text() {
                ctx.display.print_command_output(&output);
            } else {
                ctx.json(&output)?;
            }
            if !output.success() {
                return Err(ForgeError::CommandFailed {
                    command: command.join(" "),
                    exit_code: output.exit_code,
                });
            }
        }
        WorktreeAction::Commit { name, message } => {
            let commit = manager.commit_in_worktree(&name, &message).await?;
            if ctx.text() {
                ctx.display.print_success(&format!("Committed {commit}"));
            } else {
                ctx.json(&serde_json::json!({ "commit": commit }))?;
            }
        }
    }
    Ok(())
}

async fn cmd_checkpoint(ctx: &Context, action: CheckpointAction) -> Result<()> {
    let (paths, _) = load_project().await?;
    let manager = CheckpointManager::file(&paths.checkpoints_dir);

    match action {
        CheckpointAction::Latest { project_id } => {
            let latest = manager.get_latest(&project_id).await?;
            match (&latest, ctx.text()) {
                (Some(cp), true) => ctx.display.print_checkpoint_detail(cp),
                (None, true) => ctx
                    .display
                    .print_info(&format!("No checkpoints for {project_id}")),
                (_, false) => ctx.json(&latest)?,
            }
        }
        CheckpointAction::List { project_id } => {
            let checkpoints = manager.list(&project_id).await?;
            if !ctx.text() {
                ctx.json(&checkpoints)?;
            } else if checkpoints.is_empty() {
                ctx.display
                    .print_info(&format!("No checkpoints for {project_id}"));
            } else {
                ctx.display.print_header(&format!(
                    "Checkpoints for {project_id} ({})",
                    checkpoints.len()
                ));
                for cp in &checkpoints {
                    ctx.display.print_checkpoint(cp);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_config(ctx: &Context, action: ConfigAction) -> Result<()> {
    let root = find_project_root()?;
    let forge_dir = ProjectPaths::forge_dir_of(&root);

    match action {
        ConfigAction::Show => {
            let config = ForgeConfig::load(&forge_dir).await?;
            if ctx.text() {
                let rendered =
                    toml::to_string_pretty(&config).map_err(|e| ForgeError::Config(e.to_string()))?;
                println!("{rendered}");
            } else {
                ctx.json(&config)?;
            }
        }
        ConfigAction::Reset => {
            ForgeConfig::default().save(&forge_dir).await?;
            if ctx.text() {
                ctx.display
                    .print_success("Configuration reset to defaults.");
            }
        }
    }
    Ok(())
}
