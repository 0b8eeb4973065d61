use console::style;

use crate::resilience::Checkpoint;
use crate::utils::first_line;
use crate::worktree::{CommandOutput, WorktreeInfo};

#[derive(Default)]
pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_worktree(&self, wt: &WorktreeInfo) {
        let lock = if wt.is_locked {
            match &wt.lock_reason {
                Some(reason) => format!(" {}", style(format!("[locked: {reason}]")).yellow()),
                None => format!(" {}", style("[locked]").yellow()),
            }
        } else {
            String::new()
        };

        println!("{}{}", style(wt.name()).bold(), lock);
        println!(
            "    Branch: {}  HEAD: {}",
            style(wt.branch.as_deref().unwrap_or("(detached)")).cyan(),
            style(wt.head.get(..8).unwrap_or(&wt.head)).dim()
        );
        println!("    Path:   {}", style(wt.path.display()).dim());
    }

    pub fn print_worktrees(&self, worktrees: &[WorktreeInfo]) {
        if worktrees.is_empty() {
            println!("{}", style("No worktrees found.").dim());
            return;
        }

        let locked = worktrees.iter().filter(|w| w.is_locked).count();
        self.print_header(&format!(
            "Worktrees ({} total, {} locked)",
            worktrees.len(),
            locked
        ));
        for wt in worktrees {
            self.print_worktree(wt);
            println!();
        }
    }

    pub fn print_checkpoint(&self, cp: &Checkpoint) {
        println!(
            "{}  {}",
            style(&cp.id).bold(),
            style(&cp.stage).cyan()
        );
        println!(
            "    Created: {}",
            cp.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if !cp.description.is_empty() {
            println!("    {}", first_line(&cp.description));
        }
    }

    pub fn print_checkpoint_detail(&self, cp: &Checkpoint) {
        self.print_header(&format!("Checkpoint: {}", cp.id));
        println!("Project:     {}", cp.project_id);
        println!("Stage:       {}", style(&cp.stage).cyan());
        println!("Created:     {}", cp.created_at.to_rfc3339());
        println!("Description: {}", cp.description);
        println!();
        match serde_json::to_string_pretty(&cp.state_snapshot) {
            Ok(snapshot) => println!("{snapshot}"),
            Err(_) => println!("{}", style("(snapshot not printable)").dim()),
        }
    }

    pub fn print_command_output(&self, output: &CommandOutput) {
        if !output.stdout.is_empty() {
            print!("{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }
}
