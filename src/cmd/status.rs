//! `auto-sdd status`: checkpoint and lock inspection.

use anyhow::Result;
use std::path::Path;

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    use auto_sdd::config::{CliOverrides, Config};
    use auto_sdd::lock::{is_pid_alive, lock_path_for, read_lock_pid};
    use auto_sdd::orchestrator::{FileStateStore, StateStore};
    use console::style;

    let config = Config::load(project_dir, &CliOverrides::default())?;
    println!("{}", style(config.project_dir.display()).bold());

    let lock = lock_path_for(&config.project_dir, &config.lock_dir);
    match read_lock_pid(&lock) {
        Some(pid) if is_pid_alive(pid) => {
            println!("  Lock:       held by PID {} ({})", pid, lock.display())
        }
        Some(pid) => println!(
            "  Lock:       stale (PID {} not running, {})",
            pid,
            lock.display()
        ),
        None => println!("  Lock:       free"),
    }

    let store = FileStateStore::new(config.resume_file());
    match store.load()? {
        Some(state) => {
            println!(
                "  Checkpoint: {} strategy, {} feature(s) completed, next index {}",
                state.branch_strategy,
                state.completed_features.len(),
                state.feature_index
            );
            if !state.current_branch.is_empty() {
                println!("  Branch:     {}", state.current_branch);
            }
            println!(
                "  Saved:      {}",
                state.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            for name in &state.completed_features {
                println!("    {} {}", style("✓").green(), name);
            }
        }
        None => println!("  Checkpoint: none"),
    }
    Ok(())
}
