//! `hive status`: a read-only view of one feature's snapshot.

use anyhow::Result;
use console::style;
use hive::state::{LevelStatus, StateSnapshot, TaskStatus};
use std::path::PathBuf;

use super::super::Cli;

pub fn cmd_status(cli: &Cli, project_dir: PathBuf, feature: Option<&str>) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let feature = match super::resolve_feature(&config, feature) {
        Ok(feature) => feature,
        Err(e) => {
            println!();
            println!("{}", e);
            println!("Start one with 'hive run <tasks.json>'.");
            println!();
            return Ok(());
        }
    };
    let store = super::open_existing(&config, &feature)?;
    let snap = store.snapshot()?;
    print_snapshot(&snap);
    Ok(())
}

fn status_style(status: TaskStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => style(text).green(),
        TaskStatus::InProgress => style(text).cyan(),
        TaskStatus::Failed | TaskStatus::Blocked => style(text).red(),
        TaskStatus::Paused => style(text).yellow(),
        TaskStatus::Pending => style(text).dim(),
    }
}

fn print_snapshot(snap: &StateSnapshot) {
    println!();
    println!("Hive Status: {}", style(&snap.feature).bold());
    println!("=============");
    println!();
    match snap.current_level {
        Some(level) => println!("Current level: {}", level),
        None => println!("Current level: -"),
    }
    if let Some(mode) = snap.stop {
        println!("{}", style(format!("Stop requested ({:?})", mode)).yellow());
    }
    let counts = snap.status_counts();
    let summary: Vec<String> = counts
        .iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect();
    println!("Tasks: {}", summary.join(", "));
    println!();

    for (&level, record) in &snap.levels {
        let label = match record.status {
            LevelStatus::Merged => style(record.status.to_string()).green(),
            LevelStatus::Failed => style(record.status.to_string()).red(),
            LevelStatus::Running | LevelStatus::Merging => style(record.status.to_string()).cyan(),
            LevelStatus::Pending => style(record.status.to_string()).dim(),
        };
        print!("Level {} [{}]", level, label);
        if let Some(commit) = &record.merge_commit {
            print!(" {}", &commit[..commit.len().min(10)]);
        }
        println!();
        if let Some(error) = &record.error {
            println!("  {}", style(error).red());
        }
        if let Some(window) = snap.backpressure.get(&level)
            && !window.outcomes.is_empty()
        {
            println!(
                "  {}",
                style(format!(
                    "recent outcomes: {} failed of {}",
                    window.failures(),
                    window.outcomes.len()
                ))
                .dim()
            );
        }

        for (id, task) in snap.tasks_at(level) {
            let owner = task.worker_id.as_deref().unwrap_or("-");
            print!(
                "  {:<12} {:<12} {:<10} retries {}",
                id,
                status_style(task.status),
                owner,
                task.retries
            );
            if let Some(error) = &task.error {
                print!("  {}", style(error).dim());
            }
            println!();
        }
    }

    if !snap.workers.is_empty() {
        println!();
        println!("{:<10} {:<10} {:<8} {:<10} Restarts", "Worker", "Status", "Task", "Circuit");
        for (id, worker) in &snap.workers {
            let circuit = snap
                .circuits
                .get(id)
                .map(|c| c.state.to_string())
                .unwrap_or_else(|| "closed".to_string());
            let mut line = format!(
                "{:<10} {:<10} {:<8} {:<10} {}",
                id,
                worker.status.to_string(),
                worker.current_task.as_deref().unwrap_or("-"),
                circuit,
                worker.restarts
            );
            if worker.abandoned {
                line.push_str(" (abandoned)");
            }
            println!("{}", line);
        }
    }
    println!();
}
