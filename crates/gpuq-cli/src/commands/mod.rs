//! CLI commands implementation

use anyhow::{bail, Result};
use chrono::{DateTime, Local, Utc};
use colored::{Color, Colorize};
use gpuq_core::submission::parse_file;
use gpuq_core::{parse_priority, DeviceId, GpuqError, NewTask, Task, TaskId, TaskState};
use gpuq_store::SqliteStore;
use std::path::Path;
use std::time::Duration;

const PAIRS_USAGE: &str =
    "update priority with key value pairs: task_id_1 new_priority_1 task_id_2 new_priority_2 ...";

const HEADERS: [&str; 10] = [
    "ID",
    "STATE",
    "PRIORITY",
    "SUBMIT_TIME",
    "EXECUTE_TIME",
    "SYSTEM_PID",
    "OCCUPIED_GPUS",
    "EXCLUDE_GPUS",
    "NUM_GPUS",
    "COMMAND",
];

/// Terminal color of a state in listings
pub fn state_color(state: TaskState) -> Color {
    match state {
        TaskState::Running => Color::Green,
        TaskState::Queuing => Color::Cyan,
        TaskState::Pending => Color::Yellow,
        TaskState::Done => Color::Red,
    }
}

/// Submit one command
pub async fn submit(
    store: &SqliteStore,
    command: Vec<String>,
    num_gpus: u32,
    exclude_gpus: &[DeviceId],
    priority: u32,
) -> Result<TaskId> {
    let task = NewTask::new(command, num_gpus)
        .with_exclude_gpus(exclude_gpus.iter().copied())
        .with_priority(priority);
    task.validate()?;

    let id = store.insert_task(&task).await.map_err(GpuqError::from)?;
    println!("successfully added task {} `{}`", id, task.command.join(" "));
    Ok(id)
}

/// Submit every command in a task file. Nothing is inserted if any line is malformed.
pub async fn submit_file(
    store: &SqliteStore,
    path: &Path,
    exclude_gpus: &[DeviceId],
    priority: u32,
) -> Result<Vec<TaskId>> {
    let submissions = parse_file(path)?;
    if submissions.is_empty() {
        println!("no tasks found in `{}`", path.display());
    }

    let mut ids = Vec::with_capacity(submissions.len());
    for submission in submissions {
        ids.push(submit(store, submission.command, submission.num_gpus, exclude_gpus, priority).await?);
    }
    Ok(ids)
}

/// Delete a queuing task
pub async fn delete(store: &SqliteStore, id: TaskId) -> Result<()> {
    store.delete_task(id).await.map_err(GpuqError::from)?;
    println!("successfully deleted task id {}", id);
    Ok(())
}

/// Split `ID VALUE ID VALUE ...` into pairs
pub fn priority_pairs(args: &[String]) -> Result<Vec<(&str, &str)>> {
    if args.is_empty() || args.len() % 2 != 0 {
        bail!(PAIRS_USAGE);
    }
    Ok(args
        .chunks(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect())
}

/// Update priorities pair by pair. A bad pair is reported and skipped.
pub async fn update_priority(store: &SqliteStore, args: &[String]) -> Result<()> {
    let pairs = priority_pairs(args)?;
    let mut failed = 0;

    for (raw_id, raw_priority) in pairs {
        match update_one_priority(store, raw_id, raw_priority).await {
            Ok((id, old, new)) => println!(
                "successfully updated priority of task id {} from {} to {}",
                id, old, new
            ),
            Err(e) => {
                eprintln!("{}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} priority update(s) failed", failed);
    }
    Ok(())
}

async fn update_one_priority(
    store: &SqliteStore,
    raw_id: &str,
    raw_priority: &str,
) -> Result<(TaskId, u32, u32), GpuqError> {
    let id: TaskId = raw_id
        .trim()
        .parse()
        .map_err(|_| GpuqError::Validation(format!("task id {} is not an integer", raw_id)))?;
    let priority = parse_priority(raw_priority)?;
    let old = store.update_priority(id, priority).await?;
    Ok((id, old, priority))
}

/// Tasks in listing order: RUNNING, PENDING, QUEUING, DONE, each by dispatch order
pub async fn collect_tasks(
    store: &SqliteStore,
    state: Option<TaskState>,
    limit: Option<usize>,
) -> Result<Vec<Task>> {
    let states = match state {
        Some(state) => vec![state],
        None => TaskState::DISPLAY_ORDER.to_vec(),
    };

    let mut tasks = Vec::new();
    for state in states {
        tasks.extend(store.find_by_state(state).await.map_err(GpuqError::from)?);
    }
    if let Some(limit) = limit {
        tasks.truncate(limit);
    }
    Ok(tasks)
}

/// Print the task table once, or every `refresh` until interrupted
pub async fn list(
    store: &SqliteStore,
    state: Option<TaskState>,
    limit: Option<usize>,
    refresh: Option<Duration>,
) -> Result<()> {
    let Some(refresh) = refresh else {
        print_table(&collect_tasks(store, state, limit).await?);
        return Ok(());
    };

    loop {
        let tasks = collect_tasks(store, state, limit).await?;
        // Clear the screen and move the cursor home
        print!("\x1B[2J\x1B[H");
        print_table(&tasks);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(refresh) => {}
        }
    }
}

fn print_table(tasks: &[Task]) {
    let rows: Vec<[String; 10]> = tasks.iter().map(table_row).collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let header: Vec<String> = HEADERS
        .iter()
        .zip(widths)
        .map(|(h, w)| format!("{:<w$}", h, w = w))
        .collect();
    println!("{}", header.join("  ").trim_end());
    println!("{}", "-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));

    for (task, row) in tasks.iter().zip(rows) {
        let cells: Vec<String> = row
            .iter()
            .zip(widths)
            .enumerate()
            .map(|(i, (cell, w))| {
                let padded = format!("{:<w$}", cell, w = w);
                // Pad before coloring so escape codes do not skew columns
                if i == 1 {
                    padded.color(state_color(task.state)).to_string()
                } else {
                    padded
                }
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// Plain-text cells of one task
pub fn table_row(task: &Task) -> [String; 10] {
    [
        task.id.to_string(),
        task.state.to_string(),
        task.priority.to_string(),
        format_time(Some(task.submit_time)),
        format_time(task.execute_time),
        task.system_pid.map(|p| p.to_string()).unwrap_or_default(),
        format_devices(task.occupied_gpus.iter()),
        format_devices(task.exclude_gpus.iter()),
        task.num_gpus_required.to_string(),
        task.command_line(),
    ]
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn format_devices<'a>(devices: impl Iterator<Item = &'a DeviceId>) -> String {
    let ids: Vec<String> = devices.map(|id| id.to_string()).collect();
    format!("[{}]", ids.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&dir.path().join("gpuq.db")).await.unwrap();
        (dir, store)
    }

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_state_color() {
        assert_eq!(state_color(TaskState::Running), Color::Green);
        assert_eq!(state_color(TaskState::Queuing), Color::Cyan);
        assert_eq!(state_color(TaskState::Pending), Color::Yellow);
        assert_eq!(state_color(TaskState::Done), Color::Red);
    }

    #[test]
    fn test_priority_pairs() {
        let args = strings(&["1", "50", "2", "10"]);
        assert_eq!(priority_pairs(&args).unwrap(), vec![("1", "50"), ("2", "10")]);

        let err = priority_pairs(&strings(&["1", "50", "2"])).unwrap_err();
        assert_eq!(err.to_string(), PAIRS_USAGE);
        assert!(priority_pairs(&[]).is_err());
    }

    #[tokio::test]
    async fn test_submit_and_list_order() {
        let (_dir, store) = store().await;
        let a = submit(&store, strings(&["echo", "A"]), 1, &[], 100).await.unwrap();
        let b = submit(&store, strings(&["echo", "B"]), 2, &[3], 50).await.unwrap();

        let tasks = collect_tasks(&store, None, None).await.unwrap();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b, a]);

        let row = table_row(&tasks[0]);
        assert_eq!(row[1], "queuing");
        assert_eq!(row[7], "[3]");
        assert_eq!(row[8], "2");
        assert_eq!(row[9], "echo B");
        assert_eq!(row[4], "");

        let limited = collect_tasks(&store, Some(TaskState::Queuing), Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(collect_tasks(&store, Some(TaskState::Done), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let (_dir, store) = store().await;
        assert!(submit(&store, Vec::new(), 1, &[], 100).await.is_err());
        assert!(submit(&store, strings(&["job"]), 0, &[], 100).await.is_err());
        assert!(collect_tasks(&store, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_file_is_all_or_nothing() {
        let (dir, store) = store().await;

        let good = dir.path().join("good.txt");
        let mut f = std::fs::File::create(&good).unwrap();
        writeln!(f, "# comment\n\npython train.py --lr 0.1;2\necho done").unwrap();
        let ids = submit_file(&store, &good, &[0], 100).await.unwrap();
        assert_eq!(ids.len(), 2);

        let first = store.find_by_id(ids[0]).await.unwrap().unwrap();
        assert_eq!(first.num_gpus_required, 2);
        assert!(first.exclude_gpus.contains(&0));

        let bad = dir.path().join("bad.txt");
        let mut f = std::fs::File::create(&bad).unwrap();
        writeln!(f, "echo one\necho two;x").unwrap();
        let err = submit_file(&store, &bad, &[], 100).await.unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert_eq!(collect_tasks(&store, None, None).await.unwrap().len(), 2);

        assert!(submit_file(&store, &dir.path().join("missing.txt"), &[], 100)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_and_priority() {
        let (_dir, store) = store().await;
        let id = submit(&store, strings(&["job"]), 1, &[], 100).await.unwrap();

        update_priority(&store, &strings(&[&id.to_string(), "7"])).await.unwrap();
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().priority, 7);

        // Bad pairs are reported and leave the task alone
        assert!(update_priority(&store, &strings(&[&id.to_string(), "0"])).await.is_err());
        assert!(update_priority(&store, &strings(&["abc", "5"])).await.is_err());
        assert!(update_priority(&store, &strings(&["999", "5"])).await.is_err());
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().priority, 7);

        delete(&store, id).await.unwrap();
        let err = delete(&store, id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("no task found by id {}", id));
    }
}
