//! SQLite-backed task and server store
//!
//! The database file is shared by the daemon and any number of CLI
//! processes. Every read-modify-write is a single conditional statement or
//! runs inside one transaction, so concurrent writers cannot lose updates
//! or claim the same task twice.
//!
//! Timestamps are stored as UTC RFC 3339 text with fixed microsecond
//! precision, which keeps `ORDER BY submit_time` chronological. Device
//! lists and commands are JSON arrays.

use chrono::{DateTime, SecondsFormat, Utc};
use gpuq_core::{
    validate_priority, DeviceId, NewTask, ServerRecord, Task, TaskId, TaskPatch, TaskState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

const TASK_COLUMNS: &str = "id, state, priority, submit_time, execute_time, system_pid, \
                            occupied_gpus, exclude_gpus, num_gpus_required, command";

const SERVER_COLUMNS: &str = "id, pid, start_time, stop_time";

/// Outcome of [`SqliteStore::register_server`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// A new record was inserted
    Started {
        record: ServerRecord,
        /// Previous record whose process died without a clean stop
        recovered: Option<ServerRecord>,
    },
    /// The latest record belongs to a live process
    Conflict(ServerRecord),
}

/// Durable store for tasks and scheduler instances
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run pending migrations
    pub async fn connect(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;

        debug!(path = %path.display(), "Task store opened");
        Ok(Self { pool })
    }

    // ---- tasks ----

    /// Enqueue a task in QUEUING state
    pub async fn insert_task(&self, task: &NewTask) -> StoreResult<TaskId> {
        task.validate()?;

        let result = sqlx::query(
            "INSERT INTO tasks (state, priority, submit_time, occupied_gpus, exclude_gpus, \
             num_gpus_required, command) VALUES (?1, ?2, ?3, '[]', ?4, ?5, ?6)",
        )
        .bind(TaskState::Queuing.as_str())
        .bind(i64::from(task.priority))
        .bind(encode_time(&Utc::now()))
        .bind(serde_json::to_string(&task.exclude_gpus)?)
        .bind(i64::from(task.num_gpus_required))
        .bind(serde_json::to_string(&task.command)?)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(
            task_id = id,
            command = %task.command.join(" "),
            num_gpus = task.num_gpus_required,
            "Task submitted"
        );
        Ok(id)
    }

    /// Tasks in `state`, in dispatch order
    pub async fn find_by_state(&self, state: TaskState) -> StoreResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 \
             ORDER BY priority ASC, submit_time ASC, id ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    pub async fn find_by_id(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Move the head of the queue from QUEUING to PENDING and return it.
    ///
    /// Selection and transition happen in one statement, so a task is
    /// handed to at most one caller.
    pub async fn claim_next(&self) -> StoreResult<Option<Task>> {
        let sql = format!(
            "UPDATE tasks SET state = ?1 WHERE id = ( \
                 SELECT id FROM tasks WHERE state = ?2 \
                 ORDER BY priority ASC, submit_time ASC, id ASC LIMIT 1 \
             ) AND state = ?2 RETURNING {TASK_COLUMNS}"
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(TaskState::Pending.as_str())
            .bind(TaskState::Queuing.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Apply `patch` only if the task is still in `expected` state.
    ///
    /// Returns `false` when the task is missing or has moved on.
    pub async fn update_task(
        &self,
        id: TaskId,
        expected: TaskState,
        patch: &TaskPatch,
    ) -> StoreResult<bool> {
        if let Some(next) = patch.state {
            if !expected.can_transition_to(next) {
                return Err(StoreError::IllegalTransition {
                    from: expected,
                    to: next,
                });
            }
        }
        if let Some(priority) = patch.priority {
            validate_priority(priority)?;
        }
        if patch.is_empty() {
            return Ok(false);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET ");
        {
            let mut fields = qb.separated(", ");
            if let Some(state) = patch.state {
                fields.push("state = ");
                fields.push_bind_unseparated(state.as_str());
            }
            if let Some(priority) = patch.priority {
                fields.push("priority = ");
                fields.push_bind_unseparated(i64::from(priority));
            }
            if let Some(at) = patch.execute_time {
                fields.push("execute_time = ");
                fields.push_bind_unseparated(encode_time(&at));
            }
            if let Some(pid) = patch.system_pid {
                fields.push("system_pid = ");
                fields.push_bind_unseparated(i64::from(pid));
            }
            if let Some(devices) = &patch.occupied_gpus {
                fields.push("occupied_gpus = ");
                fields.push_bind_unseparated(serde_json::to_string(devices)?);
            }
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.push(" AND state = ");
        qb.push_bind(expected.as_str());

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Revert every PENDING task to QUEUING, clearing its devices
    pub async fn rollback_pending(&self) -> StoreResult<Vec<TaskId>> {
        let ids: Vec<TaskId> = sqlx::query_scalar(
            "UPDATE tasks SET state = ?1, occupied_gpus = '[]' WHERE state = ?2 RETURNING id",
        )
        .bind(TaskState::Queuing.as_str())
        .bind(TaskState::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Change the priority of a QUEUING task, returning the old value
    pub async fn update_priority(&self, id: TaskId, priority: u32) -> StoreResult<u32> {
        validate_priority(priority)?;

        let current = self
            .find_by_id(id)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?;
        if !current.state.is_editable() {
            return Err(StoreError::InvalidState {
                id,
                state: current.state,
                action: "updated",
            });
        }

        let patch = TaskPatch {
            priority: Some(priority),
            ..TaskPatch::default()
        };
        if self.update_task(id, TaskState::Queuing, &patch).await? {
            return Ok(current.priority);
        }
        // Dispatched or deleted between the read and the update
        Err(self.explain_rejection(id, "updated").await)
    }

    /// Delete a QUEUING task
    pub async fn delete_task(&self, id: TaskId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1 AND state = ?2")
            .bind(id)
            .bind(TaskState::Queuing.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            info!(task_id = id, "Task deleted");
            return Ok(());
        }
        Err(self.explain_rejection(id, "deleted").await)
    }

    async fn explain_rejection(&self, id: TaskId, action: &'static str) -> StoreError {
        match self.find_by_id(id).await {
            Ok(Some(task)) => StoreError::InvalidState {
                id,
                state: task.state,
                action,
            },
            Ok(None) => StoreError::TaskNotFound(id),
            Err(e) => e,
        }
    }

    // ---- servers ----

    /// Most recently started scheduler instance
    pub async fn last_server(&self) -> StoreResult<Option<ServerRecord>> {
        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY start_time DESC, id DESC LIMIT 1"
        );
        let row: Option<ServerRow> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        row.map(ServerRecord::try_from).transpose()
    }

    /// Latest record written by `pid`
    pub async fn server_by_pid(&self, pid: u32) -> StoreResult<Option<ServerRecord>> {
        let sql =
            format!("SELECT {SERVER_COLUMNS} FROM servers WHERE pid = ?1 ORDER BY id DESC LIMIT 1");
        let row: Option<ServerRow> = sqlx::query_as(&sql)
            .bind(i64::from(pid))
            .fetch_optional(&self.pool)
            .await?;
        row.map(ServerRecord::try_from).transpose()
    }

    pub async fn insert_server(&self, pid: u32) -> StoreResult<ServerRecord> {
        let start_time = Utc::now();
        let result = sqlx::query("INSERT INTO servers (pid, start_time) VALUES (?1, ?2)")
            .bind(i64::from(pid))
            .bind(encode_time(&start_time))
            .execute(&self.pool)
            .await?;
        Ok(ServerRecord {
            id: result.last_insert_rowid(),
            pid,
            start_time: truncate_micros(start_time),
            stop_time: None,
        })
    }

    /// Set the stop timestamp; `false` if the record was already stopped
    pub async fn mark_server_stopped(&self, id: i64, at: DateTime<Utc>) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE servers SET stop_time = ?1 WHERE id = ?2 AND stop_time IS NULL")
                .bind(encode_time(&at))
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Check the latest server record and insert one for `pid`, in one transaction.
    ///
    /// An unstopped record whose holder is still alive (per `holder_alive`)
    /// wins; an unstopped record whose holder is gone is closed as crashed.
    pub async fn register_server<F>(&self, pid: u32, holder_alive: F) -> StoreResult<Registration>
    where
        F: Fn(u32) -> bool + Send,
    {
        // Take the write lock up front so racing starts queue on busy_timeout
        // instead of failing the read-to-write upgrade.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY start_time DESC, id DESC LIMIT 1"
        );
        let last: Option<ServerRow> = sqlx::query_as(&sql).fetch_optional(&mut *tx).await?;
        let last = last.map(ServerRecord::try_from).transpose()?;

        let now = Utc::now();
        let mut recovered = None;
        if let Some(last) = last {
            if !last.is_stopped() {
                if last.pid != pid && holder_alive(last.pid) {
                    tx.rollback().await?;
                    return Ok(Registration::Conflict(last));
                }
                warn!(
                    pid = last.pid,
                    started = %last.start_time,
                    "Previous server did not stop cleanly, marking it stopped"
                );
                sqlx::query("UPDATE servers SET stop_time = ?1 WHERE id = ?2")
                    .bind(encode_time(&now))
                    .bind(last.id)
                    .execute(&mut *tx)
                    .await?;
                recovered = Some(ServerRecord {
                    stop_time: Some(truncate_micros(now)),
                    ..last
                });
            }
        }

        let result = sqlx::query("INSERT INTO servers (pid, start_time) VALUES (?1, ?2)")
            .bind(i64::from(pid))
            .bind(encode_time(&now))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Registration::Started {
            record: ServerRecord {
                id: result.last_insert_rowid(),
                pid,
                start_time: truncate_micros(now),
                stop_time: None,
            },
            recovered,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    state: String,
    priority: i64,
    submit_time: String,
    execute_time: Option<String>,
    system_pid: Option<i64>,
    occupied_gpus: String,
    exclude_gpus: String,
    num_gpus_required: i64,
    command: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let state: TaskState = row
            .state
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("task {} has state `{}`", row.id, row.state)))?;
        let occupied_gpus: Vec<DeviceId> = serde_json::from_str(&row.occupied_gpus)?;

        Ok(Task {
            id: row.id,
            state,
            priority: to_u32(row.priority, "priority")?,
            submit_time: decode_time(&row.submit_time)?,
            execute_time: row.execute_time.as_deref().map(decode_time).transpose()?,
            system_pid: row.system_pid.map(|pid| to_u32(pid, "system_pid")).transpose()?,
            occupied_gpus,
            exclude_gpus: serde_json::from_str(&row.exclude_gpus)?,
            num_gpus_required: to_u32(row.num_gpus_required, "num_gpus_required")?,
            command: serde_json::from_str(&row.command)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ServerRow {
    id: i64,
    pid: i64,
    start_time: String,
    stop_time: Option<String>,
}

impl TryFrom<ServerRow> for ServerRecord {
    type Error = StoreError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        Ok(ServerRecord {
            id: row.id,
            pid: to_u32(row.pid, "pid")?,
            start_time: decode_time(&row.start_time)?,
            stop_time: row.stop_time.as_deref().map(decode_time).transpose()?,
        })
    }
}

fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp `{}`: {}", raw, e)))
}

/// The value a timestamp has after a round trip through the database
fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    decode_time(&encode_time(&at)).unwrap_or(at)
}

fn to_u32(value: i64, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}
