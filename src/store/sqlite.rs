use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{HyperError, Result};
use crate::store::task::{NewTask, Requeued, Task, TaskFilter, TaskPatch, TaskState};
use crate::store::{from_nanos, to_nanos, StateCounts, TaskStore};

/// Identifier of the current on-disk layout, stored alongside the schema.
const SCHEMA_VERSION: i64 = 1;

const TASK_COLUMNS: &str = "id, uuid, args, template, state, submit_time, start_time, \
                            complete_time, host, attempt, exit_status, output, error";

/// Durable task store over SQLite. One row per task, indexed on
/// `(state, submit_time)` for dispatch-order scans.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database at `location`, either a
    /// filesystem path or a `sqlite:` URL.
    pub async fn open(location: &str) -> Result<Self> {
        let options = if location.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(location)
                .map_err(|err| HyperError::Fatal(format!("bad database url: {err}")))?
        } else {
            SqliteConnectOptions::new().filename(location)
        }
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|err| HyperError::Fatal(format!("cannot open database: {err}")))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task (
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,
                 uuid          TEXT NOT NULL UNIQUE,
                 args          TEXT NOT NULL,
                 template      TEXT NOT NULL DEFAULT '{}',
                 state         TEXT NOT NULL,
                 submit_time   INTEGER NOT NULL,
                 start_time    INTEGER,
                 complete_time INTEGER,
                 host          TEXT,
                 attempt       INTEGER NOT NULL DEFAULT 1,
                 exit_status   INTEGER,
                 output        TEXT,
                 error         TEXT
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_state_submit ON task (state, submit_time)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_info (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_info")
            .fetch_optional(&self.pool)
            .await?;
        match version {
            None => {
                sqlx::query("INSERT INTO schema_info (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
            }
            Some(found) if found != SCHEMA_VERSION => {
                return Err(HyperError::Fatal(format!(
                    "database schema version {found} is not supported (expected {SCHEMA_VERSION})"
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn fetch(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let uuid: String = row.try_get("uuid")?;
    let state: String = row.try_get("state")?;
    Ok(Task {
        id: row.try_get("id")?,
        uuid: Uuid::parse_str(&uuid)
            .map_err(|err| HyperError::Store(format!("bad uuid in task row: {err}")))?,
        args: row.try_get("args")?,
        template: row.try_get("template")?,
        state: TaskState::parse(&state)
            .ok_or_else(|| HyperError::Store(format!("bad state '{state}' in task row")))?,
        submit_time: from_nanos(row.try_get("submit_time")?),
        start_time: row
            .try_get::<Option<i64>, _>("start_time")?
            .map(from_nanos),
        complete_time: row
            .try_get::<Option<i64>, _>("complete_time")?
            .map(from_nanos),
        host: row.try_get("host")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        exit_status: row
            .try_get::<Option<i64>, _>("exit_status")?
            .map(|code| code as i32),
        output: row.try_get("output")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, task: NewTask) -> Result<Task> {
        sqlx::query(
            "INSERT INTO task (uuid, args, template, state, submit_time, attempt)
             VALUES (?, ?, ?, 'new', ?, 1)
             ON CONFLICT(uuid) DO NOTHING",
        )
        .bind(task.uuid.to_string())
        .bind(&task.args)
        .bind(&task.template)
        .bind(to_nanos(task.submit_time))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM task WHERE uuid = ?"))
            .bind(task.uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        row_to_task(&row)
    }

    async fn get(&self, id: i64) -> Result<Option<Task>> {
        self.fetch(id).await
    }

    async fn update_state(
        &self,
        id: i64,
        from: TaskState,
        to: TaskState,
        patch: TaskPatch,
    ) -> Result<Task> {
        let row = sqlx::query(&format!(
            "UPDATE task SET
                 state = ?,
                 host = COALESCE(?, host),
                 start_time = COALESCE(?, start_time),
                 complete_time = COALESCE(?, complete_time),
                 exit_status = COALESCE(?, exit_status),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error)
             WHERE id = ? AND state = ?
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(patch.host)
        .bind(patch.start_time.map(to_nanos))
        .bind(patch.complete_time.map(to_nanos))
        .bind(patch.exit_status)
        .bind(patch.output)
        .bind(patch.error)
        .bind(id)
        .bind(from.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => match self.fetch(id).await? {
                Some(task) => Err(HyperError::Conflict {
                    id,
                    expected: from.to_string(),
                    actual: task.state.to_string(),
                }),
                None => Err(HyperError::NotFound(id)),
            },
        }
    }

    async fn promote_new(&self, limit: usize) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "UPDATE task SET state = 'ready'
             WHERE id IN (
                 SELECT id FROM task WHERE state = 'new'
                 ORDER BY submit_time, id LIMIT ?
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<Task>>>()?;
        tasks.sort_by_key(|task| (task.submit_time, task.id));
        Ok(tasks)
    }

    async fn next_ready(&self, limit: usize, host: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "UPDATE task SET state = 'assigned', host = ?
             WHERE id IN (
                 SELECT id FROM task WHERE state = 'ready'
                 ORDER BY submit_time, id LIMIT ?
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(host)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<Task>>>()?;
        tasks.sort_by_key(|task| (task.submit_time, task.id));
        Ok(tasks)
    }

    async fn requeue(&self, id: i64, max_attempts: u32) -> Result<Requeued> {
        // Read-then-CAS; the WHERE clause re-checks state and attempt so a
        // concurrent transition simply retries on the fresh snapshot.
        loop {
            let task = self.fetch(id).await?.ok_or(HyperError::NotFound(id))?;
            if task.state != TaskState::Assigned {
                return Err(HyperError::Conflict {
                    id,
                    expected: TaskState::Assigned.to_string(),
                    actual: task.state.to_string(),
                });
            }
            let exhausted = task.attempt >= max_attempts;
            let row = if exhausted {
                sqlx::query(&format!(
                    "UPDATE task SET state = 'abandoned', host = NULL, complete_time = ?
                     WHERE id = ? AND state = 'assigned' AND attempt = ?
                     RETURNING {TASK_COLUMNS}"
                ))
                .bind(to_nanos(chrono::Utc::now()))
                .bind(id)
                .bind(task.attempt as i64)
                .fetch_optional(&self.pool)
                .await?
            } else {
                sqlx::query(&format!(
                    "UPDATE task SET state = 'ready', attempt = attempt + 1,
                                     host = NULL, start_time = NULL
                     WHERE id = ? AND state = 'assigned' AND attempt = ?
                     RETURNING {TASK_COLUMNS}"
                ))
                .bind(id)
                .bind(task.attempt as i64)
                .fetch_optional(&self.pool)
                .await?
            };
            match row {
                Some(row) => {
                    let task = row_to_task(&row)?;
                    return Ok(if exhausted {
                        Requeued::Abandoned(task)
                    } else {
                        Requeued::Ready(task)
                    });
                }
                None => continue,
            }
        }
    }

    async fn query(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        let limit = filter.limit.map(i64::from).unwrap_or(i64::MAX);
        let rows = match filter.state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM task WHERE state = ?
                     ORDER BY submit_time, id LIMIT ?"
                ))
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM task ORDER BY submit_time, id LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_task).collect()
    }

    async fn counts(&self) -> Result<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM task GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match TaskState::parse(&state) {
                Some(TaskState::New) => counts.new = n as u64,
                Some(TaskState::Ready) => counts.ready = n as u64,
                Some(TaskState::Assigned) => counts.assigned = n as u64,
                Some(TaskState::Done) => counts.done = n as u64,
                Some(TaskState::Failed) => counts.failed = n as u64,
                Some(TaskState::Abandoned) => counts.abandoned = n as u64,
                None => {
                    return Err(HyperError::Store(format!("bad state '{state}' in task row")))
                }
            }
        }
        Ok(counts)
    }

    async fn recover(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE task SET state = 'ready', host = NULL, start_time = NULL
             WHERE state = 'assigned'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
