use std::path::Path;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::types::{
    Agent, AgentStatus, LifecycleId, PrLifecycle, Task, TaskId, TaskStatus, Workspace,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
    },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persisted daily quota counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub agent_requests: u64,
    pub prompts: u64,
    pub reserve_used: u64,
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: Serialize>(val: &T) -> Result<String> {
    let s = serde_json::to_string(val)?;
    Ok(s.trim_matches('"').to_string())
}

fn decode_all<T: DeserializeOwned>(rows: Vec<String>) -> Result<Vec<T>> {
    rows.iter()
        .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
        .collect()
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Async SQLite-backed record store for tasks, agents, workspaces, lifecycles
/// and quota usage.
///
/// Each entity is stored as a JSON document next to the columns that are
/// queried on. Tasks and lifecycles carry a version that every update must
/// match.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS counters (
                        name  TEXT PRIMARY KEY,
                        value INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id         INTEGER PRIMARY KEY,
                        status     TEXT NOT NULL,
                        priority   TEXT NOT NULL,
                        version    INTEGER NOT NULL,
                        updated_at TEXT NOT NULL,
                        data       TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

                    CREATE TABLE IF NOT EXISTS agents (
                        id      TEXT PRIMARY KEY,
                        task_id INTEGER NOT NULL,
                        status  TEXT NOT NULL,
                        data    TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

                    CREATE TABLE IF NOT EXISTS workspaces (
                        name   TEXT PRIMARY KEY,
                        status TEXT NOT NULL,
                        data   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS pr_lifecycles (
                        id        INTEGER PRIMARY KEY,
                        stage     TEXT NOT NULL,
                        pr_number INTEGER,
                        version   INTEGER NOT NULL,
                        data      TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_prl_pr ON pr_lifecycles(pr_number);

                    CREATE TABLE IF NOT EXISTS quota_usage (
                        day            TEXT PRIMARY KEY,
                        agent_requests INTEGER NOT NULL DEFAULT 0,
                        prompts        INTEGER NOT NULL DEFAULT 0,
                        reserve_used   INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS processed_events (
                        id           TEXT PRIMARY KEY,
                        kind         TEXT NOT NULL,
                        processed_at TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Allocate the next value of a monotonic counter. Never reuses a value,
    /// even after the records that used it are deleted.
    pub async fn next_id(&self, counter: &str) -> Result<u64> {
        let name = counter.to_string();
        let value = self
            .conn
            .call(move |conn| {
                let v: i64 = conn.query_row(
                    "INSERT INTO counters (name, value) VALUES (?1, 1)
                     ON CONFLICT(name) DO UPDATE SET value = value + 1
                     RETURNING value",
                    rusqlite::params![name],
                    |row| row.get(0),
                )?;
                Ok(v)
            })
            .await?;
        Ok(u64::try_from(value).unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let id = to_i64(task.id);
        let status = enum_to_sql(&task.status)?;
        let priority = enum_to_sql(&task.priority)?;
        let version = to_i64(task.version);
        let updated_at = task.updated_at.to_rfc3339();
        let data = serde_json::to_string(task)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, status, priority, version, updated_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id, status, priority, version, updated_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Persist `task` if the stored version still equals `task.version`.
    ///
    /// On success the version on `task` is bumped. On mismatch nothing is
    /// written and [`StoreError::VersionConflict`] is returned.
    pub async fn update_task(&self, task: &mut Task) -> Result<()> {
        let expected = task.version;
        let mut next = task.clone();
        next.version = expected + 1;
        next.updated_at = Utc::now();
        let row = TaskRow::encode(&next)?;
        let expected_sql = to_i64(expected);

        let changed = self
            .conn
            .call(move |conn| {
                let n = row.update(conn, expected_sql)?;
                Ok(n)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.to_string(),
                expected,
            });
        }
        *task = next;
        Ok(())
    }

    /// Update several tasks in one transaction. Either every version matches
    /// and all rows are written, or nothing is.
    pub async fn update_tasks(&self, tasks: &mut [Task]) -> Result<()> {
        let mut prepared = Vec::with_capacity(tasks.len());
        let mut next_tasks = Vec::with_capacity(tasks.len());
        let now = Utc::now();
        for task in tasks.iter() {
            let mut next = task.clone();
            next.version = task.version + 1;
            next.updated_at = now;
            prepared.push((TaskRow::encode(&next)?, to_i64(task.version)));
            next_tasks.push(next);
        }

        let conflict = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (row, expected) in &prepared {
                    if row.update(&tx, *expected)? == 0 {
                        return Ok(Some(row.id));
                    }
                }
                tx.commit()?;
                Ok(None)
            })
            .await?;

        if let Some(id) = conflict {
            let expected = tasks
                .iter()
                .find(|t| to_i64(t.id) == id)
                .map(|t| t.version)
                .unwrap_or_default();
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: id.to_string(),
                expected,
            });
        }
        for (slot, next) in tasks.iter_mut().zip(next_tasks) {
            *slot = next;
        }
        Ok(())
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let id = to_i64(id);
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM tasks WHERE id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM tasks ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let status = enum_to_sql(&status)?;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM tasks WHERE status = ?1 ORDER BY id")?;
                let rows = stmt
                    .query_map(rusqlite::params![status], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    /// Returns `true` if a row was removed.
    pub async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let id = to_i64(id);
        let n = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?))
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let id = agent.id.to_string();
        let task_id = to_i64(agent.task_id);
        let status = enum_to_sql(&agent.status)?;
        let data = serde_json::to_string(agent)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, task_id, status, data) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        task_id=excluded.task_id, status=excluded.status, data=excluded.data",
                    rusqlite::params![id, task_id, status, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM agents")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    pub async fn list_agents_by_status(&self, status: AgentStatus) -> Result<Vec<Agent>> {
        let status = enum_to_sql(&status)?;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM agents WHERE status = ?1")?;
                let rows = stmt
                    .query_map(rusqlite::params![status], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    // -----------------------------------------------------------------------
    // Workspaces
    // -----------------------------------------------------------------------

    pub async fn upsert_workspace(&self, ws: &Workspace) -> Result<()> {
        let name = ws.name.clone();
        let status = enum_to_sql(&ws.status)?;
        let data = serde_json::to_string(ws)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO workspaces (name, status, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET status=excluded.status, data=excluded.data",
                    rusqlite::params![name, status, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM workspaces ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    // -----------------------------------------------------------------------
    // PR lifecycles
    // -----------------------------------------------------------------------

    pub async fn insert_lifecycle(&self, prl: &PrLifecycle) -> Result<()> {
        let id = to_i64(prl.id);
        let stage = enum_to_sql(&prl.stage)?;
        let pr_number = prl.pr_number.map(to_i64);
        let version = to_i64(prl.version);
        let data = serde_json::to_string(prl)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pr_lifecycles (id, stage, pr_number, version, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, stage, pr_number, version, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Version-checked update, same contract as [`Store::update_task`].
    pub async fn update_lifecycle(&self, prl: &mut PrLifecycle) -> Result<()> {
        let expected = prl.version;
        let mut next = prl.clone();
        next.version = expected + 1;
        next.updated_at = Utc::now();

        let id = to_i64(next.id);
        let stage = enum_to_sql(&next.stage)?;
        let pr_number = next.pr_number.map(to_i64);
        let version = to_i64(next.version);
        let data = serde_json::to_string(&next)?;
        let expected_sql = to_i64(expected);

        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE pr_lifecycles SET stage=?2, pr_number=?3, version=?4, data=?5
                     WHERE id=?1 AND version=?6",
                    rusqlite::params![id, stage, pr_number, version, data, expected_sql],
                )?;
                Ok(n)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::VersionConflict {
                entity: "pr_lifecycle",
                id: prl.id.to_string(),
                expected,
            });
        }
        *prl = next;
        Ok(())
    }

    pub async fn list_lifecycles(&self) -> Result<Vec<PrLifecycle>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM pr_lifecycles ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        decode_all(rows)
    }

    pub async fn delete_lifecycle(&self, id: LifecycleId) -> Result<bool> {
        let id = to_i64(id);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM pr_lifecycles WHERE id = ?1", [id])?)
            })
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Quota
    // -----------------------------------------------------------------------

    pub async fn save_quota_usage(&self, day: &str, usage: QuotaUsage) -> Result<()> {
        let day = day.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO quota_usage (day, agent_requests, prompts, reserve_used)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(day) DO UPDATE SET agent_requests=excluded.agent_requests,
                        prompts=excluded.prompts, reserve_used=excluded.reserve_used",
                    rusqlite::params![
                        day,
                        to_i64(usage.agent_requests),
                        to_i64(usage.prompts),
                        to_i64(usage.reserve_used)
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_quota_usage(&self, day: &str) -> Result<Option<QuotaUsage>> {
        let day = day.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_requests, prompts, reserve_used FROM quota_usage WHERE day = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![day])?;
                match rows.next()? {
                    Some(row) => Ok(Some((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row.map(|(a, p, r)| QuotaUsage {
            agent_requests: u64::try_from(a).unwrap_or(0),
            prompts: u64::try_from(p).unwrap_or(0),
            reserve_used: u64::try_from(r).unwrap_or(0),
        }))
    }

    // -----------------------------------------------------------------------
    // Processed events
    // -----------------------------------------------------------------------

    /// Record an event identity. Returns `false` if it was already recorded.
    pub async fn mark_event_processed(&self, id: &str, kind: &str) -> Result<bool> {
        let id = id.to_string();
        let kind = kind.to_string();
        let now = Utc::now().to_rfc3339();
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO processed_events (id, kind, processed_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, kind, now],
                )?)
            })
            .await?;
        Ok(n == 1)
    }

    pub async fn is_event_processed(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT 1 FROM processed_events WHERE id = ?1")?;
                Ok(stmt.exists(rusqlite::params![id])?)
            })
            .await?;
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Row encoding
// ---------------------------------------------------------------------------

struct TaskRow {
    id: i64,
    status: String,
    priority: String,
    version: i64,
    updated_at: String,
    data: String,
}

impl TaskRow {
    fn encode(task: &Task) -> Result<Self> {
        Ok(Self {
            id: to_i64(task.id),
            status: enum_to_sql(&task.status)?,
            priority: enum_to_sql(&task.priority)?,
            version: to_i64(task.version),
            updated_at: task.updated_at.to_rfc3339(),
            data: serde_json::to_string(task)?,
        })
    }

    fn update(&self, conn: &rusqlite::Connection, expected: i64) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE tasks SET status=?2, priority=?3, version=?4, updated_at=?5, data=?6
             WHERE id=?1 AND version=?7",
            rusqlite::params![
                self.id,
                self.status,
                self.priority,
                self.version,
                self.updated_at,
                self.data,
                expected
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
