//! Checkpoint persistence per (group, partition).
//!
//! Checkpoints are the event id of the last successfully handled event and
//! only ever move forward. The in-memory tracker serves single-process
//! deployments and tests; the relational tracker upserts into a table with
//! primary key `("group", partition)` the way the store-backed components
//! issue their SQL.

use std::collections::HashMap;

use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use tokio::sync::RwLock;

use cqrs_engine_client::compare_event_ids;
use cqrs_engine_core::{EngineError, EngineResult};

/// Persists per-(group, partition) checkpoints. `save` must be atomic per
/// key and keep the stored id monotonically non-decreasing.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    async fn load(&self, group: &str, partition: u32) -> EngineResult<Option<String>>;

    async fn save(&self, group: &str, partition: u32, event_id: &str) -> EngineResult<()>;
}

/// Volatile tracker backed by a map.
#[derive(Default)]
pub struct InMemoryProgressTracker {
    entries: RwLock<HashMap<(String, u32), String>>,
}

impl InMemoryProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressTracker for InMemoryProgressTracker {
    async fn load(&self, group: &str, partition: u32) -> EngineResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(group.to_string(), partition))
            .cloned())
    }

    async fn save(&self, group: &str, partition: u32, event_id: &str) -> EngineResult<()> {
        let mut entries = self.entries.write().await;
        let key = (group.to_string(), partition);
        match entries.get(&key) {
            Some(current) if compare_event_ids(event_id, current).is_le() => {}
            _ => {
                entries.insert(key, event_id.to_string());
            }
        }
        Ok(())
    }
}

#[derive(QueryableByName)]
struct ProgressRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    event_id: String,
}

/// Tracker backed by a relational table
/// `("group" TEXT, partition INT, event_id TEXT, PRIMARY KEY ("group", partition))`.
///
/// The upsert keeps the stored id monotonic by comparing
/// `(char_length(event_id), event_id)`, the numeric order of
/// decimal-integer id strings.
pub struct RelationalProgressTracker {
    pool: Pool<ConnectionManager<PgConnection>>,
    table: String,
}

impl RelationalProgressTracker {
    pub fn new(pool: Pool<ConnectionManager<PgConnection>>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create the checkpoint table when it does not exist yet.
    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let pool = self.pool.clone();
        let table = self.table.clone();
        run_blocking(move || {
            let mut conn = pool.get().map_err(pool_error)?;
            diesel::sql_query(format!(
                r#"CREATE TABLE IF NOT EXISTS {table} (
                    "group" TEXT NOT NULL,
                    partition INTEGER NOT NULL,
                    event_id TEXT NOT NULL,
                    PRIMARY KEY ("group", partition)
                )"#
            ))
            .execute(&mut conn)
            .map_err(query_error)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProgressTracker for RelationalProgressTracker {
    async fn load(&self, group: &str, partition: u32) -> EngineResult<Option<String>> {
        let pool = self.pool.clone();
        let table = self.table.clone();
        let group = group.to_string();
        run_blocking(move || {
            let mut conn = pool.get().map_err(pool_error)?;
            let rows: Vec<ProgressRow> = diesel::sql_query(format!(
                r#"SELECT event_id FROM {table} WHERE "group" = $1 AND partition = $2"#
            ))
            .bind::<diesel::sql_types::Text, _>(group)
            .bind::<diesel::sql_types::Integer, _>(partition as i32)
            .load(&mut conn)
            .map_err(query_error)?;
            Ok(rows.into_iter().next().map(|row| row.event_id))
        })
        .await
    }

    async fn save(&self, group: &str, partition: u32, event_id: &str) -> EngineResult<()> {
        let pool = self.pool.clone();
        let table = self.table.clone();
        let group = group.to_string();
        let event_id = event_id.to_string();
        run_blocking(move || {
            let mut conn = pool.get().map_err(pool_error)?;
            diesel::sql_query(format!(
                r#"INSERT INTO {table} ("group", partition, event_id)
                   VALUES ($1, $2, $3)
                   ON CONFLICT ("group", partition) DO UPDATE SET event_id = EXCLUDED.event_id
                   WHERE (char_length({table}.event_id), {table}.event_id)
                       < (char_length(EXCLUDED.event_id), EXCLUDED.event_id)"#
            ))
            .bind::<diesel::sql_types::Text, _>(group)
            .bind::<diesel::sql_types::Integer, _>(partition as i32)
            .bind::<diesel::sql_types::Text, _>(event_id)
            .execute(&mut conn)
            .map_err(query_error)?;
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Transient {
            message: format!("progress tracker task failed: {e}"),
        })?
}

fn pool_error(error: diesel::r2d2::PoolError) -> EngineError {
    EngineError::Transient {
        message: format!("progress tracker connection pool error: {error}"),
    }
}

fn query_error(error: diesel::result::Error) -> EngineError {
    EngineError::Transient {
        message: format!("progress tracker query failed: {error}"),
    }
}
