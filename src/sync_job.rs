use async_trait::async_trait;
use pricefeed_types::sync_job::{SyncJob, SyncJobRepository, SyncKind, SyncStatus};
use pricefeed_types::Platform;
use rusqlite::types::Type;
use rusqlite::{params, Transaction, TransactionBehavior};
use std::str::FromStr;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::prelude::*;

const JOB_COLUMNS: &str =
    "id, platform, sync_kind, status, items_synced, items_skipped, started_at, completed_at, error_message";

pub struct SqliteSyncJobRepository {
    conn: Connection,
}

impl SqliteSyncJobRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let conn = Transaction::new(conn, TransactionBehavior::Deferred)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sync_job (
                    id BLOB PRIMARY KEY,
                    platform TEXT NOT NULL,
                    sync_kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    items_synced INTEGER NOT NULL,
                    items_skipped INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    error_message TEXT
                )",
                [],
            )?;
            conn.commit()?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncJob> {
    let platform = Platform::parse(row.get::<_, String>(1)?)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, err.into()))?;
    let sync_kind = SyncKind::from_str(&row.get::<_, String>(2)?)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, err.into()))?;
    let status = SyncStatus::from_str(&row.get::<_, String>(3)?)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, err.into()))?;
    Ok(SyncJob {
        id: row.get(0)?,
        platform,
        sync_kind,
        status,
        items_synced: row.get::<_, i64>(4)?.max(0) as usize,
        items_skipped: row.get::<_, i64>(5)?.max(0) as usize,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        error_message: row.get(8)?,
    })
}

impl Repository<SyncJob> for SqliteSyncJobRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Save<SyncJob> for SqliteSyncJobRepository {
    async fn save(&self, j: SyncJob) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_job (id, platform, sync_kind, status, items_synced, items_skipped, started_at, completed_at, error_message)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ON CONFLICT(id) DO UPDATE SET status=?4, items_synced=?5, items_skipped=?6, completed_at=?8, error_message=?9",
                    params![
                        j.id,
                        j.platform.as_str(),
                        j.sync_kind.to_string(),
                        j.status.to_string(),
                        j.items_synced as i64,
                        j.items_skipped as i64,
                        j.started_at,
                        j.completed_at,
                        j.error_message,
                    ],
                )?;
                Ok(())
            })
            .await?)
    }
}

#[async_trait]
impl Get<SyncJob> for SqliteSyncJobRepository {
    async fn get_one(&self, id: &IdentityOf<SyncJob>) -> Result<Option<SyncJob>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM sync_job WHERE id = ?1"))?;
                let j = stmt.query_map([id], row_to_job)?.next().transpose()?;
                Ok(j)
            })
            .await?)
    }
}

#[async_trait]
impl List<SyncJob> for SqliteSyncJobRepository {
    async fn list(&self) -> Result<Vec<SyncJob>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM sync_job ORDER BY started_at"
                ))?;
                let j = stmt
                    .query_map([], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(j)
            })
            .await?)
    }
}

#[async_trait]
impl SyncJobRepository for SqliteSyncJobRepository {
    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM sync_job ORDER BY started_at DESC, rowid DESC LIMIT ?1"
                ))?;
                let j = stmt
                    .query_map([limit as i64], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(j)
            })
            .await?)
    }
}
