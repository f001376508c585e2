use crate::Platform;
use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::{GetIdentity, Identity, RefIdentity, Repository};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    #[display("hot")]
    Hot,
    #[display("search")]
    Search,
    #[display("feed_url")]
    FeedUrl,
    #[display("csv_upload")]
    CsvUpload,
    #[display("xml_upload")]
    XmlUpload,
}

impl FromStr for SyncKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "search" => Ok(Self::Search),
            "feed_url" => Ok(Self::FeedUrl),
            "csv_upload" => Ok(Self::CsvUpload),
            "xml_upload" => Ok(Self::XmlUpload),
            s => Err(anyhow::anyhow!("Unknown sync kind {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            s => Err(anyhow::anyhow!("Unknown sync status {s}")),
        }
    }
}

#[derive(Id, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[Id(ref_id, get_id)]
pub struct SyncJob {
    #[id]
    pub id: Uuid,
    pub platform: Platform,
    pub sync_kind: SyncKind,
    pub status: SyncStatus,
    pub items_synced: usize,
    #[serde(default)]
    pub items_skipped: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl SyncJob {
    pub fn start(platform: Platform, sync_kind: SyncKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            sync_kind,
            status: SyncStatus::Running,
            items_synced: 0,
            items_skipped: 0,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn complete(&mut self, items_synced: usize) {
        self.status = SyncStatus::Completed;
        self.items_synced = items_synced;
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    pub fn fail<S: ToString>(&mut self, error: S) {
        self.status = SyncStatus::Failed;
        self.error_message = Some(error.to_string());
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SyncStatus::Running
    }
}

#[async_trait]
pub trait SyncJobRepository:
    Repository<SyncJob, Error = anyhow::Error>
    + Save<SyncJob>
    + Get<SyncJob>
    + List<SyncJob>
    + Send
    + Sync
{
    /// Most recent jobs first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncJob>, anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_reaches_terminal_state() {
        let platform = Platform::parse("temu").unwrap();
        let mut job = SyncJob::start(platform.clone(), SyncKind::FeedUrl);
        assert!(!job.is_terminal());
        job.complete(12);
        assert_eq!(job.status, SyncStatus::Completed);
        assert_eq!(job.items_synced, 12);
        assert!(job.completed_at.is_some());

        let mut job = SyncJob::start(platform, SyncKind::Hot);
        job.fail("connection reset");
        assert_eq!(job.status, SyncStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("connection reset"));
    }
}
