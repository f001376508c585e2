use actix::prelude::*;
use pricefeed_types::sync_job::{SyncJob, SyncJobRepository};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{self, SourceConfig};
use crate::sync::{SyncOrchestrator, SyncSummary};

/// Owns the sync schedule and serializes manual requests with it.
pub struct SyncService {
    orchestrator: SyncOrchestrator,
    sources_path: PathBuf,
    interval: Option<Duration>,
    token: CancellationToken,
}

impl SyncService {
    pub fn new<P: Into<PathBuf>>(
        orchestrator: SyncOrchestrator,
        sources_path: P,
        token: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            sources_path: sources_path.into(),
            interval: None,
            token,
        }
    }

    /// Runs every enabled source once per `interval`, starting immediately.
    pub fn with_schedule(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    async fn sync_all(
        orchestrator: &SyncOrchestrator,
        sources_path: &Path,
        token: &CancellationToken,
    ) -> Result<SyncSummary, anyhow::Error> {
        let sources = config::read_sources(sources_path).await?;
        Ok(orchestrator.run_all(&sources, token).await)
    }

    async fn start_sync_cycle(
        orchestrator: SyncOrchestrator,
        sources_path: PathBuf,
        interval: Duration,
        token: CancellationToken,
    ) {
        loop {
            if let Err(err) = Self::sync_all(&orchestrator, &sources_path, &token).await {
                log::error!("Scheduled sync failed: {err:#}");
            }
            log::info!("Next sync in {}m", interval.as_secs() / 60);
            tokio::select! {
                _ = tokio::time::sleep(interval) => (),
                _ = token.cancelled() => {
                    log::info!("Sync schedule stopped");
                    return;
                }
            }
        }
    }
}

impl Actor for SyncService {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        if let Some(interval) = self.interval {
            actix::spawn(SyncService::start_sync_cycle(
                self.orchestrator.clone(),
                self.sources_path.clone(),
                interval,
                self.token.clone(),
            ));
        }
    }
}

#[derive(Message)]
#[rtype(result = "Result<SyncSummary, anyhow::Error>")]
pub struct RunAll;

/// Runs the configured sources of one platform.
#[derive(Message)]
#[rtype(result = "Result<SyncSummary, anyhow::Error>")]
pub struct RunSource(pub String);

#[derive(Message)]
#[rtype(result = "Result<SyncJob, anyhow::Error>")]
pub struct ImportUpload {
    pub platform: String,
    pub file_name: String,
    pub data: Vec<u8>,
    pub category: Option<String>,
}

#[derive(Message)]
#[rtype(result = "Result<SyncJob, anyhow::Error>")]
pub struct ImportUrl {
    pub platform: String,
    pub url: String,
    pub category: Option<String>,
}

#[derive(Message)]
#[rtype(result = "Result<Vec<SyncJob>, anyhow::Error>")]
pub struct ListJobs(pub usize);

impl Handler<RunAll> for SyncService {
    type Result = ResponseActFuture<Self, Result<SyncSummary, anyhow::Error>>;

    fn handle(&mut self, _: RunAll, _ctx: &mut Self::Context) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let sources_path = self.sources_path.clone();
        let token = self.token.clone();
        let fut = async move { Self::sync_all(&orchestrator, &sources_path, &token).await };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<RunSource> for SyncService {
    type Result = ResponseActFuture<Self, Result<SyncSummary, anyhow::Error>>;

    fn handle(&mut self, RunSource(platform): RunSource, _ctx: &mut Self::Context) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let sources_path = self.sources_path.clone();
        let token = self.token.clone();
        let fut = async move {
            let platform = pricefeed_types::Platform::parse(&platform)?;
            let sources: Vec<SourceConfig> = config::read_sources(&sources_path)
                .await?
                .into_iter()
                .filter(|s| {
                    pricefeed_types::Platform::parse(&s.platform).is_ok_and(|p| p == platform)
                })
                .collect();
            if sources.is_empty() {
                return Err(anyhow::anyhow!("No sources configured for {platform}"));
            }
            Ok(orchestrator.run_all(&sources, &token).await)
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<ImportUpload> for SyncService {
    type Result = ResponseActFuture<Self, Result<SyncJob, anyhow::Error>>;

    fn handle(&mut self, msg: ImportUpload, _ctx: &mut Self::Context) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let fut = async move {
            orchestrator
                .import_upload(&msg.platform, &msg.file_name, msg.data, msg.category)
                .await
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<ImportUrl> for SyncService {
    type Result = ResponseActFuture<Self, Result<SyncJob, anyhow::Error>>;

    fn handle(&mut self, msg: ImportUrl, _ctx: &mut Self::Context) -> Self::Result {
        let orchestrator = self.orchestrator.clone();
        let fut = async move {
            orchestrator
                .import_url(&msg.platform, &msg.url, msg.category)
                .await
        };
        Box::pin(fut.into_actor(self))
    }
}

impl Handler<ListJobs> for SyncService {
    type Result = ResponseActFuture<Self, Result<Vec<SyncJob>, anyhow::Error>>;

    fn handle(&mut self, ListJobs(limit): ListJobs, _ctx: &mut Self::Context) -> Self::Result {
        let jobs = self.orchestrator.jobs().clone();
        let fut = async move { jobs.recent(limit).await };
        Box::pin(fut.into_actor(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{CategoryCounter, SqliteCategoryRepository};
    use crate::fetch::{self, HttpFetcher};
    use crate::product::SqliteProductRepository;
    use crate::reconcile::Reconciler;
    use crate::sync_job::SqliteSyncJobRepository;
    use pricefeed_types::sync_job::{SyncKind, SyncStatus};
    use std::sync::Arc;
    use tokio_rusqlite::Connection;

    async fn service(sources_path: PathBuf) -> Addr<SyncService> {
        let conn = Connection::open_in_memory().await.unwrap();
        let products = Arc::new(SqliteProductRepository::init(conn.clone()).await.unwrap());
        let categories = Arc::new(SqliteCategoryRepository::init(conn.clone()).await.unwrap());
        let jobs = Arc::new(SqliteSyncJobRepository::init(conn).await.unwrap());
        let client = fetch::build_client(Duration::from_secs(5)).unwrap();
        let orchestrator = SyncOrchestrator::new(
            Reconciler::new(products.clone(), categories.clone()),
            CategoryCounter::new(products, categories),
            jobs,
            Arc::new(HttpFetcher::new(client)),
            None,
        );
        SyncService::new(orchestrator, sources_path, CancellationToken::new()).start()
    }

    #[actix_rt::test]
    async fn uploads_are_listed_as_jobs() {
        let addr = service(PathBuf::from("/nonexistent/pricefeed/sources.yaml")).await;
        let job = addr
            .send(ImportUpload {
                platform: "Temu".to_string(),
                file_name: "temu.csv".to_string(),
                data: b"id;name;price\n1;Socks;2,50\n2;Hat;\n".to_vec(),
                category: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, SyncStatus::Completed);
        assert_eq!(job.sync_kind, SyncKind::CsvUpload);
        assert_eq!(job.items_synced, 2);

        let bad = addr
            .send(ImportUrl {
                platform: "temu".to_string(),
                url: "ftp://temu.example/feed.csv".to_string(),
                category: None,
            })
            .await
            .unwrap();
        assert!(bad.is_err());

        let jobs = addr.send(ListJobs(10)).await.unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[actix_rt::test]
    async fn run_all_without_sources_file() {
        let addr = service(PathBuf::from("/nonexistent/pricefeed/sources.yaml")).await;
        let summary = addr.send(RunAll).await.unwrap().unwrap();
        assert!(summary.jobs.is_empty());
        assert!(addr
            .send(RunSource("aliexpress".to_string()))
            .await
            .unwrap()
            .is_err());
    }

    #[actix_rt::test]
    async fn run_source_without_credentials_records_failure() {
        let path = std::env::temp_dir().join(format!("pricefeed-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "sources:\n  - platform: aliexpress\n    kind: hot\n  - platform: shein\n    kind: feed_url\n    url: https://shein.example/feed.csv\n    enabled: false\n",
        )
        .unwrap();
        let addr = service(path.clone()).await;
        let summary = addr
            .send(RunSource("AliExpress".to_string()))
            .await
            .unwrap()
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.jobs[0].sync_kind, SyncKind::Hot);
    }
}
