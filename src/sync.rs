use crate::aliexpress::{AffiliateApi, ApiProduct, HotQuery, SearchQuery};
use crate::category::CategoryCounter;
use crate::config::{SourceConfig, SourceKind};
use crate::feed::FeedBatch;
use crate::fetch::{self, FeedFetcher};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::transform::{self, ListingDefaults, RawListing};
use derive_more::{Display, Error};
use futures::future;
use futures::stream::{self, StreamExt};
use log_error::LogError;
use pricefeed_types::sync_job::{SyncJob, SyncJobRepository, SyncKind, SyncStatus};
use pricefeed_types::{FeedType, Platform, DEFAULT_CURRENCY};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use typesafe_repository::async_ops::Save;

#[derive(Debug, Display, Error)]
pub enum SyncError {
    #[display("No affiliate API credentials configured")]
    MissingCredentials,
    /// The job ran to the end but its terminal state could not be stored.
    #[display("Sync job {} {} but was not recorded: {reason}", job.id, job.status)]
    Unrecorded { job: SyncJob, reason: String },
}

/// Outcome of one pass over all configured sources.
#[derive(Serialize, Debug, Default, Clone)]
pub struct SyncSummary {
    pub jobs: Vec<SyncJob>,
    pub completed: usize,
    pub failed: usize,
    /// Sources rejected before a job could be created.
    pub rejected: usize,
    /// Jobs that ran but whose final state is missing from the store. They
    /// are also listed in `jobs` and counted by status.
    pub unrecorded: usize,
    pub items_synced: usize,
    pub items_skipped: usize,
}

impl SyncSummary {
    fn push(&mut self, job: SyncJob) {
        match job.status {
            SyncStatus::Completed => {
                self.completed += 1;
                self.items_synced += job.items_synced;
                self.items_skipped += job.items_skipped;
            }
            SyncStatus::Failed => self.failed += 1,
            SyncStatus::Running => (),
        }
        self.jobs.push(job);
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    reconciler: Reconciler,
    counter: CategoryCounter,
    jobs: Arc<dyn SyncJobRepository>,
    fetcher: Arc<dyn FeedFetcher>,
    api: Option<Arc<dyn AffiliateApi>>,
    concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        reconciler: Reconciler,
        counter: CategoryCounter,
        jobs: Arc<dyn SyncJobRepository>,
        fetcher: Arc<dyn FeedFetcher>,
        api: Option<Arc<dyn AffiliateApi>>,
    ) -> Self {
        Self {
            reconciler,
            counter,
            jobs,
            fetcher,
            api,
            concurrency: crate::config::DEFAULT_SYNC_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn counter(&self) -> &CategoryCounter {
        &self.counter
    }

    pub fn jobs(&self) -> &Arc<dyn SyncJobRepository> {
        &self.jobs
    }

    /// Runs one source to a terminal job. Only validation errors and store
    /// failures are returned as `Err`; fetch and parse errors end up in the job.
    pub async fn run_sync(&self, source: &SourceConfig) -> Result<SyncJob, anyhow::Error> {
        let platform = Platform::parse(&source.platform)?;
        if let SourceKind::FeedUrl { url, .. } = &source.kind {
            fetch::validate_url(url)?;
        }
        let defaults = defaults_for(source);
        let job = SyncJob::start(platform.clone(), source.kind.sync_kind());
        self.run_job(job, self.fetch_and_reconcile(&platform, &source.kind, &defaults))
            .await
    }

    /// Parses, transforms and reconciles a feed already in memory.
    pub async fn import_feed(
        &self,
        platform: &Platform,
        data: &[u8],
        feed_type: FeedType,
    ) -> Result<ReconcileReport, anyhow::Error> {
        let report = self
            .ingest_feed(platform, data, feed_type, &ListingDefaults::default())
            .await?;
        self.recount().await;
        Ok(report)
    }

    /// Imports an uploaded file, recorded as a `csv_upload`/`xml_upload` job.
    pub async fn import_upload(
        &self,
        platform: &str,
        file_name: &str,
        data: Vec<u8>,
        category: Option<String>,
    ) -> Result<SyncJob, anyhow::Error> {
        let platform = Platform::parse(platform)?;
        let feed_type = FeedType::from_file_name(file_name)?;
        let kind = match feed_type {
            FeedType::Csv => SyncKind::CsvUpload,
            FeedType::Xml => SyncKind::XmlUpload,
        };
        let defaults = ListingDefaults::with_category(category);
        let job = SyncJob::start(platform.clone(), kind);
        self.run_job(job, self.ingest_feed(&platform, &data, feed_type, &defaults))
            .await
    }

    /// One-off run of a remote feed.
    pub async fn import_url(
        &self,
        platform: &str,
        url: &str,
        category: Option<String>,
    ) -> Result<SyncJob, anyhow::Error> {
        let source = SourceConfig {
            platform: platform.to_string(),
            enabled: true,
            category,
            currency: None,
            kind: SourceKind::FeedUrl {
                url: url.trim().to_string(),
                feed_type: None,
            },
        };
        self.run_sync(&source).await
    }

    /// Runs every enabled source. A failing source never stops the others;
    /// after cancellation no new source is started.
    pub async fn run_all(&self, sources: &[SourceConfig], token: &CancellationToken) -> SyncSummary {
        let results = stream::iter(sources.iter().filter(|s| s.enabled))
            .take_while(|_| future::ready(!token.is_cancelled()))
            .map(|source| async move {
                self.run_sync(source).await.map_err(|err| {
                    log::error!("Source {} not synced: {err:#}", source.platform);
                    err
                })
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;
        let mut summary = SyncSummary::default();
        for r in results {
            match r.map_err(|err| err.downcast::<SyncError>()) {
                Ok(job) => summary.push(job),
                Err(Ok(SyncError::Unrecorded { job, .. })) => {
                    summary.unrecorded += 1;
                    summary.push(job);
                }
                Err(_) => summary.rejected += 1,
            }
        }
        log::info!(
            "Sync finished: {} completed, {} failed, {} rejected, {} unrecorded, {} items, {} skipped",
            summary.completed,
            summary.failed,
            summary.rejected,
            summary.unrecorded,
            summary.items_synced,
            summary.items_skipped
        );
        summary
    }

    async fn run_job<F>(&self, mut job: SyncJob, work: F) -> Result<SyncJob, anyhow::Error>
    where
        F: std::future::Future<Output = Result<ReconcileReport, anyhow::Error>>,
    {
        self.jobs.save(job.clone()).await?;
        log::info!("{} {} sync started ({})", job.platform, job.sync_kind, job.id);
        match work.await {
            Ok(report) => {
                job.items_skipped = report.skipped;
                job.complete(report.items());
                log::info!(
                    "{} {} sync completed: {} items, {} skipped",
                    job.platform,
                    job.sync_kind,
                    job.items_synced,
                    job.items_skipped
                );
            }
            Err(err) => {
                log::error!("{} {} sync failed: {err:#}", job.platform, job.sync_kind);
                job.fail(format!("{err:#}"));
            }
        }
        self.recount().await;
        if let Err(err) = self.jobs.save(job.clone()).await {
            log::warn!("Unable to record sync job {}, retrying: {err:#}", job.id);
            if let Err(err) = self.jobs.save(job.clone()).await {
                return Err(SyncError::Unrecorded {
                    job,
                    reason: format!("{err:#}"),
                }
                .into());
            }
        }
        Ok(job)
    }

    async fn recount(&self) {
        self.counter
            .recount()
            .await
            .log_error("Unable to recount categories");
    }

    async fn fetch_and_reconcile(
        &self,
        platform: &Platform,
        kind: &SourceKind,
        defaults: &ListingDefaults,
    ) -> Result<ReconcileReport, anyhow::Error> {
        match kind {
            SourceKind::Hot {
                category_ids,
                page_size,
                pages,
            } => {
                let api = self.api.as_ref().ok_or(SyncError::MissingCredentials)?;
                let mut report = ReconcileReport::default();
                for page_no in 1..=*pages {
                    let query = HotQuery {
                        category_ids: category_ids.clone(),
                        page_no,
                        page_size: *page_size,
                    };
                    let products = api.hot_products(&query).await?.into_result()?;
                    if products.is_empty() {
                        break;
                    }
                    report.merge(self.reconcile_api(platform, products, defaults).await);
                }
                Ok(report)
            }
            SourceKind::Search {
                keywords,
                category_ids,
                min_price,
                max_price,
                page_size,
                pages,
            } => {
                let api = self.api.as_ref().ok_or(SyncError::MissingCredentials)?;
                let mut report = ReconcileReport::default();
                for page_no in 1..=*pages {
                    let query = SearchQuery {
                        keywords: keywords.clone(),
                        category_ids: category_ids.clone(),
                        min_price: *min_price,
                        max_price: *max_price,
                        page_no,
                        page_size: *page_size,
                    };
                    let products = api.search(&query).await?.into_result()?;
                    if products.is_empty() {
                        break;
                    }
                    report.merge(self.reconcile_api(platform, products, defaults).await);
                }
                Ok(report)
            }
            SourceKind::FeedUrl { url, feed_type } => {
                let feed = self.fetcher.fetch(url).await?;
                let feed_type = feed_type.unwrap_or_else(|| fetch::detect_feed_type(url, &feed));
                self.ingest_feed(platform, &feed.body, feed_type, defaults)
                    .await
            }
        }
    }

    async fn reconcile_api(
        &self,
        platform: &Platform,
        products: Vec<ApiProduct>,
        defaults: &ListingDefaults,
    ) -> ReconcileReport {
        let (listings, skipped) =
            transform::to_listings(platform, products.into_iter().map(RawListing::Api), defaults);
        let mut report = self.reconciler.reconcile(platform, listings).await;
        report.skipped = skipped.len();
        report
    }

    async fn ingest_feed(
        &self,
        platform: &Platform,
        data: &[u8],
        feed_type: FeedType,
        defaults: &ListingDefaults,
    ) -> Result<ReconcileReport, anyhow::Error> {
        let FeedBatch { rows, skipped } = match feed_type {
            FeedType::Csv => crate::csv::parse(data)?,
            FeedType::Xml => crate::xml::parse(data)?,
        };
        if !skipped.is_empty() {
            log::warn!("{platform}: {} feed items skipped", skipped.len());
        }
        let (listings, dropped) =
            transform::to_listings(platform, rows.into_iter().map(RawListing::Feed), defaults);
        let mut report = self.reconciler.reconcile(platform, listings).await;
        report.skipped = skipped.len() + dropped.len();
        Ok(report)
    }
}

fn defaults_for(source: &SourceConfig) -> ListingDefaults {
    let mut defaults = ListingDefaults::with_category(source.category.clone());
    defaults.currency = source
        .currency
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
    defaults
}
