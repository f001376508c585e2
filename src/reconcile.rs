use anyhow::anyhow;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use pricefeed_types::category::CategoryRepository;
use pricefeed_types::listing::Listing;
use pricefeed_types::product::{PriceEntry, Product, ProductRepository};
use pricefeed_types::Platform;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use typesafe_repository::async_ops::Save;

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub imported: usize,
    pub updated: usize,
    pub failed: usize,
    /// Items dropped before reconciliation (unparseable rows, missing id or title).
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn counts(&self) -> (usize, usize) {
        (self.imported, self.updated)
    }

    pub fn items(&self) -> usize {
        self.imported + self.updated
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.imported += other.imported;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

enum Outcome {
    Imported,
    Updated,
}

/// In-process lock per external id. Entries are dropped once nobody holds or
/// waits for them.
#[derive(Clone, Default)]
pub struct KeyLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

pub struct KeyGuard {
    locks: KeyLocks,
    key: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.clone().lock_owned().await;
        KeyGuard {
            locks: self.clone(),
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.0.lock().unwrap_or_else(PoisonError::into_inner);
        // map entry + this guard
        if Arc::strong_count(&self.mutex) == 2 {
            map.remove(&self.key);
        }
    }
}

/// Merges listings into the catalog, one product per identity key.
#[derive(Clone)]
pub struct Reconciler {
    products: Arc<dyn ProductRepository>,
    categories: Arc<dyn CategoryRepository>,
    locks: KeyLocks,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        categories: Arc<dyn CategoryRepository>,
    ) -> Self {
        Self {
            products,
            categories,
            locks: KeyLocks::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Listings sharing an external id are applied in input order; distinct
    /// ids run concurrently.
    pub async fn reconcile(&self, platform: &Platform, listings: Vec<Listing>) -> ReconcileReport {
        let total = listings.len();
        let groups = listings
            .into_iter()
            .into_group_map_by(|l| l.external_id.clone());
        let report = stream::iter(groups.into_values())
            .map(|group| self.reconcile_group(platform, group))
            .buffer_unordered(self.concurrency)
            .fold(ReconcileReport::default(), |mut acc, r| async move {
                acc.merge(r);
                acc
            })
            .await;
        log::info!(
            "{platform}: reconciled {total} listings, {} imported, {} updated, {} failed",
            report.imported,
            report.updated,
            report.failed
        );
        report
    }

    async fn reconcile_group(&self, platform: &Platform, group: Vec<Listing>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for listing in group {
            let _guard = self.locks.lock(&listing.external_id).await;
            let external_id = listing.external_id.clone();
            match self.merge(platform, listing).await {
                Ok(Outcome::Imported) => report.imported += 1,
                Ok(Outcome::Updated) => report.updated += 1,
                Err(err) => {
                    log::error!("{platform}: unable to reconcile {external_id}: {err:?}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn merge(&self, platform: &Platform, listing: Listing) -> Result<Outcome, anyhow::Error> {
        if &listing.source_platform != platform {
            return Err(anyhow!(
                "listing belongs to {}, not {platform}",
                listing.source_platform
            ));
        }
        if listing.external_id.trim().is_empty() {
            return Err(anyhow!("listing has no external id"));
        }
        let now = OffsetDateTime::now_utc();
        let existing = match self
            .products
            .find_by_external_id(platform, &listing.external_id)
            .await?
        {
            Some(p) => Some(p),
            None => {
                self.products
                    .find_linkable(platform, &listing.external_id)
                    .await?
            }
        };
        match existing {
            Some(mut product) => {
                product.upsert_offer(PriceEntry::from_listing(&listing, now));
                product
                    .source_ids
                    .insert(platform.clone(), listing.external_id.clone());
                product.recompute_best_price();
                product.updated_at = now;
                self.products.save_offers(&product).await?;
                Ok(Outcome::Updated)
            }
            None => {
                let product = Product::from_listing(&listing, now);
                self.categories
                    .register(&product.category_slug, &product.category)
                    .await?;
                self.products.save(product).await?;
                Ok(Outcome::Imported)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::SqliteCategoryRepository;
    use crate::product::SqliteProductRepository;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_rusqlite::Connection;
    use typesafe_repository::async_ops::List;

    async fn setup() -> (Reconciler, Arc<SqliteProductRepository>) {
        let conn = Connection::open_in_memory().await.unwrap();
        let products = Arc::new(SqliteProductRepository::init(conn.clone()).await.unwrap());
        let categories = Arc::new(SqliteCategoryRepository::init(conn).await.unwrap());
        (Reconciler::new(products.clone(), categories), products)
    }

    fn listing(platform: &str, id: &str, price: Decimal) -> Listing {
        Listing {
            source_platform: Platform::parse(platform).unwrap(),
            external_id: id.to_string(),
            title: format!("Item {id}"),
            description: String::new(),
            primary_image: None,
            image_set: vec![],
            price,
            original_price: None,
            currency: "EUR".to_string(),
            affiliate_url: None,
            category_name: "General".to_string(),
            brand: None,
            in_stock: true,
        }
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let (reconciler, products) = setup().await;
        let shein = Platform::parse("shein").unwrap();
        let batch = vec![
            listing("shein", "A1", dec!(10)),
            listing("shein", "A2", dec!(20)),
        ];
        let first = reconciler.reconcile(&shein, batch.clone()).await;
        assert_eq!(first.counts(), (2, 0));
        let mut before = products.list().await.unwrap();
        before.sort_by_key(|p| p.id);

        let second = reconciler.reconcile(&shein, batch).await;
        assert_eq!(second.counts(), (0, 2));
        let mut after = products.list().await.unwrap();
        after.sort_by_key(|p| p.id);
        assert_eq!(after.len(), 2);
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.best_price, b.best_price);
            assert_eq!(a.best_platform, b.best_platform);
            assert_eq!(a.prices.len(), 1);
        }
    }

    #[tokio::test]
    async fn same_key_in_batch_applies_in_order() {
        let (reconciler, products) = setup().await;
        let shein = Platform::parse("shein").unwrap();
        let batch = vec![
            listing("shein", "A1", dec!(10)),
            listing("shein", "A1", dec!(8)),
            listing("shein", "A1", dec!(12)),
        ];
        let report = reconciler.reconcile(&shein, batch).await;
        assert_eq!(report.counts(), (1, 2));
        let p = products.find_by_external_id(&shein, "A1").await.unwrap().unwrap();
        assert_eq!(p.prices.len(), 1);
        assert_eq!(p.best_price, dec!(12));
        assert!(reconciler.locks.is_empty());
    }

    #[tokio::test]
    async fn second_platform_links_and_wins_on_price() {
        let (reconciler, products) = setup().await;
        let shein = Platform::parse("shein").unwrap();
        let temu = Platform::parse("temu").unwrap();
        reconciler
            .reconcile(&shein, vec![listing("shein", "A1", dec!(19.99))])
            .await;
        let report = reconciler
            .reconcile(&temu, vec![listing("temu", "A1", dec!(14.99))])
            .await;
        assert_eq!(report.counts(), (0, 1));

        let all = products.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].prices.len(), 2);
        assert_eq!(all[0].best_price, dec!(14.99));
        assert_eq!(all[0].best_platform, Some(temu.clone()));

        // temu raises its price: shein is cheapest again
        reconciler
            .reconcile(&temu, vec![listing("temu", "A1", dec!(25))])
            .await;
        let p = products.find_by_external_id(&temu, "A1").await.unwrap().unwrap();
        assert_eq!(p.prices.len(), 2);
        assert_eq!(p.best_platform, Some(shein));
    }

    #[tokio::test]
    async fn unchanged_reimport_keeps_tied_winner() {
        let (reconciler, products) = setup().await;
        let shein = Platform::parse("shein").unwrap();
        let temu = Platform::parse("temu").unwrap();
        reconciler
            .reconcile(&shein, vec![listing("shein", "A1", dec!(15))])
            .await;
        reconciler
            .reconcile(&temu, vec![listing("temu", "A1", dec!(15))])
            .await;
        let before = products.find_by_external_id(&shein, "A1").await.unwrap().unwrap();
        assert_eq!(before.best_platform, Some(shein.clone()));

        let report = reconciler
            .reconcile(&shein, vec![listing("shein", "A1", dec!(15))])
            .await;
        assert_eq!(report.counts(), (0, 1));
        let after = products.find_by_external_id(&shein, "A1").await.unwrap().unwrap();
        assert_eq!(after.best_price, dec!(15));
        assert_eq!(after.best_platform, Some(shein));
        assert_eq!(after.prices[0].platform, before.prices[0].platform);
    }

    #[tokio::test]
    async fn foreign_listing_is_counted_as_failed() {
        let (reconciler, _) = setup().await;
        let shein = Platform::parse("shein").unwrap();
        let report = reconciler
            .reconcile(
                &shein,
                vec![
                    listing("temu", "A1", dec!(1)),
                    listing("shein", "", dec!(1)),
                    listing("shein", "A2", dec!(1)),
                ],
            )
            .await;
        assert_eq!(
            report,
            ReconcileReport {
                imported: 1,
                updated: 0,
                failed: 2,
                skipped: 0,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconciliation_loses_no_offers() {
        let (reconciler, products) = setup().await;
        let mut handles = vec![];
        for i in 0..16 {
            let reconciler = reconciler.clone();
            handles.push(tokio::spawn(async move {
                let platform = Platform::parse(format!("shop{i}")).unwrap();
                let l = listing(platform.as_str(), "SHARED", Decimal::from(100 - i));
                reconciler.reconcile(&platform, vec![l]).await
            }));
        }
        let mut total = ReconcileReport::default();
        for h in handles {
            total.merge(h.await.unwrap());
        }
        assert_eq!(total.counts(), (1, 15));

        let all = products.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].prices.len(), 16);
        assert_eq!(all[0].source_ids.len(), 16);
        assert_eq!(all[0].best_price, Decimal::from(85));
        assert!(reconciler.locks.is_empty());
    }
}
