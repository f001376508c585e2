use crate::category::CategoryCount;
use crate::listing::Listing;
use crate::Platform;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::{GetIdentity, Identity, RefIdentity, Repository};
use uuid::Uuid;

/// One platform's current offer for a product.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PriceEntry {
    pub platform: Platform,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub currency: String,
    pub affiliate_url: Option<String>,
    pub in_stock: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl PriceEntry {
    pub fn from_listing(listing: &Listing, now: OffsetDateTime) -> Self {
        Self {
            platform: listing.source_platform.clone(),
            price: listing.price,
            original_price: listing.original_price,
            currency: listing.currency.clone(),
            affiliate_url: listing.affiliate_url.clone(),
            in_stock: listing.in_stock,
            last_updated: now,
        }
    }
}

#[derive(Id, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[Id(ref_id, get_id)]
pub struct Product {
    #[id]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub images: Vec<String>,
    pub brand: Option<String>,
    pub category: String,
    pub category_slug: String,
    pub prices: Vec<PriceEntry>,
    pub best_price: Decimal,
    pub best_platform: Option<Platform>,
    pub discount_percent: Option<u8>,
    pub source_ids: BTreeMap<Platform, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Product {
    pub fn from_listing(listing: &Listing, now: OffsetDateTime) -> Self {
        let mut images = Vec::with_capacity(listing.image_set.len() + 1);
        for image in listing.primary_image.iter().chain(listing.image_set.iter()) {
            if !images.contains(image) {
                images.push(image.clone());
            }
        }
        let mut product = Self {
            id: Uuid::new_v4(),
            name: listing.title.clone(),
            description: listing.description.clone(),
            image: listing.primary_image.clone(),
            images,
            brand: listing.brand.clone(),
            category: listing.category_name.clone(),
            category_slug: category_slug(&listing.category_name),
            prices: vec![PriceEntry::from_listing(listing, now)],
            best_price: Decimal::ZERO,
            best_platform: None,
            discount_percent: listing.discount_percent(),
            source_ids: BTreeMap::from([(
                listing.source_platform.clone(),
                listing.external_id.clone(),
            )]),
            created_at: now,
            updated_at: now,
        };
        product.recompute_best_price();
        product
    }

    /// Replaces the entry of `entry.platform` in place; a new platform goes last.
    pub fn upsert_offer(&mut self, entry: PriceEntry) {
        match self.prices.iter_mut().find(|p| p.platform == entry.platform) {
            Some(existing) => *existing = entry,
            None => self.prices.push(entry),
        }
    }

    pub fn offer(&self, platform: &Platform) -> Option<&PriceEntry> {
        self.prices.iter().find(|p| &p.platform == platform)
    }

    pub fn recompute_best_price(&mut self) {
        match best_offer(&self.prices) {
            Some(best) => {
                self.best_price = best.price;
                self.best_platform = Some(best.platform.clone());
            }
            None => {
                self.best_price = Decimal::ZERO;
                self.best_platform = None;
            }
        }
    }
}

/// Lowest positive price; on a tie the entry stored first wins.
pub fn best_offer(prices: &[PriceEntry]) -> Option<&PriceEntry> {
    prices
        .iter()
        .filter(|p| p.price > Decimal::ZERO)
        .fold(None, |best: Option<&PriceEntry>, p| match best {
            Some(b) if b.price <= p.price => Some(b),
            _ => Some(p),
        })
}

pub fn category_slug<S: AsRef<str>>(category: S) -> String {
    let slug = category
        .as_ref()
        .trim()
        .to_lowercase()
        .replace('&', " and ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let mut res = String::with_capacity(slug.len());
    for c in slug.chars() {
        if c == '-' && res.ends_with('-') {
            continue;
        }
        res.push(c);
    }
    let res = res.trim_matches('-').to_string();
    if res.is_empty() {
        "general".to_string()
    } else {
        res
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub products: usize,
    pub categories: usize,
    pub platforms: usize,
}

#[async_trait]
pub trait ProductRepository:
    Repository<Product, Error = anyhow::Error>
    + Save<Product>
    + Get<Product>
    + List<Product>
    + Send
    + Sync
{
    async fn find_by_external_id(
        &self,
        platform: &Platform,
        external_id: &str,
    ) -> Result<Option<Product>, anyhow::Error>;
    /// Product carrying `external_id` under another platform and no offer
    /// from `platform` yet.
    async fn find_linkable(
        &self,
        platform: &Platform,
        external_id: &str,
    ) -> Result<Option<Product>, anyhow::Error>;
    /// Persists offers, best price fields, `updated_at` and source ids only.
    async fn save_offers(&self, product: &Product) -> Result<(), anyhow::Error>;
    async fn count_by_category(&self) -> Result<Vec<CategoryCount>, anyhow::Error>;
    async fn stats(&self) -> Result<CatalogStats, anyhow::Error>;
}
