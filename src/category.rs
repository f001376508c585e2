use async_trait::async_trait;
use pricefeed_types::category::{Category, CategoryCount, CategoryRepository};
use pricefeed_types::product::{CatalogStats, ProductRepository};
use rusqlite::{params, Transaction, TransactionBehavior};
use std::sync::Arc;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::prelude::*;

pub struct SqliteCategoryRepository {
    conn: Connection,
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let conn = Transaction::new(conn, TransactionBehavior::Deferred)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category (
                    slug TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    product_count INTEGER NOT NULL DEFAULT 0
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

fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        slug: row.get(0)?,
        name: row.get(1)?,
        product_count: row.get::<_, i64>(2)?.max(0) as usize,
    })
}

impl Repository<Category> for SqliteCategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Category> for SqliteCategoryRepository {
    async fn get_one(&self, id: &IdentityOf<Category>) -> Result<Option<Category>, Self::Error> {
        let id = id.clone();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT slug, name, product_count FROM category WHERE slug = ?1")?;
                let c = stmt.query_map([id], row_to_category)?.next().transpose()?;
                Ok(c)
            })
            .await?)
    }
}

#[async_trait]
impl List<Category> for SqliteCategoryRepository {
    async fn list(&self) -> Result<Vec<Category>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT slug, name, product_count FROM category ORDER BY name")?;
                let c = stmt
                    .query_map([], row_to_category)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(c)
            })
            .await?)
    }
}

#[async_trait]
impl Save<Category> for SqliteCategoryRepository {
    async fn save(&self, c: Category) -> Result<(), Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO category (slug, name, product_count) VALUES (?1, ?2, ?3)
                    ON CONFLICT(slug) DO UPDATE SET name=?2, product_count=?3",
                    params![c.slug, c.name, c.product_count as i64],
                )?;
                Ok(())
            })
            .await?)
    }
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn register(&self, slug: &str, name: &str) -> Result<(), anyhow::Error> {
        let slug = slug.to_string();
        let name = name.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO category (slug, name, product_count) VALUES (?1, ?2, 0)",
                    params![slug, name],
                )?;
                Ok(())
            })
            .await?)
    }

    async fn update_counts(&self, counts: Vec<(String, usize)>) -> Result<(), anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("UPDATE category SET product_count = 0", [])?;
                for (slug, count) in counts {
                    tx.execute(
                        "UPDATE category SET product_count = ?2 WHERE slug = ?1",
                        params![slug, count as i64],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?)
    }
}

/// Keeps `Category::product_count` in line with the products table.
#[derive(Clone)]
pub struct CategoryCounter {
    products: Arc<dyn ProductRepository>,
    categories: Arc<dyn CategoryRepository>,
}

impl CategoryCounter {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        categories: Arc<dyn CategoryRepository>,
    ) -> Self {
        Self {
            products,
            categories,
        }
    }

    pub async fn recount(&self) -> Result<Vec<CategoryCount>, anyhow::Error> {
        let counts = self.products.count_by_category().await?;
        for c in &counts {
            self.categories.register(&c.slug, &c.name).await?;
        }
        self.categories
            .update_counts(counts.iter().map(|c| (c.slug.clone(), c.count)).collect())
            .await?;
        log::debug!("Recounted {} categories", counts.len());
        Ok(counts)
    }

    pub async fn stats(&self) -> Result<CatalogStats, anyhow::Error> {
        self.products.stats().await
    }
}
