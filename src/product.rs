use async_trait::async_trait;
use pricefeed_types::category::CategoryCount;
use pricefeed_types::product::{CatalogStats, PriceEntry, Product, ProductRepository};
use pricefeed_types::Platform;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::prelude::*;
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = "id, name, description, image, images, brand, category, category_slug, prices, best_price, best_platform, discount_percent, created_at, updated_at";

pub struct SqliteProductRepository {
    conn: Connection,
}

impl SqliteProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "synchronous", &"NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            let conn = Transaction::new(conn, TransactionBehavior::Deferred)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    image TEXT,
                    images TEXT NOT NULL,
                    brand TEXT,
                    category TEXT NOT NULL,
                    category_slug TEXT NOT NULL,
                    prices TEXT NOT NULL,
                    best_price TEXT NOT NULL,
                    best_platform TEXT,
                    discount_percent INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS source_id (
                    platform TEXT NOT NULL,
                    external_id TEXT NOT NULL,
                    product_id BLOB NOT NULL,
                    PRIMARY KEY (platform, external_id)
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS source_id_external_id ON source_id (external_id)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS product_category_slug ON product (category_slug)",
                [],
            )?;
            conn.commit()?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    let images: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(4)?).map_err(|err| conversion_error(4, err))?;
    let prices: Vec<PriceEntry> =
        serde_json::from_str(&row.get::<_, String>(8)?).map_err(|err| conversion_error(8, err))?;
    let best_price =
        Decimal::from_str(&row.get::<_, String>(9)?).map_err(|err| conversion_error(9, err))?;
    let best_platform = row
        .get::<_, Option<String>>(10)?
        .map(Platform::parse)
        .transpose()
        .map_err(|err| conversion_error(10, err))?;
    let discount_percent: Option<i64> = row.get(11)?;
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        image: row.get(3)?,
        images,
        brand: row.get(5)?,
        category: row.get(6)?,
        category_slug: row.get(7)?,
        prices,
        best_price,
        best_platform,
        discount_percent: discount_percent.map(|d| d.clamp(0, 100) as u8),
        source_ids: BTreeMap::new(),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn source_ids(
    conn: &rusqlite::Connection,
    product_id: Uuid,
) -> rusqlite::Result<BTreeMap<Platform, String>> {
    let mut stmt =
        conn.prepare("SELECT platform, external_id FROM source_id WHERE product_id = ?1")?;
    let ids = stmt
        .query_map([product_id], |row| {
            let platform = Platform::parse(row.get::<_, String>(0)?)
                .map_err(|err| conversion_error(0, err))?;
            Ok((platform, row.get::<_, String>(1)?))
        })?
        .collect::<Result<_, _>>()?;
    Ok(ids)
}

fn read_product(conn: &rusqlite::Connection, id: Uuid) -> rusqlite::Result<Option<Product>> {
    let product = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM product WHERE id = ?1"),
            [id],
            row_to_product,
        )
        .optional()?;
    match product {
        Some(mut p) => {
            p.source_ids = source_ids(conn, id)?;
            Ok(Some(p))
        }
        None => Ok(None),
    }
}

fn write_source_ids(conn: &rusqlite::Connection, product: &Product) -> rusqlite::Result<()> {
    for (platform, external_id) in &product.source_ids {
        conn.execute(
            "INSERT OR REPLACE INTO source_id (platform, external_id, product_id) VALUES (?1, ?2, ?3)",
            params![platform.as_str(), external_id, product.id],
        )?;
    }
    Ok(())
}

impl Repository<Product> for SqliteProductRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Save<Product> for SqliteProductRepository {
    async fn save(&self, p: Product) -> Result<(), Self::Error> {
        let images = serde_json::to_string(&p.images)?;
        let prices = serde_json::to_string(&p.prices)?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO product (id, name, description, image, images, brand, category, category_slug, prices, best_price, best_platform, discount_percent, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                    ON CONFLICT(id) DO UPDATE SET name=?2, description=?3, image=?4, images=?5, brand=?6, category=?7, category_slug=?8, prices=?9, best_price=?10, best_platform=?11, discount_percent=?12, created_at=?13, updated_at=?14",
                    params![
                        p.id,
                        p.name,
                        p.description,
                        p.image,
                        images,
                        p.brand,
                        p.category,
                        p.category_slug,
                        prices,
                        p.best_price.to_string(),
                        p.best_platform.as_ref().map(Platform::as_str),
                        p.discount_percent.map(i64::from),
                        p.created_at,
                        p.updated_at,
                    ],
                )?;
                write_source_ids(&tx, &p)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Get<Product> for SqliteProductRepository {
    async fn get_one(&self, id: &IdentityOf<Product>) -> Result<Option<Product>, Self::Error> {
        let id = *id;
        Ok(self.conn.call(move |conn| Ok(read_product(conn, id)?)).await?)
    }
}

#[async_trait]
impl List<Product> for SqliteProductRepository {
    async fn list(&self) -> Result<Vec<Product>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut ids: HashMap<Uuid, BTreeMap<Platform, String>> = HashMap::new();
                {
                    let mut stmt =
                        conn.prepare("SELECT product_id, platform, external_id FROM source_id")?;
                    let rows = stmt.query_map([], |row| {
                        let platform = Platform::parse(row.get::<_, String>(1)?)
                            .map_err(|err| conversion_error(1, err))?;
                        Ok((row.get::<_, Uuid>(0)?, platform, row.get::<_, String>(2)?))
                    })?;
                    for row in rows {
                        let (id, platform, external_id) = row?;
                        ids.entry(id).or_default().insert(platform, external_id);
                    }
                }
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRODUCT_COLUMNS} FROM product ORDER BY created_at"
                ))?;
                let p = stmt
                    .query_map([], row_to_product)?
                    .map(|p| {
                        p.map(|mut p| {
                            p.source_ids = ids.remove(&p.id).unwrap_or_default();
                            p
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(p)
            })
            .await?)
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn find_by_external_id(
        &self,
        platform: &Platform,
        external_id: &str,
    ) -> Result<Option<Product>, anyhow::Error> {
        let platform = platform.to_string();
        let external_id = external_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let id: Option<Uuid> = conn
                    .query_row(
                        "SELECT product_id FROM source_id WHERE platform = ?1 AND external_id = ?2",
                        params![platform, external_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match id {
                    Some(id) => Ok(read_product(conn, id)?),
                    None => Ok(None),
                }
            })
            .await?)
    }

    async fn find_linkable(
        &self,
        platform: &Platform,
        external_id: &str,
    ) -> Result<Option<Product>, anyhow::Error> {
        let platform = platform.to_string();
        let external_id = external_id.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let id: Option<Uuid> = conn
                    .query_row(
                        "SELECT s.product_id FROM source_id s
                        WHERE s.external_id = ?2 AND s.platform != ?1
                        AND NOT EXISTS (SELECT 1 FROM source_id o WHERE o.product_id = s.product_id AND o.platform = ?1)
                        ORDER BY s.rowid LIMIT 1",
                        params![platform, external_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match id {
                    Some(id) => Ok(read_product(conn, id)?),
                    None => Ok(None),
                }
            })
            .await?)
    }

    async fn save_offers(&self, p: &Product) -> Result<(), anyhow::Error> {
        let prices = serde_json::to_string(&p.prices)?;
        let p = p.clone();
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE product SET prices = ?2, best_price = ?3, best_platform = ?4, updated_at = ?5 WHERE id = ?1",
                    params![
                        p.id,
                        prices,
                        p.best_price.to_string(),
                        p.best_platform.as_ref().map(Platform::as_str),
                        p.updated_at,
                    ],
                )?;
                if updated > 0 {
                    write_source_ids(&tx, &p)?;
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Product not found"));
        }
        Ok(())
    }

    async fn count_by_category(&self) -> Result<Vec<CategoryCount>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT category_slug, MIN(category), COUNT(*) FROM product GROUP BY category_slug ORDER BY category_slug",
                )?;
                let counts = stmt
                    .query_map([], |row| {
                        Ok(CategoryCount {
                            slug: row.get(0)?,
                            name: row.get(1)?,
                            count: row.get::<_, i64>(2)?.max(0) as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(counts)
            })
            .await?)
    }

    async fn stats(&self) -> Result<CatalogStats, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let count = |sql: &str| -> rusqlite::Result<usize> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                        .map(|c| c.max(0) as usize)
                };
                Ok(CatalogStats {
                    products: count("SELECT COUNT(*) FROM product")?,
                    categories: count("SELECT COUNT(DISTINCT category_slug) FROM product")?,
                    platforms: count("SELECT COUNT(DISTINCT platform) FROM source_id")?,
                })
            })
            .await?)
    }
}
