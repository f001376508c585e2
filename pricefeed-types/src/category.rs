use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::{GetIdentity, Identity, RefIdentity, Repository};

#[derive(Id, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[Id(ref_id, get_id)]
pub struct Category {
    #[id]
    pub slug: String,
    pub name: String,
    pub product_count: usize,
}

/// Products per slug as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCount {
    pub slug: String,
    pub name: String,
    pub count: usize,
}

#[async_trait]
pub trait CategoryRepository:
    Repository<Category, Error = anyhow::Error>
    + Save<Category>
    + Get<Category>
    + List<Category>
    + Send
    + Sync
{
    /// Inserts the category unless the slug is already known.
    async fn register(&self, slug: &str, name: &str) -> Result<(), anyhow::Error>;
    /// Overwrites `product_count` of every stored category in one transaction.
    async fn update_counts(&self, counts: Vec<(String, usize)>) -> Result<(), anyhow::Error>;
}
