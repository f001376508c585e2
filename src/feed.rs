use crate::price;
use derive_more::{Display, Error};
use rust_decimal::Decimal;
use serde::Serialize;

/// Canonical row shared by the CSV and XML parsers.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FeedRow {
    pub external_id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub image: Option<String>,
    pub images: Vec<String>,
    pub affiliate_url: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub in_stock: bool,
}

#[derive(Debug, Display, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    #[display("missing external id")]
    MissingExternalId,
    #[display("missing title")]
    MissingTitle,
    #[display("undecodable record: {_0}")]
    Undecodable(String),
}

/// Item the parser or transformer had to leave out. `position` is 1-based
/// (data row for CSV, item for XML).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub position: usize,
    pub reason: SkipReason,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeedBatch {
    pub rows: Vec<FeedRow>,
    pub skipped: Vec<Skipped>,
}

impl FeedBatch {
    pub fn skip(&mut self, position: usize, reason: SkipReason) {
        log::warn!("Skipping feed item {position}: {reason}");
        self.skipped.push(Skipped { position, reason });
    }
}

#[derive(Debug, Display, Error)]
pub enum FeedError {
    #[error(ignore)]
    #[display("Malformed XML: {_0}")]
    MalformedXml(String),
    #[error(ignore)]
    #[display("Unreadable CSV: {_0}")]
    MalformedCsv(String),
}

/// Ordered source names for every canonical field. The first name with a
/// non-empty value wins.
pub struct FieldAliases {
    pub external_id: &'static [&'static str],
    pub name: &'static [&'static str],
    pub description: &'static [&'static str],
    pub price: &'static [&'static str],
    pub original_price: &'static [&'static str],
    pub image: &'static [&'static str],
    pub images: &'static [&'static str],
    pub affiliate_url: &'static [&'static str],
    pub category: &'static [&'static str],
    pub brand: &'static [&'static str],
    pub in_stock: &'static [&'static str],
}

/// A single parsed record, addressable by source field name.
pub trait FieldSource {
    fn first(&self, names: &[&str]) -> Option<String>;
    /// Every value found under any of `names`, in order.
    fn all(&self, names: &[&str]) -> Vec<String>;
}

const OUT_OF_STOCK: [&str; 8] = [
    "false",
    "0",
    "no",
    "out of stock",
    "out_of_stock",
    "sold out",
    "unavailable",
    "oos",
];

pub fn parse_in_stock(value: Option<&str>) -> bool {
    match value {
        Some(v) => !OUT_OF_STOCK.contains(&v.trim().to_lowercase().as_str()),
        None => true,
    }
}

impl FeedRow {
    pub fn resolve<S: FieldSource>(source: &S, aliases: &FieldAliases) -> Result<Self, SkipReason> {
        let external_id = source
            .first(aliases.external_id)
            .ok_or(SkipReason::MissingExternalId)?;
        let name = source.first(aliases.name).ok_or(SkipReason::MissingTitle)?;
        let original_price = source
            .first(aliases.original_price)
            .map(|p| price::normalize(Some(&p)))
            .filter(|p| !p.is_zero());
        let price = match source
            .first(aliases.price)
            .map(|p| price::normalize(Some(&p)))
        {
            Some(p) if !p.is_zero() => p,
            _ => original_price.unwrap_or_default(),
        };
        let image = source.first(aliases.image);
        let mut images: Vec<String> = Vec::new();
        for i in source.all(aliases.images) {
            if Some(&i) != image.as_ref() && !images.contains(&i) {
                images.push(i);
            }
        }
        Ok(Self {
            external_id,
            name,
            description: source.first(aliases.description).unwrap_or_default(),
            price,
            original_price,
            image,
            images,
            affiliate_url: source.first(aliases.affiliate_url),
            category: source.first(aliases.category),
            brand: source.first(aliases.brand),
            in_stock: parse_in_stock(source.first(aliases.in_stock).as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_values() {
        assert!(parse_in_stock(None));
        assert!(parse_in_stock(Some("in stock")));
        assert!(parse_in_stock(Some("yes")));
        assert!(!parse_in_stock(Some("Out Of Stock")));
        assert!(!parse_in_stock(Some(" 0 ")));
        assert!(!parse_in_stock(Some("OOS")));
    }
}
