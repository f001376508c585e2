use crate::Platform;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One source's offer for one item, in canonical shape, before it is merged
/// into the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Listing {
    pub source_platform: Platform,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub primary_image: Option<String>,
    pub image_set: Vec<String>,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub currency: String,
    pub affiliate_url: Option<String>,
    pub category_name: String,
    pub brand: Option<String>,
    pub in_stock: bool,
}

impl Listing {
    pub fn discount_percent(&self) -> Option<u8> {
        discount_percent(self.price, self.original_price)
    }
}

/// `floor((original - price) / original * 100)`, only for an actual discount.
pub fn discount_percent(price: Decimal, original: Option<Decimal>) -> Option<u8> {
    let original = original.filter(|o| o.is_sign_positive() && !o.is_zero())?;
    if original <= price {
        return None;
    }
    ((original - price) / original * Decimal::ONE_HUNDRED)
        .floor()
        .to_u8()
}
