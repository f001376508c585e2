use crate::aliexpress::ApiProduct;
use crate::feed::{FeedRow, SkipReason, Skipped};
use pricefeed_types::listing::Listing;
use pricefeed_types::{Platform, DEFAULT_CATEGORY, DEFAULT_CURRENCY};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub enum RawListing {
    Api(ApiProduct),
    Feed(FeedRow),
}

/// Values a source does not always carry.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ListingDefaults {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

impl Default for ListingDefaults {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            category: default_category(),
        }
    }
}

impl ListingDefaults {
    pub fn with_category(category: Option<String>) -> Self {
        Self {
            category: category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(default_category),
            ..Default::default()
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn to_listing(
    platform: &Platform,
    raw: RawListing,
    defaults: &ListingDefaults,
) -> Result<Listing, SkipReason> {
    match raw {
        RawListing::Api(p) => from_api(platform, p, defaults),
        RawListing::Feed(row) => Ok(from_feed(platform, row, defaults)),
    }
}

fn from_api(
    platform: &Platform,
    p: ApiProduct,
    defaults: &ListingDefaults,
) -> Result<Listing, SkipReason> {
    let price = p.sale_price();
    let original_price = p.original_price();
    let price = if price.is_zero() {
        original_price.unwrap_or_default()
    } else {
        price
    };
    let external_id = non_empty(p.product_id).ok_or(SkipReason::MissingExternalId)?;
    let title = non_empty(p.product_title).ok_or(SkipReason::MissingTitle)?;
    let main_image = non_empty(p.product_main_image_url);
    let mut image_set: Vec<String> = main_image.iter().cloned().collect();
    for image in p.product_small_image_urls.unwrap_or_default().string {
        if !image.is_empty() && !image_set.contains(&image) {
            image_set.push(image);
        }
    }
    Ok(Listing {
        source_platform: platform.clone(),
        external_id,
        title,
        description: String::new(),
        primary_image: main_image.or_else(|| image_set.first().cloned()),
        image_set,
        price,
        original_price,
        currency: non_empty(p.target_sale_price_currency)
            .unwrap_or_else(|| defaults.currency.clone()),
        affiliate_url: non_empty(p.promotion_link).or(non_empty(p.product_detail_url)),
        category_name: non_empty(p.second_level_category_name)
            .or(non_empty(p.first_level_category_name))
            .unwrap_or_else(|| defaults.category.clone()),
        brand: None,
        in_stock: true,
    })
}

fn from_feed(platform: &Platform, row: FeedRow, defaults: &ListingDefaults) -> Listing {
    let mut image_set: Vec<String> = row.image.iter().cloned().collect();
    image_set.extend(row.images);
    Listing {
        source_platform: platform.clone(),
        external_id: row.external_id,
        title: row.name,
        description: row.description,
        primary_image: row.image,
        image_set,
        price: row.price,
        original_price: row.original_price,
        currency: defaults.currency.clone(),
        affiliate_url: row.affiliate_url,
        category_name: non_empty(row.category).unwrap_or_else(|| defaults.category.clone()),
        brand: row.brand,
        in_stock: row.in_stock,
    }
}

/// Transforms a whole batch, collecting what had to be left out.
pub fn to_listings<I>(
    platform: &Platform,
    raws: I,
    defaults: &ListingDefaults,
) -> (Vec<Listing>, Vec<Skipped>)
where
    I: IntoIterator<Item = RawListing>,
{
    let mut listings = vec![];
    let mut skipped = vec![];
    for (i, raw) in raws.into_iter().enumerate() {
        match to_listing(platform, raw, defaults) {
            Ok(l) => listings.push(l),
            Err(reason) => {
                log::warn!("{platform}: skipping item {}: {reason}", i + 1);
                skipped.push(Skipped {
                    position: i + 1,
                    reason,
                });
            }
        }
    }
    (listings, skipped)
}
