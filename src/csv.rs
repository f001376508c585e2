use crate::feed::{FeedBatch, FeedError, FeedRow, FieldAliases, FieldSource, SkipReason};
use ::csv::{ReaderBuilder, StringRecord, Trim};

pub const CSV_ALIASES: FieldAliases = FieldAliases {
    external_id: &["external_id", "id", "ProductId", "product_id", "item_id", "sku"],
    name: &["name", "title", "Product Title", "product_name", "product_title"],
    description: &["description", "Product Description", "product_description", "desc"],
    price: &["price", "sale_price", "Discount Price", "discount_price", "current_price"],
    original_price: &["original_price", "Original Price", "regular_price", "list_price", "old_price"],
    image: &["image", "image_url", "Image Url", "image_link", "main_image", "picture"],
    images: &["images", "additional_images", "additional_image_link"],
    affiliate_url: &[
        "affiliate_url",
        "Promotion Link",
        "promotion_link",
        "link",
        "url",
        "product_url",
        "deeplink",
    ],
    category: &["category", "category_name", "product_type"],
    brand: &["brand", "vendor", "manufacturer"],
    in_stock: &["in_stock", "availability", "available", "stock"],
};

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Picks the most frequent of `,` `;` and tab in the header line.
pub fn detect_delimiter(data: &[u8]) -> u8 {
    let header = data.split(|b| *b == b'\n').next().unwrap_or_default();
    [b',', b';', b'\t']
        .into_iter()
        .map(|d| (d, header.iter().filter(|b| **b == d).count()))
        .fold((b',', 0), |best, (d, count)| if count > best.1 { (d, count) } else { best })
        .0
}

struct CsvRecord<'a> {
    headers: &'a [String],
    record: &'a StringRecord,
}

impl CsvRecord<'_> {
    fn values<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s str> + 's {
        self.headers
            .iter()
            .enumerate()
            .filter(move |(_, h)| h.eq_ignore_ascii_case(name))
            .filter_map(|(i, _)| self.record.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

impl FieldSource for CsvRecord<'_> {
    fn first(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|n| self.values(n).next())
            .map(ToString::to_string)
    }

    fn all(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .flat_map(|n| self.values(n).collect::<Vec<_>>())
            .flat_map(|v| v.split('|'))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

pub fn parse(data: &[u8]) -> Result<FeedBatch, FeedError> {
    let data = data.strip_prefix(BOM).unwrap_or(data);
    let mut rdr = ReaderBuilder::new()
        .delimiter(detect_delimiter(data))
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(data);
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|err| FeedError::MalformedCsv(err.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut batch = FeedBatch::default();
    for (i, record) in rdr.records().enumerate() {
        let position = i + 1;
        let record = match record {
            Ok(r) => r,
            Err(err) => {
                batch.skip(position, SkipReason::Undecodable(err.to_string()));
                continue;
            }
        };
        let source = CsvRecord {
            headers: &headers,
            record: &record,
        };
        match FeedRow::resolve(&source, &CSV_ALIASES) {
            Ok(row) => batch.rows.push(row),
            Err(reason) => batch.skip(position, reason),
        }
    }
    log::info!(
        "Parsed CSV feed: {} rows, {} skipped",
        batch.rows.len(),
        batch.skipped.len()
    );
    Ok(batch)
}
