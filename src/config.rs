use crate::aliexpress::{self, Credentials};
use anyhow::Context;
use pricefeed_types::sync_job::SyncKind;
use pricefeed_types::FeedType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "storage/catalog.db";
pub const DEFAULT_SOURCES_PATH: &str = "sources.yaml";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60 * 6);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub sources_path: String,
    pub sync_interval: Duration,
    pub fetch_timeout: Duration,
    pub sync_concurrency: usize,
    pub reconcile_concurrency: usize,
    pub aliexpress: Option<Credentials>,
    pub aliexpress_endpoint: String,
    pub target_currency: String,
    pub target_language: String,
}

fn duration_var(key: &str, default: Duration) -> Result<Duration, anyhow::Error> {
    match envmnt::exists(key) {
        true => crate::parse_duration(&envmnt::get_or(key, "")).context(format!("Invalid {key}")),
        false => Ok(default),
    }
}

fn count_var(key: &str, default: usize) -> usize {
    envmnt::get_parse::<_, usize, _>(key)
        .ok()
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let app_key = envmnt::get_or("ALIEXPRESS_APP_KEY", "");
        let app_secret = envmnt::get_or("ALIEXPRESS_APP_SECRET", "");
        let aliexpress = if app_key.is_empty() || app_secret.is_empty() {
            log::info!("AliExpress credentials not set, API sources are disabled");
            None
        } else {
            Some(Credentials {
                app_key,
                app_secret,
                tracking_id: envmnt::get_or("ALIEXPRESS_TRACKING_ID", ""),
            })
        };
        Ok(Self {
            database_path: envmnt::get_or("CATALOG_DB_PATH", DEFAULT_DB_PATH),
            sources_path: envmnt::get_or("SOURCES_PATH", DEFAULT_SOURCES_PATH),
            sync_interval: duration_var("SYNC_INTERVAL", DEFAULT_SYNC_INTERVAL)?,
            fetch_timeout: duration_var("FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT)?,
            sync_concurrency: count_var("SYNC_CONCURRENCY", DEFAULT_SYNC_CONCURRENCY),
            reconcile_concurrency: count_var(
                "RECONCILE_CONCURRENCY",
                crate::reconcile::DEFAULT_CONCURRENCY,
            ),
            aliexpress,
            aliexpress_endpoint: envmnt::get_or(
                "ALIEXPRESS_ENDPOINT",
                aliexpress::DEFAULT_ENDPOINT,
            ),
            target_currency: envmnt::get_or("TARGET_CURRENCY", pricefeed_types::DEFAULT_CURRENCY),
            target_language: envmnt::get_or("TARGET_LANGUAGE", "EN"),
        })
    }
}

/// Loads `.env`, creating an empty one on first start.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
    let path = path.as_ref();
    let name = path.to_string_lossy();
    match std::fs::File::open(path) {
        Ok(_) => envmnt::load_file(&name)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(path)?;
            envmnt::load_file(&name)?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open {name} file: {err}"));
        }
    }
    Ok(())
}

/// One configured source of listings.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub platform: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(flatten)]
    pub kind: SourceKind,
}

fn enabled() -> bool {
    true
}

fn default_pages() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Hot {
        #[serde(default)]
        category_ids: Option<String>,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_pages")]
        pages: u32,
    },
    Search {
        keywords: String,
        #[serde(default)]
        category_ids: Option<String>,
        #[serde(default)]
        min_price: Option<Decimal>,
        #[serde(default)]
        max_price: Option<Decimal>,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_pages")]
        pages: u32,
    },
    FeedUrl {
        url: String,
        #[serde(default)]
        feed_type: Option<FeedType>,
    },
}

impl SourceKind {
    pub fn sync_kind(&self) -> SyncKind {
        match self {
            Self::Hot { .. } => SyncKind::Hot,
            Self::Search { .. } => SyncKind::Search,
            Self::FeedUrl { .. } => SyncKind::FeedUrl,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceConfig>,
}

pub fn parse_sources(content: &str) -> Result<Vec<SourceConfig>, anyhow::Error> {
    let file: SourcesFile = serde_yaml::from_str(content).context("Unable to parse sources")?;
    Ok(file.sources)
}

/// A missing file means no scheduled sources.
pub async fn read_sources<P: AsRef<Path>>(path: P) -> Result<Vec<SourceConfig>, anyhow::Error> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_sources(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No sources file at {}", path.display());
            Ok(vec![])
        }
        Err(err) => Err(err).context(format!("Unable to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SOURCES: &str = r#"
sources:
  - platform: aliexpress
    kind: hot
    category_ids: "44,502"
    pages: 3
  - platform: aliexpress
    kind: search
    keywords: usb cable
    max_price: 15.5
    enabled: false
  - platform: shein
    kind: feed_url
    url: https://1drv.ms/u/s!feed
    category: Fashion
  - platform: temu
    kind: feed_url
    url: https://temu.example/feed
    feed_type: xml
"#;

    #[test]
    fn sources_from_yaml() {
        let sources = parse_sources(SOURCES).unwrap();
        assert_eq!(sources.len(), 4);
        assert_eq!(
            sources[0].kind,
            SourceKind::Hot {
                category_ids: Some("44,502".to_string()),
                page_size: 50,
                pages: 3
            }
        );
        assert!(sources[0].enabled);
        assert!(!sources[1].enabled);
        match &sources[1].kind {
            SourceKind::Search {
                keywords,
                max_price,
                pages,
                ..
            } => {
                assert_eq!(keywords, "usb cable");
                assert_eq!(*max_price, Some(dec!(15.5)));
                assert_eq!(*pages, 1);
            }
            kind => panic!("unexpected {kind:?}"),
        }
        assert_eq!(sources[2].category.as_deref(), Some("Fashion"));
        assert_eq!(sources[2].kind.sync_kind(), SyncKind::FeedUrl);
        assert_eq!(
            sources[3].kind,
            SourceKind::FeedUrl {
                url: "https://temu.example/feed".to_string(),
                feed_type: Some(FeedType::Xml)
            }
        );
    }

    #[test]
    fn counts_fall_back_to_default() {
        envmnt::set("PRICEFEED_TEST_COUNT_OK", "4");
        envmnt::set("PRICEFEED_TEST_COUNT_ZERO", "0");
        envmnt::set("PRICEFEED_TEST_COUNT_BAD", "many");
        assert_eq!(count_var("PRICEFEED_TEST_COUNT_OK", 2), 4);
        assert_eq!(count_var("PRICEFEED_TEST_COUNT_ZERO", 2), 2);
        assert_eq!(count_var("PRICEFEED_TEST_COUNT_BAD", 2), 2);
        assert_eq!(count_var("PRICEFEED_TEST_COUNT_UNSET", 2), 2);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(parse_sources("sources:\n  - platform: x\n    kind: scrape\n").is_err());
    }

    #[tokio::test]
    async fn missing_sources_file_is_empty() {
        let sources = read_sources("/nonexistent/pricefeed/sources.yaml").await.unwrap();
        assert!(sources.is_empty());
    }
}
