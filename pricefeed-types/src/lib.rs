use derive_more::{Deref, Display, Error};
use lazy_regex::regex_is_match;
use serde::{Deserialize, Serialize};

pub mod category;
pub mod listing;
pub mod product;
pub mod sync_job;

pub const DEFAULT_CATEGORY: &str = "General";
pub const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(ignore)]
    #[display("Invalid platform name: {_0:?}")]
    InvalidPlatform(String),
    #[error(ignore)]
    #[display("Unsupported file type: {_0:?}")]
    UnsupportedFileType(String),
    #[error(ignore)]
    #[display("Invalid feed URL: {_0:?}")]
    InvalidUrl(String),
}

/// Source identifier, e.g. `aliexpress`. Always lower-case.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deref)]
#[serde(try_from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    pub fn parse<S: AsRef<str>>(s: S) -> Result<Self, ValidationError> {
        let name = s.as_ref().trim().to_lowercase();
        if regex_is_match!(r"^[a-z0-9_-]{1,32}$", &name) {
            Ok(Self(name))
        } else {
            Err(ValidationError::InvalidPlatform(s.as_ref().to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Platform {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> String {
        p.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    #[display("csv")]
    Csv,
    #[display("xml")]
    Xml,
}

impl FeedType {
    pub fn from_file_name<S: AsRef<str>>(name: S) -> Result<Self, ValidationError> {
        let name = name.as_ref();
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(Self::Csv),
            "xml" => Ok(Self::Xml),
            _ => Err(ValidationError::UnsupportedFileType(name.to_string())),
        }
    }
}
