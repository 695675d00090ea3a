//! Core domain model for MDF.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mdf-core";

/// Which marketplace surface a listing was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Catalog,
    Search,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Catalog => "catalog",
            SourceTag::Search => "search",
        }
    }
}

/// A raw listing as captured from the live view. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub title: String,
    pub price_raw: String,
    pub url: String,
    pub source: SourceTag,
}

impl ListingRecord {
    /// Dedup identity: the URL when present, otherwise title + raw price.
    pub fn uniqueness_key(&self) -> String {
        if self.url.is_empty() {
            format!("{}\u{1f}{}", self.title, self.price_raw)
        } else {
            self.url.clone()
        }
    }
}

/// Attributes decomposed out of a free-text listing title. An empty string
/// means the pattern did not match; absence is never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleAttributes {
    pub brand: String,
    pub series: String,
    pub screen_diagonal: String,
    pub cpu_family: String,
    pub cpu_model: String,
    pub ram_gb: String,
    pub storage_type: String,
    pub storage_capacity: String,
    pub gpu_brand: String,
    pub gpu_model: String,
    pub gpu_memory_gb: String,
    /// Derived deterministically from `price_raw`: digits only, 0 if none.
    pub price_numeric: i64,
}

/// A captured listing together with its decomposed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecomposedListing {
    #[serde(flatten)]
    pub record: ListingRecord,
    #[serde(flatten)]
    pub attributes: TitleAttributes,
}

/// Unique brand names accumulated during incremental discovery.
pub type BrandSet = BTreeSet<String>;

/// Model-group label mapped to its best offers, ascending by numeric price.
pub type RankedGroups = BTreeMap<String, Vec<DecomposedListing>>;
