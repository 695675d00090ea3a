//! Title decomposition and keyword ranking for harvested listings.
//!
//! Each attribute is matched independently against the raw title with a
//! case-insensitive, word-bounded pattern; the first match wins and a miss
//! yields an empty string. The alternation lists overlap lexically between
//! attributes (RAM vs. storage capacity, CPU vs. GPU vendor) — that is an
//! accepted precision/recall tradeoff of pattern-based extraction, not a
//! defect to patch per attribute.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;

use mdf_core::{DecomposedListing, ListingRecord, RankedGroups, TitleAttributes};

pub const CRATE_NAME: &str = "mdf-extract";

/// A ranked group never carries more than this many offers.
pub const MAX_OFFERS_PER_GROUP: usize = 3;

// Ordered alternation lists, one pattern per attribute.
static BRAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(Lenovo|HP|Dell|Asus|Acer|MSI|Apple|Samsung|Huawei|Xiaomi|Google|Microsoft|Razer|LG)\b")
        .expect("brand pattern")
});

static SERIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ThinkPad|ThinkBook|IdeaPad|Yoga|Legion|Flex|Chromebook|LOQ|Pavilion|Spectre|Envy|EliteBook|ProBook|ZBook|Omen|Inspiron|XPS|Alienware|Vostro|Latitude|G|ROG|TUF|VivoBook|ZenBook|AsusPro|Predator|Nitro|Swift|TravelMate|Extensa|Aspire|Spin|ConceptD|Blade|Stealth|Katana|Creator|Modern|Prestige|Surface|Pixelbook|MacBook|Mac|iPad|Pro|Air|Studio|Book|Gram|Ultra|MateBook|MediaPad|Honor|MagicBook|RedmiBook|Mi)\b",
    )
    .expect("series pattern")
});

static SCREEN_DIAGONAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\d{1,2}(?:\.\d{1,2})?)["”'’″]"#).expect("diagonal pattern")
});

static CPU_FAMILY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(Intel|AMD|Apple|Qualcomm|ARM|MediaTek|NVIDIA|Samsung|Snapdragon|Exynos|Kirin|Dimensity|Core|Celeron|Pentium|Xeon|Atom|Ryzen|Athlon|Turion|Sempron|Phenom|Opteron|EPYC|Threadripper|APU)\b",
    )
    .expect("cpu family pattern")
});

static CPU_MODEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b([A-Z]\d{3,5}|i\d-\d{4,5}|R\d{3,5}U?|U\d{3,5}|H\d{3,5}|HX\d{3,5}|G\d{3,5}|M\d{3,5}|N\d{3,5}|Celeron|Pentium|Xeon|Atom|Athlon|Turion|Sempron|Phenom|Opteron|EPYC|Threadripper)\b",
    )
    .expect("cpu model pattern")
});

static RAM_GB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,3})\s*(?:GB|ГБ)").expect("ram pattern"));

static STORAGE_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(SSD|HDD|eMMC|NVMe|SATA|M\.2)\b").expect("storage type pattern")
});

static STORAGE_CAPACITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,4})\s*(?:GB|TB|ГБ|ТБ)").expect("storage capacity pattern"));

static GPU_BRAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(NVIDIA|AMD|Intel|GeForce|RTX|GTX|Radeon|Iris|UHD|HD|Arc)\b")
        .expect("gpu brand pattern")
});

static GPU_MODEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(RTX|GTX|RTX\d{3,4}|GTX\d{3,4}|MX\d{3,4}|Quadro|Tesla|A\d{3,4}|R\d{3,4}|Radeon|Vega|Instinct|FirePro|FireGL|FireMV|FireStream|Stream|Pro|Mobility|Mobile|Discrete|Integrated|Graphics|GPU)\b",
    )
    .expect("gpu model pattern")
});

static GPU_MEMORY_GB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})\s*(?:GB|ГБ)").expect("gpu memory pattern"));

fn first_group(pattern: &Regex, title: &str) -> String {
    pattern
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Numeric price from a raw price string: every non-digit character is
/// stripped and the remainder parsed, so a digits-only input passes through
/// unchanged. Empty or digit-free input yields 0. Total — never fails.
pub fn numeric_price(raw: &str) -> i64 {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        0
    } else {
        digits.parse().unwrap_or(0)
    }
}

/// Decompose a free-text title into the fixed attribute schema.
pub fn decompose_title(title: &str, price_raw: &str) -> TitleAttributes {
    TitleAttributes {
        brand: first_group(&BRAND, title),
        series: first_group(&SERIES, title),
        screen_diagonal: first_group(&SCREEN_DIAGONAL, title),
        cpu_family: first_group(&CPU_FAMILY, title),
        cpu_model: first_group(&CPU_MODEL, title),
        ram_gb: first_group(&RAM_GB, title),
        storage_type: first_group(&STORAGE_TYPE, title),
        storage_capacity: first_group(&STORAGE_CAPACITY, title),
        gpu_brand: first_group(&GPU_BRAND, title),
        gpu_model: first_group(&GPU_MODEL, title),
        gpu_memory_gb: first_group(&GPU_MEMORY_GB, title),
        price_numeric: numeric_price(price_raw),
    }
}

pub fn decompose(record: &ListingRecord) -> DecomposedListing {
    DecomposedListing {
        attributes: decompose_title(&record.title, &record.price_raw),
        record: record.clone(),
    }
}

pub fn decompose_all(records: &[ListingRecord]) -> Vec<DecomposedListing> {
    records.iter().map(decompose).collect()
}

/// One named model group to rank offers for.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelGroup {
    pub label: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelGroupsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    groups: Vec<ModelGroup>,
}

fn group(label: &str, keywords: &[&str], exclude: &[&str]) -> ModelGroup {
    ModelGroup {
        label: label.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        exclude: exclude.iter().map(|k| k.to_string()).collect(),
    }
}

/// The built-in model groups tracked by the watcher.
pub fn default_model_groups() -> Vec<ModelGroup> {
    vec![
        group("Thinkbook 16, Ryzen AI 9 365", &["thinkbook", "ryzen", "ai", "365"], &["rtx", "5060"]),
        group("Thinkbook 16, Core Ultra 285H", &["thinkbook", "core", "ultra", "285h"], &["rtx", "5060"]),
        group("Thinkbook 16, Ryzen AI 7 350", &["thinkbook", "ryzen", "350"], &["rtx", "5060"]),
        group("Thinkbook 16, Ryzen AI 9 365 + RTX 5060", &["thinkbook", "ryzen", "ai", "365", "rtx", "5060"], &[]),
        group("Thinkbook 16, Core Ultra 285H + RTX 5060", &["thinkbook", "core", "ultra", "285h", "rtx", "5060"], &[]),
        group("Thinkbook 16, Ryzen AI 7 350 + RTX 5060", &["thinkbook", "ryzen", "350", "rtx", "5060"], &[]),
    ]
}

/// Load model groups from a YAML rules file, e.g.:
///
/// ```yaml
/// version: 1
/// groups:
///   - label: "Thinkbook 16, Ryzen AI 9 365"
///     keywords: ["thinkbook", "ryzen", "ai", "365"]
///     exclude: ["rtx", "5060"]
/// ```
pub fn load_model_groups(path: impl AsRef<Path>) -> anyhow::Result<Vec<ModelGroup>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: ModelGroupsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.groups)
}

/// A listing matches iff its lowercased title contains every required
/// keyword and none of the excluded ones. Matches are sorted ascending by
/// numeric price (stable, so tied prices keep input order) and truncated to
/// [`MAX_OFFERS_PER_GROUP`].
pub fn best_matches(
    listings: &[DecomposedListing],
    required: &[String],
    excluded: &[String],
) -> Vec<DecomposedListing> {
    let mut matched: Vec<DecomposedListing> = listings
        .iter()
        .filter(|listing| {
            let title = listing.record.title.to_lowercase();
            required.iter().all(|k| title.contains(&k.to_lowercase()))
                && !excluded.iter().any(|k| title.contains(&k.to_lowercase()))
        })
        .cloned()
        .collect();
    matched.sort_by_key(|listing| listing.attributes.price_numeric);
    matched.truncate(MAX_OFFERS_PER_GROUP);
    matched
}

/// Rank every model group over the harvested set.
pub fn rank_groups(listings: &[DecomposedListing], groups: &[ModelGroup]) -> RankedGroups {
    let mut ranked = BTreeMap::new();
    for group in groups {
        ranked.insert(
            group.label.clone(),
            best_matches(listings, &group.keywords, &group.exclude),
        );
    }
    ranked
}
