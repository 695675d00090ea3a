//! End-to-end harvest scenarios over replay fixtures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use mdf_core::{ListingRecord, SourceTag};
use mdf_harvest::{
    HarvestError, HarvestOrchestrator, InteractionError, PacingConfig, ReplayScript, ReplayView,
    ReplayViewFactory, RetryPolicy, ViewFactory,
};
use mdf_store::ResultCache;

fn listing(title: &str, price_raw: &str, url: &str) -> ListingRecord {
    ListingRecord {
        title: title.to_string(),
        price_raw: price_raw.to_string(),
        url: url.to_string(),
        source: SourceTag::Search,
    }
}

fn thinkbook_script() -> ReplayScript {
    ReplayScript {
        page_title: "ноутбуки lenovo thinkbook — Маркет".to_string(),
        windows: vec![
            vec![
                listing(
                    "Ноутбук Lenovo ThinkBook 16, Ryzen AI 9 365, 32Гб/1Тб",
                    "145 990 ₽",
                    "https://market.example/p/1",
                ),
                listing(
                    "Lenovo ThinkBook 16, Core Ultra 285H, 32Гб",
                    "139 990 ₽",
                    "https://market.example/p/2",
                ),
            ],
            vec![listing(
                "Lenovo ThinkBook 16, Ryzen AI 7 350, 16Гб",
                "99 990 ₽",
                "https://market.example/p/3",
            )],
        ],
    }
}

fn fast_pacing() -> PacingConfig {
    PacingConfig {
        floor: Duration::from_millis(1),
        ceiling: Duration::from_millis(4),
        growth_factor: 2,
        empty_round_threshold: 2,
        scroll_viewports: 2,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
    }
}

struct CountingFactory {
    inner: ReplayViewFactory,
    opens: Arc<AtomicU32>,
}

#[async_trait]
impl ViewFactory for CountingFactory {
    type View = ReplayView;

    async fn open(&self, query: &str) -> Result<ReplayView, InteractionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(query).await
    }
}

struct FlakyFactory {
    inner: ReplayViewFactory,
    failures_remaining: AtomicU32,
    opens: Arc<AtomicU32>,
}

#[async_trait]
impl ViewFactory for FlakyFactory {
    type View = ReplayView;

    async fn open(&self, query: &str) -> Result<ReplayView, InteractionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(InteractionError::Navigation(
                "ERR_CONNECTION_RESET".to_string(),
            ));
        }
        self.inner.open(query).await
    }
}

struct AlwaysFailingFactory;

#[async_trait]
impl ViewFactory for AlwaysFailingFactory {
    type View = ReplayView;

    async fn open(&self, _query: &str) -> Result<ReplayView, InteractionError> {
        Err(InteractionError::Timeout)
    }
}

#[tokio::test]
async fn cold_cache_harvest_returns_decomposed_listings_and_fills_cache() {
    let dir = tempdir().expect("tempdir");
    let cache = ResultCache::new(dir.path());
    let orchestrator =
        HarvestOrchestrator::new(ReplayViewFactory::new(thinkbook_script()), cache.clone())
            .with_pacing(fast_pacing())
            .with_retry(fast_retry());

    let listings = orchestrator.harvest("lenovo thinkbook").await;

    assert_eq!(listings.len(), 3);
    for listing in &listings {
        assert!(listing.attributes.price_numeric > 0);
        assert_eq!(listing.attributes.brand, "Lenovo");
    }
    assert!(cache.is_valid("lenovo thinkbook").await);
}

#[tokio::test]
async fn warm_cache_skips_the_live_harvest() {
    let dir = tempdir().expect("tempdir");
    let opens = Arc::new(AtomicU32::new(0));
    let factory = CountingFactory {
        inner: ReplayViewFactory::new(thinkbook_script()),
        opens: opens.clone(),
    };
    let orchestrator = HarvestOrchestrator::new(factory, ResultCache::new(dir.path()))
        .with_pacing(fast_pacing())
        .with_retry(fast_retry());

    let first = orchestrator.harvest("lenovo thinkbook").await;
    let second = orchestrator.harvest("lenovo thinkbook").await;

    assert_eq!(first, second);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_recover_from_transient_failures() {
    let dir = tempdir().expect("tempdir");
    let opens = Arc::new(AtomicU32::new(0));
    let factory = FlakyFactory {
        inner: ReplayViewFactory::new(thinkbook_script()),
        failures_remaining: AtomicU32::new(2),
        opens: opens.clone(),
    };
    let orchestrator = HarvestOrchestrator::new(factory, ResultCache::new(dir.path()))
        .with_pacing(fast_pacing())
        .with_retry(fast_retry());

    let records = orchestrator
        .try_harvest("lenovo thinkbook")
        .await
        .expect("harvest after retries");

    assert_eq!(records.len(), 3);
    assert_eq!(opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_as_an_empty_result() {
    let dir = tempdir().expect("tempdir");
    let cache = ResultCache::new(dir.path());
    let orchestrator = HarvestOrchestrator::new(AlwaysFailingFactory, cache.clone())
        .with_pacing(fast_pacing())
        .with_retry(fast_retry());

    let result = orchestrator.try_harvest("lenovo thinkbook").await;
    assert!(matches!(
        result,
        Err(HarvestError::ExhaustedRetries { attempts: 3, .. })
    ));

    let listings = orchestrator.harvest("lenovo thinkbook").await;
    assert!(listings.is_empty());
    assert!(!cache.is_valid("lenovo thinkbook").await);
}

#[tokio::test]
async fn identical_queries_are_single_flighted() {
    let dir = tempdir().expect("tempdir");
    let opens = Arc::new(AtomicU32::new(0));
    let factory = CountingFactory {
        inner: ReplayViewFactory::new(thinkbook_script()),
        opens: opens.clone(),
    };
    let orchestrator = HarvestOrchestrator::new(factory, ResultCache::new(dir.path()))
        .with_pacing(fast_pacing())
        .with_retry(fast_retry());

    let (first, second) = tokio::join!(
        orchestrator.harvest("lenovo thinkbook"),
        orchestrator.harvest("lenovo thinkbook"),
    );

    assert_eq!(first, second);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}
