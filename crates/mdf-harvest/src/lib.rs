//! Adaptive incremental harvesting of virtualized marketplace lists.
//!
//! A virtualized list only renders a window of items, and how fast the
//! remote page repopulates that window after a scroll is unknown. The
//! controller here treats "time since the last new item" as its only signal:
//! it polls fast while discoveries keep coming, backs off exponentially on
//! silence, and gives up only once it has both seen several unproductive
//! rounds and is already waiting as long as it is willing to wait.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mdf_core::{BrandSet, DecomposedListing, ListingRecord};
use mdf_extract::decompose_all;
use mdf_store::{cache_key, CacheError, ResultCache};

pub const CRATE_NAME: &str = "mdf-harvest";

/// A single interaction with the remote view failed; the attempt is dead but
/// the harvest as a whole may retry. Cancellation is the one terminal case.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("selector '{selector}' not found")]
    SelectorNotFound { selector: String },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("remote view timed out")]
    Timeout,
    #[error("harvest cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InteractionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InteractionError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("harvest cancelled")]
    Cancelled,
    #[error("harvest failed after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: InteractionError,
    },
}

/// Anything the convergence loop can accumulate: items are deduplicated and
/// ordered by this key, and an observed item is never dropped again.
pub trait HarvestItem: Clone + Send {
    fn harvest_key(&self) -> String;
}

impl HarvestItem for String {
    fn harvest_key(&self) -> String {
        self.clone()
    }
}

impl HarvestItem for ListingRecord {
    fn harvest_key(&self) -> String {
        self.uniqueness_key()
    }
}

/// The consumed remote-view capability: read what is currently rendered,
/// advance the scroll position, and release the view when done. Browser
/// bindings live outside this crate; [`ReplayView`] is the in-repo
/// fixture-backed implementation.
#[async_trait]
pub trait RemoteView: Send {
    type Item: HarvestItem;

    async fn visible_items(&mut self) -> Result<Vec<Self::Item>, InteractionError>;
    async fn scroll_by_viewports(&mut self, viewports: u32) -> Result<(), InteractionError>;
    async fn title(&mut self) -> Result<String, InteractionError>;
    async fn close(&mut self) -> Result<(), InteractionError>;
}

/// Capability to open a fresh listing view for a query; one view per attempt.
#[async_trait]
pub trait ViewFactory: Send + Sync {
    type View: RemoteView<Item = ListingRecord>;

    async fn open(&self, query: &str) -> Result<Self::View, InteractionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    /// Sleep floor; also the reset value whenever new items appear.
    pub floor: Duration,
    /// Sleep ceiling; the loop never waits longer than this per round.
    pub ceiling: Duration,
    pub growth_factor: u32,
    pub empty_round_threshold: u32,
    pub scroll_viewports: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(250),
            ceiling: Duration::from_secs(4),
            growth_factor: 2,
            empty_round_threshold: 3,
            scroll_viewports: 2,
        }
    }
}

/// Pure pacing state for the scroll loop. A round with no new items grows
/// the sleep interval toward the ceiling; any discovery resets it to the
/// floor. Convergence requires both the empty-round threshold and the
/// ceiling to be reached, so transient render lag alone never terminates
/// the loop.
#[derive(Debug, Clone)]
pub struct ScrollPacing {
    config: PacingConfig,
    sleep_interval: Duration,
    consecutive_empty_rounds: u32,
}

impl ScrollPacing {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            sleep_interval: config.floor,
            consecutive_empty_rounds: 0,
            config,
        }
    }

    pub fn observe_round(&mut self, new_items: usize) {
        if new_items == 0 {
            self.consecutive_empty_rounds += 1;
            self.sleep_interval =
                (self.sleep_interval * self.config.growth_factor).min(self.config.ceiling);
        } else {
            self.consecutive_empty_rounds = 0;
            self.sleep_interval = self.config.floor;
        }
    }

    pub fn converged(&self) -> bool {
        self.consecutive_empty_rounds >= self.config.empty_round_threshold
            && self.sleep_interval == self.config.ceiling
    }

    pub fn current_delay(&self) -> Duration {
        self.sleep_interval
    }

    pub fn consecutive_empty_rounds(&self) -> u32 {
        self.consecutive_empty_rounds
    }
}

/// Drives a remote virtualized list to full enumeration.
#[derive(Debug, Clone)]
pub struct ConvergenceController {
    pacing: PacingConfig,
    cancel: CancellationToken,
}

impl ConvergenceController {
    pub fn new(pacing: PacingConfig) -> Self {
        Self {
            pacing,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Enumerate the list behind `view` until convergence. The view is
    /// released on every exit path; a close failure after a successful
    /// enumeration is logged, not surfaced, since the items are already
    /// safely accumulated.
    pub async fn collect<V: RemoteView>(&self, mut view: V) -> Result<Vec<V::Item>, InteractionError> {
        let outcome = self.drive(&mut view).await;
        if let Err(err) = view.close().await {
            warn!(error = %err, "failed to close remote view");
        }
        outcome
    }

    /// Same loop instantiated for brand-name enumeration.
    pub async fn collect_brands<V>(&self, view: V) -> Result<BrandSet, InteractionError>
    where
        V: RemoteView<Item = String>,
    {
        Ok(self.collect(view).await?.into_iter().collect())
    }

    async fn drive<V: RemoteView>(&self, view: &mut V) -> Result<Vec<V::Item>, InteractionError> {
        let page_title = view.title().await?;
        info!(%page_title, "starting incremental harvest");

        let mut pacing = ScrollPacing::new(self.pacing);
        let mut accumulated: BTreeMap<String, V::Item> = BTreeMap::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(InteractionError::Cancelled);
            }

            let visible = view.visible_items().await?;
            let mut new_items = 0usize;
            for item in visible {
                accumulated.entry(item.harvest_key()).or_insert_with(|| {
                    new_items += 1;
                    item
                });
            }

            pacing.observe_round(new_items);
            debug!(
                total = accumulated.len(),
                new_items,
                empty_rounds = pacing.consecutive_empty_rounds(),
                delay_ms = pacing.current_delay().as_millis() as u64,
                "harvest round"
            );

            if pacing.converged() {
                break;
            }

            view.scroll_by_viewports(self.pacing.scroll_viewports).await?;
            self.sleep(pacing.current_delay()).await?;
        }

        info!(total = accumulated.len(), "harvest converged");
        Ok(accumulated.into_values().collect())
    }

    async fn sleep(&self, delay: Duration) -> Result<(), InteractionError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(InteractionError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Retry progress of one harvest call, as an explicit state machine so the
/// termination logic is testable without a remote view or a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Attempting { attempt: u32 },
    Backoff { next_attempt: u32 },
    Succeeded,
    Exhausted,
}

impl AttemptState {
    /// Move into the next attempt if one is allowed; returns its number.
    /// Terminal states and in-flight attempts yield `None`.
    pub fn begin(&mut self) -> Option<u32> {
        match *self {
            AttemptState::Idle => {
                *self = AttemptState::Attempting { attempt: 1 };
                Some(1)
            }
            AttemptState::Backoff { next_attempt } => {
                *self = AttemptState::Attempting { attempt: next_attempt };
                Some(next_attempt)
            }
            _ => None,
        }
    }

    pub fn complete(&mut self) {
        if matches!(self, AttemptState::Attempting { .. }) {
            *self = AttemptState::Succeeded;
        }
    }

    pub fn fail(&mut self, policy: &RetryPolicy) {
        if let AttemptState::Attempting { attempt } = *self {
            *self = if attempt < policy.max_attempts {
                AttemptState::Backoff {
                    next_attempt: attempt + 1,
                }
            } else {
                AttemptState::Exhausted
            };
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Exhausted)
    }
}

/// Top-level retry policy around a full harvest: cache check, convergence
/// scrape, decomposition, cache write-back. Harvests for the identical
/// cache key are single-flighted through a per-key lock.
pub struct HarvestOrchestrator<F> {
    views: F,
    cache: ResultCache,
    retry: RetryPolicy,
    pacing: PacingConfig,
    cancel: CancellationToken,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<F: ViewFactory> HarvestOrchestrator<F> {
    pub fn new(views: F, cache: ResultCache) -> Self {
        Self {
            views,
            cache,
            retry: RetryPolicy::default(),
            pacing: PacingConfig::default(),
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Harvest and decompose the listings for `query`. Never fails: a
    /// terminal failure is logged with full context and yields an empty
    /// result set.
    pub async fn harvest(&self, query: &str) -> Vec<DecomposedListing> {
        match self.try_harvest(query).await {
            Ok(records) => decompose_all(&records),
            Err(HarvestError::Cancelled) => {
                info!(query, "harvest cancelled before completion");
                Vec::new()
            }
            Err(err) => {
                error!(query, error = %err, "harvest exhausted all attempts");
                Vec::new()
            }
        }
    }

    /// Harvest the raw listings for `query`, consulting the cache first and
    /// writing it back on a non-empty live result.
    pub async fn try_harvest(&self, query: &str) -> Result<Vec<ListingRecord>, HarvestError> {
        let key = cache_key(query);
        let slot = self.key_lock(&key).await;
        let _flight = slot.lock().await;

        // Under the key lock a concurrent harvest may have filled the cache.
        match self.cache.load(&key).await {
            Ok(records) => {
                info!(query, key, records = records.len(), "using cached harvest");
                return Ok(records);
            }
            Err(CacheError::Miss { .. }) => {}
            Err(err) => warn!(query, key, error = %err, "cache unreadable, harvesting live"),
        }

        let records = self.run_attempts(query).await?;
        if !records.is_empty() {
            if let Err(err) = self.cache.store(&key, &records).await {
                warn!(query, key, error = %err, "failed to store harvest in cache");
            }
        }
        Ok(records)
    }

    async fn run_attempts(&self, query: &str) -> Result<Vec<ListingRecord>, HarvestError> {
        let run_id = Uuid::new_v4();
        let mut state = AttemptState::Idle;
        let mut harvested = Vec::new();
        let mut failure = None;

        while let Some(attempt) = state.begin() {
            info!(%run_id, query, attempt, max_attempts = self.retry.max_attempts, "starting harvest attempt");
            match self.attempt_once(query).await {
                Ok(records) => {
                    info!(%run_id, query, attempt, records = records.len(), "harvest attempt succeeded");
                    harvested = records;
                    state.complete();
                }
                Err(err) if !err.is_retryable() => return Err(HarvestError::Cancelled),
                Err(err) => {
                    warn!(%run_id, query, attempt, error = %err, "harvest attempt failed");
                    state.fail(&self.retry);
                    failure = Some(err);
                    if matches!(state, AttemptState::Backoff { .. }) {
                        self.pause_before_retry().await?;
                    }
                }
            }
        }

        match (state, failure) {
            (AttemptState::Succeeded, _) => Ok(harvested),
            (_, Some(last)) => Err(HarvestError::ExhaustedRetries {
                attempts: self.retry.max_attempts,
                last,
            }),
            (_, None) => Ok(harvested),
        }
    }

    async fn attempt_once(&self, query: &str) -> Result<Vec<ListingRecord>, InteractionError> {
        let view = self.views.open(query).await?;
        let controller =
            ConvergenceController::new(self.pacing).with_cancellation(self.cancel.clone());
        controller.collect(view).await
    }

    async fn pause_before_retry(&self) -> Result<(), HarvestError> {
        debug!(delay_ms = self.retry.retry_delay.as_millis() as u64, "waiting before next attempt");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HarvestError::Cancelled),
            _ = tokio::time::sleep(self.retry.retry_delay) => Ok(()),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Scroll-window script for a [`ReplayView`]: each window holds the items
/// rendered after the corresponding scroll step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayScript {
    pub page_title: String,
    pub windows: Vec<Vec<ListingRecord>>,
}

impl ReplayScript {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Fixture-backed remote view replaying captured scroll windows. Scrolling
/// past the final window keeps showing it, which is exactly how a fully
/// scrolled virtualized list behaves.
#[derive(Debug, Clone)]
pub struct ReplayView {
    script: ReplayScript,
    position: usize,
}

impl ReplayView {
    pub fn new(script: ReplayScript) -> Self {
        Self { script, position: 0 }
    }
}

#[async_trait]
impl RemoteView for ReplayView {
    type Item = ListingRecord;

    async fn visible_items(&mut self) -> Result<Vec<ListingRecord>, InteractionError> {
        Ok(self
            .script
            .windows
            .get(self.position)
            .cloned()
            .unwrap_or_default())
    }

    async fn scroll_by_viewports(&mut self, _viewports: u32) -> Result<(), InteractionError> {
        if self.position + 1 < self.script.windows.len() {
            self.position += 1;
        }
        Ok(())
    }

    async fn title(&mut self) -> Result<String, InteractionError> {
        Ok(self.script.page_title.clone())
    }

    async fn close(&mut self) -> Result<(), InteractionError> {
        Ok(())
    }
}

/// Opens a fresh [`ReplayView`] over one shared script for every attempt.
#[derive(Debug, Clone)]
pub struct ReplayViewFactory {
    script: ReplayScript,
}

impl ReplayViewFactory {
    pub fn new(script: ReplayScript) -> Self {
        Self { script }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(ReplayScript::from_file(path)?))
    }
}

#[async_trait]
impl ViewFactory for ReplayViewFactory {
    type View = ReplayView;

    async fn open(&self, _query: &str) -> Result<ReplayView, InteractionError> {
        Ok(ReplayView::new(self.script.clone()))
    }
}
