//! Delivery sinks for harvested listings: CSV export, HTML report, chat
//! messaging, and the detached harvest-and-notify dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use tracing::{error, info, warn};

use mdf_core::{DecomposedListing, RankedGroups};
use mdf_extract::{rank_groups, ModelGroup};
use mdf_harvest::{HarvestOrchestrator, ViewFactory};
use mdf_store::ProductStore;

pub const CRATE_NAME: &str = "mdf-report";

const CSV_HEADER: [&str; 16] = [
    "title",
    "price",
    "url",
    "source",
    "brand",
    "series",
    "screen_diagonal",
    "cpu_family",
    "cpu_model",
    "ram_gb",
    "storage_type",
    "storage_capacity",
    "gpu_brand",
    "gpu_model",
    "gpu_memory_gb",
    "price_numeric",
];

fn listing_fields(listing: &DecomposedListing) -> Vec<String> {
    let record = &listing.record;
    let attrs = &listing.attributes;
    vec![
        record.title.clone(),
        record.price_raw.clone(),
        record.url.clone(),
        record.source.as_str().to_string(),
        attrs.brand.clone(),
        attrs.series.clone(),
        attrs.screen_diagonal.clone(),
        attrs.cpu_family.clone(),
        attrs.cpu_model.clone(),
        attrs.ram_gb.clone(),
        attrs.storage_type.clone(),
        attrs.storage_capacity.clone(),
        attrs.gpu_brand.clone(),
        attrs.gpu_model.clone(),
        attrs.gpu_memory_gb.clone(),
        attrs.price_numeric.to_string(),
    ]
}

/// Write every harvested listing as one homogeneous CSV.
pub fn write_listings_csv(
    path: impl AsRef<Path>,
    listings: &[DecomposedListing],
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(CSV_HEADER)
        .context("writing csv header")?;
    for listing in listings {
        writer
            .write_record(listing_fields(listing))
            .with_context(|| format!("writing csv row for {}", listing.record.title))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!(rows = listings.len(), path = %path.display(), "wrote listings csv");
    Ok(())
}

/// Write the ranked groups as CSV, with the group label as the lead column.
pub fn write_ranked_csv(path: impl AsRef<Path>, groups: &RankedGroups) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    let mut header = vec!["model_group"];
    header.extend(CSV_HEADER);
    writer
        .write_record(&header)
        .context("writing csv header")?;
    let mut rows = 0usize;
    for (label, listings) in groups {
        for listing in listings {
            let mut fields = vec![label.clone()];
            fields.extend(listing_fields(listing));
            writer
                .write_record(&fields)
                .with_context(|| format!("writing csv row for group {label}"))?;
            rows += 1;
        }
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!(rows, path = %path.display(), "wrote ranked csv");
    Ok(())
}

struct OfferRow {
    title: String,
    url: String,
    price_numeric: i64,
}

struct GroupSection {
    label: String,
    rows: Vec<OfferRow>,
}

#[derive(Template)]
#[template(path = "results.html")]
struct ResultsTemplate {
    groups: Vec<GroupSection>,
}

/// Render the ranked groups as the summary HTML report.
pub fn render_results_html(groups: &RankedGroups) -> anyhow::Result<String> {
    let template = ResultsTemplate {
        groups: groups
            .iter()
            .map(|(label, listings)| GroupSection {
                label: label.clone(),
                rows: listings
                    .iter()
                    .map(|listing| OfferRow {
                        title: listing.record.title.clone(),
                        url: listing.record.url.clone(),
                        price_numeric: listing.attributes.price_numeric,
                    })
                    .collect(),
            })
            .collect(),
    };
    template.render().context("rendering results template")
}

pub fn write_results_html(path: impl AsRef<Path>, groups: &RankedGroups) -> anyhow::Result<()> {
    let path = path.as_ref();
    let html = render_results_html(groups)?;
    std::fs::write(path, html).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote html report");
    Ok(())
}

/// Outbound chat capability: a text message with an optional file attachment.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        attachment: Option<&Path>,
    ) -> anyhow::Result<()>;
}

/// Messenger used when no chat transport is configured; deliveries are
/// logged and dropped.
#[derive(Default)]
pub struct NoopMessenger;

#[async_trait]
impl Messenger for NoopMessenger {
    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        attachment: Option<&Path>,
    ) -> anyhow::Result<()> {
        info!(chat_id, text, attachment = ?attachment, "chat transport disabled, dropping message");
        Ok(())
    }
}

/// Telegram Bot API transport.
pub struct TelegramMessenger {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramMessenger {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            http,
            api_base: "https://api.telegram.org".to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .context("sending telegram message")?;
        response
            .error_for_status()
            .context("telegram sendMessage rejected")?;
        Ok(())
    }

    async fn send_document(&self, chat_id: i64, path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading attachment {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment")
            .to_string();
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .context("sending telegram document")?;
        response
            .error_for_status()
            .context("telegram sendDocument rejected")?;
        Ok(())
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(
        &self,
        chat_id: i64,
        text: &str,
        attachment: Option<&Path>,
    ) -> anyhow::Result<()> {
        self.send_text(chat_id, text).await?;
        if let Some(path) = attachment {
            self.send_document(chat_id, path).await?;
        }
        Ok(())
    }
}

/// Everything a delivery run needs besides the orchestrator itself.
pub struct DeliveryContext {
    pub messenger: Arc<dyn Messenger>,
    pub store: Option<ProductStore>,
    pub groups: Vec<ModelGroup>,
    pub report_dir: PathBuf,
    pub marketplace: String,
}

/// Files produced by one delivery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifacts {
    pub listings_csv: PathBuf,
    pub ranked_csv: PathBuf,
    pub html: PathBuf,
}

/// Run a full harvest-and-deliver cycle: harvest, export CSVs, upsert the
/// product store, render the HTML report, and message the result. Returns
/// `None` when the harvest produced nothing.
pub async fn run_and_report<F: ViewFactory>(
    orchestrator: &HarvestOrchestrator<F>,
    ctx: &DeliveryContext,
    chat_id: i64,
    query: &str,
) -> anyhow::Result<Option<ReportArtifacts>> {
    ctx.messenger
        .send(chat_id, &format!("Начинаю сбор предложений: *{query}*"), None)
        .await
        .unwrap_or_else(|err| warn!(error = %err, "failed to send start notification"));

    let listings = orchestrator.harvest(query).await;
    if listings.is_empty() {
        let text = format!("По запросу '{query}' ничего не найдено. Поиск остановлен.");
        warn!(query, "harvest produced no listings");
        ctx.messenger
            .send(chat_id, &text, None)
            .await
            .unwrap_or_else(|err| warn!(error = %err, "failed to send empty-result notification"));
        return Ok(None);
    }
    info!(query, listings = listings.len(), "harvest complete, building report");

    tokio::fs::create_dir_all(&ctx.report_dir)
        .await
        .with_context(|| format!("creating {}", ctx.report_dir.display()))?;

    let artifacts = ReportArtifacts {
        listings_csv: ctx.report_dir.join("listings.csv"),
        ranked_csv: ctx.report_dir.join("best_offers.csv"),
        html: ctx.report_dir.join("results.html"),
    };

    write_listings_csv(&artifacts.listings_csv, &listings)?;

    if let Some(store) = &ctx.store {
        if let Err(err) = store.upsert_listings(&listings, &ctx.marketplace).await {
            warn!(error = %err, "failed to upsert listings into product store");
        }
    }

    let ranked = rank_groups(&listings, &ctx.groups);
    write_ranked_csv(&artifacts.ranked_csv, &ranked)?;
    write_results_html(&artifacts.html, &ranked)?;

    ctx.messenger
        .send(
            chat_id,
            &format!(
                "Поиск завершен: {} предложений по запросу *{query}*. Отправляю таблицу.",
                listings.len()
            ),
            Some(&artifacts.html),
        )
        .await
        .unwrap_or_else(|err| warn!(error = %err, "failed to send completion notification"));

    Ok(Some(artifacts))
}

/// Dispatch a harvest as a detached task so the caller's message loop never
/// blocks on it; completion (or failure) is reported through the messenger.
pub fn spawn_harvest_and_notify<F>(
    orchestrator: Arc<HarvestOrchestrator<F>>,
    ctx: Arc<DeliveryContext>,
    chat_id: i64,
    query: String,
) -> tokio::task::JoinHandle<()>
where
    F: ViewFactory + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = run_and_report(&orchestrator, &ctx, chat_id, &query).await {
            error!(query, error = %err, "harvest delivery failed");
            let text = format!("Не удалось подготовить отчет по запросу '{query}'.");
            ctx.messenger
                .send(chat_id, &text, None)
                .await
                .unwrap_or_else(|err| warn!(error = %err, "failed to send failure notification"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use mdf_core::{ListingRecord, SourceTag, TitleAttributes};
    use tempfile::tempdir;

    fn decomposed(title: &str, url: &str, price_numeric: i64) -> DecomposedListing {
        DecomposedListing {
            record: ListingRecord {
                title: title.to_string(),
                price_raw: format!("{price_numeric} ₽"),
                url: url.to_string(),
                source: SourceTag::Search,
            },
            attributes: TitleAttributes {
                price_numeric,
                ..TitleAttributes::default()
            },
        }
    }

    #[test]
    fn listings_csv_has_header_and_one_row_per_listing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.csv");
        let listings = vec![
            decomposed("Lenovo ThinkBook 16", "https://m.example/1", 145990),
            decomposed("Lenovo IdeaPad 5", "https://m.example/2", 54990),
        ];

        write_listings_csv(&path, &listings).expect("write csv");

        let text = std::fs::read_to_string(&path).expect("read csv");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("title,price,url,source,brand"));
        assert!(lines[1].contains("https://m.example/1"));
    }

    #[test]
    fn html_report_lists_offers_and_marks_empty_groups() {
        let mut groups: RankedGroups = BTreeMap::new();
        groups.insert(
            "Thinkbook 16, Ryzen AI 9 365".to_string(),
            vec![decomposed(
                "Lenovo ThinkBook 16 Ryzen AI 9 365",
                "https://m.example/1",
                145990,
            )],
        );
        groups.insert("Thinkbook 16, Core Ultra 285H".to_string(), Vec::new());

        let html = render_results_html(&groups).expect("render");

        assert!(html.contains("Thinkbook 16, Ryzen AI 9 365"));
        assert!(html.contains("href=\"https://m.example/1\""));
        assert!(html.contains("145990 руб."));
        assert!(html.contains("Предложений не найдено"));
    }

    struct RecordingMessenger {
        sent: Mutex<Vec<(i64, String, Option<PathBuf>)>>,
    }

    impl RecordingMessenger {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(
            &self,
            chat_id: i64,
            text: &str,
            attachment: Option<&Path>,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .expect("messenger lock")
                .push((chat_id, text.to_string(), attachment.map(Path::to_path_buf)));
            Ok(())
        }
    }

    mod delivery {
        use super::*;
        use std::time::Duration;

        use mdf_extract::default_model_groups;
        use mdf_harvest::{
            PacingConfig, ReplayScript, ReplayViewFactory, RetryPolicy,
        };
        use mdf_store::ResultCache;

        fn script() -> ReplayScript {
            ReplayScript {
                page_title: "test listing".to_string(),
                windows: vec![vec![ListingRecord {
                    title: "Lenovo Thinkbook 16 Ryzen AI 9 365".to_string(),
                    price_raw: "145 990 ₽".to_string(),
                    url: "https://m.example/1".to_string(),
                    source: SourceTag::Search,
                }]],
            }
        }

        fn fast_orchestrator(
            cache_dir: &Path,
        ) -> HarvestOrchestrator<ReplayViewFactory> {
            HarvestOrchestrator::new(
                ReplayViewFactory::new(script()),
                ResultCache::new(cache_dir),
            )
            .with_pacing(PacingConfig {
                floor: Duration::from_millis(1),
                ceiling: Duration::from_millis(4),
                growth_factor: 2,
                empty_round_threshold: 2,
                scroll_viewports: 2,
            })
            .with_retry(RetryPolicy {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
            })
        }

        #[tokio::test]
        async fn delivery_writes_artifacts_and_notifies_with_attachment() {
            let dir = tempdir().expect("tempdir");
            let messenger = Arc::new(RecordingMessenger::new());
            let ctx = DeliveryContext {
                messenger: messenger.clone(),
                store: None,
                groups: default_model_groups(),
                report_dir: dir.path().join("reports"),
                marketplace: "Yandex Market".to_string(),
            };
            let orchestrator = fast_orchestrator(&dir.path().join("cache"));

            let artifacts = run_and_report(&orchestrator, &ctx, 42, "lenovo thinkbook")
                .await
                .expect("delivery")
                .expect("non-empty harvest");

            assert!(artifacts.listings_csv.exists());
            assert!(artifacts.ranked_csv.exists());
            assert!(artifacts.html.exists());

            let sent = messenger.sent.lock().expect("messenger lock");
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].0, 42);
            assert_eq!(sent[1].2.as_deref(), Some(artifacts.html.as_path()));
        }

        #[tokio::test]
        async fn detached_dispatch_reports_back_on_completion() {
            let dir = tempdir().expect("tempdir");
            let messenger = Arc::new(RecordingMessenger::new());
            let ctx = Arc::new(DeliveryContext {
                messenger: messenger.clone(),
                store: None,
                groups: default_model_groups(),
                report_dir: dir.path().join("reports"),
                marketplace: "Yandex Market".to_string(),
            });
            let orchestrator = Arc::new(fast_orchestrator(&dir.path().join("cache")));

            spawn_harvest_and_notify(orchestrator, ctx, 42, "lenovo thinkbook".to_string())
                .await
                .expect("dispatch task");

            let sent = messenger.sent.lock().expect("messenger lock");
            assert_eq!(sent.len(), 2);
            assert!(sent[0].1.contains("lenovo thinkbook"));
        }
    }
}
