use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::{merge_all, write_records, Checkpointer};
use crate::config::{Settings, SITE_ROOT};
use crate::controller::{Ending, Harvester};
use crate::driver::actions::{bounded, dismiss_overlays, snapshot};
use crate::driver::Driver;
use crate::events::{CancelToken, EventSink, HarvestEvent};
use crate::parser::extract::Extractor;
use crate::record::Record;
use crate::retry::{Attempted, RetryPolicy};
use crate::session::Authenticator;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pages: Vec<String>,
    pub interactive_login: bool,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub records: Vec<Record>,
    pub clicks: u32,
    pub iterations: u32,
    /// Posts that never lost their "see more" and were left out.
    pub dropped_truncated: usize,
    pub batches: Vec<PathBuf>,
    pub consolidated: Option<PathBuf>,
    pub pages_done: usize,
    pub cancelled: bool,
}

/// A harvest running on its own task.
pub struct RunHandle<D> {
    pub events: UnboundedReceiver<HarvestEvent>,
    pub cancel: CancelToken,
    /// Yields the driver back so the caller can close the browser.
    pub task: JoinHandle<(Result<RunReport>, D)>,
}

pub fn spawn<D: Driver + 'static>(mut driver: D, settings: Settings, request: RunRequest) -> RunHandle<D> {
    let (events, rx) = EventSink::channel();
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let result = run(&mut driver, &settings, &request, &events, &token).await;
        (result, driver)
    });
    RunHandle {
        events: rx,
        cancel,
        task,
    }
}

/// Log in, harvest every requested page, then consolidate the batches.
pub async fn run<D: Driver>(
    driver: &mut D,
    settings: &Settings,
    request: &RunRequest,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let result = harvest_pages(driver, settings, request, events, cancel).await;
    events.finished(matches!(&result, Ok(report) if !report.records.is_empty()));
    result
}

async fn harvest_pages<D: Driver>(
    driver: &mut D,
    settings: &Settings,
    request: &RunRequest,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let wait = settings.driver.wait_timeout();

    events.status("Checking login");
    if let Err(e) = Authenticator::new(&settings.session, wait)
        .authenticate(driver, request.interactive_login)
        .await
    {
        events.status(format!("Login failed: {e}"));
        return Err(e).context("Login failed");
    }

    let extractor = Extractor::new(&settings.selectors, SITE_ROOT)?;
    let mut checkpoints = Checkpointer::new(&settings.output.directory)
        .with_context(|| format!("Cannot use output directory {}", settings.output.directory.display()))?;
    let mut report = RunReport::default();
    let total = request.pages.len();

    for (i, url) in request.pages.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        events.status(format!("Page {}/{}: {}", i + 1, total, url));
        match bounded(wait, driver.navigate(url)).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Browser refused to open {}", url);
                events.status(format!("Skipping {url}: page did not open"));
                continue;
            }
            Err(e) => {
                warn!("Could not open {}: {}", url, e);
                events.status(format!("Skipping {url}: {e}"));
                continue;
            }
        }

        let ready = wait_for_posts(driver, &extractor, settings).await;
        match ready.value {
            Some(n) => info!("{} posts rendered after {} checks", n, ready.attempts),
            None => warn!("No posts showed up on {} after {} checks", url, ready.attempts),
        }
        match dismiss_overlays(driver, wait).await {
            Ok(0) => {}
            Ok(n) => info!("Closed {} overlays", n),
            Err(e) => warn!("Overlay dismissal failed: {}", e),
        }

        let outcome = Harvester::new(settings, &extractor, &mut checkpoints, events, cancel)
            .run(driver)
            .await;
        events.status(format!(
            "Page {}/{}: {} complete posts in {} iterations",
            i + 1,
            total,
            outcome.records.len(),
            outcome.iterations
        ));

        report.clicks += outcome.clicks;
        report.iterations += outcome.iterations;
        report.dropped_truncated += outcome.dropped_truncated;
        report.records.extend(outcome.records);
        report.pages_done += 1;
        if outcome.ending == Ending::Cancelled {
            break;
        }
    }

    report.cancelled = cancel.is_cancelled();
    report.batches = checkpoints.batches().to_vec();
    report.consolidated = consolidate(&mut checkpoints, &report.records, settings, events);
    Ok(report)
}

/// Poll until the feed has rendered at least one post container.
async fn wait_for_posts<D: Driver>(driver: &mut D, extractor: &Extractor, settings: &Settings) -> Attempted<usize> {
    let cfg = &settings.driver;
    let mut tries = RetryPolicy::new(cfg.ready_attempts, cfg.ready_interval()).start();
    while tries.next().await {
        match snapshot(driver, cfg.wait_timeout()).await {
            Ok(snap) => {
                let n = extractor.count_containers(&snap.html);
                if n > 0 {
                    return Attempted {
                        value: Some(n),
                        attempts: tries.used(),
                    };
                }
            }
            Err(e) => warn!("Page not readable yet: {}", e),
        }
    }
    Attempted {
        value: None,
        attempts: tries.used(),
    }
}

/// Merge all batches into one file. Falls back to writing the in-memory
/// records when no batch made it to disk.
fn consolidate(
    checkpoints: &mut Checkpointer,
    records: &[Record],
    settings: &Settings,
    events: &EventSink,
) -> Option<PathBuf> {
    let out = checkpoints.final_path();
    if checkpoints.batches().is_empty() {
        if records.is_empty() {
            return None;
        }
        return match write_records(&out, records) {
            Ok(()) => Some(out),
            Err(e) => {
                warn!("Could not write {}: {}", out.display(), e);
                events.status(format!("Could not write results: {e}"));
                None
            }
        };
    }

    match merge_all(checkpoints.batches(), &out) {
        Ok(summary) => {
            events.status(format!(
                "Merged {} batches into {} ({} posts)",
                summary.files,
                summary.path.display(),
                summary.records.len()
            ));
            if !settings.output.keep_batches {
                let removed = checkpoints.cleanup();
                info!("Deleted {} batch files", removed);
            }
            Some(summary.path)
        }
        Err(e) => {
            warn!("Could not consolidate batches: {}", e);
            events.status(format!("Batches kept in {}: {e}", settings.output.directory.display()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::read_records;
    use crate::config::{ExpansionConfig, HarvestConfig, OutputConfig, SessionConfig};
    use crate::driver::fake::{long_text, FakeDriver, FakePost};

    fn settings(dir: &tempfile::TempDir, keep_batches: bool) -> Settings {
        Settings {
            harvest: HarvestConfig {
                target: 4,
                max_iterations: 5,
                batch_size: 2,
                cooldown_ms: (0, 0),
                scroll_distance: (200, 200),
                scroll_step: (200, 200),
                step_settle_ms: 0,
                step_pause_ms: (0, 0),
                seed: Some(3),
                ..HarvestConfig::default()
            },
            expansion: ExpansionConfig {
                settle_ms: 0,
                ..ExpansionConfig::default()
            },
            session: SessionConfig {
                path: dir.path().join("session.json"),
                login_attempts: 2,
                login_interval_ms: 0,
                ..SessionConfig::default()
            },
            output: OutputConfig {
                directory: dir.path().join("out"),
                keep_batches,
            },
            ..Settings::default()
        }
    }

    fn feed() -> Vec<FakePost> {
        (0..6)
            .map(|i| FakePost::new(&long_text(i), &format!("2024年6月{}日", i + 1)))
            .collect()
    }

    fn request() -> RunRequest {
        RunRequest {
            pages: vec!["https://www.facebook.com/page".into()],
            interactive_login: true,
        }
    }

    #[tokio::test]
    async fn harvests_and_consolidates() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir, false);
        let mut driver = FakeDriver::new(feed());
        driver.logged_in = false;
        driver.login_after = Some(0);
        let events = EventSink::default();

        let report = run(&mut driver, &s, &request(), &events, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.records.len(), 4);
        assert_eq!(report.pages_done, 1);
        assert!(!report.cancelled);
        assert!(driver.overlays_dismissed >= 1);

        let out = report.consolidated.unwrap();
        assert_eq!(read_records(&out).unwrap().len(), 4);
        assert!(report.batches.iter().all(|b| !b.exists()));
        assert!(s.session.path.exists());
    }

    #[tokio::test]
    async fn failed_login_finishes_unsuccessfully() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir, true);
        let mut driver = FakeDriver::new(feed());
        driver.logged_in = false;
        let (events, mut rx) = EventSink::channel();

        let result = run(&mut driver, &s, &request(), &events, &CancelToken::new()).await;
        assert!(result.is_err());
        drop(events);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(HarvestEvent::Finished { success: false }));
    }

    #[tokio::test]
    async fn refused_page_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir, true);
        let mut driver = FakeDriver::new(feed());
        driver.login_after = Some(0);
        driver.refused_urls = vec!["https://www.facebook.com/gone".into()];
        let (events, mut rx) = EventSink::channel();
        let req = RunRequest {
            pages: vec![
                "https://www.facebook.com/gone".into(),
                "https://www.facebook.com/page".into(),
            ],
            interactive_login: true,
        };

        let report = run(&mut driver, &s, &req, &events, &CancelToken::new())
            .await
            .unwrap();
        drop(events);

        assert_eq!(report.pages_done, 1);
        assert_eq!(report.records.len(), 4);
        assert!(driver.visited.contains(&"https://www.facebook.com/gone".to_string()));

        let mut skipped = false;
        while let Some(event) = rx.recv().await {
            if let HarvestEvent::Status(message) = event {
                skipped |= message.starts_with("Skipping https://www.facebook.com/gone");
            }
        }
        assert!(skipped);
    }

    #[tokio::test]
    async fn spawned_run_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir, true);
        let mut driver = FakeDriver::new(feed());
        driver.login_after = Some(0);

        let handle = spawn(driver, s, request());
        handle.cancel.cancel();
        let (result, driver) = handle.task.await.unwrap();
        let report = result.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.pages_done, 0);
        assert!(report.consolidated.is_none());
        assert_eq!(driver.visited, vec![crate::session::LOGIN_URL.to_string()]);
    }
}
