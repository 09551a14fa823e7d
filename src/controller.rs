use std::collections::HashSet;
use std::mem;
use std::time::Duration;

use rand::distributions::uniform::SampleUniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpointer;
use crate::config::{HarvestConfig, Settings};
use crate::driver::actions::{scroll_by, snapshot};
use crate::driver::Driver;
use crate::events::{CancelToken, EventSink};
use crate::expand::{pause, Expander};
use crate::merge::{dedupe, merge};
use crate::parser::extract::Extractor;
use crate::record::{complete_only, IdentityKey, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Scrolling,
    CheckpointCheck,
    TargetCheck,
    Housekeeping,
    Done(Ending),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    TargetReached,
    IterationCap,
    Cancelled,
}

#[derive(Debug)]
pub struct HarvestOutcome {
    /// Complete records only, at most `target` of them.
    pub records: Vec<Record>,
    pub ending: Ending,
    pub iterations: u32,
    pub clicks: u32,
    /// Records that were still truncated when the run ended.
    pub dropped_truncated: usize,
}

/// Drives one page: scroll, extract, expand, checkpoint, until the target
/// is met, the iteration cap is hit, or the run is cancelled.
pub struct Harvester<'a> {
    cfg: &'a HarvestConfig,
    extractor: &'a Extractor,
    expander: Expander<'a>,
    checkpoints: &'a mut Checkpointer,
    events: &'a EventSink,
    cancel: &'a CancelToken,
    wait: Duration,
    rng: StdRng,
    records: Vec<Record>,
    flushed: HashSet<IdentityKey>,
    iterations: u32,
    clicks: u32,
    last_housekeeping: u32,
}

impl<'a> Harvester<'a> {
    pub fn new(
        settings: &'a Settings,
        extractor: &'a Extractor,
        checkpoints: &'a mut Checkpointer,
        events: &'a EventSink,
        cancel: &'a CancelToken,
    ) -> Self {
        let wait = settings.driver.wait_timeout();
        let rng = match settings.harvest.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            cfg: &settings.harvest,
            extractor,
            expander: Expander::new(&settings.expansion, extractor, wait),
            checkpoints,
            events,
            cancel,
            wait,
            rng,
            records: Vec::new(),
            flushed: HashSet::new(),
            iterations: 0,
            clicks: 0,
            last_housekeeping: 0,
        }
    }

    pub async fn run<D: Driver>(mut self, driver: &mut D) -> HarvestOutcome {
        let mut phase = Phase::Init;
        let ending = loop {
            debug!(?phase, iteration = self.iterations);
            phase = match phase {
                Phase::Init => {
                    self.initial_pass(driver).await;
                    Phase::CheckpointCheck
                }
                Phase::Scrolling => {
                    self.scroll(driver).await;
                    self.iterations += 1;
                    Phase::CheckpointCheck
                }
                Phase::CheckpointCheck => {
                    self.checkpoint();
                    self.events.progress(self.complete_count(), self.cfg.target);
                    Phase::TargetCheck
                }
                Phase::TargetCheck => self.decide(),
                Phase::Housekeeping => {
                    self.housekeeping(driver).await;
                    Phase::CheckpointCheck
                }
                Phase::Done(ending) => break ending,
                Phase::Stopped => break Ending::Cancelled,
            };
        };
        self.finish(driver, ending).await
    }

    fn complete_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_complete()).count()
    }

    fn decide(&self) -> Phase {
        if self.cancel.is_cancelled() {
            return Phase::Stopped;
        }
        let complete = self.complete_count();
        if complete >= self.cfg.target {
            info!("Target reached: {} complete posts", complete);
            return Phase::Done(Ending::TargetReached);
        }
        if self.iterations >= self.cfg.max_iterations {
            info!(
                "Stopped after {} iterations with {}/{} complete posts",
                self.iterations, complete, self.cfg.target
            );
            return Phase::Done(Ending::IterationCap);
        }
        let every = self.cfg.housekeeping_every;
        if every > 0
            && self.iterations > 0
            && self.iterations % every == 0
            && self.last_housekeeping != self.iterations
        {
            return Phase::Housekeeping;
        }
        Phase::Scrolling
    }

    /// Capture what is above the fold before the first scroll.
    async fn initial_pass<D: Driver>(&mut self, driver: &mut D) {
        self.refresh(driver).await;
        self.records = dedupe(mem::take(&mut self.records));
        self.expand(driver).await;
        info!("Initial pass: {} posts", self.records.len());
    }

    async fn scroll<D: Driver>(&mut self, driver: &mut D) {
        let distance = jitter(&mut self.rng, self.cfg.scroll_distance);
        let step = jitter(&mut self.rng, self.cfg.scroll_step).max(1);
        let steps = (distance / step).max(1);

        for _ in 0..steps {
            if self.cancel.is_cancelled() {
                debug!("Cancellation observed between scroll steps");
                return;
            }
            if let Err(e) = scroll_by(driver, step, self.wait).await {
                warn!("Scroll step failed: {}", e);
            }
            pause(self.cfg.step_settle()).await;

            if self.expand(driver).await == 0 {
                self.refresh(driver).await;
            }
            let ms = jitter(&mut self.rng, self.cfg.step_pause_ms);
            pause(Duration::from_millis(ms)).await;
        }

        info!(
            "Iteration {}/{}: {} posts, {} complete",
            self.iterations + 1,
            self.cfg.max_iterations,
            self.records.len(),
            self.complete_count()
        );
    }

    async fn housekeeping<D: Driver>(&mut self, driver: &mut D) {
        self.last_housekeeping = self.iterations;
        let clicks = self.expand(driver).await;
        debug!(clicks, "Housekeeping expansion pass");
        let ms = jitter(&mut self.rng, self.cfg.cooldown_ms);
        pause(Duration::from_millis(ms)).await;
    }

    async fn expand<D: Driver>(&mut self, driver: &mut D) -> u32 {
        let records = mem::take(&mut self.records);
        let (clicks, records) = self.expander.expand(driver, records).await;
        self.records = records;
        self.clicks += clicks;
        clicks
    }

    /// Re-read the page and merge whatever finished loading.
    async fn refresh<D: Driver>(&mut self, driver: &mut D) {
        match snapshot(driver, self.wait).await {
            Ok(snap) => {
                let fresh = self.extractor.extract(&snap);
                self.records = merge(mem::take(&mut self.records), fresh);
            }
            Err(e) => warn!("Could not read the page: {}", e),
        }
    }

    fn checkpoint(&mut self) {
        let pending = self.unflushed(&self.records);
        if !pending.is_empty() && pending.len() >= self.cfg.batch_size {
            self.flush(pending);
        }
    }

    fn unflushed(&self, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .filter(|r| r.is_complete() && !self.flushed.contains(&r.identity_key()))
            .cloned()
            .collect()
    }

    fn flush(&mut self, batch: Vec<Record>) {
        let number = self.checkpoints.next_batch();
        match self.checkpoints.flush(&batch, number) {
            Ok(Some(path)) => {
                self.flushed.extend(batch.iter().map(Record::identity_key));
                self.events.batch_saved(format!(
                    "Saved batch {}: {} posts to {}",
                    number,
                    batch.len(),
                    path.display()
                ));
            }
            Ok(None) => {}
            // Records stay unflushed and are retried at the next check.
            Err(e) => {
                warn!("Could not save batch {}: {}", number, e);
                self.events.status(format!("Could not save batch {number}: {e}"));
            }
        }
    }

    async fn finish<D: Driver>(mut self, driver: &mut D, ending: Ending) -> HarvestOutcome {
        if ending == Ending::Cancelled {
            self.events.status("Stop requested, saving what was gathered");
        }
        self.expand(driver).await;

        let mut complete = complete_only(&self.records);
        let dropped_truncated = self.records.len() - complete.len();
        if dropped_truncated > 0 {
            info!("Dropping {} posts that stayed truncated", dropped_truncated);
        }
        complete.truncate(self.cfg.target);

        let remainder = self.unflushed(&complete);
        if !remainder.is_empty() {
            self.flush(remainder);
        }
        self.events.progress(complete.len(), self.cfg.target);

        HarvestOutcome {
            records: complete,
            ending,
            iterations: self.iterations,
            clicks: self.clicks,
            dropped_truncated,
        }
    }
}

/// Uniform pick from an inclusive range given as `(low, high)` in either order.
fn jitter<T: SampleUniform + PartialOrd + Copy>(rng: &mut StdRng, (a, b): (T, T)) -> T {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    rng.gen_range(lo..=hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{merge_all, read_records};
    use crate::config::{ExpansionConfig, SITE_ROOT};
    use crate::driver::fake::{long_text, FakeDriver, FakePost};
    use crate::events::HarvestEvent;

    fn settings(target: usize, max_iterations: u32) -> Settings {
        Settings {
            harvest: HarvestConfig {
                target,
                max_iterations,
                batch_size: 3,
                housekeeping_every: 3,
                cooldown_ms: (0, 0),
                scroll_distance: (400, 400),
                scroll_step: (200, 200),
                step_settle_ms: 0,
                step_pause_ms: (0, 0),
                seed: Some(7),
            },
            expansion: ExpansionConfig {
                settle_ms: 0,
                ..ExpansionConfig::default()
            },
            ..Settings::default()
        }
    }

    /// Posts with distinct dates; every third one starts truncated.
    fn feed(n: usize) -> Vec<FakePost> {
        (0..n)
            .map(|i| {
                let post = FakePost::new(&long_text(i), &format!("2024年5月{}日", i + 1));
                if i % 3 == 2 {
                    post.truncated()
                } else {
                    post
                }
            })
            .collect()
    }

    fn extractor() -> Extractor {
        Extractor::new(&Settings::default().selectors, SITE_ROOT).unwrap()
    }

    #[tokio::test]
    async fn reaches_target_with_complete_posts() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(8, 20);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let events = EventSink::default();
        let cancel = CancelToken::new();
        let mut driver = FakeDriver::new(feed(12));

        let outcome = Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;

        assert_eq!(outcome.ending, Ending::TargetReached);
        assert_eq!(outcome.records.len(), 8);
        assert!(outcome.records.iter().all(Record::is_complete));
        assert!(outcome.clicks > 0);
        assert!(outcome.iterations < 20);

        let merged = merge_all(cp.batches(), &cp.final_path()).unwrap();
        for record in &outcome.records {
            assert!(merged.records.iter().any(|m| m.content == record.content));
        }
        assert!(merged.records.iter().all(Record::is_complete));
    }

    #[tokio::test]
    async fn stops_at_iteration_cap() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(10, 5);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let events = EventSink::default();
        let cancel = CancelToken::new();
        let mut driver = FakeDriver::new(feed(4));

        let outcome = Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;

        assert_eq!(outcome.ending, Ending::IterationCap);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.records.len(), 4);
    }

    #[tokio::test]
    async fn cancellation_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(10, 20);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let events = EventSink::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut driver = FakeDriver::new(feed(12));

        let outcome = Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;

        assert_eq!(outcome.ending, Ending::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(driver.scrolled(), 0);
        assert_eq!(outcome.records.len(), 3);

        let saved: usize = cp
            .batches()
            .iter()
            .map(|p| read_records(p).unwrap().len())
            .sum();
        assert_eq!(saved, 3);
    }

    #[tokio::test]
    async fn cancel_mid_run_keeps_finished_iterations_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(20, 20);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let events = EventSink::default();
        let cancel = CancelToken::new();
        let mut driver = FakeDriver::new(feed(12));
        // two steps per iteration, so this lands in the second iteration
        driver.cancel_after_scrolls = Some((4, cancel.clone()));

        let outcome = Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;

        assert_eq!(outcome.ending, Ending::Cancelled);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(driver.scroll_steps, 4);
        assert!(!cp.batches().is_empty());
        assert!(outcome.records.len() > 3);

        let on_disk: HashSet<String> = cp
            .batches()
            .iter()
            .flat_map(|p| read_records(p).unwrap())
            .map(|r| r.content)
            .collect();
        let gathered: HashSet<String> = outcome.records.iter().map(|r| r.content.clone()).collect();
        assert_eq!(on_disk, gathered);
    }

    #[tokio::test]
    async fn unresolved_truncation_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(5, 2);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let events = EventSink::default();
        let cancel = CancelToken::new();
        let mut driver = FakeDriver::new(vec![
            FakePost::new(&long_text(1), "2024年5月1日"),
            FakePost::new(&long_text(2), "2024年5月2日").sticky(),
            FakePost::new(&long_text(3), "2024年5月3日"),
        ]);

        let outcome = Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.dropped_truncated, 1);
        for path in cp.batches() {
            assert!(read_records(path).unwrap().iter().all(Record::is_complete));
        }
    }

    #[tokio::test]
    async fn reports_progress_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(6, 20);
        let ex = extractor();
        let mut cp = Checkpointer::new(dir.path()).unwrap();
        let (events, mut rx) = EventSink::channel();
        let cancel = CancelToken::new();
        let mut driver = FakeDriver::new(feed(10));

        Harvester::new(&s, &ex, &mut cp, &events, &cancel)
            .run(&mut driver)
            .await;
        drop(events);

        let mut last_percent = None;
        let mut batches = 0;
        while let Some(event) = rx.recv().await {
            match event {
                HarvestEvent::Progress { percent, .. } => last_percent = Some(percent),
                HarvestEvent::BatchSaved(_) => batches += 1,
                _ => {}
            }
        }
        assert_eq!(last_percent, Some(100.0));
        assert_eq!(batches, cp.batches().len());
        assert!(batches >= 2);
    }

    #[test]
    fn jitter_accepts_reversed_ranges() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let v = jitter(&mut rng, (150u32, 90u32));
            assert!((90..=150).contains(&v));
        }
        assert_eq!(jitter(&mut rng, (5u64, 5u64)), 5);
    }
}
