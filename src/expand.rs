use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ExpansionConfig;
use crate::driver::actions::{click_truncation_affordances, snapshot};
use crate::driver::Driver;
use crate::merge::merge;
use crate::parser::extract::Extractor;
use crate::record::{count_truncated, Record};

/// Clicks "see more" affordances and folds the expanded text back into the
/// record set.
pub struct Expander<'a> {
    cfg: &'a ExpansionConfig,
    extractor: &'a Extractor,
    wait: Duration,
}

impl<'a> Expander<'a> {
    pub fn new(cfg: &'a ExpansionConfig, extractor: &'a Extractor, wait: Duration) -> Self {
        Self { cfg, extractor, wait }
    }

    /// Returns the number of affordances clicked and the updated records.
    ///
    /// After clicking, the page is re-read up to `verify_rounds` times; the
    /// round with the fewest still-truncated posts is merged in. A failed
    /// click or a failed re-read leaves `records` as they were.
    pub async fn expand<D: Driver>(&self, driver: &mut D, records: Vec<Record>) -> (u32, Vec<Record>) {
        let clicks = match click_truncation_affordances(driver, self.cfg, self.wait).await {
            Ok(n) => n,
            Err(e) => {
                warn!("Expansion click failed: {}", e);
                0
            }
        };
        if clicks == 0 {
            return (0, records);
        }
        debug!(clicks, "Clicked see-more affordances");

        let mut best: Option<(usize, Vec<Record>)> = None;
        for round in 1..=self.cfg.verify_rounds {
            pause(self.cfg.settle()).await;
            let snap = match snapshot(driver, self.wait).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("Verification round {} could not read the page: {}", round, e);
                    continue;
                }
            };
            let fresh = self.extractor.extract(&snap);
            if fresh.is_empty() {
                continue;
            }

            let truncated = count_truncated(&fresh);
            debug!(round, posts = fresh.len(), truncated, "Verification round");
            if best.as_ref().map_or(true, |(fewest, _)| truncated < *fewest) {
                best = Some((truncated, fresh));
            }
            if truncated == 0 {
                break;
            }
        }

        match best {
            Some((_, fresh)) => (clicks, merge(records, fresh)),
            None => (clicks, records),
        }
    }
}

pub(crate) async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
