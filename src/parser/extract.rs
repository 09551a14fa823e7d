use chrono::NaiveDateTime;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

use super::time;
use crate::config::SelectorConfig;
use crate::record::{Engagement, Record, UNKNOWN_TIME};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid base url `{0}`")]
    BaseUrl(String),
}

/// One static capture of the rendered page.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub html: String,
    pub taken_at: NaiveDateTime,
}

/// Turns page snapshots into candidate records.
pub struct Extractor {
    container: Selector,
    message: Selector,
    likes: Selector,
    counters: Selector,
    time_ltr: Selector,
    time_fallbacks: Vec<Selector>,
    permalink: Selector,
    base_url: Url,
}

impl Extractor {
    pub fn new(cfg: &SelectorConfig, base_url: &str) -> Result<Self, ExtractError> {
        Ok(Self {
            container: compile(&cfg.container)?,
            message: compile(&cfg.message)?,
            likes: compile(&cfg.likes)?,
            counters: compile(&cfg.counters)?,
            time_ltr: compile(&cfg.time_ltr)?,
            time_fallbacks: cfg
                .time_fallbacks
                .iter()
                .map(|s| compile(s))
                .collect::<Result<_, _>>()?,
            permalink: compile(&cfg.permalink)?,
            base_url: Url::parse(base_url).map_err(|_| ExtractError::BaseUrl(base_url.to_string()))?,
        })
    }

    /// Number of post containers currently rendered.
    pub fn count_containers(&self, html: &str) -> usize {
        Html::parse_document(html).select(&self.container).count()
    }

    /// Parse every post container in the snapshot. Containers with neither
    /// text nor engagement are skipped.
    pub fn extract(&self, snapshot: &Snapshot) -> Vec<Record> {
        let doc = Html::parse_document(&snapshot.html);
        let containers = doc.select(&self.container).count();
        let records: Vec<Record> = doc
            .select(&self.container)
            .filter_map(|post| self.extract_one(post, snapshot.taken_at))
            .collect();

        debug!(found = records.len(), skipped = containers - records.len(), "Extracted snapshot");
        records
    }

    fn extract_one(&self, post: ElementRef<'_>, now: NaiveDateTime) -> Option<Record> {
        let content = post
            .select(&self.message)
            .map(spaced_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let likes = post
            .select(&self.likes)
            .next()
            .map(tight_text)
            .unwrap_or_else(|| "0".to_string());
        let counters: Vec<String> = post.select(&self.counters).take(2).map(tight_text).collect();
        let engagement = Engagement {
            likes,
            comments: counters.first().cloned().unwrap_or_else(|| "0".to_string()),
            shares: counters.get(1).cloned().unwrap_or_else(|| "0".to_string()),
        };

        if content.trim().is_empty() && !engagement.any_nonzero() {
            return None;
        }

        let (raw_timestamp, timestamp) = self.post_time(post, now);
        let url = self.permalink_of(post);

        Some(Record {
            content,
            engagement,
            raw_timestamp,
            timestamp,
            url,
            extracted_at: now,
        })
    }

    /// The second `dir="ltr"` element usually holds the time; otherwise try the
    /// fallback selectors for something short that contains a digit.
    fn post_time(&self, post: ElementRef<'_>, now: NaiveDateTime) -> (String, String) {
        if let Some(el) = post.select(&self.time_ltr).nth(1) {
            let candidate = tight_text(el);
            if !candidate.is_empty() && candidate.chars().count() < 100 {
                let ts = time::normalize(&candidate, now);
                return (candidate, ts);
            }
        }

        for sel in &self.time_fallbacks {
            let Some(el) = post.select(sel).next() else {
                continue;
            };
            let candidate = tight_text(el);
            if candidate.chars().count() < 50 && candidate.chars().any(|c| c.is_ascii_digit()) {
                let ts = time::normalize(&candidate, now);
                return (candidate, ts);
            }
        }

        (String::new(), UNKNOWN_TIME.to_string())
    }

    /// Absolute post link, or empty when there is none or it will not resolve.
    fn permalink_of(&self, post: ElementRef<'_>) -> String {
        let Some(href) = post
            .select(&self.permalink)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
        else {
            return String::new();
        };

        if href.starts_with("http") {
            return href.to_string();
        }
        match self.base_url.join(href) {
            Ok(u) => u.to_string(),
            Err(e) => {
                warn!("Unresolvable permalink {}: {}", href, e);
                String::new()
            }
        }
    }
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Text fragments joined with single spaces.
fn spaced_text(el: ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text fragments glued together; counters and times are often split into
/// one span per character.
fn tight_text(el: ElementRef<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}
