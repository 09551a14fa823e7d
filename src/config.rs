use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "harvester.toml";
pub const SITE_ROOT: &str = "https://www.facebook.com";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub harvest: HarvestConfig,
    pub expansion: ExpansionConfig,
    pub driver: DriverConfig,
    pub session: SessionConfig,
    pub output: OutputConfig,
    pub selectors: SelectorConfig,
}

impl Settings {
    /// Defaults, then `harvester.toml` (or `path`), then `HARVEST_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("HARVEST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Complete posts wanted per page.
    pub target: usize,
    pub max_iterations: u32,
    /// Unflushed complete posts that trigger a checkpoint batch.
    pub batch_size: usize,
    pub housekeeping_every: u32,
    pub cooldown_ms: (u64, u64),
    /// Total pixels scrolled per iteration.
    pub scroll_distance: (u32, u32),
    /// Pixels per scroll step.
    pub scroll_step: (u32, u32),
    pub step_settle_ms: u64,
    pub step_pause_ms: (u64, u64),
    /// Fixed seed for the pacing jitter; random when absent.
    pub seed: Option<u64>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            target: 10,
            max_iterations: 50,
            batch_size: 5,
            housekeeping_every: 10,
            cooldown_ms: (1000, 2000),
            scroll_distance: (500, 700),
            scroll_step: (90, 150),
            step_settle_ms: 300,
            step_pause_ms: (200, 400),
            seed: None,
        }
    }
}

impl HarvestConfig {
    pub fn step_settle(&self) -> Duration {
        Duration::from_millis(self.step_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Upper bound on affordances clicked by one expansion action.
    pub max_clicks: u32,
    pub verify_rounds: u32,
    pub settle_ms: u64,
    /// Only click affordances fully inside the viewport.
    pub viewport_only: bool,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_clicks: 20,
            verify_rounds: 3,
            settle_ms: 500,
            viewport_only: true,
        }
    }
}

impl ExpansionConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// WebDriver server, e.g. msedgedriver or chromedriver.
    pub endpoint: String,
    pub browser: Browser,
    pub headless: bool,
    pub wait_timeout_ms: u64,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            browser: Browser::Edge,
            headless: false,
            wait_timeout_ms: 15_000,
            ready_attempts: 10,
            ready_interval_ms: 500,
        }
    }
}

impl DriverConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Edge,
    Chrome,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub path: PathBuf,
    pub validity_days: i64,
    /// Account the saved session belongs to; sessions saved for someone
    /// else are ignored.
    pub owner: String,
    pub login_attempts: u32,
    pub login_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/session.json"),
            validity_days: 7,
            owner: String::new(),
            login_attempts: 60,
            login_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Keep batch files after they were consolidated.
    pub keep_batches: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("out"),
            keep_batches: true,
        }
    }
}

/// CSS selectors for the post markup. Class names drift, so they are
/// configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub container: String,
    pub message: String,
    pub likes: String,
    /// First match is comments, second is shares.
    pub counters: String,
    pub time_ltr: String,
    pub time_fallbacks: Vec<String>,
    pub permalink: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            container: "div.x1n2onr6.x1ja2u2z".to_string(),
            message: r#"div[data-ad-preview="message"]"#.to_string(),
            likes: "span.xt0b8zv.x1jx94hy.xrbpyxo.xl423tq > span > span".to_string(),
            counters: "div > div > span > div > div > div > span > span.html-span".to_string(),
            time_ltr: r#"[dir="ltr"]"#.to_string(),
            time_fallbacks: vec![
                "a[role='link'] span[dir='ltr']".to_string(),
                "div.xu06os2.x1ok221b > span > div > span > span > a > span".to_string(),
                "span[dir='ltr']".to_string(),
                "time".to_string(),
                "[data-testid='story-subtitle'] span".to_string(),
            ],
            permalink: "div.xu06os2.x1ok221b > span > div > span > span > a".to_string(),
        }
    }
}
