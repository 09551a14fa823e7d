use std::future::Future;
use std::time::Duration;

use chrono::{Local, SubsecRound};
use serde_json::Value;

use super::{Driver, DriverError};
use crate::config::ExpansionConfig;
use crate::parser::extract::Snapshot;
use crate::record::TRUNCATION_SENTINELS;

pub(crate) const EXPAND_MARKER: &str = "/* expand-truncated */";
pub(crate) const DISMISS_MARKER: &str = "/* dismiss-overlays */";
pub(crate) const LOCATION_SCRIPT: &str = "return window.location.href;";

const EXPAND_TEMPLATE: &str = r#"var labels = __LABELS__;
var limit = __LIMIT__;
var viewportOnly = __VIEWPORT_ONLY__;
var clicked = 0;
var nodes = document.querySelectorAll('span, div, a');
for (var i = 0; i < nodes.length && clicked < limit; i++) {
    var el = nodes[i];
    var text = (el.innerText || el.textContent || '').trim();
    if (labels.indexOf(text) === -1) continue;
    try {
        var r = el.getBoundingClientRect();
        var visible = r.width > 0 && r.height > 0;
        if (viewportOnly) visible = visible && r.top >= 0 && r.bottom <= window.innerHeight;
        if (visible) { el.click(); clicked++; }
    } catch (e) {}
}
return clicked;"#;

const DISMISS_BODY: &str = r#"var closed = 0;
['關閉', 'Close'].forEach(function (label) {
    var sel = 'div[aria-label="' + label + '"], [role="button"][aria-label="' + label + '"]';
    document.querySelectorAll(sel).forEach(function (el) {
        var r = el.getBoundingClientRect();
        if (r.width > 0 && r.height > 0) {
            try { el.click(); closed++; } catch (e) {}
        }
    });
});
return closed;"#;

/// Await a driver call, giving up after `limit`.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}

/// Capture the page. `taken_at` is kept to whole seconds, the precision
/// checkpoint files store.
pub async fn snapshot<D: Driver>(driver: &mut D, limit: Duration) -> Result<Snapshot, DriverError> {
    let html = bounded(limit, driver.page_source()).await?;
    Ok(Snapshot {
        html,
        taken_at: Local::now().naive_local().trunc_subsecs(0),
    })
}

pub fn scroll_script(px: u32) -> String {
    format!("window.scrollBy(0, {px}); return window.scrollY;")
}

pub async fn scroll_by<D: Driver>(driver: &mut D, px: u32, limit: Duration) -> Result<(), DriverError> {
    bounded(limit, driver.execute(&scroll_script(px))).await.map(|_| ())
}

pub fn expand_script(cfg: &ExpansionConfig) -> String {
    let labels = serde_json::to_string(TRUNCATION_SENTINELS).unwrap_or_else(|_| "[]".into());
    let body = EXPAND_TEMPLATE
        .replace("__LABELS__", &labels)
        .replace("__LIMIT__", &cfg.max_clicks.to_string())
        .replace("__VIEWPORT_ONLY__", if cfg.viewport_only { "true" } else { "false" });
    format!("{EXPAND_MARKER}\n{body}")
}

/// Click every visible "see more" affordance, up to the configured cap.
pub async fn click_truncation_affordances<D: Driver>(
    driver: &mut D,
    cfg: &ExpansionConfig,
    limit: Duration,
) -> Result<u32, DriverError> {
    let value = bounded(limit, driver.execute(&expand_script(cfg))).await?;
    as_count(&value)
}

/// Close login nags and other dialogs covering the feed.
pub async fn dismiss_overlays<D: Driver>(driver: &mut D, limit: Duration) -> Result<u32, DriverError> {
    let script = format!("{DISMISS_MARKER}\n{DISMISS_BODY}");
    let value = bounded(limit, driver.execute(&script)).await?;
    as_count(&value)
}

pub async fn current_url<D: Driver>(driver: &mut D, limit: Duration) -> Result<String, DriverError> {
    match bounded(limit, driver.execute(LOCATION_SCRIPT)).await? {
        Value::String(url) => Ok(url),
        other => Err(DriverError::Unexpected(format!("location was {other}"))),
    }
}

fn as_count(value: &Value) -> Result<u32, DriverError> {
    value
        .as_u64()
        .map(|n| n.min(u32::MAX as u64) as u32)
        .ok_or_else(|| DriverError::Unexpected(format!("expected a count, got {value}")))
}
