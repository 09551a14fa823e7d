pub mod actions;
#[cfg(test)]
pub mod fake;
pub mod webdriver;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("webdriver transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webdriver error `{error}`: {message}")]
    Protocol { error: String, message: String },
    #[error("unexpected webdriver response: {0}")]
    Unexpected(String),
    #[error("could not decode webdriver payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

/// Browser cookie in WebDriver wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

/// The browser session the harvester drives.
///
/// Every action mutates the live document, so a driver is used by exactly one
/// caller at a time; `&mut self` on each method enforces that.
pub trait Driver: Send {
    fn navigate(&mut self, url: &str) -> impl Future<Output = Result<bool, DriverError>> + Send;

    /// Serialized DOM of the current document.
    fn page_source(&mut self) -> impl Future<Output = Result<String, DriverError>> + Send;

    /// Run a synchronous script in the page and return its result.
    fn execute(&mut self, script: &str)
        -> impl Future<Output = Result<Value, DriverError>> + Send;

    fn cookies(&mut self) -> impl Future<Output = Result<Vec<Cookie>, DriverError>> + Send;

    fn add_cookie(&mut self, cookie: &Cookie)
        -> impl Future<Output = Result<(), DriverError>> + Send;
}
