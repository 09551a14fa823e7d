use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{Cookie, Driver, DriverError};
use crate::config::{Browser, DriverConfig};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

/// A W3C WebDriver session (msedgedriver, chromedriver).
pub struct WebDriver {
    http: Client,
    session_url: String,
}

impl WebDriver {
    /// Open a browser session, retrying while the driver server is still
    /// starting up.
    pub async fn connect(cfg: &DriverConfig) -> Result<Self, DriverError> {
        let http = Client::builder().timeout(cfg.wait_timeout() * 2).build()?;
        let endpoint = cfg.endpoint.trim_end_matches('/');
        let body = json!({ "capabilities": { "alwaysMatch": capabilities(cfg) } });

        let mut attempt = 0;
        let value = loop {
            match send(http.post(format!("{endpoint}/session")).json(&body)).await {
                Ok(value) => break value,
                Err(DriverError::Transport(e)) if attempt < MAX_RETRIES => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "WebDriver at {} not reachable (attempt {}/{}), retrying in {:.1}s: {}",
                        endpoint,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Unexpected(format!("no sessionId in {value}")))?;
        info!("Opened {:?} session {}", cfg.browser, id);

        Ok(Self {
            session_url: format!("{endpoint}/session/{id}"),
            http,
        })
    }

    /// End the session and close the browser.
    pub async fn quit(self) -> Result<(), DriverError> {
        send(self.http.delete(&self.session_url)).await?;
        debug!("Closed session {}", self.session_url);
        Ok(())
    }

    fn url(&self, command: &str) -> String {
        format!("{}/{}", self.session_url, command)
    }
}

fn capabilities(cfg: &DriverConfig) -> Value {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled",
        "--disable-notifications",
        "--start-maximized",
    ];
    if cfg.headless {
        args.push("--headless=new");
    }
    let options = json!({
        "args": args,
        "excludeSwitches": ["enable-automation"],
    });
    match cfg.browser {
        Browser::Edge => json!({ "browserName": "MicrosoftEdge", "ms:edgeOptions": options }),
        Browser::Chrome => json!({ "browserName": "chrome", "goog:chromeOptions": options }),
    }
}

/// Send a command and unwrap the `value` member of the reply.
async fn send(request: RequestBuilder) -> Result<Value, DriverError> {
    let response = request.send().await?;
    let status = response.status();
    let body: Value = response.json().await?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    Err(protocol_error(&value, status.as_u16()))
}

fn protocol_error(value: &Value, status: u16) -> DriverError {
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    DriverError::Protocol {
        error: field("error").unwrap_or_else(|| format!("http {status}")),
        message: field("message").unwrap_or_default(),
    }
}

impl Driver for WebDriver {
    async fn navigate(&mut self, url: &str) -> Result<bool, DriverError> {
        send(self.http.post(self.url("url")).json(&json!({ "url": url }))).await?;
        Ok(true)
    }

    async fn page_source(&mut self) -> Result<String, DriverError> {
        match send(self.http.get(self.url("source"))).await? {
            Value::String(html) => Ok(html),
            other => Err(DriverError::Unexpected(format!("page source was {other}"))),
        }
    }

    async fn execute(&mut self, script: &str) -> Result<Value, DriverError> {
        let body = json!({ "script": script, "args": [] });
        send(self.http.post(self.url("execute/sync")).json(&body)).await
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        let value = send(self.http.get(self.url("cookie"))).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<(), DriverError> {
        send(self.http.post(self.url("cookie")).json(&json!({ "cookie": cookie }))).await?;
        Ok(())
    }
}
