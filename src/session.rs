use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{SessionConfig, SITE_ROOT};
use crate::driver::actions::{bounded, current_url};
use crate::driver::{Cookie, Driver, DriverError};
use crate::retry::{Attempted, RetryPolicy};

pub const LOGIN_URL: &str = "https://www.facebook.com/login";

static LOGIN_FORM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[name="email"]"#).unwrap());

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("not logged in")]
    NotAuthenticated,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedSession {
    cookies: Vec<Cookie>,
    saved_at: DateTime<Local>,
    owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    Restored { cookies: usize, skipped: usize },
    Missing,
    Expired,
    OwnerMismatch,
    Corrupt,
}

/// Saved browser cookies, so a run does not need a fresh login.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    validity: TimeDelta,
    owner: String,
}

impl SessionStore {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            validity: TimeDelta::try_days(cfg.validity_days).unwrap_or(TimeDelta::MAX),
            owner: cfg.owner.clone(),
        }
    }

    /// Save the driver's current cookies. Returns how many were saved.
    pub async fn persist<D: Driver>(&self, driver: &mut D, wait: Duration) -> Result<usize, SessionError> {
        let cookies = bounded(wait, driver.cookies()).await?;
        let saved = SavedSession {
            cookies,
            saved_at: Local::now(),
            owner: self.owner.clone(),
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&saved)?)?;
        info!("Saved {} cookies to {}", saved.cookies.len(), self.path.display());
        Ok(saved.cookies.len())
    }

    /// Load saved cookies into the driver. Stale or unreadable files are
    /// deleted; a session saved for another owner is left alone.
    pub async fn restore<D: Driver>(
        &self,
        driver: &mut D,
        wait: Duration,
        now: DateTime<Local>,
    ) -> Result<Restore, SessionError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Restore::Missing),
            Err(e) => return Err(e.into()),
        };
        let saved: SavedSession = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("Discarding unreadable session {}: {}", self.path.display(), e);
                self.discard();
                return Ok(Restore::Corrupt);
            }
        };

        if now.signed_duration_since(saved.saved_at) > self.validity {
            info!("Saved session from {} has expired", saved.saved_at.format("%Y-%m-%d %H:%M"));
            self.discard();
            return Ok(Restore::Expired);
        }
        if saved.owner != self.owner {
            warn!("Saved session belongs to `{}`, not `{}`", saved.owner, self.owner);
            return Ok(Restore::OwnerMismatch);
        }

        // Cookies can only be set for the domain currently loaded.
        bounded(wait, driver.navigate(SITE_ROOT)).await?;
        let mut skipped = 0;
        for cookie in &saved.cookies {
            if let Err(e) = bounded(wait, driver.add_cookie(cookie)).await {
                warn!("Skipping cookie {}: {}", cookie.name, e);
                skipped += 1;
            }
        }
        let cookies = saved.cookies.len() - skipped;
        info!("Restored {} cookies ({} skipped)", cookies, skipped);
        Ok(Restore::Restored { cookies, skipped })
    }

    fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not delete {}: {}", self.path.display(), e);
        }
    }
}

fn shows_login_form(html: &str) -> bool {
    Html::parse_document(html).select(&LOGIN_FORM).next().is_some()
}

/// Inspect the current document without navigating.
async fn looks_logged_in<D: Driver>(driver: &mut D, wait: Duration) -> Result<bool, DriverError> {
    let html = bounded(wait, driver.page_source()).await?;
    if shows_login_form(&html) {
        return Ok(false);
    }
    let url = current_url(driver, wait).await?;
    Ok(!url.contains("login"))
}

/// Load the site root and check that it is not asking for a login.
pub async fn is_authenticated<D: Driver>(driver: &mut D, wait: Duration) -> Result<bool, DriverError> {
    bounded(wait, driver.navigate(SITE_ROOT)).await?;
    looks_logged_in(driver, wait).await
}

/// Restores the saved session, falling back to a manual browser login.
pub struct Authenticator<'a> {
    store: SessionStore,
    cfg: &'a SessionConfig,
    wait: Duration,
}

impl<'a> Authenticator<'a> {
    pub fn new(cfg: &'a SessionConfig, wait: Duration) -> Self {
        Self {
            store: SessionStore::new(cfg),
            cfg,
            wait,
        }
    }

    pub async fn authenticate<D: Driver>(&self, driver: &mut D, interactive: bool) -> Result<(), SessionError> {
        match self.store.restore(driver, self.wait, Local::now()).await? {
            Restore::Restored { .. } => {
                if is_authenticated(driver, self.wait).await? {
                    info!("Logged in with saved session");
                    return Ok(());
                }
                warn!("Saved session was rejected");
            }
            other => info!("No usable saved session ({:?})", other),
        }

        if !interactive {
            return Err(SessionError::NotAuthenticated);
        }

        let waited = self.wait_for_manual_login(driver).await?;
        match waited.value {
            Some(()) => {
                info!("Login detected after {} checks", waited.attempts);
                self.store.persist(driver, self.wait).await?;
                Ok(())
            }
            None => {
                warn!("Gave up waiting for login after {} checks", waited.attempts);
                Err(SessionError::NotAuthenticated)
            }
        }
    }

    async fn wait_for_manual_login<D: Driver>(&self, driver: &mut D) -> Result<Attempted<()>, SessionError> {
        bounded(self.wait, driver.navigate(LOGIN_URL)).await?;
        info!("Log in through the browser window; waiting...");

        let interval = Duration::from_millis(self.cfg.login_interval_ms);
        let mut tries = RetryPolicy::new(self.cfg.login_attempts, interval).start();
        while tries.next().await {
            match looks_logged_in(driver, self.wait).await {
                Ok(true) => {
                    return Ok(Attempted {
                        value: Some(()),
                        attempts: tries.used(),
                    })
                }
                Ok(false) => {}
                Err(e) => warn!("Login check failed: {}", e),
            }
        }
        Ok(Attempted {
            value: None,
            attempts: tries.used(),
        })
    }
}
