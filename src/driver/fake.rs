//! Scripted in-memory browser for tests.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use super::actions::{DISMISS_MARKER, EXPAND_MARKER, LOCATION_SCRIPT};
use super::{Cookie, Driver, DriverError};
use crate::events::CancelToken;

const PAGE_URL: &str = "https://www.facebook.com/page";
const LOGIN_HTML: &str = r#"<html><body><form id="login"><input name="email" type="text"><input name="pass" type="password"></form></body></html>"#;
const VISIBLE_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct FakePost {
    content: String,
    time: String,
    likes: String,
    comments: String,
    shares: String,
    href: Option<String>,
    truncated: bool,
    sticky: bool,
}

impl FakePost {
    pub fn new(content: &str, time: &str) -> Self {
        Self {
            content: content.to_string(),
            time: time.to_string(),
            likes: "1".to_string(),
            comments: "0".to_string(),
            shares: "0".to_string(),
            href: None,
            truncated: false,
            sticky: false,
        }
    }

    pub fn likes(mut self, likes: &str) -> Self {
        self.likes = likes.to_string();
        self
    }

    pub fn href(mut self, href: &str) -> Self {
        self.href = Some(href.to_string());
        self
    }

    /// Rendered cut off behind a "see more" button until clicked.
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Truncated, and clicking never reveals the rest.
    pub fn sticky(mut self) -> Self {
        self.truncated = true;
        self.sticky = true;
        self
    }
}

/// A long, unique post body; long enough that its truncated render shares
/// the identity key of the full one.
pub fn long_text(n: usize) -> String {
    format!("post {n:03} ").repeat(30)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_post(post: &FakePost, expanded: bool) -> String {
    let time = format!(r#"<span dir="ltr">{}</span>"#, escape(&post.time));
    let header = match &post.href {
        Some(href) => format!(r#"<a href="{}" role="link">{time}</a>"#, escape(href)),
        None => time,
    };
    let message = if post.content.is_empty() {
        String::new()
    } else if post.truncated && !expanded {
        let head: String = post.content.chars().take(VISIBLE_CHARS).collect();
        format!(
            r#"<div data-ad-preview="message"><div>{}…</div><div role="button">查看更多</div></div>"#,
            escape(&head)
        )
    } else {
        format!(r#"<div data-ad-preview="message"><div>{}</div></div>"#, escape(&post.content))
    };
    let counter = |value: &str| {
        format!(
            r#"<div><div><span><div><div><div><span><span class="html-span">{}</span></span></div></div></div></span></div></div>"#,
            escape(value)
        )
    };
    format!(
        r#"<div class="x1n2onr6 x1ja2u2z"><h3><span dir="ltr">Sample Page</span></h3><div class="xu06os2 x1ok221b"><span><div><span><span>{header}</span></span></div></span></div>{message}<span class="xt0b8zv x1jx94hy xrbpyxo xl423tq"><span><span>{likes}</span></span></span>{comments}{shares}</div>"#,
        likes = escape(&post.likes),
        comments = counter(&post.comments),
        shares = counter(&post.shares),
    )
}

fn wrap(body: String) -> String {
    format!(r#"<!DOCTYPE html><html><body><div role="feed">{body}</div></body></html>"#)
}

/// Render posts the way the feed shows them before any clicking.
pub fn render_page(posts: &[FakePost]) -> String {
    wrap(posts.iter().map(|p| render_post(p, false)).collect())
}

/// A feed that lazily loads posts as it is scrolled.
pub struct FakeDriver {
    pub posts: Vec<FakePost>,
    /// Posts rendered before any scrolling.
    pub initial: usize,
    /// Scrolled pixels that load one more post.
    pub px_per_post: u32,
    /// Snapshots that still show a clicked post truncated.
    pub expand_lag: u32,
    pub fail_expand: bool,
    /// Upcoming `page_source` calls that fail.
    pub failing_snapshots: u32,
    pub logged_in: bool,
    /// Login-page polls before the user finishes logging in; `None` never does.
    pub login_after: Option<u32>,
    pub jar: Vec<Cookie>,
    pub visited: Vec<String>,
    pub expand_calls: u32,
    pub overlays_dismissed: u32,
    /// Pages whose navigation reports failure.
    pub refused_urls: Vec<String>,
    /// Cancel the token once this many scroll steps have run.
    pub cancel_after_scrolls: Option<(u32, CancelToken)>,
    pub scroll_steps: u32,
    url: String,
    scrolled: u32,
    pending: HashMap<usize, u32>,
    expanded: HashSet<usize>,
}

impl FakeDriver {
    pub fn new(posts: Vec<FakePost>) -> Self {
        Self {
            posts,
            initial: 3,
            px_per_post: 200,
            expand_lag: 0,
            fail_expand: false,
            failing_snapshots: 0,
            logged_in: true,
            login_after: None,
            jar: Vec::new(),
            visited: Vec::new(),
            expand_calls: 0,
            overlays_dismissed: 0,
            refused_urls: Vec::new(),
            cancel_after_scrolls: None,
            scroll_steps: 0,
            url: PAGE_URL.to_string(),
            scrolled: 0,
            pending: HashMap::new(),
            expanded: HashSet::new(),
        }
    }

    pub fn loaded(&self) -> usize {
        let grown = self.initial + (self.scrolled / self.px_per_post.max(1)) as usize;
        grown.min(self.posts.len())
    }

    pub fn scrolled(&self) -> u32 {
        self.scrolled
    }

    fn on_login_page(&self) -> bool {
        self.url.contains("login") || (!self.logged_in && self.url.trim_end_matches('/') == "https://www.facebook.com")
    }

    fn finish_login(&mut self) {
        self.logged_in = true;
        self.url = "https://www.facebook.com/".to_string();
        self.jar.push(Cookie {
            name: "c_user".into(),
            value: "1000".into(),
            path: Some("/".into()),
            domain: Some(".facebook.com".into()),
            secure: Some(true),
            http_only: None,
            expiry: None,
            same_site: None,
        });
    }

    fn render(&mut self) -> String {
        self.pending.retain(|idx, remaining| {
            if *remaining == 0 {
                self.expanded.insert(*idx);
                false
            } else {
                *remaining -= 1;
                true
            }
        });
        let body = self.posts[..self.loaded()]
            .iter()
            .enumerate()
            .map(|(i, p)| render_post(p, self.expanded.contains(&i)))
            .collect();
        wrap(body)
    }

    fn click_see_more(&mut self) -> u32 {
        let mut clicks = 0;
        for idx in 0..self.loaded() {
            let post = &self.posts[idx];
            if !post.truncated || self.expanded.contains(&idx) || self.pending.contains_key(&idx) {
                continue;
            }
            clicks += 1;
            if !post.sticky {
                self.pending.insert(idx, self.expand_lag);
            }
        }
        clicks
    }
}

impl Driver for FakeDriver {
    async fn navigate(&mut self, url: &str) -> Result<bool, DriverError> {
        self.visited.push(url.to_string());
        if self.refused_urls.iter().any(|u| u == url) {
            return Ok(false);
        }
        self.url = url.to_string();
        self.scrolled = 0;
        Ok(true)
    }

    async fn page_source(&mut self) -> Result<String, DriverError> {
        if self.failing_snapshots > 0 {
            self.failing_snapshots -= 1;
            return Err(DriverError::Unexpected("renderer crashed".into()));
        }
        if self.on_login_page() {
            match self.login_after {
                Some(0) => self.finish_login(),
                Some(n) => {
                    self.login_after = Some(n - 1);
                    return Ok(LOGIN_HTML.to_string());
                }
                None => return Ok(LOGIN_HTML.to_string()),
            }
        }
        Ok(self.render())
    }

    async fn execute(&mut self, script: &str) -> Result<Value, DriverError> {
        if script.starts_with(EXPAND_MARKER) {
            self.expand_calls += 1;
            if self.fail_expand {
                return Err(DriverError::Protocol {
                    error: "javascript error".into(),
                    message: "element click intercepted".into(),
                });
            }
            return Ok(json!(self.click_see_more()));
        }
        if script.starts_with(DISMISS_MARKER) {
            self.overlays_dismissed += 1;
            return Ok(json!(1));
        }
        if script == LOCATION_SCRIPT {
            return Ok(json!(self.url));
        }
        if let Some(rest) = script.strip_prefix("window.scrollBy(0, ") {
            let px: u32 = rest
                .split(')')
                .next()
                .and_then(|n| n.trim().parse().ok())
                .ok_or_else(|| DriverError::Unexpected(format!("bad scroll script {script}")))?;
            self.scrolled += px;
            self.scroll_steps += 1;
            if let Some((after, token)) = &self.cancel_after_scrolls {
                if self.scroll_steps >= *after {
                    token.cancel();
                }
            }
            return Ok(json!(self.scrolled));
        }
        Ok(Value::Null)
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, DriverError> {
        Ok(self.jar.clone())
    }

    async fn add_cookie(&mut self, cookie: &Cookie) -> Result<(), DriverError> {
        if cookie.name == "reject" {
            return Err(DriverError::Protocol {
                error: "unable to set cookie".into(),
                message: cookie.name.clone(),
            });
        }
        if cookie.name == "c_user" {
            self.logged_in = true;
        }
        self.jar.push(cookie.clone());
        Ok(())
    }
}
