//! In-memory portal for exercising the session, pool and crawler code.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::browser::{Browser, BrowserPage, Cookie};
use super::error::{PortalError, Result};
use super::parser::{PASSWORD_FIELD, USERNAME_FIELD};

pub const BASE: &str = "https://portal.test";
const AUTH_COOKIE: &str = ".ASPXAUTH";

pub fn login_form_html() -> String {
    format!(
        r#"<html><body><form method="post">
            <input name="{USERNAME_FIELD}" type="text"/>
            <input name="{PASSWORD_FIELD}" type="password"/>
            <input type="submit" value="Giriş"/>
        </form></body></html>"#
    )
}

/// Wraps body markup in a page chrome that carries the logout control.
pub fn authed_page(body: &str) -> String {
    format!(
        r#"<html><body><table><tr><td id="ctl00_Header1_tdLogout"><a href="/Logout">Çıkış</a></td></tr></table>{body}</body></html>"#
    )
}

/// Listing table markup for `(name, href, size)` rows.
pub fn listing(rows: &[(&str, &str, &str)]) -> String {
    let mut html = String::from(
        r#"<div class="dosyaSistemi"><table class="data"><tr><th>Ad</th><th>Boyut</th></tr>"#,
    );
    for (name, href, size) in rows {
        html.push_str(&format!(
            r#"<tr><td><a href="{href}">{name}</a></td><td>{size}</td><td>01.10.2024</td></tr>"#
        ));
    }
    html.push_str("</table></div>");
    authed_page(&html)
}

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, String>,
    failing: HashSet<String>,
    snapshots_fail: bool,
    username: String,
    secret: String,
    token: Option<String>,
    logins: usize,
    visits: Vec<String>,
}

/// Shared fixture portal. Cloning shares state.
#[derive(Clone, Default)]
pub struct FixtureSite {
    state: Arc<Mutex<SiteState>>,
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FixtureSite {
    pub fn new(username: &str, secret: &str) -> Self {
        let site = FixtureSite::default();
        {
            let mut state = site.state.lock().unwrap();
            state.username = username.to_string();
            state.secret = secret.to_string();
        }
        site.add_page("/Kampus1", &authed_page("<p>campus</p>"));
        site
    }

    pub fn add_page(&self, path_or_url: &str, html: &str) {
        let url = absolute(path_or_url);
        self.state.lock().unwrap().pages.insert(url, html.to_string());
    }

    pub fn fail_navigation(&self, path_or_url: &str) {
        self.state.lock().unwrap().failing.insert(absolute(path_or_url));
    }

    /// Makes every `content()` call fail as a dead browser tab would.
    pub fn fail_snapshots(&self, fail: bool) {
        self.state.lock().unwrap().snapshots_fail = fail;
    }

    /// Invalidates the server-side session; every page then renders the login form.
    pub fn expire_session(&self) {
        self.state.lock().unwrap().token = None;
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    pub fn visits(&self) -> Vec<String> {
        self.state.lock().unwrap().visits.clone()
    }

    pub fn pages_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn browser(&self) -> Arc<FixtureBrowser> {
        Arc::new(FixtureBrowser { site: self.clone() })
    }
}

fn absolute(path_or_url: &str) -> String {
    if path_or_url.starts_with("http") {
        path_or_url.to_string()
    } else {
        format!("{BASE}{path_or_url}")
    }
}

pub struct FixtureBrowser {
    site: FixtureSite,
}

#[async_trait]
impl Browser for FixtureBrowser {
    async fn new_page(&self, _user_agent: &str) -> Result<Box<dyn BrowserPage>> {
        self.site.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixturePage {
            site: self.site.clone(),
            url: "about:blank".to_string(),
            cookie: None,
            closed: false,
        }))
    }

    async fn shutdown(&self) {}
}

pub struct FixturePage {
    site: FixtureSite,
    url: String,
    cookie: Option<String>,
    closed: bool,
}

impl FixturePage {
    fn authenticated(&self) -> bool {
        let state = self.site.state.lock().unwrap();
        state.token.is_some() && state.token == self.cookie
    }
}

#[async_trait]
impl BrowserPage for FixturePage {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.site.state.lock().unwrap();
        state.visits.push(url.to_string());
        if state.failing.contains(url) {
            return Err(PortalError::Navigation {
                url: url.to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.url = url.to_string();
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self.url.clone())
    }

    async fn content(&mut self) -> Result<String> {
        if self.site.state.lock().unwrap().snapshots_fail {
            return Err(PortalError::WebDriver("no such window".to_string()));
        }
        if !self.authenticated() {
            return Ok(login_form_html());
        }
        let state = self.site.state.lock().unwrap();
        Ok(state
            .pages
            .get(&self.url)
            .cloned()
            .unwrap_or_else(|| authed_page("")))
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>> {
        Ok(self
            .cookie
            .iter()
            .map(|token| Cookie::new(AUTH_COOKIE, token.clone()))
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<()> {
        if let Some(c) = cookies.iter().find(|c| c.name == AUTH_COOKIE) {
            self.cookie = Some(c.value.clone());
        }
        Ok(())
    }

    async fn submit_form(&mut self, fields: &[(&str, &str)], _timeout: Duration) -> Result<()> {
        let value_of = |name: &str| {
            fields
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.to_string())
                .unwrap_or_default()
        };
        let mut state = self.site.state.lock().unwrap();
        if value_of(USERNAME_FIELD) == state.username && value_of(PASSWORD_FIELD) == state.secret {
            state.logins += 1;
            let token = format!("token-{}", state.logins);
            state.token = Some(token.clone());
            self.cookie = Some(token);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.site.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
