use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// A browser cookie in WebDriver wire shape.
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
}

#[cfg(test)]
impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            secure: None,
            http_only: None,
            expiry: None,
        }
    }
}

/// `name=value; name=value` for a plain HTTP `Cookie` header.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One browser tab. Owned by exactly one operation at a time.
#[async_trait]
pub trait BrowserPage: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;
    async fn current_url(&mut self) -> Result<String>;
    async fn content(&mut self) -> Result<String>;
    async fn cookies(&mut self) -> Result<Vec<Cookie>>;
    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<()>;
    /// Fill inputs by `name`, click the form's submit button and wait for the next document.
    async fn submit_form(&mut self, fields: &[(&str, &str)], timeout: Duration) -> Result<()>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Launches the browser process on first use.
    async fn new_page(&self, user_agent: &str) -> Result<Box<dyn BrowserPage>>;
    async fn shutdown(&self);
}
