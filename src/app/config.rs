use std::time::Duration;

use super::types::{BrowserArg, Cli};

pub const DEFAULT_BASE_URL: &str = "https://ninova.itu.edu.tr";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:104.0) Gecko/20100101 Firefox/104.0";

/// Portal paths, relative to `base_url`.
pub const ENTRY_PATH: &str = "/Kampus1";
pub const CAMPUS_ANNOUNCEMENTS_PATH: &str = "/Kampus?1/Duyurular";

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub user_agent: String,
    pub max_pages: usize,
    pub max_depth: usize,
    pub max_folders: usize,
    pub retry_attempts: usize,
    pub retry_backoff: Duration,
    pub settle_delay: Duration,
    pub nav_timeout: Duration,
    pub login_timeout: Duration,
    pub download_timeout: Duration,
    pub max_redirect_hops: usize,
    pub announcement_batch: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_pages: 20,
            max_depth: 10,
            max_folders: 2000,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(300),
            settle_delay: Duration::from_millis(150),
            nav_timeout: Duration::from_secs(15),
            login_timeout: Duration::from_secs(45),
            download_timeout: Duration::from_secs(120),
            max_redirect_hops: 10,
            announcement_batch: 3,
        }
    }
}

impl PortalConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let mut config = PortalConfig {
            base_url: cli.base_url.trim_end_matches('/').to_string(),
            max_pages: cli.max_pages.max(1),
            max_depth: cli.max_depth.max(1),
            retry_attempts: cli.retries.max(1),
            nav_timeout: Duration::from_millis(cli.nav_timeout_ms.max(1000)),
            download_timeout: Duration::from_secs(cli.download_timeout_secs.max(1)),
            ..PortalConfig::default()
        };
        if let Some(ref ua) = cli.user_agent {
            config.user_agent = ua.clone();
        }
        config
    }

    /// Resolve a portal-relative path (`/Sinif/...`) or pass an absolute URL through.
    pub fn absolute(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            return path_or_url.to_string();
        }
        if path_or_url.starts_with('/') {
            format!("{}{}", self.base_url, path_or_url)
        } else {
            format!("{}/{}", self.base_url, path_or_url)
        }
    }

    pub fn entry_url(&self) -> String {
        self.absolute(ENTRY_PATH)
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub browser: BrowserArg,
    pub driver_binary: Option<String>,
    pub autostart: bool,
    pub headless: bool,
    pub start_timeout: Duration,
}

impl WebDriverConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            endpoint: cli.webdriver_url.clone(),
            browser: cli.webdriver_browser,
            driver_binary: cli.webdriver_binary.clone(),
            autostart: !cli.no_webdriver_autostart,
            headless: cli.webdriver_headless,
            start_timeout: Duration::from_millis(cli.webdriver_start_timeout_ms.max(200)),
        }
    }
}
