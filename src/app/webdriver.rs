use std::fs::{self, File};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::browser::{Browser, BrowserPage, Cookie};
use super::config::WebDriverConfig;
use super::error::{PortalError, Result};
use super::types::BrowserArg;

const FILL_AND_SUBMIT_SCRIPT: &str = r#"
    const fields = arguments[0] || [];
    for (const pair of fields) {
        const input = document.querySelector('input[name="' + pair[0] + '"]');
        if (!input) { return false; }
        input.focus();
        input.value = pair[1];
        input.dispatchEvent(new Event('input', { bubbles: true }));
        input.dispatchEvent(new Event('change', { bubbles: true }));
    }
    const submit = document.querySelector('input[type="submit"], button[type="submit"]');
    if (!submit) { return false; }
    window.__beelocalMarker = true;
    setTimeout(() => submit.click(), 0);
    return true;
"#;

const DOCUMENT_STATE_SCRIPT: &str = r#"
    return {
        url: window.location.href || "",
        ready: document.readyState || "",
        fresh: window.__beelocalMarker !== true
    };
"#;

const SNAPSHOT_SCRIPT: &str = r#"
    return document.documentElement ? document.documentElement.outerHTML : "";
"#;

struct DriverState {
    endpoint: Option<String>,
    child: Option<Child>,
}

/// Browser backed by a W3C WebDriver server; one WebDriver session per page.
pub struct WebDriverBrowser {
    config: WebDriverConfig,
    client: reqwest::Client,
    state: Mutex<DriverState>,
}

impl WebDriverBrowser {
    pub fn new(config: WebDriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PortalError::WebDriver(format!("webdriver client build failed: {e}")))?;
        Ok(Self {
            config,
            client,
            state: Mutex::new(DriverState {
                endpoint: None,
                child: None,
            }),
        })
    }

    async fn ensure_endpoint(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(endpoint) = state.endpoint.clone() {
            return Ok(endpoint);
        }

        let requested = self.config.endpoint.trim_end_matches('/').to_string();
        if webdriver_reachable_off_thread(&requested).await {
            info!(endpoint = %requested, "webdriver endpoint reachable");
            state.endpoint = Some(requested.clone());
            return Ok(requested);
        }
        if !self.config.autostart {
            return Err(PortalError::BrowserLaunch(format!(
                "endpoint {requested} unreachable and autostart is disabled"
            )));
        }

        let port = find_free_local_port()?;
        let endpoint = format!("http://127.0.0.1:{port}");
        let child = start_webdriver(&self.config, &endpoint).await?;
        info!(endpoint = %endpoint, "webdriver autostarted");
        state.endpoint = Some(endpoint.clone());
        state.child = Some(child);
        Ok(endpoint)
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn new_page(&self, user_agent: &str) -> Result<Box<dyn BrowserPage>> {
        let endpoint = self.ensure_endpoint().await?;
        let caps = webdriver_capabilities(self.config.browser, self.config.headless, user_agent);
        let session_id = webdriver_create_session(&self.client, &endpoint, &caps).await?;
        debug!(session = %session_id, "webdriver session created");
        Ok(Box::new(WebDriverPage {
            client: self.client.clone(),
            endpoint,
            session_id,
            closed: false,
        }))
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        stop_webdriver(state.child.take());
        state.endpoint = None;
    }
}

impl Drop for WebDriverBrowser {
    fn drop(&mut self) {
        stop_webdriver(self.state.get_mut().child.take());
    }
}

pub struct WebDriverPage {
    client: reqwest::Client,
    endpoint: String,
    session_id: String,
    closed: bool,
}

impl WebDriverPage {
    fn session_url(&self, suffix: &str) -> String {
        format!(
            "{}/session/{}{}",
            self.endpoint.trim_end_matches('/'),
            self.session_id,
            suffix
        )
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value> {
        let body = json!({ "script": script, "args": args });
        webdriver_call(
            &self.client,
            reqwest::Method::POST,
            &self.session_url("/execute/sync"),
            Some(&body),
            "execute script",
        )
        .await
    }

    async fn wait_for_next_document(&self, previous_url: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::time::sleep(Duration::from_millis(150)).await;
            if let Ok(state) = self.execute(DOCUMENT_STATE_SCRIPT, json!([])).await {
                let url = state.pointer("/url").and_then(|v| v.as_str()).unwrap_or_default();
                let ready = state.pointer("/ready").and_then(|v| v.as_str()).unwrap_or_default();
                let fresh = state.pointer("/fresh").and_then(|v| v.as_bool()).unwrap_or(false);
                let loaded = ready == "complete" || ready == "interactive";
                if loaded && (fresh || url != previous_url) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PortalError::Navigation {
                    url: previous_url.to_string(),
                    message: format!("form submit did not navigate within {}s", timeout.as_secs()),
                });
            }
        }
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let body = json!({ "url": url });
        let nav_url = self.session_url("/url");
        let nav = webdriver_call(
            &self.client,
            reqwest::Method::POST,
            &nav_url,
            Some(&body),
            "navigate",
        );
        match tokio::time::timeout(timeout, nav).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(PortalError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(PortalError::Navigation {
                url: url.to_string(),
                message: format!("timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    async fn current_url(&mut self) -> Result<String> {
        let value = webdriver_call(
            &self.client,
            reqwest::Method::GET,
            &self.session_url("/url"),
            None,
            "current url",
        )
        .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn content(&mut self) -> Result<String> {
        let value = self.execute(SNAPSHOT_SCRIPT, json!([])).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>> {
        let value = webdriver_call(
            &self.client,
            reqwest::Method::GET,
            &self.session_url("/cookie"),
            None,
            "get cookies",
        )
        .await?;
        serde_json::from_value(value)
            .map_err(|e| PortalError::WebDriver(format!("cookie list parse failed: {e}")))
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<()> {
        let endpoint = self.session_url("/cookie");
        for cookie in cookies {
            let body = json!({ "cookie": cookie });
            webdriver_call(
                &self.client,
                reqwest::Method::POST,
                &endpoint,
                Some(&body),
                "add cookie",
            )
            .await?;
        }
        Ok(())
    }

    async fn submit_form(&mut self, fields: &[(&str, &str)], timeout: Duration) -> Result<()> {
        let previous_url = self.current_url().await.unwrap_or_default();
        let pairs = fields
            .iter()
            .map(|(name, value)| json!([name, value]))
            .collect::<Vec<_>>();
        let submitted = self.execute(FILL_AND_SUBMIT_SCRIPT, json!([pairs])).await?;
        if submitted.as_bool() != Some(true) {
            return Err(PortalError::WebDriver(
                "form inputs or submit button not found".to_string(),
            ));
        }
        self.wait_for_next_document(&previous_url, timeout).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = webdriver_delete_session(&self.client, &self.endpoint, &self.session_id).await {
            debug!(session = %self.session_id, "delete session failed: {err}");
        }
    }
}

async fn webdriver_call(
    client: &reqwest::Client,
    method: reqwest::Method,
    endpoint: &str,
    body: Option<&Value>,
    action: &str,
) -> Result<Value> {
    let mut request = client.request(method, endpoint);
    if let Some(body) = body {
        request = request.json(body);
    }
    let res = request
        .send()
        .await
        .map_err(|e| PortalError::WebDriver(format!("{action} request failed: {e}")))?;
    let status = res.status();
    let text = res
        .text()
        .await
        .map_err(|e| PortalError::WebDriver(format!("{action} response read failed: {e}")))?;
    let value: Value = serde_json::from_str(&text).unwrap_or_default();
    if let Some(message) = webdriver_error_message(&value) {
        return Err(PortalError::WebDriver(format!("{action}: {message}")));
    }
    if !status.is_success() {
        return Err(PortalError::WebDriver(format!(
            "{action} HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&text, 240)
        )));
    }
    Ok(value.get("value").cloned().unwrap_or(Value::Null))
}

fn webdriver_error_message(value: &Value) -> Option<String> {
    let err = value.pointer("/value/error").and_then(|v| v.as_str())?;
    let message = value
        .pointer("/value/message")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown webdriver error");
    Some(format!("{err}: {message}"))
}

async fn webdriver_create_session(
    client: &reqwest::Client,
    endpoint: &str,
    caps: &Value,
) -> Result<String> {
    let session_endpoint = format!("{}/session", endpoint.trim_end_matches('/'));
    let res = client
        .post(&session_endpoint)
        .json(caps)
        .send()
        .await
        .map_err(|e| PortalError::WebDriver(format!("session create request failed: {e}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| PortalError::WebDriver(format!("session create response read failed: {e}")))?;
    if !status.is_success() {
        return Err(PortalError::WebDriver(format!(
            "session create HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 260)
        )));
    }

    let value: Value = serde_json::from_str(&body)
        .map_err(|e| PortalError::WebDriver(format!("session create parse failed: {e}")))?;
    if let Some(message) = webdriver_error_message(&value) {
        return Err(PortalError::WebDriver(format!("session create: {message}")));
    }
    session_id_from_response(&value).ok_or_else(|| {
        PortalError::WebDriver(format!(
            "session id missing in response: {}",
            truncate_for_log(&body, 220)
        ))
    })
}

fn session_id_from_response(value: &Value) -> Option<String> {
    value
        .pointer("/value/sessionId")
        .and_then(|v| v.as_str())
        .or_else(|| value.pointer("/sessionId").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

async fn webdriver_delete_session(
    client: &reqwest::Client,
    endpoint: &str,
    session_id: &str,
) -> Result<()> {
    let delete_endpoint = format!("{}/session/{}", endpoint.trim_end_matches('/'), session_id);
    client
        .delete(delete_endpoint)
        .send()
        .await
        .map_err(|e| PortalError::WebDriver(format!("delete session failed: {e}")))?;
    Ok(())
}

fn webdriver_capabilities(browser: BrowserArg, headless: bool, user_agent: &str) -> Value {
    let timeouts = json!({ "pageLoad": 45_000, "script": 30_000 });
    match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            let mut firefox_options = json!({
                "args": args,
                "prefs": {
                    "general.useragent.override": user_agent,
                    "browser.cache.disk.enable": false,
                    "browser.cache.memory.enable": false,
                    "network.http.use-cache": false
                }
            });
            if let Some(binary) = detect_browser_binary(BrowserArg::Firefox) {
                firefox_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "eager",
                        "timeouts": timeouts,
                        "moz:firefoxOptions": firefox_options
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            let profile_dir = std::env::temp_dir().join(format!(
                "beelocal-chrome-profile-{}-{}",
                std::process::id(),
                Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ));
            let _ = fs::create_dir_all(&profile_dir);
            args.push(format!("--user-data-dir={}", profile_dir.display()));
            if headless {
                args.push("--headless=new".to_string());
            }
            args.push(format!("--user-agent={user_agent}"));
            args.push("--window-size=1920,1080".to_string());
            args.push("--disable-gpu".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push("--disable-blink-features=AutomationControlled".to_string());
            args.push("--no-first-run".to_string());
            args.push("--no-default-browser-check".to_string());
            args.push("--disk-cache-size=0".to_string());
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            let mut chrome_options = json!({ "args": args });
            if let Some(binary) = detect_browser_binary(BrowserArg::Chrome) {
                chrome_options["binary"] = json!(binary.to_string_lossy().to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "eager",
                        "timeouts": timeouts,
                        "goog:chromeOptions": chrome_options
                    }
                }
            })
        }
    }
}

fn detect_browser_binary(browser: BrowserArg) -> Option<PathBuf> {
    let (env_var, names): (&str, &[&str]) = match browser {
        BrowserArg::Firefox => ("FIREFOX_BIN", &["firefox"]),
        BrowserArg::Chrome => ("CHROME_BIN", &["google-chrome", "chromium", "chrome"]),
    };
    if let Ok(v) = std::env::var(env_var) {
        let p = PathBuf::from(v);
        if p.exists() {
            return Some(p);
        }
    }
    #[cfg(target_os = "macos")]
    {
        let p = match browser {
            BrowserArg::Firefox => PathBuf::from("/Applications/Firefox.app/Contents/MacOS/firefox"),
            BrowserArg::Chrome => {
                PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
            }
        };
        if p.exists() {
            return Some(p);
        }
    }
    names.iter().find_map(|name| which_binary_path(name))
}

fn which_binary_path(name: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let p = PathBuf::from(path.trim());
    if p.exists() { Some(p) } else { None }
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

/// Runs the blocking connect on the blocking pool.
async fn webdriver_reachable_off_thread(endpoint: &str) -> bool {
    let endpoint = endpoint.to_string();
    tokio::task::spawn_blocking(move || webdriver_reachable(&endpoint))
        .await
        .unwrap_or(false)
}

fn driver_candidates(config: &WebDriverConfig) -> Vec<String> {
    if let Some(bin) = &config.driver_binary {
        return vec![bin.clone()];
    }
    match config.browser {
        BrowserArg::Chrome => vec!["chromedriver".to_string()],
        BrowserArg::Firefox => vec!["geckodriver".to_string()],
    }
}

async fn start_webdriver(config: &WebDriverConfig, endpoint: &str) -> Result<Child> {
    let parsed = Url::parse(endpoint)
        .map_err(|e| PortalError::BrowserLaunch(format!("invalid webdriver url: {e}")))?;
    let port = parsed.port_or_known_default().unwrap_or(4444);

    let mut candidates = driver_candidates(config);
    candidates.retain(|bin| webdriver_binary_available(bin));

    let log_path = webdriver_log_path(port)?;
    let mut last_err = String::new();
    for bin in candidates {
        let mut cmd = Command::new(&bin);
        configure_webdriver_command(&mut cmd, &bin, port);
        let log_file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        let log_file_err = log_file.try_clone()?;
        cmd.stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .stdin(Stdio::null());

        match cmd.spawn() {
            Ok(mut child) => {
                let steps = (config.start_timeout.as_millis() / 200).max(1);
                for _ in 0..steps {
                    if webdriver_reachable_off_thread(endpoint).await {
                        return Ok(child);
                    }
                    if let Ok(Some(status)) = child.try_wait() {
                        last_err = format!(
                            "{bin} exited early with status {status} (log: {})",
                            log_path.display()
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                let _ = child.kill();
                let _ = child.wait();
                if last_err.is_empty() {
                    last_err = format!(
                        "{bin} did not become ready in time (log: {})",
                        log_path.display()
                    );
                }
                if let Some(tail) = read_log_tail(&log_path, 30) {
                    last_err = format!("{last_err}; tail: {tail}");
                }
                warn!("{last_err}");
            }
            Err(err) => {
                last_err = format!("failed to spawn {bin}: {err}");
                warn!("{last_err}");
            }
        }
    }

    Err(PortalError::BrowserLaunch(if last_err.is_empty() {
        "no suitable webdriver binary found".to_string()
    } else {
        last_err
    }))
}

fn configure_webdriver_command(cmd: &mut Command, bin: &str, port: u16) {
    let lower = bin.to_ascii_lowercase();
    if lower.contains("geckodriver") {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn webdriver_binary_available(bin: &str) -> bool {
    let p = Path::new(bin);
    if p.components().count() > 1 || p.is_absolute() {
        return p.exists();
    }
    Command::new(bin)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn stop_webdriver(child: Option<Child>) {
    if let Some(mut c) = child {
        let _ = c.kill();
        let _ = c.wait();
    }
}

fn webdriver_cache_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        return Ok(Path::new(&home).join(".cache/beelocal/webdriver"));
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        return Ok(Path::new(&profile).join(".cache/beelocal/webdriver"));
    }
    Err(PortalError::Config(
        "cannot determine home directory for webdriver cache".to_string(),
    ))
}

fn webdriver_log_path(port: u16) -> Result<PathBuf> {
    let cache_dir = webdriver_cache_dir()?;
    fs::create_dir_all(&cache_dir)?;
    Ok(cache_dir.join(format!("webdriver-{port}.log")))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let tail = text
        .lines()
        .rev()
        .take(lines.max(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    if tail.is_empty() { None } else { Some(tail) }
}

fn find_free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}
