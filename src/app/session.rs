use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::browser::{Browser, BrowserPage, Cookie};
use super::config::PortalConfig;
use super::error::{PortalError, Result};
use super::parser::{self, PASSWORD_FIELD, USERNAME_FIELD};
use super::pool::{PagePool, PooledPage};
use super::types::Credentials;

/// Owns the one authenticated portal session: the primary page, the page pool
/// and the credentials needed to log in again after expiry.
pub struct SessionManager {
    browser: Arc<dyn Browser>,
    config: PortalConfig,
    primary: Mutex<Option<Box<dyn BrowserPage>>>,
    pool: PagePool,
    credentials: Mutex<Option<Credentials>>,
    authenticated: AtomicBool,
    session_check_enabled: AtomicBool,
    relogin_lock: Mutex<()>,
    generation: AtomicU64,
    /// Primary-page cookies captured at login, tagged with that login's generation.
    session_cookies: Mutex<Option<(u64, Vec<Cookie>)>>,
}

impl SessionManager {
    pub fn new(browser: Arc<dyn Browser>, config: PortalConfig) -> Self {
        let pool = PagePool::new(config.max_pages);
        Self {
            browser,
            config,
            primary: Mutex::new(None),
            pool,
            credentials: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            session_check_enabled: AtomicBool::new(true),
            relogin_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            session_cookies: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Incremented on every successful login.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn has_credentials(&self) -> bool {
        self.credentials.lock().await.is_some()
    }

    /// Logs in on a fresh primary page. Failures are reported as `false`.
    pub async fn login(&self, username: &str, secret: &str) -> bool {
        *self.credentials.lock().await = Some(Credentials {
            username: username.to_string(),
            secret: secret.to_string(),
        });

        let mut primary = self.primary.lock().await;
        if let Some(mut old) = primary.take() {
            old.close().await;
        }
        self.authenticated.store(false, Ordering::SeqCst);
        *self.session_cookies.lock().await = None;

        let mut page = match self.browser.new_page(&self.config.user_agent).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "login failed: no browser page");
                return false;
            }
        };

        match self.submit_login(page.as_mut(), username, secret).await {
            Ok(true) => {
                let captured = match page.cookies().await {
                    Ok(cookies) => Some(cookies),
                    Err(err) => {
                        debug!(error = %err, "cookies not captured at login");
                        None
                    }
                };
                *primary = Some(page);
                drop(primary);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.session_cookies.lock().await = captured.map(|c| (generation, c));
                self.pool.close_all().await;
                self.authenticated.store(true, Ordering::SeqCst);
                info!(generation, "logged in");
                true
            }
            Ok(false) => {
                page.close().await;
                warn!("login rejected: no logout control after submit");
                false
            }
            Err(err) => {
                page.close().await;
                warn!(error = %err, "login failed");
                false
            }
        }
    }

    async fn submit_login(
        &self,
        page: &mut dyn BrowserPage,
        username: &str,
        secret: &str,
    ) -> Result<bool> {
        let entry = self.config.entry_url();
        page.goto(&entry, self.config.login_timeout).await?;
        let html = page.content().await?;
        if !parser::is_login_page(&html) {
            return Err(PortalError::Navigation {
                url: entry,
                message: "login form not found".to_string(),
            });
        }
        page.submit_form(
            &[(USERNAME_FIELD, username), (PASSWORD_FIELD, secret)],
            self.config.login_timeout,
        )
        .await?;
        tokio::time::sleep(self.config.settle_delay).await;
        let html = page.content().await?;
        Ok(parser::has_logout_affordance(&html))
    }

    /// Checks the primary page for the logout control. A failed check keeps the
    /// previous state, and so does a primary page busy with queued work.
    pub async fn check_session_live(&self) -> bool {
        let was_authenticated = self.is_authenticated();
        if !self.session_check_enabled.load(Ordering::SeqCst) {
            return was_authenticated;
        }
        let Ok(mut primary) = self.primary.try_lock() else {
            debug!("primary page busy, keeping session state");
            return was_authenticated;
        };
        let Some(page) = primary.as_mut() else {
            self.authenticated.store(false, Ordering::SeqCst);
            return false;
        };
        match page.content().await {
            Ok(html) if parser::has_logout_affordance(&html) => true,
            Ok(_) => {
                if was_authenticated {
                    warn!("session no longer live");
                    self.authenticated.store(false, Ordering::SeqCst);
                }
                false
            }
            Err(err) => {
                debug!(error = %err, "session liveness check failed");
                was_authenticated
            }
        }
    }

    /// Logs in again with the stored credentials unless another task already
    /// did so after `seen_generation`.
    pub async fn relogin_after(&self, seen_generation: u64) -> bool {
        let _turn = self.relogin_lock.lock().await;
        if self.generation() != seen_generation && self.is_authenticated() {
            debug!("session already renewed by another operation");
            return true;
        }
        let Some(creds) = self.credentials.lock().await.clone() else {
            warn!("cannot log in again: no stored credentials");
            return false;
        };

        self.session_check_enabled.store(false, Ordering::SeqCst);
        info!("logging in again");
        self.pool.close_all().await;
        let ok = self.login(&creds.username, &creds.secret).await;
        self.session_check_enabled.store(true, Ordering::SeqCst);
        ok
    }

    /// Exclusive access to the primary page.
    pub async fn primary_page(&self) -> Result<MappedMutexGuard<'_, Box<dyn BrowserPage>>> {
        MutexGuard::try_map(self.primary.lock().await, |page| page.as_mut())
            .map_err(|_| PortalError::NotAuthenticated)
    }

    /// Cookies of the current login. Read from the capture taken at login when
    /// it belongs to the current generation, so callers never wait on the
    /// primary page.
    pub async fn primary_cookies(&self) -> Result<Vec<Cookie>> {
        let generation = self.generation();
        if let Some((captured_at, cookies)) = self.session_cookies.lock().await.as_ref() {
            if *captured_at == generation {
                return Ok(cookies.clone());
            }
        }
        let cookies = {
            let mut page = self.primary_page().await?;
            page.cookies().await?
        };
        *self.session_cookies.lock().await = Some((generation, cookies.clone()));
        Ok(cookies)
    }

    /// A pooled page carrying the primary page's cookies.
    pub async fn acquire_page(&self) -> Result<PooledPage> {
        let permit = self.pool.permit().await;
        let generation = self.generation();
        let permit = match self.pool.take(generation, permit).await {
            Ok(pooled) => return Ok(pooled),
            Err(permit) => permit,
        };

        let cookies = self.primary_cookies().await?;
        let mut page = self.browser.new_page(&self.config.user_agent).await?;
        if let Err(err) = seed_cookies(
            page.as_mut(),
            &self.config.base_url,
            &cookies,
            self.config.nav_timeout,
        )
        .await
        {
            page.close().await;
            return Err(err);
        }
        debug!(generation, cookies = cookies.len(), "new pooled page");
        Ok(self.pool.wrap(page, generation, permit))
    }

    pub async fn release_page(&self, page: PooledPage) {
        self.pool.release(page, self.generation()).await;
    }

    /// Forgets credentials and tears down every page and the browser.
    pub async fn logout(&self) {
        *self.credentials.lock().await = None;
        self.shutdown().await;
        info!("logged out");
    }

    /// Closes every page and the browser but keeps credentials.
    pub async fn shutdown(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.session_cookies.lock().await = None;
        self.pool.close_all().await;
        if let Some(mut page) = self.primary.lock().await.take() {
            page.close().await;
        }
        self.browser.shutdown().await;
    }
}

/// Cookies can only be set for the document's origin, so land on it first.
async fn seed_cookies(
    page: &mut dyn BrowserPage,
    base_url: &str,
    cookies: &[Cookie],
    timeout: Duration,
) -> Result<()> {
    page.goto(base_url, timeout).await?;
    page.set_cookies(cookies).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{BASE, FixtureSite, listing};

    fn manager(site: &FixtureSite) -> SessionManager {
        let config = PortalConfig {
            base_url: BASE.to_string(),
            settle_delay: Duration::from_millis(1),
            max_pages: 2,
            ..PortalConfig::default()
        };
        SessionManager::new(site.browser(), config)
    }

    #[tokio::test]
    async fn login_with_valid_credentials_succeeds() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);
        assert!(session.is_authenticated());
        assert!(session.check_session_live().await);
        assert_eq!(site.logins(), 1);
        assert_eq!(session.generation(), 1);
    }

    #[tokio::test]
    async fn rejected_login_returns_false_and_keeps_credentials() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(!session.login("student", "wrong").await);
        assert!(!session.is_authenticated());
        assert!(session.has_credentials().await);
        assert!(session.primary_page().await.is_err());
        assert_eq!(site.pages_closed(), 1);
    }

    #[tokio::test]
    async fn login_navigation_failure_is_not_an_error() {
        let site = FixtureSite::new("student", "pw");
        site.fail_navigation("/Kampus1");
        let session = manager(&site);
        assert!(!session.login("student", "pw").await);
        assert_eq!(site.pages_created(), site.pages_closed());
    }

    #[tokio::test]
    async fn expiry_is_detected_by_missing_logout_control() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);
        site.expire_session();
        assert!(!session.check_session_live().await);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn failed_liveness_check_keeps_the_session() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);
        site.fail_snapshots(true);
        assert!(session.check_session_live().await);
        assert!(session.is_authenticated());

        site.fail_snapshots(false);
        site.expire_session();
        assert!(!session.check_session_live().await);
        site.fail_snapshots(true);
        assert!(!session.check_session_live().await);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn busy_primary_page_does_not_block_liveness_or_pool() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);

        let held = session.primary_page().await.unwrap();
        let checked = tokio::time::timeout(Duration::from_millis(200), session.check_session_live()).await;
        assert_eq!(checked.ok(), Some(true));
        let pooled = tokio::time::timeout(Duration::from_millis(200), session.acquire_page()).await;
        let pooled = pooled.expect("pooled page waited on the primary page").unwrap();
        drop(held);
        session.release_page(pooled).await;
    }

    #[tokio::test]
    async fn relogin_needs_stored_credentials() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(!session.relogin_after(session.generation()).await);
        assert_eq!(site.logins(), 0);
    }

    #[tokio::test]
    async fn relogin_recovers_and_drops_stale_pool_pages() {
        let site = FixtureSite::new("student", "pw");
        site.add_page("/Sinif/1.2/SinifDosyalari", &listing(&[("a.pdf", "/f?1", "1 KB")]));
        let session = manager(&site);
        assert!(session.login("student", "pw").await);

        let pooled = session.acquire_page().await.unwrap();
        session.release_page(pooled).await;
        site.expire_session();
        assert!(!session.check_session_live().await);

        assert!(session.relogin_after(session.generation()).await);
        assert!(session.check_session_live().await);
        assert_eq!(site.logins(), 2);
        // old primary page and the idle pooled page
        assert!(site.pages_closed() >= 2);
    }

    #[tokio::test]
    async fn concurrent_relogins_collapse_into_one() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);
        site.expire_session();

        let seen = session.generation();
        let (a, b) = tokio::join!(session.relogin_after(seen), session.relogin_after(seen));
        assert!(a && b);
        assert_eq!(site.logins(), 2);
    }

    #[tokio::test]
    async fn pooled_pages_carry_the_session_cookies() {
        let site = FixtureSite::new("student", "pw");
        site.add_page("/Sinif/1.2/SinifDosyalari", &listing(&[("a.pdf", "/f?1", "1 KB")]));
        let session = manager(&site);
        assert!(session.login("student", "pw").await);

        let mut pooled = session.acquire_page().await.unwrap();
        pooled
            .page()
            .goto(&format!("{BASE}/Sinif/1.2/SinifDosyalari"), Duration::from_secs(1))
            .await
            .unwrap();
        let html = pooled.page().content().await.unwrap();
        assert!(html.contains("a.pdf"));
        session.release_page(pooled).await;

        let again = session.acquire_page().await.unwrap();
        session.release_page(again).await;
        // primary plus one pooled page, reused the second time
        assert_eq!(site.pages_created(), 2);
    }

    #[tokio::test]
    async fn acquire_without_login_fails() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(matches!(
            session.acquire_page().await,
            Err(PortalError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn logout_clears_everything() {
        let site = FixtureSite::new("student", "pw");
        let session = manager(&site);
        assert!(session.login("student", "pw").await);
        session.logout().await;
        assert!(!session.is_authenticated());
        assert!(!session.has_credentials().await);
        assert_eq!(site.pages_created(), site.pages_closed());
    }
}
