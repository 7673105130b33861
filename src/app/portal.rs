use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::announcements::AnnouncementFetcher;
use super::browser::{Browser, cookie_header};
use super::cache::CrawlCache;
use super::config::PortalConfig;
use super::crawler::{self, TreeCrawler, load_page};
use super::download::Downloader;
use super::error::{PortalError, Result};
use super::parser;
use super::serializer::NavigationQueue;
use super::session::SessionManager;
use super::types::{
    Announcement, AnnouncementSource, Category, Course, Item, ProgressTx, RecursiveStats,
};

/// The operations the command layer calls. Every remote operation checks the
/// session first and logs in again at most once when it has expired.
pub struct Portal {
    session: SessionManager,
    queue: NavigationQueue,
    cache: Arc<CrawlCache>,
    downloader: Downloader,
}

impl Portal {
    pub fn new(
        browser: Arc<dyn Browser>,
        config: PortalConfig,
        cache: Arc<CrawlCache>,
    ) -> Result<Self> {
        let downloader = Downloader::new(config.clone())?;
        Ok(Self {
            session: SessionManager::new(browser, config),
            queue: NavigationQueue::new(),
            cache,
            downloader,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn cache(&self) -> &CrawlCache {
        &self.cache
    }

    pub async fn login(&self, username: &str, secret: &str) -> bool {
        self.session.login(username, secret).await
    }

    pub async fn logout(&self) {
        self.session.logout().await;
        self.cache.clear().await;
    }

    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.session.generation() == 0 || !self.session.has_credentials().await {
            return Err(PortalError::NotAuthenticated);
        }

        let seen = self.session.generation();
        if !self.session.check_session_live().await && !self.session.relogin_after(seen).await {
            return Err(PortalError::SessionExpired);
        }

        let seen = self.session.generation();
        match op().await {
            Err(PortalError::SessionExpired) => {
                warn!("session expired during operation, logging in again");
                if !self.session.relogin_after(seen).await {
                    return Err(PortalError::SessionExpired);
                }
                op().await
            }
            other => other,
        }
    }

    async fn fetch_courses(&self) -> Result<Vec<Course>> {
        let mut pooled = self.session.acquire_page().await?;
        let entry = self.session.config().entry_url();
        let loaded = load_page(pooled.page(), &entry, self.session.config()).await;
        self.session.release_page(pooled).await;
        let (_, html) = loaded?;
        Ok(parser::parse_courses(&html))
    }

    pub async fn list_courses(&self) -> Result<Vec<Course>> {
        let courses = self.guarded(|| self.fetch_courses()).await;
        match courses {
            Ok(courses) => {
                info!(courses = courses.len(), "courses listed");
                Ok(courses)
            }
            Err(err @ (PortalError::NotAuthenticated | PortalError::SessionExpired)) => Err(err),
            Err(err) => {
                warn!(error = %err, "course list unavailable");
                Ok(Vec::new())
            }
        }
    }

    /// Full tree of a course. Served from the cache unless `refresh` is set.
    pub async fn list_files(
        &self,
        course_id: &str,
        refresh: bool,
        progress: Option<&ProgressTx>,
    ) -> Result<Vec<Item>> {
        if refresh {
            self.cache.invalidate_course(course_id).await;
        } else if let Some(items) = self.cache.files(course_id).await {
            return Ok(items);
        }
        let items = self
            .guarded(move || async move {
                TreeCrawler::new(&self.session, progress)
                    .list_files(course_id)
                    .await
            })
            .await?;
        self.cache.store_files(course_id, items.clone()).await;
        Ok(items)
    }

    pub async fn list_folder_contents(
        &self,
        folder_url: &str,
        course_id: &str,
        category: Category,
        parent_path: &str,
    ) -> Result<Vec<Item>> {
        let listed = self
            .guarded(move || async move {
                TreeCrawler::new(&self.session, None)
                    .list_folder(folder_url, course_id, category, parent_path)
                    .await
            })
            .await;
        match listed {
            Ok(items) => Ok(items),
            Err(err @ (PortalError::NotAuthenticated | PortalError::SessionExpired)) => Err(err),
            Err(err) => {
                warn!(%folder_url, error = %err, "folder listing failed");
                Ok(Vec::new())
            }
        }
    }

    /// Folder and file counts below a category root, on the primary page and
    /// in queue order. Any failure yields zero counts.
    pub async fn recursive_stats(&self, course_id: &str, category: Category) -> RecursiveStats {
        if let Some(stats) = self.cache.stats(course_id, category).await {
            return stats;
        }
        let computed = self
            .guarded(move || async move {
                self.queue
                    .enqueue(async {
                        let mut page = self.session.primary_page().await?;
                        crawler::recursive_stats(
                            &mut **page,
                            self.session.config(),
                            course_id,
                            category,
                        )
                        .await
                    })
                    .await
            })
            .await;
        match computed {
            Ok(stats) => {
                self.cache.store_stats(course_id, category, stats).await;
                stats
            }
            Err(err) => {
                warn!(%course_id, %category, error = %err, "stats unavailable");
                RecursiveStats::default()
            }
        }
    }

    /// Streams one file with the primary page's cookies.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressTx>,
    ) -> Result<u64> {
        let url = self.session.config().absolute(url);
        let url = url.as_str();
        self.guarded(move || async move {
            let cookies = self.session.primary_cookies().await?;
            self.downloader
                .download(url, dest, &cookie_header(&cookies), progress)
                .await
        })
        .await
    }

    /// Announcements from one source. Failures yield an empty list.
    pub async fn list_announcements(&self, source: &AnnouncementSource) -> Vec<Announcement> {
        let fetched = self
            .guarded(move || async move {
                let fetcher = AnnouncementFetcher::new(&self.session);
                match source {
                    AnnouncementSource::Course(course_id) => fetcher.for_course(course_id).await,
                    AnnouncementSource::Campus => fetcher.campus().await,
                    AnnouncementSource::AllCourses => {
                        let courses = self.fetch_courses().await?;
                        fetcher.all_courses(&courses).await
                    }
                }
            })
            .await;
        match fetched {
            Ok(list) => list,
            Err(err) => {
                warn!(?source, error = %err, "announcements unavailable");
                Vec::new()
            }
        }
    }
}
