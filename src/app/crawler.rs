use std::collections::HashSet;

use futures::future::LocalBoxFuture;
use tracing::{debug, info, warn};

use super::browser::BrowserPage;
use super::config::PortalConfig;
use super::error::{PortalError, Result};
use super::parser::{self, ListingContext};
use super::session::SessionManager;
use super::types::{Category, Item, ProgressEvent, ProgressTx, RecursiveStats, emit};

/// Navigates with bounded retries and returns `(final_url, html)`.
///
/// Landing on the login form is reported as `SessionExpired` and not retried.
pub async fn load_page(
    page: &mut dyn BrowserPage,
    url: &str,
    config: &PortalConfig,
) -> Result<(String, String)> {
    let attempts = config.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = async {
            page.goto(url, config.nav_timeout).await?;
            tokio::time::sleep(config.settle_delay).await;
            let html = page.content().await?;
            let final_url = page.current_url().await.unwrap_or_else(|_| url.to_string());
            Ok::<_, PortalError>((final_url, html))
        }
        .await;

        match outcome {
            Ok((_, ref html)) if parser::is_login_page(html) => {
                return Err(PortalError::SessionExpired);
            }
            Ok(loaded) => return Ok(loaded),
            Err(err) if err.is_retriable() && attempt < attempts => {
                let backoff = config.retry_backoff * attempt as u32;
                warn!(%url, attempt, attempts, error = %err, "page load failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// One level of a listing page. The course id is re-read from the final URL.
pub async fn fetch_listing(
    page: &mut dyn BrowserPage,
    url: &str,
    course_id: &str,
    category: Category,
    parent_path: &str,
    config: &PortalConfig,
) -> Result<Vec<Item>> {
    let (final_url, html) = load_page(page, url, config).await?;
    let course_id = parser::derive_course_id(&final_url, course_id);
    let ctx = ListingContext {
        page_url: &final_url,
        course_id: &course_id,
        category,
        parent_path,
    };
    let items = parser::parse_items(&html, &ctx);
    debug!(%url, items = items.len(), %course_id, "listing parsed");
    Ok(items)
}

/// `{course}/SinifDosyalari` style URL; an id already carrying a category
/// suffix is used as is.
pub fn category_url(config: &PortalConfig, course_id: &str, category: Category) -> String {
    if course_id.contains("/SinifDosyalari") || course_id.contains("/DersDosyalari") {
        return config.absolute(course_id);
    }
    config.absolute(&format!("{}{}", course_id.trim_end_matches('/'), category.url_suffix()))
}

struct CrawlState {
    visited: HashSet<String>,
    folder_cap_logged: bool,
}

impl CrawlState {
    fn new(root_url: &str) -> Self {
        let mut visited = HashSet::new();
        visited.insert(root_url.to_string());
        Self {
            visited,
            folder_cap_logged: false,
        }
    }
}

/// Full-tree crawl over pooled pages.
pub struct TreeCrawler<'a> {
    session: &'a SessionManager,
    progress: Option<&'a ProgressTx>,
}

impl<'a> TreeCrawler<'a> {
    pub fn new(session: &'a SessionManager, progress: Option<&'a ProgressTx>) -> Self {
        Self { session, progress }
    }

    fn config(&self) -> &PortalConfig {
        self.session.config()
    }

    async fn listing_on_pooled_page(
        &self,
        url: &str,
        course_id: &str,
        category: Category,
        parent_path: &str,
    ) -> Result<Vec<Item>> {
        let mut pooled = self.session.acquire_page().await?;
        let result = fetch_listing(
            pooled.page(),
            url,
            course_id,
            category,
            parent_path,
            self.config(),
        )
        .await;
        self.session.release_page(pooled).await;
        result
    }

    /// One level below `folder_url`.
    pub async fn list_folder(
        &self,
        folder_url: &str,
        course_id: &str,
        category: Category,
        parent_path: &str,
    ) -> Result<Vec<Item>> {
        let url = self.config().absolute(folder_url);
        self.listing_on_pooled_page(&url, course_id, category, parent_path)
            .await
    }

    /// Every item of a category, flattened in pre-order. Errors below the root
    /// are absorbed per folder; session expiry is not.
    pub async fn crawl_category(&self, course_id: &str, category: Category) -> Result<Vec<Item>> {
        let root_url = category_url(self.config(), course_id, category);
        let roots = self
            .listing_on_pooled_page(&root_url, course_id, category, "")
            .await?;
        if !category.has_tree() {
            return Ok(roots);
        }
        let mut state = CrawlState::new(&root_url);
        let items = self.descend(roots, category, 0, &mut state).await?;
        info!(%course_id, %category, items = items.len(), "category crawled");
        Ok(items)
    }

    fn descend<'s>(
        &'s self,
        items: Vec<Item>,
        category: Category,
        depth: usize,
        state: &'s mut CrawlState,
    ) -> LocalBoxFuture<'s, Result<Vec<Item>>> {
        Box::pin(async move {
            let max_depth = self.config().max_depth;
            if depth >= max_depth {
                warn!(depth, max_depth, "maximum folder depth reached, branch skipped");
                return Ok(Vec::new());
            }

            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let descend_into = item.is_folder.then(|| item.clone());
                out.push(item);
                let Some(folder) = descend_into else {
                    continue;
                };
                if state.visited.len() > self.config().max_folders {
                    if !state.folder_cap_logged {
                        warn!(max = self.config().max_folders, "visited-folder cap reached");
                        state.folder_cap_logged = true;
                    }
                    continue;
                }
                if !state.visited.insert(folder.url.clone()) {
                    debug!(url = %folder.url, "folder already visited");
                    continue;
                }

                emit(
                    self.progress,
                    ProgressEvent::FolderEntered {
                        path: folder.path.clone(),
                        depth,
                    },
                );
                let children = match self
                    .listing_on_pooled_page(&folder.url, &folder.course_id, category, &folder.path)
                    .await
                {
                    Ok(children) => children,
                    Err(PortalError::SessionExpired) => return Err(PortalError::SessionExpired),
                    Err(err) => {
                        warn!(path = %folder.path, error = %err, "folder skipped");
                        continue;
                    }
                };
                let nested = self.descend(children, category, depth + 1, state).await?;
                out.extend(nested);
            }
            Ok(out)
        })
    }

    /// Home (root only) and both file trees, crawled concurrently. A failing
    /// category contributes nothing unless the session itself expired.
    pub async fn list_files(&self, course_id: &str) -> Result<Vec<Item>> {
        let (home, class_files, course_files) = tokio::join!(
            self.crawl_category(course_id, Category::Home),
            self.crawl_category(course_id, Category::ClassFiles),
            self.crawl_category(course_id, Category::CourseFiles),
        );

        let mut all = Vec::new();
        for (category, result) in [
            (Category::Home, home),
            (Category::ClassFiles, class_files),
            (Category::CourseFiles, course_files),
        ] {
            match result {
                Ok(items) => {
                    emit(
                        self.progress,
                        ProgressEvent::CategoryDone {
                            category,
                            items: items.len(),
                        },
                    );
                    all.extend(items);
                }
                Err(PortalError::SessionExpired) => return Err(PortalError::SessionExpired),
                Err(err) => warn!(%category, error = %err, "category crawl failed"),
            }
        }
        Ok(all)
    }
}

/// Counts folders and files below a category root on one page, deduplicating
/// folders by URL.
pub async fn recursive_stats(
    page: &mut dyn BrowserPage,
    config: &PortalConfig,
    course_id: &str,
    category: Category,
) -> Result<RecursiveStats> {
    let root_url = category_url(config, course_id, category);
    let roots = fetch_listing(page, &root_url, course_id, category, "", config).await?;

    let mut stats = RecursiveStats::default();
    let mut processed = HashSet::new();
    let mut stack = vec![(roots, 0usize)];
    while let Some((items, depth)) = stack.pop() {
        for item in items {
            if !item.is_folder {
                stats.file_count += 1;
                continue;
            }
            stats.folder_count += 1;
            if depth + 1 >= config.max_depth || processed.len() >= config.max_folders {
                continue;
            }
            if !processed.insert(item.url.clone()) {
                continue;
            }
            match fetch_listing(page, &item.url, &item.course_id, category, &item.path, config).await {
                Ok(children) => stack.push((children, depth + 1)),
                Err(PortalError::SessionExpired) => return Err(PortalError::SessionExpired),
                Err(err) => warn!(path = %item.path, error = %err, "folder not counted"),
            }
        }
    }
    info!(%course_id, %category, folders = stats.folder_count, files = stats.file_count, "stats computed");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::{BASE, FixtureSite, listing};
    use std::time::Duration;

    const ROOT: &str = "/Sinif/1.2/SinifDosyalari";
    const FOLDER_A: &str = "/Sinif/1.2/SinifDosyalari?g10";
    const FOLDER_B: &str = "/Sinif/1.2/SinifDosyalari?g11";

    fn scenario_site() -> FixtureSite {
        let site = FixtureSite::new("u", "p");
        site.add_page(
            ROOT,
            &listing(&[("FolderA", FOLDER_A, "-"), ("File1.pdf", "/Sinif/1.2/Dosya?1", "2 KB")]),
        );
        site.add_page(
            FOLDER_A,
            &listing(&[("File2.pdf", "/Sinif/1.2/Dosya?2", "1 KB"), ("FolderB", FOLDER_B, "-")]),
        );
        site.add_page(FOLDER_B, &listing(&[("File3.pdf", "/Sinif/1.2/Dosya?3", "3 KB")]));
        site
    }

    fn config(max_depth: usize) -> PortalConfig {
        PortalConfig {
            base_url: BASE.to_string(),
            max_depth,
            settle_delay: Duration::from_millis(1),
            retry_backoff: Duration::from_millis(1),
            ..PortalConfig::default()
        }
    }

    async fn logged_in(site: &FixtureSite, max_depth: usize) -> SessionManager {
        let session = SessionManager::new(site.browser(), config(max_depth));
        assert!(session.login("u", "p").await);
        session
    }

    fn paths(items: &[Item]) -> Vec<String> {
        let mut paths = items.iter().map(|i| i.path.clone()).collect::<Vec<_>>();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn nested_tree_is_flattened_with_full_paths() {
        let site = scenario_site();
        let session = logged_in(&site, 10).await;
        let items = TreeCrawler::new(&session, None)
            .crawl_category("/Sinif/1.2", Category::ClassFiles)
            .await
            .unwrap();

        assert_eq!(
            paths(&items),
            vec![
                "File1.pdf",
                "FolderA",
                "FolderA/File2.pdf",
                "FolderA/FolderB",
                "FolderA/FolderB/File3.pdf",
            ]
        );
        for item in &items {
            if let Some((parent, _)) = item.path.rsplit_once('/') {
                let parent_item = items.iter().find(|i| i.path == parent).unwrap();
                assert!(parent_item.is_folder);
                assert!(item.path.starts_with(&format!("{}/", parent_item.path)));
            }
            assert_eq!(item.course_id, "/Sinif/1.2");
        }
    }

    #[tokio::test]
    async fn repeated_crawls_are_stable() {
        let site = scenario_site();
        let session = logged_in(&site, 10).await;
        let crawler = TreeCrawler::new(&session, None);
        let first = crawler.crawl_category("/Sinif/1.2", Category::ClassFiles).await.unwrap();
        let second = crawler.crawl_category("/Sinif/1.2", Category::ClassFiles).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn depth_bound_drops_deeper_branches() {
        let site = scenario_site();
        let session = logged_in(&site, 2).await;
        let items = TreeCrawler::new(&session, None)
            .crawl_category("/Sinif/1.2", Category::ClassFiles)
            .await
            .unwrap();
        assert_eq!(
            paths(&items),
            vec!["File1.pdf", "FolderA", "FolderA/File2.pdf", "FolderA/FolderB"]
        );
    }

    #[tokio::test]
    async fn failing_folder_is_absorbed() {
        let site = scenario_site();
        site.fail_navigation(FOLDER_A);
        let session = logged_in(&site, 10).await;
        let items = TreeCrawler::new(&session, None)
            .crawl_category("/Sinif/1.2", Category::ClassFiles)
            .await
            .unwrap();
        assert_eq!(paths(&items), vec!["File1.pdf", "FolderA"]);
        let attempts = site
            .visits()
            .iter()
            .filter(|u| u.ends_with("?g10"))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn self_referencing_folder_is_not_revisited() {
        let site = FixtureSite::new("u", "p");
        site.add_page(
            ROOT,
            &listing(&[("Loop", ROOT, "-"), ("a.pdf", "/Sinif/1.2/Dosya?1", "1 KB")]),
        );
        let session = logged_in(&site, 10).await;
        let items = TreeCrawler::new(&session, None)
            .crawl_category("/Sinif/1.2", Category::ClassFiles)
            .await
            .unwrap();
        assert_eq!(paths(&items), vec!["Loop", "a.pdf"]);
    }

    #[tokio::test]
    async fn expired_session_surfaces_from_the_crawl() {
        let site = scenario_site();
        let session = logged_in(&site, 10).await;
        site.expire_session();
        let result = TreeCrawler::new(&session, None)
            .crawl_category("/Sinif/1.2", Category::ClassFiles)
            .await;
        assert!(matches!(result, Err(PortalError::SessionExpired)));
    }

    #[tokio::test]
    async fn list_files_merges_all_categories_and_reports_progress() {
        let site = scenario_site();
        site.add_page("/Sinif/1.2", &listing(&[("syllabus.pdf", "/Sinif/1.2/Dosya?9", "5 KB")]));
        site.add_page(
            "/Sinif/1.2/DersDosyalari",
            &listing(&[("slides.pdf", "/Sinif/1.2/Dosya?8", "5 KB")]),
        );
        let session = logged_in(&site, 10).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let items = TreeCrawler::new(&session, Some(&tx))
            .list_files("/Sinif/1.2")
            .await
            .unwrap();
        drop(tx);

        assert_eq!(items.len(), 7);
        assert_eq!(items.iter().filter(|i| i.category == Category::Home).count(), 1);
        assert_eq!(items.iter().filter(|i| i.category == Category::CourseFiles).count(), 1);

        let mut done = 0;
        let mut entered = 0;
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::CategoryDone { .. } => done += 1,
                ProgressEvent::FolderEntered { .. } => entered += 1,
                _ => {}
            }
        }
        assert_eq!(done, 3);
        assert_eq!(entered, 2);
    }

    #[tokio::test]
    async fn stats_count_the_whole_tree() {
        let site = scenario_site();
        let session = logged_in(&site, 10).await;
        let mut page = session.primary_page().await.unwrap();
        let stats = recursive_stats(page.as_mut(), session.config(), "/Sinif/1.2", Category::ClassFiles)
            .await
            .unwrap();
        assert_eq!(
            stats,
            RecursiveStats {
                folder_count: 2,
                file_count: 3
            }
        );
    }

    #[test]
    fn category_url_respects_existing_suffix() {
        let config = config(10);
        assert_eq!(
            category_url(&config, "/Sinif/1.2", Category::CourseFiles),
            "https://portal.test/Sinif/1.2/DersDosyalari"
        );
        assert_eq!(
            category_url(&config, "/Sinif/1.2/SinifDosyalari", Category::CourseFiles),
            "https://portal.test/Sinif/1.2/SinifDosyalari"
        );
        assert_eq!(category_url(&config, "/Sinif/1.2", Category::Home), "https://portal.test/Sinif/1.2");
    }
}
