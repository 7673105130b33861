use std::cmp::Ordering;

use chrono::NaiveDateTime;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::browser::BrowserPage;
use super::config::{CAMPUS_ANNOUNCEMENTS_PATH, PortalConfig};
use super::crawler::load_page;
use super::error::{PortalError, Result};
use super::parser;
use super::session::SessionManager;
use super::types::{Announcement, Course};

const TURKISH_MONTHS: [&str; 12] = [
    "ocak", "şubat", "mart", "nisan", "mayıs", "haziran", "temmuz", "ağustos", "eylül", "ekim",
    "kasım", "aralık",
];

/// List-then-detail crawl of announcements on pooled pages.
pub struct AnnouncementFetcher<'a> {
    session: &'a SessionManager,
}

impl<'a> AnnouncementFetcher<'a> {
    pub fn new(session: &'a SessionManager) -> Self {
        Self { session }
    }

    fn config(&self) -> &PortalConfig {
        self.session.config()
    }

    pub async fn for_course(&self, course_id: &str) -> Result<Vec<Announcement>> {
        let url = self
            .config()
            .absolute(&format!("{}/Duyurular", course_id.trim_end_matches('/')));
        self.list_with_details(&url, Some(course_id)).await
    }

    /// The campus-wide feed; each entry names its own course.
    pub async fn campus(&self) -> Result<Vec<Announcement>> {
        let url = self.config().absolute(CAMPUS_ANNOUNCEMENTS_PATH);
        self.list_with_details(&url, None).await
    }

    /// Per-course feeds for every course, a few courses at a time, newest first.
    pub async fn all_courses(&self, courses: &[Course]) -> Result<Vec<Announcement>> {
        let batch = self.config().announcement_batch.max(1);
        let mut all = Vec::new();
        for chunk in courses.chunks(batch) {
            let results = join_all(chunk.iter().map(|course| async move {
                (course, self.for_course(&course.id).await)
            }))
            .await;
            for (course, result) in results {
                match result {
                    Ok(list) => {
                        debug!(code = %course.code, announcements = list.len(), "course announcements");
                        all.extend(list.into_iter().map(|a| Announcement {
                            course_name: format!("{} - {}", course.code, course.name),
                            ..a
                        }));
                    }
                    Err(PortalError::SessionExpired) => return Err(PortalError::SessionExpired),
                    Err(err) => warn!(code = %course.code, error = %err, "announcements skipped"),
                }
            }
        }
        sort_newest_first(&mut all);
        info!(courses = courses.len(), announcements = all.len(), "announcements collected");
        Ok(all)
    }

    async fn list_with_details(
        &self,
        list_url: &str,
        course_id: Option<&str>,
    ) -> Result<Vec<Announcement>> {
        let mut pooled = self.session.acquire_page().await?;
        let result = fetch_list_with_details(pooled.page(), self.config(), list_url, course_id).await;
        self.session.release_page(pooled).await;
        result
    }
}

async fn fetch_list_with_details(
    page: &mut dyn BrowserPage,
    config: &PortalConfig,
    list_url: &str,
    course_id: Option<&str>,
) -> Result<Vec<Announcement>> {
    let (final_url, html) = load_page(page, list_url, config).await?;
    let stubs = parser::parse_announcement_list(&html, &final_url, course_id);
    debug!(url = %list_url, stubs = stubs.len(), "announcement list parsed");

    let mut out = Vec::with_capacity(stubs.len());
    for stub in stubs {
        match load_page(page, &stub.url, config).await {
            Ok((_, detail)) => {
                let content = parser::parse_announcement_body(&detail).unwrap_or_default();
                out.push(Announcement { content, ..stub });
            }
            Err(err) => {
                warn!(title = %stub.title, error = %err, "announcement detail unavailable, keeping summary");
                out.push(stub);
            }
        }
    }
    Ok(out)
}

/// Parses `dd.mm.yyyy hh:mm` and `d Month yyyy hh:mm` (Turkish month names).
pub fn parse_announcement_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for fmt in ["%d.%m.%Y %H:%M", "%d.%m.%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%d.%m.%Y") {
        return date.and_hms_opt(0, 0, 0);
    }

    let parts = text.split_whitespace().collect::<Vec<_>>();
    if parts.len() < 3 {
        return None;
    }
    let month_name = parts[1].to_lowercase();
    let month = TURKISH_MONTHS.iter().position(|m| *m == month_name)? + 1;
    let numeric = format!(
        "{}.{}.{} {}",
        parts[0],
        month,
        parts[2],
        parts.get(3).copied().unwrap_or("00:00")
    );
    NaiveDateTime::parse_from_str(&numeric, "%d.%m.%Y %H:%M").ok()
}

fn sort_newest_first(list: &mut [Announcement]) {
    list.sort_by(|a, b| {
        match (parse_announcement_date(&a.date), parse_announcement_date(&b.date)) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => b.date.cmp(&a.date),
        }
    });
}
