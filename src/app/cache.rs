use std::collections::HashMap;

use tokio::sync::RwLock;

use super::types::{Category, Item, RecursiveStats};

/// Crawl results kept between commands. Owned by the portal facade and cleared
/// on logout or forced refresh.
#[derive(Default)]
pub struct CrawlCache {
    files: RwLock<HashMap<String, Vec<Item>>>,
    stats: RwLock<HashMap<(String, Category), RecursiveStats>>,
}

impl CrawlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn files(&self, course_id: &str) -> Option<Vec<Item>> {
        self.files.read().await.get(course_id).cloned()
    }

    pub async fn store_files(&self, course_id: &str, items: Vec<Item>) {
        self.files.write().await.insert(course_id.to_string(), items);
    }

    pub async fn stats(&self, course_id: &str, category: Category) -> Option<RecursiveStats> {
        self.stats
            .read()
            .await
            .get(&(course_id.to_string(), category))
            .copied()
    }

    pub async fn store_stats(&self, course_id: &str, category: Category, stats: RecursiveStats) {
        self.stats
            .write()
            .await
            .insert((course_id.to_string(), category), stats);
    }

    pub async fn invalidate_course(&self, course_id: &str) {
        self.files.write().await.remove(course_id);
        self.stats.write().await.retain(|(id, _), _| id != course_id);
    }

    pub async fn clear(&self) {
        self.files.write().await.clear();
        self.stats.write().await.clear();
    }
}
