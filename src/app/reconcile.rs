use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::types::{DownloadedFileRecord, Item, ItemStatus};

/// One bulk read of the downloaded-files ledger, keyed both by item id and URL.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    ids: HashSet<String>,
    urls: HashSet<String>,
    local_paths: HashMap<String, String>,
}

impl LedgerSnapshot {
    pub fn from_records(records: &[DownloadedFileRecord]) -> Self {
        let mut snapshot = LedgerSnapshot::default();
        for record in records {
            snapshot.ids.insert(record.item_id.clone());
            snapshot.urls.insert(record.url.clone());
            snapshot
                .local_paths
                .insert(record.item_id.clone(), record.local_path.clone());
            snapshot
                .local_paths
                .insert(record.url.clone(), record.local_path.clone());
        }
        snapshot
    }

    pub fn contains(&self, item: &Item) -> bool {
        self.ids.contains(&item.id) || self.urls.contains(&item.url)
    }

    pub fn local_path(&self, item: &Item) -> Option<&str> {
        self.local_paths
            .get(&item.id)
            .or_else(|| self.local_paths.get(&item.url))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

fn is_descendant(folder: &Item, candidate: &Item) -> bool {
    candidate.course_id == folder.course_id
        && candidate.category == folder.category
        && candidate.path.starts_with(&folder.path)
        && candidate.path[folder.path.len()..].starts_with('/')
}

/// Downloaded flags for every item. Files count when their id or URL is in the
/// ledger; folders count when they have at least one descendant file and all
/// of those files count.
pub fn overlay_downloaded(items: &[Item], ledger: &LedgerSnapshot) -> Vec<ItemStatus> {
    items
        .iter()
        .map(|item| {
            if !item.is_folder {
                return ItemStatus {
                    item: item.clone(),
                    is_downloaded: ledger.contains(item),
                    local_path: ledger.local_path(item).map(str::to_string),
                };
            }
            let mut files = items
                .iter()
                .filter(|c| !c.is_folder && is_descendant(item, c))
                .peekable();
            let has_files = files.peek().is_some();
            let all_downloaded = files.all(|c| ledger.contains(c));
            ItemStatus {
                item: item.clone(),
                is_downloaded: has_files && all_downloaded,
                local_path: None,
            }
        })
        .collect()
}

/// Items exactly one level below `parent_path` (`""` is the category root).
pub fn direct_children<'a>(items: &'a [Item], parent_path: &str) -> Vec<&'a Item> {
    items
        .iter()
        .filter(|item| {
            let rest = if parent_path.is_empty() {
                item.path.as_str()
            } else {
                match item.path.strip_prefix(parent_path) {
                    Some(rest) => match rest.strip_prefix('/') {
                        Some(rest) => rest,
                        None => return false,
                    },
                    None => return false,
                }
            };
            !rest.is_empty() && !rest.contains('/')
        })
        .collect()
}

pub fn sanitize_segment(segment: &str) -> String {
    let cleaned = segment
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    let trimmed = cleaned.trim().trim_end_matches('.');
    match trimmed {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}

/// `root/<course code>/<category>/<path segments>`, each segment sanitized.
pub fn local_target(root: &Path, course_code: &str, item: &Item) -> PathBuf {
    let mut target = root.join(sanitize_segment(course_code));
    target.push(sanitize_segment(item.category.label()));
    for segment in item.path.split('/').filter(|s| !s.is_empty()) {
        target.push(sanitize_segment(segment));
    }
    target
}
