use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

use super::error::{PortalError, Result};
use super::types::{Category, Course, DownloadedFileRecord, Item};

struct Migration {
    version: u32,
    name: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    up: include_str!("migrations/001_initial_schema.sql"),
}];

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        info!("Applying migration {}: {}", migration.version, migration.name);
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }
    Ok(())
}

/// Local cache of courses and crawled items plus the downloaded-files ledger.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // -- Courses --

    pub fn upsert_course(&self, course: &Course) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO courses (course_id, code, name, term, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(course_id) DO UPDATE SET
               code = excluded.code, name = excluded.name,
               term = excluded.term, updated_at = excluded.updated_at",
            params![course.id, course.code, course.name, course.term, now],
        )?;
        Ok(())
    }

    pub fn courses(&self) -> Result<Vec<Course>> {
        let mut stmt = self
            .conn
            .prepare("SELECT course_id, code, name, term FROM courses ORDER BY code")?;
        let rows = stmt.query_map([], |r| {
            Ok(Course {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                term: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- Items --

    /// Upserts every item in one transaction.
    pub fn bulk_upsert_items(&self, items: &[Item]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ninova_files
                   (file_id, course_id, category, name, url, size_bytes, upload_date, is_folder, path, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(file_id) DO UPDATE SET
                   course_id = excluded.course_id, category = excluded.category,
                   name = excluded.name, url = excluded.url, size_bytes = excluded.size_bytes,
                   upload_date = excluded.upload_date, is_folder = excluded.is_folder,
                   path = excluded.path, updated_at = excluded.updated_at",
            )?;
            for item in items {
                stmt.execute(params![
                    item.id,
                    item.course_id,
                    item.category.label(),
                    item.name,
                    item.url,
                    item.size_bytes as i64,
                    item.upload_date,
                    item.is_folder,
                    item.path,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(items.len())
    }

    pub fn items(&self) -> Result<Vec<Item>> {
        self.query_items(
            "SELECT file_id, course_id, category, name, url, size_bytes, upload_date, is_folder, path
             FROM ninova_files ORDER BY course_id, category, path",
            [],
        )
    }

    pub fn items_by_course(&self, course_id: &str) -> Result<Vec<Item>> {
        self.query_items(
            "SELECT file_id, course_id, category, name, url, size_bytes, upload_date, is_folder, path
             FROM ninova_files WHERE course_id = ?1 ORDER BY category, path",
            [course_id],
        )
    }

    fn query_items<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_items_for_course(&self, course_id: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM ninova_files WHERE course_id = ?1", [course_id])?)
    }

    pub fn clear_items(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM ninova_files", [])?)
    }

    /// Keeps the newest row for each `(name, url)` pair.
    pub fn remove_duplicate_items(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM ninova_files WHERE id NOT IN (
                SELECT MAX(id) FROM ninova_files GROUP BY name, url
             )",
            [],
        )?)
    }

    // -- Ledger --

    pub fn add_downloaded_file(&self, record: &DownloadedFileRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO downloaded_files
               (id, file_id, course_id, course_name, file_name, file_url, local_path,
                size_bytes, upload_date, downloaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.item_id,
                record.course_id,
                record.course_name,
                record.file_name,
                record.url,
                record.local_path,
                record.size_bytes as i64,
                record.upload_date,
                record.downloaded_at
            ],
        )?;
        Ok(())
    }

    /// The whole ledger in one query.
    pub fn downloaded_files(&self) -> Result<Vec<DownloadedFileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_id, course_id, course_name, file_name, file_url, local_path,
                    size_bytes, upload_date, downloaded_at
             FROM downloaded_files ORDER BY downloaded_at DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(DownloadedFileRecord {
                id: r.get(0)?,
                item_id: r.get(1)?,
                course_id: r.get(2)?,
                course_name: r.get(3)?,
                file_name: r.get(4)?,
                url: r.get(5)?,
                local_path: r.get(6)?,
                size_bytes: r.get::<_, i64>(7)?.max(0) as u64,
                upload_date: r.get(8)?,
                downloaded_at: r.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn is_downloaded(&self, item_id: &str, url: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM downloaded_files WHERE file_id = ?1 OR file_url = ?2 LIMIT 1",
                params![item_id, url],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_downloaded_file(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM downloaded_files WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM courses; DELETE FROM ninova_files; DELETE FROM downloaded_files;",
        )?;
        Ok(())
    }
}

fn item_from_row(r: &Row<'_>) -> rusqlite::Result<Item> {
    let label: String = r.get(2)?;
    let category = label.parse::<Category>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(PortalError::Config(e)),
        )
    })?;
    Ok(Item {
        id: r.get(0)?,
        course_id: r.get(1)?,
        category,
        name: r.get(3)?,
        url: r.get(4)?,
        size_bytes: r.get::<_, i64>(5)?.max(0) as u64,
        upload_date: r.get(6)?,
        is_folder: r.get(7)?,
        path: r.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::from_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn item(id: &str, course: &str, path: &str, url: &str) -> Item {
        Item {
            id: id.to_string(),
            course_id: course.to_string(),
            category: Category::CourseFiles,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            url: url.to_string(),
            size_bytes: 2048,
            upload_date: "2024-10-01".to_string(),
            is_folder: false,
            path: path.to_string(),
        }
    }

    fn record(id: &str, item_id: &str, url: &str) -> DownloadedFileRecord {
        DownloadedFileRecord {
            id: id.to_string(),
            item_id: item_id.to_string(),
            course_id: "/Sinif/1".to_string(),
            course_name: "BLG 101E".to_string(),
            file_name: "a.pdf".to_string(),
            url: url.to_string(),
            local_path: "/tmp/a.pdf".to_string(),
            size_bytes: 2048,
            upload_date: "2024-10-01".to_string(),
            downloaded_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn courses_upsert_by_course_id() {
        let store = store();
        let mut course = Course {
            id: "/Sinif/1".to_string(),
            code: "BLG 101E".to_string(),
            name: "Old".to_string(),
            term: "33350".to_string(),
        };
        store.upsert_course(&course).unwrap();
        course.name = "New".to_string();
        store.upsert_course(&course).unwrap();
        let courses = store.courses().unwrap();
        assert_eq!(courses, vec![course]);
    }

    #[test]
    fn items_round_trip_and_upsert() {
        let store = store();
        let a = item("a", "/Sinif/1", "Week 1/a.pdf", "https://p/a");
        let b = item("b", "/Sinif/2", "b.pdf", "https://p/b");
        assert_eq!(store.bulk_upsert_items(&[a.clone(), b.clone()]).unwrap(), 2);
        store.bulk_upsert_items(&[a.clone()]).unwrap();

        assert_eq!(store.items().unwrap().len(), 2);
        assert_eq!(store.items_by_course("/Sinif/1").unwrap(), vec![a]);
        assert_eq!(store.delete_items_for_course("/Sinif/2").unwrap(), 1);
        assert_eq!(store.clear_items().unwrap(), 1);
    }

    #[test]
    fn duplicates_keep_the_newest_row() {
        let store = store();
        let first = item("old-id", "/Sinif/1", "a.pdf", "https://p/a");
        let second = item("new-id", "/Sinif/1", "a.pdf", "https://p/a");
        store.bulk_upsert_items(&[first]).unwrap();
        store.bulk_upsert_items(&[second]).unwrap();
        assert_eq!(store.remove_duplicate_items().unwrap(), 1);
        let left = store.items().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "new-id");
    }

    #[test]
    fn ledger_matches_by_id_or_url() {
        let store = store();
        store.add_downloaded_file(&record("r1", "item-1", "https://p/a")).unwrap();
        assert!(store.is_downloaded("item-1", "elsewhere").unwrap());
        assert!(store.is_downloaded("other", "https://p/a").unwrap());
        assert!(!store.is_downloaded("other", "https://p/b").unwrap());
        assert_eq!(store.downloaded_files().unwrap().len(), 1);

        assert!(store.delete_downloaded_file("r1").unwrap());
        assert!(!store.delete_downloaded_file("r1").unwrap());
    }

    #[test]
    fn clear_all_empties_every_table() {
        let store = store();
        store
            .upsert_course(&Course {
                id: "/Sinif/1".to_string(),
                code: "X".to_string(),
                name: "X".to_string(),
                term: String::new(),
            })
            .unwrap();
        store.add_downloaded_file(&record("r1", "i", "u")).unwrap();
        store.clear_all().unwrap();
        assert!(store.courses().unwrap().is_empty());
        assert!(store.downloaded_files().unwrap().is_empty());
    }

    #[test]
    fn opens_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/beelocal.db");
        let store = Store::open(&path).unwrap();
        store.bulk_upsert_items(&[item("a", "/S/1", "a", "u")]).unwrap();
        drop(store);
        assert_eq!(Store::open(&path).unwrap().items().unwrap().len(), 1);
    }
}
