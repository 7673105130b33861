use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use super::config::DEFAULT_BASE_URL;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "beelocal",
    version,
    about = "Course-portal crawler with session recovery and ledger-aware downloads"
)]
pub struct Cli {
    #[arg(long, env = "BEELOCAL_USERNAME", value_name = "USER")]
    pub username: Option<String>,

    #[arg(
        long,
        env = "BEELOCAL_PASSWORD",
        value_name = "SECRET",
        hide_env_values = true
    )]
    pub password: Option<String>,

    #[arg(long, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, value_name = "FILE", default_value = "beelocal.db")]
    pub database: PathBuf,

    #[arg(long, value_name = "N", default_value_t = 20)]
    pub max_pages: usize,

    #[arg(long, value_name = "N", default_value_t = 10)]
    pub max_depth: usize,

    #[arg(long, value_name = "N", default_value_t = 3)]
    pub retries: usize,

    #[arg(long, value_name = "MS", default_value_t = 15000)]
    pub nav_timeout_ms: u64,

    #[arg(long, value_name = "SECS", default_value_t = 120)]
    pub download_timeout_secs: u64,

    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    pub webdriver_browser: BrowserArg,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub webdriver_headless: bool,

    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check that the credentials are accepted.
    Login,
    /// List enrolled courses and cache them in the database.
    Courses,
    /// Crawl every file and folder of a course.
    Files {
        course_id: String,
        #[arg(long, value_name = "CATEGORY")]
        category: Option<Category>,
        #[arg(short, long, value_name = "FILE")]
        output: Option<String>,
        #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
        format: FileFormatArg,
    },
    /// List one level of a folder.
    Folder {
        url: String,
        #[arg(long)]
        course_id: String,
        #[arg(long, default_value = "sinif")]
        category: Category,
        #[arg(long, default_value = "")]
        parent_path: String,
    },
    /// Count folders and files below a category root.
    Stats { course_id: String, category: Category },
    /// Download a single file with the session's cookies.
    Download {
        url: String,
        path: PathBuf,
        /// Download even when the ledger already lists the URL.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List announcements for one course, the campus feed, or all courses.
    Announcements {
        #[arg(long, value_name = "COURSE_ID", conflicts_with = "all_courses")]
        course: Option<String>,
        #[arg(long, default_value_t = false)]
        all_courses: bool,
    },
    /// Download every file of a course that is not in the ledger yet.
    Sync {
        course_id: String,
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,
    },
    /// Print the downloaded-files ledger.
    Ledger,
    /// Show one level of a course's cached tree with downloaded flags.
    Tree {
        course_id: String,
        #[arg(long, default_value = "sinif")]
        category: Category,
        #[arg(long, default_value = "")]
        parent_path: String,
    },
    /// Counts of cached courses, items and ledger entries.
    Status,
    /// Remove one ledger entry by record id.
    Forget { id: String },
    /// Drop cached portal items (the ledger is kept).
    ClearItems,
    /// Drop every table's rows.
    ClearAll,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Chrome,
    Firefox,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub code: String,
    pub name: String,
    pub term: String,
}

/// Top-level content area of a course; each has an independent folder tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Ana Sayfa")]
    Home,
    #[serde(rename = "Sınıf Dosyaları")]
    ClassFiles,
    #[serde(rename = "Ders Dosyaları")]
    CourseFiles,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Home => "Ana Sayfa",
            Category::ClassFiles => "Sınıf Dosyaları",
            Category::CourseFiles => "Ders Dosyaları",
        }
    }

    pub fn url_suffix(self) -> &'static str {
        match self {
            Category::Home => "",
            Category::ClassFiles => "/SinifDosyalari",
            Category::CourseFiles => "/DersDosyalari",
        }
    }

    /// Only the two file areas are walked recursively.
    pub fn has_tree(self) -> bool {
        !matches!(self, Category::Home)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "home" | "ana" | "ana sayfa" => Ok(Category::Home),
            "sinif" | "class" | "sınıf dosyaları" | "sinifdosyalari" => Ok(Category::ClassFiles),
            "ders" | "course" | "ders dosyaları" | "dersdosyalari" => Ok(Category::CourseFiles),
            _ => Err(format!("unknown category '{trimmed}' (expected sinif, ders or home)")),
        }
    }
}

/// A file or folder discovered during a crawl. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub course_id: String,
    pub category: Category,
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    pub upload_date: String,
    pub is_folder: bool,
    /// Relative to the category root, `/`-separated, never containing the category label.
    pub path: String,
}

/// An item with the ledger overlay applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemStatus {
    #[serde(flatten)]
    pub item: Item,
    pub is_downloaded: bool,
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecursiveStats {
    pub folder_count: usize,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub course_id: String,
    pub course_name: String,
    pub title: String,
    pub content: String,
    pub date: String,
    pub author: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementSource {
    Course(String),
    Campus,
    AllCourses,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedFileRecord {
    pub id: String,
    pub item_id: String,
    pub course_id: String,
    pub course_name: String,
    pub file_name: String,
    pub url: String,
    pub local_path: String,
    pub size_bytes: u64,
    pub upload_date: String,
    pub downloaded_at: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Out-of-band notifications for long-running crawls and downloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Status(String),
    FolderEntered {
        path: String,
        depth: usize,
    },
    CategoryDone {
        category: Category,
        items: usize,
    },
    DownloadStarted {
        url: String,
        total: Option<u64>,
    },
    DownloadProgress {
        url: String,
        downloaded: u64,
        total: Option<u64>,
    },
    DownloadFinished {
        url: String,
        path: String,
        bytes: u64,
    },
    DownloadFailed {
        url: String,
        reason: String,
    },
}

pub type ProgressTx = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Sends without blocking; a dropped receiver is ignored.
pub fn emit(progress: Option<&ProgressTx>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}
