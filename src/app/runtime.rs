use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::Parser;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use super::cache::CrawlCache;
use super::config::{PortalConfig, WebDriverConfig};
use super::data_io::{default_output_path, detect_data_format, export_items};
use super::portal::Portal;
use super::reconcile::{LedgerSnapshot, direct_children, local_target, overlay_downloaded};
use super::store::Store;
use super::types::{
    AnnouncementSource, Cli, Command, Course, DataFormat, DownloadedFileRecord, Item,
    ProgressEvent, ProgressTx, emit,
};
use super::webdriver::WebDriverBrowser;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Status(message) => eprintln!("{message}"),
        ProgressEvent::FolderEntered { path, depth } => eprintln!("{:indent$}{path}/", "", indent = depth * 2),
        ProgressEvent::CategoryDone { category, items } => eprintln!("{category}: {items} items"),
        ProgressEvent::DownloadStarted { url, total } => match total {
            Some(total) => eprintln!("downloading {url} ({total} bytes)"),
            None => eprintln!("downloading {url}"),
        },
        ProgressEvent::DownloadProgress { .. } => {}
        ProgressEvent::DownloadFinished { path, bytes, .. } => eprintln!("saved {path} ({bytes} bytes)"),
        ProgressEvent::DownloadFailed { url, reason } => eprintln!("failed {url}: {reason}"),
    }
}

async fn drain_progress(mut rx: UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        print_progress(&event);
    }
}

fn record_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

async fn resolve_course(portal: &Portal, store: &Store, course_id: &str) -> anyhow::Result<Course> {
    if let Some(course) = store.courses()?.into_iter().find(|c| c.id == course_id) {
        return Ok(course);
    }
    let courses = portal.list_courses().await?;
    for course in &courses {
        store.upsert_course(course)?;
    }
    Ok(courses
        .into_iter()
        .find(|c| c.id == course_id)
        .unwrap_or_else(|| Course {
            id: course_id.to_string(),
            code: course_id.trim_matches('/').replace('/', "_"),
            name: String::new(),
            term: String::new(),
        }))
}

struct SyncSummary {
    downloaded: usize,
    skipped: usize,
    failed: usize,
}

/// Downloads every file the ledger does not know yet. A failed file is
/// reported and the rest continue.
async fn sync_course(
    portal: &Portal,
    store: &Store,
    course: &Course,
    dest: &Path,
    progress: &ProgressTx,
) -> anyhow::Result<SyncSummary> {
    let items = portal.list_files(&course.id, true, Some(progress)).await?;
    store.delete_items_for_course(&course.id)?;
    store.bulk_upsert_items(&items)?;
    let ledger = LedgerSnapshot::from_records(&store.downloaded_files()?);

    let mut summary = SyncSummary {
        downloaded: 0,
        skipped: 0,
        failed: 0,
    };
    let pending: Vec<&Item> = items
        .iter()
        .filter(|item| !item.is_folder)
        .filter(|item| {
            let known = ledger.contains(item);
            if known {
                summary.skipped += 1;
            }
            !known
        })
        .collect();
    info!(
        course = %course.code,
        pending = pending.len(),
        skipped = summary.skipped,
        ledger = ledger.len(),
        "sync planned"
    );
    emit(
        Some(progress),
        ProgressEvent::Status(format!(
            "{}: {} to download, {} already present",
            course.code,
            pending.len(),
            summary.skipped
        )),
    );

    for item in pending {
        let target = local_target(dest, &course.code, item);
        match portal.download_file(&item.url, &target, Some(progress)).await {
            Ok(bytes) => {
                store.add_downloaded_file(&DownloadedFileRecord {
                    id: record_id(&item.url),
                    item_id: item.id.clone(),
                    course_id: course.id.clone(),
                    course_name: course.name.clone(),
                    file_name: item.name.clone(),
                    url: item.url.clone(),
                    local_path: target.display().to_string(),
                    size_bytes: bytes,
                    upload_date: item.upload_date.clone(),
                    downloaded_at: Utc::now().to_rfc3339(),
                })?;
                summary.downloaded += 1;
            }
            Err(err) => {
                warn!(url = %item.url, error = %err, "download failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

async fn dispatch(cli: &Cli, portal: &Portal, store: &Store) -> anyhow::Result<()> {
    match &cli.command {
        Command::Login => {
            println!("logged in");
        }
        Command::Courses => {
            let courses = portal.list_courses().await?;
            for course in &courses {
                store.upsert_course(course)?;
                println!("{}\t{}\t{}\t{}", course.id, course.code, course.term, course.name);
            }
        }
        Command::Files {
            course_id,
            category,
            output,
            format,
        } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(drain_progress(rx));
            let listed = portal.list_files(course_id, true, Some(&tx)).await;
            drop(tx);
            let _ = printer.await;
            let items = listed?;

            store.delete_items_for_course(course_id)?;
            store.bulk_upsert_items(&items)?;
            let ledger = LedgerSnapshot::from_records(&store.downloaded_files()?);
            let selected: Vec<Item> = items
                .into_iter()
                .filter(|item| category.is_none_or(|c| c == item.category))
                .collect();
            let statuses = overlay_downloaded(&selected, &ledger);

            let configured: DataFormat = (*format).into();
            let out_format = output
                .as_deref()
                .map(|path| detect_data_format(path, configured))
                .unwrap_or(configured);
            let out_path = output
                .clone()
                .unwrap_or_else(|| default_output_path(course_id, out_format));
            let written = export_items(&out_path, out_format, &statuses)
                .with_context(|| format!("writing {out_path}"))?;
            let downloaded = statuses.iter().filter(|s| s.is_downloaded).count();
            eprintln!("exported {written} items ({downloaded} downloaded) to {out_path}");
        }
        Command::Folder {
            url,
            course_id,
            category,
            parent_path,
        } => {
            let items = portal
                .list_folder_contents(url, course_id, *category, parent_path)
                .await?;
            for item in items {
                let kind = if item.is_folder { "dir" } else { "file" };
                println!("{kind}\t{}\t{}\t{}", item.size_bytes, item.path, item.url);
            }
        }
        Command::Stats {
            course_id,
            category,
        } => {
            let stats = portal.recursive_stats(course_id, *category).await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Download { url, path, force } => {
            if !*force && store.is_downloaded(url, url)? {
                eprintln!("{url} is already in the ledger; pass --force to download again");
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(drain_progress(rx));
            let result = portal.download_file(url, path, Some(&tx)).await;
            drop(tx);
            let _ = printer.await;
            let bytes = result?;
            println!("{bytes}");
        }
        Command::Announcements {
            course,
            all_courses,
        } => {
            let source = match (course, all_courses) {
                (Some(course_id), _) => AnnouncementSource::Course(course_id.clone()),
                (None, true) => AnnouncementSource::AllCourses,
                (None, false) => AnnouncementSource::Campus,
            };
            let list = portal.list_announcements(&source).await;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Command::Sync { course_id, dest } => {
            let course = resolve_course(portal, store, course_id).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(drain_progress(rx));
            let result = sync_course(portal, store, &course, dest, &tx).await;
            drop(tx);
            let _ = printer.await;
            let summary = result?;
            eprintln!(
                "sync finished: downloaded={} already_present={} failed={}",
                summary.downloaded, summary.skipped, summary.failed
            );
            if summary.failed > 0 {
                bail!("{} downloads failed", summary.failed);
            }
        }
        Command::Ledger
        | Command::Tree { .. }
        | Command::Status
        | Command::Forget { .. }
        | Command::ClearItems
        | Command::ClearAll => {}
    }
    Ok(())
}

/// Commands that only touch the local database.
fn run_offline(command: &Command, store: &Store) -> anyhow::Result<bool> {
    match command {
        Command::Ledger => {
            for record in store.downloaded_files()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.downloaded_at, record.size_bytes, record.course_name, record.local_path
                );
            }
        }
        Command::Tree {
            course_id,
            category,
            parent_path,
        } => {
            let items: Vec<Item> = store
                .items_by_course(course_id)?
                .into_iter()
                .filter(|item| item.category == *category)
                .collect();
            let ledger = LedgerSnapshot::from_records(&store.downloaded_files()?);
            let statuses = overlay_downloaded(&items, &ledger);
            let parent = parent_path.trim_matches('/');
            for child in direct_children(&items, parent) {
                let Some(status) = statuses.iter().find(|s| s.item.id == child.id) else {
                    continue;
                };
                let mark = if status.is_downloaded { "x" } else { " " };
                let suffix = if child.is_folder { "/" } else { "" };
                println!("[{mark}] {}{suffix}\t{}", child.name, child.size_bytes);
            }
        }
        Command::Status => {
            let ledger = LedgerSnapshot::from_records(&store.downloaded_files()?);
            println!("courses: {}", store.courses()?.len());
            println!("items: {}", store.items()?.len());
            println!("downloaded: {}", ledger.len());
        }
        Command::Forget { id } => {
            if !store.delete_downloaded_file(id)? {
                bail!("no ledger entry with id {id}");
            }
            eprintln!("forgot {id}");
        }
        Command::ClearItems => {
            let removed = store.clear_items()?;
            eprintln!("removed {removed} cached items");
        }
        Command::ClearAll => {
            store.clear_all()?;
            eprintln!("database cleared");
        }
        _ => return Ok(false),
    }
    Ok(true)
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let store = Store::open(&cli.database)
        .with_context(|| format!("opening database {}", cli.database.display()))?;
    let deduped = store.remove_duplicate_items()?;
    if deduped > 0 {
        info!(removed = deduped, "duplicate items removed");
    }
    if run_offline(&cli.command, &store)? {
        return Ok(());
    }

    let (Some(username), Some(password)) = (cli.username.as_deref(), cli.password.as_deref())
    else {
        bail!("credentials missing: pass --username/--password or set BEELOCAL_USERNAME/BEELOCAL_PASSWORD");
    };

    let config = PortalConfig::from_cli(&cli);
    let browser = Arc::new(WebDriverBrowser::new(WebDriverConfig::from_cli(&cli))?);
    let portal = Portal::new(browser, config, Arc::new(CrawlCache::new()))?;

    if !portal.login(username, password).await {
        portal.shutdown().await;
        bail!("login rejected for {username}");
    }

    let outcome = dispatch(&cli, &portal, &store).await;
    portal.logout().await;
    outcome
}
