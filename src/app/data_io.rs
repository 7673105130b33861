use std::fs::File;
use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;

use super::types::{DataFormat, ItemStatus};

const CSV_HEADERS: [&str; 11] = [
    "id",
    "course_id",
    "category",
    "path",
    "name",
    "is_folder",
    "size_bytes",
    "upload_date",
    "url",
    "is_downloaded",
    "local_path",
];

#[derive(Debug, Clone, Serialize)]
struct ItemExportRecord {
    id: String,
    course_id: String,
    category: String,
    path: String,
    name: String,
    is_folder: bool,
    size_bytes: u64,
    upload_date: String,
    url: String,
    is_downloaded: bool,
    local_path: String,
}

fn status_to_export_record(status: &ItemStatus) -> ItemExportRecord {
    let item = &status.item;
    ItemExportRecord {
        id: item.id.clone(),
        course_id: item.course_id.clone(),
        category: item.category.label().to_string(),
        path: item.path.clone(),
        name: item.name.clone(),
        is_folder: item.is_folder,
        size_bytes: item.size_bytes,
        upload_date: item.upload_date.clone(),
        url: item.url.clone(),
        is_downloaded: status.is_downloaded,
        local_path: status.local_path.clone().unwrap_or_default(),
    }
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let file = File::create(output_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_item(&mut self, status: &ItemStatus) -> io::Result<()> {
        let rec = status_to_export_record(status);
        self.writer.write_record([
            rec.id,
            rec.course_id,
            rec.category,
            rec.path,
            rec.name,
            rec.is_folder.to_string(),
            rec.size_bytes.to_string(),
            rec.upload_date,
            rec.url,
            rec.is_downloaded.to_string(),
            rec.local_path,
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink {
    file: File,
    first: bool,
    closed: bool,
}

impl JsonSink {
    fn new(output_path: &str) -> io::Result<Self> {
        let mut file = File::create(output_path)?;
        file.write_all(b"[\n")?;
        Ok(Self {
            file,
            first: true,
            closed: false,
        })
    }

    fn write_item(&mut self, status: &ItemStatus) -> io::Result<()> {
        let rec = status_to_export_record(status);
        if !self.first {
            self.file.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.file, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.file.write_all(b"]\n")?;
            } else {
                self.file.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.file.flush()
    }
}

impl Drop for JsonSink {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

enum OutputSink {
    Csv(CsvSink),
    Json(JsonSink),
}

impl OutputSink {
    fn new(output_path: &str, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(output_path)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(output_path)?)),
        }
    }

    fn write_item(&mut self, status: &ItemStatus) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_item(status),
            OutputSink::Json(sink) => sink.write_item(status),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.flush(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

/// `<course>_<timestamp>.<ext>` with everything but alphanumerics and `-`
/// replaced by `_`.
pub fn default_output_path(course_id: &str, format: DataFormat) -> String {
    let stem = course_id
        .trim_matches('/')
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let stem = if stem.is_empty() { "files".to_string() } else { stem };
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("{stem}_{ts}.csv"),
        DataFormat::Json => format!("{stem}_{ts}.json"),
    }
}

/// Writes every item through one sink and finalizes it.
pub fn export_items(path: &str, format: DataFormat, items: &[ItemStatus]) -> io::Result<usize> {
    let mut sink = OutputSink::new(path, format)?;
    for status in items {
        sink.write_item(status)?;
    }
    sink.finalize()?;
    Ok(items.len())
}
