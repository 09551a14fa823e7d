use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::merge::dedupe;
use crate::record::{Engagement, Record, EXTRACTED_AT_FORMAT};

const BOM: &[u8] = b"\xEF\xBB\xBF";
pub const COLUMNS: [&str; 7] = [
    "content",
    "likes",
    "comments",
    "shares",
    "normalized_timestamp",
    "url",
    "extracted_at",
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path}: bad extracted_at `{value}`")]
    Timestamp { path: PathBuf, value: String },
}

/// One CSV row. Field names double as the header.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    content: String,
    likes: String,
    comments: String,
    shares: String,
    normalized_timestamp: String,
    url: String,
    extracted_at: String,
}

impl From<&Record> for Row {
    fn from(r: &Record) -> Self {
        Self {
            content: r.content.clone(),
            likes: r.engagement.likes.clone(),
            comments: r.engagement.comments.clone(),
            shares: r.engagement.shares.clone(),
            normalized_timestamp: r.timestamp.clone(),
            url: r.url.clone(),
            extracted_at: r.extracted_at.format(EXTRACTED_AT_FORMAT).to_string(),
        }
    }
}

impl Row {
    fn into_record(self, path: &Path) -> Result<Record, CheckpointError> {
        let extracted_at = NaiveDateTime::parse_from_str(&self.extracted_at, EXTRACTED_AT_FORMAT)
            .map_err(|_| CheckpointError::Timestamp {
                path: path.to_path_buf(),
                value: self.extracted_at.clone(),
            })?;
        Ok(Record {
            content: self.content,
            engagement: Engagement {
                likes: self.likes,
                comments: self.comments,
                shares: self.shares,
            },
            raw_timestamp: self.normalized_timestamp.clone(),
            timestamp: self.normalized_timestamp,
            url: self.url,
            extracted_at,
        })
    }
}

/// Writes complete records out in numbered batch files as a run progresses.
#[derive(Debug)]
pub struct Checkpointer {
    dir: PathBuf,
    stamp: String,
    batches: Vec<PathBuf>,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            batches: Vec::new(),
        })
    }

    pub fn batches(&self) -> &[PathBuf] {
        &self.batches
    }

    pub fn next_batch(&self) -> usize {
        self.batches.len() + 1
    }

    /// Where the consolidated output of this run goes.
    pub fn final_path(&self) -> PathBuf {
        self.dir.join(format!("posts_final_{}.csv", self.stamp))
    }

    /// Persist the complete records among `records` as batch `batch_number`.
    /// Nothing is written when none of them is complete.
    pub fn flush(
        &mut self,
        records: &[Record],
        batch_number: usize,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let complete: Vec<&Record> = records.iter().filter(|r| r.is_complete()).collect();
        if complete.len() < records.len() {
            warn!(
                "Batch {}: left out {} truncated posts",
                batch_number,
                records.len() - complete.len()
            );
        }
        if complete.is_empty() {
            return Ok(None);
        }

        let path = self
            .dir
            .join(format!("posts_partial_{}_batch_{}.csv", self.stamp, batch_number));
        let count = complete.len();
        write_records(&path, complete)?;
        info!("Saved batch {} ({} posts) to {}", batch_number, count, path.display());
        self.batches.push(path.clone());
        Ok(Some(path))
    }

    /// Delete this run's batch files. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        remove_batches(&std::mem::take(&mut self.batches))
    }
}

pub fn remove_batches(paths: &[PathBuf]) -> usize {
    paths
        .iter()
        .filter(|p| match fs::remove_file(p) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not delete {}: {}", p.display(), e);
                false
            }
        })
        .count()
}

/// Write records as UTF-8 CSV with a byte-order mark. The file is staged
/// next to its destination and renamed into place once synced.
pub fn write_records<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a Record>,
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("csv.tmp");

    let mut file = File::create(&staging)?;
    file.write_all(BOM)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(COLUMNS)?;
    for record in records {
        writer.serialize(Row::from(record))?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;
    Ok(())
}

pub fn read_records(path: &Path) -> Result<Vec<Record>, CheckpointError> {
    let bytes = fs::read(path)?;
    let body = bytes.strip_prefix(BOM).unwrap_or(&bytes);
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(body);

    let mut records = Vec::new();
    for row in reader.deserialize::<Row>() {
        records.push(row?.into_record(path)?);
    }
    Ok(records)
}

#[derive(Debug)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub files: usize,
    pub read: usize,
    pub records: Vec<Record>,
}

/// Concatenate batch files, de-duplicate, and write the result to `out`.
/// Missing or unreadable batches are skipped with a warning.
pub fn merge_all(batches: &[PathBuf], out: &Path) -> Result<MergeSummary, CheckpointError> {
    let mut all = Vec::new();
    let mut files = 0;
    for path in batches {
        match read_records(path) {
            Ok(mut records) => {
                files += 1;
                all.append(&mut records);
            }
            Err(e) => warn!("Skipping batch {}: {}", path.display(), e),
        }
    }

    let read = all.len();
    let records = dedupe(all);
    write_records(out, &records)?;
    info!(
        "Merged {} batches ({} rows, {} unique) into {}",
        files,
        read,
        records.len(),
        out.display()
    );

    Ok(MergeSummary {
        path: out.to_path_buf(),
        files,
        read,
        records,
    })
}
