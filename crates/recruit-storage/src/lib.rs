//! Store contracts, Postgres + in-memory backends, calendar-sync notifier and
//! run report persistence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use recruit_core::{
    BackfillScope, HistoryKey, ParticipantCategory, ParticipantRef, ParticipationHistoryRecord,
    RecruitmentRecord, SchedulingStateRow,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod calendar;
mod memory;
mod postgres;

pub use calendar::{
    classify_reqwest_error, classify_status, BackoffPolicy, CalendarClientConfig,
    HttpCalendarNotifier, NoopCalendarNotifier, RetryDisposition,
};
pub use memory::{MemoryCalendarNotifier, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "recruit-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid row in {table}: {message}")]
    InvalidRow {
        table: &'static str,
        message: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("calendar sync request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("calendar sync returned http status {status} for recruitment {recruitment_id}")]
    HttpStatus { status: u16, recruitment_id: Uuid },
    #[error("calendar sync rejected: {0}")]
    Rejected(String),
}

/// Read/write access to recruitments and the lookups around them.
#[async_trait]
pub trait RecruitmentStore: Send + Sync {
    async fn load_all_recruitment_records(&self) -> Result<Vec<RecruitmentRecord>, StoreError>;

    async fn load_scheduling_states(&self) -> Result<Vec<SchedulingStateRow>, StoreError>;

    /// Compare-and-swap on the state column. Returns `false` when the row no
    /// longer holds `expected_state`.
    async fn update_recruitment_state(
        &self,
        id: Uuid,
        expected_state: Uuid,
        new_state: Uuid,
    ) -> Result<bool, StoreError>;

    async fn load_investigation_names(&self) -> Result<HashMap<Uuid, String>, StoreError>;

    async fn find_participant_name(
        &self,
        participant: ParticipantRef,
    ) -> Result<Option<String>, StoreError>;

    async fn load_participant_names(
        &self,
        category: ParticipantCategory,
    ) -> Result<HashMap<Uuid, String>, StoreError>;
}

/// Per-category participation history tables.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn find_existing_history(
        &self,
        category: ParticipantCategory,
        key: &HistoryKey,
    ) -> Result<bool, StoreError>;

    async fn load_history_keys(&self, scope: &BackfillScope)
        -> Result<HashSet<HistoryKey>, StoreError>;

    async fn insert_history_records(
        &self,
        category: ParticipantCategory,
        records: &[ParticipationHistoryRecord],
    ) -> Result<usize, StoreError>;

    async fn delete_all_history(&self, scope: &BackfillScope) -> Result<usize, StoreError>;

    /// Deletes the scope's rows and inserts `records` as one unit. On error
    /// the scope is left as it was.
    async fn replace_history(
        &self,
        scope: &BackfillScope,
        records: &[ParticipationHistoryRecord],
    ) -> Result<HistoryReplacement, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryReplacement {
    pub deleted: usize,
    pub inserted: usize,
}

#[async_trait]
pub trait CalendarNotifier: Send + Sync {
    async fn notify_calendar_sync(&self, recruitment_id: Uuid) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredReport {
    pub name: String,
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ReportManifest<'a> {
    schema_version: u32,
    run_id: Uuid,
    files: &'a [StoredReport],
}

/// Writes per-run JSON reports under `<root>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Serializes `value` to `<name>.json` and records it in the run manifest.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        name: &str,
        value: &T,
    ) -> anyhow::Result<StoredReport> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing report {name}"))?;
        let relative_path = PathBuf::from(run_id.to_string()).join(format!("{name}.json"));
        let absolute_path = self.root.join(&relative_path);
        write_atomically(&absolute_path, &bytes).await?;

        let report = StoredReport {
            name: name.to_string(),
            sha256: Self::sha256_hex(&bytes),
            relative_path,
            absolute_path,
            bytes: bytes.len(),
        };

        let manifest = ReportManifest {
            schema_version: 1,
            run_id,
            files: std::slice::from_ref(&report),
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        let manifest_path = self.root.join(run_id.to_string()).join("manifest.json");
        write_atomically(&manifest_path, &manifest_bytes).await?;

        Ok(report)
    }
}

/// Temp file in the target directory, then rename over the destination.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("report path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating report directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp report {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn report_hashing_is_stable() {
        let hash = ReportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn json_reports_land_under_run_directory_with_manifest() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let report = store
            .write_json(run_id, "reconciliation", &serde_json::json!({"updated": 3}))
            .await
            .expect("write report");

        assert_eq!(
            report.relative_path,
            PathBuf::from(run_id.to_string()).join("reconciliation.json")
        );
        let body = std::fs::read(&report.absolute_path).expect("read report");
        assert_eq!(ReportStore::sha256_hex(&body), report.sha256);

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join(run_id.to_string()).join("manifest.json"))
                .expect("read manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest["files"][0]["sha256"], report.sha256.as_str());

        let leftovers = std::fs::read_dir(dir.path().join(run_id.to_string()))
            .expect("list run dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
