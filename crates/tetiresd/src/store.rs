//! JSON-lines result store

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tetires_core::TireScanResult;
use tetires_session::{CheckSummary, PersistenceBackend, PersistenceError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// One line of the results file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Position {
        check_id: i64,
        result: TireScanResult,
        saved_at: DateTime<Utc>,
    },
    Summary {
        summary: CheckSummary,
        saved_at: DateTime<Utc>,
    },
}

/// Appends one JSON object per saved position and per check summary
pub struct JsonLinesStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &StoredRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(record).map_err(storage)?;
        line.push('\n');

        let _guard = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage)?;
        file.write_all(line.as_bytes()).await.map_err(storage)?;
        file.flush().await.map_err(storage)?;
        Ok(())
    }

    /// Every record in the file, oldest first
    pub async fn read_all(&self) -> Result<Vec<StoredRecord>, PersistenceError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage(e)),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(storage))
            .collect()
    }
}

fn storage(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Storage(e.to_string())
}

#[async_trait]
impl PersistenceBackend for JsonLinesStore {
    async fn save_position(
        &self,
        check_id: i64,
        result: TireScanResult,
    ) -> Result<(), PersistenceError> {
        debug!(check_id, position = %result.position, "Saving result");
        self.append(&StoredRecord::Position {
            check_id,
            result,
            saved_at: Utc::now(),
        })
        .await
    }

    async fn finalize_check(&self, summary: CheckSummary) -> Result<(), PersistenceError> {
        debug!(check_id = summary.check_id, "Saving check summary");
        self.append(&StoredRecord::Summary {
            summary,
            saved_at: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tetires_core::TirePosition;

    fn result(position: TirePosition, worn: bool) -> TireScanResult {
        TireScanResult {
            position,
            grooves: [1.2, 1.5, 1.4, 1.6],
            adc_mean: 2101.0,
            adc_std: 9.5,
            voltage_mv: 1693.0,
            thickness_mm: 1.4,
            is_worn: worn,
            sample_count: 1110,
        }
    }

    #[tokio::test]
    async fn test_records_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("results.jsonl"));
        assert!(store.read_all().await.unwrap().is_empty());

        store
            .save_position(42, result(TirePosition::FrontRight, true))
            .await
            .unwrap();
        store
            .finalize_check(CheckSummary {
                bus_id: 7,
                check_id: 42,
                worn: [(TirePosition::FrontRight, true)].into_iter().collect(),
            })
            .await
            .unwrap();

        let records = store.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            StoredRecord::Position {
                check_id, result, ..
            } => {
                assert_eq!(*check_id, 42);
                assert_eq!(result.position, TirePosition::FrontRight);
                assert!(result.is_worn);
            }
            other => panic!("unexpected record {:?}", other),
        }
        match &records[1] {
            StoredRecord::Summary { summary, .. } => {
                assert_eq!(summary.status(TirePosition::FrontRight), Some(true));
                assert_eq!(summary.status(TirePosition::RearLeft), None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unwritable_path_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("missing").join("results.jsonl"));
        let err = store
            .save_position(1, result(TirePosition::RearLeft, false))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Storage(_)));
    }
}
