// tablearchiver/src/backup/logic.rs
use std::path::{Path, PathBuf};
use tracing::{Instrument, error, info, info_span, warn};

use super::db_export::RowSource;
use super::parquet_convert::{ConversionReport, convert_extract_to_parquet};
use super::s3_upload::upload_file;
use crate::config::TransferConfig;
use crate::errors::{BackupError, Result};
use crate::storage::ObjectStore;
use crate::utils::calendar::{self, DayPartition, Month};

/// What to back up and where to put it.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub table: String,
    pub year: i32,
    pub month: Month,
    pub bucket: String,
    pub local_path: PathBuf,
    pub key_prefix: String,
    pub text_column: String,
    pub cleanup_local_files: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub days_processed: u32,
    pub bytes_exported: u64,
    pub rows_converted: usize,
    pub bytes_uploaded: u64,
    pub keys: Vec<String>,
}

/// Drives the export, convert and upload steps for every day of a month.
///
/// Owns the database session and the object store for the whole run. Days run
/// strictly one after another and the first failure ends the run. The
/// database session is closed on every exit path.
pub struct BackupOrchestrator<R, S> {
    rows: R,
    store: S,
    transfer: TransferConfig,
}

impl<R, S> BackupOrchestrator<R, S>
where
    R: RowSource,
    S: ObjectStore,
{
    pub fn new(rows: R, store: S, transfer: TransferConfig) -> Self {
        Self {
            rows,
            store,
            transfer,
        }
    }

    pub async fn run(mut self, request: &BackupRequest) -> Result<BackupSummary> {
        info!(
            table = %request.table,
            month = %request.month,
            year = request.year,
            bucket = %request.bucket,
            "=====Starting Process====="
        );

        let outcome = self.process_month(request).await;
        let closed = self.rows.close().await;

        match (outcome, closed) {
            (Ok(summary), Ok(())) => {
                info!(days = summary.days_processed, "=====Finishing Process=====");
                Ok(summary)
            }
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), closed) => {
                error!(kind = e.kind(), error = %e, "Run aborted, remaining days skipped");
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "Database session did not close cleanly after failure");
                }
                Err(e)
            }
        }
    }

    async fn process_month(&mut self, request: &BackupRequest) -> Result<BackupSummary> {
        let day_count = calendar::resolve(request.month.mnemonic(), request.year)?;
        info!(month = %request.month, year = request.year, days = day_count, "Resolved month");

        tokio::fs::create_dir_all(&request.local_path)
            .await
            .map_err(|e| BackupError::Configuration {
                message: format!(
                    "Failed to create local working directory {}",
                    request.local_path.display()
                ),
                source: Some(Box::new(e)),
            })?;

        let mut summary = BackupSummary::default();
        for day in 1..=day_count {
            let partition = DayPartition::new(request.year, request.month, day)?;
            let span = info_span!("day", date = %partition.partition_date());
            self.process_day(request, &partition, &mut summary)
                .instrument(span)
                .await?;
        }
        Ok(summary)
    }

    async fn process_day(
        &mut self,
        request: &BackupRequest,
        partition: &DayPartition,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let extract_path = request.local_path.join(partition.extract_filename());
        let key = partition.object_key(&request.key_prefix);
        println!("{}", partition.extract_filename());

        let exported = self
            .rows
            .export_day(partition, &extract_path)
            .await
            .inspect_err(|e| error!(stage = "export", error = %e, "Day failed"))?;

        let report = convert_in_background(&extract_path, &request.text_column)
            .await
            .inspect_err(|e| error!(stage = "convert", error = %e, "Day failed"))?;

        let uploaded = upload_file(
            &self.store,
            &self.transfer,
            &request.bucket,
            &key,
            &report.artifact_path,
        )
        .await
        .inspect_err(|e| error!(stage = "upload", error = %e, "Day failed"))?;

        if request.cleanup_local_files {
            remove_local(&extract_path).await;
            remove_local(&report.artifact_path).await;
        }

        info!(
            key = %key,
            rows = report.rows,
            columns = report.columns,
            bytes = uploaded.bytes,
            parts = uploaded.parts,
            multipart = uploaded.multipart,
            "=====File is uploaded====="
        );
        summary.days_processed += 1;
        summary.bytes_exported += exported;
        summary.rows_converted += report.rows;
        summary.bytes_uploaded += uploaded.bytes;
        summary.keys.push(key);
        Ok(())
    }
}

/// Runs the CPU-bound conversion off the async worker threads.
async fn convert_in_background(extract_path: &Path, text_column: &str) -> Result<ConversionReport> {
    let path = extract_path.to_path_buf();
    let column = text_column.to_string();
    tokio::task::spawn_blocking(move || convert_extract_to_parquet(&path, &column))
        .await
        .map_err(|e| BackupError::conversion(extract_path, "Conversion task did not finish", e))?
}

async fn remove_local(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove local file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryObjectStore;
    use arrow::util::display::array_value_to_string;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Writes two rows per day, or fails on `fail_on`.
    struct FakeRowSource {
        fail_on: Option<NaiveDate>,
        closed: Arc<AtomicBool>,
    }

    impl FakeRowSource {
        fn new(fail_on: Option<NaiveDate>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                FakeRowSource {
                    fail_on,
                    closed: closed.clone(),
                },
                closed,
            )
        }
    }

    #[async_trait]
    impl RowSource for FakeRowSource {
        async fn export_day(&mut self, partition: &DayPartition, destination: &Path) -> Result<u64> {
            if self.fail_on == Some(partition.date()) {
                return Err(BackupError::export(
                    partition.date(),
                    "COPY TO STDOUT failed to start",
                    "connection reset by peer",
                ));
            }
            let date = partition.partition_date();
            let body = format!(
                "id,service_id,event_date\n{day}1,000{day},{date}\n{day}2,010{day},{date}\n",
                day = partition.day_number(),
                date = date
            );
            tokio::fs::write(destination, &body).await.unwrap();
            Ok(body.len() as u64)
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request(dir: &Path, month: Month, year: i32) -> BackupRequest {
        BackupRequest {
            table: "events".to_string(),
            year,
            month,
            bucket: "archive".to_string(),
            local_path: dir.to_path_buf(),
            key_prefix: String::new(),
            text_column: "service_id".to_string(),
            cleanup_local_files: false,
        }
    }

    #[tokio::test]
    async fn test_leap_february_produces_one_object_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let (rows, closed) = FakeRowSource::new(None);
        let store = Arc::new(InMemoryObjectStore::new());
        let orchestrator = BackupOrchestrator::new(rows, store.clone(), TransferConfig::default());

        let summary = orchestrator
            .run(&request(dir.path(), Month::Feb, 2024))
            .await
            .unwrap();

        assert_eq!(summary.days_processed, 29);
        assert_eq!(summary.rows_converted, 58);
        assert!(closed.load(Ordering::SeqCst));

        let keys = store.keys();
        assert_eq!(keys.len(), 29);
        assert_eq!(keys.first().unwrap(), "2024/02/2024-02-01.parquet");
        assert_eq!(keys.last().unwrap(), "2024/02/2024-02-29.parquet");
        assert_eq!(summary.keys, keys);

        for day in 1..=29u32 {
            let date = format!("2024-02-{:02}", day);
            let object = store.object(&format!("2024/02/{}.parquet", date)).unwrap();
            let batches = ParquetRecordBatchReaderBuilder::try_new(object)
                .unwrap()
                .build()
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap();
            let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
            assert_eq!(rows, 2, "{date}");
            for batch in &batches {
                let dates = batch.column_by_name("event_date").unwrap();
                for i in 0..batch.num_rows() {
                    assert_eq!(array_value_to_string(dates, i).unwrap(), date);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_failure_stops_the_run_and_closes_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let fail_on = NaiveDate::from_ymd_opt(2023, 4, 15).unwrap();
        let (rows, closed) = FakeRowSource::new(Some(fail_on));
        let store = Arc::new(InMemoryObjectStore::new());
        let orchestrator = BackupOrchestrator::new(rows, store.clone(), TransferConfig::default());

        let err = orchestrator
            .run(&request(dir.path(), Month::Apr, 2023))
            .await
            .unwrap_err();

        match err {
            BackupError::Export { date, .. } => assert_eq!(date, fail_on),
            other => panic!("expected export error, got {other:?}"),
        }
        assert!(closed.load(Ordering::SeqCst));

        let keys = store.keys();
        assert_eq!(keys.len(), 14);
        assert_eq!(keys.last().unwrap(), "2023/04/2023-04-14.parquet");
        assert!(store.object("2023/04/2023-04-15.parquet").is_none());
        assert!(!dir.path().join("2023-04-16.csv").exists());
    }

    #[tokio::test]
    async fn test_conversion_failure_is_fatal() {
        struct BrokenRows;

        #[async_trait]
        impl RowSource for BrokenRows {
            async fn export_day(&mut self, _partition: &DayPartition, destination: &Path) -> Result<u64> {
                tokio::fs::write(destination, "id,other\n1,2\n").await.unwrap();
                Ok(13)
            }

            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let err = BackupOrchestrator::new(BrokenRows, store.clone(), TransferConfig::default())
            .run(&request(dir.path(), Month::Jan, 2024))
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Conversion { .. }));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        let (rows, _closed) = FakeRowSource::new(None);
        let store = Arc::new(InMemoryObjectStore::new());
        let mut req = request(dir.path(), Month::Nov, 2023);
        req.cleanup_local_files = true;
        req.key_prefix = "events".to_string();

        let summary = BackupOrchestrator::new(rows, store.clone(), TransferConfig::default())
            .run(&req)
            .await
            .unwrap();

        assert_eq!(summary.days_processed, 30);
        assert_eq!(store.keys()[0], "events/2023/11/2023-11-01.parquet");
        assert!(!dir.path().join("2023-11-01.csv").exists());
        assert!(!dir.path().join("2023-11-01.parquet").exists());
    }

    #[tokio::test]
    async fn test_intermediate_files_kept_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (rows, _closed) = FakeRowSource::new(None);
        let store = Arc::new(InMemoryObjectStore::new());

        BackupOrchestrator::new(rows, store, TransferConfig::default())
            .run(&request(dir.path(), Month::Feb, 2023))
            .await
            .unwrap();

        assert!(dir.path().join("2023-02-28.csv").exists());
        assert!(dir.path().join("2023-02-28.parquet").exists());
        assert!(!dir.path().join("2023-02-29.csv").exists());
    }
}
