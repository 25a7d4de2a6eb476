pub(crate) mod db_export; // Server-side COPY of one day's rows
pub(crate) mod logic; // Day loop driving export, conversion and upload
pub(crate) mod parquet_convert; // Row extract to Parquet
pub(crate) mod s3_upload; // Single-shot and multipart uploads

use tracing::warn;

use crate::config::AppConfig;
use crate::errors::Result;
use crate::storage::{CosObjectStore, ObjectStore};
use db_export::{PgRowSource, RowSource};
use logic::{BackupOrchestrator, BackupSummary};

/// Public entry point for the backup process.
///
/// Opens the database session and the object store once, then hands both to
/// the orchestrator for the whole month. A storage failure here still closes
/// the database session before returning.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<BackupSummary> {
    let request = app_config.backup_request();

    let mut rows = PgRowSource::connect(&app_config.database).await?;

    let store = match connect_store(app_config, &request.bucket).await {
        Ok(store) => store,
        Err(e) => {
            if let Err(close_err) = rows.close().await {
                warn!(error = %close_err, "Database session did not close cleanly");
            }
            return Err(e);
        }
    };

    BackupOrchestrator::new(rows, store, app_config.transfer.clone())
        .run(&request)
        .await
}

async fn connect_store(app_config: &AppConfig, bucket: &str) -> Result<CosObjectStore> {
    let store = CosObjectStore::connect(&app_config.storage).await?;
    store.check_bucket(bucket).await?;
    Ok(store)
}
