// tablearchiver/src/backup/db_export.rs
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, PartitionColumnType};
use crate::errors::{BackupError, Result};
use crate::utils::calendar::DayPartition;

/// Session setting that carries the partition date into the COPY query.
pub const PARTITION_SETTING: &str = "tablearchiver.partition_date";

/// Source of one day's rows as a delimited extract with a header line.
#[async_trait]
pub trait RowSource: Send {
    /// Writes every row of `partition` to `destination`, replacing any
    /// existing file, and returns the number of bytes written. On error the
    /// destination may be partially written and must not be used.
    async fn export_day(&mut self, partition: &DayPartition, destination: &Path) -> Result<u64>;

    /// Releases the underlying connection. Later exports fail.
    async fn close(&mut self) -> Result<()>;
}

/// `COPY` statement streaming one partition of `table` as CSV with a header.
///
/// `table` and `partition_column` are validated identifiers. The date itself
/// is read from [`PARTITION_SETTING`], which is set through a bound parameter.
/// A text partition column is compared against the `YYYY-MM-DD` string as is.
pub fn build_copy_statement(
    table: &str,
    partition_column: &str,
    column_type: PartitionColumnType,
) -> String {
    let cast = match column_type {
        PartitionColumnType::Date => "::date",
        PartitionColumnType::Text => "",
    };
    format!(
        "COPY (SELECT * FROM {} WHERE {} = current_setting('{}'){}) \
         TO STDOUT WITH (FORMAT csv, DELIMITER ',', HEADER true)",
        table, partition_column, PARTITION_SETTING, cast
    )
}

/// Server-side COPY export over a single Postgres connection.
pub struct PgRowSource {
    conn: Option<PgConnection>,
    copy_statement: String,
}

impl PgRowSource {
    pub async fn connect(db_config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&db_config.host)
            .port(db_config.port)
            .username(&db_config.user)
            .password(db_config.password.expose())
            .database(&db_config.database);

        let conn = PgConnection::connect_with(&options).await.map_err(|e| {
            BackupError::connection(
                format!(
                    "Failed to connect to database {} on {}:{}",
                    db_config.database, db_config.host, db_config.port
                ),
                e,
            )
        })?;
        info!(
            database = %db_config.database,
            host = %db_config.host,
            "Database connection successful"
        );

        Ok(PgRowSource {
            conn: Some(conn),
            copy_statement: build_copy_statement(
                &db_config.table,
                &db_config.partition_column,
                db_config.partition_column_type,
            ),
        })
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn export_day(&mut self, partition: &DayPartition, destination: &Path) -> Result<u64> {
        let date = partition.date();
        let conn = self.conn.as_mut().ok_or_else(|| BackupError::Export {
            date,
            message: "database session is already closed".to_string(),
            source: None,
        })?;

        sqlx::query("SELECT set_config($1, $2, false)")
            .bind(PARTITION_SETTING)
            .bind(partition.partition_date())
            .execute(&mut *conn)
            .await
            .map_err(|e| BackupError::export(date, "Failed to bind partition date", e))?;

        let mut file = File::create(destination).await.map_err(|e| {
            BackupError::export(
                date,
                format!("Failed to create row extract {}", destination.display()),
                e,
            )
        })?;

        debug!(statement = %self.copy_statement, "Starting COPY");
        let mut stream = conn
            .copy_out_raw(&self.copy_statement)
            .await
            .map_err(|e| BackupError::export(date, "COPY TO STDOUT failed to start", e))?;

        let mut written = 0u64;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| BackupError::export(date, "COPY TO STDOUT failed mid-stream", e))?
        {
            file.write_all(&chunk).await.map_err(|e| {
                BackupError::export(
                    date,
                    format!("Failed to write row extract {}", destination.display()),
                    e,
                )
            })?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| {
            BackupError::export(
                date,
                format!("Failed to flush row extract {}", destination.display()),
                e,
            )
        })?;

        info!(
            date = %date,
            extract = %destination.display(),
            bytes = written,
            "Exported partition"
        );
        Ok(written)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| BackupError::connection("Failed to close database connection", e))?;
            info!("Database connection closed");
        }
        Ok(())
    }
}
