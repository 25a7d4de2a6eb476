// tablearchiver/src/config/mod.rs
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use url::Url;

use crate::backup::logic::BackupRequest;
use crate::errors::{BackupError, Result};
use crate::utils::calendar::Month;

const MIB: u64 = 1024 * 1024;
/// Smallest part the object store accepts, except for the final part.
pub const MIN_PART_SIZE: u64 = 5 * MIB;
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * MIB;
pub const DEFAULT_MULTIPART_CHUNKSIZE: u64 = 5 * MIB;
pub const DEFAULT_MAX_CONCURRENT_PARTS: usize = 10;
const DEFAULT_PARTITION_COLUMN: &str = "event_date";
const DEFAULT_TEXT_COLUMN: &str = "service_id";
const DEFAULT_REGION: &str = "us-standard";
const DEFAULT_LOG_FILE_NAME: &str = "tablearchiver.log";

/// Plain or schema-qualified SQL identifier. Names matching this are safe to
/// place into query text unquoted.
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
        .expect("identifier pattern is valid")
});

// Structs for deserializing the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<serde_json::Value>,
    pub db_name: Option<String>,
    pub db_table: Option<String>,
    pub partition_column: Option<String>,
    pub partition_column_type: Option<String>,
    pub text_column: Option<String>,

    pub cos_endpoint: Option<String>,
    pub cos_region: Option<String>,
    pub cos_bucket_name: Option<String>,
    pub cos_api_key_id: Option<String>,
    pub cos_auth_endpoint: Option<String>,
    pub cos_resource_crn: Option<String>,
    pub cos_access_key_id: Option<String>,
    pub cos_secret_access_key: Option<String>,

    pub local_path: Option<PathBuf>,
    pub month: Option<String>,
    pub year: Option<serde_json::Value>,
    pub key_prefix: Option<String>,
    pub cleanup_local_files: Option<bool>,
    pub log_file: Option<PathBuf>,

    pub multipart_threshold_bytes: Option<serde_json::Value>,
    pub multipart_chunk_bytes: Option<serde_json::Value>,
    pub max_concurrent_parts: Option<serde_json::Value>,
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// SQL type of the partition column, which decides how the bound date is
/// compared against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionColumnType {
    /// `date` or `timestamp`: the setting is cast with `::date`.
    #[default]
    Date,
    /// `text` or `varchar` holding `YYYY-MM-DD`: compared as text.
    Text,
}

impl FromStr for PartitionColumnType {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "date" | "timestamp" => Ok(PartitionColumnType::Date),
            "text" | "varchar" => Ok(PartitionColumnType::Text),
            other => Err(BackupError::config(format!(
                "partition_column_type must be one of date, timestamp, text, varchar; got '{}'",
                other
            ))),
        }
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: Secret,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub partition_column: String,
    pub partition_column_type: PartitionColumnType,
}

#[derive(Debug, Clone)]
pub enum CosCredentials {
    /// API key exchanged for a bearer token at the IAM endpoint.
    Iam {
        api_key: Secret,
        service_instance_id: String,
        auth_endpoint: String,
    },
    /// Static HMAC keys, signed with SigV4.
    Hmac {
        access_key_id: String,
        secret_access_key: Secret,
    },
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub credentials: CosCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Files larger than this are uploaded in parts.
    pub multipart_threshold: u64,
    pub multipart_chunksize: u64,
    pub max_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multipart_chunksize: DEFAULT_MULTIPART_CHUNKSIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENT_PARTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub local_path: PathBuf,
    pub month: Month,
    pub year: i32,
    pub key_prefix: String,
    pub text_column: String,
    pub cleanup_local_files: bool,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub job: JobConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| BackupError::Configuration {
            message: format!("Failed to read config file at {}", config_path.display()),
            source: Some(Box::new(e)),
        })?;
        let raw_json_config: RawJsonConfig =
            serde_json::from_str(&config_content).map_err(|e| BackupError::Configuration {
                message: format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                ),
                source: Some(Box::new(e)),
            })?;

        Self::from_raw(&raw_json_config)
    }

    pub fn from_raw(raw: &RawJsonConfig) -> Result<Self> {
        Ok(AppConfig {
            database: load_database_config(raw)?,
            storage: load_storage_config(raw)?,
            transfer: load_transfer_config(raw)?,
            job: load_job_config(raw)?,
        })
    }

    pub fn backup_request(&self) -> BackupRequest {
        BackupRequest {
            table: self.database.table.clone(),
            year: self.job.year,
            month: self.job.month,
            bucket: self.storage.bucket_name.clone(),
            local_path: self.job.local_path.clone(),
            key_prefix: self.job.key_prefix.clone(),
            text_column: self.job.text_column.clone(),
            cleanup_local_files: self.job.cleanup_local_files,
        }
    }
}

fn required_string(value: &Option<String>, key: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackupError::config(format!("{} must be set in the configuration file", key)))
}

fn optional_string(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Reads an integer that may be written either as a JSON number or a string.
fn integer_value(value: &Option<serde_json::Value>, key: &str) -> Result<Option<i64>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| BackupError::config(format!("{} must be an integer, got {}", key, n))),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| BackupError::config(format!("{} must be an integer, got '{}'", key, s))),
        Some(other) => Err(BackupError::config(format!(
            "{} must be an integer, got {}",
            key, other
        ))),
    }
}

fn validate_identifier(name: &str, key: &str) -> Result<String> {
    if IDENTIFIER.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(BackupError::config(format!(
            "{} '{}' is not a plain or schema-qualified identifier",
            key, name
        )))
    }
}

fn validate_url(value: String, key: &str) -> Result<String> {
    Url::parse(&value).map_err(|e| BackupError::Configuration {
        message: format!("{} is not a valid URL: {}", key, value),
        source: Some(Box::new(e)),
    })?;
    Ok(value)
}

fn load_database_config(raw: &RawJsonConfig) -> Result<DatabaseConfig> {
    let port = integer_value(&raw.db_port, "db_port")?
        .ok_or_else(|| BackupError::config("db_port must be set in the configuration file"))?;
    let port = u16::try_from(port)
        .map_err(|_| BackupError::config(format!("db_port {} is out of range", port)))?;

    let table = validate_identifier(&required_string(&raw.db_table, "db_table")?, "db_table")?;
    let partition_column = validate_identifier(
        &optional_string(&raw.partition_column).unwrap_or_else(|| DEFAULT_PARTITION_COLUMN.to_string()),
        "partition_column",
    )?;
    let partition_column_type = match optional_string(&raw.partition_column_type) {
        Some(value) => value.parse()?,
        None => PartitionColumnType::default(),
    };

    Ok(DatabaseConfig {
        user: required_string(&raw.db_user, "db_user")?,
        password: Secret::new(required_string(&raw.db_password, "db_password")?),
        host: required_string(&raw.db_host, "db_host")?,
        port,
        database: required_string(&raw.db_name, "db_name")?,
        table,
        partition_column,
        partition_column_type,
    })
}

fn load_storage_config(raw: &RawJsonConfig) -> Result<StorageConfig> {
    let endpoint_url = validate_url(required_string(&raw.cos_endpoint, "cos_endpoint")?, "cos_endpoint")?;

    let credentials = if raw.cos_api_key_id.is_some() {
        CosCredentials::Iam {
            api_key: Secret::new(required_string(&raw.cos_api_key_id, "cos_api_key_id")?),
            service_instance_id: required_string(&raw.cos_resource_crn, "cos_resource_crn")?,
            auth_endpoint: validate_url(
                required_string(&raw.cos_auth_endpoint, "cos_auth_endpoint")?,
                "cos_auth_endpoint",
            )?,
        }
    } else if raw.cos_access_key_id.is_some() {
        CosCredentials::Hmac {
            access_key_id: required_string(&raw.cos_access_key_id, "cos_access_key_id")?,
            secret_access_key: Secret::new(required_string(
                &raw.cos_secret_access_key,
                "cos_secret_access_key",
            )?),
        }
    } else {
        return Err(BackupError::config(
            "Object storage credentials are missing: set cos_api_key_id, cos_resource_crn and \
             cos_auth_endpoint, or cos_access_key_id and cos_secret_access_key",
        ));
    };

    Ok(StorageConfig {
        endpoint_url,
        region: optional_string(&raw.cos_region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        bucket_name: required_string(&raw.cos_bucket_name, "cos_bucket_name")?,
        credentials,
    })
}

fn load_transfer_config(raw: &RawJsonConfig) -> Result<TransferConfig> {
    let defaults = TransferConfig::default();

    let multipart_threshold = match integer_value(&raw.multipart_threshold_bytes, "multipart_threshold_bytes")? {
        Some(v) if v >= 1 => v as u64,
        Some(v) => {
            return Err(BackupError::config(format!(
                "multipart_threshold_bytes must be at least 1, got {}",
                v
            )));
        }
        None => defaults.multipart_threshold,
    };

    let multipart_chunksize = match integer_value(&raw.multipart_chunk_bytes, "multipart_chunk_bytes")? {
        Some(v) if v >= MIN_PART_SIZE as i64 => v as u64,
        Some(v) => {
            return Err(BackupError::config(format!(
                "multipart_chunk_bytes must be at least {} bytes, got {}",
                MIN_PART_SIZE, v
            )));
        }
        None => defaults.multipart_chunksize,
    };

    let max_concurrency = match integer_value(&raw.max_concurrent_parts, "max_concurrent_parts")? {
        Some(v) if v >= 1 => v as usize,
        Some(v) => {
            return Err(BackupError::config(format!(
                "max_concurrent_parts must be at least 1, got {}",
                v
            )));
        }
        None => defaults.max_concurrency,
    };

    Ok(TransferConfig {
        multipart_threshold,
        multipart_chunksize,
        max_concurrency,
    })
}

fn load_job_config(raw: &RawJsonConfig) -> Result<JobConfig> {
    let local_path = raw
        .local_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| BackupError::config("local_path must be set in the configuration file"))?;

    let month: Month = required_string(&raw.month, "month")?.parse()?;

    let year = integer_value(&raw.year, "year")?
        .ok_or_else(|| BackupError::config("year must be set in the configuration file"))?;
    if year <= 0 || year > 9999 {
        return Err(BackupError::config(format!(
            "year must be a positive four-digit year, got {}",
            year
        )));
    }

    let text_column = validate_identifier(
        &optional_string(&raw.text_column).unwrap_or_else(|| DEFAULT_TEXT_COLUMN.to_string()),
        "text_column",
    )?;

    let log_file = raw
        .log_file
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| local_path.join(DEFAULT_LOG_FILE_NAME));

    Ok(JobConfig {
        local_path,
        month,
        year: year as i32,
        key_prefix: optional_string(&raw.key_prefix).unwrap_or_default(),
        text_column,
        cleanup_local_files: raw.cleanup_local_files.unwrap_or(false),
        log_file,
    })
}
