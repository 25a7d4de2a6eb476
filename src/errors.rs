use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure kinds of a backup run.
///
/// `Configuration` and `Connection` stop the run before any day is processed.
/// The per-day kinds carry the partition, file or key they failed on and are
/// just as fatal: the run never moves on to the next day after one of them.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Export failed for partition {date}: {message}")]
    Export {
        date: NaiveDate,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Conversion failed for {}: {message}", path.display())]
    Conversion {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Upload failed for key {key}: {message}")]
    Upload {
        key: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl BackupError {
    pub fn config(message: impl Into<String>) -> Self {
        BackupError::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn connection(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackupError::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn export(date: NaiveDate, message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackupError::Export {
            date,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn conversion(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        BackupError::Conversion {
            path: path.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn upload(key: impl Into<String>, message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackupError::Upload {
            key: key.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Configuration { .. } => "configuration",
            BackupError::Connection { .. } => "connection",
            BackupError::Export { .. } => "export",
            BackupError::Conversion { .. } => "conversion",
            BackupError::Upload { .. } => "upload",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
