//! Row extract to Parquet conversion
//!
//! Reads the delimited extract written by the exporter into Arrow record
//! batches with every column typed as text and writes a single Parquet file
//! next to the extract.

use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::errors::{BackupError, Result};
use crate::utils::calendar::ARTIFACT_EXTENSION;

/// Rows per Arrow batch while reading the extract.
const BATCH_SIZE: usize = 8192;

/// Outcome of a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub artifact_path: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

/// `2024-02-01.csv` becomes `2024-02-01.parquet` in the same directory.
pub fn artifact_path_for(extract_path: &Path) -> PathBuf {
    extract_path.with_extension(ARTIFACT_EXTENSION)
}

fn csv_format() -> Format {
    Format::default().with_header(true).with_delimiter(b',')
}

/// Every header column as nullable `Utf8`.
///
/// Cells are kept exactly as exported, so values like `00501` or `1.10`
/// read back unchanged. `text_column` must be one of the header columns.
fn text_schema(header: &Schema, text_column: &str) -> std::result::Result<Schema, String> {
    if header.fields().is_empty() {
        return Err("row extract has no header row".to_string());
    }
    if header.field_with_name(text_column).is_err() {
        return Err(format!(
            "column '{}' is not present in the row extract header",
            text_column
        ));
    }

    let fields: Vec<Field> = header
        .fields()
        .iter()
        .map(|field| Field::new(field.name(), DataType::Utf8, true))
        .collect();
    Ok(Schema::new(fields))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Converts the row extract at `extract_path` into a Parquet artifact.
///
/// All columns are stored as text. `text_column` is the identifier column
/// and must be present in the header. A header-only extract produces an
/// artifact with the header's columns and no rows.
pub fn convert_extract_to_parquet(extract_path: &Path, text_column: &str) -> Result<ConversionReport> {
    let conversion_err =
        |message: String, e: Box<dyn std::error::Error + Send + Sync>| BackupError::conversion(extract_path, message, e);

    let mut extract = File::open(extract_path)
        .map_err(|e| conversion_err("Failed to open row extract".to_string(), e.into()))?;

    // Only the header line is read here.
    let (header, _) = csv_format()
        .infer_schema(BufReader::new(&mut extract), Some(0))
        .map_err(|e| conversion_err("Row extract header is not valid delimited text".to_string(), e.into()))?;

    let schema: SchemaRef = Arc::new(text_schema(&header, text_column).map_err(|message| {
        BackupError::Conversion {
            path: extract_path.to_path_buf(),
            message,
            source: None,
        }
    })?);

    extract
        .seek(SeekFrom::Start(0))
        .map_err(|e| conversion_err("Failed to rewind row extract".to_string(), e.into()))?;

    let reader = ReaderBuilder::new(schema.clone())
        .with_format(csv_format())
        .with_batch_size(BATCH_SIZE)
        .build(extract)
        .map_err(|e| conversion_err("Failed to build row extract reader".to_string(), e.into()))?;

    let artifact_path = artifact_path_for(extract_path);
    let artifact = File::create(&artifact_path).map_err(|e| {
        conversion_err(
            format!("Failed to create artifact {}", artifact_path.display()),
            e.into(),
        )
    })?;
    let mut writer = ArrowWriter::try_new(artifact, schema.clone(), Some(writer_properties()))
        .map_err(|e| conversion_err("Failed to open Parquet writer".to_string(), e.into()))?;

    let mut rows = 0usize;
    for batch in reader {
        let batch =
            batch.map_err(|e| conversion_err(format!("Malformed row after row {}", rows), e.into()))?;
        rows += batch.num_rows();
        writer
            .write(&batch)
            .map_err(|e| conversion_err("Failed to write Parquet batch".to_string(), e.into()))?;
    }
    writer
        .close()
        .map_err(|e| conversion_err("Failed to finalize Parquet artifact".to_string(), e.into()))?;

    info!(
        extract = %extract_path.display(),
        artifact = %artifact_path.display(),
        rows,
        "Converted row extract to Parquet"
    );

    Ok(ConversionReport {
        artifact_path,
        rows,
        columns: schema.fields().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::record_batch::RecordBatch;
    use arrow::util::display::array_value_to_string;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn read_back(path: &Path) -> (SchemaRef, Vec<RecordBatch>) {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
        let schema = builder.schema().clone();
        let batches = builder.build().unwrap().collect::<std::result::Result<Vec<_>, _>>().unwrap();
        (schema, batches)
    }

    fn write_extract(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("2024-02-01.csv");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_artifact_path_is_derived_from_extract() {
        assert_eq!(
            artifact_path_for(Path::new("/data/2024-02-01.csv")),
            PathBuf::from("/data/2024-02-01.parquet")
        );
    }

    #[test]
    fn test_conversion_keeps_rows_and_pins_text_column() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(
            dir.path(),
            "id,service_id,event_date,label\n\
             1,00042,2024-02-01,\"alpha, beta\"\n\
             2,00107,2024-02-01,gamma\n\
             3,,2024-02-01,delta\n",
        );

        let report = convert_extract_to_parquet(&extract, "service_id").unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.columns, 4);
        assert_eq!(report.artifact_path, dir.path().join("2024-02-01.parquet"));

        let (schema, batches) = read_back(&report.artifact_path);
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["id", "service_id", "event_date", "label"]);
        assert_eq!(schema.field_with_name("service_id").unwrap().data_type(), &DataType::Utf8);

        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
        let batch = &batches[0];

        let service_ids = batch.column_by_name("service_id").unwrap().as_string::<i32>();
        assert_eq!(service_ids.value(0), "00042");
        assert_eq!(service_ids.value(1), "00107");
        assert!(service_ids.is_null(2));

        let ids = batch.column_by_name("id").unwrap().as_string::<i32>();
        assert_eq!(ids.value(0), "1");
        assert_eq!(ids.value(2), "3");

        let dates = batch.column_by_name("event_date").unwrap();
        assert_eq!(array_value_to_string(dates, 2).unwrap(), "2024-02-01");

        let labels = batch.column_by_name("label").unwrap();
        assert_eq!(array_value_to_string(labels, 0).unwrap(), "alpha, beta");
    }

    #[test]
    fn test_numeric_looking_identifier_stays_text() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(dir.path(), "service_id,value\n123,1\n456,2\n");

        let report = convert_extract_to_parquet(&extract, "service_id").unwrap();
        let (schema, batches) = read_back(&report.artifact_path);

        assert_eq!(schema.field_with_name("service_id").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(schema.field_with_name("value").unwrap().data_type(), &DataType::Utf8);
        let service_ids = batches[0].column(0).as_string::<i32>();
        assert_eq!(service_ids.value(0), "123");
        assert_eq!(service_ids.value(1), "456");
    }

    #[test]
    fn test_cells_in_other_columns_read_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(
            dir.path(),
            "service_id,zip,price,ratio\n1,00501,1.10,1e3\n2,02134,0.50,-0\n",
        );

        let report = convert_extract_to_parquet(&extract, "service_id").unwrap();
        let (schema, batches) = read_back(&report.artifact_path);
        assert!(schema.fields().iter().all(|f| f.data_type() == &DataType::Utf8));

        let batch = &batches[0];
        let zips = batch.column_by_name("zip").unwrap().as_string::<i32>();
        assert_eq!(zips.value(0), "00501");
        assert_eq!(zips.value(1), "02134");
        let prices = batch.column_by_name("price").unwrap().as_string::<i32>();
        assert_eq!(prices.value(0), "1.10");
        assert_eq!(prices.value(1), "0.50");
        let ratios = batch.column_by_name("ratio").unwrap().as_string::<i32>();
        assert_eq!(ratios.value(0), "1e3");
        assert_eq!(ratios.value(1), "-0");
    }

    #[test]
    fn test_header_only_extract_yields_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(dir.path(), "id,service_id,event_date\n");

        let report = convert_extract_to_parquet(&extract, "service_id").unwrap();
        assert_eq!(report.rows, 0);
        assert!(report.artifact_path.exists());

        let (schema, batches) = read_back(&report.artifact_path);
        assert_eq!(schema.fields().len(), 3);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 0);
    }

    #[test]
    fn test_ragged_rows_are_conversion_errors() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(dir.path(), "id,service_id\n1,2,3\n");

        let err = convert_extract_to_parquet(&extract, "service_id").unwrap_err();
        assert!(matches!(err, BackupError::Conversion { .. }));
    }

    #[test]
    fn test_missing_text_column_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(dir.path(), "id,name\n1,a\n");

        let err = convert_extract_to_parquet(&extract, "service_id").unwrap_err();
        assert!(matches!(err, BackupError::Conversion { .. }));
        assert!(err.to_string().contains("service_id"));
    }

    #[test]
    fn test_empty_file_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let extract = write_extract(dir.path(), "");
        assert!(convert_extract_to_parquet(&extract, "service_id").is_err());
    }

    #[test]
    fn test_missing_extract_is_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_extract_to_parquet(&dir.path().join("nope.csv"), "service_id").unwrap_err();
        assert!(matches!(err, BackupError::Conversion { .. }));
    }
}
