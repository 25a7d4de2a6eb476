// tablearchiver/src/backup/s3_upload.rs
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::errors::{BackupError, Result};
use crate::storage::{ObjectStore, UploadedPart};

/// Upper bound on parts in one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: u64,
    pub parts: usize,
    pub multipart: bool,
}

/// Part size for a file of `size` bytes, grown past `chunk_size` when the
/// file would otherwise need more than [`MAX_PARTS`] parts.
pub fn effective_part_size(size: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);
    chunk_size.max(size.div_ceil(MAX_PARTS))
}

pub fn part_ranges(size: u64, part_size: u64) -> Vec<PartRange> {
    (0..size.div_ceil(part_size))
        .map(|index| {
            let offset = index * part_size;
            PartRange {
                offset,
                len: part_size.min(size - offset),
            }
        })
        .collect()
}

async fn read_range(local_path: &Path, range: PartRange) -> std::io::Result<Bytes> {
    let mut file = File::open(local_path).await?;
    file.seek(SeekFrom::Start(range.offset)).await?;
    let mut buffer = vec![0u8; range.len as usize];
    file.read_exact(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

/// Uploads `local_path` to `bucket`/`key` and returns once the object is
/// committed.
///
/// Files up to `multipart_threshold` bytes go up in a single request. Larger
/// files are split into parts that are uploaded concurrently, at most
/// `max_concurrency` at a time, and assembled by the store. If any part fails
/// the multipart upload is aborted, so a partial object is never visible.
/// Credentials are refreshed before every request, so short-lived tokens
/// cannot expire part way through a long upload.
/// The part futures are driven inside this call and are all dropped by the
/// time it returns.
pub async fn upload_file<S>(
    store: &S,
    transfer: &TransferConfig,
    bucket: &str,
    key: &str,
    local_path: &Path,
) -> Result<UploadReport>
where
    S: ObjectStore + ?Sized,
{
    let size = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| {
            BackupError::upload(
                key,
                format!("Failed to stat upload source {}", local_path.display()),
                e,
            )
        })?
        .len();

    println!("Starting file upload for {} to bucket: {}", key, bucket);

    if size <= transfer.multipart_threshold {
        let body = tokio::fs::read(local_path).await.map_err(|e| {
            BackupError::upload(
                key,
                format!("Failed to read upload source {}", local_path.display()),
                e,
            )
        })?;
        store.refresh_credentials().await?;
        store.put_object(bucket, key, Bytes::from(body)).await?;
        info!(key, bytes = size, "✅ Uploaded in a single request");
        return Ok(UploadReport {
            bytes: size,
            parts: 1,
            multipart: false,
        });
    }

    let part_size = effective_part_size(size, transfer.multipart_chunksize);
    let ranges = part_ranges(size, part_size);
    store.refresh_credentials().await?;
    let upload_id = store.create_multipart_upload(bucket, key).await?;
    info!(
        key,
        bytes = size,
        parts = ranges.len(),
        part_size,
        "Starting multipart upload"
    );

    let committed: Result<()> = async {
        let parts = upload_parts(store, transfer, bucket, key, &upload_id, local_path, &ranges).await?;
        store.refresh_credentials().await?;
        store
            .complete_multipart_upload(bucket, key, &upload_id, parts)
            .await
    }
    .await;

    if let Err(e) = committed {
        warn!(key, upload_id = %upload_id, error = %e, "Aborting multipart upload");
        if let Err(abort_err) = store.abort_multipart_upload(bucket, key, &upload_id).await {
            warn!(key, upload_id = %upload_id, error = %abort_err, "Abort of multipart upload failed");
        }
        return Err(e);
    }

    info!(key, bytes = size, parts = ranges.len(), "✅ Multipart upload complete");
    Ok(UploadReport {
        bytes: size,
        parts: ranges.len(),
        multipart: true,
    })
}

async fn upload_parts<S>(
    store: &S,
    transfer: &TransferConfig,
    bucket: &str,
    key: &str,
    upload_id: &str,
    local_path: &Path,
    ranges: &[PartRange],
) -> Result<Vec<UploadedPart>>
where
    S: ObjectStore + ?Sized,
{
    let mut parts: Vec<UploadedPart> = stream::iter(ranges.iter().copied().enumerate())
        .map(|(index, range)| async move {
            let part_number = (index + 1) as i32;
            let body = read_range(local_path, range).await.map_err(|e| {
                BackupError::upload(
                    key,
                    format!(
                        "Failed to read part {} of {}",
                        part_number,
                        local_path.display()
                    ),
                    e,
                )
            })?;
            store.refresh_credentials().await?;
            let part = store
                .upload_part(bucket, key, upload_id, part_number, body)
                .await?;
            debug!(key, part_number, bytes = range.len, "Part uploaded");
            Ok::<_, BackupError>(part)
        })
        .buffer_unordered(transfer.max_concurrency.max(1))
        .try_collect()
        .await?;

    parts.sort_by_key(|part| part.part_number);
    Ok(parts)
}
