// In-memory object store for tests. Records every call so tests can assert
// which upload path was taken.
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ObjectStore, UploadedPart};
use crate::errors::{BackupError, Result};

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    pending: Mutex<HashMap<String, (String, BTreeMap<i32, Bytes>)>>,
    next_upload: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub part_calls: AtomicUsize,
    pub aborted: Mutex<Vec<String>>,
    /// Part number whose upload is rejected.
    pub fail_part: Option<i32>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_part(part_number: i32) -> Self {
        Self {
            fail_part: Some(part_number),
            ..Self::default()
        }
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn check_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_object(&self, _bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn create_multipart_upload(&self, _bucket: &str, key: &str) -> Result<String> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.pending
            .lock()
            .unwrap()
            .insert(id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        self.part_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_part == Some(part_number) {
            return Err(BackupError::upload(key, format!("part {} rejected", part_number), "injected failure"));
        }
        let mut pending = self.pending.lock().unwrap();
        let (_, parts) = pending
            .get_mut(upload_id)
            .ok_or_else(|| BackupError::upload(key, "unknown upload id", upload_id.to_string()))?;
        parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            e_tag: format!("etag-{}", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let (pending_key, stored) = self
            .pending
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| BackupError::upload(key, "unknown upload id", upload_id.to_string()))?;
        assert_eq!(pending_key, key);

        let mut assembled = BytesMut::new();
        for part in &parts {
            let body = stored
                .get(&part.part_number)
                .ok_or_else(|| BackupError::upload(key, "missing part", part.e_tag.clone()))?;
            assembled.extend_from_slice(body);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), assembled.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.pending.lock().unwrap().remove(upload_id);
        self.aborted.lock().unwrap().push(key.to_string());
        Ok(())
    }
}
