// tablearchiver/src/storage/mod.rs
pub(crate) mod iam;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use s3::config::Region;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{CosCredentials, StorageConfig};
use crate::errors::{BackupError, Result};
use iam::{BearerTokenInterceptor, IamTokenProvider};

/// A part acknowledged by the store, needed to commit a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// Bucket-scoped object writes used by the uploader.
///
/// A multipart upload is invisible to readers until
/// `complete_multipart_upload` succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Verifies the bucket exists and the credentials can reach it.
    async fn check_bucket(&self, bucket: &str) -> Result<()>;

    /// Renews short-lived credentials if they are close to expiry.
    async fn refresh_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn check_bucket(&self, bucket: &str) -> Result<()> {
        (**self).check_bucket(bucket).await
    }

    async fn refresh_credentials(&self) -> Result<()> {
        (**self).refresh_credentials().await
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        (**self).put_object(bucket, key, body).await
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        (**self).create_multipart_upload(bucket, key).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        (**self)
            .upload_part(bucket, key, upload_id, part_number, body)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        (**self)
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        (**self).abort_multipart_upload(bucket, key, upload_id).await
    }
}

/// Cloud Object Storage session over the S3 API.
pub struct CosObjectStore {
    client: s3::Client,
    tokens: Option<Arc<IamTokenProvider>>,
}

impl CosObjectStore {
    pub async fn connect(storage_config: &StorageConfig) -> Result<Self> {
        info!(
            endpoint = %storage_config.endpoint_url,
            bucket = %storage_config.bucket_name,
            "Connecting to object storage"
        );

        // With IAM the SigV4 signature is replaced by a bearer token in an
        // interceptor, so the static keys here only satisfy the signer.
        let (access_key_id, secret_access_key) = match &storage_config.credentials {
            CosCredentials::Hmac {
                access_key_id,
                secret_access_key,
            } => (access_key_id.clone(), secret_access_key.expose().to_string()),
            CosCredentials::Iam { .. } => ("iam".to_string(), "iam".to_string()),
        };

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&storage_config.endpoint_url)
            .region(Region::new(storage_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                access_key_id,
                secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let mut builder = s3::config::Builder::from(&sdk_config).force_path_style(true);

        let tokens = match &storage_config.credentials {
            CosCredentials::Iam {
                api_key,
                service_instance_id,
                auth_endpoint,
            } => {
                let provider = Arc::new(IamTokenProvider::new(auth_endpoint, api_key.clone()));
                provider.refresh().await?;
                builder = builder.interceptor(BearerTokenInterceptor::new(
                    provider.clone(),
                    service_instance_id.clone(),
                ));
                Some(provider)
            }
            CosCredentials::Hmac { .. } => None,
        };

        Ok(CosObjectStore {
            client: s3::Client::from_conf(builder.build()),
            tokens,
        })
    }
}

#[async_trait]
impl ObjectStore for CosObjectStore {
    async fn check_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                BackupError::connection(
                    format!(
                        "Could not access bucket '{}': {}",
                        bucket,
                        DisplayErrorContext(&e)
                    ),
                    e,
                )
            })?;
        info!(bucket, "✓ Target bucket is accessible");
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<()> {
        match &self.tokens {
            Some(tokens) => tokens.refresh_if_expiring().await,
            None => Ok(()),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(key, format!("PutObject failed: {}", DisplayErrorContext(&e)), e)
            })?;
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(
                    key,
                    format!("CreateMultipartUpload failed: {}", DisplayErrorContext(&e)),
                    e,
                )
            })?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| BackupError::Upload {
                key: key.to_string(),
                message: "CreateMultipartUpload returned no upload id".to_string(),
                source: None,
            })?
            .to_string();
        debug!(key, upload_id = %upload_id, "Multipart upload started");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(
                    key,
                    format!("UploadPart {} failed: {}", part_number, DisplayErrorContext(&e)),
                    e,
                )
            })?;

        Ok(UploadedPart {
            part_number,
            e_tag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(part.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(
                    key,
                    format!("CompleteMultipartUpload failed: {}", DisplayErrorContext(&e)),
                    e,
                )
            })?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| {
                BackupError::upload(
                    key,
                    format!("AbortMultipartUpload failed: {}", DisplayErrorContext(&e)),
                    e,
                )
            })?;
        Ok(())
    }
}
