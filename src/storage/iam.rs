// tablearchiver/src/storage/iam.rs
use aws_sdk_s3::config::interceptors::BeforeTransmitInterceptorContextMut;
use aws_sdk_s3::config::{ConfigBag, Intercept, RuntimeComponents};
use aws_sdk_s3::error::BoxError;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Secret;
use crate::errors::{BackupError, Result};

const API_KEY_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";
/// Tokens are renewed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

/// Exchanges an API key for bearer tokens at the IAM endpoint and caches them.
#[derive(Debug)]
pub struct IamTokenProvider {
    http: reqwest::Client,
    auth_endpoint: String,
    api_key: Secret,
    current: RwLock<Option<CachedToken>>,
}

impl IamTokenProvider {
    pub fn new(auth_endpoint: &str, api_key: Secret) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_endpoint: auth_endpoint.to_string(),
            api_key,
            current: RwLock::new(None),
        }
    }

    /// Fetches a new token unconditionally.
    pub async fn refresh(&self) -> Result<()> {
        let response = self
            .http
            .post(&self.auth_endpoint)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", API_KEY_GRANT_TYPE),
                ("apikey", self.api_key.expose()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                BackupError::connection(
                    format!("IAM token request to {} failed", self.auth_endpoint),
                    e,
                )
            })?;

        let token: TokenResponse = response.json().await.map_err(|e| {
            BackupError::connection("IAM token response could not be decoded", e)
        })?;

        let cached = CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        };
        self.store(cached);
        info!(expires_in_secs = token.expires_in, "Obtained IAM bearer token");
        Ok(())
    }

    pub async fn refresh_if_expiring(&self) -> Result<()> {
        let fresh = self
            .read()
            .map(|token| token.is_fresh(Instant::now()))
            .unwrap_or(false);
        if fresh {
            return Ok(());
        }
        debug!("IAM token close to expiry, refreshing");
        self.refresh().await
    }

    /// Current token value, if one has been fetched.
    pub fn bearer(&self) -> Option<String> {
        self.read().map(|token| token.value)
    }

    fn read(&self) -> Option<CachedToken> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, token: CachedToken) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }
}

/// Replaces the request signature with the IAM bearer token.
///
/// Runs after signing, so the `Authorization` header written by SigV4 is
/// overwritten.
#[derive(Debug)]
pub struct BearerTokenInterceptor {
    tokens: Arc<IamTokenProvider>,
    service_instance_id: String,
}

impl BearerTokenInterceptor {
    pub fn new(tokens: Arc<IamTokenProvider>, service_instance_id: String) -> Self {
        Self {
            tokens,
            service_instance_id,
        }
    }
}

impl Intercept for BearerTokenInterceptor {
    fn name(&self) -> &'static str {
        "IamBearerTokenInterceptor"
    }

    fn modify_before_transmit(
        &self,
        context: &mut BeforeTransmitInterceptorContextMut<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> std::result::Result<(), BoxError> {
        let token = self
            .tokens
            .bearer()
            .ok_or("no IAM bearer token has been obtained")?;
        let headers = context.request_mut().headers_mut();
        headers.insert("authorization", format!("Bearer {}", token));
        headers.insert("ibm-service-instance-id", self.service_instance_id.clone());
        Ok(())
    }
}
