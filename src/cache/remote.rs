//! Durable tier backed by an object store.
//!
//! Existence checks are bounded by a short timeout and fail open: any error
//! or timeout reads as "not present", which at worst causes a re-render and
//! an idempotent re-upload under the same content-derived key. Uploads are
//! different; the caller asked for a durable URL, so their failures surface.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{fingerprint::Fingerprint, request::OutputFormat};

const SOURCE: &str = "cache::remote";

pub const DEFAULT_EXISTS_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(3600);
/// Longest lifetime a signed URL may be requested with.
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// How a durable URL is handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Permanent URL under the public base.
    #[default]
    Public,
    /// Permanent URL under the internal-network base.
    Internal,
    /// Time-limited signed URL.
    Signed,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
            Visibility::Signed => "signed",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ObjectStoreError {
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("object store answered {operation} with status {status}")]
    Status { operation: &'static str, status: u16 },
    #[error("object store cannot sign URLs: {0}")]
    Signing(String),
}

/// Minimal contract with the durable object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        visibility: Visibility,
    ) -> Result<(), ObjectStoreError>;

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, ObjectStoreError>;
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload did not finish within {after:?}")]
    Timeout { after: Duration },
    #[error("upload rejected: {0}")]
    Store(#[source] ObjectStoreError),
    #[error("uploaded object has no usable URL: {0}")]
    Url(#[source] ObjectStoreError),
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Leading key segment, without slashes at either end.
    pub prefix: String,
    pub public_base_url: String,
    /// Falls back to the public base when absent.
    pub internal_base_url: Option<String>,
    pub exists_timeout: Duration,
    pub upload_timeout: Duration,
    pub signed_url_ttl: Duration,
}

impl RemoteConfig {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            prefix: "diagrams".into(),
            public_base_url: public_base_url.into(),
            internal_base_url: None,
            exists_timeout: DEFAULT_EXISTS_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
        }
    }
}

/// Delivery hints for a durable URL. Never part of the fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlOptions {
    pub visibility: Visibility,
    /// Signed URLs only; defaults to the configured TTL.
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLookup {
    pub key: String,
    /// Present only when the object exists and its URL could be resolved.
    pub url: Option<ResolvedUrl>,
}

impl RemoteLookup {
    pub fn is_present(&self) -> bool {
        self.url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub url: ResolvedUrl,
    pub already_present: bool,
}

#[derive(Clone)]
pub struct RemoteStoreGateway {
    store: Arc<dyn ObjectStore>,
    config: RemoteConfig,
}

impl RemoteStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>, config: RemoteConfig) -> Self {
        Self { store, config }
    }

    /// `<prefix>/<shard>/<fingerprint>.<ext>`
    pub fn key_for(&self, fingerprint: &Fingerprint, format: OutputFormat) -> String {
        let name = fingerprint.sharded_name(format);
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        }
    }

    /// Whether the object exists, with its URL resolved when it does.
    pub async fn exists(
        &self,
        fingerprint: &Fingerprint,
        format: OutputFormat,
        options: UrlOptions,
    ) -> RemoteLookup {
        let key = self.key_for(fingerprint, format);
        if !self.head(&key).await {
            return RemoteLookup { key, url: None };
        }
        match self.resolve_url(&key, options).await {
            Ok(url) => RemoteLookup { key, url: Some(url) },
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "remote::exists",
                    result = "url_error",
                    key = %key,
                    error = %err,
                    "Object exists but its URL could not be resolved; treating as absent"
                );
                RemoteLookup { key, url: None }
            }
        }
    }

    /// Upload unless the object already exists, then resolve its URL.
    pub async fn upload(
        &self,
        fingerprint: &Fingerprint,
        format: OutputFormat,
        bytes: Bytes,
        options: UrlOptions,
    ) -> Result<UploadReceipt, UploadError> {
        let started_at = Instant::now();
        let key = self.key_for(fingerprint, format);
        let already_present = self.head(&key).await;

        if !already_present {
            let after = self.config.upload_timeout;
            let put = self
                .store
                .put(&key, bytes, format.content_type(), options.visibility);
            match tokio::time::timeout(after, put).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        target = SOURCE,
                        op = "remote::upload",
                        result = "error",
                        key = %key,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        error = %err,
                        "Object store rejected upload"
                    );
                    return Err(UploadError::Store(err));
                }
                Err(_) => {
                    warn!(
                        target = SOURCE,
                        op = "remote::upload",
                        result = "timeout",
                        key = %key,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "Upload exceeded its deadline"
                    );
                    return Err(UploadError::Timeout { after });
                }
            }
        }

        let url = self
            .resolve_url(&key, options)
            .await
            .map_err(UploadError::Url)?;
        info!(
            target = SOURCE,
            op = "remote::upload",
            result = if already_present { "already_present" } else { "uploaded" },
            key = %key,
            visibility = options.visibility.as_str(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Durable object ready"
        );
        Ok(UploadReceipt {
            key,
            url,
            already_present,
        })
    }

    /// Compute the URL for `key` in the requested delivery mode.
    pub async fn resolve_url(
        &self,
        key: &str,
        options: UrlOptions,
    ) -> Result<ResolvedUrl, ObjectStoreError> {
        match options.visibility {
            Visibility::Public => Ok(ResolvedUrl {
                url: join_url(&self.config.public_base_url, key),
                expires_at: None,
            }),
            Visibility::Internal => {
                let base = self
                    .config
                    .internal_base_url
                    .as_deref()
                    .unwrap_or(&self.config.public_base_url);
                Ok(ResolvedUrl {
                    url: join_url(base, key),
                    expires_at: None,
                })
            }
            Visibility::Signed => {
                let ttl = options
                    .expires_in
                    .unwrap_or(self.config.signed_url_ttl)
                    .clamp(Duration::from_secs(1), MAX_SIGNED_URL_TTL);
                let url = self.store.signed_url(key, ttl).await?;
                Ok(ResolvedUrl {
                    url,
                    expires_at: Some(OffsetDateTime::now_utc() + ttl),
                })
            }
        }
    }

    /// Bounded existence check; errors and timeouts read as absent.
    async fn head(&self, key: &str) -> bool {
        let started_at = Instant::now();
        match tokio::time::timeout(self.config.exists_timeout, self.store.head_exists(key)).await {
            Ok(Ok(present)) => {
                debug!(
                    target = SOURCE,
                    op = "remote::head",
                    result = if present { "present" } else { "absent" },
                    key = %key,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Checked remote object"
                );
                present
            }
            Ok(Err(err)) => {
                warn!(
                    target = SOURCE,
                    op = "remote::head",
                    result = "error",
                    key = %key,
                    error = %err,
                    "Remote existence check failed; assuming absent"
                );
                false
            }
            Err(_) => {
                warn!(
                    target = SOURCE,
                    op = "remote::head",
                    result = "timeout",
                    key = %key,
                    timeout_ms = self.config.exists_timeout.as_millis() as u64,
                    "Remote existence check timed out; assuming absent"
                );
                false
            }
        }
    }
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}
