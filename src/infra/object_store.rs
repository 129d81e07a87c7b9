//! Object store clients behind [`ObjectStore`].

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, StatusCode, Url, header};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::cache::{ObjectStore, ObjectStoreError, Visibility};

#[derive(Debug, Clone)]
pub struct HttpObjectStoreConfig {
    /// Store API root, e.g. `https://storage.example.com/`.
    pub endpoint: Url,
    pub bucket: String,
    pub access_token: Option<String>,
    pub signing_secret: Option<String>,
    /// Base that signed URLs are issued under.
    pub public_base_url: String,
}

/// Path-style HTTP object store (`<endpoint>/<bucket>/<key>`) with bearer auth.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    config: HttpObjectStoreConfig,
}

impl HttpObjectStore {
    pub fn new(config: HttpObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .user_agent(concat!("mermaid-render/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn object_url(&self, key: &str) -> Result<Url, ObjectStoreError> {
        let bucket = self.config.bucket.trim_matches('/');
        self.config
            .endpoint
            .join(&format!("{bucket}/{key}"))
            .map_err(|err| ObjectStoreError::Request(format!("invalid object key `{key}`: {err}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        let request = self.authorize(self.client.head(self.object_url(key)?));
        let response = request
            .send()
            .await
            .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(ObjectStoreError::Status {
                operation: "head",
                status: status.as_u16(),
            }),
        }
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        visibility: Visibility,
    ) -> Result<(), ObjectStoreError> {
        let acl = match visibility {
            Visibility::Public => "public-read",
            Visibility::Internal | Visibility::Signed => "private",
        };
        let request = self
            .client
            .put(self.object_url(key)?)
            .header(header::CONTENT_TYPE, content_type)
            .header("x-amz-acl", acl)
            .body(bytes);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| ObjectStoreError::Request(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ObjectStoreError::Status {
                operation: "put",
                status: response.status().as_u16(),
            })
        }
    }

    async fn signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        let secret = self
            .config
            .signing_secret
            .as_deref()
            .ok_or_else(|| ObjectStoreError::Signing("no signing secret configured".into()))?;
        let expires = (OffsetDateTime::now_utc() + expires_in).unix_timestamp();
        Ok(format!(
            "{}/{key}?expires={expires}&signature={}",
            self.config.public_base_url.trim_end_matches('/'),
            sign(secret, key, expires)
        ))
    }
}

/// `hex(sha256(secret \n key \n expires))`, verified by the serving edge.
fn sign(secret: &str, key: &str, expires: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(expires.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
    pub visibility: Visibility,
}

/// In-process store for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
    puts: AtomicUsize,
    latency: Duration,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.delay().await;
        Ok(self.objects.contains_key(key))
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        visibility: Visibility,
    ) -> Result<(), ObjectStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                visibility,
            },
        );
        Ok(())
    }

    async fn signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        Ok(format!("memory://{key}?expires_in={}", expires_in.as_secs()))
    }
}
