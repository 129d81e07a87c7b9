//! Per-call sequencing across the cache tiers and the renderer.
//!
//! fingerprint → remote existence (durable URL only) → local cache →
//! render → local persist → remote upload (durable URL only) → shaping.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    application::render::{DiagramRenderer, RenderFailure},
    cache::{
        LocalCacheStore, RemoteStoreGateway, ResolvedUrl, UploadError, UrlOptions, Visibility,
        remote::MAX_SIGNED_URL_TTL,
    },
    domain::{
        error::DomainError,
        fingerprint::Fingerprint,
        request::{OutputFormat, RenderRequest, RenderRequestDraft},
    },
};

const SOURCE: &str = "application::orchestrator";

pub(crate) const METRIC_REQUESTS: &str = "mermaid_render_requests_total";
pub(crate) const METRIC_LOCAL_HIT: &str = "mermaid_render_local_hit_total";
pub(crate) const METRIC_LOCAL_MISS: &str = "mermaid_render_local_miss_total";
pub(crate) const METRIC_REMOTE_HIT: &str = "mermaid_render_remote_hit_total";
pub(crate) const METRIC_RENDER_MS: &str = "mermaid_render_render_ms";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    #[default]
    Raw,
    Base64,
    Url,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Raw => "raw",
            Delivery::Base64 => "base64",
            Delivery::Url => "url",
        }
    }
}

/// Everything a caller may send: request fields plus delivery hints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    #[serde(flatten)]
    pub draft: RenderRequestDraft,
    pub delivery: Delivery,
    pub visibility: Visibility,
    /// Signed URL lifetime in seconds.
    pub expires_in: Option<u64>,
}

impl RenderOptions {
    pub fn into_call(self) -> Result<RenderCall, DomainError> {
        let expires_in = match self.expires_in {
            None => None,
            Some(seconds) if seconds == 0 || seconds > MAX_SIGNED_URL_TTL.as_secs() => {
                return Err(DomainError::validation(
                    "expires_in",
                    format!(
                        "must be between 1 and {} seconds",
                        MAX_SIGNED_URL_TTL.as_secs()
                    ),
                ));
            }
            Some(seconds) => Some(Duration::from_secs(seconds)),
        };
        Ok(RenderCall {
            request: self.draft.validate()?,
            delivery: self.delivery,
            url: UrlOptions {
                visibility: self.visibility,
                expires_in,
            },
        })
    }
}

/// A validated call.
#[derive(Debug, Clone)]
pub struct RenderCall {
    pub request: RenderRequest,
    pub delivery: Delivery,
    pub url: UrlOptions,
}

impl RenderCall {
    pub fn raw(request: RenderRequest) -> Self {
        Self {
            request,
            delivery: Delivery::Raw,
            url: UrlOptions::default(),
        }
    }
}

/// Which tier produced the bytes behind a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Remote,
    Local,
    Rendered,
}

impl ServedFrom {
    /// Value of the cache indicator exposed to clients.
    pub fn as_str(self) -> &'static str {
        match self {
            ServedFrom::Remote => "remote",
            ServedFrom::Local => "local",
            ServedFrom::Rendered => "miss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Base64(String),
    Url {
        key: String,
        url: ResolvedUrl,
        already_present: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub fingerprint: Fingerprint,
    pub format: OutputFormat,
    pub served_from: ServedFrom,
    pub payload: Payload,
}

impl RenderResponse {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

#[derive(Debug, Error)]
pub enum RenderCallError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Render(#[from] RenderFailure),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("durable URL delivery requested but no remote store is configured")]
    RemoteUnavailable,
}

pub struct RenderOrchestrator {
    renderer: Arc<dyn DiagramRenderer>,
    local: Option<LocalCacheStore>,
    remote: Option<RemoteStoreGateway>,
}

impl RenderOrchestrator {
    pub fn new(
        renderer: Arc<dyn DiagramRenderer>,
        local: Option<LocalCacheStore>,
        remote: Option<RemoteStoreGateway>,
    ) -> Self {
        Self {
            renderer,
            local,
            remote,
        }
    }

    pub fn renderer(&self) -> &Arc<dyn DiagramRenderer> {
        &self.renderer
    }

    pub fn local(&self) -> Option<&LocalCacheStore> {
        self.local.as_ref()
    }

    /// Validate raw options and run the call.
    pub async fn handle(&self, options: RenderOptions) -> Result<RenderResponse, RenderCallError> {
        let call = options.into_call()?;
        self.execute(call).await
    }

    pub async fn execute(&self, call: RenderCall) -> Result<RenderResponse, RenderCallError> {
        let started_at = Instant::now();
        let format = call.request.format();
        let fingerprint = Fingerprint::of(&call.request);
        counter!(
            METRIC_REQUESTS,
            "format" => format.as_str(),
            "delivery" => call.delivery.as_str()
        )
        .increment(1);

        let remote = match call.delivery {
            Delivery::Url => Some(self.remote.as_ref().ok_or(RenderCallError::RemoteUnavailable)?),
            _ => None,
        };

        if let Some(remote) = remote {
            let lookup = remote.exists(&fingerprint, format, call.url).await;
            if let Some(url) = lookup.url {
                counter!(METRIC_REMOTE_HIT).increment(1);
                return Ok(self.finish(
                    started_at,
                    fingerprint,
                    format,
                    ServedFrom::Remote,
                    Payload::Url {
                        key: lookup.key,
                        url,
                        already_present: true,
                    },
                ));
            }
        }

        let (bytes, served_from) = match self.local_get(&fingerprint, format).await {
            Some(bytes) => (bytes, ServedFrom::Local),
            None => {
                let bytes = self.render(&call.request).await?;
                if let Some(local) = &self.local {
                    local.put(&fingerprint, format, &bytes).await;
                }
                (bytes, ServedFrom::Rendered)
            }
        };

        let payload = match (call.delivery, remote) {
            (Delivery::Url, Some(remote)) => {
                let receipt = remote.upload(&fingerprint, format, bytes, call.url).await?;
                Payload::Url {
                    key: receipt.key,
                    url: receipt.url,
                    already_present: receipt.already_present,
                }
            }
            (Delivery::Base64, _) => Payload::Base64(STANDARD.encode(&bytes)),
            _ => Payload::Raw(bytes),
        };

        Ok(self.finish(started_at, fingerprint, format, served_from, payload))
    }

    async fn local_get(&self, fingerprint: &Fingerprint, format: OutputFormat) -> Option<Bytes> {
        let local = self.local.as_ref()?;
        match local.get(fingerprint, format).await {
            Some(entry) => {
                counter!(METRIC_LOCAL_HIT).increment(1);
                Some(entry.bytes)
            }
            None => {
                counter!(METRIC_LOCAL_MISS).increment(1);
                None
            }
        }
    }

    async fn render(&self, request: &RenderRequest) -> Result<Bytes, RenderFailure> {
        let started_at = Instant::now();
        let result = self.renderer.render(request).await;
        histogram!(
            METRIC_RENDER_MS,
            "result" => if result.is_ok() { "ok" } else { "error" }
        )
        .record(started_at.elapsed().as_secs_f64() * 1000.0);
        result.map(|diagram| diagram.bytes)
    }

    fn finish(
        &self,
        started_at: Instant,
        fingerprint: Fingerprint,
        format: OutputFormat,
        served_from: ServedFrom,
        payload: Payload,
    ) -> RenderResponse {
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        if served_from == ServedFrom::Rendered {
            info!(
                target = SOURCE,
                op = "orchestrator::execute",
                result = served_from.as_str(),
                fingerprint = %fingerprint,
                format = format.as_str(),
                elapsed_ms,
                "Render call served"
            );
        } else {
            debug!(
                target = SOURCE,
                op = "orchestrator::execute",
                result = served_from.as_str(),
                fingerprint = %fingerprint,
                format = format.as_str(),
                elapsed_ms,
                "Render call served"
            );
        }
        RenderResponse {
            fingerprint,
            format,
            served_from,
            payload,
        }
    }
}
