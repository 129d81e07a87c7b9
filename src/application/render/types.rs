use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    application::{
        engine::EngineError,
        pool::{PoolError, PoolStatus},
    },
    domain::request::{OutputFormat, RenderRequest},
};

/// Natural content extent in CSS pixels, as reported by the in-page helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ContentSize {
    pub width: u32,
    pub height: u32,
}

impl ContentSize {
    pub fn scaled(self, density: u32) -> Self {
        Self {
            width: self.width.saturating_mul(density),
            height: self.height.saturating_mul(density),
        }
    }
}

/// Raw output of one render, before any caching or delivery shaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDiagram {
    pub bytes: Bytes,
    pub format: OutputFormat,
    /// Output pixel size; known only for pooled raster output.
    pub pixel_size: Option<ContentSize>,
    pub density: u32,
}

impl RenderedDiagram {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Failures a renderer reports to its caller.
///
/// `Timeout` is kept apart from every other kind so the boundary can answer
/// with a timeout-specific response.
#[derive(Debug, Error)]
pub enum RenderFailure {
    #[error("no rendering session available after {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("render step `{step}` exceeded {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("diagram failed to render: {message}")]
    Render { message: String },
    #[error("render step `{step}` failed: {source}")]
    Engine {
        step: &'static str,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Pool(PoolError),
    #[error("render I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl RenderFailure {
    pub fn render(message: impl Into<String>) -> Self {
        Self::Render {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<PoolError> for RenderFailure {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Exhausted { waited } => Self::PoolExhausted { waited },
            other => Self::Pool(other),
        }
    }
}

/// Anything that can turn a validated request into diagram bytes.
#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedDiagram, RenderFailure>;

    /// Engine pool snapshot, when the renderer is backed by one.
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }

    async fn shutdown(&self) {}
}
