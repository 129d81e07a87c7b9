//! Contract with the external headless rendering engine.
//!
//! The core only ever talks to the engine through these traits: launch a
//! process, open sessions against it, and drive a session through
//! navigate / probe / evaluate / capture calls. Scripts run inside the engine
//! are opaque strings whose results come back as JSON values.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine launch failed: {0}")]
    Launch(String),
    #[error("engine is not connected")]
    Disconnected,
    #[error("no element matches `{selector}`")]
    ElementNotFound { selector: String },
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine transport error: {0}")]
    Transport(String),
}

/// Viewport geometry in CSS pixels plus the device pixel ratio ("density").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub density: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotOptions {
    /// CSS selector of the element to capture.
    pub selector: String,
    /// Capture with a transparent page background instead of an opaque fill.
    pub omit_background: bool,
}

/// A single page sized exactly to `width_px` x `height_px` CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentOptions {
    pub width_px: u32,
    pub height_px: u32,
    pub print_background: bool,
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn EngineSession>, EngineError>;

    fn is_connected(&self) -> bool;

    async fn ping(&self) -> Result<(), EngineError>;

    /// Resolves once the engine process is gone, whether it exited or was shut down.
    async fn closed(&self);

    async fn shutdown(&self);
}

#[async_trait]
pub trait EngineSession: Send {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError>;

    async fn navigate(&mut self, url: &str) -> Result<(), EngineError>;

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Run a function body (which may `return` a value) and yield its JSON result.
    async fn evaluate(&mut self, script: &str) -> Result<serde_json::Value, EngineError>;

    async fn screenshot(&mut self, options: &ScreenshotOptions) -> Result<Vec<u8>, EngineError>;

    async fn to_document(&mut self, options: &DocumentOptions) -> Result<Vec<u8>, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}
