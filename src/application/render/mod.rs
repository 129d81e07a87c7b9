//! Turning validated requests into diagram bytes.
//!
//! [`RenderPipeline`] drives pooled engine sessions through the multi-pass
//! protocol; [`CliRenderer`] shells out to `mmdc` once per request. Both sit
//! behind [`DiagramRenderer`] so the orchestrator does not care which is active.

mod cli;
mod document;
mod pipeline;
mod types;

pub use cli::CliRenderer;
pub use pipeline::{
    DEFAULT_VIEWPORT_HEIGHT, DEFAULT_VIEWPORT_WIDTH, PipelineConfig, RenderPipeline,
    effective_density,
};
pub use types::{ContentSize, DiagramRenderer, RenderFailure, RenderedDiagram};

pub use document::library_url;
