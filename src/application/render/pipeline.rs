//! Pooled multi-pass render protocol.
//!
//! A render loads the diagram once at density 1 to discover its natural size,
//! clamps the requested scale against the configured pixel budget, reloads at
//! the effective density when that is above 1, and finally extracts the
//! requested format. The session is reset and released whatever happens, and
//! the generated document is deleted when it goes out of scope.

use std::{future::Future, path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, de::DeserializeOwned};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    document::{DIAGRAM_SELECTOR, READY_SELECTOR, RenderDocument, helper_call},
    types::{ContentSize, DiagramRenderer, RenderFailure, RenderedDiagram},
};
use crate::{
    application::{
        engine::{DocumentOptions, EngineError, EngineSession, ScreenshotOptions, Viewport},
        pool::{PoolStatus, SessionLease, SessionPool},
    },
    domain::request::{MAX_SCALE, OutputFormat, RenderRequest},
};

const SOURCE: &str = "application::render::pipeline";

pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1200;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 800;
const BLANK_URL: &str = "about:blank";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound for every individual engine step.
    pub render_timeout: Duration,
    pub max_width: u32,
    pub max_height: u32,
    /// Pause after the library reports completion so async icon loading can finish.
    pub settle_delay: Duration,
    pub svg_padding: u32,
    pub pdf_padding: u32,
    /// Location the generated document loads the diagram library from.
    pub library_url: String,
    pub work_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            render_timeout: Duration::from_secs(30),
            max_width: 10_000,
            max_height: 10_000,
            settle_delay: Duration::from_millis(150),
            svg_padding: 8,
            pdf_padding: 16,
            library_url: String::new(),
            work_dir: std::env::temp_dir().join("mermaid-render"),
        }
    }
}

/// Highest density that keeps output within `max_width` x `max_height`.
///
/// Each axis allows `floor(max / base)`, never less than 1; the result is
/// additionally capped by the requested scale and by [`MAX_SCALE`].
pub fn effective_density(
    requested: u32,
    base: ContentSize,
    max_width: u32,
    max_height: u32,
) -> u32 {
    let allowed = |max: u32, base: u32| (max / base.max(1)).max(1);
    requested
        .max(1)
        .min(allowed(max_width, base.width))
        .min(allowed(max_height, base.height))
        .min(u32::from(MAX_SCALE))
}

#[derive(Debug, Deserialize)]
struct RenderStatus {
    state: String,
    error: Option<String>,
}

pub struct RenderPipeline {
    pool: SessionPool,
    config: PipelineConfig,
}

impl RenderPipeline {
    pub fn new(pool: SessionPool, config: PipelineConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    async fn render_pooled(
        &self,
        request: &RenderRequest,
    ) -> Result<RenderedDiagram, RenderFailure> {
        let started_at = Instant::now();
        let document =
            RenderDocument::create(&self.config.work_dir, &self.config.library_url, request).await?;
        let mut lease = self.pool.acquire().await?;

        let outcome = self.drive(lease.session(), request, &document).await;
        self.reset(&mut lease).await;
        let session_id = lease.id();
        drop(lease);
        drop(document);

        match &outcome {
            Ok(diagram) => info!(
                target = SOURCE,
                op = "pipeline::render",
                result = "ok",
                format = diagram.format.as_str(),
                density = diagram.density,
                bytes = diagram.bytes.len(),
                session_id,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Diagram rendered"
            ),
            Err(err) => warn!(
                target = SOURCE,
                op = "pipeline::render",
                result = if err.is_timeout() { "timeout" } else { "error" },
                session_id,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "Diagram render failed"
            ),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn EngineSession,
        request: &RenderRequest,
        document: &RenderDocument,
    ) -> Result<RenderedDiagram, RenderFailure> {
        let base = self.pass(session, request, document, 1).await?;

        let requested = u32::from(request.scale());
        let density = effective_density(
            requested,
            base,
            self.config.max_width,
            self.config.max_height,
        );
        if density != requested {
            info!(
                target = SOURCE,
                op = "pipeline::render",
                requested,
                density,
                base_width = base.width,
                base_height = base.height,
                "Requested scale clamped to fit the pixel budget"
            );
        }
        if density > 1 {
            self.pass(session, request, document, density).await?;
        }

        let (bytes, pixel_size) = match request.format() {
            OutputFormat::Svg => (self.extract_svg(session).await?, None),
            OutputFormat::Pdf => (self.extract_document(session, request, density).await?, None),
            OutputFormat::Png => {
                let (bytes, size) = self.extract_raster(session, request).await?;
                (bytes, Some(size.scaled(density)))
            }
        };

        Ok(RenderedDiagram {
            bytes: Bytes::from(bytes),
            format: request.format(),
            pixel_size,
            density,
        })
    }

    /// Load the document at `density`, wait for the library, and run the post-pass.
    async fn pass(
        &self,
        session: &mut dyn EngineSession,
        request: &RenderRequest,
        document: &RenderDocument,
        density: u32,
    ) -> Result<ContentSize, RenderFailure> {
        let viewport = Viewport {
            width: request.width().unwrap_or(DEFAULT_VIEWPORT_WIDTH),
            height: request.height().unwrap_or(DEFAULT_VIEWPORT_HEIGHT),
            density,
        };
        self.step("set_viewport", session.set_viewport(viewport)).await?;
        self.step("navigate", session.navigate(document.url())).await?;
        self.wait_for_render(session).await?;

        let status: RenderStatus = self.call(session, "status", "status()").await?;
        if status.state == "error" {
            return Err(RenderFailure::render(
                status
                    .error
                    .unwrap_or_else(|| "diagram library reported an unknown error".into()),
            ));
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let size: ContentSize = self.call(session, "post_pass", "postPass()").await?;
        debug!(
            target = SOURCE,
            op = "pipeline::pass",
            density,
            width = size.width,
            height = size.height,
            "Render pass complete"
        );
        Ok(size)
    }

    /// The ready marker never appearing before the deadline counts as a timeout.
    async fn wait_for_render(&self, session: &mut dyn EngineSession) -> Result<(), RenderFailure> {
        let after = self.config.render_timeout;
        let waited = self
            .step(
                "wait_for_render",
                session.wait_for_selector(READY_SELECTOR, after),
            )
            .await;
        match waited {
            Err(RenderFailure::Engine {
                step,
                source: EngineError::ElementNotFound { .. },
            }) => Err(RenderFailure::Timeout { step, after }),
            other => other,
        }
    }

    async fn extract_svg(&self, session: &mut dyn EngineSession) -> Result<Vec<u8>, RenderFailure> {
        let call = format!("extractSvg({})", self.config.svg_padding);
        let markup: String = self.call(session, "extract_svg", &call).await?;
        if markup.trim().is_empty() {
            return Err(RenderFailure::render("diagram produced no markup"));
        }
        Ok(markup.into_bytes())
    }

    async fn extract_document(
        &self,
        session: &mut dyn EngineSession,
        request: &RenderRequest,
        density: u32,
    ) -> Result<Vec<u8>, RenderFailure> {
        let call = format!("fitDocument({})", self.config.pdf_padding);
        let page: ContentSize = self.call(session, "fit_document", &call).await?;
        self.step(
            "fit_viewport",
            session.set_viewport(Viewport {
                width: page.width,
                height: page.height,
                density,
            }),
        )
        .await?;
        let () = self.call(session, "center", "center()").await?;
        let options = DocumentOptions {
            width_px: page.width,
            height_px: page.height,
            print_background: !request.is_transparent(),
        };
        self.step("to_document", session.to_document(&options)).await
    }

    async fn extract_raster(
        &self,
        session: &mut dyn EngineSession,
        request: &RenderRequest,
    ) -> Result<(Vec<u8>, ContentSize), RenderFailure> {
        let call = format!("tightenViewBox({})", self.config.svg_padding);
        let size: ContentSize = self.call(session, "tighten_view_box", &call).await?;
        let options = ScreenshotOptions {
            selector: DIAGRAM_SELECTOR.to_string(),
            omit_background: request.is_transparent(),
        };
        let bytes = self.step("screenshot", session.screenshot(&options)).await?;
        Ok((bytes, size))
    }

    /// Navigate back to a blank page; a session that cannot be reset is discarded.
    async fn reset(&self, lease: &mut SessionLease) {
        let outcome = tokio::time::timeout(
            self.config.render_timeout,
            lease.session().navigate(BLANK_URL),
        )
        .await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "reset timed out".to_string(),
        };
        warn!(
            target = SOURCE,
            op = "pipeline::reset",
            session_id = lease.id(),
            error = %error,
            "Session could not be reset; discarding it"
        );
        lease.discard();
    }

    async fn step<T>(
        &self,
        step: &'static str,
        future: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, RenderFailure> {
        let after = self.config.render_timeout;
        match tokio::time::timeout(after, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(RenderFailure::Engine { step, source }),
            Err(_) => Err(RenderFailure::Timeout { step, after }),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        session: &mut dyn EngineSession,
        step: &'static str,
        call: &str,
    ) -> Result<T, RenderFailure> {
        let script = helper_call(call);
        let value = self.step(step, session.evaluate(&script)).await?;
        serde_json::from_value(value).map_err(|err| RenderFailure::Engine {
            step,
            source: EngineError::Script(format!("unexpected helper result: {err}")),
        })
    }
}

#[async_trait]
impl DiagramRenderer for RenderPipeline {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedDiagram, RenderFailure> {
        self.render_pooled(request).await
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        application::pool::{
            PoolConfig,
            fake::{FAKE_SVG, FakeLauncher, SessionBehavior},
        },
        domain::request::{RenderRequestDraft, TRANSPARENT_BACKGROUND},
    };

    struct Harness {
        launcher: Arc<FakeLauncher>,
        pipeline: RenderPipeline,
        work_dir: TempDir,
    }

    fn harness(behavior: SessionBehavior, render_timeout: Duration) -> Harness {
        let launcher = FakeLauncher::with_behavior(behavior);
        let work_dir = TempDir::new().expect("temp dir");
        let pool = SessionPool::new(
            launcher.clone(),
            PoolConfig {
                max_sessions: 2,
                ..PoolConfig::default()
            },
        );
        let pipeline = RenderPipeline::new(
            pool,
            PipelineConfig {
                render_timeout,
                max_width: 1000,
                max_height: 1000,
                settle_delay: Duration::ZERO,
                library_url: "https://cdn.example/mermaid.min.js".into(),
                work_dir: work_dir.path().to_path_buf(),
                ..PipelineConfig::default()
            },
        );
        Harness {
            launcher,
            pipeline,
            work_dir,
        }
    }

    fn request(draft: RenderRequestDraft) -> RenderRequest {
        draft.validate().expect("valid request")
    }

    fn count(calls: &[String], suffix: &str) -> usize {
        calls.iter().filter(|call| call.ends_with(suffix)).count()
    }

    #[test]
    fn density_is_clamped_to_the_pixel_budget() {
        let base = ContentSize {
            width: 400,
            height: 300,
        };
        assert_eq!(effective_density(10, base, 1000, 1000), 2);
        assert_eq!(effective_density(1, base, 1000, 1000), 1);
        assert_eq!(effective_density(3, base, 10_000, 10_000), 3);
        assert_eq!(effective_density(10, base, 100_000, 100_000), 10);
    }

    #[test]
    fn oversized_content_still_renders_at_density_one() {
        let base = ContentSize {
            width: 20_000,
            height: 50,
        };
        assert_eq!(effective_density(4, base, 10_000, 10_000), 1);
        let empty = ContentSize {
            width: 0,
            height: 0,
        };
        assert_eq!(effective_density(4, empty, 1000, 1000), 4);
    }

    #[tokio::test]
    async fn raster_render_reloads_at_clamped_density() {
        let h = harness(SessionBehavior::default(), Duration::from_secs(5));
        let request = request(
            RenderRequestDraft::new("graph TD\nA-->B")
                .format(OutputFormat::Png)
                .scale(10),
        );

        let diagram = h.pipeline.render(&request).await.expect("render");

        assert_eq!(diagram.density, 2);
        assert_eq!(
            diagram.pixel_size,
            Some(ContentSize {
                width: 800,
                height: 600
            })
        );
        assert_eq!(&diagram.bytes[..], b"png:800x600");
        let calls = h.launcher.calls();
        assert_eq!(count(&calls, "viewport 1200x800@1"), 1);
        assert_eq!(count(&calls, "viewport 1200x800@2"), 1);
        assert_eq!(count(&calls, "navigate document"), 2);
        assert_eq!(count(&calls, "evaluate postPass"), 2);
        assert_eq!(calls.last().map(String::as_str), Some("s1:navigate blank"));
    }

    #[tokio::test]
    async fn vector_render_at_scale_one_is_a_single_pass() {
        let h = harness(SessionBehavior::default(), Duration::from_secs(5));
        let request = request(RenderRequestDraft::new("graph TD\nA-->B"));

        let diagram = h.pipeline.render(&request).await.expect("render");

        assert_eq!(&diagram.bytes[..], FAKE_SVG.as_bytes());
        assert_eq!(diagram.content_type(), "image/svg+xml");
        assert_eq!(diagram.pixel_size, None);
        assert_eq!(count(&h.launcher.calls(), "navigate document"), 1);
    }

    #[tokio::test]
    async fn document_output_is_sized_to_content_plus_padding() {
        let h = harness(SessionBehavior::default(), Duration::from_secs(5));
        let request = request(RenderRequestDraft::new("graph TD\nA-->B").format(OutputFormat::Pdf));

        let diagram = h.pipeline.render(&request).await.expect("render");

        assert!(diagram.bytes.starts_with(b"%PDF"));
        let calls = h.launcher.calls();
        assert_eq!(count(&calls, "viewport 432x332@1"), 1);
        assert_eq!(count(&calls, "evaluate center"), 1);
        assert_eq!(count(&calls, "document 432x332"), 1);
    }

    #[tokio::test]
    async fn transparent_background_skips_the_opaque_fill() {
        let h = harness(SessionBehavior::default(), Duration::from_secs(5));
        let request = request(
            RenderRequestDraft::new("graph TD\nA-->B")
                .format(OutputFormat::Png)
                .background(TRANSPARENT_BACKGROUND),
        );

        h.pipeline.render(&request).await.expect("render");

        let calls = h.launcher.calls();
        assert_eq!(count(&calls, "screenshot #container svg transparent=true"), 1);
    }

    #[tokio::test]
    async fn library_error_is_reported_and_session_released() {
        let h = harness(
            SessionBehavior {
                render_error: Some("Parse error on line 2".into()),
                ..SessionBehavior::default()
            },
            Duration::from_secs(5),
        );
        let request = request(RenderRequestDraft::new("graph TD\nA-->"));

        let err = h.pipeline.render(&request).await.expect_err("render fails");

        match err {
            RenderFailure::Render { message } => assert!(message.contains("Parse error")),
            other => panic!("unexpected failure: {other:?}"),
        }
        let status = h.pipeline.pool().status();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.total_sessions, 1);
    }

    #[tokio::test]
    async fn stalled_navigation_times_out_and_session_stays_reusable() {
        let h = harness(
            SessionBehavior {
                hang_on_document: true,
                ..SessionBehavior::default()
            },
            Duration::from_millis(50),
        );
        let request = request(RenderRequestDraft::new("graph TD\nA-->B"));

        let err = h.pipeline.render(&request).await.expect_err("times out");

        match err {
            RenderFailure::Timeout { step, after } => {
                assert_eq!(step, "navigate");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        let status = h.pipeline.pool().status();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.total_sessions, 1);

        let lease = h.pipeline.pool().acquire().await.expect("session reusable");
        assert_eq!(lease.id(), 1);
        assert_eq!(h.launcher.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn missing_ready_marker_is_a_timeout() {
        let h = harness(
            SessionBehavior {
                never_ready: true,
                ..SessionBehavior::default()
            },
            Duration::from_millis(50),
        );
        let request = request(RenderRequestDraft::new("graph TD\nA-->B"));

        let err = h.pipeline.render(&request).await.expect_err("never ready");

        match err {
            RenderFailure::Timeout { step, .. } => assert_eq!(step, "wait_for_render"),
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(h.pipeline.pool().status().active_sessions, 0);
    }

    #[tokio::test]
    async fn generated_document_is_deleted_after_render() {
        let h = harness(SessionBehavior::default(), Duration::from_secs(5));
        let request = request(RenderRequestDraft::new("graph TD\nA-->B"));

        h.pipeline.render(&request).await.expect("render");
        let _ = h
            .pipeline
            .render(&request)
            .await
            .expect("second render reuses session");

        let leftovers = std::fs::read_dir(h.work_dir.path())
            .expect("read work dir")
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(h.launcher.sessions_opened(), 1);
    }
}
