#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use mermaid_render::{
    application::{
        engine::{
            DocumentOptions, Engine, EngineError, EngineLauncher, EngineSession,
            ScreenshotOptions, Viewport,
        },
        orchestrator::RenderOrchestrator,
        pool::{PoolConfig, SessionPool},
        render::{PipelineConfig, RenderPipeline},
    },
    cache::{LocalCacheStore, RemoteConfig, RemoteStoreGateway},
    infra::object_store::MemoryObjectStore,
};
use serde_json::{Value, json};
use tokio::sync::Notify;

pub const STUB_SVG: &str =
    r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 320 200"><g/></svg>"#;
pub const PUBLIC_BASE: &str = "https://cdn.example";

/// Engine double that answers the render helper protocol with fixed geometry.
#[derive(Default)]
pub struct StubLauncher {
    pub launches: AtomicUsize,
    pub sessions: Arc<AtomicUsize>,
    /// Document navigations, i.e. render passes started.
    pub passes: Arc<AtomicUsize>,
    pub render_delay: Duration,
    pub syntax_error: Option<String>,
}

impl StubLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(render_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            render_delay,
            ..Self::default()
        })
    }

    pub fn rejecting(message: &str) -> Arc<Self> {
        Arc::new(Self {
            syntax_error: Some(message.to_string()),
            ..Self::default()
        })
    }

    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLauncher for StubLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubEngine {
            sessions: self.sessions.clone(),
            passes: self.passes.clone(),
            render_delay: self.render_delay,
            syntax_error: self.syntax_error.clone(),
            closed: Notify::new(),
        }))
    }
}

struct StubEngine {
    sessions: Arc<AtomicUsize>,
    passes: Arc<AtomicUsize>,
    render_delay: Duration,
    syntax_error: Option<String>,
    closed: Notify,
}

#[async_trait]
impl Engine for StubEngine {
    async fn new_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubSession {
            passes: self.passes.clone(),
            render_delay: self.render_delay,
            syntax_error: self.syntax_error.clone(),
            density: 1,
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn closed(&self) {
        self.closed.notified().await;
    }

    async fn shutdown(&self) {
        self.closed.notify_waiters();
    }
}

struct StubSession {
    passes: Arc<AtomicUsize>,
    render_delay: Duration,
    syntax_error: Option<String>,
    density: u32,
}

#[async_trait]
impl EngineSession for StubSession {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        self.density = viewport.density;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), EngineError> {
        if url != "about:blank" {
            self.passes.fetch_add(1, Ordering::SeqCst);
            if !self.render_delay.is_zero() {
                tokio::time::sleep(self.render_delay).await;
            }
        }
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        _selector: &str,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, EngineError> {
        let value = if script.contains("status()") {
            match &self.syntax_error {
                Some(message) => json!({ "state": "error", "error": message }),
                None => json!({ "state": "done" }),
            }
        } else if script.contains("extractSvg(") {
            json!(STUB_SVG)
        } else if script.contains("postPass()")
            || script.contains("tightenViewBox(")
            || script.contains("fitDocument(")
        {
            json!({ "width": 320, "height": 200 })
        } else {
            Value::Null
        };
        Ok(value)
    }

    async fn screenshot(&mut self, _options: &ScreenshotOptions) -> Result<Vec<u8>, EngineError> {
        Ok(format!("PNG@{}x", self.density).into_bytes())
    }

    async fn to_document(&mut self, _options: &DocumentOptions) -> Result<Vec<u8>, EngineError> {
        Ok(b"%PDF-1.7 stub".to_vec())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<RenderOrchestrator>,
    pub launcher: Arc<StubLauncher>,
    pub store: Option<Arc<MemoryObjectStore>>,
    pub pool: SessionPool,
}

/// Pooled pipeline over `launcher`, a local cache under `dir`, and optionally a memory store.
pub fn harness(
    dir: &Path,
    launcher: Arc<StubLauncher>,
    store: Option<Arc<MemoryObjectStore>>,
) -> Harness {
    let pool = SessionPool::new(
        launcher.clone(),
        PoolConfig {
            max_sessions: 2,
            ..PoolConfig::default()
        },
    );
    let pipeline = RenderPipeline::new(
        pool.clone(),
        PipelineConfig {
            settle_delay: Duration::ZERO,
            library_url: "https://assets.example/mermaid.min.js".into(),
            work_dir: dir.join("work"),
            ..PipelineConfig::default()
        },
    );
    let local = LocalCacheStore::new(dir.join("cache"), Duration::from_secs(3600));
    let remote = store.clone().map(|store| {
        RemoteStoreGateway::new(store, RemoteConfig::new(PUBLIC_BASE))
    });

    Harness {
        orchestrator: Arc::new(RenderOrchestrator::new(Arc::new(pipeline), Some(local), remote)),
        launcher,
        store,
        pool,
    }
}
