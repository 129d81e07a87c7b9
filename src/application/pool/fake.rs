//! In-process engine double for pool and pipeline tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::application::engine::{
    DocumentOptions, Engine, EngineError, EngineLauncher, EngineSession, ScreenshotOptions,
    Viewport,
};

pub(crate) const FAKE_SVG: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 400 300"><g/></svg>"#;

/// How fake sessions answer the render protocol.
#[derive(Debug, Clone)]
pub(crate) struct SessionBehavior {
    /// Natural content size at density 1.
    pub content: (u32, u32),
    pub render_error: Option<String>,
    /// Navigation to anything but `about:blank` never completes.
    pub hang_on_document: bool,
    /// The ready marker is never found, as when the poll deadline passes.
    pub never_ready: bool,
}

impl Default for SessionBehavior {
    fn default() -> Self {
        Self {
            content: (400, 300),
            render_error: None,
            hang_on_document: false,
            never_ready: false,
        }
    }
}

pub(crate) struct FakeLauncher {
    launches: AtomicUsize,
    fail: bool,
    launch_delay: Duration,
    behavior: SessionBehavior,
    sessions_opened: Arc<AtomicUsize>,
    sessions_closed: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<String>>>,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(false, Duration::ZERO, SessionBehavior::default())
    }

    pub(crate) fn with_launch_delay(delay: Duration) -> Arc<Self> {
        Self::build(false, delay, SessionBehavior::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::build(true, Duration::ZERO, SessionBehavior::default())
    }

    pub(crate) fn with_behavior(behavior: SessionBehavior) -> Arc<Self> {
        Self::build(false, Duration::ZERO, behavior)
    }

    fn build(fail: bool, launch_delay: Duration, behavior: SessionBehavior) -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            fail,
            launch_delay,
            behavior,
            sessions_opened: Arc::new(AtomicUsize::new(0)),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
            engines: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub(crate) fn last_engine(&self) -> Option<Arc<FakeEngine>> {
        self.engines
            .lock()
            .ok()
            .and_then(|engines| engines.last().cloned())
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if self.fail {
            return Err(EngineError::Launch("fake launcher refuses".into()));
        }
        let (exited, _) = watch::channel(false);
        let engine = Arc::new(FakeEngine {
            connected: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
            shut_down: Arc::new(AtomicBool::new(false)),
            exited,
            behavior: self.behavior.clone(),
            sessions_opened: Arc::clone(&self.sessions_opened),
            sessions_closed: Arc::clone(&self.sessions_closed),
            calls: Arc::clone(&self.calls),
        });
        if let Ok(mut engines) = self.engines.lock() {
            engines.push(Arc::clone(&engine));
        }
        Ok(engine)
    }
}

pub(crate) struct FakeEngine {
    connected: AtomicBool,
    ping_ok: AtomicBool,
    shut_down: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
    behavior: SessionBehavior,
    sessions_opened: Arc<AtomicUsize>,
    sessions_closed: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    /// Simulate the engine process exiting on its own.
    pub(crate) fn crash(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.exited.send_replace(true);
    }

    pub(crate) fn fail_pings(&self) {
        self.ping_ok.store(false, Ordering::SeqCst);
    }

    pub(crate) fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn new_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        let id = self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeSession {
            id,
            behavior: self.behavior.clone(),
            viewport: Viewport {
                width: 0,
                height: 0,
                density: 1,
            },
            sessions_closed: Arc::clone(&self.sessions_closed),
            engine_shut_down: Arc::clone(&self.shut_down),
            calls: Arc::clone(&self.calls),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Disconnected)
        }
    }

    async fn closed(&self) {
        let mut exited = self.exited.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.crash();
    }
}

struct FakeSession {
    id: usize,
    behavior: SessionBehavior,
    viewport: Viewport,
    sessions_closed: Arc<AtomicUsize>,
    /// Closing after the engine is gone fails, like a session request to a dead driver.
    engine_shut_down: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeSession {
    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("s{}:{call}", self.id));
        }
    }

    fn content(&self) -> (u32, u32) {
        self.behavior.content
    }
}

#[async_trait]
impl EngineSession for FakeSession {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        self.record(format!(
            "viewport {}x{}@{}",
            viewport.width, viewport.height, viewport.density
        ));
        self.viewport = viewport;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), EngineError> {
        let blank = url == "about:blank";
        self.record(if blank { "navigate blank".into() } else { "navigate document".into() });
        if self.behavior.hang_on_document && !blank {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        self.record(format!("wait {selector}"));
        if self.behavior.never_ready {
            return Err(EngineError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, EngineError> {
        let (width, height) = self.content();
        let name = script
            .split("__mermaidRender.")
            .nth(1)
            .and_then(|rest| rest.split('(').next())
            .unwrap_or("unknown")
            .to_string();
        self.record(format!("evaluate {name}"));
        match name.as_str() {
            "status" => Ok(match &self.behavior.render_error {
                Some(message) => json!({ "state": "error", "error": message }),
                None => json!({ "state": "done" }),
            }),
            "postPass" | "tightenViewBox" => Ok(json!({ "width": width, "height": height })),
            "fitDocument" => Ok(json!({ "width": width + 32, "height": height + 32 })),
            "extractSvg" => Ok(Value::String(FAKE_SVG.to_string())),
            "center" => Ok(Value::Null),
            other => Err(EngineError::Script(format!("unexpected script `{other}`"))),
        }
    }

    async fn screenshot(&mut self, options: &ScreenshotOptions) -> Result<Vec<u8>, EngineError> {
        let (width, height) = self.content();
        let density = self.viewport.density;
        self.record(format!(
            "screenshot {} transparent={}",
            options.selector, options.omit_background
        ));
        Ok(format!("png:{}x{}", width * density, height * density).into_bytes())
    }

    async fn to_document(&mut self, options: &DocumentOptions) -> Result<Vec<u8>, EngineError> {
        self.record(format!("document {}x{}", options.width_px, options.height_px));
        Ok(b"%PDF-1.7 fake".to_vec())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.record("close".into());
        tokio::task::yield_now().await;
        if self.engine_shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
