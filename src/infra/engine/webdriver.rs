//! Headless Chrome driven through a spawned `chromedriver` (W3C WebDriver).
//!
//! Viewport density and background transparency go through chromedriver's
//! DevTools passthrough (`goog/cdp/execute`); everything else is plain
//! WebDriver.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, Method, Url};
use serde_json::{Value, json};
use tokio::{
    process::Command,
    sync::{Notify, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::application::engine::{
    DocumentOptions, Engine, EngineError, EngineLauncher, EngineSession, ScreenshotOptions,
    Viewport,
};

const SOURCE: &str = "infra::engine::webdriver";

/// W3C web element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_WAIT: Duration = Duration::from_secs(5);
const CSS_PX_PER_INCH: f64 = 96.0;
const CM_PER_INCH: f64 = 2.54;

const CHROME_ARGS: &[&str] = &[
    "--headless=new",
    "--disable-gpu",
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--hide-scrollbars",
    "--allow-file-access-from-files",
    "--force-color-profile=srgb",
];

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub driver_path: PathBuf,
    pub browser_binary: Option<PathBuf>,
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    config: WebDriverConfig,
    client: Client,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(concat!("mermaid-render/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| EngineError::Launch(err.to_string()))?;
        Ok(Self { config, client })
    }

    fn capabilities(&self) -> Value {
        let mut chrome = json!({ "args": CHROME_ARGS });
        if let Some(binary) = &self.config.browser_binary {
            chrome["binary"] = Value::String(binary.display().to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome,
                }
            }
        })
    }
}

#[async_trait]
impl EngineLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        let started_at = Instant::now();
        let port = free_port()?;
        let mut child = Command::new(&self.config.driver_path)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::Launch(format!(
                    "failed to spawn `{}`: {err}",
                    self.config.driver_path.display()
                ))
            })?;

        let base = Url::parse(&format!("http://127.0.0.1:{port}/"))
            .map_err(|err| EngineError::Launch(err.to_string()))?;
        let deadline = started_at + self.config.startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(EngineError::Launch(format!("driver exited during startup ({status})")));
            }
            if driver_ready(&self.client, &base).await {
                break;
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Launch(format!(
                    "driver not ready after {:?}",
                    self.config.startup_timeout
                )));
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }

        let (exited_tx, exited) = watch::channel(false);
        let kill = Arc::new(Notify::new());
        let kill_signal = Arc::clone(&kill);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    warn!(
                        target = SOURCE,
                        op = "webdriver::watch",
                        status = ?status.ok(),
                        "chromedriver exited"
                    );
                }
                _ = kill_signal.notified() => {
                    if let Err(err) = child.kill().await {
                        debug!(target = SOURCE, error = %err, "Failed to kill chromedriver");
                    }
                }
            }
            exited_tx.send_replace(true);
        });

        info!(
            target = SOURCE,
            op = "webdriver::launch",
            result = "ok",
            port,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "chromedriver ready"
        );
        Ok(Arc::new(WebDriverEngine {
            client: self.client.clone(),
            base,
            capabilities: self.capabilities(),
            exited,
            kill,
        }))
    }
}

pub struct WebDriverEngine {
    client: Client,
    base: Url,
    capabilities: Value,
    exited: watch::Receiver<bool>,
    kill: Arc<Notify>,
}

#[async_trait]
impl Engine for WebDriverEngine {
    async fn new_session(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        let url = join(&self.base, "session")?;
        let value = send(self.client.request(Method::POST, url).json(&self.capabilities)).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol("new session response lacks sessionId".into()))?;
        Ok(Box::new(WebDriverSession::attach(
            self.client.clone(),
            &self.base,
            id,
        )?))
    }

    fn is_connected(&self) -> bool {
        !*self.exited.borrow()
    }

    async fn ping(&self) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }
        if driver_ready(&self.client, &self.base).await {
            Ok(())
        } else {
            Err(EngineError::Protocol("driver reports not ready".into()))
        }
    }

    async fn closed(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }

    async fn shutdown(&self) {
        self.kill.notify_one();
        if tokio::time::timeout(EXIT_WAIT, self.closed()).await.is_err() {
            warn!(target = SOURCE, op = "webdriver::shutdown", "chromedriver did not exit in time");
        }
    }
}

pub struct WebDriverSession {
    client: Client,
    session: Url,
}

impl WebDriverSession {
    pub(crate) fn attach(client: Client, base: &Url, id: &str) -> Result<Self, EngineError> {
        Ok(Self {
            client,
            session: join(base, &format!("session/{id}/"))?,
        })
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, EngineError> {
        let url = join(&self.session, path)?;
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        send(request).await
    }

    async fn cdp(&self, cmd: &str, params: Value) -> Result<Value, EngineError> {
        self.command(
            Method::POST,
            "goog/cdp/execute",
            Some(json!({ "cmd": cmd, "params": params })),
        )
        .await
    }

    async fn find(&self, selector: &str) -> Result<String, EngineError> {
        let value = self
            .command(
                Method::POST,
                "element",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await
            .map_err(|err| match err {
                EngineError::ElementNotFound { .. } => EngineError::ElementNotFound {
                    selector: selector.to_string(),
                },
                other => other,
            })?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("element response lacks a reference".into()))
    }
}

#[async_trait]
impl EngineSession for WebDriverSession {
    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        self.cdp(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": viewport.width,
                "height": viewport.height,
                "deviceScaleFactor": viewport.density,
                "mobile": false,
            }),
        )
        .await
        .map(drop)
    }

    async fn navigate(&mut self, url: &str) -> Result<(), EngineError> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await
            .map(drop)
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(selector).await {
                Ok(_) => return Ok(()),
                Err(EngineError::ElementNotFound { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, EngineError> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
        .await
    }

    async fn screenshot(&mut self, options: &ScreenshotOptions) -> Result<Vec<u8>, EngineError> {
        if options.omit_background {
            self.cdp(
                "Emulation.setDefaultBackgroundColorOverride",
                json!({ "color": { "r": 0, "g": 0, "b": 0, "a": 0 } }),
            )
            .await?;
        }
        let captured = async {
            let element = self.find(&options.selector).await?;
            let value = self
                .command(Method::GET, &format!("element/{element}/screenshot"), None)
                .await?;
            decode_base64(&value)
        }
        .await;
        if options.omit_background {
            // An empty override restores the page's own background.
            self.cdp("Emulation.setDefaultBackgroundColorOverride", json!({}))
                .await?;
        }
        captured
    }

    async fn to_document(&mut self, options: &DocumentOptions) -> Result<Vec<u8>, EngineError> {
        let value = self
            .command(
                Method::POST,
                "print",
                Some(json!({
                    "page": {
                        "width": px_to_cm(options.width_px),
                        "height": px_to_cm(options.height_px),
                    },
                    "margin": { "top": 0, "bottom": 0, "left": 0, "right": 0 },
                    "background": options.print_background,
                    "shrinkToFit": false,
                    "pageRanges": ["1"],
                })),
            )
            .await?;
        decode_base64(&value)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let request = self.client.request(Method::DELETE, self.session.clone());
        send(request).await.map(drop)
    }
}

async fn driver_ready(client: &Client, base: &Url) -> bool {
    let Ok(url) = join(base, "status") else {
        return false;
    };
    match send(client.get(url)).await {
        Ok(value) => value.get("ready").and_then(Value::as_bool).unwrap_or(false),
        Err(_) => false,
    }
}

/// Send a WebDriver command and unwrap its `value` envelope.
async fn send(request: reqwest::RequestBuilder) -> Result<Value, EngineError> {
    let response = request
        .send()
        .await
        .map_err(|err| EngineError::Transport(err.to_string()))?;
    let status = response.status();
    let mut body: Value = response
        .json()
        .await
        .map_err(|err| EngineError::Transport(err.to_string()))?;
    let value = body.get_mut("value").map(Value::take).unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        Err(classify(&value))
    }
}

fn classify(value: &Value) -> EngineError {
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match code {
        "no such element" => EngineError::ElementNotFound {
            selector: String::new(),
        },
        "javascript error" => EngineError::Script(message),
        "invalid session id" | "no such window" | "session not created" => {
            EngineError::Disconnected
        }
        other => EngineError::Protocol(format!("{other}: {message}")),
    }
}

fn decode_base64(value: &Value) -> Result<Vec<u8>, EngineError> {
    let encoded = value
        .as_str()
        .ok_or_else(|| EngineError::Protocol("expected base64 payload".into()))?;
    STANDARD
        .decode(encoded)
        .map_err(|err| EngineError::Protocol(format!("invalid base64 payload: {err}")))
}

fn join(base: &Url, path: &str) -> Result<Url, EngineError> {
    base.join(path)
        .map_err(|err| EngineError::Protocol(format!("invalid command path `{path}`: {err}")))
}

fn px_to_cm(px: u32) -> f64 {
    f64::from(px) / CSS_PX_PER_INCH * CM_PER_INCH
}

fn free_port() -> Result<u16, EngineError> {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|err| EngineError::Launch(format!("no free loopback port: {err}")))
}
