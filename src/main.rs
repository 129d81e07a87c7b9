use std::{future::IntoFuture, path::Path, process, sync::Arc, time::Duration};

use mermaid_render::{
    application::{
        error::AppError,
        orchestrator::{Payload, RenderCall, RenderOrchestrator},
        pool::{PoolConfig, SessionPool},
        render::{CliRenderer, DiagramRenderer, PipelineConfig, RenderPipeline, library_url},
    },
    cache::{LocalCacheStore, RemoteConfig, RemoteStoreGateway},
    config::{self, EngineKind, FormatArg},
    domain::request::{OutputFormat, RenderRequestDraft, Theme},
    infra::{
        engine::{WebDriverConfig, WebDriverLauncher},
        error::InfraError,
        http::{self, HttpState},
        object_store::{HttpObjectStore, HttpObjectStoreConfig},
        telemetry,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
    task::JoinHandle,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
    }
}

struct Runtime {
    orchestrator: Arc<RenderOrchestrator>,
    pool: Option<SessionPool>,
}

fn build_runtime(settings: &config::Settings, with_remote: bool) -> Result<Runtime, AppError> {
    let (renderer, pool): (Arc<dyn DiagramRenderer>, Option<SessionPool>) =
        match settings.render.engine {
            EngineKind::Pool => {
                let launcher = WebDriverLauncher::new(WebDriverConfig {
                    driver_path: settings.pool.driver_path.clone(),
                    browser_binary: settings.pool.browser_binary.clone(),
                    startup_timeout: settings.pool.startup_timeout,
                })
                .map_err(|err| {
                    InfraError::configuration(format!("failed to prepare engine driver: {err}"))
                })?;
                let pool = SessionPool::new(
                    Arc::new(launcher),
                    PoolConfig {
                        max_sessions: settings.pool.max_sessions,
                        idle_timeout: settings.pool.idle_timeout,
                        health_interval: settings.pool.health_interval,
                        ..PoolConfig::default()
                    },
                );
                let library_url =
                    library_url(&settings.render.mermaid_script).map_err(InfraError::from)?;
                let pipeline = RenderPipeline::new(
                    pool.clone(),
                    PipelineConfig {
                        render_timeout: settings.render.timeout,
                        max_width: settings.render.max_width,
                        max_height: settings.render.max_height,
                        settle_delay: settings.render.settle_delay,
                        svg_padding: settings.render.svg_padding,
                        pdf_padding: settings.render.pdf_padding,
                        library_url,
                        work_dir: settings.render.work_dir.clone(),
                    },
                );
                (Arc::new(pipeline), Some(pool))
            }
            EngineKind::Cli => (
                Arc::new(CliRenderer::new(
                    settings.render.cli_path.clone(),
                    settings.render.work_dir.clone(),
                    settings.render.timeout,
                )),
                None,
            ),
        };

    let local = settings
        .cache
        .enabled
        .then(|| LocalCacheStore::new(&settings.cache.directory, settings.cache.max_age));

    let remote = match settings.remote.as_ref().filter(|_| with_remote) {
        Some(remote) => Some(build_remote(remote)?),
        None => None,
    };

    info!(
        target = "mermaid_render::startup",
        engine = ?settings.render.engine,
        local_cache = local.is_some(),
        remote = remote.is_some(),
        "Rendering runtime assembled"
    );

    Ok(Runtime {
        orchestrator: Arc::new(RenderOrchestrator::new(renderer, local, remote)),
        pool,
    })
}

fn build_remote(remote: &config::RemoteSettings) -> Result<RemoteStoreGateway, AppError> {
    let store = HttpObjectStore::new(HttpObjectStoreConfig {
        endpoint: remote.endpoint.clone(),
        bucket: remote.bucket.clone(),
        access_token: remote.access_token.clone(),
        signing_secret: remote.signing_secret.clone(),
        public_base_url: remote.public_base_url.clone(),
    })
    .map_err(|err| InfraError::configuration(format!("failed to build object store: {err}")))?;

    Ok(RemoteStoreGateway::new(
        Arc::new(store),
        RemoteConfig {
            prefix: remote.prefix.clone(),
            public_base_url: remote.public_base_url.clone(),
            internal_base_url: remote.internal_base_url.clone(),
            exists_timeout: remote.exists_timeout,
            upload_timeout: remote.upload_timeout,
            signed_url_ttl: remote.signed_url_ttl,
        },
    ))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_runtime(&settings, true)?;

    let mut background = Vec::new();
    if let Some(pool) = runtime.pool.as_ref() {
        background.push(pool.spawn_health_monitor());
    }
    if let Some(local) = runtime.orchestrator.local() {
        background.push(spawn_cache_sweeper(
            local.clone(),
            settings.cache.sweep_interval,
        ));
    }

    let result = serve_http(&settings, HttpState::new(runtime.orchestrator.clone())).await;

    for handle in background {
        handle.abort();
        let _ = handle.await;
    }
    runtime.orchestrator.renderer().shutdown().await;
    info!(target = "mermaid_render::shutdown", "Renderer stopped");

    result
}

fn spawn_cache_sweeper(local: LocalCacheStore, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            local.sweep().await;
        }
    })
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state, settings.server.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "mermaid_render::startup",
        addr = %settings.server.addr,
        "Listening"
    );

    let (signalled_tx, mut signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(true);
        },
    );

    let grace = settings.server.graceful_shutdown;
    let drain_deadline = async move {
        if signalled_rx.wait_for(|fired| *fired).await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = drain_deadline => {
            warn!(
                target = "mermaid_render::shutdown",
                grace_secs = grace.as_secs(),
                "Graceful shutdown window elapsed with requests still in flight"
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(
                target = "mermaid_render::shutdown",
                error = %err,
                "Failed to listen for SIGINT"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(
                    target = "mermaid_render::shutdown",
                    error = %err,
                    "Failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!(target = "mermaid_render::shutdown", "Shutdown signal received; draining");
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let code = read_input(&args.input).await?;

    let mut draft = RenderRequestDraft::new(code).format(match args.format {
        FormatArg::Svg => OutputFormat::Svg,
        FormatArg::Png => OutputFormat::Png,
        FormatArg::Pdf => OutputFormat::Pdf,
    });
    if let Some(theme) = args.theme.as_deref() {
        draft = draft.theme(theme.parse::<Theme>()?);
    }
    if let Some(background) = args.background {
        draft = draft.background(background);
    }
    if let Some(scale) = args.scale {
        draft = draft.scale(scale);
    }
    let request = draft.validate()?;

    let runtime = build_runtime(&settings, false)?;
    let result = runtime.orchestrator.execute(RenderCall::raw(request)).await;
    runtime.orchestrator.renderer().shutdown().await;
    let response = result?;

    let Payload::Raw(bytes) = response.payload else {
        return Err(AppError::unexpected("raw delivery produced a non-raw payload"));
    };
    write_output(&args.output, &bytes).await?;

    info!(
        target = "mermaid_render::render",
        fingerprint = %response.fingerprint,
        cache = response.served_from.as_str(),
        bytes = bytes.len(),
        "Diagram rendered"
    );
    Ok(())
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let local = LocalCacheStore::new(&settings.cache.directory, settings.cache.max_age);
    let report = local.sweep().await;
    info!(
        target = "mermaid_render::sweep",
        directory = %settings.cache.directory.display(),
        scanned = report.scanned,
        removed = report.removed,
        "Sweep finished"
    );
    Ok(())
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

async fn read_input(path: &Path) -> Result<String, AppError> {
    if is_stdio(path) {
        let mut code = String::new();
        tokio::io::stdin()
            .read_to_string(&mut code)
            .await
            .map_err(InfraError::from)?;
        return Ok(code);
    }
    Ok(tokio::fs::read_to_string(path)
        .await
        .map_err(InfraError::from)?)
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if is_stdio(path) {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(bytes).await.map_err(InfraError::from)?;
        stdout.flush().await.map_err(InfraError::from)?;
        return Ok(());
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(InfraError::from)?;
    Ok(())
}
