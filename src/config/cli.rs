use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mermaid-render binary.
#[derive(Debug, Parser)]
#[command(
    name = "mermaid-render",
    version,
    about = "Diagram rendering service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MERMAID_RENDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP rendering service.
    Serve(Box<ServeArgs>),
    /// Render one diagram and exit.
    Render(RenderArgs),
    /// Remove expired entries from the local cache and exit.
    Sweep(SweepArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    Pool,
    Cli,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the rendering backend.
    #[arg(long = "render-engine", value_name = "ENGINE", value_enum)]
    pub engine: Option<EngineArg>,

    /// Override the maximum number of concurrent rendering sessions.
    #[arg(long = "pool-max-sessions", value_name = "COUNT")]
    pub max_sessions: Option<usize>,

    /// Override the local cache directory.
    #[arg(long = "cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Svg,
    Png,
    Pdf,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Diagram source file, or `-` for stdin.
    #[arg(long, short, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub input: PathBuf,

    /// Destination file, or `-` for stdout.
    #[arg(long, short, value_name = "FILE", default_value = "-")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = FormatArg::Svg)]
    pub format: FormatArg,

    /// Diagram theme (default|dark|forest|neutral|base).
    #[arg(long)]
    pub theme: Option<String>,

    /// Background colour or `transparent`.
    #[arg(long)]
    pub background: Option<String>,

    /// Output density multiplier (1-10).
    #[arg(long)]
    pub scale: Option<u8>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    /// Override the local cache directory.
    #[arg(long = "cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,
}
