//! Render request model and boundary validation.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

pub const MIN_SCALE: u8 = 1;
pub const MAX_SCALE: u8 = 10;
pub const DEFAULT_BACKGROUND: &str = "white";
/// Background keyword that disables the opaque fill of raster captures.
pub const TRANSPARENT_BACKGROUND: &str = "transparent";
pub const MAX_DIAGRAM_BYTES: usize = 256 * 1024;
pub const MAX_PINNED_DIMENSION: u32 = 10_000;
const MAX_BACKGROUND_LEN: usize = 64;

/// Requested output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Vector markup.
    #[default]
    Svg,
    /// Raster snapshot.
    Png,
    /// Single-page paged document.
    Pdf,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Svg => "svg",
            OutputFormat::Png => "png",
            OutputFormat::Pdf => "pdf",
        }
    }

    pub fn extension(self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Svg => "image/svg+xml",
            OutputFormat::Png => "image/png",
            OutputFormat::Pdf => "application/pdf",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "svg" | "vector" => Ok(OutputFormat::Svg),
            "png" | "raster" => Ok(OutputFormat::Png),
            "pdf" | "document" => Ok(OutputFormat::Pdf),
            other => Err(DomainError::validation(
                "format",
                format!("unsupported output format `{other}`"),
            )),
        }
    }
}

/// Built-in diagram themes understood by the diagram library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Default,
    Dark,
    Forest,
    Neutral,
    Base,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Default => "default",
            Theme::Dark => "dark",
            Theme::Forest => "forest",
            Theme::Neutral => "neutral",
            Theme::Base => "base",
        }
    }
}

impl FromStr for Theme {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Theme::Default),
            "dark" => Ok(Theme::Dark),
            "forest" => Ok(Theme::Forest),
            "neutral" => Ok(Theme::Neutral),
            "base" => Ok(Theme::Base),
            other => Err(DomainError::validation(
                "theme",
                format!("unknown theme `{other}`"),
            )),
        }
    }
}

/// Unvalidated request parameters as they arrive from a boundary (HTTP body, CLI flags).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderRequestDraft {
    pub code: String,
    pub format: Option<OutputFormat>,
    pub theme: Option<Theme>,
    pub background: Option<String>,
    pub scale: Option<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RenderRequestDraft {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn theme(mut self, theme: Theme) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }

    pub fn scale(mut self, scale: u8) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Validate every field and produce an immutable [`RenderRequest`].
    pub fn validate(self) -> Result<RenderRequest, DomainError> {
        if self.code.trim().is_empty() {
            return Err(DomainError::validation(
                "code",
                "diagram description must not be empty",
            ));
        }
        if self.code.len() > MAX_DIAGRAM_BYTES {
            return Err(DomainError::validation(
                "code",
                format!("diagram description exceeds {MAX_DIAGRAM_BYTES} bytes"),
            ));
        }

        let scale = self.scale.unwrap_or(MIN_SCALE);
        if !(MIN_SCALE..=MAX_SCALE).contains(&scale) {
            return Err(DomainError::validation(
                "scale",
                format!("must be between {MIN_SCALE} and {MAX_SCALE}"),
            ));
        }

        let background = match self.background {
            Some(value) => validate_background(&value)?,
            None => DEFAULT_BACKGROUND.to_string(),
        };

        let width = validate_dimension("width", self.width)?;
        let height = validate_dimension("height", self.height)?;

        Ok(RenderRequest {
            code: self.code,
            format: self.format.unwrap_or_default(),
            theme: self.theme.unwrap_or_default(),
            background,
            scale,
            width,
            height,
        })
    }
}

fn validate_background(value: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_BACKGROUND.to_string());
    }
    if trimmed.len() > MAX_BACKGROUND_LEN {
        return Err(DomainError::validation(
            "background",
            format!("must be at most {MAX_BACKGROUND_LEN} characters"),
        ));
    }
    // The value is interpolated into generated CSS; only color literal characters pass.
    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '#' | '(' | ')' | ',' | '.' | '%' | ' ' | '-')
    };
    if !trimmed.chars().all(allowed) {
        return Err(DomainError::validation(
            "background",
            format!("`{trimmed}` is not a color literal or keyword"),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_dimension(field: &'static str, value: Option<u32>) -> Result<Option<u32>, DomainError> {
    match value {
        Some(0) => Err(DomainError::validation(field, "must be greater than zero")),
        Some(v) if v > MAX_PINNED_DIMENSION => Err(DomainError::validation(
            field,
            format!("must not exceed {MAX_PINNED_DIMENSION}"),
        )),
        other => Ok(other),
    }
}

/// Fully validated, immutable render parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    code: String,
    format: OutputFormat,
    theme: Theme,
    background: String,
    scale: u8,
    width: Option<u32>,
    height: Option<u32>,
}

impl RenderRequest {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn background(&self) -> &str {
        &self.background
    }

    pub fn is_transparent(&self) -> bool {
        self.background.eq_ignore_ascii_case(TRANSPARENT_BACKGROUND)
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }
}
