//! Generated HTML document that hosts one diagram inside the engine.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::json;
use tempfile::NamedTempFile;
use url::Url;

use crate::domain::request::RenderRequest;

const HELPER_SCRIPT: &str = include_str!("helper.js");

/// Body attribute the helper sets once the diagram library finished (or failed).
pub(crate) const READY_SELECTOR: &str = "body[data-render-state]";
/// Element captured for raster output.
pub(crate) const DIAGRAM_SELECTOR: &str = "#container svg";

/// Body of an `evaluate` call invoking one helper function.
pub(crate) fn helper_call(call: &str) -> String {
    format!("return window.__mermaidRender.{call};")
}

/// Turn the configured library location into something the engine can load.
///
/// `http(s)` URLs pass through; anything else is treated as a filesystem path.
pub fn library_url(location: &str) -> io::Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Url::parse(location)
            .map(String::from)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err));
    }
    file_url(&std::path::absolute(location)?)
}

fn file_url(path: &Path) -> io::Result<String> {
    Url::from_file_path(path).map(String::from).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` cannot be expressed as a file URL", path.display()),
        )
    })
}

/// Temporary document on disk. The file is removed when this value drops.
#[derive(Debug)]
pub(crate) struct RenderDocument {
    file: NamedTempFile,
    url: String,
}

impl RenderDocument {
    pub(crate) async fn create(
        work_dir: &Path,
        library_url: &str,
        request: &RenderRequest,
    ) -> io::Result<Self> {
        let work_dir: PathBuf = work_dir.to_path_buf();
        let html = page_html(library_url, request);
        tokio::task::spawn_blocking(move || Self::write(&work_dir, &html))
            .await
            .map_err(io::Error::other)?
    }

    fn write(work_dir: &Path, html: &str) -> io::Result<Self> {
        std::fs::create_dir_all(work_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("diagram-")
            .suffix(".html")
            .tempfile_in(work_dir)?;
        file.write_all(html.as_bytes())?;
        file.flush()?;
        let url = file_url(&std::path::absolute(file.path())?)?;
        Ok(Self { file, url })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }
}

fn page_html(library_url: &str, request: &RenderRequest) -> String {
    let config = json!({
        "code": request.code(),
        "theme": request.theme().as_str(),
        "background": request.background(),
        "width": request.width(),
        "height": request.height(),
    });
    // A literal `</script>` inside the diagram text would close the inline script.
    let config = config.to_string().replace("</", "<\\/");
    let library = html_attribute(library_url);
    let background = request.background();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
html, body {{ margin: 0; padding: 0; background: {background}; }}
#container {{ display: inline-block; }}
</style>
<script src="{library}"></script>
<script>{HELPER_SCRIPT}</script>
</head>
<body>
<div id="container"></div>
<script>window.__mermaidRender.start({config});</script>
</body>
</html>
"#
    )
}

fn html_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
