use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::application::{
    orchestrator::{Payload, RenderOptions, RenderResponse},
    pool::PoolStatus,
};

use super::{ApiError, CACHE_HEADER, FINGERPRINT_HEADER, HttpState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Base64Body<'a> {
    data: String,
    content_type: &'static str,
    fingerprint: &'a str,
    cache: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UrlBody<'a> {
    url: String,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    fingerprint: &'a str,
    cache: &'static str,
    already_present: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct HealthBody {
    status: &'static str,
    engine: Option<PoolStatus>,
}

pub(super) async fn render(
    State(state): State<HttpState>,
    body: Result<Json<RenderOptions>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(options) = body?;
    let response = state.orchestrator.handle(options).await?;
    Ok(shape(response))
}

pub(super) async fn health(State(state): State<HttpState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        engine: state.orchestrator.renderer().pool_status(),
    })
}

fn shape(response: RenderResponse) -> Response {
    let fingerprint = response.fingerprint.to_string();
    let cache = response.served_from.as_str();
    let content_type = response.content_type();

    let mut rendered = match response.payload {
        Payload::Raw(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Payload::Base64(data) => Json(Base64Body {
            data,
            content_type,
            fingerprint: &fingerprint,
            cache,
        })
        .into_response(),
        Payload::Url {
            key,
            url,
            already_present,
        } => Json(UrlBody {
            url: url.url,
            key,
            expires_at: url.expires_at.and_then(|at| at.format(&Rfc3339).ok()),
            fingerprint: &fingerprint,
            cache,
            already_present,
        })
        .into_response(),
    };

    let headers: &mut HeaderMap = rendered.headers_mut();
    headers.insert(CACHE_HEADER, HeaderValue::from_static(cache));
    if let Ok(value) = HeaderValue::from_str(&fingerprint) {
        headers.insert(FINGERPRINT_HEADER, value);
    }
    rendered
}
