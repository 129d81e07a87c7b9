use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::{
    error::ErrorReport,
    orchestrator::RenderCallError,
    pool::PoolError,
    render::RenderFailure,
};

const SOURCE: &str = "infra::http::error";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const RENDER_TIMEOUT: &str = "render_timeout";
    pub const RENDER: &str = "render_error";
    pub const POOL_EXHAUSTED: &str = "pool_exhausted";
    pub const UPLOAD: &str = "upload_error";
    pub const REMOTE_UNAVAILABLE: &str = "remote_unavailable";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            report: None,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn with_report(mut self, error: &dyn std::error::Error) -> Self {
        self.report = Some(ErrorReport::from_error(SOURCE, self.status, error));
        self
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::new(
                status,
                codes::PAYLOAD_TOO_LARGE,
                "Request body too large",
                Some(rejection.body_text()),
            );
        }
        Self::bad_request("Malformed render request", Some(rejection.body_text()))
    }
}

impl From<RenderCallError> for ApiError {
    fn from(error: RenderCallError) -> Self {
        let api = match &error {
            RenderCallError::Validation(err) => {
                Self::bad_request("Invalid render request", Some(err.to_string()))
            }
            RenderCallError::Render(RenderFailure::Timeout { step, after }) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                codes::RENDER_TIMEOUT,
                "Render timed out",
                Some(format!("step `{step}` exceeded {} ms", after.as_millis())),
            ),
            RenderCallError::Render(RenderFailure::PoolExhausted { .. }) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::POOL_EXHAUSTED,
                "All rendering sessions are busy",
                Some("retry the request shortly".into()),
            ),
            RenderCallError::Render(RenderFailure::Pool(PoolError::ShuttingDown)) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::POOL_EXHAUSTED,
                "Service is shutting down",
                None,
            ),
            RenderCallError::Render(RenderFailure::Pool(_)) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL,
                "Rendering engine unavailable",
                None,
            ),
            RenderCallError::Render(failure) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                codes::RENDER,
                "Diagram could not be rendered",
                Some(match failure {
                    RenderFailure::Render { message } => message.clone(),
                    other => other.to_string(),
                }),
            ),
            RenderCallError::Upload(err) => Self::new(
                StatusCode::BAD_GATEWAY,
                codes::UPLOAD,
                "Durable upload failed",
                Some(err.to_string()),
            ),
            RenderCallError::RemoteUnavailable => Self::new(
                StatusCode::NOT_IMPLEMENTED,
                codes::REMOTE_UNAVAILABLE,
                "URL delivery is not configured",
                Some("use delivery `raw` or `base64`".into()),
            ),
        };
        api.with_report(&error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                SOURCE,
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
