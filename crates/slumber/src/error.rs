use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use slumber_db::{DbError, ErrorKind};
use slumber_feed::FeedError;
use slumber_util_error::FmtCompact as _;
use snafu::Snafu;
use tracing::{debug, warn};

use crate::LOG_TARGET;

/// How error responses are serialized
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RequestError {
    #[snafu(display("Missing X-User-ID header"))]
    Unauthorized,
    #[snafu(display("Invalid X-User-ID header"))]
    InvalidUserHeader,
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(transparent)]
    Feed { source: FeedError },
}
pub type RequestResult<T> = std::result::Result<T, RequestError>;

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            RequestError::Unauthorized => StatusCode::UNAUTHORIZED,
            RequestError::InvalidUserHeader => StatusCode::BAD_REQUEST,
            RequestError::Db { source } => status_for_kind(source.kind()),
            RequestError::Feed { source } => match source {
                FeedError::FeedGraph { source, .. } => status_for_kind(source.kind()),
                FeedError::FeedIndex { .. } | FeedError::QueryTimeout { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FeedError::MalformedHit { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status_code = self.status();

        let message = match status_code {
            StatusCode::INTERNAL_SERVER_ERROR => {
                warn!(target: LOG_TARGET, err = %self.fmt_compact(), "Unexpected Request Error");
                "Internal Service Error".to_owned()
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!(target: LOG_TARGET, err = %self.fmt_compact(), "Dependency unavailable");
                "Service temporarily unavailable".to_owned()
            }
            _ => {
                debug!(target: LOG_TARGET, err = %self.fmt_compact(), "Request Error");
                self.to_string()
            }
        };

        (status_code, Json(ErrorResponse { error: message })).into_response()
    }
}
