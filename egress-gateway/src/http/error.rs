use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::Error;

/// Body returned with every failed request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    pub message: Option<String>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = match &self {
            Error::JsonConversion(_) | Error::Common(_) => StatusCode::BAD_REQUEST,
            Error::TableMap(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(%self, "request failed");
        let reply = Reply {
            status: "fail".into(),
            message: Some(self.to_string()),
        };
        (code, Json(reply)).into_response()
    }
}
