use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cm_fleet::FleetError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Fleet(#[from] FleetError),

    #[error("fleet config error: {0}")]
    Config(#[from] cm_fleet::Error),

    #[error("timed out waiting for the vps")]
    Timeout,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Fleet(FleetError::TypeNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Fleet(FleetError::Full(_) | FleetError::NotConnected(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Fleet(FleetError::Unknown) => StatusCode::BAD_GATEWAY,
            ApiError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(error: impl Into<ApiError>) -> StatusCode {
        error.into().into_response().status()
    }

    #[test]
    fn maps_fleet_errors() {
        assert_eq!(status(FleetError::TypeNotFound("X".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(FleetError::Full("X".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(FleetError::NotConnected("vps01".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(FleetError::Unknown), StatusCode::BAD_GATEWAY);
        assert_eq!(status(ApiError::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }
}
