use axum::response::IntoResponse;
use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    App(#[from] crate::app::error::Error),
    #[error(transparent)]
    Pool(#[from] crate::pool::Error),
    #[error("malformed request body: {0}")]
    InvalidSerialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn pool_error_status(e: &crate::pool::Error) -> StatusCode {
    match e {
        crate::pool::Error::PoolExhausted | crate::pool::Error::GapLimit => StatusCode::SERVICE_UNAVAILABLE,
        crate::pool::Error::ChainError(_) => StatusCode::BAD_GATEWAY,
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Pool(e) => pool_error_status(e),
            Self::App(crate::app::error::Error::Pool(e)) => pool_error_status(e),
            Self::App(crate::app::error::Error::Other(_)) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidSerialization(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}
