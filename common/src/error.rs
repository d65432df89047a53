use thiserror::Error;

use crate::{http::StatusCode, types::ErrorBody};

/// A single read attempt that produced no value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("sensor not initialized")]
    NotInitialized,
    #[error("read timed out after {0} us")]
    Timeout(u32),
    #[error("sensor returned a non-finite value")]
    InvalidData,
    #[error("driver error: {0}")]
    Driver(String),
}

/// Handler-level failures, each mapping to one HTTP status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("Not Found")]
    NotFound,
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("No data or failed operation")]
    NoData,
    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NotFound,
            Self::MethodNotAllowed => StatusCode::MethodNotAllowed,
            Self::BadRequest(_) => StatusCode::BadRequest,
            Self::Unauthorized => StatusCode::Unauthorized,
            Self::NoData | Self::Internal(_) => StatusCode::InternalServerError,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (error, detail) = match self {
            Self::BadRequest(detail) | Self::Internal(detail) => {
                (self.status().reason().to_string(), Some(detail.clone()))
            }
            _ => (self.to_string(), None),
        };
        ErrorBody { error, detail }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network link is down; refusing to listen")]
    NetworkDown,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
