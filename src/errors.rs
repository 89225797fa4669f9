use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

// --- Domain/Infrastructure Errors ---

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Stored record could not be decoded: {0}")]
    DataCorruption(String),

    #[error("Database backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File upload failed: {0}")]
    UploadFailed(String),

    #[error("File not found with key: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}

// --- Web Layer Error ---

#[derive(Error, Debug)]
pub enum AppError {
    // Input validation / request parsing errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Missing form field: {0}")]
    MissingFormField(String),
    #[error("Error processing multipart form data: {0}")]
    MultipartError(#[from] axum::extract::multipart::MultipartError),

    // Access
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Lookups
    #[error("Meme not found with ID: {0}")]
    MemeNotFound(String),
    #[error("Template not found with ID: {0}")]
    TemplateNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Already exists: {0}")]
    Conflict(String),

    // Domain/Service level errors (mapped from RepoError/StorageError)
    #[error("Could not access meme data")]
    RepositoryError(#[source] RepoError),
    #[error("Could not perform file storage operation")]
    StorageError(#[source] StorageError),

    // Configuration / Startup errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Initialization error: {0}")]
    InitError(String),

    // Generic Internal Server Error
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

// --- Conversions from Domain Errors to AppError ---

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Conflict(what) => AppError::Conflict(what),
            e => AppError::RepositoryError(e),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::StorageError(err)
    }
}

impl From<crate::config::ConfigError> for AppError {
    fn from(err: crate::config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<aws_smithy_types::error::operation::BuildError> for AppError {
    fn from(err: aws_smithy_types::error::operation::BuildError) -> Self {
        AppError::InitError(format!("Failed to build AWS request: {}", err))
    }
}

// --- Axum Response Implementation ---

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            // 4xx Client Errors
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::MissingFormField(field) => (StatusCode::BAD_REQUEST, format!("Missing form field: {}", field)),
            AppError::MultipartError(e) => (StatusCode::BAD_REQUEST, format!("Invalid multipart form data: {}", e)),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::MemeNotFound(id) => (StatusCode::NOT_FOUND, format!("Meme not found with ID: {}", id)),
            AppError::TemplateNotFound(id) => (StatusCode::NOT_FOUND, format!("Template not found with ID: {}", id)),
            AppError::UserNotFound(name) => (StatusCode::NOT_FOUND, format!("User not found: {}", name)),
            AppError::Conflict(what) => (StatusCode::CONFLICT, format!("Already exists: {}", what)),

            // 5xx Server Errors
            AppError::RepositoryError(e) => {
                tracing::error!(error.source = ?e, "Repository error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database operation failed".to_string())
            },
            AppError::StorageError(e) => {
                tracing::error!(error.source = ?e, "Storage error occurred");
                (StatusCode::INTERNAL_SERVER_ERROR, "File storage operation failed".to_string())
            },
            AppError::ConfigError(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error".to_string())
            },
            AppError::InitError(msg) => {
                tracing::error!("Initialization error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server initialization error".to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal server error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal server error occurred".to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!(error.message=%error_message, error.detail=%self, "Responding with error");
        } else {
            tracing::debug!(error.message=%error_message, error.status=%status, "Responding with client error");
        }

        let body = Json(serde_json::json!({ "error": error_message }));
        (status, body).into_response()
    }
}

// Helper macro for creating internal server errors with context
macro_rules! internal_error {
    ($err:expr) => {
        $crate::errors::AppError::InternalServerError(format!("{}: {}", std::line!(), $err))
    };
     ($fmt:expr, $($arg:tt)*) => {
        $crate::errors::AppError::InternalServerError(format!(concat!("{}: ", $fmt), std::line!(), $($arg)*))
    };
}
pub(crate) use internal_error;
