//! Caller-visible error taxonomy.
//!
//! Every failure that leaves the extraction pipeline is one of five
//! categories. Decoders and the archive extractor raise the most specific
//! category they can; anything unrecognized is narrowed into
//! [`ExtractError::Internal`] with the original message kept for logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of an [`ExtractError`], serializable so it can cross the
/// worker process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ClientTimeout,
    EntityTooLarge,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("client timeout: {0}")]
    ClientTimeout(String),

    #[error("entity too large: {0}")]
    EntityTooLarge(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExtractError>;

impl ExtractError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::ClientTimeout => Self::ClientTimeout(message),
            ErrorKind::EntityTooLarge => Self::EntityTooLarge(message),
            ErrorKind::BadRequest => Self::BadRequest(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ClientTimeout(_) => ErrorKind::ClientTimeout,
            Self::EntityTooLarge(_) => ErrorKind::EntityTooLarge,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without its category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::ClientTimeout(m)
            | Self::EntityTooLarge(m)
            | Self::BadRequest(m)
            | Self::Internal(m) => m,
        }
    }

    /// A shapefile component-set violation, reported as a bad request
    /// whose message starts with the domain code.
    pub fn shapefile(code: ShapefileErrorCode, detail: impl fmt::Display) -> Self {
        Self::BadRequest(format!("{}: {detail}", code.as_str()))
    }

    /// Recover the shapefile domain code embedded in a bad request, if any.
    pub fn shapefile_code(&self) -> Option<ShapefileErrorCode> {
        match self {
            Self::BadRequest(message) => ShapefileErrorCode::ALL
                .into_iter()
                .find(|code| message.starts_with(code.as_str())),
            _ => None,
        }
    }

    /// Narrow an arbitrary error chain into the taxonomy.
    ///
    /// An `ExtractError` anywhere in the chain is returned unchanged;
    /// anything else becomes `Internal("<context>: <cause chain>")`.
    pub fn from_anyhow(err: anyhow::Error, context: &str) -> Self {
        if let Some(domain) = err.chain().find_map(|e| e.downcast_ref::<ExtractError>()) {
            return domain.clone();
        }
        Self::Internal(format!("{context}: {err:#}"))
    }
}

/// Domain codes for a zipped shapefile that fails the component-set check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapefileErrorCode {
    MissingCoreFiles,
    MissingPrjFile,
    PrjFileTooLarge,
}

impl ShapefileErrorCode {
    const ALL: [ShapefileErrorCode; 3] = [
        ShapefileErrorCode::MissingCoreFiles,
        ShapefileErrorCode::MissingPrjFile,
        ShapefileErrorCode::PrjFileTooLarge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShapefileErrorCode::MissingCoreFiles => "SHAPEFILE_MISSING_CORE_FILES",
            ShapefileErrorCode::MissingPrjFile => "SHAPEFILE_MISSING_PRJ_FILE",
            ShapefileErrorCode::PrjFileTooLarge => "SHAPEFILE_PRJ_FILE_TOO_LARGE",
        }
    }
}

impl fmt::Display for ShapefileErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
