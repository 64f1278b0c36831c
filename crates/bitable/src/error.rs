//! Error types for the Bitable client.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Remote operations performed by the client, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    TokenExchange,
    ListFields,
    UploadPrepare,
    UploadPart,
    UploadFinish,
    BatchCreate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TokenExchange => "token exchange",
            Self::ListFields => "list fields",
            Self::UploadPrepare => "upload prepare",
            Self::UploadPart => "upload part",
            Self::UploadFinish => "upload finish",
            Self::BatchCreate => "batch create",
        };
        f.write_str(name)
    }
}

/// Errors that can occur when using the Bitable client.
#[derive(Debug, Error)]
pub enum BitableError {
    /// The credentials were rejected, or a request was still unauthorized
    /// after one forced token refresh.
    #[error("authentication failed: {message}")]
    Auth {
        /// Remote error code, when the API supplied one.
        code: Option<i64>,
        /// Error message.
        message: String,
    },

    /// A token refresh this call was waiting on failed. The source is the
    /// error the refreshing caller received.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] Arc<BitableError>),

    /// Field-name resolution or schema fetch failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The chunked upload protocol failed.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// The API answered with a non-zero error code.
    #[error("{operation} rejected [{code}]: {message}")]
    Api {
        /// Which call was rejected.
        operation: Operation,
        /// Remote error code.
        code: i64,
        /// Remote error message.
        message: String,
    },

    /// Non-2xx response without a parseable API envelope.
    #[error("{operation} failed with HTTP {status}: {message}")]
    Http {
        operation: Operation,
        status: u16,
        message: String,
    },

    /// Network or transport failure.
    #[error("{operation} transport error: {source}")]
    Transport {
        operation: Operation,
        #[source]
        source: reqwest::Error,
    },

    /// The per-request deadline elapsed.
    #[error("{operation} timed out")]
    Timeout { operation: Operation },

    /// The response body could not be decoded.
    #[error("{operation}: failed to deserialize response: {message}")]
    Deserialization {
        operation: Operation,
        message: String,
    },

    /// Reading a local file failed.
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record input could not be turned into field-value pairs.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Client configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Schema lookup failures.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No field in the current snapshot has this exact name.
    #[error("unknown field name: '{0}'")]
    UnknownField(String),

    /// Fetching the table's field metadata failed.
    #[error("failed to fetch table schema: {0}")]
    FetchFailed(#[source] Box<BitableError>),
}

/// The protocol stage an [`UploadError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    Prepare,
    Part,
    Finish,
    Incomplete,
}

/// Chunked upload failures.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The prepare call failed.
    #[error("upload prepare failed: {0}")]
    Prepare(#[source] Box<BitableError>),

    /// The prepare call succeeded but returned an unusable ticket.
    #[error("upload prepare returned a malformed ticket: {0}")]
    MalformedTicket(String),

    /// Uploading a block failed. Blocks are not retried.
    #[error("upload of block {index} failed: {source}")]
    Part {
        index: u32,
        #[source]
        source: Box<BitableError>,
    },

    /// The finish call failed.
    #[error("upload finish failed: {0}")]
    Finish(#[source] Box<BitableError>),

    /// Finish was requested before every block was acknowledged.
    #[error("upload incomplete: {acknowledged} of {block_count} blocks acknowledged")]
    Incomplete { acknowledged: u32, block_count: u32 },

    /// A block was submitted out of sequence.
    #[error("block {got} submitted out of order, expected block {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    /// The session already finished or failed.
    #[error("upload session {upload_id} is closed")]
    Closed { upload_id: String },
}

impl UploadError {
    pub fn stage(&self) -> UploadStage {
        match self {
            Self::Prepare(_) | Self::MalformedTicket(_) => UploadStage::Prepare,
            Self::Part { .. } => UploadStage::Part,
            Self::Finish(_) => UploadStage::Finish,
            Self::Incomplete { .. } | Self::OutOfOrder { .. } | Self::Closed { .. } => {
                UploadStage::Incomplete
            }
        }
    }

    fn inner(&self) -> Option<&BitableError> {
        match self {
            Self::Prepare(e) | Self::Finish(e) | Self::Part { source: e, .. } => {
                Some(e.as_ref())
            }
            _ => None,
        }
    }
}

impl BitableError {
    /// The error wrapped by a schema, refresh or upload failure, if any.
    fn inner(&self) -> Option<&BitableError> {
        match self {
            Self::Schema(SchemaError::FetchFailed(e)) => Some(e.as_ref()),
            Self::RefreshFailed(e) => Some(e.as_ref()),
            Self::Upload(e) => e.inner(),
            _ => None,
        }
    }

    /// Returns `true` if the failure is transient: transport errors,
    /// timeouts and HTTP 5xx.
    ///
    /// The client never retries these itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => self.inner().is_some_and(Self::is_retryable),
        }
    }

    /// Returns `true` if this is (or wraps) an authentication failure.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Auth { .. } => true,
            _ => self.inner().is_some_and(Self::is_auth_error),
        }
    }

    /// Returns `true` for a field name missing from the table schema.
    pub fn is_unknown_field(&self) -> bool {
        matches!(self, Self::Schema(SchemaError::UnknownField(_)))
    }

    /// The remote error code, if the API supplied one.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            Self::Auth { code, .. } => *code,
            _ => self.inner().and_then(Self::remote_code),
        }
    }

    /// The remote operation that failed, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Api { operation, .. }
            | Self::Http { operation, .. }
            | Self::Transport { operation, .. }
            | Self::Timeout { operation }
            | Self::Deserialization { operation, .. } => Some(*operation),
            _ => self.inner().and_then(Self::operation),
        }
    }

    pub(crate) fn from_reqwest(operation: Operation, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { operation }
        } else {
            Self::Transport { operation, source }
        }
    }
}
