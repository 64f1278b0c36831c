//! Client for Feishu (Lark) Bitable tables.
//!
//! Records are written by field name: the table schema is fetched once and
//! used to translate names into the field ids the Open API expects. Files
//! are uploaded with the Drive chunked upload protocol and attached to
//! records as [`AttachmentToken`]s. Tenant access tokens are cached and
//! refreshed transparently.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use feishu_bitable::{Bitable, FieldKeys};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), feishu_bitable::BitableError> {
//! let table = Bitable::new("cli_xxx", "app_secret", "bascnXXXX", "tblXXXX");
//! let record_id = table
//!     .create_record(&json!({"Name": "Alice", "Email": "alice@example.com"}), FieldKeys::Names)
//!     .await?;
//! println!("created {record_id}");
//! # Ok(())
//! # }
//! ```
//!
//! The lower-level [`BitableClient`] works with field ids directly and can
//! be shared between several [`Bitable`] tables.

pub mod bitable;
pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod schema;
pub mod token;
pub mod types;
pub mod upload;

#[cfg(test)]
mod testing;

pub use bitable::Bitable;
pub use client::BitableClient;
pub use config::BitableConfig;
pub use error::{BitableError, Operation, SchemaError, UploadError, UploadStage};
pub use record::{FieldKeys, RecordSource, RecordTranslator, Structured};
pub use schema::{SchemaCache, SchemaSnapshot};
pub use token::{Credential, TokenStore};
pub use types::{
    AttachmentToken, FieldMetadata, FieldType, RecordPayload, UploadPrepareRequest,
    UploadPrepareResponse,
};
pub use upload::{UploadSession, UploadState, UploadTicket, UploadTransport};
