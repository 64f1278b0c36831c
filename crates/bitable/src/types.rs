use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column type codes used by the Bitable API (`type` in field metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum FieldType {
    /// Text, barcode and email columns.
    Text,
    /// Number, progress, currency and rating columns.
    Number,
    SingleSelect,
    MultiSelect,
    DateTime,
    Checkbox,
    User,
    Phone,
    Url,
    Attachment,
    SingleLink,
    Lookup,
    Formula,
    DuplexLink,
    Location,
    GroupChat,
    Stage,
    CreatedTime,
    ModifiedTime,
    CreatedUser,
    ModifiedUser,
    AutoNumber,
    Button,
    /// A type code this client does not know about.
    Unknown(u32),
}

impl From<u32> for FieldType {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::Text,
            2 => Self::Number,
            3 => Self::SingleSelect,
            4 => Self::MultiSelect,
            5 => Self::DateTime,
            7 => Self::Checkbox,
            11 => Self::User,
            13 => Self::Phone,
            15 => Self::Url,
            17 => Self::Attachment,
            18 => Self::SingleLink,
            19 => Self::Lookup,
            20 => Self::Formula,
            21 => Self::DuplexLink,
            22 => Self::Location,
            23 => Self::GroupChat,
            24 => Self::Stage,
            1001 => Self::CreatedTime,
            1002 => Self::ModifiedTime,
            1003 => Self::CreatedUser,
            1004 => Self::ModifiedUser,
            1005 => Self::AutoNumber,
            3001 => Self::Button,
            other => Self::Unknown(other),
        }
    }
}

impl From<FieldType> for u32 {
    fn from(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Text => 1,
            FieldType::Number => 2,
            FieldType::SingleSelect => 3,
            FieldType::MultiSelect => 4,
            FieldType::DateTime => 5,
            FieldType::Checkbox => 7,
            FieldType::User => 11,
            FieldType::Phone => 13,
            FieldType::Url => 15,
            FieldType::Attachment => 17,
            FieldType::SingleLink => 18,
            FieldType::Lookup => 19,
            FieldType::Formula => 20,
            FieldType::DuplexLink => 21,
            FieldType::Location => 22,
            FieldType::GroupChat => 23,
            FieldType::Stage => 24,
            FieldType::CreatedTime => 1001,
            FieldType::ModifiedTime => 1002,
            FieldType::CreatedUser => 1003,
            FieldType::ModifiedUser => 1004,
            FieldType::AutoNumber => 1005,
            FieldType::Button => 3001,
            FieldType::Unknown(code) => code,
        }
    }
}

/// Metadata for one table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Stable, opaque column id used in API payloads.
    pub field_id: String,

    /// Human-readable column label. Can be renamed upstream.
    pub field_name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Display type (e.g. `"Email"`, `"Progress"`), finer grained than
    /// `field_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_type: Option<String>,

    #[serde(default)]
    pub is_primary: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Value>,

    /// Type-specific column properties, kept as raw JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<Value>,
}

impl FieldMetadata {
    pub fn new(
        field_id: impl Into<String>,
        field_name: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            field_id: field_id.into(),
            field_name: field_name.into(),
            field_type,
            ui_type: None,
            is_primary: false,
            description: None,
            property: None,
        }
    }

    #[must_use]
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn is_attachment(&self) -> bool {
        self.field_type == FieldType::Attachment
    }
}

/// Reference to an uploaded file, embedded in attachment field values.
///
/// Serializes to the object shape the record API expects inside an
/// attachment column's list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentToken {
    pub file_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// MIME type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl AttachmentToken {
    pub fn new(file_token: impl Into<String>) -> Self {
        Self {
            file_token: file_token.into(),
            name: None,
            size: None,
            mime_type: None,
        }
    }
}

/// One record's fields keyed by field id, ready for batch creation.
///
/// Serializes to `{"fields": {...}}`, the element shape of the batch create
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordPayload {
    pub fields: serde_json::Map<String, Value>,
}

impl RecordPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field_id: impl Into<String>, value: Value) {
        self.fields.insert(field_id.into(), value);
    }

    pub fn get(&self, field_id: &str) -> Option<&Value> {
        self.fields.get(field_id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Common response envelope of the Open API.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Request body for the tenant token exchange.
#[derive(Debug, Serialize)]
pub(crate) struct TenantTokenRequest<'a> {
    pub app_id: &'a str,
    pub app_secret: &'a str,
}

/// Response of the tenant token exchange. Not wrapped in `data`.
#[derive(Debug, Deserialize)]
pub(crate) struct TenantTokenResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub tenant_access_token: Option<String>,
    /// Lifetime in seconds.
    pub expire: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListFieldsData {
    #[serde(default)]
    pub items: Vec<FieldMetadata>,
    #[serde(default)]
    pub has_more: bool,
    pub page_token: Option<String>,
}

/// Request body of the upload prepare call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPrepareRequest {
    pub file_name: String,
    pub parent_type: String,
    pub parent_node: String,
    pub size: u64,
}

/// Raw response of the upload prepare call, validated into an
/// [`UploadTicket`](crate::upload::UploadTicket) by the upload session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadPrepareResponse {
    pub upload_id: String,
    pub block_size: i64,
    pub block_num: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadFinishRequest<'a> {
    pub upload_id: &'a str,
    pub block_num: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadFinishData {
    pub file_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchCreateRequest<'a> {
    pub records: &'a [RecordPayload],
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchCreateData {
    #[serde(default)]
    pub records: Vec<CreatedRecord>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedRecord {
    pub record_id: String,
}
