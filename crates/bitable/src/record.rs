//! Record inputs and field-name to field-id translation.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use crate::error::BitableError;
use crate::schema::SchemaSnapshot;
use crate::types::RecordPayload;

/// Anything that can produce a record's `(field name, value)` pairs.
///
/// Implemented for plain maps keyed by field name (or id) and for
/// [`Structured`], which wraps any `Serialize` type whose fields are the
/// table's columns.
pub trait RecordSource {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError>;
}

fn to_value<V: Serialize>(key: &str, value: &V) -> Result<Value, BitableError> {
    serde_json::to_value(value)
        .map_err(|e| BitableError::InvalidRecord(format!("field '{key}': {e}")))
}

impl<V: Serialize> RecordSource for BTreeMap<String, V> {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), to_value(k, v)?)))
            .collect()
    }
}

impl<V: Serialize, S: std::hash::BuildHasher> RecordSource for HashMap<String, V, S> {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), to_value(k, v)?)))
            .collect()
    }
}

impl RecordSource for serde_json::Map<String, Value> {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        Ok(self.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl RecordSource for Vec<(String, Value)> {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        Ok(self.clone())
    }
}

impl RecordSource for Value {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        match self {
            Value::Object(map) => map.field_values(),
            other => Err(BitableError::InvalidRecord(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

impl<T: RecordSource + ?Sized> RecordSource for &T {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        (**self).field_values()
    }
}

/// A typed record whose serialized members are field names.
///
/// The value must serialize to an object. Members serialized as `null`
/// (unset `Option`s) are left out so they don't clear columns.
///
/// ```
/// use feishu_bitable::Structured;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Task {
///     #[serde(rename = "Name")]
///     name: String,
///     #[serde(rename = "Priority")]
///     priority: Option<u8>,
/// }
///
/// let task = Task { name: "Write docs".into(), priority: None };
/// let record = Structured(&task);
/// # let _ = record;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Structured<T>(pub T);

impl<T: Serialize> RecordSource for Structured<T> {
    fn field_values(&self) -> Result<Vec<(String, Value)>, BitableError> {
        match serde_json::to_value(&self.0) {
            Ok(Value::Object(map)) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
            Ok(other) => Err(BitableError::InvalidRecord(format!(
                "structured record must serialize to an object, got {other}"
            ))),
            Err(e) => Err(BitableError::InvalidRecord(e.to_string())),
        }
    }
}

/// How record keys are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldKeys {
    /// Keys are field names, resolved through the table schema.
    #[default]
    Names,
    /// Keys are already field ids and are passed through unchanged.
    Ids,
}

/// Converts name-keyed records into id-keyed [`RecordPayload`]s.
///
/// Name resolution fails fast: the first unknown name aborts the whole
/// translation. The API ignores unknown field ids silently, so this is the
/// only place a misspelled field name can be reported.
///
/// Attachment values are not resolved here; they must already be
/// [`AttachmentToken`](crate::AttachmentToken) lists.
#[derive(Debug, Clone, Copy)]
pub struct RecordTranslator<'a> {
    schema: Option<&'a SchemaSnapshot>,
}

impl<'a> RecordTranslator<'a> {
    /// Resolve keys as field names against `schema`.
    pub fn by_name(schema: &'a SchemaSnapshot) -> Self {
        Self {
            schema: Some(schema),
        }
    }

    /// Pass keys through as field ids.
    pub fn by_id() -> Self {
        Self { schema: None }
    }

    /// Resolve one key to a field id.
    pub fn resolve(&self, key: &str) -> Result<String, BitableError> {
        match self.schema {
            Some(schema) => Ok(schema.field_id(key)?.to_owned()),
            None => Ok(key.to_owned()),
        }
    }

    pub fn translate_pairs(
        &self,
        pairs: Vec<(String, Value)>,
    ) -> Result<RecordPayload, BitableError> {
        let mut payload = RecordPayload::new();
        for (key, value) in pairs {
            let field_id = self.resolve(&key)?;
            payload.insert(field_id, value);
        }
        Ok(payload)
    }

    pub fn translate<S: RecordSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<RecordPayload, BitableError> {
        self.translate_pairs(source.field_values()?)
    }

    /// Translate every record, stopping at the first failure.
    pub fn translate_all<S: RecordSource>(
        &self,
        sources: &[S],
    ) -> Result<Vec<RecordPayload>, BitableError> {
        sources.iter().map(|s| self.translate(s)).collect()
    }
}
