//! Table schema snapshots and the per-client schema cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BitableError, SchemaError};
use crate::types::FieldMetadata;

/// Field metadata of one table at the moment it was fetched.
///
/// Field names are assumed unique within a snapshot. If the API ever
/// returns two fields with the same name, lookups resolve to the first one
/// and a warning is logged; the snapshot is not otherwise corrected.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    fields: Vec<FieldMetadata>,
    by_name: HashMap<String, usize>,
    fetched_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    pub fn new(fields: Vec<FieldMetadata>) -> Self {
        Self::new_at(fields, Utc::now())
    }

    pub fn new_at(fields: Vec<FieldMetadata>, fetched_at: DateTime<Utc>) -> Self {
        let mut by_name = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            if by_name.contains_key(&field.field_name) {
                warn!(
                    field_name = %field.field_name,
                    field_id = %field.field_id,
                    "duplicate field name in table schema; keeping the first"
                );
                continue;
            }
            by_name.insert(field.field_name.clone(), position);
        }
        Self {
            fields,
            by_name,
            fetched_at,
        }
    }

    /// Fields in the order the API returned them.
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Exact, case-sensitive lookup by field name.
    pub fn field(&self, field_name: &str) -> Option<&FieldMetadata> {
        self.by_name.get(field_name).map(|&i| &self.fields[i])
    }

    /// Resolve a field name to its id.
    pub fn field_id(&self, field_name: &str) -> Result<&str, SchemaError> {
        self.field(field_name)
            .map(|f| f.field_id.as_str())
            .ok_or_else(|| SchemaError::UnknownField(field_name.to_owned()))
    }

    pub fn field_by_id(&self, field_id: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    pub fn primary_field(&self) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.is_primary)
    }
}

/// Fetch-once cache of a table's [`SchemaSnapshot`].
///
/// The snapshot is kept until an explicit forced refresh; there is no TTL,
/// so long-lived processes that expect upstream schema changes must refresh
/// themselves. Readers get an `Arc` to the snapshot they started with, so a
/// refresh never changes a snapshot mid-use. Refreshes are serialized.
#[derive(Debug, Default)]
pub struct SchemaCache {
    snapshot: RwLock<Option<Arc<SchemaSnapshot>>>,
    refresh: Mutex<()>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached snapshot, without fetching.
    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Return the cached snapshot, calling `fetch` when there is none or
    /// `force` is set. A failed fetch leaves the previous snapshot in place.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        force: bool,
        fetch: F,
    ) -> Result<Arc<SchemaSnapshot>, BitableError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<FieldMetadata>, BitableError>>,
    {
        if !force && let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let _guard = self.refresh.lock().await;
        if !force && let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let fields = fetch()
            .await
            .map_err(|e| SchemaError::FetchFailed(Box::new(e)))?;
        let snapshot = Arc::new(SchemaSnapshot::new(fields));
        debug!(fields = snapshot.len(), "table schema cached");
        *self.snapshot.write() = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
