use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::client::BitableClient;
use crate::error::{BitableError, Operation};
use crate::record::{FieldKeys, RecordSource, RecordTranslator};
use crate::schema::{SchemaCache, SchemaSnapshot};
use crate::types::{AttachmentToken, RecordPayload};

/// One table, addressed by field names.
///
/// Wraps a [`BitableClient`] with the table's coordinates and a
/// [`SchemaCache`], so records can be written as `name -> value` maps. The
/// schema is fetched on first use and kept for the life of the value.
#[derive(Debug)]
pub struct Bitable {
    client: BitableClient,
    app_token: String,
    table_id: String,
    schema: SchemaCache,
}

impl Bitable {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        app_token: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self::with_client(BitableClient::new(app_id, app_secret), app_token, table_id)
    }

    /// Address a table through an existing client. Clients are cheap to
    /// clone and share their token cache.
    pub fn with_client(
        client: BitableClient,
        app_token: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            app_token: app_token.into(),
            table_id: table_id.into(),
            schema: SchemaCache::new(),
        }
    }

    pub fn client(&self) -> &BitableClient {
        &self.client
    }

    pub fn app_token(&self) -> &str {
        &self.app_token
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    /// The table schema, fetched on first call or when `force` is set.
    pub async fn schema(&self, force: bool) -> Result<Arc<SchemaSnapshot>, BitableError> {
        self.schema
            .get_or_fetch(force, || {
                self.client.get_table_fields(&self.app_token, &self.table_id)
            })
            .await
    }

    pub async fn table_schema(&self) -> Result<Arc<SchemaSnapshot>, BitableError> {
        self.schema(false).await
    }

    /// Fetch the schema again, replacing the cached snapshot.
    pub async fn refresh_schema(&self) -> Result<Arc<SchemaSnapshot>, BitableError> {
        self.schema(true).await
    }

    /// Resolve a field name to its id.
    pub async fn field_id(&self, field_name: &str) -> Result<String, BitableError> {
        let schema = self.schema(false).await?;
        Ok(schema.field_id(field_name)?.to_owned())
    }

    /// Upload a file into this table's app, ready to be set on an
    /// attachment field.
    pub async fn upload_attachment(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<AttachmentToken, BitableError> {
        let parent_type = &self.client.config().attachment_parent_type;
        self.client
            .upload_file(path, parent_type, &self.app_token)
            .await
    }

    /// Create one record and return its id.
    #[instrument(skip(self, record), fields(table_id = %self.table_id))]
    pub async fn create_record<S: RecordSource + ?Sized>(
        &self,
        record: &S,
        keys: FieldKeys,
    ) -> Result<String, BitableError> {
        let snapshot = self.snapshot_for(keys).await?;
        let payload = translator(snapshot.as_deref()).translate(record)?;
        self.create_one(payload).await
    }

    /// Create many records with a single batch call.
    ///
    /// Every record is translated before anything is sent; one bad field
    /// name fails the whole batch. An empty slice makes no calls at all.
    #[instrument(skip(self, records), fields(table_id = %self.table_id, count = records.len()))]
    pub async fn create_records<S: RecordSource>(
        &self,
        records: &[S],
        keys: FieldKeys,
    ) -> Result<Vec<String>, BitableError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let snapshot = self.snapshot_for(keys).await?;
        let payloads = translator(snapshot.as_deref()).translate_all(records)?;
        self.client
            .batch_create_records(&self.app_token, &self.table_id, &payloads)
            .await
    }

    /// Upload attachment files, then create a record referencing them.
    ///
    /// `attachments` maps an attachment field to the files to upload into
    /// it; the resulting tokens replace any value `record` has for that
    /// field. Field names are resolved before the first upload, files are
    /// uploaded one at a time, and any failure aborts before the record is
    /// created.
    #[instrument(
        skip(self, record, attachments),
        fields(table_id = %self.table_id, attachment_fields = attachments.len())
    )]
    pub async fn upload_and_create_record<S: RecordSource + ?Sized>(
        &self,
        record: &S,
        attachments: &BTreeMap<String, Vec<PathBuf>>,
        keys: FieldKeys,
    ) -> Result<String, BitableError> {
        let snapshot = self.snapshot_for(keys).await?;
        let translator = translator(snapshot.as_deref());

        let mut payload = translator.translate(record)?;
        let mut targets = Vec::with_capacity(attachments.len());
        for (field, paths) in attachments {
            let field_id = translator.resolve(field)?;
            if let Some(meta) = snapshot.as_deref().and_then(|s| s.field_by_id(&field_id))
                && !meta.is_attachment()
            {
                warn!(
                    field_name = %field,
                    field_type = ?meta.field_type,
                    "uploading files into a field that is not an attachment field"
                );
            }
            targets.push((field_id, paths));
        }

        for (field_id, paths) in targets {
            let mut tokens = Vec::with_capacity(paths.len());
            for path in paths {
                tokens.push(self.upload_attachment(path).await?);
            }
            debug!(field_id = %field_id, files = tokens.len(), "attachments uploaded");
            let value = serde_json::to_value(&tokens)
                .map_err(|e| BitableError::InvalidRecord(e.to_string()))?;
            payload.insert(field_id, value);
        }

        self.create_one(payload).await
    }

    async fn snapshot_for(
        &self,
        keys: FieldKeys,
    ) -> Result<Option<Arc<SchemaSnapshot>>, BitableError> {
        match keys {
            FieldKeys::Names => Ok(Some(self.schema(false).await?)),
            FieldKeys::Ids => Ok(None),
        }
    }

    async fn create_one(&self, payload: RecordPayload) -> Result<String, BitableError> {
        let ids = self
            .client
            .batch_create_records(&self.app_token, &self.table_id, &[payload])
            .await?;
        let record_id = ids
            .into_iter()
            .next()
            .ok_or_else(|| BitableError::Deserialization {
                operation: Operation::BatchCreate,
                message: "no record id returned".into(),
            })?;
        info!(record_id = %record_id, "record created");
        Ok(record_id)
    }
}

fn translator(snapshot: Option<&SchemaSnapshot>) -> RecordTranslator<'_> {
    snapshot.map_or_else(RecordTranslator::by_id, RecordTranslator::by_name)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::error::UploadError;
    use crate::record::Structured;
    use crate::testing::{
        FINISH_PATH, MockApi, MockResponse, PART_PATH, PREPARE_PATH, TOKEN_PATH,
        batch_create_path, fields_path,
    };

    const APP: &str = "app1";
    const TABLE: &str = "tbl1";

    fn schema_response() -> MockResponse {
        MockResponse::ok(json!({
            "items": [
                {"field_id": "fld1", "field_name": "Name", "type": 1, "is_primary": true},
                {"field_id": "fld2", "field_name": "Email", "type": 1},
                {"field_id": "fld3", "field_name": "Files", "type": 17},
            ],
            "has_more": false,
        }))
    }

    async fn table() -> (MockApi, Bitable) {
        let server = MockApi::start().await;
        server
            .on("POST", TOKEN_PATH, MockResponse::token("t-1", 7200))
            .on("GET", &fields_path(APP, TABLE), schema_response());
        let client = BitableClient::with_config(server.config()).unwrap();
        (server, Bitable::with_client(client, APP, TABLE))
    }

    fn created(ids: &[&str]) -> MockResponse {
        let records: Vec<Value> = ids.iter().map(|id| json!({"record_id": id})).collect();
        MockResponse::ok(json!({ "records": records }))
    }

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bitable-facade-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn upload_routes(server: &MockApi, file_token: &str) {
        server
            .on(
                "POST",
                PREPARE_PATH,
                MockResponse::ok(json!({"upload_id": "up-1", "block_size": 4_194_304, "block_num": 1})),
            )
            .on("POST", PART_PATH, MockResponse::ok(json!({})))
            .on("POST", FINISH_PATH, MockResponse::ok(json!({ "file_token": file_token })));
    }

    #[tokio::test]
    async fn create_record_sends_field_ids() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        let record_id = table
            .create_record(&json!({"Name": "A", "Email": "a@x.com"}), FieldKeys::Names)
            .await
            .unwrap();

        assert_eq!(record_id, "rec1");
        let batch = server.requests_to(&batch_create_path(APP, TABLE));
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].json(),
            json!({"records": [{"fields": {"fld1": "A", "fld2": "a@x.com"}}]})
        );
    }

    #[tokio::test]
    async fn unknown_field_name_never_reaches_batch_create() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        let err = table
            .create_record(&json!({"Name": "A", "Emial": "a@x.com"}), FieldKeys::Names)
            .await
            .unwrap_err();

        assert!(err.is_unknown_field());
        assert_eq!(server.hits(&batch_create_path(APP, TABLE)), 0);
    }

    #[tokio::test]
    async fn field_ids_skip_schema_fetch() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        table
            .create_record(&json!({"fldX": "raw"}), FieldKeys::Ids)
            .await
            .unwrap();

        assert_eq!(server.hits(&fields_path(APP, TABLE)), 0);
        let batch = server.requests_to(&batch_create_path(APP, TABLE));
        assert_eq!(batch[0].json(), json!({"records": [{"fields": {"fldX": "raw"}}]}));
    }

    #[tokio::test]
    async fn create_records_empty_makes_no_requests() {
        let (server, table) = table().await;
        let ids = table
            .create_records::<Value>(&[], FieldKeys::Names)
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn create_records_uses_one_batch_call() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1", "rec2", "rec3"]));

        let records = vec![
            json!({"Name": "A"}),
            json!({"Name": "B"}),
            json!({"Name": "C", "Email": "c@x.com"}),
        ];
        let ids = table.create_records(&records, FieldKeys::Names).await.unwrap();

        assert_eq!(ids, vec!["rec1", "rec2", "rec3"]);
        let batch = server.requests_to(&batch_create_path(APP, TABLE));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].json()["records"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn structured_records_are_accepted() {
        #[derive(serde::Serialize)]
        struct Contact {
            #[serde(rename = "Name")]
            name: &'static str,
            #[serde(rename = "Email")]
            email: Option<&'static str>,
        }

        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        let contact = Contact {
            name: "A",
            email: None,
        };
        table
            .create_record(&Structured(&contact), FieldKeys::Names)
            .await
            .unwrap();

        let batch = server.requests_to(&batch_create_path(APP, TABLE));
        assert_eq!(batch[0].json(), json!({"records": [{"fields": {"fld1": "A"}}]}));
    }

    #[tokio::test]
    async fn schema_is_fetched_once_across_calls() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        table.create_record(&json!({"Name": "A"}), FieldKeys::Names).await.unwrap();
        table.create_record(&json!({"Name": "B"}), FieldKeys::Names).await.unwrap();
        assert_eq!(table.field_id("Email").await.unwrap(), "fld2");

        assert_eq!(server.hits(&fields_path(APP, TABLE)), 1);
        assert_eq!(server.hits(TOKEN_PATH), 1);
    }

    #[tokio::test]
    async fn refresh_schema_fetches_again() {
        let (server, table) = table().await;
        let first = table.table_schema().await.unwrap();
        let second = table.refresh_schema().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.primary_field().unwrap().field_name, "Name");
        assert_eq!(server.hits(&fields_path(APP, TABLE)), 2);
    }

    #[tokio::test]
    async fn failed_create_keeps_schema_cache() {
        let (server, table) = table().await;
        server
            .on(
                "POST",
                &batch_create_path(APP, TABLE),
                MockResponse::api_error(400, 1_254_060, "TextFieldConvFail"),
            )
            .on("POST", &batch_create_path(APP, TABLE), created(&["rec2"]));

        let err = table
            .create_record(&json!({"Name": "A"}), FieldKeys::Names)
            .await
            .unwrap_err();
        assert_eq!(err.remote_code(), Some(1_254_060));
        assert_eq!(err.operation(), Some(Operation::BatchCreate));

        let cached = table.schema.current().expect("schema still cached");
        assert_eq!(cached.len(), 3);

        let record_id = table
            .create_record(&json!({"Name": "A"}), FieldKeys::Names)
            .await
            .unwrap();
        assert_eq!(record_id, "rec2");
        assert_eq!(server.hits(&fields_path(APP, TABLE)), 1);
    }

    #[tokio::test]
    async fn empty_batch_response_is_an_error() {
        let (server, table) = table().await;
        server.on("POST", &batch_create_path(APP, TABLE), created(&[]));

        let err = table
            .create_record(&json!({"Name": "A"}), FieldKeys::Names)
            .await
            .unwrap_err();
        assert!(matches!(err, BitableError::Deserialization { .. }));
    }

    #[tokio::test]
    async fn upload_and_create_attaches_tokens() {
        let (server, table) = table().await;
        upload_routes(&server, "boxcn1");
        server.on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));
        let path = temp_file("a.txt", b"abc");

        let attachments = BTreeMap::from([("Files".to_owned(), vec![path])]);
        let record_id = table
            .upload_and_create_record(&json!({"Name": "A"}), &attachments, FieldKeys::Names)
            .await
            .unwrap();

        assert_eq!(record_id, "rec1");
        let prepare = server.requests_to(PREPARE_PATH)[0].json();
        assert_eq!(prepare["parent_type"], "bitable_file");
        assert_eq!(prepare["parent_node"], APP);

        let batch = server.requests_to(&batch_create_path(APP, TABLE));
        assert_eq!(
            batch[0].json(),
            json!({"records": [{"fields": {
                "fld1": "A",
                "fld3": [{"file_token": "boxcn1", "name": "a.txt", "size": 3}],
            }}]})
        );
    }

    #[tokio::test]
    async fn failed_second_upload_creates_nothing() {
        let (server, table) = table().await;
        server
            .on(
                "POST",
                PREPARE_PATH,
                MockResponse::ok(json!({"upload_id": "up-1", "block_size": 4_194_304, "block_num": 1})),
            )
            .on("POST", PREPARE_PATH, MockResponse::api_error(400, 1_061_045, "quota exceeded"))
            .on("POST", PART_PATH, MockResponse::ok(json!({})))
            .on("POST", FINISH_PATH, MockResponse::ok(json!({"file_token": "boxcn1"})))
            .on("POST", &batch_create_path(APP, TABLE), created(&["rec1"]));

        let attachments = BTreeMap::from([(
            "Files".to_owned(),
            vec![temp_file("one.txt", b"1"), temp_file("two.txt", b"2")],
        )]);
        let err = table
            .upload_and_create_record(&json!({"Name": "A"}), &attachments, FieldKeys::Names)
            .await
            .unwrap_err();

        assert!(matches!(err, BitableError::Upload(UploadError::Prepare(_))));
        assert_eq!(err.remote_code(), Some(1_061_045));
        assert_eq!(server.hits(PREPARE_PATH), 2);
        assert_eq!(server.hits(&batch_create_path(APP, TABLE)), 0);
    }

    #[tokio::test]
    async fn bad_attachment_field_name_uploads_nothing() {
        let (server, table) = table().await;
        upload_routes(&server, "boxcn1");

        let attachments =
            BTreeMap::from([("Fils".to_owned(), vec![temp_file("a.txt", b"abc")])]);
        let err = table
            .upload_and_create_record(&json!({"Name": "A"}), &attachments, FieldKeys::Names)
            .await
            .unwrap_err();

        assert!(err.is_unknown_field());
        assert_eq!(server.hits(PREPARE_PATH), 0);
        assert_eq!(server.hits(&batch_create_path(APP, TABLE)), 0);
    }
}
