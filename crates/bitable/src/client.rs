use std::path::Path;
use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::config::BitableConfig;
use crate::error::{BitableError, Operation};
use crate::token::{Credential, TokenStore};
use crate::types::{
    ApiEnvelope, AttachmentToken, BatchCreateData, BatchCreateRequest, FieldMetadata,
    ListFieldsData, RecordPayload, UploadFinishData, UploadFinishRequest, UploadPrepareRequest,
    UploadPrepareResponse,
};
use crate::upload::{UploadSession, UploadTransport};

/// API codes meaning the access token is missing, invalid or expired.
/// Treated like HTTP 401.
const TOKEN_REJECTED_CODES: [i64; 3] = [99_991_661, 99_991_663, 99_991_668];

/// Outcome of one authorized attempt.
enum Attempt<T> {
    Done(T),
    Unauthorized { code: Option<i64>, message: String },
}

/// Low-level client for the Bitable and Drive endpoints.
///
/// Every call attaches a tenant access token from the client's
/// [`TokenStore`]. When the API rejects the token, the call is retried once
/// after a forced refresh; a second rejection surfaces as
/// [`BitableError::Auth`]. No other retries are performed.
#[derive(Debug, Clone)]
pub struct BitableClient {
    http: Client,
    config: Arc<BitableConfig>,
    tokens: Arc<TokenStore>,
}

impl BitableClient {
    /// Create a client for the public Feishu API.
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self::with_config(BitableConfig::new(app_id, app_secret))
            .expect("default client configuration should not fail")
    }

    /// Create a client from a full configuration.
    pub fn with_config(config: BitableConfig) -> Result<Self, BitableError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BitableError::Configuration(e.to_string()))?;
        Ok(Self::with_http_client(config, http))
    }

    /// Create a client with a custom HTTP client.
    ///
    /// Useful for sharing a connection pool. The HTTP client's own timeout
    /// applies instead of `timeout_seconds`.
    pub fn with_http_client(config: BitableConfig, http: Client) -> Self {
        let tokens = TokenStore::new(&config, http.clone());
        Self {
            http,
            config: Arc::new(config),
            tokens: Arc::new(tokens),
        }
    }

    pub fn config(&self) -> &BitableConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base())
    }

    /// List the metadata of every field of a table, following pagination.
    #[instrument(skip(self))]
    pub async fn get_table_fields(
        &self,
        app_token: &str,
        table_id: &str,
    ) -> Result<Vec<FieldMetadata>, BitableError> {
        let url = self.url(&format!("/bitable/v1/apps/{app_token}/tables/{table_id}/fields"));
        let page_size = self.config.effective_page_size().to_string();
        let mut fields = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let data: ListFieldsData = self
                .send_authorized(Operation::ListFields, |token| {
                    let mut query = vec![("page_size", page_size.clone())];
                    if let Some(t) = &page_token {
                        query.push(("page_token", t.clone()));
                    }
                    self.http.get(&url).bearer_auth(token).query(&query)
                })
                .await?;

            fields.extend(data.items);
            match data.page_token.filter(|t| data.has_more && !t.is_empty()) {
                Some(next) if page_token.as_deref() == Some(next.as_str()) => {
                    return Err(BitableError::Deserialization {
                        operation: Operation::ListFields,
                        message: format!("page_token '{next}' repeated, pagination does not advance"),
                    });
                }
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(count = fields.len(), "fetched table fields");
        Ok(fields)
    }

    /// Upload a local file with the chunked upload protocol.
    ///
    /// The returned token carries the file's name and size.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        parent_type: &str,
        parent_node: &str,
    ) -> Result<AttachmentToken, BitableError> {
        let path = path.as_ref();
        let io_error = |source| BitableError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let size = file.metadata().await.map_err(io_error)?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BitableError::Configuration(format!("'{}' has no file name", path.display())))?;

        let request = UploadPrepareRequest {
            file_name: file_name.clone(),
            parent_type: parent_type.to_owned(),
            parent_node: parent_node.to_owned(),
            size,
        };

        let file_token = UploadSession::run(self, &request, &mut file)
            .await
            .map_err(|e| match e {
                BitableError::Io { source, .. } => io_error(source),
                other => other,
            })?;

        info!(file_name = %file_name, size, "file uploaded");
        Ok(AttachmentToken {
            name: Some(file_name),
            size: Some(size),
            ..AttachmentToken::new(file_token)
        })
    }

    /// Create records in one batch call and return their ids in order.
    ///
    /// An empty batch returns immediately without contacting the API.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn batch_create_records(
        &self,
        app_token: &str,
        table_id: &str,
        records: &[RecordPayload],
    ) -> Result<Vec<String>, BitableError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.url(&format!(
            "/bitable/v1/apps/{app_token}/tables/{table_id}/records/batch_create"
        ));
        // Reused on the retry so the API deduplicates the batch.
        let client_token = uuid::Uuid::new_v4().to_string();
        let body = BatchCreateRequest { records };

        let data: BatchCreateData = self
            .send_authorized(Operation::BatchCreate, |token| {
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .query(&[("client_token", client_token.as_str())])
                    .json(&body)
            })
            .await?;

        let ids: Vec<String> = data.records.into_iter().map(|r| r.record_id).collect();
        info!(created = ids.len(), "records created");
        Ok(ids)
    }

    /// Send a request built by `build`, retrying once with a fresh token if
    /// the current one is rejected.
    async fn send_authorized<T, F>(&self, operation: Operation, build: F) -> Result<T, BitableError>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> RequestBuilder,
    {
        let credential = self.tokens.token().await?;
        match self.attempt(operation, build(&credential.token)).await? {
            Attempt::Done(data) => Ok(data),
            Attempt::Unauthorized { code, message } => {
                warn!(%operation, ?code, %message, "access token rejected, refreshing");
                let credential: Credential = self.tokens.refresh_rejected(&credential).await?;
                match self.attempt(operation, build(&credential.token)).await? {
                    Attempt::Done(data) => Ok(data),
                    Attempt::Unauthorized { code, message } => {
                        Err(BitableError::Auth { code, message })
                    }
                }
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<Attempt<T>, BitableError> {
        let response = request
            .send()
            .await
            .map_err(|e| BitableError::from_reqwest(operation, e))?;
        Self::interpret(operation, response).await
    }

    async fn interpret<T: DeserializeOwned>(
        operation: Operation,
        response: Response,
    ) -> Result<Attempt<T>, BitableError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BitableError::from_reqwest(operation, e))?;

        let envelope: ApiEnvelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if status == StatusCode::UNAUTHORIZED => {
                return Ok(Attempt::Unauthorized {
                    code: None,
                    message: format!("HTTP {status}: {body}"),
                });
            }
            Err(_) if !status.is_success() => {
                return Err(BitableError::Http {
                    operation,
                    status: status.as_u16(),
                    message: body,
                });
            }
            Err(e) => {
                return Err(BitableError::Deserialization {
                    operation,
                    message: e.to_string(),
                });
            }
        };

        if status == StatusCode::UNAUTHORIZED || TOKEN_REJECTED_CODES.contains(&envelope.code) {
            return Ok(Attempt::Unauthorized {
                code: Some(envelope.code),
                message: envelope.msg,
            });
        }

        if envelope.code != 0 {
            return Err(BitableError::Api {
                operation,
                code: envelope.code,
                message: envelope.msg,
            });
        }

        if !status.is_success() {
            return Err(BitableError::Http {
                operation,
                status: status.as_u16(),
                message: envelope.msg,
            });
        }

        // Endpoints with nothing to return may omit `data`.
        let data = match envelope.data {
            Some(data) => data,
            None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                BitableError::Deserialization {
                    operation,
                    message: "response has no data".into(),
                }
            })?,
        };
        Ok(Attempt::Done(data))
    }
}

impl UploadTransport for BitableClient {
    async fn prepare(
        &self,
        request: &UploadPrepareRequest,
    ) -> Result<UploadPrepareResponse, BitableError> {
        let url = self.url("/drive/v1/medias/upload_prepare");
        self.send_authorized(Operation::UploadPrepare, |token| {
            self.http.post(&url).bearer_auth(token).json(request)
        })
        .await
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        index: u32,
        data: Vec<u8>,
    ) -> Result<(), BitableError> {
        let url = self.url("/drive/v1/medias/upload_part");
        let size = data.len().to_string();
        let _: serde_json::Value = self
            .send_authorized(Operation::UploadPart, |token| {
                let part =
                    reqwest::multipart::Part::bytes(data.clone()).file_name(format!("block-{index}"));
                let form = reqwest::multipart::Form::new()
                    .text("upload_id", upload_id.to_owned())
                    .text("seq", index.to_string())
                    .text("size", size.clone())
                    .part("file", part);
                self.http.post(&url).bearer_auth(token).multipart(form)
            })
            .await?;
        Ok(())
    }

    async fn finish(&self, upload_id: &str, block_count: u32) -> Result<String, BitableError> {
        let url = self.url("/drive/v1/medias/upload_finish");
        let body = UploadFinishRequest {
            upload_id,
            block_num: block_count,
        };
        let data: UploadFinishData = self
            .send_authorized(Operation::UploadFinish, |token| {
                self.http.post(&url).bearer_auth(token).json(&body)
            })
            .await?;
        Ok(data.file_token)
    }
}
