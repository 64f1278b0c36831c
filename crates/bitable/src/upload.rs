//! The three-phase chunked upload protocol: prepare, upload parts, finish.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::error::{BitableError, UploadError};
use crate::types::{UploadPrepareRequest, UploadPrepareResponse};

/// Remote side of an upload session.
///
/// [`BitableClient`](crate::BitableClient) implements this against the Open
/// API; the session only drives the state machine.
pub trait UploadTransport: Send + Sync {
    fn prepare(
        &self,
        request: &UploadPrepareRequest,
    ) -> impl Future<Output = Result<UploadPrepareResponse, BitableError>> + Send;

    fn upload_part(
        &self,
        upload_id: &str,
        index: u32,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), BitableError>> + Send;

    /// Returns the file token of the completed upload.
    fn finish(
        &self,
        upload_id: &str,
        block_count: u32,
    ) -> impl Future<Output = Result<String, BitableError>> + Send;
}

/// A validated prepare response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub upload_id: String,
    pub block_size: u64,
    pub block_count: u32,
    pub file_size: u64,
}

impl UploadTicket {
    /// Validate a prepare response against the size of the file being sent.
    ///
    /// A zero-byte file always uploads as one empty block; the API may
    /// report it with `block_num` 0 or 1.
    pub fn from_response(
        response: UploadPrepareResponse,
        file_size: u64,
    ) -> Result<Self, UploadError> {
        if response.upload_id.is_empty() {
            return Err(UploadError::MalformedTicket("empty upload_id".into()));
        }
        let block_size = u64::try_from(response.block_size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                UploadError::MalformedTicket(format!("block_size={}", response.block_size))
            })?;

        let expected = file_size.div_ceil(block_size).max(1);
        let reported = u64::try_from(response.block_num).ok();
        let accepted = match reported {
            Some(n) if n == expected => true,
            Some(0) => file_size == 0,
            _ => false,
        };
        if !accepted {
            return Err(UploadError::MalformedTicket(format!(
                "block_num={} does not match file size {file_size} with block_size {block_size}",
                response.block_num
            )));
        }
        let block_count = u32::try_from(expected).map_err(|_| {
            UploadError::MalformedTicket(format!("block count {expected} out of range"))
        })?;

        Ok(Self {
            upload_id: response.upload_id,
            block_size,
            block_count,
            file_size,
        })
    }

    /// Length in bytes of block `index`.
    pub fn block_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.block_size;
        self.file_size.saturating_sub(start).min(self.block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Prepared,
    /// `next_index` blocks have been acknowledged.
    Uploading { next_index: u32 },
    Finished,
    Failed,
}

/// State machine for one file upload.
///
/// Blocks must be sent in increasing index order starting at 0, and finish
/// is only allowed once all of them were acknowledged. Violations are
/// reported without contacting the API. A failed block moves the session
/// to [`UploadState::Failed`]; blocks are never retried here.
#[derive(Debug)]
pub struct UploadSession {
    ticket: UploadTicket,
    state: UploadState,
}

impl UploadSession {
    /// Run the prepare phase.
    pub async fn prepare<T: UploadTransport>(
        transport: &T,
        request: &UploadPrepareRequest,
    ) -> Result<Self, BitableError> {
        debug!(file_name = %request.file_name, size = request.size, "preparing upload");
        let response = transport
            .prepare(request)
            .await
            .map_err(|e| UploadError::Prepare(Box::new(e)))?;
        let ticket = UploadTicket::from_response(response, request.size)?;
        debug!(
            upload_id = %ticket.upload_id,
            block_size = ticket.block_size,
            block_count = ticket.block_count,
            "upload prepared"
        );
        Ok(Self {
            ticket,
            state: UploadState::Prepared,
        })
    }

    pub fn ticket(&self) -> &UploadTicket {
        &self.ticket
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn acknowledged(&self) -> u32 {
        match self.state {
            UploadState::Prepared => 0,
            UploadState::Uploading { next_index } => next_index,
            UploadState::Finished => self.ticket.block_count,
            UploadState::Failed => 0,
        }
    }

    fn closed(&self) -> UploadError {
        UploadError::Closed {
            upload_id: self.ticket.upload_id.clone(),
        }
    }

    /// Send block `index`. It must be the next unacknowledged block.
    pub async fn upload_part<T: UploadTransport>(
        &mut self,
        transport: &T,
        index: u32,
        data: Vec<u8>,
    ) -> Result<(), BitableError> {
        if matches!(self.state, UploadState::Finished | UploadState::Failed) {
            return Err(self.closed().into());
        }
        let expected = self.acknowledged();
        if index != expected || index >= self.ticket.block_count {
            return Err(UploadError::OutOfOrder {
                expected,
                got: index,
            }
            .into());
        }

        debug!(upload_id = %self.ticket.upload_id, index, bytes = data.len(), "uploading block");
        match transport
            .upload_part(&self.ticket.upload_id, index, data)
            .await
        {
            Ok(()) => {
                self.state = UploadState::Uploading {
                    next_index: index + 1,
                };
                Ok(())
            }
            Err(e) => {
                self.state = UploadState::Failed;
                Err(UploadError::Part {
                    index,
                    source: Box::new(e),
                }
                .into())
            }
        }
    }

    /// Finalize the upload and return the file token.
    pub async fn finish<T: UploadTransport>(&mut self, transport: &T) -> Result<String, BitableError> {
        if matches!(self.state, UploadState::Finished | UploadState::Failed) {
            return Err(self.closed().into());
        }
        let acknowledged = self.acknowledged();
        if acknowledged != self.ticket.block_count {
            return Err(UploadError::Incomplete {
                acknowledged,
                block_count: self.ticket.block_count,
            }
            .into());
        }

        match transport
            .finish(&self.ticket.upload_id, self.ticket.block_count)
            .await
        {
            Ok(file_token) => {
                self.state = UploadState::Finished;
                info!(
                    upload_id = %self.ticket.upload_id,
                    blocks = self.ticket.block_count,
                    "upload finished"
                );
                Ok(file_token)
            }
            Err(e) => {
                self.state = UploadState::Failed;
                Err(UploadError::Finish(Box::new(e)).into())
            }
        }
    }

    /// Drive a whole upload: prepare, send every block read from `reader`
    /// in order, finish. `request.size` must be the reader's length.
    pub async fn run<T, R>(
        transport: &T,
        request: &UploadPrepareRequest,
        reader: &mut R,
    ) -> Result<String, BitableError>
    where
        T: UploadTransport,
        R: AsyncRead + Unpin + Send,
    {
        let mut session = Self::prepare(transport, request).await?;
        for index in 0..session.ticket.block_count {
            let len = usize::try_from(session.ticket.block_len(index)).map_err(|_| {
                BitableError::Configuration(format!(
                    "block size {} does not fit in memory",
                    session.ticket.block_size
                ))
            })?;
            let mut block = vec![0u8; len];
            reader
                .read_exact(&mut block)
                .await
                .map_err(|source| BitableError::Io {
                    path: request.file_name.clone().into(),
                    source,
                })?;
            session.upload_part(transport, index, block).await?;
        }
        session.finish(transport).await
    }
}
