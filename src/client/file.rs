//! Remote file reader
//!
//! Sequential reads of a server-side file (e.g. an image cache entry) over
//! `fileOpen` / `fileRead` / `fileClose`. One reader is meant to be driven
//! by one task.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::dispatch::MessageDispatcher;
use crate::error::{Error, Result};
use crate::message::HtspMessage;
use crate::protocol::{methods, DEFAULT_REQUEST_TIMEOUT};

/// Chunk size used by [`HtspFileReader::read_to_end`]
const READ_CHUNK_SIZE: u64 = 64 * 1024;

/// Most [`HtspFileReader::read_to_end`] reserves up front; the size comes
/// from the server
const MAX_PREALLOCATION: u64 = 16 * READ_CHUNK_SIZE;

pub struct HtspFileReader {
    dispatcher: Arc<MessageDispatcher>,
    name: String,
    id: i64,
    size: Option<u64>,
    offset: u64,
    timeout: Duration,
    closed: bool,
}

impl HtspFileReader {
    /// Send `fileOpen` for `name`
    pub async fn open(dispatcher: Arc<MessageDispatcher>, name: &str) -> Result<Self> {
        Self::open_with_timeout(dispatcher, name, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        dispatcher: Arc<MessageDispatcher>,
        name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let request = HtspMessage::with_method(methods::FILE_OPEN).field("file", name);
        let reply = dispatcher.send_request_or_timeout(request, timeout).await?;
        check_error(&reply)?;

        let id = reply
            .get_i64("id")
            .ok_or_else(|| Error::Protocol(format!("fileOpen reply for {} has no id", name)))?;
        // Size is optional
        let size = reply.get_i64("size").map(|s| s.max(0) as u64);

        tracing::debug!(file = name, id = id, size = ?size, "Opened remote file");

        Ok(Self {
            dispatcher,
            name: name.to_owned(),
            id,
            size,
            offset: 0,
            timeout,
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server-side file id
    pub fn id(&self) -> i64 {
        self.id
    }

    /// File size, if the server reported one
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Position of the next sequential read
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes left, if the size is known
    pub fn remaining(&self) -> Option<u64> {
        self.size.map(|s| s.saturating_sub(self.offset))
    }

    /// Read up to `n` bytes at the current offset
    ///
    /// Never asks for more than the known remaining size; an empty result
    /// means end of file.
    pub async fn read(&mut self, n: u64) -> Result<Bytes> {
        let wanted = self.clamp(self.offset, n);
        if wanted == 0 {
            return Ok(Bytes::new());
        }

        let data = self.file_read(wanted, None).await?;
        self.offset += data.len() as u64;
        Ok(data)
    }

    /// Read up to `n` bytes at `offset`; the next sequential read continues
    /// after it
    pub async fn read_at(&mut self, n: u64, offset: u64) -> Result<Bytes> {
        let wanted = self.clamp(offset, n);
        if wanted == 0 {
            self.offset = offset;
            return Ok(Bytes::new());
        }

        let data = self.file_read(wanted, Some(offset)).await?;
        self.offset = offset + data.len() as u64;
        Ok(data)
    }

    /// Read from the current offset until the server returns no more data
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        if let Some(remaining) = self.remaining() {
            out.reserve(remaining.min(MAX_PREALLOCATION) as usize);
        }

        loop {
            let chunk = self.read(READ_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Send `fileClose`; failures are only logged
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let request = HtspMessage::with_method(methods::FILE_CLOSE).field("id", self.id);
        if let Err(e) = self.dispatcher.send_message(request) {
            tracing::debug!(file = %self.name, error = %e, "fileClose not sent");
        }
    }

    fn clamp(&self, offset: u64, n: u64) -> u64 {
        match self.size {
            Some(size) => n.min(size.saturating_sub(offset)),
            None => n,
        }
    }

    async fn file_read(&self, size: u64, offset: Option<u64>) -> Result<Bytes> {
        if self.closed {
            return Err(Error::Protocol(format!("{} is closed", self.name)));
        }

        let mut request = HtspMessage::with_method(methods::FILE_READ)
            .field("id", self.id)
            .field("size", size as i64);
        if let Some(offset) = offset {
            request.put("offset", offset as i64);
        }

        let reply = self
            .dispatcher
            .send_request_or_timeout(request, self.timeout)
            .await?;
        check_error(&reply)?;

        Ok(reply.get_bin("data").unwrap_or_default())
    }
}

impl Drop for HtspFileReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_error(reply: &HtspMessage) -> Result<()> {
    match reply.get_str("error") {
        Some(error) => Err(Error::Protocol(error.to_owned())),
        None => Ok(()),
    }
}
