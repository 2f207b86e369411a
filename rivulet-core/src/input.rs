//! Cancellable byte source feeding the demuxers
//!
//! An [`InputStream`] wraps any blocking reader. Once its cancellation token
//! fires, every further read reports end-of-stream, so the decode and
//! chunking loops wind down through their normal end-of-stream paths. The
//! number of bytes delivered is tracked so a failover can prove it never
//! re-read the source.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Blocking byte stream with cooperative cancellation
pub struct InputStream {
    reader: Box<dyn Read + Send>,
    cancel: CancellationToken,
    bytes_read: Arc<AtomicU64>,
    label: String,
}

impl InputStream {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            cancel: CancellationToken::new(),
            bytes_read: Arc::new(AtomicU64::new(0)),
            label: "stream".to_string(),
        }
    }

    /// Stream over an in-memory buffer
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(Cursor::new(data.into())).with_label("memory")
    }

    /// Stream over a local file
    ///
    /// # Errors
    /// - `io::Error` - file could not be opened
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)).with_label(path.display().to_string()))
    }

    /// Binds this stream to an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Cloneable handle for cancelling and observing this stream from other
    /// threads
    pub fn handle(&self) -> InputHandle {
        InputHandle {
            cancel: self.cancel.clone(),
            bytes_read: Arc::clone(&self.bytes_read),
            label: self.label.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Ok(0);
        }
        let n = self.reader.read(buf)?;
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("label", &self.label)
            .field("bytes_read", &self.bytes_read())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shared view of an [`InputStream`]
#[derive(Debug, Clone)]
pub struct InputHandle {
    cancel: CancellationToken,
    bytes_read: Arc<AtomicU64>,
    label: String,
}

impl InputHandle {
    /// Requests cancellation. Subsequent reads on the stream return end-of-stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
