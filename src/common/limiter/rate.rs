//! Rate-limiting wrappers for the chunked link readers and writers used on
//! the classic data path.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::bucket::RateBucket;

/// Chunk-oriented reader half of a proxied link. An empty chunk means EOF.
#[async_trait]
pub trait LinkReader: Send {
    async fn read_chunk(&mut self) -> io::Result<Bytes>;

    /// Read with a deadline. Implementations with a native timeout facility
    /// override this; the default wraps `read_chunk`.
    async fn read_chunk_timeout(&mut self, timeout: Duration) -> io::Result<Bytes> {
        tokio::time::timeout(timeout, self.read_chunk())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
    }
}

/// Chunk-oriented writer half of a proxied link.
#[async_trait]
pub trait LinkWriter: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LinkReader for Box<dyn LinkReader> {
    async fn read_chunk(&mut self) -> io::Result<Bytes> {
        (**self).read_chunk().await
    }

    async fn read_chunk_timeout(&mut self, timeout: Duration) -> io::Result<Bytes> {
        (**self).read_chunk_timeout(timeout).await
    }
}

#[async_trait]
impl LinkWriter for Box<dyn LinkWriter> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        (**self).write_chunk(chunk).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown().await
    }
}

/// Reader wrapper that charges the user's bucket for every chunk passed
/// through. The timeout capability of the inner reader is forwarded.
pub struct RateReader<R> {
    inner: R,
    bucket: Arc<RateBucket>,
}

impl<R: LinkReader> RateReader<R> {
    pub fn new(inner: R, bucket: Arc<RateBucket>) -> Self {
        Self { inner, bucket }
    }
}

#[async_trait]
impl<R: LinkReader> LinkReader for RateReader<R> {
    async fn read_chunk(&mut self) -> io::Result<Bytes> {
        let chunk = self.inner.read_chunk().await?;
        if !chunk.is_empty() {
            self.bucket.wait_n(chunk.len() as u64).await;
        }
        Ok(chunk)
    }

    async fn read_chunk_timeout(&mut self, timeout: Duration) -> io::Result<Bytes> {
        let chunk = self.inner.read_chunk_timeout(timeout).await?;
        if !chunk.is_empty() {
            self.bucket.wait_n(chunk.len() as u64).await;
        }
        Ok(chunk)
    }
}

/// Writer wrapper that charges the user's bucket before forwarding a chunk.
pub struct RateWriter<W> {
    inner: W,
    bucket: Arc<RateBucket>,
}

impl<W: LinkWriter> RateWriter<W> {
    pub fn new(inner: W, bucket: Arc<RateBucket>) -> Self {
        Self { inner, bucket }
    }
}

#[async_trait]
impl<W: LinkWriter> LinkWriter for RateWriter<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        if !chunk.is_empty() {
            self.bucket.wait_n(chunk.len() as u64).await;
        }
        self.inner.write_chunk(chunk).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
