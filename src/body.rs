use std::io::Cursor;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// A single-pass byte sequence: either fully buffered bytes or a boxed async
/// reader. Consumers pull chunks exactly once; [`Body::buffer`] bounds how
/// much of a streaming body may be materialized before giving up.
pub struct Body {
    kind: BodyKind,
    declared_len: Option<u64>,
}

enum BodyKind {
    Empty,
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// Result of buffering a body against a size cap.
pub enum Buffered {
    Complete(Bytes),
    /// The cap was exceeded. The returned body replays the buffered prefix
    /// and then continues with the unread remainder.
    Overflow(Body),
}

impl Body {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            declared_len: Some(0),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self {
            kind: BodyKind::Bytes(bytes),
            declared_len: Some(len),
        }
    }

    pub fn from_reader(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        declared_len: Option<u64>,
    ) -> Self {
        Self {
            kind: BodyKind::Reader(reader),
            declared_len,
        }
    }

    /// Length declared up front (Content-Length or buffered size), if known.
    pub fn len(&self) -> Option<u64> {
        self.declared_len
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, BodyKind::Empty) || self.declared_len == Some(0)
    }

    /// Pulls the next chunk. `None` marks the end of the sequence.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::Bytes(bytes) => {
                let bytes = std::mem::take(bytes);
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(bytes))
                }
            }
            BodyKind::Reader(reader) => {
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                let read = reader.read(&mut buf).await?;
                if read == 0 {
                    self.kind = BodyKind::Empty;
                    return Ok(None);
                }
                buf.truncate(read);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

    /// Consumes the whole sequence into memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.kind {
            BodyKind::Empty => Ok(Bytes::new()),
            BodyKind::Bytes(bytes) => Ok(bytes),
            BodyKind::Reader(mut reader) => {
                let mut collected = Vec::new();
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                loop {
                    let read = reader.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    collected.extend_from_slice(&buf[..read]);
                }
                Ok(Bytes::from(collected))
            }
        }
    }

    /// Reads up to `cap` bytes into memory. If the sequence ends within the
    /// cap the complete bytes are returned; otherwise the partially-read body
    /// is reassembled so every byte still reaches the consumer.
    pub async fn buffer(&mut self, cap: u64) -> Result<Buffered> {
        let mut collected: Vec<u8> = Vec::new();
        loop {
            let Some(chunk) = self.chunk().await? else {
                return Ok(Buffered::Complete(Bytes::from(collected)));
            };
            if collected.len() as u64 + chunk.len() as u64 > cap {
                collected.extend_from_slice(&chunk);
                let declared = self.declared_len;
                let rest = std::mem::replace(self, Body::empty());
                let chained = Cursor::new(collected).chain(rest.into_reader());
                return Ok(Buffered::Overflow(Body::from_reader(
                    Box::new(chained),
                    declared,
                )));
            }
            collected.extend_from_slice(&chunk);
        }
    }

    /// Hands the remaining sequence over as a plain reader.
    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Unpin> {
        match self.kind {
            BodyKind::Empty => Box::new(Cursor::new(Vec::new())),
            BodyKind::Bytes(bytes) => Box::new(Cursor::new(bytes.to_vec())),
            BodyKind::Reader(reader) => reader,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Bytes(_) => "bytes",
            BodyKind::Reader(_) => "reader",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("declared_len", &self.declared_len)
            .finish()
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(text.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_bytes_round_trip() -> Result<()> {
        let body = Body::from_bytes(b"hello world".to_vec());
        assert_eq!(body.len(), Some(11));
        assert_eq!(body.into_bytes().await?.as_ref(), b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn reader_body_is_single_pass() -> Result<()> {
        let reader = Cursor::new(b"streamed payload".to_vec());
        let mut body = Body::from_reader(Box::new(reader), None);
        let mut collected = Vec::new();
        while let Some(chunk) = body.chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"streamed payload");
        assert!(body.chunk().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn buffer_within_cap_returns_complete() -> Result<()> {
        let reader = Cursor::new(b"short".to_vec());
        let mut body = Body::from_reader(Box::new(reader), None);
        match body.buffer(1024).await? {
            Buffered::Complete(bytes) => assert_eq!(bytes.as_ref(), b"short"),
            Buffered::Overflow(_) => panic!("body fits within the cap"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn buffer_overflow_preserves_every_byte() -> Result<()> {
        let payload: Vec<u8> = (0..u8::MAX).cycle().take(64 * 1024).collect();
        let reader = Cursor::new(payload.clone());
        let mut body = Body::from_reader(Box::new(reader), Some(payload.len() as u64));
        let rest = match body.buffer(10).await? {
            Buffered::Complete(_) => panic!("cap should overflow"),
            Buffered::Overflow(rest) => rest,
        };
        assert_eq!(rest.into_bytes().await?.as_ref(), payload.as_slice());
        Ok(())
    }
}
