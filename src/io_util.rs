use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

/// Copies a reader to a writer, bounding each individual write by the
/// timeout so a stalled peer cannot pin the task forever.
pub async fn copy_with_write_timeout<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
    context: &str,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncWrite, AsyncWriteExt, duplex};

    struct ChunkWriter {
        max_chunk: usize,
        data: Vec<u8>,
    }

    impl ChunkWriter {
        fn new(max_chunk: usize) -> Self {
            Self {
                max_chunk,
                data: Vec::new(),
            }
        }
    }

    impl AsyncWrite for ChunkWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let to_write = buf.len().min(self.max_chunk);
            self.data.extend_from_slice(&buf[..to_write]);
            Poll::Ready(Ok(to_write))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct PendingWriter;

    impl AsyncWrite for PendingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copy_handles_partial_writes() -> Result<()> {
        let (mut reader, mut writer) = duplex(16);
        let payload = b"abcdefghijklmnopqrstuvwxyz";
        let write_task = tokio::spawn(async move {
            writer.write_all(payload).await?;
            writer.shutdown().await
        });

        let mut sink = ChunkWriter::new(4);
        let copied = copy_with_write_timeout(
            &mut reader,
            &mut sink,
            Duration::from_secs(1),
            "writing response body",
        )
        .await?;

        write_task.await??;
        assert_eq!(copied as usize, payload.len());
        assert_eq!(sink.data, payload);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn write_times_out_on_stalled_writer() {
        let handle = tokio::spawn(async {
            let mut writer = PendingWriter;
            write_all_with_timeout(
                &mut writer,
                b"payload",
                Duration::from_secs(1),
                "writing response head",
            )
            .await
        });

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
