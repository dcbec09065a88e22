use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, ensure};
use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderValue, Uri};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::body::Body;
use crate::message::{Origin, Request, Response};
use crate::util::timeout_with_context;

use super::codec::{self, BodyFraming};

/// Origin collaborator speaking HTTP/1.1 over a fresh TCP connection per
/// fetch. Connections are not pooled: each exchange asks the origin to close,
/// which also lets close-delimited bodies stream straight through.
pub struct HttpOrigin {
    authority: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_head_bytes: usize,
    max_buffered_body: usize,
}

impl HttpOrigin {
    pub fn new(
        base: &Uri,
        connect_timeout: Duration,
        io_timeout: Duration,
        max_head_bytes: usize,
        max_buffered_body: usize,
    ) -> Result<Self> {
        ensure!(
            base.scheme_str().unwrap_or("http") == "http",
            "origin URL must use the http scheme (got {base})"
        );
        let authority = base
            .authority()
            .with_context(|| format!("origin URL {base} has no host"))?;
        let host = authority.host();
        let port = authority.port_u16().unwrap_or(80);
        Ok(Self {
            authority: format!("{host}:{port}"),
            connect_timeout,
            io_timeout,
            max_head_bytes,
            max_buffered_body,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn call(&self, request: Request) -> Result<Response> {
        let Request {
            method,
            uri,
            headers,
            body,
            ..
        } = request;

        let mut stream = timeout_with_context(
            self.connect_timeout,
            TcpStream::connect(&self.authority),
            format!("connecting to origin {}", self.authority),
        )
        .await?;

        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        // Client bodies arrive length-framed and capped, so buffering here
        // keeps the forwarded Content-Length exact.
        let body_bytes = body.into_bytes().await?;
        let mut forward_headers = headers;
        forward_headers.insert(HOST, HeaderValue::from_str(&self.authority)?);
        forward_headers.remove(CONNECTION);
        forward_headers.insert(CONNECTION, HeaderValue::from_static("close"));
        forward_headers.remove(CONTENT_LENGTH);
        if !body_bytes.is_empty() {
            forward_headers.insert(CONTENT_LENGTH, HeaderValue::from(body_bytes.len() as u64));
        }

        let head = codec::encode_request_head(&method, target, &forward_headers);
        timeout_with_context(
            self.io_timeout,
            async {
                stream.write_all(&head).await?;
                if !body_bytes.is_empty() {
                    stream.write_all(&body_bytes).await?;
                }
                stream.flush().await
            },
            format!("writing request to origin {}", self.authority),
        )
        .await?;

        let mut reader = BufReader::new(stream);
        let head = timeout(
            self.io_timeout,
            codec::read_response_head(&mut reader, self.max_head_bytes),
        )
        .await
        .map_err(|_| anyhow!("timed out reading response head from {}", self.authority))??;

        let mut response_headers = head.headers;
        response_headers.remove(CONNECTION);

        let body = match codec::response_body_framing(&method, head.status, &response_headers)? {
            BodyFraming::Empty => Body::empty(),
            BodyFraming::Length(length) => {
                Body::from_reader(Box::new(reader.take(length)), Some(length))
            }
            BodyFraming::Chunked => {
                let bytes = timeout(
                    self.io_timeout,
                    codec::read_chunked_body(&mut reader, self.max_buffered_body),
                )
                .await
                .map_err(|_| anyhow!("timed out reading chunked body from {}", self.authority))??;
                // The body is identity-framed from here on.
                response_headers.remove(TRANSFER_ENCODING);
                Body::from_bytes(bytes)
            }
            BodyFraming::Close => Body::from_reader(Box::new(reader), None),
        };

        Ok(Response {
            status: head.status,
            headers: response_headers,
            body,
        })
    }
}
