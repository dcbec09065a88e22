use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::body::Body;
use crate::cache::{Context, Event, EventSet};
use crate::io_util::{copy_with_write_timeout, write_all_with_timeout};
use crate::logging::AccessLogBuilder;
use crate::message::{Request, Response};

use super::AppContext;
use super::codec::{self, BodyFraming, RequestHead};

pub(super) async fn bind(app: &AppContext) -> Result<TcpListener> {
    let listener = TcpListener::bind(app.settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", app.settings.listen))?;
    Ok(listener)
}

pub(super) async fn serve(app: Arc<AppContext>, listener: TcpListener) -> Result<()> {
    tracing::info!(address = %listener.local_addr()?, "gateway listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(app, stream, peer).await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}

enum Disposition {
    Continue,
    Close,
}

async fn handle_connection(
    app: Arc<AppContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let head = match timeout(
            app.settings.client_timeout(),
            codec::read_request_head(&mut reader, app.settings.max_header_size),
        )
        .await
        {
            // Idle keep-alive connection; let it go quietly.
            Err(_) => return Ok(()),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(head))) => head,
            Ok(Err(err)) => {
                debug!(peer = %peer, error = %err, "rejecting malformed request");
                let _ = write_simple_response(
                    reader.get_mut(),
                    &app,
                    StatusCode::BAD_REQUEST,
                    "malformed request",
                )
                .await;
                return Ok(());
            }
        };

        let client_wants_close = wants_close(head.version, &head.headers);

        let body = match read_request_body(&app, &mut reader, &head).await {
            Ok(body) => body,
            Err(reject) => {
                let _ = write_simple_response(reader.get_mut(), &app, reject.0, reject.1).await;
                return Ok(());
            }
        };

        let uri = match codec::request_uri(&head) {
            Ok(uri) => uri,
            Err(err) => {
                debug!(peer = %peer, error = %err, "request target unusable");
                let _ = write_simple_response(
                    reader.get_mut(),
                    &app,
                    StatusCode::BAD_REQUEST,
                    "invalid request target",
                )
                .await;
                return Ok(());
            }
        };

        let method = head.method.clone();
        let path = uri.path().to_string();
        let request = Request::new(head.method, uri, head.headers)
            .with_body(body)
            .with_peer(peer);

        let mut context = Context::new(
            app.meta.clone(),
            app.entity.clone(),
            app.origin.clone(),
            app.policy.clone(),
            app.trace.clone(),
        );
        let started = Instant::now();
        let result = context.call(request).await;
        let events = context.events();

        let (status, bytes_out, disposition) = match result {
            Ok(response) => {
                let status = response.status;
                let (disposition, bytes_out) =
                    write_response(reader.get_mut(), &app, &method, response).await?;
                (status, bytes_out, disposition)
            }
            Err(err) => {
                warn!(peer = %peer, method = %method, path = %path, error = %err, "origin exchange failed");
                let bytes_out = write_simple_response(
                    reader.get_mut(),
                    &app,
                    StatusCode::BAD_GATEWAY,
                    "origin request failed",
                )
                .await?;
                (StatusCode::BAD_GATEWAY, bytes_out, Disposition::Close)
            }
        };

        AccessLogBuilder::new(peer)
            .method(method.as_str())
            .path(&path)
            .status(status)
            .decision(decision(events))
            .bytes_out(bytes_out)
            .elapsed(started.elapsed())
            .log();
        crate::metrics::record_exchange(events);

        if client_wants_close || matches!(disposition, Disposition::Close) {
            return Ok(());
        }
    }
}

fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let mut close = version == Version::HTTP_10;
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "close" => close = true,
                "keep-alive" => close = false,
                _ => {}
            }
        }
    }
    close
}

/// Which transition the exchange amounted to, for logs and metrics.
fn decision(events: EventSet) -> &'static str {
    if events.contains(Event::Pass) {
        "pass"
    } else if events.contains(Event::Hit) {
        "hit"
    } else if events.contains(Event::Validate) {
        "revalidate"
    } else if events.contains(Event::Miss) {
        "miss"
    } else {
        "error"
    }
}

async fn read_request_body(
    app: &AppContext,
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
) -> Result<Body, (StatusCode, &'static str)> {
    match codec::request_body_framing(&head.headers) {
        Ok(BodyFraming::Empty) => Ok(Body::empty()),
        Ok(BodyFraming::Length(length)) => {
            if length > app.settings.max_request_body_size as u64 {
                return Err((StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
            }
            let mut buf = vec![0u8; length as usize];
            match timeout(app.settings.client_timeout(), reader.read_exact(&mut buf)).await {
                Ok(Ok(_)) => Ok(Body::from_bytes(buf)),
                _ => Err((StatusCode::BAD_REQUEST, "request body truncated")),
            }
        }
        // Length-framed request bodies only; everything else is refused up
        // front rather than half-read.
        Ok(BodyFraming::Chunked) | Ok(BodyFraming::Close) => {
            Err((StatusCode::LENGTH_REQUIRED, "length required"))
        }
        Err(_) => Err((StatusCode::BAD_REQUEST, "invalid body framing")),
    }
}

async fn write_response(
    stream: &mut TcpStream,
    app: &AppContext,
    method: &Method,
    response: Response,
) -> Result<(Disposition, u64)> {
    let Response {
        status,
        mut headers,
        body,
    } = response;
    let io_timeout = app.settings.client_timeout();

    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);

    let bodyless_status = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    // HEAD responses keep the origin's framing headers; everything else gets
    // an exact Content-Length when the body size is known.
    let mut disposition = Disposition::Continue;
    if method != Method::HEAD && !bodyless_status {
        match body.len() {
            Some(length) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            None => {
                headers.insert(CONNECTION, HeaderValue::from_static("close"));
                disposition = Disposition::Close;
            }
        }
    }

    let head = codec::encode_response_head(status, &headers);
    write_all_with_timeout(stream, &head, io_timeout, "writing response head").await?;

    let mut bytes_out = 0u64;
    if method != Method::HEAD && !bodyless_status {
        let mut body_reader = body.into_reader();
        bytes_out = copy_with_write_timeout(
            &mut body_reader,
            stream,
            io_timeout,
            "writing response body",
        )
        .await?;
    }

    Ok((disposition, bytes_out))
}

async fn write_simple_response(
    stream: &mut TcpStream,
    app: &AppContext,
    status: StatusCode,
    message: &'static str,
) -> Result<u64> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len() as u64));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let head = codec::encode_response_head(status, &headers);
    let io_timeout = app.settings.client_timeout();
    write_all_with_timeout(stream, &head, io_timeout, "writing error response").await?;
    write_all_with_timeout(stream, message.as_bytes(), io_timeout, "writing error body").await?;
    Ok(message.len() as u64)
}
