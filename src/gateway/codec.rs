use anyhow::{Context as _, Result, bail};
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

const MAX_HEADER_COUNT: usize = 128;
const MAX_CHUNK_SIZE_LINE: usize = 256;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request line {0:?}")]
    MalformedRequestLine(String),
    #[error("malformed status line {0:?}")]
    MalformedStatusLine(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("header block exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("too many headers (limit {limit})")]
    TooManyHeaders { limit: usize },
    #[error("invalid content length {0:?}")]
    InvalidContentLength(String),
    #[error("unsupported transfer encoding {0:?}")]
    UnsupportedTransferEncoding(String),
    #[error("request target {0:?} has no host")]
    MissingHost(String),
    #[error("chunked body exceeds {limit} bytes")]
    ChunkedBodyTooLarge { limit: usize },
    #[error("malformed chunk size line {0:?}")]
    MalformedChunkSize(String),
    #[error("connection closed mid-head")]
    TruncatedHead,
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: http::Version,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// How the bytes after a head are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    Close,
}

/// Reads one CRLF-terminated line, charging its bytes against `budget`.
/// `None` means clean EOF before the first byte.
async fn read_line_limited<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    budget: &mut usize,
) -> Result<Option<String>> {
    let mut raw = Vec::new();
    let limit = *budget;
    // +1 so overruns are detected rather than silently truncated
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut raw)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if read > limit {
        return Err(CodecError::HeadTooLarge { limit }.into());
    }
    if raw.last() != Some(&b'\n') {
        return Err(CodecError::TruncatedHead.into());
    }
    *budget = limit - read;
    raw.pop();
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    let line = String::from_utf8(raw).context("head line contained invalid bytes")?;
    Ok(Some(line))
}

async fn read_header_block<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    budget: &mut usize,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line_limited(reader, budget)
            .await?
            .ok_or(CodecError::TruncatedHead)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(CodecError::TooManyHeaders {
                limit: MAX_HEADER_COUNT,
            }
            .into());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.clone()))?;
        let name = http::header::HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| CodecError::MalformedHeader(line.clone()))?;
        let value = http::HeaderValue::from_str(value.trim())
            .map_err(|_| CodecError::MalformedHeader(line.clone()))?;
        headers.append(name, value);
    }
}

/// Reads a request head. `None` on clean EOF, i.e. the peer closed between
/// requests.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    max_head_bytes: usize,
) -> Result<Option<RequestHead>> {
    let mut budget = max_head_bytes;
    let Some(line) = read_line_limited(reader, &mut budget).await? else {
        return Ok(None);
    };

    let mut parts = line.split_ascii_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(CodecError::MalformedRequestLine(line).into()),
    };
    let version = match version {
        "HTTP/1.0" => http::Version::HTTP_10,
        "HTTP/1.1" => http::Version::HTTP_11,
        _ => return Err(CodecError::MalformedRequestLine(line.clone()).into()),
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| CodecError::MalformedRequestLine(line.clone()))?;
    let target = target.to_string();

    let headers = read_header_block(reader, &mut budget).await?;
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    max_head_bytes: usize,
) -> Result<ResponseHead> {
    let mut budget = max_head_bytes;
    let line = read_line_limited(reader, &mut budget)
        .await?
        .ok_or(CodecError::TruncatedHead)?;

    let mut parts = line.splitn(3, ' ');
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => {
            StatusCode::from_bytes(code.as_bytes())
                .map_err(|_| CodecError::MalformedStatusLine(line.clone()))?
        }
        _ => return Err(CodecError::MalformedStatusLine(line).into()),
    };

    let headers = read_header_block(reader, &mut budget).await?;
    Ok(ResponseHead { status, headers })
}

/// Builds the absolute request URI from the target and `Host` header.
pub fn request_uri(head: &RequestHead) -> Result<Uri> {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return head
            .target
            .parse::<Uri>()
            .with_context(|| format!("invalid absolute request target {:?}", head.target));
    }
    let host = head
        .headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| CodecError::MissingHost(head.target.clone()))?;
    Uri::builder()
        .scheme("http")
        .authority(host)
        .path_and_query(head.target.as_str())
        .build()
        .with_context(|| format!("invalid request target {:?}", head.target))
}

fn transfer_encoding(headers: &HeaderMap) -> Option<String> {
    let mut joined = String::new();
    for value in headers.get_all(http::header::TRANSFER_ENCODING) {
        if let Ok(value) = value.to_str() {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(value);
        }
    }
    (!joined.is_empty()).then_some(joined)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let Some(value) = headers.get(http::header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            CodecError::InvalidContentLength(format!("{:?}", value))
        })
}

pub fn request_body_framing(headers: &HeaderMap) -> Result<BodyFraming, CodecError> {
    if let Some(te) = transfer_encoding(headers) {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(CodecError::UnsupportedTransferEncoding(te));
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(length) => Ok(BodyFraming::Length(length)),
    }
}

pub fn response_body_framing(
    request_method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<BodyFraming, CodecError> {
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    if let Some(te) = transfer_encoding(headers) {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(BodyFraming::Chunked);
        }
        return Err(CodecError::UnsupportedTransferEncoding(te));
    }
    match content_length(headers)? {
        Some(length) => Ok(BodyFraming::Length(length)),
        None => Ok(BodyFraming::Close),
    }
}

/// Decodes a chunked body in full, bounded by `limit`. Trailers are read and
/// discarded.
pub async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    limit: usize,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let mut line_budget = MAX_CHUNK_SIZE_LINE;
        let line = read_line_limited(reader, &mut line_budget)
            .await?
            .ok_or(CodecError::TruncatedHead)?;
        let size_token = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| CodecError::MalformedChunkSize(line.clone()))?;

        if size == 0 {
            // trailer section, up to the blank line
            loop {
                let mut trailer_budget = MAX_CHUNK_SIZE_LINE;
                let trailer = read_line_limited(reader, &mut trailer_budget)
                    .await?
                    .ok_or(CodecError::TruncatedHead)?;
                if trailer.is_empty() {
                    return Ok(body);
                }
            }
        }

        if body.len().saturating_add(size) > limit {
            return Err(CodecError::ChunkedBodyTooLarge { limit }.into());
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            bail!("chunk data not followed by CRLF");
        }
    }
}

pub fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(method.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    encode_headers(&mut head, headers);
    head
}

pub fn encode_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    head.extend_from_slice(b"\r\n");
    encode_headers(&mut head, headers);
    head
}

fn encode_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}
