use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::body::Body;

/// A normalized inbound request: parsed head, lazy body, transport metadata.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub peer: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            body: Body::empty(),
            peer: None,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// A normalized response on its way back to the client.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// The upstream application this gateway shields. Implementations receive the
/// normalized request (conditional headers already adjusted by the caller)
/// and produce a complete response head with a lazily-readable body.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response>;
}
