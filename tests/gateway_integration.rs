use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context as _, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use relaycache::cli::LogFormat;
use relaycache::gateway::{self, AppContext, origin::HttpOrigin};
use relaycache::settings::Settings;
use relaycache::storage::heap::{HeapEntityStore, HeapMetaStore};
use relaycache::trace::TraceLog;

/// Minimal HTTP upstream that counts requests.
struct MockUpstream {
    listener: TcpListener,
    requests: Arc<AtomicUsize>,
    headers: String,
    body: String,
}

impl MockUpstream {
    async fn new(headers: &str) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            listener,
            requests: Arc::new(AtomicUsize::new(0)),
            headers: headers.to_string(),
            body: "upstream-payload".to_string(),
        })
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    async fn run(self) -> Result<()> {
        loop {
            let (mut socket, _) = self.listener.accept().await?;
            let requests = self.requests.clone();
            let headers = self.headers.clone();
            let body = self.body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut data = Vec::new();
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                if data.is_empty() {
                    return;
                }

                requests.fetch_add(1, Ordering::SeqCst);

                let response_head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n\r\n",
                    body.len(),
                    headers
                );
                socket.write_all(response_head.as_bytes()).await.unwrap();
                socket.write_all(body.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            });
        }
    }
}

fn test_settings(upstream_port: u16) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        origin: format!("http://127.0.0.1:{upstream_port}"),
        log: LogFormat::Text,
        verbose: false,
        cache_dir: None,
        cache_max_entry_size: 1024 * 1024,
        cache_max_entries: 1024,
        default_ttl: 0,
        private_headers: vec!["authorization".to_string(), "cookie".to_string()],
        allow_reload: false,
        allow_revalidate: false,
        serve_stale_on_error: false,
        client_timeout: 5,
        origin_connect_timeout: 2,
        origin_timeout: 5,
        max_header_size: 32 * 1024,
        max_request_body_size: 1024 * 1024,
        max_response_body_size: 1024 * 1024,
        metrics_listen: None,
    }
}

async fn start_gateway(settings: Settings) -> Result<SocketAddr> {
    settings.validate()?;
    let settings = Arc::new(settings);

    let meta = Arc::new(HeapMetaStore::new(settings.cache_max_entries_nonzero()));
    let entity = Arc::new(HeapEntityStore::new());
    let origin = Arc::new(HttpOrigin::new(
        &settings.origin_uri()?,
        settings.origin_connect_timeout(),
        settings.origin_timeout(),
        settings.max_header_size,
        settings.max_response_body_size,
    )?);
    let trace = Arc::new(TraceLog::new(Box::new(std::io::sink()), false));

    let app = AppContext::new(settings, meta, entity, origin, trace)?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = gateway::run_on(app, listener).await;
    });
    Ok(addr)
}

/// One request on its own connection; the response is read until the server
/// closes.
async fn roundtrip(addr: SocketAddr, request: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

fn closing_get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: upstream.test\r\nConnection: close\r\n\r\n")
}

/// Reads one length-framed response off a keep-alive connection.
async fn read_one_response(reader: &mut BufReader<TcpStream>) -> Result<(String, Vec<u8>)> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(anyhow!("connection closed mid-response"));
        }
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .context("response has no Content-Length")?;
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok((head, body))
}

#[tokio::test]
async fn second_request_is_served_from_the_cache() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: max-age=60").await?;
    let port = upstream.port();
    let counter = upstream.requests.clone();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;

    let first = roundtrip(addr, &closing_get("/resource")).await?;
    assert!(first.contains("200 OK"), "unexpected response: {first}");
    assert!(first.contains("upstream-payload"));
    assert!(!first.contains("\nage:"), "first response must not carry Age");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let second = roundtrip(addr, &closing_get("/resource")).await?;
    assert!(second.contains("200 OK"));
    assert!(second.contains("upstream-payload"));
    assert!(second.contains("\r\nage:"), "hit must carry Age: {second}");
    assert!(second.contains("\r\nx-content-digest:"));
    assert_eq!(counter.load(Ordering::SeqCst), 1, "hit must not reach upstream");
    Ok(())
}

#[tokio::test]
async fn post_requests_always_reach_the_upstream() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: max-age=60").await?;
    let port = upstream.port();
    let counter = upstream.requests.clone();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;

    let request = "POST /submit HTTP/1.1\r\nHost: upstream.test\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc";
    for expected in 1..=2 {
        let response = roundtrip(addr, request).await?;
        assert!(response.contains("200 OK"));
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
    Ok(())
}

#[tokio::test]
async fn no_store_responses_are_fetched_every_time() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: no-store").await?;
    let port = upstream.port();
    let counter = upstream.requests.clone();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;

    for expected in 1..=2 {
        let response = roundtrip(addr, &closing_get("/volatile")).await?;
        assert!(response.contains("200 OK"));
        assert!(!response.contains("\r\nage:"));
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
    Ok(())
}

#[tokio::test]
async fn authorization_bypasses_the_cache() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: max-age=60").await?;
    let port = upstream.port();
    let counter = upstream.requests.clone();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;

    let request = "GET /secret HTTP/1.1\r\nHost: upstream.test\r\nAuthorization: basic foobarbaz\r\nConnection: close\r\n\r\n";
    for expected in 1..=2 {
        let response = roundtrip(addr, request).await?;
        assert!(response.contains("200 OK"));
        assert!(!response.contains("\r\nage:"));
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_origin_maps_to_bad_gateway() -> Result<()> {
    // Grab a port that nothing listens on.
    let dead_port = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        listener.local_addr()?.port()
    };

    let addr = start_gateway(test_settings(dead_port)).await?;
    let response = roundtrip(addr, &closing_get("/down")).await?;
    assert!(response.contains("502 Bad Gateway"), "got: {response}");
    Ok(())
}

#[tokio::test]
async fn keep_alive_serves_multiple_exchanges() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: max-age=60").await?;
    let port = upstream.port();
    let counter = upstream.requests.clone();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;

    let stream = TcpStream::connect(addr).await?;
    let mut reader = BufReader::new(stream);

    let request = "GET /shared HTTP/1.1\r\nHost: upstream.test\r\n\r\n";
    reader.get_mut().write_all(request.as_bytes()).await?;
    let (first_head, first_body) = read_one_response(&mut reader).await?;
    assert!(first_head.contains("200 OK"));
    assert_eq!(first_body, b"upstream-payload");

    reader.get_mut().write_all(request.as_bytes()).await?;
    let (second_head, second_body) = read_one_response(&mut reader).await?;
    assert!(second_head.contains("200 OK"));
    assert!(second_head.to_ascii_lowercase().contains("age:"));
    assert_eq!(second_body, b"upstream-payload");

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_requests_get_a_400() -> Result<()> {
    let upstream = MockUpstream::new("Cache-Control: max-age=60").await?;
    let port = upstream.port();
    tokio::spawn(upstream.run());

    let addr = start_gateway(test_settings(port)).await?;
    let response = roundtrip(addr, "NOT-HTTP\r\n\r\n").await?;
    assert!(response.contains("400 Bad Request"), "got: {response}");
    Ok(())
}
