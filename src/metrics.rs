use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

use crate::cache::{Event, EventSet};

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by decision");
    let vec = IntCounterVec::new(opts, &["decision"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by decision");
    let vec = HistogramVec::new(opts, &["decision"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static CACHE_LOOKUPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookups_total", "Cache lookups by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookups_total");
    vec
});

static CACHE_STORES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_stores_total", "Entries written to the cache")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_stores_total");
    counter
});

pub fn record_request(decision: &str, method: &str, status: StatusCode, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[decision]).inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    let status_class = match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class])
        .inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[decision])
        .observe(elapsed.as_secs_f64());
}

/// Cache-level counters derived from the transitions one exchange fired.
pub fn record_exchange(events: EventSet) {
    if events.contains(Event::Lookup) {
        let outcome = if events.contains(Event::Hit) {
            "hit"
        } else if events.contains(Event::Validate) {
            "revalidate"
        } else {
            "miss"
        };
        CACHE_LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();
    }
    if events.contains(Event::Store) {
        CACHE_STORES_TOTAL.inc();
    }
}

pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {addr}"))?;
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_scrape(stream, &path).await {
                tracing::debug!(error = %err, "metrics scrape failed");
            }
        });
    }
}

async fn handle_scrape(stream: TcpStream, path: &str) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    timeout(SCRAPE_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .context("timed out reading scrape request")??;
    let target = request_line.split_whitespace().nth(1).unwrap_or_default();

    // drain the header block
    loop {
        let mut line = String::new();
        let read = timeout(SCRAPE_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("timed out reading scrape headers")??;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let (status_line, body) = if target == path {
        ("HTTP/1.1 200 OK", encode_metrics()?)
    } else {
        ("HTTP/1.1 404 Not Found", Vec::new())
    };

    let head = format!(
        "{status_line}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let stream = reader.get_mut();
    timeout(SCRAPE_TIMEOUT, async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(&body).await?;
        stream.flush().await
    })
    .await
    .context("timed out writing scrape response")??;
    Ok(())
}

fn encode_metrics() -> Result<Vec<u8>> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_counters_follow_events() {
        let mut events = EventSet::default();
        events.record(Event::Lookup);
        events.record(Event::Hit);
        let before = CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get();
        record_exchange(events);
        assert_eq!(
            CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get(),
            before + 1
        );
    }

    #[test]
    fn pass_exchanges_do_not_count_as_lookups() {
        let mut events = EventSet::default();
        events.record(Event::Pass);
        let hit = CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get();
        let miss = CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).get();
        record_exchange(events);
        assert_eq!(CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).get(), hit);
        assert_eq!(CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).get(), miss);
    }

    #[test]
    fn encoded_metrics_are_text() {
        record_request("hit", "GET", StatusCode::OK, Duration::from_millis(3));
        let body = encode_metrics().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("requests_total"));
    }
}
