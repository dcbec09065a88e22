use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::header::{AGE, DATE, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::body::{Body, Buffered};
use crate::message::{Origin, Request, Response};
use crate::storage::{EntityStore, MetaStore, digest_hex};
use crate::trace::TraceLog;

use super::control::CacheControl;
use super::entry::{StoredEntry, status_cacheable_by_default};
use super::event::{Event, EventSet};
use super::key::CacheKey;

/// Knobs governing one gateway's caching behavior. Shared verbatim by every
/// request context.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Request headers whose presence marks the request private and forces a
    /// verbatim pass to the origin.
    pub private_headers: Vec<HeaderName>,
    /// Freshness lifetime applied when the response carries none of its own.
    pub default_ttl: Duration,
    /// Honor request `Cache-Control: no-cache` by discarding the entry and
    /// refetching.
    pub allow_reload: bool,
    /// Honor request `max-age=0` / `no-cache` by forcing revalidation.
    pub allow_revalidate: bool,
    /// Deliver a stale entry when revalidation fails with a 5xx or a
    /// transport error, instead of surfacing the failure.
    pub serve_stale_on_error: bool,
    /// Bodies beyond this size stream through uncached.
    pub max_entry_size: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            private_headers: vec![http::header::AUTHORIZATION, http::header::COOKIE],
            default_ttl: Duration::ZERO,
            allow_reload: false,
            allow_revalidate: false,
            serve_stale_on_error: false,
            max_entry_size: 10 * 1024 * 1024,
        }
    }
}

/// The per-request state machine. One instance handles exactly one exchange;
/// the stores and origin are the only shared state. After `call`, the fired
/// transitions remain observable through [`Context::performed`].
pub struct Context {
    meta: Arc<dyn MetaStore>,
    entity: Arc<dyn EntityStore>,
    origin: Arc<dyn Origin>,
    policy: CachePolicy,
    log: Arc<TraceLog>,
    events: EventSet,
}

impl Context {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        entity: Arc<dyn EntityStore>,
        origin: Arc<dyn Origin>,
        policy: CachePolicy,
        log: Arc<TraceLog>,
    ) -> Self {
        Self {
            meta,
            entity,
            origin,
            policy,
            log,
            events: EventSet::default(),
        }
    }

    /// Whether the given transition fired during the most recent `call`.
    pub fn performed(&self, event: Event) -> bool {
        self.events.contains(event)
    }

    pub fn events(&self) -> EventSet {
        self.events
    }

    /// Runs one request through the machine. Exactly one of `pass`/`hit`/
    /// `miss` fires except on the revalidation path, where `validate` takes
    /// their place; `deliver` fires once on every success path.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        self.events.clear();
        match self.dispatch(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.events.record(Event::Error);
                Err(err)
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response> {
        if request.method != Method::GET && request.method != Method::HEAD {
            return self.pass(request).await;
        }
        if self
            .policy
            .private_headers
            .iter()
            .any(|name| request.headers.contains_key(name))
        {
            return self.pass(request).await;
        }
        self.lookup(request).await
    }

    fn record(&mut self, event: Event) {
        self.events.record(event);
    }

    /// Forwards the request untouched and returns the origin response
    /// untouched. No store interaction, no age accounting.
    async fn pass(&mut self, request: Request) -> Result<Response> {
        self.record(Event::Pass);
        self.log.trace(format_args!(
            "passing {} {} through to origin",
            request.method, request.uri
        ));
        let response = self.origin.call(request).await?;
        self.deliver(response)
    }

    async fn lookup(&mut self, request: Request) -> Result<Response> {
        self.record(Event::Lookup);
        let key = CacheKey::new(&request.method, &request.uri);
        let request_cc = CacheControl::parse(&request.headers);

        if self.policy.allow_reload && request_cc.no_cache {
            self.log
                .trace(format_args!("client forced a reload of {key}"));
            if let Err(err) = self.meta.purge(&key).await {
                self.log
                    .warn(format_args!("metadata purge failed for {key}: {err:#}"));
            }
            self.record(Event::Miss);
            return self.fetch_and_store(request, key).await;
        }

        let candidates = match self.meta.lookup(&key).await {
            Ok(candidates) => candidates,
            Err(err) => {
                self.log.info(format_args!(
                    "metadata lookup failed for {key}: {err:#}; treating as miss"
                ));
                Vec::new()
            }
        };
        let entry = candidates
            .into_iter()
            .find(|candidate| candidate.matches(&request.headers));

        let Some(entry) = entry else {
            self.record(Event::Miss);
            self.log.trace(format_args!("no usable entry for {key}"));
            return self.fetch_and_store(request, key).await;
        };

        let force_stale = self.policy.allow_revalidate
            && (request_cc.no_cache || request_cc.max_age == Some(Duration::ZERO));
        let now = SystemTime::now();
        if !force_stale && entry.is_fresh(now, self.policy.default_ttl) {
            if let Some(response) = self.restore(&key, &entry, now).await? {
                self.record(Event::Hit);
                self.log.trace(format_args!("fresh hit for {key}"));
                return self.deliver(response);
            }
            // Entry body was unusable; the store already cleaned up.
            self.record(Event::Miss);
            return self.fetch_and_store(request, key).await;
        }

        self.validate(request, key, entry).await
    }

    /// Full fetch: the shared cache asks for the complete representation, so
    /// the client's own conditional headers are stripped first.
    async fn fetch_and_store(&mut self, mut request: Request, key: CacheKey) -> Result<Response> {
        request.headers.remove(IF_MODIFIED_SINCE);
        request.headers.remove(IF_NONE_MATCH);
        let method = request.method.clone();
        let request_headers = request.headers.clone();
        let response = self.forward(request).await?;
        self.classify_and_store(key, method, request_headers, response)
            .await
    }

    async fn forward(&mut self, request: Request) -> Result<Response> {
        self.record(Event::Fetch);
        self.origin.call(request).await
    }

    /// Revalidates a stale entry with a conditional request built from its
    /// validators. A `304` refreshes the entry in place; anything else is
    /// handled like a fresh fetch.
    async fn validate(
        &mut self,
        mut request: Request,
        key: CacheKey,
        entry: StoredEntry,
    ) -> Result<Response> {
        self.record(Event::Validate);
        self.log
            .trace(format_args!("stale entry for {key}; revalidating"));

        request.headers.remove(IF_MODIFIED_SINCE);
        request.headers.remove(IF_NONE_MATCH);
        let method = request.method.clone();
        let uri = request.uri.clone();
        let request_headers = request.headers.clone();

        if let Some(last_modified) = entry.last_modified() {
            request.headers.insert(IF_MODIFIED_SINCE, last_modified);
        }
        if let Some(etag) = entry.etag() {
            request.headers.insert(IF_NONE_MATCH, etag);
        }

        let response = match self.forward(request).await {
            Ok(response) => response,
            Err(err) => {
                if self.policy.serve_stale_on_error
                    && let Ok(Some(stale)) = self.restore(&key, &entry, SystemTime::now()).await
                {
                    self.log.warn(format_args!(
                        "origin unreachable for {key}; serving stale entry: {err:#}"
                    ));
                    return self.deliver(stale);
                }
                return Err(err);
            }
        };

        if response.status == StatusCode::NOT_MODIFIED {
            self.log
                .trace(format_args!("origin confirmed {key} is unchanged"));
            let mut refreshed = entry;
            refreshed.refresh_from(&response.headers);
            if let Some(restored) = self.restore(&key, &refreshed, SystemTime::now()).await? {
                match self.meta.store(&key, refreshed).await {
                    Ok(()) => self.record(Event::Store),
                    Err(err) => self.log.warn(format_args!(
                        "metadata refresh failed for {key}: {err:#}"
                    )),
                }
                return self.deliver(restored);
            }
            // The confirmed body vanished underneath us; refetch in full.
            let refetch = Request::new(method, uri, request_headers);
            let method = refetch.method.clone();
            let headers = refetch.headers.clone();
            let response = self.forward(refetch).await?;
            return self.classify_and_store(key, method, headers, response).await;
        }

        if response.status.is_server_error()
            && self.policy.serve_stale_on_error
            && let Some(stale) = self.restore(&key, &entry, SystemTime::now()).await?
        {
            self.log.warn(format_args!(
                "origin returned {} for {key}; serving stale entry",
                response.status
            ));
            return self.deliver(stale);
        }

        self.classify_and_store(key, method, request_headers, response)
            .await
    }

    /// Stores the response when HTTP semantics allow it, then delivers. The
    /// cache is an optimization: store failures are logged and the response
    /// goes out regardless.
    async fn classify_and_store(
        &mut self,
        key: CacheKey,
        method: Method,
        request_headers: HeaderMap,
        response: Response,
    ) -> Result<Response> {
        let cc = CacheControl::parse(&response.headers);
        let storable = (method == Method::GET || method == Method::HEAD)
            && status_cacheable_by_default(response.status)
            && !cc.no_store;
        if !storable {
            self.log
                .trace(format_args!("response for {key} is not storable"));
            return self.deliver(response);
        }
        self.store_response(key, request_headers, response).await
    }

    async fn store_response(
        &mut self,
        key: CacheKey,
        request_headers: HeaderMap,
        mut response: Response,
    ) -> Result<Response> {
        let buffered = match response.body.buffer(self.policy.max_entry_size).await? {
            Buffered::Complete(bytes) => bytes,
            Buffered::Overflow(rest) => {
                self.log.info(format_args!(
                    "body for {key} exceeds the entry size cap; skipping store"
                ));
                response.body = rest;
                return self.deliver(response);
            }
        };
        response.body = Body::from_bytes(buffered.clone());

        // Stamp a Date if the origin omitted one, on both the entry and the
        // outgoing response, so a later hit reports the same Date.
        if !response.headers.contains_key(DATE)
            && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now()))
        {
            response.headers.insert(DATE, value);
        }
        let mut stored_headers = response.headers.clone();
        stored_headers.remove(AGE);

        let Some(mut entry) =
            StoredEntry::capture(&request_headers, response.status, stored_headers)
        else {
            self.log
                .trace(format_args!("vary rules make {key} unstorable"));
            return self.deliver(response);
        };

        let mut tee = Body::from_bytes(buffered);
        let written = match self.entity.write(&mut tee).await {
            Ok(written) => written,
            Err(err) => {
                self.log
                    .warn(format_args!("body store failed for {key}: {err:#}"));
                return self.deliver(response);
            }
        };
        if let Err(err) = entry.set_digest(&written.digest) {
            self.log
                .warn(format_args!("digest header invalid for {key}: {err:#}"));
            return self.deliver(response);
        }
        if let Err(err) = self.meta.store(&key, entry).await {
            self.log
                .warn(format_args!("metadata store failed for {key}: {err:#}"));
            return self.deliver(response);
        }

        self.record(Event::Store);
        self.log.trace(format_args!(
            "stored {key} ({} bytes, digest {})",
            written.length, written.digest
        ));
        self.deliver(response)
    }

    /// Rebuilds a deliverable response from a stored entry: body from the
    /// entity store, stored headers, computed `Age`. Corruption degrades to
    /// "as if uncached": the entry is purged and `None` is returned.
    async fn restore(
        &mut self,
        key: &CacheKey,
        entry: &StoredEntry,
        now: SystemTime,
    ) -> Result<Option<Response>> {
        let Some(digest) = entry.digest() else {
            self.log.warn(format_args!(
                "stored entry for {key} has no body digest; purging"
            ));
            let _ = self.meta.purge(key).await;
            return Ok(None);
        };

        let bytes = match self.entity.read(digest).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.log.info(format_args!(
                    "stored body for {key} is missing; treating as miss"
                ));
                let _ = self.meta.purge(key).await;
                return Ok(None);
            }
            Err(err) => {
                self.log.info(format_args!(
                    "body read failed for {key}: {err:#}; treating as miss"
                ));
                return Ok(None);
            }
        };

        if digest_hex(&bytes) != digest {
            self.log.warn(format_args!(
                "body digest mismatch for {key}; purging corrupt entry"
            ));
            let digest = digest.to_string();
            let _ = self.meta.purge(key).await;
            let _ = self.entity.purge(&digest).await;
            return Ok(None);
        }

        let mut headers = entry.response_headers.clone();
        headers.insert(AGE, HeaderValue::from(entry.age(now).as_secs()));
        Ok(Some(Response {
            status: entry.status,
            headers,
            body: Body::from_bytes(bytes),
        }))
    }

    fn deliver(&mut self, response: Response) -> Result<Response> {
        self.record(Event::Deliver);
        Ok(response)
    }
}
