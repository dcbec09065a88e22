use std::time::{Duration, SystemTime};

use http::header::{AGE, CACHE_CONTROL, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use once_cell::sync::Lazy;

use super::control::CacheControl;

/// Header identifying the stored body in the entity store.
pub static X_CONTENT_DIGEST: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-content-digest"));

const MAX_VARY_HEADERS: usize = 8;
const MAX_VARY_BYTES: usize = 8 * 1024;

/// Statuses a shared cache may store without explicit freshness directives
/// (RFC 7231 §6.1). Notably excludes 303.
const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

pub fn status_cacheable_by_default(status: StatusCode) -> bool {
    CACHEABLE_STATUSES.contains(&status.as_u16())
}

/// One stored variant of a response: the request-header subset named by the
/// response's `Vary`, the status, and the full response header set (which
/// carries `X-Content-Digest` once the body is persisted).
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub request_headers: HeaderMap,
    pub status: StatusCode,
    pub response_headers: HeaderMap,
}

impl StoredEntry {
    /// Captures a storable variant from a request/response exchange. Returns
    /// `None` when the `Vary` rules make the response unstorable: `Vary: *`,
    /// a vary dimension the request did not supply, or vary material beyond
    /// the configured limits.
    pub fn capture(
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: HeaderMap,
    ) -> Option<Self> {
        let mut subset = HeaderMap::new();
        let mut vary_bytes = 0usize;

        for name in vary_names(&response_headers)? {
            let value = request_headers.get(&name)?;
            if subset.len() + 1 > MAX_VARY_HEADERS {
                return None;
            }
            vary_bytes = vary_bytes.saturating_add(name.as_str().len() + value.as_bytes().len());
            if vary_bytes > MAX_VARY_BYTES {
                return None;
            }
            subset.insert(name, value.clone());
        }

        Some(Self {
            request_headers: subset,
            status,
            response_headers,
        })
    }

    /// True when this variant answers the given request: every header named
    /// in the stored `Vary` must carry the value seen at store time.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        let Some(names) = vary_names(&self.response_headers) else {
            return false;
        };
        names
            .into_iter()
            .all(|name| self.request_headers.get(&name) == request_headers.get(&name))
    }

    /// True when this entry and `other` cover the same vary combination, in
    /// which case storing `other` replaces this entry.
    pub fn same_variant(&self, other: &StoredEntry) -> bool {
        if self.request_headers.len() != other.request_headers.len() {
            return false;
        }
        self.request_headers
            .iter()
            .all(|(name, value)| other.request_headers.get(name) == Some(value))
    }

    pub fn digest(&self) -> Option<&str> {
        self.response_headers
            .get(&*X_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
    }

    pub fn set_digest(&mut self, digest: &str) -> anyhow::Result<()> {
        let value = HeaderValue::from_str(digest)?;
        self.response_headers.insert(X_CONTENT_DIGEST.clone(), value);
        Ok(())
    }

    pub fn date(&self) -> Option<SystemTime> {
        http_date(&self.response_headers, &DATE)
    }

    pub fn expires(&self) -> Option<SystemTime> {
        http_date(&self.response_headers, &EXPIRES)
    }

    pub fn etag(&self) -> Option<HeaderValue> {
        self.response_headers.get(ETAG).cloned()
    }

    pub fn last_modified(&self) -> Option<HeaderValue> {
        self.response_headers.get(LAST_MODIFIED).cloned()
    }

    /// Current age: `max(0, now − Date)` plus any age the response already
    /// carried when it was received.
    pub fn age(&self, now: SystemTime) -> Duration {
        let since_date = self
            .date()
            .and_then(|date| now.duration_since(date).ok())
            .unwrap_or(Duration::ZERO);
        let carried = self
            .response_headers
            .get(AGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        since_date + carried
    }

    /// `s-maxage`, else `max-age`, else `Expires − Date`, else the
    /// configured default.
    pub fn freshness_lifetime(&self, default_ttl: Duration) -> Duration {
        let cc = CacheControl::parse(&self.response_headers);
        if let Some(max_age) = cc.shared_max_age() {
            return max_age;
        }
        if let (Some(expires), Some(date)) = (self.expires(), self.date()) {
            return expires.duration_since(date).unwrap_or(Duration::ZERO);
        }
        default_ttl
    }

    /// Fresh entries may be served without revalidation. A stored `no-cache`
    /// never qualifies, whatever its lifetime says.
    pub fn is_fresh(&self, now: SystemTime, default_ttl: Duration) -> bool {
        let cc = CacheControl::parse(&self.response_headers);
        if cc.no_cache {
            return false;
        }
        self.age(now) < self.freshness_lifetime(default_ttl)
    }

    /// Merges the headers a `304 Not Modified` is allowed to refresh into
    /// this entry. The body digest is untouched; `Age` is never persisted.
    pub fn refresh_from(&mut self, headers: &HeaderMap) {
        for name in [DATE, EXPIRES, CACHE_CONTROL, ETAG, LAST_MODIFIED] {
            if headers.contains_key(&name) {
                self.response_headers.remove(&name);
                for value in headers.get_all(&name) {
                    self.response_headers.append(name.clone(), value.clone());
                }
            }
        }
    }
}

/// Header names listed in `Vary`, comma-split and trimmed. `None` means the
/// response varies on the full request (`Vary: *`) and cannot be stored.
fn vary_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(VARY) {
        let Ok(list) = value.to_str() else { continue };
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if token == "*" {
                return None;
            }
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                names.push(name);
            }
        }
    }
    Some(names)
}

fn http_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(headers: HeaderMap) -> StoredEntry {
        StoredEntry {
            request_headers: HeaderMap::new(),
            status: StatusCode::OK,
            response_headers: headers,
        }
    }

    fn date_header(at: SystemTime) -> HeaderValue {
        HeaderValue::from_str(&httpdate::fmt_http_date(at)).unwrap()
    }

    #[test]
    fn max_age_defines_lifetime() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=120"));
        let entry = entry_with(headers);
        assert_eq!(
            entry.freshness_lifetime(Duration::ZERO),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn expires_minus_date_is_the_fallback() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(DATE, date_header(now));
        headers.insert(EXPIRES, date_header(now + Duration::from_secs(30)));
        let entry = entry_with(headers);
        assert_eq!(
            entry.freshness_lifetime(Duration::ZERO),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn lifetime_defaults_to_configured_ttl() {
        let entry = entry_with(HeaderMap::new());
        assert_eq!(
            entry.freshness_lifetime(Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn age_clamps_future_dates_to_zero() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(DATE, date_header(now + Duration::from_secs(60)));
        let entry = entry_with(headers);
        assert_eq!(entry.age(now), Duration::ZERO);
    }

    #[test]
    fn age_adds_carried_age_header() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(DATE, date_header(now - Duration::from_secs(10)));
        headers.insert(AGE, HeaderValue::from_static("5"));
        let entry = entry_with(headers);
        let age = entry.age(now);
        assert!(age >= Duration::from_secs(15) && age < Duration::from_secs(17));
    }

    #[test]
    fn no_cache_entries_are_never_fresh() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(DATE, date_header(now));
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, max-age=3600"),
        );
        let entry = entry_with(headers);
        assert!(!entry.is_fresh(now, Duration::ZERO));
    }

    #[test]
    fn capture_collects_vary_subset() {
        let mut request = HeaderMap::new();
        request.insert("accept-language", HeaderValue::from_static("fi"));
        request.insert("user-agent", HeaderValue::from_static("test"));
        let mut response = HeaderMap::new();
        response.insert(VARY, HeaderValue::from_static("Accept-Language"));

        let entry = StoredEntry::capture(&request, StatusCode::OK, response).unwrap();
        assert_eq!(entry.request_headers.len(), 1);
        assert!(entry.matches(&request));

        let mut other = HeaderMap::new();
        other.insert("accept-language", HeaderValue::from_static("de"));
        assert!(!entry.matches(&other));
    }

    #[test]
    fn capture_refuses_vary_star() {
        let mut response = HeaderMap::new();
        response.insert(VARY, HeaderValue::from_static("*"));
        assert!(StoredEntry::capture(&HeaderMap::new(), StatusCode::OK, response).is_none());
    }

    #[test]
    fn capture_refuses_missing_vary_dimension() {
        let mut response = HeaderMap::new();
        response.insert(VARY, HeaderValue::from_static("Accept-Language"));
        assert!(StoredEntry::capture(&HeaderMap::new(), StatusCode::OK, response).is_none());
    }

    #[test]
    fn refresh_replaces_validators_and_lifetime_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=1"));
        let mut entry = entry_with(headers);

        let mut refreshed = HeaderMap::new();
        refreshed.insert(ETAG, HeaderValue::from_static("\"v2\""));
        refreshed.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        refreshed.insert(AGE, HeaderValue::from_static("99"));
        entry.refresh_from(&refreshed);

        assert_eq!(entry.etag().unwrap(), "\"v2\"");
        assert_eq!(
            entry.freshness_lifetime(Duration::ZERO),
            Duration::from_secs(60)
        );
        assert!(!entry.response_headers.contains_key(AGE));
    }

    #[test]
    fn cacheable_status_set_excludes_303() {
        assert!(status_cacheable_by_default(StatusCode::OK));
        assert!(status_cacheable_by_default(StatusCode::NOT_FOUND));
        assert!(status_cacheable_by_default(StatusCode::GONE));
        assert!(!status_cacheable_by_default(StatusCode::SEE_OTHER));
        assert!(!status_cacheable_by_default(StatusCode::NO_CONTENT));
    }
}
