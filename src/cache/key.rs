use http::{Method, Uri};

/// Identity under which the metadata store indexes entries: request method
/// plus the canonical URL. The `address` is the hex digest used as the disk
/// file name for the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    text: String,
    address: String,
}

impl CacheKey {
    pub fn new(method: &Method, uri: &Uri) -> Self {
        let text = format!("{}::{}", method, canonical_uri(uri));
        Self::from_text(text)
    }

    pub fn from_text(text: String) -> Self {
        let address = Self::address_for(&text);
        Self { text, address }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn address_for(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Renders a URI with its query pairs sorted so equivalent URLs produce the
/// same key. Path and pair contents are left untouched.
fn canonical_uri(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let path = uri.path();

    match uri.query() {
        None | Some("") => format!("{scheme}://{authority}{path}"),
        Some(query) => {
            let mut pairs: Vec<&str> = query.split('&').collect();
            pairs.sort_unstable();
            format!("{scheme}://{authority}{path}?{}", pairs.join("&"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().expect("test uri")
    }

    #[test]
    fn distinct_methods_get_distinct_keys() {
        let get = CacheKey::new(&Method::GET, &uri("http://example.com/a"));
        let head = CacheKey::new(&Method::HEAD, &uri("http://example.com/a"));
        assert_ne!(get, head);
    }

    #[test]
    fn query_order_does_not_matter() {
        let a = CacheKey::new(&Method::GET, &uri("http://example.com/a?x=1&y=2"));
        let b = CacheKey::new(&Method::GET, &uri("http://example.com/a?y=2&x=1"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_hosts_never_collide() {
        let a = CacheKey::new(&Method::GET, &uri("http://alpha.example.com/p"));
        let b = CacheKey::new(&Method::GET, &uri("http://beta.example.com/p"));
        assert_ne!(a, b);
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn address_is_stable_hex() {
        let key = CacheKey::new(&Method::GET, &uri("http://example.com/"));
        assert_eq!(key.address().len(), 64);
        assert!(key.address().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(key.address(), CacheKey::from_text(key.text().to_string()).address());
    }
}
