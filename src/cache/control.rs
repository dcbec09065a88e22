use std::time::Duration;

use http::HeaderMap;

/// Parsed `Cache-Control` directives, request- or response-side.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub must_revalidate: bool,
}

impl CacheControl {
    /// Folds every comma-separated directive across all `Cache-Control`
    /// headers into one struct. Unknown directives and unparseable arguments
    /// are skipped rather than rejected.
    pub fn parse(headers: &HeaderMap) -> Self {
        headers
            .get_all(http::header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .fold(CacheControl::default(), |acc, token| acc.apply(token))
    }

    fn apply(mut self, token: &str) -> Self {
        let (name, argument) = match token.split_once('=') {
            Some((name, argument)) => (name, Some(argument)),
            None => (token, None),
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "public" => self.public = true,
            "private" => self.private = true,
            "no-cache" => self.no_cache = true,
            "no-store" => self.no_store = true,
            "must-revalidate" => self.must_revalidate = true,
            "max-age" => {
                if let Some(seconds) = directive_seconds(argument) {
                    self.max_age = Some(seconds);
                }
            }
            "s-maxage" => {
                if let Some(seconds) = directive_seconds(argument) {
                    self.s_maxage = Some(seconds);
                }
            }
            _ => {}
        }
        self
    }

    /// Shared-cache freshness lifetime from directives alone: `s-maxage`
    /// wins over `max-age`. `Expires` fallback lives with the entry, which
    /// knows its `Date`.
    pub fn shared_max_age(&self) -> Option<Duration> {
        self.s_maxage.or(self.max_age)
    }
}

fn directive_seconds(argument: Option<&str>) -> Option<Duration> {
    let seconds = argument?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}
