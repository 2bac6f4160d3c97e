//! URL resolution
//!
//! Input URLs pass through pluggable protocol handlers before a request is
//! made (e.g. a `nxm:` style scheme expanding into concrete mirror links).
//! Results are cached for a few minutes keyed on the input URL so retries
//! and restarts do not hammer the handler. Unregistered schemes resolve to
//! themselves; a failing handler logs and resolves to nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use url::Url;

/// How long a handler result stays fresh.
pub const URL_RESOLVE_EXPIRE: Duration = Duration::from_secs(5 * 60);

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<String>, String>> + Send>>;

/// Scheme-specific URL expander, registered without the trailing colon.
pub trait ProtocolHandler: Send + Sync {
    fn resolve(&self, url: &str) -> HandlerFuture;
}

impl<F> ProtocolHandler for F
where
    F: Fn(&str) -> HandlerFuture + Send + Sync,
{
    fn resolve(&self, url: &str) -> HandlerFuture {
        self(url)
    }
}

/// Split a `real<referer` input at the first `<`; the prefix is the request
/// URL, the suffix the Referer header value.
pub fn split_referer(input: &str) -> (&str, Option<&str>) {
    match input.find('<') {
        Some(pos) => (&input[..pos], Some(&input[pos + 1..])),
        None => (input, None),
    }
}

struct CacheEntry {
    at: Instant,
    urls: Vec<String>,
}

/// Handler registry plus freshness cache.
pub struct UrlResolver {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl UrlResolver {
    pub fn new(handlers: HashMap<String, Arc<dyn ProtocolHandler>>) -> Self {
        Self {
            handlers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one input URL into zero or more concrete URLs.
    ///
    /// Identity for schemes without a handler (the referer suffix rides
    /// along untouched); empty on handler failure.
    pub async fn resolve(&self, input: &str) -> Vec<String> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(entry) = cache.get(input) {
                if entry.at.elapsed() < URL_RESOLVE_EXPIRE {
                    return entry.urls.clone();
                }
            }
        }

        let (bare, _referer) = split_referer(input);
        let scheme = Url::parse(bare).map(|u| u.scheme().to_string()).ok();
        let handler = scheme.as_deref().and_then(|s| self.handlers.get(s));

        let urls = match handler {
            None => vec![input.to_string()],
            Some(handler) => match handler.resolve(bare).await {
                Ok(urls) => urls,
                Err(err) => {
                    warn!("[Resolver] handler failed for {}: {}", bare, err);
                    Vec::new()
                }
            },
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                input.to_string(),
                CacheEntry {
                    at: Instant::now(),
                    urls: urls.clone(),
                },
            );
        }
        urls
    }

    /// Resolve a mirror list, concatenating each input's expansion in order.
    pub async fn resolve_all(&self, inputs: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for input in inputs {
            out.extend(self.resolve(input).await);
        }
        out
    }
}
