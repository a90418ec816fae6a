//! Locate the credential service base URL.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::storage::SecureStorage;

const CACHE_KEY: &str = "backend_url";

#[derive(Deserialize)]
struct BackendDocument {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CachedBackend {
    url: String,
}

/// Query `discovery_urls` in order; the first `{"url": "..."}` document wins.
pub async fn find_backend(client: &reqwest::Client, discovery_urls: &[String]) -> Option<String> {
    for source in discovery_urls {
        let response = match client.get(source).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(%source, status = %r.status(), "discovery source unavailable");
                continue;
            }
            Err(e) => {
                debug!(%source, error = %e, "discovery source unreachable");
                continue;
            }
        };

        match response.json::<BackendDocument>().await {
            Ok(BackendDocument { url: Some(url) }) if !url.is_empty() => {
                info!(%source, backend = %url, "discovered backend");
                return Some(url);
            }
            Ok(_) => debug!(%source, "discovery document has no url"),
            Err(e) => debug!(%source, error = %e, "discovery document is not JSON"),
        }
    }
    None
}

/// Resolve the backend for `config`: explicit URL first, then a cached
/// discovery result younger than `cache_ttl`, then discovery. Only URLs that
/// a source actually returned are cached.
pub async fn resolve_backend(
    client: &reqwest::Client,
    config: &BackendConfig,
    cache: Option<&SecureStorage>,
) -> String {
    if let Some(url) = &config.url {
        return url.clone();
    }
    if let Some(cached) = cache.and_then(|c| c.get::<CachedBackend>(CACHE_KEY)) {
        debug!(backend = %cached.url, "using cached backend");
        return cached.url;
    }

    match find_backend(client, &config.discovery_urls).await {
        Some(url) => {
            if let Some(cache) = cache {
                let entry = CachedBackend { url: url.clone() };
                if let Err(e) = cache.set_for(CACHE_KEY, &entry, config.cache_ttl) {
                    warn!(error = %e, "failed to cache discovered backend");
                }
            }
            url
        }
        None => {
            if !config.discovery_urls.is_empty() {
                warn!(
                    fallback = %config.fallback_url,
                    "no discovery source answered, using fallback backend"
                );
            }
            config.fallback_url.clone()
        }
    }
}
