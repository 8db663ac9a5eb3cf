//! Cached model catalog from models.dev.
//!
//! The UI reads model limits and pricing from the catalog. One copy is kept
//! for [`MODELS_METADATA_TTL`]; when a refresh comes back non-2xx the stale
//! copy is served instead of an error.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ApiError;

pub const MODELS_DEV_API_URL: &str = "https://models.dev/api.json";
pub const MODELS_METADATA_TTL: Duration = Duration::from_secs(5 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(8);

struct Cached {
    fetched_at: Instant,
    payload: Value,
}

pub struct ModelsMetadata {
    http: reqwest::Client,
    url: String,
    ttl: Duration,
    /// Held across the fetch so concurrent misses share one request.
    cache: Mutex<Option<Cached>>,
}

impl ModelsMetadata {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_source(http, MODELS_DEV_API_URL, MODELS_METADATA_TTL)
    }

    pub fn with_source(http: reqwest::Client, url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Value, ApiError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.payload.clone());
            }
        }

        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    component = "models_metadata",
                    event = "models_metadata.fetch.failed",
                    error = %e,
                );
                ApiError::BadGateway("Failed to load models metadata".into())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                component = "models_metadata",
                event = "models_metadata.fetch.status",
                status = status.as_u16(),
                stale_available = cache.is_some(),
            );
            return match cache.as_ref() {
                Some(stale) => Ok(stale.payload.clone()),
                None => Err(ApiError::BadGateway(format!(
                    "models.dev responded with status {status}"
                ))),
            };
        }

        let payload: Value = response.json().await.map_err(|e| {
            warn!(
                component = "models_metadata",
                event = "models_metadata.parse.failed",
                error = %e,
            );
            ApiError::BadGateway("Failed to parse models metadata".into())
        })?;
        debug!(
            component = "models_metadata",
            event = "models_metadata.fetch.cached",
        );
        *cache = Some(Cached {
            fetched_at: Instant::now(),
            payload: payload.clone(),
        });
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    struct Catalog {
        hits: AtomicUsize,
        failing: AtomicBool,
    }

    async fn spawn_catalog() -> (String, Arc<Catalog>) {
        let catalog = Arc::new(Catalog {
            hits: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        });
        let shared = catalog.clone();
        let app = Router::new().route(
            "/api.json",
            get(move || {
                let catalog = shared.clone();
                async move {
                    let n = catalog.hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if catalog.failing.load(Ordering::SeqCst) {
                        Err(StatusCode::INTERNAL_SERVER_ERROR)
                    } else {
                        Ok(Json(json!({ "openai": { "version": n } })))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{port}/api.json"), catalog)
    }

    #[tokio::test]
    async fn fresh_copy_is_served_from_cache() {
        let (url, catalog) = spawn_catalog().await;
        let models = ModelsMetadata::with_source(reqwest::Client::new(), url, MODELS_METADATA_TTL);

        let first = models.get().await.unwrap();
        let second = models.get().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(catalog.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_stale_copy() {
        let (url, catalog) = spawn_catalog().await;
        let models = ModelsMetadata::with_source(reqwest::Client::new(), url, Duration::ZERO);

        let first = models.get().await.unwrap();
        catalog.failing.store(true, Ordering::SeqCst);
        let stale = models.get().await.unwrap();
        assert_eq!(stale, first);
        assert_eq!(catalog.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_without_cache_is_bad_gateway() {
        let (url, catalog) = spawn_catalog().await;
        catalog.failing.store(true, Ordering::SeqCst);
        let models = ModelsMetadata::with_source(reqwest::Client::new(), url, MODELS_METADATA_TTL);

        let err = models.get().await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
