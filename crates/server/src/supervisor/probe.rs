//! HTTP probes against the agent: API prefix detection, readiness, health.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::launcher::AgentEndpoint;

/// Prefixes the agent may mount its API under, in probe order.
pub const API_PREFIX_CANDIDATES: &[&str] = &["", "/api"];
/// Endpoints that must all answer before the agent counts as ready.
pub const READINESS_PATHS: &[&str] = &["/config", "/agent"];
/// Cheap endpoint used by the periodic health monitor.
pub const HEALTH_PATH: &str = "/config";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("timed out")]
    Timeout,
    #[error("agent not ready within {0:?}: {1}")]
    NotReady(Duration, String),
}

#[async_trait]
pub trait AgentProbe: Send + Sync + 'static {
    /// `GET` a path on the agent; succeeds only on a 2xx answer.
    async fn get(
        &self,
        endpoint: &AgentEndpoint,
        path: &str,
        timeout: Duration,
    ) -> Result<(), ProbeError>;
}

pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentProbe for HttpProbe {
    async fn get(
        &self,
        endpoint: &AgentEndpoint,
        path: &str,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        let url = format!("{}{}", endpoint.base_url(), path);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Connect(e.to_string())
                }
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

/// First candidate prefix whose `/config` answers, if any.
pub async fn detect_api_prefix(
    probe: &dyn AgentProbe,
    endpoint: &AgentEndpoint,
    timeout: Duration,
) -> Option<String> {
    for prefix in API_PREFIX_CANDIDATES {
        let path = format!("{prefix}/config");
        if probe.get(endpoint, &path, timeout).await.is_ok() {
            return Some((*prefix).to_string());
        }
    }
    None
}

/// Poll until the API prefix is known and every readiness path answers.
///
/// Returns the detected prefix.
pub async fn wait_until_ready(
    probe: &dyn AgentProbe,
    endpoint: &AgentEndpoint,
    budget: Duration,
    retry: Duration,
    request_timeout: Duration,
) -> Result<String, ProbeError> {
    let deadline = Instant::now() + budget;
    let mut last_error = String::from("no probe attempted");

    loop {
        match detect_api_prefix(probe, endpoint, request_timeout).await {
            Some(prefix) => {
                let mut all_ok = true;
                for path in READINESS_PATHS {
                    if let Err(err) = probe
                        .get(endpoint, &format!("{prefix}{path}"), request_timeout)
                        .await
                    {
                        last_error = format!("{prefix}{path}: {err}");
                        all_ok = false;
                        break;
                    }
                }
                if all_ok {
                    return Ok(prefix);
                }
            }
            None => last_error = "no API prefix answered".to_string(),
        }

        debug!(
            component = "supervisor",
            event = "supervisor.readiness.retry",
            port = endpoint.port,
            last_error = %last_error,
        );

        if Instant::now() + retry > deadline {
            return Err(ProbeError::NotReady(budget, last_error));
        }
        tokio::time::sleep(retry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers only paths under `/api`, and only after `warmup` failed calls.
    struct PrefixedProbe {
        warmup: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentProbe for PrefixedProbe {
        async fn get(&self, _: &AgentEndpoint, path: &str, _: Duration) -> Result<(), ProbeError> {
            self.seen.lock().unwrap().push(path.to_string());
            if self
                .warmup
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProbeError::Connect("refused".into()));
            }
            if path.starts_with("/api/") {
                Ok(())
            } else {
                Err(ProbeError::Status(404))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_prefixed_api_answers() {
        let probe = PrefixedProbe {
            warmup: AtomicUsize::new(3),
            seen: Mutex::new(Vec::new()),
        };
        let endpoint = AgentEndpoint::new("127.0.0.1", 4096);
        let prefix = wait_until_ready(
            &probe,
            &endpoint,
            Duration::from_secs(5),
            Duration::from_millis(250),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(prefix, "/api");
        let seen = probe.seen.lock().unwrap();
        assert!(seen.iter().any(|p| p == "/api/agent"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let probe = PrefixedProbe {
            warmup: AtomicUsize::new(usize::MAX),
            seen: Mutex::new(Vec::new()),
        };
        let endpoint = AgentEndpoint::new("127.0.0.1", 4096);
        let err = wait_until_ready(
            &probe,
            &endpoint,
            Duration::from_secs(1),
            Duration::from_millis(250),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::NotReady(..)));
    }
}
