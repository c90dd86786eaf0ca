use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use trawl_core::error::AppError;
use trawl_core::proxy::ProxyEndpoint;
use trawl_core::proxy_router::ProxyRouter;
use trawl_core::retry::RetryPolicy;

use crate::probe::{check_status, client_for, map_reqwest_error};

/// HTTP fetcher that sends each request through the router's next healthy proxy.
///
/// Every outcome is reported back to the router, so failing proxies are
/// blacklisted and later requests rotate away from them. Combine with a
/// [`RetryPolicy`] via [`fetch_with_retry`](Self::fetch_with_retry) to move
/// on to another proxy after a transient failure.
#[derive(Clone)]
pub struct RoutedFetcher {
    router: ProxyRouter,
    timeout: Duration,
    clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl RoutedFetcher {
    pub fn new(router: ProxyRouter) -> Self {
        Self::with_timeout(router, Duration::from_secs(30))
    }

    pub fn with_timeout(router: ProxyRouter, timeout: Duration) -> Self {
        Self {
            router,
            timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn router(&self) -> &ProxyRouter {
        &self.router
    }

    fn client(&self, endpoint: &ProxyEndpoint) -> Result<Client, AppError> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(endpoint.url()) {
            return Ok(client.clone());
        }
        let client = client_for(endpoint, self.timeout)?;
        clients.insert(endpoint.url().to_string(), client.clone());
        Ok(client)
    }

    /// Fetch `url` once. Fails with `ProxyUnavailable` when the pool has no healthy endpoint.
    pub async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let endpoint = self.router.require_next()?;
        let client = self.client(&endpoint)?;
        let started = Instant::now();

        match self.send(&client, url).await {
            Ok(body) => {
                self.router.mark_success(&endpoint, started.elapsed());
                Ok(body)
            }
            Err(e) => {
                tracing::debug!(proxy = %endpoint, %url, error = %e, "Request through proxy failed");
                self.router.mark_failed(&endpoint);
                Err(e)
            }
        }
    }

    /// Fetch `url`, retrying transient failures through the next proxy in rotation.
    pub async fn fetch_with_retry(&self, url: &str, policy: &RetryPolicy) -> Result<String, AppError> {
        policy.execute(|| self.fetch(url)).await
    }

    async fn send(&self, client: &Client, url: &str) -> Result<String, AppError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        check_status(response.status(), url)?;
        response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use trawl_core::proxy::ProxySource;
    use trawl_core::proxy_router::ProxyRouterConfig;
    use trawl_core::retry::RetryConfig;

    use super::*;
    use crate::testutil::{dead_proxy, fake_proxy};

    fn router_for(endpoints: Vec<ProxyEndpoint>, threshold: u32) -> ProxyRouter {
        let router = ProxyRouter::new(ProxyRouterConfig::default().with_failure_threshold(threshold));
        router.load_from(&ProxySource::Endpoints(endpoints)).unwrap();
        router
    }

    #[tokio::test]
    async fn test_success_is_recorded_on_the_router() {
        let good = fake_proxy("200 OK").await;
        let fetcher = RoutedFetcher::new(router_for(vec![good.clone()], 3));

        let body = fetcher.fetch("http://target.invalid/").await.unwrap();

        assert_eq!(body, "ok");
        assert_eq!(fetcher.router().health(&good).unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_unavailable() {
        let fetcher = RoutedFetcher::new(ProxyRouter::default());
        let err = fetcher.fetch("http://target.invalid/").await.unwrap_err();
        assert!(matches!(err, AppError::ProxyUnavailable));
    }

    #[tokio::test]
    async fn test_retry_rotates_past_dead_proxy() {
        let dead = dead_proxy().await;
        let good = fake_proxy("200 OK").await;
        let fetcher = RoutedFetcher::new(router_for(vec![dead.clone(), good.clone()], 1));
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(Duration::ZERO),
        );

        let body = fetcher
            .fetch_with_retry("http://target.invalid/", &policy)
            .await
            .unwrap();

        assert_eq!(body, "ok");
        let router = fetcher.router();
        assert_eq!(router.health(&dead).unwrap().failure_count, 1);
        assert_eq!(router.get_healthy(), vec![good]);
    }
}
