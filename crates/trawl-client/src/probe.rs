use std::time::Duration;

use reqwest::{Client, StatusCode};
use trawl_core::error::AppError;
use trawl_core::proxy::ProxyEndpoint;
use trawl_core::traits::ProxyProbe;
use trawl_core::util::millis;

/// Builds a reqwest client that sends all traffic through `endpoint`.
pub fn client_for(endpoint: &ProxyEndpoint, timeout: Duration) -> Result<Client, AppError> {
    let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| AppError::InvalidProxy {
        input: endpoint.redacted(),
        reason: e.to_string(),
    })?;

    Client::builder()
        .user_agent(concat!("trawl/", env!("CARGO_PKG_VERSION")))
        .proxy(proxy)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::NetworkError(format!("Failed to build HTTP client: {e}")))
}

/// Map a transport error onto the core taxonomy so retry classification works.
pub(crate) fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(millis(timeout))
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}

pub(crate) fn check_status(status: StatusCode, url: &str) -> Result<(), AppError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::TOO_MANY_REQUESTS => Err(AppError::RateLimitExceeded),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => Err(AppError::NetworkError(format!(
            "Proxy rejected credentials (HTTP 407) for {url}"
        ))),
        s => Err(AppError::NetworkError(format!("HTTP {} for {url}", s.as_u16()))),
    }
}

/// Checks a proxy by fetching a known URL through it.
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    check_url: String,
    timeout: Duration,
}

impl ReqwestProbe {
    pub fn new(check_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            check_url: check_url.into(),
            timeout,
        }
    }

    pub fn check_url(&self) -> &str {
        &self.check_url
    }
}

impl ProxyProbe for ReqwestProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<(), AppError> {
        let client = client_for(endpoint, self.timeout)?;
        let response = client
            .get(&self.check_url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        check_status(response.status(), &self.check_url)?;
        tracing::debug!(proxy = %endpoint, url = %self.check_url, "Probe succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trawl_core::ErrorKind;

    use super::*;
    use crate::testutil::{dead_proxy, fake_proxy};

    #[tokio::test]
    async fn test_probe_through_working_proxy() {
        let endpoint = fake_proxy("200 OK").await;
        let probe = ReqwestProbe::new("http://check.invalid/ip", Duration::from_secs(5));
        probe.probe(&endpoint).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_maps_rate_limit() {
        let endpoint = fake_proxy("429 Too Many Requests").await;
        let probe = ReqwestProbe::new("http://check.invalid/ip", Duration::from_secs(5));
        let err = probe.probe(&endpoint).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_probe_refused_connection_is_network_error() {
        let endpoint = dead_proxy().await;
        let probe = ReqwestProbe::new("http://check.invalid/ip", Duration::from_secs(5));
        let err = probe.probe(&endpoint).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(StatusCode::NO_CONTENT, "u").is_ok());
        assert!(matches!(
            check_status(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "u"),
            Err(AppError::NetworkError(msg)) if msg.contains("407")
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY, "u"),
            Err(AppError::NetworkError(msg)) if msg.contains("502")
        ));
    }

    #[test]
    fn test_client_for_socks_endpoint() {
        let endpoint = ProxyEndpoint::parse("socks5://user:pw@127.0.0.1:1080").unwrap();
        assert!(client_for(&endpoint, Duration::from_secs(1)).is_ok());
    }
}
