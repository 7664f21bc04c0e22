//! IPHub classification source.

use super::{Classification, ClassificationSource, SourceError};
use crate::config::IpHubConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// IPHub API response.
#[derive(Debug, Deserialize)]
#[allow(dead_code)] // Informational fields, only logged
struct IpHubResponse {
    /// 0 = residential, 1 = non-residential (hosting/VPN), 2 = mixed.
    #[serde(default)]
    block: Option<u8>,

    #[serde(rename = "countryCode", default)]
    country_code: Option<String>,

    #[serde(default)]
    isp: Option<String>,

    #[serde(default)]
    asn: Option<u32>,
}

/// IPHub provider.
pub struct IpHubProvider {
    config: IpHubConfig,
    client: Client,
}

impl IpHubProvider {
    /// Create a new IPHub provider.
    pub fn new(config: IpHubConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, client })
    }

    fn url_for(&self, ip: &IpAddr) -> String {
        self.config.url_template.replace("{ip}", &ip.to_string())
    }
}

#[async_trait]
impl ClassificationSource for IpHubProvider {
    async fn classify(&self, ip: &IpAddr) -> Result<Classification, SourceError> {
        if !self.config.enabled {
            return Err(SourceError::Disabled);
        }

        // IPHub only classifies IPv4
        if ip.is_ipv6() {
            return Err(SourceError::UnsupportedAddress(*ip));
        }

        if !self.config.has_api_key() {
            return Err(SourceError::Unauthorized(
                "missing or placeholder api_key".to_string(),
            ));
        }

        let url = self.url_for(ip);
        debug!(ip = %ip, url = %url, "Querying IPHub");

        let response = self
            .client
            .get(&url)
            .header("X-Key", &self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        debug!(ip = %ip, status = status.as_u16(), "IPHub responded");

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("IPHub rate limit exceeded");
                return Err(SourceError::RateLimited);
            }
            StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Unauthorized(format!(
                    "invalid API key or quota exceeded: {}",
                    body
                )));
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::InvalidResponse(format!(
                    "HTTP 422 for {}: {}",
                    ip, body
                )));
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::InvalidResponse(format!("HTTP {}: {}", s, body)));
            }
            _ => {}
        }

        let parsed: IpHubResponse = response.json().await.map_err(|e| {
            SourceError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let block = parsed.block.ok_or_else(|| {
            SourceError::InvalidResponse("no 'block' field in response".to_string())
        })?;

        debug!(
            ip = %ip,
            block = block,
            country = ?parsed.country_code,
            isp = ?parsed.isp,
            "IPHub lookup complete"
        );

        Ok(Classification::from_severity(block, self.config.flag_threshold))
    }

    fn name(&self) -> &str {
        "iphub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Confidence;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_config(server: &MockServer) -> IpHubConfig {
        IpHubConfig {
            enabled: true,
            api_key: "test-key".to_string(),
            url_template: format!("{}/ip/{{ip}}", server.uri()),
            flag_threshold: 1,
            timeout_ms: 2000,
        }
    }

    async fn classify_with(status: u16, body: serde_json::Value) -> Result<Classification, SourceError> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip/1.2.3.4"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;

        let provider = IpHubProvider::new(create_test_config(&server)).unwrap();
        provider.classify(&"1.2.3.4".parse().unwrap()).await
    }

    #[test]
    fn test_provider_name() {
        let provider = IpHubProvider::new(IpHubConfig::default()).unwrap();
        assert_eq!(provider.name(), "iphub");
    }

    #[test]
    fn test_url_for() {
        let provider = IpHubProvider::new(IpHubConfig::default()).unwrap();
        assert_eq!(
            provider.url_for(&"1.2.3.4".parse().unwrap()),
            "https://v2.api.iphub.info/ip/1.2.3.4"
        );
    }

    #[tokio::test]
    async fn test_flagged_response_sends_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip/1.2.3.4"))
            .and(header("X-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ip": "1.2.3.4",
                "countryCode": "NL",
                "isp": "Some Hosting",
                "asn": 64500,
                "block": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = IpHubProvider::new(create_test_config(&server)).unwrap();
        let result = provider.classify(&"1.2.3.4".parse().unwrap()).await.unwrap();

        assert!(result.flagged);
        assert_eq!(result.severity, Some(1));
        assert_eq!(result.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_residential_is_clean() {
        let result = classify_with(200, serde_json::json!({ "block": 0 })).await.unwrap();
        assert!(!result.flagged);
        assert_eq!(result.severity, Some(0));
    }

    #[tokio::test]
    async fn test_high_severity_is_flagged() {
        let result = classify_with(200, serde_json::json!({ "block": 80 })).await.unwrap();
        assert!(result.flagged);
        assert_eq!(result.severity, Some(80));
    }

    #[tokio::test]
    async fn test_missing_block_is_invalid() {
        let err = classify_with(200, serde_json::json!({ "ip": "1.2.3.4" }))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_forbidden_is_unauthorized() {
        let err = classify_with(403, serde_json::json!({ "error": "bad key" }))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let err = classify_with(429, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SourceError::RateLimited));
    }

    #[tokio::test]
    async fn test_unprocessable_and_server_errors() {
        let err = classify_with(422, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidResponse(_)));

        let err = classify_with(500, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_ipv6_rejected_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let provider = IpHubProvider::new(create_test_config(&server)).unwrap();
        let err = provider
            .classify(&"2001:db8::1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedAddress(_)));
    }

    #[tokio::test]
    async fn test_placeholder_key_rejected_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = create_test_config(&server);
        config.api_key = crate::config::PLACEHOLDER_API_KEY.to_string();
        let provider = IpHubProvider::new(config).unwrap();

        let err = provider
            .classify(&"1.2.3.4".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unauthorized(_)));
    }
}
