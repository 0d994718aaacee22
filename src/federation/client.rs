//! Outbound federation HTTP client
//!
//! Wraps `reqwest` with signing and an SSRF guard: targets must be
//! http(s) URLs whose host does not name or resolve to a loopback,
//! private, link-local or unspecified address, unless
//! `federation.allow_private_addresses` is set.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use super::signature::{SigningIdentity, sign_request};
use crate::config::FederationConfig;
use crate::error::AppError;

/// Media type of federation documents
pub const FEDERATION_CONTENT_TYPE: &str = "application/json";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation("No DNS records for host".to_string()));
    }

    Ok(())
}

/// Extract and validate the lowercase host of a remote URI.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(uri: &str) -> Result<String, AppError> {
    let parsed = parse_http_url(uri)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

fn parse_http_url(uri: &str) -> Result<url::Url, AppError> {
    let parsed =
        url::Url::parse(uri).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(AppError::Validation(format!(
            "Unsupported URL scheme: {}",
            scheme
        ))),
    }
}

/// Status codes worth retrying later
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// HTTP client for federation traffic
pub struct FederationClient {
    http: reqwest::Client,
    allow_private_addresses: bool,
}

impl FederationClient {
    pub fn new(config: &FederationConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Meridian/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http,
            allow_private_addresses: config.allow_private_addresses,
        })
    }

    /// Validate that `url` may be fetched
    ///
    /// # Errors
    /// - `Validation` for malformed or non-http(s) URLs
    /// - `Forbidden` for local/private targets
    /// - `Federation` when the host does not resolve
    pub async fn check_target(&self, url: &str) -> Result<url::Url, AppError> {
        let parsed = parse_http_url(url)?;
        if self.allow_private_addresses {
            return Ok(parsed);
        }

        let host = extract_actor_domain(url)?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await?;

        Ok(parsed)
    }

    /// GET a JSON document, optionally signed
    ///
    /// # Errors
    /// - `NotFound` for 404/410
    /// - `Federation` for other non-success statuses or unparsable bodies
    /// - `HttpClient` for network failures
    pub async fn get_json(
        &self,
        url: &str,
        signer: Option<&SigningIdentity>,
    ) -> Result<serde_json::Value, AppError> {
        self.check_target(url).await?;

        let mut request = self.http.get(url).header(ACCEPT, FEDERATION_CONTENT_TYPE);
        if let Some(signer) = signer {
            for (name, value) in sign_request(signer, "GET", url, b"")?.header_pairs() {
                request = request.header(name, value);
            }
        }

        let started = Instant::now();
        let response = request.send().await;
        let status = observe_outbound("get", &response, started);
        let response = response?;

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(AppError::NotFound);
        }
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "GET {} returned HTTP {}",
                url, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Invalid JSON from {}: {}", url, e)))
    }

    /// POST `body` signed by `signer`
    ///
    /// # Returns
    /// The response status; callers classify non-success codes.
    pub async fn post_signed(
        &self,
        url: &str,
        body: Vec<u8>,
        signer: &SigningIdentity,
    ) -> Result<StatusCode, AppError> {
        self.check_target(url).await?;

        let mut request = self.http.post(url).header(CONTENT_TYPE, FEDERATION_CONTENT_TYPE);
        for (name, value) in sign_request(signer, "POST", url, &body)?.header_pairs() {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let response = request.body(body).send().await;
        let status = observe_outbound("post", &response, started);
        response?;

        Ok(status)
    }
}

fn observe_outbound(
    method: &str,
    response: &Result<reqwest::Response, reqwest::Error>,
    started: Instant,
) -> StatusCode {
    let (status, label) = match response {
        Ok(response) => (response.status(), response.status().as_u16().to_string()),
        Err(_) => (StatusCode::BAD_GATEWAY, "network_error".to_string()),
    };
    let direction = format!("outbound_{method}");

    crate::metrics::FEDERATION_REQUESTS_TOTAL
        .with_label_values(&[direction.as_str(), label.as_str()])
        .inc();
    crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&[direction.as_str()])
        .observe(started.elapsed().as_secs_f64());

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(allow_private_addresses: bool) -> FederationClient {
        let mut config = crate::config::tests::valid_config().federation;
        config.allow_private_addresses = allow_private_addresses;
        FederationClient::new(&config).unwrap()
    }

    #[test]
    fn extract_actor_domain_rejects_localhost() {
        match extract_actor_domain("https://localhost/users/alice") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for localhost, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_rejects_private_ip() {
        match extract_actor_domain("http://192.168.1.10/users/alice") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for private ip, got: {other:?}"),
        }
        match extract_actor_domain("http://[::1]:8080/users/alice") {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for ipv6 loopback, got: {other:?}"),
        }
    }

    #[test]
    fn extract_actor_domain_accepts_public_host() {
        let domain = extract_actor_domain("https://Example.com/users/alice")
            .expect("public host should be accepted");
        assert_eq!(domain, "example.com");
    }

    #[test]
    fn extract_actor_domain_rejects_other_schemes() {
        match extract_actor_domain("ftp://example.com/users/alice") {
            Err(AppError::Validation(msg)) => assert!(msg.contains("Unsupported URL scheme")),
            other => panic!("expected scheme rejection, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validate_resolved_host_ips_rejects_loopback() {
        match validate_resolved_host_ips("127.0.0.1", 80).await {
            Err(AppError::Forbidden) => {}
            other => panic!("expected forbidden for loopback resolution, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_target_honours_private_address_switch() {
        assert!(matches!(
            client(false).check_target("http://127.0.0.1:9/users/a").await,
            Err(AppError::Forbidden)
        ));
        assert!(client(true)
            .check_target("http://127.0.0.1:9/users/a")
            .await
            .is_ok());
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::GONE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }
}
