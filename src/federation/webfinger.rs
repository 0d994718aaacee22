//! WebFinger discovery
//!
//! Maps `acct:user@domain` handles to canonical actor URIs, both for
//! local accounts (serving the JRD) and remote ones (querying it).

use serde::{Deserialize, Serialize};

use super::client::{FEDERATION_CONTENT_TYPE, FederationClient};
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// Actor URI advertised by the `self` link
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link.link_type.as_deref().is_none_or(|media_type| {
                        media_type == FEDERATION_CONTENT_TYPE
                            || media_type == "application/activity+json"
                    })
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_uri` - Canonical URI of the account
pub fn generate_webfinger_response(username: &str, domain: &str, actor_uri: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_uri.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(FEDERATION_CONTENT_TYPE.to_string()),
            href: Some(actor_uri.to_string()),
        }],
    }
}

/// Split `acct:user@domain` or `user@domain` into its parts
pub fn parse_acct(resource: &str) -> Option<(String, String)> {
    let handle = resource.strip_prefix("acct:").unwrap_or(resource);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (username, domain) = handle.split_once('@')?;
    if username.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((username.to_string(), domain.to_ascii_lowercase()))
}

/// Query a remote WebFinger endpoint
///
/// # Arguments
/// * `scheme` - `http` or `https`, matching how this instance federates
/// * `username` - Remote username
/// * `domain` - Remote domain (may include a port)
///
/// # Returns
/// The advertised actor URI, or None if the JRD has no usable `self` link
pub async fn lookup(
    client: &FederationClient,
    scheme: &str,
    username: &str,
    domain: &str,
) -> Result<Option<String>, AppError> {
    let resource = format!("acct:{}@{}", username, domain);
    let url = format!(
        "{}://{}/.well-known/webfinger?resource={}",
        scheme,
        domain,
        urlencoding::encode(&resource)
    );

    let document = client.get_json(&url, None).await?;
    let response: WebFingerResponse = serde_json::from_value(document)
        .map_err(|e| AppError::Protocol(format!("Malformed WebFinger response: {}", e)))?;

    Ok(response.actor_uri().map(str::to_string))
}
