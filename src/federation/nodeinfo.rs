//! NodeInfo documents
//!
//! Serves this instance's NodeInfo 2.0 document and discovers the software
//! of remote instances through `/.well-known/nodeinfo`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::client::FederationClient;
use crate::data::{EntityId, Instance};
use crate::error::AppError;

pub const NODEINFO_REL_PREFIX: &str = "http://nodeinfo.diaspora.software/ns/schema/2.";
pub const NODEINFO_REL: &str = "http://nodeinfo.diaspora.software/ns/schema/2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoLinks {
    #[serde(default)]
    pub links: Vec<NodeInfoLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoLink {
    pub rel: String,
    pub href: String,
}

impl NodeInfoLinks {
    pub fn local(base_url: &str) -> Self {
        Self {
            links: vec![NodeInfoLink {
                rel: NODEINFO_REL.to_string(),
                href: format!("{}/nodeinfo/2.0", base_url.trim_end_matches('/')),
            }],
        }
    }

    /// First link to a 2.x schema document
    pub fn schema_2_href(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel.starts_with(NODEINFO_REL_PREFIX))
            .map(|link| link.href.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Software {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub software: Software,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub open_registrations: bool,
    #[serde(default)]
    pub usage: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NodeInfo {
    /// Document describing this instance
    pub fn local(local_users: i64, local_posts: i64, title: &str) -> Self {
        Self {
            version: "2.0".to_string(),
            software: Software {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            protocols: vec!["meridian".to_string()],
            open_registrations: false,
            usage: serde_json::json!({
                "users": { "total": local_users },
                "localPosts": local_posts,
            }),
            metadata: serde_json::json!({ "nodeName": title }),
        }
    }
}

/// Fetch instance metadata of `domain`
///
/// # Errors
/// `Protocol` when the instance advertises no 2.x document
pub async fn discover(
    client: &FederationClient,
    scheme: &str,
    domain: &str,
) -> Result<Instance, AppError> {
    let base_url = format!("{}://{}", scheme, domain);
    let links: NodeInfoLinks = serde_json::from_value(
        client
            .get_json(&format!("{}/.well-known/nodeinfo", base_url), None)
            .await?,
    )
    .map_err(|e| AppError::Protocol(format!("Malformed NodeInfo links: {}", e)))?;

    let href = links.schema_2_href().ok_or_else(|| {
        AppError::Protocol(format!("{} advertises no NodeInfo 2.x document", domain))
    })?;

    let document: NodeInfo = serde_json::from_value(client.get_json(href, None).await?)
        .map_err(|e| AppError::Protocol(format!("Malformed NodeInfo document: {}", e)))?;

    let now = Utc::now();
    Ok(Instance {
        id: EntityId::new().0,
        domain: domain.to_ascii_lowercase(),
        base_url,
        software_name: Some(document.software.name),
        software_version: document.software.version,
        last_fetched_at: Some(now),
        created_at: now,
        updated_at: now,
    })
}
