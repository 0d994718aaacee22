//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /nodeinfo/2.0

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::data::pagination::{self, Filter};
use crate::error::AppError;
use crate::federation::nodeinfo::{NodeInfo, NodeInfoLinks};
use crate::federation::webfinger::{WebFingerResponse, generate_webfinger_response, parse_acct};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<WebFingerResponse>, AppError> {
    let (username, domain) = parse_acct(&query.resource)
        .ok_or_else(|| AppError::Validation("Invalid acct resource".to_string()))?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let actor = state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(generate_webfinger_response(
        &actor.username,
        &state.config.server.domain,
        &actor.uri,
    )))
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<NodeInfoLinks> {
    Json(NodeInfoLinks::local(&state.config.server.base_url()))
}

/// GET /nodeinfo/2.0
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<NodeInfo>, AppError> {
    let pool = state.db.pool();
    let users = pagination::count(pool, &Filter::new("users").eq("is_remote", false)).await?;
    let posts = pagination::count(pool, &Filter::new("notes").eq("is_local", true)).await?;

    Ok(Json(NodeInfo::local(users, posts, &state.config.instance.title)))
}
