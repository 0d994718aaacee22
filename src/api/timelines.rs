//! List endpoints
//!
//! - GET /api/v1/accounts/:id/statuses
//! - GET /api/v1/timelines/public
//!
//! Both accept `max_id`, `since_id`, `min_id` and `limit` and advertise
//! adjacent pages through a `Link` header.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Uri, header::LINK},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::AppState;
use crate::data::pagination::{self, Filter, Page, PageRequest};
use crate::data::{Note, Visibility};
use crate::error::AppError;

pub fn timelines_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/accounts/:id/statuses", get(account_statuses))
        .route("/api/v1/timelines/public", get(public_timeline))
}

fn page_response(state: &AppState, uri: &Uri, request: &PageRequest, page: Page<Note>) -> Response {
    let endpoint_url = format!("{}{}", state.config.server.base_url(), uri.path());

    let mut headers = HeaderMap::new();
    if let Some(link) = page.links.to_link_header(&endpoint_url, request.limit()) {
        if let Ok(value) = HeaderValue::from_str(&link) {
            headers.insert(LINK, value);
        }
    }

    (headers, Json(page.items)).into_response()
}

/// GET /api/v1/accounts/:id/statuses
async fn account_statuses(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(request): Query<PageRequest>,
    uri: Uri,
) -> Result<Response, AppError> {
    let actor = state.db.get_actor(&id).await?.ok_or(AppError::NotFound)?;

    let filter = Filter::new("notes").eq("author_id", actor.id.as_str()).any_of(
        "visibility",
        [Visibility::Public.as_str(), Visibility::Unlisted.as_str()],
    );
    let page = pagination::paginate::<Note>(state.db.pool(), &filter, &request).await?;

    Ok(page_response(&state, &uri, &request, page))
}

/// GET /api/v1/timelines/public
async fn public_timeline(
    State(state): State<AppState>,
    Query(request): Query<PageRequest>,
    uri: Uri,
) -> Result<Response, AppError> {
    let filter = Filter::new("notes").eq("visibility", Visibility::Public.as_str());
    let page = pagination::paginate::<Note>(state.db.pool(), &filter, &request).await?;

    Ok(page_response(&state, &uri, &request, page))
}
