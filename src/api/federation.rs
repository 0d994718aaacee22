//! Federation endpoints
//!
//! - GET  /users/:username           actor document
//! - POST /users/:username/inbox     per-actor inbox
//! - POST /inbox                     shared inbox
//! - GET  /users/:username/outbox    paged outbox
//! - GET  /objects/:id               note document
//!
//! Documents are signed by their author with the same header triple used
//! for requests. Inbox requests are only checked for shape and freshness
//! here; verification happens in the inbox queue.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State},
    http::{Method, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::pagination::{self, Cursor, DEFAULT_PAGE_LIMIT, Filter, PageRequest};
use crate::data::{Actor, Note, Visibility};
use crate::error::AppError;
use crate::federation::client::FEDERATION_CONTENT_TYPE;
use crate::federation::signature::sign_response;
use crate::federation::{Entity, NoteEntity, SigningIdentity, UserDocument};
use crate::metrics::FEDERATION_REQUESTS_TOTAL;
use crate::queue::{InboxQueue, RequestMeta};

/// Create federation router
///
/// Inbox routes reject bodies larger than `max_body_bytes` with 413.
pub fn federation_router(max_body_bytes: usize) -> Router<AppState> {
    let inboxes = Router::new()
        .route("/users/:username/inbox", post(user_inbox))
        .route("/inbox", post(shared_inbox))
        .layer(DefaultBodyLimit::max(max_body_bytes));

    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/outbox", get(outbox))
        .route("/objects/:id", get(object))
        .merge(inboxes)
}

/// JSON response signed by `identity`
fn signed_json<T: Serialize>(
    identity: &SigningIdentity,
    uri: &Uri,
    document: &T,
) -> Result<Response, AppError> {
    let body = serde_json::to_vec(document).map_err(|e| AppError::Internal(e.into()))?;
    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or_else(|| uri.path());
    let signature = sign_response(identity, path, &body);

    let mut response = (StatusCode::OK, [(CONTENT_TYPE, FEDERATION_CONTENT_TYPE)], body).into_response();
    for (name, value) in signature.header_pairs() {
        if let Ok(value) = http::HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

async fn local_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .db
        .get_local_actor_by_username(username)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /users/:username
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let identity = SigningIdentity::from_actor(&actor)?;
    signed_json(&identity, &uri, &Entity::User(UserDocument::from_actor(&actor)))
}

/// POST /users/:username/inbox
async fn user_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    local_actor(&state, &username).await?;
    accept_inbound(&state, Some(username), connect_info, method, uri, headers, body).await
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    accept_inbound(&state, None, connect_info, method, uri, headers, body).await
}

async fn accept_inbound(
    state: &AppState,
    recipient: Option<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let signature = match InboxQueue::validate(
        &headers,
        &body,
        state.config.federation.signature_max_age(),
        Utc::now(),
    ) {
        Ok(signature) => signature,
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "rejected"])
                .inc();
            return Err(error);
        }
    };

    let meta = RequestMeta {
        method: method.as_str().to_ascii_lowercase(),
        path: uri
            .path_and_query()
            .map(|path| path.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        remote_addr: connect_info.map(|ConnectInfo(addr)| addr.to_string()),
        recipient,
    };
    let job = state.inbox.enqueue(&body, signature, meta).await?;

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "accepted"])
        .inc();
    Ok(Json(serde_json::json!({
        "status": "accepted",
        "job": job.id,
    })))
}

#[derive(Debug, Deserialize)]
struct OutboxQuery {
    page: Option<String>,
    limit: Option<usize>,
}

/// One outbox page with links to its neighbours and both ends
#[derive(Debug, Serialize)]
struct OutboxPage {
    first: String,
    last: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<String>,
    total: i64,
    items: Vec<NoteEntity>,
}

/// Notes of `author` that may be shown to anyone
fn public_notes_of(author_id: &str) -> Filter {
    Filter::new("notes")
        .eq("author_id", author_id)
        .eq("is_local", true)
        .any_of(
            "visibility",
            [Visibility::Public.as_str(), Visibility::Unlisted.as_str()],
        )
}

/// GET /users/:username/outbox?page=&limit=
///
/// `page` is an opaque cursor; without one the newest page is served.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<OutboxQuery>,
    uri: Uri,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let limit = PageRequest::default()
        .with_limit(query.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .limit();
    let cursor = match query.page.as_deref() {
        Some(token) => Cursor::decode(token)?,
        None => Cursor::head(),
    };

    let filter = public_notes_of(&actor.id);
    let page = pagination::paginate::<Note>(state.db.pool(), &filter, &cursor.to_request(limit)).await?;
    let total = pagination::count(state.db.pool(), &filter).await?;

    let outbox_url = actor
        .outbox_url
        .clone()
        .unwrap_or_else(|| format!("{}/outbox", actor.uri));
    let page_url = |cursor: &Cursor| format!("{}?page={}&limit={}", outbox_url, cursor.encode(), limit);

    let document = OutboxPage {
        first: page_url(&Cursor::head()),
        last: page_url(&Cursor::tail()),
        next: page.links.next.as_ref().map(|cursor| page_url(cursor)),
        previous: page.links.prev.as_ref().map(|cursor| page_url(cursor)),
        total,
        items: page
            .items
            .iter()
            .map(|note| NoteEntity::from_note(note, &actor.uri))
            .collect(),
    };

    let identity = SigningIdentity::from_actor(&actor)?;
    signed_json(&identity, &uri, &document)
}

/// GET /objects/:id
///
/// 404 unless the note is local and public or unlisted.
async fn object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    uri: Uri,
) -> Result<Response, AppError> {
    let note = state
        .db
        .get_note(&id)
        .await?
        .filter(|note| note.is_local && note.visibility().is_publicly_fetchable())
        .ok_or(AppError::NotFound)?;
    let author = state
        .db
        .get_actor(&note.author_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let identity = SigningIdentity::from_actor(&author)?;
    signed_json(
        &identity,
        &uri,
        &Entity::Note(NoteEntity::from_note(&note, &author.uri)),
    )
}
