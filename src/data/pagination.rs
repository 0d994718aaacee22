//! Keyset pagination over ULID-keyed tables
//!
//! Pages are bounded by the `id` column rather than offsets, so rows
//! inserted while a client walks the collection never shift a page.
//!
//! Boundary parameters compose with the caller's filter:
//! - `max_id`: `id < max_id` (older than)
//! - `min_id`: `id > min_id` (newer than, adjacent to the boundary)
//! - `since_id`: `id >= since_id` (newest rows down to the boundary)
//!
//! Items are always returned newest first.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};

use super::models::Note;
use crate::error::AppError;

/// Page size when the client gives none
pub const DEFAULT_PAGE_LIMIT: usize = 20;
/// Upper bound on the page size
pub const MAX_PAGE_LIMIT: usize = 40;

/// Rows that expose their pagination key
pub trait PageKey {
    fn page_key(&self) -> &str;
}

impl PageKey for Note {
    fn page_key(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Filter
// =============================================================================

/// Value bound into a filter clause
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Bool(bool),
    Int(i64),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(&'static str, FilterValue),
    In(&'static str, Vec<FilterValue>),
}

/// Base predicate of a paginated query
///
/// Table and column names are compile-time constants; only values are bound.
#[derive(Debug, Clone)]
pub struct Filter {
    table: &'static str,
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            clauses: Vec::new(),
        }
    }

    /// `column = value`
    pub fn eq(mut self, column: &'static str, value: impl Into<FilterValue>) -> Self {
        self.clauses.push(Clause::Eq(column, value.into()));
        self
    }

    /// `column IN (values...)`
    pub fn any_of<V: Into<FilterValue>>(
        mut self,
        column: &'static str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::In(
            column,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    fn push_where<'a>(&'a self, builder: &mut QueryBuilder<'a, Sqlite>) {
        builder.push(" WHERE 1 = 1");
        for clause in &self.clauses {
            match clause {
                Clause::Eq(column, value) => {
                    builder.push(" AND ").push(*column).push(" = ");
                    push_value(builder, value);
                }
                Clause::In(column, values) => {
                    if values.is_empty() {
                        builder.push(" AND 1 = 0");
                        continue;
                    }
                    builder.push(" AND ").push(*column).push(" IN (");
                    let mut separated = builder.separated(", ");
                    for value in values {
                        match value {
                            FilterValue::Text(text) => separated.push_bind(text.as_str()),
                            FilterValue::Bool(flag) => separated.push_bind(*flag),
                            FilterValue::Int(number) => separated.push_bind(*number),
                        };
                    }
                    separated.push_unseparated(")");
                }
            }
        }
    }
}

fn push_value<'a>(builder: &mut QueryBuilder<'a, Sqlite>, value: &'a FilterValue) {
    match value {
        FilterValue::Text(text) => builder.push_bind(text.as_str()),
        FilterValue::Bool(flag) => builder.push_bind(*flag),
        FilterValue::Int(number) => builder.push_bind(*number),
    };
}

// =============================================================================
// Request / Page
// =============================================================================

/// Boundary parameters of a list request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    pub max_id: Option<String>,
    pub since_id: Option<String>,
    pub min_id: Option<String>,
    pub limit: Option<usize>,
}

impl PageRequest {
    /// Effective page size, clamped to `1..=MAX_PAGE_LIMIT`
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Direction a cursor moves relative to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Rows with smaller keys (`max_id`)
    Older,
    /// Rows with larger keys (`min_id`)
    Newer,
}

/// Opaque page boundary
///
/// An empty key means "from the edge": `Older` from the newest row,
/// `Newer` from the oldest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub direction: Direction,
    pub key: String,
}

impl Cursor {
    pub fn older_than(key: impl Into<String>) -> Self {
        Self {
            direction: Direction::Older,
            key: key.into(),
        }
    }

    pub fn newer_than(key: impl Into<String>) -> Self {
        Self {
            direction: Direction::Newer,
            key: key.into(),
        }
    }

    /// Newest page of the collection
    pub fn head() -> Self {
        Self::older_than("")
    }

    /// Oldest page of the collection
    pub fn tail() -> Self {
        Self::newer_than("")
    }

    /// URL-safe token
    pub fn encode(&self) -> String {
        let tag = match self.direction {
            Direction::Older => 'o',
            Direction::Newer => 'n',
        };
        URL_SAFE_NO_PAD.encode(format!("{tag}:{}", self.key))
    }

    pub fn decode(token: &str) -> Result<Self, AppError> {
        let invalid = || AppError::Validation("Invalid page cursor".to_string());

        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (tag, key) = raw.split_once(':').ok_or_else(invalid)?;

        if !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        match tag {
            "o" => Ok(Self::older_than(key)),
            "n" => Ok(Self::newer_than(key)),
            _ => Err(invalid()),
        }
    }

    /// Boundary parameters selected by this cursor
    pub fn to_request(&self, limit: usize) -> PageRequest {
        let key = (!self.key.is_empty()).then(|| self.key.clone());
        match self.direction {
            Direction::Older => PageRequest {
                max_id: key,
                limit: Some(limit),
                ..Default::default()
            },
            Direction::Newer => PageRequest {
                // `id > ''` holds for every ULID
                min_id: Some(key.unwrap_or_default()),
                limit: Some(limit),
                ..Default::default()
            },
        }
    }
}

/// Links to the adjacent pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLinks {
    /// Older rows
    pub next: Option<Cursor>,
    /// Newer rows
    pub prev: Option<Cursor>,
}

impl PageLinks {
    /// Render an RFC 8288 `Link` header for list endpoints
    ///
    /// # Returns
    /// None when neither link exists.
    pub fn to_link_header(&self, endpoint_url: &str, limit: usize) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(next) = &self.next {
            parts.push(format!(
                "<{endpoint_url}?limit={limit}&max_id={}>; rel=\"next\"",
                urlencoding::encode(&next.key)
            ));
        }
        if let Some(prev) = &self.prev {
            parts.push(format!(
                "<{endpoint_url}?limit={limit}&min_id={}>; rel=\"prev\"",
                urlencoding::encode(&prev.key)
            ));
        }

        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

/// One page of rows, newest first
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub links: PageLinks,
}

// =============================================================================
// Queries
// =============================================================================

/// Fetch one page of `filter` bounded by `request`
///
/// A page shorter than the limit ends the collection in its direction;
/// no follow-up query is issued to confirm it.
pub async fn paginate<T>(
    pool: &Pool<Sqlite>,
    filter: &Filter,
    request: &PageRequest,
) -> Result<Page<T>, AppError>
where
    T: for<'r> FromRow<'r, SqliteRow> + PageKey + Send + Unpin,
{
    let limit = request.limit();
    let ascending = request.min_id.is_some();

    let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
    builder.push(filter.table);
    filter.push_where(&mut builder);

    if let Some(max_id) = &request.max_id {
        builder.push(" AND id < ").push_bind(max_id.as_str());
    }
    if let Some(min_id) = &request.min_id {
        builder.push(" AND id > ").push_bind(min_id.as_str());
    }
    if let Some(since_id) = &request.since_id {
        builder.push(" AND id >= ").push_bind(since_id.as_str());
    }

    builder.push(if ascending {
        " ORDER BY id ASC"
    } else {
        " ORDER BY id DESC"
    });
    builder.push(" LIMIT ").push_bind(limit as i64);

    let mut items = builder.build_query_as::<T>().fetch_all(pool).await?;
    if ascending {
        items.reverse();
    }

    let links = derive_links(&items, request, limit);
    Ok(Page { items, links })
}

/// Number of rows matching `filter`, ignoring boundaries
pub async fn count(pool: &Pool<Sqlite>, filter: &Filter) -> Result<i64, AppError> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
    builder.push(filter.table);
    filter.push_where(&mut builder);

    let (total,) = builder
        .build_query_as::<(i64,)>()
        .fetch_one(pool)
        .await?;

    Ok(total)
}

fn derive_links<T: PageKey>(items: &[T], request: &PageRequest, limit: usize) -> PageLinks {
    let (Some(newest), Some(oldest)) = (items.first(), items.last()) else {
        return PageLinks::default();
    };

    let full = items.len() >= limit;
    let from_min = request.min_id.is_some();

    // A min_id page sits directly above its boundary, which is older still,
    // unless the boundary is the empty tail key. Fullness says nothing
    // about rows below an ascending page.
    let older_exists = match request.min_id.as_deref() {
        Some(key) => !key.is_empty(),
        None => full,
    };
    let newer_exists = if from_min {
        full
    } else {
        request.max_id.is_some()
    };

    PageLinks {
        next: older_exists.then(|| Cursor::older_than(oldest.page_key())),
        prev: newer_exists.then(|| Cursor::newer_than(newest.page_key())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row(&'static str);

    impl PageKey for Row {
        fn page_key(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn cursor_token_round_trips() {
        let cursor = Cursor::older_than("01HZX3T9G4W2B6P0N8R7Q5K1M3");
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
        assert_eq!(Cursor::decode(&Cursor::tail().encode()).unwrap(), Cursor::tail());
    }

    #[test]
    fn cursor_rejects_garbage() {
        for token in ["", "!!!", "eDox", &URL_SAFE_NO_PAD.encode("o:' OR 1=1 --")] {
            match Cursor::decode(token) {
                Err(AppError::Validation(msg)) => assert!(msg.contains("cursor")),
                other => panic!("expected validation error for {token:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(PageRequest::default().limit(), DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::default().with_limit(0).limit(), 1);
        assert_eq!(PageRequest::default().with_limit(500).limit(), MAX_PAGE_LIMIT);
    }

    #[test]
    fn head_page_has_no_prev() {
        let rows = [Row("05"), Row("04")];
        let links = derive_links(&rows, &PageRequest::default(), 2);
        assert_eq!(links.next, Some(Cursor::older_than("04")));
        assert_eq!(links.prev, None);
    }

    #[test]
    fn short_page_is_final_towards_older() {
        let rows = [Row("01")];
        let request = PageRequest {
            max_id: Some("02".to_string()),
            ..Default::default()
        };
        let links = derive_links(&rows, &request, 2);
        assert_eq!(links.next, None);
        assert_eq!(links.prev, Some(Cursor::newer_than("01")));
    }

    #[test]
    fn short_min_id_page_reached_the_head() {
        let rows = [Row("05")];
        let request = PageRequest {
            min_id: Some("04".to_string()),
            ..Default::default()
        };
        let links = derive_links(&rows, &request, 2);
        assert_eq!(links.prev, None);
        assert_eq!(links.next, Some(Cursor::older_than("05")));
    }

    #[test]
    fn full_tail_page_has_no_next() {
        let rows = [Row("02"), Row("01")];
        let links = derive_links(&rows, &Cursor::tail().to_request(2), 2);
        assert_eq!(links.next, None);
        assert_eq!(links.prev, Some(Cursor::newer_than("02")));
    }

    #[test]
    fn full_min_id_page_above_a_key_has_both_links() {
        let rows = [Row("04"), Row("03")];
        let links = derive_links(&rows, &Cursor::newer_than("02").to_request(2), 2);
        assert_eq!(links.next, Some(Cursor::older_than("03")));
        assert_eq!(links.prev, Some(Cursor::newer_than("04")));
    }

    #[test]
    fn empty_page_has_no_links() {
        let rows: [Row; 0] = [];
        let request = PageRequest {
            max_id: Some("01".to_string()),
            ..Default::default()
        };
        assert_eq!(derive_links(&rows, &request, 2), PageLinks::default());
    }

    #[test]
    fn link_header_lists_both_directions() {
        let links = PageLinks {
            next: Some(Cursor::older_than("A1")),
            prev: Some(Cursor::newer_than("B2")),
        };
        let header = links
            .to_link_header("https://example.com/api/v1/timelines/public", 20)
            .unwrap();
        assert_eq!(
            header,
            "<https://example.com/api/v1/timelines/public?limit=20&max_id=A1>; rel=\"next\", \
             <https://example.com/api/v1/timelines/public?limit=20&min_id=B2>; rel=\"prev\""
        );
        assert!(PageLinks::default().to_link_header("x", 20).is_none());
    }
}
