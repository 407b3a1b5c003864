use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::pool::Lease;
use crate::transport::{ApiOutcome, Transport};

pub const FEED_PATH: &str = "/api/sns/web/v1/feed";
pub const TOP_COMMENTS_PATH: &str = "/api/sns/web/v2/comment/page";
pub const SUB_COMMENTS_PATH: &str = "/api/sns/web/v2/comment/sub/page";
pub const SEARCH_PATH: &str = "/api/sns/web/v1/search/notes";

/// Sub-comment page size the platform fixes; the top-level size is
/// server-chosen.
pub const SUB_PAGE_SIZE: u32 = 10;

const IMAGE_FORMATS: &str = "jpg,webp,avif";

/// Parse a count that may arrive as a native integer, a numeric string, or a
/// suffixed string like `"2.1万"` / `"3.5w"` (both suffixes mean x10,000).
pub fn parse_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Value::String(s) => parse_count_str(s).unwrap_or_else(|| {
            tracing::warn!(raw = %s, "unparseable count; treating as 0");
            0
        }),
        _ => 0,
    }
}

fn parse_count_str(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Some(0);
    }
    let (digits, factor) = if let Some(rest) = s.strip_suffix('万') {
        (rest, 10_000.0)
    } else if let Some(rest) = s.strip_suffix(['w', 'W']) {
        (rest, 10_000.0)
    } else {
        (s, 1.0)
    };
    let n: f64 = digits.trim().parse().ok()?;
    if n < 0.0 {
        return Some(0);
    }
    Some((n * factor) as u64)
}

fn de_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_count(&value))
}

/// Cursors arrive as strings, but numbers have been observed too.
fn de_string_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUser {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
}

/// One comment record as the wire sends it. Unknown fields are tolerated
/// extras; the nested `sub_comments` list is an input hint, not the
/// authoritative tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireComment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "user")]
    pub user_info: WireUser,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default, deserialize_with = "de_count")]
    pub sub_comment_count: u64,
    #[serde(default)]
    pub sub_comments: Vec<WireComment>,
    #[serde(default, deserialize_with = "de_string_from_any")]
    pub sub_comment_cursor: String,
    #[serde(default)]
    pub sub_comment_has_more: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentPage {
    #[serde(default)]
    pub comments: Vec<WireComment>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, deserialize_with = "de_string_from_any")]
    pub cursor: String,
}

/// Normalized note metadata, the shape written to `note_<id>_basic.json`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NoteInfo {
    pub note_id: String,
    pub url: String,
    pub title: String,
    pub desc: String,
    pub note_type: String,
    pub author_id: String,
    pub author_name: String,
    pub liked_count: u64,
    pub collected_count: u64,
    pub comment_count: u64,
    pub share_count: u64,
    pub publish_time: i64,
    pub crawl_time: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchHit {
    pub note_id: String,
    pub xsec_token: String,
    pub title: String,
    pub comment_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilters {
    /// 0 default ranking, 1 newest, 2 most liked, 3 most commented, 4 most collected.
    pub sort_type: u8,
    /// 0 all, 1 video notes, 2 image notes.
    pub note_type: u8,
}

impl SearchFilters {
    fn sort_wire(&self) -> &'static str {
        match self.sort_type {
            1 => "time_descending",
            2 => "popularity_descending",
            3 => "comment_descending",
            4 => "collect_descending",
            _ => "general",
        }
    }
}

/// Seam for fetching one note's metadata; the production implementation is
/// `EndpointClient`, tests script their own.
pub trait NoteApi {
    fn note_info(
        &self,
        lease: Lease,
        note_id: &str,
        xsec_token: &str,
    ) -> impl std::future::Future<Output = ApiOutcome<NoteInfo>> + Send;
}

/// Seam for the two comment-page endpoints the walker paginates.
pub trait CommentApi {
    fn top_comments_page(
        &self,
        lease: Lease,
        note_id: &str,
        cursor: &str,
        xsec_token: &str,
    ) -> impl std::future::Future<Output = ApiOutcome<CommentPage>> + Send;

    fn sub_comments_page(
        &self,
        lease: Lease,
        parent_id: &str,
        note_id: &str,
        cursor: &str,
        xsec_token: &str,
    ) -> impl std::future::Future<Output = ApiOutcome<CommentPage>> + Send;
}

/// Thin typed layer over the transport, one method per platform operation.
/// Stateless: any credential works with any endpoint, and no rotation
/// happens here.
#[derive(Clone)]
pub struct EndpointClient {
    transport: Transport,
}

impl EndpointClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn search_notes(
        &self,
        lease: Lease,
        query: &str,
        page: u32,
        search_id: &str,
        filters: &SearchFilters,
    ) -> ApiOutcome<SearchPage> {
        let body = json!({
            "keyword": query,
            "page": page,
            "page_size": 20,
            "search_id": search_id,
            "sort": filters.sort_wire(),
            "note_type": filters.note_type,
        });
        let outcome = self.transport.post(SEARCH_PATH, body, &lease.cookie_str).await;
        match outcome {
            ApiOutcome::Success(data) => parse_search_page(&data),
            other => other.map(|_| unreachable!("non-success carries no payload")),
        }
    }

    pub async fn note_info_raw(
        &self,
        lease: Lease,
        note_id: &str,
        xsec_token: &str,
    ) -> ApiOutcome<Value> {
        let body = json!({
            "source_note_id": note_id,
            "image_formats": IMAGE_FORMATS.split(',').collect::<Vec<_>>(),
            "extra": {"need_body_topic": "1"},
            "xsec_source": "pc_search",
            "xsec_token": xsec_token,
        });
        self.transport.post(FEED_PATH, body, &lease.cookie_str).await
    }
}

impl NoteApi for EndpointClient {
    async fn note_info(&self, lease: Lease, note_id: &str, xsec_token: &str) -> ApiOutcome<NoteInfo> {
        match self.note_info_raw(lease, note_id, xsec_token).await {
            ApiOutcome::Success(data) => parse_note_info(&data),
            other => other.map(|_| unreachable!("non-success carries no payload")),
        }
    }
}

impl CommentApi for EndpointClient {
    async fn top_comments_page(
        &self,
        lease: Lease,
        note_id: &str,
        cursor: &str,
        xsec_token: &str,
    ) -> ApiOutcome<CommentPage> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("note_id", note_id)
            .append_pair("cursor", cursor)
            .append_pair("top_comment_id", "")
            .append_pair("image_formats", IMAGE_FORMATS)
            .append_pair("xsec_token", xsec_token)
            .finish();
        let path = format!("{TOP_COMMENTS_PATH}?{query}");
        decode_comment_page(self.transport.get(&path, &lease.cookie_str).await)
    }

    async fn sub_comments_page(
        &self,
        lease: Lease,
        parent_id: &str,
        note_id: &str,
        cursor: &str,
        xsec_token: &str,
    ) -> ApiOutcome<CommentPage> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("note_id", note_id)
            .append_pair("root_comment_id", parent_id)
            .append_pair("num", &SUB_PAGE_SIZE.to_string())
            .append_pair("cursor", cursor)
            .append_pair("image_formats", IMAGE_FORMATS)
            .append_pair("top_comment_id", "")
            .append_pair("xsec_token", xsec_token)
            .finish();
        let path = format!("{SUB_COMMENTS_PATH}?{query}");
        decode_comment_page(self.transport.get(&path, &lease.cookie_str).await)
    }
}

fn decode_comment_page(outcome: ApiOutcome<Value>) -> ApiOutcome<CommentPage> {
    match outcome {
        ApiOutcome::Success(data) => {
            // A success payload without a comments field is how the platform
            // says "nothing here"; the walker decides whether that means an
            // expired signed token.
            if data.get("comments").is_none() {
                return ApiOutcome::EmptyData;
            }
            match serde_json::from_value::<CommentPage>(data) {
                Ok(page) => ApiOutcome::Success(page),
                Err(err) => ApiOutcome::Protocol {
                    reason: format!("comment page: {err}"),
                },
            }
        }
        other => other.map(|_| unreachable!("non-success carries no payload")),
    }
}

fn parse_note_info(data: &Value) -> ApiOutcome<NoteInfo> {
    let Some(item) = data
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    else {
        return ApiOutcome::Protocol {
            reason: "feed response has no items".to_string(),
        };
    };
    let card = item.get("note_card").unwrap_or(item);

    let note_id = str_field(card, "note_id")
        .or_else(|| str_field(item, "id"))
        .unwrap_or_default();
    if note_id.is_empty() {
        return ApiOutcome::Protocol {
            reason: "feed item has no note id".to_string(),
        };
    }

    let interact = card.get("interact_info").cloned().unwrap_or(Value::Null);
    let user = card.get("user").cloned().unwrap_or(Value::Null);

    ApiOutcome::Success(NoteInfo {
        note_id,
        url: String::new(),
        title: str_field(card, "display_title")
            .or_else(|| str_field(card, "title"))
            .unwrap_or_default(),
        desc: str_field(card, "desc").unwrap_or_default(),
        note_type: str_field(card, "type").unwrap_or_default(),
        author_id: str_field(&user, "user_id").unwrap_or_default(),
        author_name: str_field(&user, "nickname")
            .or_else(|| str_field(&user, "nick_name"))
            .unwrap_or_default(),
        liked_count: count_field(&interact, "liked_count"),
        collected_count: count_field(&interact, "collected_count"),
        comment_count: count_field(&interact, "comment_count"),
        share_count: count_field(&interact, "shared_count"),
        publish_time: card.get("time").and_then(Value::as_i64).unwrap_or(0),
        crawl_time: String::new(),
    })
}

fn parse_search_page(data: &Value) -> ApiOutcome<SearchPage> {
    let has_more = data.get("has_more").and_then(Value::as_bool).unwrap_or(false);
    let Some(items) = data.get("items").and_then(Value::as_array) else {
        return ApiOutcome::Success(SearchPage {
            hits: Vec::new(),
            has_more,
        });
    };

    let mut hits = Vec::new();
    for item in items {
        // Search interleaves ads and user cards; only note items count.
        if str_field(item, "model_type").as_deref() != Some("note") {
            continue;
        }
        let Some(note_id) = str_field(item, "id") else {
            continue;
        };
        let card = item.get("note_card").cloned().unwrap_or(Value::Null);
        let interact = card.get("interact_info").cloned().unwrap_or(Value::Null);
        hits.push(SearchHit {
            note_id,
            xsec_token: str_field(item, "xsec_token").unwrap_or_default(),
            title: str_field(&card, "display_title")
                .or_else(|| str_field(&card, "title"))
                .unwrap_or_default(),
            comment_count: count_field(&interact, "comment_count"),
        });
    }
    ApiOutcome::Success(SearchPage { hits, has_more })
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn count_field(v: &Value, key: &str) -> u64 {
    v.get(key).map(parse_count).unwrap_or(0)
}

/// Opaque per-search pagination token: timestamp plus random tail, base36.
pub fn generate_search_id() -> String {
    use rand::Rng;
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let tail: u32 = rand::thread_rng().gen();
    let mut n = (millis << 32) | tail as u128;
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}
