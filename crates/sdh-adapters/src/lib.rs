//! Service desk API contract, response interpretation and HTML text extraction.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use scraper::node::Node;
use scraper::{ElementRef, Html};
use sdh_core::{TicketId, TicketRecord};
use sdh_storage::{FetchError, HttpClientConfig, HttpFetcher};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sdh-adapters";

pub const STATUS_SUCCESS: i64 = 2000;
pub const STATUS_INVALID_SESSION: i64 = 4000;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

const LIST_PATH: &str = "/api/v3/requests";
const SESSION_COOKIE: &str = "SDPSESSIONID";

/// One window of the ticket list, sorted ascending by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub start_index: u64,
    pub row_count: u32,
}

#[derive(Serialize)]
struct ListInput<'a> {
    list_info: ListInfo<'a>,
}

#[derive(Serialize)]
struct ListInfo<'a> {
    row_count: String,
    start_index: u64,
    get_total_count: &'a str,
    sort_field: &'a str,
    sort_order: &'a str,
    fields_required: [&'a str; 1],
}

impl PageRequest {
    pub fn new(start_index: u64, row_count: u32) -> Self {
        Self {
            start_index,
            row_count,
        }
    }

    /// Value of the `input_data` query parameter.
    pub fn input_data(&self) -> Result<String, ApiError> {
        let input = ListInput {
            list_info: ListInfo {
                row_count: self.row_count.to_string(),
                start_index: self.start_index,
                get_total_count: "true",
                sort_field: "id",
                sort_order: "asc",
                fields_required: ["id"],
            },
        };
        serde_json::to_string(&input).map_err(ApiError::Encode)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("encoding list request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Request/response boundary to the ticket service. Implementations return
/// the decoded JSON envelope untouched; interpretation lives in
/// [`interpret_list_response`] and [`interpret_detail_response`].
#[async_trait]
pub trait TicketApi: Send + Sync {
    async fn list_tickets(&self, page: &PageRequest) -> Result<JsonValue, ApiError>;

    async fn ticket_detail(&self, id: &TicketId) -> Result<JsonValue, ApiError>;
}

/// ServiceDesk Plus v3 REST client authenticated by a session cookie.
pub struct ServiceDeskClient {
    base_url: String,
    session: SecretString,
    http: HttpFetcher,
}

impl std::fmt::Debug for ServiceDeskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDeskClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ServiceDeskClient {
    pub fn new(base_url: impl Into<String>, session: SecretString, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            http,
        }
    }

    pub fn with_http_config(
        base_url: impl Into<String>,
        session: SecretString,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config).context("building service desk http client")?;
        Ok(Self::new(base_url, session, http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_headers(&self) -> Result<HeaderMap, ApiError> {
        let cookie = format!("{SESSION_COOKIE}={};", self.session.expose_secret());
        let mut value = HeaderValue::from_str(&cookie).map_err(|_| {
            ApiError::Message("session token contains characters not allowed in a header".into())
        })?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, value);
        Ok(headers)
    }
}

#[async_trait]
impl TicketApi for ServiceDeskClient {
    async fn list_tickets(&self, page: &PageRequest) -> Result<JsonValue, ApiError> {
        let url = format!("{}{LIST_PATH}", self.base_url);
        let headers = self.session_headers()?;
        let input_data = page.input_data()?;
        let fetched = self
            .http
            .get_json(&url, &[("input_data", input_data)], &headers)
            .await?;
        debug!(start_index = page.start_index, status = %fetched.status, "fetched ticket list page");
        Ok(fetched.body)
    }

    async fn ticket_detail(&self, id: &TicketId) -> Result<JsonValue, ApiError> {
        let url = format!("{}{LIST_PATH}/{id}/request_detail", self.base_url);
        let headers = self.session_headers()?;
        let fetched = self.http.get_json(&url, &[], &headers).await?;
        Ok(fetched.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EnvelopeError(pub String);

impl EnvelopeError {
    fn missing(path: &str) -> Self {
        Self(format!("response is missing `{path}`"))
    }

    fn wrong_type(path: &str, expected: &str) -> Self {
        Self(format!("`{path}` is not {expected}"))
    }
}

/// What a ticket list page says, once the envelope has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    Page {
        ticket_ids: Vec<TicketId>,
        has_more_rows: bool,
    },
    InvalidSession,
    UnexpectedStatus(i64),
}

/// Status code of an envelope. `response_status` arrives either as an object
/// or as a list whose first element is that object.
pub fn response_status_code(body: &JsonValue) -> Result<i64, EnvelopeError> {
    let status = body
        .get("response_status")
        .ok_or_else(|| EnvelopeError::missing("response_status"))?;
    let status = match status {
        JsonValue::Array(items) => items
            .first()
            .ok_or_else(|| EnvelopeError("`response_status` is an empty list".into()))?,
        other => other,
    };
    if !status.is_object() {
        return Err(EnvelopeError::wrong_type("response_status", "an object"));
    }
    let code = status
        .get("status_code")
        .ok_or_else(|| EnvelopeError::missing("response_status.status_code"))?;
    code.as_i64()
        .or_else(|| code.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| EnvelopeError::wrong_type("response_status.status_code", "an integer"))
}

pub fn interpret_list_response(body: &JsonValue) -> Result<ListOutcome, EnvelopeError> {
    match response_status_code(body)? {
        STATUS_SUCCESS => {}
        STATUS_INVALID_SESSION => return Ok(ListOutcome::InvalidSession),
        other => return Ok(ListOutcome::UnexpectedStatus(other)),
    }

    let requests = body
        .get("requests")
        .ok_or_else(|| EnvelopeError::missing("requests"))?
        .as_array()
        .ok_or_else(|| EnvelopeError::wrong_type("requests", "a list"))?;

    let ticket_ids = requests
        .iter()
        .enumerate()
        .map(|(idx, ticket)| {
            let raw = ticket
                .get("id")
                .ok_or_else(|| EnvelopeError::missing(&format!("requests[{idx}].id")))?;
            TicketId::from_json(raw)
                .ok_or_else(|| EnvelopeError::wrong_type(&format!("requests[{idx}].id"), "an id"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let has_more_rows = body
        .get("list_info")
        .ok_or_else(|| EnvelopeError::missing("list_info"))?
        .get("has_more_rows")
        .ok_or_else(|| EnvelopeError::missing("list_info.has_more_rows"))?
        .as_bool()
        .ok_or_else(|| EnvelopeError::wrong_type("list_info.has_more_rows", "a boolean"))?;

    Ok(ListOutcome::Page {
        ticket_ids,
        has_more_rows,
    })
}

/// HTML fields of a ticket that carries a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTicket {
    pub description_html: String,
    pub resolution_html: String,
}

impl ResolvedTicket {
    pub fn to_record(&self) -> TicketRecord {
        TicketRecord::new(
            extract_text(&self.description_html),
            extract_text(&self.resolution_html),
        )
    }
}

/// Pull the description and resolution out of a detail envelope.
///
/// `Ok(None)` means the ticket has no resolution content yet.
pub fn interpret_detail_response(body: &JsonValue) -> Result<Option<ResolvedTicket>, EnvelopeError> {
    let request = body
        .get("request_detail")
        .ok_or_else(|| EnvelopeError::missing("request_detail"))?
        .as_array()
        .ok_or_else(|| EnvelopeError::wrong_type("request_detail", "a list"))?
        .first()
        .ok_or_else(|| EnvelopeError("`request_detail` is an empty list".into()))?
        .get("request")
        .ok_or_else(|| EnvelopeError::missing("request_detail[0].request"))?;

    let content = request
        .get("resolution")
        .filter(|r| !r.is_null())
        .and_then(|r| r.get("content"))
        .unwrap_or(&JsonValue::Null);
    let resolution_html = match content {
        JsonValue::Null => return Ok(None),
        JsonValue::String(s) if s.trim().is_empty() => return Ok(None),
        JsonValue::String(s) => s.clone(),
        _ => {
            return Err(EnvelopeError::wrong_type(
                "request.resolution.content",
                "a string",
            ))
        }
    };

    let description_html = match request.get("description") {
        None => return Err(EnvelopeError::missing("request.description")),
        Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(_) => return Err(EnvelopeError::wrong_type("request.description", "a string")),
    };

    Ok(Some(ResolvedTicket {
        description_html,
        resolution_html,
    }))
}

/// Elements whose start and end separate words.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer",
    "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section",
    "table", "td", "th", "tr", "ul",
];

/// Convert an HTML fragment to plain text.
///
/// Entities are decoded and tags dropped. Text that was itself escaped markup
/// (`&lt;p&gt;`) is parsed a second time so the inner tags go too. Block
/// elements and `<br>` break words; inline markup does not, so
/// `re<b>boot</b>ed` stays one word. Whitespace is collapsed to single spaces.
pub fn extract_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    collect_text(fragment.root_element(), &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) if text.contains('<') => {
                let inner = Html::parse_fragment(text);
                out.push(' ');
                collect_text(inner.root_element(), out);
                out.push(' ');
            }
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    let block = BLOCK_ELEMENTS.contains(&child_element.value().name());
                    if block {
                        out.push(' ');
                    }
                    collect_text(child_element, out);
                    if block {
                        out.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    #[test]
    fn page_request_encodes_list_info() {
        let encoded = PageRequest::new(300, 100).input_data().unwrap();
        let value: JsonValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "list_info": {
                    "row_count": "100",
                    "start_index": 300,
                    "get_total_count": "true",
                    "sort_field": "id",
                    "sort_order": "asc",
                    "fields_required": ["id"],
                }
            })
        );
    }

    #[test]
    fn status_accepts_object_and_list_shapes() {
        let object = json!({"response_status": {"status_code": 2000}});
        let list = json!({"response_status": [{"status_code": 4000}]});
        assert_eq!(response_status_code(&object), Ok(2000));
        assert_eq!(response_status_code(&list), Ok(4000));
        assert!(response_status_code(&json!({"response_status": []})).is_err());
        assert!(response_status_code(&json!({"response_status": "ok"})).is_err());
        assert!(response_status_code(&json!({})).is_err());
    }

    #[test]
    fn success_page_yields_ids_and_more_rows_flag() {
        let body = json!({
            "response_status": [{"status_code": 2000, "status": "success"}],
            "requests": [{"id": 5}, {"id": "7"}],
            "list_info": {"has_more_rows": true, "row_count": 2}
        });
        assert_eq!(
            interpret_list_response(&body),
            Ok(ListOutcome::Page {
                ticket_ids: vec![TicketId::from(5u64), TicketId::from(7u64)],
                has_more_rows: true,
            })
        );
    }

    #[test]
    fn invalid_session_does_not_need_page_fields() {
        let body = json!({"response_status": {"status_code": 4000, "status": "failed"}});
        assert_eq!(interpret_list_response(&body), Ok(ListOutcome::InvalidSession));
    }

    #[test]
    fn unknown_status_is_reported() {
        let body = json!({"response_status": {"status_code": 4002}});
        assert_eq!(
            interpret_list_response(&body),
            Ok(ListOutcome::UnexpectedStatus(4002))
        );
    }

    #[test]
    fn missing_list_info_is_malformed() {
        let body = json!({
            "response_status": {"status_code": 2000},
            "requests": [{"id": 1}]
        });
        let err = interpret_list_response(&body).unwrap_err();
        assert!(err.0.contains("list_info"), "{err}");
    }

    #[test]
    fn ticket_without_id_is_malformed() {
        let body = json!({
            "response_status": {"status_code": 2000},
            "requests": [{"id": 1}, {"subject": "no id"}],
            "list_info": {"has_more_rows": false}
        });
        let err = interpret_list_response(&body).unwrap_err();
        assert!(err.0.contains("requests[1].id"), "{err}");
    }

    #[test]
    fn detail_without_resolution_is_unresolved() {
        for request in [
            json!({"description": "<p>x</p>"}),
            json!({"description": "<p>x</p>", "resolution": null}),
            json!({"description": "<p>x</p>", "resolution": {"content": null}}),
            json!({"description": "<p>x</p>", "resolution": {"content": "  "}}),
        ] {
            let body = json!({"request_detail": [{"request": request}]});
            assert_eq!(interpret_detail_response(&body), Ok(None));
        }
    }

    #[test]
    fn detail_with_resolution_extracts_both_fields() {
        let body = json!({
            "request_detail": [{
                "request": {
                    "description": "<div>Outlook &amp; Teams crash</div>",
                    "resolution": {"content": "&lt;p&gt;Cleared the &lt;b&gt;cache&lt;/b&gt;&lt;/p&gt;"}
                }
            }]
        });
        let resolved = interpret_detail_response(&body).unwrap().unwrap();
        assert_eq!(
            resolved.to_record(),
            TicketRecord::new("Outlook & Teams crash", "Cleared the cache")
        );
    }

    #[test]
    fn detail_with_broken_envelope_is_an_error() {
        assert!(interpret_detail_response(&json!({"request_detail": []})).is_err());
        assert!(interpret_detail_response(&json!({"error": "nope"})).is_err());
        let no_description = json!({"request_detail": [{"request": {"resolution": {"content": "done"}}}]});
        assert!(interpret_detail_response(&no_description).is_err());
    }

    #[test]
    fn extract_text_strips_markup_and_collapses_whitespace() {
        assert_eq!(
            extract_text("<p>Hello,\n   <b>world</b></p><p>again&nbsp;here</p>"),
            "Hello, world again here"
        );
        assert_eq!(extract_text("plain text"), "plain text");
        assert_eq!(extract_text("<br/><div>  </div>"), "");
        assert_eq!(extract_text("2 &lt; 3"), "2 < 3");
    }

    #[test]
    fn extract_text_keeps_inline_markup_inside_words() {
        assert_eq!(extract_text("re<b>boot</b>ed the <i>AP</i>"), "rebooted the AP");
        assert_eq!(extract_text("line one<br>line two"), "line one line two");
        assert_eq!(extract_text("<ul><li>a</li><li>b</li></ul>"), "a b");
        assert_eq!(
            extract_text("&lt;p&gt;re&lt;b&gt;set&lt;/b&gt;&lt;/p&gt;&lt;p&gt;done&lt;/p&gt;"),
            "reset done"
        );
    }

    async fn list_handler(
        headers: AxumHeaders,
        Query(params): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<JsonValue>) {
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if cookie != "SDPSESSIONID=abc123;" {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"response_status": [{"status_code": 4000}]})),
            );
        }
        let input: JsonValue = serde_json::from_str(&params["input_data"]).unwrap();
        let start = input["list_info"]["start_index"].as_u64().unwrap();
        (
            StatusCode::OK,
            Json(json!({
                "response_status": [{"status_code": 2000}],
                "requests": [{"id": start + 1}],
                "list_info": {"has_more_rows": false}
            })),
        )
    }

    async fn detail_handler(Path(id): Path<String>) -> Json<JsonValue> {
        Json(json!({
            "request_detail": [{
                "request": {
                    "id": id,
                    "description": "<p>desc</p>",
                    "resolution": {"content": "<p>fixed</p>"}
                }
            }]
        }))
    }

    async fn spawn_service_desk() -> String {
        let app = Router::new()
            .route("/api/v3/requests", get(list_handler))
            .route("/api/v3/requests/{id}/request_detail", get(detail_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn test_http_config() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        }
    }

    #[tokio::test]
    async fn client_sends_cookie_and_input_data() {
        let base = spawn_service_desk().await;
        let client = ServiceDeskClient::with_http_config(
            base,
            SecretString::from("abc123".to_string()),
            test_http_config(),
        )
        .unwrap();

        let body = client.list_tickets(&PageRequest::new(200, 100)).await.unwrap();
        assert_eq!(
            interpret_list_response(&body),
            Ok(ListOutcome::Page {
                ticket_ids: vec![TicketId::from(201u64)],
                has_more_rows: false,
            })
        );

        let detail = client.ticket_detail(&TicketId::from(201u64)).await.unwrap();
        assert_eq!(detail["request_detail"][0]["request"]["id"], "201");
    }

    #[tokio::test]
    async fn bad_session_surfaces_in_envelope() {
        let base = spawn_service_desk().await;
        let client = ServiceDeskClient::with_http_config(
            base,
            SecretString::from("expired".to_string()),
            test_http_config(),
        )
        .unwrap();

        let body = client.list_tickets(&PageRequest::new(0, 100)).await.unwrap();
        assert_eq!(interpret_list_response(&body), Ok(ListOutcome::InvalidSession));
    }

    #[test]
    fn debug_output_hides_session() {
        let client = ServiceDeskClient::with_http_config(
            "https://desk.example.com",
            SecretString::from("top-secret".to_string()),
            test_http_config(),
        )
        .unwrap();
        let rendered = format!("{client:?}");
        assert!(rendered.contains("desk.example.com"));
        assert!(!rendered.contains("top-secret"));
    }
}
