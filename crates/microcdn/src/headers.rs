//! Mapping between HTTP headers and object metadata

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, TimeZone, Utc};
use script_storage::metadata::{EXPIRES, PASSWORD};
use script_storage::{is_map_id, Metadata};
use tracing::debug;

pub const FILE_ID: &str = "x-file-id";
pub const PASSWORD_HEADER: &str = "x-password";

/// Request headers stored as metadata, verbatim
const FORWARDED_HEADERS: [&str; 3] = [
    "X-Access-Control-Allow-Origin",
    "X-Cache-Control",
    "X-Expires",
];

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Metadata an upload request carries in its headers
pub fn collect_metadata(headers: &HeaderMap) -> Metadata {
    let mut fields: Vec<(String, String)> = FORWARDED_HEADERS
        .iter()
        .filter_map(|name| header_str(headers, name).map(|v| (name.to_string(), v.to_string())))
        .collect();
    if let Some(password) = header_str(headers, PASSWORD_HEADER) {
        fields.push((PASSWORD.to_string(), password.to_string()));
    }
    Metadata::from_caller(fields)
}

/// Password offered by the caller for a protected object
pub fn candidate_password(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, PASSWORD_HEADER)
}

/// Whether the caller accepts brotli bodies
pub fn accepts_brotli(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|coding| coding.split(';').next())
        .any(|coding| coding.trim().eq_ignore_ascii_case("br"))
}

/// `If-Modified-Since` in epoch milliseconds.
///
/// HTTP dates have whole-second precision, so the value is taken at the end
/// of its second; a client echoing back `Last-Modified` then counts as fresh.
pub fn if_modified_since(headers: &HeaderMap) -> Option<i64> {
    let value = header_str(headers, header::IF_MODIFIED_SINCE.as_str())?;
    match parse_date(value) {
        Some(date) => Some(date.timestamp() * 1000 + 999),
        None => {
            debug!(value, "Ignoring unparseable If-Modified-Since");
            None
        }
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Format epoch milliseconds as an HTTP date
pub fn http_date(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|date| date.format(HTTP_DATE_FORMAT).to_string())
}

/// Dates become HTTP dates; anything unparseable passes through unchanged
fn normalize_expires(value: &str) -> String {
    parse_date(value)
        .map(|date| date.format(HTTP_DATE_FORMAT).to_string())
        .unwrap_or_else(|| value.to_string())
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => debug!(name, "Skipping metadata that is not a valid header"),
    }
}

/// Response headers for serving `id` with `metadata`
pub fn response_headers(id: &str, metadata: Option<&Metadata>, compressed: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(metadata) = metadata {
        for (name, value) in metadata.header_fields() {
            insert(&mut headers, name, value);
        }
        if let Some(expires) = metadata.expires() {
            insert(&mut headers, EXPIRES, expires);
        }
        if let Some(last_changed) = metadata.last_changed().and_then(http_date) {
            insert(&mut headers, header::LAST_MODIFIED.as_str(), &last_changed);
        }
    }

    if let Some(expires) = headers
        .get(header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .map(normalize_expires)
    {
        insert(&mut headers, header::EXPIRES.as_str(), &expires);
    }

    headers
        .entry(header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("public"));
    headers
        .entry(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .or_insert(HeaderValue::from_static("*"));

    insert(&mut headers, FILE_ID, id);
    let content_type = if is_map_id(id) {
        "application/json"
    } else {
        "text/javascript"
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if compressed {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("br"));
    }
    headers
}
