//! The three pagination conventions, each bounded by a page cap.
//!
//! - [`Pagination::Cursor`]: feed `next_cursor` back until it is empty or
//!   the "more" flag is false.
//! - [`Pagination::OffsetTotal`]: advance `start += count` until
//!   `start >= total`.
//! - [`Pagination::LinkHeader`]: follow the `rel="next"` URL verbatim.

use crate::client::{ApiRequest, SessionClient};
use authbroker::BrokerError;
use serde_json::Value;
use tracing::debug;

/// Pagination convention of a list endpoint. Fields are JSON pointers.
#[derive(Debug, Clone)]
pub enum Pagination {
    Cursor {
        cursor_param: &'static str,
        cursor_field: &'static str,
        more_field: Option<&'static str>,
        items_field: &'static str,
    },
    OffsetTotal {
        start_param: &'static str,
        count_param: &'static str,
        count: u32,
        /// Tried in order; the first number found wins
        total_fields: &'static [&'static str],
        items_field: &'static str,
    },
    LinkHeader,
}

impl Pagination {
    /// Same convention reading items from another field.
    pub fn with_items_field(self, field: &'static str) -> Self {
        match self {
            Pagination::Cursor {
                cursor_param,
                cursor_field,
                more_field,
                ..
            } => Pagination::Cursor {
                cursor_param,
                cursor_field,
                more_field,
                items_field: field,
            },
            Pagination::OffsetTotal {
                start_param,
                count_param,
                count,
                total_fields,
                ..
            } => Pagination::OffsetTotal {
                start_param,
                count_param,
                count,
                total_fields,
                items_field: field,
            },
            Pagination::LinkHeader => Pagination::LinkHeader,
        }
    }
}

/// Items gathered across pages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paged {
    pub items: Vec<Value>,
    pub pages: u32,
    /// Cursor to resume from when the page cap stopped the loop
    pub next_cursor: Option<String>,
}

/// Extracts the `rel="next"` URL from a `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find(|part| part.contains("rel=\"next\""))
        .and_then(|part| {
            let start = part.find('<')? + 1;
            let end = part[start..].find('>')? + start;
            Some(part[start..end].to_string())
        })
}

fn items_at(body: &Value, pointer: &str) -> Vec<Value> {
    match body.pointer(pointer) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn cursor_at(body: &Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Runs `request` page by page, at most `max_pages` requests.
pub async fn fetch_all(
    client: &SessionClient,
    mut request: ApiRequest,
    pagination: &Pagination,
    account: &str,
    max_pages: u32,
) -> Result<Paged, BrokerError> {
    let mut paged = Paged::default();

    match pagination {
        Pagination::Cursor {
            cursor_param,
            cursor_field,
            more_field,
            items_field,
        } => {
            for _ in 0..max_pages {
                let response = client.send(&request, account).await?;
                paged.pages += 1;
                paged.items.extend(items_at(&response.body, items_field));

                let more = more_field
                    .map(|field| response.body.pointer(field).and_then(Value::as_bool) == Some(true))
                    .unwrap_or(true);
                paged.next_cursor = cursor_at(&response.body, cursor_field).filter(|_| more);
                match &paged.next_cursor {
                    Some(cursor) => request.set_param(cursor_param, cursor),
                    None => break,
                }
            }
        }
        Pagination::OffsetTotal {
            start_param,
            count_param,
            count,
            total_fields,
            items_field,
        } => {
            let mut start = request
                .param(start_param)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            request.set_param(count_param, &count.to_string());

            for _ in 0..max_pages {
                request.set_param(start_param, &start.to_string());
                let response = client.send(&request, account).await?;
                paged.pages += 1;
                paged.items.extend(items_at(&response.body, items_field));

                let total = total_fields
                    .iter()
                    .find_map(|field| response.body.pointer(field).and_then(Value::as_u64))
                    .unwrap_or(0);
                start += u64::from(*count);
                if start >= total {
                    break;
                }
            }
        }
        Pagination::LinkHeader => {
            for _ in 0..max_pages {
                let response = client.send(&request, account).await?;
                paged.pages += 1;
                match response.body {
                    Value::Array(items) => paged.items.extend(items),
                    other => paged.items.push(other),
                }
                match response.next_link {
                    // Query parameters are already encoded in the link
                    Some(next) => request = request.follow(next),
                    None => break,
                }
            }
        }
    }

    debug!(
        provider = client.provider(),
        account = %account,
        pages = paged.pages,
        items = paged.items.len(),
        "Pagination finished"
    );
    Ok(paged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://canvas.example.edu/api/v1/courses?page=1&per_page=100>; rel="current",<https://canvas.example.edu/api/v1/courses?page=2&per_page=100>; rel="next",<https://canvas.example.edu/api/v1/courses?page=1&per_page=100>; rel="first""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://canvas.example.edu/api/v1/courses?page=2&per_page=100")
        );
        assert_eq!(
            parse_next_link(r#"<https://x/a?page=3>; rel="last""#),
            None
        );
    }

    #[test]
    fn test_cursor_at() {
        let body = serde_json::json!({
            "response_metadata": {"next_cursor": ""},
            "next_max_id": 3141
        });
        assert_eq!(cursor_at(&body, "/response_metadata/next_cursor"), None);
        assert_eq!(cursor_at(&body, "/next_max_id").as_deref(), Some("3141"));
        assert_eq!(cursor_at(&body, "/missing"), None);
    }
}
