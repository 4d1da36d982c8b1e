//! Per-provider request conventions.

use crate::pagination::Pagination;
use authbroker::credentials::BrowserSession;
use std::collections::BTreeMap;

/// Where API paths are rooted.
#[derive(Debug, Clone)]
pub enum ApiBase {
    /// `{session.base_url}{suffix}`, for providers whose host is resolved at
    /// capture time
    SessionBaseUrl(&'static str),
    Fixed(&'static str),
}

/// Where the client token sent with each request comes from.
#[derive(Debug, Clone)]
pub enum TokenValue {
    /// `client_token` of the stored session
    ClientToken,
    /// A cookie of the jar, optionally percent-decoded
    Cookie { name: &'static str, url_decode: bool },
}

#[derive(Debug, Clone)]
pub struct TokenHeader {
    pub name: &'static str,
    /// Header value with `{token}` substituted
    pub template: &'static str,
    pub value: TokenValue,
}

/// Cookie whose rotation also rotates the stored client token.
#[derive(Debug, Clone)]
pub struct TokenCookie {
    pub name: &'static str,
    pub strip_quotes: bool,
}

/// Body-level failure reporting (HTTP 200 with an error payload).
#[derive(Debug, Clone)]
pub enum PayloadCheck {
    None,
    /// `{"ok": false, "error": "..."}`
    OkField {
        auth_errors: &'static [&'static str],
    },
}

/// Everything a session client needs to know about one provider.
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub provider: &'static str,
    pub api_base: ApiBase,
    pub token_header: Option<TokenHeader>,
    pub token_cookie: Option<TokenCookie>,
    pub fixed_headers: Vec<(&'static str, &'static str)>,
    /// Statuses meaning the session is no longer accepted
    pub auth_statuses: &'static [u16],
    pub payload_check: PayloadCheck,
    /// Default pagination convention for list endpoints
    pub pagination: Pagination,
    /// Emulate Chrome's TLS fingerprint; the provider blocks plain clients
    pub impersonate: bool,
}

impl ClientProfile {
    /// Course platform REST API. The CSRF token travels in the
    /// `_csrf_token` cookie and must be echoed back decoded.
    pub fn canvas() -> Self {
        Self {
            provider: "canvas",
            api_base: ApiBase::SessionBaseUrl("/api/v1"),
            token_header: Some(TokenHeader {
                name: "X-CSRF-Token",
                template: "{token}",
                value: TokenValue::Cookie {
                    name: "_csrf_token",
                    url_decode: true,
                },
            }),
            token_cookie: None,
            fixed_headers: vec![
                ("X-Requested-With", "XMLHttpRequest"),
                ("Accept", "application/json"),
            ],
            auth_statuses: &[401, 403],
            payload_check: PayloadCheck::None,
            pagination: Pagination::LinkHeader,
            impersonate: false,
        }
    }

    /// Professional network internal API. Redirects mean the session was
    /// bounced to the login page.
    pub fn linkedin() -> Self {
        Self {
            provider: "linkedin",
            api_base: ApiBase::SessionBaseUrl("/voyager/api"),
            token_header: Some(TokenHeader {
                name: "Csrf-Token",
                template: "{token}",
                value: TokenValue::ClientToken,
            }),
            token_cookie: Some(TokenCookie {
                name: "JSESSIONID",
                strip_quotes: true,
            }),
            fixed_headers: vec![
                ("X-Restli-Protocol-Version", "2.0.0"),
                ("X-Li-Lang", "en_US"),
                ("Accept", "application/vnd.linkedin.normalized+json+2.1"),
                ("Referer", "https://www.linkedin.com/feed/"),
                ("Origin", "https://www.linkedin.com"),
                ("Sec-Fetch-Dest", "empty"),
                ("Sec-Fetch-Mode", "cors"),
                ("Sec-Fetch-Site", "same-origin"),
            ],
            auth_statuses: &[401, 403, 302],
            payload_check: PayloadCheck::None,
            pagination: Pagination::OffsetTotal {
                start_param: "start",
                count_param: "count",
                count: 20,
                total_fields: &["/data/paging/total", "/paging/total"],
                items_field: "/included",
            },
            impersonate: true,
        }
    }

    /// Photo network private API.
    pub fn instagram() -> Self {
        Self {
            provider: "instagram",
            api_base: ApiBase::Fixed("https://i.instagram.com/api/v1"),
            token_header: Some(TokenHeader {
                name: "X-CSRFToken",
                template: "{token}",
                value: TokenValue::ClientToken,
            }),
            token_cookie: Some(TokenCookie {
                name: "csrftoken",
                strip_quotes: false,
            }),
            fixed_headers: vec![
                ("X-IG-App-ID", "936619743392459"),
                ("X-Requested-With", "XMLHttpRequest"),
                ("X-IG-WWW-Claim", "0"),
                ("Accept", "*/*"),
                ("Referer", "https://www.instagram.com/"),
                ("Origin", "https://www.instagram.com"),
                ("Sec-Fetch-Dest", "empty"),
                ("Sec-Fetch-Mode", "cors"),
                ("Sec-Fetch-Site", "same-site"),
            ],
            auth_statuses: &[401, 403],
            payload_check: PayloadCheck::None,
            pagination: Pagination::Cursor {
                cursor_param: "max_id",
                cursor_field: "/next_max_id",
                more_field: Some("/more_available"),
                items_field: "/items",
            },
            impersonate: true,
        }
    }

    /// Chat workspace web API, authenticated with the `xoxc-` client token
    /// plus the `d` cookie. Every method is a form POST.
    pub fn slack_web() -> Self {
        Self {
            provider: "slack_web",
            api_base: ApiBase::Fixed("https://slack.com/api"),
            token_header: Some(TokenHeader {
                name: "Authorization",
                template: "Bearer {token}",
                value: TokenValue::ClientToken,
            }),
            token_cookie: None,
            fixed_headers: vec![("Accept", "application/json")],
            auth_statuses: &[401, 403],
            payload_check: PayloadCheck::OkField {
                auth_errors: &["not_authed", "invalid_auth", "token_revoked", "token_expired"],
            },
            pagination: Pagination::Cursor {
                cursor_param: "cursor",
                cursor_field: "/response_metadata/next_cursor",
                more_field: None,
                items_field: "/members",
            },
            impersonate: false,
        }
    }

    /// Built-in profile by provider name.
    pub fn by_name(provider: &str) -> Option<Self> {
        match provider {
            "canvas" => Some(Self::canvas()),
            "linkedin" => Some(Self::linkedin()),
            "instagram" => Some(Self::instagram()),
            "slack_web" => Some(Self::slack_web()),
            _ => None,
        }
    }

    /// Token value for the token header, if the session carries one.
    pub fn token(&self, session: &BrowserSession) -> Option<String> {
        let header = self.token_header.as_ref()?;
        let token = match &header.value {
            TokenValue::ClientToken => session.client_token.clone(),
            TokenValue::Cookie { name, url_decode } => {
                let raw = session.cookie_jar.get(*name)?;
                if *url_decode {
                    urlencoding::decode(raw)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| raw.clone())
                } else {
                    raw.clone()
                }
            }
        };
        (!token.is_empty()).then_some(token)
    }

    /// Client token implied by the jar after a rotation, if it changed.
    pub fn rotated_token(&self, jar: &BTreeMap<String, String>, current: &str) -> Option<String> {
        let cookie = self.token_cookie.as_ref()?;
        let raw = jar.get(cookie.name)?;
        let token = if cookie.strip_quotes {
            raw.trim_matches('"')
        } else {
            raw.as_str()
        };
        (!token.is_empty() && token != current).then(|| token.to_string())
    }
}
