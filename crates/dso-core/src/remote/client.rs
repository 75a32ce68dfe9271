//! The upstream HTTP client.
//!
//! One shared connection pool per client, 60 second timeout, no retries,
//! mandatory certificate verification, and no transparent redirects (an
//! OAuth authorize redirect must be visible to map it onto 403).

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;

use dso_error::{ApiError, Result};

use crate::crs::Crs;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Correlation ids longer than this break some upstream suites.
const MAX_CORRELATION_ID: usize = 40;

/// The response from the remote system.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub content_crs: Option<Crs>,
    pub data: Value,
}

/// Caller headers relevant for forwarding.
#[derive(Debug, Clone, Default)]
pub struct RemoteRequestContext {
    pub client_ip: String,
    pub x_forwarded_for: Option<String>,
    pub x_correlation_id: Option<String>,
    pub x_unique_id: Option<String>,
    pub authorization: Option<String>,
}

/// Derive the correlation id to send upstream.
///
/// An inbound `X-Correlation-ID` is reused as-is. Otherwise one is derived
/// from `X-Unique-ID` (`[ip]:[port]_[bind_ip]:[bind_port]_[ts]_[ctr]:[pid]`)
/// by dropping the constant bind part: the first 14 characters plus
/// everything from character 28, capped at 40 characters.
#[must_use]
pub fn correlation_id(
    x_correlation_id: Option<&str>,
    x_unique_id: Option<&str>,
) -> Option<String> {
    if let Some(id) = x_correlation_id {
        if !id.is_empty() {
            return Some(id.chars().take(MAX_CORRELATION_ID).collect());
        }
    }
    let unique = x_unique_id?;
    if unique.is_empty() {
        return None;
    }
    let head: String = unique.chars().take(14).collect();
    let tail: String = unique.chars().skip(28).collect();
    Some(
        (head + &tail)
            .chars()
            .take(MAX_CORRELATION_ID)
            .collect(),
    )
}

/// Generic client for one remote table endpoint.
pub struct RemoteClient {
    endpoint_url: String,
    table_id: String,
    forward_auth: bool,
    accept: &'static str,
    client: reqwest::Client,
}

impl RemoteClient {
    /// Build a client for `endpoint_url` (may contain `{table_id}`).
    ///
    /// `forward_auth` passes the caller's Authorization header through and
    /// enables the authorize-redirect detection.
    pub fn new(endpoint_url: &str, table_id: &str, forward_auth: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ApiError::internal(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            endpoint_url: endpoint_url.to_string(),
            table_id: table_id.to_string(),
            forward_auth,
            accept: "application/json",
            client,
        })
    }

    /// Use the HAL-flavored Accept header (Haal-Centraal variants).
    #[must_use]
    pub fn with_hal_accept(mut self) -> Self {
        self.accept = "application/hal+json";
        self
    }

    /// Forward the request and map the response.
    pub async fn call(
        &self,
        ctx: &RemoteRequestContext,
        path: &str,
        query: &[(String, String)],
    ) -> Result<RemoteResponse> {
        let url = self.make_url(path);
        let host = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();

        let started = std::time::Instant::now();
        let response = self
            .client
            .get(&url)
            .query(query)
            .headers(self.headers(ctx))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tracing::error!(host = %host, error = %e, "proxy call failed, timeout from remote server");
                    ApiError::GatewayTimeout
                } else {
                    tracing::error!(host = %host, error = %e, "proxy call failed, error when connecting to server");
                    ApiError::ServiceUnavailable {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        tracing::info!(
            host = %host,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "proxy call"
        );

        if status == StatusCode::OK {
            let content_crs = response
                .headers()
                .get("Content-Crs")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Crs::from_header(v).ok());
            let data: Value = response
                .json()
                .await
                .map_err(|e| ApiError::BadGateway {
                    message: format!("Invalid JSON from remote: {e}"),
                    validation_errors: None,
                    raw_response: None,
                })?;
            return Ok(RemoteResponse { content_crs, data });
        }

        Err(self.http_error(status, response).await)
    }

    fn make_url(&self, path: &str) -> String {
        let mut url = self.endpoint_url.replace("{table_id}", &self.table_id);
        if !path.is_empty() {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(path.trim_start_matches('/'));
        }
        url
    }

    fn headers(&self, ctx: &RemoteRequestContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(self.accept),
        );

        // Append the caller to any forwarded chain.
        let forwarded = match &ctx.x_forwarded_for {
            Some(chain) if !chain.is_empty() => format!("{chain} {}", ctx.client_ip),
            _ => ctx.client_ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert("X-Forwarded-For", value);
        }

        if let Some(id) = correlation_id(
            ctx.x_correlation_id.as_deref(),
            ctx.x_unique_id.as_deref(),
        ) {
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert("X-Correlation-ID", value);
            }
        }

        if self.forward_auth {
            if let Some(auth) = &ctx.authorization {
                if let Ok(value) = HeaderValue::from_str(auth) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }

        headers
    }

    /// Translate a remote HTTP error to the proper local response.
    ///
    /// Some statuses become 502/503 to reflect that this API is calling
    /// another service as its backend.
    async fn http_error(&self, status: StatusCode, response: reqwest::Response) -> ApiError {
        // An IdP redirect means the forwarded token was not accepted.
        if self.forward_auth && status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if location.contains("/oauth/authorize") {
                return ApiError::access_denied("Invalid token");
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.unwrap_or_default();

        // HTML error bodies carry no usable detail.
        let detail_message = if content_type.starts_with("text/html") {
            None
        } else {
            Some(body.clone())
        };

        match status.as_u16() {
            400 => {
                if content_type.starts_with("application/problem+json") {
                    let detail: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                    ApiError::Remote {
                        status: 400,
                        title: "Malformed request.".to_string(),
                        code: "parse_error".to_string(),
                        detail,
                    }
                } else {
                    ApiError::BadGateway {
                        message: detail_message.unwrap_or_default(),
                        validation_errors: None,
                        raw_response: None,
                    }
                }
            }
            // 401 MUST carry WWW-Authenticate which we can't fabricate,
            // and RFC 7235 forbids changing one. Both collapse into 403.
            401 | 403 => ApiError::Remote {
                status: 403,
                title: "You do not have permission to perform this action.".to_string(),
                code: "permission_denied".to_string(),
                detail: Value::String(format!("{} from remote: {body}", status.as_u16())),
            },
            404 => {
                if content_type.starts_with("application/problem+json") {
                    let detail: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                    ApiError::Remote {
                        status: 404,
                        title: "Not found.".to_string(),
                        code: "not_found".to_string(),
                        detail,
                    }
                } else {
                    ApiError::not_found(detail_message.unwrap_or_default())
                }
            }
            other => {
                tracing::error!(
                    status = other,
                    "proxy call failed, unexpected status code from endpoint"
                );
                ApiError::BadGateway {
                    message: detail_message
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| {
                            format!("Unexpected HTTP {other} from internal endpoint")
                        }),
                    validation_errors: None,
                    raw_response: None,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_prefers_inbound() {
        assert_eq!(
            correlation_id(Some("my-id"), Some("ignored")).unwrap(),
            "my-id"
        );
    }

    #[test]
    fn test_correlation_id_from_unique_id() {
        // [ip]:[port]_[bind_ip]:[bind_port]_[timestamp]_[counter]:[pid]
        // First 14 chars plus everything from char 28 drops the bind part.
        let unique = "10.0.0.1:5431_192.168.1.1:80_1612345678_000F:12";
        let id = correlation_id(None, Some(unique)).unwrap();
        assert_eq!(id, "10.0.0.1:5431__1612345678_000F:12");
        assert!(id.len() <= 40);
    }

    #[test]
    fn test_correlation_id_is_capped_at_40() {
        let unique = "x".repeat(100);
        let id = correlation_id(None, Some(&unique)).unwrap();
        assert_eq!(id.len(), 40);
    }

    #[test]
    fn test_correlation_id_absent() {
        assert!(correlation_id(None, None).is_none());
        assert!(correlation_id(Some(""), None).is_none());
    }

    #[test]
    fn test_make_url_substitutes_table() {
        let client =
            RemoteClient::new("https://remote.test/api/{table_id}", "panden", false).unwrap();
        assert_eq!(client.make_url(""), "https://remote.test/api/panden");
        assert_eq!(
            client.make_url("0363100012345678"),
            "https://remote.test/api/panden/0363100012345678"
        );
    }

    #[test]
    fn test_forwarded_chain_appends_caller() {
        let client = RemoteClient::new("https://remote.test/api", "x", false).unwrap();
        let ctx = RemoteRequestContext {
            client_ip: "10.1.2.3".to_string(),
            x_forwarded_for: Some("198.51.100.7".to_string()),
            ..RemoteRequestContext::default()
        };
        let headers = client.headers(&ctx);
        assert_eq!(
            headers.get("X-Forwarded-For").unwrap(),
            "198.51.100.7 10.1.2.3"
        );
    }

    #[test]
    fn test_authorization_only_when_forwarding() {
        let ctx = RemoteRequestContext {
            client_ip: "10.1.2.3".to_string(),
            authorization: Some("Bearer token".to_string()),
            ..RemoteRequestContext::default()
        };

        let plain = RemoteClient::new("https://remote.test/api", "x", false).unwrap();
        assert!(plain.headers(&ctx).get("authorization").is_none());

        let forwarding = RemoteClient::new("https://remote.test/api", "x", true).unwrap();
        assert_eq!(
            forwarding.headers(&ctx).get("authorization").unwrap(),
            "Bearer token"
        );
    }
}
