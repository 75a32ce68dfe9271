//! Request extraction helpers.
//!
//! Token validation is an external middleware contract: the fronting proxy
//! verifies the OAuth token and passes the resulting scope set in an
//! `X-Auth-Scopes` header. Here that becomes an explicit value instead of
//! anything attached to ambient request state.

use axum::http::HeaderMap;

use dso_core::crs::Crs;
use dso_error::{ApiError, Result};

/// The verified scopes granted to this request.
#[must_use]
pub fn granted_scopes(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("X-Auth-Scopes")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split_whitespace()
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the `Accept-Crs` header.
///
/// # Errors
///
/// `NotAcceptable` for malformed or unsupported values;
/// `PreconditionFailed` when `required` and the header is absent.
pub fn accept_crs(headers: &HeaderMap, required: bool) -> Result<Option<Crs>> {
    match headers.get("Accept-Crs") {
        None => {
            if required {
                Err(ApiError::PreconditionFailed {
                    message: "The HTTP Accept-Crs header is required".to_string(),
                })
            } else {
                Ok(None)
            }
        }
        Some(value) => {
            let raw = value.to_str().map_err(|_| ApiError::NotAcceptable {
                message: "Chosen CRS is invalid".to_string(),
            })?;
            Crs::from_header(raw).map(Some)
        }
    }
}

/// Decode a raw query string into pairs, preserving order and repeats.
#[must_use]
pub fn parse_query_string(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                urlencoding::decode(key).map_or_else(|_| key.to_string(), |c| c.into_owned()),
                urlencoding::decode(&value.replace('+', " "))
                    .map_or_else(|_| value.to_string(), |c| c.into_owned()),
            )
        })
        .collect()
}

/// The Accept header value, if any.
#[must_use]
pub fn accept_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_granted_scopes() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Scopes", HeaderValue::from_static("BRK/RS FP/MDW"));
        assert_eq!(granted_scopes(&headers), vec!["BRK/RS", "FP/MDW"]);

        assert!(granted_scopes(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_accept_crs() {
        let mut headers = HeaderMap::new();
        headers.insert("Accept-Crs", HeaderValue::from_static("EPSG:28992"));
        assert_eq!(accept_crs(&headers, false).unwrap(), Some(Crs::RdNew));

        let empty = HeaderMap::new();
        assert_eq!(accept_crs(&empty, false).unwrap(), None);
        assert!(matches!(
            accept_crs(&empty, true).unwrap_err(),
            ApiError::PreconditionFailed { .. }
        ));

        let mut headers = HeaderMap::new();
        headers.insert("Accept-Crs", HeaderValue::from_static("EPSG:9999"));
        assert!(matches!(
            accept_crs(&headers, false).unwrap_err(),
            ApiError::NotAcceptable { .. }
        ));
    }

    #[test]
    fn test_parse_query_string() {
        let pairs = parse_query_string("a=1&b=two%20words&c[in]=1,2&flag");
        assert_eq!(pairs[0], ("a".to_string(), "1".to_string()));
        assert_eq!(pairs[1], ("b".to_string(), "two words".to_string()));
        assert_eq!(pairs[2], ("c[in]".to_string(), "1,2".to_string()));
        assert_eq!(pairs[3], ("flag".to_string(), String::new()));
    }

    #[test]
    fn test_parse_query_string_repeats() {
        let pairs = parse_query_string("x[not]=a&x[not]=b");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "x[not]");
        assert_eq!(pairs[1].1, "b");
    }
}
