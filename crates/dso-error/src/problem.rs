//! RFC 7807 `application/problem+json` body types.

use serde::Serialize;

/// One entry of the `invalid-params` list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InvalidParam {
    /// Fully qualified exception type, e.g. `urn:apiexception:invalid:invalid`.
    #[serde(rename = "type")]
    pub param_type: String,

    /// The query parameter or field the problem applies to.
    pub name: String,

    /// Human readable explanation.
    pub reason: String,
}

impl InvalidParam {
    /// Create an entry; `sub_code` is appended to the `urn:apiexception:invalid:` prefix.
    #[must_use]
    pub fn new(sub_code: &str, name: &str, reason: &str) -> Self {
        Self {
            param_type: format!("urn:apiexception:invalid:{sub_code}"),
            name:       name.to_string(),
            reason:     reason.to_string(),
        }
    }
}

/// The problem+json response body.
///
/// Field names follow the DSO profile: `type` is a URN, the remote-proxy
/// extension fields are prefixed with `x-`.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemJson {
    /// `urn:apiexception:<code>`.
    #[serde(rename = "type")]
    pub problem_type: String,

    /// Short error code, repeated outside the URN for convenience.
    pub code: String,

    /// Generic title for this error class.
    pub title: String,

    /// HTTP status code.
    pub status: u16,

    /// Specific explanation for this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// The request URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// Per-field validation problems.
    #[serde(rename = "invalid-params", skip_serializing_if = "Option::is_none")]
    pub invalid_params: Option<Vec<InvalidParam>>,

    /// Schema validation failures from a remote response.
    #[serde(rename = "x-validation-errors", skip_serializing_if = "Option::is_none")]
    pub x_validation_errors: Option<serde_json::Value>,

    /// Raw remote payload, included for debugging a broken remote.
    #[serde(rename = "x-raw-response", skip_serializing_if = "Option::is_none")]
    pub x_raw_response: Option<String>,

    /// Remaining fields of a forwarded remote problem+json body.
    #[serde(flatten)]
    pub remote_detail: Option<serde_json::Value>,
}

impl ProblemJson {
    /// Start a problem body from code/title/status.
    #[must_use]
    pub fn new(code: &str, title: &str, status: u16) -> Self {
        Self {
            problem_type: format!("urn:apiexception:{code}"),
            code: code.to_string(),
            title: title.to_string(),
            status,
            detail: None,
            instance: None,
            invalid_params: None,
            x_validation_errors: None,
            x_raw_response: None,
            remote_detail: None,
        }
    }

    /// Attach the request URI.
    #[must_use]
    pub fn with_instance(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }

    /// Merge the body of a forwarded remote problem+json response.
    ///
    /// The normalized type/code/title/status of this body win over whatever
    /// the remote supplied for those keys.
    #[must_use]
    pub fn with_remote_detail(mut self, detail: serde_json::Value) -> Self {
        match detail {
            serde_json::Value::Object(mut map) => {
                for reserved in ["type", "code", "title", "status"] {
                    map.remove(reserved);
                }
                self.remote_detail = Some(serde_json::Value::Object(map));
            }
            other => self.detail = Some(other.to_string()),
        }
        self
    }
}
