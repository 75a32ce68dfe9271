//! Unified error types for the DSO-API gateway crates.
//!
//! All request handling converges on [`ApiError`]; a single top-level mapper
//! converts it into an RFC 7807 `application/problem+json` body. Client errors
//! carry the field details that surface in the `invalid-params` list.

// Error variants and fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

mod problem;

pub use problem::{InvalidParam, ProblemJson};

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Main error type for the gateway.
///
/// Every failure mode in the request pipeline is converted to this type.
/// The HTTP layer renders it as `application/problem+json`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // ========================================================================
    // Client errors (400)
    // ========================================================================
    #[error("Invalid filter: {message}")]
    InvalidFilterSyntax { message: String },

    #[error("Field '{field}' does not exist")]
    FieldNotFound { field: String },

    #[error("Lookup not supported on field '{field}': {message}")]
    UnsupportedLookup { field: String, message: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid sort: {message}")]
    InvalidSort { message: String },

    #[error("Invalid _fields parameter: {message}")]
    InvalidFields { message: String },

    #[error("Invalid expand: {message}")]
    InvalidExpand { message: String },

    // ========================================================================
    // Access errors
    // ========================================================================
    #[error("Access denied: {message}")]
    AccessDenied { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    // ========================================================================
    // Content negotiation
    // ========================================================================
    /// A required header (Accept-Crs) is missing.
    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// The requested CRS or output format cannot be served.
    #[error("Not acceptable: {message}")]
    NotAcceptable { message: String },

    // ========================================================================
    // Upstream (remote proxy) errors
    // ========================================================================
    /// A problem+json body from the remote, re-emitted under a local status.
    ///
    /// Used when the remote's 400/404 response is meaningful to the caller.
    /// The `code` is normalized so remote errors read like local ones.
    #[error("Remote API error ({status}): {title}")]
    Remote {
        status: u16,
        title:  String,
        code:   String,
        detail: serde_json::Value,
    },

    /// The remote returned data that does not match the table schema,
    /// or an unexpected status code.
    #[error("Bad gateway: {message}")]
    BadGateway {
        message:           String,
        validation_errors: Option<serde_json::Value>,
        raw_response:      Option<String>,
    },

    #[error("Gateway timeout")]
    GatewayTimeout,

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // ========================================================================
    // Server errors
    // ========================================================================
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Schema error: {message}")]
    Schema { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    /// The `urn:apiexception:<code>` identifier for this error.
    ///
    /// Validation-style errors share the `invalid` code and differ in their
    /// `invalid-params` entries, matching how the upstream profile reports
    /// field problems.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidFilterSyntax { .. }
            | Self::FieldNotFound { .. }
            | Self::UnsupportedLookup { .. }
            | Self::InvalidValue { .. }
            | Self::InvalidSort { .. }
            | Self::InvalidFields { .. }
            | Self::InvalidExpand { .. } => "invalid",
            Self::AccessDenied { .. } => "permission_denied",
            Self::NotFound { .. } => "not_found",
            Self::PreconditionFailed { .. } => "precondition_failed",
            Self::NotAcceptable { .. } => "not_acceptable",
            Self::Remote { code, .. } => code,
            Self::BadGateway { .. } => "bad_gateway",
            Self::GatewayTimeout => "gateway_timeout",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Database { .. } | Self::Internal { .. } => "internal_error",
            Self::Schema { .. } => "schema_error",
        }
    }

    /// The HTTP status code for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidFilterSyntax { .. }
            | Self::FieldNotFound { .. }
            | Self::UnsupportedLookup { .. }
            | Self::InvalidValue { .. }
            | Self::InvalidSort { .. }
            | Self::InvalidFields { .. }
            | Self::InvalidExpand { .. } => 400,
            Self::AccessDenied { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::PreconditionFailed { .. } => 412,
            Self::NotAcceptable { .. } => 406,
            Self::Remote { status, .. } => *status,
            Self::BadGateway { .. } => 502,
            Self::GatewayTimeout => 504,
            Self::ServiceUnavailable { .. } => 503,
            Self::Database { .. } | Self::Schema { .. } | Self::Internal { .. } => 500,
        }
    }

    /// The human-readable title, independent of the specific failure.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::InvalidFilterSyntax { .. }
            | Self::FieldNotFound { .. }
            | Self::UnsupportedLookup { .. }
            | Self::InvalidValue { .. }
            | Self::InvalidSort { .. }
            | Self::InvalidFields { .. }
            | Self::InvalidExpand { .. } => "Invalid input.",
            Self::AccessDenied { .. } => "You do not have permission to perform this action.",
            Self::NotFound { .. } => "Not found.",
            Self::PreconditionFailed { .. } => "Precondition failed.",
            Self::NotAcceptable { .. } => "Not acceptable.",
            Self::Remote { title, .. } => title,
            Self::BadGateway { .. } => "Connection failed (bad gateway)",
            Self::GatewayTimeout => "Connection failed (server timeout)",
            Self::ServiceUnavailable { .. } => "Service temporarily unavailable",
            Self::Database { .. } | Self::Internal { .. } => "Server Error (500)",
            Self::Schema { .. } => "Schema unavailable",
        }
    }

    /// Build the `invalid-params` list for validation errors.
    ///
    /// Returns `None` for error kinds that carry no per-field details.
    #[must_use]
    pub fn invalid_params(&self) -> Option<Vec<InvalidParam>> {
        let param = match self {
            Self::InvalidFilterSyntax { message } => {
                InvalidParam::new("invalid", "querystring", message)
            }
            Self::FieldNotFound { field } => InvalidParam::new(
                "field_not_found",
                field,
                &format!("Field '{field}' does not exist"),
            ),
            Self::UnsupportedLookup { field, message } => {
                InvalidParam::new("unsupported_lookup", field, message)
            }
            Self::InvalidValue { field, reason } => InvalidParam::new("invalid", field, reason),
            Self::InvalidSort { message } => InvalidParam::new("invalid", "_sort", message),
            Self::InvalidFields { message } => InvalidParam::new("invalid", "_fields", message),
            Self::InvalidExpand { message } => {
                InvalidParam::new("invalid", "_expandScope", message)
            }
            _ => return None,
        };
        Some(vec![param])
    }

    /// Render this error as a problem+json body.
    ///
    /// `instance` should be the request URI when available.
    #[must_use]
    pub fn to_problem(&self, instance: Option<&str>) -> ProblemJson {
        let mut problem = ProblemJson::new(self.code(), self.title(), self.status())
            .with_instance(instance.map(ToString::to_string));

        match self {
            Self::Remote { detail, .. } => {
                // Forwarded problem+json: merge the remote fields, keeping
                // the normalized type/code/title/status on top.
                problem = problem.with_remote_detail(detail.clone());
            }
            Self::BadGateway {
                message,
                validation_errors,
                raw_response,
            } => {
                problem.detail = Some(message.clone());
                problem.x_validation_errors = validation_errors.clone();
                problem.x_raw_response = raw_response.clone();
            }
            other => {
                problem.detail = Some(other.to_string());
                problem.invalid_params = other.invalid_params();
            }
        }

        problem
    }

    // ------------------------------------------------------------------
    // Convenience constructors
    // ------------------------------------------------------------------

    pub fn field_not_found(field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            field: field.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field:  field.into(),
            reason: reason.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::field_not_found("x").status(), 400);
        assert_eq!(ApiError::access_denied("nope").status(), 403);
        assert_eq!(ApiError::not_found("gone").status(), 404);
        assert_eq!(ApiError::GatewayTimeout.status(), 504);
        assert_eq!(
            ApiError::ServiceUnavailable {
                message: "down".into()
            }
            .status(),
            503
        );
    }

    #[test]
    fn test_validation_error_problem_body() {
        let err = ApiError::invalid_value(
            "dateAdded",
            "Enter a valid ISO date-time, or single date.",
        );
        let problem = err.to_problem(Some("http://testserver/v1/movies/movie/"));
        assert_eq!(problem.problem_type, "urn:apiexception:invalid");
        assert_eq!(problem.status, 400);

        let params = problem.invalid_params.expect("invalid-params present");
        assert_eq!(params[0].name, "dateAdded");
        assert_eq!(
            params[0].reason,
            "Enter a valid ISO date-time, or single date."
        );
        assert_eq!(params[0].param_type, "urn:apiexception:invalid:invalid");
    }

    #[test]
    fn test_problem_json_field_names() {
        let err = ApiError::field_not_found("foo");
        let body = serde_json::to_value(err.to_problem(None)).expect("serializes");
        assert!(body.get("type").is_some());
        assert!(body.get("invalid-params").is_some());
        assert!(body.get("x-validation-errors").is_none());
    }

    #[test]
    fn test_remote_code_is_forwarded() {
        let err = ApiError::Remote {
            status: 400,
            title:  "Malformed request.".into(),
            code:   "parse_error".into(),
            detail: serde_json::json!({"title": "upstream says no"}),
        };
        assert_eq!(err.code(), "parse_error");
        let problem = err.to_problem(None);
        assert_eq!(problem.problem_type, "urn:apiexception:parse_error");
    }
}
