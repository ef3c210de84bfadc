//! Error taxonomy shared by the HTTP and SSE links.
//!
//! Every failure surfaced to a caller is an [`RpcError`]: a code from the
//! [`ErrorCode`] table, the HTTP status it maps to, a human readable message,
//! and optional structured data echoed from the server.

use std::{fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// The main result type used throughout the client.
pub type RpcResult<T> = Result<T, RpcError>;

/// Well-known error codes plus an escape hatch for business codes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotSupported,
    NotAcceptable,
    Timeout,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    UnsupportedMediaType,
    UnprocessableContent,
    TooManyRequests,
    ClientClosedRequest,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    /// A code outside the standard table, e.g. a business failure code.
    Other(String),
}

static STANDARD_CODES: [ErrorCode; 19] = [
    ErrorCode::BadRequest,
    ErrorCode::Unauthorized,
    ErrorCode::Forbidden,
    ErrorCode::NotFound,
    ErrorCode::MethodNotSupported,
    ErrorCode::NotAcceptable,
    ErrorCode::Timeout,
    ErrorCode::Conflict,
    ErrorCode::PreconditionFailed,
    ErrorCode::PayloadTooLarge,
    ErrorCode::UnsupportedMediaType,
    ErrorCode::UnprocessableContent,
    ErrorCode::TooManyRequests,
    ErrorCode::ClientClosedRequest,
    ErrorCode::InternalServerError,
    ErrorCode::NotImplemented,
    ErrorCode::BadGateway,
    ErrorCode::ServiceUnavailable,
    ErrorCode::GatewayTimeout,
];

impl ErrorCode {
    /// Wire name of the code, e.g. `"NOT_FOUND"`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            Self::NotAcceptable => "NOT_ACCEPTABLE",
            Self::Timeout => "TIMEOUT",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            Self::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::BadGateway => "BAD_GATEWAY",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::Other(code) => code,
        }
    }

    /// Parse a standard code by its wire name.
    ///
    /// Returns `None` for anything outside the standard table.
    pub fn parse_standard(code: &str) -> Option<Self> {
        STANDARD_CODES
            .iter()
            .find(|candidate| candidate.as_str() == code)
            .cloned()
    }

    /// Parse any code, keeping unknown names as [`ErrorCode::Other`].
    pub fn parse(code: &str) -> Self {
        Self::parse_standard(code).unwrap_or_else(|| Self::Other(code.to_string()))
    }

    /// HTTP status associated with a standard code.
    pub fn status(&self) -> Option<u16> {
        let status = match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotSupported => 405,
            Self::NotAcceptable => 406,
            Self::Timeout => 408,
            Self::Conflict => 409,
            Self::PreconditionFailed => 412,
            Self::PayloadTooLarge => 413,
            Self::UnsupportedMediaType => 415,
            Self::UnprocessableContent => 422,
            Self::TooManyRequests => 429,
            Self::ClientClosedRequest => 499,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
            Self::GatewayTimeout => 504,
            Self::Other(_) => return None,
        };
        Some(status)
    }

    /// Default message used when the server does not provide one.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotSupported => "Method Not Supported",
            Self::NotAcceptable => "Not Acceptable",
            Self::Timeout => "Request Timeout",
            Self::Conflict => "Conflict",
            Self::PreconditionFailed => "Precondition Failed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::UnprocessableContent => "Unprocessable Content",
            Self::TooManyRequests => "Too Many Requests",
            Self::ClientClosedRequest => "Client Closed Request",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
            Self::Other(_) => "Request Failed",
        }
    }

    /// Map an HTTP status to a code.
    ///
    /// Exact matches win; otherwise anything `>= 500` is an internal server
    /// error and anything else a bad request.
    pub fn from_status(status: u16) -> Self {
        STANDARD_CODES
            .iter()
            .find(|code| code.status() == Some(status))
            .cloned()
            .unwrap_or(if status >= 500 {
                Self::InternalServerError
            } else {
                Self::BadRequest
            })
    }

    /// Returns `true` for codes in the standard table.
    pub fn is_standard(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every RPC operation.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: ErrorCode,
    status: u16,
    message: String,
    data: Option<Value>,
    cause: Option<String>,
    notified: bool,
}

impl RpcError {
    /// Create an error with an explicit code and message.
    ///
    /// The status is derived from the code; business codes use 500.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let status = code.status().unwrap_or(500);
        Self {
            code,
            status,
            message: message.into(),
            data: None,
            cause: None,
            notified: false,
        }
    }

    /// Create an error carrying the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        let message = code.default_message();
        Self::new(code, message)
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Create an internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    /// Create a service unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// Error raised when the caller aborts a call or a stream.
    pub fn client_closed() -> Self {
        Self::new(ErrorCode::ClientClosedRequest, "Request was aborted")
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Request timed out after {}ms", duration.as_millis()),
        )
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::bad_request(format!("Invalid configuration: {}", message.into()))
    }

    /// Wrap a transport-level failure such as a refused connection.
    pub fn transport(cause: impl fmt::Display) -> Self {
        Self::from_code(ErrorCode::ServiceUnavailable).with_cause(cause)
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the description of an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Override the HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Returns `true` once the interceptor chain has observed this error.
    pub fn is_notified(&self) -> bool {
        self.notified
    }

    pub(crate) fn mark_notified(&mut self) {
        self.notified = true;
    }

    /// Returns `true` if the caller aborted the call.
    pub fn is_client_closed(&self) -> bool {
        self.code == ErrorCode::ClientClosedRequest
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    /// Two errors describe the same failure when code and message match.
    pub fn same_failure(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }

    /// Classify a buffered HTTP response.
    ///
    /// Returns `None` for 2xx statuses. Error envelopes (`{"json": {code,
    /// message, data, cause}}` or the unwrapped object) keep the server code
    /// when it is a standard one; anything else is mapped from the status.
    pub fn from_response(status: u16, body: &Value) -> Option<Self> {
        if (200..300).contains(&status) {
            return None;
        }

        let payload = body
            .as_object()
            .and_then(|object| object.get("json"))
            .unwrap_or(body);
        let envelope = payload.as_object();

        let code = envelope
            .and_then(|object| object.get("code"))
            .and_then(Value::as_str)
            .and_then(ErrorCode::parse_standard)
            .unwrap_or_else(|| ErrorCode::from_status(status));

        let message = envelope
            .and_then(|object| object.get("message"))
            .or(Some(payload))
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}: {}", code.default_message()));

        let mut error = Self::new(code, message).with_status(status);
        if let Some(object) = envelope {
            error.data = object.get("data").filter(|data| !data.is_null()).cloned();
            error.cause = object.get("cause").and_then(|cause| match cause {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            });
        }
        Some(error)
    }

    /// Classify an error payload delivered inside an SSE message.
    ///
    /// A payload is an error when it carries a string `code`. Unknown codes
    /// collapse into an internal server error.
    pub fn from_stream_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        let code = object.get("code")?.as_str()?;
        let code = ErrorCode::parse_standard(code).unwrap_or(ErrorCode::InternalServerError);

        let message = object
            .get("message")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| code.default_message().to_string());

        let mut error = Self::new(code, message);
        error.data = object.get("data").filter(|data| !data.is_null()).cloned();
        Some(error)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal("Failed to encode or decode JSON").with_cause(e)
    }
}
